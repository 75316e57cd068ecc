// jump buffer 的机器映像：i386 与 x64 两种 _JUMP_BUFFER 布局
use crate::machine::Context;
use std::num::NonZeroI32;

const RESUME_DEFAULT: NonZeroI32 = match NonZeroI32::new(1) {
    Some(value) => value,
    None => panic!("1 is non-zero"),
};

// longjmp 的返回值为 0 时 setjmp 看到 1
pub(crate) fn resume_value(value: i32) -> NonZeroI32 {
    NonZeroI32::new(value).unwrap_or(RESUME_DEFAULT)
}

/// 与异常帧链相关的捕获字段，随寄存器一起写入机器映像
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SehImage {
    pub registration: usize,
    pub trylevel: i32,
    pub cookie: u32,
    pub unwind_func: usize,
    pub unwind_data: [usize; 6],
}

/// longjmp 恢复到的位置
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResumeState {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
    pub value: NonZeroI32,
}

pub trait MachineContext: Default {
    fn save(&mut self, context: &Context, seh: &SehImage);
    fn restore(&self, value: i32) -> ResumeState;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct I386JumpBuffer {
    pub ebp: u32,
    pub ebx: u32,
    pub edi: u32,
    pub esi: u32,
    pub esp: u32,
    pub eip: u32,
    pub registration: u32,
    pub try_level: u32,
    pub cookie: u32,
    pub unwind_func: u32,
    pub unwind_data: [u32; 6],
}

impl MachineContext for I386JumpBuffer {
    fn save(&mut self, context: &Context, seh: &SehImage) {
        self.ebp = context.fp as u32;
        self.esp = context.sp as u32;
        self.eip = context.pc as u32;
        self.registration = seh.registration as u32;
        self.try_level = seh.trylevel as u32;
        self.cookie = seh.cookie;
        self.unwind_func = seh.unwind_func as u32;
        for (slot, value) in self.unwind_data.iter_mut().zip(seh.unwind_data) {
            *slot = value as u32;
        }
    }

    fn restore(&self, value: i32) -> ResumeState {
        ResumeState {
            pc: self.eip as usize,
            sp: self.esp as usize,
            fp: self.ebp as usize,
            value: resume_value(value),
        }
    }
}

#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct X64JumpBuffer {
    pub frame: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub mxcsr: u32,
    pub fpcsr: u16,
    pub spare: u16,
    pub xmm: [[u64; 2]; 10],
}

// 保存非易失寄存器、xmm6-xmm15 与两个浮点控制字，偏移与 _JUMP_BUFFER 一致
#[cfg(target_arch = "x86_64")]
fn capture_nonvolatile(buf: &mut X64JumpBuffer) {
    let base = buf as *mut X64JumpBuffer;
    unsafe {
        core::arch::asm!(
            "mov [{0} + 0x08], rbx",
            "mov [{0} + 0x20], rsi",
            "mov [{0} + 0x28], rdi",
            "mov [{0} + 0x30], r12",
            "mov [{0} + 0x38], r13",
            "mov [{0} + 0x40], r14",
            "mov [{0} + 0x48], r15",
            "stmxcsr [{0} + 0x58]",
            "fnstcw [{0} + 0x5c]",
            "movdqu [{0} + 0x60], xmm6",
            "movdqu [{0} + 0x70], xmm7",
            "movdqu [{0} + 0x80], xmm8",
            "movdqu [{0} + 0x90], xmm9",
            "movdqu [{0} + 0xa0], xmm10",
            "movdqu [{0} + 0xb0], xmm11",
            "movdqu [{0} + 0xc0], xmm12",
            "movdqu [{0} + 0xd0], xmm13",
            "movdqu [{0} + 0xe0], xmm14",
            "movdqu [{0} + 0xf0], xmm15",
            in(reg) base,
            options(nostack, preserves_flags),
        );
    }
}

// 其他架构没有这些寄存器，只写入控制字的默认值
#[cfg(not(target_arch = "x86_64"))]
fn capture_nonvolatile(buf: &mut X64JumpBuffer) {
    buf.mxcsr = 0x1F80;
    buf.fpcsr = 0x27F;
}

impl MachineContext for X64JumpBuffer {
    fn save(&mut self, context: &Context, seh: &SehImage) {
        self.frame = seh.registration as u64;
        self.rsp = context.sp as u64;
        self.rbp = context.fp as u64;
        self.rip = context.pc as u64;
        capture_nonvolatile(self);
    }

    fn restore(&self, value: i32) -> ResumeState {
        ResumeState {
            pc: self.rip as usize,
            sp: self.rsp as usize,
            fp: self.rbp as usize,
            value: resume_value(value),
        }
    }
}

#[cfg(target_pointer_width = "64")]
pub type NativeJumpContext = X64JumpBuffer;

#[cfg(target_pointer_width = "32")]
pub type NativeJumpContext = I386JumpBuffer;
