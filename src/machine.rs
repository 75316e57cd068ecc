// 机器上下文快照：异常分发与 jump buffer 使用的栈指针、帧指针和指令地址

// 读取当前硬件栈指针，用于判断 jump buffer 对应的帧是否仍在栈上
#[inline(always)]
pub(crate) fn current_stack_pointer() -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        let sp: usize;
        unsafe {
            core::arch::asm!("mov {0}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        return sp;
    }

    #[cfg(target_arch = "x86_64")]
    {
        let sp: usize;
        unsafe {
            core::arch::asm!("mov {0}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        return sp;
    }

    #[allow(unreachable_code)]
    {
        let local = 0usize;
        (&local as *const usize) as usize
    }
}

#[inline(always)]
fn current_frame_pointer() -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        let fp: usize;
        unsafe {
            core::arch::asm!("mov {0}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        return fp;
    }

    #[cfg(target_arch = "x86_64")]
    {
        let fp: usize;
        unsafe {
            core::arch::asm!("mov {0}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        return fp;
    }

    #[allow(unreachable_code)]
    0
}

#[inline(always)]
fn current_instruction_pointer() -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        let pc: usize;
        unsafe {
            core::arch::asm!("adr {0}, .", out(reg) pc, options(nomem, nostack, preserves_flags));
        }
        return pc;
    }

    #[cfg(target_arch = "x86_64")]
    {
        let pc: usize;
        unsafe {
            core::arch::asm!("lea {0}, [rip]", out(reg) pc, options(nomem, nostack, preserves_flags));
        }
        return pc;
    }

    #[allow(unreachable_code)]
    0
}

// 异常发生点的寄存器快照，对应 CONTEXT 中分发器关心的部分
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Context {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
}

impl Context {
    #[inline(always)]
    pub fn capture() -> Self {
        Self {
            pc: current_instruction_pointer(),
            sp: current_stack_pointer(),
            fp: current_frame_pointer(),
        }
    }
}
