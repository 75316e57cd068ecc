// setjmp/longjmp 与异常帧链协作：longjmp 先按 SEH 顺序执行沿途的 __finally，再回到捕获点
use crate::errno::Errno;
use crate::log;
use crate::machine::{Context, current_stack_pointer};
use crate::runtime::thread_state::{
    JumpTarget, report_jump_target_overflow, report_thread_state_unavailable, with_thread_state,
};
use crate::seh::transfer::{self, Transfer};
use crate::seh::{
    ExceptionFrame, Registration, RegistrationKind, TRYLEVEL_END, TRYLEVEL_TOP, UnwindCause,
    chain, fatal, global_unwind, local_unwind,
};
use std::num::NonZeroI32;
use std::sync::atomic::{AtomicU64, Ordering};

mod context;

pub use context::{
    I386JumpBuffer, MachineContext, NativeJumpContext, ResumeState, SehImage, X64JumpBuffer,
};

/// 扩展 jump buffer 的标记，"VC20"
pub const JMP_MAGIC: u32 = 0x5643_3230;

pub const UNWIND_DATA_WORDS: usize = 6;

/// 扩展形式中由编译器提供的 unwind 函数
pub type UnwindFunc = fn(&JumpBuffer);

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

pub struct JumpBuffer {
    machine: NativeJumpContext,
    registration: *const Registration,
    trylevel: i32,
    cookie: u32,
    unwind_func: Option<UnwindFunc>,
    unwind_data: [usize; UNWIND_DATA_WORDS],
    target: u64,
    // 捕获点是否登记在线程的存活表中
    tracked: bool,
}

impl JumpBuffer {
    fn new(registration: *const Registration, trylevel: i32) -> Self {
        Self {
            machine: NativeJumpContext::default(),
            registration,
            trylevel,
            cookie: 0,
            unwind_func: None,
            unwind_data: [0; UNWIND_DATA_WORDS],
            target: 0,
            tracked: false,
        }
    }

    pub fn machine(&self) -> &NativeJumpContext {
        &self.machine
    }

    pub fn trylevel(&self) -> i32 {
        self.trylevel
    }

    pub fn cookie(&self) -> u32 {
        self.cookie
    }

    pub fn unwind_data(&self) -> &[usize; UNWIND_DATA_WORDS] {
        &self.unwind_data
    }

    /// 捕获时帧链上是否有帧
    pub fn has_registration(&self) -> bool {
        !self.registration.is_null()
    }

    fn seh_image(&self) -> SehImage {
        SehImage {
            registration: self.registration as usize,
            trylevel: self.trylevel,
            cookie: self.cookie,
            unwind_func: self.unwind_func.map_or(0, |f| f as usize),
            unwind_data: self.unwind_data,
        }
    }

    // 捕获点仍在栈上且仍登记为存活
    fn check_live(&self, resume: &ResumeState) -> Result<(), Errno> {
        let current_sp = current_stack_pointer();
        if current_sp > resume.sp {
            return Err(Errno::StaleJumpBuffer);
        }
        if !self.tracked {
            return Ok(());
        }
        let live = with_thread_state(|state| {
            let targets = state.jump_targets();
            targets
                .rposition_by(|t| t.id == self.target)
                .and_then(|idx| targets.get(idx))
        });
        match live {
            Some(Some(target)) if target.stack_sp == resume.sp => Ok(()),
            Some(_) => Err(Errno::StaleJumpBuffer),
            None => {
                report_thread_state_unavailable("longjmp");
                Ok(())
            }
        }
    }
}

/// setjmp 的两种返回
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetJmp<R> {
    Captured(R),
    Resumed(NonZeroI32),
}

impl<R> SetJmp<R> {
    /// longjmp 传回的值，首次捕获时为 None
    pub fn resumed(&self) -> Option<i32> {
        match self {
            Self::Captured(_) => None,
            Self::Resumed(value) => Some(value.get()),
        }
    }

    pub fn captured(self) -> Option<R> {
        match self {
            Self::Captured(value) => Some(value),
            Self::Resumed(_) => None,
        }
    }
}

// 链头若是 trylevel 帧，读取它当前的 trylevel
fn head_trylevel(head: *const Registration) -> i32 {
    if head.is_null() {
        return TRYLEVEL_END;
    }
    match unsafe { (*head).kind() } {
        RegistrationKind::ScopeFrame => unsafe { ExceptionFrame::from_registration(head) }.trylevel(),
        _ => TRYLEVEL_TOP,
    }
}

/// 捕获当前帧链位置并执行 `f`；`f` 内对该 buffer 的 longjmp 使本函数返回 `Resumed`
pub fn setjmp<R, F>(f: F) -> SetJmp<R>
where
    F: FnOnce(&JumpBuffer) -> R,
{
    let head = chain::head();
    capture(JumpBuffer::new(head, head_trylevel(head)), f)
}

/// 扩展形式：记录 `JMP_MAGIC`、显式 unwind 函数和附加数据
///
/// `trylevel` 为 None 时取链头帧当前的 trylevel。帧链为空时不记录任何扩展字段。
pub fn setjmp3<R, F>(
    unwind_func: Option<UnwindFunc>,
    trylevel: Option<i32>,
    unwind_data: &[usize],
    f: F,
) -> SetJmp<R>
where
    F: FnOnce(&JumpBuffer) -> R,
{
    let head = chain::head();
    let mut buf = JumpBuffer::new(head, head_trylevel(head));
    buf.cookie = JMP_MAGIC;
    if !head.is_null() {
        buf.unwind_func = unwind_func;
        if let Some(level) = trylevel {
            buf.trylevel = level;
        }
        if unwind_data.len() > UNWIND_DATA_WORDS {
            log::warn(format_args!(
                "setjmp3 附加数据过多，已截断: len={} max={}",
                unwind_data.len(),
                UNWIND_DATA_WORDS
            ));
        }
        for (slot, word) in buf.unwind_data.iter_mut().zip(unwind_data) {
            *slot = *word;
        }
    }
    capture(buf, f)
}

// 存活捕获点登记；离开捕获点（正常返回或被越过）时撤销
struct LiveTarget {
    id: u64,
    tracked: bool,
}

impl LiveTarget {
    fn push(id: u64, stack_sp: usize) -> Self {
        let pushed =
            with_thread_state(|state| state.jump_targets_mut().push(JumpTarget { id, stack_sp }));
        let tracked = match pushed {
            Some(true) => true,
            Some(false) => {
                report_jump_target_overflow();
                false
            }
            None => {
                report_thread_state_unavailable("setjmp");
                false
            }
        };
        Self { id, tracked }
    }
}

impl Drop for LiveTarget {
    fn drop(&mut self) {
        if !self.tracked {
            return;
        }
        let id = self.id;
        with_thread_state(|state| {
            let targets = state.jump_targets_mut();
            if let Some(idx) = targets.rposition_by(|t| t.id == id) {
                targets.truncate(idx);
            }
        });
    }
}

#[inline(never)]
fn capture<R, F>(mut buf: JumpBuffer, f: F) -> SetJmp<R>
where
    F: FnOnce(&JumpBuffer) -> R,
{
    let context = Context::capture();
    let id = NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed);
    buf.target = id;
    let image = buf.seh_image();
    buf.machine.save(&context, &image);

    let live = LiveTarget::push(id, context.sp);
    buf.tracked = live.tracked;
    let registration = buf.registration;
    log::debug(format_args!(
        "setjmp 捕获: id={} registration={:#x} trylevel={} cookie={:#x}",
        id, registration as usize, buf.trylevel, buf.cookie
    ));

    let outcome = transfer::catch(
        || f(&buf),
        |t| matches!(t, Transfer::LongJump { target, .. } if *target == id),
    );
    drop(live);

    match outcome {
        Ok(value) => SetJmp::Captured(value),
        Err(Transfer::LongJump { value, .. }) => {
            chain::set_head(registration);
            log::debug(format_args!("longjmp 到达捕获点: id={} value={}", id, value));
            SetJmp::Resumed(value)
        }
        Err(other) => transfer::raise(other),
    }
}

/// 回到 `buf` 的捕获点，`value` 为 0 时 setjmp 看到 1
///
/// 先全局 unwind 到捕获时的链头帧，再在该帧内局部 unwind 到捕获时的 trylevel；
/// 带 `JMP_MAGIC` 的扩展 buffer 改为调用其 unwind 函数（未提供时不做局部 unwind）。
pub fn longjmp(buf: &JumpBuffer, value: i32) -> ! {
    let resume = buf.machine.restore(value);
    if let Err(errno) = buf.check_live(&resume) {
        fatal(
            errno,
            format_args!(
                "longjmp 目标已失效: id={} captured_sp={:#x}",
                buf.target, resume.sp
            ),
        );
    }

    let context = Context::capture();
    log::debug(format_args!(
        "longjmp: id={} head={:#x} registration={:#x} trylevel={} value={}",
        buf.target,
        chain::head() as usize,
        buf.registration as usize,
        buf.trylevel,
        resume.value
    ));

    if chain::head() != buf.registration {
        global_unwind(buf.registration, None, &context);
    }

    if !buf.registration.is_null() {
        debug_assert!(buf.unwind_func.is_none() || buf.cookie == JMP_MAGIC);
        if buf.cookie != JMP_MAGIC {
            unwind_registered_frame(buf);
        } else if let Some(unwind) = buf.unwind_func {
            unwind(buf);
        }
    }

    transfer::raise(Transfer::LongJump {
        target: buf.target,
        value: resume.value,
    })
}

fn unwind_registered_frame(buf: &JumpBuffer) {
    let reg = buf.registration;
    if reg.is_null() {
        return;
    }
    if unsafe { (*reg).kind() } != RegistrationKind::ScopeFrame {
        log::debug(format_args!(
            "捕获帧不是 trylevel 帧，跳过局部 unwind: registration={:#x}",
            reg as usize
        ));
        return;
    }
    let frame = unsafe { ExceptionFrame::from_registration(reg) };
    local_unwind(frame, buf.trylevel, UnwindCause::Abnormal);
}

/// v3 帧的标准 unwind 函数（`_seh_longjmp_unwind`）
pub fn seh_longjmp_unwind(buf: &JumpBuffer) {
    unwind_registered_frame(buf);
}

/// v4 帧的标准 unwind 函数（`_seh_longjmp_unwind4`），scope table 由帧自身按 cookie 解码
pub fn seh_longjmp_unwind4(buf: &JumpBuffer) {
    unwind_registered_frame(buf);
}

#[cfg(test)]
mod tests;
