// unwind 引擎：全局 unwind 逐帧弹出帧链，局部 unwind 在单帧内沿 trylevel 链回退
use super::chain::{self, ExceptionHandler, Registration, RegistrationKind};
use super::dispatch::{call_handler, raise_record};
use super::frame::ExceptionFrame;
use super::phase::{AbnormalScope, DispatchPhase, PhaseScope};
use super::{Disposition, EH_NONCONTINUABLE, ExceptionRecord, STATUS_INVALID_DISPOSITION, fatal};
use crate::errno::Errno;
use crate::log;
use crate::machine::Context;
use std::ptr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum UnwindCause {
    // 顺序执行离开 try 块
    Normal,
    // 异常、longjmp 或 return 跳出 try 块
    Abnormal,
}

// 分发与 unwind 期间压入帧链的临时守卫，记住它所保护的帧
#[repr(C)]
pub(crate) struct GuardRegistration {
    reg: Registration,
    prev_frame: *const Registration,
}

impl GuardRegistration {
    pub(crate) fn new(handler: ExceptionHandler, prev_frame: *const Registration) -> Self {
        Self {
            reg: Registration::new(RegistrationKind::Guard, handler),
            prev_frame,
        }
    }

    pub(crate) fn registration(&self) -> &Registration {
        &self.reg
    }

    // reg 必须指向某个 GuardRegistration 的首字段
    pub(crate) unsafe fn guarded_frame(reg: *const Registration) -> *const Registration {
        unsafe { (*(reg as *const GuardRegistration)).prev_frame }
    }
}

// 局部 unwind 期间的守卫：若 cleanup 内引发的 unwind 扫到这里，报告碰撞并从守卫自身继续，
// 随后被保护帧的 handler 按已回退的 trylevel 执行剩余层级，已执行过的 cleanup 不会重复执行
unsafe fn nested_unwind_handler(
    record: &ExceptionRecord,
    frame: *const Registration,
    _context: &Context,
    dispatcher: &mut *const Registration,
) -> Disposition {
    if !record.is_unwinding() {
        return Disposition::ContinueSearch;
    }
    *dispatcher = frame;
    log::debug(format_args!(
        "局部 unwind 碰撞: guard={:#x} frame={:#x}",
        frame as usize,
        unsafe { GuardRegistration::guarded_frame(frame) } as usize
    ));
    Disposition::CollidedUnwind
}

// 全局 unwind 调用 handler 时的守卫：handler 内再次全局 unwind 扫到这里时报告碰撞
pub(crate) unsafe fn unwind_guard_handler(
    record: &ExceptionRecord,
    frame: *const Registration,
    _context: &Context,
    dispatcher: &mut *const Registration,
) -> Disposition {
    if !record.is_unwinding() {
        return Disposition::ContinueSearch;
    }
    *dispatcher = unsafe { GuardRegistration::guarded_frame(frame) };
    Disposition::CollidedUnwind
}

/// 在单帧内从当前 trylevel 回退到 `target`
///
/// 每一步先把 trylevel 写成上级层级，再调用该层的 termination handler，
/// 因此 handler 内部再次触发的 unwind 不会重复执行同一个 handler。
/// except 层级只回退不调用。
pub(crate) fn local_unwind(frame: &ExceptionFrame, target: i32, cause: UnwindCause) {
    let view = frame.scope_view();
    let guard = GuardRegistration::new(nested_unwind_handler, frame.registration());
    let _pushed = chain::install_guard(guard.registration());
    let _phase = (cause == UnwindCause::Abnormal)
        .then(|| PhaseScope::enter(DispatchPhase::LocalUnwinding));
    let _abnormal = AbnormalScope::enter(cause == UnwindCause::Abnormal);

    log::debug(format_args!(
        "局部 unwind: frame={:#x} trylevel={} target={} cause={:?}",
        frame.registration() as *const Registration as usize,
        frame.trylevel(),
        target,
        cause
    ));

    loop {
        let level = frame.trylevel();
        if level == view.end() || level == target {
            break;
        }
        let entry = view.entry_or_die(level);
        frame.set_trylevel(entry.previous);
        if entry.is_finally() {
            (entry.handler)(frame.frame_data());
        }
    }
}

/// 以 unwinding 标记调用 `target` 之上的每个帧 handler 并弹出，`target` 为空时清空整条链
///
/// `record` 为空时使用 STATUS_UNWIND。
pub(crate) fn global_unwind(
    target: *const Registration,
    record: Option<&ExceptionRecord>,
    context: &Context,
) {
    if !target.is_null() && !chain::contains(target) {
        fatal(
            Errno::UnwindTarget,
            format_args!("unwind 目标不在帧链上: target={:#x}", target as usize),
        );
    }

    let unwind_record = ExceptionRecord::for_unwind(record, target.is_null(), context.pc);
    let _phase = PhaseScope::enter(DispatchPhase::GlobalUnwinding);
    log::debug(format_args!(
        "全局 unwind: target={:#x} code={:#x} flags={:#x}",
        target as usize, unwind_record.code, unwind_record.flags
    ));

    let mut frame = chain::head();
    while !frame.is_null() && frame != target {
        let mut dispatcher: *const Registration = ptr::null();
        let disposition = unsafe {
            call_handler(
                &unwind_record,
                frame,
                context,
                &mut dispatcher,
                unwind_guard_handler,
            )
        };
        match disposition {
            Disposition::ContinueSearch => {}
            Disposition::CollidedUnwind => {
                if dispatcher.is_null() {
                    fatal(
                        Errno::ChainCorrupt,
                        format_args!("碰撞 unwind 未给出目标帧: frame={:#x}", frame as usize),
                    );
                }
                log::debug(format_args!(
                    "全局 unwind 碰撞: frame={:#x} -> {:#x}",
                    frame as usize, dispatcher as usize
                ));
                frame = dispatcher;
            }
            other => {
                log::warn(format_args!(
                    "unwind 期间 handler 返回非法结果: frame={:#x} disposition={:?}",
                    frame as usize, other
                ));
                let mut invalid = ExceptionRecord::new(
                    STATUS_INVALID_DISPOSITION,
                    EH_NONCONTINUABLE,
                    context.pc,
                    &[],
                );
                invalid.nested = Some(Box::new(unwind_record.clone()));
                raise_record(&mut invalid, context);
            }
        }
        frame = chain::pop_frame(frame);
    }
}

#[cfg(test)]
mod tests;
