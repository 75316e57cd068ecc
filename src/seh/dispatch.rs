// 异常分发：沿帧链调用 handler，trylevel 帧的过滤器在这里求值
use super::chain::{self, Registration};
use super::frame::ExceptionFrame;
use super::phase::{DispatchPhase, PhaseScope};
use super::transfer::{self, Transfer};
use super::unwind::{GuardRegistration, UnwindCause, global_unwind, local_unwind};
use super::{
    Disposition, EH_NESTED_CALL, EH_NONCONTINUABLE, ExceptionHandler, ExceptionPointers,
    ExceptionRecord, FilterResult, STATUS_INVALID_DISPOSITION, STATUS_NONCONTINUABLE_EXCEPTION,
    exception_name,
};
use crate::log;
use crate::machine::Context;
use crate::runtime::state::{self, ExitHook, UnhandledFilter};
use std::ptr;

// 分发期间调用 handler 时的守卫：handler 内引发的新异常扫到这里时报告嵌套，
// dispatcher 指向正在处理旧异常的帧
unsafe fn raise_guard_handler(
    record: &ExceptionRecord,
    frame: *const Registration,
    _context: &Context,
    dispatcher: &mut *const Registration,
) -> Disposition {
    if record.is_unwinding() {
        return Disposition::ContinueSearch;
    }
    *dispatcher = unsafe { GuardRegistration::guarded_frame(frame) };
    Disposition::NestedException
}

// 在守卫保护下调用 frame 的 handler，守卫在返回或转移时摘除
pub(crate) unsafe fn call_handler(
    record: &ExceptionRecord,
    frame: *const Registration,
    context: &Context,
    dispatcher: &mut *const Registration,
    guard_handler: ExceptionHandler,
) -> Disposition {
    let guard = GuardRegistration::new(guard_handler, frame);
    let _pushed = chain::install_guard(guard.registration());
    unsafe { (*frame).call(record, context, dispatcher) }
}

/// 沿帧链寻找处理者；返回 true 表示某个 handler 要求继续执行
pub(crate) fn dispatch_exception(record: &mut ExceptionRecord, context: &Context) -> bool {
    let mut nested_frame: *const Registration = ptr::null();
    let mut frame = chain::head();

    while !frame.is_null() {
        let mut dispatcher: *const Registration = ptr::null();
        let disposition = unsafe {
            call_handler(record, frame, context, &mut dispatcher, raise_guard_handler)
        };

        if frame == nested_frame {
            // 离开嵌套区域
            nested_frame = ptr::null();
            record.flags &= !EH_NESTED_CALL;
        }

        match disposition {
            Disposition::ContinueExecution => {
                if record.is_continuable() {
                    return true;
                }
                log::warn(format_args!(
                    "不可继续的异常被要求继续执行: code={:#x}",
                    record.code
                ));
                let mut noncontinuable = ExceptionRecord::new(
                    STATUS_NONCONTINUABLE_EXCEPTION,
                    EH_NONCONTINUABLE,
                    record.address,
                    &[],
                );
                noncontinuable.nested = Some(Box::new(record.clone()));
                raise_record(&mut noncontinuable, context);
            }
            Disposition::ContinueSearch => {}
            Disposition::NestedException => {
                // 越过 dispatcher 所指的帧之前，handler 都会看到 EH_NESTED_CALL
                record.flags |= EH_NESTED_CALL;
                if dispatcher > nested_frame || nested_frame.is_null() {
                    nested_frame = dispatcher;
                }
                log::debug(format_args!(
                    "嵌套异常: frame={:#x} nested_until={:#x}",
                    frame as usize, dispatcher as usize
                ));
            }
            Disposition::CollidedUnwind => {
                log::warn(format_args!(
                    "分发期间 handler 返回非法结果: frame={:#x} disposition={:?}",
                    frame as usize, disposition
                ));
                let mut invalid = ExceptionRecord::new(
                    STATUS_INVALID_DISPOSITION,
                    EH_NONCONTINUABLE,
                    record.address,
                    &[],
                );
                invalid.nested = Some(Box::new(record.clone()));
                raise_record(&mut invalid, context);
            }
        }
        frame = unsafe { (*frame).prev() };
    }
    false
}

// 引发记录并处理未处理的情形；只有在某个 handler 继续执行时才返回
pub(crate) fn raise_record(record: &mut ExceptionRecord, context: &Context) {
    log::debug(format_args!(
        "引发异常: code={:#x}({}) flags={:#x} address={:#x}",
        record.code,
        exception_name(record.code),
        record.flags,
        record.address
    ));
    let continued = {
        let _phase = PhaseScope::enter(DispatchPhase::Hunting);
        dispatch_exception(record, context)
    };
    if continued {
        return;
    }
    unhandled(record, context);
}

fn unhandled(record: &ExceptionRecord, context: &Context) {
    let result = match state::unhandled_filter() {
        Some(filter) => {
            let pointers = ExceptionPointers { record, context };
            let _phase = PhaseScope::enter(DispatchPhase::Filtering);
            filter(&pointers)
        }
        None => FilterResult::ContinueSearch,
    };
    if result == FilterResult::ContinueExecution && record.is_continuable() {
        log::debug(format_args!("顶层过滤器继续执行: code={:#x}", record.code));
        return;
    }
    log::error(format_args!(
        "未处理的异常: code={:#x}({}) address={:#x} 进程退出",
        record.code,
        exception_name(record.code),
        record.address
    ));
    (state::exit_hook())(record.code as i32)
}

/// 引发软件异常；只有在某个 handler 继续执行时才返回
pub fn raise_exception(code: u32, flags: u32, params: &[usize]) {
    let context = Context::capture();
    let mut record = ExceptionRecord::new(code, flags & EH_NONCONTINUABLE, context.pc, params);
    raise_record(&mut record, &context);
}

/// 设置顶层未处理异常过滤器，返回之前的过滤器
pub fn set_unhandled_exception_filter(
    filter: Option<UnhandledFilter>,
) -> Option<UnhandledFilter> {
    state::replace_unhandled_filter(filter)
}

/// 替换未处理异常终止进程时调用的退出钩子，返回之前的钩子
pub fn set_process_exit_hook(hook: ExitHook) -> ExitHook {
    state::replace_exit_hook(hook)
}

// v3 帧 handler（_except_handler3）
pub(crate) unsafe fn except_handler3(
    record: &ExceptionRecord,
    reg: *const Registration,
    context: &Context,
    _dispatcher: &mut *const Registration,
) -> Disposition {
    scope_frame_handler(record, reg, context)
}

// v4 帧 handler（_except_handler4）；表指针在 ExceptionFrame::scope_view 中解码
pub(crate) unsafe fn except_handler4(
    record: &ExceptionRecord,
    reg: *const Registration,
    context: &Context,
    _dispatcher: &mut *const Registration,
) -> Disposition {
    scope_frame_handler(record, reg, context)
}

fn scope_frame_handler(
    record: &ExceptionRecord,
    reg: *const Registration,
    context: &Context,
) -> Disposition {
    let frame = unsafe { ExceptionFrame::from_registration(reg) };
    let view = frame.scope_view();

    if record.is_unwinding() {
        local_unwind(frame, view.end(), UnwindCause::Abnormal);
        return Disposition::ContinueSearch;
    }

    let pointers = ExceptionPointers { record, context };
    let mut level = frame.trylevel();
    while level != view.end() {
        let entry = view.entry_or_die(level);
        if let Some(filter) = entry.filter {
            let result = {
                let _phase = PhaseScope::enter(DispatchPhase::Filtering);
                filter(&pointers, frame.frame_data())
            };
            log::debug(format_args!(
                "过滤器结果: frame={:#x} level={} result={:?}",
                reg as usize, level, result
            ));
            match result {
                FilterResult::ContinueExecution => return Disposition::ContinueExecution,
                FilterResult::ContinueSearch => {}
                FilterResult::ExecuteHandler => {
                    global_unwind(reg, None, context);
                    local_unwind(frame, level, UnwindCause::Abnormal);
                    frame.set_trylevel(entry.previous);
                    transfer::raise(Transfer::Except {
                        frame: reg as usize,
                        handler: entry.handler,
                        level,
                        code: record.code,
                    });
                }
            }
        }
        level = entry.previous;
    }
    Disposition::ContinueSearch
}
