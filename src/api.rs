use crate::config::SehConfig;
use crate::errno::Errno;
use crate::fault_guard::{self, GuardFailure};
use crate::log;
use crate::machine::Context;
use crate::runtime;
use crate::seh::transfer::{self, Transfer};
use crate::seh::{
    ExceptionPointers, ExceptionRecord, FaultBoundary, FilterResult, Registration, ScopeFrame,
    dispatch_fault, global_unwind,
};
use crate::signal::{ConsoleEvent, Signal, SignalAction, translator};
use crate::version;
use std::ptr;

pub fn get_version() -> String {
    version::version_str_full()
}

// 初始化运行时，重复调用返回 Errno::Repeat
pub fn init(config: SehConfig) -> Errno {
    runtime::init(config)
}

pub fn shutdown() {
    runtime::shutdown()
}

pub fn is_initialized() -> bool {
    runtime::is_initialized()
}

pub fn config() -> SehConfig {
    runtime::config()
}

pub fn set_debug(debug: bool) {
    log::set_debug_enabled(debug);
}

pub fn get_debug() -> bool {
    log::debug_enabled()
}

/// 为信号安装动作并返回旧动作（`signal`）
///
/// 未知信号返回 `Errno::UnknownSignal`；运行时未初始化返回 `Errno::Uninit`。
pub fn signal(sig: i32, action: SignalAction) -> Result<SignalAction, Errno> {
    if Signal::from_raw(sig).is_none() {
        log::warn(format_args!("signal 未知信号: sig={}", sig));
        return Err(Errno::UnknownSignal);
    }
    let registry = runtime::process_registry().ok_or(Errno::Uninit)?;
    registry.install(sig, action)
}

/// 显式引发信号（`raise`）
pub fn raise(sig: i32) -> Result<(), Errno> {
    if Signal::from_raw(sig).is_none() {
        log::warn(format_args!("raise 未知信号: sig={}", sig));
        return Err(Errno::UnknownSignal);
    }
    let registry = runtime::process_registry().ok_or(Errno::Uninit)?;
    registry.raise(sig)
}

// 控制台 Ctrl-C / Ctrl-Break 事件，返回是否已消费
pub fn console_event(event: ConsoleEvent) -> bool {
    match runtime::process_registry() {
        Some(registry) => registry.console_event(event),
        None => false,
    }
}

/// `_XcptFilter`：用进程信号表翻译异常
pub fn xcpt_filter(code: u32, pointers: &ExceptionPointers<'_>) -> FilterResult {
    match runtime::process_registry() {
        Some(registry) => translator::xcpt_filter(&registry, code, pointers),
        None => FilterResult::ContinueSearch,
    }
}

/// 在故障守卫下执行 `f`
///
/// `f` 内的硬件故障被转换为异常记录，在故障点所在的帧仍在链上时沿帧链分发，
/// `f` 内外帧的 filter 与 finally 都按 SEH 顺序参与。被 except 块接受时控制流直接离开本函数；
/// 某个 handler 要求继续执行时，`f` 内的帧以非正常终止方式 unwind 后返回 `Ok(None)`。
pub fn guarded<T, F>(f: F) -> Result<Option<T>, Errno>
where
    F: FnOnce() -> T,
{
    let outcome = {
        let _boundary = FaultBoundary::enter();
        transfer::catch(
            || fault_guard::with_guard(f),
            |t| matches!(t, Transfer::FaultContinued),
        )
    };
    match outcome {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(GuardFailure::Fault(fault))) => {
            dispatch_fault(&fault);
            Ok(None)
        }
        Ok(Err(GuardFailure::Unavailable(errno))) => Err(errno),
        Err(_) => Ok(None),
    }
}

/// `_local_unwind2`：以非正常终止方式回退 v3 帧到 `target`
pub fn local_unwind2(frame: &ScopeFrame<'_>, target: i32) {
    frame.unwind_to(target);
}

/// `_local_unwind4`：v4 帧的 scope table 由帧自身按 cookie 解码
pub fn local_unwind4(frame: &ScopeFrame<'_>, target: i32) {
    frame.unwind_to(target);
}

/// `_global_unwind2`：执行 `target` 之上所有帧的清理并弹出；`None` 清空整条链
pub fn global_unwind2(target: Option<&ScopeFrame<'_>>, record: Option<&ExceptionRecord>) {
    let target = match target {
        Some(frame) => frame.exception_frame().registration() as *const Registration,
        None => ptr::null(),
    };
    global_unwind(target, record, &Context::capture());
}

#[cfg(test)]
mod tests;
