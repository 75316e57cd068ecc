// 未处理异常到信号处理器的翻译，以及硬件故障到异常记录的转换
use super::{ExceptionScope, FpeCode, Signal, SignalAction, SignalRegistry};
use crate::fault_guard::FaultInfo;
use crate::log;
use crate::runtime::UnhandledFilter;
use crate::runtime::state;
use crate::seh::{
    ExceptionPointers, ExceptionRecord, FilterResult, STATUS_ACCESS_VIOLATION,
    STATUS_ARRAY_BOUNDS_EXCEEDED, STATUS_DATATYPE_MISALIGNMENT,
    STATUS_FLOAT_DENORMAL_OPERAND, STATUS_FLOAT_DIVIDE_BY_ZERO, STATUS_FLOAT_INEXACT_RESULT,
    STATUS_FLOAT_INVALID_OPERATION, STATUS_FLOAT_OVERFLOW, STATUS_FLOAT_STACK_CHECK,
    STATUS_FLOAT_UNDERFLOW, STATUS_ILLEGAL_INSTRUCTION, STATUS_INTEGER_DIVIDE_BY_ZERO,
    STATUS_INTEGER_OVERFLOW, STATUS_PRIVILEGED_INSTRUCTION, exception_name,
};
use std::sync::Arc;

// Linux siginfo 的 si_code 取值
const BUS_ADRALN: i32 = 1;
const ILL_PRVOPC: i32 = 5;
const ILL_PRVREG: i32 = 6;
const FPE_INTDIV: i32 = 1;
const FPE_INTOVF: i32 = 2;
const FPE_FLTDIV: i32 = 3;
const FPE_FLTOVF: i32 = 4;
const FPE_FLTUND: i32 = 5;
const FPE_FLTRES: i32 = 6;
const FPE_FLTSUB: i32 = 8;

/// 异常码对应的信号；没有对应信号的异常交给其他过滤器
pub fn signal_for_exception(code: u32) -> Option<Signal> {
    match code {
        STATUS_ACCESS_VIOLATION => Some(Signal::Segv),
        STATUS_ILLEGAL_INSTRUCTION | STATUS_PRIVILEGED_INSTRUCTION => Some(Signal::Ill),
        STATUS_FLOAT_DENORMAL_OPERAND
        | STATUS_FLOAT_DIVIDE_BY_ZERO
        | STATUS_FLOAT_INEXACT_RESULT
        | STATUS_FLOAT_INVALID_OPERATION
        | STATUS_FLOAT_OVERFLOW
        | STATUS_FLOAT_STACK_CHECK
        | STATUS_FLOAT_UNDERFLOW => Some(Signal::Fpe),
        _ => None,
    }
}

/// 浮点异常码对应的 SIGFPE 子码，未列出的按无效操作处理
pub fn fpe_code_for_exception(code: u32) -> FpeCode {
    match code {
        STATUS_FLOAT_DENORMAL_OPERAND => FpeCode::Denormal,
        STATUS_FLOAT_DIVIDE_BY_ZERO => FpeCode::ZeroDivide,
        STATUS_FLOAT_INEXACT_RESULT => FpeCode::Inexact,
        STATUS_FLOAT_OVERFLOW => FpeCode::Overflow,
        STATUS_FLOAT_STACK_CHECK => FpeCode::StackOverflow,
        STATUS_FLOAT_UNDERFLOW => FpeCode::Underflow,
        _ => FpeCode::Invalid,
    }
}

/// 把异常交给对应信号的处理器
///
/// 信号处于默认动作时继续搜索；忽略或调用处理器后要求继续执行。
/// 处理器在调用前重置为默认动作。
pub fn exception_filter(registry: &SignalRegistry, pointers: &ExceptionPointers<'_>) -> FilterResult {
    let code = pointers.record.code;
    let Some(signal) = signal_for_exception(code) else {
        return FilterResult::ContinueSearch;
    };
    if !registry.is_active() {
        return FilterResult::ContinueSearch;
    }

    match registry.take_for_delivery(signal) {
        SignalAction::Default => FilterResult::ContinueSearch,
        SignalAction::Ignore => {
            log::debug(format_args!(
                "异常对应的信号被忽略: code={:#x} sig={:?}",
                code, signal
            ));
            FilterResult::ContinueExecution
        }
        SignalAction::Handler(handler) => {
            log::debug(format_args!(
                "异常翻译为信号: code={:#x}({}) sig={:?}",
                code,
                exception_name(code),
                signal
            ));
            let fpe = (signal == Signal::Fpe).then(|| fpe_code_for_exception(code));
            let _scope = ExceptionScope::enter(Some(pointers.record.clone()));
            handler(signal, fpe);
            FilterResult::ContinueExecution
        }
    }
}

/// `_XcptFilter`：只有 `code` 与记录一致时才翻译
pub fn xcpt_filter(
    registry: &SignalRegistry,
    code: u32,
    pointers: &ExceptionPointers<'_>,
) -> FilterResult {
    if pointers.record.code != code {
        return FilterResult::ContinueSearch;
    }
    exception_filter(registry, pointers)
}

// 把翻译器装为顶层过滤器；翻译器不处理时交给原过滤器，返回值供 uninstall 还原
pub(crate) fn install(registry: Arc<SignalRegistry>) -> Option<UnhandledFilter> {
    let previous = state::unhandled_filter();
    let chained = previous.clone();
    let filter = unhandled_filter(move |pointers| match exception_filter(&registry, pointers) {
        FilterResult::ContinueSearch => match &chained {
            Some(next) => next(pointers),
            None => FilterResult::ContinueSearch,
        },
        other => other,
    });
    state::replace_unhandled_filter(Some(filter));
    previous
}

fn unhandled_filter<F>(filter: F) -> UnhandledFilter
where
    F: Fn(&ExceptionPointers<'_>) -> FilterResult + Send + Sync + 'static,
{
    Arc::new(filter)
}

pub(crate) fn uninstall(previous: Option<UnhandledFilter>) {
    state::replace_unhandled_filter(previous);
}

/// 由守卫捕获的硬件故障生成异常记录
pub fn record_from_fault(fault: &FaultInfo) -> ExceptionRecord {
    let code = match fault.signum {
        libc::SIGSEGV => STATUS_ACCESS_VIOLATION,
        libc::SIGBUS if fault.code == BUS_ADRALN => STATUS_DATATYPE_MISALIGNMENT,
        libc::SIGBUS => STATUS_ACCESS_VIOLATION,
        libc::SIGILL if fault.code == ILL_PRVOPC || fault.code == ILL_PRVREG => {
            STATUS_PRIVILEGED_INSTRUCTION
        }
        libc::SIGILL => STATUS_ILLEGAL_INSTRUCTION,
        libc::SIGFPE => match fault.code {
            FPE_INTDIV => STATUS_INTEGER_DIVIDE_BY_ZERO,
            FPE_INTOVF => STATUS_INTEGER_OVERFLOW,
            FPE_FLTDIV => STATUS_FLOAT_DIVIDE_BY_ZERO,
            FPE_FLTOVF => STATUS_FLOAT_OVERFLOW,
            FPE_FLTUND => STATUS_FLOAT_UNDERFLOW,
            FPE_FLTRES => STATUS_FLOAT_INEXACT_RESULT,
            FPE_FLTSUB => STATUS_ARRAY_BOUNDS_EXCEEDED,
            _ => STATUS_FLOAT_INVALID_OPERATION,
        },
        _ => STATUS_ILLEGAL_INSTRUCTION,
    };

    if code == STATUS_ACCESS_VIOLATION {
        return ExceptionRecord::access_violation(fault.pc, fault.write, fault.address);
    }
    ExceptionRecord::new(code, 0, fault.pc, &[])
}
