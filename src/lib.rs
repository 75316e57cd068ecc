#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("msvcrt_seh supports Linux and Android only");

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("msvcrt_seh supports only 64-bit architectures: aarch64 and x86_64");

// 公共 API 层：初始化、信号注册、故障守卫与 unwind 导出
mod api;
// 运行时配置与环境变量覆盖
mod config;
// 错误码定义
mod errno;
// 硬件故障守卫：sigsetjmp/siglongjmp
mod fault_guard;
// setjmp/longjmp 与帧链协作
mod jmp;
// 日志输出到 stderr
mod log;
// 寄存器上下文捕获
mod machine;
// 运行时状态：生命周期与线程级 SEH 状态
mod runtime;
// 帧链、scope table、unwind 与分发
mod seh;
// C 运行时信号表与异常翻译
mod signal;
// 版本信息
mod version;

#[cfg(test)]
mod test_support;

pub use api::{
    config, console_event, get_debug, get_version, global_unwind2, guarded, init, is_initialized,
    local_unwind2, local_unwind4, raise, set_debug, shutdown, signal, xcpt_filter,
};
pub use config::SehConfig;
pub use errno::Errno as SehErrno;
pub use fault_guard::{FaultInfo, GuardFailure, with_guard};
pub use jmp::{
    I386JumpBuffer, JMP_MAGIC, JumpBuffer, MachineContext, NativeJumpContext, ResumeState,
    SehImage, SetJmp, UNWIND_DATA_WORDS, UnwindFunc, X64JumpBuffer, longjmp, seh_longjmp_unwind,
    seh_longjmp_unwind4, setjmp, setjmp3,
};
pub use machine::Context;
pub use runtime::state::{ExitHook, UnhandledFilter};
pub use seh::{
    CScopeEntry, CScopeTable, CodeTable, DEFAULT_SECURITY_COOKIE, DispatchPhase, Disposition,
    EH_COLLIDED_UNWIND, EH_EXIT_UNWIND, EH_NESTED_CALL, EH_NONCONTINUABLE, EH_STACK_INVALID,
    EH_TARGET_UNWIND, EH_UNWINDING, EXCEPTION_EXECUTE_HANDLER_RVA, EXCEPTION_MAXIMUM_PARAMETERS,
    ExceptionPointers, ExceptionRecord, FilterResult, Guarded, Handled, ImageCode, NO_GS_COOKIE,
    SECURITY_COOKIE, STATUS_ACCESS_VIOLATION, STATUS_ARRAY_BOUNDS_EXCEEDED, STATUS_BREAKPOINT,
    STATUS_DATATYPE_MISALIGNMENT, STATUS_FLOAT_DENORMAL_OPERAND, STATUS_FLOAT_DIVIDE_BY_ZERO,
    STATUS_FLOAT_INEXACT_RESULT, STATUS_FLOAT_INVALID_OPERATION, STATUS_FLOAT_OVERFLOW,
    STATUS_FLOAT_STACK_CHECK, STATUS_FLOAT_UNDERFLOW, STATUS_ILLEGAL_INSTRUCTION,
    STATUS_INTEGER_DIVIDE_BY_ZERO, STATUS_INTEGER_OVERFLOW, STATUS_INVALID_DISPOSITION,
    STATUS_NONCONTINUABLE_EXCEPTION, STATUS_PRIVILEGED_INSTRUCTION, STATUS_UNWIND, ScopeEntry,
    ScopeFilter, ScopeFrame, ScopeHandler, ScopeLevel, ScopeTable, ScopeTableV4, ScopeView,
    SecurityCookie, TRYLEVEL_END, TRYLEVEL_TOP, TableScope, TerminationHandler,
    abnormal_termination, chain_depth, decode_scope_v4, dispatch_phase, exception_name, protect,
    protect_table, protect_v4, raise_exception, set_process_exit_hook,
    set_unhandled_exception_filter,
};
pub use signal::translator::{
    exception_filter, fpe_code_for_exception, record_from_fault, signal_for_exception,
};
pub use signal::{
    ConsoleEvent, DEFAULT_ACTION_EXIT_CODE, FpeCode, Signal, SignalAction, SignalHandler,
    SignalRegistry, current_exception,
};
pub use version::{version, version_str, version_str_full};
