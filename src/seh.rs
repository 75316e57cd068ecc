// 结构化异常处理核心：帧链、scope table、unwind 引擎、分发与过滤
use crate::errno::Errno;
use std::fmt;

pub(crate) mod chain;
mod dispatch;
mod fault;
mod frame;
mod phase;
mod record;
mod scope;
mod table;
pub(crate) mod transfer;
mod unwind;

pub use chain::chain_depth;
pub(crate) use chain::{ExceptionHandler, Registration, RegistrationKind};
pub use dispatch::{raise_exception, set_process_exit_hook, set_unhandled_exception_filter};
pub(crate) use fault::{FaultBoundary, dispatch_fault};
pub use frame::{Guarded, Handled, ScopeFrame, protect, protect_v4};
pub(crate) use frame::ExceptionFrame;
pub use phase::{DispatchPhase, abnormal_termination, dispatch_phase};
pub use record::*;
pub use scope::{
    DEFAULT_SECURITY_COOKIE, NO_GS_COOKIE, SECURITY_COOKIE, ScopeEntry, ScopeFilter, ScopeHandler,
    ScopeLevel, ScopeTable, ScopeTableV4, ScopeView, SecurityCookie, TRYLEVEL_END, TRYLEVEL_TOP,
    decode_scope_v4,
};
pub use table::{
    CScopeEntry, CScopeTable, CodeTable, EXCEPTION_EXECUTE_HANDLER_RVA, ImageCode, TableScope,
    TerminationHandler, protect_table,
};
pub(crate) use transfer::Transfer;
pub(crate) use unwind::{UnwindCause, global_unwind, local_unwind};

// 不可恢复的内部错误：记录日志后终止进程
#[cold]
pub(crate) fn fatal(errno: Errno, args: fmt::Arguments) -> ! {
    crate::log::error(format_args!("致命错误 errno={:?}: {}", errno, args));
    std::process::abort()
}
