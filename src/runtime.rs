// runtime 模块入口：进程级状态、线程级 SEH 状态与初始化生命周期
use crate::config::SehConfig;
use crate::errno::Errno;
use crate::signal::SignalRegistry;
use std::sync::Arc;

mod lifecycle;
pub(crate) mod state;
pub(crate) mod thread_state;

pub(crate) use state::{ExitHook, UnhandledFilter};

pub(crate) fn init(config: SehConfig) -> Errno {
    lifecycle::init(config)
}

pub(crate) fn shutdown() {
    lifecycle::shutdown()
}

pub(crate) fn is_initialized() -> bool {
    lifecycle::is_initialized()
}

pub(crate) fn process_registry() -> Option<Arc<SignalRegistry>> {
    lifecycle::process_registry()
}

pub(crate) fn config() -> SehConfig {
    lifecycle::config()
}
