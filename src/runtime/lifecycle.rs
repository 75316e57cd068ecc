// 初始化与关闭：安装信号注册表、未处理异常翻译器与硬件故障守卫
use crate::config::SehConfig;
use crate::errno::Errno;
use crate::fault_guard;
use crate::log;
use crate::signal::{SignalRegistry, translator};
use crate::version;
use std::sync::Arc;

use super::state::{GLOBAL, MutexPoisonRecover};
use super::thread_state;

pub(super) fn init(config: SehConfig) -> Errno {
    let mut state = GLOBAL.lock_or_poison();
    if state.status == Errno::Ok {
        return Errno::Repeat;
    }

    log::set_debug_enabled(config.debug);
    state.config = config;
    if !thread_state::init_thread_state_key() {
        log::warn(format_args!("线程状态 key 初始化失败，帧链操作将退化为空链"));
    }

    let registry = Arc::new(SignalRegistry::new());
    registry.init();

    if config.fault_guard {
        if let Err(errno) = fault_guard::add_handler() {
            log::error(format_args!("故障信号处理器安装失败: errno={:?}", errno));
            registry.shutdown();
            state.status = Errno::InitErrSig;
            return state.status;
        }
        state.fault_guard_installed = true;
    }

    state.displaced_filter = translator::install(Arc::clone(&registry));
    state.registry = Some(registry);
    state.status = Errno::Ok;
    log::info(format_args!(
        "{} 初始化完成: fault_guard={}",
        version::version_str_full(),
        config.fault_guard
    ));
    Errno::Ok
}

pub(super) fn shutdown() {
    let mut state = GLOBAL.lock_or_poison();
    if state.status != Errno::Ok {
        return;
    }

    translator::uninstall(state.displaced_filter.take());
    if state.fault_guard_installed {
        fault_guard::remove_handler();
        state.fault_guard_installed = false;
    }
    if let Some(registry) = state.registry.take() {
        registry.shutdown();
    }
    state.status = Errno::Uninit;
    log::info(format_args!("运行时已关闭"));
}

pub(super) fn is_initialized() -> bool {
    GLOBAL.lock_or_poison().status == Errno::Ok
}

pub(super) fn process_registry() -> Option<Arc<SignalRegistry>> {
    GLOBAL.lock_or_poison().registry.clone()
}

pub(super) fn config() -> SehConfig {
    GLOBAL.lock_or_poison().config
}
