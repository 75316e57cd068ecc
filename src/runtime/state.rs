// 进程级状态：初始化状态、信号注册表、顶层未处理异常过滤器与进程退出钩子
use crate::config::SehConfig;
use crate::errno::Errno;
use crate::seh::{ExceptionPointers, FilterResult};
use crate::signal::SignalRegistry;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Mutex/RwLock poison 恢复扩展，避免持锁线程 panic 后引发连锁 panic
pub(crate) trait MutexPoisonRecover<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T>;
}

pub(crate) trait RwLockPoisonRecover<T> {
    fn read_or_poison(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_poison(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> MutexPoisonRecover<T> for Mutex<T> {
    fn lock_or_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> RwLockPoisonRecover<T> for RwLock<T> {
    fn read_or_poison(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_or_poison(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// 顶层未处理异常过滤器，帧链上没有任何帧处理异常时调用
pub type UnhandledFilter = Arc<dyn Fn(&ExceptionPointers<'_>) -> FilterResult + Send + Sync>;

/// 进程退出钩子；默认直接 `_exit`，测试可替换为不终止进程的实现
pub type ExitHook = fn(i32) -> !;

pub(crate) fn exit_process(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

pub(super) struct InitState {
    pub(super) status: Errno,
    pub(super) config: SehConfig,
    pub(super) registry: Option<Arc<SignalRegistry>>,
    // init 时被翻译器替换掉的过滤器，shutdown 时还原
    pub(super) displaced_filter: Option<UnhandledFilter>,
    pub(super) fault_guard_installed: bool,
}

pub(super) static GLOBAL: Lazy<Mutex<InitState>> = Lazy::new(|| {
    Mutex::new(InitState {
        status: Errno::Uninit,
        config: SehConfig::default(),
        registry: None,
        displaced_filter: None,
        fault_guard_installed: false,
    })
});

static UNHANDLED_FILTER: Lazy<RwLock<Option<UnhandledFilter>>> = Lazy::new(|| RwLock::new(None));
static EXIT_HOOK: Lazy<RwLock<ExitHook>> = Lazy::new(|| RwLock::new(exit_process));

pub(crate) fn unhandled_filter() -> Option<UnhandledFilter> {
    UNHANDLED_FILTER.read_or_poison().clone()
}

pub(crate) fn replace_unhandled_filter(filter: Option<UnhandledFilter>) -> Option<UnhandledFilter> {
    std::mem::replace(&mut *UNHANDLED_FILTER.write_or_poison(), filter)
}

pub(crate) fn exit_hook() -> ExitHook {
    *EXIT_HOOK.read_or_poison()
}

pub(crate) fn replace_exit_hook(hook: ExitHook) -> ExitHook {
    std::mem::replace(&mut *EXIT_HOOK.write_or_poison(), hook)
}
