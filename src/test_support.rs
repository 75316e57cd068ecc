// 单元测试共用：线程级事件日志、全局状态互斥与不终止进程的退出钩子
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn record(event: impl Into<String>) {
    EVENTS.with(|events| events.borrow_mut().push(event.into()));
}

pub(crate) fn take_events() -> Vec<String> {
    EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()))
}

// 触碰进程级状态（退出钩子、顶层过滤器、init）的测试需要串行
static GLOBAL_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn lock_globals() -> MutexGuard<'static, ()> {
    GLOBAL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct ExitCalled(pub(crate) i32);

pub(crate) fn exit_by_unwinding(code: i32) -> ! {
    panic::resume_unwind(Box::new(ExitCalled(code)))
}

// 执行 f，返回其间退出钩子收到的退出码
pub(crate) fn catch_exit<F: FnOnce()>(f: F) -> Option<i32> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => match payload.downcast::<ExitCalled>() {
            Ok(exit) => Some(exit.0),
            Err(other) => panic::resume_unwind(other),
        },
    }
}
