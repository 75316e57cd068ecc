// C 运行时信号表：signal/raise 语义，以及硬件异常到信号处理器的翻译
use crate::errno::Errno;
use crate::log;
use crate::runtime::state::{self, MutexPoisonRecover};
use crate::runtime::thread_state::{report_thread_state_unavailable, with_thread_state};
use crate::runtime::ExitHook;
use crate::seh::ExceptionRecord;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) mod translator;

// 默认动作终止进程时的退出码
pub const DEFAULT_ACTION_EXIT_CODE: i32 = 3;

/// 运行时识别的信号，数值与 MSVCRT 的 SIG* 常量一致
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Signal {
    Int = 2,
    Ill = 4,
    Fpe = 8,
    Segv = 11,
    Term = 15,
    Break = 21,
    Abrt = 22,
}

const SIGNAL_COUNT: usize = 7;

impl Signal {
    pub const ALL: [Signal; SIGNAL_COUNT] = [
        Signal::Int,
        Signal::Ill,
        Signal::Fpe,
        Signal::Segv,
        Signal::Term,
        Signal::Break,
        Signal::Abrt,
    ];

    pub const fn from_raw(value: i32) -> Option<Self> {
        match value {
            2 => Some(Self::Int),
            4 => Some(Self::Ill),
            8 => Some(Self::Fpe),
            11 => Some(Self::Segv),
            15 => Some(Self::Term),
            21 => Some(Self::Break),
            22 => Some(Self::Abrt),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    const fn slot(self) -> usize {
        match self {
            Self::Int => 0,
            Self::Ill => 1,
            Self::Fpe => 2,
            Self::Segv => 3,
            Self::Term => 4,
            Self::Break => 5,
            Self::Abrt => 6,
        }
    }

    // 由硬件异常翻译而来的信号，处理器运行期间可以看到当前异常
    pub const fn carries_exception(self) -> bool {
        matches!(self, Self::Ill | Self::Fpe | Self::Segv)
    }
}

/// SIGFPE 处理器的第二个参数
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FpeCode {
    Invalid = 0x81,
    Denormal = 0x82,
    ZeroDivide = 0x83,
    Overflow = 0x84,
    Underflow = 0x85,
    Inexact = 0x86,
    Unemulated = 0x87,
    SqrtNeg = 0x88,
    StackOverflow = 0x8a,
    StackUnderflow = 0x8b,
    ExplicitGen = 0x8c,
}

/// 用户信号处理器；只有 SIGFPE 收到 `FpeCode`
pub type SignalHandler = fn(Signal, Option<FpeCode>);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalAction {
    Default,
    Ignore,
    Handler(SignalHandler),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsoleEvent {
    CtrlC,
    CtrlBreak,
}

fn exit_through_process_hook(code: i32) -> ! {
    (state::exit_hook())(code)
}

/// 进程级信号表，每种信号至多一个处理器
///
/// 由 `init` 启用、`shutdown` 停用；停用期间的 install/raise 返回 `Errno::Uninit`。
pub struct SignalRegistry {
    table: Mutex<[SignalAction; SIGNAL_COUNT]>,
    active: AtomicBool,
    exit: ExitHook,
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::with_exit_hook(exit_through_process_hook)
    }

    /// 默认动作改为调用 `exit`
    pub fn with_exit_hook(exit: ExitHook) -> Self {
        Self {
            table: Mutex::new([SignalAction::Default; SIGNAL_COUNT]),
            active: AtomicBool::new(false),
            exit,
        }
    }

    pub fn init(&self) {
        *self.table.lock_or_poison() = [SignalAction::Default; SIGNAL_COUNT];
        self.active.store(true, Ordering::Release);
    }

    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        *self.table.lock_or_poison() = [SignalAction::Default; SIGNAL_COUNT];
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn check_active(&self) -> Result<(), Errno> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Errno::Uninit)
        }
    }

    /// 安装动作并返回旧动作；未知信号返回 `Errno::UnknownSignal` 且不改动信号表
    pub fn install(&self, sig: i32, action: SignalAction) -> Result<SignalAction, Errno> {
        let Some(signal) = Signal::from_raw(sig) else {
            log::warn(format_args!("安装处理器时遇到未知信号: sig={}", sig));
            return Err(Errno::UnknownSignal);
        };
        self.check_active()?;
        let mut table = self.table.lock_or_poison();
        let previous = std::mem::replace(&mut table[signal.slot()], action);
        log::debug(format_args!(
            "信号处理器已更新: sig={:?} {:?} -> {:?}",
            signal, previous, action
        ));
        Ok(previous)
    }

    pub fn action(&self, signal: Signal) -> SignalAction {
        self.table.lock_or_poison()[signal.slot()]
    }

    // 取出待投递的动作；用户处理器在同一把锁内重置为默认，处理器内再次 raise 看到默认动作
    pub(crate) fn take_for_delivery(&self, signal: Signal) -> SignalAction {
        let mut table = self.table.lock_or_poison();
        let action = table[signal.slot()];
        if let SignalAction::Handler(_) = action {
            table[signal.slot()] = SignalAction::Default;
        }
        action
    }

    /// 显式引发信号：默认动作以退出码 3 终止进程，忽略则什么都不做
    pub fn raise(&self, sig: i32) -> Result<(), Errno> {
        let Some(signal) = Signal::from_raw(sig) else {
            log::warn(format_args!("raise 未知信号: sig={}", sig));
            return Err(Errno::UnknownSignal);
        };
        self.check_active()?;

        match self.take_for_delivery(signal) {
            SignalAction::Default => {
                log::info(format_args!("信号默认动作终止进程: sig={:?}", signal));
                (self.exit)(DEFAULT_ACTION_EXIT_CODE)
            }
            SignalAction::Ignore => Ok(()),
            SignalAction::Handler(handler) => {
                let fpe = (signal == Signal::Fpe).then_some(FpeCode::ExplicitGen);
                let _scope = signal
                    .carries_exception()
                    .then(|| ExceptionScope::enter(None));
                handler(signal, fpe);
                Ok(())
            }
        }
    }

    /// 控制台事件：调用 SIGINT/SIGBREAK 处理器但不重置；返回事件是否被消费
    pub fn console_event(&self, event: ConsoleEvent) -> bool {
        if !self.is_active() {
            return false;
        }
        let signal = match event {
            ConsoleEvent::CtrlC => Signal::Int,
            ConsoleEvent::CtrlBreak => Signal::Break,
        };
        match self.action(signal) {
            SignalAction::Default => false,
            SignalAction::Ignore => true,
            SignalAction::Handler(handler) => {
                handler(signal, None);
                true
            }
        }
    }
}

/// 当前线程正在由信号处理器处理的异常（`__pxcptinfoptrs`）
pub fn current_exception() -> Option<ExceptionRecord> {
    match with_thread_state(|state| state.current_exception().cloned()) {
        Some(record) => record,
        None => {
            report_thread_state_unavailable("current_exception");
            None
        }
    }
}

// 处理器运行期间设置当前异常，离开时还原
pub(crate) struct ExceptionScope {
    previous: Option<ExceptionRecord>,
    restore: bool,
}

impl ExceptionScope {
    pub(crate) fn enter(record: Option<ExceptionRecord>) -> Self {
        match with_thread_state(|state| state.replace_current_exception(record)) {
            Some(previous) => Self {
                previous,
                restore: true,
            },
            None => {
                report_thread_state_unavailable("exception_scope");
                Self {
                    previous: None,
                    restore: false,
                }
            }
        }
    }
}

impl Drop for ExceptionScope {
    fn drop(&mut self) {
        if !self.restore {
            return;
        }
        let previous = self.previous.take();
        with_thread_state(|state| {
            state.replace_current_exception(previous);
        });
    }
}

#[cfg(test)]
mod tests;
