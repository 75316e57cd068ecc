// trylevel 帧：注册记录 + scope table + 当前 trylevel + 帧数据
use super::chain::{self, ExceptionHandler, Registration, RegistrationKind};
use super::dispatch::{except_handler3, except_handler4};
use super::fault::run_frame_body;
use super::fatal;
use super::phase::{DispatchPhase, PhaseScope};
use super::scope::{EncodedScope, ScopeTable, ScopeTableV4, ScopeView, SecurityCookie};
use super::transfer::{self, Transfer};
use super::unwind::{UnwindCause, local_unwind};
use crate::errno::Errno;
use crate::log;
use std::cell::Cell;
use std::marker::PhantomData;

#[repr(C)]
pub(crate) struct ExceptionFrame {
    reg: Registration,
    scope: EncodedScope,
    trylevel: Cell<i32>,
    frame_data: usize,
}

impl ExceptionFrame {
    fn new(scope: EncodedScope, frame_data: usize) -> Self {
        let trylevel = scope.view().end();
        let handler: ExceptionHandler = match scope {
            EncodedScope::V3(_) => except_handler3,
            EncodedScope::V4 { .. } => except_handler4,
        };
        Self {
            reg: Registration::new(RegistrationKind::ScopeFrame, handler),
            scope,
            trylevel: Cell::new(trylevel),
            frame_data,
        }
    }

    // reg 必须指向某个 ExceptionFrame 的首字段
    pub(crate) unsafe fn from_registration<'a>(reg: *const Registration) -> &'a ExceptionFrame {
        debug_assert_eq!(unsafe { (*reg).kind() }, RegistrationKind::ScopeFrame);
        unsafe { &*(reg as *const ExceptionFrame) }
    }

    pub(crate) fn registration(&self) -> &Registration {
        &self.reg
    }

    pub(crate) fn scope_view(&self) -> ScopeView<'static> {
        self.scope.view()
    }

    pub(crate) fn trylevel(&self) -> i32 {
        self.trylevel.get()
    }

    pub(crate) fn set_trylevel(&self, level: i32) {
        self.trylevel.set(level);
    }

    pub(crate) fn frame_data(&self) -> usize {
        self.frame_data
    }
}

/// 被保护函数看到的帧句柄，用于推进和回退 trylevel
pub struct ScopeFrame<'a> {
    frame: &'a ExceptionFrame,
    // 帧只在安装它的线程上有效
    _not_send: PhantomData<*const ()>,
}

impl<'a> ScopeFrame<'a> {
    pub(crate) fn exception_frame(&self) -> &'a ExceptionFrame {
        self.frame
    }

    pub fn trylevel(&self) -> i32 {
        self.frame.trylevel()
    }

    pub fn frame_data(&self) -> usize {
        self.frame.frame_data()
    }

    /// 进入 try 层级 `level`；对应编译器在 __try 入口写 trylevel
    pub fn enter(&self, level: i32) {
        let view = self.frame.scope_view();
        if !view.is_valid_level(level) {
            fatal(
                Errno::BadTryLevel,
                format_args!("enter 到无效 trylevel {}: entries={}", level, view.len()),
            );
        }
        self.frame.set_trylevel(level);
    }

    /// 正常离开当前 try 层级：finally 以非异常终止方式执行一次
    pub fn leave(&self) {
        let level = self.frame.trylevel();
        let view = self.frame.scope_view();
        if level == view.end() {
            return;
        }
        let entry = view.entry_or_die(level);
        local_unwind(self.frame, entry.previous, UnwindCause::Normal);
    }

    /// 以非正常方式（return/goto 跳出 try）回退到 `target`，等价于 `_local_unwind2`
    pub fn unwind_to(&self, target: i32) {
        local_unwind(self.frame, target, UnwindCause::Abnormal);
    }
}

/// 被保护区域里 except 块接受的异常
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Handled {
    pub level: i32,
    pub code: u32,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Guarded<R> {
    Completed(R),
    Handled(Handled),
}

impl<R> Guarded<R> {
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Handled(_) => None,
        }
    }

    pub fn handled(&self) -> Option<Handled> {
        match self {
            Self::Completed(_) => None,
            Self::Handled(handled) => Some(*handled),
        }
    }
}

/// 安装 v3 帧并执行 `body`；body 内 `enter` 的层级由 `table` 描述
pub fn protect<R, F>(table: &'static ScopeTable, frame_data: usize, body: F) -> Guarded<R>
where
    F: FnOnce(&ScopeFrame<'_>) -> R,
{
    run_protected(EncodedScope::V3(table), frame_data, body)
}

/// 安装 v4 帧：表指针以 `cookie` 编码后保存
pub fn protect_v4<R, F>(
    table: &'static ScopeTableV4,
    cookie: &'static SecurityCookie,
    frame_data: usize,
    body: F,
) -> Guarded<R>
where
    F: FnOnce(&ScopeFrame<'_>) -> R,
{
    run_protected(EncodedScope::v4(table, cookie), frame_data, body)
}

fn run_protected<R, F>(scope: EncodedScope, frame_data: usize, body: F) -> Guarded<R>
where
    F: FnOnce(&ScopeFrame<'_>) -> R,
{
    let frame = ExceptionFrame::new(scope, frame_data);
    debug_assert!(frame.scope_view().validate().is_ok());
    let reg_addr = frame.registration() as *const Registration as usize;

    let installed = chain::install(frame.registration());
    let handle = ScopeFrame {
        frame: &frame,
        _not_send: PhantomData,
    };
    let outcome = transfer::catch(
        || run_frame_body(|| body(&handle)),
        |t| t.targets_frame(reg_addr),
    );

    let guarded = match outcome {
        Ok(value) => Guarded::Completed(value),
        Err(Transfer::Except {
            handler,
            level,
            code,
            ..
        }) => {
            chain::set_head(frame.registration());
            log::debug(format_args!(
                "进入 except 块: frame={:#x} level={} code={:#x}",
                reg_addr, level, code
            ));
            let _phase = PhaseScope::enter(DispatchPhase::HandlerBody);
            handler(frame_data);
            Guarded::Handled(Handled { level, code })
        }
        Err(other) => transfer::raise(other),
    };
    drop(installed);
    guarded
}
