// 线程级异常帧链：栈上分配的注册记录，经 prev 指针串成单向链表
use super::{Disposition, ExceptionRecord, fatal};
use crate::errno::Errno;
use crate::machine::Context;
use crate::runtime::thread_state::{report_thread_state_unavailable, with_thread_state};
use std::cell::Cell;
use std::ptr;

// 遍历上限；超过即视为链表成环或被踩坏
const CHAIN_DEPTH_MAX: usize = 1 << 16;

/// handler 签名：(记录, 本帧注册记录, 上下文, dispatcher 出参)
///
/// dispatcher 出参仅在返回 NestedException / CollidedUnwind 时有意义，
/// 指向分发或 unwind 应当跳转到的帧。
pub(crate) type ExceptionHandler = unsafe fn(
    &ExceptionRecord,
    *const Registration,
    &Context,
    &mut *const Registration,
) -> Disposition;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RegistrationKind {
    // trylevel + scope table 帧
    ScopeFrame,
    // x64 风格按 PC 区间查表的帧
    TableFrame,
    // 分发/unwind 期间压入的临时守卫
    Guard,
}

// 注册记录是各类帧结构体的首字段，handler 通过指针强转取回外层帧
#[repr(C)]
pub(crate) struct Registration {
    prev: Cell<*const Registration>,
    handler: ExceptionHandler,
    kind: RegistrationKind,
}

impl Registration {
    pub(crate) const fn new(kind: RegistrationKind, handler: ExceptionHandler) -> Self {
        Self {
            prev: Cell::new(ptr::null()),
            handler,
            kind,
        }
    }

    pub(crate) fn prev(&self) -> *const Registration {
        self.prev.get()
    }

    pub(crate) fn kind(&self) -> RegistrationKind {
        self.kind
    }

    pub(crate) unsafe fn call(
        &self,
        record: &ExceptionRecord,
        context: &Context,
        dispatcher: &mut *const Registration,
    ) -> Disposition {
        unsafe { (self.handler)(record, self, context, dispatcher) }
    }
}

pub(crate) fn head() -> *const Registration {
    with_thread_state(|state| state.head()).unwrap_or(ptr::null())
}

pub(crate) fn set_head(head: *const Registration) {
    if with_thread_state(|state| state.set_head(head)).is_none() {
        report_thread_state_unavailable("chain_set_head");
    }
}

// 弹出 frame：链表头改为 frame.prev，返回新的链表头
pub(crate) fn pop_frame(frame: *const Registration) -> *const Registration {
    let prev = unsafe { (*frame).prev() };
    set_head(prev);
    prev
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum RemoveMode {
    // 帧的尾声：无条件恢复为安装时的 prev，已被 unwind 弹出也无妨
    Epilogue,
    // 临时守卫：只摘除自身，不改动其余链表
    Unlink,
}

// 注册记录的安装凭证，drop 时按模式摘除
pub(crate) struct Installed<'a> {
    reg: &'a Registration,
    mode: RemoveMode,
}

impl Drop for Installed<'_> {
    fn drop(&mut self) {
        match self.mode {
            RemoveMode::Epilogue => set_head(self.reg.prev()),
            RemoveMode::Unlink => {
                uninstall(self.reg);
            }
        }
    }
}

fn push(reg: &Registration) {
    reg.prev.set(head());
    set_head(reg);
}

pub(crate) fn install(reg: &Registration) -> Installed<'_> {
    push(reg);
    Installed {
        reg,
        mode: RemoveMode::Epilogue,
    }
}

pub(crate) fn install_guard(reg: &Registration) -> Installed<'_> {
    push(reg);
    Installed {
        reg,
        mode: RemoveMode::Unlink,
    }
}

// 摘除最近一次安装的 reg；不在链上时返回 false
pub(crate) fn uninstall(reg: *const Registration) -> bool {
    let mut successor: *const Registration = ptr::null();
    for current in walk() {
        if current == reg {
            let prev = unsafe { (*reg).prev() };
            if successor.is_null() {
                set_head(prev);
            } else {
                unsafe { (*successor).prev.set(prev) };
            }
            return true;
        }
        successor = current;
    }
    false
}

pub(crate) struct Frames {
    current: *const Registration,
    visited: usize,
}

impl Iterator for Frames {
    type Item = *const Registration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        self.visited += 1;
        if self.visited > CHAIN_DEPTH_MAX {
            fatal(
                Errno::ChainCorrupt,
                format_args!("帧链超过 {} 层，疑似成环", CHAIN_DEPTH_MAX),
            );
        }
        let frame = self.current;
        self.current = unsafe { (*frame).prev() };
        Some(frame)
    }
}

// 从链表头向外遍历
pub(crate) fn walk() -> Frames {
    Frames {
        current: head(),
        visited: 0,
    }
}

pub(crate) fn contains(target: *const Registration) -> bool {
    walk().any(|frame| frame == target)
}

/// 当前线程帧链上的注册记录数量，包括分发期间的临时守卫
pub fn chain_depth() -> usize {
    walk().count()
}

#[cfg(test)]
mod tests;
