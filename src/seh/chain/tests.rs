// 帧链安装、摘除与遍历的单元测试
use super::{
    Registration, RegistrationKind, chain_depth, contains, head, install, install_guard, pop_frame,
    uninstall, walk,
};
use crate::machine::Context;
use crate::seh::{Disposition, ExceptionRecord};

unsafe fn search_handler(
    _record: &ExceptionRecord,
    _frame: *const Registration,
    _context: &Context,
    _dispatcher: &mut *const Registration,
) -> Disposition {
    Disposition::ContinueSearch
}

fn registration(kind: RegistrationKind) -> Registration {
    Registration::new(kind, search_handler)
}

#[test]
fn install_links_frames_innermost_first() {
    let outer = registration(RegistrationKind::ScopeFrame);
    let inner = registration(RegistrationKind::ScopeFrame);
    let _outer = install(&outer);
    let _inner = install(&inner);

    let frames: Vec<*const Registration> = walk().collect();
    assert_eq!(frames, vec![&inner as *const _, &outer as *const _]);
    assert_eq!(chain_depth(), 2);
    assert_eq!(inner.prev(), &outer as *const _);
}

#[test]
fn epilogue_restores_prev_even_after_pop() {
    let outer = registration(RegistrationKind::ScopeFrame);
    let _outer = install(&outer);
    {
        let inner = registration(RegistrationKind::ScopeFrame);
        let _inner = install(&inner);
        assert_eq!(pop_frame(&inner), &outer as *const _);
        assert_eq!(head(), &outer as *const _);
    }
    assert_eq!(head(), &outer as *const _);
}

#[test]
fn guard_unlinks_itself_below_newer_frames() {
    let base = registration(RegistrationKind::ScopeFrame);
    let guard = registration(RegistrationKind::Guard);
    let top = registration(RegistrationKind::ScopeFrame);

    let _base = install(&base);
    let guard_installed = install_guard(&guard);
    let _top = install(&top);

    drop(guard_installed);
    assert!(!contains(&guard));
    assert_eq!(top.prev(), &base as *const _);
    assert_eq!(head(), &top as *const _);
}

#[test]
fn uninstall_missing_registration_is_noop() {
    let base = registration(RegistrationKind::ScopeFrame);
    let stray = registration(RegistrationKind::Guard);
    let _base = install(&base);
    assert!(!uninstall(&stray));
    assert_eq!(head(), &base as *const _);
    assert_eq!(base.kind(), RegistrationKind::ScopeFrame);
}

#[test]
fn empty_chain_has_no_frames() {
    let handle = std::thread::spawn(|| (chain_depth(), head().is_null()));
    assert_eq!(handle.join().expect("join"), (0, true));
}
