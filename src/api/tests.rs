// 公共 API 的单元测试：生命周期、进程信号表、故障守卫分发与 unwind 导出
use super::{
    global_unwind2, guarded, init, is_initialized, local_unwind2, raise, shutdown, signal,
};
use crate::config::SehConfig;
use crate::errno::Errno;
use crate::seh::{
    ExceptionPointers, FilterResult, Guarded, Handled, STATUS_ACCESS_VIOLATION, ScopeEntry,
    ScopeTable, TRYLEVEL_TOP, abnormal_termination, chain_depth, protect, set_process_exit_hook,
};
use crate::signal::{Signal, SignalAction, FpeCode, current_exception};
use crate::test_support::{catch_exit, exit_by_unwinding, lock_globals, record, take_events};

const UNMAPPED_ADDR: usize = 16;

fn read_unmapped() -> u8 {
    unsafe { std::ptr::read_volatile(UNMAPPED_ADDR as *const u8) }
}

fn log_finally(data: usize) {
    record(format!("fin{}:{}", data, abnormal_termination()));
}

fn accept_all(_pointers: &ExceptionPointers<'_>, _data: usize) -> FilterResult {
    FilterResult::ExecuteHandler
}

fn except_body(data: usize) {
    record(format!("except{}", data));
}

fn log_segv(signal: Signal, _fpe: Option<FpeCode>) {
    let code = current_exception().map(|record| record.code);
    record(format!("{:?} {:x?}", signal, code));
}

static FINALLY: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, log_finally)];
static FINALLY_TABLE: ScopeTable = ScopeTable::new(&FINALLY);
static TWO_FINALLY: [ScopeEntry; 2] = [
    ScopeEntry::finally(TRYLEVEL_TOP, log_finally),
    ScopeEntry::finally(0, log_finally),
];
static TWO_FINALLY_TABLE: ScopeTable = ScopeTable::new(&TWO_FINALLY);
static EXCEPT: [ScopeEntry; 1] = [ScopeEntry::except(TRYLEVEL_TOP, accept_all, except_body)];
static EXCEPT_TABLE: ScopeTable = ScopeTable::new(&EXCEPT);

#[test]
fn signal_api_follows_runtime_lifecycle() {
    let _lock = lock_globals();
    let term = Signal::Term.as_raw();
    assert_eq!(signal(term, SignalAction::Ignore), Err(Errno::Uninit));
    assert_eq!(signal(99, SignalAction::Ignore), Err(Errno::UnknownSignal));

    assert!(!is_initialized());
    assert_eq!(init(SehConfig::default()), Errno::Ok);
    assert!(is_initialized());
    assert_eq!(init(SehConfig::default()), Errno::Repeat);
    assert_eq!(signal(term, SignalAction::Ignore), Ok(SignalAction::Default));
    assert_eq!(raise(term), Ok(()));
    assert_eq!(raise(99), Err(Errno::UnknownSignal));
    shutdown();

    assert!(!is_initialized());
    assert_eq!(raise(term), Err(Errno::Uninit));
}

#[test]
fn guarded_fault_is_accepted_by_except_block() {
    let _lock = lock_globals();
    assert_eq!(init(SehConfig::default()), Errno::Ok);

    let result = protect(&EXCEPT_TABLE, 3, |frame| {
        frame.enter(0);
        let _ = guarded(read_unmapped);
        record("not reached");
    });
    shutdown();

    assert_eq!(
        result.handled(),
        Some(Handled {
            level: 0,
            code: STATUS_ACCESS_VIOLATION
        })
    );
    assert_eq!(take_events(), vec!["except3"]);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn guarded_fault_reaches_segv_handler_through_translator() {
    let _lock = lock_globals();
    let saved_hook = set_process_exit_hook(exit_by_unwinding);
    assert_eq!(init(SehConfig::default()), Errno::Ok);
    signal(Signal::Segv.as_raw(), SignalAction::Handler(log_segv)).expect("install");

    let mut outcome = None;
    let exit = catch_exit(|| {
        outcome = Some(guarded(read_unmapped));
    });
    shutdown();
    set_process_exit_hook(saved_hook);

    assert_eq!(exit, None);
    assert_eq!(outcome, Some(Ok(None)));
    assert_eq!(take_events(), vec!["Segv Some(c0000005)"]);
}

#[test]
fn fault_inside_guarded_runs_inner_finally_before_outer_except() {
    let _lock = lock_globals();
    assert_eq!(init(SehConfig::default()), Errno::Ok);

    let result = protect(&EXCEPT_TABLE, 3, |frame| {
        frame.enter(0);
        let _ = guarded(|| {
            protect(&FINALLY_TABLE, 9, |inner| {
                inner.enter(0);
                read_unmapped()
            })
        });
        record("not reached");
    });
    shutdown();

    assert_eq!(
        result.handled(),
        Some(Handled {
            level: 0,
            code: STATUS_ACCESS_VIOLATION
        })
    );
    assert_eq!(take_events(), vec!["fin9:true", "except3"]);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn fault_inside_guarded_is_accepted_by_inner_except() {
    let _lock = lock_globals();
    let saved_hook = set_process_exit_hook(exit_by_unwinding);
    assert_eq!(init(SehConfig::default()), Errno::Ok);

    let mut outcome = None;
    let exit = catch_exit(|| {
        outcome = Some(guarded(|| {
            protect(&EXCEPT_TABLE, 7, |frame| {
                frame.enter(0);
                read_unmapped()
            })
        }));
    });
    shutdown();
    set_process_exit_hook(saved_hook);

    assert_eq!(exit, None);
    assert_eq!(
        outcome,
        Some(Ok(Some(Guarded::Handled(Handled {
            level: 0,
            code: STATUS_ACCESS_VIOLATION
        }))))
    );
    assert_eq!(take_events(), vec!["except7"]);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn continued_fault_unwinds_frames_inside_guarded() {
    let _lock = lock_globals();
    let saved_hook = set_process_exit_hook(exit_by_unwinding);
    assert_eq!(init(SehConfig::default()), Errno::Ok);
    signal(Signal::Segv.as_raw(), SignalAction::Handler(log_segv)).expect("install");

    let mut outcome = None;
    let exit = catch_exit(|| {
        outcome = Some(guarded(|| {
            protect(&FINALLY_TABLE, 5, |frame| {
                frame.enter(0);
                read_unmapped();
                record("not reached");
            })
        }));
    });
    shutdown();
    set_process_exit_hook(saved_hook);

    assert_eq!(exit, None);
    assert_eq!(outcome, Some(Ok(None)));
    assert_eq!(take_events(), vec!["Segv Some(c0000005)", "fin5:true"]);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn guarded_without_fault_returns_value() {
    let _lock = lock_globals();
    assert_eq!(init(SehConfig::default()), Errno::Ok);
    let value = guarded(|| 5 * 5);
    shutdown();
    assert_eq!(value, Ok(Some(25)));
}

#[test]
fn global_unwind2_runs_cleanups_above_target() {
    protect(&FINALLY_TABLE, 1, |outer| {
        outer.enter(0);
        protect(&FINALLY_TABLE, 2, |inner| {
            inner.enter(0);
            global_unwind2(Some(outer), None);
            assert_eq!(chain_depth(), 1);
            assert_eq!(inner.trylevel(), TRYLEVEL_TOP);
        });
        outer.leave();
    });

    assert_eq!(take_events(), vec!["fin2:true", "fin1:false"]);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn local_unwind2_runs_nested_finally_blocks_abnormally() {
    protect(&TWO_FINALLY_TABLE, 4, |frame| {
        frame.enter(0);
        frame.enter(1);
        local_unwind2(frame, TRYLEVEL_TOP);
        assert_eq!(frame.trylevel(), TRYLEVEL_TOP);
    });

    assert_eq!(take_events(), vec!["fin4:true", "fin4:true"]);
}
