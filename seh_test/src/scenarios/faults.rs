use msvcrt_seh::{
    ExceptionPointers, FilterResult, FpeCode, Handled, STATUS_ACCESS_VIOLATION, ScopeEntry,
    ScopeTable, Signal, SignalAction, TRYLEVEL_TOP, abnormal_termination, chain_depth,
    current_exception, guarded, protect, signal,
};

use crate::test_ctx::{ChildExit, Runtime, record, run_in_child, take_events};

const UNMAPPED_ADDR: usize = 0x10;

fn read_unmapped() -> u8 {
    unsafe { std::ptr::read_volatile(UNMAPPED_ADDR as *const u8) }
}

fn write_unmapped() {
    unsafe { std::ptr::write_volatile(UNMAPPED_ADDR as *mut u8, 1) }
}

fn access_violation_filter(pointers: &ExceptionPointers<'_>, _data: usize) -> FilterResult {
    let record_ref = pointers.record;
    record(format!(
        "filter {:#x} params={:x?}",
        record_ref.code,
        record_ref.params()
    ));
    if record_ref.code == STATUS_ACCESS_VIOLATION {
        FilterResult::ExecuteHandler
    } else {
        FilterResult::ContinueSearch
    }
}

fn except_block(data: usize) {
    record(format!("except{data}"));
}

static EXCEPT: [ScopeEntry; 1] = [ScopeEntry::except(
    TRYLEVEL_TOP,
    access_violation_filter,
    except_block,
)];
static EXCEPT_TABLE: ScopeTable = ScopeTable::new(&EXCEPT);

pub fn scenario_guarded_fault_except() {
    let _runtime = Runtime::start("init guarded-fault-except");
    let result = protect(&EXCEPT_TABLE, 1, |frame| {
        frame.enter(0);
        let _ = guarded(read_unmapped);
        record("not reached");
    });
    assert_eq!(
        result.handled(),
        Some(Handled {
            level: 0,
            code: STATUS_ACCESS_VIOLATION
        })
    );
    assert_eq!(take_events(), vec!["filter 0xc0000005 params=[0, 10]", "except1"]);
    assert_eq!(chain_depth(), 0);

    let value = guarded(|| 6 * 7).expect("guard available");
    assert_eq!(value, Some(42));
}

fn finally_block(data: usize) {
    record(format!("finally{data}:{}", abnormal_termination()));
}

static FINALLY: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, finally_block)];
static FINALLY_TABLE: ScopeTable = ScopeTable::new(&FINALLY);

// 守卫区域内安装的帧在故障分发时仍在链上
pub fn scenario_guarded_fault_inner_frames() {
    let _runtime = Runtime::start("init guarded-fault-inner-frames");
    let result = protect(&EXCEPT_TABLE, 2, |frame| {
        frame.enter(0);
        let _ = guarded(|| {
            protect(&FINALLY_TABLE, 3, |inner| {
                inner.enter(0);
                write_unmapped();
            })
        });
        record("not reached");
    });
    assert_eq!(
        result.handled().map(|handled| handled.code),
        Some(STATUS_ACCESS_VIOLATION)
    );
    assert_eq!(
        take_events(),
        vec!["filter 0xc0000005 params=[1, 10]", "finally3:true", "except2"]
    );
    assert_eq!(chain_depth(), 0);

    let inner = guarded(|| {
        protect(&EXCEPT_TABLE, 4, |frame| {
            frame.enter(0);
            read_unmapped()
        })
    })
    .expect("guard available");
    assert_eq!(
        inner.and_then(|outcome| outcome.handled()).map(|handled| handled.level),
        Some(0)
    );
    assert_eq!(take_events(), vec!["filter 0xc0000005 params=[0, 10]", "except4"]);
    assert_eq!(chain_depth(), 0);
}

fn segv_handler(sig: Signal, _fpe: Option<FpeCode>) {
    let code = current_exception().map(|record| record.code);
    record(format!("{sig:?} {code:x?}"));
}

pub fn scenario_guarded_fault_signal() {
    let _runtime = Runtime::start("init guarded-fault-signal");
    signal(Signal::Segv.as_raw(), SignalAction::Handler(segv_handler)).expect("signal segv");
    let outcome = guarded(read_unmapped).expect("guard available");
    assert_eq!(outcome, None);
    assert_eq!(take_events(), vec!["Segv Some(c0000005)"]);
    assert!(current_exception().is_none());
}

fn unhandled_fault_in_child() {
    let _runtime = Runtime::start("init child");
    println!("before-fault");
    let _ = guarded(write_unmapped);
    println!("not reached");
}

// 未处理的访问违例以异常码退出，低 8 位为 0x05
pub fn scenario_unhandled_fault_exit() {
    let outcome = run_in_child(unhandled_fault_in_child);
    assert_eq!(
        outcome.exit,
        ChildExit::Code((STATUS_ACCESS_VIOLATION & 0xff) as i32)
    );
    assert_eq!(outcome.lines(), vec!["before-fault"]);
}

fn unguarded_fault_in_child() {
    let _runtime = Runtime::start("init child");
    println!("before-fault");
    let _ = read_unmapped();
    println!("not reached");
}

// 守卫外的故障交给原处理动作，进程以信号终止
pub fn scenario_unguarded_fault_forward() {
    let outcome = run_in_child(unguarded_fault_in_child);
    assert!(
        matches!(outcome.exit, ChildExit::Signal(sig) if sig == libc::SIGSEGV || sig == libc::SIGBUS),
        "unexpected child exit: {:?}",
        outcome.exit
    );
    assert_eq!(outcome.lines(), vec!["before-fault"]);
}
