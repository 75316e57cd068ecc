// 全局/局部 unwind 顺序与碰撞 unwind 的单元测试
use super::{UnwindCause, global_unwind, local_unwind};
use crate::machine::Context;
use crate::seh::chain;
use crate::seh::{
    ExceptionPointers, FilterResult, Handled, ScopeEntry, ScopeFrame, ScopeTable, TRYLEVEL_TOP,
    abnormal_termination, chain_depth, protect, raise_exception,
};
use crate::test_support::{record, take_events};

const E1: u32 = 0xE000_0011;
const E2: u32 = 0xE000_0012;

fn accept_all(_pointers: &ExceptionPointers<'_>, _data: usize) -> FilterResult {
    FilterResult::ExecuteHandler
}

fn log_handler(data: usize) {
    record(format!("X{}", data));
}

fn log_finally(data: usize) {
    record(format!("{}", data));
}

static ACCEPT: [ScopeEntry; 1] = [ScopeEntry::except(TRYLEVEL_TOP, accept_all, log_handler)];
static ACCEPT_TABLE: ScopeTable = ScopeTable::new(&ACCEPT);
static FINALLY: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, log_finally)];
static FINALLY_TABLE: ScopeTable = ScopeTable::new(&FINALLY);

fn nest_finally(depth: usize, max: usize) {
    if depth > max {
        raise_exception(E1, 0, &[]);
        return;
    }
    protect(&FINALLY_TABLE, depth, |frame| {
        frame.enter(0);
        nest_finally(depth + 1, max);
    });
}

#[test]
fn cleanups_run_innermost_first() {
    let result = protect(&ACCEPT_TABLE, 0, |frame| {
        frame.enter(0);
        nest_finally(1, 5);
    });

    assert_eq!(result.handled(), Some(Handled { level: 0, code: E1 }));
    assert_eq!(take_events(), vec!["5", "4", "3", "2", "1", "X0"]);
    assert_eq!(chain_depth(), 0);
}

fn finally_c(_data: usize) {
    record("C");
    raise_exception(E2, 0, &[]);
}

fn finally_b(_data: usize) {
    record("B");
}

fn finally_a(_data: usize) {
    record("A");
}

fn handler_x(_data: usize) {
    record("X");
}

#[test]
fn collided_unwind_runs_each_cleanup_once() {
    static X: [ScopeEntry; 1] = [ScopeEntry::except(TRYLEVEL_TOP, accept_all, handler_x)];
    static A: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, finally_a)];
    static B: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, finally_b)];
    static C: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, finally_c)];
    static X_TABLE: ScopeTable = ScopeTable::new(&X);
    static A_TABLE: ScopeTable = ScopeTable::new(&A);
    static B_TABLE: ScopeTable = ScopeTable::new(&B);
    static C_TABLE: ScopeTable = ScopeTable::new(&C);

    let result = protect(&X_TABLE, 0, |x| {
        x.enter(0);
        protect(&A_TABLE, 0, |a| {
            a.enter(0);
            protect(&B_TABLE, 0, |b| {
                b.enter(0);
                protect(&C_TABLE, 0, |c| {
                    c.enter(0);
                    raise_exception(E1, 0, &[]);
                });
            });
        });
    });

    assert_eq!(result.handled(), Some(Handled { level: 0, code: E2 }));
    assert_eq!(take_events(), vec!["C", "B", "A", "X"]);
    assert_eq!(chain_depth(), 0);
}

fn flag_finally(data: usize) {
    record(format!("{}:{}", data, abnormal_termination()));
}

static TWO_FINALLY: [ScopeEntry; 2] = [
    ScopeEntry::finally(TRYLEVEL_TOP, flag_finally),
    ScopeEntry::finally(0, flag_finally),
];
static TWO_FINALLY_TABLE: ScopeTable = ScopeTable::new(&TWO_FINALLY);

#[test]
fn leave_runs_finally_as_normal_termination() {
    let result = protect(&TWO_FINALLY_TABLE, 9, |frame| {
        frame.enter(0);
        frame.enter(1);
        frame.leave();
        assert_eq!(frame.trylevel(), 0);
        frame.leave();
        frame.trylevel()
    });

    assert_eq!(result.completed(), Some(TRYLEVEL_TOP));
    assert_eq!(take_events(), vec!["9:false", "9:false"]);
}

#[test]
fn unwind_to_target_stops_at_target_level() {
    let result = protect(&TWO_FINALLY_TABLE, 3, |frame| {
        frame.enter(0);
        frame.enter(1);
        frame.unwind_to(0);
        record(format!("level {}", frame.trylevel()));
        frame.unwind_to(TRYLEVEL_TOP);
        frame.trylevel()
    });

    assert_eq!(result.completed(), Some(TRYLEVEL_TOP));
    assert_eq!(take_events(), vec!["3:true", "level 0", "3:true"]);
    assert!(!abnormal_termination());
}

fn rerun_check(data: usize) {
    record(format!("cleanup {}", data));
}

#[test]
fn trylevel_advances_before_cleanup_runs() {
    static ENTRIES: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, rerun_check)];
    static TABLE: ScopeTable = ScopeTable::new(&ENTRIES);

    protect(&TABLE, 1, |frame: &ScopeFrame<'_>| {
        frame.enter(0);
        let inner = frame.exception_frame();
        local_unwind(inner, TRYLEVEL_TOP, UnwindCause::Abnormal);
        // 第二次 unwind 看到的 trylevel 已是链尾，不会重复执行
        local_unwind(inner, TRYLEVEL_TOP, UnwindCause::Abnormal);
    });

    assert_eq!(take_events(), vec!["cleanup 1"]);
}

#[test]
fn global_unwind_pops_frames_above_target() {
    let context = Context::capture();
    protect(&FINALLY_TABLE, 0, |outer| {
        let target = outer.exception_frame().registration() as *const _;
        protect(&FINALLY_TABLE, 1, |inner| {
            inner.enter(0);
            protect(&FINALLY_TABLE, 2, |innermost| {
                innermost.enter(0);
                global_unwind(target, None, &context);
                assert_eq!(chain::head(), target);
                assert_eq!(chain_depth(), 1);
            });
        });
    });

    assert_eq!(take_events(), vec!["2", "1"]);
    assert_eq!(chain_depth(), 0);
}

fn finally_f0(_data: usize) {
    record("F0");
}

fn finally_f1(_data: usize) {
    record("F1");
    raise_exception(E2, 0, &[]);
}

static RAISING_INNER: [ScopeEntry; 2] = [
    ScopeEntry::finally(TRYLEVEL_TOP, finally_f0),
    ScopeEntry::finally(0, finally_f1),
];
static RAISING_INNER_TABLE: ScopeTable = ScopeTable::new(&RAISING_INNER);

#[test]
fn collision_during_leave_runs_remaining_levels_of_frame() {
    let result = protect(&ACCEPT_TABLE, 0, |x| {
        x.enter(0);
        protect(&RAISING_INNER_TABLE, 0, |t| {
            t.enter(0);
            t.enter(1);
            t.leave();
            record("not reached");
        });
    });

    assert_eq!(result.handled(), Some(Handled { level: 0, code: E2 }));
    assert_eq!(take_events(), vec!["F1", "F0", "X0"]);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn collision_during_unwind_to_runs_remaining_levels_of_frame() {
    let result = protect(&ACCEPT_TABLE, 1, |x| {
        x.enter(0);
        protect(&RAISING_INNER_TABLE, 0, |t| {
            t.enter(0);
            t.enter(1);
            t.unwind_to(TRYLEVEL_TOP);
            record("not reached");
        });
    });

    assert_eq!(result.handled(), Some(Handled { level: 0, code: E2 }));
    assert_eq!(take_events(), vec!["F1", "F0", "X1"]);
    assert_eq!(chain_depth(), 0);
}
