use msvcrt_seh::{
    ConsoleEvent, DEFAULT_ACTION_EXIT_CODE, FpeCode, SehErrno, Signal, SignalAction,
    console_event, raise, signal,
};

use crate::test_ctx::{ChildExit, Runtime, record, run_in_child, take_events};

fn log_signal(sig: Signal, fpe: Option<FpeCode>) {
    record(format!("{sig:?} {fpe:?}"));
}

pub fn scenario_signal_registry() {
    let _runtime = Runtime::start("init signal-registry");
    assert_eq!(
        signal(7, SignalAction::Ignore),
        Err(SehErrno::UnknownSignal)
    );
    assert_eq!(raise(7), Err(SehErrno::UnknownSignal));

    let fpe = Signal::Fpe.as_raw();
    let previous = signal(fpe, SignalAction::Handler(log_signal)).expect("signal fpe");
    assert_eq!(previous, SignalAction::Default);
    raise(fpe).expect("raise fpe");
    assert_eq!(take_events(), vec!["Fpe Some(ExplicitGen)"]);

    let term = Signal::Term.as_raw();
    signal(term, SignalAction::Ignore).expect("signal term");
    raise(term).expect("raise term");
    raise(term).expect("raise term again");
    assert!(take_events().is_empty());
}

pub fn scenario_console_event() {
    let _runtime = Runtime::start("init console-event");
    assert!(!console_event(ConsoleEvent::CtrlC));
    signal(Signal::Int.as_raw(), SignalAction::Handler(log_signal)).expect("signal int");
    assert!(console_event(ConsoleEvent::CtrlC));
    assert!(console_event(ConsoleEvent::CtrlC));
    assert!(!console_event(ConsoleEvent::CtrlBreak));
    assert_eq!(take_events(), vec!["Int None", "Int None"]);
}

fn raise_abort_in_child() {
    let _runtime = Runtime::start("init child");
    println!("before-raise");
    let _ = raise(Signal::Abrt.as_raw());
    println!("after-raise");
}

pub fn scenario_raise_default_exit() {
    let outcome = run_in_child(raise_abort_in_child);
    assert_eq!(outcome.exit, ChildExit::Code(DEFAULT_ACTION_EXIT_CODE));
    assert_eq!(outcome.lines(), vec!["before-raise"]);
}

fn reraise_handler(sig: Signal, _fpe: Option<FpeCode>) {
    println!("handler {sig:?}");
    let _ = raise(sig.as_raw());
    println!("reraise returned");
}

fn reraise_in_child() {
    let _runtime = Runtime::start("init child");
    signal(Signal::Segv.as_raw(), SignalAction::Handler(reraise_handler)).expect("signal segv");
    let _ = raise(Signal::Segv.as_raw());
    println!("not reached");
}

// 处理器调用前已重置为默认动作，处理器内再次 raise 以退出码 3 终止
pub fn scenario_raise_recursion_guard() {
    let outcome = run_in_child(reraise_in_child);
    assert_eq!(outcome.exit, ChildExit::Code(DEFAULT_ACTION_EXIT_CODE));
    assert_eq!(outcome.lines(), vec!["handler Segv"]);
}
