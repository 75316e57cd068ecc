// 信号表与异常翻译的单元测试
use super::translator::{exception_filter, record_from_fault, xcpt_filter};
use super::{
    ConsoleEvent, DEFAULT_ACTION_EXIT_CODE, FpeCode, Signal, SignalAction, SignalRegistry,
    current_exception,
};
use crate::errno::Errno;
use crate::fault_guard::FaultInfo;
use crate::machine::Context;
use crate::seh::{
    ExceptionPointers, ExceptionRecord, FilterResult, STATUS_ACCESS_VIOLATION,
    STATUS_BREAKPOINT, STATUS_DATATYPE_MISALIGNMENT, STATUS_FLOAT_DIVIDE_BY_ZERO,
    STATUS_FLOAT_UNDERFLOW, STATUS_INTEGER_DIVIDE_BY_ZERO, STATUS_PRIVILEGED_INSTRUCTION,
};
use crate::test_support::{catch_exit, exit_by_unwinding, record, take_events};

fn active_registry() -> SignalRegistry {
    let registry = SignalRegistry::with_exit_hook(exit_by_unwinding);
    registry.init();
    registry
}

fn log_signal(signal: Signal, fpe: Option<FpeCode>) {
    let seen = current_exception().map(|record| record.code);
    record(format!("{:?} {:?} {:x?}", signal, fpe, seen));
}

#[test]
fn install_rejects_unknown_signal_and_keeps_table() {
    let registry = active_registry();
    assert_eq!(
        registry.install(9, SignalAction::Ignore),
        Err(Errno::UnknownSignal)
    );
    assert_eq!(registry.raise(9), Err(Errno::UnknownSignal));
    for signal in Signal::ALL {
        assert_eq!(registry.action(signal), SignalAction::Default);
    }
}

#[test]
fn inactive_registry_reports_uninit() {
    let registry = SignalRegistry::with_exit_hook(exit_by_unwinding);
    assert_eq!(
        registry.install(Signal::Int.as_raw(), SignalAction::Ignore),
        Err(Errno::Uninit)
    );
    assert_eq!(registry.raise(Signal::Int.as_raw()), Err(Errno::Uninit));
    assert!(!registry.console_event(ConsoleEvent::CtrlC));

    registry.init();
    registry.shutdown();
    assert_eq!(registry.raise(Signal::Term.as_raw()), Err(Errno::Uninit));
}

#[test]
fn install_returns_previous_action() {
    let registry = active_registry();
    let term = Signal::Term.as_raw();
    assert_eq!(registry.install(term, SignalAction::Ignore), Ok(SignalAction::Default));
    let previous = registry.install(term, SignalAction::Handler(log_signal));
    assert_eq!(previous, Ok(SignalAction::Ignore));
    assert!(matches!(
        registry.install(term, SignalAction::Default),
        Ok(SignalAction::Handler(_))
    ));
}

#[test]
fn raise_with_default_action_exits_with_code_three() {
    let registry = active_registry();
    let code = catch_exit(|| {
        let _ = registry.raise(Signal::Abrt.as_raw());
    });
    assert_eq!(code, Some(DEFAULT_ACTION_EXIT_CODE));
}

#[test]
fn ignored_signal_stays_ignored_across_raises() {
    let registry = active_registry();
    let int = Signal::Int.as_raw();
    registry.install(int, SignalAction::Ignore).expect("install");
    assert_eq!(registry.raise(int), Ok(()));
    assert_eq!(registry.raise(int), Ok(()));
    assert_eq!(registry.action(Signal::Int), SignalAction::Ignore);
}

#[test]
fn handler_is_reset_to_default_before_invocation() {
    let registry = active_registry();
    let term = Signal::Term.as_raw();
    registry
        .install(term, SignalAction::Handler(log_signal))
        .expect("install");

    assert_eq!(registry.raise(term), Ok(()));
    assert_eq!(take_events(), vec!["Term None None"]);
    assert_eq!(registry.action(Signal::Term), SignalAction::Default);

    let code = catch_exit(|| {
        let _ = registry.raise(term);
    });
    assert_eq!(code, Some(DEFAULT_ACTION_EXIT_CODE));
    assert!(take_events().is_empty());
}

#[test]
fn explicit_fpe_raise_passes_explicit_gen() {
    let registry = active_registry();
    let fpe = Signal::Fpe.as_raw();
    registry
        .install(fpe, SignalAction::Handler(log_signal))
        .expect("install");
    registry.raise(fpe).expect("raise");
    assert_eq!(take_events(), vec!["Fpe Some(ExplicitGen) None"]);
}

#[test]
fn console_events_do_not_reset_handlers() {
    let registry = active_registry();
    assert!(!registry.console_event(ConsoleEvent::CtrlC));

    registry
        .install(Signal::Int.as_raw(), SignalAction::Handler(log_signal))
        .expect("install");
    registry
        .install(Signal::Break.as_raw(), SignalAction::Ignore)
        .expect("install");

    assert!(registry.console_event(ConsoleEvent::CtrlC));
    assert!(registry.console_event(ConsoleEvent::CtrlC));
    assert!(registry.console_event(ConsoleEvent::CtrlBreak));
    assert_eq!(take_events(), vec!["Int None None", "Int None None"]);
    assert!(matches!(
        registry.action(Signal::Int),
        SignalAction::Handler(_)
    ));
}

fn filter_with(registry: &SignalRegistry, record: &ExceptionRecord) -> FilterResult {
    let context = Context::default();
    let pointers = ExceptionPointers {
        record,
        context: &context,
    };
    exception_filter(registry, &pointers)
}

#[test]
fn filter_translates_access_violation_to_segv_handler() {
    let registry = active_registry();
    let av = ExceptionRecord::access_violation(0x1000, false, 0x10);
    assert_eq!(filter_with(&registry, &av), FilterResult::ContinueSearch);

    registry
        .install(Signal::Segv.as_raw(), SignalAction::Handler(log_signal))
        .expect("install");
    assert_eq!(filter_with(&registry, &av), FilterResult::ContinueExecution);
    assert_eq!(take_events(), vec!["Segv None Some(c0000005)"]);
    assert_eq!(current_exception(), None);
    assert_eq!(registry.action(Signal::Segv), SignalAction::Default);
}

#[test]
fn filter_passes_mapped_fpe_code() {
    let registry = active_registry();
    registry
        .install(Signal::Fpe.as_raw(), SignalAction::Handler(log_signal))
        .expect("install");
    let record = ExceptionRecord::new(STATUS_FLOAT_DIVIDE_BY_ZERO, 0, 0, &[]);
    assert_eq!(filter_with(&registry, &record), FilterResult::ContinueExecution);

    registry
        .install(Signal::Fpe.as_raw(), SignalAction::Handler(log_signal))
        .expect("install");
    let record = ExceptionRecord::new(STATUS_FLOAT_UNDERFLOW, 0, 0, &[]);
    assert_eq!(filter_with(&registry, &record), FilterResult::ContinueExecution);

    assert_eq!(
        take_events(),
        vec![
            "Fpe Some(ZeroDivide) Some(c000008e)",
            "Fpe Some(Underflow) Some(c0000093)"
        ]
    );
}

#[test]
fn filter_ignores_codes_without_signal() {
    let registry = active_registry();
    registry
        .install(Signal::Ill.as_raw(), SignalAction::Ignore)
        .expect("install");
    let breakpoint = ExceptionRecord::new(STATUS_BREAKPOINT, 0, 0, &[]);
    assert_eq!(filter_with(&registry, &breakpoint), FilterResult::ContinueSearch);

    let privileged = ExceptionRecord::new(STATUS_PRIVILEGED_INSTRUCTION, 0, 0, &[]);
    assert_eq!(filter_with(&registry, &privileged), FilterResult::ContinueExecution);
}

#[test]
fn xcpt_filter_requires_matching_code() {
    let registry = active_registry();
    registry
        .install(Signal::Segv.as_raw(), SignalAction::Ignore)
        .expect("install");
    let av = ExceptionRecord::access_violation(0, true, 0);
    let context = Context::default();
    let pointers = ExceptionPointers {
        record: &av,
        context: &context,
    };
    assert_eq!(
        xcpt_filter(&registry, STATUS_BREAKPOINT, &pointers),
        FilterResult::ContinueSearch
    );
    assert_eq!(
        xcpt_filter(&registry, STATUS_ACCESS_VIOLATION, &pointers),
        FilterResult::ContinueExecution
    );
}

#[test]
fn faults_map_to_exception_records() {
    let segv = record_from_fault(&FaultInfo {
        signum: libc::SIGSEGV,
        code: 2,
        address: 0xdead_0000,
        pc: 0x4000,
        write: true,
    });
    assert_eq!(segv.code, STATUS_ACCESS_VIOLATION);
    assert_eq!(segv.address, 0x4000);
    assert_eq!(segv.params(), &[1, 0xdead_0000]);

    let misaligned = record_from_fault(&FaultInfo {
        signum: libc::SIGBUS,
        code: 1,
        ..FaultInfo::default()
    });
    assert_eq!(misaligned.code, STATUS_DATATYPE_MISALIGNMENT);

    let divide = record_from_fault(&FaultInfo {
        signum: libc::SIGFPE,
        code: 1,
        ..FaultInfo::default()
    });
    assert_eq!(divide.code, STATUS_INTEGER_DIVIDE_BY_ZERO);

    let privileged = record_from_fault(&FaultInfo {
        signum: libc::SIGILL,
        code: 5,
        ..FaultInfo::default()
    });
    assert_eq!(privileged.code, STATUS_PRIVILEGED_INSTRUCTION);
}
