mod faults;
mod frames;
mod jumps;
mod signals;
mod stress;

use crate::test_ctx::env_flag;

pub fn run_all() {
    run("try-except", frames::scenario_try_except);
    run("finally-order", frames::scenario_finally_order);
    run("filter-veto", frames::scenario_filter_veto);
    run("v4-cookie-frame", frames::scenario_v4_cookie_frame);
    run("table-frame", frames::scenario_table_frame);
    run("local-unwind", frames::scenario_local_unwind);
    run("longjmp-cleanup", jumps::scenario_longjmp_cleanup);
    run("longjmp-extended", jumps::scenario_longjmp_extended);
    run("signal-registry", signals::scenario_signal_registry);
    run("console-event", signals::scenario_console_event);
    run("raise-default-exit", signals::scenario_raise_default_exit);
    run("raise-recursion-guard", signals::scenario_raise_recursion_guard);
    run("guarded-fault-except", faults::scenario_guarded_fault_except);
    run("guarded-fault-signal", faults::scenario_guarded_fault_signal);
    run("guarded-fault-inner-frames", faults::scenario_guarded_fault_inner_frames);
    run("unhandled-fault-exit", faults::scenario_unhandled_fault_exit);
    run("unguarded-fault-forward", faults::scenario_unguarded_fault_forward);
    run("thread-isolation", stress::scenario_thread_isolation);
    if env_flag("SEH_TEST_STRESS") {
        run("concurrent-stress", stress::scenario_concurrent_stress);
    }
}

fn run(name: &str, scenario: fn()) {
    println!("scenario: {name}");
    scenario();
}
