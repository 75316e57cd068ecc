// setjmp/longjmp 与帧链协作的单元测试
use super::{
    I386JumpBuffer, JMP_MAGIC, JumpBuffer, MachineContext, SehImage, SetJmp, X64JumpBuffer,
    longjmp, seh_longjmp_unwind, setjmp, setjmp3,
};
use crate::machine::Context;
use crate::runtime::thread_state::with_thread_state;
use crate::seh::{
    ExceptionPointers, FilterResult, Handled, ScopeEntry, ScopeTable, TRYLEVEL_END, TRYLEVEL_TOP,
    abnormal_termination, chain_depth, protect, raise_exception,
};
use crate::test_support::{record, take_events};
use std::mem::{offset_of, size_of};

fn live_targets() -> usize {
    with_thread_state(|state| state.jump_targets().len()).unwrap_or(0)
}

fn log_finally(data: usize) {
    record(format!("fin{}:{}", data, abnormal_termination()));
}

static FINALLY: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, log_finally)];
static FINALLY_TABLE: ScopeTable = ScopeTable::new(&FINALLY);
static TWO_FINALLY: [ScopeEntry; 2] = [
    ScopeEntry::finally(TRYLEVEL_TOP, log_finally),
    ScopeEntry::finally(0, log_finally),
];
static TWO_FINALLY_TABLE: ScopeTable = ScopeTable::new(&TWO_FINALLY);

#[test]
fn setjmp_without_longjmp_returns_body_value() {
    let result = setjmp(|buf| {
        assert!(!buf.has_registration());
        assert_eq!(buf.trylevel(), TRYLEVEL_END);
        assert_eq!(buf.cookie(), 0);
        41 + 1
    });
    assert_eq!(result, SetJmp::Captured(42));
    assert_eq!(live_targets(), 0);
}

#[test]
fn longjmp_value_zero_is_seen_as_one() {
    let zero = setjmp(|buf| {
        longjmp(buf, 0);
    });
    assert_eq!(zero.resumed(), Some(1));

    let five = setjmp(|buf| {
        longjmp(buf, 5);
    });
    assert_eq!(five.resumed(), Some(5));
    assert_eq!(live_targets(), 0);
}

#[test]
fn longjmp_runs_inner_frames_cleanups_innermost_first() {
    let result = protect(&FINALLY_TABLE, 0, |outer| {
        outer.enter(0);
        let jumped = setjmp(|buf| {
            protect(&FINALLY_TABLE, 1, |inner| {
                inner.enter(0);
                protect(&FINALLY_TABLE, 2, |innermost| {
                    innermost.enter(0);
                    longjmp(buf, 3);
                });
            });
        });
        assert_eq!(chain_depth(), 1);
        assert_eq!(outer.trylevel(), 0);
        outer.leave();
        jumped.resumed()
    });

    assert_eq!(result.completed(), Some(Some(3)));
    assert_eq!(take_events(), vec!["fin2:true", "fin1:true", "fin0:false"]);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn longjmp_unwinds_capture_frame_to_captured_trylevel() {
    let result = protect(&TWO_FINALLY_TABLE, 7, |frame| {
        frame.enter(0);
        let jumped = setjmp(|buf| {
            assert_eq!(buf.trylevel(), 0);
            frame.enter(1);
            longjmp(buf, 9);
        });
        record(format!("resumed {:?} level {}", jumped.resumed(), frame.trylevel()));
        frame.leave();
        frame.trylevel()
    });

    assert_eq!(result.completed(), Some(TRYLEVEL_TOP));
    assert_eq!(
        take_events(),
        vec!["fin7:true", "resumed Some(9) level 0", "fin7:false"]
    );
}

fn custom_unwind(buf: &JumpBuffer) {
    record(format!(
        "custom level={} data={:?}",
        buf.trylevel(),
        &buf.unwind_data()[..2]
    ));
}

#[test]
fn setjmp3_calls_explicit_unwind_function_instead_of_local_unwind() {
    protect(&TWO_FINALLY_TABLE, 4, |frame| {
        frame.enter(0);
        let jumped = setjmp3(Some(custom_unwind), Some(0), &[11, 22], |buf| {
            assert_eq!(buf.cookie(), JMP_MAGIC);
            frame.enter(1);
            longjmp(buf, 1);
        });
        assert_eq!(jumped.resumed(), Some(1));
        // 自定义 unwind 函数没有回退 trylevel
        assert_eq!(frame.trylevel(), 1);
        frame.enter(0);
        frame.leave();
    });

    assert_eq!(take_events(), vec!["custom level=0 data=[11, 22]", "fin4:false"]);
}

#[test]
fn setjmp3_with_stock_unwind_function_runs_finally() {
    protect(&TWO_FINALLY_TABLE, 5, |frame| {
        frame.enter(0);
        let jumped = setjmp3(Some(seh_longjmp_unwind), None, &[], |buf| {
            frame.enter(1);
            longjmp(buf, 2);
        });
        assert_eq!(jumped.resumed(), Some(2));
        assert_eq!(frame.trylevel(), 0);
        frame.unwind_to(TRYLEVEL_TOP);
    });

    assert_eq!(take_events(), vec!["fin5:true", "fin5:true"]);
}

#[test]
fn setjmp3_without_unwind_function_skips_local_unwind() {
    protect(&TWO_FINALLY_TABLE, 6, |frame| {
        frame.enter(0);
        let jumped = setjmp3(None, None, &[], |buf| {
            frame.enter(1);
            longjmp(buf, 2);
        });
        assert_eq!(jumped.resumed(), Some(2));
        assert_eq!(frame.trylevel(), 1);
        frame.leave();
        frame.leave();
    });

    assert_eq!(take_events(), vec!["fin6:false", "fin6:false"]);
}

#[test]
fn longjmp_to_outer_capture_bypasses_inner_capture() {
    let result = setjmp(|outer| -> i32 {
        let _ = setjmp(|_inner| {
            assert_eq!(live_targets(), 2);
            protect(&FINALLY_TABLE, 8, |frame| {
                frame.enter(0);
                longjmp(outer, 4);
            });
        });
        record("not reached");
        0
    });

    assert_eq!(result.resumed(), Some(4));
    assert_eq!(take_events(), vec!["fin8:true"]);
    assert_eq!(live_targets(), 0);
    assert_eq!(chain_depth(), 0);
}

#[test]
fn jump_buffer_layouts_match_documented_offsets() {
    assert_eq!(size_of::<I386JumpBuffer>(), 64);
    assert_eq!(offset_of!(I386JumpBuffer, eip), 20);
    assert_eq!(offset_of!(I386JumpBuffer, registration), 24);
    assert_eq!(offset_of!(I386JumpBuffer, cookie), 32);
    assert_eq!(offset_of!(I386JumpBuffer, unwind_data), 40);

    assert_eq!(size_of::<X64JumpBuffer>(), 256);
    assert_eq!(offset_of!(X64JumpBuffer, rsp), 0x10);
    assert_eq!(offset_of!(X64JumpBuffer, rip), 0x50);
    assert_eq!(offset_of!(X64JumpBuffer, mxcsr), 0x58);
    assert_eq!(offset_of!(X64JumpBuffer, xmm), 0x60);
}

#[test]
fn machine_contexts_restore_saved_registers() {
    let context = Context {
        pc: 0x1234,
        sp: 0x8000,
        fp: 0x8040,
    };
    let seh = SehImage {
        registration: 0x7000,
        trylevel: 2,
        cookie: JMP_MAGIC,
        unwind_func: 0,
        unwind_data: [1, 2, 3, 4, 5, 6],
    };

    let mut i386 = I386JumpBuffer::default();
    i386.save(&context, &seh);
    assert_eq!(i386.registration, 0x7000);
    assert_eq!(i386.try_level, 2);
    assert_eq!(i386.unwind_data, [1, 2, 3, 4, 5, 6]);
    let resume = i386.restore(0);
    assert_eq!((resume.pc, resume.sp, resume.fp), (0x1234, 0x8000, 0x8040));
    assert_eq!(resume.value.get(), 1);

    let mut x64 = X64JumpBuffer::default();
    x64.save(&context, &seh);
    assert_eq!(x64.frame, 0x7000);
    let resume = x64.restore(-3);
    assert_eq!((resume.pc, resume.sp, resume.fp), (0x1234, 0x8000, 0x8040));
    assert_eq!(resume.value.get(), -3);
}

#[test]
fn x64_buffer_records_floating_point_control_words() {
    let mut x64 = X64JumpBuffer::default();
    x64.save(&Context::default(), &SehImage::default());
    // 默认环境下所有浮点异常都被屏蔽
    assert_eq!(x64.mxcsr & 0x1F80, 0x1F80);
    assert_eq!(x64.fpcsr & 0x3F, 0x3F);
}

const CLEANUP_RAISED: u32 = 0xE000_0021;

fn accept_all(_pointers: &ExceptionPointers<'_>, _data: usize) -> FilterResult {
    FilterResult::ExecuteHandler
}

fn log_except(data: usize) {
    record(format!("except{}", data));
}

fn raising_finally(data: usize) {
    record(format!("raise{}", data));
    raise_exception(CLEANUP_RAISED, 0, &[]);
}

static EXCEPT: [ScopeEntry; 1] = [ScopeEntry::except(TRYLEVEL_TOP, accept_all, log_except)];
static EXCEPT_TABLE: ScopeTable = ScopeTable::new(&EXCEPT);
static RAISING_INNER: [ScopeEntry; 2] = [
    ScopeEntry::finally(TRYLEVEL_TOP, log_finally),
    ScopeEntry::finally(0, raising_finally),
];
static RAISING_INNER_TABLE: ScopeTable = ScopeTable::new(&RAISING_INNER);

#[test]
fn cleanup_raising_during_longjmp_still_runs_outer_levels() {
    let result = protect(&EXCEPT_TABLE, 1, |outer| {
        outer.enter(0);
        protect(&RAISING_INNER_TABLE, 2, |frame| {
            frame.enter(0);
            let _ = setjmp(|buf| {
                frame.enter(1);
                longjmp(buf, 1);
            });
            record("not reached");
        });
    });

    assert_eq!(
        result.handled(),
        Some(Handled {
            level: 0,
            code: CLEANUP_RAISED
        })
    );
    assert_eq!(take_events(), vec!["raise2", "fin2:true", "except1"]);
    assert_eq!(live_targets(), 0);
    assert_eq!(chain_depth(), 0);
}
