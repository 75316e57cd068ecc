use msvcrt_seh::{
    JMP_MAGIC, JumpBuffer, ScopeEntry, ScopeTable, TRYLEVEL_TOP, abnormal_termination,
    chain_depth, longjmp, protect, seh_longjmp_unwind, setjmp, setjmp3,
};

use crate::test_ctx::{record, take_events};

fn finally_block(data: usize) {
    record(format!("finally{data}:{}", abnormal_termination()));
}

static FINALLY: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, finally_block)];
static FINALLY_TABLE: ScopeTable = ScopeTable::new(&FINALLY);
static NESTED: [ScopeEntry; 2] = [
    ScopeEntry::finally(TRYLEVEL_TOP, finally_block),
    ScopeEntry::finally(0, finally_block),
];
static NESTED_TABLE: ScopeTable = ScopeTable::new(&NESTED);

fn jump_from_depth(buf: &JumpBuffer, depth: usize) {
    if depth == 0 {
        longjmp(buf, 0);
    }
    protect(&FINALLY_TABLE, depth, |frame| {
        frame.enter(0);
        jump_from_depth(buf, depth - 1);
    });
}

pub fn scenario_longjmp_cleanup() {
    let jumped = setjmp(|buf| {
        jump_from_depth(buf, 3);
    });
    assert_eq!(jumped.resumed(), Some(1));
    assert_eq!(
        take_events(),
        vec!["finally1:true", "finally2:true", "finally3:true"]
    );
    assert_eq!(chain_depth(), 0);

    protect(&NESTED_TABLE, 4, |frame| {
        frame.enter(0);
        let jumped = setjmp(|buf| {
            frame.enter(1);
            longjmp(buf, 12);
        });
        assert_eq!(jumped.resumed(), Some(12));
        assert_eq!(frame.trylevel(), 0);
        frame.leave();
    });
    assert_eq!(take_events(), vec!["finally4:true", "finally4:false"]);
}

fn explicit_unwind(buf: &JumpBuffer) {
    record(format!(
        "unwind cookie={:#x} level={}",
        buf.cookie(),
        buf.trylevel()
    ));
    seh_longjmp_unwind(buf);
}

pub fn scenario_longjmp_extended() {
    protect(&NESTED_TABLE, 5, |frame| {
        frame.enter(0);
        let jumped = setjmp3(Some(explicit_unwind), Some(0), &[1, 2, 3], |buf| {
            assert_eq!(buf.cookie(), JMP_MAGIC);
            assert_eq!(&buf.unwind_data()[..3], &[1, 2, 3]);
            frame.enter(1);
            longjmp(buf, 3);
        });
        assert_eq!(jumped.resumed(), Some(3));
        frame.leave();
    });
    assert_eq!(
        take_events(),
        vec!["unwind cookie=0x56433230 level=0", "finally5:true", "finally5:false"]
    );

    let plain = setjmp3(None, None, &[], |buf| {
        assert!(!buf.has_registration());
        longjmp(buf, 4);
    });
    assert_eq!(plain.resumed(), Some(4));
    assert!(take_events().is_empty());
}
