use msvcrt_seh::{
    CScopeEntry, CScopeTable, CodeTable, EXCEPTION_EXECUTE_HANDLER_RVA, ExceptionPointers,
    FilterResult, Handled, SECURITY_COOKIE, ScopeEntry, ScopeFilter, ScopeHandler, ScopeTable,
    ScopeTableV4, TRYLEVEL_END, TRYLEVEL_TOP, TerminationHandler, abnormal_termination,
    chain_depth, local_unwind2, protect, protect_table, protect_v4, raise_exception,
};

use crate::test_ctx::{record, take_events};

const E_APP: u32 = 0xE000_1001;

fn accept(pointers: &ExceptionPointers<'_>, data: usize) -> FilterResult {
    record(format!("filter{data}:{:#x}", pointers.record.code));
    FilterResult::ExecuteHandler
}

fn decline(_pointers: &ExceptionPointers<'_>, data: usize) -> FilterResult {
    record(format!("decline{data}"));
    FilterResult::ContinueSearch
}

fn except_block(data: usize) {
    record(format!("except{data}"));
}

fn finally_block(data: usize) {
    record(format!("finally{data}:{}", abnormal_termination()));
}

static EXCEPT: [ScopeEntry; 1] = [ScopeEntry::except(TRYLEVEL_TOP, accept, except_block)];
static EXCEPT_TABLE: ScopeTable = ScopeTable::new(&EXCEPT);
static FINALLY: [ScopeEntry; 1] = [ScopeEntry::finally(TRYLEVEL_TOP, finally_block)];
static FINALLY_TABLE: ScopeTable = ScopeTable::new(&FINALLY);

pub fn scenario_try_except() {
    let result = protect(&EXCEPT_TABLE, 1, |frame| {
        frame.enter(0);
        raise_exception(E_APP, 0, &[7, 8]);
        record("not reached");
    });
    assert_eq!(
        result.handled(),
        Some(Handled {
            level: 0,
            code: E_APP
        })
    );
    assert_eq!(take_events(), vec!["filter1:0xe0001001", "except1"]);
    assert_eq!(chain_depth(), 0);
}

pub fn scenario_finally_order() {
    let completed = protect(&FINALLY_TABLE, 1, |outer| {
        outer.enter(0);
        protect(&FINALLY_TABLE, 2, |inner| {
            inner.enter(0);
            inner.leave();
        });
        outer.leave();
        "done"
    });
    assert_eq!(completed.completed(), Some("done"));
    assert_eq!(take_events(), vec!["finally2:false", "finally1:false"]);

    let handled = protect(&EXCEPT_TABLE, 3, |outer| {
        outer.enter(0);
        protect(&FINALLY_TABLE, 4, |middle| {
            middle.enter(0);
            protect(&FINALLY_TABLE, 5, |inner| {
                inner.enter(0);
                raise_exception(E_APP, 0, &[]);
            });
        });
    });
    assert!(handled.handled().is_some());
    assert_eq!(
        take_events(),
        vec![
            "filter3:0xe0001001",
            "finally5:true",
            "finally4:true",
            "except3"
        ]
    );
}

pub fn scenario_filter_veto() {
    static ENTRIES: [ScopeEntry; 2] = [
        ScopeEntry::except(TRYLEVEL_TOP, accept, except_block),
        ScopeEntry::except(0, decline, except_block),
    ];
    static TABLE: ScopeTable = ScopeTable::new(&ENTRIES);

    let result = protect(&TABLE, 6, |frame| {
        frame.enter(0);
        frame.enter(1);
        raise_exception(E_APP, 0, &[]);
    });
    assert_eq!(
        result.handled(),
        Some(Handled {
            level: 0,
            code: E_APP
        })
    );
    assert_eq!(
        take_events(),
        vec!["decline6", "filter6:0xe0001001", "except6"]
    );
}

pub fn scenario_v4_cookie_frame() {
    static ENTRIES: [ScopeEntry; 2] = [
        ScopeEntry::except(TRYLEVEL_END, accept, except_block),
        ScopeEntry::finally(0, finally_block),
    ];
    static TABLE: ScopeTableV4 = ScopeTableV4::new(&ENTRIES);

    let result = protect_v4(&TABLE, &SECURITY_COOKIE, 7, |frame| {
        assert_eq!(frame.trylevel(), TRYLEVEL_END);
        frame.enter(0);
        frame.enter(1);
        raise_exception(E_APP, 0, &[]);
    });
    assert!(result.handled().is_some());
    assert_eq!(
        take_events(),
        vec!["filter7:0xe0001001", "finally7:true", "except7"]
    );
}

fn table_filter(_pointers: &ExceptionPointers<'_>, data: usize) -> FilterResult {
    record(format!("table-filter{data}"));
    FilterResult::ExecuteHandler
}

fn table_finally(abnormal: bool, data: usize) {
    record(format!("table-finally{data}:{abnormal}"));
}

fn table_landing(data: usize) {
    record(format!("landing{data}"));
}

static FILTERS: [(u32, ScopeFilter); 1] = [(0x2000, table_filter)];
static TERMINATIONS: [(u32, TerminationHandler); 1] = [(0x2100, table_finally)];
static LANDINGS: [(u32, ScopeHandler); 1] = [(0x1800, table_landing)];
static CODE: CodeTable = CodeTable::new(&FILTERS, &TERMINATIONS, &LANDINGS);

fn scope(begin: u32, end: u32, handler: u32, jump_target: u32) -> CScopeEntry {
    CScopeEntry {
        begin_address: begin,
        end_address: end,
        handler_address: handler,
        jump_target,
    }
}

pub fn scenario_table_frame() {
    let table = CScopeTable::new(vec![
        scope(0x1100, 0x1200, 0x2100, 0),
        scope(0x1000, 0x1400, 0x2000, 0x1800),
    ]);
    let result = protect_table(&table, &CODE, 8, |frame| {
        frame.set_pc(0x1150);
        raise_exception(E_APP, 0, &[]);
    });
    assert_eq!(
        result.handled(),
        Some(Handled {
            level: 1,
            code: E_APP
        })
    );
    assert_eq!(
        take_events(),
        vec!["table-filter8", "table-finally8:true", "landing8"]
    );

    let constant = CScopeTable::new(vec![scope(0x1000, 0x1400, EXCEPTION_EXECUTE_HANDLER_RVA, 0x1800)]);
    let result = protect_table(&constant, &CODE, 9, |frame| {
        frame.set_pc(0x1010);
        raise_exception(E_APP, 0, &[]);
    });
    assert!(result.handled().is_some());
    assert_eq!(take_events(), vec!["landing9"]);
}

pub fn scenario_local_unwind() {
    static ENTRIES: [ScopeEntry; 2] = [
        ScopeEntry::finally(TRYLEVEL_TOP, finally_block),
        ScopeEntry::finally(0, finally_block),
    ];
    static TABLE: ScopeTable = ScopeTable::new(&ENTRIES);

    protect(&TABLE, 10, |frame| {
        frame.enter(0);
        frame.enter(1);
        local_unwind2(frame, 0);
        assert_eq!(frame.trylevel(), 0);
        frame.leave();
    });
    assert_eq!(take_events(), vec!["finally10:true", "finally10:false"]);
}
