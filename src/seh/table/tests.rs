// 查表式 SEH 的解析、分发与目标 unwind 的单元测试
use super::{
    CScopeEntry, CScopeTable, CodeTable, EXCEPTION_EXECUTE_HANDLER_RVA, TerminationHandler,
    protect_table,
};
use crate::errno::Errno;
use crate::seh::{
    ExceptionPointers, FilterResult, Handled, ScopeFilter, ScopeHandler, chain_depth,
    raise_exception,
};
use crate::test_support::{record, take_events};

const E1: u32 = 0xE000_0021;

fn entry(begin: u32, end: u32, handler: u32, jump_target: u32) -> CScopeEntry {
    CScopeEntry {
        begin_address: begin,
        end_address: end,
        handler_address: handler,
        jump_target,
    }
}

#[test]
fn parse_reads_little_endian_entries() {
    let mut data = Vec::new();
    data.extend_from_slice(&2u32.to_le_bytes());
    for value in [0x1000u32, 0x1080, 0x2000, 0x1090, 0x1010, 0x1040, 0x3000, 0] {
        data.extend_from_slice(&value.to_le_bytes());
    }

    let table = CScopeTable::parse(&data).expect("parse");
    assert_eq!(table.count, 2);
    assert_eq!(table.entries[0], entry(0x1000, 0x1080, 0x2000, 0x1090));
    assert!(table.entries[0].is_except());
    assert!(table.entries[1].is_finally());
    assert!(table.entries[1].contains(0x1010));
    assert!(!table.entries[1].contains(0x1040));
}

#[test]
fn parse_rejects_truncated_data() {
    assert_eq!(CScopeTable::parse(&[1, 0]), Err(Errno::Format));

    let mut data = Vec::new();
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&[0u8; 12]);
    assert_eq!(CScopeTable::parse(&data), Err(Errno::Format));
}

fn filter_outer(_pointers: &ExceptionPointers<'_>, _data: usize) -> FilterResult {
    record("filter");
    FilterResult::ExecuteHandler
}

fn filter_decline(_pointers: &ExceptionPointers<'_>, _data: usize) -> FilterResult {
    record("decline");
    FilterResult::ContinueSearch
}

fn finally_inner(abnormal: bool, _data: usize) {
    record(format!("inner:{}", abnormal));
}

fn finally_wide(abnormal: bool, _data: usize) {
    record(format!("wide:{}", abnormal));
}

fn landing(data: usize) {
    record(format!("landing:{}", data));
}

static FILTERS: [(u32, ScopeFilter); 2] = [(0x2000, filter_outer), (0x2100, filter_decline)];
static TERMINATIONS: [(u32, TerminationHandler); 2] =
    [(0x2200, finally_inner), (0x2300, finally_wide)];
static LANDINGS: [(u32, ScopeHandler); 2] = [(0x1900, landing), (0x1950, landing)];
static CODE: CodeTable = CodeTable::new(&FILTERS, &TERMINATIONS, &LANDINGS);

// 0x1000..0x1800 __except(filter_outer) -> 0x1900
//   0x1100..0x1400 __except(filter_decline) -> 0x1950
//     0x1200..0x1300 __finally(finally_inner)
//   0x1000..0x1800 内还有一个包含落地点的 __finally(finally_wide)，目标 unwind 不执行它
fn nested_table() -> CScopeTable {
    CScopeTable::new(vec![
        entry(0x1200, 0x1300, 0x2200, 0),
        entry(0x1100, 0x1400, 0x2100, 0x1950),
        entry(0x1000, 0x1800, 0x2000, 0x1900),
        entry(0x1050, 0x1a00, 0x2300, 0),
    ])
}

#[test]
fn accepted_scope_unwinds_inner_finally_and_lands() {
    let table = nested_table();
    let result = protect_table(&table, &CODE, 7, |scope| {
        scope.set_pc(0x1250);
        raise_exception(E1, 0, &[]);
        record("not reached");
    });

    assert_eq!(result.handled(), Some(Handled { level: 2, code: E1 }));
    assert_eq!(
        take_events(),
        vec!["decline", "filter", "inner:true", "landing:7"]
    );
    assert_eq!(chain_depth(), 0);
}

#[test]
fn constant_execute_handler_skips_filter_call() {
    let table = CScopeTable::new(vec![entry(
        0x1000,
        0x1100,
        EXCEPTION_EXECUTE_HANDLER_RVA,
        0x1900,
    )]);
    let result = protect_table(&table, &CODE, 1, |scope| {
        scope.set_pc(0x1010);
        raise_exception(E1, 0, &[]);
    });

    assert_eq!(result.handled(), Some(Handled { level: 0, code: E1 }));
    assert_eq!(take_events(), vec!["landing:1"]);
}

#[test]
fn pc_outside_scopes_is_not_handled_here() {
    let outer = CScopeTable::new(vec![entry(
        0x1000,
        0x1100,
        EXCEPTION_EXECUTE_HANDLER_RVA,
        0x1950,
    )]);
    let inner = nested_table();
    let result = protect_table(&outer, &CODE, 2, |outer_scope| {
        outer_scope.set_pc(0x1000);
        protect_table(&inner, &CODE, 3, |scope| {
            scope.set_pc(0x1f00);
            raise_exception(E1, 0, &[]);
        });
    });

    assert_eq!(result.handled(), Some(Handled { level: 0, code: E1 }));
    assert_eq!(take_events(), vec!["landing:2"]);
}

#[test]
fn leave_runs_finally_with_normal_termination() {
    let table = nested_table();
    let result = protect_table(&table, &CODE, 0, |scope| {
        scope.set_pc(0x1250);
        scope.leave(0x1350);
        scope.pc()
    });

    assert_eq!(result.completed(), Some(0x1350));
    assert_eq!(take_events(), vec!["inner:false"]);
}
