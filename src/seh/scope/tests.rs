// scope table 编码、解码与校验的单元测试
use super::{
    EncodedScope, ScopeEntry, ScopeTable, ScopeTableV4, SecurityCookie, TRYLEVEL_END,
    TRYLEVEL_TOP, decode_scope_v4,
};
use crate::errno::Errno;
use crate::seh::{ExceptionPointers, FilterResult};

fn accept(_pointers: &ExceptionPointers<'_>, _data: usize) -> FilterResult {
    FilterResult::ExecuteHandler
}

fn body(_data: usize) {}

fn cleanup(_data: usize) {}

static V3_ENTRIES: [ScopeEntry; 2] = [
    ScopeEntry::except(TRYLEVEL_TOP, accept, body),
    ScopeEntry::finally(0, cleanup),
];
static V3_TABLE: ScopeTable = ScopeTable::new(&V3_ENTRIES);

static V4_ENTRIES: [ScopeEntry; 2] = [
    ScopeEntry::except(TRYLEVEL_END, accept, body),
    ScopeEntry::finally(0, cleanup),
];
static V4_TABLE: ScopeTableV4 = ScopeTableV4::new(&V4_ENTRIES);

static TEST_COOKIE: SecurityCookie = SecurityCookie::new(0x1234_5678);

#[test]
fn v3_and_v4_tables_expose_same_levels() {
    let v3: Vec<_> = V3_TABLE.view().levels().collect();
    let v4: Vec<_> = V4_TABLE.view().levels().collect();
    assert_eq!(v3, v4);
    assert_eq!(v3[0].previous, None);
    assert_eq!(v3[1].previous, Some(0));
    assert!(v3[0].has_filter);
    assert!(!v3[1].has_filter);
}

#[test]
fn encoded_v4_pointer_decodes_with_cookie() {
    let encoded = EncodedScope::v4(&V4_TABLE, &TEST_COOKIE);
    let EncodedScope::V4 { encoded: raw, .. } = encoded else {
        panic!("expected v4 encoding");
    };
    assert_ne!(raw, &V4_TABLE as *const ScopeTableV4 as usize);

    let decoded = unsafe { decode_scope_v4(raw, 0x1234_5678) };
    assert!(std::ptr::eq(decoded, &V4_TABLE));
    assert_eq!(encoded.view().end(), TRYLEVEL_END);
    assert_eq!(encoded.view().len(), 2);
    assert!(!V4_TABLE.has_gs_cookie());
}

#[test]
fn valid_levels_include_end_marker() {
    let view = V3_TABLE.view();
    assert!(view.is_valid_level(TRYLEVEL_TOP));
    assert!(view.is_valid_level(1));
    assert!(!view.is_valid_level(2));
    assert!(!view.is_valid_level(TRYLEVEL_END));
    assert!(view.entry(1).is_some_and(ScopeEntry::is_finally));
}

#[test]
fn validate_rejects_cycles_and_dangling_levels() {
    static CYCLE: [ScopeEntry; 2] = [
        ScopeEntry::finally(1, cleanup),
        ScopeEntry::finally(0, cleanup),
    ];
    static DANGLING: [ScopeEntry; 1] = [ScopeEntry::finally(5, cleanup)];

    assert_eq!(V3_TABLE.view().validate(), Ok(()));
    assert_eq!(ScopeTable::new(&CYCLE).view().validate(), Err(Errno::Format));
    assert_eq!(ScopeTable::new(&DANGLING).view().validate(), Err(Errno::BadTryLevel));
}
