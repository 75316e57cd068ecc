// scope table：每个 try 层级对应一条 (上级层级, 过滤器, handler) 记录
//
// v3 表以 -1 作为链尾，v4 表以 -2 作为链尾并携带 GS/EH cookie 偏移，
// 且帧里保存的是与安全 cookie 异或后的表指针。
use super::{ExceptionPointers, FilterResult, fatal};
use crate::errno::Errno;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const TRYLEVEL_TOP: i32 = -1;
pub const TRYLEVEL_END: i32 = -2;
pub const NO_GS_COOKIE: i32 = -2;
pub const DEFAULT_SECURITY_COOKIE: usize = 0xBB40_E64E;

/// 过滤器：(异常指针, 帧数据) -> 处理结果
pub type ScopeFilter = fn(&ExceptionPointers<'_>, usize) -> FilterResult;
/// except 块或 termination handler 体，参数为帧数据
pub type ScopeHandler = fn(usize);

/// 一个 try 层级；`filter` 为 `None` 时是 try/finally，否则是 try/except
#[derive(Clone, Copy, Debug)]
pub struct ScopeEntry {
    pub previous: i32,
    pub filter: Option<ScopeFilter>,
    pub handler: ScopeHandler,
}

impl ScopeEntry {
    pub const fn except(previous: i32, filter: ScopeFilter, handler: ScopeHandler) -> Self {
        Self {
            previous,
            filter: Some(filter),
            handler,
        }
    }

    pub const fn finally(previous: i32, handler: ScopeHandler) -> Self {
        Self {
            previous,
            filter: None,
            handler,
        }
    }

    pub const fn is_finally(&self) -> bool {
        self.filter.is_none()
    }
}

#[derive(Debug)]
pub struct ScopeTable {
    entries: &'static [ScopeEntry],
}

impl ScopeTable {
    pub const fn new(entries: &'static [ScopeEntry]) -> Self {
        Self { entries }
    }

    pub fn view(&self) -> ScopeView<'static> {
        ScopeView {
            entries: self.entries,
            end: TRYLEVEL_TOP,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct ScopeTableV4 {
    pub gs_cookie_offset: i32,
    pub gs_cookie_xor_offset: u32,
    pub eh_cookie_offset: i32,
    pub eh_cookie_xor_offset: u32,
    entries: &'static [ScopeEntry],
}

impl ScopeTableV4 {
    pub const fn new(entries: &'static [ScopeEntry]) -> Self {
        Self::with_cookies(NO_GS_COOKIE, 0, 0, 0, entries)
    }

    pub const fn with_cookies(
        gs_cookie_offset: i32,
        gs_cookie_xor_offset: u32,
        eh_cookie_offset: i32,
        eh_cookie_xor_offset: u32,
        entries: &'static [ScopeEntry],
    ) -> Self {
        Self {
            gs_cookie_offset,
            gs_cookie_xor_offset,
            eh_cookie_offset,
            eh_cookie_xor_offset,
            entries,
        }
    }

    pub const fn has_gs_cookie(&self) -> bool {
        self.gs_cookie_offset != NO_GS_COOKIE
    }

    pub fn view(&self) -> ScopeView<'static> {
        ScopeView {
            entries: self.entries,
            end: TRYLEVEL_END,
        }
    }
}

/// 进程安全 cookie，v4 帧用它编码 scope table 指针
#[derive(Debug)]
pub struct SecurityCookie(AtomicUsize);

impl SecurityCookie {
    pub const fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

pub static SECURITY_COOKIE: SecurityCookie = SecurityCookie::new(DEFAULT_SECURITY_COOKIE);

/// 用给定 cookie 解码 v4 帧中保存的表指针
///
/// # Safety
/// `encoded ^ cookie` 必须是一个存活的 `ScopeTableV4` 的地址。
pub unsafe fn decode_scope_v4<'a>(encoded: usize, cookie: usize) -> &'a ScopeTableV4 {
    unsafe { &*((encoded ^ cookie) as *const ScopeTableV4) }
}

// 帧中保存的 scope table 引用
#[derive(Clone, Copy)]
pub(crate) enum EncodedScope {
    V3(&'static ScopeTable),
    V4 {
        encoded: usize,
        cookie: &'static SecurityCookie,
    },
}

impl EncodedScope {
    pub(crate) fn v4(table: &'static ScopeTableV4, cookie: &'static SecurityCookie) -> Self {
        Self::V4 {
            encoded: table as *const ScopeTableV4 as usize ^ cookie.get(),
            cookie,
        }
    }

    pub(crate) fn view(&self) -> ScopeView<'static> {
        match *self {
            Self::V3(table) => table.view(),
            Self::V4 { encoded, cookie } => unsafe { decode_scope_v4(encoded, cookie.get()) }.view(),
        }
    }
}

/// 解码后的 scope table，对 v3/v4 提供一致的访问方式
#[derive(Clone, Copy, Debug)]
pub struct ScopeView<'a> {
    entries: &'a [ScopeEntry],
    end: i32,
}

/// 与编码无关的层级描述，`previous` 为 `None` 表示外层已无 try
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScopeLevel {
    pub previous: Option<usize>,
    pub has_filter: bool,
    pub handler: usize,
}

impl<'a> ScopeView<'a> {
    pub fn end(&self) -> i32 {
        self.end
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, level: i32) -> Option<&'a ScopeEntry> {
        usize::try_from(level).ok().and_then(|idx| self.entries.get(idx))
    }

    // trylevel 越界说明帧状态已损坏，无法继续
    pub(crate) fn entry_or_die(&self, level: i32) -> &'a ScopeEntry {
        match self.entry(level) {
            Some(entry) => entry,
            None => fatal(
                Errno::BadTryLevel,
                format_args!("trylevel {} 越界: entries={}", level, self.entries.len()),
            ),
        }
    }

    pub fn is_valid_level(&self, level: i32) -> bool {
        level == self.end || self.entry(level).is_some()
    }

    pub fn levels(&self) -> impl Iterator<Item = ScopeLevel> + 'a {
        let end = self.end;
        self.entries.iter().map(move |entry| ScopeLevel {
            previous: if entry.previous == end {
                None
            } else {
                usize::try_from(entry.previous).ok()
            },
            has_filter: !entry.is_finally(),
            handler: entry.handler as usize,
        })
    }

    // 每条 previous 链都必须在有限步内到达链尾
    pub fn validate(&self) -> Result<(), Errno> {
        for start in 0..self.entries.len() {
            let mut level = start as i32;
            let mut steps = 0usize;
            while level != self.end {
                let entry = self.entry(level).ok_or(Errno::BadTryLevel)?;
                steps += 1;
                if steps > self.entries.len() {
                    return Err(Errno::Format);
                }
                level = entry.previous;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
