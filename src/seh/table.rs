// 64 位查表式 SEH：按控制 PC 所在的 RVA 区间查找 __try 作用域（__C_specific_handler）
//
// scope table 布局：count(u32) 后跟 count 个 16 字节记录
// begin/end/handler/jump_target，均为小端 RVA。jump_target 为 0 表示 __finally。
use super::chain::{self, Registration, RegistrationKind};
use super::fault::run_frame_body;
use super::phase::{AbnormalScope, DispatchPhase, PhaseScope};
use super::transfer::{self, Transfer};
use super::unwind::global_unwind;
use super::{
    Disposition, EH_TARGET_UNWIND, EH_UNWINDING, ExceptionPointers, ExceptionRecord,
    FilterResult, Guarded, Handled, ScopeFilter, ScopeHandler, fatal,
};
use crate::errno::Errno;
use crate::log;
use crate::machine::Context;
use std::cell::Cell;
use std::marker::PhantomData;

// handler_address 取此值时表示常量过滤器 EXCEPTION_EXECUTE_HANDLER
pub const EXCEPTION_EXECUTE_HANDLER_RVA: u32 = 1;

const SCOPE_ENTRY_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CScopeEntry {
    pub begin_address: u32,
    pub end_address: u32,
    pub handler_address: u32,
    pub jump_target: u32,
}

impl CScopeEntry {
    pub fn is_finally(&self) -> bool {
        self.jump_target == 0
    }

    pub fn is_except(&self) -> bool {
        self.jump_target != 0
    }

    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.begin_address && rva < self.end_address
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CScopeTable {
    pub count: u32,
    pub entries: Vec<CScopeEntry>,
}

impl CScopeTable {
    pub fn new(entries: Vec<CScopeEntry>) -> Self {
        Self {
            count: entries.len() as u32,
            entries,
        }
    }

    /// 从异常数据中解析 scope table，数据不足时返回 `Errno::Format`
    pub fn parse(data: &[u8]) -> Result<Self, Errno> {
        let read_u32 = |offset: usize| -> Result<u32, Errno> {
            let bytes = data.get(offset..offset + 4).ok_or(Errno::Format)?;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            Ok(u32::from_le_bytes(buf))
        };

        let count = read_u32(0)?;
        let required = (count as usize)
            .checked_mul(SCOPE_ENTRY_SIZE)
            .and_then(|len| len.checked_add(4))
            .ok_or(Errno::Format)?;
        if data.len() < required {
            log::warn(format_args!(
                "scope table 数据不足: count={} len={} required={}",
                count,
                data.len(),
                required
            ));
            return Err(Errno::Format);
        }

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let offset = 4 + i * SCOPE_ENTRY_SIZE;
            entries.push(CScopeEntry {
                begin_address: read_u32(offset)?,
                end_address: read_u32(offset + 4)?,
                handler_address: read_u32(offset + 8)?,
                jump_target: read_u32(offset + 12)?,
            });
        }
        Ok(Self { count, entries })
    }
}

/// termination handler：(是否异常终止, 帧数据)
pub type TerminationHandler = fn(bool, usize);

/// 把 scope table 中的 RVA 解析为可调用的代码
pub trait ImageCode {
    fn filter(&self, rva: u32) -> Option<ScopeFilter>;
    fn termination(&self, rva: u32) -> Option<TerminationHandler>;
    fn landing(&self, rva: u32) -> Option<ScopeHandler>;
}

/// 以静态 (RVA, 函数) 表实现的 `ImageCode`
pub struct CodeTable {
    filters: &'static [(u32, ScopeFilter)],
    terminations: &'static [(u32, TerminationHandler)],
    landings: &'static [(u32, ScopeHandler)],
}

impl CodeTable {
    pub const fn new(
        filters: &'static [(u32, ScopeFilter)],
        terminations: &'static [(u32, TerminationHandler)],
        landings: &'static [(u32, ScopeHandler)],
    ) -> Self {
        Self {
            filters,
            terminations,
            landings,
        }
    }
}

fn lookup<T: Copy>(items: &[(u32, T)], rva: u32) -> Option<T> {
    items.iter().find(|(at, _)| *at == rva).map(|(_, item)| *item)
}

impl ImageCode for CodeTable {
    fn filter(&self, rva: u32) -> Option<ScopeFilter> {
        lookup(self.filters, rva)
    }

    fn termination(&self, rva: u32) -> Option<TerminationHandler> {
        lookup(self.terminations, rva)
    }

    fn landing(&self, rva: u32) -> Option<ScopeHandler> {
        lookup(self.landings, rva)
    }
}

#[repr(C)]
struct TableFrame<'a> {
    reg: Registration,
    table: &'a CScopeTable,
    image: &'a dyn ImageCode,
    frame_data: usize,
    control_pc: Cell<u32>,
    // unwind 已经越过的 scope 数量，防止重入时重复执行 termination handler
    scope_index: Cell<usize>,
}

impl<'a> TableFrame<'a> {
    unsafe fn from_registration(reg: *const Registration) -> &'a TableFrame<'a> {
        debug_assert_eq!(unsafe { (*reg).kind() }, RegistrationKind::TableFrame);
        unsafe { &*(reg as *const TableFrame<'a>) }
    }

    fn set_pc(&self, rva: u32) {
        self.control_pc.set(rva);
        self.scope_index.set(0);
    }

    fn termination_or_die(&self, rva: u32) -> TerminationHandler {
        match self.image.termination(rva) {
            Some(handler) => handler,
            None => fatal(
                Errno::Format,
                format_args!("termination handler RVA 无法解析: rva={:#x}", rva),
            ),
        }
    }

    // unwind 经过本帧：按表顺序执行包含控制 PC 的 __finally；
    // 目标 unwind 时遇到同样包含落地点的作用域即停止
    fn unwind_scopes(&self, flags: u32, target: Option<u32>) {
        let _phase = PhaseScope::enter(DispatchPhase::LocalUnwinding);
        let _abnormal = AbnormalScope::enter(true);
        let pc = self.control_pc.get();
        let entries = &self.table.entries;

        let mut index = self.scope_index.get();
        while index < entries.len() {
            let entry = entries[index];
            index += 1;
            if !entry.contains(pc) || entry.is_except() {
                continue;
            }
            if flags & EH_TARGET_UNWIND != 0 && target.is_some_and(|ip| entry.contains(ip)) {
                break;
            }
            let handler = self.termination_or_die(entry.handler_address);
            self.scope_index.set(index);
            log::debug(format_args!(
                "执行 termination handler: scope={} rva={:#x}",
                index - 1,
                entry.handler_address
            ));
            handler(true, self.frame_data);
        }
    }
}

// 查表帧的 handler（__C_specific_handler）
unsafe fn c_specific_handler(
    record: &ExceptionRecord,
    reg: *const Registration,
    context: &Context,
    _dispatcher: &mut *const Registration,
) -> Disposition {
    let frame = unsafe { TableFrame::from_registration(reg) };
    if record.is_unwinding() {
        frame.unwind_scopes(record.flags, None);
        return Disposition::ContinueSearch;
    }

    let pc = frame.control_pc.get();
    let pointers = ExceptionPointers { record, context };
    for (index, entry) in frame.table.entries.iter().enumerate() {
        if !entry.contains(pc) || entry.is_finally() {
            continue;
        }
        if entry.handler_address != EXCEPTION_EXECUTE_HANDLER_RVA {
            let Some(filter) = frame.image.filter(entry.handler_address) else {
                fatal(
                    Errno::Format,
                    format_args!("过滤器 RVA 无法解析: rva={:#x}", entry.handler_address),
                );
            };
            let result = {
                let _phase = PhaseScope::enter(DispatchPhase::Filtering);
                filter(&pointers, frame.frame_data)
            };
            log::debug(format_args!(
                "查表过滤器结果: scope={} result={:?}",
                index, result
            ));
            match result {
                FilterResult::ContinueExecution => return Disposition::ContinueExecution,
                FilterResult::ContinueSearch => continue,
                FilterResult::ExecuteHandler => {}
            }
        }

        global_unwind(reg, Some(record), context);
        frame.unwind_scopes(
            record.flags | EH_UNWINDING | EH_TARGET_UNWIND,
            Some(entry.jump_target),
        );
        transfer::raise(Transfer::Landing {
            frame: reg as usize,
            scope: index,
            landing: entry.jump_target,
            code: record.code,
        });
    }
    Disposition::ContinueSearch
}

/// 被保护函数看到的查表帧句柄，用 RVA 表示当前执行位置
pub struct TableScope<'a> {
    frame: &'a TableFrame<'a>,
    _not_send: PhantomData<*const ()>,
}

impl TableScope<'_> {
    pub fn pc(&self) -> u32 {
        self.frame.control_pc.get()
    }

    pub fn frame_data(&self) -> usize {
        self.frame.frame_data
    }

    /// 执行位置移动到 `rva`
    pub fn set_pc(&self, rva: u32) {
        self.frame.set_pc(rva);
    }

    /// 顺序执行离开作用域：包含旧位置但不包含 `rva` 的 __finally 以正常终止方式执行
    pub fn leave(&self, rva: u32) {
        let pc = self.frame.control_pc.get();
        for entry in &self.frame.table.entries {
            if entry.is_finally() && entry.contains(pc) && !entry.contains(rva) {
                let handler = self.frame.termination_or_die(entry.handler_address);
                let _abnormal = AbnormalScope::enter(false);
                handler(false, self.frame.frame_data);
            }
        }
        self.frame.set_pc(rva);
    }
}

/// 安装查表帧并执行 `body`；异常被接受后在 jump_target 对应的落地点继续
pub fn protect_table<R, F>(
    table: &CScopeTable,
    image: &dyn ImageCode,
    frame_data: usize,
    body: F,
) -> Guarded<R>
where
    F: FnOnce(&TableScope<'_>) -> R,
{
    let frame = TableFrame {
        reg: Registration::new(RegistrationKind::TableFrame, c_specific_handler),
        table,
        image,
        frame_data,
        control_pc: Cell::new(0),
        scope_index: Cell::new(0),
    };
    let reg_addr = &frame.reg as *const Registration as usize;

    let installed = chain::install(&frame.reg);
    let handle = TableScope {
        frame: &frame,
        _not_send: PhantomData,
    };
    let outcome = transfer::catch(
        || run_frame_body(|| body(&handle)),
        |t| t.targets_frame(reg_addr),
    );

    let guarded = match outcome {
        Ok(value) => Guarded::Completed(value),
        Err(Transfer::Landing {
            scope,
            landing,
            code,
            ..
        }) => {
            chain::set_head(&frame.reg);
            frame.set_pc(landing);
            let Some(pad) = image.landing(landing) else {
                fatal(
                    Errno::Format,
                    format_args!("落地点 RVA 无法解析: rva={:#x}", landing),
                );
            };
            log::debug(format_args!(
                "进入落地点: frame={:#x} scope={} rva={:#x} code={:#x}",
                reg_addr, scope, landing, code
            ));
            let _phase = PhaseScope::enter(DispatchPhase::HandlerBody);
            pad(frame_data);
            Guarded::Handled(Handled {
                level: scope as i32,
                code,
            })
        }
        Err(other) => transfer::raise(other),
    };
    drop(installed);
    guarded
}

#[cfg(test)]
mod tests;
