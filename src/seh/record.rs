// 异常记录、异常指针、处理结果与状态码
use crate::machine::Context;

pub const STATUS_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
pub const STATUS_BREAKPOINT: u32 = 0x8000_0003;
pub const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;
pub const STATUS_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
pub const STATUS_NONCONTINUABLE_EXCEPTION: u32 = 0xC000_0025;
pub const STATUS_INVALID_DISPOSITION: u32 = 0xC000_0026;
pub const STATUS_UNWIND: u32 = 0xC000_0027;
pub const STATUS_ARRAY_BOUNDS_EXCEEDED: u32 = 0xC000_008C;
pub const STATUS_FLOAT_DENORMAL_OPERAND: u32 = 0xC000_008D;
pub const STATUS_FLOAT_DIVIDE_BY_ZERO: u32 = 0xC000_008E;
pub const STATUS_FLOAT_INEXACT_RESULT: u32 = 0xC000_008F;
pub const STATUS_FLOAT_INVALID_OPERATION: u32 = 0xC000_0090;
pub const STATUS_FLOAT_OVERFLOW: u32 = 0xC000_0091;
pub const STATUS_FLOAT_STACK_CHECK: u32 = 0xC000_0092;
pub const STATUS_FLOAT_UNDERFLOW: u32 = 0xC000_0093;
pub const STATUS_INTEGER_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
pub const STATUS_INTEGER_OVERFLOW: u32 = 0xC000_0095;
pub const STATUS_PRIVILEGED_INSTRUCTION: u32 = 0xC000_0096;

pub const EH_NONCONTINUABLE: u32 = 0x01;
pub const EH_UNWINDING: u32 = 0x02;
pub const EH_EXIT_UNWIND: u32 = 0x04;
pub const EH_STACK_INVALID: u32 = 0x08;
pub const EH_NESTED_CALL: u32 = 0x10;
pub const EH_TARGET_UNWIND: u32 = 0x20;
pub const EH_COLLIDED_UNWIND: u32 = 0x40;

pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// 一次异常的完整描述，分发期间沿帧链传递给每个 handler。
///
/// `nested` 链接引发本异常的上一条记录，例如 handler 对不可继续的异常
/// 返回 ContinueExecution 时产生的 `STATUS_NONCONTINUABLE_EXCEPTION`。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionRecord {
    pub code: u32,
    pub flags: u32,
    pub nested: Option<Box<ExceptionRecord>>,
    pub address: usize,
    param_count: usize,
    params: [usize; EXCEPTION_MAXIMUM_PARAMETERS],
}

impl ExceptionRecord {
    pub fn new(code: u32, flags: u32, address: usize, params: &[usize]) -> Self {
        if params.len() > EXCEPTION_MAXIMUM_PARAMETERS {
            crate::log::warn(format_args!(
                "异常参数过多，截断: code={:#x} count={}",
                code,
                params.len()
            ));
        }
        let param_count = params.len().min(EXCEPTION_MAXIMUM_PARAMETERS);
        let mut stored = [0usize; EXCEPTION_MAXIMUM_PARAMETERS];
        stored[..param_count].copy_from_slice(&params[..param_count]);
        Self {
            code,
            flags,
            nested: None,
            address,
            param_count,
            params: stored,
        }
    }

    // 访问违例：params[0] 为 0 读 / 1 写，params[1] 为出错地址
    pub fn access_violation(address: usize, write: bool, target: usize) -> Self {
        Self::new(
            STATUS_ACCESS_VIOLATION,
            0,
            address,
            &[usize::from(write), target],
        )
    }

    // 全局 unwind 使用的记录：调用方未提供时生成 STATUS_UNWIND
    pub(crate) fn for_unwind(base: Option<&ExceptionRecord>, exit: bool, address: usize) -> Self {
        let mut record = match base {
            Some(base) => base.clone(),
            None => Self::new(STATUS_UNWIND, 0, address, &[]),
        };
        record.flags |= if exit { EH_UNWINDING | EH_EXIT_UNWIND } else { EH_UNWINDING };
        record
    }

    pub fn params(&self) -> &[usize] {
        &self.params[..self.param_count]
    }

    pub fn is_unwinding(&self) -> bool {
        self.flags & (EH_UNWINDING | EH_EXIT_UNWIND) != 0
    }

    pub fn is_continuable(&self) -> bool {
        self.flags & EH_NONCONTINUABLE == 0
    }
}

/// 传给过滤器的异常指针：记录与异常发生点的上下文
#[derive(Clone, Copy, Debug)]
pub struct ExceptionPointers<'a> {
    pub record: &'a ExceptionRecord,
    pub context: &'a Context,
}

/// 帧 handler 的返回值
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    ContinueExecution = 0,
    ContinueSearch = 1,
    NestedException = 2,
    CollidedUnwind = 3,
}

/// 过滤器的返回值，数值与 EXCEPTION_* 常量一致
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterResult {
    ContinueExecution = -1,
    ContinueSearch = 0,
    ExecuteHandler = 1,
}

impl FilterResult {
    // 非标准取值按符号归类，与编译器生成的比较一致
    pub const fn from_raw(value: i32) -> Self {
        if value < 0 {
            Self::ContinueExecution
        } else if value == 0 {
            Self::ContinueSearch
        } else {
            Self::ExecuteHandler
        }
    }

    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

pub fn exception_name(code: u32) -> &'static str {
    match code {
        STATUS_DATATYPE_MISALIGNMENT => "DATATYPE_MISALIGNMENT",
        STATUS_BREAKPOINT => "BREAKPOINT",
        STATUS_ACCESS_VIOLATION => "ACCESS_VIOLATION",
        STATUS_ILLEGAL_INSTRUCTION => "ILLEGAL_INSTRUCTION",
        STATUS_NONCONTINUABLE_EXCEPTION => "NONCONTINUABLE_EXCEPTION",
        STATUS_INVALID_DISPOSITION => "INVALID_DISPOSITION",
        STATUS_UNWIND => "UNWIND",
        STATUS_ARRAY_BOUNDS_EXCEEDED => "ARRAY_BOUNDS_EXCEEDED",
        STATUS_FLOAT_DENORMAL_OPERAND => "FLOAT_DENORMAL_OPERAND",
        STATUS_FLOAT_DIVIDE_BY_ZERO => "FLOAT_DIVIDE_BY_ZERO",
        STATUS_FLOAT_INEXACT_RESULT => "FLOAT_INEXACT_RESULT",
        STATUS_FLOAT_INVALID_OPERATION => "FLOAT_INVALID_OPERATION",
        STATUS_FLOAT_OVERFLOW => "FLOAT_OVERFLOW",
        STATUS_FLOAT_STACK_CHECK => "FLOAT_STACK_CHECK",
        STATUS_FLOAT_UNDERFLOW => "FLOAT_UNDERFLOW",
        STATUS_INTEGER_DIVIDE_BY_ZERO => "INTEGER_DIVIDE_BY_ZERO",
        STATUS_INTEGER_OVERFLOW => "INTEGER_OVERFLOW",
        STATUS_PRIVILEGED_INSTRUCTION => "PRIVILEGED_INSTRUCTION",
        _ => "USER",
    }
}
