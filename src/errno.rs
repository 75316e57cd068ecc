// 运行时错误码，0 表示成功
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Errno {
    Ok = 0,                  // 成功
    Uninit = 1,              // 未初始化
    InitErrInvalidArg = 2,   // 初始化参数无效
    InitErrSig = 3,          // 故障信号处理器安装失败
    InitErrAltStack = 4,     // 备用信号栈安装失败
    InvalidArg = 11,         // 参数无效
    UnknownSignal = 12,      // 不支持的信号编号
    Format = 13,             // scope table 数据格式错误
    GuardOverflow = 14,      // 故障守卫嵌套过深
    Fault = 15,              // 守卫区域内发生硬件故障
    Repeat = 16,             // 重复请求
    NoMem = 17,              // 内存不足
    ChainCorrupt = 20,       // 异常帧链损坏
    BadTryLevel = 21,        // trylevel 越界
    InvalidDisposition = 22, // handler 返回了非法的 disposition
    UnwindTarget = 23,       // unwind 目标不在帧链上
    StaleJumpBuffer = 24,    // jump buffer 对应的帧已失效
    Unhandled = 25,          // 未处理的异常
    Unknown = 1001,          // 未知错误
}

impl Errno {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl From<Errno> for i32 {
    fn from(value: Errno) -> Self {
        value as i32
    }
}
