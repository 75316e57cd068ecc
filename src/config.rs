// 运行时配置：调试日志与硬件故障守卫开关，支持环境变量覆盖
use std::env;

const DEBUG_ENV: &str = "MSVCRT_SEH_DEBUG";
const FAULT_GUARD_ENV: &str = "MSVCRT_SEH_FAULT_GUARD";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SehConfig {
    // 输出 DEBUG 级别日志
    pub debug: bool,
    // 安装 SIGSEGV/SIGBUS/SIGFPE/SIGILL 处理器，将硬件故障转为异常
    pub fault_guard: bool,
}

impl Default for SehConfig {
    fn default() -> Self {
        Self {
            debug: false,
            fault_guard: true,
        }
    }
}

impl SehConfig {
    // 以默认值为基础，读取环境变量覆盖；无法识别的取值保持默认
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(debug) = read_env_flag(DEBUG_ENV) {
            config.debug = debug;
        }
        if let Some(fault_guard) = read_env_flag(FAULT_GUARD_ENV) {
            config.fault_guard = fault_guard;
        }
        config
    }
}

fn read_env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    let parsed = parse_env_flag(&value);
    if parsed.is_none() {
        crate::log::warn(format_args!("忽略无法识别的环境变量取值: {}={:?}", name, value));
    }
    parsed
}

pub(crate) fn parse_env_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
