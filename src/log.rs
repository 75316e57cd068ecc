use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

pub const LOG_DEBUG: i32 = 3;
pub const LOG_INFO: i32 = 4;
pub const LOG_WARN: i32 = 5;
pub const LOG_ERROR: i32 = 6;

const LOG_TAG: &str = "msvcrt_seh";

static LOG_PRIORITY: AtomicI32 = AtomicI32::new(LOG_WARN);

// 设置日志级别，启用时输出 DEBUG 及以上，禁用时仅输出 WARN 及以上
pub fn set_debug_enabled(enabled: bool) {
    let priority = if enabled { LOG_DEBUG } else { LOG_WARN };
    LOG_PRIORITY.store(priority, Ordering::SeqCst);
}

pub fn debug_enabled() -> bool {
    enabled(LOG_DEBUG)
}

fn enabled(priority: i32) -> bool {
    LOG_PRIORITY.load(Ordering::Relaxed) <= priority
}

fn priority_letter(priority: i32) -> char {
    match priority {
        LOG_DEBUG => 'D',
        LOG_INFO => 'I',
        LOG_WARN => 'W',
        _ => 'E',
    }
}

// 单次 write(2) 输出整行，守卫路径上也可以安全调用
fn write_log(priority: i32, args: fmt::Arguments) {
    if !enabled(priority) {
        return;
    }

    let mut text = format!("{}/{}: {args}", priority_letter(priority), LOG_TAG).into_bytes();
    for byte in &mut text {
        if *byte == 0 {
            *byte = b' ';
        }
    }
    text.push(b'\n');

    unsafe {
        let _ = libc::write(
            libc::STDERR_FILENO,
            text.as_ptr() as *const libc::c_void,
            text.len(),
        );
    }
}

pub(crate) fn info(args: fmt::Arguments) {
    write_log(LOG_INFO, args);
}

pub(crate) fn debug(args: fmt::Arguments) {
    write_log(LOG_DEBUG, args);
}

pub(crate) fn warn(args: fmt::Arguments) {
    write_log(LOG_WARN, args);
}

pub(crate) fn error(args: fmt::Arguments) {
    write_log(LOG_ERROR, args);
}
