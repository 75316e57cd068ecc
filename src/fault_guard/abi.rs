// 信号相关系统调用的底层封装：EINTR 重试与 ucontext 读取

use crate::errno::Errno;
use std::ffi::c_void;
use std::ptr;

use super::GUARDED_SIGNALS;

// EINTR 重试上限
const EINTR_RETRY_LIMIT: usize = 4;

fn last_errno() -> libc::c_int {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or_default() as libc::c_int
}

#[inline]
fn should_retry_eintr() -> bool {
    last_errno() == libc::EINTR
}

// 带 EINTR 重试的 C 函数调用包装，返回 0 表示成功
#[inline]
fn retry_eintr<F>(mut call: F) -> libc::c_int
where
    F: FnMut() -> libc::c_int,
{
    let mut result = call();
    let mut retries = 0usize;
    while result != 0 && retries < EINTR_RETRY_LIMIT && should_retry_eintr() {
        retries = retries.saturating_add(1);
        result = call();
    }
    result
}

#[inline]
pub(super) unsafe fn raw_sigaction(
    signum: libc::c_int,
    new_action: *const libc::sigaction,
    old_action: *mut libc::sigaction,
) -> libc::c_int {
    retry_eintr(|| unsafe { libc::sigaction(signum, new_action, old_action) })
}

#[inline]
pub(super) unsafe fn raw_sigprocmask(
    how: libc::c_int,
    new_set: *const libc::sigset_t,
    old_set: *mut libc::sigset_t,
) -> libc::c_int {
    retry_eintr(|| unsafe { libc::pthread_sigmask(how, new_set, old_set) })
}

// 临时屏蔽守卫处理的信号，返回之前的信号掩码
pub(super) fn block_guard_signals(prev_mask: &mut libc::sigset_t) -> Result<(), Errno> {
    let mut block_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut block_mask);
        for sig in GUARDED_SIGNALS {
            libc::sigaddset(&mut block_mask, sig);
        }
        if raw_sigprocmask(libc::SIG_BLOCK, &block_mask, prev_mask) != 0 {
            return Err(Errno::InitErrSig);
        }
    }
    Ok(())
}

pub(super) fn restore_guard_signals(prev_mask: &libc::sigset_t) {
    unsafe {
        let _ = raw_sigprocmask(libc::SIG_SETMASK, prev_mask, ptr::null_mut());
    }
}

// 计算两个信号集的并集
pub(super) fn sigset_or(dest: &mut libc::sigset_t, left: &libc::sigset_t, right: &libc::sigset_t) {
    unsafe {
        libc::sigemptyset(dest);
        // 内核信号编号范围 1..=64
        for signum in 1..=64 {
            if libc::sigismember(left, signum) == 1 || libc::sigismember(right, signum) == 1 {
                libc::sigaddset(dest, signum);
            }
        }
    }
}

// 从 ucontext 中提取信号掩码，bionic x86_64 使用 uc_sigmask64 字段
pub(super) fn read_ucontext_sigmask(ucontext: *mut c_void) -> libc::sigset_t {
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut mask);
    }
    if ucontext.is_null() {
        return mask;
    }

    #[cfg(all(target_os = "android", target_arch = "x86_64"))]
    {
        let context = unsafe { &*(ucontext as *const libc::ucontext_t) };
        let copy_len =
            std::mem::size_of::<libc::sigset_t>().min(std::mem::size_of_val(&context.uc_sigmask64));
        unsafe {
            ptr::copy_nonoverlapping(
                ptr::addr_of!(context.uc_sigmask64) as *const u8,
                (&mut mask as *mut libc::sigset_t).cast::<u8>(),
                copy_len,
            );
        }
    }

    #[cfg(not(all(target_os = "android", target_arch = "x86_64")))]
    {
        let context = unsafe { &*(ucontext as *const libc::ucontext_t) };
        mask = unsafe { ptr::read(ptr::addr_of!(context.uc_sigmask)) };
    }

    mask
}

// 故障指令地址与是否为写访问；glibc 之外的 ucontext 布局不解析
#[cfg(all(target_env = "gnu", target_arch = "x86_64"))]
pub(super) fn read_fault_site(ucontext: *mut c_void) -> (usize, bool) {
    if ucontext.is_null() {
        return (0, false);
    }
    let context = unsafe { &*(ucontext as *const libc::ucontext_t) };
    let gregs = &context.uc_mcontext.gregs;
    let pc = gregs[libc::REG_RIP as usize] as usize;
    // 页错误码 bit1 表示写访问
    let write = gregs[libc::REG_ERR as usize] & 0x2 != 0;
    (pc, write)
}

#[cfg(all(target_env = "gnu", target_arch = "aarch64"))]
pub(super) fn read_fault_site(ucontext: *mut c_void) -> (usize, bool) {
    if ucontext.is_null() {
        return (0, false);
    }
    let context = unsafe { &*(ucontext as *const libc::ucontext_t) };
    (context.uc_mcontext.pc as usize, false)
}

#[cfg(not(all(target_env = "gnu", any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub(super) fn read_fault_site(_ucontext: *mut c_void) -> (usize, bool) {
    (0, false)
}

pub(super) fn current_thread_id() -> usize {
    unsafe { libc::syscall(libc::SYS_gettid) as usize }
}
