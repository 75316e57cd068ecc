// 硬件故障守卫：拦截 SIGSEGV/SIGBUS/SIGFPE/SIGILL，经 sigsetjmp/siglongjmp 回到守卫边界
//
// 守卫内的 Rust 栈帧被直接越过，不执行析构；线程的 SEH 状态在边界处按快照还原。

use crate::errno::Errno;
use crate::log;
use crate::runtime::state::MutexPoisonRecover;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

mod abi;
mod altstack;
mod guard_exec;
mod handlers;
mod slot;

// 预分配的静态 slot 数量上限
const GUARD_BASE_SLOT_MAX: usize = 64;
// 单线程最大嵌套守卫深度
const GUARD_STACK_DEPTH_MAX: usize = 8;
// 备用信号栈最小尺寸（64KB）
const SIGALTSTACK_MIN_SIZE: usize = 64 * 1024;
// 覆盖 glibc 与 bionic 在 x86_64/aarch64 上的 sigjmp_buf
const SIGJMP_BUF_WORDS: usize = 64;
// SA_EXPOSE_TAGBITS: 允许信号处理器看到 MTE tag 位
#[cfg(target_os = "android")]
const SA_EXPOSE_TAGBITS: libc::c_int = 0x0000_0800;

const GUARDED_SIGNALS: [libc::c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGFPE, libc::SIGILL];

// 信号处理器引用计数，支持多次 add/remove 配对
static HANDLER_REF_COUNT: AtomicUsize = AtomicUsize::new(0);
// 被替换的原始 sigaction，按 GUARDED_SIGNALS 顺序保存，用于转发和卸载恢复
static OLD_ACTIONS: [AtomicPtr<libc::sigaction>; GUARDED_SIGNALS.len()] =
    [const { AtomicPtr::new(ptr::null_mut()) }; GUARDED_SIGNALS.len()];
static HANDLER_LOCK: Mutex<()> = Mutex::new(());

#[repr(C, align(16))]
struct SigJmpBuf([libc::c_long; SIGJMP_BUF_WORDS]);

// 每线程的守卫上下文：sigsetjmp 环境栈与最近一次故障
struct GuardSlot {
    tid: AtomicUsize,
    active: AtomicBool,
    depth: AtomicUsize,
    last_signal: AtomicUsize,
    last_address: AtomicUsize,
    last_pc: AtomicUsize,
    last_write: AtomicBool,
    env_stack: [UnsafeCell<MaybeUninit<SigJmpBuf>>; GUARD_STACK_DEPTH_MAX],
}

unsafe impl Sync for GuardSlot {}

impl GuardSlot {
    const fn new() -> Self {
        Self {
            tid: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            last_signal: AtomicUsize::new(0),
            last_address: AtomicUsize::new(0),
            last_pc: AtomicUsize::new(0),
            last_write: AtomicBool::new(false),
            env_stack: [const { UnsafeCell::new(MaybeUninit::uninit()) }; GUARD_STACK_DEPTH_MAX],
        }
    }

    #[inline]
    unsafe fn env_ptr(&self, index: usize) -> *mut SigJmpBuf {
        (*self.env_stack[index].get()).as_mut_ptr()
    }
}

// 静态 slot 耗尽后使用的链表节点
struct GuardNode {
    slot: GuardSlot,
    next: AtomicPtr<GuardNode>,
}

impl GuardNode {
    fn new() -> Self {
        Self {
            slot: GuardSlot::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

static GUARD_BASE_SLOTS: [GuardSlot; GUARD_BASE_SLOT_MAX] =
    [const { GuardSlot::new() }; GUARD_BASE_SLOT_MAX];
// 溢出链表头指针，CAS 无锁追加
static GUARD_EXTRA_HEAD: AtomicPtr<GuardNode> = AtomicPtr::new(ptr::null_mut());

unsafe extern "C" {
    // glibc 的 sigsetjmp 是宏，实际符号为 __sigsetjmp
    #[cfg_attr(target_env = "gnu", link_name = "__sigsetjmp")]
    fn sigsetjmp(env: *mut SigJmpBuf, savemask: libc::c_int) -> libc::c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: libc::c_int) -> !;
}

/// 守卫捕获到的硬件故障
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FaultInfo {
    pub signum: i32,
    pub code: i32,
    // 出错的数据地址（si_addr）
    pub address: usize,
    // 故障指令地址，无法从 ucontext 取得时为 0
    pub pc: usize,
    pub write: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GuardFailure {
    Fault(FaultInfo),
    Unavailable(Errno),
}

fn signal_index(sig: libc::c_int) -> Option<usize> {
    GUARDED_SIGNALS.iter().position(|guarded| *guarded == sig)
}

fn store_old_action(index: usize, action: libc::sigaction) {
    let action_ptr = Box::into_raw(Box::new(action));
    OLD_ACTIONS[index].store(action_ptr, Ordering::Release);
}

fn load_old_action(index: usize) -> *const libc::sigaction {
    OLD_ACTIONS[index].load(Ordering::Acquire) as *const libc::sigaction
}

pub(crate) fn is_installed() -> bool {
    HANDLER_REF_COUNT.load(Ordering::Acquire) > 0
}

// 安装故障信号处理器，引用计数管理；任一信号失败时回滚已安装的部分
pub(crate) fn add_handler() -> Result<(), Errno> {
    let _handler_lock = HANDLER_LOCK.lock_or_poison();
    let current_count = HANDLER_REF_COUNT.load(Ordering::Acquire);
    if current_count > 0 {
        HANDLER_REF_COUNT.store(current_count.saturating_add(1), Ordering::Release);
        return Ok(());
    }

    let mut previous: [MaybeUninit<libc::sigaction>; GUARDED_SIGNALS.len()] =
        [const { MaybeUninit::uninit() }; GUARDED_SIGNALS.len()];
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handlers::fault_handler as *const () as usize;
        act.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;
        #[cfg(target_os = "android")]
        {
            act.sa_flags |= SA_EXPOSE_TAGBITS;
        }
        libc::sigfillset(&mut act.sa_mask);

        for (index, sig) in GUARDED_SIGNALS.iter().enumerate() {
            let mut old: libc::sigaction = std::mem::zeroed();
            if abi::raw_sigaction(*sig, &act, &mut old) != 0 {
                log::error(format_args!("sigaction 安装失败: sig={}", sig));
                for (done, done_sig) in GUARDED_SIGNALS.iter().enumerate().take(index) {
                    let _ = abi::raw_sigaction(
                        *done_sig,
                        previous[done].as_ptr(),
                        ptr::null_mut(),
                    );
                }
                return Err(Errno::InitErrSig);
            }
            previous[index].write(old);
        }

        for (index, old) in previous.iter().enumerate() {
            store_old_action(index, old.assume_init_read());
        }
    }

    HANDLER_REF_COUNT.store(1, Ordering::Release);
    log::debug(format_args!("故障信号处理器已安装: signals={:?}", GUARDED_SIGNALS));
    Ok(())
}

// 卸载故障信号处理器，引用计数归零时恢复原始 handler
pub(crate) fn remove_handler() {
    let _handler_lock = HANDLER_LOCK.lock_or_poison();
    let current_count = HANDLER_REF_COUNT.load(Ordering::Acquire);
    if current_count == 0 {
        return;
    }
    if current_count > 1 {
        HANDLER_REF_COUNT.store(current_count - 1, Ordering::Release);
        return;
    }

    for (index, sig) in GUARDED_SIGNALS.iter().enumerate() {
        let old = load_old_action(index);
        if !old.is_null() {
            unsafe {
                let _ = abi::raw_sigaction(*sig, old, ptr::null_mut());
            }
        }
    }
    HANDLER_REF_COUNT.store(0, Ordering::Release);
    log::debug(format_args!("故障信号处理器已卸载"));
}

/// 在故障守卫下执行 `f`；`f` 内的硬件故障使本函数返回 `GuardFailure::Fault`
///
/// 处理器未安装时直接执行 `f`。`f` 内安装的帧在故障时不经 unwind 直接丢弃，
/// 需要按 SEH 规则处理这些帧时使用 `guarded`。
pub fn with_guard<T, F>(f: F) -> Result<T, GuardFailure>
where
    F: FnOnce() -> T,
{
    guard_exec::with_guard_impl(f)
}

// 为 `f` 建立一个嵌套恢复点；处理器未安装或无法建立时交还 `f`
pub(crate) fn with_recovery_point<T, F>(f: F) -> Result<Result<T, FaultInfo>, F>
where
    F: FnOnce() -> T,
{
    if !is_installed() {
        return Err(f);
    }
    match guard_exec::run_armed(f) {
        guard_exec::Armed::Returned(value) => Ok(Ok(value)),
        guard_exec::Armed::Faulted(fault) => Ok(Err(fault)),
        guard_exec::Armed::Unarmed(errno, f) => {
            log::debug(format_args!("无法建立帧恢复点: errno={:?}", errno));
            Err(f)
        }
    }
}
