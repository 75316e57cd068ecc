// 守卫执行：sigsetjmp 建立恢复点，故障时由处理器 siglongjmp 回到这里

use crate::errno::Errno;
use crate::log;
use crate::runtime::thread_state;
use crate::seh::chain;
use std::mem::ManuallyDrop;
use std::sync::atomic::Ordering;

use super::{
    FaultInfo, GUARD_STACK_DEPTH_MAX, GuardFailure, GuardSlot, abi, altstack, sigsetjmp, slot,
};

// drop 时递减嵌套深度，归零时释放 slot
struct GuardReset {
    slot: &'static GuardSlot,
}

impl Drop for GuardReset {
    fn drop(&mut self) {
        let prev_depth = self.slot.depth.load(Ordering::Acquire);
        let new_depth = prev_depth.saturating_sub(1);
        self.slot.depth.store(new_depth, Ordering::Release);
        if new_depth == 0 {
            self.slot.active.store(false, Ordering::Release);
            slot::clear_fault(self.slot);
            self.slot.tid.store(0, Ordering::Release);
        }
    }
}

// 建立恢复点期间屏蔽故障信号，drop 时恢复
struct SignalMaskGuard {
    prev_mask: libc::sigset_t,
    active: bool,
}

impl SignalMaskGuard {
    fn block() -> Result<Self, Errno> {
        let mut prev_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        abi::block_guard_signals(&mut prev_mask)?;
        Ok(Self {
            prev_mask,
            active: true,
        })
    }

    fn restore(&mut self) {
        if !self.active {
            return;
        }
        abi::restore_guard_signals(&self.prev_mask);
        self.active = false;
    }

    // siglongjmp 还原的是建立恢复点时的屏蔽掩码，active 标记不可信
    fn restore_after_jump(&mut self) {
        abi::restore_guard_signals(&self.prev_mask);
        self.active = false;
    }
}

impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

// 守卫的三种结局；未能建立恢复点时闭包原样交还
pub(super) enum Armed<T, F> {
    Returned(T),
    Faulted(FaultInfo),
    Unarmed(Errno, F),
}

pub(super) fn with_guard_impl<T, F>(f: F) -> Result<T, GuardFailure>
where
    F: FnOnce() -> T,
{
    if !super::is_installed() {
        return Ok(f());
    }
    match run_armed(f) {
        Armed::Returned(value) => Ok(value),
        Armed::Faulted(fault) => Err(GuardFailure::Fault(fault)),
        Armed::Unarmed(errno, _) => Err(GuardFailure::Unavailable(errno)),
    }
}

// 流程: 备用栈 -> slot -> 屏蔽信号 -> 线程状态快照 -> sigsetjmp -> 执行闭包
pub(super) fn run_armed<T, F>(f: F) -> Armed<T, F>
where
    F: FnOnce() -> T,
{
    if let Err(errno) = altstack::ensure_thread_altstack() {
        return Armed::Unarmed(errno, f);
    }
    let slot = slot::acquire_slot(abi::current_thread_id());

    let mut mask_guard = match SignalMaskGuard::block() {
        Ok(guard) => guard,
        Err(errno) => return Armed::Unarmed(errno, f),
    };
    let depth = slot.depth.load(Ordering::Acquire);
    if depth >= GUARD_STACK_DEPTH_MAX {
        mask_guard.restore();
        log::warn(format_args!(
            "故障守卫嵌套过深: depth={} max={}",
            depth, GUARD_STACK_DEPTH_MAX
        ));
        return Armed::Unarmed(Errno::GuardOverflow, f);
    }

    slot::clear_fault(slot);
    slot.depth.store(depth + 1, Ordering::Release);
    slot.active.store(true, Ordering::Release);
    let _reset = GuardReset { slot };
    let snapshot = thread_state::snapshot();
    // 故障返回时闭包所在的栈帧已被越过，不再析构
    let mut f = ManuallyDrop::new(f);

    unsafe {
        let env = slot.env_ptr(depth);
        if sigsetjmp(env, 1) == 0 {
            mask_guard.restore();
            return Armed::Returned(ManuallyDrop::take(&mut f)());
        }
    }

    // siglongjmp 返回：守卫内的栈帧已被越过
    mask_guard.restore_after_jump();
    match snapshot {
        Some(snapshot) => {
            let head = chain::head();
            if head != snapshot.head() {
                log::warn(format_args!(
                    "守卫内安装的帧未经 unwind 被丢弃: head={:#x} boundary={:#x}",
                    head as usize,
                    snapshot.head() as usize
                ));
            }
            thread_state::restore(snapshot)
        }
        None => thread_state::report_thread_state_unavailable("fault_guard"),
    }
    let fault = slot::take_fault(slot).unwrap_or_default();
    log::debug(format_args!(
        "守卫捕获硬件故障: signum={} code={} addr={:#x} pc={:#x} write={}",
        fault.signum, fault.code, fault.address, fault.pc, fault.write
    ));
    Armed::Faulted(fault)
}
