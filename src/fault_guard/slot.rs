// 守卫 slot 的分配、查找与信号跳转
// slot 按 tid 归属线程，静态数组 + 动态链表两级存储

use std::sync::atomic::Ordering;

use super::abi;
use super::{
    FaultInfo, GUARD_BASE_SLOTS, GUARD_EXTRA_HEAD, GUARD_STACK_DEPTH_MAX, GuardNode, GuardSlot,
    siglongjmp,
};

fn extra_slots() -> impl Iterator<Item = &'static GuardSlot> {
    let mut node = GUARD_EXTRA_HEAD.load(Ordering::Acquire);
    std::iter::from_fn(move || {
        if node.is_null() {
            return None;
        }
        let current = unsafe { &*node };
        node = current.next.load(Ordering::Acquire);
        Some(&current.slot)
    })
}

fn all_slots() -> impl Iterator<Item = &'static GuardSlot> {
    GUARD_BASE_SLOTS.iter().chain(extra_slots())
}

fn find_slot_by_tid(tid: usize) -> Option<&'static GuardSlot> {
    all_slots().find(|slot| slot.tid.load(Ordering::Acquire) == tid)
}

// 信号上下文中调用，只读原子变量
fn find_active_slot_by_tid(tid: usize) -> Option<&'static GuardSlot> {
    all_slots().find(|slot| {
        slot.tid.load(Ordering::Acquire) == tid && slot.active.load(Ordering::Acquire)
    })
}

// 为 tid 获取 slot：先查已有 -> CAS 抢占空闲 -> 堆分配新节点插入链表头部
pub(super) fn acquire_slot(tid: usize) -> &'static GuardSlot {
    if let Some(slot) = find_slot_by_tid(tid) {
        return slot;
    }

    let claimed = all_slots().find(|slot| {
        slot.tid
            .compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    });
    if let Some(slot) = claimed {
        return slot;
    }

    let node = Box::new(GuardNode::new());
    node.slot.tid.store(tid, Ordering::Release);
    let node_ptr = Box::into_raw(node);

    loop {
        let head = GUARD_EXTRA_HEAD.load(Ordering::Acquire);
        unsafe {
            (*node_ptr).next.store(head, Ordering::Release);
        }
        if GUARD_EXTRA_HEAD
            .compare_exchange(head, node_ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return unsafe { &(*node_ptr).slot };
        }
    }
}

// 高 16 位为 signum，低 16 位为 si_code
fn encode_signal_info(signum: libc::c_int, code: libc::c_int) -> usize {
    let signum_u16 = (signum.max(0) as u16) as usize;
    let code_u16 = (code as i16 as u16) as usize;
    (signum_u16 << 16) | code_u16
}

fn decode_signal_info(encoded: usize) -> (libc::c_int, libc::c_int) {
    let signum = ((encoded >> 16) & 0xFFFF) as i32;
    let code = (encoded as u16 as i16) as i32;
    (signum, code)
}

// 取出最近一次故障；没有记录时返回 None
pub(super) fn take_fault(slot: &GuardSlot) -> Option<FaultInfo> {
    let encoded = slot.last_signal.swap(0, Ordering::AcqRel);
    if encoded == 0 {
        return None;
    }
    let (signum, code) = decode_signal_info(encoded);
    Some(FaultInfo {
        signum,
        code,
        address: slot.last_address.load(Ordering::Acquire),
        pc: slot.last_pc.load(Ordering::Acquire),
        write: slot.last_write.load(Ordering::Acquire),
    })
}

pub(super) fn clear_fault(slot: &GuardSlot) {
    slot.last_signal.store(0, Ordering::Release);
    slot.last_address.store(0, Ordering::Release);
    slot.last_pc.store(0, Ordering::Release);
    slot.last_write.store(false, Ordering::Release);
}

// 查找当前线程的活跃 slot，记录故障后 siglongjmp 跳回；必须是 async-signal-safe
pub(super) fn handle_guard_signal(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) -> bool {
    let tid = abi::current_thread_id();
    let Some(slot) = find_active_slot_by_tid(tid) else {
        return false;
    };
    let depth = slot.depth.load(Ordering::Acquire);
    if depth == 0 || depth > GUARD_STACK_DEPTH_MAX {
        return false;
    }
    let index = depth - 1;
    let (pc, write) = abi::read_fault_site(ucontext);
    unsafe {
        let (code, address) = if info.is_null() {
            (0, 0)
        } else {
            ((*info).si_code, (*info).si_addr() as usize)
        };
        slot.last_address.store(address, Ordering::Release);
        slot.last_pc.store(pc, Ordering::Release);
        slot.last_write
            .store(sig == libc::SIGSEGV && write, Ordering::Release);
        slot.last_signal
            .store(encode_signal_info(sig, code), Ordering::Release);
        siglongjmp(slot.env_ptr(index), 1);
    }
}
