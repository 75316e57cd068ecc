// 线程级备用信号栈：栈溢出引起的 SIGSEGV 也能在备用栈上进入处理器

use crate::errno::Errno;
use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;

use super::SIGALTSTACK_MIN_SIZE;

enum AltStack {
    Unset,
    // 线程原本就有备用栈，直接沿用
    Inherited,
    Owned {
        mem: *mut c_void,
        previous: libc::stack_t,
    },
}

impl AltStack {
    fn ensure(&mut self) -> Result<(), Errno> {
        if !matches!(self, Self::Unset) {
            return Ok(());
        }

        let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
            return Err(Errno::InitErrAltStack);
        }
        if current.ss_flags & libc::SS_DISABLE == 0 {
            *self = Self::Inherited;
            return Ok(());
        }

        let size = libc::SIGSTKSZ.max(SIGALTSTACK_MIN_SIZE);
        let mem = unsafe { libc::malloc(size) };
        if mem.is_null() {
            return Err(Errno::NoMem);
        }
        let stack = libc::stack_t {
            ss_sp: mem,
            ss_flags: 0,
            ss_size: size,
        };
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            unsafe { libc::free(mem) };
            return Err(Errno::InitErrAltStack);
        }
        *self = Self::Owned {
            mem,
            previous: current,
        };
        Ok(())
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        if let Self::Owned { mem, previous } = self {
            unsafe {
                let _ = libc::sigaltstack(previous, ptr::null_mut());
                libc::free(*mem);
            }
        }
    }
}

thread_local! {
    static ALTSTACK: RefCell<AltStack> = const { RefCell::new(AltStack::Unset) };
}

pub(super) fn ensure_thread_altstack() -> Result<(), Errno> {
    ALTSTACK
        .try_with(|stack| stack.borrow_mut().ensure())
        .unwrap_or(Err(Errno::InitErrAltStack))
}
