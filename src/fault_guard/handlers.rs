// 故障信号入口：守卫内的故障跳回恢复点，其余交给安装前的处理器

use std::ptr;

use super::{abi, load_old_action, signal_index, slot};

enum Previous {
    Terminate,
    Ignore,
    Handler(libc::sigaction),
}

fn previous_action(sig: libc::c_int) -> Previous {
    let old = signal_index(sig).map_or(ptr::null(), load_old_action);
    if old.is_null() {
        return Previous::Terminate;
    }
    let action = unsafe { *old };
    match action.sa_sigaction {
        libc::SIG_DFL => Previous::Terminate,
        libc::SIG_IGN => Previous::Ignore,
        handler if handler == fault_handler as *const () as usize => Previous::Terminate,
        _ => Previous::Handler(action),
    }
}

fn reset_to_default(sig: libc::c_int) {
    unsafe {
        let mut dfl: libc::sigaction = std::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut dfl.sa_mask);
        let _ = abi::raw_sigaction(sig, &dfl, ptr::null_mut());
    }
}

// 以默认动作重新投递，进程以该信号终止
fn terminate(sig: libc::c_int) -> ! {
    reset_to_default(sig);
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, sig);
        let _ = abi::raw_sigprocmask(libc::SIG_UNBLOCK, &mask, ptr::null_mut());
        let _ = libc::pthread_kill(libc::pthread_self(), sig);
        libc::_exit(128 + sig)
    }
}

// 按原处理器的 sa_mask/SA_NODEFER/SA_RESETHAND 调用它
unsafe fn forward(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
    action: &libc::sigaction,
) {
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    abi::sigset_or(&mut mask, &abi::read_ucontext_sigmask(ucontext), &action.sa_mask);
    if action.sa_flags & libc::SA_NODEFER == 0 {
        unsafe { libc::sigaddset(&mut mask, sig) };
    }
    let mut saved: libc::sigset_t = unsafe { std::mem::zeroed() };
    let switched = unsafe { abi::raw_sigprocmask(libc::SIG_SETMASK, &mask, &mut saved) == 0 };

    if action.sa_flags & libc::SA_RESETHAND != 0 {
        reset_to_default(sig);
    }
    if action.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(action.sa_sigaction) };
        handler(sig, info, ucontext);
    } else {
        let handler: extern "C" fn(libc::c_int) =
            unsafe { std::mem::transmute(action.sa_sigaction) };
        handler(sig);
    }

    if switched {
        unsafe {
            let _ = abi::raw_sigprocmask(libc::SIG_SETMASK, &saved, ptr::null_mut());
        }
    }
}

// 内核产生的故障 si_code > 0，忽略后返回会在同一条指令上再次触发
fn is_synchronous(info: *const libc::siginfo_t) -> bool {
    !info.is_null() && unsafe { (*info).si_code } > 0
}

pub(super) extern "C" fn fault_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if slot::handle_guard_signal(sig, info, ucontext) {
        return;
    }
    match previous_action(sig) {
        Previous::Ignore if !is_synchronous(info) => {}
        Previous::Terminate | Previous::Ignore => terminate(sig),
        Previous::Handler(action) => unsafe { forward(sig, info, ucontext, &action) },
    }
}
