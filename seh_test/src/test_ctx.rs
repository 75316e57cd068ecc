use std::io::Write;
use std::sync::Mutex;

use msvcrt_seh::{SehConfig, SehErrno, init, shutdown};

// 场景内的事件日志，按发生顺序记录
static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());

pub fn record(event: impl Into<String>) {
    EVENTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(event.into());
}

pub fn take_events() -> Vec<String> {
    std::mem::take(&mut *EVENTS.lock().unwrap_or_else(|e| e.into_inner()))
}

pub fn ensure_ok(code: SehErrno, op: &str) {
    assert_eq!(code, SehErrno::Ok, "{op} failed: {code:?}");
}

// 初始化运行时，场景结束时关闭
pub struct Runtime;

impl Runtime {
    pub fn start(op: &str) -> Self {
        ensure_ok(init(SehConfig::from_env()), op);
        Self
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        shutdown();
    }
}

pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

#[derive(Debug, Eq, PartialEq)]
pub enum ChildExit {
    Code(i32),
    Signal(i32),
}

pub struct ChildOutcome {
    pub exit: ChildExit,
    pub output: String,
}

impl ChildOutcome {
    pub fn lines(&self) -> Vec<&str> {
        self.output.lines().collect()
    }
}

// fork 子进程执行 body，stdout 经管道回传；body 正常返回时子进程以 0 退出
pub fn run_in_child(body: fn()) -> ChildOutcome {
    let _ = std::io::stdout().flush();
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "pipe failed");
    let [read_fd, write_fd] = fds;

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        unsafe {
            libc::close(read_fd);
            libc::dup2(write_fd, libc::STDOUT_FILENO);
            libc::close(write_fd);
        }
        body();
        let _ = std::io::stdout().flush();
        unsafe { libc::_exit(0) }
    }

    unsafe {
        libc::close(write_fd);
    }
    let mut output = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            output.extend_from_slice(&buf[..n as usize]);
            continue;
        }
        if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        break;
    }
    unsafe {
        libc::close(read_fd);
    }

    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            break;
        }
        assert!(
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR),
            "waitpid failed"
        );
    }

    let exit = if libc::WIFEXITED(status) {
        ChildExit::Code(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ChildExit::Signal(libc::WTERMSIG(status))
    } else {
        panic!("child ended with unexpected status {status:#x}");
    };
    ChildOutcome {
        exit,
        output: String::from_utf8_lossy(&output).into_owned(),
    }
}
