use crate::seh::{DispatchPhase, ExceptionRecord, Registration};
use once_cell::sync::OnceCell;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const JUMP_TARGET_CAP: usize = 64;

// 存活的 setjmp 捕获点：id 用于 longjmp 匹配，stack_sp 用于过期检测
#[derive(Clone, Copy)]
pub(crate) struct JumpTarget {
    pub(crate) id: u64,
    pub(crate) stack_sp: usize,
}

// 固定容量栈，运行期不扩容
pub(crate) struct FixedStack<T: Copy, const N: usize> {
    len: usize,
    items: [MaybeUninit<T>; N],
}

impl<T: Copy, const N: usize> FixedStack<T, N> {
    pub(crate) fn new() -> Self {
        let items = unsafe { MaybeUninit::<[MaybeUninit<T>; N]>::uninit().assume_init() };
        Self { len: 0, items }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push(&mut self, item: T) -> bool {
        if self.len >= N {
            return false;
        }
        self.items[self.len].write(item);
        self.len += 1;
        true
    }

    pub(crate) fn get(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        Some(unsafe { *self.items[index].as_ptr() })
    }

    // 丢弃 len 之后的元素；T: Copy，无需析构
    pub(crate) fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    pub(crate) fn rposition_by<F>(&self, mut pred: F) -> Option<usize>
    where
        F: FnMut(T) -> bool,
    {
        let mut idx = self.len;
        while idx > 0 {
            idx -= 1;
            let item = unsafe { *self.items[idx].as_ptr() };
            if pred(item) {
                return Some(idx);
            }
        }
        None
    }
}

// 线程级 SEH 状态：帧链表头、分发阶段、异常终止标记、当前异常与存活的跳转目标
pub(crate) struct ThreadSehState {
    head: *const Registration,
    phase: DispatchPhase,
    abnormal: bool,
    current_exception: Option<ExceptionRecord>,
    jump_targets: FixedStack<JumpTarget, JUMP_TARGET_CAP>,
    // 最内层 guarded 进入时的链头；None 表示不在 guarded 区域内
    fault_boundary: Option<*const Registration>,
}

impl ThreadSehState {
    fn new() -> Self {
        Self {
            head: ptr::null(),
            phase: DispatchPhase::Idle,
            abnormal: false,
            current_exception: None,
            jump_targets: FixedStack::new(),
            fault_boundary: None,
        }
    }

    pub(crate) fn head(&self) -> *const Registration {
        self.head
    }

    pub(crate) fn set_head(&mut self, head: *const Registration) {
        self.head = head;
    }

    pub(crate) fn phase(&self) -> DispatchPhase {
        self.phase
    }

    pub(crate) fn replace_phase(&mut self, phase: DispatchPhase) -> DispatchPhase {
        std::mem::replace(&mut self.phase, phase)
    }

    pub(crate) fn abnormal(&self) -> bool {
        self.abnormal
    }

    pub(crate) fn replace_abnormal(&mut self, abnormal: bool) -> bool {
        std::mem::replace(&mut self.abnormal, abnormal)
    }

    pub(crate) fn current_exception(&self) -> Option<&ExceptionRecord> {
        self.current_exception.as_ref()
    }

    pub(crate) fn replace_current_exception(
        &mut self,
        record: Option<ExceptionRecord>,
    ) -> Option<ExceptionRecord> {
        std::mem::replace(&mut self.current_exception, record)
    }

    pub(crate) fn jump_targets(&self) -> &FixedStack<JumpTarget, JUMP_TARGET_CAP> {
        &self.jump_targets
    }

    pub(crate) fn jump_targets_mut(&mut self) -> &mut FixedStack<JumpTarget, JUMP_TARGET_CAP> {
        &mut self.jump_targets
    }

    pub(crate) fn fault_boundary(&self) -> Option<*const Registration> {
        self.fault_boundary
    }

    pub(crate) fn replace_fault_boundary(
        &mut self,
        boundary: Option<*const Registration>,
    ) -> Option<*const Registration> {
        std::mem::replace(&mut self.fault_boundary, boundary)
    }
}

// 故障守卫在 sigsetjmp 前保存、siglongjmp 返回后恢复的线程状态
pub(crate) struct SehSnapshot {
    head: *const Registration,
    phase: DispatchPhase,
    abnormal: bool,
    current_exception: Option<ExceptionRecord>,
    jump_depth: usize,
    fault_boundary: Option<*const Registration>,
}

impl SehSnapshot {
    pub(crate) fn head(&self) -> *const Registration {
        self.head
    }
}

#[derive(Clone, Copy)]
struct ThreadStateKeys {
    state_key: libc::pthread_key_t,
    reserved_key: libc::pthread_key_t,
}

static THREAD_STATE_KEYS: OnceCell<ThreadStateKeys> = OnceCell::new();
static THREAD_STATE_KEY_INIT_FAIL: AtomicU64 = AtomicU64::new(0);
static THREAD_STATE_BIND_FAIL: AtomicU64 = AtomicU64::new(0);
static THREAD_STATE_ACCESS_FAIL: AtomicU64 = AtomicU64::new(0);
static THREAD_STATE_RESERVED_HIT: AtomicU64 = AtomicU64::new(0);
static JUMP_TARGET_OVERFLOW: AtomicU64 = AtomicU64::new(0);

type ThreadStatePtr = *mut ThreadSehState;

const RESERVED_SENTINEL: *const c_void = ptr::dangling::<c_void>();

// pthread key 析构：线程退出时释放线程状态，并设置析构保护标记
unsafe extern "C" fn destroy_thread_state(raw_ptr: *mut c_void) {
    if raw_ptr.is_null() {
        return;
    }

    if let Some(keys) = THREAD_STATE_KEYS.get() {
        unsafe {
            let _ = libc::pthread_setspecific(keys.reserved_key, RESERVED_SENTINEL);
        }
    }

    unsafe {
        drop(Box::from_raw(raw_ptr as ThreadStatePtr));
    }

    if let Some(keys) = THREAD_STATE_KEYS.get() {
        unsafe {
            let _ = libc::pthread_setspecific(keys.state_key, ptr::null());
        }
    }
}

pub(crate) fn should_log_every_step(count: u64) -> bool {
    count == 1 || count.is_multiple_of(256)
}

fn report_thread_state_key_init_fail(phase: &str, ret: i32) {
    let count = THREAD_STATE_KEY_INIT_FAIL.fetch_add(1, Ordering::Relaxed) + 1;
    if should_log_every_step(count) {
        crate::log::warn(format_args!(
            "线程状态 key 初始化失败: phase={} ret={} 次数={}",
            phase, ret, count
        ));
    }
}

fn ensure_thread_state_keys() -> Option<ThreadStateKeys> {
    if let Some(keys) = THREAD_STATE_KEYS.get() {
        return Some(*keys);
    }

    let mut state_key: libc::pthread_key_t = 0;
    let state_ret = unsafe {
        libc::pthread_key_create(
            &mut state_key as *mut libc::pthread_key_t,
            Some(destroy_thread_state),
        )
    };
    if state_ret != 0 {
        report_thread_state_key_init_fail("state", state_ret);
        return None;
    }

    let mut reserved_key: libc::pthread_key_t = 0;
    let reserved_ret =
        unsafe { libc::pthread_key_create(&mut reserved_key as *mut libc::pthread_key_t, None) };
    if reserved_ret != 0 {
        unsafe {
            let _ = libc::pthread_key_delete(state_key);
        }
        report_thread_state_key_init_fail("reserved", reserved_ret);
        return None;
    }

    let keys = ThreadStateKeys {
        state_key,
        reserved_key,
    };
    if THREAD_STATE_KEYS.set(keys).is_err() {
        unsafe {
            let _ = libc::pthread_key_delete(state_key);
            let _ = libc::pthread_key_delete(reserved_key);
        }
    }

    THREAD_STATE_KEYS.get().copied()
}

fn get_or_init_thread_state_ptr(keys: ThreadStateKeys) -> Option<ThreadStatePtr> {
    let reserved = unsafe { libc::pthread_getspecific(keys.reserved_key) };
    if !reserved.is_null() {
        let count = THREAD_STATE_RESERVED_HIT.fetch_add(1, Ordering::Relaxed) + 1;
        if should_log_every_step(count) {
            crate::log::warn(format_args!("线程状态析构保护命中: 次数={}", count));
        }
        return None;
    }

    let existing = unsafe { libc::pthread_getspecific(keys.state_key) } as ThreadStatePtr;
    if !existing.is_null() {
        return Some(existing);
    }

    let raw_ptr = Box::into_raw(Box::new(ThreadSehState::new()));
    let ret = unsafe { libc::pthread_setspecific(keys.state_key, raw_ptr as *const c_void) };
    if ret != 0 {
        unsafe {
            drop(Box::from_raw(raw_ptr));
        }
        let count = THREAD_STATE_BIND_FAIL.fetch_add(1, Ordering::Relaxed) + 1;
        if should_log_every_step(count) {
            crate::log::warn(format_args!("线程状态绑定失败: ret={} 次数={}", ret, count));
        }
        return None;
    }

    Some(raw_ptr)
}

// 仅初始化 key，不创建线程实例
pub(crate) fn init_thread_state_key() -> bool {
    ensure_thread_state_keys().is_some()
}

// 访问当前线程状态，失败时返回 None
// 闭包内不得回调用户代码，避免可变引用重入
pub(crate) fn with_thread_state<R, F>(f: F) -> Option<R>
where
    F: FnOnce(&mut ThreadSehState) -> R,
{
    let keys = ensure_thread_state_keys()?;
    let raw_ptr = get_or_init_thread_state_ptr(keys)?;
    let state = unsafe { &mut *raw_ptr };
    Some(f(state))
}

// 记录线程状态不可用，避免每次热路径刷屏
pub(crate) fn report_thread_state_unavailable(site: &str) {
    let count = THREAD_STATE_ACCESS_FAIL.fetch_add(1, Ordering::Relaxed) + 1;
    if should_log_every_step(count) {
        crate::log::warn(format_args!("线程状态不可用: site={} 次数={}", site, count));
    }
}

// 记录跳转目标固定栈溢出；溢出的捕获点仍可用，但只做栈指针校验
pub(crate) fn report_jump_target_overflow() {
    let count = JUMP_TARGET_OVERFLOW.fetch_add(1, Ordering::Relaxed) + 1;
    if should_log_every_step(count) {
        crate::log::warn(format_args!(
            "跳转目标固定栈溢出: cap={} 次数={}",
            JUMP_TARGET_CAP, count
        ));
    }
}

pub(crate) fn snapshot() -> Option<SehSnapshot> {
    with_thread_state(|state| SehSnapshot {
        head: state.head,
        phase: state.phase,
        abnormal: state.abnormal,
        current_exception: state.current_exception.clone(),
        jump_depth: state.jump_targets.len(),
        fault_boundary: state.fault_boundary,
    })
}

pub(crate) fn restore(snapshot: SehSnapshot) {
    let restored = with_thread_state(|state| {
        state.head = snapshot.head;
        state.phase = snapshot.phase;
        state.abnormal = snapshot.abnormal;
        state.current_exception = snapshot.current_exception;
        state.jump_targets.truncate(snapshot.jump_depth);
        state.fault_boundary = snapshot.fault_boundary;
    });
    if restored.is_none() {
        report_thread_state_unavailable("restore_snapshot");
    }
}
