// 分发阶段与异常终止标记，均为线程级状态，由 RAII 守卫保存并恢复
use crate::runtime::thread_state::{report_thread_state_unavailable, with_thread_state};

/// 当前线程在异常处理流程中所处的阶段
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchPhase {
    Idle,
    // 沿帧链寻找接受异常的帧
    Hunting,
    // 正在执行过滤器
    Filtering,
    // 全局 unwind：逐帧以 unwinding 标记调用 handler 并弹出
    GlobalUnwinding,
    // 单帧内按 trylevel 链执行 termination handler
    LocalUnwinding,
    // 正在执行 except 块
    HandlerBody,
}

pub fn dispatch_phase() -> DispatchPhase {
    with_thread_state(|state| state.phase()).unwrap_or(DispatchPhase::Idle)
}

/// 当前 termination handler 是否因异常或非正常控制流而执行
pub fn abnormal_termination() -> bool {
    with_thread_state(|state| state.abnormal()).unwrap_or(false)
}

pub(crate) struct PhaseScope {
    saved: Option<DispatchPhase>,
}

impl PhaseScope {
    pub(crate) fn enter(phase: DispatchPhase) -> Self {
        let saved = with_thread_state(|state| state.replace_phase(phase));
        if saved.is_none() {
            report_thread_state_unavailable("phase_enter");
        }
        Self { saved }
    }
}

impl Drop for PhaseScope {
    fn drop(&mut self) {
        if let Some(saved) = self.saved {
            let _ = with_thread_state(|state| state.replace_phase(saved));
        }
    }
}

pub(crate) struct AbnormalScope {
    saved: Option<bool>,
}

impl AbnormalScope {
    pub(crate) fn enter(abnormal: bool) -> Self {
        Self {
            saved: with_thread_state(|state| state.replace_abnormal(abnormal)),
        }
    }
}

impl Drop for AbnormalScope {
    fn drop(&mut self) {
        if let Some(saved) = self.saved {
            let _ = with_thread_state(|state| state.replace_abnormal(saved));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_scope_restores_previous_phase() {
        assert_eq!(dispatch_phase(), DispatchPhase::Idle);
        {
            let _outer = PhaseScope::enter(DispatchPhase::Hunting);
            {
                let _inner = PhaseScope::enter(DispatchPhase::Filtering);
                assert_eq!(dispatch_phase(), DispatchPhase::Filtering);
            }
            assert_eq!(dispatch_phase(), DispatchPhase::Hunting);
        }
        assert_eq!(dispatch_phase(), DispatchPhase::Idle);
    }

    #[test]
    fn abnormal_scope_nests() {
        assert!(!abnormal_termination());
        let outer = AbnormalScope::enter(true);
        {
            let _inner = AbnormalScope::enter(false);
            assert!(!abnormal_termination());
        }
        assert!(abnormal_termination());
        drop(outer);
        assert!(!abnormal_termination());
    }
}
