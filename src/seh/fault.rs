// 硬件故障的 SEH 分发：守卫捕获的故障转成异常记录，在帧仍在链上时沿帧链分发
use super::chain::{self, Registration};
use super::dispatch::raise_record;
use super::transfer::{self, Transfer};
use super::unwind::global_unwind;
use crate::fault_guard::{self, FaultInfo};
use crate::log;
use crate::machine::Context;
use crate::runtime::thread_state::{report_thread_state_unavailable, with_thread_state};
use crate::signal::translator;

// guarded 区域的分发边界，离开时还原上一层
pub(crate) struct FaultBoundary {
    previous: Option<*const Registration>,
    restore: bool,
}

impl FaultBoundary {
    fn replace(boundary: Option<*const Registration>) -> Self {
        match with_thread_state(|state| state.replace_fault_boundary(boundary)) {
            Some(previous) => Self {
                previous,
                restore: true,
            },
            None => {
                report_thread_state_unavailable("fault_boundary");
                Self {
                    previous: None,
                    restore: false,
                }
            }
        }
    }

    // 以当前链头为边界
    pub(crate) fn enter() -> Self {
        Self::replace(Some(chain::head()))
    }

    // 分发期间暂停边界，过滤器和 cleanup 内的帧不再建立恢复点
    pub(crate) fn suspend() -> Self {
        Self::replace(None)
    }
}

impl Drop for FaultBoundary {
    fn drop(&mut self) {
        if !self.restore {
            return;
        }
        let previous = self.previous.take();
        with_thread_state(|state| {
            state.replace_fault_boundary(previous);
        });
    }
}

/// 把守卫捕获的故障作为异常分发；只有某个 handler 要求继续执行时返回
pub(crate) fn dispatch_fault(fault: &FaultInfo) {
    let mut record = translator::record_from_fault(fault);
    let mut context = Context::capture();
    if fault.pc != 0 {
        context.pc = fault.pc;
    }
    let _suspended = FaultBoundary::suspend();
    raise_record(&mut record, &context);
}

/// 在帧自己的恢复点下执行帧体
///
/// 只在 guarded 区域内生效。帧体内的硬件故障回到这里时帧仍在链上，
/// 其 filter 和 finally 按普通异常参与分发。分发要求继续执行时，
/// 边界之上的帧以非正常终止方式 unwind，然后回到 guarded。
pub(crate) fn run_frame_body<R, F>(body: F) -> R
where
    F: FnOnce() -> R,
{
    let Some(boundary) = with_thread_state(|state| state.fault_boundary()).flatten() else {
        return body();
    };
    let fault = match fault_guard::with_recovery_point(body) {
        Ok(Ok(value)) => return value,
        Ok(Err(fault)) => fault,
        Err(body) => return body(),
    };

    log::debug(format_args!(
        "帧体内硬件故障: signum={} addr={:#x} head={:#x}",
        fault.signum,
        fault.address,
        chain::head() as usize
    ));
    dispatch_fault(&fault);
    global_unwind(boundary, None, &Context::capture());
    transfer::raise(Transfer::FaultContinued)
}
