// 非本地控制转移：以 panic payload 携带目标，由目标帧的 catch_unwind 截获
//
// 沿途 Rust 栈帧的析构照常执行；帧链已在转移前由 unwind 引擎弹出，
// 各帧的 Installed 析构只会把链表头恢复到已经一致的位置。
use super::ScopeHandler;
use std::num::NonZeroI32;
use std::panic::{self, AssertUnwindSafe};

pub(crate) enum Transfer {
    // trylevel 帧接受异常，跳到 except 块
    Except {
        frame: usize,
        handler: ScopeHandler,
        level: i32,
        code: u32,
    },
    // 查表帧接受异常，跳到 jump_target 对应的落地点
    Landing {
        frame: usize,
        scope: usize,
        landing: u32,
        code: u32,
    },
    // longjmp 回到 setjmp 捕获点
    LongJump { target: u64, value: NonZeroI32 },
    // 帧体内的硬件故障被要求继续执行，回到最内层 guarded
    FaultContinued,
}

impl Transfer {
    pub(crate) fn targets_frame(&self, reg: usize) -> bool {
        match *self {
            Self::Except { frame, .. } | Self::Landing { frame, .. } => frame == reg,
            Self::LongJump { .. } | Self::FaultContinued => false,
        }
    }
}

pub(crate) fn raise(transfer: Transfer) -> ! {
    panic::resume_unwind(Box::new(transfer))
}

// 执行 body；accept 认领的转移以 Err 返回，其余 payload 继续向外传播
pub(crate) fn catch<R, F, A>(body: F, accept: A) -> Result<R, Transfer>
where
    F: FnOnce() -> R,
    A: Fn(&Transfer) -> bool,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Transfer>() {
            Ok(transfer) if accept(&transfer) => Err(*transfer),
            Ok(transfer) => panic::resume_unwind(transfer),
            Err(other) => panic::resume_unwind(other),
        },
    }
}
