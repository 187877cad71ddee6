//! 协作式取消：所有外部调用（Agent、连接器、文件、代码解释器）统一经 run_cancelable 包装
//!
//! 先检查取消信号再创建任务（已取消时不产生任何副作用），随后与取消信号竞速；
//! 取消先到时丢弃进行中的 future，不阻塞本轮结束。

use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 本轮已被用户取消
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// 若已取消则立即返回 Err(Cancelled)
pub fn ensure_active(token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

/// 在取消信号下执行 factory 产生的 future
///
/// factory 仅在未取消时调用；取消与完成同时就绪时优先判定为取消。
pub async fn run_cancelable<F, Fut, T>(token: &CancellationToken, factory: F) -> Result<T, Cancelled>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    ensure_active(token)?;
    let fut = factory();
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let out = run_cancelable(&token, || async { 41 + 1 }).await;
        assert_eq!(out, Ok(42));
    }

    #[tokio::test]
    async fn test_pre_cancelled_never_invokes_factory() {
        let token = CancellationToken::new();
        token.cancel();
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let out = run_cancelable(&token, move || {
            flag.store(true, Ordering::SeqCst);
            async { 1 }
        })
        .await;
        assert_eq!(out, Err(Cancelled));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_in_flight_call() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let out = run_cancelable(&token, || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "done"
        })
        .await;
        assert_eq!(out, Err(Cancelled));
    }
}
