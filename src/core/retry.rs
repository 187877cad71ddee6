//! 重试策略与「带反馈的重试」组合子
//!
//! PlanRunner（分析阶段重试一次并附加提示）与 FetchRunner（三次尝试、注入最近反馈）共用同一循环：
//! 每次尝试前由 build_hint 从历史失败生成上下文，失败后由 is_retryable 决定继续或中止。

use std::future::Future;

/// 重试策略值对象
pub struct RetryPolicy<E> {
    /// 最多尝试次数（含首次），至少为 1
    pub max_attempts: usize,
    pub is_retryable: fn(&E) -> bool,
    /// 由此前全部失败生成下一次尝试的提示；首次尝试时传入空切片
    pub build_hint: fn(&[E]) -> Option<String>,
}

impl<E> RetryPolicy<E> {
    /// 所有错误均可重试、无提示
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            is_retryable: |_| true,
            build_hint: |_| None,
        }
    }

    pub fn retry_if(mut self, is_retryable: fn(&E) -> bool) -> Self {
        self.is_retryable = is_retryable;
        self
    }

    pub fn with_hint(mut self, build_hint: fn(&[E]) -> Option<String>) -> Self {
        self.build_hint = build_hint;
        self
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            is_retryable: self.is_retryable,
            build_hint: self.build_hint,
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// 单次尝试的上下文（attempt 从 1 开始）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub attempt: usize,
    pub max_attempts: usize,
    pub hint: Option<String>,
}

impl AttemptContext {
    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// 成功结果及其之前累积的失败
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub value: T,
    pub attempts: usize,
    pub failures: Vec<E>,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// 遇到不可重试的错误，立即中止
    Aborted { error: E, failures: Vec<E> },
    /// 尝试次数耗尽，按发生顺序保留全部失败
    Exhausted(Vec<E>),
}

impl<E> RetryError<E> {
    /// 终止本次调用的那个错误（中止时为该错误，耗尽时为最后一次失败）
    pub fn last(&self) -> Option<&E> {
        match self {
            RetryError::Aborted { error, .. } => Some(error),
            RetryError::Exhausted(failures) => failures.last(),
        }
    }

    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Aborted { error, .. } => Some(error),
            RetryError::Exhausted(mut failures) => failures.pop(),
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Aborted { failures, .. } => failures.len() + 1,
            RetryError::Exhausted(failures) => failures.len(),
        }
    }
}

/// 按策略执行 op；on_retry 仅在确定会再次尝试时调用（最后一次失败不会触发）
pub async fn attempt_with_feedback<T, E, Op, Fut, OnRetry>(
    policy: &RetryPolicy<E>,
    mut op: Op,
    mut on_retry: OnRetry,
) -> Result<Attempted<T, E>, RetryError<E>>
where
    Op: FnMut(AttemptContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    OnRetry: FnMut(&E, &AttemptContext),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut failures: Vec<E> = Vec::new();

    for attempt in 1..=max_attempts {
        let ctx = AttemptContext {
            attempt,
            max_attempts,
            hint: (policy.build_hint)(&failures),
        };
        match op(ctx.clone()).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                    failures,
                })
            }
            Err(error) => {
                if !(policy.is_retryable)(&error) {
                    return Err(RetryError::Aborted { error, failures });
                }
                if !ctx.is_last() {
                    on_retry(&error, &ctx);
                }
                failures.push(error);
            }
        }
    }

    Err(RetryError::Exhausted(failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Soft(String),
        Hard,
    }

    fn soft_only(e: &TestError) -> bool {
        matches!(e, TestError::Soft(_))
    }

    fn join_hint(errors: &[TestError]) -> Option<String> {
        let parts: Vec<String> = errors
            .iter()
            .filter_map(|e| match e {
                TestError::Soft(m) => Some(m.clone()),
                TestError::Hard => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("|"))
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_retry_with_hint() {
        let policy = RetryPolicy::new(3).retry_if(soft_only).with_hint(join_hint);
        let mut seen_hints = Vec::new();
        let mut retries = 0;
        let result = attempt_with_feedback(
            &policy,
            |ctx| {
                seen_hints.push(ctx.hint.clone());
                async move {
                    if ctx.attempt < 2 {
                        Err(TestError::Soft(format!("bad{}", ctx.attempt)))
                    } else {
                        Ok(ctx.attempt)
                    }
                }
            },
            |_, _| retries += 1,
        )
        .await
        .unwrap();
        assert_eq!(result.value, 2);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(seen_hints, vec![None, Some("bad1".to_string())]);
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn test_exhausted_keeps_all_failures_and_skips_last_retry_callback() {
        let policy: RetryPolicy<TestError> = RetryPolicy::new(3);
        let calls = AtomicUsize::new(0);
        let mut retries = 0;
        let err = attempt_with_feedback(
            &policy,
            |ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(TestError::Soft(format!("m{}", ctx.attempt))) }
            },
            |_, _| retries += 1,
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.last(), Some(&TestError::Soft("m3".into())));
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_immediately() {
        let policy = RetryPolicy::new(5).retry_if(soft_only);
        let calls = AtomicUsize::new(0);
        let err = attempt_with_feedback(
            &policy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Hard) }
            },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Aborted { error: TestError::Hard, .. }));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy: RetryPolicy<TestError> = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts, 1);
    }
}
