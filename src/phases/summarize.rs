//! SummarizeRunner：在代码执行（CI）与轻量路径之间路由
//!
//! 计划中任一步骤带 ci 指令，或任一产物行数超过 ROWS_THRESHOLD 时走 CI；CI 与固定超时竞速，
//! 结果分为 success / timeout / empty / error，非 success 一律回落到轻量路径而不是让本轮失败。
//! 取消直接结束，不再运行另一条路径。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::core::cancel::{ensure_active, run_cancelable, Cancelled};
use crate::memory::{row_count, ArtifactStore};
use crate::query::AnalysisPlan;

use super::code_interpreter::{CiRequest, CodeInterpreter};
use super::lightweight::{run_lightweight, LightweightInput};
use super::{elapsed_ms, AgentRunner, EventSink, OrchestratorEvent};

pub const ROWS_THRESHOLD: usize = 30;
pub const CI_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_SNIPPET_CHARS: usize = 6000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPath {
    CodeExecution,
    Lightweight,
}

impl SummaryPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryPath::CodeExecution => "ci",
            SummaryPath::Lightweight => "lightweight",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SummarizeInput<'a> {
    pub message: &'a str,
    pub artifacts: &'a [String],
    pub plan: Option<&'a AnalysisPlan>,
    pub brief: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub reply: String,
    pub path: SummaryPath,
}

pub struct SummarizeRunner {
    store: ArtifactStore,
    ci: Option<Arc<dyn CodeInterpreter>>,
    ci_timeout: Duration,
    snippet_chars: usize,
}

impl SummarizeRunner {
    pub fn new(store: ArtifactStore, ci: Option<Arc<dyn CodeInterpreter>>) -> Self {
        Self {
            store,
            ci,
            ci_timeout: CI_TIMEOUT,
            snippet_chars: DEFAULT_SNIPPET_CHARS,
        }
    }

    pub fn with_ci_timeout(mut self, timeout: Duration) -> Self {
        self.ci_timeout = timeout;
        self
    }

    pub fn with_snippet_chars(mut self, chars: usize) -> Self {
        self.snippet_chars = chars.max(1);
        self
    }

    /// 路由判定；CI 未启用时总是轻量路径
    pub async fn route(&self, input: SummarizeInput<'_>, cancel: &CancellationToken) -> Result<SummaryPath, Cancelled> {
        if self.ci.is_none() {
            return Ok(SummaryPath::Lightweight);
        }
        if input.plan.map(AnalysisPlan::requests_code_execution).unwrap_or(false) {
            return Ok(SummaryPath::CodeExecution);
        }
        for rel in input.artifacts {
            let rows = match run_cancelable(cancel, || self.store.read(rel)).await? {
                Ok(payload) => row_count(&payload).unwrap_or(0),
                Err(e) => {
                    tracing::debug!(artifact = %rel, error = %e, "artifact unreadable for routing");
                    0
                }
            };
            if rows > ROWS_THRESHOLD {
                return Ok(SummaryPath::CodeExecution);
            }
        }
        Ok(SummaryPath::Lightweight)
    }

    /// CI 路径；返回 None 表示需回落到轻量路径
    async fn run_ci(
        &self,
        ci: &dyn CodeInterpreter,
        input: SummarizeInput<'_>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Cancelled> {
        let started = Instant::now();
        let request = CiRequest {
            question: input.message.to_string(),
            artifact_paths: input.artifacts.to_vec(),
            files: input.artifacts.iter().map(|a| self.store.resolve(a)).collect(),
            plan: input.plan.cloned(),
            brief: input.brief.map(String::from),
        };
        events.emit(OrchestratorEvent::CiStart {
            files: request.files.len(),
        });

        let raced = run_cancelable(cancel, || tokio::time::timeout(self.ci_timeout, ci.run(&request))).await?;
        let duration_ms = elapsed_ms(started);
        match raced {
            Err(_) => {
                tracing::warn!(timeout_ms = self.ci_timeout.as_millis() as u64, "code interpreter timed out");
                events.emit(OrchestratorEvent::CiTimeout {
                    timeout_ms: self.ci_timeout.as_millis() as u64,
                });
                Ok(None)
            }
            Ok(Ok(text)) if !text.trim().is_empty() => {
                events.emit(OrchestratorEvent::CiSuccess { duration_ms });
                Ok(Some(text.trim().to_string()))
            }
            Ok(Ok(_)) => {
                events.emit(OrchestratorEvent::CiEmpty { duration_ms });
                Ok(None)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "code interpreter failed");
                events.emit(OrchestratorEvent::CiError {
                    message: e.to_string(),
                    duration_ms,
                });
                Ok(None)
            }
        }
    }

    pub async fn summarize(
        &self,
        agents: &AgentRunner,
        input: SummarizeInput<'_>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Summary, Cancelled> {
        ensure_active(cancel)?;
        let started = Instant::now();
        let route = self.route(input, cancel).await?;
        events.emit(OrchestratorEvent::SummarizeStart {
            artifacts: input.artifacts.to_vec(),
            route: route.as_str().to_string(),
        });

        if let (SummaryPath::CodeExecution, Some(ci)) = (route, self.ci.as_ref()) {
            if let Some(reply) = self.run_ci(ci.as_ref(), input, events, cancel).await? {
                events.emit(OrchestratorEvent::SummarizeDone {
                    path: SummaryPath::CodeExecution.as_str().to_string(),
                    duration_ms: elapsed_ms(started),
                });
                return Ok(Summary {
                    reply,
                    path: SummaryPath::CodeExecution,
                });
            }
        }

        let reply = run_lightweight(
            agents,
            &self.store,
            LightweightInput {
                message: input.message,
                artifacts: input.artifacts,
                plan: input.plan,
                snippet_chars: self.snippet_chars,
            },
            events,
            cancel,
        )
        .await?;
        events.emit(OrchestratorEvent::SummarizeDone {
            path: SummaryPath::Lightweight.as_str().to_string(),
            duration_ms: elapsed_ms(started),
        });
        Ok(Summary {
            reply,
            path: SummaryPath::Lightweight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AgentCatalog, AgentKind, MockLlmClient};
    use crate::phases::code_interpreter::CiError;
    use crate::phases::events::drain;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Slow(Duration),
        Reply(&'static str),
        Fail,
    }

    struct FakeCi {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl FakeCi {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CodeInterpreter for FakeCi {
        async fn run(&self, _: &CiRequest) -> Result<String, CiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Slow(d) => {
                    tokio::time::sleep(*d).await;
                    Ok("too late".into())
                }
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::Fail => Err(CiError::Request("status=500".into())),
            }
        }
    }

    fn rows(n: usize) -> Value {
        json!({"data": (0..n).map(|i| json!({"Sales": i})).collect::<Vec<_>>()})
    }

    fn agents(mock: Arc<MockLlmClient>) -> AgentRunner {
        AgentRunner::new(mock, Arc::new(AgentCatalog::with_defaults("m")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_result_times_out_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "out");
        let saved = store.save(&rows(500)).await.unwrap();
        let ci = FakeCi::new(Behavior::Slow(Duration::from_secs(600)));
        let runner = SummarizeRunner::new(store, Some(ci.clone()));
        let mock = Arc::new(MockLlmClient::new().reply(AgentKind::LightweightSummarizer, "**Answer** steady"));
        let artifacts = vec![saved.rel_path];
        let (sink, mut rx) = EventSink::channel();

        let summary = runner
            .summarize(
                &agents(mock),
                SummarizeInput {
                    message: "sales by day",
                    artifacts: &artifacts,
                    plan: None,
                    brief: None,
                },
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.path, SummaryPath::Lightweight);
        assert_eq!(summary.reply, "**Answer** steady");
        assert_eq!(ci.calls.load(Ordering::SeqCst), 1);
        let types: Vec<_> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "summarize:start",
                "summarize:ci:start",
                "summarize:ci:timeout",
                "summarize:lightweight",
                "summarize:done"
            ]
        );
    }

    #[tokio::test]
    async fn test_small_result_skips_ci() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "out");
        let saved = store.save(&rows(5)).await.unwrap();
        let ci = FakeCi::new(Behavior::Reply("ci text"));
        let runner = SummarizeRunner::new(store, Some(ci.clone()));
        let artifacts = vec![saved.rel_path];
        let path = runner
            .route(
                SummarizeInput {
                    message: "q",
                    artifacts: &artifacts,
                    plan: None,
                    brief: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(path, SummaryPath::Lightweight);
        assert_eq!(ci.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_explicit_ci_step_routes_to_ci() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "out");
        let saved = store.save(&rows(2)).await.unwrap();
        let ci = FakeCi::new(Behavior::Reply("regression says yes"));
        let runner = SummarizeRunner::new(store, Some(ci));
        let plan: AnalysisPlan = serde_json::from_value(json!({
            "steps": [{"id": "s1", "goal": "g", "ci": {"instructions": "fit a trend"}}]
        }))
        .unwrap();
        let artifacts = vec![saved.rel_path];
        let summary = runner
            .summarize(
                &agents(Arc::new(MockLlmClient::new())),
                SummarizeInput {
                    message: "q",
                    artifacts: &artifacts,
                    plan: Some(&plan),
                    brief: None,
                },
                &EventSink::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.path, SummaryPath::CodeExecution);
        assert_eq!(summary.reply, "regression says yes");
    }

    #[tokio::test]
    async fn test_ci_error_falls_back_to_lightweight() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "out");
        let saved = store.save(&rows(40)).await.unwrap();
        let runner = SummarizeRunner::new(store, Some(FakeCi::new(Behavior::Fail)));
        let mock = Arc::new(MockLlmClient::new().reply(AgentKind::LightweightSummarizer, "light"));
        let artifacts = vec![saved.rel_path];
        let (sink, mut rx) = EventSink::channel();
        let summary = runner
            .summarize(
                &agents(mock),
                SummarizeInput {
                    message: "q",
                    artifacts: &artifacts,
                    plan: None,
                    brief: None,
                },
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(summary.reply, "light");
        assert!(drain(&mut rx).iter().any(|e| e.event_type() == "summarize:ci:error"));
    }

    #[tokio::test]
    async fn test_cancelled_does_not_run_alternate_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "out");
        let saved = store.save(&rows(100)).await.unwrap();
        let ci = FakeCi::new(Behavior::Slow(Duration::from_secs(60)));
        let runner = SummarizeRunner::new(store, Some(ci));
        let mock = Arc::new(MockLlmClient::new().reply(AgentKind::LightweightSummarizer, "light"));
        let artifacts = vec![saved.rel_path];
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = runner
            .summarize(
                &agents(mock.clone()),
                SummarizeInput {
                    message: "q",
                    artifacts: &artifacts,
                    plan: None,
                    brief: None,
                },
                &EventSink::noop(),
                &token,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(mock.call_count(AgentKind::LightweightSummarizer), 0);
    }
}
