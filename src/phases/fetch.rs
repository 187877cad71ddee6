//! FetchRunner：有界尝试循环（最多 MAX_ATTEMPTS 次），失败按来源标记并作为反馈注入下一次编译
//!
//! 每次尝试：编译（builder）→ 结构校验 + 允许列表（builder）→ 预检（preflight，不触达连接器）
//! → 执行并嗅探内嵌错误（tableau）→ 规范化并落盘为产物。
//! 尝试耗尽时以最后一条反馈作为终止错误；取消在任意时刻生效且不再产生副作用。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connector::{sniff_embedded_error, DatasourceConnector, QueryRequest};
use crate::core::cancel::run_cancelable;
use crate::core::error::{ErrorKind, PipelineError};
use crate::core::retry::{attempt_with_feedback, AttemptContext, RetryPolicy};
use crate::llm::AgentKind;
use crate::memory::{row_count, shape_summary, unwrap_text_payload, ArtifactStore, Message};
use crate::query::{check_allow_list, preflight, validate_planner_payload, AnalysisPlan, PlannerPayload};

use super::plan::{compile_messages, PlanningContext};
use super::{elapsed_ms, to_json, AgentRunner, CallError, EventSink, Halt, OrchestratorEvent, PhaseResult};

pub const MAX_ATTEMPTS: usize = 3;
/// 注入编译请求的最近反馈条数
pub const FEEDBACK_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackSource {
    Builder,
    Preflight,
    Tableau,
}

impl FeedbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackSource::Builder => "builder",
            FeedbackSource::Preflight => "preflight",
            FeedbackSource::Tableau => "tableau",
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            FeedbackSource::Builder => ErrorKind::BuilderValidation,
            FeedbackSource::Preflight => ErrorKind::PreflightValidation,
            FeedbackSource::Tableau => ErrorKind::SourceError,
        }
    }

    fn hint(&self) -> &'static str {
        match self {
            FeedbackSource::Builder => "Return a single valid JSON payload using only allowed fields.",
            FeedbackSource::Preflight => "Fix the filter attributes reported by preflight.",
            FeedbackSource::Tableau => "Adjust the query to resolve the datasource error.",
        }
    }
}

/// 单次尝试的失败反馈；仅在一次 fetch 调用内累积
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchFeedback {
    pub attempt: usize,
    pub source: FeedbackSource,
    pub message: String,
}

impl FetchFeedback {
    fn into_error(self) -> PipelineError {
        match self.source {
            FeedbackSource::Builder => PipelineError::BuilderValidation(self.message),
            FeedbackSource::Preflight => PipelineError::PreflightValidation(self.message),
            FeedbackSource::Tableau => PipelineError::SourceError(self.message),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FetchFailure {
    Feedback(FetchFeedback),
    Cancelled,
    /// 产物落盘失败（不重试）
    Storage(String),
}

impl FetchFailure {
    fn is_retryable(&self) -> bool {
        match self {
            FetchFailure::Feedback(fb) => fb.source.error_kind().is_retryable(),
            FetchFailure::Cancelled | FetchFailure::Storage(_) => false,
        }
    }
}

pub fn fetch_retry_policy() -> RetryPolicy<FetchFailure> {
    RetryPolicy::new(MAX_ATTEMPTS)
        .retry_if(FetchFailure::is_retryable)
        .with_hint(|failures| {
            let recent: Vec<&FetchFeedback> = failures
                .iter()
                .filter_map(|f| match f {
                    FetchFailure::Feedback(fb) => Some(fb),
                    _ => None,
                })
                .collect();
            if recent.is_empty() {
                return None;
            }
            let start = recent.len().saturating_sub(FEEDBACK_WINDOW);
            serde_json::to_string(&recent[start..]).ok()
        })
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub summary: String,
    pub artifact: String,
    pub rows: Option<usize>,
    pub payload: PlannerPayload,
    pub attempts: usize,
}

pub struct FetchRunner {
    connector: Arc<dyn DatasourceConnector>,
    artifacts: ArtifactStore,
    query_timeout: Duration,
}

impl FetchRunner {
    pub fn new(connector: Arc<dyn DatasourceConnector>, artifacts: ArtifactStore, query_timeout: Duration) -> Self {
        Self {
            connector,
            artifacts,
            query_timeout,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    async fn attempt(
        &self,
        agents: &AgentRunner,
        ctx: PlanningContext<'_>,
        base: &[Message],
        attempt: AttemptContext,
        cancel: &CancellationToken,
    ) -> Result<Fetched, FetchFailure> {
        let feedback = |source: FeedbackSource, message: String| {
            FetchFailure::Feedback(FetchFeedback {
                attempt: attempt.attempt,
                source,
                message,
            })
        };

        let mut messages = base.to_vec();
        messages.push(Message::system(format!("ATTEMPT={}/{}", attempt.attempt, attempt.max_attempts)));
        if let Some(hint) = attempt.hint.as_deref() {
            messages.push(Message::system(format!("BUILDER_FEEDBACK_JSON={}", hint)));
        }

        let value = match agents.call_json(AgentKind::VizqlBuilder, &messages, cancel).await {
            Ok((value, _)) => value,
            Err(CallError::Cancelled) => return Err(FetchFailure::Cancelled),
            Err(e) => return Err(feedback(FeedbackSource::Builder, e.to_string())),
        };
        let payload = validate_planner_payload(&value, ctx.datasource_luid)
            .map_err(|e| feedback(FeedbackSource::Builder, e.summary()))?;
        if let Some(msg) = check_allow_list(&payload.query, ctx.allowed_fields) {
            return Err(feedback(FeedbackSource::Builder, msg));
        }

        let problems = preflight(&payload.query);
        if !problems.is_empty() {
            return Err(feedback(FeedbackSource::Preflight, problems));
        }

        let request = QueryRequest {
            datasource_luid: ctx.datasource_luid.to_string(),
            query: payload.query.clone(),
            options: Some(payload.options.clone()).filter(|o| !o.is_empty()),
            timeout: Some(self.query_timeout),
        };
        let result = run_cancelable(cancel, || self.connector.query_datasource(&request))
            .await
            .map_err(|_| FetchFailure::Cancelled)?;
        let raw = result.map_err(|e| feedback(FeedbackSource::Tableau, e.feedback_message()))?;
        if let Some(embedded) = sniff_embedded_error(&raw) {
            return Err(feedback(FeedbackSource::Tableau, embedded));
        }

        let normalized = unwrap_text_payload(raw);
        let saved = run_cancelable(cancel, || self.artifacts.save(&normalized))
            .await
            .map_err(|_| FetchFailure::Cancelled)?
            .map_err(|e| FetchFailure::Storage(format!("Failed to save query result: {}", e)))?;

        Ok(Fetched {
            summary: shape_summary(&normalized),
            artifact: saved.rel_path,
            rows: row_count(&normalized),
            payload,
            attempts: attempt.attempt,
        })
    }

    /// 执行抓取；planned 为 PlanRunner 已编译的载荷（作为编译器参考）
    pub async fn run(
        &self,
        agents: &AgentRunner,
        ctx: PlanningContext<'_>,
        plan: &AnalysisPlan,
        planned: Option<&PlannerPayload>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> PhaseResult<Fetched> {
        let started = Instant::now();
        events.emit(OrchestratorEvent::FetchStart {
            datasource_luid: ctx.datasource_luid.to_string(),
        });

        let planned_json = planned.map(to_json);
        let base = compile_messages(ctx, plan, planned_json.as_ref());
        let policy = fetch_retry_policy();

        let result = attempt_with_feedback(
            &policy,
            |attempt| self.attempt(agents, ctx, &base, attempt, cancel),
            |failure, attempt| {
                if let FetchFailure::Feedback(fb) = failure {
                    tracing::warn!(
                        attempt = attempt.attempt,
                        source = fb.source.as_str(),
                        message = %fb.message,
                        "fetch attempt failed, retrying"
                    );
                    events.emit(OrchestratorEvent::FetchRetry {
                        attempt: attempt.attempt,
                        source: fb.source.as_str().to_string(),
                        reason: fb.message.clone(),
                        hint: fb.source.hint().to_string(),
                    });
                }
            },
        )
        .await;

        match result {
            Ok(done) => {
                let fetched = done.value;
                let duration_ms = elapsed_ms(started);
                tracing::info!(
                    datasource = %ctx.datasource_luid,
                    attempts = fetched.attempts,
                    artifact = %fetched.artifact,
                    summary = %fetched.summary,
                    duration_ms,
                    "fetch done"
                );
                events.emit(OrchestratorEvent::FetchDone {
                    summary: fetched.summary.clone(),
                    artifact: fetched.artifact.clone(),
                    attempts: fetched.attempts,
                    duration_ms,
                });
                Ok(fetched)
            }
            Err(err) => {
                let attempts = err.attempts();
                let error = match err.into_last() {
                    Some(FetchFailure::Cancelled) => return Err(Halt::Cancelled),
                    Some(FetchFailure::Feedback(fb)) => fb.into_error(),
                    Some(FetchFailure::Storage(msg)) => PipelineError::SourceError(msg),
                    None => PipelineError::SourceError("fetch produced no result".to_string()),
                };
                let message = crate::core::error::format_for_user(&error);
                tracing::warn!(attempts, error = %message, "fetch failed");
                events.emit(OrchestratorEvent::FetchError {
                    message,
                    duration_ms: elapsed_ms(started),
                });
                Err(Halt::Failed(error))
            }
        }
    }
}
