//! 编排器：按 triage → metadata → selection → planning → fetch → summarize 顺序执行一轮
//!
//! 接收调用方持有的 SessionState，修改其副本并返回新快照。用户消息在各阶段开始前追加，
//! 助手回复在结束时恰好追加一次（包括失败、澄清与取消）。每个阶段开始前检查取消信号；
//! 任意终止路径都发出 final 事件。

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::core::cancel::ensure_active;
use crate::core::error::{format_for_user, PipelineError};
use crate::core::state::{SessionMetadata, SessionState, TurnPhase, TurnResult, TurnStatus};
use crate::memory::{MetadataCache, Message};
use crate::phases::fetch::FetchRunner;
use crate::phases::metadata::run_metadata;
use crate::phases::plan::{run_plan, PlanningContext};
use crate::phases::selector::{run_selector, SelectorInput, DEFAULT_MAX_FIELDS};
use crate::phases::summarize::{SummarizeInput, SummarizeRunner};
use crate::phases::triage::{run_triage, TriageInput};
use crate::phases::{elapsed_ms, AgentRunner, EventSink, Halt, OrchestratorEvent};

pub const CANCELLED_REPLY: &str = "The request was cancelled.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub message: String,
    pub datasource_luid: String,
    /// 跳过字段目录缓存
    pub refresh_metadata: bool,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>, datasource_luid: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            datasource_luid: datasource_luid.into(),
            refresh_metadata: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_fields: usize,
    pub max_history_messages: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_fields: DEFAULT_MAX_FIELDS,
            max_history_messages: 20,
        }
    }
}

pub struct Orchestrator {
    agents: AgentRunner,
    metadata: Arc<MetadataCache>,
    fetch: FetchRunner,
    summarize: SummarizeRunner,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        agents: AgentRunner,
        metadata: Arc<MetadataCache>,
        fetch: FetchRunner,
        summarize: SummarizeRunner,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            agents,
            metadata,
            fetch,
            summarize,
            settings,
        }
    }

    pub fn metadata_cache(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    /// 执行一轮；从不返回错误，所有失败都体现在 TurnResult.status 与 reply 中
    pub async fn run_turn(
        &self,
        request: &TurnRequest,
        state: &SessionState,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> TurnResult {
        let started = Instant::now();

        if let Some(err) = validate_request(request) {
            let reply = format_for_user(&err);
            events.emit(OrchestratorEvent::Error {
                kind: err.kind().as_str().to_string(),
                message: reply.clone(),
            });
            events.emit(OrchestratorEvent::Final {
                reply: reply.clone(),
                duration_ms: elapsed_ms(started),
            });
            return TurnResult {
                reply,
                status: TurnStatus::Failed,
                state: state.clone(),
                artifact_paths: Vec::new(),
                duration_ms: elapsed_ms(started),
            };
        }

        let mut next = state.clone();
        let prior_history: Vec<Message> = state.recent_history(self.settings.max_history_messages).to_vec();
        next.history.push(Message::user(request.message.clone()));

        let mut phase = TurnPhase::Triage;
        let mut artifacts: Vec<String> = Vec::new();
        let outcome = self
            .drive(request, &prior_history, &mut next, &mut artifacts, &mut phase, events, cancel)
            .await;

        let (reply, status) = match outcome {
            Ok(reply) => (reply, TurnStatus::Completed),
            Err(Halt::Reply(text)) => (text, TurnStatus::Completed),
            Err(Halt::Clarify(text)) => (text, TurnStatus::Clarification),
            Err(Halt::Failed(err)) => {
                let reply = format_for_user(&err);
                tracing::warn!(phase = phase.as_str(), kind = err.kind().as_str(), error = %err, "turn failed");
                events.emit(OrchestratorEvent::Error {
                    kind: err.kind().as_str().to_string(),
                    message: reply.clone(),
                });
                (reply, TurnStatus::Failed)
            }
            Err(Halt::Cancelled) => {
                tracing::info!(phase = phase.as_str(), "turn cancelled");
                events.emit(OrchestratorEvent::Cancelled {
                    phase: phase.as_str().to_string(),
                });
                (CANCELLED_REPLY.to_string(), TurnStatus::Cancelled)
            }
        };

        next.history.push(Message::assistant(reply.clone()));
        let duration_ms = elapsed_ms(started);
        events.emit(OrchestratorEvent::Final {
            reply: reply.clone(),
            duration_ms,
        });
        tracing::info!(status = ?status, phase = phase.as_str(), duration_ms, "turn finished");

        TurnResult {
            reply,
            status,
            state: next,
            artifact_paths: artifacts,
            duration_ms,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        request: &TurnRequest,
        prior_history: &[Message],
        state: &mut SessionState,
        artifacts: &mut Vec<String>,
        phase: &mut TurnPhase,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<String, Halt> {
        let message = request.message.trim();
        let luid = request.datasource_luid.trim();

        *phase = TurnPhase::Triage;
        ensure_active(cancel)?;
        let known_fields = state.fields_for(luid).map(|f| f.to_vec());
        let triage = run_triage(
            &self.agents,
            TriageInput {
                message,
                history: prior_history,
                known_fields: known_fields.as_deref(),
            },
            events,
            cancel,
        )
        .await?;
        state.triage_context = Some(triage.clone());

        *phase = TurnPhase::Metadata;
        ensure_active(cancel)?;
        let fields = run_metadata(&self.metadata, state, luid, request.refresh_metadata, events, cancel).await?;
        state.metadata = Some(SessionMetadata {
            datasource_luid: luid.to_string(),
            fields: fields.clone(),
        });

        *phase = TurnPhase::Selection;
        ensure_active(cancel)?;
        let selection = run_selector(
            &self.agents,
            SelectorInput {
                message,
                fields: &fields,
                required_fields: &triage.required_fields,
                filter_hints: &triage.filter_hints,
                max_fields: self.settings.max_fields,
            },
            events,
            cancel,
        )
        .await?;

        let ctx = PlanningContext {
            message,
            datasource_luid: luid,
            allowed_fields: &selection.allowed_fields,
            aliases: &selection.aliases,
            triage: &triage,
        };

        *phase = TurnPhase::Planning;
        ensure_active(cancel)?;
        let plan = run_plan(&self.agents, ctx, events, cancel).await?;
        state.analysis_plan = Some(plan.analysis_plan.clone());

        *phase = TurnPhase::Fetch;
        ensure_active(cancel)?;
        let fetched = self
            .fetch
            .run(&self.agents, ctx, &plan.analysis_plan, Some(&plan.payload), events, cancel)
            .await?;
        artifacts.push(fetched.artifact.clone());
        state.artifacts.push(fetched.artifact.clone());

        *phase = TurnPhase::Summarize;
        ensure_active(cancel)?;
        let summary = self
            .summarize
            .summarize(
                &self.agents,
                SummarizeInput {
                    message,
                    artifacts: artifacts.as_slice(),
                    plan: Some(&plan.analysis_plan),
                    brief: triage.brief_natural.as_deref().or(triage.brief.as_deref()),
                },
                events,
                cancel,
            )
            .await?;
        Ok(summary.reply)
    }
}

fn validate_request(request: &TurnRequest) -> Option<PipelineError> {
    let mut missing = Vec::new();
    if request.message.trim().is_empty() {
        missing.push("message");
    }
    if request.datasource_luid.trim().is_empty() {
        missing.push("datasourceLuid");
    }
    if missing.is_empty() {
        return None;
    }
    Some(PipelineError::precondition(
        format!("{} is required", missing.join(" and ")),
        &missing,
        Some("Provide a question and a datasource LUID, then retry."),
    ))
}
