//! PlanRunner：两段式规划
//!
//! 1. 分析：生成 AnalysisPlan（及草拟查询）。结构校验失败时以针对性提示重试一次；
//!    第二次仍失败则以 analysis_plan_validation_failed 结束本轮。调用失败不重试。
//! 2. 编译：把分析计划编译为可执行查询载荷，datasourceLuid 由本端注入。校验失败直接结束本轮，
//!    执行期的编译重试由 FetchRunner 负责。

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::error::{ErrorKind, PipelineError};
use crate::core::retry::{attempt_with_feedback, RetryError, RetryPolicy};
use crate::core::state::TriageContext;
use crate::llm::{AgentKind, Usage};
use crate::memory::Message;
use crate::query::{
    planner_payload_schema_json, query_summary, retry_hint, validate_analysis_output,
    validate_planner_payload, AnalysisPlan, AnalysisPlannerOutput, FieldSpec, IssueKind,
    PlannerPayload, ValidationErrors,
};

use super::events::PlanShape;
use super::{elapsed_ms, to_json, AgentRunner, CallError, EventSink, Halt, OrchestratorEvent, PhaseResult};

/// 分析阶段最多尝试次数（首次 + 一次带提示的重试）
pub const ANALYSIS_MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub enum AnalysisFailure {
    Validation(ValidationErrors),
    Call(CallError),
}

impl AnalysisFailure {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            AnalysisFailure::Validation(_) => ErrorKind::AnalysisPlanValidationFailed,
            AnalysisFailure::Call(CallError::Cancelled) => ErrorKind::Cancelled,
            AnalysisFailure::Call(_) => ErrorKind::AgentFailure,
        }
    }

    fn message(&self) -> String {
        match self {
            AnalysisFailure::Validation(e) => e.summary(),
            AnalysisFailure::Call(e) => e.to_string(),
        }
    }
}

pub fn analysis_retry_policy() -> RetryPolicy<AnalysisFailure> {
    RetryPolicy::new(ANALYSIS_MAX_ATTEMPTS)
        .retry_if(|e: &AnalysisFailure| e.error_kind().is_retryable())
        .with_hint(|failures| match failures.last() {
            Some(AnalysisFailure::Validation(e)) => Some(retry_hint(e.issues())),
            _ => None,
        })
}

/// 规划与抓取共用的上下文
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    pub message: &'a str,
    pub datasource_luid: &'a str,
    pub allowed_fields: &'a [FieldSpec],
    pub aliases: &'a BTreeMap<String, String>,
    pub triage: &'a TriageContext,
}

impl PlanningContext<'_> {
    /// 各能力共用的上下文行：用户消息、允许字段、别名、分诊简述与过滤提示
    pub fn base_messages(&self) -> Vec<Message> {
        let mut messages = vec![
            Message::user(self.message),
            Message::context_json("ALLOWED_FIELDS_JSON", &to_json(&self.allowed_fields)),
        ];
        if !self.aliases.is_empty() {
            messages.push(Message::context_json("FIELD_ALIASES_JSON", &to_json(&self.aliases)));
        }
        if let Some(brief) = self.triage.brief.as_deref() {
            messages.push(Message::system(format!("TRIAGE_BRIEF={}", brief)));
        }
        if let Some(natural) = self.triage.brief_natural.as_deref() {
            messages.push(Message::system(format!("TRIAGE_BRIEF_NATURAL={}", natural)));
        }
        if !self.triage.filter_hints.is_empty() {
            messages.push(Message::context_json("FILTER_HINTS_JSON", &to_json(&self.triage.filter_hints)));
        }
        messages
    }
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub analysis_plan: AnalysisPlan,
    pub payload: PlannerPayload,
    pub query_summary: String,
    pub usage: Option<Usage>,
}

fn parse_failure(msg: String) -> AnalysisFailure {
    AnalysisFailure::Validation(ValidationErrors::single("$", IssueKind::Malformed, msg))
}

async fn analyze(
    agents: &AgentRunner,
    ctx: PlanningContext<'_>,
    events: &EventSink,
    cancel: &CancellationToken,
) -> PhaseResult<(AnalysisPlannerOutput, Option<Usage>)> {
    let started = Instant::now();
    let mut base = ctx.base_messages();
    if let Some(plan) = ctx.triage.analysis_plan.as_ref() {
        base.push(Message::context_json("TRIAGE_ANALYSIS_PLAN_JSON", &to_json(plan)));
    }

    let policy = analysis_retry_policy();
    let result = attempt_with_feedback(
        &policy,
        |attempt| {
            events.emit(OrchestratorEvent::AnalysisStart {
                attempt: attempt.attempt,
            });
            let mut messages = base.clone();
            if let Some(hint) = attempt.hint {
                messages.push(Message::system(format!("RETRY_HINT={}", hint)));
            }
            async move {
                let (value, out) = agents
                    .call_json(AgentKind::AnalysisPlanner, &messages, cancel)
                    .await
                    .map_err(|e| match e {
                        CallError::Parse(msg) => parse_failure(msg),
                        other => AnalysisFailure::Call(other),
                    })?;
                let parsed = validate_analysis_output(&value).map_err(AnalysisFailure::Validation)?;
                Ok((parsed, out.usage))
            }
        },
        |failure, attempt| {
            let reason = failure.message();
            tracing::warn!(attempt = attempt.attempt, reason = %reason, "analysis plan failed validation, retrying");
            let hint = match failure {
                AnalysisFailure::Validation(e) => retry_hint(e.issues()),
                AnalysisFailure::Call(_) => String::new(),
            };
            events.emit(OrchestratorEvent::AnalysisRetry {
                attempt: attempt.attempt,
                reason,
                hint,
            });
        },
    )
    .await;

    match result {
        Ok(done) => {
            let (output, usage) = done.value;
            events.emit(OrchestratorEvent::AnalysisDone {
                steps: output.analysis_plan.steps.len(),
                duration_ms: elapsed_ms(started),
                usage,
            });
            Ok((output, usage))
        }
        Err(err) => {
            let failure = err.last().cloned();
            if matches!(failure, Some(AnalysisFailure::Call(CallError::Cancelled))) {
                return Err(Halt::Cancelled);
            }
            let message = failure.as_ref().map(AnalysisFailure::message).unwrap_or_default();
            events.emit(OrchestratorEvent::AnalysisError {
                message: message.clone(),
                duration_ms: elapsed_ms(started),
            });
            let error = match err {
                RetryError::Exhausted(_) => PipelineError::AnalysisPlanValidationFailed(message),
                RetryError::Aborted { .. } => PipelineError::Agent(format!("Analysis planning failed: {}", message)),
            };
            Err(Halt::Failed(error))
        }
    }
}

/// 编译阶段的输入消息；FetchRunner 在此基础上追加反馈。分诊的必需字段随每次编译下发，重试时不会丢失
pub fn compile_messages(ctx: PlanningContext<'_>, plan: &AnalysisPlan, planned: Option<&Value>) -> Vec<Message> {
    let mut messages = ctx.base_messages();
    messages.push(Message::context_json("ANALYSIS_PLAN_JSON", &to_json(plan)));
    if !ctx.triage.required_fields.is_empty() {
        messages.push(Message::context_json(
            "TRIAGE_REQUIRED_FIELDS_JSON",
            &to_json(&ctx.triage.required_fields),
        ));
    }
    if let Some(query) = planned {
        messages.push(Message::context_json("PLANNED_QUERY_JSON", query));
    }
    messages.push(Message::system(format!(
        "PAYLOAD_SCHEMA_JSON={}",
        planner_payload_schema_json()
    )));
    messages
}

async fn compile(
    agents: &AgentRunner,
    ctx: PlanningContext<'_>,
    analysis: &AnalysisPlannerOutput,
    events: &EventSink,
    cancel: &CancellationToken,
) -> PhaseResult<(PlannerPayload, Option<Usage>)> {
    let started = Instant::now();
    events.emit(OrchestratorEvent::PlanStart);

    let draft = analysis.query.as_ref().map(to_json);
    let mut messages = compile_messages(ctx, &analysis.analysis_plan, None);
    if let Some(query) = draft.as_ref() {
        messages.push(Message::context_json("STEP_QUERY_JSON", query));
    }

    let fail = |message: String, error: PipelineError| {
        events.emit(OrchestratorEvent::PlanError {
            message,
            duration_ms: elapsed_ms(started),
        });
        Err(Halt::Failed(error))
    };

    let (value, out) = match agents.call_json(AgentKind::VizqlBuilder, &messages, cancel).await {
        Ok(ok) => ok,
        Err(CallError::Cancelled) => return Err(Halt::Cancelled),
        Err(CallError::Parse(msg)) => return fail(msg.clone(), PipelineError::BuilderValidation(msg)),
        Err(CallError::Agent(e)) => {
            let msg = format!("Query compilation failed: {}", e);
            return fail(msg.clone(), PipelineError::Agent(msg));
        }
    };

    match validate_planner_payload(&value, ctx.datasource_luid) {
        Ok(payload) => {
            events.emit(OrchestratorEvent::PlanDone {
                summary: PlanShape {
                    fields: payload.query.fields.len(),
                    filters: payload.query.filters.len(),
                    options: !payload.options.is_empty(),
                },
                query_summary: query_summary(&payload.query),
                duration_ms: elapsed_ms(started),
                usage: out.usage,
            });
            Ok((payload, out.usage))
        }
        Err(e) => {
            let msg = e.summary();
            fail(msg.clone(), PipelineError::BuilderValidation(msg))
        }
    }
}

/// 分析 + 编译
pub async fn run_plan(
    agents: &AgentRunner,
    ctx: PlanningContext<'_>,
    events: &EventSink,
    cancel: &CancellationToken,
) -> PhaseResult<PlanOutcome> {
    let (analysis, analysis_usage) = analyze(agents, ctx, events, cancel).await?;
    let (payload, compile_usage) = compile(agents, ctx, &analysis, events, cancel).await?;
    let summary = query_summary(&payload.query);
    tracing::info!(
        steps = analysis.analysis_plan.steps.len(),
        fields = payload.query.fields.len(),
        filters = payload.query.filters.len(),
        summary = %summary,
        "plan compiled"
    );
    Ok(PlanOutcome {
        analysis_plan: analysis.analysis_plan,
        payload,
        query_summary: summary,
        usage: Usage::merge(analysis_usage, compile_usage),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AgentCatalog, MockLlmClient};
    use crate::phases::events::drain;
    use crate::query::AggFunction;
    use serde_json::json;
    use std::sync::Arc;

    fn runner(mock: Arc<MockLlmClient>) -> AgentRunner {
        AgentRunner::new(mock, Arc::new(AgentCatalog::with_defaults("test-model")))
    }

    fn valid_plan() -> Value {
        json!({"analysis_plan": {"overview": "sales trend", "steps": [{"id": "s1", "goal": "sum sales"}]}})
    }

    struct Fixture {
        allowed: Vec<FieldSpec>,
        aliases: BTreeMap<String, String>,
        triage: TriageContext,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                allowed: vec![FieldSpec::new("Sales", Some(AggFunction::Sum))],
                aliases: BTreeMap::new(),
                triage: TriageContext::default(),
            }
        }

        fn ctx(&self) -> PlanningContext<'_> {
            PlanningContext {
                message: "average sales by year",
                datasource_luid: "ds-1",
                allowed_fields: &self.allowed,
                aliases: &self.aliases,
                triage: &self.triage,
            }
        }
    }

    #[tokio::test]
    async fn test_compiles_scenario_query() {
        let mock = Arc::new(
            MockLlmClient::new()
                .reply_json(AgentKind::AnalysisPlanner, valid_plan())
                .reply_json(
                    AgentKind::VizqlBuilder,
                    json!({"datasource": {"datasourceLuid": "spoofed"},
                           "query": {"fields": [{"fieldCaption": "Sales", "function": "SUM"}], "filters": []}}),
                ),
        );
        let fx = Fixture::new();
        let (sink, mut rx) = EventSink::channel();
        let out = run_plan(&runner(mock.clone()), fx.ctx(), &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.payload.datasource.datasource_luid, "ds-1");
        assert_eq!(out.payload.query.fields, vec![FieldSpec::new("Sales", Some(AggFunction::Sum))]);
        assert!(out.payload.query.filters.is_empty());
        assert_eq!(crate::query::preflight(&out.payload.query), "");
        assert_eq!(out.query_summary, "SUM(Sales)");

        let types: Vec<_> = drain(&mut rx).iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["analysis:start", "analysis:done", "plan:start", "plan:done"]);
    }

    #[tokio::test]
    async fn test_builder_receives_required_fields() {
        let mock = Arc::new(
            MockLlmClient::new()
                .reply_json(AgentKind::AnalysisPlanner, valid_plan())
                .reply_json(AgentKind::VizqlBuilder, json!({"query": {"fields": [{"fieldCaption": "Sales"}]}})),
        );
        let mut fx = Fixture::new();
        fx.triage.required_fields = vec!["Sales".to_string()];
        run_plan(&runner(mock.clone()), fx.ctx(), &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap();

        let builder = &mock.calls_for(AgentKind::VizqlBuilder)[0];
        let required: Vec<String> =
            serde_json::from_str(builder.context("TRIAGE_REQUIRED_FIELDS_JSON").unwrap()).unwrap();
        assert_eq!(required, vec!["Sales"]);
        assert!(mock.calls_for(AgentKind::AnalysisPlanner)[0]
            .context("TRIAGE_REQUIRED_FIELDS_JSON")
            .is_none());
    }

    #[test]
    fn test_analysis_policy_retries_validation_only() {
        let policy = analysis_retry_policy();
        let invalid = parse_failure("not an object".into());
        assert_eq!(invalid.error_kind(), ErrorKind::AnalysisPlanValidationFailed);
        assert!((policy.is_retryable)(&invalid));
        let agent = AnalysisFailure::Call(CallError::Agent(crate::llm::LlmError::Request("503".into())));
        assert_eq!(agent.error_kind(), ErrorKind::AgentFailure);
        assert!(!(policy.is_retryable)(&agent));
        assert!(!(policy.is_retryable)(&AnalysisFailure::Call(CallError::Cancelled)));
    }

    #[tokio::test]
    async fn test_analysis_retries_once_with_hint() {
        let mock = Arc::new(
            MockLlmClient::new()
                .reply_json(
                    AgentKind::AnalysisPlanner,
                    json!({"analysis_plan": {"steps": [{"id": "s1", "goal": "g"}]},
                           "query": {"fields": [{"fieldCaption": "Sales"}],
                                     "filters": [{"filterType": "TOPN", "field": {"fieldCaption": "Sales"}}]}}),
                )
                .reply_json(AgentKind::AnalysisPlanner, valid_plan())
                .reply_json(AgentKind::VizqlBuilder, json!({"query": {"fields": [{"fieldCaption": "Sales"}]}})),
        );
        let fx = Fixture::new();
        let (sink, mut rx) = EventSink::channel();
        run_plan(&runner(mock.clone()), fx.ctx(), &sink, &CancellationToken::new())
            .await
            .unwrap();

        let calls = mock.calls_for(AgentKind::AnalysisPlanner);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].context("RETRY_HINT").is_none());
        assert!(calls[1].context("RETRY_HINT").unwrap().contains("TOPN"));
        let retries = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type() == "analysis:retry")
            .count();
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn test_second_validation_failure_aborts_turn() {
        let mock = Arc::new(MockLlmClient::new().reply_json(AgentKind::AnalysisPlanner, json!({"analysis_plan": {"steps": []}})));
        let fx = Fixture::new();
        let err = run_plan(&runner(mock.clone()), fx.ctx(), &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Halt::Failed(PipelineError::AnalysisPlanValidationFailed(_))));
        assert_eq!(mock.call_count(AgentKind::AnalysisPlanner), 2);
        assert_eq!(mock.call_count(AgentKind::VizqlBuilder), 0);
    }

    #[tokio::test]
    async fn test_agent_failure_is_not_retried() {
        let mock = Arc::new(MockLlmClient::new().fail(AgentKind::AnalysisPlanner, "503 upstream"));
        let fx = Fixture::new();
        let err = run_plan(&runner(mock.clone()), fx.ctx(), &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Halt::Failed(PipelineError::Agent(_))));
        assert_eq!(mock.call_count(AgentKind::AnalysisPlanner), 1);
    }

    #[tokio::test]
    async fn test_compile_validation_failure_is_not_retried() {
        let mock = Arc::new(
            MockLlmClient::new()
                .reply_json(AgentKind::AnalysisPlanner, valid_plan())
                .reply_json(AgentKind::VizqlBuilder, json!({"query": {"fields": []}})),
        );
        let fx = Fixture::new();
        let (sink, mut rx) = EventSink::channel();
        let err = run_plan(&runner(mock.clone()), fx.ctx(), &sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Halt::Failed(PipelineError::BuilderValidation(_))));
        assert_eq!(mock.call_count(AgentKind::VizqlBuilder), 1);
        assert!(drain(&mut rx).iter().any(|e| e.event_type() == "plan:error"));
    }
}
