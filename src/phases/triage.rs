//! 分诊：判断是否需要查询数据，抽取必需字段、过滤提示与简述
//!
//! 输出宽松解析：缺失键取默认值；requiredFields 去空白去重；filterHints 仅保留有 fieldCaption 的条目，
//! 运算符限于 IN / EQ / MATCH / CONTAINS；内嵌的 analysis_plan 仅在校验通过时保留。

use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::error::PipelineError;
use crate::core::state::{FilterHint, HintOperator, TriageContext};
use crate::llm::AgentKind;
use crate::memory::{Message, NormalizedField};
use crate::query::validate_analysis_plan;

use super::{elapsed_ms, to_json, AgentRunner, CallError, EventSink, Halt, OrchestratorEvent, PhaseResult};

/// 传给分诊的字段目录上限
pub const TRIAGE_FIELD_LIMIT: usize = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct TriageDecision {
    pub needs_data: bool,
    pub needs_clarification: bool,
    pub message: Option<String>,
    pub context: TriageContext,
}

impl TriageDecision {
    fn label(&self) -> &'static str {
        if self.needs_clarification && self.message.is_some() {
            "clarify"
        } else if !self.needs_data && self.message.is_some() {
            "answer"
        } else {
            "data"
        }
    }
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn dedup_strings<'a>(items: impl Iterator<Item = &'a Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let text = match item {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        if !text.is_empty() && !out.contains(&text) {
            out.push(text);
        }
    }
    out
}

fn parse_filter_hints(raw: Option<&Value>) -> Vec<FilterHint> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|h| {
            let field_caption = non_empty_str(h.get("fieldCaption"))?;
            let operator = h
                .get("operator")
                .and_then(Value::as_str)
                .and_then(HintOperator::parse);
            let values = h
                .get("values")
                .and_then(Value::as_array)
                .map(|vs| dedup_strings(vs.iter()))
                .unwrap_or_default();
            Some(FilterHint {
                field_caption,
                operator,
                values,
                note: non_empty_str(h.get("note")),
            })
        })
        .collect()
}

/// 宽松解析分诊输出
pub fn parse_triage(value: &Value) -> TriageDecision {
    let flag = |key: &str, default: bool| value.get(key).and_then(Value::as_bool).unwrap_or(default);

    let required_fields = value
        .get("requiredFields")
        .and_then(Value::as_array)
        .map(|items| dedup_strings(items.iter()))
        .unwrap_or_default();

    let analysis_plan = value
        .get("analysis_plan")
        .filter(|v| !v.is_null())
        .and_then(|raw| match validate_analysis_plan(raw) {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring invalid triage analysis_plan");
                None
            }
        });

    TriageDecision {
        needs_data: flag("needsData", true),
        needs_clarification: flag("needsClarification", false),
        message: non_empty_str(value.get("message")),
        context: TriageContext {
            brief: non_empty_str(value.get("brief")),
            brief_natural: non_empty_str(value.get("briefNatural")),
            required_fields,
            filter_hints: parse_filter_hints(value.get("filterHints")),
            analysis_plan,
        },
    }
}

pub struct TriageInput<'a> {
    pub message: &'a str,
    pub history: &'a [Message],
    /// 会话中已知的字段目录（triage 先于 metadata 执行）
    pub known_fields: Option<&'a [NormalizedField]>,
}

/// 运行分诊；需要澄清或可直接回答时以 Halt 结束本轮
pub async fn run_triage(
    agents: &AgentRunner,
    input: TriageInput<'_>,
    events: &EventSink,
    cancel: &CancellationToken,
) -> PhaseResult<TriageContext> {
    let started = Instant::now();
    events.emit(OrchestratorEvent::TriageStart {
        message: input.message.to_string(),
    });

    let mut messages: Vec<Message> = input.history.to_vec();
    if let Some(fields) = input.known_fields {
        let head: Vec<&NormalizedField> = fields.iter().take(TRIAGE_FIELD_LIMIT).collect();
        messages.push(Message::context_json("AVAILABLE_FIELDS_JSON", &to_json(&head)));
    }
    messages.push(Message::user(input.message));

    let decision = match agents.call_json(AgentKind::Triage, &messages, cancel).await {
        Ok((value, _)) => parse_triage(&value),
        Err(CallError::Cancelled) => return Err(Halt::Cancelled),
        Err(CallError::Parse(msg)) => {
            tracing::warn!(error = %msg, "triage output unparseable, proceeding with data path");
            parse_triage(&Value::Null)
        }
        Err(CallError::Agent(e)) => {
            let message = format!("Triage failed: {}", e);
            events.emit(OrchestratorEvent::TriageError {
                message: message.clone(),
                duration_ms: elapsed_ms(started),
            });
            return Err(Halt::Failed(PipelineError::Agent(message)));
        }
    };

    let duration_ms = elapsed_ms(started);
    events.emit(OrchestratorEvent::TriageDone {
        decision: decision.label().to_string(),
        duration_ms,
        required_fields: decision.context.required_fields.clone(),
        filter_hints_count: decision.context.filter_hints.len(),
    });
    tracing::info!(
        decision = decision.label(),
        required = decision.context.required_fields.len(),
        duration_ms,
        "triage done"
    );

    match (&decision.message, decision.label()) {
        (Some(text), "clarify") => {
            events.emit(OrchestratorEvent::ClarifyRequest {
                text: text.clone(),
                duration_ms,
            });
            Err(Halt::Clarify(text.clone()))
        }
        (Some(text), "answer") => Err(Halt::Reply(text.clone())),
        _ => Ok(decision.context),
    }
}
