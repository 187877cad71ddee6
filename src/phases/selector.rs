//! 字段选择：把自由文本请求映射为允许列表（allow-list）
//!
//! - 必需字段在目录中完全不存在：立即澄清（列出候选字段），不调用模型、不重试
//! - 模型提议的字段只保留目录中存在的（忽略大小写，规范为目录标题）
//! - 模型遗漏的必需字段按默认聚合强制加入
//! - 截断到 max：必需字段优先且从不丢弃，其余按提议顺序填充

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::error::{format_for_user, PipelineError};
use crate::core::state::FilterHint;
use crate::llm::{AgentKind, Usage};
use crate::memory::{Message, NormalizedField};
use crate::query::{AggFunction, FieldSpec};

use super::{elapsed_ms, to_json, AgentRunner, CallError, EventSink, Halt, OrchestratorEvent, PhaseResult};

pub const DEFAULT_MAX_FIELDS: usize = 8;
const MAX_CANDIDATES: usize = 5;

pub const NOTHING_SELECTED: &str =
    "No suitable fields were selected. Please specify exact field names (e.g., a measure and a date field).";

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub allowed_fields: Vec<FieldSpec>,
    /// alias → 目录中的字段标题
    pub aliases: BTreeMap<String, String>,
    pub usage: Option<Usage>,
}

impl Selection {
    pub fn captions(&self) -> Vec<String> {
        self.allowed_fields.iter().map(|f| f.field_caption.clone()).collect()
    }
}

fn find_in_catalog<'a>(catalog: &'a [NormalizedField], caption: &str) -> Option<&'a NormalizedField> {
    let wanted = caption.trim();
    catalog
        .iter()
        .find(|f| f.field_caption == wanted)
        .or_else(|| {
            let lower = wanted.to_lowercase();
            catalog.iter().find(|f| f.field_caption.to_lowercase() == lower)
        })
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// 与缺失字段名相近的目录字段（子串或词元命中）
pub fn candidate_fields(missing: &str, catalog: &[NormalizedField]) -> Vec<String> {
    let lower = missing.trim().to_lowercase();
    let wanted = tokens(missing);
    catalog
        .iter()
        .filter(|f| {
            let caption = f.field_caption.to_lowercase();
            (!lower.is_empty() && (caption.contains(&lower) || lower.contains(&caption)))
                || tokens(&f.field_caption).iter().any(|t| wanted.contains(t))
        })
        .map(|f| f.field_caption.clone())
        .take(MAX_CANDIDATES)
        .collect()
}

/// 必需字段中目录完全不存在的部分；存在时返回 MissingRequiredField
pub fn check_required(required: &[String], catalog: &[NormalizedField]) -> Result<(), PipelineError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|r| find_in_catalog(catalog, r).is_none())
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let mut candidates: Vec<String> = Vec::new();
    for m in &missing {
        for c in candidate_fields(m, catalog) {
            if !candidates.contains(&c) {
                candidates.push(c);
            }
        }
    }
    candidates.truncate(MAX_CANDIDATES);
    Err(PipelineError::MissingRequiredField {
        fields: missing,
        candidates,
    })
}

fn proposed_field(item: &Value) -> Option<(String, Option<AggFunction>)> {
    match item {
        Value::String(s) => Some((s.clone(), None)),
        Value::Object(obj) => {
            let caption = obj
                .get("fieldCaption")
                .or_else(|| obj.get("field"))
                .and_then(Value::as_str)?;
            let function = obj.get("function").and_then(Value::as_str).and_then(AggFunction::parse);
            Some((caption.to_string(), function))
        }
        _ => None,
    }
}

/// 由模型输出与目录计算允许列表；结果为空时返回澄清文本
pub fn apply_selection(
    output: &Value,
    catalog: &[NormalizedField],
    required: &[String],
    max_fields: usize,
) -> Result<Selection, String> {
    let mut proposed: Vec<FieldSpec> = Vec::new();
    let items = output
        .get("allowedFields")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for item in items {
        let Some((caption, function)) = proposed_field(item) else {
            continue;
        };
        let Some(field) = find_in_catalog(catalog, &caption) else {
            tracing::debug!(field = %caption, "dropping field not in catalog");
            continue;
        };
        if proposed.iter().any(|p| p.field_caption == field.field_caption) {
            continue;
        }
        proposed.push(FieldSpec::new(field.field_caption.clone(), function));
    }

    let mut allowed: Vec<FieldSpec> = Vec::new();
    for req in required {
        let Some(field) = find_in_catalog(catalog, req) else {
            continue;
        };
        if allowed.iter().any(|a| a.field_caption == field.field_caption) {
            continue;
        }
        let spec = proposed
            .iter()
            .find(|p| p.field_caption == field.field_caption)
            .cloned()
            .unwrap_or_else(|| {
                let default = field.default_aggregation.as_deref().and_then(AggFunction::parse);
                FieldSpec::new(field.field_caption.clone(), default)
            });
        allowed.push(spec);
    }
    for spec in proposed {
        if allowed.len() >= max_fields {
            break;
        }
        if !allowed.iter().any(|a| a.field_caption == spec.field_caption) {
            allowed.push(spec);
        }
    }

    if allowed.is_empty() {
        let clarify = output
            .get("clarify")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(NOTHING_SELECTED);
        return Err(clarify.to_string());
    }

    let aliases = output
        .get("suggestedAliases")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(alias, target)| {
                    let field = find_in_catalog(catalog, target.as_str()?)?;
                    let alias = alias.trim();
                    (!alias.is_empty()).then(|| (alias.to_string(), field.field_caption.clone()))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Selection {
        allowed_fields: allowed,
        aliases,
        usage: None,
    })
}

pub struct SelectorInput<'a> {
    pub message: &'a str,
    pub fields: &'a [NormalizedField],
    pub required_fields: &'a [String],
    pub filter_hints: &'a [FilterHint],
    pub max_fields: usize,
}

pub async fn run_selector(
    agents: &AgentRunner,
    input: SelectorInput<'_>,
    events: &EventSink,
    cancel: &CancellationToken,
) -> PhaseResult<Selection> {
    let started = Instant::now();
    let max_fields = input.max_fields.max(1);
    events.emit(OrchestratorEvent::SelectorStart { max_fields });

    if let Err(err) = check_required(input.required_fields, input.fields) {
        let text = format_for_user(&err);
        tracing::info!(error = %err, "required fields missing from catalog");
        events.emit(OrchestratorEvent::ClarifyRequest {
            text: text.clone(),
            duration_ms: elapsed_ms(started),
        });
        return Err(Halt::Clarify(text));
    }

    let mut messages = vec![
        Message::user(input.message),
        Message::system(format!("MAX_N={}", max_fields)),
        Message::context_json("AVAILABLE_FIELDS_JSON", &to_json(&input.fields)),
    ];
    if !input.required_fields.is_empty() {
        messages.push(Message::context_json("REQUIRED_FIELDS_JSON", &to_json(&input.required_fields)));
    }
    if !input.filter_hints.is_empty() {
        messages.push(Message::context_json("FILTER_HINTS_JSON", &to_json(&input.filter_hints)));
    }

    let (output, usage) = match agents.call_json(AgentKind::FieldSelector, &messages, cancel).await {
        Ok((value, out)) => (value, out.usage),
        Err(CallError::Cancelled) => return Err(Halt::Cancelled),
        Err(CallError::Parse(msg)) => {
            tracing::warn!(error = %msg, "selector output unparseable");
            (Value::Null, None)
        }
        Err(CallError::Agent(e)) => {
            let message = format!("Field selection failed: {}", e);
            events.emit(OrchestratorEvent::SelectorError {
                message: message.clone(),
                duration_ms: elapsed_ms(started),
            });
            return Err(Halt::Failed(PipelineError::Agent(message)));
        }
    };

    match apply_selection(&output, input.fields, input.required_fields, max_fields) {
        Ok(mut selection) => {
            selection.usage = usage;
            let duration_ms = elapsed_ms(started);
            tracing::info!(fields = ?selection.captions(), duration_ms, "fields selected");
            events.emit(OrchestratorEvent::SelectorDone {
                fields: selection.captions(),
                duration_ms,
                usage,
            });
            Ok(selection)
        }
        Err(text) => {
            events.emit(OrchestratorEvent::ClarifyRequest {
                text: text.clone(),
                duration_ms: elapsed_ms(started),
            });
            Err(Halt::Clarify(text))
        }
    }
}
