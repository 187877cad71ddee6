//! 轻量总结：读取主产物并截断为片段，交给轻量叙述能力生成 markdown；
//! 能力失败时给出确定性的兜底总结（单个标量，或两个标量的对比）。

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::cancel::{run_cancelable, Cancelled};
use crate::llm::AgentKind;
use crate::memory::{row_count, truncate_chars, ArtifactStore, Message};
use crate::query::AnalysisPlan;

use super::{to_json, AgentRunner, CallError, EventSink, OrchestratorEvent};

pub const NO_SUMMARY: &str = "Unable to produce a lightweight summary from artifacts.";

fn as_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

fn first_number_in_row(row: &Value) -> Option<f64> {
    match row {
        Value::Array(cells) => cells.iter().find_map(as_number),
        Value::Object(map) => map.values().find_map(as_number),
        _ => None,
    }
}

/// 裸数字，或仅一行的 rows / data 中的第一个数值
pub fn extract_single_number(payload: &Value) -> Option<f64> {
    if let Value::Number(n) = payload {
        return n.as_f64();
    }
    ["rows", "data"].iter().find_map(|key| {
        let rows = payload.get(*key)?.as_array()?;
        if rows.len() == 1 {
            first_number_in_row(&rows[0])
        } else {
            None
        }
    })
}

/// 最多两位小数、千位分隔
pub fn format_number(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let text = format!("{:.2}", rounded.abs());
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let mut grouped = String::new();
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let frac = frac_part.trim_end_matches('0');
    let sign = if rounded < 0.0 { "-" } else { "" };
    if frac.is_empty() {
        format!("{}{}", sign, grouped)
    } else {
        format!("{}{}.{}", sign, grouped, frac)
    }
}

/// 确定性兜底：按前两个产物提取标量
pub fn deterministic_summary(payloads: &[Value]) -> String {
    let nums: Vec<f64> = payloads.iter().take(2).filter_map(extract_single_number).collect();
    match nums.as_slice() {
        [v] => format_number(*v),
        [a, b, ..] => {
            let delta = b - a;
            let pct = if *a != 0.0 { delta / a * 100.0 } else { 0.0 };
            format!(
                "{} vs {} (Δ {}; {:.2}%)",
                format_number(*b),
                format_number(*a),
                format_number(delta),
                pct
            )
        }
        [] => match payloads.first().and_then(row_count) {
            Some(rows) => format!("The query returned {} rows.", rows),
            None => NO_SUMMARY.to_string(),
        },
    }
}

pub struct LightweightInput<'a> {
    pub message: &'a str,
    pub artifacts: &'a [String],
    pub plan: Option<&'a AnalysisPlan>,
    pub snippet_chars: usize,
}

async fn read_payloads(store: &ArtifactStore, artifacts: &[String], cancel: &CancellationToken) -> Result<Vec<Value>, Cancelled> {
    let mut out = Vec::new();
    for rel in artifacts.iter().take(2) {
        match run_cancelable(cancel, || store.read(rel)).await? {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!(artifact = %rel, error = %e, "failed to read artifact"),
        }
    }
    Ok(out)
}

pub async fn run_lightweight(
    agents: &AgentRunner,
    store: &ArtifactStore,
    input: LightweightInput<'_>,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<String, Cancelled> {
    let payloads = read_payloads(store, input.artifacts, cancel).await?;
    let snippet = payloads
        .first()
        .map(|p| truncate_chars(&p.to_string(), input.snippet_chars))
        .unwrap_or_default();
    events.emit(OrchestratorEvent::SummarizeLightweight {
        snippet_chars: snippet.chars().count(),
    });

    let mut messages = vec![
        Message::user(format!("QUESTION={}", input.message)),
        Message::system(format!("RESULT_SNIPPET={}", snippet)),
    ];
    if let Some(plan) = input.plan {
        messages.push(Message::context_json("ANALYSIS_PLAN_JSON", &to_json(plan)));
    }

    match agents.call(AgentKind::LightweightSummarizer, &messages, cancel).await {
        Ok(out) if !out.as_text().trim().is_empty() => Ok(out.as_text().trim().to_string()),
        Err(CallError::Cancelled) => Err(Cancelled),
        other => {
            if let Err(e) = other {
                tracing::warn!(error = %e, "lightweight summarizer failed, using deterministic summary");
            }
            Ok(format!("### Summary\n{}", deterministic_summary(&payloads)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AgentCatalog, MockLlmClient};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1234567.891), "1,234,567.89");
        assert_eq!(format_number(12.0), "12");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(999.999), "1,000");
    }

    #[test]
    fn test_single_and_pair() {
        let a = json!({"data": [{"SUM(Sales)": 100}]});
        let b = json!({"rows": [["x", "150.5"]]});
        assert_eq!(deterministic_summary(&[a.clone()]), "100");
        assert_eq!(deterministic_summary(&[a, b]), "150.5 vs 100 (Δ 50.5; 50.50%)");
    }

    #[test]
    fn test_multi_row_falls_back_to_row_count() {
        let many = json!({"data": [{"v": 1}, {"v": 2}]});
        assert_eq!(deterministic_summary(&[many]), "The query returned 2 rows.");
        assert_eq!(deterministic_summary(&[json!("text")]), NO_SUMMARY);
    }

    #[tokio::test]
    async fn test_capability_failure_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "out");
        let saved = store.save(&json!({"data": [{"Sales": 42}]})).await.unwrap();
        let mock = Arc::new(MockLlmClient::new().fail(AgentKind::LightweightSummarizer, "boom"));
        let agents = AgentRunner::new(mock, Arc::new(AgentCatalog::with_defaults("m")));
        let artifacts = vec![saved.rel_path];
        let reply = run_lightweight(
            &agents,
            &store,
            LightweightInput {
                message: "total sales",
                artifacts: &artifacts,
                plan: None,
                snippet_chars: 100,
            },
            &EventSink::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(reply, "### Summary\n42");
    }
}
