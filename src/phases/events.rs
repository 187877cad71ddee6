//! 编排过程事件：按阶段命名空间的封闭事件集合（`phase:subphase` + 结构化 detail）
//!
//! 事件只是观测通道，发送失败（接收端已关闭）会被忽略，绝不影响本轮执行。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::llm::Usage;

/// 计划摘要（plan:done 的 detail.summary）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanShape {
    pub fields: usize,
    pub filters: usize,
    pub options: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all_fields = "camelCase")]
pub enum OrchestratorEvent {
    #[serde(rename = "triage:start")]
    TriageStart { message: String },
    #[serde(rename = "triage:done")]
    TriageDone {
        decision: String,
        duration_ms: u64,
        required_fields: Vec<String>,
        filter_hints_count: usize,
    },
    #[serde(rename = "triage:error")]
    TriageError { message: String, duration_ms: u64 },
    #[serde(rename = "clarify:request")]
    ClarifyRequest { text: String, duration_ms: u64 },

    #[serde(rename = "metadata:start")]
    MetadataStart { datasource_luid: String },
    #[serde(rename = "metadata:done")]
    MetadataDone {
        source: String,
        field_count: usize,
        duration_ms: u64,
    },
    #[serde(rename = "metadata:error")]
    MetadataError { message: String, duration_ms: u64 },

    #[serde(rename = "selector:start")]
    SelectorStart { max_fields: usize },
    #[serde(rename = "selector:done")]
    SelectorDone {
        fields: Vec<String>,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    #[serde(rename = "selector:error")]
    SelectorError { message: String, duration_ms: u64 },

    #[serde(rename = "analysis:start")]
    AnalysisStart { attempt: usize },
    #[serde(rename = "analysis:retry")]
    AnalysisRetry {
        attempt: usize,
        reason: String,
        hint: String,
    },
    #[serde(rename = "analysis:done")]
    AnalysisDone {
        steps: usize,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    #[serde(rename = "analysis:error")]
    AnalysisError { message: String, duration_ms: u64 },

    #[serde(rename = "plan:start")]
    PlanStart,
    #[serde(rename = "plan:done")]
    PlanDone {
        summary: PlanShape,
        query_summary: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    #[serde(rename = "plan:error")]
    PlanError { message: String, duration_ms: u64 },

    #[serde(rename = "fetch:start")]
    FetchStart { datasource_luid: String },
    #[serde(rename = "fetch:retry")]
    FetchRetry {
        attempt: usize,
        source: String,
        reason: String,
        hint: String,
    },
    #[serde(rename = "fetch:done")]
    FetchDone {
        summary: String,
        artifact: String,
        attempts: usize,
        duration_ms: u64,
    },
    #[serde(rename = "fetch:error")]
    FetchError { message: String, duration_ms: u64 },

    #[serde(rename = "summarize:start")]
    SummarizeStart { artifacts: Vec<String>, route: String },
    #[serde(rename = "summarize:ci:start")]
    CiStart { files: usize },
    #[serde(rename = "summarize:ci:success")]
    CiSuccess { duration_ms: u64 },
    #[serde(rename = "summarize:ci:timeout")]
    CiTimeout { timeout_ms: u64 },
    #[serde(rename = "summarize:ci:empty")]
    CiEmpty { duration_ms: u64 },
    #[serde(rename = "summarize:ci:error")]
    CiError { message: String, duration_ms: u64 },
    #[serde(rename = "summarize:lightweight")]
    SummarizeLightweight { snippet_chars: usize },
    #[serde(rename = "summarize:done")]
    SummarizeDone { path: String, duration_ms: u64 },

    #[serde(rename = "final")]
    Final { reply: String, duration_ms: u64 },
    #[serde(rename = "error")]
    Error { kind: String, message: String },
    #[serde(rename = "cancelled")]
    Cancelled { phase: String },
}

impl OrchestratorEvent {
    pub fn event_type(&self) -> &'static str {
        use OrchestratorEvent::*;
        match self {
            TriageStart { .. } => "triage:start",
            TriageDone { .. } => "triage:done",
            TriageError { .. } => "triage:error",
            ClarifyRequest { .. } => "clarify:request",
            MetadataStart { .. } => "metadata:start",
            MetadataDone { .. } => "metadata:done",
            MetadataError { .. } => "metadata:error",
            SelectorStart { .. } => "selector:start",
            SelectorDone { .. } => "selector:done",
            SelectorError { .. } => "selector:error",
            AnalysisStart { .. } => "analysis:start",
            AnalysisRetry { .. } => "analysis:retry",
            AnalysisDone { .. } => "analysis:done",
            AnalysisError { .. } => "analysis:error",
            PlanStart => "plan:start",
            PlanDone { .. } => "plan:done",
            PlanError { .. } => "plan:error",
            FetchStart { .. } => "fetch:start",
            FetchRetry { .. } => "fetch:retry",
            FetchDone { .. } => "fetch:done",
            FetchError { .. } => "fetch:error",
            SummarizeStart { .. } => "summarize:start",
            CiStart { .. } => "summarize:ci:start",
            CiSuccess { .. } => "summarize:ci:success",
            CiTimeout { .. } => "summarize:ci:timeout",
            CiEmpty { .. } => "summarize:ci:empty",
            CiError { .. } => "summarize:ci:error",
            SummarizeLightweight { .. } => "summarize:lightweight",
            SummarizeDone { .. } => "summarize:done",
            Final { .. } => "final",
            Error { .. } => "error",
            Cancelled { .. } => "cancelled",
        }
    }

    /// 伪流式 UI 的单行进度文本；无需展示的事件返回 None
    pub fn render(&self, locale: Locale) -> Option<String> {
        use OrchestratorEvent::*;
        let zh = locale == Locale::Zh;
        let line = match self {
            TriageStart { .. } => pick(zh, "Understanding the question…", "正在理解问题…").to_string(),
            TriageDone { required_fields, .. } if !required_fields.is_empty() => {
                let list = required_fields.join(", ");
                if zh {
                    format!("需要的字段：{}", list)
                } else {
                    format!("Required fields: {}", list)
                }
            }
            ClarifyRequest { text, .. } => text.clone(),
            MetadataStart { .. } => pick(zh, "Loading datasource fields…", "正在读取数据源字段…").to_string(),
            MetadataDone { field_count, source, .. } => {
                if zh {
                    format!("已加载 {} 个字段（{}）", field_count, source)
                } else {
                    format!("Loaded {} fields ({})", field_count, source)
                }
            }
            SelectorDone { fields, .. } => {
                if zh {
                    format!("已选择字段：{}", fields.join(", "))
                } else {
                    format!("Selected fields: {}", fields.join(", "))
                }
            }
            AnalysisStart { attempt: 1 } => pick(zh, "Planning the analysis…", "正在规划分析…").to_string(),
            AnalysisRetry { reason, .. } => {
                if zh {
                    format!("分析计划未通过校验，正在重试：{}", reason)
                } else {
                    format!("Analysis plan failed validation, retrying: {}", reason)
                }
            }
            PlanDone { query_summary, .. } if !query_summary.is_empty() => {
                if zh {
                    format!("查询：{}", query_summary)
                } else {
                    format!("Query: {}", query_summary)
                }
            }
            FetchStart { .. } => pick(zh, "Fetching data…", "正在获取数据…").to_string(),
            FetchRetry { attempt, reason, .. } => {
                if zh {
                    format!("第 {} 次获取失败，正在重试：{}", attempt, reason)
                } else {
                    format!("Fetch attempt {} failed, retrying: {}", attempt, reason)
                }
            }
            FetchDone { summary, .. } => {
                if zh {
                    format!("数据已获取（{}）", summary)
                } else {
                    format!("Data fetched ({})", summary)
                }
            }
            SummarizeStart { .. } => pick(zh, "Summarizing results…", "正在总结结果…").to_string(),
            CiTimeout { .. } => pick(
                zh,
                "Code analysis timed out, switching to a quick summary.",
                "代码分析超时，改用快速总结。",
            )
            .to_string(),
            CiEmpty { .. } | CiError { .. } => pick(
                zh,
                "Code analysis unavailable, switching to a quick summary.",
                "代码分析不可用，改用快速总结。",
            )
            .to_string(),
            TriageError { message, .. }
            | MetadataError { message, .. }
            | SelectorError { message, .. }
            | AnalysisError { message, .. }
            | PlanError { message, .. }
            | FetchError { message, .. }
            | Error { message, .. } => message.clone(),
            Cancelled { .. } => pick(zh, "Cancelled.", "已取消。").to_string(),
            _ => return None,
        };
        Some(line)
    }
}

fn pick(zh: bool, en: &'static str, zh_text: &'static str) -> &'static str {
    if zh {
        zh_text
    } else {
        en
    }
}

/// 进度文本语言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl Locale {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().to_lowercase().starts_with("zh") {
            Locale::Zh
        } else {
            Locale::En
        }
    }
}

/// 事件出口：无接收端时为 no-op
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl EventSink {
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let detail = serde_json::to_string(&event).unwrap_or_default();
            tracing::debug!(event = event.event_type(), %detail, "orchestrator event");
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// 取出接收端中已缓冲的全部事件（测试与非流式接口使用）
pub fn drain(rx: &mut mpsc::UnboundedReceiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
