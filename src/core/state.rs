//! 会话状态与单轮结果
//!
//! SessionState 由调用方跨轮持有；编排器收到后在副本上修改，结束时返回新的快照。
//! 单轮内 history 只追加：各阶段开始前追加用户消息，结束时恰好追加一条助手回复。

use serde::{Deserialize, Serialize};

use crate::memory::{Message, NormalizedField};
use crate::query::AnalysisPlan;

/// 阶段（事件与取消定位用）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Triage,
    Metadata,
    Selection,
    Planning,
    Fetch,
    Summarize,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Triage => "triage",
            TurnPhase::Metadata => "metadata",
            TurnPhase::Selection => "selection",
            TurnPhase::Planning => "planning",
            TurnPhase::Fetch => "fetch",
            TurnPhase::Summarize => "summarize",
        }
    }
}

/// 会话内缓存的字段目录（绑定数据源）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub datasource_luid: String,
    pub fields: Vec<NormalizedField>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HintOperator {
    In,
    Eq,
    Match,
    Contains,
}

impl HintOperator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "IN" => Some(HintOperator::In),
            "EQ" => Some(HintOperator::Eq),
            "MATCH" => Some(HintOperator::Match),
            "CONTAINS" => Some(HintOperator::Contains),
            _ => None,
        }
    }
}

/// 分诊阶段给出的过滤提示（非可执行过滤器，仅作为编译器上下文）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterHint {
    pub field_caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<HintOperator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// 分诊上下文：每轮由 triage 产生一次，供字段选择与规划使用
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brief_natural: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub filter_hints: Vec<FilterHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_plan: Option<AnalysisPlan>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_plan: Option<AnalysisPlan>,
    /// 产物相对路径，按产生顺序
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage_context: Option<TriageContext>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 若会话已缓存同一数据源的字段目录则返回
    pub fn fields_for(&self, datasource_luid: &str) -> Option<&[NormalizedField]> {
        self.metadata
            .as_ref()
            .filter(|m| m.datasource_luid == datasource_luid && !m.fields.is_empty())
            .map(|m| m.fields.as_slice())
    }

    /// 最近 max_messages 条历史（供 triage 上下文）
    pub fn recent_history(&self, max_messages: usize) -> &[Message] {
        let start = self.history.len().saturating_sub(max_messages);
        &self.history[start..]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Clarification,
    Failed,
    Cancelled,
}

/// 单轮编排结果：回复、新的会话快照与本轮产物
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub reply: String,
    pub status: TurnStatus,
    pub state: SessionState,
    pub artifact_paths: Vec<String>,
    pub duration_ms: u64,
}

impl TurnResult {
    pub fn is_cancelled(&self) -> bool {
        self.status == TurnStatus::Cancelled
    }
}
