//! BI 数据源连接器抽象
//!
//! 核心只依赖 DatasourceConnector：执行查询、读取元数据、列出数据源。
//! 超时由实现方根据 QueryRequest.timeout 执行；取消由调用方以 run_cancelable 包装（丢弃 future 即中断请求）。

pub mod mcp;
pub mod sniff;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::query::{QueryOptions, QuerySpec};

pub use mcp::{extract_result_json, McpHttpConnector};
pub use sniff::sniff_embedded_error;

#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Connector not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// 工具调用返回 isError，message 为工具给出的原文
    #[error("{0}")]
    Tool(String),

    #[error("Connector timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ConnectorError {
    /// 面向反馈的消息：若原文本身是 JSON 且带 message 字段，取该字段
    pub fn feedback_message(&self) -> String {
        let raw = match self {
            ConnectorError::Tool(m) => m.clone(),
            ConnectorError::Rpc { message, .. } => message.clone(),
            other => return other.to_string(),
        };
        serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or(raw)
    }
}

/// 一次查询请求
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub datasource_luid: String,
    pub query: QuerySpec,
    pub options: Option<QueryOptions>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

#[async_trait]
pub trait DatasourceConnector: Send + Sync {
    /// 执行已编译的查询；成功时返回已解包的结果 JSON（仍可能内嵌错误，由调用方嗅探）
    async fn query_datasource(&self, request: &QueryRequest) -> Result<Value, ConnectorError>;

    /// 读取数据源字段元数据（原始形态，由 MetadataCache 规范化）
    async fn read_metadata(&self, datasource_luid: &str) -> Result<Value, ConnectorError>;

    async fn list_datasources(&self) -> Result<Vec<DatasourceInfo>, ConnectorError>;
}

/// 从 list-datasources 结果中解析条目；缺少 id 或 name 的行丢弃
pub fn parse_datasource_list(payload: &Value) -> Vec<DatasourceInfo> {
    let rows = payload
        .as_array()
        .or_else(|| payload.get("value").and_then(Value::as_array))
        .or_else(|| payload.get("datasources").and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    rows.iter()
        .filter_map(|row| {
            let id = row.get("id").and_then(Value::as_str)?.trim();
            let name = row.get("name").and_then(Value::as_str)?.trim();
            if id.is_empty() || name.is_empty() {
                return None;
            }
            let project_name = row
                .get("project")
                .and_then(|p| p.get("name"))
                .or_else(|| row.get("projectName"))
                .and_then(Value::as_str)
                .map(String::from);
            Some(DatasourceInfo {
                id: id.to_string(),
                name: name.to_string(),
                project_name,
            })
        })
        .collect()
}

/// 按名称（忽略大小写与首尾空白）筛选；names 为空时返回全部
pub fn resolve_datasources_by_names(all: Vec<DatasourceInfo>, names: &[String]) -> Vec<DatasourceInfo> {
    let wanted: Vec<String> = names
        .iter()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .collect();
    if wanted.is_empty() {
        return all;
    }
    all.into_iter()
        .filter(|ds| wanted.contains(&ds.name.trim().to_lowercase()))
        .collect()
}
