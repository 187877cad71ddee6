//! Tableau MCP 连接器（Streamable HTTP 传输上的 JSON-RPC）
//!
//! 首次调用时执行 initialize 并记录 `mcp-session-id`，随后发送 notifications/initialized；
//! 工具调用的响应可能是 application/json，也可能是 text/event-stream（取匹配 id 的 `data:` 行）。

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{parse_datasource_list, ConnectorError, DatasourceConnector, DatasourceInfo, QueryRequest};

pub const TOOL_QUERY_DATASOURCE: &str = "query-datasource";
pub const TOOL_READ_METADATA: &str = "get-datasource-metadata";
pub const TOOL_LIST_DATASOURCES: &str = "list-datasources";

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Default)]
struct McpSession {
    initialized: bool,
    id: Option<String>,
}

pub struct McpHttpConnector {
    http: reqwest::Client,
    endpoint: Option<String>,
    session: Mutex<McpSession>,
    next_id: AtomicI64,
    default_timeout: Duration,
}

impl McpHttpConnector {
    /// endpoint 为 None 时所有调用返回 NotConfigured
    pub fn new(endpoint: Option<String>, default_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            session: Mutex::new(McpSession::default()),
            next_id: AtomicI64::new(1),
            default_timeout,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    fn endpoint(&self) -> Result<&str, ConnectorError> {
        self.endpoint
            .as_deref()
            .ok_or_else(|| ConnectorError::NotConfigured("tableau.mcp_url is not set".into()))
    }

    /// 调用 MCP 工具并解包结果；超出 timeout 返回 ConnectorError::Timeout
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ConnectorError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, self.call_tool_inner(name, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn call_tool_inner(&self, name: &str, arguments: Value) -> Result<Value, ConnectorError> {
        let session_id = self.ensure_session().await?;
        tracing::debug!(tool = %name, "mcp tools/call");
        let (message, _) = self
            .post(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
                session_id.as_deref(),
                true,
            )
            .await?;
        let result = rpc_result(message)?;
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ConnectorError::Tool(content_text(&result)));
        }
        Ok(extract_result_json(&result))
    }

    async fn ensure_session(&self) -> Result<Option<String>, ConnectorError> {
        let mut session = self.session.lock().await;
        if session.initialized {
            return Ok(session.id.clone());
        }
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }
        });
        let (message, session_id) = self.post("initialize", Some(params), None, true).await?;
        rpc_result(message)?;
        self.post("notifications/initialized", None, session_id.as_deref(), false)
            .await?;
        tracing::info!(session = ?session_id, "mcp session initialized");
        session.initialized = true;
        session.id = session_id;
        Ok(session.id.clone())
    }

    /// 发送一条 JSON-RPC 消息；expect_reply 为 false 时为通知（无 id，不解析响应体）
    async fn post(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
        expect_reply: bool,
    ) -> Result<(Value, Option<String>), ConnectorError> {
        let mut body = json!({ "jsonrpc": "2.0", "method": method });
        let id = if expect_reply {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            body["id"] = json!(id);
            Some(id)
        } else {
            None
        };
        if let Some(p) = params {
            body["params"] = p;
        }

        let mut request = self
            .http
            .post(self.endpoint()?)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&body);
        if let Some(sid) = session_id {
            request = request.header(SESSION_HEADER, sid);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Request(e.to_string()))?;
        let status = response.status();
        let new_session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = response
            .text()
            .await
            .map_err(|e| ConnectorError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(ConnectorError::Request(format!("HTTP {}: {}", status, text)));
        }
        let Some(id) = id else {
            return Ok((Value::Null, new_session.or_else(|| session_id.map(String::from))));
        };
        let message = parse_rpc_body(&content_type, &text, id)?;
        Ok((message, new_session.or_else(|| session_id.map(String::from))))
    }
}

#[async_trait]
impl DatasourceConnector for McpHttpConnector {
    async fn query_datasource(&self, request: &QueryRequest) -> Result<Value, ConnectorError> {
        let query = serde_json::to_value(&request.query)
            .map_err(|e| ConnectorError::Decode(e.to_string()))?;
        let mut args = json!({ "datasourceLuid": request.datasource_luid, "query": query });
        if let Some(options) = request.options.as_ref().filter(|o| !o.is_empty()) {
            args["options"] =
                serde_json::to_value(options).map_err(|e| ConnectorError::Decode(e.to_string()))?;
        }
        self.call_tool(TOOL_QUERY_DATASOURCE, args, request.timeout).await
    }

    async fn read_metadata(&self, datasource_luid: &str) -> Result<Value, ConnectorError> {
        self.call_tool(
            TOOL_READ_METADATA,
            json!({ "datasourceLuid": datasource_luid }),
            None,
        )
        .await
    }

    async fn list_datasources(&self) -> Result<Vec<DatasourceInfo>, ConnectorError> {
        let payload = self.call_tool(TOOL_LIST_DATASOURCES, json!({}), None).await?;
        let items = parse_datasource_list(&payload);
        tracing::info!(count = items.len(), "datasources listed");
        Ok(items)
    }
}

/// 解析 JSON 或 SSE 响应体，返回与 id 匹配的 JSON-RPC 消息
fn parse_rpc_body(content_type: &str, text: &str, id: i64) -> Result<Value, ConnectorError> {
    if content_type.starts_with("text/event-stream") {
        let mut fallback = None;
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let Ok(msg) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            if msg.get("id").and_then(Value::as_i64) == Some(id) {
                return Ok(msg);
            }
            if msg.get("result").is_some() || msg.get("error").is_some() {
                fallback = Some(msg);
            }
        }
        return fallback.ok_or_else(|| ConnectorError::Decode("no JSON-RPC reply in event stream".into()));
    }
    serde_json::from_str(text).map_err(|e| ConnectorError::Decode(e.to_string()))
}

fn rpc_result(message: Value) -> Result<Value, ConnectorError> {
    if let Some(err) = message.get("error") {
        return Err(ConnectorError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    message
        .get("result")
        .cloned()
        .ok_or_else(|| ConnectorError::Decode("JSON-RPC reply without result".into()))
}

fn content_text(result: &Value) -> String {
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| i.get("text").and_then(Value::as_str)).collect())
        .unwrap_or_default();
    if texts.is_empty() {
        result.to_string()
    } else {
        texts.join("\n")
    }
}

/// 从 MCP 工具结果信封中取出负载 JSON
///
/// 顺序：json 条目的 value/data；文本条目拼接后按 JSON 解析（失败则保留为字符串）；
/// 对象的 value / result 键；否则原样返回。
pub fn extract_result_json(result: &Value) -> Value {
    let items = result
        .get("content")
        .and_then(Value::as_array)
        .or_else(|| result.as_array());
    if let Some(items) = items {
        let json_item = items.iter().find(|i| {
            i.get("type").and_then(Value::as_str) == Some("json")
                || i.get("kind").and_then(Value::as_str) == Some("json")
        });
        if let Some(v) = json_item.and_then(|i| i.get("value").or_else(|| i.get("data"))) {
            return v.clone();
        }
        let joined = items
            .iter()
            .filter(|i| i.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        let joined = joined.trim();
        if !joined.is_empty() {
            return serde_json::from_str(joined).unwrap_or_else(|_| Value::String(joined.to_string()));
        }
    }
    if let Some(obj) = result.as_object() {
        if let Some(v) = obj.get("value").or_else(|| obj.get("result")) {
            return v.clone();
        }
    }
    result.clone()
}
