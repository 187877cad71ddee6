//! 代码执行（CI）总结后端
//!
//! OpenAI Responses API：上传产物文件 → 以 code_interpreter 工具运行 → 按配置删除文件 → 取 output_text。
//! 取消或超时由 SummarizeRunner 以竞速处理，丢弃 future 即中断请求。

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::query::AnalysisPlan;

#[derive(Error, Debug, Clone)]
pub enum CiError {
    #[error("Code interpreter not configured: {0}")]
    NotConfigured(String),
    #[error("File upload failed: {0}")]
    Upload(String),
    #[error("Responses request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct CiRequest {
    pub question: String,
    /// 相对路径（写入输入上下文）
    pub artifact_paths: Vec<String>,
    /// 对应的绝对路径（用于上传）
    pub files: Vec<PathBuf>,
    pub plan: Option<AnalysisPlan>,
    pub brief: Option<String>,
}

impl CiRequest {
    /// Responses API 的 input 文本
    pub fn input_text(&self) -> String {
        let mut parts = vec![
            format!("QUESTION={}", self.question),
            format!("ARTIFACT_PATHS_JSON={}", json!(self.artifact_paths)),
        ];
        let mut extra = serde_json::Map::new();
        if let Some(plan) = &self.plan {
            parts.push(format!("ANALYSIS_PLAN_JSON={}", serde_json::to_string(plan).unwrap_or_default()));
            if !plan.metrics.is_empty() {
                extra.insert("metrics".into(), json!(plan.metrics));
            }
            if !plan.segments.is_empty() {
                extra.insert("segments".into(), json!(plan.segments));
            }
        }
        if let Some(brief) = &self.brief {
            extra.insert("analysisBrief".into(), json!(brief));
        }
        if !extra.is_empty() {
            parts.push(format!("OPTIONAL_CONTEXT={}", Value::Object(extra)));
        }
        parts.join("\n")
    }
}

#[async_trait]
pub trait CodeInterpreter: Send + Sync {
    /// 返回分析文本；空字符串表示没有产出
    async fn run(&self, request: &CiRequest) -> Result<String, CiError>;
}

/// Responses API 结果文本：output_text，否则拼接 output 中的文本片段
pub fn extract_output_text(body: &Value) -> String {
    if let Some(text) = body.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.to_string();
        }
    }
    let mut pieces: Vec<&str> = Vec::new();
    for item in body.get("output").and_then(Value::as_array).into_iter().flatten() {
        match item.get("type").and_then(Value::as_str) {
            Some("output_text") => pieces.extend(item.get("text").and_then(Value::as_str)),
            Some("message") => {
                for c in item.get("content").and_then(Value::as_array).into_iter().flatten() {
                    if c.get("type").and_then(Value::as_str) == Some("output_text") {
                        pieces.extend(c.get("text").and_then(Value::as_str));
                    }
                }
            }
            _ => {}
        }
    }
    pieces.join("\n")
}

pub struct OpenAiCodeInterpreter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    instructions: String,
    delete_files_after: bool,
}

impl OpenAiCodeInterpreter {
    /// base_url 缺省为 https://api.openai.com；末尾的 `/v1` 会被去掉
    pub fn new(base_url: Option<&str>, api_key: &str, model: &str, instructions: &str, delete_files_after: bool) -> Self {
        let base = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/');
        Self {
            http: reqwest::Client::new(),
            base_url: base.trim_end_matches("/v1").to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            instructions: instructions.to_string(),
            delete_files_after,
        }
    }

    async fn upload(&self, path: &PathBuf) -> Result<String, CiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CiError::Upload(format!("{}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact.json".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str("application/json")
            .map_err(|e| CiError::Upload(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let resp = self
            .http
            .post(format!("{}/v1/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CiError::Upload(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CiError::Upload(format!("status={}", resp.status())));
        }
        let body: Value = resp.json().await.map_err(|e| CiError::Upload(e.to_string()))?;
        body.get("id")
            .or_else(|| body.get("data").and_then(|d| d.get("id")))
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| CiError::Upload("response carried no file id".to_string()))
    }

    async fn delete_files(&self, ids: &[String]) {
        if !self.delete_files_after {
            return;
        }
        for id in ids {
            let result = self
                .http
                .delete(format!("{}/v1/files/{}", self.base_url, id))
                .bearer_auth(&self.api_key)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(file_id = %id, error = %e, "failed to delete uploaded file");
            }
        }
    }
}

#[async_trait]
impl CodeInterpreter for OpenAiCodeInterpreter {
    async fn run(&self, request: &CiRequest) -> Result<String, CiError> {
        if self.api_key.is_empty() {
            return Err(CiError::NotConfigured("OPENAI_API_KEY is not set".to_string()));
        }
        let mut file_ids = Vec::new();
        for path in &request.files {
            match self.upload(path).await {
                Ok(id) => file_ids.push(id),
                Err(e) => tracing::warn!(error = %e, "artifact upload failed"),
            }
        }
        if file_ids.is_empty() {
            return Err(CiError::Upload("no artifacts could be uploaded".to_string()));
        }

        let body = json!({
            "model": self.model,
            "tools": [{"type": "code_interpreter", "container": {"type": "auto", "file_ids": file_ids}}],
            "instructions": self.instructions,
            "input": request.input_text(),
        });
        let sent = self
            .http
            .post(format!("{}/v1/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;

        let outcome = match sent {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Value>()
                .await
                .map(|v| extract_output_text(&v))
                .map_err(|e| CiError::Request(e.to_string())),
            Ok(resp) => Err(CiError::Request(format!("status={}", resp.status()))),
            Err(e) => Err(CiError::Request(e.to_string())),
        };
        self.delete_files(&file_ids).await;
        outcome
    }
}
