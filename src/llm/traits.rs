//! 能力抽象：`run(agent, messages) -> { finalOutput?, output, usage? }`
//!
//! 核心把模型当作黑盒：返回的文本必须经 JSON 解析与结构校验后才会使用。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::agents::AgentSpec;
use crate::memory::Message;

#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("Agent {0} returned no output")]
    EmptyOutput(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// 两次调用的用量合计（分析阶段重试时累加）
    pub fn merge(a: Option<Usage>, b: Option<Usage>) -> Option<Usage> {
        match (a, b) {
            (Some(x), Some(y)) => Some(Usage::new(
                x.prompt_tokens + y.prompt_tokens,
                x.completion_tokens + y.completion_tokens,
            )),
            (x, None) => x,
            (None, y) => y,
        }
    }
}

/// 一次能力调用的结果
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// 结构化的最终输出（存在时优先使用）
    pub final_output: Option<String>,
    /// 全部文本输出
    pub output: String,
    pub usage: Option<Usage>,
}

impl AgentOutput {
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            final_output: Some(text.clone()),
            output: text,
            usage: None,
        }
    }

    /// finalOutput 非空时取之，否则取全部文本输出
    pub fn as_text(&self) -> &str {
        match self.final_output.as_deref() {
            Some(s) if !s.trim().is_empty() => s,
            _ => &self.output,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 以 agent 的模型与指令运行一次，messages 为角色标记的有序轮次
    async fn run(&self, agent: &AgentSpec, messages: &[Message]) -> Result<AgentOutput, LlmError>;
}
