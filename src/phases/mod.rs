//! 编排阶段：triage → metadata → selection → planning → fetch → summarize
//!
//! 每个阶段返回 `Result<T, Halt>`：Halt 表示本轮在该阶段结束（澄清、直接回复、失败或取消），
//! 不会以 panic 或裸错误越过阶段边界。

pub mod code_interpreter;
pub mod events;
pub mod fetch;
pub mod lightweight;
pub mod metadata;
pub mod plan;
pub mod selector;
pub mod summarize;
pub mod triage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::cancel::{run_cancelable, Cancelled};
use crate::core::error::PipelineError;
use crate::llm::{parse_json_object, AgentCatalog, AgentKind, AgentOutput, LlmClient, LlmError};
use crate::memory::Message;

pub use events::{EventSink, Locale, OrchestratorEvent};

/// 本轮在某阶段终止的原因
#[derive(Debug, Clone)]
pub enum Halt {
    /// 需要用户补充信息
    Clarify(String),
    /// 无需查询数据，直接以该文本回复
    Reply(String),
    Failed(PipelineError),
    Cancelled,
}

impl From<Cancelled> for Halt {
    fn from(_: Cancelled) -> Self {
        Halt::Cancelled
    }
}

pub type PhaseResult<T> = Result<T, Halt>;

#[derive(Debug, Clone)]
pub enum CallError {
    Cancelled,
    Agent(LlmError),
    /// 输出不是可解析的 JSON 对象
    Parse(String),
}

impl From<Cancelled> for CallError {
    fn from(_: Cancelled) -> Self {
        CallError::Cancelled
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Cancelled => f.write_str("cancelled"),
            CallError::Agent(e) => write!(f, "{}", e),
            CallError::Parse(msg) => f.write_str(msg),
        }
    }
}

/// 能力调用的统一入口：按 agent 取模型与指令，并在取消信号下执行
#[derive(Clone)]
pub struct AgentRunner {
    llm: Arc<dyn LlmClient>,
    agents: Arc<AgentCatalog>,
    request_timeout: Option<Duration>,
}

impl AgentRunner {
    pub fn new(llm: Arc<dyn LlmClient>, agents: Arc<AgentCatalog>) -> Self {
        Self {
            llm,
            agents,
            request_timeout: None,
        }
    }

    /// 单次能力调用超时；超时按调用失败处理
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub async fn call(
        &self,
        kind: AgentKind,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, CallError> {
        let spec = self.agents.get(kind);
        let started = Instant::now();
        let out = run_cancelable(cancel, || async {
            match self.request_timeout {
                Some(limit) => tokio::time::timeout(limit, self.llm.run(&spec, messages))
                    .await
                    .unwrap_or_else(|_| {
                        Err(LlmError::Request(format!(
                            "{} timed out after {}s",
                            kind.name(),
                            limit.as_secs()
                        )))
                    }),
                None => self.llm.run(&spec, messages).await,
            }
        })
        .await?;
        let out = out.map_err(CallError::Agent)?;
        tracing::debug!(
            agent = kind.name(),
            duration_ms = elapsed_ms(started),
            tokens = out.usage.map(|u| u.total_tokens).unwrap_or(0),
            "agent call finished"
        );
        Ok(out)
    }

    /// 调用并解析为 JSON 对象
    pub async fn call_json(
        &self,
        kind: AgentKind,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(Value, AgentOutput), CallError> {
        let out = self.call(kind, messages, cancel).await?;
        let value = parse_json_object(out.as_text()).map_err(CallError::Parse)?;
        Ok((value, out))
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// 将值序列化为 JSON；失败时退回 null（仅用于上下文行）
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_agent_failure() {
        let mock = Arc::new(MockLlmClient::new().hang(AgentKind::Triage));
        let runner = AgentRunner::new(mock, Arc::new(AgentCatalog::with_defaults("m")))
            .with_request_timeout(Duration::from_secs(5));
        let err = runner
            .call(AgentKind::Triage, &[Message::user("hi")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Agent(LlmError::Request(ref m)) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn test_call_json_parse_error() {
        let mock = Arc::new(MockLlmClient::new().reply(AgentKind::Triage, "not json"));
        let runner = AgentRunner::new(mock, Arc::new(AgentCatalog::with_defaults("m")));
        let err = runner
            .call_json(AgentKind::Triage, &[Message::user("hi")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Parse(_)));
    }
}
