//! 脚本化 Mock 客户端（用于测试，无需 API）
//!
//! 每个 agent 一条回复队列：文本、错误或永不返回（用于取消测试）。队列耗尽时
//! 重复最后一条；未配置的 agent 返回 `EmptyOutput`。记录每次调用的输入。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::agents::{AgentKind, AgentSpec};
use crate::llm::traits::{AgentOutput, LlmClient, LlmError, Usage};
use crate::memory::Message;

#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(String),
    /// 挂起直到被外部取消
    Hang,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub agent: AgentKind,
    pub messages: Vec<Message>,
}

impl MockCall {
    /// 查找 `KEY=` 开头的系统上下文行并返回其值
    pub fn context(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key);
        self.messages
            .iter()
            .find_map(|m| m.content.strip_prefix(prefix.as_str()))
    }
}

#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripts: Mutex<HashMap<AgentKind, VecDeque<MockReply>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, agent: AgentKind, reply: MockReply) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(agent).or_default().push_back(reply);
        }
    }

    pub fn reply(self, agent: AgentKind, text: impl Into<String>) -> Self {
        self.push(agent, MockReply::Text(text.into()));
        self
    }

    pub fn reply_json(self, agent: AgentKind, value: serde_json::Value) -> Self {
        self.reply(agent, value.to_string())
    }

    pub fn fail(self, agent: AgentKind, message: impl Into<String>) -> Self {
        self.push(agent, MockReply::Error(message.into()));
        self
    }

    pub fn hang(self, agent: AgentKind) -> Self {
        self.push(agent, MockReply::Hang);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, agent: AgentKind) -> Vec<MockCall> {
        self.calls().into_iter().filter(|c| c.agent == agent).collect()
    }

    pub fn call_count(&self, agent: AgentKind) -> usize {
        self.calls_for(agent).len()
    }

    fn next_reply(&self, agent: AgentKind) -> Option<MockReply> {
        let mut scripts = self.scripts.lock().ok()?;
        let queue = scripts.get_mut(&agent)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn run(&self, agent: &AgentSpec, messages: &[Message]) -> Result<AgentOutput, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                agent: agent.kind,
                messages: messages.to_vec(),
            });
        }
        match self.next_reply(agent.kind) {
            Some(MockReply::Text(text)) => {
                let mut out = AgentOutput::text(text);
                out.usage = Some(Usage::new(10, 5));
                Ok(out)
            }
            Some(MockReply::Error(message)) => Err(LlmError::Request(message)),
            Some(MockReply::Hang) => {
                std::future::pending::<()>().await;
                Err(LlmError::EmptyOutput(agent.kind.name().to_string()))
            }
            None => Err(LlmError::EmptyOutput(agent.kind.name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::agents::AgentCatalog;

    #[tokio::test]
    async fn test_queue_then_repeat_last() {
        let mock = MockLlmClient::new()
            .reply(AgentKind::Triage, "first")
            .reply(AgentKind::Triage, "second");
        let spec = AgentCatalog::with_defaults("m").get(AgentKind::Triage);
        let msgs = [Message::user("q")];
        assert_eq!(mock.run(&spec, &msgs).await.unwrap().as_text(), "first");
        assert_eq!(mock.run(&spec, &msgs).await.unwrap().as_text(), "second");
        assert_eq!(mock.run(&spec, &msgs).await.unwrap().as_text(), "second");
        assert_eq!(mock.call_count(AgentKind::Triage), 3);
    }

    #[tokio::test]
    async fn test_unscripted_agent_and_context_lookup() {
        let mock = MockLlmClient::new();
        let spec = AgentCatalog::with_defaults("m").get(AgentKind::Analyst);
        let msgs = [Message::user("q"), Message::system("MAX_N=8")];
        assert!(matches!(mock.run(&spec, &msgs).await, Err(LlmError::EmptyOutput(_))));
        assert_eq!(mock.calls()[0].context("MAX_N"), Some("8"));
    }
}
