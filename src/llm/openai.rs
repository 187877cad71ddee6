//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。agent 的指令作为首条
//! system 消息，模型取 agent 配置。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::agents::AgentSpec;
use crate::llm::traits::{AgentOutput, LlmClient, LlmError, Usage};
use crate::memory::{Message, Role};

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: &str) -> Self {
        let config = match base_url {
            Some(url) if !url.trim().is_empty() => OpenAIConfig::new()
                .with_api_base(url.trim_end_matches('/'))
                .with_api_key(api_key),
            _ => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(config),
        }
    }

    fn to_openai_messages(
        agent: &AgentSpec,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let invalid = |e: async_openai::error::OpenAIError| LlmError::InvalidRequest(e.to_string());
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !agent.instructions.is_empty() {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(agent.instructions.clone())
                    .build()
                    .map_err(invalid)?,
            ));
        }
        for m in messages {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn run(&self, agent: &AgentSpec, messages: &[Message]) -> Result<AgentOutput, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&agent.model)
            .messages(Self::to_openai_messages(agent, messages)?)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        tracing::debug!(agent = agent.kind.name(), model = %agent.model, "llm request");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let usage = response
            .usage
            .as_ref()
            .map(|u| Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64));

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::EmptyOutput(agent.kind.name().to_string()));
        }

        Ok(AgentOutput {
            final_output: Some(content.clone()),
            output: content,
            usage,
        })
    }
}
