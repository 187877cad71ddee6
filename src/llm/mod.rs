//! LLM 层：能力抽象、agent 目录、指令加载与客户端实现（OpenAI 兼容 / Mock）

pub mod agents;
pub mod json;
pub mod mock;
pub mod openai;
pub mod prompts;
pub mod traits;

pub use agents::{AgentCatalog, AgentKind, AgentSpec};
pub use json::parse_json_object;
pub use mock::{MockCall, MockLlmClient, MockReply};
pub use openai::OpenAiClient;
pub use prompts::{PromptError, PromptLoader};
pub use traits::{AgentOutput, LlmClient, LlmError, Usage};
