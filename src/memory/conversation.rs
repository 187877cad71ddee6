//! 对话消息：角色标记的轮次，作为能力调用的输入与会话历史

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// `KEY=<json>` 形式的系统上下文行（能力端按键名识别）
    pub fn context_json(key: &str, value: &serde_json::Value) -> Self {
        Self::system(format!("{}={}", key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(json["role"], "assistant");
    }

    #[test]
    fn test_context_json_line() {
        let msg = Message::context_json("ALLOWED_FIELDS_JSON", &serde_json::json!(["Sales"]));
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, r#"ALLOWED_FIELDS_JSON=["Sales"]"#);
    }
}
