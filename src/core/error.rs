//! 编排错误分类与面向用户的错误文案
//!
//! 与各阶段的重试策略配合：校验类、数据源类错误在本地有界重试；取消与必填字段缺失立即终止本轮。

use serde::Serialize;
use thiserror::Error;

/// 错误分类码（稳定的 snake_case 字符串，随事件发往前端）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BuilderValidation,
    PreflightValidation,
    SourceError,
    Timeout,
    Cancelled,
    MissingRequiredField,
    AnalysisPlanValidationFailed,
    AgentFailure,
    MetadataUnavailable,
    PreconditionFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BuilderValidation => "builder_validation",
            ErrorKind::PreflightValidation => "preflight_validation",
            ErrorKind::SourceError => "source_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::MissingRequiredField => "missing_required_field",
            ErrorKind::AnalysisPlanValidationFailed => "analysis_plan_validation_failed",
            ErrorKind::AgentFailure => "agent_failure",
            ErrorKind::MetadataUnavailable => "metadata_unavailable",
            ErrorKind::PreconditionFailed => "precondition_failed",
        }
    }

    /// 是否允许在本地重试；各阶段的 RetryPolicy 以此为准。
    /// 取消、必填字段缺失、前置条件失败、能力调用失败永不重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::BuilderValidation
                | ErrorKind::PreflightValidation
                | ErrorKind::SourceError
                | ErrorKind::AnalysisPlanValidationFailed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一轮编排中各阶段返回的结构化失败（不会越过阶段边界向上抛出）
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Builder validation failed: {0}")]
    BuilderValidation(String),

    #[error("Preflight validation failed: {0}")]
    PreflightValidation(String),

    #[error("Source error: {0}")]
    SourceError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Missing required fields: {}", fields.join(", "))]
    MissingRequiredField {
        fields: Vec<String>,
        candidates: Vec<String>,
    },

    #[error("Analysis plan validation failed: {0}")]
    AnalysisPlanValidationFailed(String),

    #[error("Agent call failed: {0}")]
    Agent(String),

    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// 输入缺失等前置条件不满足；next_action 缺省时使用通用提示
    #[error("Precondition failed: {cause}")]
    Precondition {
        cause: String,
        required_input: Vec<String>,
        next_action: Option<String>,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::BuilderValidation(_) => ErrorKind::BuilderValidation,
            PipelineError::PreflightValidation(_) => ErrorKind::PreflightValidation,
            PipelineError::SourceError(_) => ErrorKind::SourceError,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::MissingRequiredField { .. } => ErrorKind::MissingRequiredField,
            PipelineError::AnalysisPlanValidationFailed(_) => {
                ErrorKind::AnalysisPlanValidationFailed
            }
            PipelineError::Agent(_) => ErrorKind::AgentFailure,
            PipelineError::MetadataUnavailable(_) => ErrorKind::MetadataUnavailable,
            PipelineError::Precondition { .. } => ErrorKind::PreconditionFailed,
        }
    }

    pub fn precondition(
        cause: impl Into<String>,
        required_input: &[&str],
        next_action: Option<&str>,
    ) -> Self {
        PipelineError::Precondition {
            cause: cause.into(),
            required_input: required_input.iter().map(|s| s.to_string()).collect(),
            next_action: next_action.map(String::from),
        }
    }
}

const DEFAULT_NEXT_ACTION: &str = "Provide missing inputs or fix the cause, then retry.";

/// 将错误渲染为用户可读文本；前置条件失败使用 Cause / Required Input / Next Action 三行格式
pub fn format_for_user(err: &PipelineError) -> String {
    match err {
        PipelineError::Precondition {
            cause,
            required_input,
            next_action,
        } => {
            let required = if required_input.is_empty() {
                "-".to_string()
            } else {
                required_input.join(", ")
            };
            format!(
                "Cause: {}\nRequired Input: {}\nNext Action: {}",
                cause,
                required,
                next_action.as_deref().unwrap_or(DEFAULT_NEXT_ACTION)
            )
        }
        PipelineError::MissingRequiredField { fields, candidates } => {
            let mut text = format!(
                "The following fields were not found in the datasource: {}.",
                fields.join(", ")
            );
            if !candidates.is_empty() {
                text.push_str(&format!(" Did you mean: {}?", candidates.join(", ")));
            }
            text
        }
        // 已耗尽重试的校验/数据源错误直接以最后一次反馈作为回复
        PipelineError::BuilderValidation(msg)
        | PipelineError::PreflightValidation(msg)
        | PipelineError::SourceError(msg)
        | PipelineError::MetadataUnavailable(msg) => msg.clone(),
        PipelineError::Cancelled => "The request was cancelled.".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_precondition_three_lines() {
        let err = PipelineError::precondition("message is required", &["message"], None);
        let text = format_for_user(&err);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Cause: message is required");
        assert_eq!(lines[1], "Required Input: message");
        assert!(lines[2].starts_with("Next Action: Provide missing inputs"));
    }

    #[test]
    fn test_format_missing_field_lists_candidates() {
        let err = PipelineError::MissingRequiredField {
            fields: vec!["Revenue".into()],
            candidates: vec!["Sales".into(), "Profit".into()],
        };
        let text = format_for_user(&err);
        assert!(text.contains("Revenue"));
        assert!(text.contains("Sales, Profit"));
        assert_eq!(err.kind(), ErrorKind::MissingRequiredField);
    }

    #[test]
    fn test_kind_retryability() {
        assert!(ErrorKind::SourceError.is_retryable());
        assert!(ErrorKind::PreflightValidation.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::MissingRequiredField.is_retryable());
        assert!(!ErrorKind::AgentFailure.is_retryable());
        assert!(ErrorKind::AnalysisPlanValidationFailed.is_retryable());
        assert_eq!(
            serde_json::to_value(ErrorKind::AnalysisPlanValidationFailed).unwrap(),
            serde_json::json!("analysis_plan_validation_failed")
        );
    }

    #[test]
    fn test_exhausted_source_error_surfaces_message() {
        let err = PipelineError::SourceError("field 'Foo' does not exist".into());
        assert_eq!(format_for_user(&err), "field 'Foo' does not exist");
    }
}
