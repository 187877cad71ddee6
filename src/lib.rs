//! VizQL Pilot - 自然语言分析问题的阶段编排与重试引擎
//!
//! 模块划分：
//! - **agent**: 运行时装配（CLI / Web 共用）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **connector**: 数据源连接器抽象与 MCP HTTP 实现、嵌入错误嗅探
//! - **core**: 错误分类、取消、重试策略、会话状态、主控编排
//! - **llm**: 能力客户端抽象与实现（OpenAI 兼容 / Mock）、agent 目录与提示词
//! - **memory**: 对话消息、字段目录缓存、查询产物
//! - **phases**: 各编排阶段与事件总线
//! - **query**: VizQL 查询结构、校验、预检与重试提示

pub mod agent;
pub mod config;
pub mod connector;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod phases;
pub mod query;

pub use crate::core::{Orchestrator, SessionState, TurnRequest, TurnResult, TurnStatus};
pub use crate::phases::{EventSink, OrchestratorEvent};
