//! 无头运行时装配
//!
//! 由 AppConfig 构建编排器所需的全部组件：能力客户端、agent 目录、MCP 连接器、
//! 字段目录缓存、产物存储、取数与总结执行器。CLI 与 Web 前端共用。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::AppConfig;
use crate::connector::{DatasourceConnector, McpHttpConnector};
use crate::core::{Orchestrator, OrchestratorSettings};
use crate::llm::{AgentCatalog, AgentKind, LlmClient, OpenAiClient, PromptError, PromptLoader};
use crate::memory::{ArtifactStore, MetadataCache};
use crate::phases::code_interpreter::{CodeInterpreter, OpenAiCodeInterpreter};
use crate::phases::fetch::FetchRunner;
use crate::phases::summarize::SummarizeRunner;
use crate::phases::AgentRunner;

/// 运行时装配失败（启动期即报错，不进入编排）
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("OPENAI_API_KEY is not set; the {0} provider needs an API key")]
    MissingApiKey(String),

    #[error("Unsupported LLM provider: {0}")]
    UnsupportedProvider(String),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// 已装配的运行时：编排器与其共享的数据源连接器（供数据源列表接口使用）
pub struct Runtime {
    pub config: AppConfig,
    pub connector: Arc<dyn DatasourceConnector>,
    pub orchestrator: Arc<Orchestrator>,
}

fn openai_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())
}

fn openai_base_url(cfg: &AppConfig) -> Option<String> {
    cfg.llm
        .base_url
        .clone()
        .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
        .filter(|u| !u.trim().is_empty())
}

/// 根据 [llm].provider 与 OPENAI_API_KEY 选择能力后端；缺 key 时启动即失败
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, RuntimeError> {
    let provider = cfg.llm.provider.trim().to_lowercase();
    if provider != "openai" {
        return Err(RuntimeError::UnsupportedProvider(cfg.llm.provider.clone()));
    }
    let key = openai_api_key().ok_or_else(|| RuntimeError::MissingApiKey(provider))?;
    let base = openai_base_url(cfg);
    tracing::info!(model = %cfg.llm.model, base_url = ?base, "Using OpenAI-compatible backend");
    Ok(Arc::new(OpenAiClient::new(base.as_deref(), &key)))
}

/// 每个 agent 的模型：[models.agents] 覆盖 → [models].default → [llm].model
pub fn load_agent_catalog(cfg: &AppConfig) -> Result<AgentCatalog, PromptError> {
    let default_model = cfg
        .models
        .default
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| cfg.llm.model.clone());
    let prompts = PromptLoader::new(&cfg.prompts.dir, cfg.prompts.strict, cfg.prompts.dev_reload);
    AgentCatalog::load(&default_model, &cfg.models.agents, &prompts)
}

fn create_code_interpreter(cfg: &AppConfig, catalog: &AgentCatalog) -> Option<Arc<dyn CodeInterpreter>> {
    if !cfg.summarize.ci_enabled {
        return None;
    }
    let key = openai_api_key()?;
    let analyst = catalog.get(AgentKind::Analyst);
    Some(Arc::new(OpenAiCodeInterpreter::new(
        openai_base_url(cfg).as_deref(),
        &key,
        &analyst.model,
        &analyst.instructions,
        cfg.summarize.delete_files_after,
    )))
}

/// 以给定的能力客户端、连接器与代码执行后端装配编排器
pub fn build_orchestrator(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    catalog: AgentCatalog,
    connector: Arc<dyn DatasourceConnector>,
    ci: Option<Arc<dyn CodeInterpreter>>,
) -> Orchestrator {
    let root = cfg.app.root();
    let mut agents = AgentRunner::new(llm, Arc::new(catalog));
    if cfg.llm.timeouts.request > 0 {
        agents = agents.with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request));
    }
    let metadata = Arc::new(MetadataCache::new(
        connector.clone(),
        root.join(&cfg.metadata.cache_dir),
        &cfg.tableau.site_name,
        cfg.metadata.ttl_ms,
    ));
    let store = ArtifactStore::new(&root, &cfg.artifacts.dir);
    let fetch = FetchRunner::new(connector, store.clone(), cfg.tableau.query_timeout());
    let summarize = SummarizeRunner::new(store, ci).with_snippet_chars(cfg.summarize.snippet_chars);
    Orchestrator::new(
        agents,
        metadata,
        fetch,
        summarize,
        OrchestratorSettings {
            max_fields: cfg.selector.max_fields,
            max_history_messages: cfg.app.max_history_messages,
        },
    )
}

/// 从配置装配完整运行时
pub fn create_runtime(cfg: AppConfig) -> Result<Runtime, RuntimeError> {
    let llm = create_llm_from_config(&cfg)?;
    let catalog = load_agent_catalog(&cfg)?;
    let ci = create_code_interpreter(&cfg, &catalog);
    if ci.is_none() {
        tracing::info!("code interpreter disabled, summaries use the lightweight path");
    }
    let mcp = McpHttpConnector::new(cfg.tableau.mcp_url.clone(), cfg.tableau.query_timeout());
    if !mcp.is_configured() {
        tracing::warn!("tableau.mcp_url not set, datasource calls will fail");
    }
    let connector: Arc<dyn DatasourceConnector> = Arc::new(mcp);
    let orchestrator = build_orchestrator(&cfg, llm, catalog, connector.clone(), ci);
    Ok(Runtime {
        config: cfg,
        connector,
        orchestrator: Arc::new(orchestrator),
    })
}
