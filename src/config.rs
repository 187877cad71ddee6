//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `VIZQL__*` 覆盖（双下划线表示嵌套，如 `VIZQL__TABLEAU__MCP_URL=http://...`）。
//! 所有键都有默认值，缺文件不是错误。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::phases::Locale;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub models: ModelsSection,
    pub prompts: PromptsSection,
    pub tableau: TableauSection,
    pub metadata: MetadataSection,
    pub artifacts: ArtifactsSection,
    pub selector: SelectorSection,
    pub summarize: SummarizeSection,
}

/// [app] 段：应用名、工作目录、事件语言、日志文件、历史条数
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// logs/ 所在根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub locale: Locale,
    pub log_file: Option<PathBuf>,
    /// 传给 triage 的历史消息条数
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: None,
            locale: Locale::default(),
            log_file: None,
            max_history_messages: default_max_history_messages(),
        }
    }
}

fn default_max_history_messages() -> usize {
    20
}

impl AppSection {
    pub fn root(&self) -> PathBuf {
        self.workspace_root.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// [llm] 段：后端与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 目前仅支持 openai（含兼容端点），需要环境变量 OPENAI_API_KEY
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [models] 段：默认模型与按 agent 名覆盖（如 `[models.agents] triage = "gpt-4o"`）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsSection {
    pub default: Option<String>,
    #[serde(default)]
    pub agents: HashMap<String, String>,
}

/// [prompts] 段
#[derive(Debug, Clone, Deserialize)]
pub struct PromptsSection {
    #[serde(default = "default_prompts_dir")]
    pub dir: PathBuf,
    /// 缺提示词文件时报错而非使用内置说明
    #[serde(default)]
    pub strict: bool,
    /// 每次重新读取提示词文件
    #[serde(default)]
    pub dev_reload: bool,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            dir: default_prompts_dir(),
            strict: false,
            dev_reload: false,
        }
    }
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("prompts")
}

/// [tableau] 段：MCP 端点、站点名、查询超时
#[derive(Debug, Clone, Deserialize)]
pub struct TableauSection {
    pub mcp_url: Option<String>,
    #[serde(default = "default_site_name")]
    pub site_name: String,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for TableauSection {
    fn default() -> Self {
        Self {
            mcp_url: None,
            site_name: default_site_name(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

fn default_site_name() -> String {
    "default".to_string()
}

fn default_query_timeout_ms() -> u64 {
    15_000
}

impl TableauSection {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// [metadata] 段：字段目录缓存
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSection {
    /// 0 表示永不过期
    #[serde(default)]
    pub ttl_ms: u64,
    #[serde(default = "default_metadata_dir")]
    pub cache_dir: PathBuf,
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            ttl_ms: 0,
            cache_dir: default_metadata_dir(),
        }
    }
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("logs/metadata_json")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsSection {
    #[serde(default = "default_artifacts_dir")]
    pub dir: String,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

fn default_artifacts_dir() -> String {
    "logs/vdsapi_json".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSection {
    #[serde(default = "default_max_fields")]
    pub max_fields: usize,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            max_fields: default_max_fields(),
        }
    }
}

fn default_max_fields() -> usize {
    crate::phases::selector::DEFAULT_MAX_FIELDS
}

/// [summarize] 段：代码执行总结开关、轻量片段长度、上传文件清理
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeSection {
    #[serde(default = "default_true")]
    pub ci_enabled: bool,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_true")]
    pub delete_files_after: bool,
}

impl Default for SummarizeSection {
    fn default() -> Self {
        Self {
            ci_enabled: true,
            snippet_chars: default_snippet_chars(),
            delete_files_after: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_snippet_chars() -> usize {
    crate::phases::summarize::DEFAULT_SNIPPET_CHARS
}

/// 从 config 目录加载配置，环境变量 VIZQL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 VIZQL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("VIZQL")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.tableau.site_name, "default");
        assert_eq!(cfg.tableau.query_timeout(), Duration::from_millis(15_000));
        assert_eq!(cfg.metadata.ttl_ms, 0);
        assert_eq!(cfg.artifacts.dir, "logs/vdsapi_json");
        assert_eq!(cfg.selector.max_fields, 8);
        assert!(cfg.summarize.ci_enabled);
        assert_eq!(cfg.app.max_history_messages, 20);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[app]
locale = "zh"

[tableau]
mcp_url = "http://localhost:3927/mcp"
query_timeout_ms = 5000

[models.agents]
triage = "gpt-4o"

[selector]
max_fields = 12
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.locale, Locale::Zh);
        assert_eq!(cfg.tableau.mcp_url.as_deref(), Some("http://localhost:3927/mcp"));
        assert_eq!(cfg.tableau.query_timeout_ms, 5000);
        assert_eq!(cfg.models.agents.get("triage").map(String::as_str), Some("gpt-4o"));
        assert_eq!(cfg.selector.max_fields, 12);
        assert_eq!(cfg.tableau.site_name, "default");
    }
}
