//! Agent 指令加载：`<dir>/<agent>.xml`（兼容旧名 `<agent>.prompt.xml`）
//!
//! 去除 BOM 并 trim；按路径缓存（dev_reload 时跳过缓存）。严格模式下文件缺失即报错，
//! 非严格模式回退到内置指令。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;

use crate::llm::agents::AgentKind;

#[derive(Error, Debug, Clone)]
pub enum PromptError {
    #[error("Prompt XML not found or unreadable for {agent}: {path}")]
    NotFound { agent: String, path: String },
}

pub struct PromptLoader {
    dir: PathBuf,
    strict: bool,
    dev_reload: bool,
    cache: RwLock<HashMap<PathBuf, String>>,
}

impl PromptLoader {
    pub fn new(dir: impl Into<PathBuf>, strict: bool, dev_reload: bool) -> Self {
        Self {
            dir: dir.into(),
            strict,
            dev_reload,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 仅使用内置指令（测试与无 prompts 目录时）
    pub fn builtin() -> Self {
        Self::new(PathBuf::from("prompts"), false, false)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn candidates(&self, name: &str) -> [PathBuf; 2] {
        [
            self.dir.join(format!("{}.xml", name)),
            self.dir.join(format!("{}.prompt.xml", name)),
        ]
    }

    fn read_cached(&self, path: &Path) -> Option<String> {
        if !self.dev_reload {
            if let Ok(cache) = self.cache.read() {
                if let Some(hit) = cache.get(path) {
                    return Some(hit.clone());
                }
            }
        }
        let text = std::fs::read_to_string(path).ok()?;
        let cleaned = text.trim_start_matches('\u{FEFF}').trim().to_string();
        if cleaned.is_empty() {
            return None;
        }
        if !self.dev_reload {
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(path.to_path_buf(), cleaned.clone());
            }
        }
        Some(cleaned)
    }

    /// 读取指定名称的指令文件；找不到时：严格模式报错，否则返回 None
    pub fn load(&self, name: &str) -> Result<Option<String>, PromptError> {
        let candidates = self.candidates(name);
        for path in &candidates {
            if let Some(text) = self.read_cached(path) {
                return Ok(Some(text));
            }
        }
        if self.strict {
            return Err(PromptError::NotFound {
                agent: name.to_string(),
                path: candidates[0].display().to_string(),
            });
        }
        Ok(None)
    }

    /// agent 的指令：文件优先，非严格模式下回退到内置
    pub fn instructions(&self, kind: AgentKind) -> Result<String, PromptError> {
        match self.load(kind.name())? {
            Some(text) => Ok(text),
            None => {
                tracing::debug!(agent = kind.name(), "using built-in instructions");
                Ok(builtin_instructions(kind).to_string())
            }
        }
    }
}

pub fn builtin_instructions(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Triage => TRIAGE,
        AgentKind::FieldSelector => FIELD_SELECTOR,
        AgentKind::AnalysisPlanner => ANALYSIS_PLANNER,
        AgentKind::VizqlBuilder => VIZQL_BUILDER,
        AgentKind::LightweightSummarizer => LIGHTWEIGHT_SUMMARIZER,
        AgentKind::Analyst => ANALYST,
    }
}

const TRIAGE: &str = r#"You triage analytics questions about a Tableau datasource.
Return ONLY a JSON object:
{"needsData": bool, "requiredFields": [string], "filterHints": [{"fieldCaption": string, "operator": "IN|EQ|MATCH|CONTAINS", "values": [string], "note": string}],
 "brief": string, "briefNatural": string, "needsClarification": bool, "message": string}
Use exact captions from AVAILABLE_FIELDS_JSON when it is provided. Set needsClarification=true with a short question in message only when the request cannot be answered without more input."#;

const FIELD_SELECTOR: &str = r#"You choose the minimal set of datasource fields needed to answer the request.
Inputs: MAX_N (maximum number of fields), AVAILABLE_FIELDS_JSON, optional REQUIRED_FIELDS_JSON and FILTER_HINTS_JSON.
Return ONLY a JSON object: {"allowedFields": [{"fieldCaption": string, "function": string?}], "suggestedAliases": {alias: fieldCaption}, "clarify": string?}
Use exact fieldCaption values. Put measures with an aggregation function (SUM, AVG, MEDIAN, COUNT, COUNT_DISTINCT, MIN, MAX)."#;

const ANALYSIS_PLANNER: &str = r#"You design an analysis plan for the user's question using only ALLOWED_FIELDS_JSON.
Return ONLY a JSON object: {"analysis_plan": {"overview": string, "metrics": [string], "segments": [string],
 "steps": [{"id": string, "goal": string, "hypothesis": string?, "vizql_refinement": {"add_fields": [...], "adjust_filters": [...], "note": string}?, "ci": {"instructions": string, "expected_outputs": [string], "charts": [string]}?, "success_criteria": string?}],
 "assumptions": [string]}, "query": {"fields": [...], "filters": [...]}}
Add a "ci" directive to a step only when code execution is genuinely needed (statistics, forecasting, large tables)."#;

const VIZQL_BUILDER: &str = r#"You compile an executable VizQL Data Service query.
Use only fieldCaption values from ALLOWED_FIELDS_JSON. Filter types: TOP, SET, MATCH, QUANTITATIVE_DATE, QUANTITATIVE_NUMERICAL, DATE.
TOP needs howMany > 0 and fieldToMeasure; SET needs non-empty values; dates are RFC3339 (YYYY-MM-DD).
If BUILDER_FEEDBACK_JSON is present, fix every reported problem.
Return ONLY a JSON object: {"query": {"fields": [...], "filters": [...]}, "options": {"returnFormat": "OBJECTS"}}"#;

const LIGHTWEIGHT_SUMMARIZER: &str = r#"You summarize query results for a business user.
Inputs: QUESTION, RESULT_SNIPPET (possibly truncated JSON), optional ANALYSIS_PLAN_JSON.
Write concise markdown with sections: **Answer**, **Key figures**, **Notes**. Do not invent numbers that are not in the snippet."#;

const ANALYST: &str = "You are a data analyst. Read the provided JSON files with the code interpreter and answer the QUESTION succinctly in markdown, following ANALYSIS_PLAN_JSON when present.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_bom_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.xml");
        std::fs::write(&path, "\u{FEFF}  <instructions>triage</instructions>\n").unwrap();
        let loader = PromptLoader::new(dir.path(), true, false);
        assert_eq!(
            loader.instructions(AgentKind::Triage).unwrap(),
            "<instructions>triage</instructions>"
        );
        std::fs::write(&path, "<instructions>changed</instructions>").unwrap();
        assert_eq!(
            loader.instructions(AgentKind::Triage).unwrap(),
            "<instructions>triage</instructions>"
        );
    }

    #[test]
    fn test_dev_reload_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field-selector.xml");
        std::fs::write(&path, "v1").unwrap();
        let loader = PromptLoader::new(dir.path(), true, true);
        assert_eq!(loader.instructions(AgentKind::FieldSelector).unwrap(), "v1");
        std::fs::write(&path, "v2").unwrap();
        assert_eq!(loader.instructions(AgentKind::FieldSelector).unwrap(), "v2");
    }

    #[test]
    fn test_legacy_name_and_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("analyst.prompt.xml"), "legacy").unwrap();
        let strict = PromptLoader::new(dir.path(), true, false);
        assert_eq!(strict.instructions(AgentKind::Analyst).unwrap(), "legacy");
        assert!(matches!(
            strict.instructions(AgentKind::Triage),
            Err(PromptError::NotFound { .. })
        ));

        let lenient = PromptLoader::new(dir.path(), false, false);
        assert!(lenient.instructions(AgentKind::Triage).unwrap().contains("needsData"));
    }
}
