//! 六个能力（agent）：名称、模型、指令
//!
//! 模型按 agent 名覆盖，未配置时使用默认模型；指令由 [`PromptLoader`] 提供。

use std::collections::HashMap;

use serde::Serialize;

use crate::llm::prompts::{builtin_instructions, PromptError, PromptLoader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Triage,
    FieldSelector,
    AnalysisPlanner,
    VizqlBuilder,
    LightweightSummarizer,
    Analyst,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Triage,
        AgentKind::FieldSelector,
        AgentKind::AnalysisPlanner,
        AgentKind::VizqlBuilder,
        AgentKind::LightweightSummarizer,
        AgentKind::Analyst,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Triage => "triage",
            AgentKind::FieldSelector => "field-selector",
            AgentKind::AnalysisPlanner => "analysis-planner",
            AgentKind::VizqlBuilder => "vizql-builder",
            AgentKind::LightweightSummarizer => "lightweight-summarizer",
            AgentKind::Analyst => "analyst",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub kind: AgentKind,
    pub model: String,
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct AgentCatalog {
    agents: HashMap<AgentKind, AgentSpec>,
}

impl AgentCatalog {
    /// 从配置构建：`overrides` 以 agent 名为键（如 `"vizql-builder" = "gpt-4o"`）
    pub fn load(
        default_model: &str,
        overrides: &HashMap<String, String>,
        prompts: &PromptLoader,
    ) -> Result<Self, PromptError> {
        let mut agents = HashMap::new();
        for kind in AgentKind::ALL {
            let model = overrides
                .get(kind.name())
                .filter(|m| !m.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| default_model.to_string());
            let instructions = prompts.instructions(kind)?;
            agents.insert(kind, AgentSpec { kind, model, instructions });
        }
        Ok(Self { agents })
    }

    /// 全部使用内置指令与同一模型
    pub fn with_defaults(model: &str) -> Self {
        let agents = AgentKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    AgentSpec {
                        kind,
                        model: model.to_string(),
                        instructions: builtin_instructions(kind).to_string(),
                    },
                )
            })
            .collect();
        Self { agents }
    }

    pub fn get(&self, kind: AgentKind) -> AgentSpec {
        self.agents.get(&kind).cloned().unwrap_or_else(|| AgentSpec {
            kind,
            model: String::new(),
            instructions: builtin_instructions(kind).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_agent_model_override() {
        let mut overrides = HashMap::new();
        overrides.insert("vizql-builder".to_string(), "gpt-4o".to_string());
        overrides.insert("analyst".to_string(), "  ".to_string());
        let catalog = AgentCatalog::load("gpt-4o-mini", &overrides, &PromptLoader::builtin()).unwrap();
        assert_eq!(catalog.get(AgentKind::VizqlBuilder).model, "gpt-4o");
        assert_eq!(catalog.get(AgentKind::Analyst).model, "gpt-4o-mini");
        assert_eq!(catalog.get(AgentKind::Triage).model, "gpt-4o-mini");
    }

    #[test]
    fn test_names_are_kebab_case() {
        for kind in AgentKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.name());
        }
    }
}
