//! 模型输出的结构校验：逐路径收集问题（SchemaIssue），供重试提示与反馈使用
//!
//! 先在 serde_json::Value 上遍历检查常见违规（缺失、空、未知 filterType、未知聚合等），
//! 无问题再反序列化为强类型；反序列化仍失败时记为 Malformed。

use serde::Serialize;
use serde_json::{json, Value};

use super::schema::{
    AggFunction, AnalysisPlan, AnalysisPlannerOutput, PlannerPayload, FILTER_TYPES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Missing,
    Empty,
    InvalidType,
    UnsupportedFilterType,
    UnsupportedAggregation,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaIssue {
    pub path: String,
    pub kind: IssueKind,
    pub message: String,
}

impl SchemaIssue {
    fn new(path: &str, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// 一次校验的全部问题（至少一个）
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors(pub Vec<SchemaIssue>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn single(path: &str, kind: IssueKind, message: impl Into<String>) -> Self {
        Self(vec![SchemaIssue::new(path, kind, message)])
    }

    pub fn issues(&self) -> &[SchemaIssue] {
        &self.0
    }

    pub fn summary(&self) -> String {
        self.0
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn non_empty_str<'a>(v: Option<&'a Value>) -> Option<&'a str> {
    v.and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn check_caption(obj: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    match obj.get("fieldCaption") {
        None | Some(Value::Null) => issues.push(SchemaIssue::new(
            &join(path, "fieldCaption"),
            IssueKind::Missing,
            "fieldCaption is required",
        )),
        Some(Value::String(s)) if s.trim().is_empty() => issues.push(SchemaIssue::new(
            &join(path, "fieldCaption"),
            IssueKind::Empty,
            "fieldCaption must not be empty",
        )),
        Some(Value::String(_)) => {}
        Some(_) => issues.push(SchemaIssue::new(
            &join(path, "fieldCaption"),
            IssueKind::InvalidType,
            "fieldCaption must be a string",
        )),
    }
}

fn check_function(obj: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    match obj.get("function") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if AggFunction::parse(s).is_some() => {}
        Some(other) => {
            let token = other.as_str().map(String::from).unwrap_or_else(|| other.to_string());
            issues.push(SchemaIssue::new(
                &join(path, "function"),
                IssueKind::UnsupportedAggregation,
                format!("Unsupported aggregation function '{}'", token),
            ));
        }
    }
}

pub fn check_field_spec(v: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    if !v.is_object() {
        issues.push(SchemaIssue::new(path, IssueKind::InvalidType, "field must be an object"));
        return;
    }
    check_caption(v, path, issues);
    check_function(v, path, issues);
}

pub fn check_filter(v: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    if !v.is_object() {
        issues.push(SchemaIssue::new(path, IssueKind::InvalidType, "filter must be an object"));
        return;
    }
    let type_path = join(path, "filterType");
    let filter_type = match v.get("filterType") {
        Some(Value::String(t)) if FILTER_TYPES.contains(&t.as_str()) => t.as_str(),
        Some(Value::String(t)) => {
            issues.push(SchemaIssue::new(
                &type_path,
                IssueKind::UnsupportedFilterType,
                format!("Unsupported filterType '{}'", t),
            ));
            return;
        }
        _ => {
            issues.push(SchemaIssue::new(&type_path, IssueKind::Missing, "filterType is required"));
            return;
        }
    };

    let field_path = join(path, "field");
    match v.get("field") {
        Some(field) if field.is_object() => check_caption(field, &field_path, issues),
        _ => issues.push(SchemaIssue::new(
            &field_path,
            IssueKind::Missing,
            "filter requires field.fieldCaption",
        )),
    }

    if filter_type == "TOP" {
        let how_path = join(path, "howMany");
        match v.get("howMany") {
            None | Some(Value::Null) => issues.push(SchemaIssue::new(
                &how_path,
                IssueKind::Missing,
                "TOP filter requires howMany",
            )),
            Some(n) if n.as_i64().is_some() => {}
            Some(_) => issues.push(SchemaIssue::new(
                &how_path,
                IssueKind::InvalidType,
                "TOP filter howMany must be an integer",
            )),
        }
        let measure_path = join(path, "fieldToMeasure");
        match v.get("fieldToMeasure") {
            Some(m) if m.is_object() => {
                check_caption(m, &measure_path, issues);
                check_function(m, &measure_path, issues);
            }
            _ => issues.push(SchemaIssue::new(
                &measure_path,
                IssueKind::Missing,
                "TOP filter requires fieldToMeasure.fieldCaption",
            )),
        }
    }
}

pub fn check_query(v: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    if !v.is_object() {
        issues.push(SchemaIssue::new(path, IssueKind::Missing, "query object is required"));
        return;
    }
    let fields_path = join(path, "fields");
    match v.get("fields") {
        Some(Value::Array(items)) if items.is_empty() => issues.push(SchemaIssue::new(
            &fields_path,
            IssueKind::Empty,
            "query.fields must include at least one field",
        )),
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                check_field_spec(item, &format!("{}[{}]", fields_path, i), issues);
            }
        }
        Some(_) => issues.push(SchemaIssue::new(&fields_path, IssueKind::InvalidType, "fields must be an array")),
        None => issues.push(SchemaIssue::new(&fields_path, IssueKind::Missing, "query.fields is required")),
    }
    let filters_path = join(path, "filters");
    match v.get("filters") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                check_filter(item, &format!("{}[{}]", filters_path, i), issues);
            }
        }
        Some(_) => issues.push(SchemaIssue::new(&filters_path, IssueKind::InvalidType, "filters must be an array")),
    }
}

pub fn check_analysis_plan(v: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    if !v.is_object() {
        issues.push(SchemaIssue::new(path, IssueKind::Missing, "analysis_plan object is required"));
        return;
    }
    let steps_path = join(path, "steps");
    let steps = match v.get("steps") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) | None | Some(Value::Null) => {
            issues.push(SchemaIssue::new(
                &steps_path,
                IssueKind::Empty,
                "analysis_plan.steps must include at least one step",
            ));
            return;
        }
        Some(_) => {
            issues.push(SchemaIssue::new(&steps_path, IssueKind::InvalidType, "steps must be an array"));
            return;
        }
    };
    for (i, step) in steps.iter().enumerate() {
        let step_path = format!("{}[{}]", steps_path, i);
        if !step.is_object() {
            issues.push(SchemaIssue::new(&step_path, IssueKind::InvalidType, "step must be an object"));
            continue;
        }
        for key in ["id", "goal"] {
            if non_empty_str(step.get(key)).is_none() {
                issues.push(SchemaIssue::new(
                    &join(&step_path, key),
                    IssueKind::Missing,
                    format!("analysis_plan.steps[].{} is required", key),
                ));
            }
        }
        if let Some(refinement) = step.get("vizql_refinement").filter(|r| r.is_object()) {
            let ref_path = join(&step_path, "vizql_refinement");
            if let Some(Value::Array(add)) = refinement.get("add_fields") {
                for (j, f) in add.iter().enumerate() {
                    check_field_spec(f, &format!("{}.add_fields[{}]", ref_path, j), issues);
                }
            }
            if let Some(Value::Array(adjust)) = refinement.get("adjust_filters") {
                for (j, f) in adjust.iter().enumerate() {
                    check_filter(f, &format!("{}.adjust_filters[{}]", ref_path, j), issues);
                }
            }
        }
        if let Some(ci) = step.get("ci").filter(|c| !c.is_null()) {
            if non_empty_str(ci.get("instructions")).is_none() {
                issues.push(SchemaIssue::new(
                    &join(&step_path, "ci.instructions"),
                    IssueKind::Missing,
                    "analysis_plan.steps[].ci.instructions is required",
                ));
            }
        }
    }
}

fn finish<T: serde::de::DeserializeOwned>(value: Value, issues: Vec<SchemaIssue>) -> Result<T, ValidationErrors> {
    if !issues.is_empty() {
        return Err(ValidationErrors(issues));
    }
    serde_json::from_value(value)
        .map_err(|e| ValidationErrors::single("$", IssueKind::Malformed, e.to_string()))
}

pub fn validate_analysis_plan(value: &Value) -> Result<AnalysisPlan, ValidationErrors> {
    let mut issues = Vec::new();
    check_analysis_plan(value, "analysis_plan", &mut issues);
    finish(value.clone(), issues)
}

/// 分析阶段输出：需含 analysis_plan；可选 query 按可执行查询规则检查
pub fn validate_analysis_output(value: &Value) -> Result<AnalysisPlannerOutput, ValidationErrors> {
    if !value.is_object() {
        return Err(ValidationErrors::single("$", IssueKind::InvalidType, "output must be a JSON object"));
    }
    // 直接给出计划本体（顶层即 steps）时补一层 analysis_plan
    let value = if value.get("analysis_plan").is_none() && value.get("steps").is_some() {
        json!({ "analysis_plan": value })
    } else {
        value.clone()
    };
    let mut issues = Vec::new();
    match value.get("analysis_plan") {
        Some(plan) => check_analysis_plan(plan, "analysis_plan", &mut issues),
        None => issues.push(SchemaIssue::new("analysis_plan", IssueKind::Missing, "analysis_plan is required")),
    }
    if let Some(query) = value.get("query").filter(|q| !q.is_null()) {
        check_query(query, "query", &mut issues);
    }
    finish(value, issues)
}

/// 编译阶段输出：注入 datasourceLuid（不信任模型输出），补默认 options 后校验
pub fn validate_planner_payload(value: &Value, datasource_luid: &str) -> Result<PlannerPayload, ValidationErrors> {
    let Some(obj) = value.as_object() else {
        return Err(ValidationErrors::single("$", IssueKind::InvalidType, "payload must be a JSON object"));
    };
    let mut payload = if obj.contains_key("query") {
        obj.clone()
    } else if obj.contains_key("fields") {
        let mut wrapped = serde_json::Map::new();
        wrapped.insert("query".into(), value.clone());
        wrapped
    } else {
        obj.clone()
    };
    payload.insert("datasource".into(), json!({ "datasourceLuid": datasource_luid }));
    if !payload.get("options").map(Value::is_object).unwrap_or(false) {
        payload.insert("options".into(), json!({}));
    }
    if payload.get("analysis_plan").map(Value::is_null).unwrap_or(false) {
        payload.remove("analysis_plan");
    }

    let mut issues = Vec::new();
    match payload.get("query") {
        Some(q) => check_query(q, "query", &mut issues),
        None => issues.push(SchemaIssue::new("query", IssueKind::Missing, "query is required")),
    }
    if let Some(plan) = payload.get("analysis_plan") {
        check_analysis_plan(plan, "analysis_plan", &mut issues);
    }
    finish(Value::Object(payload), issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::schema::AggFunction;

    #[test]
    fn test_payload_luid_is_injected_not_trusted() {
        let raw = json!({
            "datasource": {"datasourceLuid": "hallucinated"},
            "query": {"fields": [{"fieldCaption": "Sales", "function": "SUM"}], "filters": []}
        });
        let payload = validate_planner_payload(&raw, "ds-real").unwrap();
        assert_eq!(payload.datasource.datasource_luid, "ds-real");
        assert_eq!(payload.query.fields[0].function, Some(AggFunction::Sum));
        assert!(payload.options.is_empty());
    }

    #[test]
    fn test_bare_query_is_wrapped() {
        let raw = json!({"fields": [{"fieldCaption": "Sales"}]});
        let payload = validate_planner_payload(&raw, "ds").unwrap();
        assert_eq!(payload.query.fields.len(), 1);
        assert!(payload.query.filters.is_empty());
    }

    #[test]
    fn test_collects_filter_issues_with_paths() {
        let raw = json!({"query": {
            "fields": [{"fieldCaption": "Sales", "function": "TOTAL"}],
            "filters": [
                {"filterType": "RANGE", "field": {"fieldCaption": "Sales"}},
                {"filterType": "TOP", "field": {"fieldCaption": "Customer"}}
            ]
        }});
        let err = validate_planner_payload(&raw, "ds").unwrap_err();
        let kinds: Vec<IssueKind> = err.issues().iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::UnsupportedAggregation));
        assert!(kinds.contains(&IssueKind::UnsupportedFilterType));
        let paths: Vec<&str> = err.issues().iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"query.filters[1].howMany"));
        assert!(paths.contains(&"query.filters[1].fieldToMeasure"));
    }

    #[test]
    fn test_empty_fields_rejected() {
        let err = validate_planner_payload(&json!({"query": {"fields": []}}), "ds").unwrap_err();
        assert_eq!(err.issues()[0].kind, IssueKind::Empty);
        assert!(err.summary().contains("at least one field"));
    }

    #[test]
    fn test_analysis_output_requires_steps() {
        let err = validate_analysis_output(&json!({"analysis_plan": {"overview": "x", "steps": []}})).unwrap_err();
        assert_eq!(err.issues()[0].path, "analysis_plan.steps");

        let ok = validate_analysis_output(&json!({
            "analysis_plan": {"steps": [{"id": "s1", "goal": "compare regions"}]},
            "query": {"fields": [{"fieldCaption": "Region"}, {"fieldCaption": "Sales", "function": "SUM"}]}
        }))
        .unwrap();
        assert_eq!(ok.analysis_plan.steps.len(), 1);
        assert_eq!(ok.query.map(|q| q.fields.len()), Some(2));
    }

    #[test]
    fn test_bare_plan_accepted_and_ci_checked() {
        let err = validate_analysis_output(&json!({
            "steps": [{"id": "s1", "goal": "g", "ci": {"instructions": ""}}]
        }))
        .unwrap_err();
        assert_eq!(err.issues()[0].path, "analysis_plan.steps[0].ci.instructions");
    }
}
