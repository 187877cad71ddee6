//! 数据源原始 schema → 稳定字段形态 NormalizedField

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 规范化后的字段；fieldCaption 在同一数据源内唯一
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedField {
    pub field_caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// None 表示无可执行的默认聚合（维度或日期截断粒度）
    #[serde(default)]
    pub default_aggregation: Option<String>,
}

/// 日期截断粒度等不可直接作为查询 function 的聚合标记
const NON_EXECUTABLE_AGGREGATIONS: &[&str] = &[
    "YEAR",
    "QUARTER",
    "MONTH",
    "WEEK",
    "DAY",
    "TRUNC_YEAR",
    "TRUNC_QUARTER",
    "TRUNC_MONTH",
    "TRUNC_WEEK",
    "TRUNC_DAY",
    "AGG",
    "NONE",
    "UNSPECIFIED",
];

/// 聚合标记规范化：大写；COUNTD → COUNT_DISTINCT；不可执行标记 → None
pub fn normalize_aggregation(token: &str) -> Option<String> {
    let upper = token.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return None;
    }
    if upper == "COUNTD" {
        return Some("COUNT_DISTINCT".to_string());
    }
    if NON_EXECUTABLE_AGGREGATIONS.contains(&upper.as_str()) {
        return None;
    }
    Some(upper)
}

/// 取出字段条目数组：优先 `data`，其次 `fields`，再次裸数组
fn field_items(raw: &Value) -> &[Value] {
    if let Some(items) = raw.get("data").and_then(Value::as_array) {
        return items;
    }
    if let Some(items) = raw.get("fields").and_then(Value::as_array) {
        return items;
    }
    raw.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn str_at<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| item.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// 规范化原始元数据；无标题的条目跳过，重复标题保留首个
pub fn normalize_fields(raw: &Value) -> Vec<NormalizedField> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in field_items(raw) {
        let Some(caption) = str_at(item, &["fieldCaption", "fieldName", "name"]) else {
            continue;
        };
        if !seen.insert(caption.to_string()) {
            continue;
        }
        out.push(NormalizedField {
            field_caption: caption.to_string(),
            data_type: str_at(item, &["dataType"]).map(String::from),
            default_aggregation: str_at(item, &["defaultAggregation"])
                .and_then(normalize_aggregation),
        });
    }
    out
}
