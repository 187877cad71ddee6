//! 嵌入错误嗅探：连接器可能把部分失败包装成「成功」响应返回
//!
//! 这是尽力而为的启发式判断，不是确定性契约，刻意保持窄范围：
//! - 仅检查固定键 text / message / detail（需命中关键词）以及 error / errorMessage（非空即视为错误）
//! - `isError: true` 直接判定为错误
//! - text 本身是 JSON 时解析后递归检查，而不是对原文做关键词匹配
//! - 只下钻 content / result / errors 这类信封容器，不进入 data / rows / results 等用户数据
//! - 递归深度有上限
//!
//! 若连接器的错误契约改进，替换本函数即可。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

const MAX_DEPTH: usize = 4;
const MAX_MESSAGE_CHARS: usize = 500;

/// 命中关键词才视为错误的键
const KEYWORD_KEYS: &[&str] = &["text", "message", "detail"];
/// 出现非空值即视为错误的键
const ERROR_KEYS: &[&str] = &["error", "errorMessage"];
/// 允许下钻的信封容器
const ENVELOPE_KEYS: &[&str] = &["content", "result", "errors"];

fn keywords() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(error|exception|invalid|denied|failed|failure)\b").expect("static regex")
    })
}

/// 若负载中嵌有错误信号，返回错误消息
pub fn sniff_embedded_error(payload: &Value) -> Option<String> {
    match payload {
        // 顶层裸文本等同于一条 text 条目
        Value::String(s) => keyword_text(s, 0),
        other => sniff(other, 0),
    }
}

fn sniff(value: &Value, depth: usize) -> Option<String> {
    if depth > MAX_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => sniff_object(map, depth),
        // 只检查形如 MCP content 条目的数组（带 type 字段），数据行数组不检查
        Value::Array(items) => items
            .iter()
            .filter(|i| i.get("type").is_some())
            .find_map(|i| sniff(i, depth + 1)),
        _ => None,
    }
}

fn sniff_object(map: &Map<String, Value>, depth: usize) -> Option<String> {
    if map.get("isError").and_then(Value::as_bool) == Some(true) {
        let detail = KEYWORD_KEYS
            .iter()
            .chain(ERROR_KEYS)
            .find_map(|k| map.get(*k).and_then(describe))
            .or_else(|| {
                map.get("content")
                    .and_then(Value::as_array)
                    .and_then(|items| items.iter().find_map(|i| i.get("text").and_then(describe)))
            });
        return Some(detail.unwrap_or_else(|| "connector reported isError".to_string()));
    }

    for key in ERROR_KEYS {
        match map.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(clip(s.trim())),
            Some(Value::Object(inner)) => {
                let msg = sniff_object(inner, depth + 1)
                    .or_else(|| inner.get("message").and_then(describe))
                    .unwrap_or_else(|| clip(&Value::Object(inner.clone()).to_string()));
                return Some(msg);
            }
            _ => {}
        }
    }

    for key in KEYWORD_KEYS {
        if let Some(Value::String(s)) = map.get(*key) {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                if parsed.is_object() || parsed.is_array() {
                    if let Some(msg) = sniff(&parsed, depth + 1) {
                        return Some(msg);
                    }
                    continue;
                }
            }
            if let Some(msg) = keyword_text(s, depth) {
                return Some(msg);
            }
        }
    }

    ENVELOPE_KEYS.iter().find_map(|k| match map.get(*k) {
        Some(Value::Array(items)) if *k == "errors" => items
            .iter()
            .find_map(|i| sniff(i, depth + 1).or_else(|| i.as_str().map(clip))),
        Some(v) => sniff(v, depth + 1),
        None => None,
    })
}

fn keyword_text(text: &str, depth: usize) -> Option<String> {
    if depth > MAX_DEPTH {
        return None;
    }
    keywords().is_match(text).then(|| clip(text.trim()))
}

fn describe(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(clip(s.trim())),
        _ => None,
    }
}

fn clip(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_data_payload_passes() {
        let payload = json!({"data": [{"Category": "Furniture", "SUM(Sales)": 741999.8}]});
        assert_eq!(sniff_embedded_error(&payload), None);
    }

    #[test]
    fn test_keywords_inside_user_data_are_ignored() {
        let payload = json!({"data": [
            {"Status": "Failed", "message": "payment denied by bank"},
            {"Status": "Invalid address"}
        ]});
        assert_eq!(sniff_embedded_error(&payload), None);
    }

    #[test]
    fn test_text_item_with_error_keyword() {
        let payload = json!([{"type": "text", "text": "Error: Unknown field 'Revenue' in query"}]);
        let msg = sniff_embedded_error(&payload).unwrap();
        assert!(msg.contains("Revenue"));
    }

    #[test]
    fn test_text_wrapped_json_is_parsed_not_keyword_matched() {
        let rows = json!({"data": [{"Reason": "invalid coupon"}]}).to_string();
        let ok = json!([{"type": "text", "text": rows}]);
        assert_eq!(sniff_embedded_error(&ok), None);

        let err = json!({"error": {"message": "Permission denied for datasource"}}).to_string();
        let bad = json!([{"type": "text", "text": err}]);
        assert_eq!(
            sniff_embedded_error(&bad).as_deref(),
            Some("Permission denied for datasource")
        );
    }

    #[test]
    fn test_is_error_flag_and_error_keys() {
        let flagged = json!({"isError": true, "content": [{"type": "text", "text": "quota exhausted"}]});
        assert_eq!(sniff_embedded_error(&flagged).as_deref(), Some("quota exhausted"));
        let error_key = json!({"errorMessage": "Datasource offline"});
        assert_eq!(sniff_embedded_error(&error_key).as_deref(), Some("Datasource offline"));
        let errors = json!({"errors": [{"message": "Query failed to compile"}]});
        assert_eq!(
            sniff_embedded_error(&errors).as_deref(),
            Some("Query failed to compile")
        );
    }

    #[test]
    fn test_message_without_keyword_passes() {
        assert_eq!(sniff_embedded_error(&json!({"message": "ok", "data": []})), None);
        assert_eq!(sniff_embedded_error(&json!("all good")), None);
        assert!(sniff_embedded_error(&json!("Request failed with status 400")).is_some());
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut v = json!({"message": "exception thrown"});
        for _ in 0..10 {
            v = json!({"result": v});
        }
        assert_eq!(sniff_embedded_error(&v), None);
    }
}
