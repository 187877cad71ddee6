//! 从模型文本中取出 JSON 对象：```json 代码块，或首个 `{` 到最后一个 `}` 之间的内容

use serde_json::Value;

pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析为 JSON 对象；失败时返回可作为反馈的错误描述
pub fn parse_json_object(text: &str) -> Result<Value, String> {
    if text.trim().is_empty() {
        return Err("output was empty; expected a JSON object".to_string());
    }
    let candidate = extract_json_block(text).ok_or_else(|| "output did not contain a JSON object".to_string())?;
    let value: Value = serde_json::from_str(candidate).map_err(|e| format!("output is not valid JSON: {}", e))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("output must be a JSON object".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_block() {
        let text = "Here you go:\n```json\n{\"allowedFields\": [\"Sales\"]}\n```\nThanks";
        assert_eq!(parse_json_object(text).unwrap()["allowedFields"][0], "Sales");
    }

    #[test]
    fn test_braces_in_prose() {
        let text = "Result {\"a\": {\"b\": 1}} done";
        assert_eq!(parse_json_object(text).unwrap()["a"]["b"], 1);
    }

    #[test]
    fn test_errors() {
        assert!(parse_json_object("").unwrap_err().contains("empty"));
        assert!(parse_json_object("no json here").unwrap_err().contains("did not contain"));
        assert!(parse_json_object("{not: json}").unwrap_err().contains("not valid JSON"));
    }
}
