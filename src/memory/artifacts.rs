//! 查询结果产物：规范化 JSON 按时间戳 + 随机后缀命名落盘，返回相对路径
//!
//! 相对路径以 workspace_root 为基准（如 `logs/vdsapi_json/20240101_120000123_a1b2c3.json`），
//! 供 SummarizeRunner 及调用方读取。

use std::path::{Path, PathBuf};

use serde_json::Value;

/// 摘要文本中 JSON 预览的最大字符数
const SHAPE_PREVIEW_CHARS: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub request_id: String,
    pub rel_path: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    rel_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, rel_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rel_dir: rel_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 相对路径 → 绝对路径
    pub fn resolve(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    pub fn new_request_id() -> String {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let rand = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", stamp, &rand[..6])
    }

    pub async fn save(&self, payload: &Value) -> std::io::Result<SavedArtifact> {
        let request_id = Self::new_request_id();
        let rel = self.rel_dir.join(format!("{}.json", request_id));
        let full = self.root.join(&rel);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(payload)?;
        tokio::fs::write(&full, body).await?;
        tracing::debug!(path = %full.display(), "artifact saved");
        Ok(SavedArtifact {
            request_id,
            rel_path: rel.to_string_lossy().replace('\\', "/"),
        })
    }

    pub async fn read(&self, rel_path: &str) -> std::io::Result<Value> {
        let text = tokio::fs::read_to_string(self.resolve(rel_path)).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// 若连接器结果是 `[{ "text": "<json>" }, ...]` 或 JSON 字符串，解开成内层 JSON
pub fn unwrap_text_payload(payload: Value) -> Value {
    let inner = match &payload {
        Value::Array(items) => items
            .first()
            .and_then(|first| first.get("text"))
            .and_then(Value::as_str)
            .and_then(|t| serde_json::from_str(t).ok()),
        Value::String(s) => serde_json::from_str(s).ok(),
        _ => None,
    };
    inner.unwrap_or(payload)
}

/// 结果行数：数组长度，或对象中 rows / data / results 数组的长度
pub fn row_count(payload: &Value) -> Option<usize> {
    match payload {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => ["rows", "data", "results"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .map(Vec::len),
        _ => None,
    }
}

/// 结果形态的简短描述，如 `rows=12`、`data=40`，否则为截断的 JSON 文本
pub fn shape_summary(payload: &Value) -> String {
    match payload {
        Value::String(s) => truncate_chars(s, SHAPE_PREVIEW_CHARS),
        Value::Array(items) => format!("rows={}", items.len()),
        Value::Object(map) => {
            for key in ["rows", "data", "results"] {
                if let Some(arr) = map.get(key).and_then(Value::as_array) {
                    return format!("{}={}", key, arr.len());
                }
            }
            truncate_chars(&payload.to_string(), SHAPE_PREVIEW_CHARS)
        }
        other => other.to_string(),
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_read_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), "logs/vdsapi_json");
        let saved = store.save(&json!({"data": [{"Sales": 10}]})).await.unwrap();
        assert!(saved.rel_path.starts_with("logs/vdsapi_json/"));
        assert!(saved.rel_path.ends_with(&format!("{}.json", saved.request_id)));
        let back = store.read(&saved.rel_path).await.unwrap();
        assert_eq!(row_count(&back), Some(1));
    }

    #[test]
    fn test_request_ids_differ() {
        let a = ArtifactStore::new_request_id();
        let b = ArtifactStore::new_request_id();
        assert_ne!(a, b);
        assert_eq!(a.rsplit('_').next().map(str::len), Some(6));
    }

    #[test]
    fn test_unwrap_text_payload() {
        let wrapped = json!([{"type": "text", "text": "{\"data\":[1,2,3]}"}]);
        assert_eq!(unwrap_text_payload(wrapped), json!({"data": [1, 2, 3]}));
        let not_json = json!([{"text": "plain words"}]);
        assert_eq!(unwrap_text_payload(not_json.clone()), not_json);
        assert_eq!(unwrap_text_payload(json!("[1]")), json!([1]));
    }

    #[test]
    fn test_shape_summary() {
        assert_eq!(shape_summary(&json!([1, 2])), "rows=2");
        assert_eq!(shape_summary(&json!({"data": [1, 2, 3]})), "data=3");
        let long = json!({"blob": "x".repeat(2000)});
        assert_eq!(shape_summary(&long).chars().count(), SHAPE_PREVIEW_CHARS);
    }

    #[test]
    fn test_shape_summary_truncates_text_payload() {
        let text = json!("结果".repeat(1000));
        assert_eq!(shape_summary(&text).chars().count(), SHAPE_PREVIEW_CHARS);
        assert_eq!(shape_summary(&json!("short text")), "short text");
    }
}
