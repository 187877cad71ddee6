//! 元数据阶段：优先复用会话中同一数据源的字段目录，否则经 MetadataCache 获取

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::core::cancel::run_cancelable;
use crate::core::error::PipelineError;
use crate::core::state::SessionState;
use crate::memory::{MetadataCache, NormalizedField};

use super::{elapsed_ms, EventSink, Halt, OrchestratorEvent, PhaseResult};

pub async fn run_metadata(
    cache: &MetadataCache,
    state: &SessionState,
    datasource_luid: &str,
    force_refresh: bool,
    events: &EventSink,
    cancel: &CancellationToken,
) -> PhaseResult<Vec<NormalizedField>> {
    let started = Instant::now();
    events.emit(OrchestratorEvent::MetadataStart {
        datasource_luid: datasource_luid.to_string(),
    });

    if !force_refresh {
        if let Some(fields) = state.fields_for(datasource_luid) {
            events.emit(OrchestratorEvent::MetadataDone {
                source: "session".to_string(),
                field_count: fields.len(),
                duration_ms: elapsed_ms(started),
            });
            return Ok(fields.to_vec());
        }
    }

    let cached = run_cancelable(cancel, || cache.get_cached(datasource_luid, force_refresh)).await?;
    match cached {
        Some(hit) if !hit.fields.is_empty() => {
            let duration_ms = elapsed_ms(started);
            tracing::info!(
                datasource = %datasource_luid,
                source = hit.origin.as_str(),
                count = hit.fields.len(),
                duration_ms,
                "metadata ready"
            );
            events.emit(OrchestratorEvent::MetadataDone {
                source: hit.origin.as_str().to_string(),
                field_count: hit.fields.len(),
                duration_ms,
            });
            Ok(hit.fields)
        }
        _ => {
            let last_error = cache
                .last_error(datasource_luid)
                .await
                .unwrap_or_else(|| "metadata response contained no fields".to_string());
            let message = format!(
                "No metadata fields available for the datasource. {}. Please verify credentials and the datasource LUID ({}).",
                last_error.trim_end_matches('.'),
                datasource_luid
            );
            events.emit(OrchestratorEvent::MetadataError {
                message: message.clone(),
                duration_ms: elapsed_ms(started),
            });
            Err(Halt::Failed(PipelineError::MetadataUnavailable(message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorError, DatasourceConnector, DatasourceInfo, QueryRequest};
    use crate::core::state::SessionMetadata;
    use crate::phases::events::drain;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingConnector {
        calls: AtomicUsize,
        payload: Value,
    }

    #[async_trait]
    impl DatasourceConnector for CountingConnector {
        async fn query_datasource(&self, _: &QueryRequest) -> Result<Value, ConnectorError> {
            Ok(Value::Null)
        }
        async fn read_metadata(&self, _: &str) -> Result<Value, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.clone())
        }
        async fn list_datasources(&self) -> Result<Vec<DatasourceInfo>, ConnectorError> {
            Ok(vec![])
        }
    }

    fn cache_with(payload: Value, dir: &std::path::Path) -> (Arc<CountingConnector>, MetadataCache) {
        let conn = Arc::new(CountingConnector {
            calls: AtomicUsize::new(0),
            payload,
        });
        let cache = MetadataCache::new(conn.clone(), dir, "site", 0);
        (conn, cache)
    }

    #[tokio::test]
    async fn test_session_fields_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, cache) = cache_with(json!({"data": []}), dir.path());
        let mut state = SessionState::new();
        state.metadata = Some(SessionMetadata {
            datasource_luid: "ds-1".into(),
            fields: vec![NormalizedField {
                field_caption: "Sales".into(),
                data_type: None,
                default_aggregation: Some("SUM".into()),
            }],
        });
        let (sink, mut rx) = EventSink::channel();
        let fields = run_metadata(&cache, &state, "ds-1", false, &sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(conn.calls.load(Ordering::SeqCst), 0);
        let events = drain(&mut rx);
        assert!(matches!(&events[1], OrchestratorEvent::MetadataDone { source, .. } if source == "session"));
    }

    #[tokio::test]
    async fn test_empty_metadata_halts_with_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (_, cache) = cache_with(json!({"data": []}), dir.path());
        let err = run_metadata(&cache, &SessionState::new(), "ds-9", false, &EventSink::noop(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Halt::Failed(PipelineError::MetadataUnavailable(msg)) => {
                assert!(msg.starts_with("No metadata fields available"));
                assert!(msg.contains("(ds-9)"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, cache) = cache_with(json!({"data": [{"fieldCaption": "Sales"}]}), dir.path());
        let token = CancellationToken::new();
        token.cancel();
        let err = run_metadata(&cache, &SessionState::new(), "ds-1", false, &EventSink::noop(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Halt::Cancelled));
        assert_eq!(conn.calls.load(Ordering::SeqCst), 0);
    }
}
