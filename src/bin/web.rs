//! VizQL Pilot Web 接口
//!
//! 启动: cargo run --bin vizql-pilot-web --features web
//! 端口由 VIZQL_WEB_PORT 指定，缺省 8080。

#![cfg(feature = "web")]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use vizql_pilot::agent::{create_runtime, Runtime};
use vizql_pilot::config::load_config;
use vizql_pilot::connector::resolve_datasources_by_names;
use vizql_pilot::core::{SessionState, TurnRequest, TurnResult, TurnStatus};
use vizql_pilot::observability;
use vizql_pilot::phases::{EventSink, Locale, OrchestratorEvent};

struct AppState {
    runtime: Runtime,
    locale: Locale,
    /// session_id -> 会话状态快照
    sessions: RwLock<HashMap<String, SessionState>>,
    /// session_id -> 正在执行的轮次的取消信号
    running: RwLock<HashMap<String, CancellationToken>>,
}

impl AppState {
    /// 登记本轮取消信号，并取出会话当前快照
    async fn begin_turn(&self, session_id: &str) -> (SessionState, CancellationToken) {
        let cancel = CancellationToken::new();
        if let Some(prev) = self.running.write().await.insert(session_id.to_string(), cancel.clone()) {
            tracing::info!(session_id, "new turn supersedes a running one, cancelling it");
            prev.cancel();
        }
        let snapshot = self.sessions.read().await.get(session_id).cloned().unwrap_or_default();
        (snapshot, cancel)
    }

    async fn finish_turn(&self, session_id: &str, result: &TurnResult) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), result.state.clone());
        self.running.write().await.remove(session_id);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrchestrateRequest {
    message: String,
    datasource_luid: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    refresh_metadata: bool,
}

impl OrchestrateRequest {
    fn session_id(&self) -> String {
        self.session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn turn(&self) -> TurnRequest {
        let mut req = TurnRequest::new(self.message.clone(), self.datasource_luid.clone());
        req.refresh_metadata = self.refresh_metadata;
        req
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrchestrateResponse {
    session_id: String,
    reply: String,
    status: TurnStatus,
    artifact_paths: Vec<String>,
    duration_ms: u64,
    events: Vec<OrchestratorEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct DatasourceQuery {
    /// 逗号分隔的数据源名称
    #[serde(default)]
    names: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = load_config(None)?;
    observability::init(cfg.app.log_file.as_deref());

    let locale = cfg.app.locale;
    let runtime = create_runtime(cfg)?;
    let state = Arc::new(AppState {
        runtime,
        locale,
        sessions: RwLock::new(HashMap::new()),
        running: RwLock::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/datasources", get(api_datasources))
        .route("/api/orchestrate", post(api_orchestrate))
        .route("/api/orchestrate/stream", get(api_orchestrate_stream))
        .route("/api/orchestrate/cancel", post(api_orchestrate_cancel))
        .with_state(state);

    let port = std::env::var("VIZQL_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("VizQL Pilot web: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// GET /api/datasources?names=a,b
async fn api_datasources(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DatasourceQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let all = state
        .runtime
        .connector
        .list_datasources()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    let names: Vec<String> = q
        .names
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    let found = resolve_datasources_by_names(all, &names);
    Ok(Json(serde_json::json!({ "datasources": found })))
}

/// POST /api/orchestrate：执行一轮，返回回复与收集到的事件
async fn api_orchestrate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrchestrateRequest>,
) -> Json<OrchestrateResponse> {
    let session_id = req.session_id();
    let (snapshot, cancel) = state.begin_turn(&session_id).await;
    let (events, mut rx) = EventSink::channel();
    let result = state
        .runtime
        .orchestrator
        .run_turn(&req.turn(), &snapshot, &events, &cancel)
        .await;
    state.finish_turn(&session_id, &result).await;
    drop(events);

    let mut collected = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        collected.push(ev);
    }
    Json(OrchestrateResponse {
        session_id,
        reply: result.reply,
        status: result.status,
        artifact_paths: result.artifact_paths,
        duration_ms: result.duration_ms,
        events: collected,
    })
}

fn to_sse_events(ev: &OrchestratorEvent, locale: Locale) -> Vec<Event> {
    let mut out = Vec::with_capacity(2);
    match serde_json::to_string(ev) {
        Ok(json) => out.push(Event::default().event(ev.event_type()).data(json)),
        Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
    }
    if let Some(line) = ev.render(locale) {
        out.push(Event::default().event("message").data(line));
    }
    out
}

/// GET /api/orchestrate/stream：SSE 推送阶段事件；客户端断开即取消本轮
async fn api_orchestrate_stream(
    State(state): State<Arc<AppState>>,
    Query(req): Query<OrchestrateRequest>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let session_id = req.session_id();
    let (snapshot, cancel) = state.begin_turn(&session_id).await;
    let (events, rx) = EventSink::channel();

    let worker_state = state.clone();
    let worker_cancel = cancel.clone();
    let worker_session = session_id.clone();
    tokio::spawn(async move {
        let result = worker_state
            .runtime
            .orchestrator
            .run_turn(&req.turn(), &snapshot, &events, &worker_cancel)
            .await;
        worker_state.finish_turn(&worker_session, &result).await;
    });

    let first = Event::default()
        .event("session")
        .data(serde_json::json!({ "sessionId": session_id }).to_string());
    let pending: VecDeque<Event> = VecDeque::from([first]);
    // 流被丢弃（客户端断开）时 guard 触发取消
    let guard = cancel.drop_guard();
    let locale = state.locale;

    let event_stream = stream::unfold(
        (rx, pending, guard),
        move |(mut rx, mut pending, guard)| async move {
            loop {
                if let Some(ev) = pending.pop_front() {
                    return Some((Ok(ev), (rx, pending, guard)));
                }
                match rx.recv().await {
                    Some(ev) => pending.extend(to_sse_events(&ev, locale)),
                    None => {
                        let _ = guard.disarm();
                        return None;
                    }
                }
            }
        },
    );

    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// POST /api/orchestrate/cancel
async fn api_orchestrate_cancel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelRequest>,
) -> Json<serde_json::Value> {
    let cancelled = match state.running.read().await.get(&req.session_id) {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    };
    tracing::info!(session_id = %req.session_id, cancelled, "cancel requested");
    Json(serde_json::json!({ "sessionId": req.session_id, "cancelled": cancelled }))
}
