use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentEvent, Outcome};
use crate::catalog::TableInfo;
use crate::config::BackendConfig;
use crate::error::AgentError;
use crate::memory::ConversationTurn;
use crate::runtime::BackendRuntime;
use crate::session::{DbCredentials, DEFAULT_SESSION_ID};

#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<BackendRuntime>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ConfigureAgentRequest {
    session_id: Option<String>,
    db_credentials: DbCredentials,
    tables: Vec<TableInfo>,
}

#[derive(Debug, Serialize)]
struct ConfigureAgentResponse {
    session_id: String,
    message: String,
    tables: Vec<TableInfo>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    session_id: Option<String>,
    question: String,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    answer: String,
    outcome: Outcome,
    sql_query: Option<String>,
    retry_count: u32,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TablesResponse {
    session_id: String,
    dialect: String,
    configured_at: DateTime<Utc>,
    tables: Vec<TableInfo>,
}

#[derive(Debug, Serialize)]
struct DeleteSessionResponse {
    deleted: bool,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<AgentEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("TABLEWISE_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid TABLEWISE_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        runtime: Arc::new(runtime),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Tablewise backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/configure_agent", post(configure_agent))
        .route("/query", post(query))
        .route("/tables", get(list_tables))
        .route("/sessions/:id/history", get(get_history))
        .route("/sessions/:id", axum::routing::delete(delete_session))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<AgentEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let envelope = map_agent_event(event);
            let _ = ws_events.send(envelope);
        }
    });
}

fn map_agent_event(event: AgentEvent) -> ApiEventEnvelope {
    match event {
        AgentEvent::StageEntered { session_id, stage } => envelope(
            "stage_entered",
            serde_json::json!({ "session_id": session_id, "stage": stage }),
        ),
        AgentEvent::SqlGenerated { session_id, sql } => envelope(
            "sql_generated",
            serde_json::json!({ "session_id": session_id, "sql": sql }),
        ),
        AgentEvent::SqlFailed { session_id, error } => envelope(
            "sql_failed",
            serde_json::json!({ "session_id": session_id, "error": error }),
        ),
        AgentEvent::Validated {
            session_id,
            relevant,
        } => envelope(
            "validated",
            serde_json::json!({ "session_id": session_id, "relevant": relevant }),
        ),
        AgentEvent::RetryScheduled {
            session_id,
            retry_count,
        } => envelope(
            "retry_scheduled",
            serde_json::json!({ "session_id": session_id, "retry_count": retry_count }),
        ),
        AgentEvent::Answered {
            session_id,
            outcome,
        } => envelope(
            "answered",
            serde_json::json!({ "session_id": session_id, "outcome": outcome }),
        ),
        AgentEvent::MemoryCompacted {
            session_id,
            before,
            after,
        } => envelope(
            "memory_compacted",
            serde_json::json!({
                "session_id": session_id,
                "before": before,
                "after": after
            }),
        ),
        AgentEvent::Error(error) => envelope("error", serde_json::json!({ "error": error })),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("TABLEWISE_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("TABLEWISE_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "TABLEWISE_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid TABLEWISE_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.auth.permits(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

impl BackendAuthConfig {
    fn permits(&self, headers: &HeaderMap) -> bool {
        match (self.mode, self.token.as_deref()) {
            (AuthMode::Disabled, _) => true,
            (AuthMode::Required, None) => false,
            (AuthMode::Required, Some(token)) => headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().strip_prefix("Bearer "))
                .is_some_and(|presented| presented == token),
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_config(State(state): State<Arc<ServerState>>) -> Json<BackendConfig> {
    Json(state.runtime.config.redacted())
}

async fn configure_agent(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ConfigureAgentRequest>,
) -> Result<Json<ConfigureAgentResponse>, (StatusCode, String)> {
    let session_id = session_or_default(body.session_id);
    let session = state
        .runtime
        .configure_session(&session_id, &body.db_credentials, body.tables)
        .await
        .map_err(|e| agent_error(e, StatusCode::BAD_REQUEST))?;

    Ok(Json(ConfigureAgentResponse {
        message: format!(
            "Agent configured with {} table(s) for dialect '{}'",
            session.tables().len(),
            session.dialect()
        ),
        tables: session.tables().to_vec(),
        session_id,
    }))
}

async fn query(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, String)> {
    let question = body.question.trim();
    if question.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "question cannot be empty".to_string(),
        ));
    }

    let session_id = session_or_default(body.session_id);
    let session = state
        .runtime
        .registry
        .get(&session_id)
        .await
        .map_err(|e| agent_error(e, StatusCode::BAD_REQUEST))?;

    let outcome = session
        .query(question)
        .await
        .map_err(|e| agent_error(e, StatusCode::BAD_REQUEST))?;

    Ok(Json(QueryResponse {
        answer: outcome.answer,
        outcome: outcome.outcome,
        sql_query: outcome.sql_query,
        retry_count: outcome.retry_count,
    }))
}

async fn list_tables(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<SessionQuery>,
) -> Result<Json<TablesResponse>, (StatusCode, String)> {
    let session_id = session_or_default(params.session_id);
    let session = state
        .runtime
        .registry
        .get(&session_id)
        .await
        .map_err(|e| agent_error(e, StatusCode::NOT_FOUND))?;

    Ok(Json(TablesResponse {
        session_id,
        dialect: session.dialect().to_string(),
        configured_at: session.configured_at(),
        tables: session.tables().to_vec(),
    }))
}

async fn get_history(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ConversationTurn>>, (StatusCode, String)> {
    let session = require_session(&state, &session_id).await?;
    Ok(Json(session.history().await))
}

async fn delete_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteSessionResponse>, (StatusCode, String)> {
    if !state.runtime.registry.remove(&session_id).await {
        return Err(not_found(format!("session '{}' not found", session_id)));
    }
    tracing::info!("Session '{}' deleted", session_id);
    Ok(Json(DeleteSessionResponse { deleted: true }))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn require_session(
    state: &ServerState,
    session_id: &str,
) -> Result<Arc<crate::session::AgentSession>, (StatusCode, String)> {
    state
        .runtime
        .registry
        .get(session_id)
        .await
        .map_err(|_| not_found(format!("session '{}' not found", session_id)))
}

fn session_or_default(session_id: Option<String>) -> String {
    session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string())
}

/// `not_configured` is the status for a missing session on this route.
fn agent_error(error: AgentError, not_configured: StatusCode) -> (StatusCode, String) {
    let status = match &error {
        AgentError::Configuration(_) => StatusCode::BAD_REQUEST,
        AgentError::NotConfigured => not_configured,
        AgentError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string())
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{KeywordEmbedder, ScriptedLlm, BEST_CLIENT_SQL};
    use crate::runtime::BackendRuntimeBuilder;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use tower::ServiceExt;

    fn headers_with(authorization: Option<&'static str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn required_auth_checks_bearer_token() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some("token-123".to_string()),
        };
        let cases = [
            (Some("Bearer token-123"), true),
            (Some("Bearer wrong"), false),
            (Some("token-123"), false),
            (None, false),
        ];
        for (authorization, allowed) in cases {
            assert_eq!(
                auth.permits(&headers_with(authorization)),
                allowed,
                "authorization header {:?}",
                authorization
            );
        }
    }

    #[test]
    fn disabled_auth_permits_anonymous_requests() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Disabled,
            token: None,
        };
        assert!(auth.permits(&headers_with(None)));
    }

    #[test]
    fn required_auth_without_token_rejects_everything() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Required,
            token: None,
        };
        assert!(!auth.permits(&headers_with(Some("Bearer anything"))));
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn map_agent_event_includes_event_type_and_payload() {
        let envelope = map_agent_event(AgentEvent::RetryScheduled {
            session_id: "default".to_string(),
            retry_count: 2,
        });
        assert_eq!(envelope.event_type, "retry_scheduled");
        assert_eq!(envelope.payload["retry_count"], 2);
        assert!(envelope.emitted_at <= Utc::now());

        let envelope = map_agent_event(AgentEvent::StageEntered {
            session_id: "default".to_string(),
            stage: crate::agent::Stage::GenerateSql,
        });
        assert_eq!(envelope.payload["stage"], "generate_sql");
    }

    #[test]
    fn agent_errors_map_to_statuses() {
        assert_eq!(
            agent_error(AgentError::NotConfigured, StatusCode::BAD_REQUEST).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            agent_error(AgentError::NotConfigured, StatusCode::NOT_FOUND).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            agent_error(
                AgentError::Execution("boom".to_string()),
                StatusCode::BAD_REQUEST
            )
            .0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    fn test_app(llm: ScriptedLlm) -> Router {
        let (tx, _rx) = flume::unbounded();
        let runtime = BackendRuntimeBuilder::new(BackendConfig::default(), tx)
            .with_llm(Arc::new(llm))
            .with_embedder(Arc::new(KeywordEmbedder))
            .build()
            .unwrap();
        let (ws_events, _) = broadcast::channel(16);
        build_router(Arc::new(ServerState {
            runtime: Arc::new(runtime),
            auth: BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("secret".to_string()),
            },
            ws_events,
        }))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer secret")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn routes_require_bearer_token() {
        let app = test_app(ScriptedLlm::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn query_before_configuration_is_rejected() {
        let app = test_app(ScriptedLlm::new());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/query",
                serde_json::json!({ "question": "How many clients?" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(get_request("/v1/tables")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn configure_then_query_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        crate::demo::seed_sales_database(&conn).unwrap();
        drop(conn);

        let app = test_app(
            ScriptedLlm::new()
                .sql(BEST_CLIENT_SQL)
                .verdict("sim")
                .completion("Beto Costa spent the most in January 2024."),
        );

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/configure_agent",
                serde_json::json!({
                    "db_credentials": {
                        "dialect": "sqlite",
                        "connection_string": format!("sqlite:///{}", path.display())
                    },
                    "tables": crate::demo::demo_tables()
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let configured = body_json(response).await;
        assert_eq!(configured["session_id"], "default");
        assert_eq!(configured["tables"].as_array().unwrap().len(), 3);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/query",
                serde_json::json!({ "question": "Which client spent the most in January 2024?" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let answer = body_json(response).await;
        assert_eq!(answer["outcome"], "answered");
        assert_eq!(answer["retry_count"], 0);
        assert!(answer["answer"].as_str().unwrap().contains("Beto"));

        let response = app
            .clone()
            .oneshot(get_request("/v1/sessions/default/history"))
            .await
            .unwrap();
        let history = body_json(response).await;
        assert_eq!(history.as_array().unwrap().len(), 2);
        assert_eq!(history[0]["role"], "user");

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/sessions/default")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn configure_with_missing_table_is_bad_request() {
        let app = test_app(ScriptedLlm::new());
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/configure_agent",
                serde_json::json!({
                    "db_credentials": {
                        "dialect": "sqlite",
                        "connection_string": "sqlite::memory:"
                    },
                    "tables": [{ "table_name": "vendas", "description": "sales" }]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_question_is_bad_request() {
        let app = test_app(ScriptedLlm::new());
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/query",
                serde_json::json!({ "question": "   " }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn config_route_redacts_api_key() {
        let (tx, _rx) = flume::unbounded();
        let mut config = BackendConfig::default();
        config.llm_api_key = Some("sk-live".to_string());
        let runtime = BackendRuntimeBuilder::new(config, tx)
            .with_llm(Arc::new(ScriptedLlm::new()))
            .with_embedder(Arc::new(KeywordEmbedder))
            .build()
            .unwrap();
        let (ws_events, _) = broadcast::channel(16);
        let app = build_router(Arc::new(ServerState {
            runtime: Arc::new(runtime),
            auth: BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            },
            ws_events,
        }));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/config")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let config = body_json(response).await;
        assert_eq!(config["llm_api_key"], "********");
    }
}
