use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tablewise_backend::agent::Outcome;
use tablewise_backend::catalog::TableInfo;
use tablewise_backend::memory::ConversationTurn;
use tablewise_backend::session::DbCredentials;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8787";

/// Body of `POST /v1/configure_agent`, also the on-disk format read by
/// `tablewise configure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub db_credentials: DbCredentials,
    pub tables: Vec<TableInfo>,
}

impl ConfigureRequest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let request = toml::from_str::<ConfigureRequest>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        if request.tables.is_empty() {
            bail!("{:?} does not list any [[tables]]", path);
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureResponse {
    pub session_id: String,
    pub message: String,
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    question: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub outcome: Outcome,
    pub sql_query: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TablesResponse {
    pub session_id: String,
    pub dialect: String,
    pub configured_at: DateTime<Utc>,
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEvent {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: Value,
}

impl ApiEvent {
    /// One-line rendering for terminal output.
    pub fn summary(&self) -> String {
        let session = self
            .payload
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or("-");
        let detail = match self.event_type.as_str() {
            "stage_entered" => json_value_to_short_string(&self.payload["stage"]),
            "sql_generated" => json_value_to_short_string(&self.payload["sql"]),
            "sql_failed" | "error" => json_value_to_short_string(&self.payload["error"]),
            "validated" => format!("relevant={}", self.payload["relevant"]),
            "retry_scheduled" => format!("retry #{}", self.payload["retry_count"]),
            "answered" => json_value_to_short_string(&self.payload["outcome"]),
            "memory_compacted" => format!(
                "{} -> {} turns",
                self.payload["before"], self.payload["after"]
            ),
            _ => self.payload.to_string(),
        };
        format!(
            "{} [{}] {}: {}",
            self.emitted_at.format("%H:%M:%S"),
            session,
            self.event_type,
            detail
        )
    }
}

#[derive(Debug, Deserialize)]
struct DeleteSessionResponse {
    deleted: bool,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub async fn health(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, "/v1/health")
            .send()
            .await
            .context("GET /v1/health failed")?;
        decode::<Value>(response, "GET /v1/health").await?;
        Ok(())
    }

    pub async fn configure(&self, body: &ConfigureRequest) -> Result<ConfigureResponse> {
        let response = self
            .request(reqwest::Method::POST, "/v1/configure_agent")
            .json(body)
            .send()
            .await
            .context("POST /v1/configure_agent failed")?;
        decode(response, "POST /v1/configure_agent").await
    }

    pub async fn ask(&self, session_id: Option<&str>, question: &str) -> Result<QueryResponse> {
        let response = self
            .request(reqwest::Method::POST, "/v1/query")
            .json(&QueryRequest {
                session_id,
                question,
            })
            .send()
            .await
            .context("POST /v1/query failed")?;
        decode(response, "POST /v1/query").await
    }

    pub async fn tables(&self, session_id: Option<&str>) -> Result<TablesResponse> {
        let mut builder = self.request(reqwest::Method::GET, "/v1/tables");
        if let Some(session_id) = session_id {
            builder = builder.query(&[("session_id", session_id)]);
        }
        let response = builder.send().await.context("GET /v1/tables failed")?;
        decode(response, "GET /v1/tables").await
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let path = format!("/v1/sessions/{}/history", session_id);
        let response = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        decode(response, &format!("GET {}", path)).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let path = format!("/v1/sessions/{}", session_id);
        let response = self
            .request(reqwest::Method::DELETE, &path)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", path))?;
        let body: DeleteSessionResponse = decode(response, &format!("DELETE {}", path)).await?;
        Ok(body.deleted)
    }

    /// Follow the backend event stream, reconnecting after drops.
    pub async fn stream_events_forever<F>(&self, mut on_event: F)
    where
        F: FnMut(ApiEvent),
    {
        loop {
            match self.stream_events_once(&mut on_event).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {}; reconnecting in 2s", error);
                }
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_events_once<F>(&self, on_event: &mut F) -> Result<()>
    where
        F: FnMut(ApiEvent),
    {
        let ws_endpoint = format!("{}/v1/ws/events", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            match message.context("Websocket read error")? {
                Message::Text(text) => {
                    if let Some(event) = parse_event(&text) {
                        on_event(event);
                    }
                }
                Message::Binary(bytes) => {
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        if let Some(event) = parse_event(&text) {
                            on_event(event);
                        }
                    }
                }
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

/// Error statuses keep the backend's message, which carries the reason.
async fn decode<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if body.trim().is_empty() {
            bail!("{} failed with status {}", what, status);
        }
        bail!("{} failed with status {}: {}", what, status, body.trim());
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("Failed to decode {} response", what))
}

fn parse_event(text: &str) -> Option<ApiEvent> {
    match serde_json::from_str::<ApiEvent>(text) {
        Ok(event) => Some(event),
        Err(error) => {
            tracing::debug!("Skipping unparseable event: {}", error);
            None
        }
    }
}

fn json_value_to_short_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url("  "), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn maps_http_to_ws_url() {
        assert_eq!(
            normalize_ws_url("http://127.0.0.1:8787"),
            "ws://127.0.0.1:8787"
        );
        assert_eq!(normalize_ws_url("https://example.com"), "wss://example.com");
    }

    #[test]
    fn blank_token_is_dropped() {
        assert!(!ApiClient::new(DEFAULT_BACKEND_URL, Some("  ".to_string())).has_token());
        assert!(ApiClient::new(DEFAULT_BACKEND_URL, Some("abc".to_string())).has_token());
    }

    #[test]
    fn loads_configure_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.toml");
        std::fs::write(
            &path,
            r#"
session_id = "sales"

[db_credentials]
dialect = "sqlite"
connection_string = "sqlite:///tmp/sales.db"

[[tables]]
table_name = "clientes"
description = "Clientes cadastrados"

[[tables]]
table_name = "vendas"
description = "Vendas realizadas"
"#,
        )
        .unwrap();

        let request = ConfigureRequest::load(&path).unwrap();
        assert_eq!(request.session_id.as_deref(), Some("sales"));
        assert_eq!(request.db_credentials.dialect, "sqlite");
        assert_eq!(request.tables.len(), 2);
        assert_eq!(request.tables[1].table_name, "vendas");
    }

    #[test]
    fn configure_file_without_tables_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::write(
            &path,
            "tables = []\n[db_credentials]\ndialect = \"sqlite\"\nconnection_string = \"x.db\"\n",
        )
        .unwrap();
        assert!(ConfigureRequest::load(&path).is_err());
    }

    #[test]
    fn query_request_omits_missing_session() {
        let body = serde_json::to_value(QueryRequest {
            session_id: None,
            question: "Quantos clientes?",
        })
        .unwrap();
        assert!(body.get("session_id").is_none());
        assert_eq!(body["question"], "Quantos clientes?");
    }

    #[test]
    fn summarizes_events() {
        let event = parse_event(
            r#"{"event_type":"sql_failed","emitted_at":"2024-01-15T10:00:00Z","payload":{"session_id":"default","error":"no such table: venda"}}"#,
        )
        .unwrap();
        assert_eq!(
            event.summary(),
            "10:00:00 [default] sql_failed: no such table: venda"
        );

        let event = parse_event(
            r#"{"event_type":"retry_scheduled","emitted_at":"2024-01-15T10:00:01Z","payload":{"session_id":"default","retry_count":2}}"#,
        )
        .unwrap();
        assert!(event.summary().ends_with("retry #2"));
        assert!(parse_event("not json").is_none());
    }

    #[test]
    fn query_response_decodes_outcome() {
        let response: QueryResponse = serde_json::from_str(
            r#"{"answer":"Beto Costa","outcome":"answered","sql_query":"SELECT 1","retry_count":0}"#,
        )
        .unwrap();
        assert_eq!(response.outcome, Outcome::Answered);
    }
}
