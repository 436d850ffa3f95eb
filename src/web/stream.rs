//! Streaming pages and the websocket relay endpoints.

use super::cluster::unconfigured;
use super::handlers::{escape_html, fill, render_page};
use super::{default_namespace, AppState};
use crate::cluster::event_field_selector;
use crate::relay::{RelayError, RelaySink, StreamSession};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Instant;

const STREAM_TEMPLATE: &str = include_str!("templates/stream.html");

/// Write half of a relay websocket.
struct SocketSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl RelaySink for SocketSink {
    async fn send_text(&mut self, text: String) -> Result<(), RelayError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RelayError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

/// Resolves once the client closes the socket or it errors.
async fn client_closed(mut receiver: SplitStream<WebSocket>) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn websocket_url(state: &AppState, path: &str, params: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in params {
        serializer.append_pair(name, value);
    }
    let query = serializer.finish();
    format!("{}{}?{}", state.config.web_socket_host(), path, query)
}

fn stream_page(state: &AppState, heading: &str, ws_url: &str, json_messages: bool) -> String {
    // The URL lands inside a script block, so it is emitted as a JS string.
    let ws_literal = serde_json::to_string(ws_url)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/");
    let content = fill(
        STREAM_TEMPLATE,
        &[
            ("heading", escape_html(heading).as_str()),
            ("ws_url", ws_literal.as_str()),
            ("json_messages", if json_messages { "true" } else { "false" }),
        ],
    );
    render_page(state, heading, &content).0
}

// ============================================================================
// Pages
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PodStreamPageQuery {
    pub pod: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub container: String,
}

pub async fn handle_pod_logs_page(
    State(state): State<AppState>,
    Query(query): Query<PodStreamPageQuery>,
) -> impl IntoResponse {
    let ws_url = websocket_url(
        &state,
        "/ws/logstream",
        &[
            ("name", query.pod.as_str()),
            ("namespace", query.namespace.as_str()),
            ("container", query.container.as_str()),
        ],
    );
    let heading = format!("Logs for {}/{}", query.namespace, query.pod);
    axum::response::Html(stream_page(&state, &heading, &ws_url, false))
}

pub async fn handle_events_page(
    State(state): State<AppState>,
    Path((namespace, filter)): Path<(String, String)>,
) -> impl IntoResponse {
    let ws_url = websocket_url(
        &state,
        "/ws/event-stream",
        &[("namespace", namespace.as_str()), ("filter", filter.as_str())],
    );
    let heading = format!("Events in {} ({})", namespace, filter);
    axum::response::Html(stream_page(&state, &heading, &ws_url, true))
}

// ============================================================================
// Websocket relays
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LogStreamQuery {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub container: Option<String>,
}

pub async fn handle_logstream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<LogStreamQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_pod_log(socket, state, query))
}

async fn relay_pod_log(socket: WebSocket, state: AppState, query: LogStreamQuery) {
    let started = Instant::now();
    let (sender, receiver) = socket.split();
    let mut sink = SocketSink(sender);
    let source = format!("{}/{}", query.namespace, query.name);
    tracing::info!(source = %source, "Pod log relay connecting");

    let container = query.container.as_deref().filter(|c| !c.is_empty());
    let opened = match &state.cluster {
        Some(api) => {
            api.follow_pod_log(&query.name, &query.namespace, container, state.config.tail_lines)
                .await
        }
        None => Err(unconfigured()),
    };

    StreamSession::new(source, &mut sink)
        .run(opened, "Pod not found", client_closed(receiver))
        .await;
    state
        .metrics
        .record_relay("logs", started.elapsed().as_secs_f64());
}

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub filter: String,
}

pub async fn handle_event_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_events(socket, state, query))
}

async fn relay_events(socket: WebSocket, state: AppState, query: EventStreamQuery) {
    let started = Instant::now();
    let (sender, receiver) = socket.split();
    let mut sink = SocketSink(sender);
    let source = format!("{} events ({})", query.namespace, query.filter);
    tracing::info!(source = %source, "Event relay connecting");

    let opened = match &state.cluster {
        Some(api) => {
            api.watch_events(&query.namespace, event_field_selector(&query.filter))
                .await
        }
        None => Err(unconfigured()),
    };

    StreamSession::new(source, &mut sink)
        .run(opened, "Namespace not found", client_closed(receiver))
        .await;
    state
        .metrics
        .record_relay("events", started.elapsed().as_secs_f64());
}
