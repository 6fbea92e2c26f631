//! Connection handlers for the Parley server.
//!
//! This module handles the connection lifecycle, frame processing and the
//! small HTTP surface next to the WebSocket endpoint.

use crate::config::{Config, DEV_JWT_SECRET};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_core::session::InvalidTransition;
use parley_core::{
    bearer_token, AuthError, ChatRouter, ConnectionId, EventReceiver, HistoryQuery, Identity,
    IdentityVerifier, InMemoryMessageStore, JwtVerifier, MessageId, RouterError, SessionState,
};
use parley_protocol::{codec, ClientFrame, Connected, ErrorKind, ServerEvent, WireFormat};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Shared server state.
pub struct AppState {
    /// The presence and messaging router.
    pub router: ChatRouter,
    /// Verifies bearer tokens on HTTP routes.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// State backed by the in-memory store and a JWT verifier.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let verifier: Arc<dyn IdentityVerifier> =
            Arc::new(JwtVerifier::new(&config.auth.jwt_secret));
        let router = ChatRouter::new(Arc::new(InMemoryMessageStore::new()), verifier.clone())
            .with_config(config.router_config());

        Self::with_router(config, router, verifier)
    }

    /// State around an existing router.
    #[must_use]
    pub fn with_router(
        config: Config,
        router: ChatRouter,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            router,
            verifier,
            config,
        }
    }
}

/// Build the HTTP/WebSocket routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence/:user_id", get(presence_handler))
        .route("/conversations", get(conversations_handler))
        .route(
            "/conversations/:conversation_id/messages",
            get(history_handler),
        )
        .with_state(state)
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = build_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.auth.jwt_secret == DEV_JWT_SECRET {
        warn!("Using the development JWT secret, set PARLEY_AUTH__JWT_SECRET");
    }

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config))).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stats": state.router.stats(),
    }))
}

async fn presence_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    Json(state.router.presence(&user_id))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    #[serde(alias = "beforeTimestamp")]
    before: Option<DateTime<Utc>>,
}

/// HTTP error with a JSON body.
#[derive(Debug, Error)]
#[error("{status}: {message}")]
struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: ErrorKind::Unauthenticated,
            message: message.into(),
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        let status = match &e {
            RouterError::Forbidden => StatusCode::FORBIDDEN,
            RouterError::InvalidConversation(_) => StatusCode::BAD_REQUEST,
            RouterError::Unauthenticated | RouterError::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let kind = e.kind();
        let message = match e.to_event() {
            ServerEvent::Error(event) => event.message,
            _ => e.to_string(),
        };
        Self {
            status,
            kind,
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "kind": self.kind,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

/// Verify the bearer token of an HTTP request.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

    state
        .verifier
        .verify(token)
        .await
        .map_err(|e| ApiError::unauthorized(e.to_string()))
}

/// Conversation history for the bearer of the token.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = authenticate(&state, &headers).await?;

    let messages = state
        .router
        .history(
            &identity.user_id,
            &conversation_id,
            HistoryQuery::new(params.limit, params.before),
        )
        .await?;

    let wire: Vec<_> = messages.iter().map(|m| m.to_wire()).collect();
    Ok(Json(wire).into_response())
}

/// Conversations of the bearer of the token.
async fn conversations_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let conversations = state.router.conversations(&identity.user_id).await?;
    Ok(Json(conversations).into_response())
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    #[serde(default)]
    pub format: WireFormat,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    if state.router.stats().connections >= state.config.limits.max_connections {
        warn!("Connection limit reached, rejecting upgrade");
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or(params.token);

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, token, params.format))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    token: Option<String>,
    format: WireFormat,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();

    debug!(connection = %connection_id, ?format, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let token = match token {
        Some(token) => Some(token),
        None => tokio::time::timeout(
            state.config.auth.handshake_timeout(),
            await_credential(&mut receiver, &mut read_buffer),
        )
        .await
        .ok()
        .flatten(),
    };

    let mut lifecycle = SessionState::default();
    let (session, rx) = match state
        .router
        .connect(connection_id.clone(), token.as_deref())
        .await
    {
        Ok(connected) => connected,
        Err(e) => {
            info!(connection = %connection_id, error = %e, "Handshake rejected");
            metrics::record_auth_failure(auth_failure_reason(&e));
            transition(&connection_id, &mut lifecycle, SessionState::reject);
            let _ = sender.send(Message::Close(None)).await;
            lifecycle.close();
            return;
        }
    };
    transition(&connection_id, &mut lifecycle, |l| {
        l.authenticate(session.user_id.clone())
    });
    metrics::record_registry(state.router.stats());

    let connected = ServerEvent::Connected(Connected {
        connection_id: connection_id.to_string(),
        user_id: session.user_id.clone(),
        heartbeat_ms: state.config.heartbeat.interval_ms,
    });
    if send_event(&mut sender, &connected, format).await.is_err() {
        error!(connection = %connection_id, "Failed to send connected event");
    } else if process_buffered(&mut read_buffer, &connection_id, &state, &mut sender, format)
        .await
        .is_ok()
    {
        run_session(
            &connection_id,
            &state,
            &mut sender,
            &mut receiver,
            rx,
            &mut read_buffer,
            format,
        )
        .await;
    }

    state.router.disconnect(&connection_id).await;
    transition(&connection_id, &mut lifecycle, SessionState::disconnect);
    metrics::record_registry(state.router.stats());
    let _ = sender.close().await;
    lifecycle.close();

    debug!(connection = %connection_id, "WebSocket disconnected");
}

fn transition<F>(connection_id: &ConnectionId, lifecycle: &mut SessionState, step: F)
where
    F: FnOnce(&mut SessionState) -> Result<(), InvalidTransition>,
{
    match step(lifecycle) {
        Ok(()) => trace!(connection = %connection_id, state = lifecycle.name(), "Session state"),
        Err(e) => warn!(connection = %connection_id, error = %e, "Unexpected session transition"),
    }
}

/// Pump events and frames until the socket closes or goes idle.
async fn run_session(
    connection_id: &ConnectionId,
    state: &Arc<AppState>,
    sender: &mut WsSink,
    receiver: &mut WsStream,
    mut rx: EventReceiver,
    read_buffer: &mut BytesMut,
    format: WireFormat,
) {
    let heartbeat_timeout = state.config.heartbeat.timeout();
    let mut heartbeat = tokio::time::interval(state.config.heartbeat.interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events routed to this connection
            Some(event) = rx.recv() => {
                if send_event(sender, &event, format).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        match codec::decode_json::<ClientFrame>(&text) {
                            Ok(frame) => {
                                if handle_frame(frame, connection_id, state, sender, format).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e, "Undecodable text frame");
                                let event = ServerEvent::error(ErrorKind::InvalidFrame, e.to_string());
                                if send_event(sender, &event, format).await.is_err() {
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        if process_buffered(read_buffer, connection_id, state, sender, format).await.is_err() {
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    info!(connection = %connection_id, "Connection timed out");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for the `connect` frame carrying the credential.
///
/// Anything other than `connect` as the first frame ends the handshake.
async fn await_credential(receiver: &mut WsStream, read_buffer: &mut BytesMut) -> Option<String> {
    while let Some(msg) = receiver.next().await {
        let frame = match msg.ok()? {
            Message::Text(text) => codec::decode_json::<ClientFrame>(&text).ok()?,
            Message::Binary(data) => {
                read_buffer.extend_from_slice(&data);
                match codec::decode_from::<ClientFrame>(read_buffer).ok()? {
                    Some(frame) => frame,
                    None => continue,
                }
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return None,
        };

        return match frame {
            ClientFrame::Connect(request) => Some(request.token),
            other => {
                debug!(event = other.event_name(), "Expected connect frame");
                None
            }
        };
    }
    None
}

fn auth_failure_reason(e: &RouterError) -> &'static str {
    match e {
        RouterError::Auth(AuthError::MissingToken) => "missing_token",
        RouterError::Auth(AuthError::InvalidToken(_)) => "invalid_token",
        RouterError::Auth(AuthError::Timeout) => "timeout",
        _ => "rejected",
    }
}

/// Decode and handle every complete MessagePack frame in the buffer.
async fn process_buffered(
    read_buffer: &mut BytesMut,
    connection_id: &ConnectionId,
    state: &Arc<AppState>,
    sender: &mut WsSink,
    format: WireFormat,
) -> Result<(), axum::Error> {
    loop {
        match codec::decode_from::<ClientFrame>(read_buffer) {
            Ok(Some(frame)) => handle_frame(frame, connection_id, state, sender, format).await?,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "Undecodable binary frame");
                read_buffer.clear();
                let event = ServerEvent::error(ErrorKind::InvalidFrame, e.to_string());
                return send_event(sender, &event, format).await;
            }
        }
    }
}

/// Handle a decoded frame.
///
/// Router failures are reported to this connection only.
async fn handle_frame(
    frame: ClientFrame,
    connection_id: &ConnectionId,
    state: &Arc<AppState>,
    sender: &mut WsSink,
    format: WireFormat,
) -> Result<(), axum::Error> {
    let result = match frame {
        ClientFrame::SendMessage(request) => state
            .router
            .send_message(connection_id, request)
            .await
            .map(|_| ()),

        ClientFrame::MarkRead(request) => state
            .router
            .mark_read(connection_id, &MessageId::from(request.message_id))
            .await
            .map(|_| ()),

        ClientFrame::TypingStart(request) => {
            state
                .router
                .typing_start(connection_id, &request.conversation_id)
                .await;
            Ok(())
        }

        ClientFrame::TypingStop(request) => {
            state
                .router
                .typing_stop(connection_id, &request.conversation_id)
                .await;
            Ok(())
        }

        ClientFrame::Ping => return send_event(sender, &ServerEvent::Pong, format).await,

        ClientFrame::Connect(_) => {
            debug!(connection = %connection_id, "Connect frame (already authenticated)");
            Ok(())
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(connection = %connection_id, kind = ?e.kind(), error = %e, "Request failed");
            metrics::record_error("router");
            send_event(sender, &e.to_event(), format).await
        }
    }
}

/// Send an event in the connection's wire format.
///
/// Events that fail to encode are logged and skipped.
async fn send_event(
    sender: &mut WsSink,
    event: &ServerEvent,
    format: WireFormat,
) -> Result<(), axum::Error> {
    let message = match format {
        WireFormat::Json => codec::encode_json(event).map(Message::Text),
        WireFormat::MessagePack => codec::encode(event).map(|data| Message::Binary(data.to_vec())),
    };

    match message {
        Ok(message) => {
            let len = match &message {
                Message::Text(text) => text.len(),
                Message::Binary(data) => data.len(),
                _ => 0,
            };
            metrics::record_message(len, "outbound");
            sender.send(message).await
        }
        Err(e) => {
            error!(event = event.event_name(), error = %e, "Failed to encode event");
            metrics::record_error("encode");
            Ok(())
        }
    }
}
