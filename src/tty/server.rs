//! HTTP surface: health check and the two WebSocket endpoints.
//!
//! Setup (credential lookup, SSH connect, shell allocation) happens before
//! the upgrade so failures can be reported with a status code:
//!
//! | Failure | Status |
//! |---|---|
//! | unknown host id | 404 |
//! | connect or allocation failure | 502 |
//! | unreadable credentials | 500 |

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt, future};
use poem::http::StatusCode;
use poem::web::websocket::{CloseCode, Message as WsMessage, WebSocket, WebSocketStream};
use poem::web::{Data, Json, Path};
use poem::{Endpoint, EndpointExt, IntoResponse, Route, get, handler, middleware::Tracing};
use tracing::{Instrument, error, info, info_span, warn};

use crate::tty::bridge::{Bridge, BridgeOptions};
use crate::tty::client::{ConnectionHandle, SshConnector};
use crate::tty::config::TerminalConfig;
use crate::tty::credentials::CredentialStore;
use crate::tty::envelope::{CloseReason, Frame, SessionHub, Transport};
use crate::tty::error::{AllocError, ConnectError, CredentialError, TransportError};
use crate::tty::monitor::StatsPusher;
use crate::tty::shell::{TerminalSession, open_shell};
use crate::tty::types::HealthResponse;

/// Shared state for all handlers.
pub struct AppState {
    pub credentials: Arc<dyn CredentialStore>,
    pub connector: SshConnector,
    pub hub: SessionHub,
    pub terminal: TerminalConfig,
    pub bridge: BridgeOptions,
    pub stats_interval: Duration,
}

/// Build the application routes.
pub fn routes(state: Arc<AppState>) -> impl Endpoint {
    Route::new()
        .at("/health", get(health))
        .at("/ws/terminal/:host_id", get(terminal))
        .at("/ws/stats/:host_id", get(stats))
        .data(state)
        .with(Tracing)
}

fn to_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Binary(data) => WsMessage::Binary(data),
        Frame::Ping(data) => WsMessage::Ping(data),
        Frame::Pong(data) => WsMessage::Pong(data),
        Frame::Close(reason) => {
            WsMessage::Close(reason.map(|r| (CloseCode::from(r.code), r.reason)))
        }
    }
}

fn from_ws(message: WsMessage) -> Frame {
    match message {
        WsMessage::Text(text) => Frame::Text(text),
        WsMessage::Binary(data) => Frame::Binary(data),
        WsMessage::Ping(data) => Frame::Ping(data),
        WsMessage::Pong(data) => Frame::Pong(data),
        WsMessage::Close(reason) => {
            Frame::Close(reason.map(|(code, text)| CloseReason::new(u16::from(code), text)))
        }
    }
}

/// Adapt an upgraded poem socket to a session transport.
pub fn websocket_transport(socket: WebSocketStream) -> Transport {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| TransportError(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_ws(frame))));
    let stream = stream.map(|message| {
        message
            .map(from_ws)
            .map_err(|e| TransportError(e.to_string()))
    });
    Transport::new(sink, stream)
}

fn credential_error(e: CredentialError) -> poem::Error {
    let status = match e {
        CredentialError::UnknownHost(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    poem::Error::from_string(e.to_string(), status)
}

fn connect_error(e: ConnectError) -> poem::Error {
    error!("{}", e);
    poem::Error::from_string(e.to_string(), StatusCode::BAD_GATEWAY)
}

fn alloc_error(e: AllocError) -> poem::Error {
    error!("{}", e);
    poem::Error::from_string(e.to_string(), StatusCode::BAD_GATEWAY)
}

#[handler]
fn health(state: Data<&Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        live_connections: state.connector.tracker().live(),
        hosts: state.credentials.len(),
    })
}

/// Resolve `host_id` and open an authenticated connection to it.
async fn connect_host(state: &AppState, host_id: &str) -> poem::Result<ConnectionHandle> {
    let creds = state.credentials.resolve(host_id).map_err(credential_error)?;
    state.connector.connect(&creds).await.map_err(connect_error)
}

/// Connect to `host_id` and start an interactive shell there.
async fn prepare_terminal(state: &AppState, host_id: &str) -> poem::Result<TerminalSession> {
    let connection = connect_host(state, host_id).await?;
    open_shell(Arc::new(connection), &state.terminal)
        .await
        .map_err(alloc_error)
}

#[handler]
async fn terminal(
    Path(host_id): Path<String>,
    state: Data<&Arc<AppState>>,
    ws: WebSocket,
) -> poem::Result<impl IntoResponse> {
    let terminal = prepare_terminal(&state, &host_id).await?;

    let state = state.0.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let session = state.hub.handle_connect(websocket_transport(socket));
        let span = info_span!(
            parent: session.span(),
            "bridge",
            host = %host_id,
            terminal = %terminal.id()
        );

        match Bridge::start(
            terminal,
            session.clone(),
            state.bridge.clone(),
            state.hub.root(),
            span.clone(),
        ) {
            Ok(bridge) => {
                bridge.run().await;
            }
            Err(e) => {
                span.in_scope(|| error!("Failed to start bridge: {}", e));
                session.exit().await;
            }
        }
    }))
}

#[handler]
async fn stats(
    Path(host_id): Path<String>,
    state: Data<&Arc<AppState>>,
    ws: WebSocket,
) -> poem::Result<impl IntoResponse> {
    let connection = connect_host(&state, &host_id).await?;

    let state = state.0.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let session = state.hub.handle_connect(websocket_transport(socket));
        let span = info_span!(parent: session.span(), "stats", host = %host_id);
        let pusher = StatsPusher::new(host_id, state.stats_interval);

        async move {
            match pusher.run(Arc::new(connection), session).await {
                Ok(pushed) => info!("Stats session finished ({} samples)", pushed),
                Err(e) => warn!("Stats session failed: {}", e),
            }
        }
        .instrument(span)
        .await
    }))
}
