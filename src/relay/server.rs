use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{Message, WebSocket},
        Json, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use anyhow::Context;
use futures_util::{future, stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal, sync::mpsc::Receiver};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, error, info, warn};

use crate::relay::{
    appstate::{Registry, RoomSummary},
    client::{Client, SessionOutcome},
    connection::{Connection, ConnectionId},
    Frame, MessageKind,
};

/// Per-session knobs taken from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Frames that may be queued for one client before it counts as too slow.
    pub outbound_buffer: usize,
    /// Close a session whose client has been silent this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            outbound_buffer: 64,
            idle_timeout: None,
        }
    }
}

/// State shared by every request handler.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub settings: SessionSettings,
}

impl ServerState {
    pub fn new(registry: Arc<Registry>, settings: SessionSettings) -> ServerState {
        ServerState { registry, settings }
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinParams {
    room: Option<String>,
}

/// Builds the relay's routes.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/status", get(status))
        .route("/rooms", get(list_rooms))
        .with_state(state)
        // Set up the tracing layer to log incoming requests.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
}

/// Start the relay server on `listen_addr:port` and run it until Ctrl+C or
/// SIGTERM.
pub async fn start_ws(port: u16, listen_addr: &str, state: ServerState) -> anyhow::Result<()> {
    debug!("Server configured to accept connections on host {listen_addr}...");
    debug!("Server configured to listen connections on port {port}...");

    let addr = format!("{listen_addr}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to listen on: {addr}"))?;

    serve(listener, state, shutdown_signal()).await
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Listening on: {}", listener.local_addr()?);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("relay server failed")
}

/// Handler for the WebSocket route.
///
/// A request without a room name is refused before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<JoinParams>,
    State(state): State<ServerState>,
) -> Response {
    debug!("Got Request on Websocket route from {addr}");

    let Some(room) = params.room.filter(|room| !room.is_empty()) else {
        warn!("{addr} did not specify a room");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "no room specified" })),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, room))
}

/// Runs one client session on an upgraded socket.
///
/// The socket is split: a writer task drains the connection's queue into the
/// sink, while this task reads from the stream and drives the session. The
/// writer closes the socket once the session and the room have both let go
/// of the connection.
async fn handle_socket(socket: WebSocket, state: ServerState, room: String) {
    let id = ConnectionId::generate();
    let (sink, stream) = socket.split();

    let (connection, outbound) = Connection::channel(id.clone(), state.settings.outbound_buffer);
    let writer = tokio::spawn(write_frames(sink, outbound));

    let incoming = stream
        .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| future::ready(into_frame(message)));

    let client = Client::new(state.registry.clone(), connection, room)
        .with_idle_timeout(state.settings.idle_timeout);

    match client.run(Box::pin(incoming)).await {
        SessionOutcome::Rejected(error) => debug!(%id, "session rejected: {error}"),
        SessionOutcome::Closed { relayed } => debug!(%id, relayed, "session closed"),
    }

    if let Err(error) = writer.await {
        error!(%id, "writer task failed: {error}");
    }
}

async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut outbound: Receiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(error) = sink.send(into_message(frame)).await {
            debug!("Failed to send message to the client: {error}");
            return;
        }
    }

    if let Err(error) = sink.close().await {
        debug!("Failed to close the socket: {error}");
    }
}

/// Maps a websocket message to a relayable frame. Control frames are skipped.
fn into_frame(message: Result<Message, axum::Error>) -> Option<Result<Frame, axum::Error>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::text(text))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::binary(data))),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Close(_)) => None,
        Err(error) => Some(Err(error)),
    }
}

fn into_message(frame: Frame) -> Message {
    match frame.kind {
        MessageKind::Text => match String::from_utf8(frame.payload) {
            Ok(text) => Message::Text(text),
            Err(error) => Message::Text(String::from_utf8_lossy(error.as_bytes()).into_owned()),
        },
        MessageKind::Binary => Message::Binary(frame.payload),
    }
}

pub async fn status(State(state): State<ServerState>) -> (StatusCode, Json<Value>) {
    let version = env!("CARGO_PKG_VERSION");
    let rooms = state.registry.room_count().await;

    let response = json!({
        "data": {
            "version": version,
            "rooms": rooms,
        },
        "message": "Service is running..."
    });
    (StatusCode::OK, Json(response))
}

pub async fn list_rooms(State(state): State<ServerState>) -> Json<Vec<RoomSummary>> {
    Json(state.registry.rooms().await)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {error}");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                error!("failed to install signal handler: {error}");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down");
}
