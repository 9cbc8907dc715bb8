//! Accept loops for the two transports.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::Server;
use crate::transport::{Frame, bridge};

/// Accept raw TCP connections until the listener fails.
pub async fn serve_tcp(server: Arc<Server>, listener: TcpListener) -> Result<()> {
    info!("TCP listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await.context("TCP accept failed")?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, "failed to set TCP_NODELAY: {}", e);
        }
        debug!(%peer, "tcp connection");
        let (read, write) = stream.into_split();
        tokio::spawn(Arc::clone(&server).handle_connection(
            Box::new(read),
            Box::new(write),
            peer.to_string(),
        ));
    }
}

pub fn ws_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(server)
}

/// Serve the WebSocket endpoint at `/ws`.
pub async fn serve_ws(server: Arc<Server>, listener: TcpListener) -> Result<()> {
    info!("WebSocket listening on ws://{}/ws", listener.local_addr()?);
    axum::serve(
        listener,
        ws_router(server).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("WebSocket server error")
}

async fn ws_handler(
    State(server): State<Arc<Server>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(server, socket, peer))
}

async fn handle_socket(server: Arc<Server>, socket: WebSocket, peer: SocketAddr) {
    debug!(%peer, "websocket connection");
    let io = bridge(socket, WsMessage::Binary, |msg| match msg {
        WsMessage::Binary(data) => Frame::Data(data),
        WsMessage::Close(_) => Frame::Close,
        _ => Frame::Skip,
    });
    let (read, write) = tokio::io::split(io);
    server
        .handle_connection(Box::new(read), Box::new(write), peer.to_string())
        .await;
}
