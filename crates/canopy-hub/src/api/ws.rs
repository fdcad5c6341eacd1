//! WebSocket endpoint feeding the connection hub.
//!
//! Each upgraded socket becomes one hub session. A send task drains the
//! session's outbox into the socket and a receive task hands every text
//! frame to [`ConnectionHub::on_message`](canopy_core::ConnectionHub::on_message).
//! Whichever finishes first ends the session.
//!
//! Both tasks run inside the session's `ws_session` span, so events logged
//! anywhere below them carry the session id and peer address.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::state::SharedState;

/// Remote address of the peer.
///
/// Taken from the connect info when the server was started with it, else
/// from `X-Forwarded-For`, else `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RemoteAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(Self(addr.to_string()));
        }
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Ok(Self(forwarded.unwrap_or_else(|| "unknown".to_string())))
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    RemoteAddr(remote): RemoteAddr,
    State(state): State<SharedState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state))
}

async fn handle_socket(socket: WebSocket, remote: String, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut outbound) = mpsc::unbounded_channel::<String>();

    let id = state.hub().await.accept(remote.clone(), outbox);
    let span = info_span!("ws_session", session_id = %id, remote = %remote);
    info!(parent: &span, "WebSocket session opened");

    let mut send_task = tokio::spawn(
        async move {
            while let Some(text) = outbound.recv().await {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sender.close().await;
        }
        .instrument(span.clone()),
    );

    let hub_state = state.clone();
    let mut recv_task = tokio::spawn(
        async move {
            while let Some(result) = receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        hub_state.hub().await.on_message(id, text.as_str());
                    }
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => hub_state.hub().await.on_message(id, text),
                        Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    // axum answers pings itself
                    Ok(Message::Ping(_) | Message::Pong(_)) => {}
                    Err(e) => {
                        debug!(error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
        }
        .instrument(span.clone()),
    );

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub().await.on_close(id);
    info!(parent: &span, "WebSocket session closed");
}
