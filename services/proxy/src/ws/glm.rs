//! Pass-through bridge to the GLM realtime service.
//!
//! GLM speaks JSON directly over the WebSocket, so no protocol translation
//! happens here: the bridge attaches the Authorization header the browser
//! cannot set, parks client traffic until the upstream handshake completes,
//! and then forwards every frame verbatim in both directions.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, instrument, warn};

use super::doubao::send_msg;
use super::protocol::ServerMessage;
use super::sanitize_close_code;
use crate::config::GlmConfig;

const GLM_REALTIME_URL: &str = "wss://open.bigmodel.cn/api/paas/v4/realtime";

const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Upper bound on client messages parked while the upstream handshake is in
/// flight.
const MAX_PARKED_MESSAGES: usize = 256;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(config): State<Arc<GlmConfig>>) -> Response {
    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, config))
}

#[instrument(name = "glm_session", skip_all)]
async fn handle_socket(socket: WebSocket, config: Arc<GlmConfig>) {
    info!("New client connection. Opening upstream...");
    let (mut client_tx, mut client_rx) = socket.split();

    let request = GLM_REALTIME_URL
        .into_client_request()
        .map_err(anyhow::Error::from)
        .and_then(|mut request| {
            let value = config.api_key.parse()?;
            request.headers_mut().insert("Authorization", value);
            Ok(request)
        });
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            error!(error = ?e, "Failed to build the upstream handshake request");
            let _ = send_msg(
                &mut client_tx,
                ServerMessage::Error {
                    error: format!("服务器连接错误: {e}"),
                    details: None,
                },
            )
            .await;
            let _ = client_tx.send(Message::Close(None)).await;
            return;
        }
    };

    // Park client traffic until the upstream handshake completes.
    let connect = connect_async(request);
    tokio::pin!(connect);
    let mut parked: VecDeque<WsMessage> = VecDeque::new();
    let upstream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    error!(error = %e, "Upstream handshake failed");
                    let _ = send_msg(
                        &mut client_tx,
                        ServerMessage::Error {
                            error: format!("服务器连接错误: {e}"),
                            details: None,
                        },
                    )
                    .await;
                    let _ = client_tx.send(Message::Close(None)).await;
                    return;
                }
            },
            msg = client_rx.next() => match msg {
                Some(Ok(message)) => match client_to_upstream(message) {
                    Routed::Forward(forward) => {
                        if parked.len() >= MAX_PARKED_MESSAGES {
                            warn!(parked = parked.len(), "pre-open buffer full, dropping client message");
                        } else {
                            parked.push_back(forward);
                        }
                    }
                    Routed::Ignore => {}
                    Routed::Closed => {
                        info!("Client closed before the upstream connection opened");
                        return;
                    }
                },
                Some(Err(e)) => {
                    error!(error = %e, "Client socket error while connecting upstream");
                    return;
                }
                None => {
                    info!("Client disconnected while connecting upstream");
                    return;
                }
            },
        }
    };
    info!("Connected to upstream realtime service");
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    // Replay parked traffic in arrival order before anything new.
    if !parked.is_empty() {
        debug!(parked = parked.len(), "replaying messages parked during connect");
    }
    while let Some(message) = parked.pop_front() {
        if let Err(e) = upstream_tx.send(message).await {
            error!(error = %e, "Failed to replay parked message upstream");
            let _ = client_tx.send(Message::Close(None)).await;
            return;
        }
    }

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                Some(Ok(message)) => match client_to_upstream(message) {
                    Routed::Forward(forward) => {
                        if let Err(e) = upstream_tx.send(forward).await {
                            error!(error = %e, "Failed to forward client message upstream");
                            break;
                        }
                    }
                    Routed::Ignore => {}
                    Routed::Closed => {
                        info!("Client closed the connection");
                        let _ = upstream_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                Some(Err(e)) => {
                    error!(error = %e, "Error receiving from client WebSocket");
                    let _ = upstream_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                None => {
                    info!("Client disconnected");
                    let _ = upstream_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            msg = upstream_rx.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if client_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    if client_tx.send(Message::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(close))) => {
                    warn!(?close, "Upstream closed the connection");
                    let code = close.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                    let reason = close.map(|f| f.reason.to_string()).unwrap_or_default();
                    let _ = client_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: sanitize_close_code(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Error reading from upstream WebSocket");
                    let _ = send_msg(
                        &mut client_tx,
                        ServerMessage::Error {
                            error: format!("服务器连接关闭: {e}"),
                            details: None,
                        },
                    )
                    .await;
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
                None => {
                    warn!("Upstream stream ended without a close frame");
                    let _ = client_tx.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
    info!("Session finished");
}

/// How one client frame maps onto the upstream socket.
enum Routed {
    Forward(WsMessage),
    Ignore,
    Closed,
}

fn client_to_upstream(message: Message) -> Routed {
    match message {
        Message::Text(text) => Routed::Forward(WsMessage::Text(text.as_str().into())),
        Message::Binary(data) => Routed::Forward(WsMessage::Binary(data)),
        Message::Ping(_) | Message::Pong(_) => Routed::Ignore,
        Message::Close(_) => Routed::Closed,
    }
}
