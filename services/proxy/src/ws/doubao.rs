//! Session bridge between browser clients and the Doubao realtime dialogue
//! service.
//!
//! Browsers cannot attach credential headers to a WebSocket upgrade, so each
//! client connection is paired with a server-side upstream connection that
//! carries them. Everything for one session runs on a single task: the
//! select loop below reads both sockets, advances the lifecycle state
//! machine, and replays buffered traffic at each gate, so no locking is
//! needed anywhere in the session.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, instrument, warn};
use voicerelay_protocol::dialog::SessionConfig;
use voicerelay_protocol::event;
use voicerelay_protocol::frame::{Frame, MessageType, Payload};

use super::protocol::{ClientMessage, ServerMessage};
use super::sanitize_close_code;
use super::session::{AudioOrigin, DialogSession, finish_connection_frame};
use crate::config::DoubaoConfig;

const DOUBAO_DIALOGUE_URL: &str = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";
const RESOURCE_ID: &str = "volc.speech.dialog";
const APP_KEY: &str = "PlgvMymc7f3tQnJ6";

/// Maximum WebSocket frame and message sizes (10 MB).
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Cadence of the session-state log line.
const STATE_LOG_INTERVAL: Duration = Duration::from_secs(2);
/// How long to wait for the first upstream response before warning.
const UPSTREAM_SILENCE_WARNING: Duration = Duration::from_secs(5);
/// Spacing between FINISH_SESSION and FINISH_CONNECTION on shutdown.
const FINISH_SPACING: Duration = Duration::from_millis(100);

type UpstreamSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type ClientSink = SplitSink<WebSocket, Message>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(config): State<Arc<DoubaoConfig>>) -> Response {
    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, config))
}

/// Main handler for an individual client connection.
///
/// Opens the upstream connection with credential headers attached, parking
/// any client traffic that arrives while the handshake is in flight, then
/// hands off to the session loop.
#[instrument(name = "doubao_session", skip_all, fields(connect_id))]
async fn handle_socket(socket: WebSocket, config: Arc<DoubaoConfig>) {
    let connect_id = format!("client_{}_{}", epoch_ms(), connect_suffix());
    tracing::Span::current().record("connect_id", connect_id.as_str());
    info!("New client connection. Opening upstream...");

    let (mut client_tx, mut client_rx) = socket.split();
    let mut session = DialogSession::new();
    session.connecting();

    let request = match upstream_request(&config, &connect_id) {
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

    // Race the upstream handshake against early client traffic so that
    // audio sent immediately after the page connects is not lost.
    let connect = connect_async(request);
    tokio::pin!(connect);
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
                Some(Ok(message)) => {
                    if !park_early_message(&mut session, &config, message) {
                        info!("Client closed before the upstream connection opened");
                        return;
                    }
                }
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
    info!("Connected to upstream dialogue service");

    if let Err(e) = run_bridge(&config, client_tx, client_rx, upstream, session).await {
        error!(error = ?e, "Session bridge terminated with error");
    }
    info!("Session finished");
}

/// Builds the upstream handshake request with the credential headers the
/// browser cannot set itself.
fn upstream_request(config: &DoubaoConfig, connect_id: &str) -> Result<Request> {
    let mut request = DOUBAO_DIALOGUE_URL.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("X-Api-App-ID", config.app_id.parse().context("app id")?);
    headers.insert(
        "X-Api-Access-Key",
        config.access_key.parse().context("access key")?,
    );
    headers.insert("X-Api-Resource-Id", RESOURCE_ID.parse()?);
    headers.insert("X-Api-App-Key", APP_KEY.parse()?);
    headers.insert("X-Api-Connect-Id", connect_id.parse().context("connect id")?);
    Ok(request)
}

/// Absorbs client traffic that arrives before the upstream socket opens.
/// Returns false when the client is done and the session should be dropped.
fn park_early_message(
    session: &mut DialogSession,
    config: &DoubaoConfig,
    message: Message,
) -> bool {
    match message {
        Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::StartSession {
                session_id,
                system_message,
                model,
            }) => {
                let sid = session_id.unwrap_or_else(|| format!("session_{}", epoch_ms()));
                // Cannot be emitted yet; request_start holds it for the gate.
                let _ = session.request_start(build_session_config(config, system_message, model), sid);
            }
            Ok(ClientMessage::AudioData { data, .. }) => match decode_base64_audio(&data) {
                Some(pcm) => {
                    let _ = session.route_audio(pcm, AudioOrigin::Base64);
                }
                None => warn!("Dropping undecodable base64 audio"),
            },
            Ok(ClientMessage::TextInput { text }) => {
                let _ = session.route_text(text);
            }
            Ok(ClientMessage::FinishSession) | Ok(ClientMessage::FinishConnection) => {
                debug!("Ignoring finish request before the upstream connection opened");
            }
            Ok(ClientMessage::Unknown) | Err(_) => {
                warn!("Dropping unrecognized client message");
            }
        },
        Message::Binary(data) => {
            let _ = session.route_audio(data, AudioOrigin::Binary);
        }
        Message::Close(_) => return false,
        Message::Ping(_) | Message::Pong(_) => {}
    }
    true
}

/// The main event loop for an active session.
async fn run_bridge(
    config: &DoubaoConfig,
    mut client_tx: ClientSink,
    mut client_rx: SplitStream<WebSocket>,
    upstream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut session: DialogSession,
) -> Result<()> {
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    // The upstream expects the connection handshake before anything else.
    let open_frame = session.on_upstream_open();
    send_frame(&mut upstream_tx, &open_frame).await?;

    let mut state_log = tokio::time::interval(STATE_LOG_INTERVAL);
    state_log.tick().await;
    let silence_warning = tokio::time::sleep(UPSTREAM_SILENCE_WARNING);
    tokio::pin!(silence_warning);
    let mut upstream_responded = false;
    let mut silence_warned = false;

    loop {
        tokio::select! {
            // Traffic from the browser.
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection");
                    break;
                }
                Some(Ok(message)) => {
                    session.message_count += 1;
                    handle_client_message(&mut session, config, message, &mut upstream_tx).await?;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Error receiving from client WebSocket");
                    break;
                }
            },
            // Traffic from the upstream dialogue service.
            msg = upstream_rx.next() => match msg {
                Some(Ok(WsMessage::Binary(data))) => {
                    upstream_responded = true;
                    match Frame::decode(&data) {
                        Some(frame) => {
                            let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);
                            for frame in &to_upstream {
                                send_frame(&mut upstream_tx, frame).await?;
                            }
                            for out in to_client {
                                match out {
                                    ClientOut::Json(msg) => send_msg(&mut client_tx, msg).await?,
                                    ClientOut::Audio(pcm) => client_tx.send(Message::Binary(pcm)).await?,
                                }
                            }
                        }
                        None => warn!(len = data.len(), "Dropping undecodable upstream frame"),
                    }
                }
                Some(Ok(WsMessage::Text(text))) => {
                    upstream_responded = true;
                    debug!(%text, "Ignoring upstream text frame");
                }
                Some(Ok(WsMessage::Close(close))) => {
                    warn!(?close, "Upstream closed the connection");
                    close_client_after_upstream(&mut client_tx, close).await;
                    session.closed();
                    return Ok(());
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
                    close_client(&mut client_tx, 1000).await;
                    session.closed();
                    return Ok(());
                }
                None => {
                    warn!("Upstream stream ended without a close frame");
                    close_client_after_upstream(&mut client_tx, None).await;
                    session.closed();
                    return Ok(());
                }
            },
            _ = state_log.tick() => {
                debug!(
                    phase = ?session.phase(),
                    model = session.model(),
                    messages = session.message_count,
                    buffered = session.buffered_len(),
                    "session state"
                );
            }
            _ = &mut silence_warning, if !upstream_responded && !silence_warned => {
                warn!("No upstream response within 5s of connection open");
                silence_warned = true;
            }
        }
    }

    // Graceful teardown toward the upstream after the client left.
    if let Some(frame) = session.finish() {
        if send_frame(&mut upstream_tx, &frame).await.is_ok() {
            tokio::time::sleep(FINISH_SPACING).await;
        }
    }
    let _ = send_frame(&mut upstream_tx, &finish_connection_frame()).await;
    let _ = upstream_tx.send(WsMessage::Close(None)).await;
    session.closed();
    Ok(())
}

/// Translates one client message into upstream traffic, respecting the
/// lifecycle gates.
async fn handle_client_message(
    session: &mut DialogSession,
    config: &DoubaoConfig,
    message: Message,
    upstream_tx: &mut UpstreamSink,
) -> Result<()> {
    match message {
        Message::Text(text) => {
            let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) else {
                warn!("Dropping malformed client JSON");
                return Ok(());
            };
            match msg {
                ClientMessage::StartSession {
                    session_id,
                    system_message,
                    model,
                } => {
                    let sid = session_id.unwrap_or_else(|| format!("session_{}", epoch_ms()));
                    let session_config = build_session_config(config, system_message, model);
                    info!(session_id = %sid, model = %session_config.dialog.model, "Client requested session start");
                    if let Some(frame) = session.request_start(session_config, sid) {
                        send_frame(upstream_tx, &frame).await?;
                    }
                }
                ClientMessage::AudioData { data, is_last } => match decode_base64_audio(&data) {
                    Some(pcm) => {
                        if is_last == Some(true) {
                            debug!("Client marked the audio stream complete");
                        }
                        if let Some(frame) = session.route_audio(pcm, AudioOrigin::Base64) {
                            send_frame(upstream_tx, &frame).await?;
                        }
                    }
                    None => warn!("Dropping undecodable base64 audio"),
                },
                ClientMessage::TextInput { text } => {
                    if let Some(frame) = session.route_text(text) {
                        send_frame(upstream_tx, &frame).await?;
                    }
                }
                ClientMessage::FinishSession => {
                    if let Some(frame) = session.finish() {
                        send_frame(upstream_tx, &frame).await?;
                    }
                }
                ClientMessage::FinishConnection => {
                    send_frame(upstream_tx, &finish_connection_frame()).await?;
                }
                ClientMessage::Unknown => warn!("Dropping client message of unknown type"),
            }
        }
        Message::Binary(data) => {
            if let Some(frame) = session.route_audio(data, AudioOrigin::Binary) {
                send_frame(upstream_tx, &frame).await?;
            }
        }
        Message::Ping(_) | Message::Pong(_) => {}
        // Close frames are intercepted by the session loop.
        Message::Close(_) => {}
    }
    Ok(())
}

/// What a decoded upstream frame produces for the client side.
#[derive(Debug)]
enum ClientOut {
    Json(ServerMessage),
    Audio(Bytes),
}

/// Translates one decoded upstream frame: advances the state machine and
/// returns the frames to replay upstream plus the client-facing output, in
/// order. Pure apart from logging, which keeps the dispatch testable.
fn handle_upstream_frame(session: &mut DialogSession, frame: &Frame) -> (Vec<Frame>, Vec<ClientOut>) {
    let mut to_upstream = Vec::new();
    let mut to_client = Vec::new();

    // Raw payloads are the primary TTS channel: forward them untouched.
    let mut audio_forwarded = false;
    if let Payload::Binary(pcm) = &frame.payload {
        to_client.push(ClientOut::Audio(pcm.clone()));
        audio_forwarded = true;
        if frame.message_type == MessageType::ServerAck {
            return (to_upstream, to_client);
        }
    }

    if frame.message_type == MessageType::Error {
        let message = upstream_error_text(frame);
        error!(code = ?frame.error_code, %message, "Upstream error frame");
        to_client.push(ClientOut::Json(ServerMessage::Error {
            error: format!("服务器错误: {message}"),
            details: payload_details(&frame.payload),
        }));
        // The upstream decides whether this is fatal; keep the connection.
        return (to_upstream, to_client);
    }

    let Some(event_id) = frame.event else {
        if !audio_forwarded {
            warn!(message_type = ?frame.message_type, "Dropping upstream frame without an event id");
        }
        return (to_upstream, to_client);
    };

    match event_id {
        event::CONNECTION_STARTED => {
            info!("Upstream connection established");
            if let Some(start) = session.on_connection_started() {
                to_upstream.push(start);
            }
        }
        event::CONNECTION_FAILED | event::SESSION_FAILED => {
            error!(event = event::event_name(event_id), "Upstream reported a failure");
            to_client.push(ClientOut::Json(ServerMessage::Error {
                error: upstream_error_text(frame),
                details: payload_details(&frame.payload),
            }));
        }
        event::SESSION_STARTED => {
            to_upstream.extend(session.on_session_started(frame.session_id.as_deref()));
            let session_id = session.session_id().unwrap_or_default().to_string();
            info!(%session_id, "Dialogue session started");
            to_client.push(ClientOut::Json(ServerMessage::SessionStarted {
                session_id,
                dialog_id: json_field(frame, "dialog_id"),
            }));
        }
        event::ASR_INFO => {
            to_client.push(ClientOut::Json(ServerMessage::SpeechStarted {
                question_id: json_field(frame, "question_id"),
            }));
        }
        event::ASR_RESPONSE => {
            let results = json_field(frame, "results")
                .or_else(|| frame.payload.as_json().cloned())
                .unwrap_or(Value::Null);
            to_client.push(ClientOut::Json(ServerMessage::AsrResponse { results }));
        }
        event::ASR_ENDED => debug!("Upstream finished recognizing the user turn"),
        event::TTS_RESPONSE => {
            // Raw payloads were already forwarded above; a TTS event without
            // one carries nothing for the client.
            if !audio_forwarded {
                debug!("TTS response without a raw payload");
            }
        }
        event::CHAT_RESPONSE => {
            let content = json_field(frame, "content")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            to_client.push(ClientOut::Json(ServerMessage::ChatResponse {
                content,
                question_id: json_field(frame, "question_id"),
                reply_id: json_field(frame, "reply_id"),
            }));
        }
        event::CHAT_ENDED => {
            to_client.push(ClientOut::Json(ServerMessage::ChatEnded {
                question_id: json_field(frame, "question_id"),
                reply_id: json_field(frame, "reply_id"),
            }));
        }
        event::SESSION_FINISHED => {
            info!("Upstream finished the session");
            session.on_session_finished();
        }
        event::CONNECTION_FINISHED => info!("Upstream finished the connection"),
        other => warn!(event = other, "Ignoring unrecognized upstream event"),
    }

    (to_upstream, to_client)
}

/// Session parameters for START_SESSION, from the proxy defaults plus the
/// client's overrides.
fn build_session_config(
    config: &DoubaoConfig,
    system_message: Option<String>,
    model: Option<String>,
) -> SessionConfig {
    let mut session_config = SessionConfig::default();
    session_config.tts.speaker = config.speaker.clone();
    if let Some(system_role) = system_message {
        session_config.dialog.system_role = system_role;
    }
    if let Some(model) = model {
        session_config.dialog.model = model;
    }
    session_config
}

fn decode_base64_audio(data: &str) -> Option<Bytes> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()
        .map(Bytes::from)
}

/// Best human-readable message out of an upstream error or failure frame.
fn upstream_error_text(frame: &Frame) -> String {
    if let Some(payload) = frame.payload.as_json() {
        for key in ["error", "message", "code"] {
            if let Some(value) = payload.get(key) {
                return match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
            }
        }
    }
    if let Payload::Text(text) = &frame.payload {
        return text.clone();
    }
    match frame.error_code {
        Some(code) => format!("错误码 {code}"),
        None => "未知错误".to_string(),
    }
}

fn payload_details(payload: &Payload) -> Option<Value> {
    match payload {
        Payload::Json(value) => Some(value.clone()),
        Payload::Text(text) => Some(Value::String(text.clone())),
        Payload::Binary(_) => None,
    }
}

fn json_field(frame: &Frame, key: &str) -> Option<Value> {
    frame.payload.as_json().and_then(|p| p.get(key)).cloned()
}

/// Sends the error context and then closes the client, substituting the
/// abnormal-closure code which must never be emitted by the proxy.
async fn close_client_after_upstream(
    client_tx: &mut ClientSink,
    close: Option<UpstreamCloseFrame>,
) {
    let (code, reason) = match &close {
        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
        None => (1000, String::new()),
    };
    let detail = if reason.is_empty() {
        format!("代码 {code}")
    } else {
        format!("{code} {reason}")
    };
    let _ = send_msg(
        client_tx,
        ServerMessage::Error {
            error: format!("服务器连接关闭: {detail}"),
            details: None,
        },
    )
    .await;
    close_client(client_tx, sanitize_close_code(code)).await;
}

async fn close_client(client_tx: &mut ClientSink, code: u16) {
    let _ = client_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "Server connection closed".into(),
        })))
        .await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(socket_tx: &mut ClientSink, msg: ServerMessage) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

async fn send_frame(upstream_tx: &mut UpstreamSink, frame: &Frame) -> Result<()> {
    if let Some(event_id) = frame.event {
        debug!(event = event::event_name(event_id), "Forwarding frame upstream");
    }
    let encoded = frame.encode(true)?;
    upstream_tx.send(WsMessage::Binary(encoded.into())).await?;
    Ok(())
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn connect_suffix() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing::Level;
    use voicerelay_protocol::frame::FLAG_HAS_EVENT;

    fn test_config() -> DoubaoConfig {
        DoubaoConfig {
            bind_address: "127.0.0.1:3001".parse().unwrap(),
            app_id: "app".to_string(),
            access_key: "access".to_string(),
            secret_key: "secret".to_string(),
            speaker: "zh_female_test".to_string(),
            log_level: Level::INFO,
        }
    }

    fn server_event(event_id: u32, session_id: &str, payload: Payload) -> Frame {
        Frame {
            message_type: MessageType::FullServerResponse,
            flags: FLAG_HAS_EVENT,
            sequence: None,
            event: Some(event_id),
            session_id: Some(session_id.to_string()),
            error_code: None,
            payload,
            raw_compressed: false,
        }
    }

    fn connected_session(config: &DoubaoConfig) -> DialogSession {
        let mut session = DialogSession::new();
        session.connecting();
        session.on_upstream_open();
        let _ = session.request_start(
            build_session_config(config, Some("你是助手".to_string()), None),
            "session_1".to_string(),
        );
        session
    }

    #[test]
    fn server_ack_audio_is_forwarded_once_and_stops_dispatch() {
        let config = test_config();
        let mut session = connected_session(&config);
        let pcm = Bytes::from(vec![1u8; 4800]);
        let frame = Frame {
            message_type: MessageType::ServerAck,
            flags: FLAG_HAS_EVENT,
            sequence: None,
            event: Some(event::TTS_RESPONSE),
            session_id: Some("s".to_string()),
            error_code: None,
            payload: Payload::Binary(pcm.clone()),
            raw_compressed: false,
        };

        let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);
        assert!(to_upstream.is_empty());
        assert_eq!(to_client.len(), 1);
        assert!(matches!(&to_client[0], ClientOut::Audio(audio) if *audio == pcm));
    }

    #[test]
    fn tts_event_with_raw_payload_is_not_double_forwarded() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = server_event(
            event::TTS_RESPONSE,
            "s",
            Payload::Binary(Bytes::from_static(b"pcm")),
        );

        let (_, to_client) = handle_upstream_frame(&mut session, &frame);
        assert_eq!(to_client.len(), 1);
        assert!(matches!(to_client[0], ClientOut::Audio(_)));
    }

    #[test]
    fn error_frame_is_translated_and_connection_is_kept() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = Frame {
            message_type: MessageType::Error,
            flags: 0,
            sequence: None,
            event: None,
            session_id: None,
            error_code: Some(40001),
            payload: Payload::Json(json!({"error": "invalid auth"})),
            raw_compressed: false,
        };

        let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);
        assert!(to_upstream.is_empty());
        assert_eq!(
            to_client.len(),
            1,
            "an error frame produces exactly one client message"
        );
        match &to_client[0] {
            ClientOut::Json(ServerMessage::Error { error, details }) => {
                assert_eq!(error, "服务器错误: invalid auth");
                assert_eq!(details, &Some(json!({"error": "invalid auth"})));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn connection_started_replays_the_pending_session_start() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = server_event(event::CONNECTION_STARTED, "", Payload::Json(json!({})));

        let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);
        assert!(to_client.is_empty());
        assert_eq!(to_upstream.len(), 1);
        assert_eq!(to_upstream[0].event, Some(event::START_SESSION));
        let payload = to_upstream[0].payload.as_json().unwrap();
        assert_eq!(payload["dialog"]["system_role"], json!("你是助手"));
        assert_eq!(payload["tts"]["speaker"], json!("zh_female_test"));
    }

    #[test]
    fn session_started_adopts_id_and_drains_audio_in_order() {
        let config = test_config();
        let mut session = connected_session(&config);
        handle_upstream_frame(
            &mut session,
            &server_event(event::CONNECTION_STARTED, "", Payload::Json(json!({}))),
        );
        for chunk in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            assert!(
                session
                    .route_audio(Bytes::from_static(chunk), AudioOrigin::Binary)
                    .is_none()
            );
        }

        let frame = server_event(
            event::SESSION_STARTED,
            "srv-abc",
            Payload::Json(json!({"dialog_id": "d-7"})),
        );
        let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);

        assert_eq!(to_upstream.len(), 3);
        for (frame, expected) in to_upstream.iter().zip([&b"one"[..], &b"two"[..], &b"three"[..]]) {
            assert_eq!(frame.event, Some(event::TASK_REQUEST));
            assert_eq!(frame.session_id.as_deref(), Some("srv-abc"));
            assert_eq!(frame.payload, Payload::Binary(Bytes::from_static(expected)));
        }
        assert_eq!(to_client.len(), 1);
        match &to_client[0] {
            ClientOut::Json(msg) => assert_eq!(
                msg,
                &ServerMessage::SessionStarted {
                    session_id: "srv-abc".to_string(),
                    dialog_id: Some(json!("d-7")),
                }
            ),
            other => panic!("unexpected output: {:?}", other),
        }

        // Audio arriving after the drain goes straight out.
        assert!(
            session
                .route_audio(Bytes::from_static(b"four"), AudioOrigin::Binary)
                .is_some()
        );
    }

    #[test]
    fn asr_events_are_translated() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = server_event(
            event::ASR_INFO,
            "s",
            Payload::Json(json!({"question_id": "q-3"})),
        );
        let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);
        assert!(to_upstream.is_empty());
        assert_eq!(to_client.len(), 1);
        match &to_client[0] {
            ClientOut::Json(msg) => assert_eq!(
                msg,
                &ServerMessage::SpeechStarted {
                    question_id: Some(json!("q-3")),
                }
            ),
            other => panic!("unexpected output: {:?}", other),
        }

        let frame = server_event(
            event::ASR_RESPONSE,
            "s",
            Payload::Json(json!({"results": [{"text": "你好", "is_interim": false}]})),
        );
        let (_, to_client) = handle_upstream_frame(&mut session, &frame);
        match &to_client[0] {
            ClientOut::Json(ServerMessage::AsrResponse { results }) => {
                assert_eq!(results, &json!([{"text": "你好", "is_interim": false}]));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn asr_response_without_a_results_key_forwards_the_payload() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = server_event(
            event::ASR_RESPONSE,
            "s",
            Payload::Json(json!({"text": "你好"})),
        );
        let (_, to_client) = handle_upstream_frame(&mut session, &frame);
        match &to_client[0] {
            ClientOut::Json(ServerMessage::AsrResponse { results }) => {
                assert_eq!(results, &json!({"text": "你好"}));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn asr_ended_is_log_only() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = server_event(event::ASR_ENDED, "s", Payload::Json(json!({})));
        let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);
        assert!(to_upstream.is_empty());
        assert!(to_client.is_empty());
    }

    #[test]
    fn chat_events_are_translated() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = server_event(
            event::CHAT_RESPONSE,
            "s",
            Payload::Json(json!({"content": "你好", "question_id": 1, "reply_id": 2})),
        );
        let (_, to_client) = handle_upstream_frame(&mut session, &frame);
        match &to_client[0] {
            ClientOut::Json(ServerMessage::ChatResponse {
                content,
                question_id,
                reply_id,
            }) => {
                assert_eq!(content, "你好");
                assert_eq!(question_id, &Some(json!(1)));
                assert_eq!(reply_id, &Some(json!(2)));
            }
            other => panic!("unexpected output: {:?}", other),
        }

        let frame = server_event(
            event::CHAT_ENDED,
            "s",
            Payload::Json(json!({"question_id": 1, "reply_id": 2})),
        );
        let (_, to_client) = handle_upstream_frame(&mut session, &frame);
        assert!(matches!(
            &to_client[0],
            ClientOut::Json(ServerMessage::ChatEnded { .. })
        ));
    }

    #[test]
    fn frames_without_an_event_are_dropped() {
        let config = test_config();
        let mut session = connected_session(&config);
        let frame = Frame {
            message_type: MessageType::FullServerResponse,
            flags: 0,
            sequence: None,
            event: None,
            session_id: Some(String::new()),
            error_code: None,
            payload: Payload::Json(json!({"stray": true})),
            raw_compressed: false,
        };
        let (to_upstream, to_client) = handle_upstream_frame(&mut session, &frame);
        assert!(to_upstream.is_empty());
        assert!(to_client.is_empty());
    }

    #[test]
    fn build_session_config_applies_overrides() {
        let config = test_config();
        let session_config = build_session_config(
            &config,
            Some("你是老师".to_string()),
            Some("O2.5".to_string()),
        );
        assert_eq!(session_config.tts.speaker, "zh_female_test");
        assert_eq!(session_config.dialog.system_role, "你是老师");
        assert_eq!(session_config.dialog.model, "O2.5");

        let defaults = build_session_config(&config, None, None);
        assert_eq!(defaults.dialog.model, voicerelay_protocol::dialog::DEFAULT_MODEL);
    }
}
