//! Per-connection dialogue lifecycle tracking.
//!
//! Each client connection owns one [`DialogSession`]. The session advances
//! through the upstream lifecycle gates and decides, for every piece of
//! client traffic, whether it can be transmitted now or must wait in the
//! pre-ready buffer. Transition methods return the frames to transmit so
//! that a state change and its emissions happen in one step, on the
//! session's single task.

use std::collections::VecDeque;

use bytes::Bytes;
use serde_json::json;
use tracing::{debug, warn};
use voicerelay_protocol::dialog::{SessionConfig, TextTaskPayload};
use voicerelay_protocol::event;
use voicerelay_protocol::frame::Frame;

/// Upper bound on deferred client traffic per session.
pub const MAX_BUFFERED_ITEMS: usize = 256;

/// Lifecycle phase of one proxied dialogue connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    SessionStarting,
    SessionActive,
    SessionEnding,
    Closed,
}

/// Client traffic parked until its lifecycle gate opens.
#[derive(Debug)]
enum Deferred {
    BinaryAudio(Bytes),
    Base64Audio(Bytes),
    TextInput(String),
}

/// Origin tag for deferred audio, kept for log lines.
#[derive(Debug, Clone, Copy)]
pub enum AudioOrigin {
    Binary,
    Base64,
}

pub struct DialogSession {
    phase: SessionPhase,
    session_id: Option<String>,
    model: String,
    pending_start: Option<SessionConfig>,
    buffer: VecDeque<Deferred>,
    pub message_count: u64,
}

impl DialogSession {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Idle,
            session_id: None,
            model: String::new(),
            pending_start: None,
            buffer: VecDeque::new(),
            message_count: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// True once CONNECTION_STARTED has been observed.
    pub fn connection_established(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Connected
                | SessionPhase::SessionStarting
                | SessionPhase::SessionActive
                | SessionPhase::SessionEnding
        )
    }

    /// True while SESSION_STARTED has been observed and SESSION_FINISHED has not.
    pub fn session_active(&self) -> bool {
        self.phase == SessionPhase::SessionActive
    }

    /// Upstream WebSocket handshake initiated.
    pub fn connecting(&mut self) {
        self.phase = SessionPhase::Connecting;
    }

    /// Upstream socket opened: the connection handshake frame goes out
    /// immediately, before anything else.
    pub fn on_upstream_open(&mut self) -> Frame {
        self.phase = SessionPhase::Connecting;
        Frame::event_json(event::START_CONNECTION, None, json!({}))
    }

    /// Client asked for a session. Emits START_SESSION at once when the
    /// connection gate is open, otherwise holds the config until
    /// CONNECTION_STARTED arrives.
    pub fn request_start(&mut self, config: SessionConfig, session_id: String) -> Option<Frame> {
        self.model = config.dialog.model.clone();
        self.session_id = Some(session_id);
        if self.connection_established() {
            self.phase = SessionPhase::SessionStarting;
            Some(self.start_session_frame(&config))
        } else {
            debug!("holding session start until the upstream connection is established");
            self.pending_start = Some(config);
            None
        }
    }

    /// CONNECTION_STARTED observed. Replays the pending session start, if any.
    pub fn on_connection_started(&mut self) -> Option<Frame> {
        if !self.connection_established() {
            self.phase = SessionPhase::Connected;
        }
        let pending = self.pending_start.take()?;
        self.phase = SessionPhase::SessionStarting;
        Some(self.start_session_frame(&pending))
    }

    /// SESSION_STARTED observed. Adopts a non-empty server-supplied session
    /// id and drains every deferred item, oldest first, into TASK_REQUEST
    /// frames. The drain happens before any newly arriving client traffic
    /// because both run on the session's single task.
    pub fn on_session_started(&mut self, server_session_id: Option<&str>) -> Vec<Frame> {
        if let Some(sid) = server_session_id
            && !sid.is_empty()
        {
            self.session_id = Some(sid.to_string());
        }
        self.phase = SessionPhase::SessionActive;

        let drained = self.buffer.len();
        if drained > 0 {
            debug!(drained, "replaying deferred client traffic");
        }
        let mut frames = Vec::with_capacity(drained);
        while let Some(item) = self.buffer.pop_front() {
            frames.push(match item {
                Deferred::BinaryAudio(pcm) | Deferred::Base64Audio(pcm) => self.audio_frame(pcm),
                Deferred::TextInput(text) => self.text_frame(&text),
            });
        }
        frames
    }

    /// SESSION_FINISHED observed from the upstream.
    pub fn on_session_finished(&mut self) {
        self.phase = match self.phase {
            SessionPhase::SessionEnding => SessionPhase::Closed,
            SessionPhase::SessionActive | SessionPhase::SessionStarting => SessionPhase::Connected,
            other => other,
        };
    }

    /// Routes one audio chunk: emitted immediately while the session is
    /// active, deferred otherwise.
    pub fn route_audio(&mut self, pcm: Bytes, origin: AudioOrigin) -> Option<Frame> {
        if self.session_active() {
            return Some(self.audio_frame(pcm));
        }
        let item = match origin {
            AudioOrigin::Binary => Deferred::BinaryAudio(pcm),
            AudioOrigin::Base64 => Deferred::Base64Audio(pcm),
        };
        self.defer(item);
        None
    }

    /// Routes one text turn under the same gate as audio.
    pub fn route_text(&mut self, text: String) -> Option<Frame> {
        if self.session_active() {
            return Some(self.text_frame(&text));
        }
        self.defer(Deferred::TextInput(text));
        None
    }

    /// Client requested the end of the session.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.session_active() {
            return None;
        }
        self.phase = SessionPhase::SessionEnding;
        Some(Frame::event_json(
            event::FINISH_SESSION,
            self.session_id.clone(),
            json!({}),
        ))
    }

    pub fn closed(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    fn defer(&mut self, item: Deferred) {
        if self.buffer.len() >= MAX_BUFFERED_ITEMS {
            warn!(
                buffered = self.buffer.len(),
                "pre-ready buffer full, dropping client message"
            );
            return;
        }
        self.buffer.push_back(item);
    }

    fn start_session_frame(&self, config: &SessionConfig) -> Frame {
        Frame::event_json(
            event::START_SESSION,
            self.session_id.clone(),
            serde_json::to_value(config).unwrap_or_else(|_| json!({})),
        )
    }

    fn audio_frame(&self, pcm: Bytes) -> Frame {
        Frame::event_audio(event::TASK_REQUEST, self.session_id.clone(), pcm)
    }

    fn text_frame(&self, text: &str) -> Frame {
        Frame::event_json(
            event::TASK_REQUEST,
            self.session_id.clone(),
            serde_json::to_value(TextTaskPayload::new(text)).unwrap_or_else(|_| json!({})),
        )
    }
}

/// The connection-scope goodbye; carries no session id.
pub fn finish_connection_frame() -> Frame {
    Frame::event_json(event::FINISH_CONNECTION, None, json!({}))
}
