//! Event identifiers of the realtime dialogue protocol.
//!
//! Every frame that carries the hasEvent flag identifies itself with one of
//! these 32-bit ids. Client-originated events drive the connection/session
//! lifecycle; server-originated events carry lifecycle acknowledgements,
//! ASR transcripts, chat text and TTS audio.

// ========================================
// CLIENT-ORIGINATED EVENTS
// ========================================
pub const START_CONNECTION: u32 = 1;
pub const FINISH_CONNECTION: u32 = 2;
pub const START_SESSION: u32 = 100;
pub const FINISH_SESSION: u32 = 102;
pub const TASK_REQUEST: u32 = 200;

// ========================================
// SERVER-ORIGINATED EVENTS
// ========================================
pub const CONNECTION_STARTED: u32 = 50;
pub const CONNECTION_FAILED: u32 = 51;
pub const CONNECTION_FINISHED: u32 = 52;
pub const SESSION_STARTED: u32 = 150;
pub const SESSION_FINISHED: u32 = 152;
pub const SESSION_FAILED: u32 = 153;
pub const TTS_RESPONSE: u32 = 352;
pub const ASR_INFO: u32 = 450;
pub const ASR_RESPONSE: u32 = 451;
pub const ASR_ENDED: u32 = 459;
pub const CHAT_RESPONSE: u32 = 550;
pub const CHAT_ENDED: u32 = 559;

/// Human-readable event name for log lines.
pub fn event_name(id: u32) -> &'static str {
    match id {
        START_CONNECTION => "StartConnection",
        FINISH_CONNECTION => "FinishConnection",
        START_SESSION => "StartSession",
        FINISH_SESSION => "FinishSession",
        TASK_REQUEST => "TaskRequest",
        CONNECTION_STARTED => "ConnectionStarted",
        CONNECTION_FAILED => "ConnectionFailed",
        CONNECTION_FINISHED => "ConnectionFinished",
        SESSION_STARTED => "SessionStarted",
        SESSION_FINISHED => "SessionFinished",
        SESSION_FAILED => "SessionFailed",
        TTS_RESPONSE => "TTSResponse",
        ASR_INFO => "ASRInfo",
        ASR_RESPONSE => "ASRResponse",
        ASR_ENDED => "ASREnded",
        CHAT_RESPONSE => "ChatResponse",
        CHAT_ENDED => "ChatEnded",
        _ => "Unknown",
    }
}
