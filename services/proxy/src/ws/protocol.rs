//! Defines the WebSocket message protocol between the browser client and the proxy.
//!
//! Text frames carry these JSON messages; binary frames carry raw
//! signed-16-bit little-endian PCM audio in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the client (browser) to the proxy.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Requests a dialogue session. May arrive before the upstream
    /// connection is established, in which case it is held until the
    /// connection gate opens.
    #[serde(rename_all = "camelCase")]
    StartSession {
        /// Client-chosen session identifier; generated when absent.
        session_id: Option<String>,
        /// System role prompt for the dialogue agent.
        system_message: Option<String>,
        model: Option<String>,
    },
    /// Legacy audio path: a base64-encoded PCM chunk inside a text frame.
    #[serde(rename_all = "camelCase")]
    AudioData {
        data: String,
        is_last: Option<bool>,
    },
    /// A typed text turn instead of spoken audio.
    TextInput { text: String },
    /// Ends the active dialogue session, keeping the connection.
    FinishSession,
    /// Ends the upstream connection.
    FinishConnection,
    /// Anything unrecognized; dropped with a warning.
    #[serde(other)]
    Unknown,
}

/// Messages sent from the proxy to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The upstream acknowledged the session; audio may now flow.
    SessionStarted {
        session_id: String,
        dialog_id: Option<Value>,
    },
    /// The upstream detected the start of user speech.
    SpeechStarted { question_id: Option<Value> },
    /// An ASR transcript update.
    AsrResponse { results: Value },
    /// A chunk of the agent's chat text.
    ChatResponse {
        content: String,
        question_id: Option<Value>,
        reply_id: Option<Value>,
    },
    /// The agent finished its chat turn.
    ChatEnded {
        question_id: Option<Value>,
        reply_id: Option<Value>,
    },
    /// Reports an upstream or proxy error to the client.
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_start_session_with_camel_case_keys() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"start_session","sessionId":"s-1","systemMessage":"你是助手","model":"O2.0"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::StartSession {
                session_id,
                system_message,
                model,
            } => {
                assert_eq!(session_id.as_deref(), Some("s-1"));
                assert_eq!(system_message.as_deref(), Some("你是助手"));
                assert_eq!(model.as_deref(), Some("O2.0"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_start_session_with_all_fields_absent() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"start_session"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::StartSession {
                session_id: None,
                system_message: None,
                model: None,
            }
        ));
    }

    #[test]
    fn parses_audio_data_and_text_input() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"audio_data","data":"AAAA","isLast":true}"#).unwrap();
        match msg {
            ClientMessage::AudioData { data, is_last } => {
                assert_eq!(data, "AAAA");
                assert_eq!(is_last, Some(true));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"text_input","text":"hello"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::TextInput { text } if text == "hello"));
    }

    #[test]
    fn unknown_types_parse_to_unknown() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"telemetry"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
    }

    #[test]
    fn session_started_serializes_with_snake_case_tag() {
        let value = serde_json::to_value(ServerMessage::SessionStarted {
            session_id: "srv-abc".to_string(),
            dialog_id: Some(json!("d-1")),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "session_started", "session_id": "srv-abc", "dialog_id": "d-1"})
        );
    }

    #[test]
    fn error_omits_missing_details() {
        let value = serde_json::to_value(ServerMessage::Error {
            error: "服务器连接错误: refused".to_string(),
            details: None,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "error": "服务器连接错误: refused"})
        );

        let value = serde_json::to_value(ServerMessage::Error {
            error: "服务器错误: invalid auth".to_string(),
            details: Some(json!({"error": "invalid auth"})),
        })
        .unwrap();
        assert_eq!(value["details"], json!({"error": "invalid auth"}));
    }
}
