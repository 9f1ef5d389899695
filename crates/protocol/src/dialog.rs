//! Typed JSON payloads sent upstream on the dialogue control channel.

use serde::Serialize;

pub const DEFAULT_MODEL: &str = "O2.0";
pub const DEFAULT_SPEAKER: &str = "zh_female_vv_jupiter_bigtts";
pub const DEFAULT_BOT_NAME: &str = "豆包";
pub const DEFAULT_SPEAKING_STYLE: &str = "你的说话风格简洁明了，语速适中，语气自然。";

/// Payload of a START_SESSION event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionConfig {
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub dialog: DialogConfig,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AsrConfig {
    pub extra: AsrExtra,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AsrExtra {
    /// End-of-speech smoothing window in milliseconds.
    pub end_smooth_window_ms: u32,
    pub enable_custom_vad: bool,
    pub enable_two_pass: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TtsConfig {
    pub speaker: String,
    pub audio_config: AudioConfig,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AudioConfig {
    pub channel: u32,
    /// Raw signed-16-bit little-endian PCM.
    pub format: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DialogConfig {
    pub bot_name: String,
    pub system_role: String,
    pub speaking_style: String,
    pub model: String,
    pub extra: DialogExtra,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DialogExtra {
    pub input_mod: String,
    pub strict_audit: bool,
    /// Seconds the upstream waits for input before timing out a turn.
    pub recv_timeout: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            asr: AsrConfig {
                extra: AsrExtra {
                    end_smooth_window_ms: 1500,
                    enable_custom_vad: false,
                    enable_two_pass: false,
                },
            },
            tts: TtsConfig {
                speaker: DEFAULT_SPEAKER.to_string(),
                audio_config: AudioConfig {
                    channel: 1,
                    format: "pcm_s16le".to_string(),
                    sample_rate: 24000,
                },
            },
            dialog: DialogConfig {
                bot_name: DEFAULT_BOT_NAME.to_string(),
                system_role: String::new(),
                speaking_style: DEFAULT_SPEAKING_STYLE.to_string(),
                model: DEFAULT_MODEL.to_string(),
                extra: DialogExtra {
                    input_mod: "audio".to_string(),
                    strict_audit: false,
                    recv_timeout: 10,
                },
            },
        }
    }
}

/// Payload of a text TASK_REQUEST.
///
/// The upstream accepts the text under two key generations; both are filled
/// so either parser picks it up.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextTaskPayload {
    pub text: String,
    pub input_text: String,
    pub input_mod: String,
    pub input_mode: String,
}

impl TextTaskPayload {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            input_text: text.clone(),
            text,
            input_mod: "text".to_string(),
            input_mode: "text".to_string(),
        }
    }
}
