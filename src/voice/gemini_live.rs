//! Gemini Live protocol (provider B).
//!
//! Implements the bidirectional streaming protocol for Google's Gemini
//! Live API (BidiGenerateContent) with automatic Voice Activity Detection:
//! the provider decides turn boundaries and answers detected speech on its
//! own, so `start_conversation` sends nothing.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to the Gemini Live endpoint
//! 2. **Setup**: send initial configuration (model, VAD, system prompt);
//!    `setupComplete` is the ready signal
//! 3. **Stream**: send audio chunks as `realtimeInput`, receive audio and
//!    transcripts as `serverContent`
//! 4. **Close**: no automatic reconnect; a dropped session stays down
//!
//! ## Binary Frames
//!
//! Gemini Live sends JSON control messages (including `setupComplete`) as
//! WebSocket Binary frames. The session engine parses any Binary frame
//! starting with `{` as a server message.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use super::session::{endpoint_with_query, Protocol, RealtimeClient};
use super::{ProviderConfig, VoiceError, VoiceEvent};
use crate::audio::AudioChunk;

// ── Constants ──────────────────────────────────────────────────────

/// Gemini Live WebSocket endpoint.
const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Input audio: PCM16, 16kHz, mono.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Output audio: PCM16, 24kHz, mono.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Default audio MIME type for input.
const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-live-001";

pub const DEFAULT_VOICE: &str = "Aoede";

pub type GeminiLiveClient = RealtimeClient<GeminiLive>;

// ── VAD Configuration ──────────────────────────────────────────────

/// Voice Activity Detection sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadSensitivity {
    #[serde(rename = "START_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "START_SENSITIVITY_MEDIUM")]
    Medium,
    #[serde(rename = "START_SENSITIVITY_LOW")]
    Low,
}

/// End-of-speech detection sensitivity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndSensitivity {
    #[serde(rename = "END_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "END_SENSITIVITY_MEDIUM")]
    Medium,
    #[serde(rename = "END_SENSITIVITY_LOW")]
    Low,
}

/// Automatic Activity Detection (VAD) configuration for Gemini Live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// `false` = server-side turn detection on.
    pub disabled: bool,
    #[serde(rename = "startOfSpeechSensitivity")]
    pub start_sensitivity: VadSensitivity,
    #[serde(rename = "endOfSpeechSensitivity")]
    pub end_sensitivity: EndSensitivity,
    /// Milliseconds of audio before detected speech start to include.
    #[serde(rename = "prefixPaddingMs")]
    pub prefix_padding_ms: u32,
    /// Milliseconds of silence before declaring speech ended.
    #[serde(rename = "silenceDurationMs")]
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    /// Room conversation: a short pause ends the turn, but not a breath.
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: VadSensitivity::High,
            end_sensitivity: EndSensitivity::Medium,
            prefix_padding_ms: 100,
            silence_duration_ms: 500,
        }
    }
}

// ── Setup message (JSON sent as first frame) ───────────────────────

/// Top-level setup message for Gemini Live session initialization.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(rename = "realtimeInputConfig")]
    pub realtime_input_config: RealtimeInputConfig,
    #[serde(rename = "inputAudioTranscription")]
    pub input_audio_transcription: EmptyObject,
    #[serde(rename = "outputAudioTranscription")]
    pub output_audio_transcription: EmptyObject,
}

/// Serializes as `{}`; enables a feature that takes no options.
#[derive(Debug, Default, Serialize)]
pub struct EmptyObject {}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    pub temperature: f32,
    #[serde(rename = "topP")]
    pub top_p: f32,
    #[serde(rename = "speechConfig", skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInputConfig {
    #[serde(rename = "automaticActivityDetection")]
    pub automatic_activity_detection: VadConfig,
}

/// Build the setup message for a room session.
pub fn build_setup_message(config: &ProviderConfig, vad: &VadConfig) -> SetupMessage {
    let system_instruction = (!config.instructions.trim().is_empty()).then(|| SystemInstruction {
        parts: vec![TextPart {
            text: config.instructions.clone(),
        }],
    });

    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", config.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                temperature: config.temperature,
                top_p: config.top_p,
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                }),
            },
            system_instruction,
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: vad.clone(),
            },
            input_audio_transcription: EmptyObject::default(),
            output_audio_transcription: EmptyObject::default(),
        },
    }
}

// ── Audio input message ────────────────────────────────────────────

/// Audio input message sent to Gemini Live.
///
/// API docs mark `mediaChunks` as deprecated in favor of `audio`, but the
/// server does not reliably process `audio` yet.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage<'a> {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput<'a> {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk<'a>>,
}

/// Audio chunk with MIME type and base64-encoded data.
#[derive(Debug, Serialize)]
pub struct MediaChunk<'a> {
    #[serde(rename = "mimeType")]
    pub mime_type: &'a str,
    pub data: &'a str,
}

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "...", "data": "<base64>"}]}}`
pub fn build_audio_message<'a>(chunk: &'a AudioChunk, mime_type: &'a str) -> RealtimeInputMessage<'a> {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type,
                data: chunk.as_str(),
            }],
        },
    }
}

/// Tells Gemini to process any remaining buffered input.
pub fn build_audio_stream_end_message() -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": {
            "audioStreamEnd": true
        }
    })
}

// ── Protocol ───────────────────────────────────────────────────────

/// Provider B framing.
#[derive(Debug, Clone)]
pub struct GeminiLive {
    config: ProviderConfig,
    vad: VadConfig,
}

impl GeminiLive {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            vad: VadConfig::default(),
        }
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }
}

impl Protocol for GeminiLive {
    fn label(&self) -> &'static str {
        "gemini-live"
    }

    fn request(&self) -> Result<Request, VoiceError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or(GEMINI_LIVE_WS_URL);
        endpoint_with_query(endpoint, "key", &self.config.api_key)
            .into_client_request()
            .map_err(|e| VoiceError::Configuration(format!("invalid Gemini Live URL: {e}")))
    }

    fn setup_message(&self) -> Result<String, VoiceError> {
        serde_json::to_string(&build_setup_message(&self.config, &self.vad))
            .map_err(|e| VoiceError::Protocol(format!("failed to encode setup message: {e}")))
    }

    fn audio_message(&self, chunk: &AudioChunk, mime_hint: Option<&str>) -> String {
        let mime = mime_hint.unwrap_or(INPUT_AUDIO_MIME);
        // Only borrowed strings; serialization cannot fail.
        serde_json::to_string(&build_audio_message(chunk, mime)).unwrap_or_default()
    }

    /// Server-side VAD answers detected speech; nothing to send.
    fn start_conversation_messages(&self) -> Vec<String> {
        Vec::new()
    }

    fn end_turn_messages(&self) -> Vec<String> {
        vec![build_audio_stream_end_message().to_string()]
    }

    fn parse_server_message(&self, text: &str) -> Result<Vec<VoiceEvent>, serde_json::Error> {
        parse_server_message(text)
    }

    fn reconnects_on_drop(&self) -> bool {
        false
    }

    fn input_sample_rate(&self) -> u32 {
        INPUT_SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        OUTPUT_SAMPLE_RATE
    }

    fn input_mime_type(&self) -> String {
        INPUT_AUDIO_MIME.to_string()
    }
}

// ── Server response parsing ────────────────────────────────────────

/// Parse a JSON frame from Gemini Live into a list of events.
///
/// A single server message can contain multiple events (e.g., audio
/// chunks + transcription in the same frame).
pub fn parse_server_message(json_text: &str) -> Result<Vec<VoiceEvent>, serde_json::Error> {
    let mut events = Vec::new();
    let value: serde_json::Value = serde_json::from_str(json_text)?;

    // setupComplete
    if value.get("setupComplete").is_some() {
        events.push(VoiceEvent::SetupComplete);
    }

    // serverContent
    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::Interrupted);
        }
        // Extract audio and text from modelTurn.parts
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    match AudioChunk::parse(data_b64) {
                        Ok(chunk) if !chunk.is_empty() => events.push(VoiceEvent::Audio(chunk)),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Discarding undecodable inline audio");
                        }
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    events.push(VoiceEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }

        for (key, input) in [("inputTranscription", true), ("outputTranscription", false)] {
            if let Some(text) = content.pointer(&format!("/{key}/text")).and_then(|v| v.as_str()) {
                if text.is_empty() {
                    continue;
                }
                let text = text.to_string();
                events.push(if input {
                    VoiceEvent::InputTranscript { text }
                } else {
                    VoiceEvent::OutputTranscript { text }
                });
            }
        }

        // After the turn's audio, so subscribers see it last.
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::TurnComplete);
        }
    }

    // Error
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        let code = err.get("code").and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        events.push(VoiceEvent::Error {
            code,
            message: message.to_string(),
        });
    }

    if value.get("goAway").is_some() {
        tracing::warn!("Gemini Live announced session shutdown (goAway)");
    }

    Ok(events)
}

// ── Tests ──────────────────────────────────────────────────────────
