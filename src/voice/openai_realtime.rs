//! OpenAI Realtime protocol (provider A).
//!
//! Turn-based: the client sends `session.update` on open, appends audio to
//! the input buffer and completes turns explicitly. The only provider that
//! reconnects on its own after an unexpected close.
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: WebSocket to `wss://api.openai.com/v1/realtime?model=...`
//! 2. **Setup**: send `session.update` with voice, sampling and
//!    instructions; `session.created` / `session.updated` is the ready signal
//! 3. **Stream**: send `input_audio_buffer.append` (Base64 PCM16 24kHz),
//!    receive `response.audio.delta` (Base64 PCM16 24kHz)
//! 4. **Turn**: `input_audio_buffer.commit` + `response.create`

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use super::session::{endpoint_with_query, Protocol, RealtimeClient};
use super::{ProviderConfig, VoiceError, VoiceEvent};
use crate::audio::AudioChunk;

// ── Constants ──────────────────────────────────────────────────────

/// OpenAI Realtime WebSocket endpoint.
const OPENAI_REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";

/// Input/output audio: PCM16, 24kHz, mono.
pub const SAMPLE_RATE: u32 = 24000;

pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

pub const DEFAULT_VOICE: &str = "alloy";

pub type OpenAiRealtimeClient = RealtimeClient<OpenAiRealtime>;

/// Provider A framing.
#[derive(Debug, Clone)]
pub struct OpenAiRealtime {
    config: ProviderConfig,
}

impl OpenAiRealtime {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl Protocol for OpenAiRealtime {
    fn label(&self) -> &'static str {
        "openai-realtime"
    }

    fn request(&self) -> Result<Request, VoiceError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or(OPENAI_REALTIME_WS_URL);
        let url = endpoint_with_query(endpoint, "model", &self.config.model);

        // Build WebSocket request with auth headers
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Configuration(format!("invalid realtime URL: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.config.api_key)
                .parse()
                .map_err(|e| VoiceError::Configuration(format!("invalid auth header: {e}")))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|e| VoiceError::Configuration(format!("invalid header: {e}")))?,
        );
        Ok(request)
    }

    fn setup_message(&self) -> Result<String, VoiceError> {
        Ok(build_session_update(&self.config).to_string())
    }

    /// The format is fixed by `session.update`, so the mime hint is unused.
    fn audio_message(&self, chunk: &AudioChunk, _mime_hint: Option<&str>) -> String {
        serde_json::json!({
            "type": "input_audio_buffer.append",
            "audio": chunk.as_str(),
        })
        .to_string()
    }

    fn start_conversation_messages(&self) -> Vec<String> {
        vec![serde_json::json!({"type": "response.create"}).to_string()]
    }

    fn end_turn_messages(&self) -> Vec<String> {
        vec![
            serde_json::json!({"type": "input_audio_buffer.commit"}).to_string(),
            serde_json::json!({"type": "response.create"}).to_string(),
        ]
    }

    fn parse_server_message(&self, text: &str) -> Result<Vec<VoiceEvent>, serde_json::Error> {
        parse_server_event(text)
    }

    fn reconnects_on_drop(&self) -> bool {
        true
    }

    fn input_sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

// ── Session update message ─────────────────────────────────────────

/// Build the `session.update` message. Turn detection is off: turns are
/// completed by the client.
fn build_session_update(config: &ProviderConfig) -> serde_json::Value {
    serde_json::json!({
        "type": "session.update",
        "session": {
            "model": config.model,
            "modalities": ["audio", "text"],
            "voice": config.voice,
            "instructions": config.instructions,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": {
                "model": "gpt-4o-mini-transcribe"
            },
            "turn_detection": null
        }
    })
}

// ── Server event parsing ───────────────────────────────────────────

/// Parse an OpenAI Realtime server event into VoiceEvents.
fn parse_server_event(json_text: &str) -> Result<Vec<VoiceEvent>, serde_json::Error> {
    let mut events = Vec::new();
    let value: serde_json::Value = serde_json::from_str(json_text)?;

    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        // Session lifecycle
        "session.created" | "session.updated" => {
            events.push(VoiceEvent::SetupComplete);
        }

        // Audio output
        "response.audio.delta" | "response.output_audio.delta" => {
            if let Some(delta_b64) = value.get("delta").and_then(|v| v.as_str()) {
                match AudioChunk::parse(delta_b64) {
                    Ok(chunk) if !chunk.is_empty() => events.push(VoiceEvent::Audio(chunk)),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Discarding undecodable audio delta");
                    }
                }
            }
        }

        // Output transcript (model speech)
        "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
            if let Some(text) = value.get("delta").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(VoiceEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }

        // Input transcript (room speech)
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(text) = value.get("transcript").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(VoiceEvent::InputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }

        "response.done" => events.push(VoiceEvent::TurnComplete),

        "response.cancelled" => events.push(VoiceEvent::Interrupted),

        "error" => {
            let error = value.get("error");
            let message = error
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown OpenAI error");
            let code = error
                .and_then(|e| e.get("code"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            events.push(VoiceEvent::Error {
                code,
                message: message.to_string(),
            });
        }

        // Other events: debug only
        _ => {
            tracing::debug!(event_type = event_type, "OpenAI Realtime event (unhandled)");
        }
    }

    Ok(events)
}

// ── Tests ──────────────────────────────────────────────────────────
