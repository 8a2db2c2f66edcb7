//! Streaming voice clients for real-time speech AI providers.
//!
//! Provides one provider-agnostic capability surface
//! ([`StreamingVoiceClient`]) over two wire protocols:
//!
//! - **OpenAI Realtime**: `type`-discriminated JSON events, explicit
//!   `session.update` setup, manual turn completion, automatic reconnect
//!   with linear backoff.
//! - **Gemini Live**: nested `setup` / `realtimeInput` / `serverContent`
//!   messages, server-side voice activity detection, no reconnect.
//!
//! ## Design
//! - One connection engine ([`session::RealtimeClient`]) parameterized by a
//!   [`session::Protocol`] that owns the provider framing
//! - `send_audio` never blocks and never fails: before the session-ready
//!   signal it is a logged no-op (or a bounded hold, see [`OutagePolicy`])
//! - Events fan out through [`EventSubscription`] handles

pub mod error;
pub mod events;
pub mod factory;
pub mod gemini_live;
pub mod openai_realtime;
pub mod policy;
pub mod session;

#[cfg(test)]
pub(crate) mod mock_server;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::audio::AudioChunk;

pub use error::VoiceError;
pub use events::{EventHub, EventSubscription};
pub use factory::{create_voice_client, ProviderKind, VoiceSettings};
pub use gemini_live::{GeminiLive, GeminiLiveClient};
pub use openai_realtime::{OpenAiRealtime, OpenAiRealtimeClient};
pub use policy::{OutagePolicy, ReconnectPolicy};
pub use session::{Protocol, RealtimeClient};

// ── Shared voice event type ──────────────────────────────────────

/// Provider-agnostic event produced by any voice session.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// Provider acknowledged the setup message; audio may flow.
    SetupComplete,
    /// One inbound audio fragment, in arrival order.
    Audio(AudioChunk),
    /// Transcription of the room's speech (input).
    InputTranscript { text: String },
    /// Transcription of the model's speech (output).
    OutputTranscript { text: String },
    /// Model finished a response turn.
    TurnComplete,
    /// The model was interrupted mid-response.
    Interrupted,
    /// Error reported by the provider or the transport.
    Error {
        code: Option<String>,
        message: String,
    },
    /// The transport went away.
    Disconnected { intentional: bool },
}

/// Lifecycle of a provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Transport open, setup sent, waiting for the ready signal.
    Connecting,
    Ready,
    Closing,
    /// Terminal; reached only through `close()`.
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Immutable per-provider settings supplied at construction.
#[derive(Clone, PartialEq)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub temperature: f32,
    pub top_p: f32,
    pub instructions: String,
    /// Overrides the provider's public WebSocket endpoint.
    pub endpoint: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("instructions_len", &self.instructions.len())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Capability surface the audio bridge relies on.
///
/// Implementations own their socket; callers serialize through the bridge.
#[async_trait]
pub trait StreamingVoiceClient: Send + Sync {
    /// Open the provider socket and send the setup message. Returns once the
    /// transport is up; readiness arrives later as [`VoiceEvent::SetupComplete`].
    /// A no-op while already connecting or ready.
    async fn connect(&self) -> Result<(), VoiceError>;

    /// Ask the provider to start speaking.
    async fn start_conversation(&self) -> Result<(), VoiceError>;

    /// Queue one chunk for the provider. A logged no-op unless ready.
    fn send_audio(&self, chunk: &AudioChunk, mime_hint: Option<&str>);

    /// Signal the end of the current input turn.
    async fn end_turn(&self) -> Result<(), VoiceError>;

    /// Register an event consumer.
    fn subscribe(&self) -> EventSubscription;

    fn state(&self) -> SessionState;

    /// Transport open *and* provider ready signal received.
    fn is_connected(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Wait until ready; `NotReady` on timeout, `Closed` after `close()`.
    async fn wait_ready(&self, timeout: Duration) -> Result<(), VoiceError>;

    /// Intentional, idempotent shutdown. Suppresses any further reconnect.
    async fn close(&self);

    /// Sample rate the provider expects for input audio.
    fn preferred_sample_rate(&self) -> u32;

    /// Sample rate of the audio the provider sends back.
    fn output_sample_rate(&self) -> u32;

    fn preferred_input_mime_type(&self) -> String;

    fn provider_label(&self) -> &'static str;
}

/// How long the bridge waits for a fresh session to become ready by default.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(15);
