//! In-page audio interceptor: the injected script and its command surface.
//!
//! The script is rendered once per bridge with the session's sample rates and
//! queue limits, registered as an init script (so it runs before any page
//! code), and then driven through a single `dispatch(command)` entry point.
//! Commands and replies are plain JSON; that is the whole contract between
//! the process and the page.


use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::audio::{AudioChunk, BLOCK_SIZE, PRE_RELAY_CAPACITY};
use crate::page::{BridgeCallFailure, PageChannel};
use crate::voice::StreamingVoiceClient;

/// Global the script installs its handle under.
pub const HANDLE: &str = "__voxroom";

/// Binding the page calls with each captured chunk.
pub const RELAY_BINDING: &str = "__voxroomRelay";

/// Binding the page calls with `{"level", "message"}` log lines.
pub const LOG_BINDING: &str = "__voxroomLog";

const TEMPLATE: &str = include_str!("interceptor.js");

const CONFIG_PLACEHOLDER: &str = "/*__VOXROOM_CONFIG__*/null";

const DISPATCH_PREFIX: &str = "globalThis.__voxroom.dispatch(";

/// Values baked into the rendered script.
///
/// The synthetic microphone and the capture graphs run in separate audio
/// contexts: AI speech plays at the provider's output rate while room audio
/// is captured at the rate the provider expects as input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorConfig {
    pub playback_sample_rate: u32,
    pub capture_sample_rate: u32,
    pub input_mime_type: String,
    pub block_size: usize,
    pub pre_relay_capacity: usize,
    pub handle: &'static str,
    pub relay_binding: &'static str,
    pub log_binding: &'static str,
}

impl InterceptorConfig {
    pub fn new(
        playback_sample_rate: u32,
        capture_sample_rate: u32,
        input_mime_type: impl Into<String>,
    ) -> Self {
        Self {
            playback_sample_rate,
            capture_sample_rate,
            input_mime_type: input_mime_type.into(),
            block_size: BLOCK_SIZE,
            pre_relay_capacity: PRE_RELAY_CAPACITY,
            handle: HANDLE,
            relay_binding: RELAY_BINDING,
            log_binding: LOG_BINDING,
        }
    }

    /// Rates and MIME type as a voice client reports them.
    pub fn for_client(client: &dyn StreamingVoiceClient) -> Self {
        Self::new(
            client.output_sample_rate(),
            client.preferred_sample_rate(),
            client.preferred_input_mime_type(),
        )
    }

    /// The script source with this config substituted in.
    pub fn render(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(TEMPLATE.replacen(CONFIG_PLACEHOLDER, &json, 1))
    }
}

/// Calls the process makes into the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PageCommand {
    /// Append chunks to the synthetic microphone queue, in order.
    EnqueuePlayback { chunks: Vec<AudioChunk> },
    /// Start forwarding captured audio through the relay binding, flushing
    /// the pre-relay queue first.
    AttachRelay,
    TapElement { selector: String },
    TapAnyMediaElement,
    TapPeerConnections,
    Stats,
    /// Stop every graph, release tracks and close the audio context.
    Cleanup,
}

impl PageCommand {
    pub fn op(&self) -> &'static str {
        match self {
            Self::EnqueuePlayback { .. } => "enqueuePlayback",
            Self::AttachRelay => "attachRelay",
            Self::TapElement { .. } => "tapElement",
            Self::TapAnyMediaElement => "tapAnyMediaElement",
            Self::TapPeerConnections => "tapPeerConnections",
            Self::Stats => "stats",
            Self::Cleanup => "cleanup",
        }
    }

    /// Expression evaluated in the page for this command.
    pub fn expression(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{DISPATCH_PREFIX}{})", serde_json::to_string(self)?))
    }

    /// Inverse of [`PageCommand::expression`].
    pub fn from_expression(expression: &str) -> Option<Self> {
        let json = expression
            .strip_prefix(DISPATCH_PREFIX)?
            .strip_suffix(')')?;
        serde_json::from_str(json).ok()
    }
}

/// Send one command and decode its reply.
pub async fn dispatch<T: DeserializeOwned>(
    page: &dyn PageChannel,
    command: &PageCommand,
) -> Result<T, BridgeCallFailure> {
    let expression = command
        .expression()
        .map_err(|e| BridgeCallFailure::Evaluation(format!("encode {}: {e}", command.op())))?;
    let reply = page.evaluate(&expression).await?;
    serde_json::from_value(reply).map_err(|e| {
        BridgeCallFailure::Evaluation(format!("unexpected {} reply: {e}", command.op()))
    })
}

// ── Replies ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackReply {
    /// Queue depth after the append.
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReply {
    /// False while the relay binding is not exposed yet.
    pub attached: bool,
    pub flushed: usize,
    pub dropped: u64,
}

/// How the inbound tap reached the room's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapMode {
    /// The element's `srcObject` stream.
    ElementStream,
    /// `captureStream()` on the element.
    ElementCapture,
    /// The element routed through a media element source.
    ElementSource,
    PeerConnection,
}

impl TapMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ElementStream => "element_stream",
            Self::ElementCapture => "element_capture",
            Self::ElementSource => "element_source",
            Self::PeerConnection => "peer_connection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapReport {
    pub attached: bool,
    pub mode: Option<TapMode>,
    /// Capture graphs alive after the call.
    pub graphs: usize,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStats {
    pub playback_queue: usize,
    pub playback_remainder: usize,
    pub blocks_played: u64,
    pub blocks_silent: u64,
    pub undecodable: u64,
    pub mic_active: bool,
    pub pre_relay_queued: usize,
    pub pre_relay_dropped: u64,
    pub relay_attached: bool,
    pub captured: u64,
    pub relayed: u64,
    pub graphs: usize,
    pub tap_mode: Option<TapMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReply {
    pub cleaned: bool,
}

/// One line from the log binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLogLine {
    pub level: String,
    pub message: String,
}

impl PageLogLine {
    /// Lines that are not the structured form are kept whole at info.
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self {
            level: "info".into(),
            message: raw.to_string(),
        })
    }

    /// Re-emit under the `page` target.
    pub fn emit(&self) {
        match self.level.as_str() {
            "error" => tracing::error!(target: "page", "{}", self.message),
            "warn" => tracing::warn!(target: "page", "{}", self.message),
            "debug" => tracing::debug!(target: "page", "{}", self.message),
            _ => tracing::info!(target: "page", "{}", self.message),
        }
    }
}
