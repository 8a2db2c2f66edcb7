//! Provider selection: build the right streaming voice client from settings.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    gemini_live, openai_realtime, GeminiLive, OpenAiRealtime, OutagePolicy, ProviderConfig,
    RealtimeClient, ReconnectPolicy, StreamingVoiceClient, VoiceError,
};

/// Supported voice providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProviderKind {
    /// OpenAI Realtime API (turn-based, reconnects).
    #[default]
    #[serde(rename = "openai_realtime")]
    OpenAiRealtime,
    /// Google Gemini Live API (server-side VAD).
    #[serde(rename = "gemini_live")]
    GeminiLive,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAiRealtime => "openai_realtime",
            Self::GeminiLive => "gemini_live",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAiRealtime => openai_realtime::DEFAULT_MODEL,
            Self::GeminiLive => gemini_live::DEFAULT_MODEL,
        }
    }

    pub fn default_voice(self) -> &'static str {
        match self {
            Self::OpenAiRealtime => openai_realtime::DEFAULT_VOICE,
            Self::GeminiLive => gemini_live::DEFAULT_VOICE,
        }
    }

    /// Rate the provider expects captured room audio at.
    pub fn input_sample_rate(self) -> u32 {
        match self {
            Self::OpenAiRealtime => openai_realtime::SAMPLE_RATE,
            Self::GeminiLive => gemini_live::INPUT_SAMPLE_RATE,
        }
    }

    /// Rate of the speech the provider streams back.
    pub fn output_sample_rate(self) -> u32 {
        match self {
            Self::OpenAiRealtime => openai_realtime::SAMPLE_RATE,
            Self::GeminiLive => gemini_live::OUTPUT_SAMPLE_RATE,
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "openai_realtime" | "openai" => Ok(Self::OpenAiRealtime),
            "gemini_live" | "gemini" => Ok(Self::GeminiLive),
            other => Err(VoiceError::Configuration(format!(
                "unknown voice provider '{other}' (expected openai_realtime or gemini_live)"
            ))),
        }
    }
}

/// The `[voice]` configuration section.
#[derive(Clone, Serialize, Deserialize)]
pub struct VoiceSettings {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub api_key: String,
    /// Provider default when unset.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub outage_policy: OutagePolicy,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_p() -> f32 {
    0.95
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            api_key: String::new(),
            model: None,
            voice: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            instructions: String::new(),
            endpoint: None,
            outage_policy: OutagePolicy::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl fmt::Debug for VoiceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceSettings")
            .field("provider", &self.provider)
            .field(
                "api_key",
                &if self.api_key.is_empty() { "" } else { "[REDACTED]" },
            )
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("instructions_len", &self.instructions.len())
            .field("endpoint", &self.endpoint)
            .field("outage_policy", &self.outage_policy)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl VoiceSettings {
    /// Resolve defaults and check required fields.
    pub fn provider_config(&self) -> Result<ProviderConfig, VoiceError> {
        let kind = self.provider.as_str();
        if self.api_key.trim().is_empty() {
            return Err(VoiceError::Configuration(format!(
                "voice.api_key is required for provider '{kind}'"
            )));
        }
        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .unwrap_or(self.provider.default_model());
        if model.is_empty() {
            return Err(VoiceError::Configuration(format!(
                "voice.model cannot be empty for provider '{kind}'"
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(VoiceError::Configuration(format!(
                "voice.temperature must be within 0.0..=2.0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(VoiceError::Configuration(format!(
                "voice.top_p must be within 0.0..=1.0, got {}",
                self.top_p
            )));
        }
        Ok(ProviderConfig {
            api_key: self.api_key.trim().to_string(),
            model: model.to_string(),
            voice: self
                .voice
                .clone()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| self.provider.default_voice().to_string()),
            temperature: self.temperature,
            top_p: self.top_p,
            instructions: self.instructions.clone(),
            endpoint: self.endpoint.clone().filter(|e| !e.trim().is_empty()),
        })
    }
}

/// Factory: create the right voice client from settings.
///
/// Fails with [`VoiceError::Configuration`] when a required field is missing;
/// nothing is connected yet.
pub fn create_voice_client(
    settings: &VoiceSettings,
) -> Result<Arc<dyn StreamingVoiceClient>, VoiceError> {
    let config = provider_config_logged(settings)?;
    let client: Arc<dyn StreamingVoiceClient> = match settings.provider {
        ProviderKind::OpenAiRealtime => Arc::new(RealtimeClient::new(
            OpenAiRealtime::new(config),
            settings.reconnect,
            settings.outage_policy,
        )),
        ProviderKind::GeminiLive => Arc::new(RealtimeClient::new(
            GeminiLive::new(config),
            settings.reconnect,
            settings.outage_policy,
        )),
    };
    Ok(client)
}

fn provider_config_logged(settings: &VoiceSettings) -> Result<ProviderConfig, VoiceError> {
    let config = settings.provider_config()?;
    tracing::info!(
        provider = settings.provider.as_str(),
        model = %config.model,
        voice = %config.voice,
        outage_policy = ?settings.outage_policy,
        "Voice provider selected"
    );
    Ok(config)
}
