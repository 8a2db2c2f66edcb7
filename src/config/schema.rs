use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::voice::VoiceSettings;

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where this config was loaded from.
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub voice: VoiceSettings,

    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub browser: BrowserSettings,

    #[serde(default)]
    pub office: OfficeSettings,
}

// ── Bridge ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Selector of the element that plays the room's audio. Falls back to
    /// any playing media element, then to the peer-connection tap.
    #[serde(default)]
    pub audio_selector: Option<String>,
    /// Per-strategy timeout while locating the room's audio.
    #[serde(default = "default_locator_timeout_ms")]
    pub locator_timeout_ms: u64,
    /// How long to wait for the provider session before starting the
    /// conversation anyway.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Cap of the process-side queue holding AI audio the page could not
    /// take yet.
    #[serde(default = "default_held_audio_cap")]
    pub held_audio_cap: usize,
    /// Page stats logging interval; 0 disables.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_locator_timeout_ms() -> u64 {
    2000
}

fn default_ready_timeout_ms() -> u64 {
    15_000
}

fn default_held_audio_cap() -> usize {
    1000
}

fn default_stats_interval_secs() -> u64 {
    30
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            audio_selector: None,
            locator_timeout_ms: default_locator_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            held_audio_cap: default_held_audio_cap(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl BridgeSettings {
    pub fn locator_timeout(&self) -> Duration {
        Duration::from_millis(self.locator_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

// ── Browser ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSettings {
    #[serde(default)]
    pub headless: bool,
    /// Chromium binary; auto-detected when unset.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Profile directory, so a logged-in session can be reused.
    #[serde(default)]
    pub user_data_dir: Option<PathBuf>,
}

// ── Office (login target) ────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct OfficeSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_email_selector")]
    pub email_selector: String,
    #[serde(default = "default_password_selector")]
    pub password_selector: String,
    #[serde(default = "default_submit_selector")]
    pub submit_selector: String,
    /// Clicked after login to switch the microphone on, if set.
    #[serde(default)]
    pub mic_button_selector: Option<String>,
    /// How long to wait for each selector to appear.
    #[serde(default = "default_element_timeout_ms")]
    pub element_timeout_ms: u64,
}

fn default_email_selector() -> String {
    "input[type=email]".into()
}

fn default_password_selector() -> String {
    "input[type=password]".into()
}

fn default_submit_selector() -> String {
    "button[type=submit]".into()
}

fn default_element_timeout_ms() -> u64 {
    10_000
}

impl Default for OfficeSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            email: String::new(),
            password: String::new(),
            email_selector: default_email_selector(),
            password_selector: default_password_selector(),
            submit_selector: default_submit_selector(),
            mic_button_selector: None,
            element_timeout_ms: default_element_timeout_ms(),
        }
    }
}

impl OfficeSettings {
    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }
}

impl fmt::Debug for OfficeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfficeSettings")
            .field("url", &self.url)
            .field("email", &self.email)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { "[REDACTED]" },
            )
            .field("email_selector", &self.email_selector)
            .field("password_selector", &self.password_selector)
            .field("submit_selector", &self.submit_selector)
            .field("mic_button_selector", &self.mic_button_selector)
            .field("element_timeout_ms", &self.element_timeout_ms)
            .finish()
    }
}
