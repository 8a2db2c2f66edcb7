//! Audio bridge: relays AI speech into the page and room audio out of it.
//!
//! ## Lifecycle (order is fixed)
//!
//! 1. [`AudioBridge::setup_before_login`] : register the interceptor as an
//!    init script, start forwarding provider audio toward the page, connect
//!    the provider
//! 2. the session driver logs in and navigates
//! 3. [`AudioBridge::complete_setup`] : flush held audio, expose the relay
//!    binding, attach the inbound tap, then attach the relay, which drains
//!    the page's pre-relay queue
//! 4. [`AudioBridge::stop`] : page cleanup, provider close; idempotent
//!
//! AI audio that the page cannot take yet (not installed, or mid-navigation)
//! waits in a bounded process-side queue and is retried in order. Failing to
//! tap the room is not fatal: the bridge keeps running outbound-only.

pub mod locator;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioChunk, BoundedFifo, PushOutcome};
use crate::config::BridgeSettings;
use crate::interceptor::{
    dispatch, CleanupReply, InterceptorConfig, PageCommand, PageLogLine, PageStats,
    PlaybackReply, RelayReply, TapReport, LOG_BINDING, RELAY_BINDING,
};
use crate::page::{BindingReceiver, BridgeCallFailure, PageChannel};
use crate::voice::{EventSubscription, StreamingVoiceClient, VoiceError, VoiceEvent};

pub use locator::{default_chain, locate, AudioLocator, CaptureSetupError};

/// Delay between delivery retries of held audio.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Attempts for setup calls that hit a navigating page.
const SETUP_CALL_ATTEMPTS: u32 = 10;

/// Upper bound for the page cleanup call during stop.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is {actual}; expected {expected}")]
    InvalidPhase {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("failed to install the page interceptor: {0}")]
    Install(String),

    #[error(transparent)]
    Voice(#[from] VoiceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Idle,
    /// Interceptor registered, provider connecting; waiting for login.
    Prepared,
    Active,
    Stopped,
}

impl BridgePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Prepared => "prepared",
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }
}

/// Outcome of [`AudioBridge::complete_setup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupReport {
    /// `None` when running outbound-only.
    pub tap: Option<TapReport>,
    /// Chunks the page had captured before the relay existed.
    pub pre_relay_flushed: usize,
    pub pre_relay_dropped: u64,
}

impl SetupReport {
    pub fn outbound_only(&self) -> bool {
        self.tap.is_none()
    }
}

pub struct AudioBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    page: Arc<dyn PageChannel>,
    client: Arc<dyn StreamingVoiceClient>,
    settings: BridgeSettings,
    locators: Vec<Box<dyn AudioLocator>>,
    phase: Mutex<BridgePhase>,
    /// AI audio the page has not accepted yet, oldest first.
    held: Mutex<BoundedFifo<AudioChunk>>,
    /// Serializes deliveries so retries never reorder chunks.
    delivery: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    delivered: AtomicU64,
    relayed: AtomicU64,
    held_dropped_reported: AtomicU64,
}

impl AudioBridge {
    pub fn new(
        page: Arc<dyn PageChannel>,
        client: Arc<dyn StreamingVoiceClient>,
        settings: BridgeSettings,
    ) -> Self {
        let locators = default_chain(settings.audio_selector.as_deref());
        Self::with_locators(page, client, settings, locators)
    }

    pub fn with_locators(
        page: Arc<dyn PageChannel>,
        client: Arc<dyn StreamingVoiceClient>,
        settings: BridgeSettings,
        locators: Vec<Box<dyn AudioLocator>>,
    ) -> Self {
        let held = BoundedFifo::new(settings.held_audio_cap);
        Self {
            inner: Arc::new(BridgeInner {
                page,
                client,
                settings,
                locators,
                phase: Mutex::new(BridgePhase::Idle),
                held: Mutex::new(held),
                delivery: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                delivered: AtomicU64::new(0),
                relayed: AtomicU64::new(0),
                held_dropped_reported: AtomicU64::new(0),
            }),
        }
    }

    pub fn phase(&self) -> BridgePhase {
        *self.inner.phase.lock()
    }

    /// AI chunks accepted by the page.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Room chunks handed to the provider.
    pub fn relayed(&self) -> u64 {
        self.inner.relayed.load(Ordering::Relaxed)
    }

    /// AI chunks waiting for the page.
    pub fn held(&self) -> usize {
        self.inner.held.lock().len()
    }

    /// Step 1: call before the page navigates anywhere.
    pub async fn setup_before_login(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        inner.expect_phase(BridgePhase::Idle)?;

        let config = InterceptorConfig::for_client(inner.client.as_ref());
        let script = config
            .render()
            .map_err(|e| BridgeError::Install(format!("render: {e}")))?;
        retry_on_navigation("add init script", || inner.page.add_init_script(&script))
            .await
            .map_err(|e| BridgeError::Install(e.to_string()))?;

        match retry_on_navigation("expose log binding", || inner.page.expose_binding(LOG_BINDING))
            .await
        {
            Ok(logs) => inner.spawn(forward_page_logs(logs, inner.cancel.clone())),
            Err(e) => tracing::warn!(error = %e, "Page log binding unavailable"),
        }

        let events = inner.client.subscribe();
        inner.spawn(BridgeInner::pump_playback(Arc::clone(inner), events));

        tracing::info!(
            provider = inner.client.provider_label(),
            playback_rate = config.playback_sample_rate,
            capture_rate = config.capture_sample_rate,
            mime = %config.input_mime_type,
            "Interceptor registered; connecting voice provider"
        );
        inner.client.connect().await?;
        *inner.phase.lock() = BridgePhase::Prepared;
        Ok(())
    }

    /// Step 3: call once the driver has reached the room.
    pub async fn complete_setup(&self) -> Result<SetupReport, BridgeError> {
        let inner = &self.inner;
        inner.expect_phase(BridgePhase::Prepared)?;

        inner.deliver_held().await;

        let mut report = SetupReport {
            tap: None,
            pre_relay_flushed: 0,
            pre_relay_dropped: 0,
        };

        match retry_on_navigation("expose relay binding", || {
            inner.page.expose_binding(RELAY_BINDING)
        })
        .await
        {
            Ok(relay) => {
                inner.spawn(BridgeInner::relay_captured(Arc::clone(inner), relay));
                // Room audio captured while the locators run waits in the
                // page's pre-relay queue.
                report.tap = inner.attach_tap().await;
                match inner.attach_relay().await {
                    Some(reply) => {
                        report.pre_relay_flushed = reply.flushed;
                        report.pre_relay_dropped = reply.dropped;
                    }
                    None => {
                        tracing::warn!("Relay not attached yet; retrying in the background");
                        inner.spawn(BridgeInner::attach_relay_when_visible(Arc::clone(inner)));
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to expose relay binding"),
        }

        if report.tap.is_none() {
            tracing::warn!(
                "Room audio not tapped; continuing outbound-only (the AI can speak but not hear)"
            );
        }

        inner.spawn(BridgeInner::start_when_ready(Arc::clone(inner)));
        if let Some(interval) = inner.settings.stats_interval() {
            inner.spawn(BridgeInner::log_stats(Arc::clone(inner), interval));
        }

        *inner.phase.lock() = BridgePhase::Active;
        tracing::info!(
            outbound_only = report.outbound_only(),
            flushed = report.pre_relay_flushed,
            "Audio bridge active"
        );
        Ok(report)
    }

    /// Page-side counters, straight from the interceptor.
    pub async fn stats(&self) -> Result<PageStats, BridgeCallFailure> {
        dispatch(self.inner.page.as_ref(), &PageCommand::Stats).await
    }

    /// Step 4: tear everything down. Safe to call more than once.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut phase = inner.phase.lock();
            if *phase == BridgePhase::Stopped {
                return;
            }
            *phase = BridgePhase::Stopped;
        }
        inner.cancel.cancel();

        let cleanup = tokio::time::timeout(
            CLEANUP_TIMEOUT,
            dispatch::<CleanupReply>(inner.page.as_ref(), &PageCommand::Cleanup),
        )
        .await;
        match cleanup {
            Ok(Ok(_)) => tracing::debug!("Page interceptor cleaned up"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Page cleanup skipped"),
            Err(_) => tracing::warn!("Page cleanup timed out"),
        }

        inner.client.close().await;

        let tasks: Vec<_> = inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!(
            delivered = inner.delivered.load(Ordering::Relaxed),
            relayed = inner.relayed.load(Ordering::Relaxed),
            left_held = inner.held.lock().len(),
            "Audio bridge stopped"
        );
    }
}

impl BridgeInner {
    fn expect_phase(&self, expected: BridgePhase) -> Result<(), BridgeError> {
        let actual = *self.phase.lock();
        if actual == expected {
            Ok(())
        } else {
            Err(BridgeError::InvalidPhase {
                expected: expected.as_str(),
                actual: actual.as_str(),
            })
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    async fn attach_tap(&self) -> Option<TapReport> {
        match locate(
            self.page.as_ref(),
            &self.locators,
            self.settings.locator_timeout(),
        )
        .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(error = %e, "Inbound audio capture setup failed");
                None
            }
        }
    }

    /// Hand the page the relay binding, flushing its pre-relay queue.
    /// `None` while the binding is not visible in the page.
    async fn attach_relay(&self) -> Option<RelayReply> {
        let reply = retry_on_navigation("attach relay", || {
            dispatch::<RelayReply>(self.page.as_ref(), &PageCommand::AttachRelay)
        })
        .await;
        match reply {
            Ok(reply) if reply.attached => {
                if reply.dropped > 0 {
                    tracing::warn!(
                        dropped = reply.dropped,
                        "Page dropped captured audio before the relay existed"
                    );
                }
                tracing::debug!(flushed = reply.flushed, "Relay attached");
                Some(reply)
            }
            Ok(_) => {
                tracing::debug!("Relay binding not visible in the page");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "Failed to attach relay");
                None
            }
        }
    }

    async fn attach_relay_when_visible(inner: Arc<Self>) {
        let mut retry = tokio::time::interval(RETRY_INTERVAL);
        retry.tick().await;
        loop {
            tokio::select! {
                () = inner.cancel.cancelled() => return,
                _ = retry.tick() => {}
            }
            if let Some(reply) = inner.attach_relay().await {
                tracing::info!(flushed = reply.flushed, "Relay attached after retry");
                return;
            }
        }
    }

    fn hold(&self, chunk: AudioChunk) {
        let mut held = self.held.lock();
        if held.push(chunk) == PushOutcome::Dropped {
            let dropped = held.dropped();
            let reported = self.held_dropped_reported.fetch_add(1, Ordering::Relaxed);
            if reported == 0 || dropped.is_multiple_of(50) {
                tracing::warn!(
                    held = held.len(),
                    dropped,
                    "Held AI audio queue full; dropping newest chunk"
                );
            }
        }
    }

    /// Push everything held to the page, in order. Chunks go back to the
    /// head of the queue if the page is not there.
    async fn deliver_held(&self) {
        let _turn = self.delivery.lock().await;
        let chunks = self.held.lock().drain();
        if chunks.is_empty() {
            return;
        }
        let count = chunks.len();
        let command = PageCommand::EnqueuePlayback { chunks };
        match dispatch::<PlaybackReply>(self.page.as_ref(), &command).await {
            Ok(reply) => {
                let total = self.delivered.fetch_add(count as u64, Ordering::Relaxed) + count as u64;
                tracing::trace!(count, queued = reply.queued, total, "AI audio delivered to page");
            }
            Err(e) => {
                if let PageCommand::EnqueuePlayback { chunks } = command {
                    self.held.lock().requeue_front(chunks);
                }
                if e.is_context_destroyed() {
                    tracing::debug!(held = count, "Page navigating; holding AI audio");
                } else {
                    tracing::debug!(held = count, error = %e, "Page not ready; holding AI audio");
                }
            }
        }
    }

    /// Provider events → page playback queue.
    async fn pump_playback(inner: Arc<Self>, mut events: EventSubscription) {
        let mut retry = tokio::time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let has_held = !inner.held.lock().is_empty();
            tokio::select! {
                () = inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(VoiceEvent::Audio(chunk)) => {
                        inner.hold(chunk);
                        inner.deliver_held().await;
                    }
                    Some(VoiceEvent::Disconnected { intentional: false }) => {
                        tracing::warn!("Voice provider dropped; AI audio paused");
                    }
                    Some(VoiceEvent::SetupComplete) => {
                        tracing::debug!("Voice provider ready");
                    }
                    Some(VoiceEvent::OutputTranscript { text }) => {
                        tracing::info!(text = %text, "AI said");
                    }
                    Some(VoiceEvent::InputTranscript { text }) => {
                        tracing::info!(text = %text, "Room said");
                    }
                    Some(VoiceEvent::Error { code, message }) => {
                        tracing::warn!(code = code.as_deref().unwrap_or("-"), %message, "Voice provider error");
                    }
                    Some(VoiceEvent::TurnComplete) => tracing::debug!("AI turn complete"),
                    Some(VoiceEvent::Interrupted) => tracing::debug!("AI interrupted"),
                    Some(VoiceEvent::Disconnected { intentional: true }) => {}
                },
                _ = retry.tick(), if has_held => inner.deliver_held().await,
            }
        }
        tracing::debug!("Playback pump stopped");
    }

    /// Page relay binding → provider.
    async fn relay_captured(inner: Arc<Self>, mut relay: BindingReceiver) {
        let mime = inner.client.preferred_input_mime_type();
        loop {
            tokio::select! {
                () = inner.cancel.cancelled() => break,
                payload = relay.recv() => {
                    let Some(payload) = payload else { break };
                    let chunk = AudioChunk::from_base64_unchecked(payload);
                    inner.client.send_audio(&chunk, Some(&mime));
                    let n = inner.relayed.fetch_add(1, Ordering::Relaxed) + 1;
                    if n == 1 || n.is_multiple_of(50) {
                        tracing::info!(
                            chunk = n,
                            samples = chunk.sample_count(),
                            "⬆ Room audio relayed"
                        );
                    }
                }
            }
        }
        tracing::debug!("Relay stopped");
    }

    async fn start_when_ready(inner: Arc<Self>) {
        let timeout = inner.settings.ready_timeout();
        let mut warned = false;
        loop {
            let ready = tokio::select! {
                () = inner.cancel.cancelled() => return,
                ready = inner.client.wait_ready(timeout) => ready,
            };
            match ready {
                Ok(()) => break,
                Err(VoiceError::NotReady) => {
                    if !warned {
                        warned = true;
                        tracing::warn!(
                            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                            "Voice provider not ready yet; conversation start deferred"
                        );
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Conversation not started");
                    return;
                }
            }
        }
        match inner.client.start_conversation().await {
            Ok(()) => tracing::info!(provider = inner.client.provider_label(), "Conversation started"),
            Err(e) => tracing::warn!(error = %e, "Failed to start conversation"),
        }
    }

    async fn log_stats(inner: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = inner.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match dispatch::<PageStats>(inner.page.as_ref(), &PageCommand::Stats).await {
                Ok(stats) => tracing::info!(
                    playback_queue = stats.playback_queue,
                    blocks_played = stats.blocks_played,
                    blocks_silent = stats.blocks_silent,
                    mic_active = stats.mic_active,
                    pre_relay_dropped = stats.pre_relay_dropped,
                    captured = stats.captured,
                    relayed = stats.relayed,
                    graphs = stats.graphs,
                    tap = stats.tap_mode.map_or("none", |m| m.as_str()),
                    provider = inner.client.state().as_str(),
                    held = inner.held.lock().len(),
                    "Bridge stats"
                ),
                Err(e) => tracing::debug!(error = %e, "Stats unavailable"),
            }
        }
    }
}

async fn forward_page_logs(mut logs: BindingReceiver, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = logs.recv() => match line {
                Some(raw) => PageLogLine::parse(&raw).emit(),
                None => break,
            },
        }
    }
}

/// Retry a page call while the page is mid-navigation.
async fn retry_on_navigation<T, F, Fut>(what: &str, mut call: F) -> Result<T, BridgeCallFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeCallFailure>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(e) if e.is_context_destroyed() && attempt < SETUP_CALL_ATTEMPTS => {
                tracing::debug!(what, attempt, "Page navigating; retrying");
                attempt += 1;
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            other => return other,
        }
    }
}
