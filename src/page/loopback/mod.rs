//! In-process page that honours the interceptor's command contract using
//! native models of the script's microphone and capture bookkeeping. Used
//! to drive the bridge in tests; the script itself is exercised in
//! `interceptor::script_tests`.

mod mic;
mod taps;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BindingReceiver, BridgeCallFailure, PageChannel};
use crate::audio::{
    float_to_pcm16, AudioChunk, BoundedFifo, PushOutcome, BLOCK_SIZE, PRE_RELAY_CAPACITY,
};
use crate::interceptor::{
    PageCommand, PageStats, TapMode, TapReport, LOG_BINDING, RELAY_BINDING,
};
use mic::{BlockFill, SyntheticMic};
use taps::TapRegistry;

pub(crate) use taps::TrackKind;

/// A captured block as the script's encoder would relay it.
pub(crate) fn float_chunk(samples: &[f32]) -> AudioChunk {
    let pcm: Vec<i16> = samples.iter().map(|&v| float_to_pcm16(v)).collect();
    AudioChunk::from_samples(&pcm)
}

#[derive(Debug)]
struct MediaElement {
    selector: String,
    playing: bool,
}

/// State that a real page would lose on navigation.
#[derive(Debug)]
struct PageContext {
    mic: SyntheticMic,
    mic_active: bool,
    blocks_played: u64,
    blocks_silent: u64,
    pre_relay: BoundedFifo<AudioChunk>,
    drop_reported: bool,
    relay_attached: bool,
    captured: u64,
    relayed: u64,
    taps: TapRegistry,
    element_graphs: usize,
    tap_mode: Option<TapMode>,
    elements: Vec<MediaElement>,
}

impl PageContext {
    fn new() -> Self {
        Self {
            mic: SyntheticMic::new(),
            mic_active: false,
            blocks_played: 0,
            blocks_silent: 0,
            pre_relay: BoundedFifo::new(PRE_RELAY_CAPACITY),
            drop_reported: false,
            relay_attached: false,
            captured: 0,
            relayed: 0,
            taps: TapRegistry::new(),
            element_graphs: 0,
            tap_mode: None,
            elements: Vec::new(),
        }
    }

    fn graphs(&self) -> usize {
        self.element_graphs + self.taps.graph_count()
    }

    fn report(&self, attached: bool, detail: &str) -> TapReport {
        TapReport {
            attached,
            mode: if attached { self.tap_mode } else { None },
            graphs: self.graphs(),
            detail: Some(detail.to_string()),
        }
    }
}

#[derive(Default)]
struct State {
    init_scripts: Vec<String>,
    bindings: HashMap<String, mpsc::UnboundedSender<String>>,
    context: Option<PageContext>,
    fail_next: usize,
    /// `attachRelay` calls that still see no relay binding.
    relay_hidden: usize,
    commands: Vec<&'static str>,
    navigations: usize,
    peer_connections: bool,
}

impl State {
    fn call_binding(&self, name: &str, payload: String) -> bool {
        self.bindings
            .get(name)
            .is_some_and(|tx| tx.send(payload).is_ok())
    }

    fn log(&self, level: &str, message: &str) {
        let line = serde_json::json!({"level": level, "message": message}).to_string();
        self.call_binding(LOG_BINDING, line);
    }
}

pub(crate) struct LoopbackPage {
    state: Mutex<State>,
}

impl LoopbackPage {
    /// A blank page; nothing is installed until an init script is added and
    /// the page navigates.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                peer_connections: true,
                ..State::default()
            }),
        }
    }

    /// Without `RTCPeerConnection`, as in a stripped-down browser.
    pub fn without_peer_connections() -> Self {
        let page = Self::new();
        page.state.lock().peer_connections = false;
        page
    }

    /// Make the next `n` evaluations fail as if mid-navigation.
    pub fn fail_next_calls(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Make the next `n` relay attachments find no binding, as if the page
    /// had not picked it up yet.
    pub fn hide_relay_binding(&self, n: usize) {
        self.state.lock().relay_hidden = n;
    }

    pub fn init_script_count(&self) -> usize {
        self.state.lock().init_scripts.len()
    }

    pub fn init_script(&self, index: usize) -> Option<String> {
        self.state.lock().init_scripts.get(index).cloned()
    }

    /// Ops of the commands evaluated so far, including failed ones.
    pub fn commands(&self) -> Vec<&'static str> {
        self.state.lock().commands.clone()
    }

    pub fn add_media_element(&self, selector: &str, playing: bool) {
        if let Some(ctx) = self.state.lock().context.as_mut() {
            ctx.elements.push(MediaElement {
                selector: selector.to_string(),
                playing,
            });
        }
    }

    /// A wrapped peer connection fired `track`. Returns whether a capture
    /// graph was built.
    pub fn add_remote_track(&self, track_id: &str, kind: TrackKind) -> bool {
        let mut state = self.state.lock();
        if !state.peer_connections {
            return false;
        }
        let Some(ctx) = state.context.as_mut() else {
            return false;
        };
        let built = ctx.taps.on_track(track_id, kind);
        if built && ctx.tap_mode.is_none() {
            ctx.tap_mode = Some(TapMode::PeerConnection);
        }
        built
    }

    pub fn graphs_built_for(&self, track_id: &str) -> u32 {
        self.state
            .lock()
            .context
            .as_ref()
            .map_or(0, |ctx| ctx.taps.graphs_built_for(track_id))
    }

    /// The page acquired the microphone.
    pub fn get_user_media(&self) -> bool {
        match self.state.lock().context.as_mut() {
            Some(ctx) => {
                ctx.mic_active = true;
                true
            }
            None => false,
        }
    }

    /// One tick of every live capture graph, each producing `samples`.
    pub fn room_audio(&self, samples: &[f32]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(ctx) = state.context.as_mut() else {
            return;
        };
        for _ in 0..ctx.graphs() {
            let chunk = float_chunk(samples);
            ctx.captured += 1;
            if ctx.relay_attached {
                if state
                    .bindings
                    .get(RELAY_BINDING)
                    .is_some_and(|tx| tx.send(chunk.into_string()).is_ok())
                {
                    ctx.relayed += 1;
                }
                continue;
            }
            if ctx.pre_relay.push(chunk) == PushOutcome::Dropped && !ctx.drop_reported {
                ctx.drop_reported = true;
                let line = serde_json::json!({
                    "level": "warn",
                    "message": "Pre-relay queue full; dropping newest captured audio",
                })
                .to_string();
                if let Some(tx) = state.bindings.get(LOG_BINDING) {
                    let _ = tx.send(line);
                }
            }
        }
    }

    /// One tick of the synthetic microphone.
    pub fn play_block(&self) -> Option<Vec<f32>> {
        let mut state = self.state.lock();
        let ctx = state.context.as_mut()?;
        let mut block = vec![0.0_f32; BLOCK_SIZE];
        match ctx.mic.process(&mut block) {
            BlockFill::Silence => ctx.blocks_silent += 1,
            BlockFill::Audio { .. } => ctx.blocks_played += 1,
        }
        Some(block)
    }

    pub fn stats(&self) -> Option<PageStats> {
        self.state.lock().context.as_ref().map(stats_of)
    }

    fn dispatch(&self, command: PageCommand) -> Result<serde_json::Value, BridgeCallFailure> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.commands.push(command.op());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BridgeCallFailure::ContextDestroyed(
                "Execution context was destroyed, most likely because of a navigation.".into(),
            ));
        }
        let Some(ctx) = state.context.as_mut() else {
            return Err(BridgeCallFailure::Evaluation(
                "ReferenceError: __voxroom is not defined".into(),
            ));
        };

        let reply = match command {
            PageCommand::EnqueuePlayback { chunks } => {
                for chunk in chunks {
                    ctx.mic.enqueue(chunk);
                }
                serde_json::json!({"queued": ctx.mic.pending()})
            }
            PageCommand::AttachRelay => {
                let hidden = state.relay_hidden > 0;
                state.relay_hidden = state.relay_hidden.saturating_sub(1);
                let bound = state.bindings.get(RELAY_BINDING).filter(|_| !hidden);
                match bound {
                    None => serde_json::json!({
                        "attached": false, "flushed": 0, "dropped": ctx.pre_relay.dropped()
                    }),
                    Some(_) if ctx.relay_attached => serde_json::json!({
                        "attached": true, "flushed": 0, "dropped": ctx.pre_relay.dropped()
                    }),
                    Some(tx) => {
                        let pending = ctx.pre_relay.drain();
                        let flushed = pending.len();
                        for chunk in pending {
                            if tx.send(chunk.into_string()).is_ok() {
                                ctx.relayed += 1;
                            }
                        }
                        ctx.relay_attached = true;
                        serde_json::json!({
                            "attached": true, "flushed": flushed, "dropped": ctx.pre_relay.dropped()
                        })
                    }
                }
            }
            PageCommand::TapElement { selector } => {
                let found = ctx.elements.iter().any(|el| el.selector == selector);
                let report = if found {
                    ctx.taps.disarm();
                    ctx.element_graphs += 1;
                    ctx.tap_mode = Some(TapMode::ElementStream);
                    ctx.report(true, &selector)
                } else {
                    ctx.report(false, "no match")
                };
                to_value(&report)?
            }
            PageCommand::TapAnyMediaElement => {
                let playing = ctx.elements.iter().find(|el| el.playing).map(|el| el.selector.clone());
                let report = match playing {
                    Some(selector) => {
                        ctx.taps.disarm();
                        ctx.element_graphs += 1;
                        ctx.tap_mode = Some(TapMode::ElementCapture);
                        ctx.report(true, &selector)
                    }
                    None => ctx.report(false, "no playing media element"),
                };
                to_value(&report)?
            }
            PageCommand::TapPeerConnections => {
                let report = if state.peer_connections {
                    ctx.taps.arm();
                    ctx.tap_mode = Some(TapMode::PeerConnection);
                    ctx.report(true, "peer connections")
                } else {
                    ctx.report(false, "peer-connection hook not installed")
                };
                to_value(&report)?
            }
            PageCommand::Stats => to_value(&stats_of(ctx))?,
            PageCommand::Cleanup => {
                ctx.taps.disarm();
                ctx.element_graphs = 0;
                ctx.tap_mode = None;
                ctx.mic.clear();
                ctx.mic_active = false;
                ctx.relay_attached = false;
                serde_json::json!({"cleaned": true})
            }
        };
        Ok(reply)
    }
}

fn stats_of(ctx: &PageContext) -> PageStats {
    PageStats {
        playback_queue: ctx.mic.pending(),
        playback_remainder: 0,
        blocks_played: ctx.blocks_played,
        blocks_silent: ctx.blocks_silent,
        undecodable: ctx.mic.undecodable(),
        mic_active: ctx.mic_active,
        pre_relay_queued: ctx.pre_relay.len(),
        pre_relay_dropped: ctx.pre_relay.dropped(),
        relay_attached: ctx.relay_attached,
        captured: ctx.captured,
        relayed: ctx.relayed,
        graphs: ctx.graphs(),
        tap_mode: ctx.tap_mode,
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, BridgeCallFailure> {
    serde_json::to_value(value).map_err(|e| BridgeCallFailure::Evaluation(e.to_string()))
}

#[async_trait]
impl PageChannel for LoopbackPage {
    async fn add_init_script(&self, source: &str) -> Result<(), BridgeCallFailure> {
        self.state.lock().init_scripts.push(source.to_string());
        Ok(())
    }

    async fn expose_binding(&self, name: &str) -> Result<BindingReceiver, BridgeCallFailure> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().bindings.insert(name.to_string(), tx);
        Ok(rx)
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BridgeCallFailure> {
        match PageCommand::from_expression(expression) {
            Some(command) => self.dispatch(command),
            None => Err(BridgeCallFailure::Evaluation(format!(
                "loopback page cannot evaluate: {expression}"
            ))),
        }
    }

    /// A fresh document: page state resets, init scripts run again.
    async fn navigate(&self, url: &str) -> Result<(), BridgeCallFailure> {
        let mut state = self.state.lock();
        state.navigations += 1;
        state.context = (!state.init_scripts.is_empty()).then(PageContext::new);
        if state.context.is_some() {
            state.log("debug", &format!("Interceptor installed at {url}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{dispatch, RelayReply};

    #[tokio::test]
    async fn commands_fail_until_installed() {
        let page = LoopbackPage::new();
        let err = dispatch::<PageStats>(&page, &PageCommand::Stats)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeCallFailure::Evaluation(_)));

        page.add_init_script("script").await.unwrap();
        page.navigate("https://office.test").await.unwrap();
        let stats: PageStats = dispatch(&page, &PageCommand::Stats).await.unwrap();
        assert_eq!(stats.graphs, 0);
    }

    #[tokio::test]
    async fn pre_relay_queue_caps_and_flushes_in_order() {
        let page = LoopbackPage::new();
        page.add_init_script("script").await.unwrap();
        page.navigate("https://office.test").await.unwrap();
        assert!(page.add_remote_track("t1", TrackKind::Audio));

        for i in 0..=PRE_RELAY_CAPACITY {
            page.room_audio(&[i as f32 / 1024.0]);
        }
        let stats = page.stats().unwrap();
        assert_eq!(stats.pre_relay_queued, PRE_RELAY_CAPACITY);
        assert_eq!(stats.pre_relay_dropped, 1);

        let mut relay = page.expose_binding(RELAY_BINDING).await.unwrap();
        let reply: RelayReply = dispatch(&page, &PageCommand::AttachRelay).await.unwrap();
        assert_eq!(reply.flushed, PRE_RELAY_CAPACITY);

        let first = AudioChunk::from_base64_unchecked(relay.recv().await.unwrap());
        assert_eq!(first, float_chunk(&[0.0]));
        let second = AudioChunk::from_base64_unchecked(relay.recv().await.unwrap());
        assert_eq!(second, float_chunk(&[1.0 / 1024.0]));
    }

    #[tokio::test]
    async fn element_tap_replaces_peer_connection_graphs() {
        let page = LoopbackPage::new();
        page.add_init_script("script").await.unwrap();
        page.navigate("https://office.test").await.unwrap();
        page.add_remote_track("t1", TrackKind::Audio);
        page.add_media_element("audio#remote-audio", true);

        let report: TapReport = dispatch(
            &page,
            &PageCommand::TapElement {
                selector: "audio#remote-audio".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(report.mode, Some(TapMode::ElementStream));
        assert_eq!(report.graphs, 1);
        assert!(!page.add_remote_track("t2", TrackKind::Audio));
    }

    #[tokio::test]
    async fn navigation_resets_page_state() {
        let page = LoopbackPage::new();
        page.add_init_script("script").await.unwrap();
        page.navigate("https://a.test").await.unwrap();
        dispatch::<serde_json::Value>(
            &page,
            &PageCommand::EnqueuePlayback {
                chunks: vec![AudioChunk::silence(8)],
            },
        )
        .await
        .unwrap();
        assert_eq!(page.stats().unwrap().playback_queue, 1);

        page.navigate("https://b.test").await.unwrap();
        assert_eq!(page.stats().unwrap().playback_queue, 0);
    }
}
