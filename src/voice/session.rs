//! WebSocket session engine shared by the provider clients.
//!
//! ## Lifecycle
//!
//! 1. **Connect**: open the socket, send the provider setup message,
//!    state `Connecting`
//! 2. **Ready**: the provider's ready message flips the state; held audio
//!    (if the outage policy buffers) is flushed in order
//! 3. **Stream**: `send_audio` frames go through an unbounded outbound
//!    channel drained by a writer task; a reader task parses inbound frames
//!    and publishes [`VoiceEvent`]s
//! 4. **Drop**: an unexpected close moves back to `Disconnected`; providers
//!    that reconnect schedule a full reconnect with linear backoff
//! 5. **Close**: caller-initiated, terminal, cancels pending reconnects

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::{
    EventHub, EventSubscription, OutagePolicy, ReconnectPolicy, SessionState,
    StreamingVoiceClient, VoiceError, VoiceEvent,
};
use crate::audio::{pcm_mime_type, AudioChunk, BoundedFifo, PushOutcome};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Provider framing plugged into [`RealtimeClient`].
pub trait Protocol: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    /// Handshake request (URL plus auth headers).
    fn request(&self) -> Result<Request, VoiceError>;

    /// First frame after the socket opens.
    fn setup_message(&self) -> Result<String, VoiceError>;

    fn audio_message(&self, chunk: &AudioChunk, mime_hint: Option<&str>) -> String;

    /// Frames that make the model speak first. Empty when the provider
    /// answers detected speech on its own.
    fn start_conversation_messages(&self) -> Vec<String>;

    fn end_turn_messages(&self) -> Vec<String>;

    /// Parse one inbound JSON frame. `Err` means malformed: the frame is
    /// logged and discarded, the connection stays up.
    fn parse_server_message(&self, text: &str) -> Result<Vec<VoiceEvent>, serde_json::Error>;

    fn reconnects_on_drop(&self) -> bool;

    fn input_sample_rate(&self) -> u32;

    fn output_sample_rate(&self) -> u32;

    fn input_mime_type(&self) -> String {
        pcm_mime_type(self.input_sample_rate())
    }
}

/// Append `key=value` to a WebSocket endpoint. An endpoint without a path
/// gets `/` so the handshake request line stays valid.
pub(crate) fn endpoint_with_query(endpoint: &str, key: &str, value: &str) -> String {
    let endpoint = endpoint.trim_end();
    let authority_start = endpoint.find("://").map_or(0, |i| i + 3);
    let rest = &endpoint[authority_start..];
    let path_missing = !rest.contains('/') && !rest.contains('?');
    let mut url = endpoint.to_string();
    if path_missing {
        url.push('/');
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    url.push(sep);
    url.push_str(key);
    url.push('=');
    url.push_str(value);
    url
}

/// A streaming voice client for protocol `P`.
pub struct RealtimeClient<P: Protocol> {
    inner: Arc<Inner<P>>,
}

struct Inner<P: Protocol> {
    protocol: P,
    session_id: String,
    reconnect: ReconnectPolicy,
    outage: OutagePolicy,
    state: watch::Sender<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    held: Mutex<BoundedFifo<(AudioChunk, Option<String>)>>,
    hub: EventHub,
    closed: AtomicBool,
    cancel: CancellationToken,
    connect_lock: tokio::sync::Mutex<()>,
    /// Bumped per opened socket so stale reader tasks are ignored.
    generation: AtomicU64,
    /// Consecutive reconnect attempts since the last `Ready`.
    reconnect_attempt: AtomicU32,
    connection_attempts: AtomicU64,
    audio_sent: AtomicU64,
    audio_refused: AtomicU64,
    audio_received: AtomicU64,
}

impl<P: Protocol> RealtimeClient<P> {
    pub fn new(
        protocol: P,
        reconnect: ReconnectPolicy,
        outage: OutagePolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let session_id = uuid::Uuid::new_v4().to_string();
        Self {
            inner: Arc::new(Inner {
                protocol,
                session_id,
                reconnect,
                outage,
                state,
                outbound: Mutex::new(None),
                held: Mutex::new(BoundedFifo::new(outage.capacity())),
                hub: EventHub::new(),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                connect_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                reconnect_attempt: AtomicU32::new(0),
                connection_attempts: AtomicU64::new(0),
                audio_sent: AtomicU64::new(0),
                audio_refused: AtomicU64::new(0),
                audio_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn protocol(&self) -> &P {
        &self.inner.protocol
    }

    /// Sockets opened so far, including reconnects.
    pub fn connection_attempts(&self) -> u64 {
        self.inner.connection_attempts.load(Ordering::SeqCst)
    }

    /// Chunks actually handed to the socket writer.
    pub fn audio_sent(&self) -> u64 {
        self.inner.audio_sent.load(Ordering::SeqCst)
    }
}

impl<P: Protocol> Inner<P> {
    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                session_id = %self.session_id,
                provider = self.protocol.label(),
                from = previous.as_str(),
                to = next.as_str(),
                "Voice session state change"
            );
        }
    }

    fn push_frame(&self, frame: String) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(WsMessage::text(frame)).is_ok(),
            None => false,
        }
    }

    /// Open the socket and send setup. Caller holds `connect_lock`.
    async fn open(inner: &Arc<Self>) -> Result<(), VoiceError> {
        inner.set_state(SessionState::Connecting);
        let attempt = inner.connection_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let prepared = inner
            .protocol
            .request()
            .and_then(|request| Ok((request, inner.protocol.setup_message()?)));
        let (request, setup) = match prepared {
            Ok(v) => v,
            Err(e) => {
                inner.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };

        tracing::info!(
            session_id = %inner.session_id,
            provider = inner.protocol.label(),
            attempt,
            "Connecting to voice provider"
        );

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                inner.set_state(SessionState::Disconnected);
                return Err(VoiceError::Connection(format!(
                    "failed to connect to {}: {e}",
                    inner.protocol.label()
                )));
            }
        };

        if inner.closed.load(Ordering::SeqCst) {
            drop(ws_stream);
            inner.set_state(SessionState::Closed);
            return Err(VoiceError::Closed);
        }

        let (mut ws_sender, ws_receiver) = ws_stream.split();
        tracing::debug!(session_id = %inner.session_id, setup = %setup, "Sending setup message");
        if let Err(e) = ws_sender.send(WsMessage::text(setup)).await {
            inner.set_state(SessionState::Disconnected);
            return Err(VoiceError::Connection(format!(
                "failed to send setup message: {e}"
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.outbound.lock() = Some(outbound_tx);

        let sid_out = inner.session_id.clone();
        tokio::spawn(async move {
            Self::outbound_loop(outbound_rx, ws_sender, sid_out).await;
        });

        let inner_in = Arc::clone(inner);
        tokio::spawn(async move {
            Self::inbound_loop(inner_in, generation, ws_receiver).await;
        });

        Ok(())
    }

    // ── Internal loops ────────────────────────────────────────────

    /// Outbound loop: forward queued frames to the socket.
    async fn outbound_loop(
        mut rx: mpsc::UnboundedReceiver<WsMessage>,
        mut ws_sender: SplitSink<WsStream, WsMessage>,
        session_id: String,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, WsMessage::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "WebSocket send failed, closing outbound loop"
                );
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = ws_sender.close().await;
        tracing::debug!(session_id = %session_id, "Outbound loop terminated");
    }

    /// Inbound loop: parse frames and publish events until the socket ends.
    async fn inbound_loop(
        inner: Arc<Self>,
        generation: u64,
        mut ws_receiver: SplitStream<WsStream>,
    ) {
        let reason = loop {
            let next = tokio::select! {
                () = inner.cancel.cancelled() => break "cancelled".to_string(),
                next = ws_receiver.next() => next,
            };
            match next {
                None => break "stream ended".to_string(),
                Some(Ok(WsMessage::Text(text))) => inner.handle_text(text.as_str()),
                Some(Ok(WsMessage::Binary(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    // Gemini Live sends JSON in Binary frames.
                    if data.first() == Some(&b'{') {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            inner.handle_text(text);
                            continue;
                        }
                    }
                    tracing::warn!(
                        session_id = %inner.session_id,
                        len = data.len(),
                        "Unexpected non-JSON binary frame, skipping"
                    );
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    break format!("closed by provider: {frame:?}");
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                    // Handled by tungstenite automatically
                }
                Some(Err(e)) => break format!("websocket error: {e}"),
            }
        };

        tracing::debug!(session_id = %inner.session_id, reason = %reason, "Inbound loop terminated");
        Self::on_transport_closed(&inner, generation, &reason);
    }

    fn handle_text(&self, text: &str) {
        let events = match self.protocol.parse_server_message(text) {
            Ok(events) => events,
            Err(e) => {
                let preview: String = text.chars().take(120).collect();
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    preview = %preview,
                    "Discarding malformed provider message"
                );
                return;
            }
        };

        for event in events {
            match &event {
                VoiceEvent::SetupComplete => self.mark_ready(),
                VoiceEvent::Audio(chunk) => {
                    let n = self.audio_received.fetch_add(1, Ordering::Relaxed) + 1;
                    if n == 1 || n.is_multiple_of(50) {
                        tracing::info!(
                            session_id = %self.session_id,
                            audio_n = n,
                            samples = chunk.sample_count(),
                            "⬇ Provider audio"
                        );
                    }
                }
                VoiceEvent::Error { code, message } => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        provider = self.protocol.label(),
                        code = code.as_deref().unwrap_or("-"),
                        error = %message,
                        "Provider reported an error"
                    );
                }
                _ => {}
            }
            self.hub.publish(event);
        }
    }

    fn mark_ready(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.current_state() != SessionState::Ready {
            tracing::info!(
                session_id = %self.session_id,
                provider = self.protocol.label(),
                "Voice session ready; streaming audio"
            );
        }
        self.set_state(SessionState::Ready);
        self.reconnect_attempt.store(0, Ordering::SeqCst);

        let held = self.held.lock().drain();
        if !held.is_empty() {
            tracing::info!(
                session_id = %self.session_id,
                chunks = held.len(),
                "Flushing audio held while not ready"
            );
        }
        for (chunk, mime) in held {
            if self.push_frame(self.protocol.audio_message(&chunk, mime.as_deref())) {
                self.audio_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_transport_closed(inner: &Arc<Self>, generation: u64, reason: &str) {
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        inner.outbound.lock().take();

        if inner.closed.load(Ordering::SeqCst) {
            inner.set_state(SessionState::Closed);
            return;
        }

        tracing::warn!(
            session_id = %inner.session_id,
            provider = inner.protocol.label(),
            reason = %reason,
            "Voice provider connection lost"
        );
        inner.set_state(SessionState::Disconnected);
        inner.hub.publish(VoiceEvent::Disconnected { intentional: false });
        inner.hub.publish(VoiceEvent::Error {
            code: Some("connection_lost".into()),
            message: reason.to_string(),
        });

        if inner.protocol.reconnects_on_drop() {
            tokio::spawn(Self::reconnect_loop(Arc::clone(inner)));
        }
    }

    /// Retry until a socket opens or the client is closed. Boxed so the
    /// open -> inbound loop -> reconnect cycle has a nameable future type.
    fn reconnect_loop(inner: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            loop {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let attempt = inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = inner.reconnect.delay_for(attempt);
                tracing::info!(
                    session_id = %inner.session_id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling voice provider reconnect"
                );

                tokio::select! {
                    () = inner.cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }

                let _guard = inner.connect_lock.lock().await;
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                if matches!(
                    inner.current_state(),
                    SessionState::Connecting | SessionState::Ready
                ) {
                    return;
                }
                match Self::open(&inner).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(
                            session_id = %inner.session_id,
                            attempt,
                            error = %e,
                            "Reconnect attempt failed"
                        );
                        inner.hub.publish(VoiceEvent::Error {
                            code: Some("reconnect_failed".into()),
                            message: e.to_string(),
                        });
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<P: Protocol> StreamingVoiceClient for RealtimeClient<P> {
    async fn connect(&self) -> Result<(), VoiceError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Closed);
        }
        let _guard = self.inner.connect_lock.lock().await;
        if matches!(
            self.inner.current_state(),
            SessionState::Connecting | SessionState::Ready
        ) {
            return Ok(());
        }
        Inner::open(&self.inner).await
    }

    async fn start_conversation(&self) -> Result<(), VoiceError> {
        let frames = self.inner.protocol.start_conversation_messages();
        if frames.is_empty() {
            tracing::debug!(
                session_id = %self.inner.session_id,
                provider = self.inner.protocol.label(),
                "Provider responds to detected speech; nothing to send"
            );
            return Ok(());
        }
        if !self.is_connected() {
            return Err(VoiceError::NotReady);
        }
        for frame in frames {
            if !self.inner.push_frame(frame) {
                return Err(VoiceError::ChannelClosed);
            }
        }
        tracing::info!(session_id = %self.inner.session_id, "Conversation started");
        Ok(())
    }

    fn send_audio(&self, chunk: &AudioChunk, mime_hint: Option<&str>) {
        if chunk.is_empty() {
            return;
        }
        let inner = &self.inner;
        let state = inner.current_state();

        if state != SessionState::Ready {
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let held = match inner.outage {
                OutagePolicy::Drop => false,
                OutagePolicy::Buffer(_) => {
                    inner
                        .held
                        .lock()
                        .push((chunk.clone(), mime_hint.map(str::to_string)))
                        == PushOutcome::Queued
                }
            };
            let refused = inner.audio_refused.fetch_add(1, Ordering::Relaxed) + 1;
            if refused == 1 || refused.is_multiple_of(50) {
                tracing::warn!(
                    session_id = %inner.session_id,
                    state = state.as_str(),
                    held,
                    refused,
                    "Voice session not ready; audio chunk not sent"
                );
            }
            return;
        }

        let frame = inner.protocol.audio_message(chunk, mime_hint);
        if !inner.push_frame(frame) {
            tracing::warn!(session_id = %inner.session_id, "Outbound channel closed; audio chunk dropped");
            return;
        }
        let n = inner.audio_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n.is_multiple_of(50) {
            tracing::info!(
                session_id = %inner.session_id,
                chunk = n,
                samples = chunk.sample_count(),
                "Sending audio chunk to provider"
            );
        }
    }

    async fn end_turn(&self) -> Result<(), VoiceError> {
        if !self.is_connected() {
            return Err(VoiceError::NotReady);
        }
        for frame in self.inner.protocol.end_turn_messages() {
            if !self.inner.push_frame(frame) {
                return Err(VoiceError::ChannelClosed);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> EventSubscription {
        self.inner.hub.subscribe()
    }

    fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<(), VoiceError> {
        let mut rx = self.inner.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed)),
        )
        .await;
        match waited {
            Ok(Ok(state)) if *state == SessionState::Ready => Ok(()),
            Ok(_) => Err(VoiceError::Closed),
            Err(_) => Err(VoiceError::NotReady),
        }
    }

    async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.set_state(SessionState::Closing);
        inner.cancel.cancel();
        if let Some(tx) = inner.outbound.lock().take() {
            let _ = tx.send(WsMessage::Close(None));
        }
        inner.held.lock().drain();
        inner.set_state(SessionState::Closed);
        inner.hub.publish(VoiceEvent::Disconnected { intentional: true });
        tracing::info!(
            session_id = %inner.session_id,
            provider = inner.protocol.label(),
            sent = inner.audio_sent.load(Ordering::Relaxed),
            received = inner.audio_received.load(Ordering::Relaxed),
            "Voice session closed"
        );
    }

    fn preferred_sample_rate(&self) -> u32 {
        self.inner.protocol.input_sample_rate()
    }

    fn output_sample_rate(&self) -> u32 {
        self.inner.protocol.output_sample_rate()
    }

    fn preferred_input_mime_type(&self) -> String {
        self.inner.protocol.input_mime_type()
    }

    fn provider_label(&self) -> &'static str {
        self.inner.protocol.label()
    }
}
