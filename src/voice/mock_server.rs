//! In-process WebSocket server standing in for a voice provider in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Keep every connection open; frames pushed with [`MockServer::push`]
    /// go to the most recent connection.
    Scripted,
    /// Read the setup frame, then close the socket.
    CloseAfterSetup,
}

pub(crate) struct MockServer {
    pub url: String,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    push_tx: mpsc::UnboundedSender<String>,
}

impl MockServer {
    pub async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (push_tx, push_rx) = mpsc::unbounded_channel::<String>();
        let push_rx = Arc::new(tokio::sync::Mutex::new(push_rx));

        let conns = Arc::clone(&connections);
        let recv = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                conns.fetch_add(1, Ordering::SeqCst);
                let recv = Arc::clone(&recv);
                let push_rx = Arc::clone(&push_rx);
                tokio::spawn(async move {
                    let (mut sink, mut stream) = ws.split();
                    if mode == Mode::CloseAfterSetup {
                        if let Some(Ok(WsMessage::Text(text))) = stream.next().await {
                            recv.lock().push(text.as_str().to_string());
                        }
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return;
                    }
                    tokio::spawn(async move {
                        let mut rx = push_rx.lock().await;
                        while let Some(frame) = rx.recv().await {
                            if sink.send(WsMessage::text(frame)).await.is_err() {
                                break;
                            }
                        }
                    });
                    while let Some(Ok(msg)) = stream.next().await {
                        if let WsMessage::Text(text) = msg {
                            recv.lock().push(text.as_str().to_string());
                        }
                    }
                });
            }
        });

        Self {
            url,
            connections,
            received,
            push_tx,
        }
    }

    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.push_tx.send(frame.into());
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    pub fn received_json(&self) -> Vec<serde_json::Value> {
        self.received()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    /// Poll until `pred` holds or two seconds pass.
    pub async fn wait_until(&self, pred: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..200 {
            if pred(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pred(self)
    }
}
