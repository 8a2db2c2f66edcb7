//! The execution-context boundary between the process and the browser page.
//!
//! Everything crossing it is a string or JSON value. Calls are asynchronous
//! round trips that fail while the page is mid-navigation; callers treat
//! [`BridgeCallFailure::ContextDestroyed`] as "try again later".

pub mod cdp;

#[cfg(test)]
pub(crate) mod loopback;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use cdp::{BrowserSession, CdpPage};

/// Payloads the page passes to an exposed binding, in call order.
pub type BindingReceiver = mpsc::UnboundedReceiver<String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeCallFailure {
    /// The page navigated or reloaded while the call was in flight.
    #[error("execution context destroyed: {0}")]
    ContextDestroyed(String),

    /// The expression threw or returned something unusable.
    #[error("page evaluation failed: {0}")]
    Evaluation(String),

    /// The browser connection itself failed.
    #[error("page transport failed: {0}")]
    Transport(String),
}

const CONTEXT_GONE_MARKERS: &[&str] = &[
    "Execution context was destroyed",
    "Cannot find context with specified id",
    "Inspected target navigated or closed",
    "Cannot find default execution context",
];

impl BridgeCallFailure {
    pub fn is_context_destroyed(&self) -> bool {
        matches!(self, Self::ContextDestroyed(_))
    }

    /// Classify an evaluation error message from the browser.
    pub fn from_evaluation_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if CONTEXT_GONE_MARKERS.iter().any(|m| message.contains(m)) {
            Self::ContextDestroyed(message)
        } else {
            Self::Evaluation(message)
        }
    }

    /// Classify a transport-level error message from the browser.
    pub fn from_transport_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if CONTEXT_GONE_MARKERS.iter().any(|m| message.contains(m)) {
            Self::ContextDestroyed(message)
        } else {
            Self::Transport(message)
        }
    }
}

/// What the bridge and driver need from a browser page.
#[async_trait]
pub trait PageChannel: Send + Sync {
    /// Register a script that runs in every new document before page code.
    async fn add_init_script(&self, source: &str) -> Result<(), BridgeCallFailure>;

    /// Make `window[name](payload)` deliver `payload` to the returned
    /// receiver. Survives navigations.
    async fn expose_binding(&self, name: &str) -> Result<BindingReceiver, BridgeCallFailure>;

    /// Evaluate an expression and return its JSON value (`null` for
    /// `undefined`). Promises are awaited.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BridgeCallFailure>;

    /// Load `url` and wait for the navigation to finish.
    async fn navigate(&self, url: &str) -> Result<(), BridgeCallFailure>;
}
