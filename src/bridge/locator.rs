//! Finding the room's inbound audio.
//!
//! Strategies are tried in order, each under its own timeout: the configured
//! selector, then any playing media element, then the peer-connection tap.
//! The first one that attaches wins.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::interceptor::{dispatch, PageCommand, TapReport};
use crate::page::PageChannel;

/// Pause between attempts while a strategy waits for its element.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One way of attaching the inbound tap.
#[async_trait]
pub trait AudioLocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attach, waiting as long as needed; the caller bounds the wait.
    /// `Err` means this strategy cannot work on this page at all.
    async fn attach(&self, page: &dyn PageChannel) -> Result<TapReport, String>;
}

/// Send `command` until the page reports the tap attached.
async fn poll_until_attached(
    page: &dyn PageChannel,
    command: &PageCommand,
) -> Result<TapReport, String> {
    loop {
        match dispatch::<TapReport>(page, command).await {
            Ok(report) if report.attached => return Ok(report),
            Ok(report) => {
                tracing::trace!(op = command.op(), detail = ?report.detail, "Tap not attached yet");
            }
            Err(e) if e.is_context_destroyed() => {
                tracing::debug!(op = command.op(), "Page navigating; probing again");
            }
            Err(e) => return Err(e.to_string()),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// The configured media element.
pub struct SelectorLocator {
    selector: String,
}

impl SelectorLocator {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl AudioLocator for SelectorLocator {
    fn name(&self) -> &'static str {
        "selector"
    }

    async fn attach(&self, page: &dyn PageChannel) -> Result<TapReport, String> {
        poll_until_attached(
            page,
            &PageCommand::TapElement {
                selector: self.selector.clone(),
            },
        )
        .await
    }
}

/// Whatever `<audio>`/`<video>` element is playing.
pub struct MediaElementLocator;

#[async_trait]
impl AudioLocator for MediaElementLocator {
    fn name(&self) -> &'static str {
        "media_element"
    }

    async fn attach(&self, page: &dyn PageChannel) -> Result<TapReport, String> {
        poll_until_attached(page, &PageCommand::TapAnyMediaElement).await
    }
}

/// Remote audio tracks of every peer connection the page opens.
pub struct PeerConnectionLocator;

#[async_trait]
impl AudioLocator for PeerConnectionLocator {
    fn name(&self) -> &'static str {
        "peer_connection"
    }

    async fn attach(&self, page: &dyn PageChannel) -> Result<TapReport, String> {
        loop {
            match dispatch::<TapReport>(page, &PageCommand::TapPeerConnections).await {
                Ok(report) if report.attached => return Ok(report),
                Ok(report) => {
                    return Err(report
                        .detail
                        .unwrap_or_else(|| "peer-connection tap refused".into()))
                }
                Err(e) if e.is_context_destroyed() => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}

/// Strategies in the order they are tried.
pub fn default_chain(selector: Option<&str>) -> Vec<Box<dyn AudioLocator>> {
    let mut chain: Vec<Box<dyn AudioLocator>> = Vec::new();
    if let Some(selector) = selector.filter(|s| !s.trim().is_empty()) {
        chain.push(Box::new(SelectorLocator::new(selector)));
    }
    chain.push(Box::new(MediaElementLocator));
    chain.push(Box::new(PeerConnectionLocator));
    chain
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorAttempt {
    pub locator: &'static str,
    pub outcome: String,
}

/// No strategy could attach the inbound tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSetupError {
    pub attempts: Vec<LocatorAttempt>,
}

impl std::error::Error for CaptureSetupError {}

impl fmt::Display for CaptureSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no inbound audio source found")?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{} {}", attempt.locator, attempt.outcome)?;
        }
        Ok(())
    }
}

/// Run the chain, giving each strategy `per_strategy` to attach.
pub async fn locate(
    page: &dyn PageChannel,
    chain: &[Box<dyn AudioLocator>],
    per_strategy: Duration,
) -> Result<TapReport, CaptureSetupError> {
    let mut attempts = Vec::with_capacity(chain.len());
    for locator in chain {
        let outcome = match tokio::time::timeout(per_strategy, locator.attach(page)).await {
            Ok(Ok(report)) => {
                tracing::info!(
                    locator = locator.name(),
                    mode = report.mode.map_or("-", |m| m.as_str()),
                    graphs = report.graphs,
                    detail = report.detail.as_deref().unwrap_or(""),
                    "Inbound audio tap attached"
                );
                return Ok(report);
            }
            Ok(Err(reason)) => reason,
            Err(_) => format!("timed out after {}ms", per_strategy.as_millis()),
        };
        tracing::debug!(locator = locator.name(), outcome = %outcome, "Audio locator missed");
        attempts.push(LocatorAttempt {
            locator: locator.name(),
            outcome,
        });
    }
    Err(CaptureSetupError { attempts })
}
