//! Chromium over the DevTools protocol.
//!
//! Init scripts use `Page.addScriptToEvaluateOnNewDocument`; bindings use
//! `Runtime.addBinding`, whose calls arrive as `Runtime.bindingCalled` events
//! and are fanned out to one receiver per binding name.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BindingReceiver, BridgeCallFailure, PageChannel};
use crate::config::BrowserSettings;

/// Grants media permissions without a prompt.
const FAKE_MEDIA_UI_FLAG: &str = "--use-fake-ui-for-media-stream";

/// Lets audio contexts start without a user gesture.
const AUTOPLAY_FLAG: &str = "--autoplay-policy=no-user-gesture-required";

/// A launched browser with the single page the bridge works in.
pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Arc<CdpPage>,
}

impl BrowserSession {
    pub async fn launch(settings: &BrowserSettings) -> anyhow::Result<Self> {
        let mut builder = BrowserConfig::builder()
            .arg(FAKE_MEDIA_UI_FLAG)
            .arg(AUTOPLAY_FLAG);
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &settings.executable {
            builder = builder.chrome_executable(executable);
        }
        if let Some(dir) = &settings.user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Invalid browser configuration: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;

        // The handler must be polled for any CDP traffic to flow.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "CDP handler error");
                }
            }
            tracing::debug!("CDP handler finished");
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open browser page")?;
        tracing::info!(headless = settings.headless, "Browser launched");

        Ok(Self {
            browser,
            handler,
            page: Arc::new(CdpPage::new(page)),
        })
    }

    pub fn page(&self) -> Arc<CdpPage> {
        Arc::clone(&self.page)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::warn!(error = %e, "Browser close failed");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
        tracing::info!("Browser closed");
    }
}

/// [`PageChannel`] over a chromiumoxide page.
#[derive(Clone)]
pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

fn classify(err: CdpError) -> BridgeCallFailure {
    match err {
        CdpError::JavascriptException(details) => {
            let message = details
                .exception
                .as_ref()
                .and_then(|e| e.description.clone())
                .unwrap_or_else(|| details.text.clone());
            BridgeCallFailure::from_evaluation_message(message)
        }
        other => BridgeCallFailure::from_transport_message(other.to_string()),
    }
}

#[async_trait]
impl PageChannel for CdpPage {
    async fn add_init_script(&self, source: &str) -> Result<(), BridgeCallFailure> {
        self.page
            .evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(source))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn expose_binding(&self, name: &str) -> Result<BindingReceiver, BridgeCallFailure> {
        // Listen first so no call between the two requests is missed.
        let mut events = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(classify)?;
        self.page
            .execute(AddBindingParams::new(name))
            .await
            .map_err(classify)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.name != name {
                    continue;
                }
                if tx.send(event.payload.clone()).is_err() {
                    break;
                }
            }
            tracing::debug!(binding = %name, "Binding listener finished");
        });
        Ok(rx)
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BridgeCallFailure> {
        let result = self.page.evaluate(expression).await.map_err(classify)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn navigate(&self, url: &str) -> Result<(), BridgeCallFailure> {
        self.page.goto(url).await.map_err(classify)?;
        Ok(())
    }
}
