//! Session driver: gets the browser from a blank page into the room.
//!
//! Best-effort form login. Selectors come from config; there is no attempt
//! to understand any particular office's markup.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use crate::config::OfficeSettings;
use crate::page::{BridgeCallFailure, PageChannel};

/// Pause between selector checks.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Drives a page through whatever the office needs before audio can flow.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Navigate, authenticate and enter the room.
    async fn enter(&self, page: &dyn PageChannel) -> anyhow::Result<()>;
}

/// Email + password form, then an optional microphone toggle.
pub struct FormLoginDriver {
    settings: OfficeSettings,
}

impl FormLoginDriver {
    pub fn new(settings: OfficeSettings) -> Self {
        Self { settings }
    }

    async fn login(&self, page: &dyn PageChannel) -> anyhow::Result<()> {
        let s = &self.settings;
        let timeout = s.element_timeout();

        wait_for(page, &s.email_selector, timeout).await?;
        fill(page, &s.email_selector, &s.email)
            .await
            .context("Failed to fill the email field")?;

        wait_for(page, &s.password_selector, timeout).await?;
        fill(page, &s.password_selector, &s.password)
            .await
            .context("Failed to fill the password field")?;

        click(page, &s.submit_selector, timeout)
            .await
            .context("Failed to submit the login form")?;
        tracing::info!(email = %s.email, "Login submitted");
        Ok(())
    }
}

#[async_trait]
impl SessionDriver for FormLoginDriver {
    fn name(&self) -> &str {
        "form_login"
    }

    async fn enter(&self, page: &dyn PageChannel) -> anyhow::Result<()> {
        let s = &self.settings;
        page.navigate(&s.url)
            .await
            .with_context(|| format!("Failed to open {}", s.url))?;
        tracing::info!(url = %s.url, "Office page loaded");

        if s.email.is_empty() {
            // Reused browser profile: assume the session is still signed in.
            tracing::info!("No office credentials configured; skipping login form");
        } else {
            self.login(page).await?;
        }

        if let Some(mic) = s.mic_button_selector.as_deref() {
            // The submit usually navigates; the button lives on the next page.
            click(page, mic, s.element_timeout())
                .await
                .context("Failed to switch the microphone on")?;
            tracing::info!(selector = mic, "Microphone switched on");
        }
        Ok(())
    }
}

fn selector_literal(selector: &str) -> anyhow::Result<String> {
    serde_json::to_string(selector).context("Failed to encode selector")
}

pub(crate) fn exists_expression(selector: &str) -> anyhow::Result<String> {
    Ok(format!(
        "document.querySelector({}) !== null",
        selector_literal(selector)?
    ))
}

/// Sets the value through the native setter so framework-controlled inputs
/// notice the change.
pub(crate) fn fill_expression(selector: &str, value: &str) -> anyhow::Result<String> {
    let value = serde_json::to_string(value).context("Failed to encode value")?;
    Ok(format!(
        r#"(() => {{
  const el = document.querySelector({selector});
  if (!el) return false;
  const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  const desc = Object.getOwnPropertyDescriptor(proto, "value");
  if (desc && desc.set) desc.set.call(el, {value}); else el.value = {value};
  el.dispatchEvent(new Event("input", {{ bubbles: true }}));
  el.dispatchEvent(new Event("change", {{ bubbles: true }}));
  return true;
}})()"#,
        selector = selector_literal(selector)?,
    ))
}

pub(crate) fn click_expression(selector: &str) -> anyhow::Result<String> {
    Ok(format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
        selector_literal(selector)?
    ))
}

/// Evaluate a boolean expression, treating a navigating page as `false`.
async fn check(page: &dyn PageChannel, expression: &str) -> anyhow::Result<bool> {
    match page.evaluate(expression).await {
        Ok(value) => Ok(value.as_bool().unwrap_or(false)),
        Err(BridgeCallFailure::ContextDestroyed(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Poll until `selector` matches an element.
async fn wait_for(page: &dyn PageChannel, selector: &str, timeout: Duration) -> anyhow::Result<()> {
    let expression = exists_expression(selector)?;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check(page, &expression).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "Timed out after {}ms waiting for {selector}",
                timeout.as_millis()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn fill(page: &dyn PageChannel, selector: &str, value: &str) -> anyhow::Result<()> {
    if !check(page, &fill_expression(selector, value)?).await? {
        anyhow::bail!("Element {selector} disappeared before it could be filled");
    }
    Ok(())
}

/// Wait for `selector`, then click it.
async fn click(page: &dyn PageChannel, selector: &str, timeout: Duration) -> anyhow::Result<()> {
    let expression = click_expression(selector)?;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check(page, &expression).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "Timed out after {}ms waiting to click {selector}",
                timeout.as_millis()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
