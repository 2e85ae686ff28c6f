//! Browser capability seam and its chromiumoxide implementation.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::page::{Page, ScreenshotParams};
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use gazette_adapters::{normalize_text, ElementTarget};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("{action} timed out after {after:?}")]
    Timeout { action: String, after: Duration },
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
}

/// What the crawl handlers need from a browser. One session drives one page.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError>;
    async fn read_dom(&mut self) -> Result<String, BrowserError>;
    async fn click(&mut self, target: &ElementTarget) -> Result<(), BrowserError>;
    /// Replaces the value of the input matching `selector`.
    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError>;
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError>;
    async fn current_url(&mut self) -> Result<String, BrowserError>;
    async fn title(&mut self) -> Result<Option<String>, BrowserError>;
    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub request_timeout: Duration,
    pub window_size: (u32, u32),
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            request_timeout: Duration::from_secs(20),
            window_size: (1600, 1200),
        }
    }
}

fn protocol(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

/// Chromium driven over CDP. The event handler task is aborted on drop.
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

impl ChromiumSession {
    pub async fn launch(options: &BrowserOptions) -> Result<Self, BrowserError> {
        let (width, height) = options.window_size;
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(options.request_timeout)
            .window_size(width, height)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        info!(headless = options.headless, "launching chromium");
        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser event error");
                }
            }
        });

        let page = browser.new_page("about:blank").await.map_err(protocol)?;
        Ok(Self {
            browser,
            page,
            handler,
        })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.page.goto(url).await.map_err(protocol)?;
        Ok(())
    }

    async fn read_dom(&mut self) -> Result<String, BrowserError> {
        self.page.content().await.map_err(protocol)
    }

    async fn click(&mut self, target: &ElementTarget) -> Result<(), BrowserError> {
        let elements = self
            .page
            .find_elements(target.selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(target.to_string()))?;

        let needle = target.text_contains.map(normalize_text);
        for element in elements {
            if let Some(needle) = &needle {
                let text = element.inner_text().await.map_err(protocol)?.unwrap_or_default();
                if !normalize_text(&text).contains(needle.as_str()) {
                    continue;
                }
            }
            element.click().await.map_err(protocol)?;
            return Ok(());
        }
        Err(BrowserError::ElementNotFound(target.to_string()))
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))?;
        let script = format!(
            "(() => {{ const el = document.querySelector({selector}); el.focus(); el.value = {value}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); }})()",
            selector = serde_json::to_string(selector).map_err(protocol)?,
            value = serde_json::to_string(value).map_err(protocol)?,
        );
        self.page.evaluate(script).await.map_err(protocol)?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(found) = self.page.find_elements(selector).await {
                if !found.is_empty() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    action: format!("waiting for {selector}"),
                    after: timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        Ok(self.page.url().await.map_err(protocol)?.unwrap_or_default())
    }

    async fn title(&mut self) -> Result<Option<String>, BrowserError> {
        self.page.get_title().await.map_err(protocol)
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        let params = ScreenshotParams::builder().full_page(true).build();
        self.page.screenshot(params).await.map_err(protocol)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.browser.close().await.map_err(protocol)?;
        if let Err(err) = self.browser.wait().await {
            warn!(error = %err, "chromium did not exit cleanly");
        }
        self.handler.abort();
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}
