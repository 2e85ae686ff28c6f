//! In-process browser that replays captured pages, so the state machine can
//! be driven against fixtures without Chromium.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use gazette_adapters::{page_title, selector_present, CalendarAdapter, CalendarLayout, CookieLayout, ElementTarget};
use gazette_core::YearMonth;

use crate::browser::{BrowserError, BrowserSession};

const BLANK_PAGE: &str = "<html><head></head><body></body></html>";
const COOKIE_BANNER: &str = r#"<div id="ppms_cm_popup" class="ppms_cm_popup_overlay"><p>Utilitzem galetes pròpies i de tercers.</p><button id="ppms_cm_agree-to-all" class="ppms_cm_btn">Acceptar totes</button><button id="ppms_cm_reject-all">Rebutjar</button></div>"#;
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Current {
    Blank,
    Calendar,
    Page(String),
}

/// Scripted site: an optional calendar home page whose calendar starts at
/// `home_month`, one captured calendar per month, arbitrary pages keyed by
/// URL and controls that load a page when clicked.
#[derive(Debug, Clone)]
pub struct ScriptedBrowser {
    calendar: Option<CalendarLayout>,
    cookies: Option<CookieLayout>,
    home_url: Option<String>,
    home_month: Option<YearMonth>,
    months: BTreeMap<YearMonth, String>,
    pages: BTreeMap<String, String>,
    links: BTreeMap<String, String>,
    failing: BTreeSet<String>,
    banner_pending: bool,
    frozen: bool,
    current: Current,
    current_url: String,
    visible: Option<YearMonth>,
    clicks: Vec<String>,
    fills: Vec<(String, String)>,
    navigations: Vec<String>,
}

impl ScriptedBrowser {
    pub fn new(adapter: &dyn CalendarAdapter, home_url: impl Into<String>) -> Self {
        Self {
            calendar: Some(*adapter.calendar_layout()),
            cookies: Some(*adapter.cookie_layout()),
            home_url: Some(home_url.into()),
            ..Self::without_calendar()
        }
    }

    /// A site made only of pages and links, such as a search form.
    pub fn without_calendar() -> Self {
        Self {
            calendar: None,
            cookies: None,
            home_url: None,
            home_month: None,
            months: BTreeMap::new(),
            pages: BTreeMap::new(),
            links: BTreeMap::new(),
            failing: BTreeSet::new(),
            banner_pending: false,
            frozen: false,
            current: Current::Blank,
            current_url: "about:blank".to_string(),
            visible: None,
            clicks: Vec::new(),
            fills: Vec::new(),
            navigations: Vec::new(),
        }
    }

    pub fn with_month(mut self, month: YearMonth, html: impl Into<String>) -> Self {
        self.months.insert(month, html.into());
        self
    }

    /// Month the calendar shows right after the home page loads.
    pub fn showing(mut self, month: YearMonth) -> Self {
        self.home_month = Some(month);
        self
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    /// Clicking a control matched by `selector` loads the page at `url`.
    pub fn with_link(mut self, selector: impl Into<String>, url: impl Into<String>) -> Self {
        self.links.insert(selector.into(), url.into());
        self
    }

    /// Overlay a consent banner on every page until it is accepted.
    pub fn with_cookie_banner(mut self) -> Self {
        self.banner_pending = true;
        self
    }

    /// Month navigation clicks succeed but the calendar never changes.
    pub fn frozen_calendar(mut self) -> Self {
        self.frozen = true;
        self
    }

    pub fn failing(mut self, url: impl Into<String>) -> Self {
        self.failing.insert(url.into());
        self
    }

    pub fn clicks(&self) -> &[String] {
        &self.clicks
    }

    /// `(selector, value)` pairs typed into inputs, in order.
    pub fn fills(&self) -> &[(String, String)] {
        &self.fills
    }

    pub fn navigations(&self) -> &[String] {
        &self.navigations
    }

    pub fn visible_month(&self) -> Option<YearMonth> {
        self.visible
    }

    fn page_html(&self) -> Result<String, BrowserError> {
        let html = match &self.current {
            Current::Blank => BLANK_PAGE.to_string(),
            Current::Calendar => {
                let month = self
                    .visible
                    .ok_or_else(|| BrowserError::Protocol("calendar page without a visible month".to_string()))?;
                self.months
                    .get(&month)
                    .cloned()
                    .ok_or_else(|| BrowserError::Protocol(format!("no captured calendar for {month}")))?
            }
            Current::Page(url) => self
                .pages
                .get(url)
                .cloned()
                .ok_or_else(|| BrowserError::Protocol(format!("no captured page for {url}")))?,
        };
        if !self.banner_pending {
            return Ok(html);
        }
        Ok(match html.rfind("</body>") {
            Some(at) => format!("{}{}{}", &html[..at], COOKIE_BANNER, &html[at..]),
            None => format!("{html}{COOKIE_BANNER}"),
        })
    }

    fn shift_month(&mut self, forward: bool) -> Result<(), BrowserError> {
        if self.frozen {
            return Ok(());
        }
        let Some(month) = self.visible else {
            return Err(BrowserError::Protocol("no calendar is shown".to_string()));
        };
        let next = if forward {
            self.months.range(month..).nth(1).map(|(m, _)| *m)
        } else {
            self.months.range(..month).next_back().map(|(m, _)| *m)
        };
        // The nearest captured month in that direction, so a gap in the
        // captures stands for a calendar that skips months.
        match next {
            Some(next) => {
                self.visible = Some(next);
                Ok(())
            }
            None => Err(BrowserError::Protocol(format!(
                "no captured calendar {} {month}",
                if forward { "after" } else { "before" }
            ))),
        }
    }

    fn load(&mut self, url: &str) -> Result<(), BrowserError> {
        if self.failing.contains(url) {
            return Err(BrowserError::Protocol(format!("net::ERR_CONNECTION_REFUSED at {url}")));
        }
        if self.home_url.as_deref() == Some(url) {
            self.current = Current::Calendar;
            self.visible = self.home_month;
        } else if self.pages.contains_key(url) {
            self.current = Current::Page(url.to_string());
        } else {
            return Err(BrowserError::Protocol(format!("net::ERR_NAME_NOT_RESOLVED at {url}")));
        }
        self.current_url = url.to_string();
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for ScriptedBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.navigations.push(url.to_string());
        self.load(url)
    }

    async fn read_dom(&mut self) -> Result<String, BrowserError> {
        self.page_html()
    }

    async fn click(&mut self, target: &ElementTarget) -> Result<(), BrowserError> {
        let html = self.page_html()?;
        let present = selector_present(&html, target.selector).map_err(|e| BrowserError::Protocol(e.to_string()))?;
        if !present {
            return Err(BrowserError::ElementNotFound(target.to_string()));
        }
        self.clicks.push(target.to_string());

        let on_calendar = self.current == Current::Calendar;
        if let Some(url) = self.links.get(target.selector).cloned() {
            self.load(&url)?;
        } else if self.banner_pending && self.cookies.is_some_and(|c| c.accept_controls.contains(target)) {
            self.banner_pending = false;
        } else if on_calendar && self.calendar.is_some_and(|c| c.prev_controls.contains(target)) {
            self.shift_month(false)?;
        } else if on_calendar && self.calendar.is_some_and(|c| c.next_controls.contains(target)) {
            self.shift_month(true)?;
        }
        Ok(())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let html = self.page_html()?;
        let present = selector_present(&html, selector).map_err(|e| BrowserError::Protocol(e.to_string()))?;
        if !present {
            return Err(BrowserError::ElementNotFound(selector.to_string()));
        }
        self.fills.push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), BrowserError> {
        let html = self.page_html()?;
        match selector_present(&html, selector) {
            Ok(true) => Ok(()),
            Ok(false) => Err(BrowserError::Timeout {
                action: format!("waiting for {selector}"),
                after: timeout,
            }),
            Err(err) => Err(BrowserError::Protocol(err.to_string())),
        }
    }

    async fn current_url(&mut self) -> Result<String, BrowserError> {
        Ok(self.current_url.clone())
    }

    async fn title(&mut self) -> Result<Option<String>, BrowserError> {
        Ok(page_title(&self.page_html()?))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, BrowserError> {
        Ok(PNG_SIGNATURE.to_vec())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.current = Current::Blank;
        self.current_url = "about:blank".to_string();
        Ok(())
    }
}
