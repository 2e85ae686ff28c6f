//! Per-source page layouts and the pure parsers the crawl handlers run over
//! captured HTML: calendar model, issue-date reconciliation, cookie banner
//! detection, search result pages and notice extraction.

use std::fmt;

use chrono::NaiveDate;
use gazette_core::{CrawlError, DateWindow, YearMonth};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "gazette-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("{what} not found (tried: {selectors})")]
    Missing { what: String, selectors: String },
    #[error("{0}")]
    Parse(String),
    #[error("impossible calendar date {year:04}-{month:02}-{day:02}")]
    InvalidDate { year: i32, month: u32, day: u32 },
}

impl AdapterError {
    fn missing(what: &str, selectors: &[&str]) -> Self {
        Self::Missing {
            what: what.to_string(),
            selectors: selectors.join(", "),
        }
    }
}

impl From<AdapterError> for CrawlError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Missing { what, selectors } => CrawlError::ElementNotFound { what, selectors },
            other => CrawlError::Parse(other.to_string()),
        }
    }
}

/// A clickable element: a CSS selector, optionally narrowed to elements whose
/// accent-folded text contains `text_contains`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ElementTarget {
    pub selector: &'static str,
    pub text_contains: Option<&'static str>,
}

impl ElementTarget {
    pub const fn css(selector: &'static str) -> Self {
        Self {
            selector,
            text_contains: None,
        }
    }

    pub const fn with_text(selector: &'static str, text: &'static str) -> Self {
        Self {
            selector,
            text_contains: Some(text),
        }
    }
}

impl fmt::Display for ElementTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text_contains {
            Some(text) => write!(f, "{} containing \"{}\"", self.selector, text),
            None => f.write_str(self.selector),
        }
    }
}

/// Where a source's month calendar lives and how its cells are marked.
#[derive(Debug, Clone, Copy)]
pub struct CalendarLayout {
    pub root: &'static str,
    pub month_selectors: &'static [&'static str],
    pub year_selectors: &'static [&'static str],
    /// Free-text headers tried when month and year elements cannot be read.
    pub header_selectors: &'static [&'static str],
    pub prev_controls: &'static [ElementTarget],
    pub next_controls: &'static [ElementTarget],
    pub day_cells: &'static str,
    pub day_label: &'static str,
    pub publication_class: &'static str,
    pub outside_month_class: &'static str,
    pub query_attr: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct CookieLayout {
    pub accept_controls: &'static [ElementTarget],
}

#[derive(Debug, Clone, Copy)]
pub struct NoticeLayout {
    pub rows: &'static str,
    pub row_links: &'static str,
    pub link_href_contains: &'static str,
    pub excluded_link_container: &'static str,
    pub category_heading: &'static str,
    pub department_heading: &'static str,
    pub detail_root: &'static str,
    pub detail_title: &'static str,
    pub detail_paragraphs: &'static str,
    pub metadata_items: &'static str,
    pub category_key: &'static str,
    pub department_key: &'static str,
    /// Page title shared by every page of the site; never a notice title.
    pub generic_page_title: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayEntry {
    pub day: u32,
    pub clickable: bool,
    pub title_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleMonth {
    pub year_month: YearMonth,
    pub label: String,
    pub days: Vec<DayEntry>,
}

impl VisibleMonth {
    pub fn clickable_days(&self) -> impl Iterator<Item = &DayEntry> {
        self.days.iter().filter(|d| d.clickable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCandidate {
    pub issue_date: NaiveDate,
    pub url: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeCandidate {
    pub title: String,
    pub url: String,
    pub category: String,
    pub department: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeDetail {
    pub title: String,
    pub category: String,
    pub department: String,
    pub content: String,
    pub extra_info: String,
    /// Stable link published on the notice page, when the site has one.
    pub permalink: Option<String>,
}

/// Identity and default URLs shared by every kind of source.
pub trait SourceSite: Send + Sync {
    fn slug(&self) -> &'static str;
    fn default_base_url(&self) -> &'static str;
    fn default_daily_base_url(&self) -> &'static str;
}

/// Source-specific knowledge of a calendar-driven gazette site.
pub trait CalendarAdapter: SourceSite {
    fn calendar_layout(&self) -> &CalendarLayout;
    fn cookie_layout(&self) -> &CookieLayout;
    fn notice_layout(&self) -> &NoticeLayout;
    fn describe_issue(&self, issue_date: NaiveDate, issue_url: &str) -> String;

    fn parse_visible_month(&self, html: &str) -> Result<VisibleMonth, AdapterError> {
        parse_visible_month(html, self.calendar_layout())
    }

    /// Clickable days of `visible` inside `[start, end]`, sorted by date.
    /// A clickable cell that names an impossible date fails the whole month.
    fn issue_candidates(
        &self,
        visible: &VisibleMonth,
        daily_base_url: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<IssueCandidate>, AdapterError> {
        let mut out: Vec<IssueCandidate> = Vec::new();
        for entry in visible.clickable_days() {
            let issue_date = derive_issue_date(visible.year_month.year, visible.year_month.month, entry.day)?;
            if issue_date < start || issue_date > end {
                continue;
            }
            let Some(query) = entry.title_query.as_deref() else {
                continue;
            };
            if out.iter().any(|c| c.issue_date == issue_date) {
                continue;
            }
            let url = build_daily_issue_url(daily_base_url, query);
            let description = self.describe_issue(issue_date, &url);
            out.push(IssueCandidate {
                issue_date,
                url,
                description,
            });
        }
        out.sort_by_key(|c| c.issue_date);
        Ok(out)
    }

    fn find_cookie_accept(&self, html: &str) -> Result<Option<ElementTarget>, AdapterError> {
        first_present(html, self.cookie_layout().accept_controls)
    }

    fn parse_notice_candidates(&self, html: &str, page_url: &str) -> Result<Vec<NoticeCandidate>, AdapterError> {
        parse_notice_candidates(html, page_url, self.notice_layout())
    }

    fn parse_notice_detail(&self, html: &str) -> Result<NoticeDetail, AdapterError> {
        parse_notice_detail(html, self.notice_layout())
    }
}

const DOGC_CALENDAR: CalendarLayout = CalendarLayout {
    root: "#calendari-dogc",
    month_selectors: &[
        "#calendari-dogc .ui-datepicker-month option[selected]",
        "#calendari-dogc .ui-datepicker-month",
    ],
    year_selectors: &[
        "#calendari-dogc .ui-datepicker-year option[selected]",
        "#calendari-dogc .customSelect.ui-datepicker-year .customSelectInner",
        "#calendari-dogc span.ui-datepicker-year",
    ],
    header_selectors: &[
        "#calendari-dogc .ui-datepicker-title",
        ".ui-datepicker-title",
        ".datepicker-switch",
        ".flatpickr-current-month",
    ],
    prev_controls: &[
        ElementTarget::css("#calendari-dogc .ui-datepicker-prev[data-handler='prev']"),
        ElementTarget::css("#calendari-dogc .ui-datepicker-prev"),
        ElementTarget::css("#calendari-dogc [data-handler='prev']"),
        ElementTarget::css("#calendari-dogc a[title*='nterior'], #calendari-dogc button[title*='nterior']"),
        ElementTarget::css("#calendari-dogc [aria-label*='nterior'], #calendari-dogc [aria-label*='revious']"),
    ],
    next_controls: &[
        ElementTarget::css("#calendari-dogc .ui-datepicker-next[data-handler='next']"),
        ElementTarget::css("#calendari-dogc .ui-datepicker-next"),
        ElementTarget::css("#calendari-dogc [data-handler='next']"),
        ElementTarget::css("#calendari-dogc a[title*='egüent'], #calendari-dogc button[title*='egüent']"),
        ElementTarget::css("#calendari-dogc [aria-label*='eguent'], #calendari-dogc [aria-label*='ext']"),
    ],
    day_cells: "#calendari-dogc .ui-datepicker-calendar td",
    day_label: "a.ui-state-default, span.ui-state-default",
    publication_class: "has-publicacio",
    outside_month_class: "ui-datepicker-other-month",
    query_attr: "title",
};

const DOGC_COOKIES: CookieLayout = CookieLayout {
    accept_controls: &[
        ElementTarget::css("button#ppms_cm_agree-to-all"),
        ElementTarget::css("#ppms_cm_agree-to-all"),
        ElementTarget::with_text("button", "accept"),
        ElementTarget::with_text("button", "aceptar"),
        ElementTarget::with_text("button", "totes"),
        ElementTarget::with_text("button", "todo"),
    ],
};

const DOGC_NOTICES: NoticeLayout = NoticeLayout {
    rows: "div.wrapper-disposicions li.destacat_text",
    row_links: "div.destacat_text_cont a[href]",
    link_href_contains: "document-del-dogc",
    excluded_link_container: "download",
    category_heading: "h2",
    department_heading: "h3",
    detail_root: "#fullText",
    detail_title: "h1",
    detail_paragraphs: "p",
    metadata_items: "#disposicions_cos_bloc li",
    category_key: "Secció del DOGC",
    department_key: "Organisme emissor",
    generic_page_title: "diari oficial de la generalitat de catalunya",
};

/// Diari Oficial de la Generalitat de Catalunya.
#[derive(Debug, Clone, Copy, Default)]
pub struct DogcAdapter;

impl SourceSite for DogcAdapter {
    fn slug(&self) -> &'static str {
        "dogc"
    }

    fn default_base_url(&self) -> &'static str {
        "https://dogc.gencat.cat/ca"
    }

    fn default_daily_base_url(&self) -> &'static str {
        "https://dogc.gencat.cat/ca/sumari-del-dogc/"
    }
}

impl CalendarAdapter for DogcAdapter {
    fn calendar_layout(&self) -> &CalendarLayout {
        &DOGC_CALENDAR
    }

    fn cookie_layout(&self) -> &CookieLayout {
        &DOGC_COOKIES
    }

    fn notice_layout(&self) -> &NoticeLayout {
        &DOGC_NOTICES
    }

    fn describe_issue(&self, issue_date: NaiveDate, issue_url: &str) -> String {
        match query_value(issue_url, "numDOGC") {
            Some(number) => format!("DOGC núm. {number}"),
            None => format!("DOGC {}", issue_date.format("%Y-%m-%d")),
        }
    }
}

/// Where a search-driven site keeps its form, result list and documents.
#[derive(Debug, Clone, Copy)]
pub struct SearchLayout {
    pub from_input: &'static str,
    pub to_input: &'static str,
    pub submit_controls: &'static [ElementTarget],
    /// URL fragments that only appear once the search has been answered.
    pub response_url_markers: &'static [&'static str],
    pub empty_markers: &'static [&'static str],
    pub pagination: &'static str,
    pub result_items: &'static str,
    pub result_department: &'static str,
    pub result_publication: &'static str,
    pub result_link: &'static str,
    /// Named groups `journal`, `day`, `month`, `year` and `category`.
    pub publication_pattern: &'static str,
    pub next_page_marker: &'static str,
    pub detail_title: &'static str,
    pub metadata_terms: &'static str,
    pub category_key: &'static str,
    pub department_key: &'static str,
    pub permalink_key: &'static str,
    pub detail_text: &'static str,
    pub detail_paragraphs: &'static str,
}

/// One hit of a search result page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub issue_date: NaiveDate,
    pub journal_description: String,
    pub category: String,
    pub department: String,
    pub title: String,
    pub detail_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsPage {
    /// Hits inside the requested window, in page order.
    pub results: Vec<SearchResult>,
    pub next_page_url: Option<String>,
    pub items_seen: usize,
    pub outside_window: usize,
    /// Items without a title, link or readable publication line.
    pub skipped: usize,
}

/// Source-specific knowledge of a site crawled through a date-range search.
pub trait SearchAdapter: SourceSite {
    fn search_layout(&self) -> &SearchLayout;

    /// Address of the daily issue that published a result.
    fn daily_journal_url(&self, daily_base_url: &str, issue_date: NaiveDate) -> String {
        format!(
            "{}/{}/",
            daily_base_url.trim_end_matches('/'),
            issue_date.format("%Y/%m/%d")
        )
    }

    /// Whether `html` is an answered search: hits, pagination or an empty-result message.
    fn results_ready(&self, html: &str) -> Result<bool, AdapterError> {
        results_ready(html, self.search_layout())
    }

    fn parse_results_page(
        &self,
        html: &str,
        page_url: &str,
        window: DateWindow,
    ) -> Result<ResultsPage, AdapterError> {
        parse_results_page(html, page_url, window, self.search_layout())
    }

    fn parse_notice_detail(&self, html: &str) -> Result<NoticeDetail, AdapterError> {
        parse_document_detail(html, self.search_layout())
    }
}

const BOE_SEARCH: SearchLayout = SearchLayout {
    from_input: "#desdeFP",
    to_input: "#hastaFP",
    submit_controls: &[
        ElementTarget::css("div.bloqueBotones input[type='submit'][value='Buscar']"),
        ElementTarget::css("input[type='submit'][value='Buscar']"),
        ElementTarget::with_text("button[type='submit']", "buscar"),
    ],
    response_url_markers: &["accion=Buscar", "id_busqueda="],
    empty_markers: &["No se han encontrado", "No se ha encontrado"],
    pagination: ".paginacion, .paginacion-mini, nav.paginacion",
    result_items: "li.resultado-busqueda",
    result_department: "p.linea-dem",
    result_publication: "p.linea-pub",
    result_link: "a.resultado-busqueda-link-defecto",
    publication_pattern: r"(?P<journal>BOE\s+\d+\s+de\s+(?P<day>\d{2})/(?P<month>\d{2})/(?P<year>\d{4}))\s*-\s*(?P<category>.+)$",
    next_page_marker: "li > a > span.pagSig",
    detail_title: "h3.documento-tit",
    metadata_terms: "div.metadatos dl dt",
    category_key: "Sección",
    department_key: "Departamento",
    permalink_key: "Permalink ELI",
    detail_text: "#textoxslt",
    detail_paragraphs: "p, h5",
};

/// Boletín Oficial del Estado, crawled through its date-range search.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoeAdapter;

impl SourceSite for BoeAdapter {
    fn slug(&self) -> &'static str {
        "boe"
    }

    fn default_base_url(&self) -> &'static str {
        "https://www.boe.es/buscar/boe.php"
    }

    fn default_daily_base_url(&self) -> &'static str {
        "https://www.boe.es/boe/dias/"
    }
}

impl SearchAdapter for BoeAdapter {
    fn search_layout(&self) -> &SearchLayout {
        &BOE_SEARCH
    }
}

/// A registered source together with the state machine that crawls it.
pub enum SourceAdapter {
    Calendar(Box<dyn CalendarAdapter>),
    Search(Box<dyn SearchAdapter>),
}

impl SourceAdapter {
    pub fn machine(&self) -> &'static str {
        match self {
            Self::Calendar(_) => "calendar",
            Self::Search(_) => "search",
        }
    }
}

impl SourceSite for SourceAdapter {
    fn slug(&self) -> &'static str {
        match self {
            Self::Calendar(adapter) => adapter.slug(),
            Self::Search(adapter) => adapter.slug(),
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Calendar(adapter) => adapter.default_base_url(),
            Self::Search(adapter) => adapter.default_base_url(),
        }
    }

    fn default_daily_base_url(&self) -> &'static str {
        match self {
            Self::Calendar(adapter) => adapter.default_daily_base_url(),
            Self::Search(adapter) => adapter.default_daily_base_url(),
        }
    }
}

impl fmt::Debug for SourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceAdapter")
            .field("slug", &self.slug())
            .field("machine", &self.machine())
            .finish()
    }
}

pub fn registered_slugs() -> &'static [&'static str] {
    &["boe", "dogc"]
}

pub fn adapter_for_source(slug: &str) -> Option<SourceAdapter> {
    match slug {
        "boe" => Some(SourceAdapter::Search(Box::new(BoeAdapter))),
        "dogc" => Some(SourceAdapter::Calendar(Box::new(DogcAdapter))),
        _ => None,
    }
}

/// Lowercase, accent-folded, whitespace-collapsed text.
pub fn normalize_text(value: &str) -> String {
    collapse_whitespace(&deunicode::deunicode(value).to_lowercase())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Month number for a Catalan, Spanish or English month name.
pub fn month_from_name(name: &str) -> Option<u32> {
    let month = match normalize_text(name).as_str() {
        "gener" | "enero" | "january" => 1,
        "febrer" | "febrero" | "february" => 2,
        "marc" | "marzo" | "march" => 3,
        "abril" | "april" => 4,
        "maig" | "mayo" | "may" => 5,
        "juny" | "junio" | "june" => 6,
        "juliol" | "julio" | "july" => 7,
        "agost" | "agosto" | "august" => 8,
        "setembre" | "septiembre" | "september" => 9,
        "octubre" | "october" => 10,
        "novembre" | "noviembre" | "november" => 11,
        "desembre" | "diciembre" | "december" => 12,
        _ => return None,
    };
    Some(month)
}

fn four_digit_year(token: &str) -> Option<i32> {
    if token.len() == 4 && token.bytes().all(|b| b.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}

/// Reads `"<month> <year>"` or `"<year> <month>"` out of free header text.
/// When several readings are possible the latest year wins.
pub fn parse_month_year(text: &str) -> Option<YearMonth> {
    let normalized = normalize_text(text);
    let tokens: Vec<&str> = normalized
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let mut candidates = Vec::new();
    for pair in tokens.windows(2) {
        let reading = match (month_from_name(pair[0]), four_digit_year(pair[1])) {
            (Some(month), Some(year)) => Some((year, month)),
            _ => match (four_digit_year(pair[0]), month_from_name(pair[1])) {
                (Some(year), Some(month)) => Some((year, month)),
                _ => None,
            },
        };
        candidates.extend(reading);
    }

    let first_month = tokens.iter().find_map(|t| month_from_name(t));
    let latest_year = tokens.iter().filter_map(|t| four_digit_year(t)).max();
    if let (Some(month), Some(year)) = (first_month, latest_year) {
        candidates.push((year, month));
    }

    let mut best: Option<(i32, u32)> = None;
    for candidate in candidates {
        if best.map_or(true, |(year, _)| candidate.0 > year) {
            best = Some(candidate);
        }
    }
    best.and_then(|(year, month)| YearMonth::new(year, month))
}

/// Calendar date of a day cell. Impossible dates are errors, never clamped.
pub fn derive_issue_date(year: i32, month: u32, day: u32) -> Result<NaiveDate, AdapterError> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or(AdapterError::InvalidDate { year, month, day })
}

/// Joins a day cell's query with the source's daily base URL.
pub fn build_daily_issue_url(daily_base_url: &str, title_query: &str) -> String {
    let query = title_query.trim();
    let base = daily_base_url.trim_end_matches('/');
    if query.starts_with('?') {
        format!("{base}/{query}")
    } else if query.starts_with("http://") || query.starts_with("https://") {
        query.to_string()
    } else if !query.is_empty() {
        format!("{base}/?{query}")
    } else {
        daily_base_url.to_string()
    }
}

fn query_value(url: &str, key: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, v)| k == key && !v.trim().is_empty())
        .map(|(_, v)| v.trim().to_string())
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn pattern(re: &str) -> Result<Regex, AdapterError> {
    Regex::new(re).map_err(|e| AdapterError::Parse(format!("invalid pattern `{re}`: {e}")))
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

fn has_class(el: ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn first_text(document: &Html, selectors: &[&str]) -> Result<Option<String>, AdapterError> {
    for css in selectors {
        let sel = selector(css)?;
        if let Some(text) = document
            .select(&sel)
            .map(element_text)
            .find(|t| !t.is_empty())
        {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn target_matches(document: &Html, target: &ElementTarget) -> Result<bool, AdapterError> {
    let sel = selector(target.selector)?;
    let needle = target.text_contains.map(normalize_text);
    Ok(document.select(&sel).any(|el| match &needle {
        Some(needle) => normalize_text(&element_text(el)).contains(needle.as_str()),
        None => true,
    }))
}

/// Whether any element of `html` matches the CSS selector `css`.
pub fn selector_present(html: &str, css: &str) -> Result<bool, AdapterError> {
    let sel = selector(css)?;
    Ok(Html::parse_document(html).select(&sel).next().is_some())
}

/// Text of the document `<title>`, if any.
pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    first_text(&document, &["title"]).ok().flatten()
}

/// First target with a matching element in `html`, in list order.
pub fn first_present(html: &str, targets: &[ElementTarget]) -> Result<Option<ElementTarget>, AdapterError> {
    let document = Html::parse_document(html);
    for target in targets {
        if target_matches(&document, target)? {
            return Ok(Some(*target));
        }
    }
    Ok(None)
}

/// Reads the month currently shown by the calendar and its day cells.
pub fn parse_visible_month(html: &str, layout: &CalendarLayout) -> Result<VisibleMonth, AdapterError> {
    let document = Html::parse_document(html);
    if document.select(&selector(layout.root)?).next().is_none() {
        return Err(AdapterError::missing("calendar", &[layout.root]));
    }

    let month_text = first_text(&document, layout.month_selectors)?;
    let year_text = first_text(&document, layout.year_selectors)?;
    let direct = match (&month_text, &year_text) {
        (Some(month), Some(year)) => month_from_name(month)
            .zip(four_digit_year(year.trim()))
            .and_then(|(m, y)| YearMonth::new(y, m))
            .map(|ym| (ym, format!("{month} {year}"))),
        _ => None,
    };

    let (year_month, label) = match direct {
        Some(found) => found,
        None => {
            let mut found = None;
            for css in layout.header_selectors {
                let sel = selector(css)?;
                found = document
                    .select(&sel)
                    .map(element_text)
                    .find_map(|text| parse_month_year(&text).map(|ym| (ym, text)));
                if found.is_some() {
                    break;
                }
            }
            found.ok_or_else(|| {
                AdapterError::Parse(format!(
                    "calendar header unreadable (month {:?}, year {:?})",
                    month_text, year_text
                ))
            })?
        }
    };

    let cell_sel = selector(layout.day_cells)?;
    let label_sel = selector(layout.day_label)?;
    let mut days = Vec::new();
    for cell in document.select(&cell_sel) {
        if has_class(cell, layout.outside_month_class) {
            continue;
        }
        let text = cell
            .select(&label_sel)
            .next()
            .map(element_text)
            .unwrap_or_else(|| element_text(cell));
        let Ok(day) = text.parse::<u32>() else {
            continue;
        };
        let title_query = cell
            .value()
            .attr(layout.query_attr)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        days.push(DayEntry {
            day,
            clickable: has_class(cell, layout.publication_class),
            title_query,
        });
    }

    Ok(VisibleMonth {
        year_month,
        label,
        days,
    })
}

fn inside_container_with_class(el: ElementRef<'_>, class_fragment: &str) -> bool {
    el.ancestors().filter_map(ElementRef::wrap).any(|a| {
        a.value().name() == "div"
            && a.value()
                .attr("class")
                .is_some_and(|c| c.contains(class_fragment))
    })
}

fn resolve_url(page_url: &str, href: &str) -> String {
    Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Notice links of a daily summary page, in page order and unique by URL.
/// Category and department come from the nearest preceding headings.
pub fn parse_notice_candidates(
    html: &str,
    page_url: &str,
    layout: &NoticeLayout,
) -> Result<Vec<NoticeCandidate>, AdapterError> {
    let document = Html::parse_document(html);
    let walk = selector(&format!(
        "{}, {}, {}",
        layout.category_heading, layout.department_heading, layout.rows
    ))?;
    let row_sel = selector(layout.rows)?;
    let link_sel = selector(layout.row_links)?;

    let mut category = String::new();
    let mut department = String::new();
    let mut out: Vec<NoticeCandidate> = Vec::new();
    for el in document.select(&walk) {
        let name = el.value().name();
        if name == layout.category_heading {
            category = element_text(el);
            continue;
        }
        if name == layout.department_heading {
            department = element_text(el);
            continue;
        }
        if !row_sel.matches(&el) {
            continue;
        }

        let link = el.select(&link_sel).find(|a| {
            a.value()
                .attr("href")
                .is_some_and(|h| h.contains(layout.link_href_contains))
                && !inside_container_with_class(*a, layout.excluded_link_container)
        });
        let Some(link) = link else {
            continue;
        };
        let href = link.value().attr("href").unwrap_or_default().trim();
        let title = element_text(link);
        if href.is_empty() || title.is_empty() {
            continue;
        }
        let url = resolve_url(page_url, href);
        if out.iter().any(|c| c.url == url) {
            continue;
        }
        out.push(NoticeCandidate {
            title,
            url,
            category: category.clone(),
            department: department.clone(),
        });
    }
    Ok(out)
}

/// Title, body paragraphs and side metadata of a notice page.
pub fn parse_notice_detail(html: &str, layout: &NoticeLayout) -> Result<NoticeDetail, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.select(&selector(layout.detail_root)?).next();

    let mut title = String::new();
    if let Some(root) = root {
        let title_sel = selector(layout.detail_title)?;
        if let Some(text) = root.select(&title_sel).map(element_text).find(|t| !t.is_empty()) {
            title = text;
        }
    }
    if title.is_empty() {
        if let Some(page_title) = first_text(&document, &["title"])? {
            if normalize_text(&page_title) != layout.generic_page_title {
                title = page_title;
            }
        }
    }

    let mut paragraphs = Vec::new();
    if let Some(root) = root {
        let para_sel = selector(layout.detail_paragraphs)?;
        for text in root.select(&para_sel).map(element_text) {
            if text.is_empty() || normalize_text(&text) == "descarrega" {
                continue;
            }
            if text.to_lowercase().ends_with(".pdf") {
                continue;
            }
            paragraphs.push(text);
        }
    }
    let mut content = paragraphs.join("\n\n");
    if !title.is_empty() {
        if let Some(rest) = content.strip_prefix(title.as_str()) {
            content = rest.trim_start().to_string();
        }
    }

    let mut metadata: Vec<(String, String)> = Vec::new();
    for item in document.select(&selector(layout.metadata_items)?) {
        let parts: Vec<String> = item
            .text()
            .map(collapse_whitespace)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() < 2 {
            continue;
        }
        let (key, value) = (parts[0].clone(), parts[1].clone());
        match metadata.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => metadata.push((key, value)),
        }
    }
    let lookup = |key: &str| {
        metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    Ok(NoticeDetail {
        category: lookup(layout.category_key),
        department: lookup(layout.department_key),
        extra_info: metadata
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n"),
        title,
        content,
        permalink: None,
    })
}

/// Issue reference carried by a search hit's publication line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationLine {
    pub journal: String,
    pub issue_date: NaiveDate,
    pub category: String,
}

/// Reads `"BOE 6 de 07/01/2026 - I. Disposiciones generales"` style lines.
/// `None` when the line does not have that shape; an impossible date is an error.
pub fn parse_publication_line(text: &str, layout: &SearchLayout) -> Result<Option<PublicationLine>, AdapterError> {
    read_publication_line(&pattern(layout.publication_pattern)?, text)
}

fn read_publication_line(re: &Regex, text: &str) -> Result<Option<PublicationLine>, AdapterError> {
    let text = collapse_whitespace(text);
    let Some(caps) = re.captures(&text) else {
        return Ok(None);
    };
    let group = |name: &str| caps.name(name).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    let number = |name: &str| group(name).parse::<u32>().ok();
    let (Some(day), Some(month), Some(year)) = (number("day"), number("month"), number("year")) else {
        return Ok(None);
    };
    let issue_date = derive_issue_date(year as i32, month, day)?;
    Ok(Some(PublicationLine {
        journal: group("journal"),
        issue_date,
        category: group("category"),
    }))
}

/// Whether the page answers a submitted search.
pub fn results_ready(html: &str, layout: &SearchLayout) -> Result<bool, AdapterError> {
    let document = Html::parse_document(html);
    for css in [layout.result_items, layout.pagination] {
        if document.select(&selector(css)?).next().is_some() {
            return Ok(true);
        }
    }
    Ok(layout.empty_markers.iter().any(|marker| html.contains(marker)))
}

/// Hits of one result page that fall inside `window`, plus the next-page link.
pub fn parse_results_page(
    html: &str,
    page_url: &str,
    window: DateWindow,
    layout: &SearchLayout,
) -> Result<ResultsPage, AdapterError> {
    let document = Html::parse_document(html);
    let item_sel = selector(layout.result_items)?;
    let department_sel = selector(layout.result_department)?;
    let publication_sel = selector(layout.result_publication)?;
    let link_sel = selector(layout.result_link)?;
    let publication = pattern(layout.publication_pattern)?;

    let mut page = ResultsPage::default();
    for item in document.select(&item_sel) {
        page.items_seen += 1;
        let department = item
            .select(&department_sel)
            .next()
            .map(element_text)
            .unwrap_or_default();
        let title = item
            .children()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "p" && !department_sel.matches(el) && !publication_sel.matches(el))
            .map(element_text)
            .unwrap_or_default();
        let href = item
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .unwrap_or_default();
        let line = match item.select(&publication_sel).next().map(element_text) {
            Some(text) => read_publication_line(&publication, &text)?,
            None => None,
        };

        let Some(line) = line.filter(|_| !title.is_empty() && !href.is_empty()) else {
            page.skipped += 1;
            continue;
        };
        if !window.contains(line.issue_date) {
            page.outside_window += 1;
            continue;
        }
        page.results.push(SearchResult {
            issue_date: line.issue_date,
            journal_description: line.journal,
            category: line.category,
            department,
            title,
            detail_url: resolve_url(page_url, href),
        });
    }

    let marker = selector(layout.next_page_marker)?;
    page.next_page_url = document
        .select(&marker)
        .filter_map(|span| span.parent().and_then(ElementRef::wrap))
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .find(|href| !href.is_empty())
        .map(|href| resolve_url(page_url, href));
    Ok(page)
}

/// Title, metadata terms and body text of a search site's document page.
pub fn parse_document_detail(html: &str, layout: &SearchLayout) -> Result<NoticeDetail, AdapterError> {
    let document = Html::parse_document(html);
    let title = match first_text(&document, &[layout.detail_title])? {
        Some(title) => title,
        None => first_text(&document, &["title"])?.unwrap_or_default(),
    };

    let term_sel = selector(layout.metadata_terms)?;
    let link_sel = selector("a[href]")?;
    let mut category = String::new();
    let mut department = String::new();
    let mut permalink = None;
    for term in document.select(&term_sel) {
        let label = element_text(term);
        let label = label.trim_end_matches(':').trim();
        if label.is_empty() {
            continue;
        }
        let Some(value) = term
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "dd")
        else {
            continue;
        };
        if label == layout.category_key {
            category = element_text(value);
        } else if label == layout.department_key {
            department = element_text(value);
        } else if label.contains(layout.permalink_key) && permalink.is_none() {
            permalink = value
                .select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .map(str::trim)
                .find(|href| !href.is_empty())
                .map(str::to_string);
        }
    }

    let mut paragraphs = Vec::new();
    if let Some(root) = document.select(&selector(layout.detail_text)?).next() {
        let para_sel = selector(layout.detail_paragraphs)?;
        for text in root.select(&para_sel).map(element_text) {
            if text.is_empty() || text.to_lowercase().ends_with(".pdf") {
                continue;
            }
            paragraphs.push(text);
        }
    }

    Ok(NoticeDetail {
        title,
        category,
        department,
        content: paragraphs.join("\n\n"),
        extra_info: String::new(),
        permalink,
    })
}
