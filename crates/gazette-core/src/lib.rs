//! Core domain model and error taxonomy for the gazette crawler.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "gazette-core";

/// Crawl target as stored in the `sources` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub slug: String,
    pub base_url: Option<String>,
    pub daily_base_url: Option<String>,
    pub start_at: Option<NaiveDate>,
}

/// One gazette issue of a source, unique per `(source_id, issue_date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyJournal {
    pub id: i64,
    pub source_id: i64,
    pub issue_date: NaiveDate,
    pub url: String,
    pub description: String,
}

/// A published item belonging to a daily journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: i64,
    pub daily_journal_id: i64,
    pub title: String,
    pub category: String,
    pub department: String,
    pub url: String,
    pub content: String,
    pub extra_info: String,
}

/// Notice fields as extracted from a page, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeDraft {
    pub daily_journal_id: i64,
    pub title: String,
    pub category: String,
    pub department: String,
    pub url: String,
    pub content: String,
    pub extra_info: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Calendar month cursor. Ordering is lexicographic on `(year, month)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Inclusive range of issue dates a search-driven crawl asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    /// `None` when `from` is after `to`.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Option<Self> {
        (from <= to).then_some(Self { from, to })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Named states of the crawl machines. Calendar sources walk the month
/// states, search sources the search and results states; both share
/// `HOME`, `OPEN_NOTICE` and the terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrawlState {
    Home,
    CookieConsent,
    NavigateToStartMonth,
    ProcessMonth,
    PickPendingDailyJournal,
    OpenDailyJournal,
    PickNoticeLink,
    PrepareSearch,
    ParseResultsPage,
    ProcessResultItem,
    OpenNextPage,
    OpenNotice,
    Done,
    Error,
}

impl CrawlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Home => "HOME",
            Self::CookieConsent => "COOKIE_CONSENT",
            Self::NavigateToStartMonth => "NAVIGATE_TO_START_MONTH",
            Self::ProcessMonth => "PROCESS_MONTH",
            Self::PickPendingDailyJournal => "PICK_PENDING_DAILY_JOURNAL",
            Self::OpenDailyJournal => "OPEN_DAILY_JOURNAL",
            Self::PickNoticeLink => "PICK_NOTICE_LINK",
            Self::PrepareSearch => "PREPARE_SEARCH",
            Self::ParseResultsPage => "PARSE_RESULTS_PAGE",
            Self::ProcessResultItem => "PROCESS_RESULT_ITEM",
            Self::OpenNextPage => "OPEN_NEXT_PAGE",
            Self::OpenNotice => "OPEN_NOTICE",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-less discriminant of [`CrawlError`], for exit reporting and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Navigation,
    ElementNotFound,
    Parse,
    Stall,
    Upsert,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrawlError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("{what} not found (tried: {selectors})")]
    ElementNotFound { what: String, selectors: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no forward progress: {0}")]
    Stall(String),
    #[error("upsert of {what} failed: {reason}")]
    Upsert { what: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CrawlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Navigation { .. } => ErrorKind::Navigation,
            Self::ElementNotFound { .. } => ErrorKind::ElementNotFound,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Stall(_) => ErrorKind::Stall,
            Self::Upsert { .. } => ErrorKind::Upsert,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn element_not_found(what: &str, selectors: &[&str]) -> Self {
        Self::ElementNotFound {
            what: what.to_string(),
            selectors: selectors.join(", "),
        }
    }
}
