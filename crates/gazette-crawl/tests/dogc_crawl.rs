use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use gazette_adapters::{DogcAdapter, SourceSite};
use gazette_core::{CrawlState, ErrorKind, Source, YearMonth};
use gazette_crawl::{resolve_source, CrawlOptions, CrawlRequest, Crawler, ResolvedSource, RunResult, ScriptedBrowser, SourceUrlOverrides};
use gazette_storage::{ArtifactRecorder, JournalStore, MemoryArtifactRecorder, MemoryJournalStore};

const SUMMARY_9575: &str = "https://dogc.gencat.cat/ca/sumari-del-dogc/?numDOGC=9575&language=ca_ES";
const SUMMARY_9576: &str = "https://dogc.gencat.cat/ca/sumari-del-dogc/?numDOGC=9576&language=ca_ES";
const SUMMARY_9577: &str = "https://dogc.gencat.cat/ca/sumari-del-dogc/?numDOGC=9577&language=ca_ES";
const EMPTY_SUMMARY: &str =
    r#"<html><head><title>Sumari</title></head><body><div class="wrapper-disposicions"></div></body></html>"#;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/dogc")
}

fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixtures_dir().join(name)).expect("read fixture")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn month(y: i32, m: u32) -> YearMonth {
    YearMonth::new(y, m).expect("valid month")
}

fn dogc_site(showing: YearMonth) -> ScriptedBrowser {
    let adapter = DogcAdapter;
    ScriptedBrowser::new(&adapter, adapter.default_base_url())
        .with_month(month(2025, 12), fixture("calendar_2025_12.html"))
        .with_month(month(2026, 1), fixture("calendar_2026_01.html"))
        .with_month(month(2026, 2), fixture("calendar_2026_02.html"))
        .with_month(month(2026, 3), fixture("calendar_2026_03.html"))
        .showing(showing)
}

fn dogc_site_with_notices() -> ScriptedBrowser {
    dogc_site(month(2026, 3))
        .with_page(SUMMARY_9575, fixture("summary_9575.html"))
        .with_page(SUMMARY_9576, EMPTY_SUMMARY)
        .with_page(SUMMARY_9577, EMPTY_SUMMARY)
        .with_page(
            "https://dogc.gencat.cat/ca/document-del-dogc/?documentId=1001",
            fixture("notice_1001.html"),
        )
        .with_page(
            "https://dogc.gencat.cat/ca/document-del-dogc/?documentId=1002",
            fixture("notice_1002.html"),
        )
        .with_page(
            "https://dogc.gencat.cat/ca/document-del-dogc/?documentId=1003",
            fixture("notice_1003.html"),
        )
}

fn dogc_row() -> Source {
    Source {
        id: 1,
        slug: "dogc".to_string(),
        base_url: None,
        daily_base_url: None,
        start_at: Some(date(2026, 1, 1)),
    }
}

fn store() -> MemoryJournalStore {
    MemoryJournalStore::with_sources(vec![dogc_row()])
}

fn resolved(start_at: Option<NaiveDate>) -> ResolvedSource {
    let request = CrawlRequest {
        slug: "dogc".to_string(),
        start_at,
        ..Default::default()
    };
    resolve_source(&dogc_row(), &request, &SourceUrlOverrides::default(), &DogcAdapter).expect("resolve source")
}

fn options(today: NaiveDate) -> CrawlOptions {
    let mut options = CrawlOptions::new("test-run", today);
    options.action_timeout = Duration::from_millis(50);
    options.poll_interval = Duration::from_millis(5);
    options
}

async fn crawl(
    browser: &mut ScriptedBrowser,
    store: &dyn JournalStore,
    recorder: &dyn ArtifactRecorder,
    source: &ResolvedSource,
    options: &CrawlOptions,
) -> RunResult {
    let adapter = DogcAdapter;
    Crawler::new(browser, store, recorder, &adapter).run(source, options).await
}

fn error_kind(result: &RunResult) -> Option<ErrorKind> {
    result.error.as_ref().map(|e| e.kind())
}

#[tokio::test]
async fn crawls_back_to_start_month_and_forward_to_today() {
    let mut browser = dogc_site(month(2026, 3));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert!(result.completed, "{:?}", result.error);
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.final_state, CrawlState::Done);
    assert_eq!(result.steps_executed, 7);
    assert_eq!(
        result.visited,
        vec![
            CrawlState::Home,
            CrawlState::NavigateToStartMonth,
            CrawlState::NavigateToStartMonth,
            CrawlState::NavigateToStartMonth,
            CrawlState::ProcessMonth,
            CrawlState::ProcessMonth,
            CrawlState::ProcessMonth,
        ]
    );
    assert_eq!(result.journals_created, 3);
    assert_eq!(result.journals_updated, 0);

    let journals = store.journals();
    let dates: Vec<NaiveDate> = journals.iter().map(|j| j.issue_date).collect();
    assert_eq!(dates, vec![date(2026, 1, 2), date(2026, 1, 5), date(2026, 1, 7)]);
    assert_eq!(journals[0].url, SUMMARY_9575);
    assert_eq!(journals[0].description, "DOGC núm. 9575");

    let clicks = browser.clicks();
    assert_eq!(clicks.len(), 4);
    assert!(clicks[..2].iter().all(|c| c.contains("ui-datepicker-prev")));
    assert!(clicks[2..].iter().all(|c| c.contains("ui-datepicker-next")));
    assert_eq!(browser.visible_month(), Some(month(2026, 3)));

    let steps = recorder.steps();
    assert_eq!(steps.len(), 7);
    assert_eq!(steps[0].note.as_deref(), Some("homepage_opened"));
    assert!(steps.iter().all(|s| s.has_html && s.has_screenshot));
}

#[tokio::test]
async fn second_run_over_same_calendar_changes_nothing() {
    let store = store();
    let recorder = MemoryArtifactRecorder::default();
    let source = resolved(None);
    let options = options(date(2026, 3, 10));

    let first = crawl(&mut dogc_site(month(2026, 3)), &store, &recorder, &source, &options).await;
    assert_eq!(first.journals_created, 3);
    let before = store.journals();

    let second = crawl(&mut dogc_site(month(2026, 3)), &store, &recorder, &source, &options).await;
    assert!(second.completed);
    assert_eq!(second.journals_created, 0);
    assert_eq!(second.journals_updated, 0);
    assert_eq!(second.journals_unchanged, 3);
    assert_eq!(store.journals(), before);
}

#[tokio::test]
async fn identical_inputs_produce_identical_runs() {
    let source = resolved(None);
    let options = options(date(2026, 3, 10));

    let mut runs = Vec::new();
    for _ in 0..2 {
        let mut browser = dogc_site(month(2026, 3));
        let store = store();
        let recorder = MemoryArtifactRecorder::default();
        let result = crawl(&mut browser, &store, &recorder, &source, &options).await;
        runs.push((result.visited, store.journals(), browser.clicks().to_vec(), recorder.steps()));
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn crosses_year_boundary_and_clips_to_today() {
    let mut browser = dogc_site(month(2026, 1));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(
        &mut browser,
        &store,
        &recorder,
        &resolved(Some(date(2025, 12, 31))),
        &options(date(2026, 1, 6)),
    )
    .await;

    assert!(result.completed, "{:?}", result.error);
    let dates: Vec<NaiveDate> = store.journals().iter().map(|j| j.issue_date).collect();
    assert_eq!(dates, vec![date(2025, 12, 31), date(2026, 1, 2), date(2026, 1, 5)]);
    assert_eq!(browser.clicks().len(), 2);
}

#[tokio::test]
async fn start_month_already_visible_needs_no_clicks() {
    let mut browser = dogc_site(month(2026, 3));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(
        &mut browser,
        &store,
        &recorder,
        &resolved(Some(date(2026, 3, 1))),
        &options(date(2026, 3, 10)),
    )
    .await;

    assert!(result.completed);
    assert_eq!(
        result.visited,
        vec![CrawlState::Home, CrawlState::NavigateToStartMonth, CrawlState::ProcessMonth]
    );
    assert!(browser.clicks().is_empty());
    assert!(store.journals().is_empty());
}

#[tokio::test]
async fn visible_month_before_start_is_a_configuration_error() {
    let mut browser = dogc_site(month(2026, 3));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(
        &mut browser,
        &store,
        &recorder,
        &resolved(Some(date(2026, 4, 1))),
        &options(date(2026, 4, 15)),
    )
    .await;

    assert!(!result.completed);
    assert_eq!(result.final_state, CrawlState::Error);
    assert_eq!(error_kind(&result), Some(ErrorKind::Config));
    assert_eq!(result.steps_executed, 2);
    assert!(browser.clicks().is_empty());
}

#[tokio::test]
async fn exhausted_step_budget_is_a_stall() {
    let mut browser = dogc_site(month(2026, 3));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();
    let mut options = options(date(2026, 3, 10));
    options.max_steps = 3;

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options).await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Stall));
    assert_eq!(result.steps_executed, 3);
    assert_eq!(recorder.steps().len(), 3);
    assert_eq!(result.exit_code(), 1);
}

#[tokio::test]
async fn calendar_that_never_moves_stalls() {
    let mut browser = dogc_site(month(2026, 3)).frozen_calendar();
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Stall));
    assert_eq!(result.steps_executed, 2);
    assert_eq!(browser.clicks().len(), 1);
    let steps = recorder.steps();
    assert_eq!(steps[1].state, "NAVIGATE_TO_START_MONTH");
    assert_eq!(steps[1].note.as_deref(), Some("failed"));
}

#[tokio::test]
async fn clickable_day_missing_from_the_month_is_a_parse_error() {
    let february = fixture("calendar_2026_02.html").replacen(
        "</tbody>",
        r##"<tr><td class=" has-publicacio" title="?numDOGC=9599&amp;language=ca_ES" data-handler="selectDay"><a class="ui-state-default" href="#">30</a></td></tr></tbody>"##,
        1,
    );
    let adapter = DogcAdapter;
    let mut browser = ScriptedBrowser::new(&adapter, adapter.default_base_url())
        .with_month(month(2026, 2), february)
        .showing(month(2026, 2));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(
        &mut browser,
        &store,
        &recorder,
        &resolved(Some(date(2026, 2, 1))),
        &options(date(2026, 2, 20)),
    )
    .await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Parse));
    assert_eq!(result.final_state, CrawlState::Error);
    assert_eq!(result.steps_executed, 3);
    assert!(store.journals().is_empty());
    let steps = recorder.steps();
    assert_eq!(steps[2].state, "PROCESS_MONTH");
    assert_eq!(steps[2].note.as_deref(), Some("failed"));
}

#[tokio::test]
async fn unreadable_calendar_header_is_a_parse_error() {
    let march = fixture("calendar_2026_03.html").replace(">Març<", ">Brumari<");
    let adapter = DogcAdapter;
    let mut browser = ScriptedBrowser::new(&adapter, adapter.default_base_url())
        .with_month(month(2026, 3), march)
        .showing(month(2026, 3));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Parse));
    assert_eq!(result.steps_executed, 2);
    assert_eq!(result.visited.last(), Some(&CrawlState::NavigateToStartMonth));
    assert!(browser.clicks().is_empty());
}

#[tokio::test]
async fn calendar_stuck_after_next_click_stalls_in_process_month() {
    let mut browser = dogc_site(month(2026, 2)).frozen_calendar();
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(
        &mut browser,
        &store,
        &recorder,
        &resolved(Some(date(2026, 2, 1))),
        &options(date(2026, 3, 10)),
    )
    .await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Stall));
    let message = result.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
    assert!(message.contains("next month"), "{message}");
    assert_eq!(result.steps_executed, 3);
    assert_eq!(result.visited.last(), Some(&CrawlState::ProcessMonth));
    assert_eq!(browser.clicks().len(), 1);
    assert!(browser.clicks()[0].contains("ui-datepicker-next"));
}

#[tokio::test]
async fn calendar_jumping_past_the_end_month_finishes_the_run() {
    let adapter = DogcAdapter;
    let mut browser = ScriptedBrowser::new(&adapter, adapter.default_base_url())
        .with_month(month(2026, 1), fixture("calendar_2026_01.html"))
        .with_month(month(2026, 3), fixture("calendar_2026_03.html"))
        .showing(month(2026, 1));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 2, 15))).await;

    assert!(result.completed, "{:?}", result.error);
    assert_eq!(result.final_state, CrawlState::Done);
    assert_eq!(result.journals_created, 3);
    assert_eq!(store.journals().len(), 3);
    let steps = recorder.steps();
    let last = steps.last().expect("recorded steps");
    assert_eq!(last.state, "PROCESS_MONTH");
    assert_eq!(last.note.as_deref(), Some("past_end_month_2026_03"));
}

#[tokio::test]
async fn missing_previous_control_is_element_not_found() {
    let march = fixture("calendar_2026_03.html");
    let start = march.find(r#"<a class="ui-datepicker-prev"#).expect("prev control in fixture");
    let end = start + march[start..].find("</a>").expect("closing tag") + "</a>".len();
    let stripped = format!("{}{}", &march[..start], &march[end..]);

    let adapter = DogcAdapter;
    let mut browser = ScriptedBrowser::new(&adapter, adapter.default_base_url())
        .with_month(month(2026, 3), stripped)
        .showing(month(2026, 3));
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert_eq!(error_kind(&result), Some(ErrorKind::ElementNotFound));
    assert_eq!(result.steps_executed, 2);
    assert!(browser.clicks().is_empty());
}

#[tokio::test]
async fn failed_upsert_stops_the_run_and_keeps_earlier_rows() {
    let mut browser = dogc_site(month(2026, 3));
    let store = store().fail_journal_writes_after(2);
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Upsert));
    assert_eq!(result.journals_created, 2);
    assert_eq!(store.journals().len(), 2);
    assert_eq!(result.visited.last(), Some(&CrawlState::ProcessMonth));
}

#[tokio::test]
async fn unreachable_home_page_is_a_navigation_error() {
    let adapter = DogcAdapter;
    let mut browser = dogc_site(month(2026, 3)).failing(adapter.default_base_url());
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert_eq!(error_kind(&result), Some(ErrorKind::Navigation));
    assert_eq!(result.steps_executed, 1);
    let steps = recorder.steps();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].state, "HOME");
    assert_eq!(steps[0].note.as_deref(), Some("failed"));
}

#[tokio::test]
async fn cookie_banner_is_accepted_once_then_crawl_resumes() {
    let mut browser = dogc_site(month(2026, 3)).with_cookie_banner();
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert!(result.completed, "{:?}", result.error);
    assert_eq!(result.steps_executed, 8);
    assert_eq!(result.visited[0], CrawlState::Home);
    assert_eq!(result.visited[1], CrawlState::CookieConsent);
    assert_eq!(result.visited[2], CrawlState::NavigateToStartMonth);
    assert_eq!(result.journals_created, 3);
    assert!(browser.clicks()[0].contains("ppms_cm_agree-to-all"));
    assert_eq!(recorder.steps()[1].note.as_deref(), Some("accepted_all"));
}

#[tokio::test]
async fn notice_pass_visits_each_pending_journal_once() {
    let mut browser = dogc_site_with_notices();
    let store = store();
    let recorder = MemoryArtifactRecorder::default();
    let mut options = options(date(2026, 3, 10));
    options.with_notices = true;

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options).await;

    assert!(result.completed, "{:?}", result.error);
    assert_eq!(result.journals_created, 3);
    assert_eq!(result.notices_upserted, 3);
    assert_eq!(result.steps_executed, 21);
    assert_eq!(result.visited[7], CrawlState::PickPendingDailyJournal);
    assert_eq!(result.visited.last(), Some(&CrawlState::PickPendingDailyJournal));

    let opened: Vec<&str> = browser
        .navigations()
        .iter()
        .map(String::as_str)
        .filter(|url| url.contains("sumari-del-dogc"))
        .collect();
    assert_eq!(opened, vec![SUMMARY_9575, SUMMARY_9576, SUMMARY_9577]);

    let journal_id = store.journals()[0].id;
    let notices = store.notices();
    assert_eq!(notices.len(), 3);
    assert!(notices.iter().all(|n| n.daily_journal_id == journal_id));

    let first = &notices[0];
    assert!(first.title.starts_with("RESOLUCIÓ PRE/1/2026"));
    assert_eq!(first.category, "Disposicions");
    assert_eq!(first.department, "Departament de la Presidència");
    assert!(!first.content.is_empty());
    assert!(first.extra_info.contains("Número de control: 26001001"));

    let second = &notices[1];
    assert!(second.title.starts_with("ORDRE ECO/2/2026"));
    assert_eq!(second.category, "Disposicions");
    assert_eq!(second.url, "https://dogc.gencat.cat/ca/document-del-dogc/?documentId=1002");

    let third = &notices[2];
    assert_eq!(third.category, "Anuncis");
    assert_eq!(third.department, "Ajuntament de Girona");
}

#[tokio::test]
async fn notice_pass_is_skipped_without_the_flag() {
    let mut browser = dogc_site_with_notices();
    let store = store();
    let recorder = MemoryArtifactRecorder::default();

    let result = crawl(&mut browser, &store, &recorder, &resolved(None), &options(date(2026, 3, 10))).await;

    assert!(result.completed);
    assert_eq!(result.notices_upserted, 0);
    assert!(store.notices().is_empty());
    assert!(!result.visited.contains(&CrawlState::PickPendingDailyJournal));
}
