//! State machine for gazettes crawled through a date-range search form:
//! fill the range, submit, walk the paginated results and store one journal
//! and one notice per hit.

use async_trait::async_trait;
use gazette_adapters::{first_present, SearchAdapter};
use gazette_core::{CrawlError, CrawlState, DateWindow, NoticeDraft};
use gazette_storage::{ArtifactRecorder, JournalStore};
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserError, BrowserSession};
use crate::{
    click_target, drive, live_url, navigation_error, open_url, or_fallback, read_page, selectors_of, validate,
    within, CrawlOptions, CrawlRunContext, ResolvedSource, RunResult, StateMachine, Transition,
};

pub struct SearchCrawler<'a> {
    browser: &'a mut dyn BrowserSession,
    store: &'a dyn JournalStore,
    recorder: &'a dyn ArtifactRecorder,
    adapter: &'a dyn SearchAdapter,
}

fn store_error(what: String) -> impl FnOnce(gazette_storage::StoreError) -> CrawlError {
    move |e| CrawlError::Upsert {
        what,
        reason: e.to_string(),
    }
}

impl<'a> SearchCrawler<'a> {
    pub fn new(
        browser: &'a mut dyn BrowserSession,
        store: &'a dyn JournalStore,
        recorder: &'a dyn ArtifactRecorder,
        adapter: &'a dyn SearchAdapter,
    ) -> Self {
        Self {
            browser,
            store,
            recorder,
            adapter,
        }
    }

    /// Crawls the explicit window from `options`, or everything after the
    /// latest stored issue up to today. An empty window completes without
    /// opening the browser.
    pub async fn run(&mut self, source: &ResolvedSource, options: &CrawlOptions) -> RunResult {
        let mut ctx = CrawlRunContext::new(source, options);
        info!(run_id = %options.run_id, slug = %source.slug, "search crawl starting");

        if let Err(err) = validate(source, options) {
            error!(run_id = %options.run_id, error = %err, "crawl configuration rejected");
            ctx.state = CrawlState::Error;
            return ctx.into_result(Some(err), Vec::new());
        }

        let window = match self.crawl_window(&ctx).await {
            Ok(Some(window)) => window,
            Ok(None) => {
                info!(slug = %source.slug, today = %options.today, "nothing to crawl");
                ctx.state = CrawlState::Done;
                return ctx.into_result(None, Vec::new());
            }
            Err(err) => {
                error!(run_id = %options.run_id, error = %err, "crawl window unavailable");
                ctx.state = CrawlState::Error;
                return ctx.into_result(Some(err), Vec::new());
            }
        };
        ctx.start_issue_date = window.from;
        ctx.end_issue_date = window.to;
        info!(window = %window, "crawl window resolved");

        drive(self, ctx).await
    }

    async fn crawl_window(&self, ctx: &CrawlRunContext) -> Result<Option<DateWindow>, CrawlError> {
        if let Some(window) = ctx.options.date_window {
            info!(window = %window, "using requested window");
            return Ok(Some(window));
        }

        let latest = self
            .store
            .latest_issue_date(ctx.source.source_id)
            .await
            .map_err(store_error("latest daily journal".to_string()))?;
        let from = match latest {
            Some(latest) => {
                let next = latest
                    .succ_opt()
                    .ok_or_else(|| CrawlError::Config(format!("no issue date follows {latest}")))?;
                info!(latest = %latest, from = %next, "continuing after the latest stored issue");
                next
            }
            None => {
                info!(start_at = %ctx.source.start_at, "no stored issues; starting at start_at");
                ctx.source.start_at
            }
        };
        Ok(DateWindow::new(from, ctx.options.today))
    }

    async fn fill(&mut self, ctx: &CrawlRunContext, selector: &'static str, value: &str) -> Result<(), CrawlError> {
        debug!(selector, value, "filling input");
        within(ctx.options.action_timeout, "fill input", self.browser.fill(selector, value))
            .await
            .map_err(|e| match e {
                BrowserError::ElementNotFound(_) => CrawlError::element_not_found("search date input", &[selector]),
                other => navigation_error(&ctx.page_url, other),
            })
    }

    /// Polls until the page answers the search. After a submit a changed URL
    /// or a search marker in it is enough; otherwise the page itself must
    /// show results, pagination or an empty-result message.
    async fn wait_for_results(
        &mut self,
        ctx: &mut CrawlRunContext,
        submitted_from: Option<&str>,
        action: &str,
    ) -> Result<(), CrawlError> {
        let adapter = self.adapter;
        let layout = adapter.search_layout();
        let timeout = ctx.options.action_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let url = live_url(&mut *self.browser, ctx).await;
            let moved = submitted_from.is_some_and(|before| {
                url != before || layout.response_url_markers.iter().any(|marker| url.contains(marker))
            });
            let ready = match within(timeout, "read page", self.browser.read_dom()).await {
                Ok(html) => adapter.results_ready(&html)?,
                Err(err) => {
                    debug!(error = %err, "page not readable yet");
                    false
                }
            };
            if moved || ready {
                ctx.page_url = url;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CrawlError::Stall(format!("no search response {timeout:?} after {action}")));
            }
            tokio::time::sleep(ctx.options.poll_interval).await;
        }
    }

    async fn home(&mut self, ctx: &mut CrawlRunContext) -> Result<Transition, CrawlError> {
        let url = ctx.source.base_url.clone();
        info!(url = %url, "opening search page");
        open_url(&mut *self.browser, ctx, &url).await?;

        let layout = self.adapter.search_layout();
        let timeout = ctx.options.action_timeout;
        for input in [layout.from_input, layout.to_input] {
            within(timeout, "waiting for search form", self.browser.wait_for(input, timeout))
                .await
                .map_err(|e| navigation_error(&url, e))?;
        }
        Ok(Transition::noted(CrawlState::PrepareSearch, "search_page_opened"))
    }

    async fn prepare_search(&mut self, ctx: &mut CrawlRunContext) -> Result<Transition, CrawlError> {
        let adapter = self.adapter;
        let layout = adapter.search_layout();
        let from = ctx.start_issue_date.format("%Y-%m-%d").to_string();
        let to = ctx.end_issue_date.format("%Y-%m-%d").to_string();
        info!(from = %from, to = %to, "setting search date range");
        self.fill(ctx, layout.from_input, &from).await?;
        self.fill(ctx, layout.to_input, &to).await?;

        let html = read_page(&mut *self.browser, ctx).await?;
        let submit = first_present(&html, layout.submit_controls)?.ok_or_else(|| {
            CrawlError::element_not_found("search submit control", &selectors_of(layout.submit_controls))
        })?;
        let before = live_url(&mut *self.browser, ctx).await;
        debug!(control = %submit, "submitting search");
        click_target(&mut *self.browser, ctx, "search submit control", submit).await?;
        self.wait_for_results(ctx, Some(before.as_str()), "submitting the search").await?;
        info!(url = %ctx.page_url, "search response loaded");
        Ok(Transition::noted(CrawlState::ParseResultsPage, "search_submitted"))
    }

    async fn parse_results_page(&mut self, ctx: &mut CrawlRunContext) -> Result<Transition, CrawlError> {
        let html = read_page(&mut *self.browser, ctx).await?;
        let page_url = live_url(&mut *self.browser, ctx).await;
        let page = self.adapter.parse_results_page(&html, &page_url, ctx.window())?;

        ctx.results_pages += 1;
        ctx.page_url = page_url.clone();
        ctx.visited_result_pages.insert(page_url.clone());
        if page.skipped > 0 {
            warn!(skipped = page.skipped, url = %page_url, "results without a readable publication line");
        }
        info!(
            page = ctx.results_pages,
            seen = page.items_seen,
            in_window = page.results.len(),
            outside_window = page.outside_window,
            next = page.next_page_url.as_deref().unwrap_or(""),
            "results page parsed"
        );

        ctx.pending_results = page.results.into();
        ctx.next_page_url = page.next_page_url;
        Ok(Transition::noted(CrawlState::ProcessResultItem, "results_page_parsed"))
    }

    async fn process_result_item(&mut self, ctx: &mut CrawlRunContext) -> Result<Transition, CrawlError> {
        if let Some(result) = ctx.pending_results.pop_front() {
            debug!(
                issue_date = %result.issue_date,
                category = %result.category,
                title = %result.title,
                "selected search result"
            );
            ctx.current_result = Some(result);
            return Ok(Transition::to(CrawlState::OpenNotice));
        }
        if ctx.next_page_url.is_some() {
            return Ok(Transition::to(CrawlState::OpenNextPage));
        }
        info!(pages = ctx.results_pages, "no results left and no next page");
        Ok(Transition::noted(CrawlState::Done, "no_more_results"))
    }

    async fn open_notice(&mut self, ctx: &mut CrawlRunContext) -> Result<Transition, CrawlError> {
        let Some(result) = ctx.current_result.clone() else {
            warn!("no search result selected");
            return Ok(Transition::to(CrawlState::ProcessResultItem));
        };
        let source_id = ctx.source.source_id;
        let journal_url = self
            .adapter
            .daily_journal_url(&ctx.source.daily_base_url, result.issue_date);
        let outcome = self
            .store
            .upsert_daily_journal(source_id, result.issue_date, &journal_url, &result.journal_description)
            .await
            .map_err(store_error(format!("daily journal {}", result.issue_date)))?;
        ctx.record_journal(outcome);
        let journal = self
            .store
            .find_daily_journal(source_id, result.issue_date)
            .await
            .map_err(store_error(format!("daily journal {}", result.issue_date)))?
            .ok_or_else(|| CrawlError::Upsert {
                what: format!("daily journal {}", result.issue_date),
                reason: "row missing after upsert".to_string(),
            })?;
        info!(
            journal_id = journal.id,
            issue_date = %journal.issue_date,
            description = %journal.description,
            outcome = ?outcome,
            "upserted daily journal"
        );

        info!(url = %result.detail_url, "opening result document");
        open_url(&mut *self.browser, ctx, &result.detail_url).await?;
        let title = self.adapter.search_layout().detail_title;
        let timeout = ctx.options.action_timeout;
        within(timeout, "waiting for document title", self.browser.wait_for(title, timeout))
            .await
            .map_err(|e| match e {
                BrowserError::Timeout { .. } | BrowserError::ElementNotFound(_) => {
                    CrawlError::element_not_found("document title", &[title])
                }
                other => navigation_error(&result.detail_url, other),
            })?;

        let html = read_page(&mut *self.browser, ctx).await?;
        let detail = self.adapter.parse_notice_detail(&html)?;
        let page_url = or_fallback(live_url(&mut *self.browser, ctx).await, &result.detail_url);
        let draft = NoticeDraft {
            daily_journal_id: journal.id,
            title: or_fallback(detail.title, &result.title),
            category: or_fallback(detail.category, &result.category),
            department: or_fallback(detail.department, &result.department),
            url: detail
                .permalink
                .filter(|permalink| !permalink.trim().is_empty())
                .unwrap_or(page_url),
            content: detail.content,
            extra_info: detail.extra_info,
        };
        let outcome = self
            .store
            .upsert_notice(&draft)
            .await
            .map_err(store_error(format!("notice {}", draft.url)))?;
        ctx.notices_upserted += 1;
        info!(
            journal_id = journal.id,
            title = %draft.title,
            category = %draft.category,
            department = %draft.department,
            url = %draft.url,
            content_len = draft.content.len(),
            outcome = ?outcome,
            "upserted notice"
        );

        ctx.current_result = None;
        Ok(Transition::noted(
            CrawlState::ProcessResultItem,
            format!("notice_{}", journal.id),
        ))
    }

    async fn open_next_page(&mut self, ctx: &mut CrawlRunContext) -> Result<Transition, CrawlError> {
        let Some(url) = ctx.next_page_url.take() else {
            return Ok(Transition::noted(CrawlState::Done, "no_next_page"));
        };
        if ctx.visited_result_pages.contains(&url) {
            return Err(CrawlError::Stall(format!("results page {url} was already parsed in this run")));
        }

        info!(url = %url, page = ctx.results_pages + 1, "opening next results page");
        open_url(&mut *self.browser, ctx, &url).await?;
        self.wait_for_results(ctx, None, "opening the next results page").await?;
        Ok(Transition::noted(CrawlState::ParseResultsPage, "next_page_opened"))
    }
}

#[async_trait(?Send)]
impl StateMachine for SearchCrawler<'_> {
    fn browser(&mut self) -> &mut dyn BrowserSession {
        &mut *self.browser
    }

    fn recorder(&self) -> &dyn ArtifactRecorder {
        self.recorder
    }

    async fn dispatch(&mut self, state: CrawlState, ctx: &mut CrawlRunContext) -> Result<Transition, CrawlError> {
        match state {
            CrawlState::Home => self.home(ctx).await,
            CrawlState::PrepareSearch => self.prepare_search(ctx).await,
            CrawlState::ParseResultsPage => self.parse_results_page(ctx).await,
            CrawlState::ProcessResultItem => self.process_result_item(ctx).await,
            CrawlState::OpenNotice => self.open_notice(ctx).await,
            CrawlState::OpenNextPage => self.open_next_page(ctx).await,
            CrawlState::Done | CrawlState::Error => Ok(Transition::to(state)),
            other => Err(CrawlError::Config(format!("state {other} is not part of the search crawl"))),
        }
    }
}
