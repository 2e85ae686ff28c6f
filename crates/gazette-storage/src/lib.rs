//! Step artifact storage and the journal persistence seam.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use gazette_core::{CrawlState, DailyJournal, Notice, NoticeDraft, Source, UpsertOutcome};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gazette-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Everything captured for one FSM step.
#[derive(Debug, Clone, Default)]
pub struct StepArtifact {
    pub run_id: String,
    pub slug: String,
    pub step_index: u32,
    pub state: Option<CrawlState>,
    pub note: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub screenshot: Option<Vec<u8>>,
    pub html: Option<String>,
    pub snapshot: Option<serde_json::Value>,
}

impl StepArtifact {
    pub fn state_name(&self) -> &'static str {
        self.state.map(CrawlState::as_str).unwrap_or("UNKNOWN")
    }
}

#[derive(Debug, Clone, Serialize)]
struct StepMetadata<'a> {
    run_id: &'a str,
    slug: &'a str,
    step_index: u32,
    state: &'a str,
    note: Option<&'a str>,
    captured_at: String,
    url: Option<&'a str>,
    title: Option<&'a str>,
    png: Option<String>,
    html: Option<String>,
    html_sha256: Option<String>,
    snapshot: Option<&'a serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct StoredStep {
    pub prefix: String,
    pub png: Option<PathBuf>,
    pub html: Option<PathBuf>,
    pub meta: PathBuf,
}

/// Sink for per-step diagnostics. Implementations swallow their own failures.
#[async_trait]
pub trait ArtifactRecorder: Send + Sync {
    async fn record(&self, artifact: &StepArtifact);
}

/// Filesystem layout: `<root>/<slug>/<run_id>/steps/<NNN>_<state>[_<note>].{png,html,json}`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_dir(&self, slug: &str, run_id: &str) -> PathBuf {
        self.root.join(slug).join(run_id)
    }

    pub fn steps_dir(&self, slug: &str, run_id: &str) -> PathBuf {
        self.run_dir(slug, run_id).join("steps")
    }

    pub fn step_prefix(step_index: u32, state: &str, note: Option<&str>) -> String {
        let mut prefix = format!("{step_index:03}_{}", state.to_ascii_lowercase());
        if let Some(note) = note.map(sanitize_note).filter(|n| !n.is_empty()) {
            prefix.push('_');
            prefix.push_str(&note);
        }
        prefix
    }

    pub async fn store_step(&self, artifact: &StepArtifact) -> anyhow::Result<StoredStep> {
        let steps_dir = self.steps_dir(&artifact.slug, &artifact.run_id);
        fs::create_dir_all(&steps_dir)
            .await
            .with_context(|| format!("creating steps directory {}", steps_dir.display()))?;

        let prefix = Self::step_prefix(
            artifact.step_index,
            artifact.state_name(),
            artifact.note.as_deref(),
        );

        let mut png = None;
        if let Some(bytes) = &artifact.screenshot {
            let path = steps_dir.join(format!("{prefix}.png"));
            write_atomic(&path, bytes).await?;
            png = Some(path);
        }

        let mut html = None;
        let mut html_sha256 = None;
        if let Some(text) = &artifact.html {
            let path = steps_dir.join(format!("{prefix}.html"));
            write_atomic(&path, text.as_bytes()).await?;
            html_sha256 = Some(Self::sha256_hex(text.as_bytes()));
            html = Some(path);
        }

        let metadata = StepMetadata {
            run_id: &artifact.run_id,
            slug: &artifact.slug,
            step_index: artifact.step_index,
            state: artifact.state_name(),
            note: artifact.note.as_deref(),
            captured_at: Utc::now().to_rfc3339(),
            url: artifact.url.as_deref(),
            title: artifact.title.as_deref(),
            png: png.as_ref().map(|p| p.display().to_string()),
            html: html.as_ref().map(|p| p.display().to_string()),
            html_sha256,
            snapshot: artifact.snapshot.as_ref(),
        };
        let meta = steps_dir.join(format!("{prefix}.json"));
        let bytes = serde_json::to_vec_pretty(&metadata).context("serializing step metadata")?;
        write_atomic(&meta, &bytes).await?;

        Ok(StoredStep {
            prefix,
            png,
            html,
            meta,
        })
    }
}

#[async_trait]
impl ArtifactRecorder for ArtifactStore {
    async fn record(&self, artifact: &StepArtifact) {
        match self.store_step(artifact).await {
            Ok(stored) => debug!(
                step = artifact.step_index,
                state = artifact.state_name(),
                meta = %stored.meta.display(),
                "step artifacts saved"
            ),
            Err(err) => warn!(
                step = artifact.step_index,
                state = artifact.state_name(),
                error = %format!("{err:#}"),
                "failed to write step artifacts"
            ),
        }
    }
}

fn sanitize_note(note: &str) -> String {
    note.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// Write through a temp file in the same directory and rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path {} has no parent", path.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp artifact {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Summary of a recorded step kept by [`MemoryArtifactRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStep {
    pub step_index: u32,
    pub state: &'static str,
    pub note: Option<String>,
    pub has_html: bool,
    pub has_screenshot: bool,
}

#[derive(Debug, Default)]
pub struct MemoryArtifactRecorder {
    steps: Mutex<Vec<RecordedStep>>,
}

impl MemoryArtifactRecorder {
    pub fn steps(&self) -> Vec<RecordedStep> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactRecorder for MemoryArtifactRecorder {
    async fn record(&self, artifact: &StepArtifact) {
        let step = RecordedStep {
            step_index: artifact.step_index,
            state: artifact.state_name(),
            note: artifact.note.clone(),
            has_html: artifact.html.is_some(),
            has_screenshot: artifact.screenshot.is_some(),
        };
        match self.steps.lock() {
            Ok(mut steps) => steps.push(step),
            Err(_) => warn!("memory artifact recorder lock poisoned"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Persistence operations the crawler relies on. Every write is a single-row,
/// idempotent statement.
#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn find_source_by_slug(&self, slug: &str) -> Result<Option<Source>, StoreError>;

    async fn upsert_daily_journal(
        &self,
        source_id: i64,
        issue_date: NaiveDate,
        url: &str,
        description: &str,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn find_daily_journal(
        &self,
        source_id: i64,
        issue_date: NaiveDate,
    ) -> Result<Option<DailyJournal>, StoreError>;

    /// Most recent issue date stored for `source_id`.
    async fn latest_issue_date(&self, source_id: i64) -> Result<Option<NaiveDate>, StoreError>;

    /// Journals of `source_id` without any notice, oldest issue first.
    async fn pending_daily_journals(&self, source_id: i64) -> Result<Vec<DailyJournal>, StoreError>;

    async fn upsert_notice(&self, draft: &NoticeDraft) -> Result<UpsertOutcome, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgJournalStore {
    pool: PgPool,
}

impl PgJournalStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JournalStore for PgJournalStore {
    async fn find_source_by_slug(&self, slug: &str) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, slug, base_url, daily_base_url, start_at
              FROM sources
             WHERE slug = $1
             LIMIT 1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<Source, StoreError> {
            Ok(Source {
                id: r.try_get("id")?,
                slug: r.try_get("slug")?,
                base_url: r.try_get("base_url")?,
                daily_base_url: r.try_get("daily_base_url")?,
                start_at: r.try_get("start_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_daily_journal(
        &self,
        source_id: i64,
        issue_date: NaiveDate,
        url: &str,
        description: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        // No row comes back when the conflicting row already holds identical values.
        let row = sqlx::query(
            r#"
            INSERT INTO daily_journals (source_id, issue_date, url, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (source_id, issue_date)
            DO UPDATE SET
                url = EXCLUDED.url,
                description = EXCLUDED.description,
                updated_at = NOW()
            WHERE daily_journals.url IS DISTINCT FROM EXCLUDED.url
               OR daily_journals.description IS DISTINCT FROM EXCLUDED.description
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(source_id)
        .bind(issue_date)
        .bind(url)
        .bind(description)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => UpsertOutcome::Unchanged,
            Some(r) if r.try_get::<bool, _>("inserted")? => UpsertOutcome::Created,
            Some(_) => UpsertOutcome::Updated,
        })
    }

    async fn find_daily_journal(
        &self,
        source_id: i64,
        issue_date: NaiveDate,
    ) -> Result<Option<DailyJournal>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_id, issue_date, url, description
              FROM daily_journals
             WHERE source_id = $1 AND issue_date = $2
            "#,
        )
        .bind(source_id)
        .bind(issue_date)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<DailyJournal, StoreError> {
            Ok(DailyJournal {
                id: r.try_get("id")?,
                source_id: r.try_get("source_id")?,
                issue_date: r.try_get("issue_date")?,
                url: r.try_get("url")?,
                description: r.try_get("description")?,
            })
        })
        .transpose()
    }

    async fn latest_issue_date(&self, source_id: i64) -> Result<Option<NaiveDate>, StoreError> {
        let latest: Option<NaiveDate> =
            sqlx::query_scalar("SELECT MAX(issue_date) FROM daily_journals WHERE source_id = $1")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn pending_daily_journals(&self, source_id: i64) -> Result<Vec<DailyJournal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT dj.id, dj.source_id, dj.issue_date, dj.url, dj.description
              FROM daily_journals dj
              LEFT JOIN notices n ON n.daily_journal_id = dj.id
             WHERE dj.source_id = $1
             GROUP BY dj.id
            HAVING COUNT(n.id) = 0
             ORDER BY dj.issue_date ASC, dj.id ASC
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(DailyJournal {
                id: r.try_get("id")?,
                source_id: r.try_get("source_id")?,
                issue_date: r.try_get("issue_date")?,
                url: r.try_get("url")?,
                description: r.try_get("description")?,
            });
        }
        Ok(out)
    }

    async fn upsert_notice(&self, draft: &NoticeDraft) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut existing = None;
        if !draft.url.is_empty() {
            existing = sqlx::query(
                r#"
                SELECT id, title, category, department, url, content, extra_info
                  FROM notices
                 WHERE daily_journal_id = $1 AND url = $2
                 ORDER BY id ASC
                 LIMIT 1
                "#,
            )
            .bind(draft.daily_journal_id)
            .bind(&draft.url)
            .fetch_optional(&mut *tx)
            .await?;
        }
        if existing.is_none() {
            existing = sqlx::query(
                r#"
                SELECT id, title, category, department, url, content, extra_info
                  FROM notices
                 WHERE daily_journal_id = $1 AND title = $2
                 ORDER BY id ASC
                 LIMIT 1
                "#,
            )
            .bind(draft.daily_journal_id)
            .bind(&draft.title)
            .fetch_optional(&mut *tx)
            .await?;
        }

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO notices
                        (daily_journal_id, title, category, department, url, content, extra_info, created_at, updated_at)
                    VALUES
                        ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
                    "#,
                )
                .bind(draft.daily_journal_id)
                .bind(&draft.title)
                .bind(&draft.category)
                .bind(&draft.department)
                .bind(&draft.url)
                .bind(&draft.content)
                .bind(&draft.extra_info)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Created
            }
            Some(row) => {
                let current = Notice {
                    id: row.try_get("id")?,
                    daily_journal_id: draft.daily_journal_id,
                    title: row.try_get("title")?,
                    category: row.try_get("category")?,
                    department: row.try_get("department")?,
                    url: row.try_get("url")?,
                    content: row.try_get("content")?,
                    extra_info: row.try_get("extra_info")?,
                };
                if notice_matches(&current, draft) {
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(
                        r#"
                        UPDATE notices
                           SET title = $1,
                               category = $2,
                               department = $3,
                               url = $4,
                               content = $5,
                               extra_info = $6,
                               updated_at = NOW()
                         WHERE id = $7
                        "#,
                    )
                    .bind(&draft.title)
                    .bind(&draft.category)
                    .bind(&draft.department)
                    .bind(&draft.url)
                    .bind(&draft.content)
                    .bind(&draft.extra_info)
                    .bind(current.id)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

fn notice_matches(current: &Notice, draft: &NoticeDraft) -> bool {
    current.title == draft.title
        && current.category == draft.category
        && current.department == draft.department
        && current.url == draft.url
        && current.content == draft.content
        && current.extra_info == draft.extra_info
}

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<Source>,
    journals: BTreeMap<(i64, NaiveDate), DailyJournal>,
    notices: Vec<Notice>,
    next_journal_id: i64,
    next_notice_id: i64,
    journal_writes: usize,
    fail_journal_writes_after: Option<usize>,
}

/// In-process store with the same upsert semantics as [`PgJournalStore`].
#[derive(Debug, Default)]
pub struct MemoryJournalStore {
    state: Mutex<MemoryState>,
}

impl MemoryJournalStore {
    pub fn with_sources(sources: Vec<Source>) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.lock() {
            state.sources = sources;
        }
        store
    }

    /// Make every journal upsert after the first `writes` ones fail.
    pub fn fail_journal_writes_after(self, writes: usize) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.fail_journal_writes_after = Some(writes);
        }
        self
    }

    pub fn journals(&self) -> Vec<DailyJournal> {
        self.state
            .lock()
            .map(|s| s.journals.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.state
            .lock()
            .map(|s| s.notices.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Message("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JournalStore for MemoryJournalStore {
    async fn find_source_by_slug(&self, slug: &str) -> Result<Option<Source>, StoreError> {
        let state = self.lock()?;
        Ok(state.sources.iter().find(|s| s.slug == slug).cloned())
    }

    async fn upsert_daily_journal(
        &self,
        source_id: i64,
        issue_date: NaiveDate,
        url: &str,
        description: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.lock()?;
        if let Some(limit) = state.fail_journal_writes_after {
            if state.journal_writes >= limit {
                return Err(StoreError::Message(format!(
                    "simulated write failure for {issue_date}"
                )));
            }
        }
        state.journal_writes += 1;

        if let Some(existing) = state.journals.get_mut(&(source_id, issue_date)) {
            if existing.url == url && existing.description == description {
                return Ok(UpsertOutcome::Unchanged);
            }
            existing.url = url.to_string();
            existing.description = description.to_string();
            return Ok(UpsertOutcome::Updated);
        }

        state.next_journal_id += 1;
        let id = state.next_journal_id;
        state.journals.insert(
            (source_id, issue_date),
            DailyJournal {
                id,
                source_id,
                issue_date,
                url: url.to_string(),
                description: description.to_string(),
            },
        );
        Ok(UpsertOutcome::Created)
    }

    async fn find_daily_journal(
        &self,
        source_id: i64,
        issue_date: NaiveDate,
    ) -> Result<Option<DailyJournal>, StoreError> {
        let state = self.lock()?;
        Ok(state.journals.get(&(source_id, issue_date)).cloned())
    }

    async fn latest_issue_date(&self, source_id: i64) -> Result<Option<NaiveDate>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .journals
            .keys()
            .filter(|(id, _)| *id == source_id)
            .map(|(_, date)| *date)
            .max())
    }

    async fn pending_daily_journals(&self, source_id: i64) -> Result<Vec<DailyJournal>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .journals
            .values()
            .filter(|j| j.source_id == source_id)
            .filter(|j| !state.notices.iter().any(|n| n.daily_journal_id == j.id))
            .cloned()
            .collect())
    }

    async fn upsert_notice(&self, draft: &NoticeDraft) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.lock()?;
        let by_url = if draft.url.is_empty() {
            None
        } else {
            state
                .notices
                .iter()
                .position(|n| n.daily_journal_id == draft.daily_journal_id && n.url == draft.url)
        };
        let index = by_url.or_else(|| {
            state
                .notices
                .iter()
                .position(|n| n.daily_journal_id == draft.daily_journal_id && n.title == draft.title)
        });

        if let Some(existing) = index.and_then(|i| state.notices.get_mut(i)) {
            if notice_matches(existing, draft) {
                return Ok(UpsertOutcome::Unchanged);
            }
            existing.title = draft.title.clone();
            existing.category = draft.category.clone();
            existing.department = draft.department.clone();
            existing.url = draft.url.clone();
            existing.content = draft.content.clone();
            existing.extra_info = draft.extra_info.clone();
            return Ok(UpsertOutcome::Updated);
        }

        state.next_notice_id += 1;
        let id = state.next_notice_id;
        state.notices.push(Notice {
            id,
            daily_journal_id: draft.daily_journal_id,
            title: draft.title.clone(),
            category: draft.category.clone(),
            department: draft.department.clone(),
            url: draft.url.clone(),
            content: draft.content.clone(),
            extra_info: draft.extra_info.clone(),
        });
        Ok(UpsertOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn draft(journal_id: i64, title: &str, url: &str) -> NoticeDraft {
        NoticeDraft {
            daily_journal_id: journal_id,
            title: title.to_string(),
            category: "Disposicions".to_string(),
            department: "Departament de Salut".to_string(),
            url: url.to_string(),
            content: "Text".to_string(),
            extra_info: String::new(),
        }
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn step_prefix_is_zero_padded_and_lowercased() {
        assert_eq!(ArtifactStore::step_prefix(0, "HOME", None), "000_home");
        assert_eq!(
            ArtifactStore::step_prefix(12, "PROCESS_MONTH", Some("month processed 2026-01")),
            "012_process_month_month_processed_2026_01"
        );
        assert_eq!(ArtifactStore::step_prefix(3, "DONE", Some("--")), "003_done");
    }

    #[tokio::test]
    async fn store_step_writes_png_html_and_metadata() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let artifact = StepArtifact {
            run_id: "20260115_080000".into(),
            slug: "dogc".into(),
            step_index: 2,
            state: Some(CrawlState::ProcessMonth),
            note: Some("month_processed_2026_01".into()),
            url: Some("https://dogc.gencat.cat/ca".into()),
            title: Some("DOGC".into()),
            screenshot: Some(vec![0x89, b'P', b'N', b'G']),
            html: Some("<html>calendar</html>".into()),
            snapshot: Some(serde_json::json!({ "visible_month": "2026-01" })),
        };

        let stored = store.store_step(&artifact).await.expect("store step");
        let steps_dir = dir.path().join("dogc").join("20260115_080000").join("steps");
        assert_eq!(stored.prefix, "002_process_month_month_processed_2026_01");
        assert!(steps_dir.join("002_process_month_month_processed_2026_01.png").exists());
        assert!(steps_dir.join("002_process_month_month_processed_2026_01.html").exists());

        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&stored.meta).expect("read meta")).expect("json");
        assert_eq!(meta["state"], "PROCESS_MONTH");
        assert_eq!(meta["step_index"], 2);
        assert_eq!(meta["snapshot"]["visible_month"], "2026-01");
        assert_eq!(
            meta["html_sha256"],
            ArtifactStore::sha256_hex(b"<html>calendar</html>")
        );
    }

    #[tokio::test]
    async fn recorder_swallows_write_failures() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write blocker");
        let store = ArtifactStore::new(&blocker);
        let artifact = StepArtifact {
            run_id: "r".into(),
            slug: "dogc".into(),
            state: Some(CrawlState::Home),
            ..Default::default()
        };

        assert!(store.store_step(&artifact).await.is_err());
        store.record(&artifact).await;
    }

    #[tokio::test]
    async fn journal_upsert_is_idempotent() {
        let store = MemoryJournalStore::default();
        let day = date(2026, 1, 2);
        let first = store
            .upsert_daily_journal(1, day, "https://x/?numDOGC=1", "DOGC núm. 1")
            .await
            .expect("first");
        let second = store
            .upsert_daily_journal(1, day, "https://x/?numDOGC=1", "DOGC núm. 1")
            .await
            .expect("second");
        let third = store
            .upsert_daily_journal(1, day, "https://x/?numDOGC=2", "DOGC núm. 2")
            .await
            .expect("third");

        assert_eq!(first, UpsertOutcome::Created);
        assert_eq!(second, UpsertOutcome::Unchanged);
        assert_eq!(third, UpsertOutcome::Updated);
        let rows = store.journals();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].description, "DOGC núm. 2");
    }

    #[tokio::test]
    async fn pending_journals_exclude_those_with_notices() {
        let store = MemoryJournalStore::default();
        store
            .upsert_daily_journal(1, date(2026, 1, 5), "u5", "d5")
            .await
            .expect("upsert");
        store
            .upsert_daily_journal(1, date(2026, 1, 2), "u2", "d2")
            .await
            .expect("upsert");
        store
            .upsert_daily_journal(2, date(2026, 1, 3), "u3", "d3")
            .await
            .expect("upsert");

        let pending = store.pending_daily_journals(1).await.expect("pending");
        assert_eq!(
            pending.iter().map(|j| j.issue_date).collect::<Vec<_>>(),
            vec![date(2026, 1, 2), date(2026, 1, 5)]
        );

        store
            .upsert_notice(&draft(pending[0].id, "Resolució SLT/1/2026", "https://n/1"))
            .await
            .expect("notice");
        let pending = store.pending_daily_journals(1).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].issue_date, date(2026, 1, 5));
    }

    #[tokio::test]
    async fn journal_lookup_and_latest_issue_date_are_per_source() {
        let store = MemoryJournalStore::default();
        assert_eq!(store.latest_issue_date(1).await.expect("latest"), None);
        store
            .upsert_daily_journal(1, date(2026, 1, 8), "u8", "BOE 7 de 08/01/2026")
            .await
            .expect("upsert");
        store
            .upsert_daily_journal(1, date(2026, 1, 7), "u7", "BOE 6 de 07/01/2026")
            .await
            .expect("upsert");
        store
            .upsert_daily_journal(2, date(2026, 2, 1), "x", "other source")
            .await
            .expect("upsert");

        assert_eq!(store.latest_issue_date(1).await.expect("latest"), Some(date(2026, 1, 8)));
        let found = store
            .find_daily_journal(1, date(2026, 1, 7))
            .await
            .expect("lookup")
            .expect("journal exists");
        assert_eq!(found.url, "u7");
        assert_eq!(found.id, 2);
        assert!(store
            .find_daily_journal(2, date(2026, 1, 7))
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn notice_upsert_matches_by_url_then_title() {
        let store = MemoryJournalStore::default();
        let created = store
            .upsert_notice(&draft(7, "Resolució A", "https://n/a"))
            .await
            .expect("create");
        let same = store
            .upsert_notice(&draft(7, "Resolució A", "https://n/a"))
            .await
            .expect("same");
        let retitled = store
            .upsert_notice(&draft(7, "Resolució A (correcció)", "https://n/a"))
            .await
            .expect("retitle");
        let moved = store
            .upsert_notice(&draft(7, "Resolució A (correcció)", "https://n/a2"))
            .await
            .expect("move");
        let other_journal = store
            .upsert_notice(&draft(8, "Resolució A (correcció)", "https://n/a2"))
            .await
            .expect("other journal");

        assert_eq!(created, UpsertOutcome::Created);
        assert_eq!(same, UpsertOutcome::Unchanged);
        assert_eq!(retitled, UpsertOutcome::Updated);
        assert_eq!(moved, UpsertOutcome::Updated);
        assert_eq!(other_journal, UpsertOutcome::Created);
        assert_eq!(store.notices().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_keep_earlier_rows() {
        let store = MemoryJournalStore::default().fail_journal_writes_after(1);
        store
            .upsert_daily_journal(1, date(2026, 1, 2), "u", "d")
            .await
            .expect("first write succeeds");
        let err = store
            .upsert_daily_journal(1, date(2026, 1, 3), "u", "d")
            .await
            .expect_err("second write fails");
        assert!(err.to_string().contains("2026-01-03"));
        assert_eq!(store.journals().len(), 1);
    }
}
