//! Ingest pipeline orchestration.
//!
//! One run loads the store once, walks every configured source in order,
//! qualifies each candidate (dedup, relevance, recency, optional detail
//! enrichment) and, if anything qualified, merges and persists the store
//! once at the end.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use newswatch_adapters::{build_adapter, AdapterError, ListingSpec, SourceAdapter, SourceMode};
use newswatch_core::{
    utc_offset, ArticleRecord, KeywordSet, MatchMode, PageToken, RawCandidate, RecencyFilter,
    RelevanceFilter, DEFAULT_THRESHOLD, DEFAULT_WINDOW_HOURS,
};
use newswatch_storage::{
    merge, HttpClientConfig, HttpFetcher, LinkIndex, MergeOptions, NewsStore, StoreError,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub workspace_root: PathBuf,
    pub store_path: PathBuf,
    pub sources_path: PathBuf,
    pub keywords_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub reports_dir: Option<PathBuf>,
    pub window_hours: i64,
    pub max_records: Option<usize>,
}

impl IngestSettings {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("NEWSWATCH_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let under_root = |var: &str, default: &str| {
            std::env::var(var)
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join(default))
        };
        let store_path = under_root("NEWSWATCH_STORE", "news.json");
        let sources_path = under_root("NEWSWATCH_SOURCES", "sources.yaml");
        let keywords_path = under_root("NEWSWATCH_KEYWORDS", "keywords.yaml");

        Self {
            store_path,
            sources_path,
            keywords_path,
            user_agent: std::env::var("NEWSWATCH_USER_AGENT")
                .unwrap_or_else(|_| "newswatch-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("NEWSWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            reports_dir: std::env::var("NEWSWATCH_REPORTS_DIR").ok().map(PathBuf::from),
            window_hours: std::env::var("NEWSWATCH_WINDOW_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_WINDOW_HOURS),
            max_records: std::env::var("NEWSWATCH_MAX_RECORDS")
                .ok()
                .and_then(|v| v.parse().ok()),
            workspace_root,
        }
    }
}

/// Which text the listing-level relevance check scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceText {
    #[default]
    Title,
    TitleAndLead,
}

/// When, if ever, the recency window is enforced for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecencyStage {
    #[default]
    Off,
    Listing,
    AfterEnrichment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentMode {
    #[default]
    Off,
    /// Failures fall back to the listing text.
    Optional,
    /// Failures reject the candidate.
    Mandatory,
}

/// In-run suppression of repeated headlines under different links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleDedup {
    #[default]
    Off,
    Exact,
    Similar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub store: MergeOptions,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub relevance_text: RelevanceText,
    #[serde(default)]
    pub recency: RecencyStage,
    #[serde(default)]
    pub enrichment: EnrichmentMode,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub title_dedup: TitleDedup,
    #[serde(default = "default_title_similarity")]
    pub title_similarity: f64,
    #[serde(default)]
    pub listing: Option<ListingSpec>,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

fn default_threshold() -> usize {
    DEFAULT_THRESHOLD
}

fn default_title_similarity() -> f64 {
    0.9
}

impl SourceConfig {
    pub fn policy(&self) -> SourcePolicy {
        SourcePolicy {
            threshold: self.threshold,
            match_mode: self.match_mode,
            relevance_text: self.relevance_text,
            recency: self.recency,
            enrichment: self.enrichment,
            delay: StdDuration::from_millis(self.delay_ms),
            title_dedup: self.title_dedup,
            title_similarity: self.title_similarity,
            category: self.category.clone(),
        }
    }
}

/// Per-source tuning of the qualification steps.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolicy {
    pub threshold: usize,
    pub match_mode: MatchMode,
    pub relevance_text: RelevanceText,
    pub recency: RecencyStage,
    pub enrichment: EnrichmentMode,
    /// Pause before each page fetch except the first of the run.
    pub delay: StdDuration,
    pub title_dedup: TitleDedup,
    pub title_similarity: f64,
    /// Applied when the adapter did not tag the candidate itself.
    pub category: Option<String>,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            match_mode: MatchMode::Token,
            relevance_text: RelevanceText::Title,
            recency: RecencyStage::Off,
            enrichment: EnrichmentMode::Off,
            delay: StdDuration::ZERO,
            title_dedup: TitleDedup::Off,
            title_similarity: default_title_similarity(),
            category: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordFile {
    #[serde(default)]
    pub include: KeywordSet,
    #[serde(default)]
    pub exclude: KeywordSet,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub keywords: KeywordSet,
    pub exclude: KeywordSet,
    pub window: Duration,
    /// Offset for candidate times that carry none.
    pub naive_offset: FixedOffset,
    pub now: DateTime<Utc>,
    pub merge: MergeOptions,
}

impl PipelineConfig {
    pub fn new(keywords: KeywordSet, now: DateTime<Utc>) -> Self {
        Self {
            keywords,
            exclude: KeywordSet::empty(),
            window: Duration::hours(DEFAULT_WINDOW_HOURS),
            naive_offset: utc_offset(),
            now,
            merge: MergeOptions::default(),
        }
    }
}

pub struct ConfiguredSource {
    pub adapter: Box<dyn SourceAdapter>,
    pub policy: SourcePolicy,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub status: SourceStatus,
    pub pages: usize,
    pub candidates: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub irrelevant: usize,
    pub stale: usize,
    pub malformed: usize,
    pub enrichment_failures: usize,
}

impl SourceOutcome {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: SourceStatus::Completed,
            pages: 0,
            candidates: 0,
            accepted: 0,
            duplicates: 0,
            irrelevant: 0,
            stale: 0,
            malformed: 0,
            enrichment_failures: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, SourceStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
    pub total_accepted: usize,
    pub total_duplicates: usize,
    pub store_size: usize,
    pub persisted: bool,
}

impl RunSummary {
    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.is_failed()).count()
    }
}

#[derive(Default)]
struct RunState {
    seen: LinkIndex,
    titles: Vec<String>,
    accepted: Vec<ArticleRecord>,
    fetches: usize,
}

/// Records accepted from one source, held back until the source finishes cleanly.
#[derive(Default)]
struct Batch {
    links: LinkIndex,
    titles: Vec<String>,
    records: Vec<ArticleRecord>,
}

impl Batch {
    fn push(&mut self, record: ArticleRecord) {
        self.links.insert(record.link.clone());
        self.titles.push(record.title.clone());
        self.records.push(record);
    }
}

impl RunState {
    fn absorb(&mut self, batch: Batch) {
        self.seen.extend(batch.links);
        self.titles.extend(batch.titles);
        self.accepted.extend(batch.records);
    }
}

pub struct IngestPipeline {
    store: NewsStore,
    config: PipelineConfig,
}

impl IngestPipeline {
    pub fn new(store: NewsStore, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every source once and persist whatever qualified.
    ///
    /// Store failures abort the run; source failures are recorded in the
    /// summary and the run moves on.
    pub async fn run(&self, sources: &[ConfiguredSource]) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let existing = self.store.load().await?;
        info!(
            %run_id,
            existing = existing.len(),
            sources = sources.len(),
            "ingest run starting"
        );

        let mut state = RunState {
            seen: LinkIndex::from_records(&existing),
            ..Default::default()
        };
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            let outcome = self.ingest_source(source, &mut state).await;
            info!(
                source_id = %outcome.source_id,
                pages = outcome.pages,
                candidates = outcome.candidates,
                accepted = outcome.accepted,
                duplicates = outcome.duplicates,
                failed = outcome.is_failed(),
                "source finished"
            );
            outcomes.push(outcome);
        }

        let total_accepted = state.accepted.len();
        let total_duplicates = outcomes.iter().map(|o| o.duplicates).sum();
        let (store_size, persisted) = if state.accepted.is_empty() {
            info!("no new articles qualified; store left untouched");
            (existing.len(), false)
        } else {
            let merged = merge(state.accepted, existing, &self.config.merge);
            self.store.persist(&merged).await?;
            (merged.len(), true)
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: outcomes,
            total_accepted,
            total_duplicates,
            store_size,
            persisted,
        };
        info!(
            %run_id,
            accepted = summary.total_accepted,
            duplicates = summary.total_duplicates,
            failed_sources = summary.failed_sources(),
            store_size,
            "ingest run finished"
        );
        Ok(summary)
    }

    async fn ingest_source(&self, source: &ConfiguredSource, state: &mut RunState) -> SourceOutcome {
        let adapter = source.adapter.as_ref();
        let policy = &source.policy;
        let mut outcome = SourceOutcome::new(adapter.source_id());
        let relevance = RelevanceFilter::new(
            self.config.keywords.clone(),
            policy.threshold,
            policy.match_mode,
        )
        .with_exclusions(self.config.exclude.clone());

        let mut batch = Batch::default();
        let mut token: Option<PageToken> = None;
        loop {
            if state.fetches > 0 && !policy.delay.is_zero() {
                tokio::time::sleep(policy.delay).await;
            }
            state.fetches += 1;

            let page = match adapter.fetch_page(token.as_ref()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        source_id = %outcome.source_id,
                        page = outcome.pages + 1,
                        discarded = batch.records.len(),
                        error = %err,
                        "source fetch failed; its candidates are dropped for this run"
                    );
                    outcome.status = SourceStatus::Failed {
                        error: err.to_string(),
                    };
                    return outcome;
                }
            };
            outcome.pages += 1;
            if page.is_empty() {
                break;
            }

            for candidate in page.candidates {
                outcome.candidates += 1;
                if let Some(record) = self
                    .qualify(adapter, policy, &relevance, candidate, state, &batch, &mut outcome)
                    .await
                {
                    debug!(source_id = %outcome.source_id, link = %record.link, "accepted");
                    batch.push(record);
                }
            }

            match page.next_page {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        outcome.accepted = batch.records.len();
        state.absorb(batch);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn qualify(
        &self,
        adapter: &dyn SourceAdapter,
        policy: &SourcePolicy,
        relevance: &RelevanceFilter,
        candidate: RawCandidate,
        state: &RunState,
        batch: &Batch,
        outcome: &mut SourceOutcome,
    ) -> Option<ArticleRecord> {
        if !candidate.is_well_formed() {
            outcome.malformed += 1;
            debug!(source_id = %outcome.source_id, ?candidate, "discarding malformed candidate");
            return None;
        }
        let link = candidate.link.trim().to_string();
        let title = candidate.title.trim().to_string();

        if state.seen.contains(&link) || batch.links.contains(&link) {
            outcome.duplicates += 1;
            return None;
        }
        if repeats_title(policy, &title, state, batch) {
            debug!(source_id = %outcome.source_id, %title, "headline already taken this run");
            outcome.duplicates += 1;
            return None;
        }

        let primary = match policy.relevance_text {
            RelevanceText::Title => title.clone(),
            RelevanceText::TitleAndLead => candidate.title_and_lead(),
        };
        if !relevance.is_relevant(&primary) {
            outcome.irrelevant += 1;
            return None;
        }

        let recency = RecencyFilter::new(self.config.window).with_naive_offset(self.config.naive_offset);
        if policy.recency == RecencyStage::Listing
            && !recency.is_within_window(&candidate.time, self.config.now)
        {
            outcome.stale += 1;
            return None;
        }

        let mut summary = candidate
            .summary_hint
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let mut time = candidate.time.trim().to_string();
        let mut img = candidate.img.clone().unwrap_or_default();

        if policy.enrichment != EnrichmentMode::Off {
            let detail = if adapter.supports_detail() {
                adapter.fetch_detail(&link).await
            } else {
                Err(AdapterError::DetailUnsupported(adapter.source_id().to_string()))
            };
            match detail {
                Ok(detail) => {
                    if !detail.summary.trim().is_empty() {
                        summary = detail.summary.trim().to_string();
                    }
                    if time.is_empty() {
                        if let Some(t) = detail.time {
                            time = t.trim().to_string();
                        }
                    }
                    if img.is_empty() {
                        if let Some(src) = detail.img {
                            img = src;
                        }
                    }
                    if !relevance.is_relevant(&format!("{title} {summary}")) {
                        outcome.irrelevant += 1;
                        return None;
                    }
                }
                Err(err) if policy.enrichment == EnrichmentMode::Mandatory => {
                    outcome.enrichment_failures += 1;
                    warn!(source_id = %outcome.source_id, %link, error = %err, "detail fetch failed; rejecting");
                    return None;
                }
                Err(err) => {
                    outcome.enrichment_failures += 1;
                    debug!(source_id = %outcome.source_id, %link, error = %err, "detail fetch failed; using listing text");
                }
            }
        }

        if policy.recency == RecencyStage::AfterEnrichment
            && !recency.is_within_window(&time, self.config.now)
        {
            outcome.stale += 1;
            return None;
        }

        Some(ArticleRecord {
            title,
            time,
            link,
            summary,
            category: candidate.category.or_else(|| policy.category.clone()),
            img,
        })
    }
}

fn repeats_title(policy: &SourcePolicy, title: &str, state: &RunState, batch: &Batch) -> bool {
    let mut taken = state.titles.iter().chain(batch.titles.iter());
    match policy.title_dedup {
        TitleDedup::Off => false,
        TitleDedup::Exact => taken.any(|t| t == title),
        TitleDedup::Similar => {
            let needle = title.to_lowercase();
            taken.any(|t| jaro_winkler(&t.to_lowercase(), &needle) >= policy.title_similarity)
        }
    }
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn load_keywords(path: &Path) -> Result<KeywordFile> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Load configuration, build adapters for enabled sources and run once.
pub async fn run_ingest(settings: &IngestSettings) -> Result<RunSummary> {
    let window = recency_window(settings.window_hours)?;
    let registry = load_source_registry(&settings.sources_path).await?;
    let keywords = load_keywords(&settings.keywords_path).await?;
    if keywords.include.is_empty() {
        warn!(path = %settings.keywords_path.display(), "keyword list is empty; only threshold-0 sources can accept");
    }

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: StdDuration::from_secs(settings.http_timeout_secs),
        user_agent: Some(settings.user_agent.clone()),
    })?;

    let mut sources = Vec::new();
    for source in registry.sources.iter().filter(|s| s.enabled) {
        let adapter = build_adapter(
            &source.source_id,
            source.mode,
            source.listing.as_ref(),
            source.fixture.as_deref(),
            &http,
            StdDuration::from_millis(source.delay_ms),
            &settings.workspace_root,
        )
        .with_context(|| format!("building adapter for {}", source.source_id))?;
        sources.push(ConfiguredSource {
            adapter,
            policy: source.policy(),
        });
    }

    let mut merge_options = registry.store;
    if settings.max_records.is_some() {
        merge_options.max_records = settings.max_records;
    }
    let config = PipelineConfig {
        keywords: keywords.include,
        exclude: keywords.exclude,
        window,
        naive_offset: utc_offset(),
        now: Utc::now(),
        merge: merge_options,
    };
    let pipeline = IngestPipeline::new(NewsStore::new(&settings.store_path), config);
    let summary = pipeline.run(&sources).await?;

    if let Some(dir) = &settings.reports_dir {
        let written = write_reports(dir, &summary).await?;
        info!(path = %written.display(), "wrote run report");
    }
    Ok(summary)
}

/// Recency window from whole hours; must be positive and fit a `chrono::Duration`.
pub fn recency_window(hours: i64) -> Result<Duration> {
    if hours <= 0 {
        anyhow::bail!("recency window must be positive, got {hours} hours");
    }
    Duration::try_hours(hours).with_context(|| format!("window of {hours} hours is out of range"))
}

pub async fn run_ingest_from_env() -> Result<RunSummary> {
    run_ingest(&IngestSettings::from_env()).await
}

/// Write `run_summary.json` and `brief.md` under `<reports_dir>/<run_id>/`.
pub async fn write_reports(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(run_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;
    Ok(run_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
    for source in &summary.sources {
        let key = if source.is_failed() { "failed" } else { "completed" };
        *by_status.entry(key).or_default() += 1;
    }

    let mut lines = vec![
        "# Newswatch Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Accepted: {}", summary.total_accepted),
        format!("- Skipped as duplicate: {}", summary.total_duplicates),
        format!("- Store size: {}", summary.store_size),
        format!("- Persisted: {}", summary.persisted),
        format!(
            "- Sources: {}",
            by_status
                .iter()
                .map(|(k, v)| format!("{v} {k}"))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        String::new(),
        "## Sources".to_string(),
    ];
    for source in &summary.sources {
        let status = match &source.status {
            SourceStatus::Completed => "ok".to_string(),
            SourceStatus::Failed { error } => format!("failed: {error}"),
        };
        lines.push(format!(
            "- {}: {} accepted, {} duplicate, {} irrelevant, {} stale, {} malformed ({} pages, {})",
            source.source_id,
            source.accepted,
            source.duplicates,
            source.irrelevant,
            source.stale,
            source.malformed,
            source.pages,
            status
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}
