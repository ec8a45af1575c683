//! Source adapter contracts + selector-driven and fixture-first implementations.
//!
//! An adapter turns one source's listing pages into [`CandidatePage`]s and,
//! optionally, one article link into an [`ArticleDetail`]. Everything
//! site-specific lives in [`ListingSpec`] configuration rather than code.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use newswatch_core::{
    normalize_timestamp, offset_from_hours, utc_offset, ArticleDetail, CandidatePage, PageToken,
    RawCandidate,
};
use newswatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("source {0} does not provide detail pages")]
    DetailUnsupported(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetch one batch. `None` asks for the first page; a returned
    /// `next_page` of `None` ends pagination.
    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<CandidatePage, AdapterError>;

    fn supports_detail(&self) -> bool {
        false
    }

    async fn fetch_detail(&self, _link: &str) -> Result<ArticleDetail, AdapterError> {
        Err(AdapterError::DetailUnsupported(self.source_id().to_string()))
    }
}

/// How an adapter is built for a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Html,
    Fixture,
}

/// Selectors and paging rules for one source's listing pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSpec {
    pub urls: Vec<String>,
    pub item_selector: String,
    /// Relative to the item; item text when absent.
    #[serde(default)]
    pub title_selector: Option<String>,
    /// Relative to the item; the item itself when absent.
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default = "default_link_attr")]
    pub link_attr: String,
    #[serde(default)]
    pub time_selector: Option<String>,
    /// Read the time from this attribute instead of the element text.
    #[serde(default)]
    pub time_attr: Option<String>,
    #[serde(default)]
    pub summary_selector: Option<String>,
    #[serde(default)]
    pub image_selector: Option<String>,
    #[serde(default = "default_image_attr")]
    pub image_attr: String,
    /// `{url}` and `{page}` placeholders; pages after the first use this.
    #[serde(default)]
    pub page_url_template: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub strip_query: bool,
    /// Offset applied to timestamps printed without one.
    #[serde(default)]
    pub utc_offset_hours: i32,
    #[serde(default)]
    pub detail: Option<DetailSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSpec {
    pub summary_selector: String,
    #[serde(default)]
    pub time_selector: Option<String>,
    #[serde(default)]
    pub time_attr: Option<String>,
    #[serde(default)]
    pub image_selector: Option<String>,
    #[serde(default = "default_image_attr")]
    pub image_attr: String,
}

fn default_link_attr() -> String {
    "href".to_string()
}

fn default_image_attr() -> String {
    "src".to_string()
}

fn default_max_pages() -> u32 {
    1
}

impl ListingSpec {
    fn page_url(&self, url_index: usize, page: u32) -> Option<String> {
        let base = self.urls.get(url_index)?;
        if page <= 1 {
            return Some(base.clone());
        }
        let template = self.page_url_template.as_deref()?;
        Some(
            template
                .replace("{url}", base)
                .replace("{page}", &page.to_string()),
        )
    }

    /// Position after `(url_index, page)`, or `None` when every URL is done.
    fn advance(&self, url_index: usize, page: u32) -> Option<(usize, u32)> {
        if self.page_url_template.is_some() && page < self.max_pages {
            return Some((url_index, page + 1));
        }
        if url_index + 1 < self.urls.len() {
            return Some((url_index + 1, 1));
        }
        None
    }
}

fn encode_position(url_index: usize, page: u32) -> PageToken {
    PageToken::new(format!("{url_index}:{page}"))
}

fn decode_position(token: &PageToken) -> Result<(usize, u32), AdapterError> {
    let (idx, page) = token
        .as_str()
        .split_once(':')
        .ok_or_else(|| AdapterError::Message(format!("malformed page token {token}")))?;
    let idx = idx
        .parse()
        .map_err(|_| AdapterError::Message(format!("malformed page token {token}")))?;
    let page = page
        .parse()
        .map_err(|_| AdapterError::Message(format!("malformed page token {token}")))?;
    Ok((idx, page))
}

/// Resolve `href` against the page it was found on.
///
/// Handles relative and protocol-relative links; only http(s) results are
/// kept. Fragments are always dropped, the query only when asked.
pub fn canonicalize_link(page_url: &Url, href: &str, strip_query: bool) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") {
        return None;
    }
    let mut url = page_url.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    if strip_query {
        url.set_query(None);
    }
    Some(url.to_string())
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn compile_opt(selector: Option<&str>) -> Result<Option<Selector>, AdapterError> {
    selector.map(compile).transpose()
}

fn clean_text(element: ElementRef<'_>) -> Option<String> {
    let joined = element.text().collect::<Vec<_>>().join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).find_map(clean_text)
}

fn first_attr(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .find_map(|n| n.value().attr(attr))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn time_value(scope: ElementRef<'_>, selector: &Selector, attr: Option<&str>) -> Option<String> {
    match attr {
        Some(attr) => first_attr(scope, selector, attr),
        None => first_text(scope, selector),
    }
}

/// Extract raw candidates from one listing page.
///
/// Items without a usable link are still returned (with an empty link) so
/// the pipeline can count them as malformed.
pub fn parse_listing(
    html: &str,
    page_url: &Url,
    spec: &ListingSpec,
) -> Result<Vec<RawCandidate>, AdapterError> {
    let document = Html::parse_document(html);
    let items = compile(&spec.item_selector)?;
    let title_sel = compile_opt(spec.title_selector.as_deref())?;
    let link_sel = compile_opt(spec.link_selector.as_deref())?;
    let time_sel = compile_opt(spec.time_selector.as_deref())?;
    let summary_sel = compile_opt(spec.summary_selector.as_deref())?;
    let image_sel = compile_opt(spec.image_selector.as_deref())?;
    let offset = offset_from_hours(spec.utc_offset_hours).unwrap_or_else(utc_offset);

    let mut out = Vec::new();
    for item in document.select(&items) {
        let title = match &title_sel {
            Some(sel) => first_text(item, sel),
            None => clean_text(item),
        };
        let href = match &link_sel {
            Some(sel) => first_attr(item, sel, &spec.link_attr),
            None => item.value().attr(&spec.link_attr).map(ToString::to_string),
        };
        let link = href.and_then(|h| canonicalize_link(page_url, &h, spec.strip_query));
        let time = time_sel
            .as_ref()
            .and_then(|sel| time_value(item, sel, spec.time_attr.as_deref()))
            .map(|raw| normalize_timestamp(&raw, offset))
            .unwrap_or_default();
        let summary_hint = summary_sel.as_ref().and_then(|sel| first_text(item, sel));
        let img = image_sel
            .as_ref()
            .and_then(|sel| first_attr(item, sel, &spec.image_attr))
            .and_then(|src| canonicalize_link(page_url, &src, false));

        out.push(RawCandidate {
            title: title.unwrap_or_default(),
            link: link.unwrap_or_default(),
            time,
            summary_hint,
            img,
            category: None,
        });
    }
    Ok(out)
}

/// Extract summary, and optionally time and image, from an article page.
pub fn parse_detail(
    html: &str,
    page_url: &Url,
    spec: &DetailSpec,
    utc_offset_hours: i32,
) -> Result<ArticleDetail, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let summary_sel = compile(&spec.summary_selector)?;
    let time_sel = compile_opt(spec.time_selector.as_deref())?;
    let image_sel = compile_opt(spec.image_selector.as_deref())?;
    let offset = offset_from_hours(utc_offset_hours).unwrap_or_else(utc_offset);

    let summary = root
        .select(&summary_sel)
        .filter_map(clean_text)
        .collect::<Vec<_>>()
        .join("\n");
    let time = time_sel
        .as_ref()
        .and_then(|sel| time_value(root, sel, spec.time_attr.as_deref()))
        .map(|raw| normalize_timestamp(&raw, offset));
    let img = image_sel
        .as_ref()
        .and_then(|sel| first_attr(root, sel, &spec.image_attr))
        .and_then(|src| canonicalize_link(page_url, &src, false));

    Ok(ArticleDetail { summary, time, img })
}

/// Listing adapter for a site described entirely by a [`ListingSpec`].
#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    source_id: String,
    spec: ListingSpec,
    http: HttpFetcher,
    delay: Duration,
}

impl HtmlListingAdapter {
    pub fn new(source_id: impl Into<String>, spec: ListingSpec, http: HttpFetcher) -> Self {
        Self {
            source_id: source_id.into(),
            spec,
            http,
            delay: Duration::ZERO,
        }
    }

    /// Pause applied before listing fetches this adapter issues on its own,
    /// i.e. when an empty page is skipped within one `fetch_page` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<CandidatePage, AdapterError> {
        let mut position = match token {
            Some(token) => Some(decode_position(token)?),
            None => Some((0, 1)),
        };

        // an empty listing page moves on to the next listing URL
        let mut fetched_any = false;
        while let Some((url_index, page)) = position {
            let Some(page_url) = self.spec.page_url(url_index, page) else {
                break;
            };
            if fetched_any && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            fetched_any = true;
            let base = Url::parse(&page_url)
                .with_context(|| format!("parsing listing url {page_url}"))?;
            let fetched = self.http.fetch_text(&self.source_id, &page_url).await?;
            let candidates = parse_listing(&fetched.body, &base, &self.spec)?;
            info!(
                source_id = %self.source_id,
                url = %page_url,
                page,
                count = candidates.len(),
                "parsed listing page"
            );

            if candidates.is_empty() {
                position = if url_index + 1 < self.spec.urls.len() {
                    Some((url_index + 1, 1))
                } else {
                    None
                };
                continue;
            }

            return Ok(match self.spec.advance(url_index, page) {
                Some((next_index, next_page)) => {
                    CandidatePage::with_next(candidates, encode_position(next_index, next_page))
                }
                None => CandidatePage::last(candidates),
            });
        }

        Ok(CandidatePage::default())
    }

    fn supports_detail(&self) -> bool {
        self.spec.detail.is_some()
    }

    async fn fetch_detail(&self, link: &str) -> Result<ArticleDetail, AdapterError> {
        let Some(detail) = &self.spec.detail else {
            return Err(AdapterError::DetailUnsupported(self.source_id.clone()));
        };
        let base = Url::parse(link).with_context(|| format!("parsing article link {link}"))?;
        let fetched = self.http.fetch_text(&self.source_id, link).await?;
        let parsed = parse_detail(&fetched.body, &base, detail, self.spec.utc_offset_hours)?;
        debug!(source_id = %self.source_id, %link, bytes = parsed.summary.len(), "parsed detail page");
        Ok(parsed)
    }
}

/// Recorded listing output used for offline runs and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    #[serde(default)]
    pub pages: Vec<FixturePage>,
    /// Present when the source offers detail pages; a missing link fails enrichment.
    #[serde(default)]
    pub details: Option<BTreeMap<String, ArticleDetail>>,
    /// Zero-based page index whose fetch fails, to rehearse transport errors.
    #[serde(default)]
    pub fail_on_page: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FixturePage {
    #[serde(default)]
    pub candidates: Vec<RawCandidate>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    bundle: FixtureBundle,
}

impl FixtureAdapter {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.bundle.source_id
    }

    async fn fetch_page(&self, token: Option<&PageToken>) -> Result<CandidatePage, AdapterError> {
        let index = match token {
            Some(token) => token
                .as_str()
                .parse::<usize>()
                .map_err(|_| AdapterError::Message(format!("malformed page token {token}")))?,
            None => 0,
        };
        if self.bundle.fail_on_page == Some(index) {
            return Err(AdapterError::Message(format!(
                "fixture {} refuses page {index}",
                self.bundle.source_id
            )));
        }
        let Some(page) = self.bundle.pages.get(index) else {
            return Ok(CandidatePage::default());
        };
        let candidates = page.candidates.clone();
        Ok(if index + 1 < self.bundle.pages.len() {
            CandidatePage::with_next(candidates, PageToken::new((index + 1).to_string()))
        } else {
            CandidatePage::last(candidates)
        })
    }

    fn supports_detail(&self) -> bool {
        self.bundle.details.is_some()
    }

    async fn fetch_detail(&self, link: &str) -> Result<ArticleDetail, AdapterError> {
        let details = self
            .bundle
            .details
            .as_ref()
            .ok_or_else(|| AdapterError::DetailUnsupported(self.bundle.source_id.clone()))?;
        details
            .get(link)
            .cloned()
            .ok_or_else(|| AdapterError::Message(format!("no detail page recorded for {link}")))
    }
}

/// Build the adapter for a configured source.
///
/// Relative fixture paths resolve against `workspace_root`.
pub fn build_adapter(
    source_id: &str,
    mode: SourceMode,
    listing: Option<&ListingSpec>,
    fixture: Option<&Path>,
    http: &HttpFetcher,
    delay: Duration,
    workspace_root: &Path,
) -> Result<Box<dyn SourceAdapter>> {
    match mode {
        SourceMode::Html => {
            let spec = listing
                .with_context(|| format!("source {source_id} is html but has no listing section"))?;
            Ok(Box::new(
                HtmlListingAdapter::new(source_id, spec.clone(), http.clone()).with_delay(delay),
            ))
        }
        SourceMode::Fixture => {
            let path = fixture
                .map(|p| resolve(workspace_root, p))
                .unwrap_or_else(|| default_fixture_path(workspace_root, source_id));
            let adapter = FixtureAdapter::from_path(&path)?;
            if adapter.source_id() != source_id {
                anyhow::bail!(
                    "fixture {} belongs to {} not {}",
                    path.display(),
                    adapter.source_id(),
                    source_id
                );
            }
            Ok(Box::new(adapter))
        }
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

pub fn default_fixture_path(workspace_root: &Path, source_id: &str) -> PathBuf {
    workspace_root
        .join("fixtures")
        .join(source_id)
        .join("pages.json")
}
