//! Persisted article store + HTTP fetch utilities for newswatch.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use newswatch_core::{parse_timestamp, utc_offset, ArticleRecord};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store {} is not a valid article list: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading store {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("persisting store {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding store {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where freshly merged records go relative to the existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    #[default]
    NewFirst,
    ExistingFirst,
}

/// Which records survive when `max_records` is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapPolicy {
    /// Keep the most recently merged records by position, ignoring timestamps.
    #[default]
    InsertionOrder,
    /// Keep the records with the newest parseable `time`; unparseable count as oldest.
    Recency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    pub order: MergeOrder,
    pub max_records: Option<usize>,
    pub cap: CapPolicy,
}

/// Exact-match membership test on `link`.
pub fn is_duplicate(link: &str, existing: &[ArticleRecord]) -> bool {
    existing.iter().any(|r| r.link == link)
}

/// Set of links already present, for repeated membership checks during a run.
#[derive(Debug, Clone, Default)]
pub struct LinkIndex {
    links: HashSet<String>,
}

impl LinkIndex {
    pub fn from_records(records: &[ArticleRecord]) -> Self {
        Self {
            links: records.iter().map(|r| r.link.clone()).collect(),
        }
    }

    pub fn contains(&self, link: &str) -> bool {
        self.links.contains(link)
    }

    /// Returns `false` when the link was already present.
    pub fn insert(&mut self, link: impl Into<String>) -> bool {
        self.links.insert(link.into())
    }

    pub fn extend(&mut self, other: LinkIndex) {
        self.links.extend(other.links);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Concatenate `new` and `existing` per `options.order`, then apply the cap.
///
/// `new` must already be duplicate-free against `existing`.
pub fn merge(
    new: Vec<ArticleRecord>,
    existing: Vec<ArticleRecord>,
    options: &MergeOptions,
) -> Vec<ArticleRecord> {
    let mut merged = match options.order {
        MergeOrder::NewFirst => {
            let mut out = new;
            out.extend(existing);
            out
        }
        MergeOrder::ExistingFirst => {
            let mut out = existing;
            out.extend(new);
            out
        }
    };

    let Some(max) = options.max_records else {
        return merged;
    };
    if merged.len() <= max {
        return merged;
    }

    match options.cap {
        CapPolicy::InsertionOrder => match options.order {
            MergeOrder::NewFirst => {
                merged.truncate(max);
                merged
            }
            MergeOrder::ExistingFirst => merged.split_off(merged.len() - max),
        },
        CapPolicy::Recency => keep_newest(merged, max),
    }
}

fn keep_newest(records: Vec<ArticleRecord>, max: usize) -> Vec<ArticleRecord> {
    let offset = utc_offset();
    let mut ranked: Vec<(usize, Option<DateTime<Utc>>)> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (i, parse_timestamp(&r.time, offset)))
        .collect();
    // newest first; ties and unparseable keep merge position
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let keep: HashSet<usize> = ranked.into_iter().take(max).map(|(i, _)| i).collect();
    records
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, r)| r)
        .collect()
}

/// JSON document holding the full article list.
#[derive(Debug, Clone)]
pub struct NewsStore {
    path: PathBuf,
}

impl NewsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted records. A missing file is an empty store.
    ///
    /// Records repeating an earlier link are dropped so the loaded sequence
    /// always satisfies link uniqueness.
    pub async fn load(&self) -> Result<Vec<ArticleRecord>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no store file yet, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let records: Vec<ArticleRecord> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        let mut seen = LinkIndex::default();
        let total = records.len();
        let records: Vec<ArticleRecord> = records
            .into_iter()
            .filter(|r| seen.insert(r.link.clone()))
            .collect();
        if records.len() != total {
            warn!(
                path = %self.path.display(),
                dropped = total - records.len(),
                "store contained repeated links"
            );
        }
        debug!(path = %self.path.display(), count = records.len(), "loaded store");
        Ok(records)
    }

    /// Overwrite the store with `records` via temp file + rename in the same directory.
    pub async fn persist(&self, records: &[ArticleRecord]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        self.write_atomically(&json)
            .await
            .map_err(|source| StoreError::Persist {
                path: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), count = records.len(), "persisted store");
        Ok(())
    }

    async fn write_atomically(&self, bytes: &[u8]) -> std::io::Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        written
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt page transport shared by the HTML adapters.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.get_text(url).instrument(span).await
    }

    async fn get_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        debug!(bytes = body.len(), "fetched page");
        Ok(FetchedPage {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(link: &str, time: &str) -> ArticleRecord {
        ArticleRecord {
            title: format!("title {link}"),
            time: time.to_string(),
            link: link.to_string(),
            summary: String::new(),
            category: None,
            img: String::new(),
        }
    }

    fn links(records: &[ArticleRecord]) -> Vec<&str> {
        records.iter().map(|r| r.link.as_str()).collect()
    }

    #[tokio::test]
    async fn failed_persist_reports_persist_error_and_leaves_file_alone() {
        let dir = tempdir().expect("tempdir");
        // the sibling temp-file name exceeds the 255-byte file-name limit
        let path = dir.path().join(format!("{}.json", "n".repeat(230)));
        let original = serde_json::to_vec_pretty(&[rec("https://a", "")]).unwrap();
        std::fs::write(&path, &original).unwrap();

        let store = NewsStore::new(&path);
        let err = store
            .persist(&[rec("https://b", ""), rec("https://a", "")])
            .await
            .expect_err("temp file cannot be created");
        assert!(matches!(err, StoreError::Persist { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), original);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn merge_new_first_caps_by_insertion_order() {
        let options = MergeOptions {
            max_records: Some(3),
            ..Default::default()
        };
        let merged = merge(
            vec![rec("A", ""), rec("B", "")],
            vec![rec("C", ""), rec("D", "")],
            &options,
        );
        assert_eq!(links(&merged), vec!["A", "B", "C"]);
    }

    #[test]
    fn merge_existing_first_keeps_latest_merged_tail() {
        let options = MergeOptions {
            order: MergeOrder::ExistingFirst,
            max_records: Some(3),
            cap: CapPolicy::InsertionOrder,
        };
        let merged = merge(
            vec![rec("A", ""), rec("B", "")],
            vec![rec("C", ""), rec("D", "")],
            &options,
        );
        assert_eq!(links(&merged), vec!["D", "A", "B"]);
    }

    #[test]
    fn merge_without_cap_keeps_everything_in_order() {
        let merged = merge(
            vec![rec("A", ""), rec("B", "")],
            vec![rec("C", "")],
            &MergeOptions::default(),
        );
        assert_eq!(links(&merged), vec!["A", "B", "C"]);
    }

    #[test]
    fn recency_cap_ignores_position_and_preserves_merge_order() {
        let options = MergeOptions {
            order: MergeOrder::NewFirst,
            max_records: Some(2),
            cap: CapPolicy::Recency,
        };
        let merged = merge(
            vec![rec("A", "2024-01-01T00:00:00Z"), rec("B", "")],
            vec![rec("C", "2024-01-09T00:00:00Z"), rec("D", "2024-01-05T00:00:00Z")],
            &options,
        );
        assert_eq!(links(&merged), vec!["C", "D"]);
    }

    #[test]
    fn duplicate_check_is_exact_on_link() {
        let existing = vec![rec("https://a/1", "")];
        assert!(is_duplicate("https://a/1", &existing));
        assert!(!is_duplicate("https://a/1?x=1", &existing));
        assert!(!is_duplicate("https://a/2", &existing));
    }

    #[tokio::test]
    async fn missing_store_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = NewsStore::new(dir.path().join("news.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn corrupt_store_is_reported_distinctly() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("news.json");
        std::fs::write(&path, b"[{\"title\": ").expect("write");
        let store = NewsStore::new(&path);
        let err = store.load().await.expect_err("corrupt");
        assert!(matches!(err, StoreError::Corrupt { .. }));

        std::fs::write(&path, b"{\"not\": \"a list\"}").expect("write");
        let err = store.load().await.expect_err("wrong shape");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn persist_round_trips_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("news.json");
        let store = NewsStore::new(&path);
        let records = vec![rec("https://a/1", "2024-01-09T00:00:00Z"), rec("https://a/2", "")];

        store.persist(&records).await.expect("persist");
        assert_eq!(store.load().await.expect("load"), records);

        store.persist(&records[..1]).await.expect("overwrite");
        assert_eq!(store.load().await.expect("load"), records[..1].to_vec());

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn persisted_json_is_human_readable_list() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("news.json");
        let store = NewsStore::new(&path);
        store.persist(&[rec("https://a/1", "")]).await.expect("persist");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.starts_with('['));
        assert!(text.contains("\n  {"));
        assert!(text.contains("\"link\": \"https://a/1\""));
    }

    #[tokio::test]
    async fn load_drops_repeated_links() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("news.json");
        let json = serde_json::to_vec(&vec![
            rec("https://a/1", "first"),
            rec("https://a/1", "second"),
            rec("https://a/2", ""),
        ])
        .unwrap();
        std::fs::write(&path, json).expect("write");
        let loaded = NewsStore::new(&path).load().await.expect("load");
        assert_eq!(links(&loaded), vec!["https://a/1", "https://a/2"]);
        assert_eq!(loaded[0].time, "first");
    }

    #[test]
    fn link_index_tracks_membership() {
        let mut index = LinkIndex::from_records(&[rec("https://a/1", "")]);
        assert!(index.contains("https://a/1"));
        assert!(index.insert("https://a/2"));
        assert!(!index.insert("https://a/2"));
        assert_eq!(index.len(), 2);
    }
}
