//! Core domain model and qualification filters for newswatch.
//!
//! Everything in this crate is pure: no I/O, no clock access. Callers pass
//! `now` explicitly so recency decisions are deterministic.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Default trailing window used by [`RecencyFilter`].
pub const DEFAULT_WINDOW_HOURS: i64 = 48;

/// Default number of distinct keyword hits required for relevance.
pub const DEFAULT_THRESHOLD: usize = 2;

/// Persisted article. `link` is the unique key within a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub title: String,
    #[serde(default)]
    pub time: String,
    pub link: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub img: String,
}

/// Unvalidated listing entry handed from an adapter to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawCandidate {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub summary_hint: Option<String>,
    #[serde(default)]
    pub img: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl RawCandidate {
    pub fn new(title: impl Into<String>, link: impl Into<String>, time: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            time: time.into(),
            ..Default::default()
        }
    }

    pub fn with_summary_hint(mut self, hint: impl Into<String>) -> Self {
        self.summary_hint = Some(hint.into());
        self
    }

    /// A candidate needs a headline and an absolute link to enter qualification.
    pub fn is_well_formed(&self) -> bool {
        !self.title.trim().is_empty() && is_absolute_link(self.link.trim())
    }

    /// Title, or title followed by the listing-level lead when one exists.
    pub fn title_and_lead(&self) -> String {
        match self.summary_hint.as_deref().map(str::trim) {
            Some(lead) if !lead.is_empty() => format!("{} {}", self.title.trim(), lead),
            _ => self.title.trim().to_string(),
        }
    }
}

fn is_absolute_link(link: &str) -> bool {
    link.starts_with("https://") || link.starts_with("http://")
}

/// Opaque continuation handed back to the adapter that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(pub String);

impl PageToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One batch of candidates plus the token for the next batch, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidatePage {
    pub candidates: Vec<RawCandidate>,
    pub next_page: Option<PageToken>,
}

impl CandidatePage {
    pub fn last(candidates: Vec<RawCandidate>) -> Self {
        Self {
            candidates,
            next_page: None,
        }
    }

    pub fn with_next(candidates: Vec<RawCandidate>, next: PageToken) -> Self {
        Self {
            candidates,
            next_page: Some(next),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Detail-page enrichment result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArticleDetail {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub img: Option<String>,
}

/// Ordered, de-duplicated, lower-cased relevance terms.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct KeywordSet {
    terms: Vec<String>,
}

impl KeywordSet {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let terms = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self { terms }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl From<Vec<String>> for KeywordSet {
    fn from(terms: Vec<String>) -> Self {
        Self::new(terms)
    }
}

impl From<KeywordSet> for Vec<String> {
    fn from(set: KeywordSet) -> Self {
        set.terms
    }
}

/// How a keyword is matched against text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Keyword must equal one of the word tokens of the text.
    #[default]
    Token,
    /// Keyword must appear as a literal substring of the lower-cased text.
    Substring,
}

/// Split on anything that is not alphanumeric or `_`, lower-casing each token.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Number of distinct keywords found in `text` under `mode`.
pub fn count_matches(text: &str, keywords: &KeywordSet, mode: MatchMode) -> usize {
    match mode {
        MatchMode::Token => {
            let tokens = tokenize(text);
            keywords
                .terms()
                .iter()
                .filter(|k| tokens.contains(k.as_str()))
                .count()
        }
        MatchMode::Substring => {
            let lowered = text.to_lowercase();
            keywords
                .terms()
                .iter()
                .filter(|k| lowered.contains(k.as_str()))
                .count()
        }
    }
}

pub fn is_relevant(text: &str, keywords: &KeywordSet, threshold: usize, mode: MatchMode) -> bool {
    count_matches(text, keywords, mode) >= threshold
}

/// Keyword scoring with an optional exclusion list.
///
/// Exclusion terms use the same matching mode as the keywords: a single
/// excluded term anywhere in the text makes it irrelevant regardless of the
/// hit count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceFilter {
    keywords: KeywordSet,
    exclude: KeywordSet,
    threshold: usize,
    mode: MatchMode,
}

impl RelevanceFilter {
    pub fn new(keywords: KeywordSet, threshold: usize, mode: MatchMode) -> Self {
        Self {
            keywords,
            exclude: KeywordSet::empty(),
            threshold,
            mode,
        }
    }

    pub fn with_exclusions(mut self, exclude: KeywordSet) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn count_matches(&self, text: &str) -> usize {
        count_matches(text, &self.keywords, self.mode)
    }

    pub fn is_excluded(&self, text: &str) -> bool {
        !self.exclude.is_empty() && count_matches(text, &self.exclude, self.mode) > 0
    }

    pub fn is_relevant(&self, text: &str) -> bool {
        !self.is_excluded(text) && self.count_matches(text) >= self.threshold
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y.%m.%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
];

/// Parse a source-reported timestamp into an absolute instant.
///
/// RFC 3339 input carries its own offset; naive forms are read in
/// `naive_offset`. Returns `None` for empty or unrecognised text.
pub fn parse_timestamp(raw: &str, naive_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .and_then(|naive| naive_offset.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Rewrite a recognised timestamp as RFC 3339 in `offset`; keep anything else verbatim.
pub fn normalize_timestamp(raw: &str, offset: FixedOffset) -> String {
    match parse_timestamp(raw, offset) {
        Some(instant) => instant
            .with_timezone(&offset)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        None => raw.trim().to_string(),
    }
}

/// Trailing time window check with an injectable `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecencyFilter {
    window: Duration,
    naive_offset: FixedOffset,
}

impl Default for RecencyFilter {
    fn default() -> Self {
        Self::new(Duration::hours(DEFAULT_WINDOW_HOURS))
    }
}

impl RecencyFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            naive_offset: utc_offset(),
        }
    }

    pub fn with_naive_offset(mut self, offset: FixedOffset) -> Self {
        self.naive_offset = offset;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_within_window(&self, timestamp: &str, now: DateTime<Utc>) -> bool {
        match parse_timestamp(timestamp, self.naive_offset) {
            // a window reaching past the representable range admits every parsed time
            Some(instant) => match now.checked_sub_signed(self.window) {
                Some(start) => instant >= start,
                None => true,
            },
            None => false,
        }
    }
}

pub fn is_within_window(timestamp: &str, window: Duration, now: DateTime<Utc>) -> bool {
    RecencyFilter::new(window).is_within_window(timestamp, now)
}

/// `+00:00`; naive timestamps default to UTC.
pub fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Fixed offset from whole hours, `None` when out of range.
pub fn offset_from_hours(hours: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(hours.checked_mul(3600)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn tokenizer_splits_on_punctuation_and_lowercases() {
        let tokens = tokenize("North-Korea's missile_test, (2024)!");
        for t in ["north", "korea", "s", "missile_test", "2024"] {
            assert!(tokens.contains(t), "missing {t}");
        }
        assert_eq!(tokens.len(), 5);
    }

    #[test]
    fn tokenizer_keeps_hangul_runs() {
        let tokens = tokenize("북한 경제, 위기");
        assert!(tokens.contains("북한"));
        assert!(tokens.contains("경제"));
        assert!(tokens.contains("위기"));
    }

    #[test]
    fn keyword_set_normalizes_and_dedups() {
        let set = KeywordSet::new(["North", " korea ", "", "NORTH"]);
        assert_eq!(set.terms(), &["north".to_string(), "korea".to_string()]);
    }

    #[test]
    fn token_mode_requires_threshold_distinct_hits() {
        let keywords = KeywordSet::new(["north", "korea"]);
        assert!(is_relevant("North Korea sanctions", &keywords, 2, MatchMode::Token));
        assert!(!is_relevant("Korea economy", &keywords, 2, MatchMode::Token));
        assert!(is_relevant("Korea economy", &keywords, 1, MatchMode::Token));
    }

    #[test]
    fn repeated_keyword_counts_once() {
        let keywords = KeywordSet::new(["korea", "north"]);
        assert_eq!(count_matches("Korea korea KOREA", &keywords, MatchMode::Token), 1);
    }

    #[test]
    fn empty_text_only_passes_zero_threshold() {
        let keywords = KeywordSet::new(["korea"]);
        assert!(!is_relevant("", &keywords, 1, MatchMode::Token));
        assert!(is_relevant("", &keywords, 0, MatchMode::Token));
    }

    #[test]
    fn multi_word_keyword_never_matches_in_token_mode() {
        let keywords = KeywordSet::new(["north korea"]);
        assert_eq!(count_matches("north korea", &keywords, MatchMode::Token), 0);
        assert_eq!(count_matches("north korea", &keywords, MatchMode::Substring), 1);
    }

    #[test]
    fn substring_and_token_modes_diverge_across_token_boundary() {
        let keywords = KeywordSet::new(["ea sanc"]);
        assert!(is_relevant("Korea sanctions", &keywords, 1, MatchMode::Substring));
        assert!(!is_relevant("Korea sanctions", &keywords, 1, MatchMode::Token));
    }

    #[test]
    fn hangul_keyword_matches_in_both_modes() {
        let keywords = KeywordSet::new(["북한"]);
        assert!(is_relevant("북한 경제 위기", &keywords, 1, MatchMode::Substring));
        assert!(is_relevant("북한 경제 위기", &keywords, 1, MatchMode::Token));
        // particles attached to the noun defeat token matching only
        assert!(is_relevant("북한이 발표", &keywords, 1, MatchMode::Substring));
        assert!(!is_relevant("북한이 발표", &keywords, 1, MatchMode::Token));
    }

    #[test]
    fn exclusion_overrides_keyword_hits() {
        let filter = RelevanceFilter::new(KeywordSet::new(["north", "korea"]), 2, MatchMode::Token)
            .with_exclusions(KeywordSet::new(["sports"]));
        assert!(filter.is_relevant("North Korea talks"));
        assert!(!filter.is_relevant("North Korea sports team"));
        assert!(!filter.is_relevant("North Korea Sports!"));
    }

    #[test]
    fn exclusions_follow_the_matching_mode() {
        let keywords = KeywordSet::new(["북한"]);
        let exclude = KeywordSet::new(["스포츠"]);
        let text = "북한 선수단 스포츠서울 인터뷰";

        let token = RelevanceFilter::new(keywords.clone(), 1, MatchMode::Token)
            .with_exclusions(exclude.clone());
        assert!(token.is_relevant(text));

        let substring =
            RelevanceFilter::new(keywords, 1, MatchMode::Substring).with_exclusions(exclude);
        assert!(substring.is_excluded(text));
        assert!(!substring.is_relevant(text));
    }

    #[test]
    fn recency_boundary_is_inclusive_of_window_start() {
        let now = ts("2024-01-10T00:00:00Z");
        let window = Duration::days(2);
        assert!(is_within_window("2024-01-08T00:00:01Z", window, now));
        assert!(is_within_window("2024-01-08T00:00:00Z", window, now));
        assert!(!is_within_window("2024-01-07T23:59:59Z", window, now));
    }

    #[test]
    fn oversized_window_admits_parseable_times_without_overflow() {
        let now = ts("2024-01-10T00:00:00Z");
        let huge = Duration::try_hours(10_000_000_000).unwrap();
        assert!(is_within_window("2024-01-09T00:00:00Z", huge, now));
        assert!(is_within_window("1970-01-01T00:00:00Z", huge, now));
        assert!(!is_within_window("", huge, now));
    }

    #[test]
    fn recency_rejects_empty_and_unparseable() {
        let now = ts("2024-01-10T00:00:00Z");
        assert!(!is_within_window("", Duration::days(2), now));
        assert!(!is_within_window("3시간 전", Duration::days(2), now));
    }

    #[test]
    fn naive_timestamps_use_configured_offset() {
        let now = ts("2024-01-10T00:00:00Z");
        let kst = offset_from_hours(9).unwrap();
        let filter = RecencyFilter::new(Duration::days(2)).with_naive_offset(kst);
        // 08:30 KST on the 8th is 23:30 UTC on the 7th
        assert!(!filter.is_within_window("2024-01-08 08:30", now));
        assert!(filter.is_within_window("2024-01-08 09:30", now));
    }

    #[test]
    fn normalize_timestamp_emits_rfc3339_or_keeps_raw() {
        let kst = offset_from_hours(9).unwrap();
        assert_eq!(
            normalize_timestamp("2025-04-18 20:54", kst),
            "2025-04-18T20:54:00+09:00"
        );
        assert_eq!(
            normalize_timestamp("2025-04-18T11:54:00Z", kst),
            "2025-04-18T20:54:00+09:00"
        );
        assert_eq!(normalize_timestamp(" 1시간 전 ", kst), "1시간 전");
    }

    #[test]
    fn candidate_well_formedness() {
        assert!(RawCandidate::new("t", "https://a/1", "").is_well_formed());
        assert!(!RawCandidate::new("", "https://a/1", "").is_well_formed());
        assert!(!RawCandidate::new("t", "", "").is_well_formed());
        assert!(!RawCandidate::new("t", "/news/1", "").is_well_formed());
    }

    #[test]
    fn title_and_lead_joins_non_empty_hint() {
        let c = RawCandidate::new("Title", "https://a/1", "").with_summary_hint("  lead text ");
        assert_eq!(c.title_and_lead(), "Title lead text");
        let bare = RawCandidate::new("Title", "https://a/1", "").with_summary_hint("  ");
        assert_eq!(bare.title_and_lead(), "Title");
    }

    #[test]
    fn article_record_json_uses_documented_field_names() {
        let record = ArticleRecord {
            title: "t".into(),
            time: "2024-01-09T00:00:00Z".into(),
            link: "https://a/1".into(),
            summary: String::new(),
            category: Some("politics".into()),
            img: String::new(),
        };
        let value = serde_json::to_value(&record).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["category", "link", "summary", "time", "title"]);
    }
}
