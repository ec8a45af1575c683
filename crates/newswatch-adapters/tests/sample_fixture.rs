use std::path::{Path, PathBuf};
use std::time::Duration;

use newswatch_adapters::{build_adapter, default_fixture_path, SourceAdapter, SourceMode};
use newswatch_storage::{HttpClientConfig, HttpFetcher};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn adapter() -> Box<dyn SourceAdapter> {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    build_adapter(
        "sample",
        SourceMode::Fixture,
        None,
        None,
        &http,
        Duration::ZERO,
        &workspace_root(),
    )
    .expect("sample fixture adapter")
}

#[test]
fn sample_fixture_is_checked_in() {
    assert!(default_fixture_path(&workspace_root(), "sample").exists());
}

#[tokio::test]
async fn sample_fixture_pages_through_both_pages() {
    let adapter = adapter();
    assert_eq!(adapter.source_id(), "sample");

    let first = adapter.fetch_page(None).await.expect("first page");
    assert_eq!(first.candidates.len(), 3);
    let next = first.next_page.expect("second page token");

    let second = adapter.fetch_page(Some(&next)).await.expect("second page");
    assert_eq!(second.candidates.len(), 2);
    assert!(second.next_page.is_none());
    assert!(!second.candidates[1].is_well_formed());
}

#[tokio::test]
async fn sample_fixture_serves_recorded_details_only() {
    let adapter = adapter();
    assert!(adapter.supports_detail());

    let detail = adapter
        .fetch_detail("https://news.example.org/world/nk-missile-0109")
        .await
        .expect("recorded detail");
    assert!(detail.summary.contains("1,000 km"));
    assert_eq!(
        detail.img.as_deref(),
        Some("https://news.example.org/img/nk-missile.jpg")
    );

    assert!(adapter
        .fetch_detail("https://news.example.org/local/weather-0109")
        .await
        .is_err());
}

#[test]
fn mismatched_fixture_owner_is_rejected() {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("http client");
    let fixture = default_fixture_path(&workspace_root(), "sample");
    let err = build_adapter(
        "voa",
        SourceMode::Fixture,
        None,
        Some(&fixture),
        &http,
        Duration::ZERO,
        &workspace_root(),
    )
    .err()
    .expect("owner mismatch");
    assert!(err.to_string().contains("belongs to sample"));
}
