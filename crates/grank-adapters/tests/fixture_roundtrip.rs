use std::path::{Path, PathBuf};

use grank_adapters::{normalize_batch, parse_steam_document, parse_taptap_page};
use grank_core::Platform;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn taptap_sample_fixture_round_trips_to_snapshots() {
    let bytes = std::fs::read(workspace_root().join("fixtures/taptap/sample.json"))
        .expect("taptap sample fixture");
    let entries = parse_taptap_page(&bytes, 0).expect("parse");

    // Only app slots survive; the trailing ad slot is dropped.
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].position, 1);
    assert_eq!(entries[1].position, 2);

    let snapshots = normalize_batch(&entries);
    let first = &snapshots[0];
    assert_eq!(first.platform, Platform::TapTap);
    assert_eq!(first.platform_id, "233903");
    assert_eq!(first.title, "明日方舟");
    assert_eq!(first.url, "https://www.taptap.cn/app/233903");
    assert_eq!(first.metrics.fans_count, 4_812_733);
    assert_eq!(first.tags.len(), 2);
    assert_eq!(first.tags[0].value, "策略");
    assert_eq!(first.tags[0].web_url, first.tags[0].uri);
}

#[test]
fn steam_sample_fixture_round_trips_to_snapshots() {
    let bytes = std::fs::read(workspace_root().join("fixtures/steam/sample.json"))
        .expect("steam sample fixture");
    let entries = parse_steam_document(&bytes).expect("parse");
    assert_eq!(entries.len(), 2);

    let snapshots = normalize_batch(&entries);
    let first = &snapshots[0];
    assert_eq!(first.platform, Platform::Steam);
    assert_eq!(first.platform_id, "1091500");
    assert_eq!(first.url, "https://store.steampowered.com/app/1091500");
    assert_eq!(first.metrics.hits_total, 25_000_000);
    assert_eq!(first.metrics.fans_count, 1_204_551);
    assert_eq!(first.metrics.hits_total_val, 44_210);
    assert_eq!(first.metrics.wish_count, 380_112);
    assert_eq!(first.tags[1].uri, "/tags/3");
}
