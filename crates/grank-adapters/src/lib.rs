//! Platform chart adapters and the snapshot normalizer.
//!
//! Each adapter speaks one storefront's chart API (or its fixture format)
//! and produces platform-shaped [`RawEntry`] values carrying absolute chart
//! positions. [`normalize_entry`] turns those into the canonical
//! [`GameSnapshot`] model.

use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use grank_core::{GameSnapshot, MetricBundle, Platform, TagDraft};
use grank_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const CRATE_NAME: &str = "grank-adapters";

const TAPTAP_BASE_URL: &str = "https://www.taptap.cn";
const TAPTAP_API_PATH: &str = "/webapiv2/app-top/v2/hits";
/// Web-app identity the taptap API expects in the `X-UA` query parameter.
const TAPTAP_WEB_UA: &str =
    "V=1&PN=WebApp&LANG=zh_CN&VN_CODE=102&LOC=CN&PLT=PC&DS=Android&OS=Windows&OSV=10&DT=PC";

/// Browser profile the chart endpoint accepts. Encoding headers are left to
/// the client, which negotiates gzip/brotli itself.
const TAPTAP_HEADERS: &[(&str, &str)] = &[
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
         Chrome/120.0.0.0 Safari/537.36",
    ),
    ("Accept", "application/json, text/plain, */*"),
    ("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8"),
    ("Referer", "https://www.taptap.cn/top/hot"),
    ("Origin", "https://www.taptap.cn"),
    (
        "sec-ch-ua",
        "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"Windows\""),
    ("Sec-Fetch-Dest", "empty"),
    ("Sec-Fetch-Mode", "cors"),
    ("Sec-Fetch-Site", "same-origin"),
];

/// How a source fetch should run: live paging against the platform API, or
/// a local fixture document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub use_network: bool,
    pub fixture_path: Option<PathBuf>,
    pub rank_type: String,
    pub page: u32,
    pub page_size: u32,
    pub page_count: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_network: false,
            fixture_path: None,
            rank_type: "hot".to_string(),
            page: 1,
            page_size: 10,
            page_count: 1,
        }
    }
}

/// One chart slot as the platform reported it, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub platform: Platform,
    /// Absolute 1-based chart position, continuous across pages.
    pub position: i64,
    pub payload: RawPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawPayload {
    TapTap(TapTapApp),
    Steam(SteamApp),
}

/// Document-level parse failure. Individual malformed slots are skipped
/// with a warning instead.
#[derive(Debug, Error)]
#[error("malformed chart document: {0}")]
pub struct ParseError(#[from] serde_json::Error);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {0} runs in fixture mode but has no fixture path configured")]
    MissingFixture(&'static str),
    #[error("reading fixture {path}: {source}")]
    FixtureIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("all {pages} chart pages failed for {source_id}; last error: {last}")]
    AllPagesFailed {
        source_id: &'static str,
        pages: u32,
        last: String,
    },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn platform(&self) -> Platform;

    /// Fetch the configured chart window and return raw entries in chart
    /// order. Partial page failures are tolerated; the fetch only fails
    /// when nothing could be collected at all.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        options: &FetchOptions,
    ) -> Result<Vec<RawEntry>, AdapterError>;
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "taptap" => Some(Box::new(TapTapAdapter)),
        "steam" => Some(Box::new(SteamAdapter)),
        _ => None,
    }
}

/// Zero-based slot offset of a chart page.
pub fn page_start_index(page: u32, page_size: u32) -> i64 {
    i64::from(page.saturating_sub(1)) * i64::from(page_size)
}

/// Chart page URL with the slot offset, page size, rank type, and the
/// URL-encoded web-app identity.
pub fn taptap_page_url(rank_type: &str, page: u32, page_size: u32) -> String {
    let from = page_start_index(page, page_size);
    format!(
        "{TAPTAP_BASE_URL}{TAPTAP_API_PATH}?from={from}&limit={page_size}&type_name={rank_type}&X-UA={}",
        urlencoding::encode(TAPTAP_WEB_UA)
    )
}

#[derive(Debug, Deserialize)]
struct TapTapEnvelope {
    data: TapTapChart,
}

#[derive(Debug, Default, Deserialize)]
struct TapTapChart {
    #[serde(default)]
    list: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct TapTapSlot {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    app: Option<TapTapApp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapTapApp {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<TapTapText>,
    #[serde(default)]
    pub icon: Option<TapTapImage>,
    #[serde(default)]
    pub banner: Option<TapTapImage>,
    #[serde(default)]
    pub stat: Option<TapTapStat>,
    #[serde(default)]
    pub tags: Vec<TapTapTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapTapText {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapTapImage {
    #[serde(default)]
    pub original_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapTapStat {
    #[serde(default)]
    pub fans_count: i64,
    #[serde(default)]
    pub hits_total: i64,
    #[serde(default)]
    pub hits_total_val: i64,
    #[serde(default)]
    pub wish_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapTapTag {
    pub id: i64,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub uri: String,
}

/// Parse one taptap chart document. `start_index` is the zero-based slot
/// offset of the page; positions are assigned per raw slot so the chart
/// stays continuous across pages. Slots that fail to decode, and slots
/// whose `type` is not `"app"`, are skipped individually.
pub fn parse_taptap_page(body: &[u8], start_index: i64) -> Result<Vec<RawEntry>, ParseError> {
    let envelope: TapTapEnvelope = serde_json::from_slice(body)?;
    let mut entries = Vec::new();
    for (slot, raw) in envelope.data.list.into_iter().enumerate() {
        let position = start_index + slot as i64 + 1;
        let slot: TapTapSlot = match serde_json::from_value(raw) {
            Ok(slot) => slot,
            Err(err) => {
                warn!(position, error = %err, "skipping malformed chart slot");
                continue;
            }
        };
        if slot.kind != "app" {
            debug!(position, kind = %slot.kind, "skipping non-app chart slot");
            continue;
        }
        let Some(app) = slot.app else {
            warn!(position, "app slot carries no payload; skipping");
            continue;
        };
        entries.push(RawEntry {
            platform: Platform::TapTap,
            position,
            payload: RawPayload::TapTap(app),
        });
    }
    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct SteamEnvelope {
    applist: SteamAppList,
}

#[derive(Debug, Default, Deserialize)]
struct SteamAppList {
    #[serde(default)]
    apps: Vec<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SteamApp {
    pub appid: i64,
    pub name: String,
    #[serde(default)]
    pub detailed_description: String,
    #[serde(default)]
    pub owners: i64,
    #[serde(default)]
    pub header_image: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub followers: i64,
    #[serde(default)]
    pub player_count: i64,
    #[serde(default)]
    pub wishlist_count: i64,
    #[serde(default)]
    pub genres: Vec<SteamGenre>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SteamGenre {
    pub id: i64,
    #[serde(default)]
    pub description: String,
}

/// Parse a steam app-list document. List order is chart order; positions
/// are 1-based. Malformed apps are skipped individually.
pub fn parse_steam_document(body: &[u8]) -> Result<Vec<RawEntry>, ParseError> {
    let envelope: SteamEnvelope = serde_json::from_slice(body)?;
    let mut entries = Vec::new();
    for (slot, raw) in envelope.applist.apps.into_iter().enumerate() {
        let position = slot as i64 + 1;
        let app: SteamApp = match serde_json::from_value(raw) {
            Ok(app) => app,
            Err(err) => {
                warn!(position, error = %err, "skipping malformed steam app");
                continue;
            }
        };
        entries.push(RawEntry {
            platform: Platform::Steam,
            position,
            payload: RawPayload::Steam(app),
        });
    }
    Ok(entries)
}

fn read_fixture(source_id: &'static str, options: &FetchOptions) -> Result<Vec<u8>, AdapterError> {
    let Some(path) = options.fixture_path.as_ref() else {
        return Err(AdapterError::MissingFixture(source_id));
    };
    fs::read(path).map_err(|source| AdapterError::FixtureIo {
        path: path.clone(),
        source,
    })
}

/// Mobile storefront chart adapter. Network mode pages through the public
/// web API with a browser header profile; fixture mode replays a captured
/// document.
pub struct TapTapAdapter;

#[async_trait]
impl SourceAdapter for TapTapAdapter {
    fn source_id(&self) -> &'static str {
        "taptap"
    }

    fn platform(&self) -> Platform {
        Platform::TapTap
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        options: &FetchOptions,
    ) -> Result<Vec<RawEntry>, AdapterError> {
        if !options.use_network {
            let bytes = read_fixture(self.source_id(), options)?;
            return match parse_taptap_page(&bytes, 0) {
                Ok(entries) => Ok(entries),
                Err(err) => {
                    error!(error = %err, "taptap fixture did not parse; yielding empty batch");
                    Ok(Vec::new())
                }
            };
        }

        let mut entries = Vec::new();
        let mut failed_pages = 0u32;
        let mut last_error = String::new();

        for page_offset in 0..options.page_count {
            let page = options.page + page_offset;
            let url = taptap_page_url(&options.rank_type, page, options.page_size);
            let start_index = page_start_index(page, options.page_size);

            match http.fetch_bytes(&url, TAPTAP_HEADERS).await {
                Ok(response) => match parse_taptap_page(&response.body, start_index) {
                    Ok(mut page_entries) => {
                        debug!(page, count = page_entries.len(), "taptap chart page fetched");
                        entries.append(&mut page_entries);
                    }
                    Err(err) => {
                        warn!(page, error = %err, "taptap chart page failed to parse");
                        failed_pages += 1;
                        last_error = err.to_string();
                    }
                },
                Err(err) => {
                    warn!(page, error = %err, "taptap chart page fetch failed");
                    failed_pages += 1;
                    last_error = err.to_string();
                }
            }

            if page_offset + 1 < options.page_count {
                http.pacing().pause_between_pages().await;
            }
        }

        if options.page_count > 0 && failed_pages == options.page_count {
            return Err(AdapterError::AllPagesFailed {
                source_id: self.source_id(),
                pages: options.page_count,
                last: last_error,
            });
        }
        Ok(entries)
    }
}

/// PC storefront adapter. Only fixture replay is supported; the platform
/// has no public chart endpoint to page through, so network mode yields
/// nothing.
pub struct SteamAdapter;

#[async_trait]
impl SourceAdapter for SteamAdapter {
    fn source_id(&self) -> &'static str {
        "steam"
    }

    fn platform(&self) -> Platform {
        Platform::Steam
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        options: &FetchOptions,
    ) -> Result<Vec<RawEntry>, AdapterError> {
        if options.use_network {
            warn!("steam network fetch is not implemented; yielding empty batch");
            return Ok(Vec::new());
        }

        let bytes = read_fixture(self.source_id(), options)?;
        match parse_steam_document(&bytes) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                error!(error = %err, "steam fixture did not parse; yielding empty batch");
                Ok(Vec::new())
            }
        }
    }
}

/// Canonicalize one raw chart entry. Missing numerics become zero, missing
/// strings empty, and the listing URL is synthesized from the platform's
/// storefront domain.
pub fn normalize_entry(entry: &RawEntry) -> GameSnapshot {
    match &entry.payload {
        RawPayload::TapTap(app) => {
            let platform_id = app.id.to_string();
            let stat = app.stat.clone().unwrap_or_default();
            GameSnapshot {
                platform: Platform::TapTap,
                url: Platform::TapTap.listing_url(&platform_id),
                platform_id,
                title: app.title.clone(),
                description: app
                    .description
                    .as_ref()
                    .map(|d| d.text.clone())
                    .unwrap_or_default(),
                logo_url: app
                    .icon
                    .as_ref()
                    .map(|i| i.original_url.clone())
                    .unwrap_or_default(),
                banner_url: app
                    .banner
                    .as_ref()
                    .map(|i| i.original_url.clone())
                    .unwrap_or_default(),
                position: entry.position,
                metrics: MetricBundle {
                    fans_count: stat.fans_count,
                    hits_total: stat.hits_total,
                    hits_total_val: stat.hits_total_val,
                    wish_count: stat.wish_count,
                },
                tags: app
                    .tags
                    .iter()
                    .map(|tag| TagDraft {
                        native_id: tag.id,
                        value: tag.value.clone(),
                        uri: tag.uri.clone(),
                        web_url: tag.uri.clone(),
                    })
                    .collect(),
            }
        }
        RawPayload::Steam(app) => {
            let platform_id = app.appid.to_string();
            GameSnapshot {
                platform: Platform::Steam,
                url: Platform::Steam.listing_url(&platform_id),
                platform_id,
                title: app.name.clone(),
                description: app.detailed_description.clone(),
                logo_url: app.header_image.clone(),
                banner_url: app.background.clone(),
                position: entry.position,
                metrics: MetricBundle {
                    fans_count: app.followers,
                    hits_total: app.owners,
                    hits_total_val: app.player_count,
                    wish_count: app.wishlist_count,
                },
                tags: app
                    .genres
                    .iter()
                    .map(|genre| {
                        let uri = format!("/tags/{}", genre.id);
                        TagDraft {
                            native_id: genre.id,
                            value: genre.description.clone(),
                            uri: uri.clone(),
                            web_url: uri,
                        }
                    })
                    .collect(),
            }
        }
    }
}

pub fn normalize_batch(entries: &[RawEntry]) -> Vec<GameSnapshot> {
    entries.iter().map(normalize_entry).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grank_storage::{HttpClientConfig, PacingPolicy};
    use std::io::Write;
    use std::time::Duration;

    fn quiet_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(1),
            pacing: PacingPolicy::immediate(),
        })
        .expect("fetcher")
    }

    fn chart_page(ids: std::ops::Range<i64>) -> Vec<u8> {
        let list: Vec<JsonValue> = ids
            .map(|id| {
                serde_json::json!({
                    "type": "app",
                    "app": { "id": id, "title": format!("game-{id}") }
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({ "data": { "list": list } })).expect("page")
    }

    #[test]
    fn page_urls_carry_offset_size_type_and_identity() {
        assert_eq!(page_start_index(1, 10), 0);
        assert_eq!(page_start_index(2, 10), 10);
        assert_eq!(page_start_index(3, 50), 100);

        let url = taptap_page_url("hot", 2, 10);
        assert!(url.starts_with("https://www.taptap.cn/webapiv2/app-top/v2/hits?"));
        assert!(url.contains("from=10"));
        assert!(url.contains("limit=10"));
        assert!(url.contains("type_name=hot"));
        assert!(url.contains("X-UA=V%3D1%26PN%3DWebApp"));
    }

    #[test]
    fn positions_stay_continuous_across_pages() {
        let mut positions = Vec::new();
        for page in 1..=3u32 {
            let start = page_start_index(page, 10);
            let body = chart_page((start + 1)..(start + 11));
            let entries = parse_taptap_page(&body, start).expect("parse");
            positions.extend(entries.iter().map(|e| e.position));
        }
        assert_eq!(positions, (1..=30).collect::<Vec<i64>>());
    }

    #[test]
    fn malformed_and_non_app_slots_are_skipped_individually() {
        let body = serde_json::to_vec(&serde_json::json!({
            "data": { "list": [
                { "type": "app", "app": { "id": 1, "title": "Kept" } },
                { "type": "app", "app": { "id": "not-a-number", "title": "Broken" } },
                { "type": "ad", "ad": { "campaign": 7 } },
                { "type": "app", "app": { "id": 4, "title": "Also Kept" } }
            ]}
        }))
        .expect("body");

        let entries = parse_taptap_page(&body, 0).expect("parse");
        let positions: Vec<i64> = entries.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 4]);
    }

    #[test]
    fn unparsable_documents_are_a_parse_error() {
        assert!(parse_taptap_page(b"<html>offline</html>", 0).is_err());
        assert!(parse_steam_document(b"{\"applist\":").is_err());
    }

    #[test]
    fn steam_documents_parse_in_list_order() {
        let body = serde_json::to_vec(&serde_json::json!({
            "applist": { "apps": [
                { "appid": 570, "name": "Dota 2", "genres": [ { "id": 1, "description": "MOBA" } ] },
                { "appid": 730, "name": "Counter-Strike 2" }
            ]}
        }))
        .expect("body");

        let entries = parse_steam_document(&body).expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].position, 1);
        assert_eq!(entries[1].position, 2);

        let snapshots = normalize_batch(&entries);
        assert_eq!(snapshots[0].platform_id, "570");
        assert_eq!(snapshots[0].tags[0].value, "MOBA");
        assert_eq!(snapshots[0].tags[0].uri, "/tags/1");
        assert_eq!(snapshots[1].url, "https://store.steampowered.com/app/730");
    }

    #[test]
    fn normalization_fills_defaults_and_synthesizes_urls() {
        let entry = RawEntry {
            platform: Platform::TapTap,
            position: 7,
            payload: RawPayload::TapTap(TapTapApp {
                id: 555,
                title: "Foo".to_string(),
                description: None,
                icon: None,
                banner: None,
                stat: None,
                tags: vec![TapTapTag {
                    id: 9,
                    value: "放置".to_string(),
                    uri: "taptap://tag/9".to_string(),
                }],
            }),
        };

        let snapshot = normalize_entry(&entry);
        assert_eq!(snapshot.platform_id, "555");
        assert_eq!(snapshot.url, "https://www.taptap.cn/app/555");
        assert_eq!(snapshot.description, "");
        assert_eq!(snapshot.logo_url, "");
        assert_eq!(snapshot.metrics, MetricBundle::default());
        assert_eq!(snapshot.position, 7);
        assert_eq!(snapshot.tags[0].web_url, "taptap://tag/9");
    }

    #[tokio::test]
    async fn fixture_mode_without_a_path_is_a_configuration_error() {
        let result = TapTapAdapter
            .fetch(&quiet_fetcher(), &FetchOptions::default())
            .await;
        assert!(matches!(result, Err(AdapterError::MissingFixture("taptap"))));
    }

    #[tokio::test]
    async fn missing_fixture_files_fail_the_fetch() {
        let options = FetchOptions {
            fixture_path: Some(PathBuf::from("/nonexistent/chart.json")),
            ..FetchOptions::default()
        };
        let result = TapTapAdapter.fetch(&quiet_fetcher(), &options).await;
        assert!(matches!(result, Err(AdapterError::FixtureIo { .. })));
    }

    #[tokio::test]
    async fn garbage_fixtures_yield_an_empty_batch() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"{ this is not json")
            .expect("write garbage");

        let options = FetchOptions {
            fixture_path: Some(file.path().to_path_buf()),
            ..FetchOptions::default()
        };
        let entries = TapTapAdapter
            .fetch(&quiet_fetcher(), &options)
            .await
            .expect("fetch");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn steam_network_mode_yields_an_empty_batch() {
        let options = FetchOptions {
            use_network: true,
            ..FetchOptions::default()
        };
        let entries = SteamAdapter
            .fetch(&quiet_fetcher(), &options)
            .await
            .expect("fetch");
        assert!(entries.is_empty());
    }

    #[test]
    fn registry_knows_the_supported_sources() {
        assert!(adapter_for_source("taptap").is_some());
        assert!(adapter_for_source("steam").is_some());
        assert!(adapter_for_source("itch").is_none());
    }
}
