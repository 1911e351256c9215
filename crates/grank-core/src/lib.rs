//! Core domain model for grank: platforms, snapshots, and persisted rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "grank-core";

/// Storefront platforms a ranking snapshot can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    TapTap,
    Steam,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::TapTap, Platform::Steam];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::TapTap => "taptap",
            Platform::Steam => "steam",
        }
    }

    /// Public storefront domain for this platform.
    pub fn storefront_domain(&self) -> &'static str {
        match self {
            Platform::TapTap => "www.taptap.cn",
            Platform::Steam => "store.steampowered.com",
        }
    }

    /// Canonical listing URL for a native app id, used when the upstream
    /// payload does not carry one.
    pub fn listing_url(&self, platform_id: &str) -> String {
        format!("https://{}/app/{}", self.storefront_domain(), platform_id)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for platform strings that do not name a known storefront.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown platform {:?}", self.0)
    }
}

impl std::error::Error for UnknownPlatform {}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "taptap" => Ok(Platform::TapTap),
            "steam" => Ok(Platform::Steam),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

/// Engagement counters reported alongside a ranking entry. Every field
/// defaults to zero when the upstream payload omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricBundle {
    pub fans_count: i64,
    pub hits_total: i64,
    pub hits_total_val: i64,
    pub wish_count: i64,
}

/// Platform-native tag attached to a snapshot, prior to catalog resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDraft {
    pub native_id: i64,
    pub value: String,
    pub uri: String,
    pub web_url: String,
}

/// One normalized observation of a game on one platform's chart.
///
/// Positions are absolute across pages and 1-based. String fields are empty
/// rather than absent when upstream omits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub platform: Platform,
    pub platform_id: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub logo_url: String,
    pub banner_url: String,
    pub position: i64,
    pub metrics: MetricBundle,
    pub tags: Vec<TagDraft>,
}

/// The time-series slot a batch of snapshots is recorded under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankContext {
    pub rank_type: String,
    pub rank_date: NaiveDate,
}

impl RankContext {
    pub fn new(rank_type: impl Into<String>, rank_date: NaiveDate) -> Self {
        Self {
            rank_type: rank_type.into(),
            rank_date,
        }
    }

    /// Context for the current UTC calendar day.
    pub fn today(rank_type: impl Into<String>) -> Self {
        Self::new(rank_type, Utc::now().date_naive())
    }
}

/// Canonical game row. The title doubles as the cross-platform merge key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub logo_url: String,
    pub banner_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A game's presence on one platform; unique per (platform, platform_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformListing {
    pub id: i64,
    pub game_id: i64,
    pub platform: Platform,
    pub platform_id: String,
    pub url: String,
    pub description: String,
    pub logo_url: String,
    pub banner_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Catalog tag row; unique per (platform, native_tag_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub platform: Platform,
    pub native_tag_id: i64,
    pub value: String,
    pub uri: String,
    pub web_url: String,
}

/// One day's recorded chart entry for a listing; unique per
/// (listing_id, rank_date, rank_type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRow {
    pub id: i64,
    pub listing_id: i64,
    pub rank_date: NaiveDate,
    pub rank_type: String,
    pub position: i64,
    pub metrics: MetricBundle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row identities committed by one snapshot's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSnapshot {
    pub game_id: i64,
    pub listing_id: i64,
    pub ranking_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_strings_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(Platform::from_str(platform.as_str()), Ok(platform));
        }
        assert!(Platform::from_str("itch").is_err());
    }

    #[test]
    fn listing_urls_use_the_storefront_domain() {
        assert_eq!(
            Platform::TapTap.listing_url("247283"),
            "https://www.taptap.cn/app/247283"
        );
        assert_eq!(
            Platform::Steam.listing_url("570"),
            "https://store.steampowered.com/app/570"
        );
    }

    #[test]
    fn platform_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Platform::TapTap).unwrap(),
            "\"taptap\""
        );
        let parsed: Platform = serde_json::from_str("\"steam\"").unwrap();
        assert_eq!(parsed, Platform::Steam);
    }
}
