//! SQLite catalog store, raw batch archive, and HTTP fetch utilities for grank.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use grank_core::{
    AppliedSnapshot, Game, GameSnapshot, MetricBundle, Platform, PlatformListing, RankContext,
    RankingRow, Tag, UnknownPlatform,
};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "grank-storage";

/// Idempotent schema bootstrap, executed on every store open.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    logo_url TEXT NOT NULL DEFAULT '',
    banner_url TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_games_title ON games(title);

CREATE TABLE IF NOT EXISTS platform_listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    game_id INTEGER NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    platform TEXT NOT NULL,
    platform_id TEXT NOT NULL,
    url TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    logo_url TEXT NOT NULL DEFAULT '',
    banner_url TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (platform, platform_id)
);

CREATE INDEX IF NOT EXISTS idx_platform_listings_game ON platform_listings(game_id);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform TEXT NOT NULL,
    native_tag_id INTEGER NOT NULL,
    value TEXT NOT NULL,
    uri TEXT NOT NULL DEFAULT '',
    web_url TEXT NOT NULL DEFAULT '',
    UNIQUE (platform, native_tag_id)
);

CREATE INDEX IF NOT EXISTS idx_tags_platform_value ON tags(platform, value);

CREATE TABLE IF NOT EXISTS listing_tags (
    listing_id INTEGER NOT NULL REFERENCES platform_listings(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (listing_id, tag_id)
);

CREATE TABLE IF NOT EXISTS rankings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id INTEGER NOT NULL REFERENCES platform_listings(id) ON DELETE CASCADE,
    rank_date TEXT NOT NULL,
    rank_type TEXT NOT NULL,
    position INTEGER NOT NULL,
    fans_count INTEGER NOT NULL DEFAULT 0,
    hits_total INTEGER NOT NULL DEFAULT 0,
    hits_total_val INTEGER NOT NULL DEFAULT 0,
    wish_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (listing_id, rank_date, rank_type)
);

CREATE INDEX IF NOT EXISTS idx_rankings_date_type ON rankings(rank_date, rank_type);
"#;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    UnknownPlatform(#[from] UnknownPlatform),
}

impl StorageError {
    /// Whether the error means the handle itself is unusable. Fatal errors
    /// abort the source; everything else skips the offending snapshot.
    pub fn is_fatal(&self) -> bool {
        match self {
            StorageError::Database(err) => matches!(
                err,
                sqlx::Error::Configuration(_)
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StorageError::UnknownPlatform(_) => false,
        }
    }
}

/// Outcome of identity resolution for one snapshot, decided before any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The platform identity is already known; its owning game wins
    /// unconditionally, whatever the snapshot's title says.
    ExistingListing { game_id: i64, listing_id: i64 },
    /// No listing yet, but a game matched; a new listing will attach to it.
    ExistingGame { game_id: i64 },
    /// Nothing matched; a new game and listing will be created.
    NewGame,
}

/// Second-tier matching for snapshots whose platform identity is unseen.
///
/// The default is exact title equality. Swapping the policy changes how
/// cross-platform listings merge without touching any caller.
#[async_trait]
pub trait MergePolicy: Send + Sync {
    async fn match_game(
        &self,
        conn: &mut SqliteConnection,
        snapshot: &GameSnapshot,
    ) -> Result<Option<i64>, StorageError>;
}

/// Exact, case-sensitive title equality.
#[derive(Debug, Clone, Copy, Default)]
pub struct TitleMerge;

#[async_trait]
impl MergePolicy for TitleMerge {
    async fn match_game(
        &self,
        conn: &mut SqliteConnection,
        snapshot: &GameSnapshot,
    ) -> Result<Option<i64>, StorageError> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM games WHERE title = ? ORDER BY id LIMIT 1",
        )
        .bind(&snapshot.title)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(id)
    }
}

/// Jaro-Winkler title similarity above a threshold. Scans the catalog
/// linearly, which is fine at chart-sized catalogs.
#[derive(Debug, Clone, Copy)]
pub struct FuzzyTitleMerge {
    pub threshold: f64,
}

impl Default for FuzzyTitleMerge {
    fn default() -> Self {
        Self { threshold: 0.9 }
    }
}

#[async_trait]
impl MergePolicy for FuzzyTitleMerge {
    async fn match_game(
        &self,
        conn: &mut SqliteConnection,
        snapshot: &GameSnapshot,
    ) -> Result<Option<i64>, StorageError> {
        let rows = sqlx::query("SELECT id, title FROM games")
            .fetch_all(&mut *conn)
            .await?;

        let mut best: Option<(i64, f64)> = None;
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let title: String = row.try_get("title")?;
            let score = strsim::jaro_winkler(&snapshot.title, &title);
            if score >= self.threshold && best.map_or(true, |(_, s)| score > s) {
                best = Some((id, score));
            }
        }
        Ok(best.map(|(id, _)| id))
    }
}

/// Query filter for the daily ranking board. `rank_date` defaults to the
/// most recent recorded day.
#[derive(Debug, Clone, Default)]
pub struct BoardFilter {
    pub platform: Option<Platform>,
    pub rank_type: Option<String>,
    pub rank_date: Option<NaiveDate>,
    pub limit: Option<i64>,
}

/// One row of the ranking board, joined across games, listings and tags.
#[derive(Debug, Clone, Serialize)]
pub struct BoardRow {
    pub ranking_id: i64,
    pub game_id: i64,
    pub listing_id: i64,
    pub title: String,
    pub platform: Platform,
    pub platform_id: String,
    pub url: String,
    pub rank_date: NaiveDate,
    pub rank_type: String,
    pub position: i64,
    pub metrics: MetricBundle,
    pub tags: Vec<String>,
}

/// A catalog game together with its per-platform listings.
#[derive(Debug, Clone, Serialize)]
pub struct GameWithListings {
    #[serde(flatten)]
    pub game: Game,
    pub listings: Vec<PlatformListing>,
}

/// Catalog + ranking time-series store over a single-connection SQLite pool.
///
/// The single connection keeps writes strictly serialized; every snapshot is
/// applied inside its own transaction.
#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    merge: Arc<dyn MergePolicy>,
}

impl CatalogStore {
    /// Open (and bootstrap) a store from a `sqlite:` URL. Parent directories
    /// of a file-backed database are created as needed.
    pub async fn open(database_url: &str) -> Result<Self, StorageError> {
        if let Some(parent) = file_database_parent(database_url) {
            fs::create_dir_all(&parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        Self::connect_with(options).await
    }

    /// In-memory store, used by tests and throwaway runs.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StorageError> {
        // One connection, kept alive for the life of the pool: an in-memory
        // database evaporates with its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            merge: Arc::new(TitleMerge),
        })
    }

    /// Replace the second-tier resolution policy.
    pub fn with_merge_policy(mut self, merge: Arc<dyn MergePolicy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Resolve a snapshot without writing anything.
    pub async fn resolve(&self, snapshot: &GameSnapshot) -> Result<Resolution, StorageError> {
        let mut conn = self.pool.acquire().await?;
        resolve_with(&mut conn, self.merge.as_ref(), snapshot).await
    }

    /// Apply one snapshot under one transaction: game, listing, tags, tag
    /// links, and the day's ranking row move together or not at all.
    pub async fn apply_snapshot(
        &self,
        snapshot: &GameSnapshot,
        ctx: &RankContext,
    ) -> Result<AppliedSnapshot, StorageError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let resolution = resolve_with(&mut tx, self.merge.as_ref(), snapshot).await?;
        let game_id = match resolution {
            Resolution::ExistingListing { game_id, .. } | Resolution::ExistingGame { game_id } => {
                refresh_game(&mut tx, game_id, snapshot, now).await?;
                game_id
            }
            Resolution::NewGame => insert_game(&mut tx, snapshot, now).await?,
        };
        let listing_id = match resolution {
            Resolution::ExistingListing { listing_id, .. } => {
                refresh_listing(&mut tx, listing_id, snapshot, now).await?;
                listing_id
            }
            _ => insert_listing(&mut tx, game_id, snapshot, now).await?,
        };

        let tag_ids = resolve_tags(&mut tx, snapshot.platform, &snapshot.tags).await?;
        reconcile_listing_tags(&mut tx, listing_id, &tag_ids).await?;
        let ranking_id = upsert_ranking(&mut tx, listing_id, snapshot, ctx, now).await?;

        tx.commit().await?;
        debug!(
            game_id,
            listing_id,
            ranking_id,
            platform = %snapshot.platform,
            platform_id = %snapshot.platform_id,
            "applied snapshot"
        );
        Ok(AppliedSnapshot {
            game_id,
            listing_id,
            ranking_id,
        })
    }

    /// Whether any ranking row exists for `(platform, rank_type, date)`.
    /// Drives the optional same-day short-circuit.
    pub async fn has_rankings_for(
        &self,
        platform: Platform,
        rank_type: &str,
        rank_date: NaiveDate,
    ) -> Result<bool, StorageError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS( \
                SELECT 1 FROM rankings r \
                JOIN platform_listings l ON l.id = r.listing_id \
                WHERE l.platform = ? AND r.rank_type = ? AND r.rank_date = ? \
            )",
        )
        .bind(platform.as_str())
        .bind(rank_type)
        .bind(rank_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Catalog page ordered by id, each game carrying its listings.
    pub async fn list_games(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<GameWithListings>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, title, description, logo_url, banner_url, created_at, updated_at \
             FROM games ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut games = Vec::with_capacity(rows.len());
        for row in &rows {
            games.push(row_to_game(row)?);
        }
        let listings = self.listings_for_games(&games).await?;
        Ok(attach_listings(games, listings))
    }

    pub async fn game_by_id(&self, id: i64) -> Result<Option<GameWithListings>, StorageError> {
        let row = sqlx::query(
            "SELECT id, title, description, logo_url, banner_url, created_at, updated_at \
             FROM games WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let game = row_to_game(&row)?;
        let listings = self.listings_for_games(std::slice::from_ref(&game)).await?;
        Ok(attach_listings(vec![game], listings).pop())
    }

    /// Look a game up through one of its platform identities.
    pub async fn game_by_listing(
        &self,
        platform: Platform,
        platform_id: &str,
    ) -> Result<Option<GameWithListings>, StorageError> {
        let game_id = sqlx::query_scalar::<_, i64>(
            "SELECT game_id FROM platform_listings WHERE platform = ? AND platform_id = ?",
        )
        .bind(platform.as_str())
        .bind(platform_id)
        .fetch_optional(&self.pool)
        .await?;
        match game_id {
            Some(id) => self.game_by_id(id).await,
            None => Ok(None),
        }
    }

    /// The ranking board for one day, ordered by position. With no explicit
    /// date the most recent recorded day is used.
    pub async fn ranking_board(&self, filter: &BoardFilter) -> Result<Vec<BoardRow>, StorageError> {
        let rows = sqlx::query(
            "SELECT r.id AS ranking_id, r.rank_date, r.rank_type, r.position, \
                    r.fans_count, r.hits_total, r.hits_total_val, r.wish_count, \
                    g.id AS game_id, g.title, \
                    l.id AS listing_id, l.platform, l.platform_id, l.url, \
                    GROUP_CONCAT(t.value) AS tag_values \
             FROM rankings r \
             JOIN platform_listings l ON l.id = r.listing_id \
             JOIN games g ON g.id = l.game_id \
             LEFT JOIN listing_tags lt ON lt.listing_id = l.id \
             LEFT JOIN tags t ON t.id = lt.tag_id \
             WHERE (?1 IS NULL OR l.platform = ?1) \
               AND (?2 IS NULL OR r.rank_type = ?2) \
               AND r.rank_date = COALESCE(?3, (SELECT MAX(rank_date) FROM rankings)) \
             GROUP BY r.id \
             ORDER BY r.position ASC \
             LIMIT ?4",
        )
        .bind(filter.platform.map(|p| p.as_str()))
        .bind(filter.rank_type.as_deref())
        .bind(filter.rank_date)
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        let mut board = Vec::with_capacity(rows.len());
        for row in rows {
            let tags = row
                .try_get::<Option<String>, _>("tag_values")?
                .map(|joined| joined.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            board.push(BoardRow {
                ranking_id: row.try_get("ranking_id")?,
                game_id: row.try_get("game_id")?,
                listing_id: row.try_get("listing_id")?,
                title: row.try_get("title")?,
                platform: platform_from_row(&row, "platform")?,
                platform_id: row.try_get("platform_id")?,
                url: row.try_get("url")?,
                rank_date: row.try_get("rank_date")?,
                rank_type: row.try_get("rank_type")?,
                position: row.try_get("position")?,
                metrics: MetricBundle {
                    fans_count: row.try_get("fans_count")?,
                    hits_total: row.try_get("hits_total")?,
                    hits_total_val: row.try_get("hits_total_val")?,
                    wish_count: row.try_get("wish_count")?,
                },
                tags,
            });
        }
        Ok(board)
    }

    /// Distinct recorded dates, newest first.
    pub async fn rank_dates(
        &self,
        platform: Option<Platform>,
        rank_type: Option<&str>,
    ) -> Result<Vec<NaiveDate>, StorageError> {
        let dates = sqlx::query_scalar::<_, NaiveDate>(
            "SELECT DISTINCT r.rank_date \
             FROM rankings r \
             JOIN platform_listings l ON l.id = r.listing_id \
             WHERE (?1 IS NULL OR l.platform = ?1) \
               AND (?2 IS NULL OR r.rank_type = ?2) \
             ORDER BY r.rank_date DESC",
        )
        .bind(platform.map(|p| p.as_str()))
        .bind(rank_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(dates)
    }

    /// The recorded ranking row for a listing in one time-series slot.
    pub async fn ranking_for(
        &self,
        listing_id: i64,
        ctx: &RankContext,
    ) -> Result<Option<RankingRow>, StorageError> {
        let row = sqlx::query(
            "SELECT id, listing_id, rank_date, rank_type, position, fans_count, hits_total, \
                    hits_total_val, wish_count, created_at, updated_at \
             FROM rankings WHERE listing_id = ? AND rank_date = ? AND rank_type = ?",
        )
        .bind(listing_id)
        .bind(ctx.rank_date)
        .bind(&ctx.rank_type)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_ranking(&row)).transpose()
    }

    /// Current tag set of a listing, ordered by value.
    pub async fn tags_for_listing(&self, listing_id: i64) -> Result<Vec<Tag>, StorageError> {
        let rows = sqlx::query(
            "SELECT t.id, t.platform, t.native_tag_id, t.value, t.uri, t.web_url \
             FROM tags t \
             JOIN listing_tags lt ON lt.tag_id = t.id \
             WHERE lt.listing_id = ? \
             ORDER BY t.value",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_tag).collect()
    }

    async fn listings_for_games(
        &self,
        games: &[Game],
    ) -> Result<HashMap<i64, Vec<PlatformListing>>, StorageError> {
        let mut by_game: HashMap<i64, Vec<PlatformListing>> = HashMap::new();
        if games.is_empty() {
            return Ok(by_game);
        }
        let placeholders = vec!["?"; games.len()].join(", ");
        let sql = format!(
            "SELECT id, game_id, platform, platform_id, url, description, logo_url, banner_url, \
                    created_at, updated_at \
             FROM platform_listings WHERE game_id IN ({placeholders}) ORDER BY id"
        );
        let mut query = sqlx::query(&sql);
        for game in games {
            query = query.bind(game.id);
        }
        for row in query.fetch_all(&self.pool).await? {
            let listing = row_to_listing(&row)?;
            by_game.entry(listing.game_id).or_default().push(listing);
        }
        Ok(by_game)
    }
}

async fn resolve_with(
    conn: &mut SqliteConnection,
    merge: &dyn MergePolicy,
    snapshot: &GameSnapshot,
) -> Result<Resolution, StorageError> {
    let listing = sqlx::query(
        "SELECT id, game_id FROM platform_listings WHERE platform = ? AND platform_id = ?",
    )
    .bind(snapshot.platform.as_str())
    .bind(&snapshot.platform_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = listing {
        return Ok(Resolution::ExistingListing {
            game_id: row.try_get("game_id")?,
            listing_id: row.try_get("id")?,
        });
    }
    if let Some(game_id) = merge.match_game(conn, snapshot).await? {
        return Ok(Resolution::ExistingGame { game_id });
    }
    Ok(Resolution::NewGame)
}

async fn insert_game(
    conn: &mut SqliteConnection,
    snapshot: &GameSnapshot,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO games (title, description, logo_url, banner_url, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&snapshot.title)
    .bind(&snapshot.description)
    .bind(&snapshot.logo_url)
    .bind(&snapshot.banner_url)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn refresh_game(
    conn: &mut SqliteConnection,
    game_id: i64,
    snapshot: &GameSnapshot,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE games SET description = ?, logo_url = ?, banner_url = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(&snapshot.description)
    .bind(&snapshot.logo_url)
    .bind(&snapshot.banner_url)
    .bind(now)
    .bind(game_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_listing(
    conn: &mut SqliteConnection,
    game_id: i64,
    snapshot: &GameSnapshot,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO platform_listings \
             (game_id, platform, platform_id, url, description, logo_url, banner_url, \
              created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(game_id)
    .bind(snapshot.platform.as_str())
    .bind(&snapshot.platform_id)
    .bind(&snapshot.url)
    .bind(&snapshot.description)
    .bind(&snapshot.logo_url)
    .bind(&snapshot.banner_url)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn refresh_listing(
    conn: &mut SqliteConnection,
    listing_id: i64,
    snapshot: &GameSnapshot,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE platform_listings \
         SET url = ?, description = ?, logo_url = ?, banner_url = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(&snapshot.url)
    .bind(&snapshot.description)
    .bind(&snapshot.logo_url)
    .bind(&snapshot.banner_url)
    .bind(now)
    .bind(listing_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Resolve tag drafts to catalog tag ids, batch-looked-up by value within
/// the platform. Duplicate values in one snapshot collapse to one id; tags
/// missing from the catalog are created carrying the platform-native id.
async fn resolve_tags(
    conn: &mut SqliteConnection,
    platform: Platform,
    drafts: &[grank_core::TagDraft],
) -> Result<Vec<i64>, StorageError> {
    let mut seen = HashSet::new();
    let unique: Vec<_> = drafts
        .iter()
        .filter(|draft| seen.insert(draft.value.as_str()))
        .collect();
    if unique.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; unique.len()].join(", ");
    let sql =
        format!("SELECT id, value FROM tags WHERE platform = ? AND value IN ({placeholders})");
    let mut query = sqlx::query(&sql).bind(platform.as_str());
    for draft in &unique {
        query = query.bind(&draft.value);
    }
    let mut by_value: HashMap<String, i64> = HashMap::new();
    for row in query.fetch_all(&mut *conn).await? {
        by_value.insert(row.try_get("value")?, row.try_get("id")?);
    }

    let mut ids = Vec::with_capacity(unique.len());
    for draft in unique {
        if let Some(&id) = by_value.get(&draft.value) {
            ids.push(id);
            continue;
        }
        // A new value can still collide on the native id when the platform
        // renamed a tag; the upsert folds that into the existing row.
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO tags (platform, native_tag_id, value, uri, web_url) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (platform, native_tag_id) DO UPDATE SET \
                 value = excluded.value, uri = excluded.uri, web_url = excluded.web_url \
             RETURNING id",
        )
        .bind(platform.as_str())
        .bind(draft.native_id)
        .bind(&draft.value)
        .bind(&draft.uri)
        .bind(&draft.web_url)
        .fetch_one(&mut *conn)
        .await?;
        ids.push(id);
    }
    Ok(ids)
}

/// Bring a listing's tag links in line with the snapshot's tag set by delta:
/// stale links are deleted, missing ones inserted. Tag rows stay.
async fn reconcile_listing_tags(
    conn: &mut SqliteConnection,
    listing_id: i64,
    tag_ids: &[i64],
) -> Result<(), StorageError> {
    let current: Vec<i64> =
        sqlx::query_scalar("SELECT tag_id FROM listing_tags WHERE listing_id = ?")
            .bind(listing_id)
            .fetch_all(&mut *conn)
            .await?;
    let desired: HashSet<i64> = tag_ids.iter().copied().collect();
    let existing: HashSet<i64> = current.iter().copied().collect();

    for stale in current.iter().filter(|id| !desired.contains(id)) {
        sqlx::query("DELETE FROM listing_tags WHERE listing_id = ? AND tag_id = ?")
            .bind(listing_id)
            .bind(stale)
            .execute(&mut *conn)
            .await?;
    }
    for added in tag_ids.iter().filter(|id| !existing.contains(id)) {
        sqlx::query("INSERT OR IGNORE INTO listing_tags (listing_id, tag_id) VALUES (?, ?)")
            .bind(listing_id)
            .bind(added)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Ranking rows are keyed by (listing, date, type); re-running a day
/// rewrites position and metrics in place.
async fn upsert_ranking(
    conn: &mut SqliteConnection,
    listing_id: i64,
    snapshot: &GameSnapshot,
    ctx: &RankContext,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO rankings \
             (listing_id, rank_date, rank_type, position, fans_count, hits_total, \
              hits_total_val, wish_count, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (listing_id, rank_date, rank_type) DO UPDATE SET \
             position = excluded.position, \
             fans_count = excluded.fans_count, \
             hits_total = excluded.hits_total, \
             hits_total_val = excluded.hits_total_val, \
             wish_count = excluded.wish_count, \
             updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(listing_id)
    .bind(ctx.rank_date)
    .bind(&ctx.rank_type)
    .bind(snapshot.position)
    .bind(snapshot.metrics.fans_count)
    .bind(snapshot.metrics.hits_total)
    .bind(snapshot.metrics.hits_total_val)
    .bind(snapshot.metrics.wish_count)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

fn platform_from_row(row: &SqliteRow, column: &str) -> Result<Platform, StorageError> {
    let raw: String = row.try_get(column)?;
    Ok(Platform::from_str(&raw)?)
}

fn row_to_game(row: &SqliteRow) -> Result<Game, StorageError> {
    Ok(Game {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        logo_url: row.try_get("logo_url")?,
        banner_url: row.try_get("banner_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_listing(row: &SqliteRow) -> Result<PlatformListing, StorageError> {
    Ok(PlatformListing {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        platform: platform_from_row(row, "platform")?,
        platform_id: row.try_get("platform_id")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        logo_url: row.try_get("logo_url")?,
        banner_url: row.try_get("banner_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_tag(row: &SqliteRow) -> Result<Tag, StorageError> {
    Ok(Tag {
        id: row.try_get("id")?,
        platform: platform_from_row(row, "platform")?,
        native_tag_id: row.try_get("native_tag_id")?,
        value: row.try_get("value")?,
        uri: row.try_get("uri")?,
        web_url: row.try_get("web_url")?,
    })
}

fn row_to_ranking(row: &SqliteRow) -> Result<RankingRow, StorageError> {
    Ok(RankingRow {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        rank_date: row.try_get("rank_date")?,
        rank_type: row.try_get("rank_type")?,
        position: row.try_get("position")?,
        metrics: MetricBundle {
            fans_count: row.try_get("fans_count")?,
            hits_total: row.try_get("hits_total")?,
            hits_total_val: row.try_get("hits_total_val")?,
            wish_count: row.try_get("wish_count")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn attach_listings(
    games: Vec<Game>,
    mut listings: HashMap<i64, Vec<PlatformListing>>,
) -> Vec<GameWithListings> {
    games
        .into_iter()
        .map(|game| {
            let listings = listings.remove(&game.id).unwrap_or_default();
            GameWithListings { game, listings }
        })
        .collect()
}

fn file_database_parent(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay pacing for source fetches: a bounded number of attempts per
/// request, a fixed pause before each retry, and a fixed pause between
/// consecutive chart pages.
#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    pub page_delay: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_secs(2),
            page_delay: Duration::from_secs(1),
        }
    }
}

impl PacingPolicy {
    /// Same attempt budget, zero delays. Tests use this.
    pub const fn immediate() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
        }
    }

    pub async fn pause_before_retry(&self) {
        if !self.retry_delay.is_zero() {
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    pub async fn pause_between_pages(&self) {
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub pacing: PacingPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            pacing: PacingPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with retry classification and pacing. Header profiles
/// are supplied per request by the adapters.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacing: PacingPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            pacing: config.pacing,
        })
    }

    pub fn pacing(&self) -> PacingPolicy {
        self.pacing
    }

    /// GET a URL with the given header profile, retrying transient failures
    /// (5xx, 429, transport errors) up to the pacing policy's attempt budget.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let attempts = self.pacing.retry_attempts.max(1);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 1..=attempts {
            debug!(url, attempt, "requesting");
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < attempts
                    {
                        warn!(%status, url = %final_url, attempt, "retrying after http status");
                        self.pacing.pause_before_retry().await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < attempts
                    {
                        warn!(error = %err, attempt, "retrying after transport error");
                        last_request_error = Some(err);
                        self.pacing.pause_before_retry().await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// A fetched batch archived on disk.
#[derive(Debug, Clone)]
pub struct ArchivedBatch {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of fetched ranking batches, one JSON document
/// per fetch under `<source>/<date>/<hash>.json`. Identical payloads
/// deduplicate by hash; writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn batch_relative_path(source_id: &str, day: NaiveDate, content_hash: &str) -> PathBuf {
        PathBuf::from(source_id)
            .join(day.to_string())
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_batch(
        &self,
        source_id: &str,
        day: NaiveDate,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedBatch> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::batch_relative_path(source_id, day, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedBatch {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = self
            .root
            .join(&relative_path)
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp archive {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(ArchivedBatch {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}
