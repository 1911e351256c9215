//! Axum JSON API over the game catalog and the ranking time-series.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use grank_core::{GameSnapshot, MetricBundle, Platform, RankContext, TagDraft};
use grank_storage::{BoardFilter, CatalogStore, StorageError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "grank-web";

#[derive(Clone)]
pub struct AppState {
    pub store: CatalogStore,
}

impl AppState {
    pub fn new(store: CatalogStore) -> Self {
        Self { store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/games", get(list_games_handler))
        .route("/api/games/lookup", get(lookup_game_handler))
        .route("/api/games/{id}", get(game_by_id_handler))
        .route(
            "/api/rankings",
            get(rankings_handler).post(submit_ranking_handler),
        )
        .route("/api/rank-dates", get(rank_dates_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("GRANK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4125);
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://data/grank.db".to_string());
    let store = CatalogStore::open(&database_url).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving catalog API");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    platform: Platform,
    platform_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct BoardQuery {
    platform: Option<Platform>,
    rank_type: Option<String>,
    date: Option<NaiveDate>,
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct DatesQuery {
    platform: Option<Platform>,
    rank_type: Option<String>,
}

/// Inbound ranking fact: one observed chart row for one platform listing,
/// as posted by an external collector.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingFactRequest {
    pub platform: Platform,
    pub platform_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logo_url: String,
    #[serde(default)]
    pub banner_url: String,
    #[serde(default)]
    pub tags: Vec<TagPayload>,
    pub rank_type: String,
    pub rank_date: NaiveDate,
    pub position: i64,
    #[serde(default)]
    pub fans_count: i64,
    #[serde(default)]
    pub hits_total: i64,
    #[serde(default)]
    pub hits_total_val: i64,
    #[serde(default)]
    pub wish_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagPayload {
    pub id: i64,
    pub value: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub web_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingFactResponse {
    pub game_id: i64,
    pub listing_id: i64,
    pub ranking_id: i64,
}

impl RankingFactRequest {
    fn into_snapshot_parts(self) -> (GameSnapshot, RankContext) {
        let url = self.platform.listing_url(&self.platform_id);
        let ctx = RankContext::new(self.rank_type, self.rank_date);
        let snapshot = GameSnapshot {
            platform: self.platform,
            platform_id: self.platform_id,
            title: self.title,
            description: self.description,
            url,
            logo_url: self.logo_url,
            banner_url: self.banner_url,
            position: self.position,
            metrics: MetricBundle {
                fans_count: self.fans_count,
                hits_total: self.hits_total,
                hits_total_val: self.hits_total_val,
                wish_count: self.wish_count,
            },
            tags: self
                .tags
                .into_iter()
                .map(|tag| TagDraft {
                    native_id: tag.id,
                    value: tag.value,
                    uri: tag.uri,
                    web_url: tag.web_url,
                })
                .collect(),
        };
        (snapshot, ctx)
    }
}

async fn list_games_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    match state
        .store
        .list_games(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await
    {
        Ok(games) => Json(games).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn game_by_id_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.store.game_by_id(id).await {
        Ok(Some(game)) => Json(game).into_response(),
        Ok(None) => not_found("no game with that id"),
        Err(err) => storage_error(err),
    }
}

async fn lookup_game_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> Response {
    match state
        .store
        .game_by_listing(query.platform, &query.platform_id)
        .await
    {
        Ok(Some(game)) => Json(game).into_response(),
        Ok(None) => not_found("no listing with that platform identity"),
        Err(err) => storage_error(err),
    }
}

async fn rankings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BoardQuery>,
) -> Response {
    let filter = BoardFilter {
        platform: query.platform,
        rank_type: query.rank_type,
        rank_date: query.date,
        limit: query.limit,
    };
    match state.store.ranking_board(&filter).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn rank_dates_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DatesQuery>,
) -> Response {
    match state
        .store
        .rank_dates(query.platform, query.rank_type.as_deref())
        .await
    {
        Ok(dates) => Json(dates).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn submit_ranking_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RankingFactRequest>,
) -> Response {
    let (snapshot, ctx) = request.into_snapshot_parts();
    match state.store.apply_snapshot(&snapshot, &ctx).await {
        Ok(applied) => Json(RankingFactResponse {
            game_id: applied.game_id,
            listing_id: applied.listing_id,
            ranking_id: applied.ranking_id,
        })
        .into_response(),
        Err(err) => storage_error(err),
    }
}

fn storage_error(err: StorageError) -> Response {
    error!(error = %err, "storage operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let store = CatalogStore::open_in_memory().await.expect("store");
        app(AppState::new(store))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn fact(platform: &str, platform_id: &str, title: &str, position: i64) -> serde_json::Value {
        serde_json::json!({
            "platform": platform,
            "platformId": platform_id,
            "title": title,
            "description": "a game",
            "rankType": "hot",
            "rankDate": "2026-03-01",
            "position": position,
            "fansCount": 10,
            "hitsTotal": 20,
            "hitsTotalVal": 30,
            "wishCount": 40,
            "tags": [ { "id": 9, "value": "放置", "uri": "/tag/9", "webUrl": "/tag/9" } ]
        })
    }

    #[tokio::test]
    async fn posting_facts_builds_the_board() {
        let app = test_app().await;

        let first = app
            .clone()
            .oneshot(post_json("/api/rankings", fact("taptap", "555", "Foo", 1)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = body_json(first).await;
        assert!(first["gameId"].as_i64().is_some());
        assert!(first["listingId"].as_i64().is_some());
        assert!(first["rankingId"].as_i64().is_some());

        let second = app
            .clone()
            .oneshot(post_json("/api/rankings", fact("taptap", "556", "Bar", 2)))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);

        let board = app
            .clone()
            .oneshot(get_request("/api/rankings?platform=taptap&rank_type=hot"))
            .await
            .unwrap();
        assert_eq!(board.status(), StatusCode::OK);
        let board = body_json(board).await;
        let rows = board.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["title"], "Foo");
        assert_eq!(rows[0]["position"], 1);
        assert_eq!(rows[1]["title"], "Bar");
        assert_eq!(rows[0]["tags"], serde_json::json!(["放置"]));

        let dates = app
            .oneshot(get_request("/api/rank-dates?platform=taptap"))
            .await
            .unwrap();
        let dates = body_json(dates).await;
        assert_eq!(dates, serde_json::json!(["2026-03-01"]));
    }

    #[tokio::test]
    async fn reposting_a_fact_updates_the_row_in_place() {
        let app = test_app().await;

        let first = body_json(
            app.clone()
                .oneshot(post_json("/api/rankings", fact("taptap", "555", "Foo", 3)))
                .await
                .unwrap(),
        )
        .await;

        let second = body_json(
            app.clone()
                .oneshot(post_json("/api/rankings", fact("taptap", "555", "Foo", 5)))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(first["rankingId"], second["rankingId"]);

        let board = body_json(
            app.oneshot(get_request("/api/rankings?date=2026-03-01"))
                .await
                .unwrap(),
        )
        .await;
        let rows = board.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["position"], 5);
    }

    #[tokio::test]
    async fn the_catalog_lists_games_with_their_listings() {
        let app = test_app().await;
        let posted = body_json(
            app.clone()
                .oneshot(post_json("/api/rankings", fact("steam", "570", "Dota 2", 1)))
                .await
                .unwrap(),
        )
        .await;
        let game_id = posted["gameId"].as_i64().unwrap();

        let games = body_json(app.clone().oneshot(get_request("/api/games")).await.unwrap()).await;
        let games = games.as_array().unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0]["title"], "Dota 2");
        assert_eq!(games[0]["listings"].as_array().unwrap().len(), 1);

        let by_id = app
            .clone()
            .oneshot(get_request(&format!("/api/games/{game_id}")))
            .await
            .unwrap();
        assert_eq!(by_id.status(), StatusCode::OK);

        let lookup = app
            .oneshot(get_request(
                "/api/games/lookup?platform=steam&platform_id=570",
            ))
            .await
            .unwrap();
        assert_eq!(lookup.status(), StatusCode::OK);
        let lookup = body_json(lookup).await;
        assert_eq!(lookup["title"], "Dota 2");
    }

    #[tokio::test]
    async fn unknown_games_are_a_404() {
        let app = test_app().await;

        let by_id = app
            .clone()
            .oneshot(get_request("/api/games/999"))
            .await
            .unwrap();
        assert_eq!(by_id.status(), StatusCode::NOT_FOUND);

        let lookup = app
            .oneshot(get_request(
                "/api/games/lookup?platform=steam&platform_id=nope",
            ))
            .await
            .unwrap();
        assert_eq!(lookup.status(), StatusCode::NOT_FOUND);
    }
}
