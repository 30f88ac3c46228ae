//! HTTP read surface of the serving process.
//!
//! Feed pages are read through the same timeline cache the ingestor fills,
//! so a viewer whose timeline was fanned out in this process is served from
//! memory.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::application::feed::{FeedError, FeedPage, FeedReader, FeedRequest};
use crate::domain::types::UserId;
use crate::infra::db::PostgresRepositories;

#[derive(Clone)]
pub struct FeedHttpState {
    reader: Arc<FeedReader>,
    db: Option<PostgresRepositories>,
}

impl FeedHttpState {
    /// `db` backs `/health`; without it the endpoint only reports liveness.
    pub fn new(reader: Arc<FeedReader>, db: Option<PostgresRepositories>) -> Self {
        Self { reader, db }
    }
}

pub fn build_router(state: FeedHttpState) -> Router {
    Router::new()
        .route("/feed/{viewer}", get(read_feed))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    page: Option<u32>,
    limit: Option<usize>,
}

async fn read_feed(
    State(state): State<FeedHttpState>,
    Path(viewer): Path<Uuid>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<FeedPage>, FeedHttpError> {
    let request = FeedRequest {
        page: query.page.unwrap_or(1),
        limit: query.limit,
    };
    let page = state.reader.read(UserId::from(viewer), request).await?;
    Ok(Json(page))
}

async fn health(State(state): State<FeedHttpState>) -> Response {
    let Some(db) = state.db.as_ref() else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match db.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            warn!(error = %err, "Database health check failed");
            FeedHttpError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "db_unavailable",
                message: "Database unavailable",
            }
            .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorMessage,
}

#[derive(Debug, Serialize)]
struct ErrorMessage {
    code: &'static str,
    message: &'static str,
}

#[derive(Debug)]
struct FeedHttpError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
}

impl From<FeedError> for FeedHttpError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::InvalidPage => Self {
                status: StatusCode::BAD_REQUEST,
                code: "invalid_page",
                message: "Page numbers start at 1",
            },
            err => {
                warn!(error = %err, "Feed read failed");
                Self {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    code: "store_unavailable",
                    message: "Feed temporarily unavailable",
                }
            }
        }
    }
}

impl IntoResponse for FeedHttpError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorMessage {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::application::feed::FeedConfig;
    use crate::cache::{MemoryTimelineCache, TimelineCacheConfig};
    use crate::infra::memory::MemoryRepositories;

    fn router() -> Router {
        let store = Arc::new(MemoryRepositories::new());
        let cache = Arc::new(MemoryTimelineCache::new(&TimelineCacheConfig::default()));
        let reader = FeedReader::new(cache, store.clone(), store, FeedConfig::default());
        build_router(FeedHttpState::new(Arc::new(reader), None))
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build");
        let response = router.oneshot(request).await.expect("router should respond");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }

    #[tokio::test]
    async fn page_zero_is_a_bad_request() {
        let (status, body) = get(router(), &format!("/feed/{}?page=0", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_page");
    }

    #[tokio::test]
    async fn unknown_viewer_gets_an_empty_fallback_page() {
        let viewer = Uuid::new_v4();
        let (status, body) = get(router(), &format!("/feed/{viewer}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "fallback");
        assert_eq!(body["page"], 1);
        assert!(body["items"].as_array().expect("items").is_empty());
    }

    #[tokio::test]
    async fn malformed_viewer_is_rejected() {
        let (status, _) = get(router(), "/feed/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_without_database_reports_liveness() {
        let (status, _) = get(router(), "/health").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
