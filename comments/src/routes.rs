use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;

use crate::{
    comment::NewComment,
    engine::{EngineHandle, ViewSnapshot},
    error::{AppError, Error},
    json::Json,
    live::MergeReport,
    memory::MemoryBackend,
    paginate::SortField,
    source::{CommentCreator, SourceError},
};

#[derive(Clone)]
pub struct App {
    pub engine: Arc<EngineHandle>,
    pub backend: Arc<MemoryBackend>,
}

pub fn router(app: App) -> Router {
    Router::<App>::new()
        .route("/comments", get(get_view).post(submit_comment))
        .route("/comments/merge", post(merge_comments))
        .route("/comments/sort/{field}", post(select_sort))
        .route("/comments/page/next", post(next_page))
        .route("/comments/page/prev", post(prev_page))
        .route("/comments/retry", post(retry))
        .route("/backend/comments", post(create_on_backend))
        .with_state(app)
}

async fn get_view(State(app): State<App>) -> axum::Json<Arc<ViewSnapshot>> {
    axum::Json(app.engine.view())
}

async fn submit_comment(
    State(app): State<App>,
    Json(submission): Json<NewComment>,
) -> Result<impl IntoResponse, AppError> {
    let comment = app.engine.submit(submission).await?;
    Ok((StatusCode::CREATED, axum::Json(comment)))
}

async fn merge_comments(State(app): State<App>) -> Result<axum::Json<MergeReport>, AppError> {
    Ok(axum::Json(app.engine.merge().await?))
}

// The listing routes answer once the new page is in, or once the fetch failed
async fn select_sort(
    State(app): State<App>,
    Path(field): Path<String>,
) -> Result<axum::Json<Arc<ViewSnapshot>>, AppError> {
    let field: SortField = field
        .parse()
        .map_err(|e| (e, StatusCode::BAD_REQUEST))?;
    app.engine.select_sort(field).await?;
    Ok(axum::Json(app.engine.settled().await?))
}

async fn next_page(State(app): State<App>) -> Result<axum::Json<Arc<ViewSnapshot>>, AppError> {
    app.engine.next_page().await?;
    Ok(axum::Json(app.engine.settled().await?))
}

async fn prev_page(State(app): State<App>) -> Result<axum::Json<Arc<ViewSnapshot>>, AppError> {
    app.engine.prev_page().await?;
    Ok(axum::Json(app.engine.settled().await?))
}

async fn retry(State(app): State<App>) -> Result<axum::Json<Arc<ViewSnapshot>>, AppError> {
    app.engine.retry().await?;
    Ok(axum::Json(app.engine.settled().await?))
}

/// Creates a comment straight on the backend, as another visitor would.
async fn create_on_backend(
    State(app): State<App>,
    Json(mut submission): Json<NewComment>,
) -> Result<impl IntoResponse, AppError> {
    submission.validate().map_err(Error::from)?;

    let comment = app
        .backend
        .create_comment(&submission, Utc::now())
        .await
        .map_err(|e| match e {
            SourceError::Rejected(msg) => AppError::from((msg, StatusCode::UNPROCESSABLE_ENTITY)),
            e => e.into(),
        })?;

    Ok((StatusCode::CREATED, axum::Json(comment)))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Request, header},
    };
    use serde_json::Value;
    use tower::ServiceExt as _;

    use super::*;
    use crate::{engine::CommentEngine, paginate::ListingState, source::Subscription};

    async fn make_app() -> (App, Subscription) {
        let backend = Arc::new(MemoryBackend::with_demo_data());
        let engine = EngineHandle::new(
            CommentEngine::new(ListingState::new(2)),
            backend.clone(),
            backend.clone(),
        );
        let subscription = engine.connect_push(backend.as_ref());
        engine.settled().await.unwrap();

        let app = App {
            engine: Arc::new(engine),
            backend,
        };
        (app, subscription)
    }

    async fn send(app: &App, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        let resp = router(app.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn root_ids(view: &Value) -> Vec<i64> {
        view["threads"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_get_view() {
        let (app, _subscription) = make_app().await;
        let (status, view) = send(&app, "GET", "/comments", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(root_ids(&view), vec![1, 4]);
        assert_eq!(view["total_pages"], 2);
        assert_eq!(view["fetch"]["status"], "idle");
        assert_eq!(view["threads"][0]["replies"][0]["user_name"], "JaneSmith");
    }

    #[tokio::test]
    async fn test_submit_comment() {
        let (app, _subscription) = make_app().await;
        let body = serde_json::json!({
            "user_name": "bob",
            "email": "Bob@Example.com",
            "text": "<code>let x = 1;</code>",
            "parent_id": 4,
        });

        let (status, comment) = send(&app, "POST", "/comments", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(comment["email"], "bob@example.com");
        assert_eq!(comment["parent_id"], 4);
    }

    #[tokio::test]
    async fn test_submit_rejections() {
        let (app, _subscription) = make_app().await;

        let body = serde_json::json!({
            "user_name": "bob",
            "email": "bob@example.com",
            "text": "<i>unclosed",
        });
        let (status, err) = send(&app, "POST", "/comments", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["msg"], "unclosed tags: i");

        let (status, _) = send(&app, "POST", "/comments", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_pushed_comment_shows_after_merge() {
        let (app, _subscription) = make_app().await;
        let body = serde_json::json!({
            "user_name": "eve",
            "email": "eve@example.com",
            "text": "hi from another tab",
        });

        let (status, created) = send(&app, "POST", "/backend/comments", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_, view) = send(&app, "GET", "/comments", None).await;
        assert_eq!(view["pending_count"], 1);

        let (status, report) = send(&app, "POST", "/comments/merge", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["merged"][0], created["id"]);

        let (_, view) = send(&app, "GET", "/comments", None).await;
        assert_eq!(root_ids(&view)[0], created["id"].as_i64().unwrap());
        assert_eq!(view["pending_count"], 0);
    }

    #[tokio::test]
    async fn test_listing_routes() {
        let (app, _subscription) = make_app().await;

        let (status, view) = send(&app, "POST", "/comments/page/next", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(root_ids(&view), vec![5]);
        assert_eq!(view["listing"]["page"], 2);

        let (_, view) = send(&app, "POST", "/comments/page/prev", None).await;
        assert_eq!(root_ids(&view), vec![1, 4]);

        let (_, view) = send(&app, "POST", "/comments/sort/user_name", None).await;
        assert_eq!(view["listing"]["sort_field"], "user_name");
        assert_eq!(root_ids(&view), vec![4, 5], "Ties keep newest first");

        let (status, _) = send(&app, "POST", "/comments/sort/votes", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_after_outage() {
        let (app, _subscription) = make_app().await;
        app.backend.set_unavailable(true);

        let (_, view) = send(&app, "POST", "/comments/page/next", None).await;
        assert_eq!(view["fetch"]["status"], "failed");
        assert_eq!(view["fetch"]["retryable"], true);
        assert_eq!(root_ids(&view), vec![1, 4]);

        app.backend.set_unavailable(false);
        let (_, view) = send(&app, "POST", "/comments/retry", None).await;
        assert_eq!(view["fetch"]["status"], "idle");
        assert_eq!(root_ids(&view), vec![5]);
    }
}
