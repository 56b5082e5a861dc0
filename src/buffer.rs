//! Buffer HTTP service (C2).
//!
//! A small axum service that lets an untrusted uploader stash raw piece
//! bytes under a content-addressed id before announcing an offer, and
//! lets the aggregator (or any storage provider retrieval path) fetch
//! them back by id. Mirrors the `/put` and `/get?id=` routes described in
//! spec.md §4.2, laid out with `forest`'s preferred `axum::Router` style
//! (state extractor + `tower_http::trace::TraceLayer`).

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct BufferState {
    root: Arc<PathBuf>,
}

impl BufferState {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root: Arc::new(root) })
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        // Reject anything that isn't a plain hex id to keep this off the
        // filesystem-traversal blast radius; ids are always ours (sha256
        // hex), but requests to /get are not.
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.root.join(id))
    }
}

pub fn router(state: BufferState) -> Router {
    Router::new()
        .route("/put", post(put_handler))
        .route("/get", get(get_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn put_handler(State(state): State<BufferState>, body: Bytes) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty body").into_response();
    }
    let mut hasher = Sha256::new();
    hasher.update(&body);
    let id = hex::encode(hasher.finalize());

    let Some(path) = state.path_for(&id) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "could not assign id").into_response();
    };

    match tokio::fs::write(&path, &body).await {
        Ok(()) => {
            tracing::info!(id = %id, bytes = body.len(), "buffered piece");
            (StatusCode::OK, Json(serde_json::json!({"id": id}))).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to write buffered piece");
            (StatusCode::INTERNAL_SERVER_ERROR, "write failed").into_response()
        }
    }
}

#[derive(Deserialize)]
struct GetQuery {
    id: String,
}

async fn get_handler(State(state): State<BufferState>, Query(q): Query<GetQuery>) -> Response {
    let Some(path) = state.path_for(&q.id) else {
        return (StatusCode::BAD_REQUEST, "invalid id").into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "No data found").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to read buffered piece");
            (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> BufferState {
        let dir = tempfile::tempdir().unwrap();
        BufferState::new(dir.path().to_path_buf()).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let app = router(test_state());
        let put_res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/put")
                    .body(Body::from("hello world"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(put_res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(put_res.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = parsed["id"].as_str().unwrap().to_string();

        let get_res = app
            .oneshot(Request::builder().uri(format!("/get?id={id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get_res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(get_res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn unknown_id_is_404() {
        let app = router(test_state());
        let res = app
            .oneshot(
                Request::builder()
                    .uri(format!("/get?id={}", "a".repeat(64)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn path_traversal_id_is_rejected() {
        let app = router(test_state());
        let res = app
            .oneshot(
                Request::builder()
                    .uri("/get?id=..%2f..%2fetc%2fpasswd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
