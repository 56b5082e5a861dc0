//! Transfer HTTP server (C7).
//!
//! Serves a sealed aggregate's bytes to the storage provider performing
//! the unsealed data transfer: the fixed CAR prefix followed by each
//! piece's bytes, fetched lazily from wherever its offer said it lived.
//! Mirrors `transferHandler` in `examples/original_source/xchain.go`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::offer::Offer;
use crate::podsi::{self, Aggregate};

/// A registered transfer: the sealed aggregate plus the offers composing
/// it, keyed by the monotonically-assigned `transferID` the storage
/// provider is told to fetch from, per spec.md §3.
pub struct Transfer {
    pub aggregate: Aggregate,
    pub offers: Vec<Offer>,
}

#[derive(Clone)]
pub struct TransferState {
    transfers: Arc<RwLock<HashMap<u64, Arc<Transfer>>>>,
    next_id: Arc<AtomicU64>,
    http: reqwest::Client,
}

impl TransferState {
    pub fn new() -> Self {
        Self {
            transfers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            http: reqwest::Client::new(),
        }
    }

    /// Registers a sealed aggregate under a freshly-allocated monotonic
    /// id, making it servable at `/?id=<id>`, and returns that id.
    pub fn register(&self, transfer: Transfer) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.transfers.write().insert(id, Arc::new(transfer));
        id
    }

    pub fn remove(&self, id: u64) {
        self.transfers.write().remove(&id);
    }

    fn get(&self, id: u64) -> Option<Arc<Transfer>> {
        self.transfers.read().get(&id).cloned()
    }
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: TransferState) -> Router {
    Router::new()
        .route("/", get(get_handler).head(head_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Content-Length sent for a transfer: the target aggregate size minus
/// its Fr32 padding overhead (`target - target/128`), per spec.md §4.7.
pub fn unpadded_content_length(target: u64) -> u64 {
    target - target / 128
}

#[derive(Deserialize)]
struct IdQuery {
    id: u64,
}

async fn head_handler(State(state): State<TransferState>, Query(q): Query<IdQuery>) -> Response {
    match state.get(q.id) {
        Some(transfer) => {
            let len = unpadded_content_length(transfer.aggregate.target());
            let mut res = StatusCode::OK.into_response();
            res.headers_mut().insert(
                axum::http::header::CONTENT_LENGTH,
                HeaderValue::from_str(&len.to_string()).expect("integer is valid header value"),
            );
            res
        }
        None => not_found(),
    }
}

async fn get_handler(State(state): State<TransferState>, Query(q): Query<IdQuery>) -> Response {
    let Some(transfer) = state.get(q.id) else {
        return not_found();
    };

    let prefix_reader = std::io::Cursor::new(podsi::prefix_car_bytes());
    let mut readers: Vec<Box<dyn tokio::io::AsyncRead + Unpin + Send>> =
        vec![Box::new(CursorReader(prefix_reader))];

    for offer in &transfer.offers {
        let client = state.http.clone();
        let location = offer.location.clone();
        readers.push(Box::new(RemoteReader::new(client, location)));
    }

    let chained = Aggregate::aggregate_object_reader(readers);
    let stream = tokio_util::io::ReaderStream::new(chained);
    let body = Body::from_stream(stream);

    let mut res = Response::builder().status(StatusCode::OK);
    res = res.header(
        axum::http::header::CONTENT_LENGTH,
        unpadded_content_length(transfer.aggregate.target()).to_string(),
    );
    res.body(body).expect("static headers are always valid")
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "No data found").into_response()
}

/// Wraps an in-memory `Cursor` as an `AsyncRead`, used to stream the
/// fixed CAR prefix bytes alongside the lazily-fetched sub-piece readers.
struct CursorReader(std::io::Cursor<Vec<u8>>);

impl tokio::io::AsyncRead for CursorReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::io::Read;
        let this = self.get_mut();
        let mut tmp = vec![0u8; buf.remaining()];
        let n = this.0.read(&mut tmp)?;
        buf.put_slice(&tmp[..n]);
        std::task::Poll::Ready(Ok(()))
    }
}

/// Lazily fetches one piece's bytes from its offer's `location` URL the
/// first time it's polled, then streams the response body through.
struct RemoteReader {
    client: reqwest::Client,
    location: String,
    inner: Option<reqwest::Response>,
    pending: Option<std::pin::Pin<Box<dyn std::future::Future<Output = reqwest::Result<reqwest::Response>> + Send>>>,
}

impl RemoteReader {
    fn new(client: reqwest::Client, location: String) -> Self {
        Self { client, location, inner: None, pending: None }
    }
}

impl tokio::io::AsyncRead for RemoteReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(resp) = this.inner.as_mut() {
                let fut = resp.chunk();
                let mut fut = Box::pin(fut);
                return match fut.as_mut().poll(cx) {
                    std::task::Poll::Ready(Ok(Some(chunk))) => {
                        buf.put_slice(&chunk);
                        std::task::Poll::Ready(Ok(()))
                    }
                    std::task::Poll::Ready(Ok(None)) => std::task::Poll::Ready(Ok(())),
                    std::task::Poll::Ready(Err(e)) => {
                        std::task::Poll::Ready(Err(podsi::io_other(e)))
                    }
                    std::task::Poll::Pending => std::task::Poll::Pending,
                };
            }
            if this.pending.is_none() {
                let client = this.client.clone();
                let url = this.location.clone();
                this.pending = Some(Box::pin(async move { client.get(url).send().await }));
            }
            match this.pending.as_mut().unwrap().as_mut().poll(cx) {
                std::task::Poll::Ready(Ok(resp)) => {
                    this.pending = None;
                    this.inner = Some(resp);
                    continue;
                }
                std::task::Poll::Ready(Err(e)) => {
                    this.pending = None;
                    return std::task::Poll::Ready(Err(podsi::io_other(e)));
                }
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpadded_length_strips_fr32_overhead() {
        assert_eq!(unpadded_content_length(1 << 20), (1 << 20) - (1 << 20) / 128);
    }

    #[tokio::test]
    async fn unknown_transfer_id_is_404() {
        let state = TransferState::new();
        let app = router(state);
        use axum::body::Body as AxBody;
        use axum::http::Request;
        use tower::ServiceExt;
        let res = app
            .oneshot(Request::builder().uri("/?id=404404").body(AxBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn register_assigns_monotonically_increasing_ids() {
        let state = TransferState::new();
        let agg = || Aggregate::new(1 << 20, &[podsi::prefix_piece()]).unwrap();
        let first = state.register(Transfer { aggregate: agg(), offers: vec![] });
        let second = state.register(Transfer { aggregate: agg(), offers: vec![] });
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
