//! HTTP binding of the endpoint tree.
//!
//! The constrained-REST semantics of the resource adapter map directly onto
//! HTTP: GET serves queries, PUT (or POST) serves mutations, and the
//! response classes become status codes. Observable endpoints additionally
//! answer `GET ?observe` with a server-sent event stream that re-reads the
//! endpoint on every change tick.

use crate::error::Result;
use crate::resource::{Code, Site, Verb};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

fn status_for(code: Code) -> StatusCode {
    match code {
        Code::Content | Code::Changed => StatusCode::OK,
        Code::BadRequest => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        Code::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn well_known(State(site): State<Arc<Site>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/link-format")],
        site.link_format(),
    )
}

async fn handle(
    State(site): State<Arc<Site>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path().trim_matches('/').to_string();
    let observe = uri
        .query()
        .is_some_and(|q| q.split('&').any(|p| p == "observe"));
    if method == Method::GET && observe {
        if let Some(rx) = site.observe(&path) {
            return observe_stream(site.clone(), path, rx).into_response();
        }
    }
    let verb = match method {
        Method::GET => Verb::Get,
        Method::PUT | Method::POST => Verb::Put,
        _ => {
            return (StatusCode::METHOD_NOT_ALLOWED, Json("unsupported method")).into_response();
        }
    };
    let payload = if body.is_empty() {
        None
    } else {
        Some(&body[..])
    };
    let response = site.dispatch(verb, &path, payload).await;
    (status_for(response.code), Json(response.payload)).into_response()
}

fn observe_stream(
    site: Arc<Site>,
    path: String,
    rx: tokio::sync::mpsc::UnboundedReceiver<()>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let initial = futures::stream::once({
        let site = site.clone();
        let path = path.clone();
        async move { value_event(&site, &path).await }
    });
    let updates = UnboundedReceiverStream::new(rx).then(move |()| {
        let site = site.clone();
        let path = path.clone();
        async move { value_event(&site, &path).await }
    });
    Sse::new(initial.chain(updates)).keep_alive(KeepAlive::default())
}

async fn value_event(site: &Site, path: &str) -> std::result::Result<Event, Infallible> {
    let response = site.dispatch(Verb::Get, path, None).await;
    Ok(Event::default().data(response.payload.to_string()))
}

/// Build the router over the endpoint tree.
pub fn router(site: Arc<Site>) -> Router {
    Router::new()
        .route("/.well-known/core", get(well_known))
        .fallback(handle)
        .with_state(site)
}

/// Serve until the shutdown future resolves.
pub async fn serve(
    site: Arc<Site>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving instrument interface");
    axum::serve(listener, router(site))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
