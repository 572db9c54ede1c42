//! Byte-range pass-through from the resolved upstream URL to the client.
//!
//! Browser `<audio>` elements seek with `Range` requests; the proxy
//! forwards the header upstream and hands the upstream's framing
//! (status, content headers) straight back, streaming the body without
//! buffering it.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;

use crate::app_state::SharedState;
use crate::resolver::ResolverError;

pub async fn stream_track(
    Path(track_id): Path<String>,
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let resolved = match state.resolver.resolve(&track_id).await {
        Ok(resolved) => resolved,
        Err(ResolverError::Unavailable(reason)) => {
            tracing::warn!(%track_id, %reason, "stream request for unavailable track");
            return (StatusCode::NOT_FOUND, "track unavailable").into_response();
        }
        Err(e) => {
            tracing::error!(%track_id, error = %e, "resolver failed");
            return (StatusCode::BAD_GATEWAY, "resolver failed").into_response();
        }
    };

    let mut upstream_req = state.resolver.http_client().get(&resolved.url);
    if let Some(range) = headers.get(header::RANGE) {
        upstream_req = upstream_req.header(header::RANGE, range.clone());
    }

    let upstream = match upstream_req.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::error!(%track_id, error = %e, "upstream fetch failed");
            return (StatusCode::BAD_GATEWAY, "upstream fetch failed").into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
    ] {
        if let Some(value) = upstream.headers().get(&name) {
            builder = builder.header(name, value.clone());
        }
    }
    if !upstream.headers().contains_key(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, resolved.content_type);
    }

    let body = Body::from_stream(
        upstream
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
