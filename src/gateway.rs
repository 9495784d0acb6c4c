//! HTTP dispatcher
//!
//! A single axum fallback handler receives every inbound request, classifies
//! it, and either forwards it unmodified to the API server (with the
//! gateway's own credentials) or hands it to the aggregating layer for
//! synthesis. Synthesized watches stream newline-delimited JSON events;
//! dropping the response tears down the channel chain and with it every
//! per-namespace watch.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use kube::Client;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::aggregate::{Aggregator, Route};
use crate::error::Error;
use crate::request::{classify, Operation};
use crate::MAX_REQUEST_BODY;

/// Shared state for the gateway handlers.
pub struct GatewayState {
    /// Client used for direct pass-through forwarding.
    pub client: Client,
    /// The aggregating access layer.
    pub aggregator: Aggregator,
}

/// Build the gateway router. Every path lands in the dispatch handler.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Serve the gateway on the given listener until the process exits.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<GatewayState>) -> Result<(), Error> {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "gateway listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::upstream(format!("server failed: {e}")))
}

async fn dispatch(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    // Only GETs can be list/watch requests; everything else forwards as-is.
    if request.method() != Method::GET {
        return forward(&state.client, request)
            .await
            .unwrap_or_else(error_response);
    }

    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    let resource_request = match classify(&path, &query) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(e),
    };

    let decision = match state.aggregator.route(&resource_request).await {
        Ok(decision) => decision,
        // cannot compute the permission state at all: request failure
        Err(e) => return error_response(e),
    };

    debug!(
        path = %path,
        verb = resource_request.verb(),
        decision = ?decision,
        "dispatching request"
    );

    match decision {
        Route::Direct => forward(&state.client, request)
            .await
            .unwrap_or_else(error_response),
        Route::Aggregate => match resource_request.operation {
            Operation::Watch => match state.aggregator.watch(&resource_request).await {
                Ok(merger) => watch_response(merger),
                Err(e) => error_response(e),
            },
            _ => match state.aggregator.list(&resource_request).await {
                Ok(list) => Json(list).into_response(),
                Err(e) => error_response(e),
            },
        },
    }
}

/// Forward a request unmodified through the kube client, streaming the
/// upstream response back. Method, path, query, and content headers are
/// preserved; authentication is the client's.
async fn forward(client: &Client, request: Request) -> Result<Response, Error> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| Error::upstream(format!("failed to buffer request body: {e}")))?;

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let mut builder = http::Request::builder().method(parts.method).uri(&target);
    let accept = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    builder = builder.header(header::ACCEPT, accept);
    if !bytes.is_empty() {
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json");
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }

    let upstream_request = builder.body(kube::client::Body::from(bytes.to_vec()))?;
    let upstream_response = client.send(upstream_request).await?;

    let (response_parts, response_body) = upstream_response.into_parts();
    Ok(Response::from_parts(response_parts, Body::new(response_body)))
}

/// Stream merged watch events as newline-delimited JSON.
fn watch_response(merger: crate::merge::StreamMerger<serde_json::Value>) -> Response {
    let lines = merger.into_stream().map(|event| {
        let mut line = serde_json::to_vec(&event).unwrap_or_default();
        line.push(b'\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(lines))
    {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to build watch response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Map gateway errors to HTTP responses: malformed paths are the client's
/// fault; anything else means the permission state or upstream could not
/// be reached.
fn error_response(err: Error) -> Response {
    let status = match err {
        Error::MalformedPath(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}
