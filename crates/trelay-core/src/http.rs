use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::{any, get};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use trelay_common::{AccountResolver, Headers, HttpMethod, UpstreamClient, header_get};

use crate::conn_test::run_connection_test;
use crate::relay::{InboundRequest, RelayCore, RelayResponse};

pub struct AppState {
    pub relay: RelayCore,
    pub accounts: Arc<dyn AccountResolver>,
    pub client: Arc<dyn UpstreamClient>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/accounts/{account_id}/test", get(connection_test_handler))
        .route("/{account_id}/{*path}", any(relay_handler))
        .with_state(state)
}

async fn relay_handler(
    State(state): State<Arc<AppState>>,
    Path((account_id, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(method) = map_method(&method) else {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    };

    let headers = headers_to_vec(&headers);
    let api_key_id = header_get(&headers, "x-api-key-id").map(|value| value.to_string());
    let inbound = InboundRequest {
        account_id,
        api_key_id,
        method,
        path: format!("/{}", path.trim_start_matches('/')),
        headers,
        body,
    };

    match state.relay.handle(inbound).await {
        RelayResponse::Json { status, body } => json_response(status, body),
        RelayResponse::Stream { status, body } => sse_response(status, body),
    }
}

async fn connection_test_handler(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    let accounts = state.accounts.clone();
    let client = state.client.clone();
    tokio::spawn(async move {
        run_connection_test(&account_id, accounts, client, tx).await;
    });
    sse_response(200, rx)
}

fn map_method(method: &Method) -> Option<HttpMethod> {
    if *method == Method::GET {
        Some(HttpMethod::Get)
    } else if *method == Method::POST {
        Some(HttpMethod::Post)
    } else if *method == Method::PUT {
        Some(HttpMethod::Put)
    } else if *method == Method::PATCH {
        Some(HttpMethod::Patch)
    } else if *method == Method::DELETE {
        Some(HttpMethod::Delete)
    } else {
        None
    }
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn json_response(status: u16, body: Bytes) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    resp.headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    resp
}

fn sse_response(status: u16, rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Response::new(Body::from_stream(stream));
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let headers = resp.headers_mut();
    headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    resp
}

fn plain_response(status: StatusCode, message: &'static str) -> Response {
    let mut resp = Response::new(Body::from(message));
    *resp.status_mut() = status;
    resp
}
