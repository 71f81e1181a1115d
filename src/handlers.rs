// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers. Each one turns a request into broker events and waits on
//! its own one-shot handle:
//! - `GET <host>/<subdomain>`: agent poll (stage 1 consumer).
//! - other methods on `<host>/<subdomain>`: agent response (stage 2 responder).
//! - anything on `<subdomain>.<host>`: public request (stage 1 producer, then
//!   stage 2 waiting-for-response).
//! - `GET <host>/`: status page.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{self, Body};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use log::debug;
use tokio::time::Instant;

use crate::broker::{
    Broker, Consumer, Event, Producer, Responder, WaitingForResponse, Wake, wait_until,
};
use crate::config::normalize_host;
use crate::protocol::{ExchangeId, ForwardedRequest, PostedResponse, error_response};
use crate::stats::{ConnGuard, ConnKind, Stats};
use crate::store::RequestCounter;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    /// Normalized relay host.
    pub host: Arc<str>,
    pub timeout: Duration,
    /// Cap on buffered response-post bodies.
    pub max_body_bytes: Option<usize>,
    pub stats: Arc<Stats>,
    pub counter: Arc<RequestCounter>,
}

pub fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

fn request_host(req: &Request) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .map(normalize_host)
        .unwrap_or_default()
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let host = request_host(&req);

    if host == *state.host {
        let subdomain = req.uri().path().trim_matches('/').to_string();
        if req.method() == Method::GET && subdomain.is_empty() {
            return status_page(&state);
        }
        state.counter.increment();
        if req.method() == Method::GET {
            return poll(state, subdomain).await;
        }
        return post_response(state, req).await;
    }

    state.counter.increment();
    let suffix = format!(".{}", state.host);
    match host.strip_suffix(&suffix) {
        Some(subdomain) if !subdomain.is_empty() => {
            let subdomain = subdomain.to_string();
            tunnel(state, subdomain, req).await
        }
        _ => error_response(StatusCode::NOT_FOUND, format!("unknown host {host:?}")),
    }
}

fn unavailable() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down")
}

fn fresh_id() -> Result<ExchangeId, Response> {
    ExchangeId::generate().map_err(|e| {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("cannot generate id: {e}"))
    })
}

async fn read_body(body: Body, limit: Option<usize>) -> Result<Bytes, Response> {
    body::to_bytes(body, limit.unwrap_or(usize::MAX)).await.map_err(|e| {
        let reason = match limit {
            Some(limit) => format!("response body unreadable or over {limit} bytes: {e}"),
            None => format!("response body unreadable: {e}"),
        };
        error_response(StatusCode::PAYLOAD_TOO_LARGE, reason)
    })
}

/// Agent long-poll: waits for the next request addressed to `subdomain`.
async fn poll(state: AppState, subdomain: String) -> Response {
    let _conn = ConnGuard::new(ConnKind::Agent, state.stats.clone());
    let deadline = Instant::now() + state.timeout;
    let id = match fresh_id() {
        Ok(id) => id,
        Err(res) => return res,
    };

    let (consumer, rx) = Consumer::new(id.clone());
    let leave = state.broker.leave_guard(Event::ConsumerLeave {
        subdomain: subdomain.clone(),
        id,
    });
    if !state.broker.submit(Event::ConsumerArrived { subdomain: subdomain.clone(), consumer }) {
        return unavailable();
    }

    match wait_until(rx, deadline).await {
        Wake::Ready(request) => {
            leave.disarm();
            debug!("[{subdomain}] agent took {} {} ({})", request.method, request.url, request.id);
            request.into_poll_response()
        }
        Wake::TimedOut => {
            Stats::record(&state.stats.timed_out);
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                format!("no request for {subdomain} within {:?}", state.timeout),
            )
        }
        Wake::Closed => unavailable(),
    }
}

/// Agent response post: waits until the caller of the exchange takes it.
async fn post_response(state: AppState, req: Request) -> Response {
    let _conn = ConnGuard::new(ConnKind::Agent, state.stats.clone());
    let deadline = Instant::now() + state.timeout;
    let (parts, body) = req.into_parts();
    let body = match read_body(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(res) => return res,
    };
    let (id, response) = match PostedResponse::from_post(&parts.headers, body) {
        Ok(decoded) => decoded,
        Err(e) => {
            Stats::record(&state.stats.rejected);
            debug!("rejected response post to {}: {}", parts.uri, e);
            return error_response(StatusCode::BAD_REQUEST, e);
        }
    };

    let (responder, delivered) = Responder::new(id.clone(), response);
    let leave = state.broker.leave_guard(Event::ResponseLeave { id: id.clone() });
    if !state.broker.submit(Event::ResponsePosted { responder }) {
        leave.disarm();
        return unavailable();
    }

    match wait_until(delivered, deadline).await {
        Wake::Ready(()) => {
            leave.disarm();
            StatusCode::OK.into_response()
        }
        Wake::TimedOut => {
            Stats::record(&state.stats.timed_out);
            error_response(StatusCode::GATEWAY_TIMEOUT, format!("no caller is waiting for {id}"))
        }
        Wake::Closed => {
            // Replaced by a later post for the same id; that one owns the entry now.
            leave.disarm();
            error_response(StatusCode::CONFLICT, format!("response for {id} was replaced"))
        }
    }
}

/// Public request: hands itself to an agent poll, then waits for the
/// agent's response. Both waits share one deadline. The body is not read
/// here; the matched poll streams it to the agent.
async fn tunnel(state: AppState, subdomain: String, req: Request) -> Response {
    let _conn = ConnGuard::new(ConnKind::Public, state.stats.clone());
    let deadline = Instant::now() + state.timeout;
    let id = match fresh_id() {
        Ok(id) => id,
        Err(res) => return res,
    };
    let (parts, body) = req.into_parts();
    let request = ForwardedRequest::from_public(id.clone(), &parts, body);
    Stats::record(&state.stats.tunneled);
    debug!("[{subdomain}] {} {} as {id}", request.method, request.url);

    let (producer, matched) = Producer::new(request);
    let leave = state.broker.leave_guard(Event::ProducerLeave {
        subdomain: subdomain.clone(),
        id: id.clone(),
    });
    if !state.broker.submit(Event::ProducerArrived { subdomain: subdomain.clone(), producer }) {
        return unavailable();
    }
    match wait_until(matched, deadline).await {
        Wake::Ready(()) => leave.disarm(),
        Wake::TimedOut => {
            Stats::record(&state.stats.timed_out);
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                format!("no agent is serving {subdomain}"),
            );
        }
        Wake::Closed => return unavailable(),
    }

    let (waiting, response) = WaitingForResponse::new(id.clone());
    let gone = state.broker.leave_guard(Event::ConsumerGone { id: id.clone() });
    if !state.broker.submit(Event::HandoffDone { waiting }) {
        return unavailable();
    }
    match wait_until(response, deadline).await {
        Wake::Ready(response) => {
            gone.disarm();
            Stats::record(&state.stats.completed);
            debug!("[{subdomain}] {id} answered {}", response.status);
            response.into_public_response()
        }
        Wake::TimedOut => {
            Stats::record(&state.stats.timed_out);
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                format!("agent for {subdomain} did not answer {id} in time"),
            )
        }
        Wake::Closed => unavailable(),
    }
}

fn status_page(state: &AppState) -> Response {
    let counts = serde_json::to_string_pretty(&state.broker.counts()).unwrap_or_default();
    let page = format!(
        "# burrow {}\n\n## Request Count\n\n{}\n\n## Proxy Status\n\n{}\n",
        env!("CARGO_PKG_VERSION"),
        state.counter.get(),
        counts,
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], page).into_response()
}
