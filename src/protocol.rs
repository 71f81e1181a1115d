// SPDX-License-Identifier: AGPL-3.0-or-later
//! Header encoding of a tunneled exchange.
//!
//! Relay -> agent (long-poll response):
//!   `Burrow-ID`, `Burrow-Method`, `Burrow-URL`, `Burrow-Host` + the caller's
//!   headers, body = the caller's body.
//! Agent -> relay (response post):
//!   `Burrow-ID`, optional `Burrow-Status` (default 200) + headers for the
//!   caller, body = the response body.
//!
//! Headers starting with `burrow-` are reserved and never forwarded from a
//! public caller.

use std::fmt;
use std::io;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use rand::{TryRng, rngs::SysRng};

use crate::error::ProtocolError;

pub const CONTROL_PREFIX: &str = "burrow-";

pub const BURROW_ID: HeaderName = HeaderName::from_static("burrow-id");
pub const BURROW_METHOD: HeaderName = HeaderName::from_static("burrow-method");
pub const BURROW_URL: HeaderName = HeaderName::from_static("burrow-url");
pub const BURROW_HOST: HeaderName = HeaderName::from_static("burrow-host");
pub const BURROW_STATUS: HeaderName = HeaderName::from_static("burrow-status");
pub const BURROW_ERROR: HeaderName = HeaderName::from_static("burrow-error");

/// Random bytes per exchange id (128 bits).
pub const ID_BYTES: usize = 16;

// Connection-level headers that must not be copied between the two legs.
const FRAMING_HEADERS: [&str; 9] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

pub(crate) fn fill_random(buf: &mut [u8]) -> io::Result<()> {
    SysRng.try_fill_bytes(buf).map_err(io::Error::other)
}

/// Correlation id of one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(String);

impl ExchangeId {
    /// Draws a fresh id from the OS random source.
    pub fn generate() -> io::Result<Self> {
        let mut raw = [0u8; ID_BYTES];
        fill_random(&mut raw)?;
        Ok(Self(URL_SAFE_NO_PAD.encode(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExchangeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

pub fn is_control(name: &HeaderName) -> bool {
    name.as_str().starts_with(CONTROL_PREFIX)
}

pub fn is_framing(name: &HeaderName) -> bool {
    FRAMING_HEADERS.contains(&name.as_str())
}

fn copy_headers(src: &HeaderMap, keep: impl Fn(&HeaderName) -> bool) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if keep(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Builds a header value from arbitrary text, replacing bytes a header
/// cannot carry.
pub fn text_value(text: &str) -> HeaderValue {
    HeaderValue::from_str(text).unwrap_or_else(|_| {
        let cleaned: String = text
            .chars()
            .map(|c| if c == '\t' || (' '..='~').contains(&c) { c } else { '?' })
            .collect();
        HeaderValue::from_str(&cleaned).unwrap_or_else(|_| HeaderValue::from_static("?"))
    })
}

fn header_text<'a>(
    headers: &'a HeaderMap,
    name: &HeaderName,
    label: &'static str,
) -> Result<Option<&'a str>, ProtocolError> {
    match headers.get(name) {
        None => Ok(None),
        Some(v) => v.to_str().map(Some).map_err(|_| ProtocolError::InvalidHeader(label)),
    }
}

/// A public request as handed to an agent.
///
/// On the relay the body is the caller's still-unread stream (`B = Body`)
/// and is piped into the poll response. The agent receives it as `Bytes`.
#[derive(Debug, Clone)]
pub struct ForwardedRequest<B = Bytes> {
    pub id: ExchangeId,
    pub method: Method,
    /// Path and query of the original request.
    pub url: String,
    /// The caller's original `Host`.
    pub host: String,
    pub headers: HeaderMap,
    pub body: B,
}

impl<B> ForwardedRequest<B> {
    pub fn from_public(id: ExchangeId, parts: &Parts, body: B) -> Self {
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            id,
            method: parts.method.clone(),
            url,
            host,
            headers: copy_headers(&parts.headers, |n| !is_control(n) && !is_framing(n)),
            body,
        }
    }
}

impl<B: Into<Body>> ForwardedRequest<B> {
    /// Renders the request as the agent's long-poll response.
    pub fn into_poll_response(self) -> Response {
        let mut res = Response::new(self.body.into());
        *res.headers_mut() = self.headers;
        let h = res.headers_mut();
        h.insert(BURROW_ID, text_value(self.id.as_str()));
        h.insert(BURROW_METHOD, text_value(self.method.as_str()));
        h.insert(BURROW_URL, text_value(&self.url));
        h.insert(BURROW_HOST, text_value(&self.host));
        res
    }
}

impl ForwardedRequest {
    /// Agent side: reads a long-poll response back into a request.
    pub fn from_poll_response(headers: &HeaderMap, body: Bytes) -> Result<Self, ProtocolError> {
        let id = header_text(headers, &BURROW_ID, "Burrow-ID")?
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingId)?;
        let method = header_text(headers, &BURROW_METHOD, "Burrow-Method")?
            .ok_or(ProtocolError::MissingHeader("Burrow-Method"))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ProtocolError::InvalidMethod(method.to_string()))?;
        let url = header_text(headers, &BURROW_URL, "Burrow-URL")?
            .ok_or(ProtocolError::MissingHeader("Burrow-URL"))?;
        let host = header_text(headers, &BURROW_HOST, "Burrow-Host")?.unwrap_or_default();

        Ok(Self {
            id: ExchangeId::from(id),
            method,
            url: url.to_string(),
            host: host.to_string(),
            // `date` is stamped by the relay's HTTP server, not the caller.
            headers: copy_headers(headers, |n| {
                !is_control(n) && !is_framing(n) && *n != header::DATE
            }),
            body,
        })
    }
}

/// An agent's answer to one exchange.
#[derive(Debug, Clone)]
pub struct PostedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl PostedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self { status, headers, body: body.into() }
    }

    /// Relay side: decodes a response post. The id is required.
    pub fn from_post(headers: &HeaderMap, body: Bytes) -> Result<(ExchangeId, Self), ProtocolError> {
        let id = header_text(headers, &BURROW_ID, "Burrow-ID")?
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingId)?;
        let status = parse_status(headers.get(&BURROW_STATUS))?;
        // `accept` is added to every post by the agent's HTTP client.
        let kept = copy_headers(headers, |n| {
            *n != BURROW_ID && *n != BURROW_STATUS && *n != header::ACCEPT && !is_framing(n)
        });

        Ok((ExchangeId::from(id), Self { status, headers: kept, body }))
    }

    /// Agent side: headers to send along with the response body.
    pub fn post_headers(&self, id: &ExchangeId) -> HeaderMap {
        let mut h = copy_headers(&self.headers, |n| *n != BURROW_ID && *n != BURROW_STATUS && !is_framing(n));
        h.insert(BURROW_ID, text_value(id.as_str()));
        h.insert(BURROW_STATUS, HeaderValue::from(self.status.as_u16()));
        h
    }

    pub fn into_public_response(self) -> Response {
        let mut res = Response::new(Body::from(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

/// Absent or empty means 200.
pub fn parse_status(value: Option<&HeaderValue>) -> Result<StatusCode, ProtocolError> {
    let Some(value) = value else {
        return Ok(StatusCode::OK);
    };
    let text = value.to_str().map_err(|_| ProtocolError::InvalidHeader("Burrow-Status"))?.trim();
    if text.is_empty() {
        return Ok(StatusCode::OK);
    }
    text.parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProtocolError::InvalidStatus(text.to_string()))
}

/// An error answer carrying its reason in `Burrow-Error`.
pub fn error_response(status: StatusCode, message: impl fmt::Display) -> Response {
    let message = message.to_string();
    let mut res = Response::new(Body::from(message.clone()));
    *res.status_mut() = status;
    res.headers_mut().insert(BURROW_ERROR, text_value(&message));
    res
}

pub fn diagnostic(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&BURROW_ERROR)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn public_parts() -> Parts {
        let (parts, _) = Request::builder()
            .method(Method::POST)
            .uri("/path?q=1")
            .header(header::HOST, "a.relay.test")
            .header("my", "header")
            .header("burrow-id", "spoofed")
            .header(header::CONTENT_LENGTH, "4")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn ids_are_long_and_distinct() {
        let a = ExchangeId::generate().unwrap();
        let b = ExchangeId::generate().unwrap();
        assert_eq!(a.as_str().len(), 22);
        assert_ne!(a, b);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn public_request_survives_the_poll_leg() {
        let id = ExchangeId::from("abc");
        let req = ForwardedRequest::from_public(id.clone(), &public_parts(), Bytes::from_static(b"data"));
        assert_eq!(req.host, "a.relay.test");
        assert_eq!(req.url, "/path?q=1");
        assert!(req.headers.get("burrow-id").is_none());
        assert!(req.headers.get(header::HOST).is_none());

        let res = req.into_poll_response();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[&BURROW_ID], "abc");
        assert_eq!(res.headers()[&BURROW_METHOD], "POST");
        assert_eq!(res.headers()[&BURROW_URL], "/path?q=1");
        assert_eq!(res.headers()[&BURROW_HOST], "a.relay.test");
        assert_eq!(res.headers()["my"], "header");

        let back = ForwardedRequest::from_poll_response(res.headers(), Bytes::from_static(b"data")).unwrap();
        assert_eq!(back.id, id);
        assert_eq!(back.method, Method::POST);
        assert_eq!(back.headers["my"], "header");
        assert!(back.headers.keys().all(|n| !is_control(n)));
    }

    #[test]
    fn relay_stamped_headers_stay_on_their_leg() {
        let mut poll = HeaderMap::new();
        poll.insert(BURROW_ID, HeaderValue::from_static("x"));
        poll.insert(BURROW_METHOD, HeaderValue::from_static("GET"));
        poll.insert(BURROW_URL, HeaderValue::from_static("/"));
        poll.insert(header::DATE, HeaderValue::from_static("Sun, 18 Oct 2026 10:00:00 GMT"));
        poll.insert("my", HeaderValue::from_static("header"));
        let req = ForwardedRequest::from_poll_response(&poll, Bytes::new()).unwrap();
        assert!(req.headers.get(header::DATE).is_none());
        assert_eq!(req.headers["my"], "header");

        let mut post = HeaderMap::new();
        post.insert(BURROW_ID, HeaderValue::from_static("x"));
        post.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        post.insert("header", HeaderValue::from_static("value"));
        let (_, res) = PostedResponse::from_post(&post, Bytes::new()).unwrap();
        assert!(res.headers.get(header::ACCEPT).is_none());
        assert_eq!(res.headers["header"], "value");
    }

    #[tokio::test]
    async fn streamed_body_reaches_the_poll_response() {
        let req = ForwardedRequest::from_public(
            ExchangeId::from("s"),
            &public_parts(),
            Body::from("streamed"),
        );
        let res = req.into_poll_response();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"streamed");
    }

    #[test]
    fn poll_response_without_method_is_rejected() {
        let mut h = HeaderMap::new();
        h.insert(BURROW_ID, HeaderValue::from_static("x"));
        let err = ForwardedRequest::from_poll_response(&h, Bytes::new()).unwrap_err();
        assert_eq!(err, ProtocolError::MissingHeader("Burrow-Method"));
    }

    #[test]
    fn status_defaults_to_200() {
        assert_eq!(parse_status(None).unwrap(), StatusCode::OK);
        assert_eq!(parse_status(Some(&HeaderValue::from_static(""))).unwrap(), StatusCode::OK);
        assert_eq!(parse_status(Some(&HeaderValue::from_static("230"))).unwrap().as_u16(), 230);
        assert_eq!(
            parse_status(Some(&HeaderValue::from_static("abc"))),
            Err(ProtocolError::InvalidStatus("abc".to_string()))
        );
        assert!(parse_status(Some(&HeaderValue::from_static("1000"))).is_err());
    }

    #[test]
    fn post_without_id_is_rejected() {
        let err = PostedResponse::from_post(&HeaderMap::new(), Bytes::new()).unwrap_err();
        assert_eq!(err, ProtocolError::MissingId);
        assert_eq!(err.to_string(), "Burrow-ID header is not set");
    }

    #[test]
    fn posted_response_keeps_agent_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("header", HeaderValue::from_static("value"));
        let res = PostedResponse::new(StatusCode::from_u16(230).unwrap(), headers, "test");
        let mut wire = res.post_headers(&ExchangeId::from("id-1"));
        wire.insert(header::HOST, HeaderValue::from_static("relay.test"));

        let (id, decoded) = PostedResponse::from_post(&wire, Bytes::from_static(b"test")).unwrap();
        assert_eq!(id.as_str(), "id-1");
        assert_eq!(decoded.status.as_u16(), 230);
        assert_eq!(decoded.headers["header"], "value");
        assert!(decoded.headers.get(header::HOST).is_none());
        assert!(decoded.headers.get(&BURROW_STATUS).is_none());
    }

    #[test]
    fn error_response_carries_diagnostic() {
        let res = error_response(StatusCode::BAD_REQUEST, "bad\nthing");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(diagnostic(res.headers()).as_deref(), Some("bad?thing"));
    }
}
