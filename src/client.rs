// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent side of the tunnel: long-polls the relay for requests addressed to
//! one subdomain and posts back the answers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use log::{debug, info, warn};
use reqwest::Url;

use crate::error::ClientError;
use crate::protocol::{
    BURROW_ERROR, ExchangeId, ForwardedRequest, PostedResponse, diagnostic, fill_random,
    text_value,
};

const MIN_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Random `[a-z0-9]` label for agents started without a subdomain.
pub fn random_subdomain(len: usize) -> io::Result<String> {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(buf
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect())
}

fn relay_error(status: StatusCode, headers: &HeaderMap) -> ClientError {
    let reason = diagnostic(headers).unwrap_or_else(|| status.to_string());
    ClientError::Relay(format!("{status}: {reason}"))
}

pub struct Agent {
    http: reqwest::Client,
    api: Url,
    subdomain: String,
    /// `Host` sent on control requests when the relay is reached by address.
    host_header: Option<String>,
}

impl Agent {
    pub fn new(api: &str, subdomain: impl Into<String>) -> Result<Self, ClientError> {
        let api = Url::parse(api).map_err(|_| ClientError::InvalidUrl(api.to_string()))?;
        if api.host_str().is_none() {
            return Err(ClientError::InvalidUrl(api.to_string()));
        }
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http, api, subdomain: subdomain.into(), host_header: None })
    }

    pub fn with_host_header(mut self, host: impl Into<String>) -> Self {
        self.host_header = Some(host.into());
        self
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Where public callers reach this agent.
    pub fn public_url(&self) -> String {
        let host = match &self.host_header {
            Some(h) => h.clone(),
            None => {
                let name = self.api.host_str().unwrap_or_default();
                match self.api.port() {
                    Some(port) => format!("{name}:{port}"),
                    None => name.to_string(),
                }
            }
        };
        format!("{}://{}.{}", self.api.scheme(), self.subdomain, host)
    }

    fn control_url(&self) -> String {
        format!("{}/{}", self.api.as_str().trim_end_matches('/'), self.subdomain)
    }

    fn control(&self, method: Method) -> reqwest::RequestBuilder {
        let req = self.http.request(method, self.control_url());
        match &self.host_header {
            Some(host) => req.header(header::HOST, host.as_str()),
            None => req,
        }
    }

    /// Waits for the next request. A relay-side poll timeout comes back as
    /// [`ClientError::Timeout`].
    pub async fn poll(&self) -> Result<(ForwardedRequest, Responder), ClientError> {
        let res = self.control(Method::GET).send().await?;
        let status = res.status();
        if status == StatusCode::GATEWAY_TIMEOUT {
            return Err(ClientError::Timeout);
        }
        if !status.is_success() {
            return Err(relay_error(status, res.headers()));
        }
        let headers = res.headers().clone();
        let body = res.bytes().await?;
        let request = ForwardedRequest::from_poll_response(&headers, body)?;

        let responder = Responder {
            id: request.id.clone(),
            post: self.control(Method::POST),
        };
        Ok((request, responder))
    }

    /// Proxies every request to `upstream`, one task per request. Never
    /// returns; poll failures are retried with backoff.
    pub async fn serve(&self, upstream: Upstream) {
        let upstream = Arc::new(upstream);
        info!("serving {} from {}", self.public_url(), upstream.base);

        let mut backoff = MIN_BACKOFF;
        loop {
            match self.poll().await {
                Ok((request, responder)) => {
                    backoff = MIN_BACKOFF;
                    let http = self.http.clone();
                    let upstream = upstream.clone();
                    tokio::spawn(async move {
                        let id = responder.id().clone();
                        let response = upstream.forward(&http, request).await;
                        if let Err(e) = responder.send(response).await {
                            warn!("response for {id} not delivered: {e}");
                        }
                    });
                }
                Err(ClientError::Timeout) => continue,
                Err(e) => {
                    warn!("poll failed: {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Completes one exchange. Dropping it without sending abandons the
/// exchange; the relay answers the caller once its deadline passes.
pub struct Responder {
    id: ExchangeId,
    post: reqwest::RequestBuilder,
}

impl Responder {
    pub fn id(&self) -> &ExchangeId {
        &self.id
    }

    pub async fn send(self, response: PostedResponse) -> Result<(), ClientError> {
        let headers = response.post_headers(&self.id);
        let res = self.post.headers(headers).body(response.body).send().await?;
        let status = res.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::GATEWAY_TIMEOUT {
            Err(ClientError::Timeout)
        } else {
            Err(relay_error(status, res.headers()))
        }
    }
}

/// The local service an agent exposes.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// `scheme://address`, without a trailing slash.
    pub base: String,
    /// Replaces the caller's `Host` on forwarded requests.
    pub host: Option<String>,
}

impl Upstream {
    pub fn new(scheme: &str, addr: &str) -> Self {
        Self { base: format!("{scheme}://{addr}"), host: None }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sends `request` to the service. Transport failures become a 502
    /// carrying the error in `Burrow-Error`.
    pub async fn forward(&self, http: &reqwest::Client, request: ForwardedRequest) -> PostedResponse {
        let url = format!("{}{}", self.base, request.url);
        let host = self.host.clone().unwrap_or(request.host);
        let mut headers = request.headers;
        if !host.is_empty() {
            headers.insert(header::HOST, text_value(&host));
        }
        debug!("{} {} ({})", request.method, url, request.id);

        let result = async {
            let res = http
                .request(request.method.clone(), &url)
                .headers(headers)
                .body(request.body)
                .send()
                .await?;
            let status = res.status();
            let headers = res.headers().clone();
            let body = res.bytes().await?;
            Ok::<_, reqwest::Error>(PostedResponse::new(status, headers, body))
        }
        .await;

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!("{} {} failed: {}", request.method, url, e);
                bad_gateway(&e.to_string())
            }
        }
    }
}

fn bad_gateway(reason: &str) -> PostedResponse {
    let mut headers = HeaderMap::new();
    headers.insert(BURROW_ERROR, text_value(reason));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    PostedResponse::new(StatusCode::BAD_GATEWAY, headers, reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_subdomains_are_dns_labels() {
        let a = random_subdomain(4).unwrap();
        assert_eq!(a.len(), 4);
        assert!(a.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        assert_eq!(random_subdomain(32).unwrap().len(), 32);
    }

    #[test]
    fn public_url_follows_the_relay() {
        let agent = Agent::new("http://relay.test:8080", "a").unwrap();
        assert_eq!(agent.public_url(), "http://a.relay.test:8080");
        assert_eq!(agent.control_url(), "http://relay.test:8080/a");

        let agent = Agent::new("https://127.0.0.1/", "b")
            .unwrap()
            .with_host_header("relay.test");
        assert_eq!(agent.public_url(), "https://b.relay.test");
        assert_eq!(agent.control_url(), "https://127.0.0.1/b");
    }

    #[test]
    fn relay_url_must_have_a_host() {
        assert!(matches!(Agent::new("not a url", "a"), Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_bad_gateway() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let upstream = Upstream::new("http", &format!("127.0.0.1:{port}"));
        let request = ForwardedRequest {
            id: ExchangeId::from("x"),
            method: Method::GET,
            url: "/".to_string(),
            host: "a.relay.test".to_string(),
            headers: HeaderMap::new(),
            body: Default::default(),
        };
        let response = upstream.forward(&reqwest::Client::new(), request).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert!(response.headers.contains_key(BURROW_ERROR));
    }
}
