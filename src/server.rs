// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay process: listeners, the broker's event loop and background tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use log::{debug, info, warn};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::broker::{Broker, EventLoop};
use crate::cert::{CertificateProvider, provider_for, refresh_loop, tls_config};
use crate::config::{CERT_REFRESH_INTERVAL, RelayConfig};
use crate::dns::provisioner_for;
use crate::error::{ConfigError, Error};
use crate::handlers::{AppState, router};
use crate::stats::{Stats, stats_reporter};
use crate::store::{RequestCounter, open_store};

/// A relay with its listeners bound, ready to serve.
pub struct Relay {
    config: RelayConfig,
    http: TcpListener,
    https: Option<(TcpListener, Arc<dyn CertificateProvider>)>,
    broker: Broker,
    event_loop: EventLoop,
    stats: Arc<Stats>,
    counter: Arc<RequestCounter>,
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> Result<Self, Error> {
        let config = config.validate()?;
        let store = open_store(config.store_path.as_deref())?;
        let counter = Arc::new(RequestCounter::load(store.clone())?);

        provisioner_for(&config.dns_provider)?.provision(&config.host)?;
        let certs = provider_for(&config.cert_provider, &config.host, store)?;

        let http = TcpListener::bind(config.http_addr).await?;
        info!("relay for {} listening on http://{}", config.host, http.local_addr()?);

        let https = match certs {
            Some(provider) => {
                let addr = config
                    .https_addr
                    .ok_or_else(|| ConfigError::MissingHttpsAddr(config.cert_provider.clone()))?;
                let listener = TcpListener::bind(addr).await?;
                info!("relay for {} listening on https://{}", config.host, listener.local_addr()?);
                Some((listener, provider))
            }
            None => None,
        };

        let (broker, event_loop) = Broker::new();
        Ok(Self {
            config,
            http,
            https,
            broker,
            event_loop,
            stats: Arc::new(Stats::default()),
            counter,
        })
    }

    pub fn http_addr(&self) -> io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> io::Result<Option<SocketAddr>> {
        self.https.as_ref().map(|(l, _)| l.local_addr()).transpose()
    }

    pub fn broker(&self) -> Broker {
        self.broker.clone()
    }

    /// Runs until the plain HTTP listener fails.
    pub async fn serve(self) -> Result<(), Error> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Like [`Relay::serve`], but returns once `signal` completes and the
    /// in-flight plain HTTP requests have finished. The request count is
    /// persisted on the way out.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.event_loop.run());
        tokio::spawn(stats_reporter(
            self.stats.clone(),
            self.broker.clone(),
            self.counter.clone(),
            self.config.stats_interval,
        ));

        let app = router(AppState {
            broker: self.broker,
            host: Arc::from(self.config.host.as_str()),
            timeout: self.config.timeout,
            max_body_bytes: self.config.max_body_bytes,
            stats: self.stats,
            counter: self.counter.clone(),
        });

        if let Some((listener, provider)) = self.https {
            tokio::spawn(refresh_loop(provider.clone(), CERT_REFRESH_INTERVAL));
            tokio::spawn(serve_tls(listener, tls_config(provider), app.clone()));
        }

        axum::serve(self.http, app.into_make_service())
            .with_graceful_shutdown(signal)
            .await?;

        info!("relay for {} stopped after {} requests", self.config.host, self.counter.get());
        self.counter.flush()?;
        Ok(())
    }
}

// One accept loop; one task per connection.
async fn serve_tls(listener: TcpListener, config: Arc<ServerConfig>, app: Router) {
    let acceptor = TlsAcceptor::from(config);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("https accept error: {}", e);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("tls handshake with {peer} failed: {e}");
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!("https connection from {peer} ended: {e}");
            }
        });
    }
}
