// SPDX-License-Identifier: AGPL-3.0-or-later
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use burrow::{Relay, RelayConfig};
use burrow::config::DEFAULT_TIMEOUT;

/// Public side of the tunnel.
#[derive(Parser, Debug)]
#[command(name = "burrow-relay", version)]
struct Args {
    /// Relay host; public traffic arrives on `<subdomain>.<host>`.
    #[arg(long)]
    host: String,

    #[arg(long, default_value = "0.0.0.0:80")]
    http_addr: SocketAddr,

    /// Required with a certificate provider.
    #[arg(long)]
    https_addr: Option<SocketAddr>,

    /// Seconds a request or poll may wait.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Cap on response bodies posted by agents; unlimited when omitted.
    #[arg(long)]
    max_body_bytes: Option<usize>,

    /// Directory for the certificate cache and request count.
    #[arg(long)]
    store: Option<PathBuf>,

    /// `none` or `self-signed`
    #[arg(long, default_value = "none")]
    cert_provider: String,

    #[arg(long, default_value = "none")]
    dns_provider: String,

    /// Seconds between stats lines.
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let mut config = RelayConfig::new(self.host);
        config.http_addr = self.http_addr;
        config.https_addr = self.https_addr;
        config.timeout = Duration::from_secs(self.timeout);
        config.max_body_bytes = self.max_body_bytes;
        config.store_path = self.store;
        config.cert_provider = self.cert_provider;
        config.dns_provider = self.dns_provider;
        config.stats_interval = Duration::from_secs(self.stats_interval.max(1));
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // By default emit warnings
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let config = Args::parse().into_config();
    let relay = match Relay::bind(config).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("cannot start relay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
        }
    };
    match relay.serve_with_shutdown(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("relay stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
