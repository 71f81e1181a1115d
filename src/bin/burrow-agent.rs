// SPDX-License-Identifier: AGPL-3.0-or-later
use std::process::ExitCode;

use clap::Parser;
use log::error;

use burrow::{Agent, Upstream, random_subdomain};

/// Exposes a local HTTP service through a relay.
#[derive(Parser, Debug)]
#[command(name = "burrow-agent", version)]
struct Args {
    /// Relay base URL, e.g. `https://relay.example.com`.
    #[arg(long)]
    relay: String,

    /// Random when omitted.
    #[arg(long)]
    subdomain: Option<String>,

    /// Local service address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    target: String,

    /// `Host` sent to the local service instead of the caller's.
    #[arg(long)]
    host_override: Option<String>,

    #[arg(long, default_value = "http")]
    scheme: String,

    /// `Host` for control requests when `--relay` is an address.
    #[arg(long)]
    relay_host: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // By default emit warnings
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn")
    ).init();

    let args = Args::parse();
    let subdomain = match args.subdomain {
        Some(s) => s,
        None => match random_subdomain(4) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot pick a subdomain: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    let mut agent = match Agent::new(&args.relay, subdomain) {
        Ok(agent) => agent,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(host) = args.relay_host {
        agent = agent.with_host_header(host);
    }

    let mut upstream = Upstream::new(&args.scheme, &args.target);
    if let Some(host) = args.host_override {
        upstream = upstream.with_host(host);
    }

    println!("{}", agent.public_url());
    agent.serve(upstream).await;
    ExitCode::SUCCESS
}
