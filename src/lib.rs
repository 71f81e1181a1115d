// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse-tunnel HTTP relay:
//! - Public callers send any request to `<subdomain>.<host>`.
//! - An agent behind NAT long-polls `<host>/<subdomain>`, receives the request,
//!   and posts the answer back; the relay returns it to the caller.
//!
//! Pairing happens in two stages, both owned by a single broker task:
//! stage 1 matches public requests with agent polls per subdomain, stage 2
//! matches agent responses with waiting callers per exchange id.
//!
//! Control headers: `Burrow-ID`, `Burrow-Method`, `Burrow-URL`, `Burrow-Host`,
//! `Burrow-Status`, `Burrow-Error`.

pub mod broker;
pub mod cert;
pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod store;
pub mod tables;

pub use client::{Agent, Responder, Upstream, random_subdomain};
pub use config::RelayConfig;
pub use error::{ClientError, Error};
pub use protocol::{ExchangeId, ForwardedRequest, PostedResponse};
pub use server::Relay;
