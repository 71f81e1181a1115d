// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io;

use thiserror::Error;

/// A control request the relay cannot act on. Reported to the sender only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Burrow-ID header is not set")]
    MissingId,
    #[error("{0} header is not set")]
    MissingHeader(&'static str),
    #[error("invalid Burrow-Status {0:?}")]
    InvalidStatus(String),
    #[error("invalid Burrow-Method {0:?}")]
    InvalidMethod(String),
    #[error("header {0} is not valid text")]
    InvalidHeader(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("relay host must not be empty")]
    EmptyHost,
    #[error("invalid relay host {0:?}")]
    InvalidHost(String),
    #[error("unsupported {kind} provider: {name}")]
    UnsupportedProvider { kind: &'static str, name: String },
    #[error("certificate provider {0:?} needs an https address")]
    MissingHttpsAddr(String),
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("corrupt value under {key:?}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("unusable private key: {0}")]
    Key(String),
    #[error("certificate cache: {0}")]
    Cache(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors seen by an agent talking to the relay.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid relay url {0:?}")]
    InvalidUrl(String),
    #[error("relay: {0}")]
    Relay(String),
    #[error("timed out waiting for the relay")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Top-level error for starting and running a relay.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
