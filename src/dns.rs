// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-shot DNS setup run before the relay starts serving.

use log::info;

use crate::error::{ConfigError, Error};

pub trait DnsProvisioner: Send + Sync {
    /// Points `host` and `*.host` at this relay.
    fn provision(&self, host: &str) -> Result<(), Error>;
}

/// Records are managed outside the relay.
pub struct Unmanaged;

impl DnsProvisioner for Unmanaged {
    fn provision(&self, host: &str) -> Result<(), Error> {
        info!("dns for {host} and *.{host} is managed externally");
        Ok(())
    }
}

pub fn provisioner_for(name: &str) -> Result<Box<dyn DnsProvisioner>, ConfigError> {
    match name {
        "none" => Ok(Box::new(Unmanaged)),
        other => Err(ConfigError::UnsupportedProvider { kind: "dns", name: other.to_string() }),
    }
}
