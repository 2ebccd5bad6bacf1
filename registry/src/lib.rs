// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Registry client.
//!
//! Registers the forwarder endpoint with the service registry. Registration
//! is deliberately blocking: the agent is useless until the registry knows
//! about it, so transport failures are retried with backoff until the
//! registry answers or the agent shuts down. A definite rejection from the
//! registry is fatal and is not retried.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry rejected the registration with status {0}")]
    Rejected(u16),
    #[error("registration cancelled during shutdown")]
    Cancelled,
    #[error("bad registry URL: {0}")]
    InvalidUrl(String),
}

/// The registration record sent to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub network_service: String,
    pub labels: BTreeMap<String, String>,
    /// Where the registry and peers reach this endpoint.
    pub url: String,
}

/// Acknowledgement returned by the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationReply {
    pub expiration_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RegistryClient {
    register_url: Url,
    agent: ureq::Agent,
}

impl RegistryClient {
    pub fn new(registry: &Url) -> Result<RegistryClient, RegistryError> {
        let register_url = registry
            .join("endpoints")
            .map_err(|e| RegistryError::InvalidUrl(e.to_string()))?;
        Ok(RegistryClient {
            register_url,
            agent: ureq::Agent::new_with_defaults(),
        })
    }

    /// Register, retrying transport failures until the registry answers or
    /// the token is cancelled. Runs on a blocking thread; callers on the
    /// runtime use `spawn_blocking`.
    pub fn register(
        &self,
        registration: &Registration,
        cancel: &CancellationToken,
    ) -> Result<RegistrationReply, RegistryError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            attempt += 1;
            match self
                .agent
                .post(self.register_url.as_str())
                .send_json(registration)
            {
                Ok(mut response) => {
                    let reply: RegistrationReply = response
                        .body_mut()
                        .read_json()
                        .map_err(|e| {
                            warn!("registry reply was unreadable: {e}");
                            RegistryError::Rejected(response.status().as_u16())
                        })?;
                    info!(
                        endpoint = %registration.name,
                        expiration_secs = reply.expiration_secs,
                        "registered with the registry"
                    );
                    return Ok(reply);
                }
                Err(ureq::Error::StatusCode(status)) => {
                    return Err(RegistryError::Rejected(status));
                }
                Err(e) => {
                    debug!(attempt, "registry not reachable yet: {e}");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
