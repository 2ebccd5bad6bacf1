// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Workload identity.
//!
//! A separate identity agent provisions each workload with an identity
//! document naming its id and the PEM material to serve TLS with. The
//! forwarder only reads the document; rotation is the identity agent's
//! problem.

use axum_server::tls_rustls::RustlsConfig;
use endpoint::{TokenError, TokenGenerator};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read identity document {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse identity document {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to load TLS material for identity '{id}': {source}")]
    Tls { id: String, source: std::io::Error },
}

/// The document written by the identity agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentityDocument {
    pub id: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl IdentityDocument {
    pub fn read(path: &Path) -> Result<IdentityDocument, IdentityError> {
        let raw = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| IdentityError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Loaded identity: the id plus a ready-to-serve TLS configuration.
#[derive(Clone)]
pub struct Identity {
    pub id: String,
    pub server_tls: RustlsConfig,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub async fn load(path: &Path) -> Result<Identity, IdentityError> {
        let document = IdentityDocument::read(path)?;
        let server_tls = RustlsConfig::from_pem_file(&document.cert_file, &document.key_file)
            .await
            .map_err(|source| IdentityError::Tls {
                id: document.id.clone(),
                source,
            })?;
        info!(id = %document.id, "identity loaded");
        Ok(Identity {
            id: document.id,
            server_tls,
        })
    }
}

/// Token generator backed by the workload identity.
pub struct IdentityTokenGenerator {
    id: String,
}

impl IdentityTokenGenerator {
    #[must_use]
    pub fn new(id: String) -> IdentityTokenGenerator {
        IdentityTokenGenerator { id }
    }
}

impl TokenGenerator for IdentityTokenGenerator {
    fn generate(&self, audience: &str) -> Result<String, TokenError> {
        if audience.is_empty() {
            return Err(TokenError("empty token audience".to_string()));
        }
        Ok(format!("{}.{}.{}", self.id, audience, Uuid::new_v4()))
    }
}
