// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Claims over the offload resources.
//!
//! A claim pairs a token grant with a virtual function. Claims are what the
//! endpoint hands to clients in hardware-offload mode; releasing a claim
//! returns both halves to their pools.

use crate::pci::{VfAllocation, VfPool};
use crate::token::{TokenGrant, TokenPool};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource {0} has no free token")]
    Exhausted(String),
    #[error("no free virtual function for resource {0}")]
    NoFreeVirtualFunction(String),
    #[error("unknown claim {0}")]
    UnknownClaim(Uuid),
}

/// A granted claim: one token plus the virtual function backing it.
#[derive(Debug, Clone)]
pub struct ResourceClaim {
    pub id: Uuid,
    pub resource_name: String,
    pub token: TokenGrant,
    pub virtual_function: VfAllocation,
}

/// Availability of one advertised resource, as reported to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceAvailability {
    pub name: String,
    pub free: usize,
    pub capacity: usize,
}

/// Mediates claims between the token pool and the virtual-function pool.
#[derive(Debug)]
pub struct ResourcePool {
    tokens: Arc<TokenPool>,
    functions: Arc<VfPool>,
    claims: Mutex<HashMap<Uuid, ResourceClaim>>,
}

impl ResourcePool {
    #[must_use]
    pub fn new(tokens: Arc<TokenPool>, functions: Arc<VfPool>) -> ResourcePool {
        ResourcePool {
            tokens,
            functions,
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a resource: take a token, then a virtual function. If no
    /// function is free the token goes straight back.
    pub fn claim(&self, resource_name: &str) -> Result<ResourceClaim, ResourceError> {
        let token = self
            .tokens
            .allocate(resource_name)
            .ok_or_else(|| ResourceError::Exhausted(resource_name.to_string()))?;
        let Some(virtual_function) = self.functions.allocate() else {
            self.tokens.release(token.id);
            return Err(ResourceError::NoFreeVirtualFunction(
                resource_name.to_string(),
            ));
        };
        let claim = ResourceClaim {
            id: Uuid::new_v4(),
            resource_name: resource_name.to_string(),
            token,
            virtual_function,
        };
        debug!(
            claim = %claim.id,
            resource = %claim.resource_name,
            device = %claim.virtual_function.address,
            "granted resource claim"
        );
        self.claims.lock().insert(claim.id, claim.clone());
        Ok(claim)
    }

    /// Release a claim, returning its token and virtual function.
    pub fn release(&self, id: Uuid) -> Result<(), ResourceError> {
        let claim = self
            .claims
            .lock()
            .remove(&id)
            .ok_or(ResourceError::UnknownClaim(id))?;
        self.tokens.release(claim.token.id);
        self.functions.release(&claim.virtual_function.address);
        debug!(claim = %id, "released resource claim");
        Ok(())
    }

    /// Per-resource availability snapshot for the advertisement server.
    #[must_use]
    pub fn availability(&self) -> Vec<ResourceAvailability> {
        self.tokens
            .resource_names()
            .into_iter()
            .map(|name| {
                let free = self.tokens.free(&name);
                let capacity = self.tokens.capacity(&name);
                ResourceAvailability {
                    name,
                    free,
                    capacity,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.claims.lock().len()
    }
}
