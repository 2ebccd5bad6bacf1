// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Offload access tokens.
//!
//! Every client using a hardware-offloaded connection holds a token for one
//! of the advertised resource names. The pool caps the number of outstanding
//! tokens per resource at the number of virtual functions able to serve it
//! and bounds each token's lifetime so a crashed client cannot pin a slot
//! forever.

use crate::config::OffloadConfig;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// An outstanding token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub id: Uuid,
    pub resource_name: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
struct PoolState {
    grants: HashMap<Uuid, TokenGrant>,
}

/// Token pool sized from the annotated offload configuration.
#[derive(Debug)]
pub struct TokenPool {
    max_lifetime: Duration,
    capacity: BTreeMap<String, usize>,
    state: Mutex<PoolState>,
}

impl TokenPool {
    /// Size the pool from an annotated configuration: each resource name gets
    /// one slot per virtual function of every physical function advertising
    /// it.
    #[must_use]
    pub fn new(max_lifetime: Duration, config: &OffloadConfig) -> TokenPool {
        let mut capacity: BTreeMap<String, usize> = BTreeMap::new();
        for function in config.physical_functions.values() {
            let slots = function.virtual_functions.len();
            for domain in &function.service_domains {
                for capability in &function.capabilities {
                    *capacity.entry(format!("{domain}/{capability}")).or_default() += slots;
                }
            }
        }
        debug!(resources = capacity.len(), "sized token pool");
        TokenPool {
            max_lifetime,
            capacity,
            state: Mutex::new(PoolState {
                grants: HashMap::new(),
            }),
        }
    }

    /// Resource names the pool has slots for.
    #[must_use]
    pub fn resource_names(&self) -> Vec<String> {
        self.capacity.keys().cloned().collect()
    }

    #[must_use]
    pub fn capacity(&self, resource_name: &str) -> usize {
        self.capacity.get(resource_name).copied().unwrap_or(0)
    }

    /// Slots currently free for a resource, after dropping expired grants.
    #[must_use]
    pub fn free(&self, resource_name: &str) -> usize {
        let mut state = self.state.lock();
        Self::prune_locked(&mut state);
        let outstanding = state
            .grants
            .values()
            .filter(|g| g.resource_name == resource_name)
            .count();
        self.capacity(resource_name).saturating_sub(outstanding)
    }

    /// Issue a token for a resource, or `None` when the resource is unknown
    /// or fully granted.
    pub fn allocate(&self, resource_name: &str) -> Option<TokenGrant> {
        let capacity = self.capacity.get(resource_name).copied()?;
        let mut state = self.state.lock();
        Self::prune_locked(&mut state);
        let outstanding = state
            .grants
            .values()
            .filter(|g| g.resource_name == resource_name)
            .count();
        if outstanding >= capacity {
            return None;
        }
        let grant = TokenGrant {
            id: Uuid::new_v4(),
            resource_name: resource_name.to_string(),
            expires_at: Instant::now() + self.max_lifetime,
        };
        state.grants.insert(grant.id, grant.clone());
        Some(grant)
    }

    /// Return a token to the pool. Unknown ids are ignored.
    pub fn release(&self, id: Uuid) {
        self.state.lock().grants.remove(&id);
    }

    /// Drop expired grants; returns how many were dropped.
    pub fn prune(&self) -> usize {
        Self::prune_locked(&mut self.state.lock())
    }

    fn prune_locked(state: &mut PoolState) -> usize {
        let now = Instant::now();
        let before = state.grants.len();
        state.grants.retain(|_, g| g.expires_at > now);
        before - state.grants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::{OffloadConfig, VirtualFunction};
    use crate::pci::Driver;
    use pretty_assertions::assert_eq;

    fn annotated() -> OffloadConfig {
        let mut config: OffloadConfig = serde_yaml_ng::from_str(SAMPLE).unwrap();
        for function in config.physical_functions.values_mut() {
            function.virtual_functions = vec![
                VirtualFunction {
                    address: "0000:ff:00.1".to_string(),
                    driver: Driver::VfioPci,
                    iommu_group: None,
                },
                VirtualFunction {
                    address: "0000:ff:00.2".to_string(),
                    driver: Driver::VfioPci,
                    iommu_group: None,
                },
            ];
        }
        config
    }

    #[test]
    fn test_capacity_from_config() {
        let pool = TokenPool::new(Duration::from_secs(60), &annotated());
        assert_eq!(
            pool.resource_names(),
            vec![
                "worker.domain/10G".to_string(),
                "worker.domain/intel".to_string()
            ]
        );
        // both physical functions advertise 10G, only one advertises intel
        assert_eq!(pool.capacity("worker.domain/10G"), 4);
        assert_eq!(pool.capacity("worker.domain/intel"), 2);
        assert_eq!(pool.capacity("worker.domain/unknown"), 0);
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let pool = TokenPool::new(Duration::from_secs(60), &annotated());
        let a = pool.allocate("worker.domain/intel").unwrap();
        let _b = pool.allocate("worker.domain/intel").unwrap();
        assert!(pool.allocate("worker.domain/intel").is_none());
        assert_eq!(pool.free("worker.domain/intel"), 0);

        pool.release(a.id);
        assert_eq!(pool.free("worker.domain/intel"), 1);
        assert!(pool.allocate("worker.domain/intel").is_some());
    }

    #[test]
    fn test_unknown_resource_is_rejected() {
        let pool = TokenPool::new(Duration::from_secs(60), &annotated());
        assert!(pool.allocate("nope/nothing").is_none());
    }

    #[test]
    fn test_expired_grants_are_pruned() {
        let pool = TokenPool::new(Duration::from_millis(0), &annotated());
        let _ = pool.allocate("worker.domain/intel").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.prune(), 1);
        assert_eq!(pool.free("worker.domain/intel"), 2);
    }
}
