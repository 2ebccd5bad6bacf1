// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Offload configuration file model.
//!
//! The file is YAML describing the physical functions the forwarder may use
//! for hardware offload, keyed by PCI address. The driver bindings and the
//! virtual-function inventory are not part of the file; they are annotated
//! onto the parsed configuration by [`crate::pci::update_driver_bindings`].

use crate::pci::Driver;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum OffloadConfigError {
    #[error("failed to read offload config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse offload config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },
    #[error("invalid offload config: {0}")]
    Invalid(String),
}

/// A virtual function discovered under a physical function's sysfs directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFunction {
    pub address: String,
    pub driver: Driver,
    /// IOMMU group of the function, when sysfs reports one.
    pub iommu_group: Option<String>,
}

/// One physical function described by the offload configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhysicalFunction {
    /// Kernel driver expected on the physical function.
    pub pf_driver: String,
    /// Kernel driver expected on virtual functions handed to clients.
    pub vf_driver: String,
    /// Forwarding capabilities this function provides.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Service domains this function serves.
    #[serde(default)]
    pub service_domains: Vec<String>,

    /// Driver currently bound to the function; annotated by the sysfs scan.
    #[serde(skip)]
    pub bound_driver: Option<Driver>,
    /// Virtual functions exposed by this function; annotated by the sysfs scan.
    #[serde(skip)]
    pub virtual_functions: Vec<VirtualFunction>,
}

/// The parsed offload configuration, keyed by physical-function PCI address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OffloadConfig {
    pub physical_functions: BTreeMap<String, PhysicalFunction>,
}

/// Minimal shape check for a PCI address like `0000:01:00.0`.
fn looks_like_pci_address(addr: &str) -> bool {
    let Some((bus_part, function)) = addr.rsplit_once('.') else {
        return false;
    };
    let pieces: Vec<&str> = bus_part.split(':').collect();
    if pieces.len() != 3 || function.is_empty() {
        return false;
    }
    pieces
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_hexdigit()))
        && function.chars().all(|c| c.is_ascii_hexdigit())
}

impl OffloadConfig {
    /// Read and validate an offload configuration file.
    pub fn read(path: &Path) -> Result<OffloadConfig, OffloadConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| OffloadConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: OffloadConfig =
            serde_yaml_ng::from_str(&raw).map_err(|source| OffloadConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        debug!(
            "loaded offload config with {} physical function(s)",
            config.physical_functions.len()
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), OffloadConfigError> {
        if self.physical_functions.is_empty() {
            return Err(OffloadConfigError::Invalid(
                "no physical functions described".to_string(),
            ));
        }
        for (address, function) in &self.physical_functions {
            if !looks_like_pci_address(address) {
                return Err(OffloadConfigError::Invalid(format!(
                    "'{address}' is not a PCI address"
                )));
            }
            if function.pf_driver.is_empty() || function.vf_driver.is_empty() {
                return Err(OffloadConfigError::Invalid(format!(
                    "physical function {address} is missing a driver name"
                )));
            }
            if function.service_domains.is_empty() {
                return Err(OffloadConfigError::Invalid(format!(
                    "physical function {address} serves no service domain"
                )));
            }
            if function.capabilities.is_empty() {
                return Err(OffloadConfigError::Invalid(format!(
                    "physical function {address} has no capability"
                )));
            }
        }
        Ok(())
    }

    /// Resource names advertised for this configuration, one per
    /// `service_domain/capability` pair of every physical function.
    #[must_use]
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .physical_functions
            .values()
            .flat_map(|function| {
                function.service_domains.iter().flat_map(|domain| {
                    function
                        .capabilities
                        .iter()
                        .map(move |capability| format!("{domain}/{capability}"))
                })
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
