// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Layer-2 egress topology.
//!
//! The selector configuration maps `via` service-domain selectors to the
//! device a connection should egress through: either a plain interface that
//! is attached to a bridge, or a bridge itself. Bridges are applied after
//! interfaces, so a bridge entry wins when both name the same selector.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to read selector config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse selector config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },
}

/// Egress point a `via` selector resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressPoint {
    pub bridge: String,
    /// Set for interface entries; bridge entries egress through the bridge
    /// itself.
    pub interface: Option<String>,
}

pub type TopologyMap = BTreeMap<String, EgressPoint>;

#[derive(Debug, Deserialize)]
struct LabelSelector {
    via: String,
}

#[derive(Debug, Deserialize)]
struct Selector {
    #[serde(default)]
    label_selector: Vec<LabelSelector>,
}

#[derive(Debug, Deserialize)]
struct InterfaceEntry {
    name: String,
    bridge: String,
    #[serde(default)]
    matches: Vec<Selector>,
}

#[derive(Debug, Deserialize)]
struct BridgeEntry {
    name: String,
    #[serde(default)]
    matches: Vec<Selector>,
}

#[derive(Debug, Deserialize)]
struct SelectorConfig {
    #[serde(default)]
    interfaces: Vec<InterfaceEntry>,
    #[serde(default)]
    bridges: Vec<BridgeEntry>,
}

fn via_keys(matches: &[Selector]) -> impl Iterator<Item = &str> {
    matches
        .iter()
        .flat_map(|m| m.label_selector.iter().map(|s| s.via.as_str()))
}

/// Build the selector-to-egress-point map from the optional selector
/// configuration file.
///
/// Returns `None` when no file is configured, and also when the file names
/// neither interfaces nor bridges; the endpoint then falls back to the
/// default bridge for every connection.
pub fn resolve_topology(path: Option<&Path>) -> Result<Option<TopologyMap>, TopologyError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(path).map_err(|source| TopologyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SelectorConfig =
        serde_yaml_ng::from_str(&raw).map_err(|source| TopologyError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if config.interfaces.is_empty() && config.bridges.is_empty() {
        warn!("skipping selector to device matching: empty interface and bridge list");
        return Ok(None);
    }

    let mut points = TopologyMap::new();
    for interface in &config.interfaces {
        for via in via_keys(&interface.matches) {
            points.insert(
                via.to_string(),
                EgressPoint {
                    bridge: interface.bridge.clone(),
                    interface: Some(interface.name.clone()),
                },
            );
        }
    }
    for bridge in &config.bridges {
        for via in via_keys(&bridge.matches) {
            let point = EgressPoint {
                bridge: bridge.name.clone(),
                interface: None,
            };
            if points.insert(via.to_string(), point).is_some() {
                debug!(via, bridge = %bridge.name, "bridge entry overrides interface entry");
            }
        }
    }
    Ok(Some(points))
}
