// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Agent configuration.
//!
//! Every tunable of the forwarder agent is declared here as a clap option with
//! a long flag, an `FWD_*` environment variable, a default and a description.
//! The record is parsed once during the first bootstrap phase and is read-only
//! for the remainder of the process lifetime.

#![deny(clippy::all, clippy::pedantic)]

pub use clap::Parser;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use url::Url;

/// A `key:value` label attached to the endpoint registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl FromStr for Label {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (key, value) = input
            .split_once(':')
            .ok_or_else(|| format!("bad label '{input}': expected key:value"))?;
        if key.is_empty() {
            return Err(format!("bad label '{input}': empty key"));
        }
        Ok(Label {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Parse a duration with a unit suffix (`50ms`, `30s`, `10m`, `24h`).
///
/// # Errors
///
/// Fails on a missing or unknown unit suffix and on a non-numeric value.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let (value, scale_ms) = if let Some(v) = input.strip_suffix("ms") {
        (v, 1u64)
    } else if let Some(v) = input.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = input.strip_suffix('m') {
        (v, 60 * 1_000)
    } else if let Some(v) = input.strip_suffix('h') {
        (v, 60 * 60 * 1_000)
    } else {
        return Err(format!(
            "bad duration '{input}': expected a unit suffix in [ms,s,m,h]"
        ));
    };
    let value: u64 = value
        .parse()
        .map_err(|e| format!("bad duration '{input}': {e}"))?;
    let millis = value
        .checked_mul(scale_ms)
        .ok_or_else(|| format!("bad duration '{input}': value is out of range"))?;
    Ok(Duration::from_millis(millis))
}

/// Configuration of the forwarder agent.
///
/// Defaults mirror a containerized deployment; every option can also be set
/// through the environment, which is how orchestrated deployments supply them.
#[derive(Parser, Debug, Clone)]
#[command(name = "forwarder-agent")]
#[command(about = "Network-function forwarding agent", long_about = None)]
pub struct AgentConfig {
    #[arg(
        long,
        env = "FWD_NAME",
        default_value = "forwarder",
        help = "Name of the endpoint"
    )]
    pub name: String,

    #[arg(
        long,
        env = "FWD_LABELS",
        default_value = "p2p:true",
        value_parser = Label::from_str,
        value_delimiter = ',',
        help = "Labels attached to this forwarder instance, as comma-separated key:value pairs"
    )]
    pub labels: Vec<Label>,

    #[arg(
        long,
        env = "FWD_SERVICE_NAME",
        default_value = "forwarder",
        help = "Name of the network service to register with the registry"
    )]
    pub service_name: String,

    #[arg(
        long,
        env = "FWD_BRIDGE_NAME",
        default_value = "br-fwd",
        help = "Name of the switch bridge used as the default egress point"
    )]
    pub bridge_name: String,

    #[arg(
        long,
        env = "FWD_TUNNEL_IP",
        default_value = "",
        help = "IP or CIDR to use for tunnels"
    )]
    pub tunnel_ip: String,

    #[arg(
        long,
        env = "FWD_CONNECT_TO",
        default_value = "http://127.0.0.1:5002",
        help = "URL of the registry / upstream dial target"
    )]
    pub connect_to: Url,

    #[arg(
        long,
        env = "FWD_DIAL_TIMEOUT",
        default_value = "50ms",
        value_parser = parse_duration,
        help = "Timeout for dialing the next endpoint"
    )]
    pub dial_timeout: Duration,

    #[arg(
        long,
        env = "FWD_MAX_TOKEN_LIFETIME",
        default_value = "24h",
        value_parser = parse_duration,
        help = "Maximum lifetime of issued tokens"
    )]
    pub max_token_lifetime: Duration,

    #[arg(
        long,
        env = "FWD_RESOURCE_POLL_TIMEOUT",
        default_value = "30s",
        value_parser = parse_duration,
        help = "Device plugin polling interval"
    )]
    pub resource_poll_timeout: Duration,

    #[arg(
        long,
        env = "FWD_DEVICE_PLUGIN_PATH",
        default_value = "/var/lib/kubelet/device-plugins",
        help = "Path to the device plugin directory"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        env = "FWD_POD_RESOURCES_PATH",
        default_value = "/var/lib/kubelet/pod-resources",
        help = "Path to the pod resources directory"
    )]
    pub pod_resources_path: PathBuf,

    #[arg(
        long,
        env = "FWD_OFFLOAD_CONFIG_FILE",
        default_value = "offload.config",
        help = "Hardware-offload resources config path; its presence selects offload mode"
    )]
    pub offload_config_file: PathBuf,

    #[arg(
        long,
        env = "FWD_SELECTOR_CONFIG_FILE",
        help = "Config file matching network-service selectors to egress devices"
    )]
    pub selector_config_file: Option<PathBuf>,

    #[arg(
        long,
        env = "FWD_PCI_DEVICES_PATH",
        default_value = "/sys/bus/pci/devices",
        help = "Path to the PCI devices directory"
    )]
    pub pci_devices_path: PathBuf,

    #[arg(
        long,
        env = "FWD_PCI_DRIVERS_PATH",
        default_value = "/sys/bus/pci/drivers",
        help = "Path to the PCI drivers directory"
    )]
    pub pci_drivers_path: PathBuf,

    #[arg(
        long,
        env = "FWD_CGROUP_PATH",
        default_value = "/host/sys/fs/cgroup/devices",
        help = "Path to the host cgroup device directory"
    )]
    pub cgroup_path: PathBuf,

    #[arg(
        long,
        env = "FWD_VFIO_PATH",
        default_value = "/host/dev/vfio",
        help = "Path to the host VFIO directory"
    )]
    pub vfio_path: PathBuf,

    #[arg(
        long,
        env = "FWD_IDENTITY_FILE",
        default_value = "/run/forwarder/identity.json",
        help = "Identity document written by the identity agent"
    )]
    pub identity_file: PathBuf,

    #[arg(
        long,
        env = "FWD_SWITCH_CTL_SOCKET",
        default_value = "/var/run/forwarder/switch.sock",
        help = "Control socket of the local packet-switching backend"
    )]
    pub switch_ctl_socket: PathBuf,

    #[arg(
        long,
        env = "FWD_SWITCH_LAUNCHER",
        default_value = "switch-supervisord",
        help = "Command used to start the switch backend when it is not already running"
    )]
    pub switch_launcher: String,

    #[arg(
        long,
        env = "FWD_LOG_LEVEL",
        default_value = "info",
        help = "Log level in [off,error,warn,info,debug,trace]"
    )]
    pub log_level: LevelFilter,

    #[arg(
        long,
        env = "FWD_METRICS_ADDRESS",
        help = "Bind address for the telemetry endpoint; unset disables telemetry"
    )]
    pub metrics_address: Option<SocketAddr>,
}

impl AgentConfig {
    /// Registration labels as a map.
    #[must_use]
    pub fn label_map(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .map(|l| (l.key.clone(), l.value.clone()))
            .collect()
    }
}
