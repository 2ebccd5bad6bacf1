// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Dataplane mode resolution.
//!
//! Builds the endpoint for whichever dataplane the host supports. In
//! hardware-offload mode the resource chain is assembled in a strict order:
//! offload config, driver bindings, token pool, virtual-function pool,
//! resource pool, then the advertisement server. The advertisement server
//! must be up before the endpoint exists so the orchestrator never schedules
//! a client against an endpoint that cannot serve it.

use crate::endpoint::{AuthorizationPolicy, Endpoint, EndpointError, EndpointParams, TokenGenerator};
use crate::probe::{DataplaneMode, probe_offload_artifact};
use crate::topology::{TopologyError, resolve_topology};
use crate::tunnel::{TunnelIpError, resolve_tunnel_ip};
use config::AgentConfig;
use offload::{
    DevicePluginError, DevicePluginServer, OffloadConfig, OffloadConfigError, PciError,
    ResourcePool, TokenPool, VfPool, update_driver_bindings,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Tunnel(#[from] TunnelIpError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("failed to probe offload config: {0}")]
    Probe(#[from] std::io::Error),
    #[error(transparent)]
    OffloadConfig(#[from] OffloadConfigError),
    #[error(transparent)]
    Pci(#[from] PciError),
    #[error(transparent)]
    DevicePlugin(#[from] DevicePluginError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Everything the resolver produced for the chosen mode.
#[derive(Debug)]
pub struct ResolvedDataplane {
    pub mode: DataplaneMode,
    pub endpoint: Arc<Endpoint>,
    /// Kept alive for the lifetime of the agent in hardware-offload mode.
    pub device_plugin: Option<DevicePluginServer>,
}

/// Probe the host and build the mode-appropriate endpoint.
pub fn resolve(
    config: &AgentConfig,
    tokens: Arc<dyn TokenGenerator>,
    cancel: &CancellationToken,
) -> Result<ResolvedDataplane, ResolveError> {
    let tunnel_ip = resolve_tunnel_ip(&config.tunnel_ip)?;
    let connection_points = resolve_topology(config.selector_config_file.as_deref())?;
    let artifact = probe_offload_artifact(&config.offload_config_file)?;
    let mode = DataplaneMode::from_artifact(artifact);
    info!(mode = %mode, tunnel_ip = %tunnel_ip, "resolved dataplane mode");

    let params = EndpointParams {
        name: config.name.clone(),
        service_name: config.service_name.clone(),
        bridge_name: config.bridge_name.clone(),
        tunnel_ip,
        max_token_lifetime: config.max_token_lifetime,
        dial_timeout: config.dial_timeout,
    };
    let policy = AuthorizationPolicy::allow_any();

    let (pool, device_plugin) = match mode {
        DataplaneMode::Kernel => (None, None),
        DataplaneMode::HardwareOffload => {
            let mut offload_config = OffloadConfig::read(&config.offload_config_file)?;
            update_driver_bindings(
                &config.pci_devices_path,
                &config.pci_drivers_path,
                &mut offload_config,
            )?;
            let token_pool = Arc::new(TokenPool::new(config.max_token_lifetime, &offload_config));
            // one virtual function can serve several trunked-VLAN clients,
            // so an unbound driver does not disqualify it
            let vf_pool = Arc::new(VfPool::new(&config.vfio_path, &offload_config, false)?);
            let pool = Arc::new(ResourcePool::new(token_pool, vf_pool));
            let device_plugin = DevicePluginServer::start(
                &config.device_plugin_path,
                &config.pod_resources_path,
                Arc::clone(&pool),
                config.resource_poll_timeout,
                cancel.clone(),
            )?;
            debug!(
                resources = offload_config.resource_names().len(),
                "offload resource chain assembled"
            );
            (Some(pool), Some(device_plugin))
        }
    };

    let endpoint = Arc::new(Endpoint::new(
        params,
        mode,
        policy,
        tokens,
        connection_points,
        pool,
    )?);
    Ok(ResolvedDataplane {
        mode,
        endpoint,
        device_plugin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ConnectionRequest, TokenError};
    use config::Parser;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct StaticTokens;

    impl TokenGenerator for StaticTokens {
        fn generate(&self, audience: &str) -> Result<String, TokenError> {
            Ok(format!("token-for-{audience}"))
        }
    }

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fwd-resolve-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_kernel_mode_when_artifact_is_absent() {
        let dir = scratch("kernel");
        let config = AgentConfig::parse_from([
            "forwarder-agent",
            "--tunnel-ip",
            "192.0.2.0/24",
            "--offload-config-file",
            dir.join("missing").to_str().unwrap(),
        ]);
        let resolved = resolve(&config, Arc::new(StaticTokens), &CancellationToken::new()).unwrap();
        assert_eq!(resolved.mode, DataplaneMode::Kernel);
        assert!(resolved.device_plugin.is_none());

        // the CIDR resolves to its network address
        let reply = resolved
            .endpoint
            .request(&ConnectionRequest {
                id: Uuid::new_v4(),
                service_name: "forwarder".to_string(),
                via: None,
                resource_name: None,
            })
            .unwrap();
        assert_eq!(reply.tunnel_ip.to_string(), "192.0.2.0");
        assert_eq!(reply.bridge, "br-fwd");
    }

    #[tokio::test]
    async fn test_kernel_mode_when_artifact_is_a_directory() {
        let dir = scratch("dir");
        fs::create_dir_all(dir.join("offload.config")).unwrap();
        let config = AgentConfig::parse_from([
            "forwarder-agent",
            "--tunnel-ip",
            "192.0.2.1",
            "--offload-config-file",
            dir.join("offload.config").to_str().unwrap(),
        ]);
        let resolved = resolve(&config, Arc::new(StaticTokens), &CancellationToken::new()).unwrap();
        assert_eq!(resolved.mode, DataplaneMode::Kernel);
    }

    #[tokio::test]
    async fn test_invalid_tunnel_ip_fails() {
        let config = AgentConfig::parse_from(["forwarder-agent"]);
        let err =
            resolve(&config, Arc::new(StaticTokens), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ResolveError::Tunnel(_)));
    }

    #[tokio::test]
    async fn test_offload_mode_end_to_end() {
        let dir = scratch("offload");
        let devices = dir.join("devices");
        let drivers = dir.join("drivers");
        fs::create_dir_all(drivers.join("mlx5_core")).unwrap();
        fs::create_dir_all(drivers.join("vfio-pci")).unwrap();
        let pf_dir = devices.join("0000:01:00.0");
        let vf_dir = devices.join("0000:01:00.1");
        fs::create_dir_all(&pf_dir).unwrap();
        fs::create_dir_all(&vf_dir).unwrap();
        std::os::unix::fs::symlink(drivers.join("mlx5_core"), pf_dir.join("driver")).unwrap();
        std::os::unix::fs::symlink(drivers.join("vfio-pci"), vf_dir.join("driver")).unwrap();
        std::os::unix::fs::symlink(&vf_dir, pf_dir.join("virtfn0")).unwrap();
        fs::create_dir_all(dir.join("plugins")).unwrap();
        fs::create_dir_all(dir.join("pod-resources")).unwrap();
        fs::write(
            dir.join("offload.config"),
            r#"
physical_functions:
  "0000:01:00.0":
    pf_driver: mlx5_core
    vf_driver: vfio-pci
    capabilities: [10G]
    service_domains: [worker.domain]
"#,
        )
        .unwrap();

        let config = AgentConfig::parse_from([
            "forwarder-agent",
            "--tunnel-ip",
            "192.0.2.1",
            "--offload-config-file",
            dir.join("offload.config").to_str().unwrap(),
            "--pci-devices-path",
            devices.to_str().unwrap(),
            "--pci-drivers-path",
            drivers.to_str().unwrap(),
            "--device-plugin-path",
            dir.join("plugins").to_str().unwrap(),
            "--pod-resources-path",
            dir.join("pod-resources").to_str().unwrap(),
        ]);

        let cancel = CancellationToken::new();
        let resolved = resolve(&config, Arc::new(StaticTokens), &cancel).unwrap();
        assert_eq!(resolved.mode, DataplaneMode::HardwareOffload);
        let plugin = resolved.device_plugin.as_ref().unwrap();
        assert!(plugin.socket_path().exists());

        let reply = resolved
            .endpoint
            .request(&ConnectionRequest {
                id: Uuid::new_v4(),
                service_name: "forwarder".to_string(),
                via: None,
                resource_name: Some("worker.domain/10G".to_string()),
            })
            .unwrap();
        assert_eq!(reply.mode, "hardware-offload");
        assert_eq!(reply.device.as_deref(), Some("0000:01:00.1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_offload_mode_with_broken_config_fails() {
        let dir = scratch("broken");
        fs::write(dir.join("offload.config"), "physical_functions: {}\n").unwrap();
        let config = AgentConfig::parse_from([
            "forwarder-agent",
            "--tunnel-ip",
            "192.0.2.1",
            "--offload-config-file",
            dir.join("offload.config").to_str().unwrap(),
        ]);
        let err =
            resolve(&config, Arc::new(StaticTokens), &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, ResolveError::OffloadConfig(_)));
    }
}
