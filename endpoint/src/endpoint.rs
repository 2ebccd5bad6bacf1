// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! The forwarding endpoint.
//!
//! Clients request cross-connections over a small JSON API. The endpoint
//! authorizes the peer, picks the egress point from the layer-2 topology,
//! issues a bearer token and, in hardware-offload mode, attaches a resource
//! claim. Closing a connection releases everything it held.

use crate::probe::DataplaneMode;
use crate::topology::EgressPoint;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use offload::{ResourceError, ResourcePool};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TokenError(pub String);

/// Issues the bearer tokens handed to connecting peers.
pub trait TokenGenerator: Send + Sync + 'static {
    fn generate(&self, audience: &str) -> Result<String, TokenError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("service '{0}' is not authorized")]
    Unauthorized(String),
    #[error("connection {0} is already active")]
    AlreadyActive(Uuid),
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),
    #[error("hardware offload requires a resource name")]
    MissingResourceName,
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("token generation failed: {0}")]
    Token(#[from] TokenError),
    #[error("endpoint misconfigured: {0}")]
    Misconfigured(String),
}

/// Which services a peer may request connections for. Empty means any.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationPolicy {
    allowed_services: Vec<String>,
}

impl AuthorizationPolicy {
    #[must_use]
    pub fn allow_any() -> AuthorizationPolicy {
        AuthorizationPolicy::default()
    }

    pub fn allow_services<I, S>(services: I) -> AuthorizationPolicy
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AuthorizationPolicy {
            allowed_services: services.into_iter().map(Into::into).collect(),
        }
    }

    fn authorize(&self, request: &ConnectionRequest) -> Result<(), EndpointError> {
        if self.allowed_services.is_empty()
            || self.allowed_services.iter().any(|s| s == &request.service_name)
        {
            return Ok(());
        }
        Err(EndpointError::Unauthorized(request.service_name.clone()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionRequest {
    pub id: Uuid,
    pub service_name: String,
    /// Service-domain selector choosing the egress point.
    #[serde(default)]
    pub via: Option<String>,
    /// Offload resource the peer was scheduled against.
    #[serde(default)]
    pub resource_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionReply {
    pub id: Uuid,
    pub mode: String,
    pub bridge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub tunnel_ip: IpAddr,
    /// PCI address of the virtual function, in hardware-offload mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// VFIO device node backing that function, when its IOMMU group is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_node: Option<PathBuf>,
    pub token: String,
    pub token_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloseRequest {
    pub id: Uuid,
}

/// Construction-time parameters of the endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParams {
    pub name: String,
    pub service_name: String,
    pub bridge_name: String,
    pub tunnel_ip: IpAddr,
    pub max_token_lifetime: Duration,
    pub dial_timeout: Duration,
}

#[derive(Debug)]
struct ActiveConnection {
    claim: Option<Uuid>,
}

/// The forwarding endpoint served to clients.
pub struct Endpoint {
    params: EndpointParams,
    mode: DataplaneMode,
    policy: AuthorizationPolicy,
    tokens: Arc<dyn TokenGenerator>,
    connection_points: Option<BTreeMap<String, EgressPoint>>,
    offload: Option<Arc<ResourcePool>>,
    active: Mutex<HashMap<Uuid, ActiveConnection>>,
}

impl Endpoint {
    pub fn new(
        params: EndpointParams,
        mode: DataplaneMode,
        policy: AuthorizationPolicy,
        tokens: Arc<dyn TokenGenerator>,
        connection_points: Option<BTreeMap<String, EgressPoint>>,
        offload: Option<Arc<ResourcePool>>,
    ) -> Result<Endpoint, EndpointError> {
        match (mode, offload.is_some()) {
            (DataplaneMode::HardwareOffload, false) => {
                return Err(EndpointError::Misconfigured(
                    "hardware-offload mode without a resource pool".to_string(),
                ));
            }
            (DataplaneMode::Kernel, true) => {
                return Err(EndpointError::Misconfigured(
                    "kernel mode with a resource pool".to_string(),
                ));
            }
            _ => {}
        }
        info!(name = %params.name, mode = %mode, "endpoint created");
        Ok(Endpoint {
            params,
            mode,
            policy,
            tokens,
            connection_points,
            offload,
            active: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn mode(&self) -> DataplaneMode {
        self.mode
    }

    #[must_use]
    pub fn params(&self) -> &EndpointParams {
        &self.params
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Egress point for a `via` selector, defaulting to the main bridge.
    fn connection_point(&self, via: Option<&str>) -> EgressPoint {
        via.and_then(|v| {
            self.connection_points
                .as_ref()
                .and_then(|points| points.get(v).cloned())
        })
        .unwrap_or_else(|| EgressPoint {
            bridge: self.params.bridge_name.clone(),
            interface: None,
        })
    }

    /// Establish a cross-connection for a peer.
    pub fn request(&self, request: &ConnectionRequest) -> Result<ConnectionReply, EndpointError> {
        self.policy.authorize(request)?;
        // the id is reserved under one lock before anything is claimed, so a
        // concurrent duplicate cannot slip past the check and strand a claim
        {
            let mut active = self.active.lock();
            if active.contains_key(&request.id) {
                return Err(EndpointError::AlreadyActive(request.id));
            }
            active.insert(request.id, ActiveConnection { claim: None });
        }
        self.admit(request).inspect_err(|_| {
            self.active.lock().remove(&request.id);
        })
    }

    fn admit(&self, request: &ConnectionRequest) -> Result<ConnectionReply, EndpointError> {
        let claim = match (&self.offload, &request.resource_name) {
            (Some(pool), Some(resource_name)) => Some(pool.claim(resource_name)?),
            (Some(_), None) => return Err(EndpointError::MissingResourceName),
            (None, _) => None,
        };

        let token = match self.tokens.generate(&request.service_name) {
            Ok(token) => token,
            Err(e) => {
                // do not leak the claim on a token failure
                if let (Some(claim), Some(pool)) = (&claim, &self.offload) {
                    let _ = pool.release(claim.id);
                }
                return Err(e.into());
            }
        };

        let point = self.connection_point(request.via.as_deref());
        let reply = ConnectionReply {
            id: request.id,
            mode: self.mode.to_string(),
            bridge: point.bridge,
            interface: point.interface,
            tunnel_ip: self.params.tunnel_ip,
            device: claim
                .as_ref()
                .map(|c| c.virtual_function.address.clone()),
            device_node: claim
                .as_ref()
                .and_then(|c| c.virtual_function.device_node.clone()),
            token,
            token_lifetime_secs: self.params.max_token_lifetime.as_secs(),
        };
        self.active.lock().insert(
            request.id,
            ActiveConnection {
                claim: claim.map(|c| c.id),
            },
        );
        debug!(
            connection = %request.id,
            service = %request.service_name,
            bridge = %reply.bridge,
            "connection established"
        );
        Ok(reply)
    }

    /// Tear down a connection and release what it held.
    pub fn close(&self, id: Uuid) -> Result<(), EndpointError> {
        let connection = self
            .active
            .lock()
            .remove(&id)
            .ok_or(EndpointError::UnknownConnection(id))?;
        if let (Some(claim), Some(pool)) = (connection.claim, &self.offload) {
            pool.release(claim)?;
        }
        debug!(connection = %id, "connection closed");
        Ok(())
    }

    /// Tear down every active connection. Used during shutdown.
    pub fn close_all(&self) {
        let drained: Vec<Uuid> = self.active.lock().keys().copied().collect();
        for id in drained {
            let _ = self.close(id);
        }
    }

    /// HTTP surface of the endpoint.
    pub fn router(self: Arc<Endpoint>) -> Router {
        Router::new()
            .route("/request", post(handle_request))
            .route("/close", post(handle_close))
            .with_state(self)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.params.name)
            .field("mode", &self.mode)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

fn reject(error: &EndpointError) -> (StatusCode, String) {
    let status = match error {
        EndpointError::Unauthorized(_) => StatusCode::FORBIDDEN,
        EndpointError::AlreadyActive(_) => StatusCode::CONFLICT,
        EndpointError::UnknownConnection(_) => StatusCode::NOT_FOUND,
        EndpointError::MissingResourceName => StatusCode::BAD_REQUEST,
        EndpointError::Resource(_) => StatusCode::SERVICE_UNAVAILABLE,
        EndpointError::Token(_) | EndpointError::Misconfigured(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, error.to_string())
}

async fn handle_request(
    State(endpoint): State<Arc<Endpoint>>,
    Json(request): Json<ConnectionRequest>,
) -> Result<Json<ConnectionReply>, (StatusCode, String)> {
    endpoint
        .request(&request)
        .map(Json)
        .map_err(|e| reject(&e))
}

async fn handle_close(
    State(endpoint): State<Arc<Endpoint>>,
    Json(request): Json<CloseRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    endpoint
        .close(request.id)
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(|e| reject(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload::{OffloadConfig, TokenPool, VfPool, VirtualFunction};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    struct StaticTokens;

    impl TokenGenerator for StaticTokens {
        fn generate(&self, audience: &str) -> Result<String, TokenError> {
            Ok(format!("token-for-{audience}"))
        }
    }

    struct FailingTokens;

    impl TokenGenerator for FailingTokens {
        fn generate(&self, _audience: &str) -> Result<String, TokenError> {
            Err(TokenError("signer unavailable".to_string()))
        }
    }

    fn params() -> EndpointParams {
        EndpointParams {
            name: "forwarder".to_string(),
            service_name: "forwarder".to_string(),
            bridge_name: "br-fwd".to_string(),
            tunnel_ip: "192.0.2.1".parse().unwrap(),
            max_token_lifetime: Duration::from_secs(3600),
            dial_timeout: Duration::from_millis(50),
        }
    }

    fn kernel_endpoint(tokens: Arc<dyn TokenGenerator>) -> Endpoint {
        Endpoint::new(
            params(),
            DataplaneMode::Kernel,
            AuthorizationPolicy::allow_any(),
            tokens,
            None,
            None,
        )
        .unwrap()
    }

    fn offload_pool() -> Arc<ResourcePool> {
        let yaml = r#"
physical_functions:
  "0000:01:00.0":
    pf_driver: mlx5_core
    vf_driver: vfio-pci
    capabilities: [10G]
    service_domains: [worker.domain]
"#;
        let mut config: OffloadConfig = serde_yaml_ng::from_str(yaml).unwrap();
        for function in config.physical_functions.values_mut() {
            function.virtual_functions = vec![
                VirtualFunction {
                    address: "0000:01:00.1".to_string(),
                    driver: offload::Driver::VfioPci,
                    iommu_group: Some("7".to_string()),
                },
                VirtualFunction {
                    address: "0000:01:00.2".to_string(),
                    driver: offload::Driver::VfioPci,
                    iommu_group: None,
                },
            ];
        }
        let tokens = Arc::new(TokenPool::new(Duration::from_secs(60), &config));
        let functions =
            Arc::new(VfPool::new(Path::new("/dev/vfio"), &config, false).unwrap());
        Arc::new(ResourcePool::new(tokens, functions))
    }

    fn offload_endpoint(pool: Arc<ResourcePool>) -> Endpoint {
        Endpoint::new(
            params(),
            DataplaneMode::HardwareOffload,
            AuthorizationPolicy::allow_any(),
            Arc::new(StaticTokens),
            None,
            Some(pool),
        )
        .unwrap()
    }

    #[test]
    fn test_kernel_request_and_close() {
        let endpoint = kernel_endpoint(Arc::new(StaticTokens));
        let id = Uuid::new_v4();
        let reply = endpoint
            .request(&ConnectionRequest {
                id,
                service_name: "forwarder".to_string(),
                via: None,
                resource_name: None,
            })
            .unwrap();
        assert_eq!(reply.mode, "kernel");
        assert_eq!(reply.bridge, "br-fwd");
        assert_eq!(reply.token, "token-for-forwarder");
        assert!(reply.device.is_none());
        assert_eq!(endpoint.active_count(), 1);

        endpoint.close(id).unwrap();
        assert_eq!(endpoint.active_count(), 0);
        assert!(matches!(
            endpoint.close(id),
            Err(EndpointError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_duplicate_request_is_rejected() {
        let endpoint = kernel_endpoint(Arc::new(StaticTokens));
        let request = ConnectionRequest {
            id: Uuid::new_v4(),
            service_name: "forwarder".to_string(),
            via: None,
            resource_name: None,
        };
        endpoint.request(&request).unwrap();
        assert!(matches!(
            endpoint.request(&request),
            Err(EndpointError::AlreadyActive(_))
        ));
    }

    #[test]
    fn test_authorization_policy() {
        let endpoint = Endpoint::new(
            params(),
            DataplaneMode::Kernel,
            AuthorizationPolicy::allow_services(["forwarder"]),
            Arc::new(StaticTokens),
            None,
            None,
        )
        .unwrap();
        let denied = endpoint.request(&ConnectionRequest {
            id: Uuid::new_v4(),
            service_name: "intruder".to_string(),
            via: None,
            resource_name: None,
        });
        assert!(matches!(denied, Err(EndpointError::Unauthorized(_))));
    }

    #[test]
    fn test_via_selector_picks_egress_point() {
        let mut points = BTreeMap::new();
        points.insert(
            "service.domain.1".to_string(),
            EgressPoint {
                bridge: "br-ex".to_string(),
                interface: Some("eth0".to_string()),
            },
        );
        let endpoint = Endpoint::new(
            params(),
            DataplaneMode::Kernel,
            AuthorizationPolicy::allow_any(),
            Arc::new(StaticTokens),
            Some(points),
            None,
        )
        .unwrap();

        let matched = endpoint
            .request(&ConnectionRequest {
                id: Uuid::new_v4(),
                service_name: "forwarder".to_string(),
                via: Some("service.domain.1".to_string()),
                resource_name: None,
            })
            .unwrap();
        assert_eq!(matched.bridge, "br-ex");
        assert_eq!(matched.interface.as_deref(), Some("eth0"));

        let unmatched = endpoint
            .request(&ConnectionRequest {
                id: Uuid::new_v4(),
                service_name: "forwarder".to_string(),
                via: Some("service.domain.other".to_string()),
                resource_name: None,
            })
            .unwrap();
        assert_eq!(unmatched.bridge, "br-fwd");
        assert!(unmatched.interface.is_none());
    }

    #[test]
    fn test_offload_request_claims_and_releases() {
        let pool = offload_pool();
        let endpoint = offload_endpoint(Arc::clone(&pool));

        let no_resource = endpoint.request(&ConnectionRequest {
            id: Uuid::new_v4(),
            service_name: "forwarder".to_string(),
            via: None,
            resource_name: None,
        });
        assert!(matches!(
            no_resource,
            Err(EndpointError::MissingResourceName)
        ));

        let id = Uuid::new_v4();
        let reply = endpoint
            .request(&ConnectionRequest {
                id,
                service_name: "forwarder".to_string(),
                via: None,
                resource_name: Some("worker.domain/10G".to_string()),
            })
            .unwrap();
        assert_eq!(reply.mode, "hardware-offload");
        assert_eq!(reply.device.as_deref(), Some("0000:01:00.1"));
        assert_eq!(reply.device_node, Some(PathBuf::from("/dev/vfio/7")));
        assert_eq!(pool.outstanding(), 1);

        endpoint.close(id).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_duplicate_requests_claim_once() {
        let pool = offload_pool();
        let endpoint = offload_endpoint(Arc::clone(&pool));
        let id = Uuid::new_v4();
        let request = ConnectionRequest {
            id,
            service_name: "forwarder".to_string(),
            via: None,
            resource_name: Some("worker.domain/10G".to_string()),
        };

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let endpoint = &endpoint;
                    let request = request.clone();
                    s.spawn(move || endpoint.request(&request))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(EndpointError::AlreadyActive(_))))
        );
        // the loser must not have claimed anything
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(endpoint.active_count(), 1);

        endpoint.close(id).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_token_failure_releases_claim() {
        let pool = offload_pool();
        let endpoint = Endpoint::new(
            params(),
            DataplaneMode::HardwareOffload,
            AuthorizationPolicy::allow_any(),
            Arc::new(FailingTokens),
            None,
            Some(Arc::clone(&pool)),
        )
        .unwrap();

        let denied = endpoint.request(&ConnectionRequest {
            id: Uuid::new_v4(),
            service_name: "forwarder".to_string(),
            via: None,
            resource_name: Some("worker.domain/10G".to_string()),
        });
        assert!(matches!(denied, Err(EndpointError::Token(_))));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(endpoint.active_count(), 0);
    }

    #[test]
    fn test_close_all() {
        let endpoint = kernel_endpoint(Arc::new(StaticTokens));
        for _ in 0..3 {
            endpoint
                .request(&ConnectionRequest {
                    id: Uuid::new_v4(),
                    service_name: "forwarder".to_string(),
                    via: None,
                    resource_name: None,
                })
                .unwrap();
        }
        assert_eq!(endpoint.active_count(), 3);
        endpoint.close_all();
        assert_eq!(endpoint.active_count(), 0);
    }

    #[test]
    fn test_mode_and_pool_must_agree() {
        assert!(matches!(
            Endpoint::new(
                params(),
                DataplaneMode::HardwareOffload,
                AuthorizationPolicy::allow_any(),
                Arc::new(StaticTokens),
                None,
                None,
            ),
            Err(EndpointError::Misconfigured(_))
        ));
        assert!(matches!(
            Endpoint::new(
                params(),
                DataplaneMode::Kernel,
                AuthorizationPolicy::allow_any(),
                Arc::new(StaticTokens),
                None,
                Some(offload_pool()),
            ),
            Err(EndpointError::Misconfigured(_))
        ));
    }
}
