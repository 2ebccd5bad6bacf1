// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Forwarding endpoint and dataplane mode resolution.
//!
//! The resolver inspects the host, decides whether connections are served by
//! the kernel dataplane or by hardware offload, assembles the mode-specific
//! resource chain and returns an [`Endpoint`] ready to be served.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod endpoint;
pub mod probe;
pub mod resolver;
pub mod topology;
pub mod tunnel;

pub use endpoint::{
    AuthorizationPolicy, CloseRequest, ConnectionReply, ConnectionRequest, Endpoint,
    EndpointError, EndpointParams, TokenError, TokenGenerator,
};
pub use probe::{DataplaneMode, OffloadArtifact, probe_offload_artifact};
pub use resolver::{ResolveError, ResolvedDataplane, resolve};
pub use topology::{EgressPoint, TopologyError, TopologyMap, resolve_topology};
pub use tunnel::{TunnelIpError, resolve_tunnel_ip};
