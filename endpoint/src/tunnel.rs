// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Egress tunnel address selection.

use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum TunnelIpError {
    #[error("tunnel IP must be set to a valid IP: '{0}'")]
    Invalid(String),
}

/// Resolve the egress tunnel IP from its configured form.
///
/// The value is either a bare address (`192.0.2.1`) or a CIDR
/// (`192.0.2.0/24`); for a CIDR the network address is used.
pub fn resolve_tunnel_ip(input: &str) -> Result<IpAddr, TunnelIpError> {
    if input.contains('/') {
        let net = IpNet::from_str(input).map_err(|_| TunnelIpError::Invalid(input.to_string()))?;
        return Ok(net.network());
    }
    IpAddr::from_str(input).map_err(|_| TunnelIpError::Invalid(input.to_string()))
}
