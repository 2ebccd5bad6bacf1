// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Hardware-offload resource chain.
//!
//! Everything the forwarder needs in hardware-offload mode lives here: the
//! offload configuration file model, the sysfs device inventory and driver
//! binding scan, the token and virtual-function allocation pools, and the
//! device-plugin advertisement server. The pieces are constructed in strict
//! order by the dataplane mode resolver; each stage consumes the output of
//! the previous one and any failure aborts the whole chain.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod deviceplugin;
pub mod pci;
pub mod resource;
pub mod token;

pub use config::{OffloadConfig, OffloadConfigError, PhysicalFunction, VirtualFunction};
pub use deviceplugin::{DevicePluginError, DevicePluginServer};
pub use pci::{Driver, PciError, VfAllocation, VfPool, update_driver_bindings};
pub use resource::{ResourceAvailability, ResourceClaim, ResourceError, ResourcePool};
pub use token::{TokenGrant, TokenPool};
