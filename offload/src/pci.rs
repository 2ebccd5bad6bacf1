// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Device inventory and driver-binding scan.
//!
//! The kernel exposes the binding state of every PCI function under sysfs:
//! `<devices>/<address>/driver` is a symlink into the drivers directory, and
//! `<devices>/<address>/virtfn<N>` symlinks name the virtual functions a
//! physical function exposes. The scan annotates the offload configuration
//! with what is actually present on the host.

use crate::config::{OffloadConfig, VirtualFunction};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PciError {
    #[error("device {0} described by the offload config does not exist")]
    MissingDevice(String),
    #[error("driver {0} is not present under the drivers directory")]
    MissingDriver(String),
    #[error("failed to inspect device {device}: {source}")]
    Inspect {
        device: String,
        source: std::io::Error,
    },
    #[error("virtual function {0} has no bound driver")]
    UnboundVirtualFunction(String),
    #[error("offload config describes no usable virtual function")]
    NoVirtualFunctions,
}

/// Kernel drivers we know how to classify.
#[derive(Debug, Clone, PartialEq, Eq, strum::EnumString)]
pub enum Driver {
    #[strum(serialize = "mlx5_core")]
    Mlx5Core,
    #[strum(serialize = "iavf")]
    Iavf,
    #[strum(serialize = "vfio-pci")]
    VfioPci,
    #[strum(serialize = "unbound")]
    Unbound,
    #[strum(default)]
    Other(String),
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Driver::Mlx5Core => write!(f, "mlx5_core"),
            Driver::Iavf => write!(f, "iavf"),
            Driver::VfioPci => write!(f, "vfio-pci"),
            Driver::Unbound => write!(f, "unbound"),
            Driver::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Last path component of a sysfs symlink target, as a string.
fn link_target_name(link: &Path) -> Option<String> {
    link.components()
        .next_back()
        .and_then(|c| c.as_os_str().to_str())
        .map(ToString::to_string)
}

/// Driver currently bound to `device`, or [`Driver::Unbound`] when the
/// `driver` symlink does not exist.
pub fn read_bound_driver(devices_path: &Path, device: &str) -> Result<Driver, PciError> {
    let link = devices_path.join(device).join("driver");
    match std::fs::read_link(&link) {
        Ok(target) => {
            let name = link_target_name(&target).ok_or_else(|| PciError::Inspect {
                device: device.to_string(),
                source: std::io::Error::other("driver symlink has no target name"),
            })?;
            Ok(Driver::from_str(&name).unwrap_or_else(|_| Driver::Other(name)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Driver::Unbound),
        Err(source) => Err(PciError::Inspect {
            device: device.to_string(),
            source,
        }),
    }
}

/// Enumerate the `virtfn*` links of a physical function.
fn scan_virtual_functions(
    devices_path: &Path,
    device: &str,
) -> Result<Vec<VirtualFunction>, PciError> {
    let device_dir = devices_path.join(device);
    let entries = std::fs::read_dir(&device_dir).map_err(|source| PciError::Inspect {
        device: device.to_string(),
        source,
    })?;
    let mut functions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| PciError::Inspect {
            device: device.to_string(),
            source,
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("virtfn") {
            continue;
        }
        let target = std::fs::read_link(entry.path()).map_err(|source| PciError::Inspect {
            device: device.to_string(),
            source,
        })?;
        let Some(address) = link_target_name(&target) else {
            continue;
        };
        let driver = read_bound_driver(devices_path, &address)?;
        let iommu_group = std::fs::read_link(devices_path.join(&address).join("iommu_group"))
            .ok()
            .and_then(|t| link_target_name(&t));
        functions.push(VirtualFunction {
            address,
            driver,
            iommu_group,
        });
    }
    functions.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(functions)
}

/// Annotate the offload configuration with the bound drivers and the
/// virtual-function inventory of every described device.
///
/// A described device that is missing from the devices directory is an
/// error; so is a configured driver that is not present under the drivers
/// directory.
pub fn update_driver_bindings(
    devices_path: &Path,
    drivers_path: &Path,
    config: &mut OffloadConfig,
) -> Result<(), PciError> {
    for (address, function) in &mut config.physical_functions {
        if !devices_path.join(address).is_dir() {
            return Err(PciError::MissingDevice(address.clone()));
        }
        for driver in [&function.pf_driver, &function.vf_driver] {
            if !drivers_path.join(driver).is_dir() {
                return Err(PciError::MissingDriver(driver.clone()));
            }
        }
        function.bound_driver = Some(read_bound_driver(devices_path, address)?);
        function.virtual_functions = scan_virtual_functions(devices_path, address)?;
        debug!(
            device = %address,
            driver = %function.bound_driver.as_ref().unwrap_or(&Driver::Unbound),
            virtual_functions = function.virtual_functions.len(),
            "annotated device bindings"
        );
    }
    Ok(())
}

/// A virtual function handed out by the [`VfPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfAllocation {
    pub address: String,
    pub physical_function: String,
    pub driver: Driver,
    /// VFIO device node a client opens, when the IOMMU group is known.
    pub device_node: Option<PathBuf>,
}

#[derive(Debug)]
struct VfEntry {
    allocation: VfAllocation,
    allocated: bool,
}

/// Allocation pool over the annotated virtual functions.
#[derive(Debug)]
pub struct VfPool {
    entries: Mutex<Vec<VfEntry>>,
}

impl VfPool {
    /// Build the pool from an annotated configuration.
    ///
    /// With `require_bound_driver` set, a virtual function without a bound
    /// kernel driver fails construction. The forwarder passes `false`: a
    /// single virtual function may serve multiple trunked-VLAN clients, and
    /// those are handed out regardless of the binding state.
    pub fn new(
        vfio_path: &Path,
        config: &OffloadConfig,
        require_bound_driver: bool,
    ) -> Result<VfPool, PciError> {
        let mut entries = Vec::new();
        for (pf_address, function) in &config.physical_functions {
            for vf in &function.virtual_functions {
                if require_bound_driver && vf.driver == Driver::Unbound {
                    return Err(PciError::UnboundVirtualFunction(vf.address.clone()));
                }
                entries.push(VfEntry {
                    allocation: VfAllocation {
                        address: vf.address.clone(),
                        physical_function: pf_address.clone(),
                        driver: vf.driver.clone(),
                        device_node: vf
                            .iommu_group
                            .as_deref()
                            .map(|group| vfio_path.join(group)),
                    },
                    allocated: false,
                });
            }
        }
        if entries.is_empty() {
            return Err(PciError::NoVirtualFunctions);
        }
        Ok(VfPool {
            entries: Mutex::new(entries),
        })
    }

    /// Reserve a free virtual function, if any.
    pub fn allocate(&self) -> Option<VfAllocation> {
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| !e.allocated)?;
        entry.allocated = true;
        Some(entry.allocation.clone())
    }

    /// Return a previously reserved virtual function to the pool.
    pub fn release(&self, address: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.allocation.address == address) {
            entry.allocated = false;
        }
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| !e.allocated).count()
    }
}
