// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Dataplane mode probe.
//!
//! Whether the forwarder runs the kernel dataplane or hardware offload is
//! decided by the offload configuration artifact on disk. The probe reports
//! what exists at the configured path; the mode is a pure function of that
//! report, so the decision is testable without a filesystem.

use std::path::Path;

/// What the probe found at the offload configuration path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadArtifact {
    Absent,
    Regular,
    Directory,
}

/// Which dataplane serves connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DataplaneMode {
    #[strum(serialize = "kernel")]
    Kernel,
    #[strum(serialize = "hardware-offload")]
    HardwareOffload,
}

impl DataplaneMode {
    /// Hardware offload needs a regular config file; anything else runs the
    /// kernel dataplane. A directory at the path is how deployments without
    /// an offload config mount the volume, so it means kernel too.
    #[must_use]
    pub fn from_artifact(artifact: OffloadArtifact) -> DataplaneMode {
        match artifact {
            OffloadArtifact::Regular => DataplaneMode::HardwareOffload,
            OffloadArtifact::Absent | OffloadArtifact::Directory => DataplaneMode::Kernel,
        }
    }
}

/// Stat the offload configuration path.
///
/// A missing path is a valid report; any other stat failure propagates.
pub fn probe_offload_artifact(path: &Path) -> Result<OffloadArtifact, std::io::Error> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(OffloadArtifact::Directory),
        Ok(_) => Ok(OffloadArtifact::Regular),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OffloadArtifact::Absent),
        Err(e) => Err(e),
    }
}
