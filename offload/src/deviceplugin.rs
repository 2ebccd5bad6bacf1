// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Resource advertisement server.
//!
//! Advertises the offload resource availability to the node orchestrator
//! over a unix socket in the device-plugin directory. Each connection gets a
//! single JSON advertisement line and is closed; a background ticker logs
//! availability at the configured poll interval so operators can follow slot
//! usage without connecting.

use crate::resource::{ResourceAvailability, ResourcePool};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SOCKET_NAME: &str = "forwarder.sock";

#[derive(Debug, thiserror::Error)]
pub enum DevicePluginError {
    #[error("device plugin directory {path} is not usable: {source}")]
    PluginDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pod resources directory {path} is not usable: {source}")]
    PodResourcesDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind advertisement socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One advertisement message as written to a connecting client.
#[derive(Debug, Serialize)]
struct Advertisement<'a> {
    resources: &'a [ResourceAvailability],
}

/// Running advertisement server.
#[derive(Debug)]
pub struct DevicePluginServer {
    socket_path: PathBuf,
}

impl DevicePluginServer {
    /// Validate the orchestrator directories, bind the advertisement socket
    /// and start serving until the token is cancelled.
    pub fn start(
        device_plugin_path: &Path,
        pod_resources_path: &Path,
        pool: Arc<ResourcePool>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<DevicePluginServer, DevicePluginError> {
        std::fs::metadata(device_plugin_path).map_err(|source| {
            DevicePluginError::PluginDirectory {
                path: device_plugin_path.to_path_buf(),
                source,
            }
        })?;
        std::fs::metadata(pod_resources_path).map_err(|source| {
            DevicePluginError::PodResourcesDirectory {
                path: pod_resources_path.to_path_buf(),
                source,
            }
        })?;

        let socket_path = device_plugin_path.join(SOCKET_NAME);
        // a stale socket from a previous run would make the bind fail
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener =
            UnixListener::bind(&socket_path).map_err(|source| DevicePluginError::Bind {
                path: socket_path.clone(),
                source,
            })?;
        info!(socket = %socket_path.display(), "device plugin advertisement socket bound");

        tokio::spawn(serve(listener, socket_path.clone(), pool, poll_interval, cancel));
        Ok(DevicePluginServer { socket_path })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn serve(
    listener: UnixListener,
    socket_path: PathBuf,
    pool: Arc<ResourcePool>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for resource in pool.availability() {
                    debug!(
                        resource = %resource.name,
                        free = resource.free,
                        capacity = resource.capacity,
                        "resource availability"
                    );
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, _)) => {
                        let resources = pool.availability();
                        let advertisement = Advertisement { resources: &resources };
                        match serde_json::to_vec(&advertisement) {
                            Ok(mut body) => {
                                body.push(b'\n');
                                if let Err(e) = stream.write_all(&body).await {
                                    warn!("failed to write advertisement: {e}");
                                }
                            }
                            Err(e) => error!("failed to encode advertisement: {e}"),
                        }
                    }
                    Err(e) => warn!("advertisement accept failed: {e}"),
                }
            }
        }
    }
    let _ = std::fs::remove_file(&socket_path);
    debug!("device plugin advertisement server stopped");
}
