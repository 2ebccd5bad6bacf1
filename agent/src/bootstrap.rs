// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Startup orchestration.
//!
//! Startup is a fixed sequence of phases, each logged with its duration.
//! Any phase failure aborts the sequence with an error naming the phase;
//! `main` inspects that single result, so there is exactly one exit path.

use crate::identity::{Identity, IdentityError, IdentityTokenGenerator};
use crate::monitor::FailureMonitor;
use crate::switch::{self, START_SWITCH_TIMEOUT, SwitchError};
use crate::telemetry::{self, TelemetryError};
use config::AgentConfig;
use endpoint::{ResolveError, resolve};
use registry::{Registration, RegistryClient, RegistryError};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::future::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, warn};
use tracing_subscriber::{Registry, reload};

pub type LogHandle = reload::Handle<LevelFilter, Registry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Telemetry,
    Switch,
    Identity,
    Endpoint,
    Listener,
    Registry,
}

impl Phase {
    const ALL: [Phase; 7] = [
        Phase::Config,
        Phase::Telemetry,
        Phase::Switch,
        Phase::Identity,
        Phase::Endpoint,
        Phase::Listener,
        Phase::Registry,
    ];

    fn key(self) -> &'static str {
        match self {
            Phase::Config => "config",
            Phase::Telemetry => "telemetry",
            Phase::Switch => "switch",
            Phase::Identity => "identity",
            Phase::Endpoint => "endpoint",
            Phase::Listener => "listener",
            Phase::Registry => "registry",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Phase::Config => "1: get config from environment",
            Phase::Telemetry => "2: start telemetry",
            Phase::Switch => "3: ensure the switch backend is running",
            Phase::Identity => "4: retrieve the workload identity",
            Phase::Endpoint => "5: create the forwarder endpoint",
            Phase::Listener => "6: serve the endpoint",
            Phase::Registry => "7: register with the registry",
        };
        f.write_str(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Switch(#[from] SwitchError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("listener failed: {0}")]
    Listener(std::io::Error),
    #[error("failed to create scratch directory: {0}")]
    Scratch(std::io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
#[error("phase {phase} failed: {source}")]
pub struct BootstrapError {
    phase: Phase,
    #[source]
    source: PhaseError,
}

impl BootstrapError {
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

fn wrap<E: Into<PhaseError>>(phase: Phase) -> impl FnOnce(E) -> BootstrapError {
    move |e| BootstrapError {
        phase,
        source: e.into(),
    }
}

fn phase_started(phase: Phase, start: Instant) {
    info!("executing phase {phase} (time since start: {:?})", start.elapsed());
}

fn phase_completed(phase: Phase, began: Instant) {
    let duration = began.elapsed();
    metrics::histogram!("agent_bootstrap_phase_seconds", "phase" => phase.key())
        .record(duration.as_secs_f64());
    info!(?duration, "completed phase {phase}");
}

fn log_phases() {
    info!(
        "there are {} phases which will be executed followed by a success message:",
        Phase::ALL.len()
    );
    info!("the phases include:");
    for phase in Phase::ALL {
        info!("{phase}");
    }
    info!("a final success message with startup duration");
}

/// Temporary runtime directory handed to the supervised switch; removed at
/// shutdown.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create() -> Result<ScratchDir, std::io::Error> {
        let path = std::env::temp_dir().join(format!("forwarder-agent-{}", std::process::id()));
        std::fs::create_dir_all(&path)?;
        Ok(ScratchDir { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), "failed to remove scratch directory: {e}");
        }
    }
}

/// Run the whole startup sequence and then hold until cancellation.
///
/// The configuration is parsed by `main` before the runtime exists; phase 1
/// applies it.
pub async fn run(
    config: AgentConfig,
    cancel: CancellationToken,
    log_handle: &LogHandle,
) -> Result<(), BootstrapError> {
    let start = Instant::now();
    log_phases();

    // phase 1: configuration
    phase_started(Phase::Config, start);
    let began = Instant::now();
    if let Err(e) = log_handle.reload(config.log_level) {
        warn!("failed to apply configured log level: {e}");
    }
    info!(?config, "configuration loaded");
    phase_completed(Phase::Config, began);

    // phase 2: telemetry, only when an address is configured
    phase_started(Phase::Telemetry, start);
    let began = Instant::now();
    match config.metrics_address {
        Some(addr) => {
            telemetry::start(addr, &cancel).map_err(wrap(Phase::Telemetry))?;
        }
        None => debug!("no metrics address configured, telemetry disabled"),
    }
    phase_completed(Phase::Telemetry, began);

    // phase 3: switch backend
    phase_started(Phase::Switch, start);
    let began = Instant::now();
    let scratch = ScratchDir::create()
        .map_err(|e| wrap(Phase::Switch)(PhaseError::Scratch(e)))?;
    if switch::is_running(&config.switch_ctl_socket) {
        info!("host switch is being used");
    } else {
        let failure = switch::start_supervised(&config.switch_launcher, scratch.path(), &cancel)
            .map_err(wrap(Phase::Switch))?;
        FailureMonitor::attach("switch-supervisor", failure, &cancel)
            .map_err(wrap(Phase::Switch))?;
        switch::wait_ready(&config.switch_ctl_socket, START_SWITCH_TIMEOUT, &cancel)
            .await
            .map_err(wrap(Phase::Switch))?;
        info!("local switch is being used");
    }
    phase_completed(Phase::Switch, began);

    // phase 4: identity; nothing works without it, so call out the likely
    // culprit when this hangs or fails
    phase_started(Phase::Identity, start);
    info!("check the identity agent if this is the last line you see");
    let began = Instant::now();
    let identity = Identity::load(&config.identity_file)
        .await
        .map_err(wrap(Phase::Identity))?;
    let tokens = Arc::new(IdentityTokenGenerator::new(identity.id.clone()));
    phase_completed(Phase::Identity, began);

    // phase 5: resolve the dataplane and build the endpoint
    phase_started(Phase::Endpoint, start);
    let began = Instant::now();
    let resolved = resolve(&config, tokens, &cancel).map_err(wrap(Phase::Endpoint))?;
    // held for the rest of the agent lifetime in hardware-offload mode
    let _device_plugin = resolved.device_plugin;
    phase_completed(Phase::Endpoint, began);

    // phase 6: serve the endpoint over TLS on an ephemeral rendezvous port
    phase_started(Phase::Listener, start);
    let began = Instant::now();
    let local_addr = serve_endpoint(&resolved.endpoint, &identity, &cancel)
        .map_err(wrap(Phase::Listener))?;
    phase_completed(Phase::Listener, began);

    // phase 7: registration blocks until the registry answers
    phase_started(Phase::Registry, start);
    let began = Instant::now();
    let registration = Registration {
        name: config.name.clone(),
        network_service: config.service_name.clone(),
        labels: config.label_map(),
        url: format!("https://{local_addr}"),
    };
    let client = RegistryClient::new(&config.connect_to).map_err(wrap(Phase::Registry))?;
    let register_cancel = cancel.clone();
    tokio::task::spawn_blocking(move || client.register(&registration, &register_cancel))
        .await
        .map_err(wrap(Phase::Registry))?
        .map_err(wrap(Phase::Registry))?;
    phase_completed(Phase::Registry, began);

    info!("startup completed in {:?}", start.elapsed());

    cancel.cancelled().await;
    info!("shutting down");
    resolved.endpoint.close_all();
    drop(scratch);
    Ok(())
}

fn serve_endpoint(
    endpoint: &Arc<endpoint::Endpoint>,
    identity: &Identity,
    cancel: &CancellationToken,
) -> Result<SocketAddr, PhaseError> {
    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(PhaseError::Listener)?;
    listener.set_nonblocking(true).map_err(PhaseError::Listener)?;
    let local_addr = listener.local_addr().map_err(PhaseError::Listener)?;

    let app = Arc::clone(endpoint).router();
    let server = axum_server::from_tcp_rustls(listener, identity.server_tls.clone())
        .map_err(PhaseError::Listener)?
        .serve(app.into_make_service());

    let (tx, rx) = oneshot::channel();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Some(Err(e)) = server.with_cancellation_token(&server_cancel).await {
            let _ = tx.send(e);
        }
    });
    FailureMonitor::attach("endpoint-listener", rx, cancel).map_err(PhaseError::Listener)?;
    info!(%local_addr, "endpoint listening");
    Ok(local_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_phase_labels() {
        assert_eq!(Phase::ALL.len(), 7);
        assert_eq!(Phase::Config.key(), "config");
        assert_eq!(
            Phase::Switch.to_string(),
            "3: ensure the switch backend is running"
        );
    }

    #[test]
    fn test_bootstrap_error_names_the_phase() {
        let err = wrap(Phase::Registry)(PhaseError::Registry(RegistryError::Rejected(403)));
        assert_eq!(err.phase(), Phase::Registry);
        assert!(err.to_string().contains("7: register with the registry"));
    }

    #[test]
    fn test_scratch_dir_lifecycle() {
        let scratch = ScratchDir::create().unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.is_dir());
        drop(scratch);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_identity_failure_aborts_startup() {
        let dir = std::env::temp_dir().join(format!(
            "fwd-bootstrap-identity-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        // an existing control socket selects the host-switch path, so the
        // sequence reaches the identity phase without spawning anything
        let socket = dir.join("switch.sock");
        std::fs::write(&socket, b"").unwrap();

        let config = AgentConfig::parse_from([
            "forwarder-agent",
            "--tunnel-ip",
            "192.0.2.1",
            "--switch-ctl-socket",
            socket.to_str().unwrap(),
            "--identity-file",
            dir.join("missing-identity.json").to_str().unwrap(),
        ]);
        let (_, handle) = reload::Layer::new(LevelFilter::INFO);
        let err = run(config, CancellationToken::new(), &handle)
            .await
            .unwrap_err();

        // the sequence stops at identity; the endpoint, listener and
        // registration phases never run
        assert_eq!(err.phase(), Phase::Identity);
        assert!(err.to_string().contains("4: retrieve the workload identity"));
    }
}
