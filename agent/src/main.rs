// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Forwarder agent binary.

#![deny(clippy::all, clippy::pedantic)]

mod bootstrap;
mod identity;
mod monitor;
mod switch;
mod telemetry;

use bootstrap::LogHandle;
use config::{AgentConfig, Parser};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload};

/// Install the fmt subscriber at `info`; the handle lets phase 1 apply the
/// configured level once the configuration is parsed.
fn init_logging() -> LogHandle {
    let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    handle
}

/// Map the usual termination signals to cancellation.
async fn wire_signals(cancel: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
            _ = hangup.recv() => info!("received SIGHUP"),
            _ = quit.recv() => info!("received SIGQUIT"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn main() -> ExitCode {
    let log_handle = init_logging();

    // parsed before the runtime exists; clap renders its own help and usage
    let config = match AgentConfig::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build the runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    if let Err(e) = runtime.block_on(wire_signals(cancel.clone())) {
        error!("failed to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    match runtime.block_on(bootstrap::run(config, cancel, &log_handle)) {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("startup failed: {e}");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
