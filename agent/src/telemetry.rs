// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Telemetry endpoint.
//!
//! Installs the process-wide Prometheus recorder and serves `/metrics` on
//! the configured address. Only started when a metrics address is
//! configured; the rest of the agent records metrics unconditionally and
//! they simply vanish when no recorder is installed.

use axum::Router;
use axum::response::Response;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::future::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to install metrics recorder: {0}")]
    Recorder(String),
    #[error("failed to bind telemetry address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

async fn metrics_handler(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> Response<String> {
    Response::builder()
        .header("Content-Type", "text/plain; version=1.0.0; charset=utf-8")
        .body(handle.render())
        .unwrap_or_default()
}

/// Install the recorder and serve `/metrics` until cancellation.
///
/// Returns the bound address; binding happens before the server task is
/// spawned so configuration mistakes fail the bootstrap phase.
pub fn start(addr: SocketAddr, cancel: &CancellationToken) -> Result<SocketAddr, TelemetryError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Recorder(e.to_string()))?;

    let listener = std::net::TcpListener::bind(addr)
        .map_err(|source| TelemetryError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| TelemetryError::Bind { addr, source })?;
    let bound = listener
        .local_addr()
        .map_err(|source| TelemetryError::Bind { addr, source })?;

    let upkeep_handle = handle.clone();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            // the usual scrape interval is 15-60s, upkeep at 30s keeps the
            // recorder's histograms bounded
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                upkeep_handle.run_upkeep();
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle);
    let server =
        axum_server::from_tcp(listener).map_err(|source| TelemetryError::Bind { addr, source })?;
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let server = server.serve(app.into_make_service());
        if let Some(Err(e)) = server.with_cancellation_token(&cancel).await {
            error!("telemetry server failed: {e}");
            cancel.cancel();
        }
    });
    info!(%bound, "telemetry endpoint listening");
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_metrics_endpoint_serves() {
        let cancel = CancellationToken::new();
        let bound = start("127.0.0.1:0".parse().unwrap(), &cancel).unwrap();

        metrics::counter!("telemetry_test_total").increment(1);

        let mut stream = tokio::net::TcpStream::connect(bound).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.0\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.contains("200 OK"));
        assert!(response.contains("telemetry_test_total"));

        cancel.cancel();
    }
}
