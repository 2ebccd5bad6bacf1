// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Background subsystem failure monitor.
//!
//! Long-running subsystems (the supervised switch, the endpoint listener)
//! report a fatal failure at most once over a oneshot channel. Attaching a
//! monitor first drains an already-fired signal synchronously, so a
//! subsystem that died between spawn and attach fails the current bootstrap
//! phase instead of poisoning a later one. After that a waiter task turns
//! any future failure into a process-wide cancellation.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub struct FailureMonitor;

impl FailureMonitor {
    /// Watch a subsystem's failure channel.
    ///
    /// Returns the error immediately when the subsystem has already failed;
    /// otherwise a background waiter logs the failure and cancels the token
    /// when it arrives. A sender dropped without a value means the
    /// subsystem ended cleanly.
    pub fn attach<E>(
        subsystem: &'static str,
        mut failure: oneshot::Receiver<E>,
        cancel: &CancellationToken,
    ) -> Result<(), E>
    where
        E: std::fmt::Display + Send + 'static,
    {
        match failure.try_recv() {
            Ok(error) => return Err(error),
            Err(oneshot::error::TryRecvError::Closed) => {
                debug!(subsystem, "subsystem ended before the monitor attached");
                return Ok(());
            }
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match failure.await {
                Ok(error) => {
                    error!(subsystem, "subsystem failed: {error}");
                    cancel.cancel();
                }
                Err(_) => debug!(subsystem, "subsystem ended cleanly"),
            }
        });
        Ok(())
    }
}
