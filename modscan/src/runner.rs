//! Scan loop lifecycle.
//!
//! Runs the configured scan on an interval over one connection until the
//! iteration limit, a shutdown request, or a connection fault. A loop can be
//! resumed on a fresh connection after a fault; completed iterations carry
//! over.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::ProtocolClient;
use crate::config::ScannerConfig;
use crate::error::{ClientError, ScanError};
use crate::scan::{ScanController, ScanResult};
use crate::transport::Transport;

/// Why [`ScanLoop::run`] returned.
#[derive(Debug)]
pub enum LoopExit {
    /// The iteration limit was reached.
    Finished,
    /// The shutdown token was cancelled.
    Shutdown,
    /// The connection failed; the client has been released.
    ConnectionLost(ScanError),
}

/// Interval-driven scan loop.
pub struct ScanLoop {
    config: ScannerConfig,
    iterations: Option<u32>,
    completed: u32,
    shutdown: CancellationToken,
}

impl ScanLoop {
    pub fn new(config: ScannerConfig, shutdown: CancellationToken) -> Self {
        Self {
            iterations: config.scan.iterations,
            config,
            completed: 0,
            shutdown,
        }
    }

    /// Override the configured iteration limit; `None` runs until shutdown.
    #[must_use]
    pub fn with_iterations(mut self, iterations: Option<u32>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Scans finished so far, including failed ones.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    fn is_finished(&self) -> bool {
        self.iterations.is_some_and(|limit| self.completed >= limit)
    }

    /// Scan over `client` until the loop finishes, shuts down, or loses the
    /// connection. The client is released on every exit.
    ///
    /// Scan failures other than connection faults are logged by the
    /// controller and the loop continues.
    pub async fn run<T, F>(&mut self, client: ProtocolClient<T>, mut on_result: F) -> LoopExit
    where
        T: Transport,
        F: FnMut(&ScanResult),
    {
        let client = Arc::new(client.with_request_timeout(self.config.device.request_timeout()));
        let controller = ScanController::new(client.clone())
            .with_stride(self.config.scan.stride)
            .with_policy(self.config.scan.policy)
            .with_retries(self.config.scan.retries);

        let mut ticker = tokio::time::interval(self.config.scan.interval());

        let exit = loop {
            if self.is_finished() {
                break LoopExit::Finished;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break LoopExit::Shutdown,
                _ = ticker.tick() => {}
            }

            let outcome = controller
                .run_with_cancel(
                    self.config.scan.start,
                    self.config.scan.end,
                    self.config.scan.quantity,
                    self.config.device.unit_id,
                    &self.shutdown,
                )
                .await;

            match outcome {
                Ok(result) => on_result(&result),
                Err(e) if matches!(e.source, ClientError::Cancelled) => break LoopExit::Shutdown,
                Err(e) if e.source.is_connection_fault() => break LoopExit::ConnectionLost(e),
                Err(_) => {}
            }
            self.completed += 1;
        };

        client.release().await;
        info!(completed = self.completed, "Scan loop stopped");
        exit
    }
}
