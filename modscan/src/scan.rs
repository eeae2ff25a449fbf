//! Address-range scanning.
//!
//! A scan walks `start..=end` in ascending steps of `stride`, reads each
//! address as a holding-register `f32`, and collects the results into an
//! address-keyed map. Non-finite values (±infinity, NaN) are recorded as
//! `None` and the scan continues. Read errors are handled per [`ScanPolicy`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, debug, error, warn};

use crate::client::{ProtocolClient, ReadOptions};
use crate::error::{ClientError, ScanError};
use crate::transport::{TcpTransport, Transport};

/// Addresses advanced per step; one `f32` spans two registers.
pub const DEFAULT_STRIDE: u16 = 2;

/// How a scan treats read errors at individual addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPolicy {
    /// Any read error fails the whole scan.
    #[default]
    AbortOnError,
    /// Read errors are recorded as `None`; only connection faults,
    /// cancellation and invalid arguments fail the scan.
    IsolateErrors,
}

/// Values collected by one successful scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub unit_id: u8,
    pub start: u16,
    pub end: u16,
    /// `None` marks an address that was read but produced no usable value.
    pub points: BTreeMap<u16, Option<f32>>,
}

impl ScanResult {
    /// `Some(None)` when the address was scanned without a usable value,
    /// `None` when it was not part of the scan.
    pub fn get(&self, address: u16) -> Option<Option<f32>> {
        self.points.get(&address).copied()
    }

    /// Addresses recorded without a value.
    pub fn absent(&self) -> impl Iterator<Item = u16> + '_ {
        self.points
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(address, _)| *address)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Outcome of one scan.
pub type ScanOutcome = Result<ScanResult, ScanError>;

/// Sweeps address ranges through a shared [`ProtocolClient`].
///
/// Each call to [`run`](Self::run) is independent; no state is kept between
/// scans.
pub struct ScanController<T = TcpTransport> {
    client: Arc<ProtocolClient<T>>,
    stride: u16,
    policy: ScanPolicy,
    retries: u32,
    request_timeout: Option<Duration>,
    dispatch: Dispatch,
}

impl<T: Transport> ScanController<T> {
    pub fn new(client: Arc<ProtocolClient<T>>) -> Self {
        Self {
            client,
            stride: DEFAULT_STRIDE,
            policy: ScanPolicy::default(),
            retries: 0,
            request_timeout: None,
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Set the address step. Zero is treated as one.
    #[must_use]
    pub fn with_stride(mut self, stride: u16) -> Self {
        self.stride = stride.max(1);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ScanPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Extra attempts for reads that time out or fail in transport.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Override the client's request timeout for reads issued by scans.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Route this controller's log events to `dispatch`.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn client(&self) -> &Arc<ProtocolClient<T>> {
        &self.client
    }

    /// Scan `start..=end`, reading `quantity` registers per address.
    pub async fn run(&self, start: u16, end: u16, quantity: u16, unit_id: u8) -> ScanOutcome {
        self.scan(start, end, quantity, unit_id, None).await
    }

    /// Like [`run`](Self::run), stopping with a failure once `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        start: u16,
        end: u16,
        quantity: u16,
        unit_id: u8,
        cancel: &CancellationToken,
    ) -> ScanOutcome {
        self.scan(start, end, quantity, unit_id, Some(cancel)).await
    }

    async fn scan(
        &self,
        start: u16,
        end: u16,
        quantity: u16,
        unit_id: u8,
        cancel: Option<&CancellationToken>,
    ) -> ScanOutcome {
        let fail = |address: Option<u16>, source: ClientError| {
            let err = ScanError {
                start,
                end,
                unit_id,
                address,
                source,
            };
            self.emit(|| error!(unit_id, ?address, "Failed to collect scan data: {}", err));
            err
        };

        if start > end {
            return Err(fail(
                None,
                ClientError::InvalidArgument(format!(
                    "start {} is greater than end {}",
                    start, end
                )),
            ));
        }

        let options = ReadOptions {
            timeout: self.request_timeout,
            cancel: cancel.cloned(),
        };
        let mut points = BTreeMap::new();

        self.emit(|| debug!(unit_id, start, end, stride = self.stride, "Scan started"));

        for address in addresses(start, end, self.stride) {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(fail(Some(address), ClientError::Cancelled));
            }

            match self.read_point(address, quantity, unit_id, &options).await {
                Ok(value) if value.is_finite() => {
                    points.insert(address, Some(value));
                }
                Ok(value) => {
                    self.emit(|| {
                        warn!(address, %value, "Point conversion failed, recording no value")
                    });
                    points.insert(address, None);
                }
                Err(e) if !self.is_fatal(&e) => {
                    self.emit(|| {
                        warn!(address, error = %e, "Point read failed, recording no value")
                    });
                    points.insert(address, None);
                }
                Err(e) => return Err(fail(Some(address), e)),
            }
        }

        self.emit(|| debug!(unit_id, start, end, points = points.len(), "Scan completed"));

        Ok(ScanResult {
            unit_id,
            start,
            end,
            points,
        })
    }

    async fn read_point(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
        options: &ReadOptions,
    ) -> Result<f32, ClientError> {
        let mut attempt = 0;
        loop {
            match self
                .client
                .read_holding_register_with(address, quantity, unit_id, options)
                .await
            {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    self.emit(|| debug!(address, attempt, error = %e, "Retrying read"));
                }
                result => return result,
            }
        }
    }

    fn is_fatal(&self, err: &ClientError) -> bool {
        match self.policy {
            ScanPolicy::AbortOnError => true,
            ScanPolicy::IsolateErrors => {
                err.is_connection_fault()
                    || matches!(
                        err,
                        ClientError::Cancelled | ClientError::InvalidArgument(_)
                    )
            }
        }
    }

    fn emit(&self, event: impl FnOnce()) {
        tracing::dispatcher::with_default(&self.dispatch, event);
    }
}

/// Ascending addresses from `start` to `end` inclusive, `stride` apart.
fn addresses(start: u16, end: u16, stride: u16) -> impl Iterator<Item = u16> {
    (u32::from(start)..=u32::from(end))
        .step_by(usize::from(stride.max(1)))
        .filter_map(|address| u16::try_from(address).ok())
}
