//! Protocol client: one connection to one device.
//!
//! Every read validates its request, submits it to the transport, waits for
//! the response up to a bound, and decodes the payload. Calls are serialized
//! through a single-flight gate, so a client can be shared between tasks.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, debug, info, warn};

use crate::decode::{DecodeError, decode_response};
use crate::error::ClientError;
use crate::request::{DecodedValue, Endpoint, ReadRequest};
use crate::transport::{TcpTransport, Transport};

/// Request timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Overrides the client's request timeout.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Client bound to a single device endpoint.
pub struct ProtocolClient<T = TcpTransport> {
    endpoint: Endpoint,
    request_timeout: Duration,
    /// `None` once released.
    transport: Mutex<Option<T>>,
    dispatch: Dispatch,
}

impl ProtocolClient<TcpTransport> {
    /// Connect to a Modbus TCP device.
    ///
    /// Fails with [`ClientError::Connection`] when the endpoint cannot be
    /// reached within its connect timeout.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, ClientError> {
        let transport = TcpTransport::connect(&endpoint).await?;
        let client = Self::with_transport(endpoint, transport);
        client.emit(|| info!(endpoint = %client.endpoint, "Connected to device"));
        Ok(client)
    }
}

impl<T: Transport> ProtocolClient<T> {
    /// Wrap an already established transport.
    pub fn with_transport(endpoint: Endpoint, transport: T) -> Self {
        Self {
            endpoint,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transport: Mutex::new(Some(transport)),
            dispatch: tracing::dispatcher::get_default(Dispatch::clone),
        }
    }

    /// Set the timeout applied to every read without its own override.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Route this client's log events to `dispatch`.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Read holding registers at `address` and decode them as an `f32`.
    pub async fn read_holding_register(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
    ) -> Result<f32, ClientError> {
        self.read_holding_register_with(address, quantity, unit_id, &ReadOptions::default())
            .await
    }

    pub async fn read_holding_register_with(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
        options: &ReadOptions,
    ) -> Result<f32, ClientError> {
        let request = ReadRequest::holding_registers(address, quantity, unit_id);
        self.read_f32(request, options).await
    }

    /// Read input registers at `address` and decode them as an `f32`.
    pub async fn read_input_register(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
    ) -> Result<f32, ClientError> {
        self.read_input_register_with(address, quantity, unit_id, &ReadOptions::default())
            .await
    }

    pub async fn read_input_register_with(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
        options: &ReadOptions,
    ) -> Result<f32, ClientError> {
        let request = ReadRequest::input_registers(address, quantity, unit_id);
        self.read_f32(request, options).await
    }

    /// Read the coil status at `address`.
    pub async fn read_coils(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
    ) -> Result<bool, ClientError> {
        self.read_coils_with(address, quantity, unit_id, &ReadOptions::default())
            .await
    }

    pub async fn read_coils_with(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
        options: &ReadOptions,
    ) -> Result<bool, ClientError> {
        let request = ReadRequest::coils(address, quantity, unit_id);
        self.read_bool(request, options).await
    }

    /// Read the discrete input status at `address`.
    pub async fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
    ) -> Result<bool, ClientError> {
        self.read_discrete_inputs_with(address, quantity, unit_id, &ReadOptions::default())
            .await
    }

    pub async fn read_discrete_inputs_with(
        &self,
        address: u16,
        quantity: u16,
        unit_id: u8,
        options: &ReadOptions,
    ) -> Result<bool, ClientError> {
        let request = ReadRequest::discrete_inputs(address, quantity, unit_id);
        self.read_bool(request, options).await
    }

    /// Perform one read and decode its payload.
    pub async fn read(
        &self,
        request: ReadRequest,
        options: &ReadOptions,
    ) -> Result<DecodedValue, ClientError> {
        request.validate()?;
        let limit = options.timeout.unwrap_or(self.request_timeout);

        let cancel = options.cancel.as_ref();
        let mut gate = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                self.emit(|| debug!(address = request.address, "Read cancelled while queued"));
                return Err(ClientError::Cancelled);
            }
            gate = self.transport.lock() => gate,
        };
        let transport = gate.as_mut().ok_or(ClientError::NotConnected)?;

        let started = Instant::now();
        let completed = tokio::select! {
            biased;
            _ = cancelled(cancel) => None,
            completed = tokio::time::timeout(limit, transport.call(request)) => Some(completed),
        };

        // Abandoned requests leave the connection out of step; reset it
        // before the gate opens for the next caller.
        let response = match completed {
            None => {
                self.recover(&mut gate).await;
                self.emit(|| debug!(address = request.address, "Read cancelled"));
                return Err(ClientError::Cancelled);
            }
            Some(Err(_)) => {
                let elapsed = started.elapsed();
                self.emit(|| {
                    warn!(
                        kind = %request.kind,
                        address = request.address,
                        unit_id = request.unit_id,
                        ?elapsed,
                        "Read timed out"
                    )
                });
                self.recover(&mut gate).await;
                return Err(ClientError::RequestTimeout {
                    address: request.address,
                    unit_id: request.unit_id,
                    elapsed,
                });
            }
            Some(Ok(Err(e))) => {
                self.emit(|| {
                    warn!(
                        kind = %request.kind,
                        address = request.address,
                        unit_id = request.unit_id,
                        error = %e,
                        "Read failed"
                    )
                });
                if e.is_connection_lost() {
                    self.recover(&mut gate).await;
                }
                return Err(e.into());
            }
            Some(Ok(Ok(response))) => response,
        };
        drop(gate);

        let value = decode_response(request.kind, response).inspect_err(|e| {
            self.emit(|| {
                warn!(
                    kind = %request.kind,
                    address = request.address,
                    unit_id = request.unit_id,
                    error = %e,
                    "Response could not be decoded"
                )
            })
        })?;
        self.emit(|| {
            debug!(
                kind = %request.kind,
                address = request.address,
                unit_id = request.unit_id,
                ?value,
                "Read completed"
            )
        });
        Ok(value)
    }

    /// Tear down the connection.
    ///
    /// Safe to call repeatedly; reads issued afterwards fail with
    /// [`ClientError::NotConnected`].
    pub async fn release(&self) {
        let Some(mut transport) = self.transport.lock().await.take() else {
            return;
        };

        match transport.disconnect().await {
            Ok(()) => self.emit(|| info!(endpoint = %self.endpoint, "Connection released")),
            Err(e) => self.emit(|| {
                warn!(
                    endpoint = %self.endpoint,
                    error = %e,
                    "Disconnect failed, connection dropped"
                )
            }),
        }
    }

    /// Reset the transport behind `gate`, dropping it if that fails.
    async fn recover(&self, gate: &mut Option<T>) {
        let Some(transport) = gate.as_mut() else {
            return;
        };

        match transport.reset().await {
            Ok(()) => self.emit(|| debug!(endpoint = %self.endpoint, "Connection reset")),
            Err(e) => {
                self.emit(|| {
                    warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        "Connection could not be re-established"
                    )
                });
                *gate = None;
            }
        }
    }

    async fn read_f32(
        &self,
        request: ReadRequest,
        options: &ReadOptions,
    ) -> Result<f32, ClientError> {
        let value = self.read(request, options).await?;
        value.as_f32().ok_or_else(|| {
            DecodeError::UnexpectedPayload {
                kind: request.kind,
                expected: "registers",
                actual: "bits",
            }
            .into()
        })
    }

    async fn read_bool(
        &self,
        request: ReadRequest,
        options: &ReadOptions,
    ) -> Result<bool, ClientError> {
        let value = self.read(request, options).await?;
        value.as_bool().ok_or_else(|| {
            DecodeError::UnexpectedPayload {
                kind: request.kind,
                expected: "bits",
                actual: "registers",
            }
            .into()
        })
    }

    fn emit(&self, event: impl FnOnce()) {
        tracing::dispatcher::with_default(&self.dispatch, event);
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RegisterType;
    use crate::sim::{PointBehavior, SimulatedDevice};
    use std::sync::Arc;

    fn client(device: SimulatedDevice) -> ProtocolClient<SimulatedDevice> {
        ProtocolClient::with_transport(Endpoint::new("127.0.0.1", 502), device)
    }

    #[tokio::test]
    async fn test_read_holding_register() {
        let device = SimulatedDevice::new().with_holding(10, PointBehavior::Float(23.5));
        let log = device.log();
        let client = client(device);

        let value = client.read_holding_register(10, 2, 1).await.unwrap();
        assert_eq!(value, 23.5);
        assert_eq!(
            log.requests(),
            vec![ReadRequest::holding_registers(10, 2, 1)]
        );
    }

    #[tokio::test]
    async fn test_read_input_register() {
        let device =
            SimulatedDevice::new().with_point(RegisterType::Input, 4, PointBehavior::Float(-7.25));
        let client = client(device);

        assert_eq!(client.read_input_register(4, 2, 3).await.unwrap(), -7.25);
    }

    #[tokio::test]
    async fn test_read_coils_and_discrete_inputs() {
        let device = SimulatedDevice::new()
            .with_point(RegisterType::Coil, 0, PointBehavior::Bit(true))
            .with_point(RegisterType::Discrete, 0, PointBehavior::Bit(false));
        let client = client(device);

        assert!(client.read_coils(0, 1, 1).await.unwrap());
        assert!(!client.read_discrete_inputs(0, 8, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_generic_read_returns_decoded_value() {
        let device =
            SimulatedDevice::new().with_point(RegisterType::Coil, 3, PointBehavior::Bit(true));
        let client = client(device);

        let value = client
            .read(ReadRequest::coils(3, 1, 1), &ReadOptions::new())
            .await
            .unwrap();
        assert_eq!(value, DecodedValue::Bool(true));
    }

    #[tokio::test]
    async fn test_invalid_quantity_is_rejected_before_sending() {
        let device = SimulatedDevice::new().with_default(PointBehavior::Float(1.0));
        let log = device.log();
        let client = client(device);

        let err = client.read_holding_register(0, 0, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = client.read_coils(0, 2001, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        assert!(log.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_holding_read_times_out_after_default_bound() {
        let device = SimulatedDevice::new().with_holding(4, PointBehavior::Silent);
        let client = client(device);

        let err = client.read_holding_register(4, 2, 1).await.unwrap_err();
        match err {
            ClientError::RequestTimeout {
                address,
                unit_id,
                elapsed,
            } => {
                assert_eq!(address, 4);
                assert_eq!(unit_id, 1);
                assert!(elapsed >= DEFAULT_REQUEST_TIMEOUT);
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_read_kind_is_bounded() {
        let device = SimulatedDevice::new().with_default(PointBehavior::Silent);
        let client = client(device).with_request_timeout(Duration::from_secs(2));

        let input = client.read_input_register(0, 2, 1).await.unwrap_err();
        assert!(matches!(input, ClientError::RequestTimeout { .. }));

        let coils = client.read_coils(0, 1, 1).await.unwrap_err();
        assert!(matches!(coils, ClientError::RequestTimeout { .. }));

        let discrete = client.read_discrete_inputs(0, 1, 1).await.unwrap_err();
        assert!(matches!(discrete, ClientError::RequestTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout_override() {
        let device = SimulatedDevice::new().with_default(PointBehavior::Silent);
        let client = client(device);

        let started = Instant::now();
        let options = ReadOptions::new().with_timeout(Duration::from_millis(500));
        let err = client
            .read_holding_register_with(0, 2, 1, &options)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::RequestTimeout { .. }));
        assert!(started.elapsed() < DEFAULT_REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_transport_exception_is_surfaced() {
        let device = SimulatedDevice::new()
            .with_holding(0, PointBehavior::Exception("IllegalDataAddress".to_string()));
        let client = client(device);

        let err = client.read_holding_register(0, 2, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(err.to_string().contains("IllegalDataAddress"));
    }

    #[tokio::test]
    async fn test_short_payload_is_decode_error() {
        let device = SimulatedDevice::new().with_holding(0, PointBehavior::Float(23.5));
        let client = client(device);

        // A single register carries only two bytes.
        let err = client.read_holding_register(0, 1, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Decode(DecodeError::TooShort {
                needed: 4,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let device = SimulatedDevice::new().with_default(PointBehavior::Float(1.0));
        let log = device.log();
        let client = client(device);

        assert!(client.is_connected().await);
        client.release().await;
        client.release().await;

        assert!(!client.is_connected().await);
        assert_eq!(log.disconnects(), 1);

        let err = client.read_holding_register(0, 2, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(err.is_connection_fault());
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let device = SimulatedDevice::new().with_default(PointBehavior::Silent);
        let client = client(device);

        let token = CancellationToken::new();
        token.cancel();
        let options = ReadOptions::new().with_cancel(token);

        let err = client
            .read_holding_register_with(0, 2, 1, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_read_resets_connection() {
        let device = SimulatedDevice::new()
            .with_holding(0, PointBehavior::Silent)
            .with_holding(2, PointBehavior::Float(23.5));
        let log = device.log();
        let client = client(device).with_request_timeout(Duration::from_secs(1));

        let err = client.read_holding_register(0, 2, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout { .. }));
        assert_eq!(log.resets(), 1);

        assert_eq!(client.read_holding_register(2, 2, 1).await.unwrap(), 23.5);
        assert_eq!(log.resets(), 1);
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_lost_connection_is_reset() {
        let device = SimulatedDevice::new()
            .with_holding(0, PointBehavior::ConnectionReset)
            .with_holding(2, PointBehavior::Exception("IllegalDataValue".to_string()));
        let log = device.log();
        let client = client(device);

        let err = client.read_holding_register(0, 2, 1).await.unwrap_err();
        assert!(err.is_connection_fault());
        assert_eq!(log.resets(), 1);

        // An exception leaves the connection in step.
        client.read_holding_register(2, 2, 1).await.unwrap_err();
        assert_eq!(log.resets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reset_drops_connection() {
        let device = SimulatedDevice::new()
            .with_default(PointBehavior::Silent)
            .with_refused_reconnect();
        let log = device.log();
        let client = client(device).with_request_timeout(Duration::from_secs(1));

        let err = client.read_holding_register(0, 2, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout { .. }));
        assert!(!client.is_connected().await);

        let err = client.read_holding_register(2, 2, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert_eq!(log.requests().len(), 1);

        // Nothing left to disconnect.
        client.release().await;
        assert_eq!(log.disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_read_does_not_wait_for_gate() {
        let device = SimulatedDevice::new().with_default(PointBehavior::Silent);
        let log = device.log();
        let client = Arc::new(client(device));

        let busy = client.clone();
        let holder = tokio::spawn(async move { busy.read_holding_register(0, 2, 1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(log.requests().len(), 1);

        let token = CancellationToken::new();
        token.cancel();
        let options = ReadOptions::new().with_cancel(token);

        let started = Instant::now();
        let err = client
            .read_holding_register_with(2, 2, 1, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(log.requests().len(), 1);

        let held = holder.await.unwrap().unwrap_err();
        assert!(matches!(held, ClientError::RequestTimeout { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_reads_are_serialized() {
        let device = SimulatedDevice::new().with_default(PointBehavior::Float(42.0));
        let log = device.log();
        let client = Arc::new(client(device));

        let mut handles = Vec::new();
        for address in (0..20u16).step_by(2) {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.read_holding_register(address, 2, 1).await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42.0);
        }
        assert_eq!(log.requests().len(), 10);
    }
}
