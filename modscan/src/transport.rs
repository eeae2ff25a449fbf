//! Request/response boundary to a device.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::lookup_host;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::request::{Endpoint, ReadRequest, ReadResponse, RegisterType};

/// Faults reported by a transport for an in-flight request.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Exception: {0}")]
    Exception(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A response did not belong to the request it answered.
    #[error("Response out of step with request: {0}")]
    Desync(String),
}

impl TransportError {
    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            TransportError::Desync(_) => true,
            _ => false,
        }
    }
}

impl From<tokio_modbus::Error> for TransportError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(e) => TransportError::Io(e),
            // Header and function code mismatches: a stale reply was read.
            tokio_modbus::Error::Protocol(e) => TransportError::Desync(e.to_string()),
            #[allow(unreachable_patterns)]
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// Sends typed read requests and yields their raw responses.
///
/// Implementations are driven by one caller at a time; `ProtocolClient`
/// serializes access.
pub trait Transport: Send {
    /// Submit `request` and wait for its response.
    fn call(
        &mut self,
        request: ReadRequest,
    ) -> impl Future<Output = Result<ReadResponse, TransportError>> + Send;

    /// Discard connection state after a request was abandoned or the
    /// connection was lost, so the next call starts from a clean stream.
    ///
    /// An error leaves the transport unusable.
    fn reset(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection.
    fn disconnect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Modbus TCP transport backed by `tokio-modbus`.
///
/// Replies to abandoned requests stay queued in the socket, so
/// [`Transport::reset`] replaces the connection instead of reusing it.
pub struct TcpTransport {
    ctx: Context,
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Connect to `endpoint`, bounded by its connect timeout.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ClientError> {
        let connection_error = |reason: String| ClientError::Connection {
            endpoint: endpoint.to_string(),
            reason,
        };

        let addr = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| connection_error(format!("Invalid address: {}", e)))?
            .next()
            .ok_or_else(|| connection_error("Address resolved to nothing".to_string()))?;

        let ctx = open(addr, endpoint.timeout)
            .await
            .map_err(|e| connection_error(e.to_string()))?;

        debug!(%addr, "Modbus TCP connection established");
        Ok(Self {
            ctx,
            addr,
            connect_timeout: endpoint.timeout,
        })
    }
}

async fn open(addr: SocketAddr, timeout: Duration) -> io::Result<Context> {
    tokio::time::timeout(timeout, tcp::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connection timeout"))?
}

impl Transport for TcpTransport {
    async fn call(&mut self, request: ReadRequest) -> Result<ReadResponse, TransportError> {
        self.ctx.set_slave(Slave(request.unit_id));

        let response = match request.kind {
            RegisterType::Coil => ReadResponse::Bits(
                self.ctx
                    .read_coils(request.address, request.quantity)
                    .await?
                    .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
            ),
            RegisterType::Discrete => ReadResponse::Bits(
                self.ctx
                    .read_discrete_inputs(request.address, request.quantity)
                    .await?
                    .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
            ),
            RegisterType::Input => ReadResponse::Registers(
                self.ctx
                    .read_input_registers(request.address, request.quantity)
                    .await?
                    .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
            ),
            RegisterType::Holding => ReadResponse::Registers(
                self.ctx
                    .read_holding_registers(request.address, request.quantity)
                    .await?
                    .map_err(|e| TransportError::Exception(format!("{:?}", e)))?,
            ),
        };

        Ok(response)
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        if let Err(e) = self.ctx.disconnect().await {
            warn!(addr = %self.addr, error = %e, "Disconnect before reconnect failed");
        }
        self.ctx = open(self.addr, self.connect_timeout).await?;
        debug!(addr = %self.addr, "Modbus TCP connection re-established");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.ctx
            .disconnect()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}
