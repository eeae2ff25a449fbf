//! Error types for reads and scans.

use std::time::Duration;

use thiserror::Error;

use crate::decode::DecodeError;
use crate::transport::TransportError;

/// Errors returned by `ProtocolClient` operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection could not be established.
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The client was released or never connected.
    #[error("Client is not connected")]
    NotConnected,

    /// Malformed request parameters.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No response within the request bound.
    #[error("Request timed out after {elapsed:?} (address {address}, unit {unit_id})")]
    RequestTimeout {
        address: u16,
        unit_id: u8,
        elapsed: Duration,
    },

    /// Fault reported by the transport for an in-flight request.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Response payload could not be interpreted.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The caller cancelled the operation.
    #[error("Request cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether further reads on the same connection cannot succeed.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            ClientError::Connection { .. } | ClientError::NotConnected => true,
            ClientError::Transport(e) => e.is_connection_lost(),
            _ => false,
        }
    }

    /// Whether repeating the same read may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::RequestTimeout { .. } => true,
            ClientError::Transport(e) => !e.is_connection_lost(),
            _ => false,
        }
    }
}

/// Scan-level failure.
///
/// The message carries the triggering error and the bounds of the scan.
#[derive(Debug, Error)]
#[error("Scan of unit {unit_id} failed: {source}, start = {start}, end = {end}.")]
pub struct ScanError {
    pub start: u16,
    pub end: u16,
    pub unit_id: u8,
    /// Address being read when the scan stopped, if any.
    pub address: Option<u16>,
    #[source]
    pub source: ClientError,
}
