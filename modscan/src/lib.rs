//! Modbus register scanner.
//!
//! Polls a remote controller over Modbus TCP, decodes register and coil
//! values, and sweeps address ranges into a single address-to-value map.
//!
//! # Components
//!
//! - [`client::ProtocolClient`] - one connection to one device, four
//!   timeout-bounded read operations
//! - [`scan::ScanController`] - walks an address range with a stride and
//!   isolates non-finite points
//! - [`runner::ScanLoop`] - repeats the configured scan on an interval and
//!   reports connection loss so the caller can reconnect
//! - [`transport::Transport`] - the request/response boundary, implemented
//!   over `tokio-modbus` ([`transport::TcpTransport`]) and in memory
//!   ([`sim::SimulatedDevice`])
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use modscan::{Endpoint, ProtocolClient, ScanController};
//!
//! let client = Arc::new(ProtocolClient::connect(Endpoint::new("127.0.0.1", 502)).await?);
//! let controller = ScanController::new(client.clone());
//!
//! match controller.run(0, 10, 2, 1).await {
//!     Ok(result) => println!("{:?}", result.points),
//!     Err(e) => eprintln!("{}", e),
//! }
//!
//! client.release().await;
//! ```

pub mod client;
pub mod config;
pub mod decode;
pub mod error;
pub mod request;
pub mod runner;
pub mod scan;
pub mod sim;
pub mod transport;

pub use client::{DEFAULT_REQUEST_TIMEOUT, ProtocolClient, ReadOptions};
pub use decode::DecodeError;
pub use error::{ClientError, ScanError};
pub use request::{
    DEFAULT_CONNECT_TIMEOUT, DecodedValue, Endpoint, ReadRequest, ReadResponse, RegisterType,
};
pub use runner::{LoopExit, ScanLoop};
pub use scan::{ScanController, ScanOutcome, ScanPolicy, ScanResult};
pub use transport::{TcpTransport, Transport, TransportError};
