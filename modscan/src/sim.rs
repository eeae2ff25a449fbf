//! In-memory simulated device.
//!
//! Serves scripted per-address behaviour through the [`Transport`] trait and
//! records every request it receives. Used by demo mode and by tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::decode::f32_to_registers;
use crate::request::{ReadRequest, ReadResponse, RegisterType};
use crate::transport::{Transport, TransportError};

/// How the device answers a read at one address.
#[derive(Debug, Clone, PartialEq)]
pub enum PointBehavior {
    /// Registers holding a big-endian `f32`, padded or cut to the requested quantity.
    Float(f32),
    /// Raw registers, returned as-is regardless of the requested quantity.
    Words(Vec<u16>),
    Bit(bool),
    /// Never answers.
    Silent,
    /// Answers with a Modbus exception.
    Exception(String),
    /// The connection drops mid-request.
    ConnectionReset,
}

#[derive(Debug, Default)]
struct CallLogInner {
    requests: Vec<ReadRequest>,
    resets: usize,
    disconnects: usize,
}

/// Shared record of the traffic a [`SimulatedDevice`] has seen.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<CallLogInner>>,
}

impl CallLog {
    pub fn requests(&self) -> Vec<ReadRequest> {
        self.lock().requests.clone()
    }

    /// Start addresses of all requests, in arrival order.
    pub fn addresses(&self) -> Vec<u16> {
        self.lock().requests.iter().map(|r| r.address).collect()
    }

    /// Number of times the connection was reset after an abandoned request.
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    fn record(&self, request: ReadRequest) {
        self.lock().requests.push(request);
    }

    fn record_reset(&self) {
        self.lock().resets += 1;
    }

    fn record_disconnect(&self) {
        self.lock().disconnects += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallLogInner> {
        // A poisoned log still holds valid data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Scripted Modbus device.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    default: Option<PointBehavior>,
    points: HashMap<(RegisterType, u16), PointBehavior>,
    refuse_reconnect: bool,
    log: CallLog,
}

impl SimulatedDevice {
    /// A device with no points; every read answers `IllegalDataAddress`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaviour for addresses without their own entry.
    #[must_use]
    pub fn with_default(mut self, behavior: PointBehavior) -> Self {
        self.default = Some(behavior);
        self
    }

    #[must_use]
    pub fn with_point(mut self, kind: RegisterType, address: u16, behavior: PointBehavior) -> Self {
        self.points.insert((kind, address), behavior);
        self
    }

    #[must_use]
    pub fn with_holding(self, address: u16, behavior: PointBehavior) -> Self {
        self.with_point(RegisterType::Holding, address, behavior)
    }

    /// Make every reset fail, as if the device stopped accepting connections.
    #[must_use]
    pub fn with_refused_reconnect(mut self) -> Self {
        self.refuse_reconnect = true;
        self
    }

    /// Handle to the request log; stays valid after the device is moved into a client.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn behavior(&self, request: &ReadRequest) -> Option<PointBehavior> {
        self.points
            .get(&(request.kind, request.address))
            .or(self.default.as_ref())
            .cloned()
    }
}

fn payload(behavior: &PointBehavior, request: &ReadRequest) -> ReadResponse {
    let quantity = usize::from(request.quantity);

    if request.kind.is_word() {
        let mut words = match behavior {
            PointBehavior::Float(value) => f32_to_registers(*value).to_vec(),
            PointBehavior::Words(words) => return ReadResponse::Registers(words.clone()),
            PointBehavior::Bit(bit) => vec![u16::from(*bit)],
            _ => Vec::new(),
        };
        words.resize(quantity, 0);
        ReadResponse::Registers(words)
    } else {
        let bit = match behavior {
            PointBehavior::Bit(bit) => *bit,
            PointBehavior::Float(value) => *value != 0.0,
            PointBehavior::Words(words) => words.first().is_some_and(|w| *w != 0),
            _ => false,
        };
        ReadResponse::Bits(vec![bit; quantity])
    }
}

impl Transport for SimulatedDevice {
    async fn call(&mut self, request: ReadRequest) -> Result<ReadResponse, TransportError> {
        self.log.record(request);

        match self.behavior(&request) {
            None => Err(TransportError::Exception("IllegalDataAddress".to_string())),
            Some(PointBehavior::Silent) => std::future::pending().await,
            Some(PointBehavior::Exception(code)) => Err(TransportError::Exception(code)),
            Some(PointBehavior::ConnectionReset) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))),
            Some(behavior) => Ok(payload(&behavior, &request)),
        }
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.log.record_reset();
        if self.refuse_reconnect {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.log.record_disconnect();
        Ok(())
    }
}
