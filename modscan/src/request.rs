//! Request and response types exchanged with a device.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Connect timeout used when an [`Endpoint`] does not set one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum registers per read request (Modbus PDU limit).
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum coils or discrete inputs per read request (Modbus PDU limit).
pub const MAX_READ_BITS: u16 = 2000;

/// Remote device address plus connect timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Bound on establishing the TCP connection.
    pub timeout: Duration,
}

impl Endpoint {
    /// Create an endpoint with the default connect timeout.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Modbus data categories covered by the read operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    /// Discrete output coils (read/write, 1-bit)
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    Discrete,
    /// Input registers (read-only, 16-bit)
    Input,
    /// Holding registers (read/write, 16-bit)
    Holding,
}

impl RegisterType {
    /// Return the string name for this register type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Input => "input",
            RegisterType::Holding => "holding",
        }
    }

    /// Whether reads of this type return 16-bit words rather than bits.
    pub fn is_word(&self) -> bool {
        matches!(self, RegisterType::Input | RegisterType::Holding)
    }

    /// Largest quantity a single request of this type may ask for.
    pub fn max_quantity(&self) -> u16 {
        if self.is_word() {
            MAX_READ_REGISTERS
        } else {
            MAX_READ_BITS
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single read request addressed to one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub kind: RegisterType,
    /// Starting address (0-based)
    pub address: u16,
    pub quantity: u16,
    /// Modbus unit/slave ID
    pub unit_id: u8,
}

impl ReadRequest {
    pub fn holding_registers(address: u16, quantity: u16, unit_id: u8) -> Self {
        Self::new(RegisterType::Holding, address, quantity, unit_id)
    }

    pub fn input_registers(address: u16, quantity: u16, unit_id: u8) -> Self {
        Self::new(RegisterType::Input, address, quantity, unit_id)
    }

    pub fn coils(address: u16, quantity: u16, unit_id: u8) -> Self {
        Self::new(RegisterType::Coil, address, quantity, unit_id)
    }

    pub fn discrete_inputs(address: u16, quantity: u16, unit_id: u8) -> Self {
        Self::new(RegisterType::Discrete, address, quantity, unit_id)
    }

    fn new(kind: RegisterType, address: u16, quantity: u16, unit_id: u8) -> Self {
        Self {
            kind,
            address,
            quantity,
            unit_id,
        }
    }

    /// Check quantity bounds and that the range fits the 16-bit address space.
    pub fn validate(&self) -> Result<(), ClientError> {
        let max = self.kind.max_quantity();
        if self.quantity == 0 || self.quantity > max {
            return Err(ClientError::InvalidArgument(format!(
                "{} quantity must be between 1 and {}, got {}",
                self.kind, max, self.quantity
            )));
        }

        let last = u32::from(self.address) + u32::from(self.quantity) - 1;
        if last > u32::from(u16::MAX) {
            return Err(ClientError::InvalidArgument(format!(
                "{} range {}+{} exceeds the address space",
                self.kind, self.address, self.quantity
            )));
        }

        Ok(())
    }
}

/// Raw payload of a completed read.
///
/// Owned by the read operation that produced it and consumed by decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResponse {
    Registers(Vec<u16>),
    Bits(Vec<bool>),
}

impl ReadResponse {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ReadResponse::Registers(_) => "registers",
            ReadResponse::Bits(_) => "bits",
        }
    }
}

/// A decoded point value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Float(f32),
    Bool(bool),
}

impl DecodedValue {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            DecodedValue::Float(v) => Some(*v),
            DecodedValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DecodedValue::Bool(b) => Some(*b),
            DecodedValue::Float(_) => None,
        }
    }
}
