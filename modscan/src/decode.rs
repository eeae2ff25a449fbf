//! Payload decoding.
//!
//! Register reads are interpreted as one big-endian IEEE-754 `f32` spanning
//! the first two words. Coil and discrete-input reads yield the status of the
//! first requested bit.

use thiserror::Error;

use crate::request::{DecodedValue, ReadResponse, RegisterType};

/// Errors raised while interpreting a response payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("expected {expected} payload for {kind} read, got {actual}")]
    UnexpectedPayload {
        kind: RegisterType,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Decode a response for a request of type `kind`.
///
/// Takes the response by value; the payload is dropped before this returns
/// on both the success and the error path.
pub fn decode_response(
    kind: RegisterType,
    response: ReadResponse,
) -> Result<DecodedValue, DecodeError> {
    match (kind.is_word(), response) {
        (true, ReadResponse::Registers(words)) => {
            registers_to_f32(&words).map(DecodedValue::Float)
        }
        (false, ReadResponse::Bits(bits)) => first_bit(&bits).map(DecodedValue::Bool),
        (is_word, other) => Err(DecodeError::UnexpectedPayload {
            kind,
            expected: if is_word { "registers" } else { "bits" },
            actual: other.kind_name(),
        }),
    }
}

/// Combine the first two registers (high word first) into an `f32`.
pub fn registers_to_f32(words: &[u16]) -> Result<f32, DecodeError> {
    match words {
        [hi, lo, ..] => Ok(f32::from_bits((u32::from(*hi) << 16) | u32::from(*lo))),
        _ => Err(DecodeError::TooShort {
            needed: 4,
            actual: words.len() * 2,
        }),
    }
}

/// Split an `f32` into two registers, high word first.
pub fn f32_to_registers(value: f32) -> [u16; 2] {
    let bits = value.to_bits();
    [(bits >> 16) as u16, (bits & 0xFFFF) as u16]
}

fn first_bit(bits: &[bool]) -> Result<bool, DecodeError> {
    bits.first().copied().ok_or(DecodeError::TooShort {
        needed: 1,
        actual: 0,
    })
}
