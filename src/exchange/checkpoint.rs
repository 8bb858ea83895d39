// src/exchange/checkpoint.rs
//! Versioned snapshot of an in-flight exchange
//!
//! The rendezvous primitive hands out opaque protocol state; the driver wraps
//! it with a format version and round counter before storing it on the
//! contact.

use serde::{Deserialize, Serialize};

use super::ExchangeError;

/// Current checkpoint format
pub const CHECKPOINT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeCheckpoint {
    /// Format version, see [`CHECKPOINT_VERSION`]
    pub version: u8,

    /// Number of rounds completed so far
    pub rounds: u32,

    /// Opaque state of the rendezvous protocol
    pub protocol_state: Vec<u8>,
}

impl ExchangeCheckpoint {
    pub fn new(rounds: u32, protocol_state: Vec<u8>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            rounds,
            protocol_state,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ExchangeError> {
        bincode::serialize(self).map_err(|e| ExchangeError::IncompatibleCheckpoint(e.to_string()))
    }

    /// Decode a stored checkpoint, rejecting unknown format versions
    pub fn decode(bytes: &[u8]) -> Result<Self, ExchangeError> {
        let checkpoint: Self =
            bincode::deserialize(bytes).map_err(|e| ExchangeError::IncompatibleCheckpoint(e.to_string()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(ExchangeError::IncompatibleCheckpoint(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }
}
