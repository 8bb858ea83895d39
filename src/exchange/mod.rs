// src/exchange/mod.rs
//! Key exchange with pending contacts
//!
//! A contact starts out pending. The [`ExchangeDriver`] runs the rendezvous
//! primitive for it, stores every checkpoint on the contact, and once the
//! peer's public key arrives derives the transport secret, picks a transport
//! role and hands the new transport to the delivery worker.

pub mod checkpoint;
pub mod driver;
pub mod rendezvous;

use std::cmp::Ordering;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::delivery::DeliveryError;
use crate::models::{Contact, ContactId};
use crate::store::StoreError;
use crate::transport::TransportError;

pub use checkpoint::{ExchangeCheckpoint, CHECKPOINT_VERSION};
pub use driver::{ExchangeDriver, ExchangeTask};
pub use rendezvous::{update_channel, ExchangeParams, ExchangeUpdate, Rendezvous, UpdateReceiver, UpdateSender};

/// Errors raised while exchanging keys
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No network session is available
    #[error("Exchange requires a network session")]
    Offline,

    /// The session has not fetched a network document yet
    #[error("No network document available for shared randomness")]
    NoDocument,

    #[error("Contact {0} is not pending")]
    NotPending(ContactId),

    /// An exchange with the contact is already running on this session
    #[error("Exchange with contact {0} already running")]
    AlreadyRunning(ContactId),

    /// The exchange failed; the cause is also stored on the contact
    #[error("Exchange failed: {0}")]
    Failed(String),

    /// The peer sent back our own public key
    #[error("Peer public key equals our own")]
    ReflectedKey,

    #[error("Incompatible exchange checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// The other end of the update channel went away
    #[error("Exchange update channel closed")]
    ChannelClosed,
}

/// Progress of a contact's key exchange as recorded in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl ExchangeState {
    pub fn of(contact: &Contact) -> Self {
        if !contact.is_pending {
            ExchangeState::Completed
        } else if !contact.exchange_error.is_empty() {
            ExchangeState::Failed
        } else if !contact.exchange_checkpoint.is_empty() {
            ExchangeState::InProgress
        } else {
            ExchangeState::NotStarted
        }
    }
}

/// Which side of the transport a party takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Listen,
    Dial,
}

/// Pick the transport role from the two public keys
///
/// The lexicographically greater key listens and the lesser dials, so both
/// parties reach complementary roles without talking.
pub fn resolve_role(my_public_key: &[u8], peer_public_key: &[u8]) -> Result<TransportRole, ExchangeError> {
    match my_public_key.cmp(peer_public_key) {
        Ordering::Greater => Ok(TransportRole::Listen),
        Ordering::Less => Ok(TransportRole::Dial),
        Ordering::Equal => Err(ExchangeError::ReflectedKey),
    }
}
