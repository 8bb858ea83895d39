// src/transport.rs
//! Network collaborator contracts
//!
//! A [`Session`] is one connectivity epoch on the network. It hands out
//! [`Transport`]s, reliable byte streams to a single contact, and the
//! rendezvous primitive used to bootstrap them.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::exchange::Rendezvous;

/// Errors surfaced by a transport or session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport was halted locally
    #[error("Transport halted")]
    Halted,

    /// The remote end closed the stream
    #[error("Transport closed by peer")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// An established byte stream to a single contact
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write all of `data`; returns only once the bytes are accepted
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Read the next chunk of the incoming byte stream
    ///
    /// Chunks carry no framing; a frame may span several reads.
    async fn read(&self) -> Result<Vec<u8>, TransportError>;

    /// Stop the transport; pending and future reads fail with [`TransportError::Halted`]
    async fn halt(&self);

    /// Watch channel that turns `true` once the transport has halted
    fn halted(&self) -> watch::Receiver<bool>;

    /// Serialized state that [`Session::resume`] accepts
    async fn save_state(&self) -> Result<Vec<u8>, TransportError>;
}

/// One connectivity epoch of the network client
#[async_trait]
pub trait Session: Send + Sync {
    /// Identifier of this session, used in log output
    fn id(&self) -> String;

    /// Randomness shared by every client of the current epoch
    ///
    /// `None` until the session has fetched a network document.
    async fn shared_random(&self) -> Option<Vec<u8>>;

    /// Wait for the peer that dials with the same secret
    async fn listen(&self, secret: &[u8]) -> Result<Arc<dyn Transport>, TransportError>;

    /// Connect to the peer listening with the same secret
    async fn dial(&self, secret: &[u8]) -> Result<Arc<dyn Transport>, TransportError>;

    /// Rebuild a transport from a [`Transport::save_state`] snapshot
    async fn resume(&self, state: &[u8]) -> Result<Arc<dyn Transport>, TransportError>;

    /// Rendezvous primitive bound to this session
    fn rendezvous(&self) -> Arc<dyn Rendezvous>;
}

/// Resolve once `halt` reads `true` or its sender is gone
pub async fn wait_for_halt(halt: &mut watch::Receiver<bool>) {
    loop {
        if *halt.borrow() {
            return;
        }
        if halt.changed().await.is_err() {
            return;
        }
    }
}
