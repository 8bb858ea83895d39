// src/exchange/rendezvous.rs
//! Contract of the mediated rendezvous primitive
//!
//! A [`Rendezvous`] implementation runs the protocol rounds and reports each
//! outcome through an [`UpdateSender`]. Every `send` waits for the driver to
//! acknowledge the update, so a checkpoint is stored before the next round
//! touches the network.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use super::ExchangeError;
use crate::models::ContactId;

/// Outcome of one rendezvous round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeUpdate {
    /// The exchange gave up; carries a human readable cause
    Failed(String),

    /// Opaque protocol state to persist and hand back on resume
    Checkpoint(Vec<u8>),

    /// The peer's payload, its X25519 public key
    Completed(Vec<u8>),
}

/// Inputs of one rendezvous run
#[derive(Clone)]
pub struct ExchangeParams {
    pub contact_id: ContactId,

    /// Weak secret both parties typed in
    pub secret: Zeroizing<Vec<u8>>,

    /// Randomness of the current network epoch
    pub shared_random: Vec<u8>,

    /// Payload delivered to the peer: our public key
    pub payload: Vec<u8>,

    /// Protocol state from the last checkpoint, if resuming
    pub resume: Option<Vec<u8>>,
}

impl fmt::Debug for ExchangeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeParams")
            .field("contact_id", &self.contact_id)
            .field("payload", &hex::encode(&self.payload))
            .field("resume", &self.resume.is_some())
            .finish_non_exhaustive()
    }
}

type Acked = (ExchangeUpdate, oneshot::Sender<()>);

/// Sending half handed to [`Rendezvous::run`]
#[derive(Debug, Clone)]
pub struct UpdateSender {
    tx: mpsc::Sender<Acked>,
}

/// Receiving half owned by the exchange driver
#[derive(Debug)]
pub struct UpdateReceiver {
    rx: mpsc::Receiver<Acked>,
}

/// Create a connected update channel
pub fn update_channel() -> (UpdateSender, UpdateReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (UpdateSender { tx }, UpdateReceiver { rx })
}

impl UpdateSender {
    /// Report `update` and wait until the driver has processed it
    pub async fn send(&self, update: ExchangeUpdate) -> Result<(), ExchangeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((update, ack_tx))
            .await
            .map_err(|_| ExchangeError::ChannelClosed)?;
        ack_rx.await.map_err(|_| ExchangeError::ChannelClosed)
    }
}

impl UpdateReceiver {
    /// Next update and the acknowledgement to fire once it is handled
    pub async fn recv(&mut self) -> Option<(ExchangeUpdate, oneshot::Sender<()>)> {
        self.rx.recv().await
    }
}

/// Mediated rendezvous used to swap public keys over the network
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Run the exchange until it completes or fails, reporting through `updates`
    async fn run(&self, params: ExchangeParams, updates: UpdateSender);
}
