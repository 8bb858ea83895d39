// src/delivery/mod.rs
//! Delivery of queued messages over established transports
//!
//! One [`DeliveryWorker`] runs per network session. The worker drains each
//! registered contact's outbound queue onto its transport and feeds inbound
//! frames back into the mailbox store. A [`WorkerHandle`] installs transports
//! and toggles reading per contact.

pub mod codec;
pub mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::models::ContactId;
use crate::store::StoreError;
use crate::transport::{Transport, TransportError};

pub use codec::{encode_frame, CodecError, FrameDecoder, WireMessage, MAX_FRAME_LEN};
pub use worker::DeliveryWorker;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No transport has been installed for the contact
    #[error("No transport for contact {0}")]
    NotDialed(ContactId),

    #[error("Already reading from contact {0}")]
    AlreadyReading(ContactId),

    #[error("Not reading from contact {0}")]
    NotReading(ContactId),

    /// The worker task has exited
    #[error("Delivery worker stopped")]
    WorkerStopped,

    #[error("Delivery worker state lock poisoned")]
    Poisoned,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Requests handled by the worker loop between ticks
#[derive(Debug)]
pub enum WorkerCommand {
    StartReading {
        contact: ContactId,
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
    StopReading {
        contact: ContactId,
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
    /// Stop reading, drop and halt the contact's transport without saving it
    Forget {
        contact: ContactId,
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
}

/// Decode loop feeding one contact's inbound channel
pub(crate) struct Reader {
    pub inbound: mpsc::Receiver<WireMessage>,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

/// Maps shared by the worker and its handles, behind one mutex
#[derive(Default)]
pub(crate) struct WorkerState {
    pub transports: HashMap<ContactId, Arc<dyn Transport>>,
    pub readers: HashMap<ContactId, Reader>,
}

pub(crate) type SharedState = Arc<Mutex<WorkerState>>;

/// Signal a decode loop to stop and wait for it
pub(crate) async fn stop_reader(reader: Reader) {
    let _ = reader.stop.send(true);
    if let Err(e) = reader.task.await {
        warn!("Decode loop ended abnormally: {}", e);
    }
}

pub(crate) fn lock_state(state: &SharedState) -> Result<MutexGuard<'_, WorkerState>, DeliveryError> {
    state.lock().map_err(|_| DeliveryError::Poisoned)
}

/// Cloneable control handle for a running [`DeliveryWorker`]
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    state: SharedState,
}

impl WorkerHandle {
    /// Make `transport` the one used for `contact`
    ///
    /// A different transport already installed for the contact is halted
    /// along with its reader; call [`WorkerHandle::start_reading`] again
    /// afterwards.
    pub async fn install_transport(&self, contact: ContactId, transport: Arc<dyn Transport>) -> Result<(), DeliveryError> {
        let (previous, reader) = {
            let mut state = lock_state(&self.state)?;
            match state.transports.insert(contact, transport.clone()) {
                Some(previous) if !Arc::ptr_eq(&previous, &transport) => {
                    (Some(previous), state.readers.remove(&contact))
                }
                _ => (None, None),
            }
        };
        if let Some(reader) = reader {
            stop_reader(reader).await;
        }
        if let Some(previous) = previous {
            warn!("Replaced existing transport for contact {}", contact);
            previous.halt().await;
        }
        Ok(())
    }

    pub fn has_transport(&self, contact: ContactId) -> bool {
        lock_state(&self.state).map_or(false, |s| s.transports.contains_key(&contact))
    }

    pub fn is_reading(&self, contact: ContactId) -> bool {
        lock_state(&self.state).map_or(false, |s| s.readers.contains_key(&contact))
    }

    pub async fn start_reading(&self, contact: ContactId) -> Result<(), DeliveryError> {
        self.request(|reply| WorkerCommand::StartReading { contact, reply }).await
    }

    pub async fn stop_reading(&self, contact: ContactId) -> Result<(), DeliveryError> {
        self.request(|reply| WorkerCommand::StopReading { contact, reply }).await
    }

    /// Tear down everything the worker holds for a removed contact
    pub async fn forget(&self, contact: ContactId) -> Result<(), DeliveryError> {
        self.request(|reply| WorkerCommand::Forget { contact, reply }).await
    }

    async fn request<F>(&self, build: F) -> Result<(), DeliveryError>
    where
        F: FnOnce(oneshot::Sender<Result<(), DeliveryError>>) -> WorkerCommand,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| DeliveryError::WorkerStopped)?;
        response.await.map_err(|_| DeliveryError::WorkerStopped)?
    }
}
