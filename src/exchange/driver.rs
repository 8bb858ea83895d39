// src/exchange/driver.rs
//! Runs key exchanges for pending contacts
//!
//! Each exchange is two tasks: the rendezvous primitive itself and a listener
//! that persists every update it reports. The listener acknowledges an update
//! only after the store write, which keeps the rendezvous from starting its
//! next network round before the checkpoint is on disk.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use super::checkpoint::ExchangeCheckpoint;
use super::rendezvous::{update_channel, ExchangeParams, ExchangeUpdate, UpdateReceiver};
use super::{resolve_role, ExchangeError, ExchangeState, TransportRole};
use crate::crypto;
use crate::delivery::WorkerHandle;
use crate::events::{publish, MailboxEvent};
use crate::models::{Contact, ContactId};
use crate::store::MailboxStore;
use crate::transport::{wait_for_halt, Session, TransportError};

/// Task running one exchange, or one transport setup for a completed contact
pub type ExchangeTask = JoinHandle<Result<ExchangeState, ExchangeError>>;

/// What the listener does after handling one update
enum Flow {
    Continue,
    Done(ExchangeState),
}

/// Contacts with an exchange running on this session
type ActiveSet = Arc<Mutex<HashSet<ContactId>>>;

/// Marks a contact's exchange as running until dropped
struct ActiveClaim {
    active: ActiveSet,
    contact_id: ContactId,
}

impl ActiveClaim {
    fn acquire(active: &ActiveSet, contact_id: ContactId) -> Option<Self> {
        let inserted = active.lock().unwrap_or_else(PoisonError::into_inner).insert(contact_id);
        inserted.then(|| Self {
            active: active.clone(),
            contact_id,
        })
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.contact_id);
    }
}

/// Drives exchanges on one session; cheap to clone
#[derive(Clone)]
pub struct ExchangeDriver {
    store: Arc<MailboxStore>,
    session: Arc<dyn Session>,
    worker: WorkerHandle,
    events: mpsc::Sender<MailboxEvent>,
    halt: watch::Receiver<bool>,
    active: ActiveSet,
}

impl ExchangeDriver {
    pub fn new(
        store: Arc<MailboxStore>,
        session: Arc<dyn Session>,
        worker: WorkerHandle,
        events: mpsc::Sender<MailboxEvent>,
        halt: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            session,
            worker,
            events,
            halt,
            active: Arc::default(),
        }
    }

    /// Whether an exchange with the contact is running on this session
    pub fn is_running(&self, contact_id: ContactId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&contact_id)
    }

    /// Start or resume the exchange with a pending contact
    ///
    /// The returned task resolves to the state the exchange stopped in.
    /// [`ExchangeState::InProgress`] means the session halted first and the
    /// stored checkpoint is where the next run picks up. At most one
    /// exchange per contact runs at a time; a second start while the first
    /// is live fails with [`ExchangeError::AlreadyRunning`].
    pub async fn start(&self, contact_id: ContactId) -> Result<ExchangeTask, ExchangeError> {
        let claim =
            ActiveClaim::acquire(&self.active, contact_id).ok_or(ExchangeError::AlreadyRunning(contact_id))?;
        let contact = self.store.get_contact(contact_id)?;
        if !contact.is_pending {
            return Err(ExchangeError::NotPending(contact_id));
        }
        let shared_random = self.session.shared_random().await.ok_or(ExchangeError::NoDocument)?;
        let payload = crypto::x25519_public_key(&contact.my_private_key)?;

        let (resume, rounds) = resume_point(&contact);
        info!(
            "{} exchange with contact {} ({}) after {} rounds",
            if resume.is_some() { "Resuming" } else { "Starting" },
            contact.id,
            contact.nickname,
            rounds
        );
        let params = ExchangeParams {
            contact_id,
            secret: Zeroizing::new(contact.shared_secret.clone()),
            shared_random,
            payload,
            resume,
        };

        let (updates, receiver) = update_channel();
        let rendezvous = self.session.rendezvous();
        let rendezvous_task = tokio::spawn(async move { rendezvous.run(params, updates).await });

        let driver = self.clone();
        Ok(tokio::spawn(async move {
            let _claim = claim;
            driver.listen(contact_id, rounds, receiver, rendezvous_task).await
        }))
    }

    /// Start an exchange for every pending contact, skipping the ones that fail
    pub async fn resume_pending(&self) -> Vec<(ContactId, ExchangeTask)> {
        let ids = match self.store.get_contact_ids() {
            Ok(ids) => ids,
            Err(e) => {
                error!("Cannot list contacts to resume exchanges: {}", e);
                return Vec::new();
            }
        };
        let mut started = Vec::new();
        for id in ids {
            match self.store.get_contact(id) {
                Ok(contact) if contact.is_pending => match self.start(id).await {
                    Ok(task) => started.push((id, task)),
                    Err(e) => warn!("Could not start exchange with contact {}: {}", id, e),
                },
                Ok(_) => {}
                Err(e) => warn!("Skipping contact {}: {}", id, e),
            }
        }
        started
    }

    async fn listen(
        &self,
        contact_id: ContactId,
        mut rounds: u32,
        mut receiver: UpdateReceiver,
        rendezvous_task: JoinHandle<()>,
    ) -> Result<ExchangeState, ExchangeError> {
        let mut halt = self.halt.clone();
        let result = loop {
            let next = tokio::select! {
                _ = wait_for_halt(&mut halt) => {
                    debug!("Session halted during exchange with contact {}", contact_id);
                    break Ok(ExchangeState::InProgress);
                }
                next = receiver.recv() => next,
            };
            let (update, ack) = match next {
                Some(next) => next,
                None => {
                    let reason = "rendezvous ended without a result".to_string();
                    break self.fail(contact_id, reason).map(|_| ExchangeState::Failed);
                }
            };
            let flow = self.process_update(contact_id, &mut rounds, update).await;
            let _ = ack.send(());
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done(state)) => break Ok(state),
                Err(e) => break Err(e),
            }
        };
        rendezvous_task.abort();
        result
    }

    async fn process_update(
        &self,
        contact_id: ContactId,
        rounds: &mut u32,
        update: ExchangeUpdate,
    ) -> Result<Flow, ExchangeError> {
        match update {
            ExchangeUpdate::Failed(reason) => {
                self.fail(contact_id, reason)?;
                Ok(Flow::Done(ExchangeState::Failed))
            }
            ExchangeUpdate::Checkpoint(protocol_state) => {
                let next = rounds.saturating_add(1);
                let encoded = ExchangeCheckpoint::new(next, protocol_state).encode()?;
                self.store.update_contact(contact_id, |c| {
                    c.exchange_checkpoint = encoded;
                    c.exchange_error.clear();
                })?;
                *rounds = next;
                debug!("Stored checkpoint {} for contact {}", next, contact_id);
                publish(&self.events, MailboxEvent::ExchangeCheckpointed { contact: contact_id, rounds: next });
                Ok(Flow::Continue)
            }
            ExchangeUpdate::Completed(peer_public_key) => {
                let contact = match self.complete(contact_id, peer_public_key) {
                    Ok(contact) => contact,
                    Err(e) => {
                        self.fail(contact_id, e.to_string())?;
                        return Ok(Flow::Done(ExchangeState::Failed));
                    }
                };
                info!(
                    "Exchange with contact {} completed, peer key {}",
                    contact_id,
                    crypto::fingerprint(&contact.peer_public_key)
                );
                publish(&self.events, MailboxEvent::ExchangeCompleted(contact_id));
                self.connect(&contact).await?;
                Ok(Flow::Done(ExchangeState::Completed))
            }
        }
    }

    /// Validate the peer key and store the completed contact in one write
    fn complete(&self, contact_id: ContactId, peer_public_key: Vec<u8>) -> Result<Contact, ExchangeError> {
        let contact = self.store.get_contact(contact_id)?;
        let my_public_key = crypto::x25519_public_key(&contact.my_private_key)?;
        resolve_role(&my_public_key, &peer_public_key)?;
        // Rejects malformed and low order keys before anything is stored
        crypto::x25519_diffie_hellman(&contact.my_private_key, &peer_public_key)?;

        let contact = self.store.update_contact(contact_id, |c| {
            c.is_pending = false;
            c.exchange_checkpoint.clear();
            c.exchange_error.clear();
            c.peer_public_key = peer_public_key;
        })?;
        Ok(contact)
    }

    /// Record a failed exchange; the contact stays pending and keeps its checkpoint
    fn fail(&self, contact_id: ContactId, reason: String) -> Result<(), ExchangeError> {
        warn!("Exchange with contact {} failed: {}", contact_id, reason);
        let stored = reason.clone();
        self.store.update_contact(contact_id, |c| c.exchange_error = stored)?;
        publish(&self.events, MailboxEvent::ExchangeFailed { contact: contact_id, reason });
        Ok(())
    }

    /// Establish the transport to a completed contact and register it for delivery
    pub async fn connect(&self, contact: &Contact) -> Result<(), ExchangeError> {
        if contact.is_pending {
            return Err(ExchangeError::Failed(format!("contact {} is still pending", contact.id)));
        }
        let result = self.open_transport(contact).await;
        if let Err(e) = &result {
            error!("Transport to contact {} failed: {}", contact.id, e);
            publish(
                &self.events,
                MailboxEvent::TransportFailed { contact: contact.id, reason: e.to_string() },
            );
        }
        result
    }

    async fn open_transport(&self, contact: &Contact) -> Result<(), ExchangeError> {
        let my_public_key = crypto::x25519_public_key(&contact.my_private_key)?;
        let role = resolve_role(&my_public_key, &contact.peer_public_key)?;
        let secret = crypto::x25519_diffie_hellman(&contact.my_private_key, &contact.peer_public_key)?;
        debug!("Contact {} transport role: {:?}", contact.id, role);

        let mut halt = self.halt.clone();
        let transport = tokio::select! {
            _ = wait_for_halt(&mut halt) => return Err(TransportError::Halted.into()),
            transport = async {
                match role {
                    TransportRole::Listen => self.session.listen(&secret).await,
                    TransportRole::Dial => self.session.dial(&secret).await,
                }
            } => transport?,
        };

        self.worker.install_transport(contact.id, transport).await?;
        self.worker.start_reading(contact.id).await?;
        info!("Transport to contact {} ({}) is up", contact.id, contact.nickname);
        Ok(())
    }
}

/// Protocol state and round count to resume from, if the checkpoint is usable
fn resume_point(contact: &Contact) -> (Option<Vec<u8>>, u32) {
    if contact.exchange_checkpoint.is_empty() {
        return (None, 0);
    }
    match ExchangeCheckpoint::decode(&contact.exchange_checkpoint) {
        Ok(checkpoint) => (Some(checkpoint.protocol_state), checkpoint.rounds),
        Err(e) => {
            warn!("Restarting exchange with contact {}: {}", contact.id, e);
            (None, 0)
        }
    }
}
