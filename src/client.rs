// src/client.rs
//! Mailbox client
//!
//! [`Mailbox`] owns the store and, while online, one session's delivery
//! worker and exchange driver. Messages can be queued at any time; they go
//! out once the session is up and the contact's transport is established.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::config::MailboxConfig;
use crate::delivery::{DeliveryError, DeliveryWorker, WorkerHandle};
use crate::events::{publish, MailboxEvent};
use crate::exchange::{ExchangeDriver, ExchangeError, ExchangeState, ExchangeTask};
use crate::models::{now_millis, Contact, ContactId, ConversationId, Message, MessageType};
use crate::store::{MailboxStore, StoreError};
use crate::transport::Session;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Already online")]
    AlreadyOnline,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    Connecting,
    Online,
}

/// Everything that lives for exactly one session
struct OnlineSession {
    session: Arc<dyn Session>,
    halt: watch::Sender<bool>,
    worker: WorkerHandle,
    worker_task: JoinHandle<()>,
    driver: ExchangeDriver,
    tasks: Vec<(ContactId, ExchangeTask)>,
}

impl OnlineSession {
    fn track(&mut self, contact: ContactId, task: ExchangeTask) {
        self.tasks.retain(|(_, t)| !t.is_finished());
        self.tasks.push((contact, task));
    }
}

pub struct Mailbox {
    store: Arc<MailboxStore>,
    config: MailboxConfig,
    events: mpsc::Sender<MailboxEvent>,
    state: Mutex<ConnectionState>,
    online: TokioMutex<Option<OnlineSession>>,
}

impl Mailbox {
    /// Open the mailbox database named by `config`
    pub fn open(config: MailboxConfig) -> Result<(Self, mpsc::Receiver<MailboxEvent>), MailboxError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = MailboxStore::open(&config.database_path())?;
        Ok(Self::with_store(store, config))
    }

    /// Wrap an already opened store
    pub fn with_store(store: MailboxStore, config: MailboxConfig) -> (Self, mpsc::Receiver<MailboxEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let mailbox = Self {
            store: Arc::new(store),
            config,
            events,
            state: Mutex::new(ConnectionState::Offline),
            online: TokioMutex::new(None),
        };
        (mailbox, events_rx)
    }

    pub fn store(&self) -> &Arc<MailboxStore> {
        &self.store
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Offline)
    }

    fn set_status(&self, status: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            debug!("Connection state {:?} -> {:?}", *state, status);
            *state = status;
        }
    }

    /// Whether to go online at startup, from the stored setting or the config
    pub fn auto_connect(&self) -> Result<bool, MailboxError> {
        Ok(self.config.auto_connect || self.store.auto_connect()?)
    }

    pub fn set_auto_connect(&self, enabled: bool) -> Result<(), MailboxError> {
        Ok(self.store.set_auto_connect(enabled)?)
    }

    /// Add a contact sharing `secret` and the conversation it implies
    ///
    /// The exchange starts right away when online, otherwise on the next
    /// [`Mailbox::go_online`].
    pub async fn add_contact(&self, nickname: &str, secret: &[u8]) -> Result<Contact, MailboxError> {
        let (contact, conversation, created) = self.store.new_contact_with_conversation(nickname, secret)?;
        if created {
            publish(&self.events, MailboxEvent::ConversationCreated(conversation.id));
        } else {
            info!("Contact {} joined existing conversation {}", contact.id, conversation.id);
        }
        publish(&self.events, MailboxEvent::ContactAdded(contact.id));

        if let Some(online) = self.online.lock().await.as_mut() {
            match online.driver.start(contact.id).await {
                Ok(task) => online.track(contact.id, task),
                Err(e) => warn!("Exchange with new contact {} not started: {}", contact.id, e),
            }
        }
        Ok(contact)
    }

    /// Delete a contact, halting its transport first when online
    pub async fn remove_contact(&self, id: ContactId) -> Result<Contact, MailboxError> {
        if let Some(online) = self.online.lock().await.as_ref() {
            match online.worker.forget(id).await {
                Ok(()) | Err(DeliveryError::WorkerStopped) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.store.remove_contact(id)?)
    }

    /// Queue a message for every participant of a conversation
    pub fn send_message(
        &self,
        conversation: ConversationId,
        kind: MessageType,
        body: Vec<u8>,
    ) -> Result<Message, MailboxError> {
        let msg = Message::outgoing(conversation, kind, body);
        self.store.send_message(conversation, &msg)?;
        Ok(msg)
    }

    /// (Re)start the exchange with a pending contact on the current session
    pub async fn start_exchange(&self, id: ContactId) -> Result<(), MailboxError> {
        let mut online = self.online.lock().await;
        let online = online.as_mut().ok_or(ExchangeError::Offline)?;
        let task = online.driver.start(id).await?;
        online.track(id, task);
        Ok(())
    }

    /// Purge expired history from every conversation
    pub fn purge_expired(&self) -> Result<usize, MailboxError> {
        let now = now_millis();
        let mut purged = 0;
        for id in self.store.get_conversation_ids()? {
            purged += self.store.purge_expired(id, now)?;
        }
        Ok(purged)
    }

    /// Bring up delivery on `session`
    ///
    /// Saved transports are resumed, completed contacts without one are
    /// reconnected, and every pending exchange is restarted.
    pub async fn go_online(&self, session: Arc<dyn Session>) -> Result<(), MailboxError> {
        let mut online = self.online.lock().await;
        if online.is_some() {
            return Err(MailboxError::AlreadyOnline);
        }
        self.set_status(ConnectionState::Connecting);
        info!("Going online with session {}", session.id());

        let (halt, halt_rx) = watch::channel(false);
        let (worker, handle) = DeliveryWorker::new(
            self.store.clone(),
            self.events.clone(),
            halt_rx.clone(),
            self.config.poll_interval(),
            self.config.inbound_buffer,
        );
        let worker_task = worker.spawn();
        let driver = ExchangeDriver::new(
            self.store.clone(),
            session.clone(),
            handle.clone(),
            self.events.clone(),
            halt_rx,
        );

        let mut tasks = Vec::new();
        let ids = match self.store.get_contact_ids() {
            Ok(ids) => ids,
            Err(e) => {
                let _ = halt.send(true);
                let _ = worker_task.await;
                self.set_status(ConnectionState::Offline);
                return Err(e.into());
            }
        };
        for id in ids {
            let contact = match self.store.get_contact(id) {
                Ok(contact) if !contact.is_pending => contact,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping contact {}: {}", id, e);
                    continue;
                }
            };
            match resume_transport(&self.store, session.as_ref(), &handle, &contact).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => warn!("Saved transport for contact {} not resumed: {}", id, e),
            }
            let driver = driver.clone();
            let task = tokio::spawn(async move { driver.connect(&contact).await.map(|_| ExchangeState::Completed) });
            tasks.push((id, task));
        }
        tasks.extend(driver.resume_pending().await);

        let session_id = session.id();
        *online = Some(OnlineSession {
            session,
            halt,
            worker: handle,
            worker_task,
            driver,
            tasks,
        });
        self.set_status(ConnectionState::Online);
        publish(&self.events, MailboxEvent::SessionOnline(session_id));
        Ok(())
    }

    /// Halt the session: exchanges stop at their last checkpoint and the
    /// worker saves every transport before it exits
    pub async fn go_offline(&self) -> Result<(), MailboxError> {
        let Some(online) = self.online.lock().await.take() else {
            debug!("Already offline");
            return Ok(());
        };
        info!("Going offline from session {}", online.session.id());
        let _ = online.halt.send(true);

        for (contact, result) in join_all(
            online
                .tasks
                .into_iter()
                .map(|(contact, task)| async move { (contact, task.await) }),
        )
        .await
        {
            match result {
                Ok(Ok(state)) => debug!("Exchange with contact {} stopped as {:?}", contact, state),
                Ok(Err(e)) => warn!("Exchange with contact {} ended with error: {}", contact, e),
                Err(e) => error!("Exchange task for contact {} panicked: {}", contact, e),
            }
        }
        if let Err(e) = online.worker_task.await {
            error!("Delivery worker panicked: {}", e);
        }

        self.set_status(ConnectionState::Offline);
        publish(&self.events, MailboxEvent::SessionOffline);
        Ok(())
    }
}

/// Resume a contact's transport from its saved state, if there is one
async fn resume_transport(
    store: &MailboxStore,
    session: &dyn Session,
    worker: &WorkerHandle,
    contact: &Contact,
) -> Result<bool, DeliveryError> {
    let state = match store.get_transport_state(contact.id)? {
        Some(state) => state,
        None => return Ok(false),
    };
    let transport = session.resume(&state).await?;
    worker.install_transport(contact.id, transport).await?;
    if let Err(e) = worker.start_reading(contact.id).await {
        if let Err(forget) = worker.forget(contact.id).await {
            debug!("Could not drop transport for contact {}: {}", contact.id, forget);
        }
        return Err(e);
    }
    // The snapshot is only spent once the transport is registered
    store.clear_transport_state(contact.id)?;
    info!("Resumed transport for contact {} ({})", contact.id, contact.nickname);
    Ok(true)
}
