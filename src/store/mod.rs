// src/store/mod.rs
//! Mailbox persistence
//!
//! Contacts, conversations and messages are bincode records in the
//! transactional key-value store. Every public operation on
//! [`MailboxStore`] runs in a single transaction, including index
//! maintenance and the fan-out of outgoing messages onto the participants'
//! outbound queues.

pub mod kv;
pub mod queue;

use std::collections::BTreeSet;
use std::path::Path;

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::crypto;
use crate::models::{
    Contact, ContactId, Conversation, ConversationId, Message, MessageId, Timestamp, SELF_SENDER,
};

pub use kv::{KvStore, Txn};
pub use queue::DurableQueue;

/// Version tag written by the first [`MailboxStore::open`]
pub const MAILBOX_VERSION: &[u8] = b"0.1.0";

/// Errors raised by the mailbox store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Contact {0} not found")]
    ContactNotFound(ContactId),

    #[error("Conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("Message {0} not found")]
    MessageNotFound(MessageId),

    /// A conversation with the derived id is already stored
    #[error("Conversation {0} already exists")]
    ConversationAlreadyExists(ConversationId),

    /// Peek or pop on a queue whose head equals its tail
    #[error("Queue is empty")]
    QueueEmpty,

    /// Write attempted from inside a read-only transaction
    #[error("Write in read-only transaction")]
    ReadOnlyTransaction,

    #[error("Key derivation failed: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Another thread panicked while holding the connection
    #[error("Store lock poisoned")]
    Poisoned,

    /// A record exists but cannot be decoded
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ContactNotFound(_)
                | StoreError::ConversationNotFound(_)
                | StoreError::MessageNotFound(_)
        )
    }
}

fn version_key() -> &'static str {
    "mailbox_version"
}

fn contacts_key() -> &'static str {
    "contacts"
}

fn conversations_key() -> &'static str {
    "conversations"
}

fn auto_connect_key() -> &'static str {
    "auto_connect"
}

fn contact_key(id: ContactId) -> String {
    format!("contact:{}", id)
}

fn conversation_key(id: ConversationId) -> String {
    format!("conversation:{}", id)
}

fn message_key(id: MessageId) -> String {
    format!("message:{}", id)
}

fn stream_key(id: ContactId) -> String {
    format!("stream:{}", id)
}

fn load_index(txn: &Txn<'_>, key: &str) -> Result<BTreeSet<u64>, StoreError> {
    Ok(txn.get_record(key)?.unwrap_or_default())
}

fn index_insert(txn: &Txn<'_>, key: &str, id: u64) -> Result<(), StoreError> {
    let mut index = load_index(txn, key)?;
    if index.insert(id) {
        txn.put_record(key, &index)?;
    }
    Ok(())
}

fn index_remove(txn: &Txn<'_>, key: &str, id: u64) -> Result<(), StoreError> {
    let mut index = load_index(txn, key)?;
    if index.remove(&id) {
        txn.put_record(key, &index)?;
    }
    Ok(())
}

fn load_contact(txn: &Txn<'_>, id: ContactId) -> Result<Contact, StoreError> {
    txn.get_record(&contact_key(id))?.ok_or(StoreError::ContactNotFound(id))
}

fn load_conversation(txn: &Txn<'_>, id: ConversationId) -> Result<Conversation, StoreError> {
    txn.get_record(&conversation_key(id))?.ok_or(StoreError::ConversationNotFound(id))
}

fn load_message(txn: &Txn<'_>, id: MessageId) -> Result<Message, StoreError> {
    txn.get_record(&message_key(id))?.ok_or(StoreError::MessageNotFound(id))
}

fn store_contact(txn: &Txn<'_>, contact: &Contact) -> Result<(), StoreError> {
    txn.put_record(&contact_key(contact.id), contact)?;
    index_insert(txn, contacts_key(), contact.id)
}

fn store_conversation(txn: &Txn<'_>, conversation: &Conversation) -> Result<(), StoreError> {
    txn.put_record(&conversation_key(conversation.id), conversation)?;
    index_insert(txn, conversations_key(), conversation.id)
}

fn insert_contact(
    txn: &Txn<'_>,
    nickname: &str,
    secret: &[u8],
    my_private_key: Vec<u8>,
) -> Result<Contact, StoreError> {
    // Retry until the random id is free; 0 is reserved for ourselves
    let id = loop {
        let id: ContactId = rand::random();
        if id != SELF_SENDER && !txn.exists(&contact_key(id))? {
            break id;
        }
        debug!("Contact id {} already taken, retrying", id);
    };
    let contact = Contact {
        id,
        nickname: nickname.to_string(),
        is_pending: true,
        exchange_checkpoint: Vec::new(),
        exchange_error: String::new(),
        my_private_key,
        peer_public_key: Vec::new(),
        shared_secret: secret.to_vec(),
        outbound_queue: rand::random(),
    };
    store_contact(txn, &contact)?;
    Ok(contact)
}

/// Append an inbound message to its conversation, skipping retransmissions
fn deliver_in(txn: &Txn<'_>, conversation: &mut Conversation, msg: Message) -> Result<Message, StoreError> {
    if conversation.messages.contains(&msg.id) {
        debug!("Dropping duplicate message {} in conversation {}", msg.id, conversation.id);
        return load_message(txn, msg.id);
    }
    txn.put_record(&message_key(msg.id), &msg)?;
    conversation.messages.push(msg.id);
    conversation.last_message = conversation.last_message.max(msg.last_activity());
    store_conversation(txn, conversation)?;
    trace!("Delivered message {} into conversation {}", msg.id, conversation.id);
    Ok(msg)
}

/// Persistent mailbox of contacts, conversations and messages
pub struct MailboxStore {
    kv: KvStore,
}

impl MailboxStore {
    /// Open the mailbox database at `path`, initializing it on first use
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Opening mailbox database at {:?}", path);
        Self::init(KvStore::open(path)?)
    }

    /// Open a mailbox that lives only in memory
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(KvStore::open_in_memory()?)
    }

    fn init(kv: KvStore) -> Result<Self, StoreError> {
        kv.update(|txn| {
            if let Some(version) = txn.get(version_key())? {
                debug!("Found mailbox version {}", String::from_utf8_lossy(&version));
                return Ok(());
            }
            info!("Initializing new mailbox database");
            txn.put_record(contacts_key(), &BTreeSet::<u64>::new())?;
            txn.put_record(conversations_key(), &BTreeSet::<u64>::new())?;
            txn.set(version_key(), MAILBOX_VERSION)
        })?;
        Ok(Self { kv })
    }

    /// Underlying key-value store
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Create a pending contact with a fresh key pair and outbound queue
    pub fn new_contact(&self, nickname: &str, secret: &[u8]) -> Result<Contact, StoreError> {
        let (my_private_key, _) = crypto::generate_x25519_keypair();
        let contact = self.kv.update(|txn| insert_contact(txn, nickname, secret, my_private_key.clone()))?;
        info!("Created contact {} ({})", contact.id, contact.nickname);
        Ok(contact)
    }

    /// Create a contact and the conversation its secret implies, in one write
    ///
    /// When another contact already holds the same secret the new contact
    /// joins that conversation instead. The flag is true when the
    /// conversation was created here.
    pub fn new_contact_with_conversation(
        &self,
        nickname: &str,
        secret: &[u8],
    ) -> Result<(Contact, Conversation, bool), StoreError> {
        let (my_private_key, _) = crypto::generate_x25519_keypair();
        let (contact, conversation, created) = self.kv.update(|txn| {
            let contact = insert_contact(txn, nickname, secret, my_private_key.clone())?;
            let id = crypto::derive_conversation_id(secret)?;
            match txn.get_record::<Conversation>(&conversation_key(id))? {
                Some(mut conversation) => {
                    if !conversation.contacts.contains(&contact.id) {
                        conversation.contacts.push(contact.id);
                        txn.put_record(&conversation_key(id), &conversation)?;
                    }
                    Ok((contact, conversation, false))
                }
                None => {
                    let conversation = Conversation::new(id, nickname, vec![contact.id]);
                    store_conversation(txn, &conversation)?;
                    Ok((contact, conversation, true))
                }
            }
        })?;
        info!(
            "Created contact {} ({}) in {} conversation {}",
            contact.id,
            contact.nickname,
            if created { "new" } else { "existing" },
            conversation.id
        );
        Ok((contact, conversation, created))
    }

    pub fn get_contact(&self, id: ContactId) -> Result<Contact, StoreError> {
        self.kv.view(|txn| load_contact(txn, id))
    }

    /// Store `contact`, adding it to the contact index if needed
    pub fn put_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.kv.update(|txn| store_contact(txn, contact))
    }

    /// Atomically modify a stored contact and return the new record
    pub fn update_contact<F>(&self, id: ContactId, f: F) -> Result<Contact, StoreError>
    where
        F: FnOnce(&mut Contact),
    {
        self.kv.update(|txn| {
            let mut contact = load_contact(txn, id)?;
            f(&mut contact);
            txn.put_record(&contact_key(id), &contact)?;
            Ok(contact)
        })
    }

    /// Remove a contact together with its queued messages and saved transport
    ///
    /// Conversations keep the contact id in their participant list so history
    /// stays readable.
    pub fn remove_contact(&self, id: ContactId) -> Result<Contact, StoreError> {
        let (contact, dropped) = self.kv.update(|txn| {
            let contact = load_contact(txn, id)?;
            txn.delete(&contact_key(id))?;
            index_remove(txn, contacts_key(), id)?;
            let dropped = DurableQueue::for_contact(contact.outbound_queue).clear_in(txn)?;
            txn.delete(&stream_key(id))?;
            Ok((contact, dropped))
        })?;
        info!("Removed contact {} ({}), dropped {} queued messages", id, contact.nickname, dropped);
        Ok(contact)
    }

    pub fn get_contact_ids(&self) -> Result<Vec<ContactId>, StoreError> {
        self.kv.view(|txn| Ok(load_index(txn, contacts_key())?.into_iter().collect()))
    }

    /// Create the conversation shared with a contact
    ///
    /// The id is derived from the contact's shared secret, so both parties end
    /// up with the same conversation id without talking to each other.
    pub fn new_conversation(&self, contact_id: ContactId) -> Result<Conversation, StoreError> {
        self.kv.update(|txn| {
            let contact = load_contact(txn, contact_id)?;
            let id = crypto::derive_conversation_id(&contact.shared_secret)?;
            if txn.exists(&conversation_key(id))? {
                return Err(StoreError::ConversationAlreadyExists(id));
            }
            let conversation = Conversation::new(id, contact.nickname.clone(), vec![contact_id]);
            store_conversation(txn, &conversation)?;
            debug!("Created conversation {} with contact {}", id, contact_id);
            Ok(conversation)
        })
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        self.kv.view(|txn| load_conversation(txn, id))
    }

    /// Store `conversation`, adding it to the conversation index if needed
    pub fn put_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.kv.update(|txn| store_conversation(txn, conversation))
    }

    /// Remove a conversation and every message it holds
    pub fn remove_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        self.kv.update(|txn| {
            let conversation = load_conversation(txn, id)?;
            for message_id in &conversation.messages {
                txn.delete(&message_key(*message_id))?;
            }
            txn.delete(&conversation_key(id))?;
            index_remove(txn, conversations_key(), id)?;
            Ok(conversation)
        })
    }

    pub fn get_conversation_ids(&self) -> Result<Vec<ConversationId>, StoreError> {
        self.kv.view(|txn| Ok(load_index(txn, conversations_key())?.into_iter().collect()))
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message, StoreError> {
        self.kv.view(|txn| load_message(txn, id))
    }

    pub fn put_message(&self, msg: &Message) -> Result<(), StoreError> {
        self.kv.update(|txn| txn.put_record(&message_key(msg.id), msg))
    }

    /// Remove a message and unlink it from its conversation
    pub fn remove_message(&self, id: MessageId) -> Result<(), StoreError> {
        self.kv.update(|txn| {
            let msg = load_message(txn, id)?;
            txn.delete(&message_key(id))?;
            if let Some(mut conversation) = txn.get_record::<Conversation>(&conversation_key(msg.conversation))? {
                conversation.messages.retain(|m| *m != id);
                txn.put_record(&conversation_key(conversation.id), &conversation)?;
            }
            Ok(())
        })
    }

    /// Store an inbound message and append it to its conversation
    ///
    /// The received timestamp is assigned here. A message whose id is already
    /// part of the conversation is a retransmission and is not appended
    /// again; the stored copy is returned instead.
    pub fn deliver_message(&self, mut msg: Message) -> Result<Message, StoreError> {
        msg.received = crate::models::now_millis();
        self.kv.update(|txn| {
            let mut conversation = load_conversation(txn, msg.conversation)?;
            deliver_in(txn, &mut conversation, msg)
        })
    }

    /// Deliver a message from a contact, creating its conversation if absent
    ///
    /// A missing conversation is created with the sender as sole participant
    /// and titled after the sender. An existing one is never replaced. The
    /// flag is true when the conversation was created here.
    pub fn deliver_or_adopt(&self, mut msg: Message) -> Result<(Message, bool), StoreError> {
        msg.received = crate::models::now_millis();
        self.kv.update(|txn| {
            let (mut conversation, created) = match txn.get_record::<Conversation>(&conversation_key(msg.conversation))? {
                Some(conversation) => (conversation, false),
                None => {
                    let sender = load_contact(txn, msg.sender)?;
                    let title = format!("Conversation with {}", sender.nickname);
                    info!("Creating conversation {} for message from {}", msg.conversation, sender.nickname);
                    (Conversation::new(msg.conversation, title, vec![sender.id]), true)
                }
            };
            let delivered = deliver_in(txn, &mut conversation, msg)?;
            Ok((delivered, created))
        })
    }

    /// Store an outgoing message and queue a copy for every participant
    ///
    /// Nothing is written unless the conversation exists and every push
    /// succeeds.
    pub fn send_message(&self, conversation_id: ConversationId, msg: &Message) -> Result<(), StoreError> {
        let mut msg = msg.clone();
        msg.conversation = conversation_id;
        let queued = self.kv.update(|txn| {
            let mut conversation = load_conversation(txn, conversation_id)?;
            txn.put_record(&message_key(msg.id), &msg)?;
            conversation.messages.push(msg.id);
            conversation.last_message = conversation.last_message.max(msg.last_activity());
            txn.put_record(&conversation_key(conversation_id), &conversation)?;

            let mut queued = 0;
            for contact_id in &conversation.contacts {
                match txn.get_record::<Contact>(&contact_key(*contact_id))? {
                    Some(contact) => {
                        DurableQueue::for_contact(contact.outbound_queue).push_in(txn, &msg)?;
                        queued += 1;
                    }
                    None => warn!("Skipping removed contact {} in conversation {}", contact_id, conversation_id),
                }
            }
            Ok(queued)
        })?;
        debug!("Queued message {} for {} contacts", msg.id, queued);
        Ok(())
    }

    /// Record the peer's acknowledgement of one of our messages
    pub fn mark_acked(&self, id: MessageId, when: Timestamp) -> Result<Message, StoreError> {
        self.kv.update(|txn| {
            let mut msg = load_message(txn, id)?;
            msg.acked = when;
            txn.put_record(&message_key(id), &msg)?;
            Ok(msg)
        })
    }

    /// Remove messages older than the conversation's expiration
    ///
    /// Returns the number of messages removed.
    pub fn purge_expired(&self, conversation_id: ConversationId, now: Timestamp) -> Result<usize, StoreError> {
        let purged = self.kv.update(|txn| {
            let mut conversation = load_conversation(txn, conversation_id)?;
            let expiration_ms = i64::try_from(conversation.message_expiration.saturating_mul(1000)).unwrap_or(i64::MAX);
            let cutoff = now.saturating_sub(expiration_ms);

            let mut kept = Vec::with_capacity(conversation.messages.len());
            let mut purged = 0;
            for id in &conversation.messages {
                match txn.get_record::<Message>(&message_key(*id))? {
                    Some(msg) if msg.last_activity() >= cutoff => kept.push(*id),
                    Some(_) => {
                        txn.delete(&message_key(*id))?;
                        purged += 1;
                    }
                    // Dangling id, drop it from the list
                    None => purged += 1,
                }
            }
            if purged > 0 {
                conversation.messages = kept;
                txn.put_record(&conversation_key(conversation_id), &conversation)?;
            }
            Ok(purged)
        })?;
        if purged > 0 {
            info!("Purged {} expired messages from conversation {}", purged, conversation_id);
        }
        Ok(purged)
    }

    /// Oldest message waiting in a contact's outbound queue
    pub fn peek_outbound(&self, contact_id: ContactId) -> Result<Message, StoreError> {
        self.kv.view(|txn| {
            let contact = load_contact(txn, contact_id)?;
            DurableQueue::for_contact(contact.outbound_queue).peek_in(txn)
        })
    }

    /// Remove the oldest message from a contact's outbound queue
    pub fn pop_outbound(&self, contact_id: ContactId) -> Result<Message, StoreError> {
        self.kv.update(|txn| {
            let contact = load_contact(txn, contact_id)?;
            DurableQueue::for_contact(contact.outbound_queue).pop_in(txn)
        })
    }

    pub fn outbound_len(&self, contact_id: ContactId) -> Result<u64, StoreError> {
        self.kv.view(|txn| {
            let contact = load_contact(txn, contact_id)?;
            DurableQueue::for_contact(contact.outbound_queue).len_in(txn)
        })
    }

    /// Save the snapshot of a halted transport
    pub fn put_transport_state(&self, contact_id: ContactId, state: &[u8]) -> Result<(), StoreError> {
        self.kv.update(|txn| {
            load_contact(txn, contact_id)?;
            txn.set(&stream_key(contact_id), state)
        })
    }

    pub fn get_transport_state(&self, contact_id: ContactId) -> Result<Option<Vec<u8>>, StoreError> {
        self.kv.view(|txn| txn.get(&stream_key(contact_id)))
    }

    /// Drop a saved transport snapshot once it has been resumed
    pub fn clear_transport_state(&self, contact_id: ContactId) -> Result<(), StoreError> {
        self.kv.update(|txn| txn.delete(&stream_key(contact_id)).map(|_| ()))
    }

    pub fn set_auto_connect(&self, enabled: bool) -> Result<(), StoreError> {
        self.kv.update(|txn| txn.set(auto_connect_key(), &[enabled as u8]))
    }

    /// Whether the client should connect on startup, off until set
    pub fn auto_connect(&self) -> Result<bool, StoreError> {
        self.kv.view(|txn| Ok(txn.get(auto_connect_key())?.map_or(false, |v| v.first() == Some(&1))))
    }
}
