// src/models.rs
//! Persisted entities: contacts, conversations and messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Local identifier of a contact.
pub type ContactId = u64;

/// Identifier shared by every participant of a conversation.
pub type ConversationId = u64;

/// Identifier of a single message.
pub type MessageId = u64;

/// Milliseconds since the Unix epoch. Zero means "not set".
pub type Timestamp = i64;

/// Sender id used for messages written by the local user.
pub const SELF_SENDER: ContactId = 0;

/// Default lifetime of conversation history (one week, in seconds).
pub const DEFAULT_MESSAGE_EXPIRATION: u64 = 7 * 24 * 60 * 60;

/// Current wall clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// A party we exchange messages with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Locally unique contact id
    pub id: ContactId,

    /// Display name
    pub nickname: String,

    /// True until the key exchange has completed
    pub is_pending: bool,

    /// Serialized exchange checkpoint; empty when no exchange is in flight
    pub exchange_checkpoint: Vec<u8>,

    /// Human readable cause of the last failed exchange
    pub exchange_error: String,

    /// Long-term X25519 private key used with this contact
    pub my_private_key: Vec<u8>,

    /// Peer's X25519 public key, empty until the exchange completes
    pub peer_public_key: Vec<u8>,

    /// Weak secret both parties typed in to bootstrap the exchange
    pub shared_secret: Vec<u8>,

    /// Identifier of this contact's outbound queue
    pub outbound_queue: u64,
}

impl Contact {
    /// Checks the pending flag against the checkpoint blob.
    ///
    /// A contact that is no longer pending must not carry a checkpoint.
    pub fn is_consistent(&self) -> bool {
        self.is_pending || self.exchange_checkpoint.is_empty()
    }
}

// Keys and secrets stay out of log output
impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("nickname", &self.nickname)
            .field("is_pending", &self.is_pending)
            .field("exchange_checkpoint_len", &self.exchange_checkpoint.len())
            .field("exchange_error", &self.exchange_error)
            .field("peer_public_key", &hex::encode(&self.peer_public_key))
            .field("outbound_queue", &self.outbound_queue)
            .finish_non_exhaustive()
    }
}

/// A conversation between the local user and one or more contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Identifier derived from the shared secret
    pub id: ConversationId,

    /// Title shown at the head of the conversation
    pub title: String,

    /// Participants, in the order they joined
    pub contacts: Vec<ContactId>,

    /// Message ids in arrival order
    pub messages: Vec<MessageId>,

    /// Seconds after which history is purged
    pub message_expiration: u64,

    /// Timestamp of the last sent or received message
    pub last_message: Timestamp,
}

impl Conversation {
    pub fn new(id: ConversationId, title: impl Into<String>, contacts: Vec<ContactId>) -> Self {
        Self {
            id,
            title: title.into(),
            contacts,
            messages: Vec::new(),
            message_expiration: DEFAULT_MESSAGE_EXPIRATION,
            last_message: 0,
        }
    }
}

/// What kind of payload a message body holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Text,
    Audio,
    Image,
    Attachment,
}

/// Delivery state derived from a message's timestamps.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryStatus {
    /// Written locally, not yet acknowledged by the peer
    Sent,
    /// Written locally and acknowledged
    Delivered,
    /// Written by a contact and stored here
    Received,
    /// Timestamps contradict the sender field
    Inconsistent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,

    /// Conversation this message is tagged with
    pub conversation: ConversationId,

    /// Contact that wrote the message, [`SELF_SENDER`] for ourselves
    pub sender: ContactId,

    pub kind: MessageType,

    /// Producer-assigned send time
    pub sent: Timestamp,

    /// Consumer-assigned receive time
    pub received: Timestamp,

    /// When the receiver acknowledged the message
    pub acked: Timestamp,

    pub body: Vec<u8>,
}

impl Message {
    /// Creates an outgoing message with a fresh random id.
    pub fn outgoing(conversation: ConversationId, kind: MessageType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: rand::random(),
            conversation,
            sender: SELF_SENDER,
            kind,
            sent: now_millis(),
            received: 0,
            acked: 0,
            body: body.into(),
        }
    }

    /// Convenience constructor for a text message.
    pub fn text(conversation: ConversationId, body: &str) -> Self {
        Self::outgoing(conversation, MessageType::Text, body.as_bytes())
    }

    pub fn is_from_self(&self) -> bool {
        self.sender == SELF_SENDER
    }

    /// Latest timestamp carried by the message.
    pub fn last_activity(&self) -> Timestamp {
        self.sent.max(self.received)
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        match (self.is_from_self(), self.received != 0, self.acked != 0) {
            (true, false, false) => DeliveryStatus::Sent,
            (true, false, true) => DeliveryStatus::Delivered,
            (false, true, false) => DeliveryStatus::Received,
            _ => DeliveryStatus::Inconsistent,
        }
    }
}
