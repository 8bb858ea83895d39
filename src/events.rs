// src/events.rs
//! Notifications published by the mailbox

use log::debug;
use tokio::sync::mpsc;

use crate::models::{ContactId, ConversationId, Message, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    ContactAdded(ContactId),
    ExchangeCheckpointed { contact: ContactId, rounds: u32 },
    ExchangeFailed { contact: ContactId, reason: String },
    ExchangeCompleted(ContactId),
    /// The transport for a completed contact could not be set up
    TransportFailed { contact: ContactId, reason: String },
    MessageSent { contact: ContactId, message: MessageId },
    MessageReceived(Message),
    ConversationCreated(ConversationId),
    SessionOnline(String),
    SessionOffline,
}

/// Publish `event` without waiting on a slow consumer
///
/// Events are dropped when the channel is full or closed.
pub(crate) fn publish(events: &mpsc::Sender<MailboxEvent>, event: MailboxEvent) {
    if let Err(e) = events.try_send(event) {
        debug!("Dropping mailbox event: {}", e);
    }
}
