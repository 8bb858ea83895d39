// src/store/queue.rs
//! Durable FIFO queue over the key-value store
//!
//! Entries live at `<prefix>:<counter>`; the `<prefix>:queue_metadata` record
//! holds the head (next slot to write) and tail (next slot to read) counters
//! as two big-endian u64 values. `head == tail` means the queue is empty.

use log::trace;

use super::kv::{KvStore, Txn};
use super::StoreError;
use crate::models::Message;

/// Key prefix shared by every outbound queue
pub const OUTBOUND_PREFIX: &str = "outbound";

const METADATA_LEN: usize = 16;

/// Handle on one queue; holds no state besides its key prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableQueue {
    prefix: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct QueueMetadata {
    head: u64,
    tail: u64,
}

impl QueueMetadata {
    fn decode(key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != METADATA_LEN {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("queue metadata is {} bytes, expected {}", bytes.len(), METADATA_LEN),
            });
        }
        let mut head = [0u8; 8];
        let mut tail = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        tail.copy_from_slice(&bytes[8..]);
        Ok(Self {
            head: u64::from_be_bytes(head),
            tail: u64::from_be_bytes(tail),
        })
    }

    fn encode(&self) -> [u8; METADATA_LEN] {
        let mut out = [0u8; METADATA_LEN];
        out[..8].copy_from_slice(&self.head.to_be_bytes());
        out[8..].copy_from_slice(&self.tail.to_be_bytes());
        out
    }

    fn len(&self) -> u64 {
        self.head - self.tail
    }
}

impl DurableQueue {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// The outbound queue identified by a contact's queue id
    pub fn for_contact(queue_id: u64) -> Self {
        Self::new(format!("{}:{}", OUTBOUND_PREFIX, queue_id))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn metadata_key(&self) -> String {
        format!("{}:queue_metadata", self.prefix)
    }

    fn entry_key(&self, counter: u64) -> String {
        format!("{}:{:020}", self.prefix, counter)
    }

    // Metadata is created lazily, a missing record reads as (0, 0)
    fn metadata(&self, txn: &Txn<'_>) -> Result<QueueMetadata, StoreError> {
        let key = self.metadata_key();
        match txn.get(&key)? {
            Some(bytes) => QueueMetadata::decode(&key, &bytes),
            None => Ok(QueueMetadata::default()),
        }
    }

    fn set_metadata(&self, txn: &Txn<'_>, meta: &QueueMetadata) -> Result<(), StoreError> {
        txn.set(&self.metadata_key(), &meta.encode())
    }

    /// Append `msg` inside an existing transaction
    pub fn push_in(&self, txn: &Txn<'_>, msg: &Message) -> Result<(), StoreError> {
        let mut meta = self.metadata(txn)?;
        txn.put_record(&self.entry_key(meta.head), msg)?;
        meta.head += 1;
        self.set_metadata(txn, &meta)?;
        trace!("Pushed message {} onto {} ({} queued)", msg.id, self.prefix, meta.len());
        Ok(())
    }

    /// Read the oldest entry without removing it
    pub fn peek_in(&self, txn: &Txn<'_>) -> Result<Message, StoreError> {
        let meta = self.metadata(txn)?;
        if meta.head == meta.tail {
            return Err(StoreError::QueueEmpty);
        }
        let key = self.entry_key(meta.tail);
        txn.get_record(&key)?.ok_or(StoreError::Corrupt {
            key,
            reason: "queue slot missing below head".to_string(),
        })
    }

    /// Remove and return the oldest entry
    pub fn pop_in(&self, txn: &Txn<'_>) -> Result<Message, StoreError> {
        let msg = self.peek_in(txn)?;
        let mut meta = self.metadata(txn)?;
        txn.delete(&self.entry_key(meta.tail))?;
        meta.tail += 1;
        self.set_metadata(txn, &meta)?;
        trace!("Popped message {} from {} ({} queued)", msg.id, self.prefix, meta.len());
        Ok(msg)
    }

    pub fn len_in(&self, txn: &Txn<'_>) -> Result<u64, StoreError> {
        Ok(self.metadata(txn)?.len())
    }

    /// Delete every entry and the metadata record
    pub fn clear_in(&self, txn: &Txn<'_>) -> Result<u64, StoreError> {
        let meta = self.metadata(txn)?;
        for counter in meta.tail..meta.head {
            txn.delete(&self.entry_key(counter))?;
        }
        txn.delete(&self.metadata_key())?;
        Ok(meta.len())
    }

    pub fn push(&self, kv: &KvStore, msg: &Message) -> Result<(), StoreError> {
        kv.update(|txn| self.push_in(txn, msg))
    }

    pub fn peek(&self, kv: &KvStore) -> Result<Message, StoreError> {
        kv.view(|txn| self.peek_in(txn))
    }

    pub fn pop(&self, kv: &KvStore) -> Result<Message, StoreError> {
        kv.update(|txn| self.pop_in(txn))
    }

    pub fn len(&self, kv: &KvStore) -> Result<u64, StoreError> {
        kv.view(|txn| self.len_in(txn))
    }

    pub fn is_empty(&self, kv: &KvStore) -> Result<bool, StoreError> {
        Ok(self.len(kv)? == 0)
    }
}
