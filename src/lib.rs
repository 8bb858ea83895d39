// Store-and-forward mailbox: contacts, conversations and per-contact
// outbound queues, key exchange with pending contacts and delivery over
// per-contact transports.
pub mod client;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod events;
pub mod exchange;
pub mod logging;
pub mod models;
pub mod store;
pub mod transport;

// Re-export main types for convenience
pub use client::{ConnectionState, Mailbox, MailboxError};
pub use config::MailboxConfig;
pub use events::MailboxEvent;
pub use models::*;
pub use store::{MailboxStore, StoreError};
