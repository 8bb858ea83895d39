use anyhow::Result;
use log::{info, warn};

use mailbox::exchange::ExchangeState;
use mailbox::logging::{parse_level, setup_logging};
use mailbox::{Mailbox, MailboxConfig};

/// Offline inspection of the local mailbox: lists contacts with their
/// exchange state and queued messages, then purges expired history.
fn main() -> Result<()> {
    let config = MailboxConfig::load_or_default()?;
    setup_logging(config.log_file.as_deref(), parse_level(&config.log_level))?;

    let (mailbox, _events) = Mailbox::open(config)?;
    let store = mailbox.store();
    info!("Mailbox opened at {}", mailbox.config().database_path().display());

    let contact_ids = store.get_contact_ids()?;
    println!("{} contacts", contact_ids.len());
    for id in contact_ids {
        let contact = match store.get_contact(id) {
            Ok(contact) => contact,
            Err(e) => {
                warn!("Skipping contact {}: {}", id, e);
                continue;
            }
        };
        let state = ExchangeState::of(&contact);
        let queued = store.outbound_len(id)?;
        if contact.exchange_error.is_empty() {
            println!("  {:<24} {:?}, {} queued", contact.nickname, state, queued);
        } else {
            println!(
                "  {:<24} {:?} ({}), {} queued",
                contact.nickname, state, contact.exchange_error, queued
            );
        }
    }

    let conversation_ids = store.get_conversation_ids()?;
    println!("{} conversations", conversation_ids.len());
    for id in conversation_ids {
        let conversation = store.get_conversation(id)?;
        println!(
            "  {:<24} {} messages, {} participants",
            conversation.title,
            conversation.messages.len(),
            conversation.contacts.len()
        );
    }

    let purged = mailbox.purge_expired()?;
    if purged > 0 {
        println!("Purged {} expired messages", purged);
    }
    Ok(())
}
