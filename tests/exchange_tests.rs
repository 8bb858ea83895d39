// Key exchange integration tests
// The driver runs against scripted rendezvous runs and a loopback network

mod common;
use common::*;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::info;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use mailbox::crypto::{generate_x25519_keypair, x25519_public_key};
use mailbox::delivery::{DeliveryWorker, WorkerHandle};
use mailbox::exchange::{ExchangeCheckpoint, ExchangeDriver, ExchangeError, ExchangeState, ExchangeUpdate};
use mailbox::transport::Session;
use mailbox::{MailboxEvent, MailboxStore};

/// One session worth of worker and driver on top of a shared store
struct Harness {
    events: mpsc::Receiver<MailboxEvent>,
    halt: watch::Sender<bool>,
    worker: WorkerHandle,
    worker_task: JoinHandle<()>,
    driver: ExchangeDriver,
}

impl Harness {
    fn new(store: Arc<MailboxStore>, session: Arc<dyn Session>) -> Self {
        let (events_tx, events) = mpsc::channel(100);
        let (halt, halt_rx) = watch::channel(false);
        let (worker, handle) = DeliveryWorker::new(
            store.clone(),
            events_tx.clone(),
            halt_rx.clone(),
            Duration::from_millis(10),
            16,
        );
        let worker_task = worker.spawn();
        let driver = ExchangeDriver::new(store, session, handle.clone(), events_tx, halt_rx);
        Self {
            events,
            halt,
            worker: handle,
            worker_task,
            driver,
        }
    }

    async fn shutdown(self) -> Result<()> {
        let _ = self.halt.send(true);
        self.worker_task.await?;
        Ok(())
    }
}

/// A halted exchange keeps its checkpoint, and the next session resumes from it
#[tokio::test]
async fn test_exchange_resumes_from_checkpoint_after_halt() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;
    let (_, peer_public_key) = generate_x25519_keypair();

    let rendezvous = ScriptedRendezvous::new(vec![
        Script {
            updates: vec![ExchangeUpdate::Checkpoint(b"round one".to_vec())],
            hang: true,
        },
        Script {
            updates: vec![ExchangeUpdate::Completed(peer_public_key.clone())],
            hang: false,
        },
    ]);
    let network = LoopbackNetwork::new();
    let session: Arc<dyn Session> = network.session("alice", rendezvous.clone());

    // First session: one round, then the session goes away
    let mut first = Harness::new(store.clone(), session.clone());
    let task = first.driver.start(contact.id).await?;
    let event = wait_for_event(&mut first.events, |e| matches!(e, MailboxEvent::ExchangeCheckpointed { .. })).await?;
    assert_eq!(event, MailboxEvent::ExchangeCheckpointed { contact: contact.id, rounds: 1 });

    let _ = first.halt.send(true);
    assert_eq!(task.await??, ExchangeState::InProgress);
    first.shutdown().await?;

    let stored = store.get_contact(contact.id)?;
    assert!(stored.is_pending);
    assert_eq!(ExchangeState::of(&stored), ExchangeState::InProgress);
    let checkpoint = ExchangeCheckpoint::decode(&stored.exchange_checkpoint)?;
    assert_eq!(checkpoint.rounds, 1);
    assert_eq!(checkpoint.protocol_state, b"round one");
    info!("Exchange halted at round {}", checkpoint.rounds);

    // Second session: picks up the stored protocol state and finishes
    let mut second = Harness::new(store.clone(), session);
    let task = second.driver.start(contact.id).await?;
    assert_eq!(task.await??, ExchangeState::Completed);
    wait_for_event(&mut second.events, |e| *e == MailboxEvent::ExchangeCompleted(contact.id)).await?;

    assert_eq!(rendezvous.runs(), vec![None, Some(b"round one".to_vec())]);
    let stored = store.get_contact(contact.id)?;
    assert!(!stored.is_pending);
    assert!(stored.exchange_checkpoint.is_empty());
    assert!(stored.exchange_error.is_empty());
    assert_eq!(stored.peer_public_key, peer_public_key);
    assert!(second.worker.has_transport(contact.id));
    assert!(second.worker.is_reading(contact.id));

    second.shutdown().await?;
    Ok(())
}

/// A reported failure is stored while the contact stays pending with its checkpoint
#[tokio::test]
async fn test_failed_exchange_keeps_contact_pending() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;

    let rendezvous = ScriptedRendezvous::new(vec![Script {
        updates: vec![
            ExchangeUpdate::Checkpoint(b"half way".to_vec()),
            ExchangeUpdate::Failed("peer never showed up".to_string()),
        ],
        hang: false,
    }]);
    let network = LoopbackNetwork::new();
    let mut harness = Harness::new(store.clone(), network.session("alice", rendezvous));

    let task = harness.driver.start(contact.id).await?;
    assert_eq!(task.await??, ExchangeState::Failed);
    let event = wait_for_event(&mut harness.events, |e| matches!(e, MailboxEvent::ExchangeFailed { .. })).await?;
    assert_eq!(
        event,
        MailboxEvent::ExchangeFailed {
            contact: contact.id,
            reason: "peer never showed up".to_string()
        }
    );

    let stored = store.get_contact(contact.id)?;
    assert!(stored.is_pending);
    assert_eq!(stored.exchange_error, "peer never showed up");
    assert_eq!(ExchangeCheckpoint::decode(&stored.exchange_checkpoint)?.protocol_state, b"half way");
    assert_eq!(ExchangeState::of(&stored), ExchangeState::Failed);
    assert!(!harness.worker.has_transport(contact.id));

    harness.shutdown().await
}

/// Without a network document there is no shared randomness to start from
#[tokio::test]
async fn test_exchange_needs_network_document() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;
    let rendezvous = ScriptedRendezvous::new(Vec::new());
    let network = LoopbackNetwork::new();
    let harness = Harness::new(store.clone(), network.session_without_document("alice", rendezvous.clone()));

    assert!(matches!(harness.driver.start(contact.id).await, Err(ExchangeError::NoDocument)));
    assert!(rendezvous.runs().is_empty());
    assert_eq!(ExchangeState::of(&store.get_contact(contact.id)?), ExchangeState::NotStarted);

    harness.shutdown().await
}

#[tokio::test]
async fn test_exchange_rejects_completed_contact() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;
    store.update_contact(contact.id, |c| c.is_pending = false)?;

    let network = LoopbackNetwork::new();
    let harness = Harness::new(store.clone(), network.session("alice", ScriptedRendezvous::new(Vec::new())));
    assert!(matches!(
        harness.driver.start(contact.id).await,
        Err(ExchangeError::NotPending(id)) if id == contact.id
    ));
    assert!(matches!(harness.driver.start(0xFFFF).await, Err(ExchangeError::Store(_))));

    harness.shutdown().await
}

/// Our own key coming back means nothing was exchanged
#[tokio::test]
async fn test_reflected_key_fails_exchange() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;
    let own_public_key = x25519_public_key(&contact.my_private_key)?;

    let rendezvous = ScriptedRendezvous::new(vec![Script {
        updates: vec![ExchangeUpdate::Completed(own_public_key)],
        hang: false,
    }]);
    let network = LoopbackNetwork::new();
    let harness = Harness::new(store.clone(), network.session("alice", rendezvous));

    let task = harness.driver.start(contact.id).await?;
    assert_eq!(task.await??, ExchangeState::Failed);

    let stored = store.get_contact(contact.id)?;
    assert!(stored.is_pending);
    assert!(stored.peer_public_key.is_empty());
    assert_eq!(stored.exchange_error, ExchangeError::ReflectedKey.to_string());

    harness.shutdown().await
}

/// A peer key of the wrong size is rejected before anything is stored
#[tokio::test]
async fn test_malformed_peer_key_fails_exchange() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;

    let rendezvous = ScriptedRendezvous::new(vec![Script {
        updates: vec![ExchangeUpdate::Completed(vec![7u8; 5])],
        hang: false,
    }]);
    let network = LoopbackNetwork::new();
    let harness = Harness::new(store.clone(), network.session("alice", rendezvous));

    let task = harness.driver.start(contact.id).await?;
    assert_eq!(task.await??, ExchangeState::Failed);
    let stored = store.get_contact(contact.id)?;
    assert!(stored.is_pending);
    assert!(stored.peer_public_key.is_empty());
    assert!(!stored.exchange_error.is_empty());

    harness.shutdown().await
}

/// A rendezvous that returns without reporting anything counts as a failure
#[tokio::test]
async fn test_silent_rendezvous_fails_exchange() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;
    let network = LoopbackNetwork::new();
    let harness = Harness::new(store.clone(), network.session("alice", ScriptedRendezvous::new(Vec::new())));

    let task = harness.driver.start(contact.id).await?;
    assert_eq!(task.await??, ExchangeState::Failed);
    assert_eq!(store.get_contact(contact.id)?.exchange_error, "rendezvous ended without a result");

    harness.shutdown().await
}

/// A second start while the first exchange is live is refused
#[tokio::test]
async fn test_second_start_is_refused_while_running() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;

    let rendezvous = ScriptedRendezvous::new(vec![
        Script {
            updates: vec![ExchangeUpdate::Checkpoint(b"round one".to_vec())],
            hang: true,
        },
        Script {
            updates: Vec::new(),
            hang: true,
        },
    ]);
    let network = LoopbackNetwork::new();
    let mut harness = Harness::new(store.clone(), network.session("alice", rendezvous.clone()));

    let task = harness.driver.start(contact.id).await?;
    assert!(harness.driver.is_running(contact.id));
    wait_for_event(&mut harness.events, |e| matches!(e, MailboxEvent::ExchangeCheckpointed { .. })).await?;

    assert!(matches!(
        harness.driver.start(contact.id).await,
        Err(ExchangeError::AlreadyRunning(id)) if id == contact.id
    ));
    assert!(harness.driver.resume_pending().await.is_empty());
    assert_eq!(rendezvous.runs(), vec![None]);

    let _ = harness.halt.send(true);
    assert_eq!(task.await??, ExchangeState::InProgress);
    assert!(!harness.driver.is_running(contact.id));

    harness.shutdown().await
}

/// A start that fails validation leaves no running marker behind
#[tokio::test]
async fn test_rejected_start_does_not_block_the_next() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;

    let rendezvous = ScriptedRendezvous::new(vec![Script {
        updates: vec![ExchangeUpdate::Checkpoint(b"round one".to_vec())],
        hang: true,
    }]);
    let network = LoopbackNetwork::new();
    let no_document = Harness::new(store.clone(), network.session_without_document("alice", rendezvous.clone()));
    assert!(matches!(no_document.driver.start(contact.id).await, Err(ExchangeError::NoDocument)));
    assert!(!no_document.driver.is_running(contact.id));
    no_document.shutdown().await?;

    let mut harness = Harness::new(store.clone(), network.session("alice", rendezvous.clone()));
    let task = harness.driver.start(contact.id).await?;
    wait_for_event(&mut harness.events, |e| matches!(e, MailboxEvent::ExchangeCheckpointed { .. })).await?;
    assert_eq!(rendezvous.runs(), vec![None]);

    let _ = harness.halt.send(true);
    assert_eq!(task.await??, ExchangeState::InProgress);
    harness.shutdown().await
}

/// An unreadable checkpoint restarts the exchange from scratch
#[tokio::test]
async fn test_unreadable_checkpoint_restarts_exchange() -> Result<()> {
    setup_logging();
    let store = Arc::new(MailboxStore::open_in_memory()?);
    let contact = store.new_contact("bob", b"bobsecret")?;
    store.update_contact(contact.id, |c| c.exchange_checkpoint = b"not a checkpoint".to_vec())?;

    let rendezvous = ScriptedRendezvous::new(vec![Script {
        updates: vec![ExchangeUpdate::Checkpoint(b"fresh".to_vec())],
        hang: true,
    }]);
    let network = LoopbackNetwork::new();
    let mut harness = Harness::new(store.clone(), network.session("alice", rendezvous.clone()));

    let task = harness.driver.start(contact.id).await?;
    let event = wait_for_event(&mut harness.events, |e| matches!(e, MailboxEvent::ExchangeCheckpointed { .. })).await?;
    assert_eq!(event, MailboxEvent::ExchangeCheckpointed { contact: contact.id, rounds: 1 });
    assert_eq!(rendezvous.runs(), vec![None]);

    let _ = harness.halt.send(true);
    assert_eq!(task.await??, ExchangeState::InProgress);
    let checkpoint = ExchangeCheckpoint::decode(&store.get_contact(contact.id)?.exchange_checkpoint)?;
    assert_eq!(checkpoint.rounds, 1);
    assert_eq!(checkpoint.protocol_state, b"fresh");

    harness.shutdown().await
}

/// Two parties sharing a secret end up on opposite ends of one transport
#[tokio::test]
async fn test_paired_exchange_connects_both_parties() -> Result<()> {
    setup_logging();
    let network = LoopbackNetwork::new();
    let rendezvous = network.rendezvous();

    let alice_store = Arc::new(MailboxStore::open_in_memory()?);
    let bob_store = Arc::new(MailboxStore::open_in_memory()?);
    let bob = alice_store.new_contact("bob", b"open sesame")?;
    let alice = bob_store.new_contact("alice", b"open sesame")?;

    let alice_side = Harness::new(alice_store.clone(), network.session("alice", rendezvous.clone()));
    let bob_side = Harness::new(bob_store.clone(), network.session("bob", rendezvous.clone()));

    let alice_task = alice_side.driver.start(bob.id).await?;
    let bob_task = bob_side.driver.start(alice.id).await?;
    assert_eq!(alice_task.await??, ExchangeState::Completed);
    assert_eq!(bob_task.await??, ExchangeState::Completed);

    let bob = alice_store.get_contact(bob.id)?;
    let alice = bob_store.get_contact(alice.id)?;
    assert_eq!(bob.peer_public_key, x25519_public_key(&alice.my_private_key)?);
    assert_eq!(alice.peer_public_key, x25519_public_key(&bob.my_private_key)?);
    assert!(alice_side.worker.is_reading(bob.id));
    assert!(bob_side.worker.is_reading(alice.id));

    alice_side.shutdown().await?;
    bob_side.shutdown().await
}
