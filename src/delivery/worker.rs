// src/delivery/worker.rs
//! Polling loop of the delivery worker

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::codec::{encode_frame, CodecError, FrameDecoder, WireMessage};
use super::{lock_state, stop_reader, DeliveryError, Reader, SharedState, WorkerCommand, WorkerHandle, WorkerState};
use crate::events::{publish, MailboxEvent};
use crate::models::ContactId;
use crate::store::{MailboxStore, StoreError};
use crate::transport::{wait_for_halt, Transport, TransportError};

const COMMAND_BUFFER: usize = 32;

/// Per-session loop that moves messages between queues and transports
pub struct DeliveryWorker {
    store: Arc<MailboxStore>,
    state: SharedState,
    commands: mpsc::Receiver<WorkerCommand>,
    events: mpsc::Sender<MailboxEvent>,
    halt: watch::Receiver<bool>,
    poll_interval: Duration,
    inbound_buffer: usize,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<MailboxStore>,
        events: mpsc::Sender<MailboxEvent>,
        halt: watch::Receiver<bool>,
        poll_interval: Duration,
        inbound_buffer: usize,
    ) -> (Self, WorkerHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let state = SharedState::default();
        let handle = WorkerHandle {
            commands: commands_tx,
            state: state.clone(),
        };
        let worker = Self {
            store,
            state,
            commands,
            events,
            halt,
            poll_interval,
            inbound_buffer: inbound_buffer.max(1),
        };
        (worker, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the halt signal fires, then save and halt every transport
    pub async fn run(mut self) {
        info!("Delivery worker started, polling every {:?}", self.poll_interval);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut halt = self.halt.clone();

        loop {
            tokio::select! {
                _ = wait_for_halt(&mut halt) => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = ticker.tick() => self.poll_once().await,
            }
        }

        self.shutdown().await;
        info!("Delivery worker halted");
    }

    async fn handle_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::StartReading { contact, reply } => {
                let _ = reply.send(self.start_reading(contact));
            }
            WorkerCommand::StopReading { contact, reply } => {
                let result = match self.take_reader(contact) {
                    Ok(Some(reader)) => {
                        stop_reader(reader).await;
                        Ok(())
                    }
                    Ok(None) => Err(DeliveryError::NotReading(contact)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            WorkerCommand::Forget { contact, reply } => {
                let _ = reply.send(self.forget(contact).await);
            }
        }
    }

    fn start_reading(&self, contact: ContactId) -> Result<(), DeliveryError> {
        let mut state = lock_state(&self.state)?;
        if state.readers.contains_key(&contact) {
            return Err(DeliveryError::AlreadyReading(contact));
        }
        let transport = state
            .transports
            .get(&contact)
            .cloned()
            .ok_or(DeliveryError::NotDialed(contact))?;

        let (inbound_tx, inbound) = mpsc::channel(self.inbound_buffer);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(decode_loop(contact, transport, inbound_tx, stop_rx));
        state.readers.insert(contact, Reader { inbound, stop, task });
        debug!("Started reading from contact {}", contact);
        Ok(())
    }

    fn take_reader(&self, contact: ContactId) -> Result<Option<Reader>, DeliveryError> {
        Ok(lock_state(&self.state)?.readers.remove(&contact))
    }

    fn take_transport(&self, contact: ContactId) -> Result<Option<Arc<dyn Transport>>, DeliveryError> {
        Ok(lock_state(&self.state)?.transports.remove(&contact))
    }

    async fn forget(&self, contact: ContactId) -> Result<(), DeliveryError> {
        if let Some(reader) = self.take_reader(contact)? {
            stop_reader(reader).await;
        }
        if let Some(transport) = self.take_transport(contact)? {
            transport.halt().await;
        }
        info!("Forgot transport for contact {}", contact);
        Ok(())
    }

    fn reading_contacts(&self) -> Result<Vec<ContactId>, DeliveryError> {
        Ok(lock_state(&self.state)?.readers.keys().copied().collect())
    }

    fn transport_for(&self, contact: ContactId) -> Result<Arc<dyn Transport>, DeliveryError> {
        lock_state(&self.state)?
            .transports
            .get(&contact)
            .cloned()
            .ok_or(DeliveryError::NotDialed(contact))
    }

    /// One pass over every registered contact
    ///
    /// Errors are logged per contact so one broken transport does not hold
    /// up the others.
    pub(crate) async fn poll_once(&self) {
        let contacts = match self.reading_contacts() {
            Ok(contacts) => contacts,
            Err(e) => {
                error!("Cannot list registered contacts: {}", e);
                return;
            }
        };
        for contact in contacts {
            if let Err(e) = self.send_next(contact).await {
                warn!("Sending to contact {} failed: {}", contact, e);
            }
            if let Err(e) = self.receive_next(contact) {
                warn!("Receiving from contact {} failed: {}", contact, e);
            }
        }
    }

    /// Write the head of the contact's queue, popping it once the write succeeded
    async fn send_next(&self, contact: ContactId) -> Result<(), DeliveryError> {
        let msg = match self.store.peek_outbound(contact) {
            Ok(msg) => msg,
            Err(StoreError::QueueEmpty) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let transport = self.transport_for(contact)?;

        let frame = match encode_frame(&msg) {
            Ok(frame) => frame,
            Err(e @ CodecError::FrameTooLarge(_)) => {
                // Would block the queue forever
                error!("Discarding message {} queued for contact {}: {}", msg.id, contact, e);
                self.store.pop_outbound(contact)?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        transport.write(&frame).await?;
        let popped = self.store.pop_outbound(contact)?;
        trace!("Wrote message {} to contact {}", popped.id, contact);
        publish(&self.events, MailboxEvent::MessageSent { contact, message: popped.id });
        Ok(())
    }

    fn try_next_inbound(&self, contact: ContactId) -> Result<Option<WireMessage>, DeliveryError> {
        let mut state = lock_state(&self.state)?;
        let result = match state.readers.get_mut(&contact) {
            Some(reader) => reader.inbound.try_recv(),
            None => return Ok(None),
        };
        match result {
            Ok(wire) => Ok(Some(wire)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                info!("Stream from contact {} ended", contact);
                state.readers.remove(&contact);
                Ok(None)
            }
        }
    }

    /// Hand at most one buffered inbound message to the store
    fn receive_next(&self, contact: ContactId) -> Result<(), DeliveryError> {
        let wire = match self.try_next_inbound(contact)? {
            Some(wire) => wire,
            None => return Ok(()),
        };
        let msg = wire.into_message(contact);
        let conversation = msg.conversation;
        let (delivered, adopted) = self.store.deliver_or_adopt(msg)?;
        if adopted {
            publish(&self.events, MailboxEvent::ConversationCreated(conversation));
        }
        debug!("Received message {} from contact {}", delivered.id, contact);
        publish(&self.events, MailboxEvent::MessageReceived(delivered));
        Ok(())
    }

    fn drain_state(&self) -> Result<WorkerState, DeliveryError> {
        Ok(std::mem::take(&mut *lock_state(&self.state)?))
    }

    async fn shutdown(&self) {
        let state = match self.drain_state() {
            Ok(state) => state,
            Err(e) => {
                error!("Cannot drain worker state on halt: {}", e);
                return;
            }
        };

        for reader in state.readers.values() {
            let _ = reader.stop.send(true);
        }
        join_all(state.readers.into_values().map(|reader| reader.task)).await;

        for (contact, transport) in state.transports {
            match transport.save_state().await {
                Ok(saved) => {
                    if let Err(e) = self.store.put_transport_state(contact, &saved) {
                        error!("Failed to save transport state for contact {}: {}", contact, e);
                    }
                }
                Err(e) => warn!("Transport for contact {} has no state to save: {}", contact, e),
            }
            transport.halt().await;
        }
    }
}

/// Read chunks from `transport` and forward every complete frame
async fn decode_loop(
    contact: ContactId,
    transport: Arc<dyn Transport>,
    inbound: mpsc::Sender<WireMessage>,
    mut stop: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::new();
    'read: loop {
        let chunk = tokio::select! {
            _ = wait_for_halt(&mut stop) => break,
            chunk = transport.read() => chunk,
        };
        match chunk {
            Ok(bytes) => decoder.push(&bytes),
            Err(TransportError::Halted) | Err(TransportError::Closed) => {
                debug!("Transport for contact {} closed", contact);
                break;
            }
            Err(e) => {
                warn!("Reading from contact {} failed: {}", contact, e);
                break;
            }
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(wire)) => {
                    tokio::select! {
                        _ = wait_for_halt(&mut stop) => break 'read,
                        sent = inbound.send(wire) => {
                            if sent.is_err() {
                                break 'read;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Dropping stream from contact {}: {}", contact, e);
                    break 'read;
                }
            }
        }
    }
    debug!("Decode loop for contact {} exited", contact);
}
