// Common test utilities for integration tests
// In-process stand-ins for the network session, transports and rendezvous
#![allow(dead_code)]

// Standard library imports
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

// External crate imports
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, LevelFilter};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::timeout;

// Import the crate functionality
use mailbox::delivery::{FrameDecoder, WireMessage};
use mailbox::exchange::{ExchangeParams, ExchangeUpdate, Rendezvous, UpdateSender};
use mailbox::transport::{wait_for_halt, Session, Transport, TransportError};
use mailbox::MailboxEvent;

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Default wait for anything asynchronous in a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive events until one matches `pred`
pub async fn wait_for_event<F>(events: &mut mpsc::Receiver<MailboxEvent>, mut pred: F) -> Result<MailboxEvent>
where
    F: FnMut(&MailboxEvent) -> bool,
{
    timeout(TEST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            debug!("Test saw event {:?}", event);
            if pred(&event) {
                return Ok(event);
            }
        }
        Err(anyhow!("Event channel closed"))
    })
    .await
    .map_err(|_| anyhow!("Timed out waiting for event"))?
}

/// Poll `check` until it returns true
pub async fn wait_until<F>(mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("Timed out waiting for condition"))
}

/// Raw ends of a loopback stream, kept by the network so transports can be resumed
struct Endpoint {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Arc<TokioMutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// One end of an in-memory byte stream
pub struct LoopbackTransport {
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Arc<TokioMutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    halt_tx: watch::Sender<bool>,
    halt_rx: watch::Receiver<bool>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl LoopbackTransport {
    fn from_endpoint(id: u64, endpoint: &Endpoint) -> Arc<Self> {
        let (halt_tx, halt_rx) = watch::channel(false);
        Arc::new(Self {
            id,
            outbound: endpoint.outbound.clone(),
            inbound: endpoint.inbound.clone(),
            halt_tx,
            halt_rx,
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Make every following write fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        *self.halt_rx.borrow()
    }

    /// Read and decode `count` frames from this end
    pub async fn read_frames(&self, count: usize) -> Result<Vec<WireMessage>> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        let result = timeout(TEST_TIMEOUT, async {
            while frames.len() < count {
                let chunk = self.read().await?;
                decoder.push(&chunk);
                while let Some(frame) = decoder.next_frame()? {
                    frames.push(frame);
                }
            }
            Ok::<_, anyhow::Error>(())
        })
        .await;
        match result {
            Ok(read) => read?,
            Err(_) => return Err(anyhow!("Timed out after reading {} of {} frames", frames.len(), count)),
        }
        Ok(frames)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_halted() {
            return Err(TransportError::Halted);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("injected write failure".to_string()));
        }
        self.outbound.send(data.to_vec()).map_err(|_| TransportError::Closed)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut halt = self.halt_rx.clone();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = wait_for_halt(&mut halt) => Err(TransportError::Halted),
            chunk = inbound.recv() => chunk.ok_or(TransportError::Closed),
        }
    }

    async fn halt(&self) {
        let _ = self.halt_tx.send(true);
    }

    fn halted(&self) -> watch::Receiver<bool> {
        self.halt_rx.clone()
    }

    async fn save_state(&self) -> Result<Vec<u8>, TransportError> {
        Ok(self.id.to_be_bytes().to_vec())
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<u64, Endpoint>,
    /// Transport secret -> (listener end, dialer end)
    pairs: HashMap<Vec<u8>, (u64, u64)>,
}

/// Shared in-memory network every test session attaches to
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
    next_id: Arc<AtomicU64>,
    board: Arc<Mutex<HashMap<Vec<u8>, Vec<Vec<u8>>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_pair(&self, inner: &mut NetworkInner) -> (u64, u64) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let b = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        inner.endpoints.insert(
            a,
            Endpoint {
                outbound: b_tx,
                inbound: Arc::new(TokioMutex::new(a_rx)),
            },
        );
        inner.endpoints.insert(
            b,
            Endpoint {
                outbound: a_tx,
                inbound: Arc::new(TokioMutex::new(b_rx)),
            },
        );
        (a, b)
    }

    fn transport(&self, id: u64) -> Option<Arc<LoopbackTransport>> {
        let inner = self.inner.lock().unwrap();
        inner.endpoints.get(&id).map(|endpoint| LoopbackTransport::from_endpoint(id, endpoint))
    }

    /// Two connected transport ends
    pub fn connect_pair(&self) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let (a, b) = {
            let mut inner = self.inner.lock().unwrap();
            self.insert_pair(&mut inner)
        };
        (self.transport(a).unwrap(), self.transport(b).unwrap())
    }

    fn end_for(&self, secret: &[u8], listener: bool) -> Result<Arc<LoopbackTransport>, TransportError> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let pair = match inner.pairs.get(secret) {
                Some(pair) => *pair,
                None => {
                    let pair = self.insert_pair(&mut inner);
                    inner.pairs.insert(secret.to_vec(), pair);
                    pair
                }
            };
            if listener {
                pair.0
            } else {
                pair.1
            }
        };
        self.transport(id).ok_or_else(|| TransportError::Io(format!("no endpoint {}", id)))
    }

    /// Whether a listen/dial pair exists for the transport secret
    pub fn has_pair(&self, secret: &[u8]) -> bool {
        self.inner.lock().unwrap().pairs.contains_key(secret)
    }

    /// A session attached to this network
    pub fn session(&self, name: &str, rendezvous: Arc<dyn Rendezvous>) -> Arc<LoopbackSession> {
        Arc::new(LoopbackSession {
            name: name.to_string(),
            network: self.clone(),
            shared_random: Some(b"epoch 1".to_vec()),
            rendezvous,
            resumed: AtomicUsize::new(0),
        })
    }

    /// A session that has no network document yet
    pub fn session_without_document(&self, name: &str, rendezvous: Arc<dyn Rendezvous>) -> Arc<LoopbackSession> {
        Arc::new(LoopbackSession {
            name: name.to_string(),
            network: self.clone(),
            shared_random: None,
            rendezvous,
            resumed: AtomicUsize::new(0),
        })
    }

    /// Rendezvous that pairs parties on the same secret through this network
    pub fn rendezvous(&self) -> Arc<PairedRendezvous> {
        Arc::new(PairedRendezvous {
            board: self.board.clone(),
            runs: Mutex::new(Vec::new()),
        })
    }
}

pub struct LoopbackSession {
    name: String,
    network: LoopbackNetwork,
    shared_random: Option<Vec<u8>>,
    rendezvous: Arc<dyn Rendezvous>,
    resumed: AtomicUsize,
}

impl LoopbackSession {
    /// Number of transports rebuilt from saved state
    pub fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for LoopbackSession {
    fn id(&self) -> String {
        self.name.clone()
    }

    async fn shared_random(&self) -> Option<Vec<u8>> {
        self.shared_random.clone()
    }

    async fn listen(&self, secret: &[u8]) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = self.network.end_for(secret, true)?;
        Ok(transport)
    }

    async fn dial(&self, secret: &[u8]) -> Result<Arc<dyn Transport>, TransportError> {
        let transport: Arc<dyn Transport> = self.network.end_for(secret, false)?;
        Ok(transport)
    }

    async fn resume(&self, state: &[u8]) -> Result<Arc<dyn Transport>, TransportError> {
        let bytes: [u8; 8] = state
            .try_into()
            .map_err(|_| TransportError::Io("bad transport state".to_string()))?;
        let id = u64::from_be_bytes(bytes);
        let transport = self
            .network
            .transport(id)
            .ok_or_else(|| TransportError::Io(format!("unknown transport {}", id)))?;
        self.resumed.fetch_add(1, Ordering::SeqCst);
        info!("Session {} resumed transport {}", self.name, id);
        Ok(transport)
    }

    fn rendezvous(&self) -> Arc<dyn Rendezvous> {
        self.rendezvous.clone()
    }
}

/// Rendezvous over a shared board: publish our payload once, then poll for
/// the other party's payload under the same secret and epoch
pub struct PairedRendezvous {
    board: Arc<Mutex<HashMap<Vec<u8>, Vec<Vec<u8>>>>>,
    runs: Mutex<Vec<Option<Vec<u8>>>>,
}

impl PairedRendezvous {
    /// Resume state each run was started with
    pub fn runs(&self) -> Vec<Option<Vec<u8>>> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Rendezvous for PairedRendezvous {
    async fn run(&self, params: ExchangeParams, updates: UpdateSender) {
        self.runs.lock().unwrap().push(params.resume.clone());
        let mut key = params.secret.to_vec();
        key.extend_from_slice(&params.shared_random);

        if params.resume.is_none() {
            {
                let mut board = self.board.lock().unwrap();
                let slots = board.entry(key.clone()).or_default();
                if !slots.contains(&params.payload) {
                    slots.push(params.payload.clone());
                }
            }
            if updates.send(ExchangeUpdate::Checkpoint(b"published".to_vec())).await.is_err() {
                return;
            }
        }

        loop {
            let peer = {
                let board = self.board.lock().unwrap();
                board
                    .get(&key)
                    .and_then(|slots| slots.iter().find(|p| **p != params.payload).cloned())
            };
            if let Some(peer) = peer {
                let _ = updates.send(ExchangeUpdate::Completed(peer)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// One scripted run: the updates to report, then whether to hang
pub struct Script {
    pub updates: Vec<ExchangeUpdate>,
    pub hang: bool,
}

/// Rendezvous that plays back prepared updates, one script per run
pub struct ScriptedRendezvous {
    scripts: Mutex<VecDeque<Script>>,
    runs: Mutex<Vec<Option<Vec<u8>>>>,
}

impl ScriptedRendezvous {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            runs: Mutex::new(Vec::new()),
        })
    }

    pub fn runs(&self) -> Vec<Option<Vec<u8>>> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Rendezvous for ScriptedRendezvous {
    async fn run(&self, params: ExchangeParams, updates: UpdateSender) {
        self.runs.lock().unwrap().push(params.resume.clone());
        let script = self.scripts.lock().unwrap().pop_front();
        let Some(script) = script else {
            return;
        };
        for update in script.updates {
            if updates.send(update).await.is_err() {
                return;
            }
        }
        if script.hang {
            std::future::pending::<()>().await;
        }
    }
}
