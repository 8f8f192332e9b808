// src/rfid/mod.rs - Proximity tag scanner driving the actuator on a marker match
pub mod frame;
pub mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::actuator::ActuatorPulse;
use crate::config::{RfidConfig, SessionStrategy};
use crate::device::{Device, DeviceError};
use crate::gpio::GpioError;
use crate::journal::{self, EventJournal};
use self::frame::{contains_marker, extract_ascii_snippet, extract_hex_bytes, extract_identifier};
use self::session::{SessionError, TagSession, open_session};

/// Tag system information query; the reply carries the UID.
pub const INFO_COMMAND: &str = "hf 15 info";

pub fn read_block_command(block: u32) -> String {
    format!("hf 15 readblock {}", block)
}

pub fn read_multi_command(first: u32, count: u32) -> String {
    format!("hf 15 rdmulti -* -b {} --cnt {}", first, count)
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Actuator error: {0}")]
    Actuator(#[from] GpioError),
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// No tag answered the identifier query.
    NoTag,
    /// Same tag as last cycle; memory was not read again.
    Unchanged,
    /// Memory was read and searched for the marker.
    Scanned {
        identifier: Option<String>,
        detected: bool,
    },
}

/// State visible outside the worker.
#[derive(Debug, Default)]
pub struct ScannerState {
    running: AtomicBool,
    last_identifier: RwLock<String>,
}

impl ScannerState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn last_identifier(&self) -> String {
        self.last_identifier.read().await.clone()
    }
}

/// One scanner's poll logic, owned by its worker task.
pub struct ScanCycle {
    config: RfidConfig,
    session: Arc<dyn TagSession>,
    actuator: Arc<ActuatorPulse>,
    journal: Arc<dyn EventJournal>,
    state: Arc<ScannerState>,
    last_identifier: String,
}

impl ScanCycle {
    pub fn new(
        config: RfidConfig,
        session: Arc<dyn TagSession>,
        actuator: Arc<ActuatorPulse>,
        journal: Arc<dyn EventJournal>,
        state: Arc<ScannerState>,
    ) -> Self {
        Self {
            config,
            session,
            actuator,
            journal,
            state,
            last_identifier: String::new(),
        }
    }

    pub fn last_identifier(&self) -> &str {
        &self.last_identifier
    }

    pub async fn scan_once(&mut self) -> Result<ScanOutcome, ScanError> {
        let identifier = match self.config.strategy {
            SessionStrategy::Persistent => match self.query_identifier().await? {
                Some(uid) => Some(uid),
                None => {
                    self.remember(String::new()).await;
                    return Ok(ScanOutcome::NoTag);
                }
            },
            // One-shot invocations are too slow to spend one on the UID.
            SessionStrategy::OneShot => None,
        };

        if let Some(uid) = &identifier {
            if self.config.deduplicate && *uid == self.last_identifier {
                return Ok(ScanOutcome::Unchanged);
            }
            self.record(&journal::scanning_message(uid)).await;
        }

        let memory = self.read_memory().await?;
        let target = self.config.target.as_bytes();
        let detected = extract_ascii_snippet(&memory.bytes, target, self.config.snippet_padding)
            .is_some_and(|snippet| contains_marker(&snippet, target));

        // A partial read that missed the marker is retried next cycle.
        if let Some(uid) = &identifier {
            if memory.complete || detected {
                self.remember(uid.clone()).await;
            }
        }

        if detected {
            self.record(&journal::found_message(identifier.as_deref())).await;
            self.actuator.pulse().await?;
        }

        Ok(ScanOutcome::Scanned { identifier, detected })
    }

    async fn query_identifier(&mut self) -> Result<Option<String>, ScanError> {
        match self.session.execute(INFO_COMMAND).await {
            Ok(out) => Ok(extract_identifier(&out)),
            Err(e) => {
                // A failed query counts as "no tag" for the memo.
                self.remember(String::new()).await;
                Err(e.into())
            }
        }
    }

    async fn read_memory(&self) -> Result<MemoryRead, ScanError> {
        match self.config.strategy {
            SessionStrategy::OneShot => {
                let out = self
                    .session
                    .execute(&read_multi_command(self.config.first_block, self.config.block_count))
                    .await?;
                Ok(MemoryRead {
                    bytes: extract_hex_bytes(&out),
                    complete: true,
                })
            }
            SessionStrategy::Persistent => {
                let mut bytes = Vec::new();
                let mut read: usize = 0;
                let mut last_error = None;
                for block in self.config.blocks() {
                    match self.session.execute(&read_block_command(block)).await {
                        Ok(out) => {
                            bytes.extend(extract_hex_bytes(&out));
                            read += 1;
                        }
                        Err(e) => {
                            tracing::debug!("Skipping block {}: {}", block, e);
                            last_error = Some(e);
                        }
                    }
                }
                match last_error {
                    Some(e) if read == 0 => Err(e.into()),
                    last_error => Ok(MemoryRead {
                        bytes,
                        complete: last_error.is_none(),
                    }),
                }
            }
        }
    }

    async fn remember(&mut self, uid: String) {
        if uid == self.last_identifier {
            return;
        }
        *self.state.last_identifier.write().await = uid.clone();
        self.last_identifier = uid;
    }

    async fn record(&self, message: &str) {
        tracing::info!("{}", message);
        if let Err(e) = self.journal.record(message).await {
            tracing::warn!("Failed to write to journal: {}", e);
        }
    }
}

/// Tag memory gathered in one cycle.
struct MemoryRead {
    bytes: Vec<u8>,
    // Every configured block answered.
    complete: bool,
}

struct Worker {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    session: Arc<dyn TagSession>,
}

/// Background tag scanner. Start with `init`, stop with `close`.
pub struct TagScanner {
    config: RfidConfig,
    actuator: Arc<ActuatorPulse>,
    journal: Arc<dyn EventJournal>,
    // Injected session; when absent one is opened per `config.strategy`.
    session: Option<Arc<dyn TagSession>>,
    state: Arc<ScannerState>,
    worker: Mutex<Option<Worker>>,
}

impl TagScanner {
    pub fn new(config: RfidConfig, actuator: Arc<ActuatorPulse>, journal: Arc<dyn EventJournal>) -> Self {
        Self {
            config,
            actuator,
            journal,
            session: None,
            state: Arc::new(ScannerState::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn with_session(mut self, session: Arc<dyn TagSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn state(&self) -> Arc<ScannerState> {
        self.state.clone()
    }

    pub async fn last_identifier(&self) -> String {
        self.state.last_identifier().await
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

#[async_trait]
impl Device for TagScanner {
    async fn init(&self) -> Result<(), DeviceError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }

        let session = match &self.session {
            Some(session) => session.clone(),
            None => open_session(&self.config).await?,
        };

        let cycle = ScanCycle::new(
            self.config.clone(),
            session.clone(),
            self.actuator.clone(),
            self.journal.clone(),
            self.state.clone(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(scan_loop(cycle, shutdown_rx));

        self.state.running.store(true, Ordering::Release);
        *worker = Some(Worker {
            shutdown_tx,
            handle,
            session,
        });
        tracing::info!(
            "Tag scanner started ({:?}, every {:?}, target '{}')",
            self.config.strategy,
            self.config.poll_interval(),
            self.config.target
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let worker = self.worker.lock().await.take();
        let Some(mut worker) = worker else {
            self.state.running.store(false, Ordering::Release);
            return Ok(());
        };

        let _ = worker.shutdown_tx.send(());
        let grace = self.config.response_timeout() + self.config.poll_interval() + self.actuator.duration();
        let joined = match tokio::time::timeout(grace, &mut worker.handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("Tag scanner did not stop within {:?}, killing session", grace);
                if let Err(e) = worker.session.terminate().await {
                    tracing::warn!("Failed to kill tag tool session: {}", e);
                }
                worker.handle.await
            }
        };
        let terminated = worker.session.terminate().await;
        self.state.running.store(false, Ordering::Release);

        if let Err(e) = &joined {
            tracing::error!("Tag scanner worker failed: {}", e);
        }
        joined?;
        terminated?;
        tracing::info!("Tag scanner stopped");
        Ok(())
    }

    async fn info(&self) -> String {
        if self.is_running() {
            "running".to_string()
        } else {
            "stopped".to_string()
        }
    }
}

async fn scan_loop(mut cycle: ScanCycle, mut shutdown_rx: broadcast::Receiver<()>) {
    let interval = cycle.config.poll_interval();
    loop {
        match shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        match cycle.scan_once().await {
            Ok(outcome) => tracing::trace!("Scan outcome: {:?}", outcome),
            Err(e) => tracing::warn!("Tag scan failed: {}", e),
        }

        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.recv() => break,
        }
    }
}
