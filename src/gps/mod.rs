// src/gps/mod.rs - Background-reading GPS receiver
pub mod nmea;
pub mod serial;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use crate::config::GpsConfig;
use crate::device::{Device, DeviceError, Sensor};
use self::nmea::{KNOTS_TO_KPH, Sentence};
use self::serial::{ByteStream, LinuxSerial, SerialInterface};

/// Delay before retrying after a failed or empty read.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Longest line kept; NMEA sentences are at most 82 bytes.
const MAX_LINE: usize = 256;

/// Latest values decoded from the receiver. Each sentence type overwrites
/// only the fields it carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub time: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub satellites: i32,
    pub speed_kph: f64,
    pub track_deg: f64,
    pub valid_fix: bool,
}

impl PositionSnapshot {
    pub fn apply(&mut self, sentence: &Sentence) {
        match sentence {
            Sentence::Fix(fix) => {
                self.time = format_time(&fix.time);
                self.latitude = fix.latitude;
                self.longitude = fix.longitude;
                self.altitude = fix.altitude;
                self.satellites = fix.satellites;
                self.valid_fix = fix.fix_quality > 0;
            }
            Sentence::Recommended(rmc) => {
                self.time = format_time(&rmc.time);
                self.latitude = rmc.latitude;
                self.longitude = rmc.longitude;
                self.speed_kph = rmc.speed_knots * KNOTS_TO_KPH;
                self.track_deg = rmc.course;
                self.valid_fix = rmc.validity == 'A';
            }
        }
    }

    /// Apply one raw line. Returns `false` (and leaves the snapshot alone)
    /// for blank lines, non-sentence noise and anything that fails to parse.
    pub fn apply_line(&mut self, line: &str) -> bool {
        match decode_line(line) {
            Some(sentence) => {
                self.apply(&sentence);
                true
            }
            None => false,
        }
    }
}

fn format_time(time: &chrono::NaiveTime) -> String {
    time.format("%H:%M:%S%.3f").to_string()
}

fn decode_line(line: &str) -> Option<Sentence> {
    let line = line.trim_end_matches(['\r', '\n']);
    if !line.starts_with('$') {
        return None;
    }
    match nmea::parse(line) {
        Ok(sentence) => Some(sentence),
        Err(e) => {
            tracing::trace!("Dropping GPS line '{}': {}", line, e);
            None
        }
    }
}

/// Splits a byte stream into lines of at most `MAX_LINE` bytes. A longer run
/// without a newline is dropped whole, up to and including its newline.
struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(MAX_LINE),
            discarding: false,
        }
    }

    /// Next line, lossily decoded; `Ok(None)` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            self.buffer.clear();
            let n = (&mut self.inner)
                .take(MAX_LINE as u64)
                .read_until(b'\n', &mut self.buffer)
                .await?;
            if n == 0 {
                return Ok(None);
            }

            let overlong = n >= MAX_LINE && self.buffer.last() != Some(&b'\n');
            if overlong && !self.discarding {
                tracing::trace!("Dropping GPS line longer than {} bytes", MAX_LINE);
            }
            if self.discarding || overlong {
                // Still inside an overlong run until a chunk ends with a newline.
                self.discarding = overlong;
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(&self.buffer).into_owned()));
        }
    }
}

struct Worker {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// GPS receiver on a serial port, read by a dedicated background task.
pub struct GpsReader {
    config: GpsConfig,
    serial: Arc<dyn SerialInterface>,
    snapshot: Arc<RwLock<PositionSnapshot>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl GpsReader {
    pub fn new(config: GpsConfig) -> Self {
        Self::with_serial(config, Arc::new(LinuxSerial))
    }

    pub fn with_serial(config: GpsConfig, serial: Arc<dyn SerialInterface>) -> Self {
        Self {
            config,
            serial,
            snapshot: Arc::new(RwLock::new(PositionSnapshot::default())),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Consistent copy of the latest snapshot.
    pub async fn snapshot(&self) -> PositionSnapshot {
        self.snapshot.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Device for GpsReader {
    async fn init(&self) -> Result<(), DeviceError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }

        tracing::info!("Opening GPS on {} at {} baud", self.config.serial, self.config.baud);
        let stream = match self.serial.open(&self.config.serial, self.config.baud).await {
            Ok(stream) => stream,
            Err(e) => {
                // A missing receiver degrades status, it does not fail startup.
                tracing::warn!("Failed to open GPS port {}: {}", self.config.serial, e);
                tracing::debug!("Available serial ports: {:?}", self.serial.available_ports());
                self.running.store(false, Ordering::Release);
                return Ok(());
            }
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(read_loop(
            stream,
            self.snapshot.clone(),
            self.running.clone(),
            shutdown_rx,
        ));
        *worker = Some(Worker { shutdown_tx, handle });
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.shutdown_tx.send(());
            worker.handle.await?;
            tracing::info!("GPS reader stopped");
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }

    async fn info(&self) -> String {
        if !self.is_running() {
            return "offline".to_string();
        }
        if self.snapshot.read().await.valid_fix {
            "online (fix)".to_string()
        } else {
            "online (no fix)".to_string()
        }
    }
}

#[async_trait]
impl Sensor for GpsReader {
    async fn read(&self) -> Result<serde_json::Value, DeviceError> {
        let snapshot = self.snapshot().await;
        Ok(serde_json::to_value(snapshot)?)
    }
}

/// Sleep before a retry; returns `true` if shutdown was requested meanwhile.
async fn pause(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = sleep(RETRY_DELAY) => false,
        _ = shutdown_rx.recv() => true,
    }
}

async fn read_loop(
    stream: ByteStream,
    snapshot: Arc<RwLock<PositionSnapshot>>,
    running: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut lines = LineReader::new(BufReader::new(stream));

    loop {
        match shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        let read = tokio::select! {
            read = lines.next_line() => read,
            _ = shutdown_rx.recv() => break,
        };

        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => {
                if pause(&mut shutdown_rx).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!("GPS read error: {}", e);
                if pause(&mut shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        let Some(sentence) = decode_line(&line) else {
            continue;
        };

        snapshot.write().await.apply(&sentence);
        running.store(true, Ordering::Release);
    }

    running.store(false, Ordering::Release);
}
