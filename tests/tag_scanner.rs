// Integration tests for the tag scanner poll cycle and its worker lifecycle

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use moto_hal::actuator::ActuatorPulse;
use moto_hal::config::{ActuatorConfig, RfidConfig, SessionStrategy};
use moto_hal::device::{Device, DeviceError};
use moto_hal::gpio::{GpioDriver, GpioError, OutputPin};
use moto_hal::journal::{EventJournal, JournalError};
use moto_hal::rfid::session::{SessionError, TagSession};
use moto_hal::rfid::{ScanCycle, ScanError, ScanOutcome, ScannerState, TagScanner};
use tokio::sync::watch;

const TARGET: &str = "enzogenovese.com";

#[derive(Default)]
struct RecordingDriver {
    writes: Mutex<Vec<(u32, bool)>>,
}

impl RecordingDriver {
    /// Number of completed pulses (each pulse asserts the trigger once).
    fn pulses(&self) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(pin, level)| *pin == 21 && *level)
            .count()
    }
}

#[async_trait]
impl GpioDriver for RecordingDriver {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn write_pin(&self, pin: &OutputPin, level: bool) -> Result<(), GpioError> {
        self.writes.lock().unwrap().push((pin.gpio, level));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryJournal {
    entries: Mutex<Vec<String>>,
    broken: bool,
}

impl MemoryJournal {
    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn count(&self, tag: &str) -> usize {
        self.entries().iter().filter(|e| e.contains(tag)).count()
    }
}

#[async_trait]
impl EventJournal for MemoryJournal {
    async fn record(&self, message: &str) -> Result<(), JournalError> {
        if self.broken {
            return Err(JournalError::Spawn(std::io::Error::other("no logger")));
        }
        self.entries.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

/// Answers tag-tool commands from a fake tag's UID and memory.
struct ScriptedSession {
    uid: Mutex<Option<String>>,
    memory: Vec<u8>,
    failing_blocks: Mutex<Vec<usize>>,
    commands: Mutex<Vec<String>>,
    terminated: Mutex<usize>,
}

impl ScriptedSession {
    fn new(uid: Option<&str>, memory: &[u8]) -> Self {
        Self {
            uid: Mutex::new(uid.map(str::to_string)),
            memory: memory.to_vec(),
            failing_blocks: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            terminated: Mutex::new(0),
        }
    }

    fn set_uid(&self, uid: Option<&str>) {
        *self.uid.lock().unwrap() = uid.map(str::to_string);
    }

    fn fail_blocks(&self, blocks: &[usize]) {
        *self.failing_blocks.lock().unwrap() = blocks.to_vec();
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn block_reads(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with("hf 15 readblock") || c.starts_with("hf 15 rdmulti"))
            .count()
    }

    fn block_hex(&self, block: usize) -> String {
        self.memory
            .chunks(4)
            .nth(block)
            .map(|chunk| chunk.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" "))
            .unwrap_or_default()
    }
}

#[async_trait]
impl TagSession for ScriptedSession {
    async fn execute(&self, command: &str) -> Result<String, SessionError> {
        self.commands.lock().unwrap().push(command.to_string());

        if command == "hf 15 info" {
            return Ok(match self.uid.lock().unwrap().as_deref() {
                Some(uid) => format!("[+]  UID.......... {}\n[+]  TYPE... NXP\npm3> ", uid),
                None => "[-] No tag found.\npm3> ".to_string(),
            });
        }
        if let Some(block) = command.strip_prefix("hf 15 readblock ") {
            let block: usize = block.trim().parse().unwrap();
            if self.failing_blocks.lock().unwrap().contains(&block) {
                return Err(SessionError::Timeout(Duration::from_millis(5)));
            }
            return Ok(format!("[+] {}\npm3> ", self.block_hex(block)));
        }
        if command.starts_with("hf 15 rdmulti") {
            let rows: String = (0..self.memory.len().div_ceil(4))
                .map(|b| format!("[=] {:>2} | {} |     | ....\n", b, self.block_hex(b)))
                .collect();
            return Ok(rows);
        }
        Err(SessionError::Closed)
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        *self.terminated.lock().unwrap() += 1;
        Ok(())
    }
}

/// 28 bytes: the marker with six bytes of filler either side.
fn tag_memory() -> Vec<u8> {
    let mut memory = vec![0x00, 0x01, 0x02, b'h', b't', b'/'];
    memory.extend_from_slice(TARGET.as_bytes());
    memory.extend_from_slice(b"/x\xff\x00\x00\x00");
    memory
}

fn rfid_config(strategy: SessionStrategy) -> RfidConfig {
    RfidConfig {
        strategy,
        target: TARGET.to_string(),
        poll_interval_ms: 5,
        block_count: 7,
        ..RfidConfig::default()
    }
}

struct Rig {
    driver: Arc<RecordingDriver>,
    journal: Arc<MemoryJournal>,
    session: Arc<ScriptedSession>,
    actuator: Arc<ActuatorPulse>,
}

impl Rig {
    fn new(session: ScriptedSession, journal: MemoryJournal) -> Self {
        let driver = Arc::new(RecordingDriver::default());
        let actuator_config = ActuatorConfig {
            pulse_ms: 1,
            ..ActuatorConfig::default()
        };
        let actuator = Arc::new(ActuatorPulse::with_driver(&actuator_config, driver.clone()));
        Self {
            driver,
            journal: Arc::new(journal),
            session: Arc::new(session),
            actuator,
        }
    }

    fn cycle(&self, config: RfidConfig) -> (ScanCycle, Arc<ScannerState>) {
        let state = Arc::new(ScannerState::default());
        let cycle = ScanCycle::new(
            config,
            self.session.clone(),
            self.actuator.clone(),
            self.journal.clone(),
            state.clone(),
        );
        (cycle, state)
    }

    fn scanner(&self, config: RfidConfig) -> TagScanner {
        TagScanner::new(config, self.actuator.clone(), self.journal.clone())
            .with_session(self.session.clone())
    }
}

#[tokio::test]
async fn test_marker_triggers_exactly_one_pulse() {
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 12 34 56 78"), &tag_memory()),
        MemoryJournal::default(),
    );
    let (mut cycle, state) = rig.cycle(rfid_config(SessionStrategy::Persistent));

    let outcome = cycle.scan_once().await.unwrap();
    assert_eq!(
        outcome,
        ScanOutcome::Scanned {
            identifier: Some("E004015012345678".to_string()),
            detected: true,
        }
    );
    assert_eq!(rig.driver.pulses(), 1);
    assert_eq!(rig.journal.count("[FOUND_VALID_RFID]"), 1);
    assert_eq!(rig.journal.count("[SCANNING_RFID]"), 1);
    assert_eq!(state.last_identifier().await, "E004015012345678");
    assert_eq!(rig.session.block_reads(), 7);
}

#[tokio::test]
async fn test_absent_tag_leaves_identifier_empty() {
    let rig = Rig::new(ScriptedSession::new(None, &tag_memory()), MemoryJournal::default());
    let (mut cycle, state) = rig.cycle(rfid_config(SessionStrategy::Persistent));

    assert_eq!(cycle.scan_once().await.unwrap(), ScanOutcome::NoTag);
    assert_eq!(cycle.scan_once().await.unwrap(), ScanOutcome::NoTag);

    assert_eq!(cycle.last_identifier(), "");
    assert_eq!(state.last_identifier().await, "");
    assert_eq!(rig.session.commands(), vec!["hf 15 info", "hf 15 info"]);
    assert_eq!(rig.driver.pulses(), 0);
    assert!(rig.journal.entries().is_empty());
}

#[tokio::test]
async fn test_same_tag_is_not_rescanned() {
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 12 34 56 78"), &tag_memory()),
        MemoryJournal::default(),
    );
    let (mut cycle, _state) = rig.cycle(rfid_config(SessionStrategy::Persistent));

    cycle.scan_once().await.unwrap();
    assert_eq!(cycle.scan_once().await.unwrap(), ScanOutcome::Unchanged);
    assert_eq!(rig.driver.pulses(), 1);

    // Tag leaves the field and comes back: scanned again
    rig.session.set_uid(None);
    assert_eq!(cycle.scan_once().await.unwrap(), ScanOutcome::NoTag);
    rig.session.set_uid(Some("E0 04 01 50 12 34 56 78"));
    assert!(matches!(
        cycle.scan_once().await.unwrap(),
        ScanOutcome::Scanned { detected: true, .. }
    ));
    assert_eq!(rig.driver.pulses(), 2);
}

#[tokio::test]
async fn test_without_deduplication_every_cycle_scans() {
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 12 34 56 78"), &tag_memory()),
        MemoryJournal::default(),
    );
    let config = RfidConfig {
        deduplicate: false,
        ..rfid_config(SessionStrategy::Persistent)
    };
    let (mut cycle, _state) = rig.cycle(config);

    cycle.scan_once().await.unwrap();
    cycle.scan_once().await.unwrap();
    assert_eq!(rig.driver.pulses(), 2);
    assert_eq!(rig.journal.count("[FOUND_VALID_RFID]"), 2);
}

#[tokio::test]
async fn test_unmarked_tag_does_not_pulse() {
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 AA BB CC DD"), b"just some other data"),
        MemoryJournal::default(),
    );
    let (mut cycle, state) = rig.cycle(rfid_config(SessionStrategy::Persistent));

    let outcome = cycle.scan_once().await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Scanned { detected: false, .. }));
    assert_eq!(rig.driver.pulses(), 0);
    assert_eq!(rig.journal.count("[FOUND_VALID_RFID]"), 0);
    assert_eq!(state.last_identifier().await, "E0040150AABBCCDD");
}

#[tokio::test]
async fn test_one_shot_reads_memory_in_one_command() {
    let rig = Rig::new(ScriptedSession::new(None, &tag_memory()), MemoryJournal::default());
    let (mut cycle, _state) = rig.cycle(rfid_config(SessionStrategy::OneShot));

    let outcome = cycle.scan_once().await.unwrap();
    assert_eq!(
        outcome,
        ScanOutcome::Scanned {
            identifier: None,
            detected: true,
        }
    );
    assert_eq!(rig.session.commands(), vec!["hf 15 rdmulti -* -b 0 --cnt 7"]);
    assert_eq!(rig.journal.entries(), vec!["[FOUND_VALID_RFID]"]);
    assert_eq!(rig.driver.pulses(), 1);
}

#[tokio::test]
async fn test_journal_failure_does_not_abort_scan() {
    let journal = MemoryJournal {
        broken: true,
        ..MemoryJournal::default()
    };
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 12 34 56 78"), &tag_memory()),
        journal,
    );
    let (mut cycle, _state) = rig.cycle(rfid_config(SessionStrategy::Persistent));

    let outcome = cycle.scan_once().await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Scanned { detected: true, .. }));
    assert_eq!(rig.driver.pulses(), 1);
}

#[tokio::test]
async fn test_scanner_lifecycle() {
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 12 34 56 78"), &tag_memory()),
        MemoryJournal::default(),
    );
    let scanner = rig.scanner(rfid_config(SessionStrategy::Persistent));

    // Safe before init
    scanner.close().await.unwrap();
    assert_eq!(scanner.info().await, "stopped");

    scanner.init().await.unwrap();
    scanner.init().await.unwrap();
    assert!(scanner.is_running());
    assert_eq!(scanner.info().await, "running");

    let mut waited = Duration::ZERO;
    while scanner.last_identifier().await.is_empty() && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(scanner.last_identifier().await, "E004015012345678");

    scanner.close().await.unwrap();
    assert!(!scanner.is_running());
    assert_eq!(scanner.info().await, "stopped");
    assert_eq!(*rig.session.terminated.lock().unwrap(), 1);

    // Deduplication held across the polls the worker made
    assert_eq!(rig.driver.pulses(), 1);
    assert_eq!(rig.journal.count("[FOUND_VALID_RFID]"), 1);

    scanner.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_block_reads_are_retried() {
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 12 34 56 78"), &tag_memory()),
        MemoryJournal::default(),
    );
    let (mut cycle, state) = rig.cycle(rfid_config(SessionStrategy::Persistent));

    // Nothing answered: the cycle fails and the tag is not remembered
    rig.session.fail_blocks(&[0, 1, 2, 3, 4, 5, 6]);
    let err = cycle.scan_once().await.unwrap_err();
    assert!(matches!(err, ScanError::Session(_)));
    assert_eq!(state.last_identifier().await, "");

    // A hole through the marker: scanned, not detected, still not remembered
    rig.session.fail_blocks(&[3]);
    let outcome = cycle.scan_once().await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Scanned { detected: false, .. }));
    assert_eq!(state.last_identifier().await, "");
    assert_eq!(rig.driver.pulses(), 0);

    // Reads recover while the same tag is still present
    rig.session.fail_blocks(&[]);
    let outcome = cycle.scan_once().await.unwrap();
    assert!(matches!(outcome, ScanOutcome::Scanned { detected: true, .. }));
    assert_eq!(rig.driver.pulses(), 1);
    assert_eq!(state.last_identifier().await, "E004015012345678");
}

#[tokio::test]
async fn test_missing_filler_block_still_detects_once() {
    let rig = Rig::new(
        ScriptedSession::new(Some("E0 04 01 50 12 34 56 78"), &tag_memory()),
        MemoryJournal::default(),
    );
    let (mut cycle, _state) = rig.cycle(rfid_config(SessionStrategy::Persistent));

    // Block 6 holds only filler after the marker
    rig.session.fail_blocks(&[6]);
    assert!(matches!(
        cycle.scan_once().await.unwrap(),
        ScanOutcome::Scanned { detected: true, .. }
    ));
    assert_eq!(cycle.scan_once().await.unwrap(), ScanOutcome::Unchanged);
    assert_eq!(rig.driver.pulses(), 1);
}

/// A tool that stops answering: `execute` hangs until the session is killed.
struct HungSession {
    killed: watch::Sender<bool>,
    terminations: Mutex<usize>,
}

impl HungSession {
    fn new() -> Self {
        Self {
            killed: watch::Sender::new(false),
            terminations: Mutex::new(0),
        }
    }
}

#[async_trait]
impl TagSession for HungSession {
    async fn execute(&self, _command: &str) -> Result<String, SessionError> {
        let mut killed = self.killed.subscribe();
        let _ = killed.wait_for(|killed| *killed).await;
        Err(SessionError::Closed)
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        *self.terminations.lock().unwrap() += 1;
        self.killed.send_replace(true);
        Ok(())
    }
}

#[tokio::test]
async fn test_close_kills_a_hung_session() {
    let rig = Rig::new(ScriptedSession::new(None, &[]), MemoryJournal::default());
    let session = Arc::new(HungSession::new());
    let config = RfidConfig {
        response_timeout_ms: 50,
        ..rfid_config(SessionStrategy::Persistent)
    };
    let scanner = TagScanner::new(config, rig.actuator.clone(), rig.journal.clone())
        .with_session(session.clone());

    scanner.init().await.unwrap();
    // Let the worker block inside the first command
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(2), scanner.close())
        .await
        .expect("close hung on a dead session")
        .unwrap();
    assert!(*session.terminations.lock().unwrap() >= 1);
    assert!(*session.killed.borrow());
    assert!(!scanner.is_running());
    assert_eq!(scanner.info().await, "stopped");
}

/// Session whose first command brings the worker down.
#[derive(Default)]
struct PanickingSession {
    terminations: Mutex<usize>,
}

#[async_trait]
impl TagSession for PanickingSession {
    async fn execute(&self, _command: &str) -> Result<String, SessionError> {
        panic!("tag tool session poisoned");
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        *self.terminations.lock().unwrap() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn test_close_after_worker_panic_still_cleans_up() {
    let rig = Rig::new(ScriptedSession::new(None, &[]), MemoryJournal::default());
    let session = Arc::new(PanickingSession::default());
    let scanner = TagScanner::new(rfid_config(SessionStrategy::Persistent), rig.actuator.clone(), rig.journal.clone())
        .with_session(session.clone());

    scanner.init().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = scanner.close().await.unwrap_err();
    assert!(matches!(err, DeviceError::Worker(_)));
    assert_eq!(*session.terminations.lock().unwrap(), 1);
    assert!(!scanner.is_running());
    assert_eq!(scanner.info().await, "stopped");
}
