// src/journal.rs - Detection events appended to the host system log
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::JournalConfig;

pub const SCANNING_EVENT: &str = "[SCANNING_RFID]";
pub const FOUND_EVENT: &str = "[FOUND_VALID_RFID]";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Failed to run logger: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("logger exited with {0}")]
    Status(std::process::ExitStatus),
}

#[async_trait]
pub trait EventJournal: Send + Sync {
    async fn record(&self, message: &str) -> Result<(), JournalError>;
}

/// Writes through `logger(1)` under a fixed facility tag.
pub struct SyslogJournal {
    tag: String,
}

impl SyslogJournal {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl EventJournal for SyslogJournal {
    async fn record(&self, message: &str) -> Result<(), JournalError> {
        let status = Command::new("logger")
            .arg("-t")
            .arg(&self.tag)
            .arg(message)
            .status()
            .await?;
        if !status.success() {
            return Err(JournalError::Status(status));
        }
        Ok(())
    }
}

/// Journal used when the system log side channel is disabled.
pub struct NullJournal;

#[async_trait]
impl EventJournal for NullJournal {
    async fn record(&self, _message: &str) -> Result<(), JournalError> {
        Ok(())
    }
}

pub fn from_config(config: &JournalConfig) -> std::sync::Arc<dyn EventJournal> {
    if config.enabled {
        std::sync::Arc::new(SyslogJournal::new(&config.tag))
    } else {
        std::sync::Arc::new(NullJournal)
    }
}

pub fn scanning_message(uid: &str) -> String {
    format!("{} UID={}", SCANNING_EVENT, uid)
}

pub fn found_message(uid: Option<&str>) -> String {
    match uid {
        Some(uid) => format!("{} UID={}", FOUND_EVENT, uid),
        None => FOUND_EVENT.to_string(),
    }
}
