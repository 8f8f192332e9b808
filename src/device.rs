// Trait-based interfaces for the onboard peripherals.
//
// Consumers (status endpoints, the host binary) depend only on these traits,
// never on a concrete reader or scanner.
use async_trait::async_trait;
use thiserror::Error;

use crate::gpio::GpioError;
use crate::rfid::session::SessionError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("GPIO error: {0}")]
    Gpio(#[from] GpioError),
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// A peripheral with a background lifecycle.
///
/// `init` is idempotent while running; `close` blocks until any background
/// worker has exited and is safe to call repeatedly or before `init`.
#[async_trait]
pub trait Device: Send + Sync {
    async fn init(&self) -> Result<(), DeviceError>;
    async fn close(&self) -> Result<(), DeviceError>;
    /// One-line human readable status.
    async fn info(&self) -> String;
}

/// A device that provides readings.
#[async_trait]
pub trait Sensor: Device {
    /// Latest reading as a flat key/value object.
    async fn read(&self) -> Result<serde_json::Value, DeviceError>;
}

/// A device that performs actions.
#[async_trait]
pub trait Actuator: Device {
    async fn command(&self, cmd: &str, args: &[String]) -> Result<(), DeviceError>;
}
