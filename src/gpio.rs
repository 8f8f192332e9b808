//! Output pin access.
//!
//! The actuator only ever drives outputs, so the driver surface is a single
//! `write_pin`. `SysfsDriver` uses the legacy `/sys/class/gpio` interface,
//! which is what the Raspberry Pi images this runs on still ship with.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Failed to export GPIO {pin}: {source}")]
    Export { pin: u32, source: std::io::Error },
    #[error("Failed to set GPIO {pin} direction: {source}")]
    Direction { pin: u32, source: std::io::Error },
    #[error("Failed to write GPIO {pin}: {source}")]
    Write { pin: u32, source: std::io::Error },
}

/// One output pin. `active_low` inverts the physical level so callers can
/// always speak in terms of asserted / idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPin {
    pub gpio: u32,
    pub active_low: bool,
}

impl OutputPin {
    pub fn new(gpio: u32) -> Self {
        Self { gpio, active_low: false }
    }

    pub fn with_active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    /// Physical level for a logical state.
    pub fn level(&self, asserted: bool) -> bool {
        asserted != self.active_low
    }
}

#[async_trait]
pub trait GpioDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive `pin` to the given physical level.
    async fn write_pin(&self, pin: &OutputPin, level: bool) -> Result<(), GpioError>;
}

pub struct SysfsDriver {
    base_path: PathBuf,
}

impl SysfsDriver {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn pin_dir(&self, gpio: u32) -> PathBuf {
        self.base_path.join(format!("gpio{}", gpio))
    }

    async fn ensure_output(&self, gpio: u32) -> Result<(), GpioError> {
        if !self.pin_dir(gpio).exists() {
            tokio::fs::write(self.base_path.join("export"), gpio.to_string())
                .await
                .map_err(|source| GpioError::Export { pin: gpio, source })?;
            // udev needs a moment to create the pin directory
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let direction = self.pin_dir(gpio).join("direction");
        let current = tokio::fs::read_to_string(&direction).await.unwrap_or_default();
        if current.trim() != "out" {
            tokio::fs::write(&direction, "out")
                .await
                .map_err(|source| GpioError::Direction { pin: gpio, source })?;
        }
        Ok(())
    }
}

impl Default for SysfsDriver {
    fn default() -> Self {
        Self::new("/sys/class/gpio")
    }
}

#[async_trait]
impl GpioDriver for SysfsDriver {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    async fn write_pin(&self, pin: &OutputPin, level: bool) -> Result<(), GpioError> {
        self.ensure_output(pin.gpio).await?;
        let value = if level { "1" } else { "0" };
        tokio::fs::write(self.pin_dir(pin.gpio).join("value"), value)
            .await
            .map_err(|source| GpioError::Write { pin: pin.gpio, source })?;
        tracing::trace!("GPIO {} <- {}", pin.gpio, value);
        Ok(())
    }
}
