// src/actuator.rs - Momentary switch driven on a positive tag detection
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::ActuatorConfig;
use crate::device::{Actuator, Device, DeviceError};
use crate::gpio::{GpioDriver, GpioError, OutputPin, SysfsDriver};

/// Hold + trigger pin pair pulsed through a fixed sequence.
///
/// A pulse is awaited to completion by the caller; the scan loop does not
/// poll again until the physical action is over.
pub struct ActuatorPulse {
    driver: Arc<dyn GpioDriver>,
    hold: OutputPin,
    trigger: OutputPin,
    duration: Duration,
    // Serialises pulses; the pins are a single physical resource.
    sequence: Mutex<()>,
    ready: AtomicBool,
}

impl ActuatorPulse {
    pub fn new(
        driver: Arc<dyn GpioDriver>,
        hold: OutputPin,
        trigger: OutputPin,
        duration: Duration,
    ) -> Self {
        Self {
            driver,
            hold,
            trigger,
            duration,
            sequence: Mutex::new(()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ActuatorConfig) -> Self {
        Self::with_driver(config, Arc::new(SysfsDriver::new(&config.sysfs_base)))
    }

    pub fn with_driver(config: &ActuatorConfig, driver: Arc<dyn GpioDriver>) -> Self {
        Self::new(
            driver,
            OutputPin::new(config.hold_pin).with_active_low(config.hold_active_low),
            OutputPin::new(config.trigger_pin).with_active_low(config.trigger_active_low),
            config.pulse_duration(),
        )
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Assert hold, assert trigger for the configured duration, then return
    /// both pins to idle. Idle is restored even when asserting failed.
    pub async fn pulse(&self) -> Result<(), GpioError> {
        let _guard = self.sequence.lock().await;
        tracing::debug!(
            "Actuator pulse: hold={} trigger={} for {:?}",
            self.hold.gpio,
            self.trigger.gpio,
            self.duration
        );

        let asserted = self.assert_pins().await;
        if asserted.is_ok() {
            tokio::time::sleep(self.duration).await;
        }
        let restored = self.idle().await;

        asserted.and(restored)
    }

    async fn assert_pins(&self) -> Result<(), GpioError> {
        self.driver.write_pin(&self.hold, self.hold.level(true)).await?;
        self.driver.write_pin(&self.trigger, self.trigger.level(true)).await?;
        Ok(())
    }

    /// Drive both pins to their idle level, trigger first.
    async fn idle(&self) -> Result<(), GpioError> {
        let trigger = self.driver.write_pin(&self.trigger, self.trigger.level(false)).await;
        let hold = self.driver.write_pin(&self.hold, self.hold.level(false)).await;
        trigger.and(hold)
    }
}

#[async_trait]
impl Device for ActuatorPulse {
    async fn init(&self) -> Result<(), DeviceError> {
        let _guard = self.sequence.lock().await;
        self.idle().await?;
        self.ready.store(true, Ordering::Release);
        tracing::info!("Actuator ready ({} driver)", self.driver.name());
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        if !self.ready.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.sequence.lock().await;
        self.idle().await?;
        Ok(())
    }

    async fn info(&self) -> String {
        if self.ready.load(Ordering::Acquire) {
            "ready".to_string()
        } else {
            "idle".to_string()
        }
    }
}

#[async_trait]
impl Actuator for ActuatorPulse {
    async fn command(&self, cmd: &str, _args: &[String]) -> Result<(), DeviceError> {
        match cmd {
            "pulse" => Ok(self.pulse().await?),
            other => Err(DeviceError::UnsupportedCommand(other.to_string())),
        }
    }
}
