// src/hal.rs - Owns the configured peripherals and reports their status
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::actuator::ActuatorPulse;
use crate::config::Config;
use crate::device::{Device, DeviceError, Sensor};
use crate::gps::GpsReader;
use crate::journal;
use crate::rfid::TagScanner;

/// The onboard peripherals, started and stopped together.
pub struct Hal {
    gps: Option<Arc<GpsReader>>,
    rfid: Option<Arc<TagScanner>>,
    actuator: Arc<ActuatorPulse>,
}

impl Hal {
    pub fn new(config: &Config) -> Self {
        let actuator = Arc::new(ActuatorPulse::from_config(&config.actuator));
        let journal = journal::from_config(&config.journal);

        let gps = config
            .gps
            .enabled
            .then(|| Arc::new(GpsReader::new(config.gps.clone())));
        let rfid = config.rfid.enabled.then(|| {
            Arc::new(TagScanner::new(config.rfid.clone(), actuator.clone(), journal.clone()))
        });

        Self { gps, rfid, actuator }
    }

    pub fn from_parts(
        gps: Option<Arc<GpsReader>>,
        rfid: Option<Arc<TagScanner>>,
        actuator: Arc<ActuatorPulse>,
    ) -> Self {
        Self { gps, rfid, actuator }
    }

    /// Named devices, actuator first so its pins are idle before scanning.
    pub fn devices(&self) -> Vec<(&'static str, Arc<dyn Device>)> {
        let mut devices: Vec<(&'static str, Arc<dyn Device>)> = vec![("actuator", self.actuator.clone() as Arc<dyn Device>)];
        if let Some(gps) = &self.gps {
            devices.push(("gps", gps.clone() as Arc<dyn Device>));
        }
        if let Some(rfid) = &self.rfid {
            devices.push(("rfid", rfid.clone() as Arc<dyn Device>));
        }
        devices
    }

    pub fn gps(&self) -> Option<Arc<dyn Sensor>> {
        self.gps.clone().map(|gps| gps as Arc<dyn Sensor>)
    }

    /// Start every device. A device that fails to start is logged and left
    /// stopped; the others still start.
    pub async fn init_all(&self) -> Vec<(&'static str, DeviceError)> {
        let mut failures = Vec::new();
        for (name, device) in self.devices() {
            if let Err(e) = device.init().await {
                tracing::error!("Failed to start {}: {}", name, e);
                failures.push((name, e));
            }
        }
        failures
    }

    /// Stop every device, scanner before actuator.
    pub async fn close_all(&self) -> Vec<(&'static str, DeviceError)> {
        let mut failures = Vec::new();
        for (name, device) in self.devices().into_iter().rev() {
            if let Err(e) = device.close().await {
                tracing::error!("Failed to stop {}: {}", name, e);
                failures.push((name, e));
            }
        }
        failures
    }

    /// `info()` of every configured device keyed by name.
    pub async fn status(&self) -> BTreeMap<String, String> {
        let devices = self.devices();
        let infos = join_all(devices.iter().map(|(_, device)| device.info())).await;
        devices
            .iter()
            .map(|(name, _)| name.to_string())
            .zip(infos)
            .collect()
    }
}
