// moto-hal: onboard GPS receiver and proximity tag scanner for the bike computer

pub mod actuator;
pub mod config;
pub mod device;
pub mod gpio;
pub mod gps;
pub mod hal;
pub mod journal;
pub mod rfid;

pub use actuator::ActuatorPulse;
pub use config::{Config, load_config};
pub use device::{Actuator, Device, DeviceError, Sensor};
pub use gps::{GpsReader, PositionSnapshot};
pub use hal::Hal;
pub use rfid::TagScanner;
