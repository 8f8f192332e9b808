// src/gps/serial.rs - Serial port access for the GPS receiver
use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Byte stream handed to the GPS worker; owned exclusively by it.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the receiver's byte stream. Implemented over serial2-tokio for real
/// hardware and over in-memory pipes in tests.
#[async_trait]
pub trait SerialInterface: Send + Sync {
    async fn open(&self, port: &str, baud: u32) -> std::io::Result<ByteStream>;
    fn available_ports(&self) -> Vec<String>;
}

/// Linux implementation of SerialInterface using serial2-tokio
pub struct LinuxSerial;

#[async_trait]
impl SerialInterface for LinuxSerial {
    async fn open(&self, port: &str, baud: u32) -> std::io::Result<ByteStream> {
        let serial = serial2_tokio::SerialPort::open(port, baud)?;
        Ok(Box::new(serial))
    }

    fn available_ports(&self) -> Vec<String> {
        match serial2_tokio::SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(_) => vec![],
        }
    }
}
