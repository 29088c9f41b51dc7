use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::ActuatorConfig;
use crate::error::TransportError;

/// Byte link to the actuator.
pub trait Transport: Send {
    /// Writes one encoded command.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Returns whatever the device has sent back so far without blocking.
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError>;

    fn describe(&self) -> String;
}

// SERIAL ----------------------------------------------------------------------

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Opens `port_name` at `baud_rate`. `io_timeout` bounds each write and read.
    pub fn open(port_name: &str, baud_rate: u32, io_timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(io_timeout)
            .open()
            .map_err(|source| TransportError::Open {
                port: port_name.to_string(),
                source,
            })?;
        // stale acknowledgments from a previous session
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            tracing::debug!("could not clear {} buffers: {}", port_name, e);
        }
        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }

    pub fn list_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes).map_err(TransportError::Write)?;
        self.port.flush().map_err(TransportError::Write)
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let waiting = self
            .port
            .bytes_to_read()
            .map_err(|e| TransportError::Read(io::Error::from(e)))?;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0u8; waiting as usize];
        match self.port.read(&mut buffer) {
            Ok(n) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(TransportError::Read(e)),
        }
    }

    fn describe(&self) -> String {
        format!("serial {}", self.name)
    }
}

/// Opens the configured serial port. With no port, or one that fails to open,
/// the session runs dry.
pub fn open_configured(config: &ActuatorConfig) -> Option<Box<dyn Transport>> {
    let port = config.port.as_deref()?;
    let timeout = Duration::from_millis(config.io_timeout_ms);
    match SerialTransport::open(port, config.baud_rate, timeout) {
        Ok(transport) => Some(Box::new(transport)),
        Err(e) => {
            tracing::warn!("{}; continuing without an actuator", e);
            None
        }
    }
}

// MEMORY ----------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    written: Vec<Vec<u8>>,
    replies: Vec<u8>,
    fail_writes: bool,
}

/// In-process stand-in for the device. Clones share the same record of writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every successful write, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Successful writes flattened into one byte string.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state().written.concat()
    }

    pub fn clear_written(&self) {
        self.state().written.clear();
    }

    /// Queues bytes for the next `read_available`.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.state().replies.extend_from_slice(bytes);
    }

    /// Makes every following write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }
}

impl Transport for MemoryTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(TransportError::Write(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device unplugged",
            )));
        }
        state.written.push(bytes.to_vec());
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(std::mem::take(&mut self.state().replies))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
