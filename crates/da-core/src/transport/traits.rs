//! Byte transport abstraction.
//!
//! Defines the `Transport` trait used by the BROM and DA protocol layers,
//! allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Echo mismatch: sent {expected:02X?}, got {actual:02X?}")]
    EchoMismatch { expected: Vec<u8>, actual: Vec<u8> },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Width of an integer pushed with [`Transport::send_word`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

/// Abstract byte transport.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait Transport: Send + Sync {
    /// Write raw bytes to the OUT endpoint.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from the IN endpoint.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Read exactly `len` bytes, looping over short reads.
    fn read_exact(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::with_capacity(len);
        while buf.len() < len {
            let chunk = self.read(len - buf.len())?;
            if chunk.is_empty() {
                return Err(TransportError::ReadFailed(format!(
                    "Short read: wanted {len} bytes, got {}",
                    buf.len()
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    /// Write bytes and require the device to echo them back verbatim.
    fn echo(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write(data)?;
        let actual = self.read_exact(data.len())?;
        if actual != data {
            return Err(TransportError::EchoMismatch {
                expected: data.to_vec(),
                actual,
            });
        }
        Ok(())
    }

    /// Send a big-endian integer of the given width.
    fn send_word(&self, value: u64, width: Width) -> Result<(), TransportError> {
        match width {
            Width::W32 => self.write(&(value as u32).to_be_bytes())?,
            Width::W64 => self.write(&value.to_be_bytes())?,
        };
        Ok(())
    }

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
