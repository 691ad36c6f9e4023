//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{Transport, TransportError};
use crate::protocol::constants::{MTK_VENDOR_ID, PID_DA};
use crate::protocol::frame::{DataType, FrameHeader};

/// Mock transport for unit testing protocol exchanges.
///
/// Queued responses behave as a byte stream: a read shorter than the
/// queued chunk leaves the remainder for the next read.
pub struct MockTransport {
    /// Queued device responses.
    read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            read_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            vid: MTK_VENDOR_ID,
            pid: PID_DA,
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw bytes to be returned by subsequent reads.
    pub fn queue_raw(&self, bytes: &[u8]) {
        self.read_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Queue a DA frame (12-byte header plus payload).
    pub fn queue_frame(&self, payload: &[u8]) {
        let header = FrameHeader::new(DataType::ProtocolFlow, payload.len() as u32);
        let mut bytes = header.to_bytes();
        bytes.extend_from_slice(payload);
        self.queue_raw(&bytes);
    }

    /// Queue a 32-bit status frame.
    pub fn queue_status(&self, status: u32) {
        self.queue_frame(&status.to_le_bytes());
    }

    /// Queue a big-endian u16, as returned by BROM commands.
    pub fn queue_be16(&self, value: u16) {
        self.queue_raw(&value.to_be_bytes());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Number of queued responses not yet consumed.
    pub fn pending_reads(&self) -> usize {
        self.read_queue.lock().unwrap().len()
    }

    /// Drop the link; pending responses are discarded.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
        self.read_queue.lock().unwrap().clear();
    }

    /// Come back on another port, as the device does after `JUMP_DA`.
    pub fn reenumerate(&mut self, pid: u16) {
        *self.connected.lock().unwrap() = true;
        self.pid = pid;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let mut queue = self.read_queue.lock().unwrap();
        let mut chunk = queue
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 5000 })?;
        if chunk.len() > max_len {
            let rest = chunk.split_off(max_len);
            queue.push_front(rest);
        }
        Ok(chunk)
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::PID_PRELOADER;

    #[test]
    fn test_mock_read_queue() {
        let mock = MockTransport::new();
        mock.queue_raw(&[1, 2, 3, 4]);
        mock.queue_raw(&[5]);

        assert_eq!(mock.read(2).unwrap(), vec![1, 2]);
        assert_eq!(mock.read_exact(3).unwrap(), vec![3, 4, 5]);

        // Queue is empty now
        assert!(mock.read(1).is_err());
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(b"Hello").unwrap();
        mock.write(b"World").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_echo() {
        let mock = MockTransport::new();
        mock.queue_raw(&[0xD7]);
        mock.echo(&[0xD7]).unwrap();

        mock.queue_raw(&[0x00]);
        assert!(matches!(
            mock.echo(&[0xD5]),
            Err(TransportError::EchoMismatch { .. })
        ));
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        mock.queue_status(0);
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(matches!(mock.write(b"test"), Err(TransportError::Disconnected)));
        assert_eq!(mock.pending_reads(), 0);

        mock.reenumerate(PID_PRELOADER);
        assert!(mock.is_connected());
        assert_eq!(mock.product_id(), PID_PRELOADER);
    }
}
