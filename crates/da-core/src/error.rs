//! Error taxonomy for the DA engine.

use thiserror::Error;

use crate::protocol::StatusCode;
use crate::transport::TransportError;

/// Malformed loader, partition table, seccfg or frame bytes.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Invalid magic: expected 0x{expected:08X}, got 0x{actual:08X}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("{what} CRC mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    CrcMismatch {
        what: &'static str,
        stored: u32,
        computed: u32,
    },

    #[error(
        "Region {index} out of bounds: offset 0x{offset:X} + length 0x{length:X} exceeds file size 0x{file_size:X}"
    )]
    RegionOutOfBounds {
        index: usize,
        offset: u64,
        length: u64,
        file_size: u64,
    },

    #[error("Loader has no region {0}")]
    MissingRegion(usize),

    #[error("No partition table found")]
    NoPartitionTable,

    #[error("Unsupported {what}: {value}")]
    Unsupported { what: &'static str, value: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by engine operations.
///
/// Only [`DaError::Transport`] is fatal for the session; everything else
/// aborts the current operation and leaves the device connected.
#[derive(Error, Debug)]
pub enum DaError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Partition '{name}' not found, available: {}", .available.join(", "))]
    PartitionNotFound { name: String, available: Vec<String> },

    #[error("Device returned {0}")]
    Status(StatusCode),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("RPMB key mismatch between host and device")]
    KeyMismatch,

    #[error("RPMB key setup failed: {0}")]
    RpmbKey(String),

    #[error("RPMB operation stopped at sector 0x{sector:X}: {reason}")]
    Rpmb { sector: u32, reason: String },

    #[error("Chunk at 0x{offset:X} failed after 0x{completed:X} bytes: {source}")]
    ChunkFailed {
        offset: u64,
        completed: u64,
        #[source]
        source: Box<DaError>,
    },

    #[error("Cancelled at 0x{offset:X}")]
    Cancelled { offset: u64 },

    #[error("Range 0x{offset:X}+0x{length:X} outside partition '{name}'")]
    OutOfRange {
        name: String,
        offset: u64,
        length: u64,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Session lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaError {
    /// Transport failures leave the session unusable and require reconnection.
    pub fn is_fatal(&self) -> bool {
        match self {
            DaError::Transport(_) => true,
            DaError::ChunkFailed { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_not_found_lists_names() {
        let err = DaError::PartitionNotFound {
            name: "vendor".into(),
            available: vec!["boot".into(), "system".into()],
        };
        assert_eq!(
            err.to_string(),
            "Partition 'vendor' not found, available: boot, system"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DaError::Transport(TransportError::Disconnected).is_fatal());
        assert!(!DaError::Status(StatusCode(0xC0010001)).is_fatal());
        let wrapped = DaError::ChunkFailed {
            offset: 0,
            completed: 0,
            source: Box::new(DaError::Transport(TransportError::Disconnected)),
        };
        assert!(wrapped.is_fatal());
    }
}
