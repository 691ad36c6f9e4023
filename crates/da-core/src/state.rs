//! Per-device session state.
//!
//! One [`FlashSession`] exists per connected device. It is created on
//! connect, threaded through every engine by `&mut`, and reset when the
//! device goes away.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::flash::StorageKind;
use crate::loader::LoaderImage;
use crate::partition::PartitionTable;
use crate::protocol::ProtocolGeneration;

/// Cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Security lock state as last observed or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unknown,
    Locked,
    Unlocked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unknown => write!(f, "unknown"),
            LockState::Locked => write!(f, "locked"),
            LockState::Unlocked => write!(f, "unlocked"),
        }
    }
}

/// Chip identification and per-chip addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipInfo {
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    pub target_config: u32,
    pub efuse_base: u32,
    /// Device-unique id used for RPMB key derivation.
    pub meid: Option<Vec<u8>>,
    pub soc_id: Option<Vec<u8>>,
    /// RPMB size in 256-byte sectors; 0 when unknown.
    pub rpmb_sectors: u32,
}

/// State shared by every engine for the connected device.
#[derive(Debug, Clone)]
pub struct FlashSession {
    pub page_size: u32,
    pub storage: StorageKind,
    pub loader: Option<LoaderImage>,
    pub generation: ProtocolGeneration,
    pub patched: bool,
    pub rpmb_key: Option<Vec<u8>>,
    pub lock_state: LockState,
    pub storage_selected: bool,
    pub extension_loaded: bool,
    pub write_packet: usize,
    pub chip: ChipInfo,
    pub partitions: Option<PartitionTable>,
    cancel: CancelToken,
}

impl FlashSession {
    pub fn new(storage: StorageKind) -> Self {
        Self {
            page_size: storage.geometry().page_size,
            storage,
            loader: None,
            generation: ProtocolGeneration::default(),
            patched: false,
            rpmb_key: None,
            lock_state: LockState::Unknown,
            storage_selected: false,
            extension_loaded: false,
            write_packet: crate::protocol::DEFAULT_WRITE_PACKET,
            chip: ChipInfo::default(),
            partitions: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Switch storage kind; forces a new `set_storage` and table read.
    pub fn set_storage(&mut self, storage: StorageKind) {
        if self.storage != storage {
            self.storage = storage;
            self.page_size = storage.geometry().page_size;
            self.storage_selected = false;
            self.partitions = None;
        }
    }

    /// Tear down device state. The cancel token survives so holders stay valid.
    pub fn reset(&mut self) {
        let cancel = self.cancel.clone();
        cancel.take();
        *self = Self {
            cancel,
            ..Self::new(self.storage)
        };
    }
}

impl Default for FlashSession {
    fn default() -> Self {
        Self::new(StorageKind::default())
    }
}
