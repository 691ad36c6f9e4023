//! Mount facade - one-operation-at-a-time partition access.
//!
//! Filesystem adapters call in from their own threads; [`SerializedFlash`]
//! puts the session behind a `Mutex` and exposes partitions as plain
//! byte ranges.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::{DaError, Result};
use crate::events::FlashObserver;
use crate::flash::PartType;
use crate::partition::{PartitionEntry, resolve_entry};
use crate::session::DaSession;
use crate::transport::Transport;

/// Storage access a mount adapter needs.
pub trait MountBackend {
    fn page_size(&self) -> u32;
    fn partitions(&mut self) -> Result<Vec<PartitionEntry>>;
    fn read_at(&mut self, address: u64, length: u64) -> Result<Vec<u8>>;
    fn write_at(&mut self, address: u64, data: &[u8]) -> Result<()>;
}

impl<T: Transport, O: FlashObserver + 'static> MountBackend for DaSession<T, O> {
    fn page_size(&self) -> u32 {
        self.state().page_size
    }

    fn partitions(&mut self) -> Result<Vec<PartitionEntry>> {
        Ok(self.partition_table(PartType::User)?.entries)
    }

    fn read_at(&mut self, address: u64, length: u64) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(length as usize);
        self.read(address, length, &mut data, PartType::User)?;
        Ok(data)
    }

    fn write_at(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let mut source = data;
        self.write(address, data.len() as u64, &mut source, PartType::User)
    }
}

/// Partition as seen by a mount adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

pub struct SerializedFlash<B: MountBackend> {
    inner: Mutex<B>,
}

impl<B: MountBackend> SerializedFlash<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Mutex::new(backend),
        }
    }

    pub fn into_inner(self) -> Result<B> {
        self.inner.into_inner().map_err(|_| DaError::Poisoned)
    }

    fn lock(&self) -> Result<MutexGuard<'_, B>> {
        self.inner.lock().map_err(|_| DaError::Poisoned)
    }

    pub fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let mut backend = self.lock()?;
        let page = backend.page_size();
        Ok(backend
            .partitions()?
            .into_iter()
            .map(|e| PartitionInfo {
                offset: e.byte_offset(page),
                size: e.byte_len(page),
                name: e.name,
            })
            .collect())
    }

    /// Absolute address of `offset..offset + length` inside `name`.
    fn locate(backend: &mut B, name: &str, offset: u64, length: u64) -> Result<u64> {
        let page = backend.page_size();
        let entries = backend.partitions()?;
        let entry = resolve_entry(&entries, name)?;
        let fits = offset
            .checked_add(length)
            .is_some_and(|end| end <= entry.byte_len(page));
        if !fits {
            return Err(DaError::OutOfRange {
                name: name.to_string(),
                offset,
                length,
            });
        }
        Ok(entry.byte_offset(page) + offset)
    }

    pub fn read(&self, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut backend = self.lock()?;
        let address = Self::locate(&mut backend, name, offset, length)?;
        debug!(partition = %name, offset, length, "Mount read");
        backend.read_at(address, length)
    }

    pub fn write(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let mut backend = self.lock()?;
        let address = Self::locate(&mut backend, name, offset, data.len() as u64)?;
        debug!(partition = %name, offset, length = data.len(), "Mount write");
        backend.write_at(address, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    struct MemoryBackend {
        entries: Vec<PartitionEntry>,
        data: Vec<u8>,
    }

    impl MemoryBackend {
        fn new() -> Self {
            let entry = |name: &str, sector| PartitionEntry {
                name: name.into(),
                sector,
                sectors: 4,
                type_guid: [0; 16],
                unique_guid: [0; 16],
                flags: 0,
            };
            Self {
                entries: vec![entry("boot", 0), entry("misc", 4)],
                data: vec![0; 8 * 512],
            }
        }
    }

    impl MountBackend for MemoryBackend {
        fn page_size(&self) -> u32 {
            512
        }

        fn partitions(&mut self) -> Result<Vec<PartitionEntry>> {
            Ok(self.entries.clone())
        }

        fn read_at(&mut self, address: u64, length: u64) -> Result<Vec<u8>> {
            let start = address as usize;
            Ok(self.data[start..start + length as usize].to_vec())
        }

        fn write_at(&mut self, address: u64, data: &[u8]) -> Result<()> {
            let start = address as usize;
            self.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    #[test]
    fn test_list_partitions() {
        let flash = SerializedFlash::new(MemoryBackend::new());
        let parts = flash.list_partitions().unwrap();
        assert_eq!(
            parts[1],
            PartitionInfo {
                name: "misc".into(),
                offset: 0x800,
                size: 0x800,
            }
        );
    }

    #[test]
    fn test_read_write_within_partition() {
        let flash = SerializedFlash::new(MemoryBackend::new());
        flash.write("MISC", 0x10, b"bootonce").unwrap();
        assert_eq!(flash.read("misc", 0x10, 8).unwrap(), b"bootonce");

        let backend = flash.into_inner().unwrap();
        assert_eq!(&backend.data[0x810..0x818], b"bootonce");
        assert!(backend.data[..0x800].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_range_checks() {
        let flash = SerializedFlash::new(MemoryBackend::new());
        assert!(matches!(
            flash.read("boot", 0x7F0, 0x20),
            Err(DaError::OutOfRange { .. })
        ));
        assert!(matches!(
            flash.write("boot", u64::MAX, &[0]),
            Err(DaError::OutOfRange { .. })
        ));
        assert!(matches!(
            flash.read("vendor", 0, 1),
            Err(DaError::PartitionNotFound { .. })
        ));
        assert_eq!(flash.read("boot", 0x7F0, 0x10).unwrap().len(), 0x10);
    }

    #[test]
    fn test_ambiguous_name_is_rejected() {
        let mut backend = MemoryBackend::new();
        backend.entries[1].name = "Boot".into();
        let flash = SerializedFlash::new(backend);
        assert!(matches!(
            flash.read("BOOT", 0, 1),
            Err(DaError::PartitionNotFound { .. })
        ));
        flash.write("Boot", 0, b"x").unwrap();
        assert_eq!(flash.into_inner().unwrap().data[0x800], b'x');
    }

    #[test]
    fn test_concurrent_callers() {
        let flash = Arc::new(SerializedFlash::new(MemoryBackend::new()));
        thread::scope(|s| {
            for i in 0..4u8 {
                let flash = flash.clone();
                s.spawn(move || {
                    flash.write("boot", i as u64 * 0x100, &[i + 1; 0x100]).unwrap();
                });
            }
        });
        for i in 0..4u8 {
            assert_eq!(flash.read("boot", i as u64 * 0x100, 0x100).unwrap(), vec![i + 1; 0x100]);
        }
    }
}
