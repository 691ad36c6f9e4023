//! Flash I/O engine.
//!
//! Turns byte-addressed or partition-addressed requests into bounded
//! chunks on a [`FlashDevice`]. A failed chunk stops the operation;
//! earlier chunks stay written.

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{DaError, Result};
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::partition::{PartitionEntry, PartitionTable};
use crate::protocol::XFlash;
use crate::state::FlashSession;
use crate::transport::Transport;

/// Largest write or format request issued in one go.
pub const MAX_WRITE_CHUNK: usize = 0x20_0000;
/// Zero buffer size used when erasing by writing.
pub const ERASE_CHUNK: usize = 0x20_0000;

/// Storage technology of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Emmc,
    Nand,
    Nor,
    Ufs,
}

/// Fixed I/O policy for a storage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: u32,
    pub write_chunk: usize,
    pub read_chunk: usize,
    /// Storage code placed in the DA parameter block.
    pub da_code: u32,
}

impl StorageKind {
    pub fn geometry(&self) -> Geometry {
        match self {
            StorageKind::Emmc => Geometry {
                page_size: 512,
                write_chunk: MAX_WRITE_CHUNK,
                read_chunk: MAX_WRITE_CHUNK,
                da_code: 0x1,
            },
            StorageKind::Nand => Geometry {
                page_size: 2048,
                write_chunk: MAX_WRITE_CHUNK,
                read_chunk: MAX_WRITE_CHUNK,
                da_code: 0x10,
            },
            StorageKind::Nor => Geometry {
                page_size: 512,
                write_chunk: 0x10_0000,
                read_chunk: 0x10_0000,
                da_code: 0x20,
            },
            StorageKind::Ufs => Geometry {
                page_size: 4096,
                write_chunk: MAX_WRITE_CHUNK,
                read_chunk: MAX_WRITE_CHUNK,
                da_code: 0x30,
            },
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Emmc => write!(f, "emmc"),
            StorageKind::Nand => write!(f, "nand"),
            StorageKind::Nor => write!(f, "nor"),
            StorageKind::Ufs => write!(f, "ufs"),
        }
    }
}

impl FromStr for StorageKind {
    type Err = DaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "emmc" => Ok(StorageKind::Emmc),
            "nand" => Ok(StorageKind::Nand),
            "nor" => Ok(StorageKind::Nor),
            "ufs" => Ok(StorageKind::Ufs),
            other => Err(DaError::NotFound(format!("storage kind '{other}'"))),
        }
    }
}

/// Physical region an address refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartType {
    /// Logical user area, addressed through the partition table.
    #[default]
    User,
    Boot1,
    Boot2,
    Rpmb,
    /// eMMC general purpose area 1..=4.
    Gp(u8),
    /// UFS logical unit.
    Lu(u8),
}

impl PartType {
    /// Partition code for the DA parameter block.
    pub fn code(&self, storage: StorageKind) -> u32 {
        match (storage, self) {
            (StorageKind::Ufs, PartType::User) => 2,
            (StorageKind::Ufs, PartType::Boot1) => 0,
            (StorageKind::Ufs, PartType::Boot2) => 1,
            (_, PartType::User) => 8,
            (_, PartType::Boot1) => 1,
            (_, PartType::Boot2) => 2,
            (_, PartType::Rpmb) => 3,
            (_, PartType::Gp(n)) => 3 + *n as u32,
            (_, PartType::Lu(n)) => *n as u32,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, PartType::User)
    }
}

impl fmt::Display for PartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartType::User => write!(f, "user"),
            PartType::Boot1 => write!(f, "boot1"),
            PartType::Boot2 => write!(f, "boot2"),
            PartType::Rpmb => write!(f, "rpmb"),
            PartType::Gp(n) => write!(f, "gp{n}"),
            PartType::Lu(n) => write!(f, "lu{n}"),
        }
    }
}

impl FromStr for PartType {
    type Err = DaError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let parsed = match lower.as_str() {
            "user" => Some(PartType::User),
            "boot1" => Some(PartType::Boot1),
            "boot2" => Some(PartType::Boot2),
            "rpmb" => Some(PartType::Rpmb),
            _ => {
                if let Some(n) = lower.strip_prefix("gp").and_then(|n| n.parse::<u8>().ok()) {
                    (1..=4).contains(&n).then_some(PartType::Gp(n))
                } else {
                    lower
                        .strip_prefix("lu")
                        .and_then(|n| n.parse::<u8>().ok())
                        .filter(|n| *n <= 8)
                        .map(PartType::Lu)
                }
            }
        };
        parsed.ok_or_else(|| DaError::NotFound(format!("partition type '{s}'")))
    }
}

/// Chunk-level storage primitives.
pub trait FlashDevice {
    /// Select the storage technology; issued once per session.
    fn set_storage(&self, storage: StorageKind) -> Result<()>;

    fn read_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        length: usize,
    ) -> Result<Vec<u8>>;

    fn write_chunk(&self, storage: StorageKind, part: PartType, address: u64, data: &[u8])
    -> Result<()>;

    fn format_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        length: u64,
    ) -> Result<()>;

    /// Whether `format_chunk` is a real erase primitive.
    fn supports_format(&self) -> bool {
        false
    }
}

impl<D: FlashDevice + ?Sized> FlashDevice for &D {
    fn set_storage(&self, storage: StorageKind) -> Result<()> {
        (**self).set_storage(storage)
    }

    fn read_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        length: usize,
    ) -> Result<Vec<u8>> {
        (**self).read_chunk(storage, part, address, length)
    }

    fn write_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        data: &[u8],
    ) -> Result<()> {
        (**self).write_chunk(storage, part, address, data)
    }

    fn format_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        length: u64,
    ) -> Result<()> {
        (**self).format_chunk(storage, part, address, length)
    }

    fn supports_format(&self) -> bool {
        (**self).supports_format()
    }
}

impl<T: Transport + ?Sized> FlashDevice for XFlash<'_, T> {
    fn set_storage(&self, storage: StorageKind) -> Result<()> {
        // Without the extension the storage code travels in every request.
        if self.extension_loaded() {
            self.custom_set_storage(storage == StorageKind::Ufs)?;
        }
        Ok(())
    }

    fn read_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        length: usize,
    ) -> Result<Vec<u8>> {
        self.read_data(storage.geometry().da_code, part.code(storage), address, length)
    }

    fn write_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        data: &[u8],
    ) -> Result<()> {
        self.write_data(storage.geometry().da_code, part.code(storage), address, data)
    }

    fn format_chunk(
        &self,
        storage: StorageKind,
        part: PartType,
        address: u64,
        length: u64,
    ) -> Result<()> {
        self.format(storage.geometry().da_code, part.code(storage), address, length)
    }

    fn supports_format(&self) -> bool {
        true
    }
}

/// Outcome of a multi-partition operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BulkReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, name: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.succeeded.push(name.to_string()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(partition = name, error = %e, "Partition operation failed");
                self.failed.push((name.to_string(), e.to_string()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BulkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed",
            self.succeeded.len(),
            self.failed.len()
        )?;
        for (name, reason) in &self.failed {
            write!(f, "\n  {name}: {reason}")?;
        }
        Ok(())
    }
}

/// GPT read window settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptSettings {
    pub num_entries: u32,
    pub entry_size: u32,
}

impl Default for GptSettings {
    fn default() -> Self {
        Self {
            num_entries: 128,
            entry_size: 128,
        }
    }
}

/// Chunked storage operations over a [`FlashDevice`].
pub struct FlashEngine<'a, D: FlashDevice, O: FlashObserver + ?Sized> {
    device: D,
    session: &'a mut FlashSession,
    observer: &'a O,
    gpt: GptSettings,
}

fn chunk_failed(offset: u64, completed: u64, source: DaError) -> DaError {
    DaError::ChunkFailed {
        offset,
        completed,
        source: Box::new(source),
    }
}

impl<'a, D: FlashDevice, O: FlashObserver + ?Sized> FlashEngine<'a, D, O> {
    pub fn new(device: D, session: &'a mut FlashSession, observer: &'a O) -> Self {
        Self {
            device,
            session,
            observer,
            gpt: GptSettings::default(),
        }
    }

    pub fn with_gpt_settings(mut self, gpt: GptSettings) -> Self {
        self.gpt = gpt;
        self
    }

    pub fn session(&self) -> &FlashSession {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut FlashSession {
        self.session
    }

    fn ensure_storage(&mut self) -> Result<()> {
        if !self.session.storage_selected {
            self.device.set_storage(self.session.storage)?;
            self.session.storage_selected = true;
            debug!(storage = %self.session.storage, "Storage selected");
        }
        Ok(())
    }

    fn check_cancel(&self, offset: u64) -> Result<()> {
        if self.session.cancel_token().take() {
            warn!(offset = %format!("0x{offset:X}"), "Operation cancelled");
            return Err(DaError::Cancelled { offset });
        }
        Ok(())
    }

    fn progress(&self, phase: FlashPhase, operation: &str, current: u64, total: u64) {
        self.observer.on_event(&FlashEvent::Progress {
            phase,
            operation: operation.to_string(),
            current,
            total,
        });
    }

    /// Read `length` bytes at `address` into `sink`. Returns bytes read.
    #[instrument(skip(self, sink), fields(address = %format!("0x{address:X}")))]
    pub fn read<W: Write + ?Sized>(
        &mut self,
        address: u64,
        length: u64,
        sink: &mut W,
        part: PartType,
    ) -> Result<u64> {
        self.ensure_storage()?;
        let chunk = self.session.storage.geometry().read_chunk as u64;
        let storage = self.session.storage;
        let mut done = 0u64;
        while done < length {
            let offset = address + done;
            self.check_cancel(offset)?;
            let size = (length - done).min(chunk) as usize;
            let data = self
                .device
                .read_chunk(storage, part, offset, size)
                .map_err(|e| chunk_failed(offset, done, e))?;
            sink.write_all(&data)?;
            done += data.len() as u64;
            self.progress(FlashPhase::Reading, "read", done, length);
        }
        debug!(bytes = done, "Read complete");
        Ok(done)
    }

    /// Write `length` bytes pulled from `source` starting at `address`.
    #[instrument(skip(self, source), fields(address = %format!("0x{address:X}")))]
    pub fn write<R: Read + ?Sized>(
        &mut self,
        address: u64,
        length: u64,
        source: &mut R,
        part: PartType,
    ) -> Result<()> {
        self.ensure_storage()?;
        self.invalidate_table(address, length, part);
        let chunk = self.session.storage.geometry().write_chunk as u64;
        let storage = self.session.storage;
        let mut buf = Vec::with_capacity(chunk.min(length) as usize);
        let mut done = 0u64;
        while done < length {
            let offset = address + done;
            self.check_cancel(offset)?;
            let size = (length - done).min(chunk) as usize;
            buf.resize(size, 0);
            source.read_exact(&mut buf)?;
            self.device
                .write_chunk(storage, part, offset, &buf)
                .map_err(|e| chunk_failed(offset, done, e))?;
            done += size as u64;
            self.progress(FlashPhase::Writing, "write", done, length);
        }
        debug!(bytes = done, "Write complete");
        Ok(())
    }

    pub fn write_buffer(&mut self, address: u64, data: &[u8], part: PartType) -> Result<()> {
        let mut source = data;
        self.write(address, data.len() as u64, &mut source, part)
    }

    /// Erase a range, natively when supported, otherwise by writing zeros.
    #[instrument(skip(self), fields(address = %format!("0x{address:X}")))]
    pub fn format(&mut self, address: u64, length: u64, part: PartType) -> Result<()> {
        self.ensure_storage()?;
        self.invalidate_table(address, length, part);
        let storage = self.session.storage;
        let chunk = storage.geometry().write_chunk.min(ERASE_CHUNK) as u64;
        let native = self.device.supports_format();
        let zeros = if native {
            Vec::new()
        } else {
            vec![0u8; chunk.min(length) as usize]
        };
        let mut done = 0u64;
        while done < length {
            let offset = address + done;
            self.check_cancel(offset)?;
            let size = (length - done).min(chunk);
            let result = if native {
                self.device.format_chunk(storage, part, offset, size)
            } else {
                self.device
                    .write_chunk(storage, part, offset, &zeros[..size as usize])
            };
            result.map_err(|e| chunk_failed(offset, done, e))?;
            done += size;
            self.progress(FlashPhase::Erasing, "erase", done, length);
        }
        Ok(())
    }

    /// Read and parse the partition table at the start of `part`,
    /// caching the user-area table in the session.
    pub fn partition_table(&mut self, part: PartType) -> Result<PartitionTable> {
        if part.is_user()
            && let Some(table) = &self.session.partitions
        {
            return Ok(table.clone());
        }
        let raw = self.dump_gpt(part)?;
        let table = PartitionTable::parse_with_page_size(&raw, None, self.session.page_size)?;
        info!(entries = table.entries.len(), format = ?table.format, "Partition table read");
        if part.is_user() {
            self.session.partitions = Some(table.clone());
        }
        Ok(table)
    }

    /// Length of the primary table window at the start of storage.
    fn table_window(&self) -> u64 {
        let page = self.session.page_size as u64;
        let entries = self.gpt.num_entries as u64 * self.gpt.entry_size as u64;
        (page * 2 + entries).div_ceil(page) * page
    }

    /// Drop the cached table when a user-area change reaches the table window.
    fn invalidate_table(&mut self, address: u64, length: u64, part: PartType) {
        if part.is_user()
            && length > 0
            && address < self.table_window()
            && self.session.partitions.take().is_some()
        {
            debug!("Partition table region modified, cache dropped");
        }
    }

    /// Raw bytes of the primary table window.
    pub fn dump_gpt(&mut self, part: PartType) -> Result<Vec<u8>> {
        let length = self.table_window();
        let mut raw = Vec::with_capacity(length as usize);
        self.read(0, length, &mut raw, part)?;
        Ok(raw)
    }

    /// Case-insensitive partition lookup in the user-area table.
    pub fn resolve_partition(&mut self, name: &str, part: PartType) -> Result<PartitionEntry> {
        if !part.is_user() {
            return Err(DaError::NotFound(format!(
                "partition '{name}' ({part} is raw-addressed)"
            )));
        }
        let table = self.partition_table(part)?;
        table.resolve(name).cloned()
    }

    fn partition_range(&mut self, name: &str) -> Result<(u64, u64)> {
        let page = self.session.page_size;
        let entry = self.resolve_partition(name, PartType::User)?;
        Ok((entry.byte_offset(page), entry.byte_len(page)))
    }

    /// Dump each named partition to `<dir>/<name>.bin`.
    pub fn read_partitions(&mut self, names: &[String], dir: &Path) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        for name in names {
            let result = (|| -> Result<()> {
                let (offset, length) = self.partition_range(name)?;
                let path = dir.join(format!("{name}.bin"));
                let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
                self.read(offset, length, &mut file, PartType::User)?;
                file.flush()?;
                info!(partition = %name, path = %path.display(), "Dumped partition");
                Ok(())
            })();
            report.record(name, result)?;
        }
        Ok(report)
    }

    /// Write each file to its named partition.
    pub fn write_partitions(&mut self, items: &[(String, PathBuf)]) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        for (name, path) in items {
            let result = (|| -> Result<()> {
                let (offset, capacity) = self.partition_range(name)?;
                let length = std::fs::metadata(path)?.len();
                if length > capacity {
                    return Err(DaError::OutOfRange {
                        name: name.clone(),
                        offset: 0,
                        length,
                    });
                }
                let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
                self.write(offset, length, &mut file, PartType::User)?;
                info!(partition = %name, path = %path.display(), "Wrote partition");
                Ok(())
            })();
            report.record(name, result)?;
        }
        Ok(report)
    }

    /// Erase whole partitions.
    pub fn erase_partitions(&mut self, names: &[String]) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        for name in names {
            let result = self
                .partition_range(name)
                .and_then(|(offset, length)| self.format(offset, length, PartType::User));
            report.record(name, result)?;
        }
        Ok(report)
    }

    /// Zero the first `sectors` pages of each named partition.
    pub fn erase_sectors(&mut self, items: &[(String, u64)]) -> Result<BulkReport> {
        let mut report = BulkReport::default();
        let page = self.session.page_size as u64;
        for (name, sectors) in items {
            let result = self.partition_range(name).and_then(|(offset, capacity)| {
                let length = (sectors * page).min(capacity);
                self.zero_fill(offset, length)
            });
            report.record(name, result)?;
        }
        Ok(report)
    }

    fn zero_fill(&mut self, address: u64, length: u64) -> Result<()> {
        self.ensure_storage()?;
        self.invalidate_table(address, length, PartType::User);
        let storage = self.session.storage;
        let zeros = vec![0u8; ERASE_CHUNK.min(length as usize)];
        let mut done = 0u64;
        while done < length {
            let offset = address + done;
            self.check_cancel(offset)?;
            let size = (length - done).min(ERASE_CHUNK as u64) as usize;
            self.device
                .write_chunk(storage, PartType::User, offset, &zeros[..size])
                .map_err(|e| chunk_failed(offset, done, e))?;
            done += size as u64;
            self.progress(FlashPhase::Erasing, "erase sectors", done, length);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::partition::TableFormat;
    use std::cell::{Cell, RefCell};

    /// In-memory storage for engine tests.
    #[derive(Default)]
    pub struct MemoryDevice {
        pub data: RefCell<Vec<u8>>,
        pub writes: RefCell<Vec<(u64, usize)>>,
        pub storage_calls: Cell<usize>,
        pub fail_write_at: Option<usize>,
        pub native_format: bool,
    }

    impl MemoryDevice {
        pub fn with_size(size: usize) -> Self {
            Self {
                data: RefCell::new(vec![0xFF; size]),
                ..Self::default()
            }
        }

        pub fn with_contents(data: Vec<u8>) -> Self {
            Self {
                data: RefCell::new(data),
                ..Self::default()
            }
        }
    }

    /// Two-entry GPT (`boot`, `seccfg` at sector 50) padded to 64 KiB.
    pub fn gpt_disk() -> Vec<u8> {
        let table = PartitionTable {
            entries: vec![
                PartitionEntry {
                    name: "boot".into(),
                    sector: 34,
                    sectors: 16,
                    type_guid: [1; 16],
                    unique_guid: [2; 16],
                    flags: 0,
                },
                PartitionEntry {
                    name: "seccfg".into(),
                    sector: 50,
                    sectors: 8,
                    type_guid: [1; 16],
                    unique_guid: [3; 16],
                    flags: 0,
                },
            ],
            page_size: 512,
            format: TableFormat::Gpt,
            disk_guid: None,
            num_entries: 2,
        };
        let mut disk = table.to_bytes();
        disk.resize(0x10000, 0xAB);
        disk
    }

    impl FlashDevice for MemoryDevice {
        fn set_storage(&self, _storage: StorageKind) -> Result<()> {
            self.storage_calls.set(self.storage_calls.get() + 1);
            Ok(())
        }

        fn read_chunk(
            &self,
            _storage: StorageKind,
            _part: PartType,
            address: u64,
            length: usize,
        ) -> Result<Vec<u8>> {
            let data = self.data.borrow();
            let start = address as usize;
            data.get(start..start + length)
                .map(<[u8]>::to_vec)
                .ok_or(DaError::Status(crate::protocol::StatusCode(0xC005_0003)))
        }

        fn write_chunk(
            &self,
            _storage: StorageKind,
            _part: PartType,
            address: u64,
            data: &[u8],
        ) -> Result<()> {
            let index = self.writes.borrow().len();
            self.writes.borrow_mut().push((address, data.len()));
            if self.fail_write_at == Some(index) {
                return Err(DaError::Status(crate::protocol::StatusCode(0xC005_0004)));
            }
            let mut storage = self.data.borrow_mut();
            let start = address as usize;
            let end = start + data.len();
            if end > storage.len() {
                storage.resize(end, 0xFF);
            }
            storage[start..end].copy_from_slice(data);
            Ok(())
        }

        fn format_chunk(
            &self,
            storage: StorageKind,
            part: PartType,
            address: u64,
            length: u64,
        ) -> Result<()> {
            self.write_chunk(storage, part, address, &vec![0u8; length as usize])
        }

        fn supports_format(&self) -> bool {
            self.native_format
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MemoryDevice, gpt_disk};
    use super::*;
    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;

    #[test]
    fn test_chunked_write_read_back() {
        let device = MemoryDevice::with_size(0);
        let mut session = FlashSession::default();
        let observer = RecordingObserver::default();
        let data: Vec<u8> = (0..MAX_WRITE_CHUNK * 2 + 1234).map(|i| (i % 251) as u8).collect();

        {
            let mut engine = FlashEngine::new(&device, &mut session, &observer);
            engine.write_buffer(0x1000, &data, PartType::User).unwrap();
        }
        let writes = device.writes.borrow().clone();
        assert_eq!(writes.len(), data.len().div_ceil(MAX_WRITE_CHUNK));
        assert_eq!(writes.iter().map(|w| w.1).sum::<usize>(), data.len());
        assert_eq!(writes[2], (0x1000 + 2 * MAX_WRITE_CHUNK as u64, 1234));
        assert_eq!(observer.progress_count(), 3);

        let mut engine = FlashEngine::new(&device, &mut session, &observer);
        let mut back = Vec::new();
        let n = engine
            .read(0x1000, data.len() as u64, &mut back, PartType::User)
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(back, data);
        assert_eq!(device.storage_calls.get(), 1);
    }

    #[test]
    fn test_chunk_failure_keeps_earlier_chunks() {
        let device = MemoryDevice {
            fail_write_at: Some(1),
            ..MemoryDevice::with_size(0)
        };
        let mut session = FlashSession::default();
        let data = vec![0x5Au8; MAX_WRITE_CHUNK * 3];

        let err = FlashEngine::new(&device, &mut session, &NullObserver)
            .write_buffer(0, &data, PartType::User)
            .unwrap_err();
        assert!(!err.is_fatal());
        match err {
            DaError::ChunkFailed {
                offset, completed, ..
            } => {
                assert_eq!(offset, MAX_WRITE_CHUNK as u64);
                assert_eq!(completed, MAX_WRITE_CHUNK as u64);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Third chunk never issued, first chunk is on the device.
        assert_eq!(device.writes.borrow().len(), 2);
        assert!(device.data.borrow()[..MAX_WRITE_CHUNK].iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn test_cancel_between_chunks() {
        let device = MemoryDevice::with_size(0);
        let mut session = FlashSession::default();
        session.cancel_token().cancel();
        let err = FlashEngine::new(&device, &mut session, &NullObserver)
            .write_buffer(0x200, &[1u8; 64], PartType::User)
            .unwrap_err();
        assert!(matches!(err, DaError::Cancelled { offset: 0x200 }));
        assert!(device.writes.borrow().is_empty());
        assert!(!session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_format_falls_back_to_zero_writes() {
        let device = MemoryDevice::with_size(MAX_WRITE_CHUNK + 0x400);
        let mut session = FlashSession::default();
        FlashEngine::new(&device, &mut session, &NullObserver)
            .format(0x200, MAX_WRITE_CHUNK as u64 + 0x100, PartType::Boot1)
            .unwrap();
        let data = device.data.borrow();
        assert_eq!(data[0x1FF], 0xFF);
        assert!(data[0x200..0x200 + MAX_WRITE_CHUNK + 0x100].iter().all(|b| *b == 0));
        assert_eq!(data[0x200 + MAX_WRITE_CHUNK + 0x100], 0xFF);
        assert_eq!(device.writes.borrow().len(), 2);
    }

    #[test]
    fn test_resolve_partition_from_device() {
        let device = MemoryDevice::with_contents(gpt_disk());
        let mut session = FlashSession::default();
        let mut engine = FlashEngine::new(&device, &mut session, &NullObserver)
            .with_gpt_settings(GptSettings {
                num_entries: 2,
                entry_size: 128,
            });

        let entry = engine.resolve_partition("SECCFG", PartType::User).unwrap();
        assert_eq!(entry.sector, 50);
        assert!(matches!(
            engine.resolve_partition("vendor", PartType::User),
            Err(DaError::PartitionNotFound { .. })
        ));
        assert!(engine.resolve_partition("boot", PartType::Boot1).is_err());
        assert!(session.partitions.is_some());
    }

    #[test]
    fn test_table_rewrite_drops_cached_table() {
        let device = MemoryDevice::with_contents(gpt_disk());
        let mut session = FlashSession::default();
        let mut engine = FlashEngine::new(&device, &mut session, &NullObserver)
            .with_gpt_settings(GptSettings {
                num_entries: 2,
                entry_size: 128,
            });
        assert_eq!(engine.resolve_partition("seccfg", PartType::User).unwrap().sector, 50);

        // Writes outside the table window keep the cache.
        engine.write_buffer(34 * 512, &[0x11; 512], PartType::User).unwrap();
        assert!(engine.session().partitions.is_some());

        let mut table = PartitionTable::parse(&gpt_disk(), None).unwrap();
        table.entries[1].sector = 60;
        engine.write_buffer(0, &table.to_bytes(), PartType::User).unwrap();
        assert!(engine.session().partitions.is_none());
        assert_eq!(engine.resolve_partition("seccfg", PartType::User).unwrap().sector, 60);

        engine.format(0x200, 0x200, PartType::User).unwrap();
        assert!(engine.session().partitions.is_none());
    }

    #[test]
    fn test_bulk_erase_continues_past_missing() {
        let device = MemoryDevice::with_contents(gpt_disk());
        let mut session = FlashSession::default();
        let mut engine = FlashEngine::new(&device, &mut session, &NullObserver)
            .with_gpt_settings(GptSettings {
                num_entries: 2,
                entry_size: 128,
            });

        let report = engine
            .erase_partitions(&["nope".to_string(), "boot".to_string()])
            .unwrap();
        assert_eq!(report.succeeded, vec!["boot".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "nope");
        assert!(report.failed[0].1.contains("boot, seccfg"));
        assert!(device.data.borrow()[34 * 512..50 * 512].iter().all(|b| *b == 0));
        assert_eq!(device.data.borrow()[50 * 512], 0xAB);
    }

    #[test]
    fn test_bulk_read_and_write_files() {
        let dir = tempfile::tempdir().unwrap();
        let device = MemoryDevice::with_contents(gpt_disk());
        let mut session = FlashSession::default();
        let mut engine = FlashEngine::new(&device, &mut session, &NullObserver)
            .with_gpt_settings(GptSettings {
                num_entries: 2,
                entry_size: 128,
            });

        let report = engine
            .read_partitions(&["seccfg".to_string()], dir.path())
            .unwrap();
        assert!(report.is_success());
        let dumped = std::fs::read(dir.path().join("seccfg.bin")).unwrap();
        assert_eq!(dumped, vec![0xAB; 8 * 512]);

        let image = dir.path().join("boot.img");
        std::fs::write(&image, vec![0x11u8; 1000]).unwrap();
        let big = dir.path().join("big.img");
        std::fs::write(&big, vec![0x22u8; 9 * 512]).unwrap();
        let report = engine
            .write_partitions(&[("boot".to_string(), image), ("seccfg".to_string(), big)])
            .unwrap();
        assert_eq!(report.succeeded, vec!["boot".to_string()]);
        assert_eq!(report.failed[0].0, "seccfg");
        assert_eq!(device.data.borrow()[34 * 512 + 999], 0x11);
    }

    #[test]
    fn test_part_type_codes() {
        assert_eq!(PartType::User.code(StorageKind::Emmc), 8);
        assert_eq!(PartType::Gp(2).code(StorageKind::Emmc), 5);
        assert_eq!(PartType::User.code(StorageKind::Ufs), 2);
        assert_eq!("LU3".parse::<PartType>().unwrap(), PartType::Lu(3));
        assert_eq!("gp4".parse::<PartType>().unwrap(), PartType::Gp(4));
        assert!("gp5".parse::<PartType>().is_err());
        assert_eq!("UFS".parse::<StorageKind>().unwrap(), StorageKind::Ufs);
    }
}
