//! Partition module - GPT-style and legacy PMT tables.

pub mod gpt;
pub mod pmt;

use std::fmt;

use crate::error::{DaError, ParseError};

/// Page size assumed when the table does not reveal one.
pub const DEFAULT_PAGE_SIZE: u32 = 512;

/// One named storage region. `sector` and `sectors` are in table pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub sector: u64,
    pub sectors: u64,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub flags: u64,
}

impl PartitionEntry {
    pub fn byte_offset(&self, page_size: u32) -> u64 {
        self.sector * page_size as u64
    }

    pub fn byte_len(&self, page_size: u32) -> u64 {
        self.sectors * page_size as u64
    }
}

/// On-disk table flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// GPT header with 128-byte EFI entries.
    Gpt,
    /// GPT header with 96-byte MTK resident entries.
    MtkPmt,
    /// `PTv1` fixed descriptor table.
    LegacyPmt,
}

/// Partitions in on-disk order.
///
/// Sorted, non-overlapping entries are the norm but not assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub entries: Vec<PartitionEntry>,
    pub page_size: u32,
    pub format: TableFormat,
    pub disk_guid: Option<[u8; 16]>,
    /// Entry slots declared by the header, empty ones included.
    pub num_entries: u32,
}

impl PartitionTable {
    /// Parse a table from the first storage window, with an optional
    /// backup window used when the primary GPT is damaged.
    pub fn parse(primary: &[u8], backup: Option<&[u8]>) -> Result<Self, ParseError> {
        Self::parse_with_page_size(primary, backup, DEFAULT_PAGE_SIZE)
    }

    pub fn parse_with_page_size(
        primary: &[u8],
        backup: Option<&[u8]>,
        page_hint: u32,
    ) -> Result<Self, ParseError> {
        if pmt::is_pmt(primary) {
            return pmt::parse(primary, page_hint);
        }
        gpt::parse(primary, backup, page_hint)
    }

    /// Case-insensitive lookup; `None` when missing or ambiguous.
    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        find_entry(&self.entries, name)
    }

    /// Lookup that reports the available names on a miss.
    pub fn resolve(&self, name: &str) -> Result<&PartitionEntry, DaError> {
        resolve_entry(&self.entries, name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Entry array in the table's own layout.
    pub fn entry_array_bytes(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|e| match self.format {
                TableFormat::Gpt => gpt::efi_entry_bytes(e),
                TableFormat::MtkPmt => gpt::resident_entry_bytes(e, self.page_size),
                TableFormat::LegacyPmt => pmt::descriptor_bytes(e, self.page_size),
            })
            .collect()
    }

    /// Full table image as it would sit at the start of storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.format {
            TableFormat::Gpt | TableFormat::MtkPmt => gpt::primary_bytes(self),
            TableFormat::LegacyPmt => pmt::table_bytes(self),
        }
    }
}

/// The single entry named `name`, ignoring ASCII case. When several
/// entries differ only in case, exactly one exact-case match is required.
pub fn find_entry<'a>(entries: &'a [PartitionEntry], name: &str) -> Option<&'a PartitionEntry> {
    let mut matches = entries.iter().filter(|e| e.name.eq_ignore_ascii_case(name));
    let first = matches.next()?;
    if matches.next().is_none() {
        return Some(first);
    }
    let mut exact = entries.iter().filter(|e| e.name == name);
    match (exact.next(), exact.next()) {
        (Some(entry), None) => Some(entry),
        _ => None,
    }
}

/// [`find_entry`] with missing or ambiguous names reported as
/// [`DaError::PartitionNotFound`].
pub fn resolve_entry<'a>(entries: &'a [PartitionEntry], name: &str) -> Result<&'a PartitionEntry, DaError> {
    find_entry(entries, name).ok_or_else(|| DaError::PartitionNotFound {
        name: name.to_string(),
        available: entries.iter().map(|e| e.name.clone()).collect(),
    })
}

/// GUID in the usual mixed-endian text form.
pub fn guid_string(guid: &[u8; 16]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{}",
        u32::from_le_bytes([guid[0], guid[1], guid[2], guid[3]]),
        u16::from_le_bytes([guid[4], guid[5]]),
        u16::from_le_bytes([guid[6], guid[7]]),
        guid[8],
        guid[9],
        guid[10..].iter().map(|b| format!("{b:02X}")).collect::<String>()
    )
}

impl fmt::Display for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?} table, page size {}:", self.format, self.page_size)?;
        for e in &self.entries {
            writeln!(
                f,
                "{:<20} Offset 0x{:016X}, Length 0x{:016X}, Flags 0x{:08X}, Type {}",
                e.name,
                e.byte_offset(self.page_size),
                e.byte_len(self.page_size),
                e.flags,
                guid_string(&e.type_guid)
            )?;
        }
        writeln!(f, "Total disk size: 0x{:016X}", self.disk_size())
    }
}

impl PartitionTable {
    /// End of the furthest partition in bytes.
    pub fn disk_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| (e.sector + e.sectors) * self.page_size as u64)
            .max()
            .unwrap_or(0)
    }
}
