//! GPT-style partition tables.
//!
//! Two entry layouts share the header: 128-byte EFI entries with UTF-16
//! names and 96-byte MTK resident entries that store byte offsets.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use tracing::{debug, warn};

use super::{PartitionEntry, PartitionTable, TableFormat};
use crate::error::ParseError;

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const HEADER_SIZE: usize = 92;
pub const EFI_ENTRY_SIZE: usize = 128;
pub const RESIDENT_ENTRY_SIZE: usize = 96;
const SCAN_STEP: usize = 512;
const EFI_NAME_BYTES: usize = 72;
const RESIDENT_NAME_BYTES: usize = 64;

/// GPT header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::BufferTooSmall {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        if &data[..8] != GPT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u32::from_le_bytes([b'E', b'F', b'I', b' ']),
                actual: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            });
        }
        let mut cursor = Cursor::new(&data[8..]);
        let revision = cursor.read_u32::<LittleEndian>()?;
        let header_size = cursor.read_u32::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let _reserved = cursor.read_u32::<LittleEndian>()?;
        let current_lba = cursor.read_u64::<LittleEndian>()?;
        let backup_lba = cursor.read_u64::<LittleEndian>()?;
        let first_usable_lba = cursor.read_u64::<LittleEndian>()?;
        let last_usable_lba = cursor.read_u64::<LittleEndian>()?;
        let mut disk_guid = [0u8; 16];
        cursor.read_exact(&mut disk_guid)?;
        Ok(Self {
            revision,
            header_size,
            crc32,
            current_lba,
            backup_lba,
            first_usable_lba,
            last_usable_lba,
            disk_guid,
            entries_lba: cursor.read_u64::<LittleEndian>()?,
            num_entries: cursor.read_u32::<LittleEndian>()?,
            entry_size: cursor.read_u32::<LittleEndian>()?,
            entries_crc32: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Serialise with the stored CRC field.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(GPT_SIGNATURE);
        buf.write_u32::<LittleEndian>(self.revision).unwrap();
        buf.write_u32::<LittleEndian>(self.header_size).unwrap();
        buf.write_u32::<LittleEndian>(self.crc32).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(self.current_lba).unwrap();
        buf.write_u64::<LittleEndian>(self.backup_lba).unwrap();
        buf.write_u64::<LittleEndian>(self.first_usable_lba).unwrap();
        buf.write_u64::<LittleEndian>(self.last_usable_lba).unwrap();
        buf.extend_from_slice(&self.disk_guid);
        buf.write_u64::<LittleEndian>(self.entries_lba).unwrap();
        buf.write_u32::<LittleEndian>(self.num_entries).unwrap();
        buf.write_u32::<LittleEndian>(self.entry_size).unwrap();
        buf.write_u32::<LittleEndian>(self.entries_crc32).unwrap();
        buf
    }

    /// CRC32 over the declared header size with the CRC field zeroed.
    pub fn compute_crc(raw: &[u8], header_size: usize) -> u32 {
        let len = header_size.clamp(HEADER_SIZE, raw.len().max(HEADER_SIZE));
        let mut copy = raw[..len.min(raw.len())].to_vec();
        copy[16..20].fill(0);
        crc32fast::hash(&copy)
    }
}

/// Offset of the first header signature, scanning forward.
pub fn find_header(data: &[u8]) -> Option<usize> {
    (0..data.len())
        .step_by(SCAN_STEP)
        .find(|&off| data.get(off..off + 8) == Some(&GPT_SIGNATURE[..]))
}

/// Offset of the last header signature, scanning backward.
pub fn find_backup_header(data: &[u8]) -> Option<usize> {
    (0..data.len())
        .step_by(SCAN_STEP)
        .rev()
        .find(|&off| data.get(off..off + 8) == Some(&GPT_SIGNATURE[..]))
}

fn infer_page_size(offset: usize, header: &GptHeader, hint: u32) -> u32 {
    let offset = offset as u64;
    let at = |page: u64| {
        header.current_lba > 0 && header.current_lba.checked_mul(page) == Some(offset)
    };
    if at(4096) {
        4096
    } else if at(512) {
        512
    } else {
        hint
    }
}

/// Parse the table whose header sits at `offset` in `data`.
pub fn parse_at(data: &[u8], offset: usize, page_hint: u32) -> Result<PartitionTable, ParseError> {
    let raw = data.get(offset..).ok_or(ParseError::BufferTooSmall {
        expected: offset,
        actual: data.len(),
    })?;
    let header = GptHeader::from_bytes(raw)?;

    let computed = GptHeader::compute_crc(raw, header.header_size as usize);
    if computed != header.crc32 {
        return Err(ParseError::CrcMismatch {
            what: "GPT header",
            stored: header.crc32,
            computed,
        });
    }

    let page_size = infer_page_size(offset, &header, page_hint);
    // Header fields come off the device; any overflow is a bad table.
    let entries_offset = (header.entries_lba as i128 - header.current_lba as i128)
        .checked_mul(page_size as i128)
        .and_then(|delta| delta.checked_add(offset as i128))
        .and_then(|start| usize::try_from(start).ok());
    let entries_len = (header.num_entries as u64)
        .checked_mul(header.entry_size as u64)
        .and_then(|len| usize::try_from(len).ok());
    let end = entries_offset
        .zip(entries_len)
        .and_then(|(start, len)| start.checked_add(len));
    let (start, end) = match (entries_offset, end) {
        (Some(start), Some(end)) if end <= data.len() => (start, end),
        _ => {
            return Err(ParseError::BufferTooSmall {
                expected: end.unwrap_or(usize::MAX),
                actual: data.len(),
            });
        }
    };
    let entries_raw = &data[start..end];

    let computed = crc32fast::hash(entries_raw);
    if computed != header.entries_crc32 {
        return Err(ParseError::CrcMismatch {
            what: "GPT entry array",
            stored: header.entries_crc32,
            computed,
        });
    }

    let (format, entries) = match header.entry_size as usize {
        EFI_ENTRY_SIZE => (TableFormat::Gpt, parse_efi_entries(entries_raw)?),
        RESIDENT_ENTRY_SIZE => (
            TableFormat::MtkPmt,
            parse_resident_entries(entries_raw, page_size)?,
        ),
        other => {
            return Err(ParseError::Unsupported {
                what: "GPT entry size",
                value: other as u32,
            });
        }
    };
    debug!(
        offset,
        page_size,
        entries = entries.len(),
        "Parsed {:?} partition table",
        format
    );

    Ok(PartitionTable {
        entries,
        page_size,
        format,
        disk_guid: Some(header.disk_guid),
        num_entries: header.num_entries,
    })
}

/// Parse a primary table, falling back to the backup copy.
pub fn parse(
    primary: &[u8],
    backup: Option<&[u8]>,
    page_hint: u32,
) -> Result<PartitionTable, ParseError> {
    let primary_err = match find_header(primary) {
        Some(offset) => match parse_at(primary, offset, page_hint) {
            Ok(table) => return Ok(table),
            Err(e) => e,
        },
        None => ParseError::NoPartitionTable,
    };
    let Some(backup) = backup else {
        return Err(primary_err);
    };
    warn!(error = %primary_err, "Primary GPT unusable, trying backup");
    let offset = find_backup_header(backup).ok_or(ParseError::NoPartitionTable)?;
    parse_at(backup, offset, page_hint)
}

fn parse_efi_entries(raw: &[u8]) -> Result<Vec<PartitionEntry>, ParseError> {
    let mut entries = Vec::new();
    for chunk in raw.chunks_exact(EFI_ENTRY_SIZE) {
        let mut cursor = Cursor::new(chunk);
        let mut type_guid = [0u8; 16];
        cursor.read_exact(&mut type_guid)?;
        if type_guid == [0u8; 16] {
            continue;
        }
        let mut unique_guid = [0u8; 16];
        cursor.read_exact(&mut unique_guid)?;
        let first_lba = cursor.read_u64::<LittleEndian>()?;
        let last_lba = cursor.read_u64::<LittleEndian>()?;
        let flags = cursor.read_u64::<LittleEndian>()?;
        let name_raw = &chunk[56..56 + EFI_NAME_BYTES];
        let units: Vec<u16> = name_raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        entries.push(PartitionEntry {
            name: String::from_utf16_lossy(&units),
            sector: first_lba,
            sectors: (last_lba + 1).saturating_sub(first_lba),
            type_guid,
            unique_guid,
            flags,
        });
    }
    Ok(entries)
}

fn parse_resident_entries(raw: &[u8], page_size: u32) -> Result<Vec<PartitionEntry>, ParseError> {
    let page = page_size.max(1) as u64;
    let mut entries = Vec::new();
    for chunk in raw.chunks_exact(RESIDENT_ENTRY_SIZE) {
        let name_raw = &chunk[..RESIDENT_NAME_BYTES];
        let end = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        if end == 0 {
            continue;
        }
        let mut cursor = Cursor::new(&chunk[RESIDENT_NAME_BYTES..]);
        let size = cursor.read_u64::<LittleEndian>()?;
        let part_id = cursor.read_u64::<LittleEndian>()?;
        let offset = cursor.read_u64::<LittleEndian>()?;
        let mask_flags = cursor.read_u64::<LittleEndian>()?;

        let mut type_guid = [0u8; 16];
        type_guid[..8].copy_from_slice(&part_id.to_le_bytes());
        entries.push(PartitionEntry {
            name: String::from_utf8_lossy(&name_raw[..end]).into_owned(),
            sector: offset / page,
            sectors: size / page,
            type_guid,
            unique_guid: [0u8; 16],
            flags: mask_flags,
        });
    }
    Ok(entries)
}

pub(super) fn efi_entry_bytes(entry: &PartitionEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EFI_ENTRY_SIZE);
    buf.extend_from_slice(&entry.type_guid);
    buf.extend_from_slice(&entry.unique_guid);
    buf.write_u64::<LittleEndian>(entry.sector).unwrap();
    buf.write_u64::<LittleEndian>((entry.sector + entry.sectors).saturating_sub(1))
        .unwrap();
    buf.write_u64::<LittleEndian>(entry.flags).unwrap();
    for unit in entry.name.encode_utf16().take(EFI_NAME_BYTES / 2) {
        buf.write_u16::<LittleEndian>(unit).unwrap();
    }
    buf.resize(EFI_ENTRY_SIZE, 0);
    buf
}

pub(super) fn resident_entry_bytes(entry: &PartitionEntry, page_size: u32) -> Vec<u8> {
    let page = page_size as u64;
    let mut buf = Vec::with_capacity(RESIDENT_ENTRY_SIZE);
    let name = entry.name.as_bytes();
    let len = name.len().min(RESIDENT_NAME_BYTES - 1);
    buf.extend_from_slice(&name[..len]);
    buf.resize(RESIDENT_NAME_BYTES, 0);
    let part_id = u64::from_le_bytes(entry.type_guid[..8].try_into().unwrap_or([0u8; 8]));
    buf.write_u64::<LittleEndian>(entry.sectors * page).unwrap();
    buf.write_u64::<LittleEndian>(part_id).unwrap();
    buf.write_u64::<LittleEndian>(entry.sector * page).unwrap();
    buf.write_u64::<LittleEndian>(entry.flags).unwrap();
    buf
}

/// Primary image: protective page, header page, entry array.
pub(super) fn primary_bytes(table: &PartitionTable) -> Vec<u8> {
    let page = table.page_size as usize;
    let entries = table.entry_array_bytes();
    let entry_size = match table.format {
        TableFormat::MtkPmt => RESIDENT_ENTRY_SIZE,
        _ => EFI_ENTRY_SIZE,
    };
    let entries_pages = entries.len().div_ceil(page) as u64;
    let last_used = table
        .entries
        .iter()
        .map(|e| e.sector + e.sectors)
        .max()
        .unwrap_or(0);

    let mut header = GptHeader {
        revision: GPT_REVISION,
        header_size: HEADER_SIZE as u32,
        crc32: 0,
        current_lba: 1,
        backup_lba: 0,
        first_usable_lba: 2 + entries_pages,
        last_usable_lba: last_used.saturating_sub(1),
        disk_guid: table.disk_guid.unwrap_or_default(),
        entries_lba: 2,
        num_entries: (entries.len() / entry_size) as u32,
        entry_size: entry_size as u32,
        entries_crc32: crc32fast::hash(&entries),
    };
    header.crc32 = crc32fast::hash(&header.to_bytes());

    let mut out = vec![0u8; page];
    out[510] = 0x55;
    out[511] = 0xAA;
    let mut header_page = header.to_bytes();
    header_page.resize(page, 0);
    out.extend_from_slice(&header_page);
    out.extend_from_slice(&entries);
    out.resize(page * 2 + entries_pages as usize * page, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, sector: u64, sectors: u64) -> PartitionEntry {
        PartitionEntry {
            name: name.to_string(),
            sector,
            sectors,
            type_guid: [0xA2; 16],
            unique_guid: [0x11; 16],
            flags: 0,
        }
    }

    fn table(format: TableFormat, page_size: u32) -> PartitionTable {
        PartitionTable {
            entries: vec![entry("boot", 34, 8192), entry("seccfg", 8226, 1024), entry("userdata", 9250, 4096)],
            page_size,
            format,
            disk_guid: Some([0x42; 16]),
            num_entries: 3,
        }
    }

    #[test]
    fn test_efi_round_trip() {
        let original = table(TableFormat::Gpt, 512);
        let bytes = primary_bytes(&original);
        let parsed = parse(&bytes, None, 512).unwrap();

        assert_eq!(parsed.format, TableFormat::Gpt);
        assert_eq!(parsed.page_size, 512);
        let tuples: Vec<_> = parsed.entries.iter().map(|e| (e.name.as_str(), e.sector, e.sectors)).collect();
        assert_eq!(tuples, vec![("boot", 34, 8192), ("seccfg", 8226, 1024), ("userdata", 9250, 4096)]);
        assert_eq!(parsed.entry_array_bytes(), original.entry_array_bytes());
    }

    #[test]
    fn test_resident_entries_4k_pages() {
        let original = table(TableFormat::MtkPmt, 4096);
        let bytes = primary_bytes(&original);
        let parsed = parse(&bytes, None, 512).unwrap();

        assert_eq!(parsed.format, TableFormat::MtkPmt);
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.entries[1].name, "seccfg");
        assert_eq!(parsed.entries[1].sector, 8226);
        assert_eq!(parsed.entries[1].sectors, 1024);
    }

    #[test]
    fn test_header_found_past_first_sector() {
        let mut bytes = vec![0u8; 1024];
        let image = primary_bytes(&table(TableFormat::Gpt, 512));
        // Shift the whole image: header now sits at 1536 while claiming LBA 1.
        bytes.extend_from_slice(&image);
        let parsed = parse(&bytes, None, 512).unwrap();
        assert_eq!(parsed.entries.len(), 3);
    }

    #[test]
    fn test_header_crc_mismatch_uses_backup() {
        let good = primary_bytes(&table(TableFormat::Gpt, 512));
        let mut corrupt = good.clone();
        corrupt[512 + 24] ^= 0xFF;
        assert!(matches!(
            parse(&corrupt, None, 512),
            Err(ParseError::CrcMismatch { what: "GPT header", .. })
        ));

        // Backup: entries first, header in the last page.
        let entries = table(TableFormat::Gpt, 512).entry_array_bytes();
        let mut header = GptHeader::from_bytes(&good[512..]).unwrap();
        header.current_lba = 100;
        header.backup_lba = 1;
        header.entries_lba = 99;
        header.crc32 = 0;
        header.crc32 = crc32fast::hash(&header.to_bytes());
        let mut backup = entries.clone();
        backup.resize(512, 0);
        backup.extend_from_slice(&header.to_bytes());
        backup.resize(1024, 0);

        let parsed = parse(&corrupt, Some(&backup), 512).unwrap();
        assert_eq!(parsed.entries[0].name, "boot");
    }

    fn header_with_entries_at(current_lba: u64, entries_lba: u64) -> Vec<u8> {
        let header = GptHeader {
            revision: GPT_REVISION,
            header_size: HEADER_SIZE as u32,
            current_lba,
            entries_lba,
            num_entries: 4,
            entry_size: EFI_ENTRY_SIZE as u32,
            ..Default::default()
        };
        let mut bytes = header.to_bytes();
        let crc = GptHeader::compute_crc(&bytes, HEADER_SIZE);
        bytes[16..20].copy_from_slice(&crc.to_le_bytes());
        bytes.resize(0x1000, 0);
        bytes
    }

    #[test]
    fn test_hostile_entry_lba() {
        for (current, entries) in [(1, 1u64 << 62), (1u64 << 63, 0), (1, u64::MAX), (1, 1000)] {
            let bytes = header_with_entries_at(current, entries);
            assert!(matches!(
                parse_at(&bytes, 0, 512),
                Err(ParseError::BufferTooSmall { .. })
            ));
        }
    }

    #[test]
    fn test_entry_crc_mismatch() {
        let mut bytes = primary_bytes(&table(TableFormat::Gpt, 512));
        bytes[1024 + 60] ^= 0x01;
        assert!(matches!(
            parse(&bytes, None, 512),
            Err(ParseError::CrcMismatch { what: "GPT entry array", .. })
        ));
    }
}
