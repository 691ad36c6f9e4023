//! Legacy fixed-layout partition table (`PTv1`).
//!
//! `PTv1 | u32 count | count x (name[16] | u32 size | u32 offset)`, sizes and
//! offsets in bytes, no checksum.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::{PartitionEntry, PartitionTable, TableFormat};
use crate::error::ParseError;

pub const PMT_MAGIC: &[u8; 4] = b"PTv1";
pub const DESCRIPTOR_SIZE: usize = 24;
const NAME_BYTES: usize = 16;
const HEADER_BYTES: usize = 8;

pub fn is_pmt(data: &[u8]) -> bool {
    data.starts_with(PMT_MAGIC)
}

pub fn parse(data: &[u8], page_size: u32) -> Result<PartitionTable, ParseError> {
    if !is_pmt(data) {
        return Err(ParseError::NoPartitionTable);
    }
    if data.len() < HEADER_BYTES {
        return Err(ParseError::BufferTooSmall {
            expected: HEADER_BYTES,
            actual: data.len(),
        });
    }
    let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let needed = HEADER_BYTES + count * DESCRIPTOR_SIZE;
    if data.len() < needed {
        return Err(ParseError::BufferTooSmall {
            expected: needed,
            actual: data.len(),
        });
    }

    let page = page_size.max(1) as u64;
    let mut entries = Vec::with_capacity(count);
    for raw in data[HEADER_BYTES..needed].chunks_exact(DESCRIPTOR_SIZE) {
        let name_raw = &raw[..NAME_BYTES];
        let end = name_raw.iter().position(|&b| b == 0).unwrap_or(NAME_BYTES);
        if end == 0 {
            continue;
        }
        let mut cursor = Cursor::new(&raw[NAME_BYTES..]);
        let size = cursor.read_u32::<LittleEndian>()? as u64;
        let offset = cursor.read_u32::<LittleEndian>()? as u64;
        entries.push(PartitionEntry {
            name: String::from_utf8_lossy(&name_raw[..end]).into_owned(),
            sector: offset / page,
            sectors: size / page,
            type_guid: [0u8; 16],
            unique_guid: [0u8; 16],
            flags: 0,
        });
    }

    Ok(PartitionTable {
        entries,
        page_size,
        format: TableFormat::LegacyPmt,
        disk_guid: None,
        num_entries: count as u32,
    })
}

pub(super) fn descriptor_bytes(entry: &PartitionEntry, page_size: u32) -> Vec<u8> {
    let page = page_size as u64;
    let mut buf = Vec::with_capacity(DESCRIPTOR_SIZE);
    let name = entry.name.as_bytes();
    buf.extend_from_slice(&name[..name.len().min(NAME_BYTES - 1)]);
    buf.resize(NAME_BYTES, 0);
    buf.write_u32::<LittleEndian>((entry.sectors * page) as u32).unwrap();
    buf.write_u32::<LittleEndian>((entry.sector * page) as u32).unwrap();
    buf
}

pub(super) fn table_bytes(table: &PartitionTable) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(PMT_MAGIC);
    buf.write_u32::<LittleEndian>(table.entries.len() as u32).unwrap();
    buf.extend_from_slice(&table.entry_array_bytes());
    buf
}
