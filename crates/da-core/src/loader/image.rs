//! DA loader file parsing.
//!
//! Layout: 0x68-byte header, u32 image count at 0x68, then fixed-size
//! image records from 0x6C. Each record holds u16 identification fields
//! followed by up to ten 20-byte entry regions.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::ParseError;
use crate::protocol::ProtocolGeneration;

pub const LOADER_HEADER_SIZE: usize = 0x68;
pub const RECORD_SIZE: usize = 0xDC;
pub const LEGACY_RECORD_SIZE: usize = 0xD8;
pub const REGION_SIZE: usize = 20;
const RECORDS_OFFSET: usize = LOADER_HEADER_SIZE + 4;
const LEGACY_MARKER: [u8; 2] = [0xDA, 0xDA];
const V6_TAG: &[u8] = b"MTK_DA_v6";

/// One loadable segment inside a DA image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryRegion {
    pub buffer_id: u32,
    pub length: u32,
    pub load_address: u32,
    pub file_offset: u32,
    pub signature_length: u32,
}

impl EntryRegion {
    fn from_cursor(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            buffer_id: cursor.read_u32::<LittleEndian>()?,
            length: cursor.read_u32::<LittleEndian>()?,
            load_address: cursor.read_u32::<LittleEndian>()?,
            file_offset: cursor.read_u32::<LittleEndian>()?,
            signature_length: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REGION_SIZE);
        buf.write_u32::<LittleEndian>(self.buffer_id).unwrap();
        buf.write_u32::<LittleEndian>(self.length).unwrap();
        buf.write_u32::<LittleEndian>(self.load_address).unwrap();
        buf.write_u32::<LittleEndian>(self.file_offset).unwrap();
        buf.write_u32::<LittleEndian>(self.signature_length).unwrap();
        buf
    }
}

/// Which DA stage a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Sent through the boot ROM, runs from SRAM.
    First,
    /// Sent through the first stage with `BOOT_TO`, runs from DRAM.
    Second,
}

impl Stage {
    pub fn region_index(&self) -> usize {
        match self {
            Stage::First => 1,
            Stage::Second => 2,
        }
    }
}

/// Stage bytes loaded from a loader file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageImage {
    /// Region bytes, signature included.
    pub data: Vec<u8>,
    pub signature_len: usize,
    pub load_address: u32,
}

impl StageImage {
    /// Region bytes without the trailing signature.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data.len().saturating_sub(self.signature_len)]
    }
}

/// One DA variant described by a loader file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderImage {
    pub magic: u16,
    pub hw_code: u16,
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
    pub page_size: u16,
    pub entry_region_index: u16,
    pub regions: Vec<EntryRegion>,
    pub generation: ProtocolGeneration,
    /// Older 0xD8-byte record without the software version.
    pub legacy_layout: bool,
    pub path: PathBuf,
}

impl LoaderImage {
    fn from_record(
        record: &[u8],
        legacy: bool,
        generation: ProtocolGeneration,
        path: &Path,
    ) -> Result<Self, ParseError> {
        let mut cursor = Cursor::new(record);
        let magic = cursor.read_u16::<LittleEndian>()?;
        let hw_code = cursor.read_u16::<LittleEndian>()?;
        let hw_sub_code = cursor.read_u16::<LittleEndian>()?;
        let hw_version = cursor.read_u16::<LittleEndian>()?;
        let sw_version = if legacy {
            0
        } else {
            let sw = cursor.read_u16::<LittleEndian>()?;
            let _reserved = cursor.read_u16::<LittleEndian>()?;
            sw
        };
        let page_size = cursor.read_u16::<LittleEndian>()?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let entry_region_index = cursor.read_u16::<LittleEndian>()?;
        let region_count = cursor.read_u16::<LittleEndian>()? as usize;

        let header_len = cursor.position() as usize;
        let needed = header_len + region_count * REGION_SIZE;
        if needed > record.len() {
            return Err(ParseError::BufferTooSmall {
                expected: needed,
                actual: record.len(),
            });
        }
        let regions = (0..region_count)
            .map(|_| EntryRegion::from_cursor(&mut cursor))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            magic,
            hw_code,
            hw_sub_code,
            hw_version,
            sw_version,
            page_size,
            entry_region_index,
            regions,
            generation,
            legacy_layout: legacy,
            path: path.to_path_buf(),
        })
    }

    fn validate_regions(&self, file_size: u64) -> Result<(), ParseError> {
        for (index, region) in self.regions.iter().enumerate() {
            let end = region.file_offset as u64 + region.length as u64;
            if end > file_size {
                return Err(ParseError::RegionOutOfBounds {
                    index,
                    offset: region.file_offset as u64,
                    length: region.length as u64,
                    file_size,
                });
            }
        }
        Ok(())
    }

    pub fn stage_region(&self, stage: Stage) -> Result<&EntryRegion, ParseError> {
        let index = stage.region_index();
        self.regions.get(index).ok_or(ParseError::MissingRegion(index))
    }

    /// Cut a stage out of the loader file contents.
    pub fn stage_from_bytes(&self, file: &[u8], stage: Stage) -> Result<StageImage, ParseError> {
        let region = self.stage_region(stage)?;
        let start = region.file_offset as usize;
        let end = start + region.length as usize;
        if end > file.len() {
            return Err(ParseError::RegionOutOfBounds {
                index: stage.region_index(),
                offset: region.file_offset as u64,
                length: region.length as u64,
                file_size: file.len() as u64,
            });
        }
        Ok(StageImage {
            data: file[start..end].to_vec(),
            signature_len: region.signature_length as usize,
            load_address: region.load_address,
        })
    }

    /// Load a stage from the owning loader file.
    pub fn read_stage(&self, stage: Stage) -> Result<StageImage, ParseError> {
        let file = std::fs::read(&self.path)?;
        self.stage_from_bytes(&file, stage)
    }
}

impl std::fmt::Display for LoaderImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HWCode:0x{:04X},HWSubCode:0x{:04X},HWVer:0x{:04X},SWVer:0x{:04X} ({})",
            self.hw_code, self.hw_sub_code, self.hw_version, self.sw_version, self.generation
        )
    }
}

/// Parse every image described by a loader file's bytes.
///
/// Records with a zero hardware code are padding and are skipped.
pub fn parse_loader_bytes(data: &[u8], path: &Path) -> Result<Vec<LoaderImage>, ParseError> {
    if data.len() < RECORDS_OFFSET {
        return Err(ParseError::BufferTooSmall {
            expected: RECORDS_OFFSET,
            actual: data.len(),
        });
    }
    let header = &data[..LOADER_HEADER_SIZE];
    let generation = if header.windows(V6_TAG.len()).any(|w| w == V6_TAG) {
        ProtocolGeneration::V6
    } else {
        ProtocolGeneration::V5
    };
    let count = u32::from_le_bytes([data[0x68], data[0x69], data[0x6A], data[0x6B]]) as usize;

    let marker = RECORDS_OFFSET + LEGACY_RECORD_SIZE;
    let legacy = data.get(marker..marker + 2) == Some(&LEGACY_MARKER[..]);
    let record_size = if legacy {
        LEGACY_RECORD_SIZE
    } else {
        RECORD_SIZE
    };

    let mut images = Vec::with_capacity(count);
    for i in 0..count {
        let start = RECORDS_OFFSET + i * record_size;
        let end = start + record_size;
        let record = data.get(start..end).ok_or(ParseError::BufferTooSmall {
            expected: end,
            actual: data.len(),
        })?;
        let image = LoaderImage::from_record(record, legacy, generation, path)?;
        if image.hw_code == 0 {
            continue;
        }
        image.validate_regions(data.len() as u64)?;
        images.push(image);
    }
    Ok(images)
}

pub fn parse_loader_file<P: AsRef<Path>>(path: P) -> Result<Vec<LoaderImage>, ParseError> {
    let data = std::fs::read(path.as_ref())?;
    parse_loader_bytes(&data, path.as_ref())
}

/// Build a loader file. Used by tests and the repository round trip.
#[cfg(test)]
pub(crate) fn build_loader(images: &[(u16, u16, u16, u16)], v6: bool, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; LOADER_HEADER_SIZE];
    let tag: &[u8] = if v6 {
        &b"MTK_DOWNLOAD_AGENT\0MTK_DA_v6"[..]
    } else {
        &b"MTK_DOWNLOAD_AGENT"[..]
    };
    data[..tag.len()].copy_from_slice(tag);
    data.write_u32::<LittleEndian>(images.len() as u32).unwrap();

    let payload_offset = (RECORDS_OFFSET + images.len().max(1) * RECORD_SIZE + 2) as u32;
    for (hw_code, hw_sub_code, hw_version, sw_version) in images {
        let mut record = Vec::with_capacity(RECORD_SIZE);
        record.write_u16::<LittleEndian>(0xDADA).unwrap();
        record.write_u16::<LittleEndian>(*hw_code).unwrap();
        record.write_u16::<LittleEndian>(*hw_sub_code).unwrap();
        record.write_u16::<LittleEndian>(*hw_version).unwrap();
        record.write_u16::<LittleEndian>(*sw_version).unwrap();
        record.write_u16::<LittleEndian>(0).unwrap();
        record.write_u16::<LittleEndian>(0x200).unwrap();
        record.write_u16::<LittleEndian>(0).unwrap();
        record.write_u16::<LittleEndian>(1).unwrap();
        record.write_u16::<LittleEndian>(3).unwrap();
        let half = (payload.len() / 2) as u32;
        let regions = [
            EntryRegion::default(),
            EntryRegion {
                buffer_id: 1,
                length: half,
                load_address: 0x0020_0000,
                file_offset: payload_offset,
                signature_length: 0x10u32.min(half),
            },
            EntryRegion {
                buffer_id: 2,
                length: payload.len() as u32 - half,
                load_address: 0x4000_0000,
                file_offset: payload_offset + half,
                signature_length: 0x10u32.min(payload.len() as u32 - half),
            },
        ];
        for region in &regions {
            record.extend_from_slice(&region.to_bytes());
        }
        record.resize(RECORD_SIZE, 0);
        data.extend_from_slice(&record);
    }
    data.resize(payload_offset as usize, 0);
    data.extend_from_slice(payload);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_records() {
        let payload: Vec<u8> = (0..0x80u8).collect();
        let data = build_loader(&[(0x0766, 0x8A00, 0xCA00, 0), (0x0000, 0, 0, 0)], false, &payload);
        let images = parse_loader_bytes(&data, Path::new("MTK_DA.bin")).unwrap();

        // Zero hw code is skipped.
        assert_eq!(images.len(), 1);
        let image = &images[0];
        assert_eq!(image.hw_code, 0x0766);
        assert_eq!(image.hw_sub_code, 0x8A00);
        assert_eq!(image.hw_version, 0xCA00);
        assert_eq!(image.regions.len(), 3);
        assert_eq!(image.generation, ProtocolGeneration::V5);
        assert!(!image.legacy_layout);
    }

    #[test]
    fn test_v6_tag_detected() {
        let data = build_loader(&[(0x1208, 0, 0, 0)], true, &[0u8; 0x40]);
        let images = parse_loader_bytes(&data, Path::new("x")).unwrap();
        assert_eq!(images[0].generation, ProtocolGeneration::V6);
    }

    #[test]
    fn test_legacy_record_layout() {
        let mut data = vec![0u8; LOADER_HEADER_SIZE];
        data.write_u32::<LittleEndian>(2).unwrap();
        for hw in [0x6572u16, 0x6582] {
            let mut record = Vec::new();
            for v in [0xDADA, hw, 0x8A00, 0xCA01, 0x200, 0, 0, 0] {
                record.write_u16::<LittleEndian>(v).unwrap();
            }
            record.resize(LEGACY_RECORD_SIZE, 0);
            data.extend_from_slice(&record);
        }
        let images = parse_loader_bytes(&data, Path::new("legacy")).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].legacy_layout);
        assert_eq!(images[1].hw_code, 0x6582);
        assert_eq!(images[1].hw_version, 0xCA01);
        assert_eq!(images[1].sw_version, 0);
        assert_eq!(images[1].page_size, 0x200);
    }

    #[test]
    fn test_region_out_of_bounds() {
        let mut data = build_loader(&[(0x0766, 0, 0, 0)], false, &[0u8; 0x40]);
        data.truncate(data.len() - 8);
        assert!(matches!(
            parse_loader_bytes(&data, Path::new("x")),
            Err(ParseError::RegionOutOfBounds { index: 2, .. })
        ));
    }

    #[test]
    fn test_stage_split() {
        let payload: Vec<u8> = (0..0x80u8).collect();
        let data = build_loader(&[(0x0766, 0, 0, 0)], false, &payload);
        let image = &parse_loader_bytes(&data, Path::new("x")).unwrap()[0];

        let first = image.stage_from_bytes(&data, Stage::First).unwrap();
        assert_eq!(first.data, payload[..0x40]);
        assert_eq!(first.payload().len(), 0x30);
        assert_eq!(first.load_address, 0x0020_0000);

        let second = image.stage_from_bytes(&data, Stage::Second).unwrap();
        assert_eq!(second.data, payload[0x40..]);
        assert_eq!(second.load_address, 0x4000_0000);
    }
}
