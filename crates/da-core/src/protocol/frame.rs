//! DA frame header.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::constants::DA_MAGIC;
use crate::error::ParseError;

/// Payload class carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    ProtocolFlow = 1,
    Message = 2,
}

/// DA frame header (12 bytes / 0x0C)
///
/// Every message in either direction is `magic | data_type | length`
/// followed by `length` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub data_type: u32,
    pub length: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 12;

    pub fn new(data_type: DataType, length: u32) -> Self {
        Self {
            data_type: data_type as u32,
            length,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(DA_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(self.data_type).unwrap();
        buf.write_u32::<LittleEndian>(self.length).unwrap();
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < Self::SIZE {
            return Err(ParseError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != DA_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: DA_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            data_type: cursor.read_u32::<LittleEndian>()?,
            length: cursor.read_u32::<LittleEndian>()?,
        })
    }
}
