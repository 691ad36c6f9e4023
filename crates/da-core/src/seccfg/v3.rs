//! Seccfg V3: tagged header around an encrypted status block.
//!
//! ```text
//! AND_SECCFG_v\0\0\0\0 | MMMM | ver | size | enc_offset | enc_len |
//! lock_try u8 | lock_done u8 | page_size u16 | page_count u32 |
//! ... | enc[enc_offset..enc_offset + enc_len] | EEEE
//! ```
//!
//! The decrypted span starts with `siu_status | seccfg_status | seccfg_attr`
//! followed by the image info area, which is carried through untouched.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use tracing::debug;

use super::LockFlag;
use super::v4::{V4_MAGIC_BEGIN, V4_MAGIC_END};
use crate::crypto::{CryptoMode, HwCrypto, SeccfgAlgo};
use crate::error::{ParseError, Result};
use crate::state::LockState;

pub const V3_TAG: &[u8; 12] = b"AND_SECCFG_v";
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 0x2C;
const STATUS_LEN: usize = 12;

pub const SECCFG_COMPLETE: u32 = 0x4343_4343;
pub const SECCFG_INCOMPLETE: u32 = 0x4949_4949;
pub const ATTR_UNLOCKED: u32 = 0x4444_4444;
pub const ATTR_LOCKED: u32 = 0x6000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeccfgV3 {
    pub seccfg_ver: u32,
    pub seccfg_size: u32,
    pub enc_offset: u32,
    pub enc_len: u32,
    pub lock_try: u8,
    pub lock_done: u8,
    pub page_size: u16,
    pub page_count: u32,
    pub siu_status: u32,
    pub seccfg_status: u32,
    pub seccfg_attr: u32,
    /// Decrypted image info area.
    pub image_info: Vec<u8>,
    /// Whole record as read; re-serialisation patches it in place.
    raw: Vec<u8>,
    pub algo: Option<SeccfgAlgo>,
}

fn word(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

impl SeccfgV3 {
    /// Parse the clear header and locate the encrypted span.
    pub fn parse_header(data: &[u8]) -> std::result::Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::BufferTooSmall {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        if !data.starts_with(V3_TAG) {
            return Err(ParseError::InvalidMagic {
                expected: u32::from_be_bytes([b'A', b'N', b'D', b'_']),
                actual: word(data, 0).swap_bytes(),
            });
        }

        let mut cursor = Cursor::new(&data[TAG_LEN..HEADER_LEN]);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != V4_MAGIC_BEGIN {
            return Err(ParseError::InvalidMagic {
                expected: V4_MAGIC_BEGIN,
                actual: magic,
            });
        }
        let seccfg_ver = cursor.read_u32::<LittleEndian>()?;
        let seccfg_size = cursor.read_u32::<LittleEndian>()?;
        let enc_offset = cursor.read_u32::<LittleEndian>()?;
        let enc_len = cursor.read_u32::<LittleEndian>()?;
        let lock_try = cursor.read_u8()?;
        let lock_done = cursor.read_u8()?;
        let page_size = cursor.read_u16::<LittleEndian>()?;
        let page_count = cursor.read_u32::<LittleEndian>()?;

        let end = enc_offset as usize + enc_len as usize;
        if (enc_len as usize) < STATUS_LEN || data.len() < end + 4 {
            return Err(ParseError::BufferTooSmall {
                expected: end + 4,
                actual: data.len(),
            });
        }
        let end_flag = word(data, end);
        if end_flag != V4_MAGIC_END {
            return Err(ParseError::InvalidMagic {
                expected: V4_MAGIC_END,
                actual: end_flag,
            });
        }

        Ok(Self {
            seccfg_ver,
            seccfg_size,
            enc_offset,
            enc_len,
            lock_try,
            lock_done,
            page_size,
            page_count,
            siu_status: 0,
            seccfg_status: 0,
            seccfg_attr: 0,
            image_info: Vec::new(),
            raw: data.to_vec(),
            algo: None,
        })
    }

    fn span(&self) -> std::ops::Range<usize> {
        self.enc_offset as usize..self.enc_offset as usize + self.enc_len as usize
    }

    /// Try each protection until the span decrypts to a plausible status
    /// block, then load it.
    pub fn detect_algo<C: HwCrypto + ?Sized>(&mut self, crypto: &C) -> Option<SeccfgAlgo> {
        let enc = self.raw[self.span()].to_vec();
        for algo in SeccfgAlgo::ALL {
            let plain = match crypto.derive(CryptoMode::SeccfgDecrypt, &enc, algo.engine()) {
                Ok(plain) if plain.len() >= STATUS_LEN => plain,
                Ok(_) => continue,
                Err(e) => {
                    debug!(?algo, "Seccfg decrypt failed: {e}");
                    continue;
                }
            };
            let status = word(&plain, 4);
            if status == SECCFG_COMPLETE || status == SECCFG_INCOMPLETE {
                self.siu_status = word(&plain, 0);
                self.seccfg_status = status;
                self.seccfg_attr = word(&plain, 8);
                self.image_info = plain[STATUS_LEN..].to_vec();
                self.algo = Some(algo);
                return self.algo;
            }
        }
        None
    }

    pub fn lock_state(&self) -> LockState {
        match self.seccfg_attr {
            ATTR_UNLOCKED => LockState::Unlocked,
            ATTR_LOCKED => LockState::Locked,
            _ => LockState::Unknown,
        }
    }

    pub fn set_lock_state(&mut self, flag: LockFlag) {
        self.seccfg_attr = match flag {
            LockFlag::Lock => ATTR_LOCKED,
            LockFlag::Unlock => ATTR_UNLOCKED,
        };
        self.seccfg_status = SECCFG_COMPLETE;
    }

    /// Re-encrypt the status block into a copy of the original record.
    pub fn create<C: HwCrypto + ?Sized>(&mut self, crypto: &C, algo: SeccfgAlgo) -> Result<Vec<u8>> {
        let mut plain = Vec::with_capacity(self.enc_len as usize);
        for w in [self.siu_status, self.seccfg_status, self.seccfg_attr] {
            plain.extend_from_slice(&w.to_le_bytes());
        }
        plain.extend_from_slice(&self.image_info);
        plain.resize(self.enc_len as usize, 0);

        let enc = crypto.derive(CryptoMode::SeccfgEncrypt, &plain, algo.engine())?;
        let span = self.span();
        let mut out = self.raw.clone();
        let n = enc.len().min(span.len());
        out[span.start..span.start + n].copy_from_slice(&enc[..n]);
        Ok(out)
    }
}
