//! Seccfg V4: seven header words and an encrypted SHA-256.

use sha2::{Digest, Sha256};
use tracing::debug;

use super::LockFlag;
use crate::crypto::{CryptoMode, HwCrypto, SeccfgAlgo};
use crate::error::{ParseError, Result};
use crate::state::LockState;

pub const V4_MAGIC_BEGIN: u32 = 0x4D4D_4D4D;
pub const V4_MAGIC_END: u32 = 0x4545_4545;
const HEADER_LEN: usize = 28;
const HASH_LEN: usize = 32;
const RECORD_ALIGN: usize = 0x200;

const LKS_DEFAULT: u32 = 1;
const LKS_UNLOCK: u32 = 3;
const LKS_LOCK: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeccfgV4 {
    pub seccfg_ver: u32,
    pub seccfg_size: u32,
    pub lock_state: u32,
    pub critical_lock_state: u32,
    pub sboot_runtime: u32,
    pub enc_hash: Vec<u8>,
    /// Protection that reproduced `enc_hash`, once detected.
    pub algo: Option<SeccfgAlgo>,
}

fn word(data: &[u8], index: usize) -> u32 {
    let o = index * 4;
    u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
}

impl SeccfgV4 {
    pub fn parse_header(data: &[u8]) -> std::result::Result<Self, ParseError> {
        if data.len() < HEADER_LEN + HASH_LEN {
            return Err(ParseError::BufferTooSmall {
                expected: HEADER_LEN + HASH_LEN,
                actual: data.len(),
            });
        }
        for (index, expected) in [(0, V4_MAGIC_BEGIN), (6, V4_MAGIC_END)] {
            let actual = word(data, index);
            if actual != expected {
                return Err(ParseError::InvalidMagic { expected, actual });
            }
        }
        Ok(Self {
            seccfg_ver: word(data, 1),
            seccfg_size: word(data, 2),
            lock_state: word(data, 3),
            critical_lock_state: word(data, 4),
            sboot_runtime: word(data, 5),
            enc_hash: data[HEADER_LEN..HEADER_LEN + HASH_LEN].to_vec(),
            algo: None,
        })
    }

    fn header_bytes(&self) -> Vec<u8> {
        [
            V4_MAGIC_BEGIN,
            self.seccfg_ver,
            self.seccfg_size,
            self.lock_state,
            self.critical_lock_state,
            self.sboot_runtime,
            V4_MAGIC_END,
        ]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
    }

    pub fn hash(&self) -> Vec<u8> {
        Sha256::digest(self.header_bytes()).to_vec()
    }

    /// Find the protection whose decryption of `enc_hash` matches the
    /// header hash. Engines that fail are skipped.
    pub fn detect_algo<C: HwCrypto + ?Sized>(&mut self, crypto: &C) -> Option<SeccfgAlgo> {
        let expected = self.hash();
        self.algo = SeccfgAlgo::ALL.into_iter().find(|algo| {
            match crypto.derive(CryptoMode::SeccfgDecrypt, &self.enc_hash, algo.engine()) {
                Ok(plain) => plain == expected,
                Err(e) => {
                    debug!(?algo, "Seccfg decrypt failed: {e}");
                    false
                }
            }
        });
        self.algo
    }

    pub fn lock_state(&self) -> LockState {
        match self.lock_state {
            LKS_UNLOCK => LockState::Unlocked,
            LKS_DEFAULT | LKS_LOCK => LockState::Locked,
            _ => LockState::Unknown,
        }
    }

    pub fn set_lock_state(&mut self, flag: LockFlag) {
        let (lock_state, critical) = match flag {
            LockFlag::Lock => (LKS_LOCK, 1),
            LockFlag::Unlock => (LKS_UNLOCK, 0),
        };
        self.lock_state = lock_state;
        self.critical_lock_state = critical;
    }

    /// Serialise with a freshly encrypted hash, padded to 0x200.
    pub fn create<C: HwCrypto + ?Sized>(&mut self, crypto: &C, algo: SeccfgAlgo) -> Result<Vec<u8>> {
        self.enc_hash = crypto.derive(CryptoMode::SeccfgEncrypt, &self.hash(), algo.engine())?;
        let mut out = self.header_bytes();
        out.extend_from_slice(&self.enc_hash);
        out.resize(out.len().div_ceil(RECORD_ALIGN) * RECORD_ALIGN, 0);
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn build(lock_state: u32, critical: u32, encrypt: impl Fn(&[u8]) -> Vec<u8>) -> Vec<u8> {
        let record = SeccfgV4 {
            seccfg_ver: 4,
            seccfg_size: 0x3C,
            lock_state,
            critical_lock_state: critical,
            sboot_runtime: 0,
            enc_hash: Vec::new(),
            algo: None,
        };
        let mut out = record.header_bytes();
        out.extend_from_slice(&encrypt(&record.hash()));
        out.resize(0x200, 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoEngine;
    use crate::crypto::testing::XorCrypto;

    #[test]
    fn test_parse_and_detect() {
        let crypto = XorCrypto {
            key: 0x5C,
            seccfg_engine: CryptoEngine::SejV3,
        };
        let data = testing::build(LKS_DEFAULT, 0, |h| h.iter().map(|b| b ^ 0x5C).collect());
        let mut record = SeccfgV4::parse_header(&data).unwrap();
        assert_eq!(record.lock_state(), LockState::Locked);
        assert_eq!(record.detect_algo(&crypto), Some(SeccfgAlgo::V3));
    }

    #[test]
    fn test_unlock_rewrites_hash() {
        let crypto = XorCrypto {
            key: 0x21,
            seccfg_engine: CryptoEngine::Software,
        };
        let data = testing::build(LKS_LOCK, 1, |h| h.iter().map(|b| b ^ 0x21).collect());
        let mut record = SeccfgV4::parse_header(&data).unwrap();
        let algo = record.detect_algo(&crypto).unwrap();

        record.set_lock_state(LockFlag::Unlock);
        let out = record.create(&crypto, algo).unwrap();
        assert_eq!(out.len(), 0x200);

        let mut reparsed = SeccfgV4::parse_header(&out).unwrap();
        assert_eq!((reparsed.lock_state, reparsed.critical_lock_state), (3, 0));
        assert_eq!(reparsed.detect_algo(&crypto), Some(SeccfgAlgo::Software));
    }

    #[test]
    fn test_bad_magic() {
        let mut data = testing::build(1, 0, |h| h.to_vec());
        data[24] = 0;
        assert!(matches!(
            SeccfgV4::parse_header(&data),
            Err(ParseError::InvalidMagic { .. })
        ));
        assert!(matches!(
            SeccfgV4::parse_header(&data[..0x20]),
            Err(ParseError::BufferTooSmall { .. })
        ));
    }
}
