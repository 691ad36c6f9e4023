//! Hardware crypto capability and device key export.
//!
//! Algorithms live behind [`HwCrypto`]; this module only decides what to
//! derive, from which device material, with which engine.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DaError, Result};
use crate::protocol::XFlash;
use crate::state::ChipInfo;
use crate::transport::Transport;

/// Crypto block used for a derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoEngine {
    Sej,
    Dxcc,
    Gcpu,
    Software,
    SejV3,
    SejV4,
}

impl fmt::Display for CryptoEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CryptoEngine::Sej => "sej",
            CryptoEngine::Dxcc => "dxcc",
            CryptoEngine::Gcpu => "gcpu",
            CryptoEngine::Software => "sw",
            CryptoEngine::SejV3 => "sej-v3",
            CryptoEngine::SejV4 => "sej-v4",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMode {
    RpmbKey,
    MiRpmbKey,
    FdeKey,
    Rpmb2Key,
    Mtee,
    SeccfgEncrypt,
    SeccfgDecrypt,
}

/// Seccfg hash protection variants, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccfgAlgo {
    Software,
    V3,
    V4,
    V2,
}

impl SeccfgAlgo {
    pub const ALL: [SeccfgAlgo; 4] = [
        SeccfgAlgo::Software,
        SeccfgAlgo::V3,
        SeccfgAlgo::V4,
        SeccfgAlgo::V2,
    ];

    pub fn engine(&self) -> CryptoEngine {
        match self {
            SeccfgAlgo::Software => CryptoEngine::Software,
            SeccfgAlgo::V3 => CryptoEngine::SejV3,
            SeccfgAlgo::V4 => CryptoEngine::SejV4,
            SeccfgAlgo::V2 => CryptoEngine::Sej,
        }
    }
}

/// Device crypto capability.
pub trait HwCrypto {
    /// Run `mode` over `data` on `engine`. Key-derivation modes ignore
    /// `data` when the engine needs no input.
    fn derive(&self, mode: CryptoMode, data: &[u8], engine: CryptoEngine) -> Result<Vec<u8>>;
}

impl<C: HwCrypto + ?Sized> HwCrypto for &C {
    fn derive(&self, mode: CryptoMode, data: &[u8], engine: CryptoEngine) -> Result<Vec<u8>> {
        (**self).derive(mode, data, engine)
    }
}

/// Capability stand-in when no crypto backend is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCrypto;

impl HwCrypto for NoCrypto {
    fn derive(&self, mode: CryptoMode, _data: &[u8], engine: CryptoEngine) -> Result<Vec<u8>> {
        Err(DaError::Crypto(format!("{mode:?} on {engine} unavailable")))
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Per-device identifiers and derived keys, hex encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub hw_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpmb_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirpmb_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpmb2_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fde_key: Option<String>,
}

impl DeviceKeys {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let keys: DeviceKeys = toml::from_str(&content)?;
        Ok(keys)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl fmt::Display for DeviceKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HWCODE : {}", self.hw_code)?;
        let fields = [
            ("MEID", &self.meid),
            ("SOCID", &self.socid),
            ("RPMB", &self.rpmb_key),
            ("MIRPMB", &self.mirpmb_key),
            ("RPMB2", &self.rpmb2_key),
            ("FDE", &self.fde_key),
        ];
        for (label, value) in fields {
            if let Some(v) = value {
                writeln!(f, "{label:<7}: {v}")?;
            }
        }
        Ok(())
    }
}

/// Base of the chip-id register block holding MEID and SoC id.
pub fn key_base(hw_code: u16) -> u32 {
    match hw_code {
        0x2601 | 0x6572 => 0x1114_1000,
        0x6261 => 0x7000_0000,
        0x8172 | 0x8176 => 0x0012_2000,
        _ => 0x0010_0000,
    }
}

pub const MEID_OFFSET: u32 = 0x8EC;
pub const MEID_WORDS: usize = 5;
pub const SOCID_OFFSET: u32 = 0x934;
pub const SOCID_WORDS: usize = 8;

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Read MEID and SoC id into `chip` unless already known.
pub fn read_chip_ids<T: Transport + ?Sized>(xflash: &XFlash<'_, T>, chip: &mut ChipInfo) -> Result<()> {
    let base = key_base(chip.hw_code);
    if chip.meid.is_none() {
        chip.meid = Some(words_to_bytes(&xflash.readmem(base + MEID_OFFSET, MEID_WORDS)?));
    }
    if chip.soc_id.is_none() {
        chip.soc_id = Some(words_to_bytes(&xflash.readmem(base + SOCID_OFFSET, SOCID_WORDS)?));
    }
    Ok(())
}

/// Collect device identifiers and derive the key set.
///
/// A key the backend cannot derive is omitted, not an error.
pub fn generate_keys<T: Transport + ?Sized, C: HwCrypto + ?Sized>(
    xflash: &XFlash<'_, T>,
    crypto: &C,
    chip: &mut ChipInfo,
) -> Result<DeviceKeys> {
    read_chip_ids(xflash, chip)?;

    let mut keys = DeviceKeys {
        hw_code: format!("0x{:04X}", chip.hw_code),
        meid: chip.meid.as_deref().map(to_hex),
        socid: chip.soc_id.as_deref().map(to_hex),
        ..Default::default()
    };

    let derive = |mode: CryptoMode| match crypto.derive(mode, &[], CryptoEngine::Dxcc) {
        Ok(key) => Some(to_hex(&key)),
        Err(e) => {
            warn!(?mode, "Key derivation failed: {e}");
            None
        }
    };
    keys.rpmb_key = derive(CryptoMode::RpmbKey);
    keys.mirpmb_key = derive(CryptoMode::MiRpmbKey);
    keys.rpmb2_key = derive(CryptoMode::Rpmb2Key);
    keys.fde_key = derive(CryptoMode::FdeKey);

    info!("Device keys:\n{keys}");
    Ok(keys)
}


#[cfg(test)]
mod tests {
    use super::testing::XorCrypto;
    use super::*;
    use crate::protocol::ProtocolGeneration;
    use crate::transport::MockTransport;

    #[test]
    fn test_key_base() {
        assert_eq!(key_base(0x6572), 0x1114_1000);
        assert_eq!(key_base(0x6261), 0x7000_0000);
        assert_eq!(key_base(0x8176), 0x0012_2000);
        assert_eq!(key_base(0x0766), 0x0010_0000);
    }

    #[test]
    fn test_generate_keys() {
        let transport = MockTransport::new();
        // MEID: five register reads, each device_ctrl + cmd + value + status.
        for i in 0..(MEID_WORDS + SOCID_WORDS) as u32 {
            transport.queue_status(0);
            transport.queue_status(0);
            transport.queue_frame(&(0x1000 + i).to_le_bytes());
            transport.queue_status(0);
        }
        let xflash = XFlash::new(&transport, ProtocolGeneration::V5).with_extension(true);
        let crypto = XorCrypto {
            key: 0x5A,
            seccfg_engine: CryptoEngine::Software,
        };
        let mut chip = ChipInfo {
            hw_code: 0x0766,
            ..Default::default()
        };

        let keys = generate_keys(&xflash, &crypto, &mut chip).unwrap();
        assert_eq!(keys.hw_code, "0x0766");
        assert_eq!(chip.meid.as_ref().map(|m| m.len()), Some(20));
        assert_eq!(keys.meid.as_deref().map(|m| &m[..8]), Some("00100000"));
        assert_eq!(keys.rpmb_key, Some("5a".repeat(32)));
        assert!(keys.mirpmb_key.is_none());
        assert_eq!(transport.pending_reads(), 0);
    }

    #[test]
    fn test_keys_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.toml");
        let keys = DeviceKeys {
            hw_code: "0x0766".into(),
            rpmb_key: Some("00ff".into()),
            ..Default::default()
        };
        keys.save_to_file(&path).unwrap();
        assert_eq!(DeviceKeys::load_from_file(&path).unwrap(), keys);
    }

    #[test]
    fn test_no_crypto() {
        assert!(matches!(
            NoCrypto.derive(CryptoMode::FdeKey, &[], CryptoEngine::Dxcc),
            Err(DaError::Crypto(_))
        ));
    }
}
