//! Seccfg module - lock-state records and the lock/unlock transform.

pub mod v3;
pub mod v4;

pub use v3::SeccfgV3;
pub use v4::SeccfgV4;

use std::fmt;
use std::str::FromStr;

use tracing::{info, instrument, warn};

use crate::crypto::{HwCrypto, SeccfgAlgo};
use crate::error::{DaError, Result};
use crate::events::FlashObserver;
use crate::flash::{FlashDevice, FlashEngine, PartType};
use crate::state::LockState;

pub const SECCFG_PARTITION: &str = "seccfg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFlag {
    Lock,
    Unlock,
}

impl LockFlag {
    pub fn target(&self) -> LockState {
        match self {
            LockFlag::Lock => LockState::Locked,
            LockFlag::Unlock => LockState::Unlocked,
        }
    }
}

impl fmt::Display for LockFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockFlag::Lock => write!(f, "lock"),
            LockFlag::Unlock => write!(f, "unlock"),
        }
    }
}

impl FromStr for LockFlag {
    type Err = DaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lock" => Ok(LockFlag::Lock),
            "unlock" => Ok(LockFlag::Unlock),
            _ => Err(DaError::NotFound(format!("lock flag '{s}', valid flags are: unlock, lock"))),
        }
    }
}

/// Record layout, decided from the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeccfgRecord {
    V3(SeccfgV3),
    V4(SeccfgV4),
}

impl SeccfgRecord {
    /// Parse the clear header of either layout. `Ok(None)` for unknown headers.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        if data.starts_with(v3::V3_TAG) {
            info!("Detected V3 lock state");
            return Ok(Some(SeccfgRecord::V3(SeccfgV3::parse_header(data)?)));
        }
        if data.starts_with(&v4::V4_MAGIC_BEGIN.to_le_bytes()) {
            info!("Detected V4 lock state");
            return Ok(Some(SeccfgRecord::V4(SeccfgV4::parse_header(data)?)));
        }
        Ok(None)
    }

    pub fn detect_algo<C: HwCrypto + ?Sized>(&mut self, crypto: &C) -> Option<SeccfgAlgo> {
        match self {
            SeccfgRecord::V3(r) => r.detect_algo(crypto),
            SeccfgRecord::V4(r) => r.detect_algo(crypto),
        }
    }

    pub fn lock_state(&self) -> LockState {
        match self {
            SeccfgRecord::V3(r) => r.lock_state(),
            SeccfgRecord::V4(r) => r.lock_state(),
        }
    }

    /// Apply `flag` and serialise with the detected protection.
    pub fn create<C: HwCrypto + ?Sized>(
        &mut self,
        flag: LockFlag,
        crypto: &C,
        algo: SeccfgAlgo,
    ) -> Result<Vec<u8>> {
        match self {
            SeccfgRecord::V3(r) => {
                r.set_lock_state(flag);
                r.create(crypto, algo)
            }
            SeccfgRecord::V4(r) => {
                r.set_lock_state(flag);
                r.create(crypto, algo)
            }
        }
    }
}

/// Result of the lock/unlock transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeccfgOutcome {
    /// New record bytes to write at the partition start.
    Rewritten { data: Vec<u8>, state: LockState },
    Unchanged(String),
}

/// Compute the record that puts the device into `flag`'s state.
///
/// Unknown headers, an unknown protection algorithm and a device already
/// in the requested state are reported as [`SeccfgOutcome::Unchanged`].
pub fn transform_seccfg<C: HwCrypto + ?Sized>(
    data: &[u8],
    flag: LockFlag,
    crypto: &C,
) -> Result<SeccfgOutcome> {
    let Some(mut record) = SeccfgRecord::parse(data)? else {
        return Ok(SeccfgOutcome::Unchanged(
            "Unknown seccfg partition header".into(),
        ));
    };
    if record.lock_state() == flag.target() {
        return Ok(SeccfgOutcome::Unchanged(format!(
            "Device is already {}",
            flag.target()
        )));
    }
    let Some(algo) = record.detect_algo(crypto) else {
        return Ok(SeccfgOutcome::Unchanged(
            "Unknown seccfg protection algorithm".into(),
        ));
    };
    // V3 only knows its state once decrypted.
    if record.lock_state() == flag.target() {
        return Ok(SeccfgOutcome::Unchanged(format!(
            "Device is already {}",
            flag.target()
        )));
    }

    let data = record.create(flag, crypto, algo)?;
    info!(?algo, "seccfg {flag} record prepared");
    Ok(SeccfgOutcome::Rewritten {
        data,
        state: flag.target(),
    })
}

/// Read the `seccfg` partition, apply `flag` and write the new record
/// back at the partition start.
#[instrument(skip(engine, crypto))]
pub fn toggle_seccfg<D, O, C>(
    engine: &mut FlashEngine<'_, D, O>,
    flag: LockFlag,
    crypto: &C,
) -> Result<SeccfgOutcome>
where
    D: FlashDevice,
    O: FlashObserver + ?Sized,
    C: HwCrypto + ?Sized,
{
    let entry = engine.resolve_partition(SECCFG_PARTITION, PartType::User)?;
    let page_size = engine.session().page_size;
    let offset = entry.byte_offset(page_size);
    let mut data = Vec::new();
    engine.read(offset, entry.byte_len(page_size), &mut data, PartType::User)?;

    let outcome = transform_seccfg(&data, flag, crypto)?;
    match &outcome {
        SeccfgOutcome::Rewritten { data, state } => {
            engine.write_buffer(offset, data, PartType::User)?;
            engine.session_mut().lock_state = *state;
            info!("Successfully wrote seccfg, device is now {state}");
        }
        SeccfgOutcome::Unchanged(reason) => warn!("{reason}"),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::XorCrypto;
    use crate::crypto::{CryptoEngine, NoCrypto};
    use crate::events::NullObserver;
    use crate::flash::GptSettings;
    use crate::flash::testing::{MemoryDevice, gpt_disk};
    use crate::state::FlashSession;

    fn crypto() -> XorCrypto {
        XorCrypto {
            key: 0x42,
            seccfg_engine: CryptoEngine::Sej,
        }
    }

    fn xor(data: &[u8]) -> Vec<u8> {
        data.iter().map(|b| b ^ 0x42).collect()
    }

    #[test]
    fn test_v4_unlock() {
        let data = v4::testing::build(1, 0, xor);
        match transform_seccfg(&data, LockFlag::Unlock, &crypto()).unwrap() {
            SeccfgOutcome::Rewritten { data, state } => {
                assert_eq!(state, LockState::Unlocked);
                assert_eq!(&data[12..20], &[3, 0, 0, 0, 0, 0, 0, 0]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_already_in_state() {
        let data = v4::testing::build(3, 0, xor);
        assert!(matches!(
            transform_seccfg(&data, LockFlag::Unlock, &crypto()).unwrap(),
            SeccfgOutcome::Unchanged(_)
        ));

        let data = v3::testing::build(v3::ATTR_LOCKED, xor);
        assert!(matches!(
            transform_seccfg(&data, LockFlag::Lock, &crypto()).unwrap(),
            SeccfgOutcome::Unchanged(_)
        ));
    }

    #[test]
    fn test_v3_unlock() {
        let data = v3::testing::build(v3::ATTR_LOCKED, xor);
        match transform_seccfg(&data, LockFlag::Unlock, &crypto()).unwrap() {
            SeccfgOutcome::Rewritten { data, .. } => {
                let mut record = SeccfgV3::parse_header(&data).unwrap();
                record.detect_algo(&crypto()).unwrap();
                assert_eq!(record.lock_state(), LockState::Unlocked);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_header_and_algo() {
        assert!(matches!(
            transform_seccfg(&[0u8; 0x200], LockFlag::Unlock, &crypto()).unwrap(),
            SeccfgOutcome::Unchanged(_)
        ));
        let data = v4::testing::build(1, 0, xor);
        assert!(matches!(
            transform_seccfg(&data, LockFlag::Unlock, &NoCrypto).unwrap(),
            SeccfgOutcome::Unchanged(_)
        ));
    }

    #[test]
    fn test_lock_flag_parse() {
        assert_eq!("UNLOCK".parse::<LockFlag>().unwrap(), LockFlag::Unlock);
        assert!("open".parse::<LockFlag>().is_err());
    }

    #[test]
    fn test_toggle_on_device() {
        let mut disk = gpt_disk();
        let record = v4::testing::build(4, 1, xor);
        disk[0x6400..0x6600].copy_from_slice(&record);
        let device = MemoryDevice::with_contents(disk);
        let mut session = FlashSession::default();
        let mut engine = FlashEngine::new(&device, &mut session, &NullObserver)
            .with_gpt_settings(GptSettings {
                num_entries: 2,
                entry_size: 128,
            });

        let outcome = toggle_seccfg(&mut engine, LockFlag::Unlock, &crypto()).unwrap();
        assert!(matches!(outcome, SeccfgOutcome::Rewritten { .. }));
        assert_eq!(engine.session().lock_state, LockState::Unlocked);

        let written = device.data.borrow()[0x6400..0x6600].to_vec();
        let mut reparsed = SeccfgV4::parse_header(&written).unwrap();
        assert_eq!(reparsed.lock_state(), LockState::Unlocked);
        assert!(reparsed.detect_algo(&crypto()).is_some());

        // Second run sees the new state and leaves the device alone.
        let writes = device.writes.borrow().len();
        let outcome = toggle_seccfg(&mut engine, LockFlag::Unlock, &crypto()).unwrap();
        assert!(matches!(outcome, SeccfgOutcome::Unchanged(_)));
        assert_eq!(device.writes.borrow().len(), writes);
    }
}
