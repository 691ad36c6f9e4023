//! Android verified-boot metadata flag patching.

use tracing::{debug, info};

use crate::error::{DaError, ParseError, Result};
use crate::events::FlashObserver;
use crate::flash::{FlashDevice, FlashEngine, PartType};

const AVB_MAGIC: &[u8; 4] = b"AVB0";
const FLAGS_OFFSET: usize = 0x78;

/// Flags word of the AVB vbmeta header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VbmetaFlags(u32);

impl VbmetaFlags {
    pub const DISABLE_VERITY: u32 = 1;
    pub const DISABLE_VERIFICATION: u32 = 2;

    /// Mode 0 restores both checks, 1..=3 disable verity, verification or both.
    pub fn from_mode(mode: u32) -> std::result::Result<Self, ParseError> {
        if mode > (Self::DISABLE_VERITY | Self::DISABLE_VERIFICATION) {
            return Err(ParseError::Unsupported {
                what: "vbmeta mode",
                value: mode,
            });
        }
        Ok(Self(mode))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Rewrite the header flags of a vbmeta image.
pub fn patch_vbmeta(data: &[u8], flags: VbmetaFlags) -> std::result::Result<Vec<u8>, ParseError> {
    if data.len() < FLAGS_OFFSET + 4 {
        return Err(ParseError::BufferTooSmall {
            expected: FLAGS_OFFSET + 4,
            actual: data.len(),
        });
    }
    if &data[..4] != AVB_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u32::from_be_bytes(*AVB_MAGIC),
            actual: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        });
    }
    let mut out = data.to_vec();
    out[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&flags.bits().to_be_bytes());
    info!(flags = flags.bits(), "vbmeta flags set");
    Ok(out)
}

/// A/B slot suffix from the bootloader message in `misc`.
pub fn slot_suffix(misc: &[u8]) -> String {
    match misc.get(0x800..0x802) {
        Some([0, 0]) | None => String::new(),
        Some(raw) => String::from_utf8_lossy(raw).into_owned(),
    }
}

/// Locate the active `vbmeta` partition and rewrite its flags on the
/// device. Returns the partition name that was patched.
pub fn apply_vbmeta_flags<D, O>(engine: &mut FlashEngine<'_, D, O>, flags: VbmetaFlags) -> Result<String>
where
    D: FlashDevice,
    O: FlashObserver + ?Sized,
{
    let page_size = engine.session().page_size;
    let mut slot = String::new();
    for name in ["misc", "para"] {
        match engine.resolve_partition(name, PartType::User) {
            Ok(entry) => {
                let length = entry.byte_len(page_size).min(0x1000);
                let mut misc = Vec::new();
                engine.read(entry.byte_offset(page_size), length, &mut misc, PartType::User)?;
                slot = slot_suffix(&misc);
                break;
            }
            Err(DaError::PartitionNotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    debug!(slot = %slot, "Active slot");

    let name = format!("vbmeta{slot}");
    let entry = engine.resolve_partition(&name, PartType::User)?;
    let offset = entry.byte_offset(page_size);
    let mut image = Vec::new();
    engine.read(offset, entry.byte_len(page_size), &mut image, PartType::User)?;
    let patched = patch_vbmeta(&image, flags)?;
    // Only the header page changes.
    let header = patched.len().min(page_size as usize);
    engine.write_buffer(offset, &patched[..header], PartType::User)?;
    Ok(name)
}
