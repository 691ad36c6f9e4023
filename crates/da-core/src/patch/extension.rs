//! DA extension builder.
//!
//! The extension template carries one four-byte sentinel per symbol it
//! calls into the running second stage. Each sentinel is replaced with the
//! symbol's address in the loaded image, or zero when it was not found.

use std::fmt;

use tracing::{debug, info, warn};

use super::Pattern;

const SENTINEL_DEVCTRL: u32 = 0x1111_1111;
const SENTINEL_GET_CARD: u32 = 0x2222_2222;
const SENTINEL_SET_PART_CONFIG: u32 = 0x3333_3333;
const SENTINEL_RPMB_SEND: u32 = 0x4444_4444;
const SENTINEL_UFS_QUEUECOMMAND: u32 = 0x5555_5555;
const SENTINEL_UFS_FREE_TAG: u32 = 0x6666_6666;
const SENTINEL_UFS_HBA: u32 = 0x7777_7777;
const SENTINEL_EFUSE: u32 = 0x8888_8888;

/// Resolved symbol addresses. Zero means "capability unavailable".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionSymbols {
    pub register_devctrl: u32,
    pub mmc_get_card: u32,
    pub mmc_set_part_config: u32,
    pub mmc_rpmb_send_command: u32,
    pub ufshcd_queuecommand: u32,
    pub ufshcd_get_free_tag: u32,
    /// Data pointer, stored without the code bit.
    pub g_ufs_hba: u32,
}

impl ExtensionSymbols {
    pub fn has_emmc(&self) -> bool {
        self.mmc_get_card != 0 && self.mmc_rpmb_send_command != 0
    }

    pub fn has_ufs(&self) -> bool {
        self.g_ufs_hba != 0 && self.ufshcd_queuecommand != 0
    }
}

impl fmt::Display for ExtensionSymbols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "register_devctrl:      0x{:08X}", self.register_devctrl)?;
        writeln!(f, "mmc_get_card:          0x{:08X}", self.mmc_get_card)?;
        writeln!(f, "mmc_set_part_config:   0x{:08X}", self.mmc_set_part_config)?;
        writeln!(f, "mmc_rpmb_send_command: 0x{:08X}", self.mmc_rpmb_send_command)?;
        writeln!(f, "ufshcd_queuecommand:   0x{:08X}", self.ufshcd_queuecommand)?;
        writeln!(f, "ufshcd_get_free_tag:   0x{:08X}", self.ufshcd_get_free_tag)?;
        write!(f, "g_ufs_hba:             0x{:08X}", self.g_ufs_hba)
    }
}

/// Patched extension ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionBlob {
    pub data: Vec<u8>,
    pub symbols: ExtensionSymbols,
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn find(image: &[u8], bytes: &[u8]) -> Option<usize> {
    Pattern::exact(bytes).find(image)
}

fn code_address(offset: Option<usize>, load_address: u32) -> u32 {
    offset.map_or(0, |o| (o as u32).wrapping_add(load_address) | 1)
}

fn find_set_part_config(image: &[u8]) -> Option<usize> {
    let primary = Pattern::exact(&[0xC3, 0x69, 0x0A, 0x46, 0x10, 0xB5]);
    primary
        .find_all(image)
        .into_iter()
        .find(|&at| image.get(at + 20..at + 22) == Some(&[0xB3, 0x21][..]))
        .or_else(|| find(image, &[0xC3, 0x69, 0x13, 0xF0, 0x01, 0x03]))
}

fn find_ufs_hba(image: &[u8]) -> Option<u32> {
    const CANDIDATES: &[(&[u8], usize)] = &[
        (&[0x20, 0x46, 0x0B, 0xB0, 0xBD, 0xE8, 0xF0, 0x83, 0x00, 0xBF], 10),
        (&[0x20, 0x46, 0x0D, 0xB0, 0xBD, 0xE8, 0xF0, 0x83], 8),
        (&[0x21, 0x46, 0x02, 0xF0, 0x02, 0xFB, 0x1B, 0xE6, 0x00, 0xBF], 18),
    ];
    CANDIDATES
        .iter()
        .find_map(|(bytes, ptr_at)| find(image, bytes).map(|at| at + ptr_at))
        .and_then(|at| read_u32(image, at))
}

/// Locate the extension's call targets inside a second-stage image.
pub fn resolve_symbols(image: &[u8], load_address: u32) -> ExtensionSymbols {
    let register_devctrl = find(image, &[0x38, 0xB5, 0x05, 0x46, 0x0C, 0x20]);
    let mmc_get_card = find(image, &[0x4B, 0x4F, 0xF4, 0x3C, 0x72])
        .and_then(|at| at.checked_sub(1))
        .or_else(|| {
            find(image, &[0xA3, 0xEB, 0x00, 0x13, 0x18, 0x1A, 0x02, 0xEB, 0x00, 0x10])
                .and_then(|at| at.checked_sub(10))
        });
    let mmc_rpmb_send_command = find(image, &[0xF8, 0xB5, 0x06, 0x46, 0x9D, 0xF8, 0x18, 0x50])
        .or_else(|| find(image, &[0x2D, 0xE9, 0xF0, 0x41, 0x4F, 0xF6, 0xFD, 0x74]));

    let mut symbols = ExtensionSymbols {
        register_devctrl: code_address(register_devctrl, load_address),
        mmc_get_card: code_address(mmc_get_card, load_address),
        mmc_set_part_config: code_address(find_set_part_config(image), load_address),
        mmc_rpmb_send_command: code_address(mmc_rpmb_send_command, load_address),
        ..Default::default()
    };

    // UFS helpers are only meaningful when the host adapter pointer exists.
    if let Some(hba) = find_ufs_hba(image) {
        symbols.g_ufs_hba = hba;
        let free_tag = Pattern::masked(&[0xB5, 0x00, 0xB1, 0x90, 0xF8], &[1]).find(image);
        symbols.ufshcd_get_free_tag = code_address(free_tag, load_address.wrapping_sub(1));
        symbols.ufshcd_queuecommand = code_address(
            find(image, &[0x2D, 0xE9, 0xF8, 0x43, 0x01, 0x27]),
            load_address,
        );
    }

    debug!("Extension symbols:\n{symbols}");
    symbols
}

fn sentinel_offset(template: &[u8], sentinel: u32) -> Option<usize> {
    find(template, &sentinel.to_le_bytes())
}

/// Fill the extension template for `image` loaded at `load_address`.
///
/// Returns `None` when the template lacks the device-control or card
/// sentinels.
pub fn build_extension(
    template: &[u8],
    image: &[u8],
    load_address: u32,
    efuse_base: u32,
) -> Option<ExtensionBlob> {
    if sentinel_offset(template, SENTINEL_DEVCTRL).is_none()
        || sentinel_offset(template, SENTINEL_GET_CARD).is_none()
    {
        warn!("Extension template has no symbol slots");
        return None;
    }

    let symbols = resolve_symbols(image, load_address);
    let mut data = template.to_vec();
    let slots = [
        (SENTINEL_DEVCTRL, symbols.register_devctrl),
        (SENTINEL_GET_CARD, symbols.mmc_get_card),
        (SENTINEL_SET_PART_CONFIG, symbols.mmc_set_part_config),
        (SENTINEL_RPMB_SEND, symbols.mmc_rpmb_send_command),
        (SENTINEL_UFS_QUEUECOMMAND, symbols.ufshcd_queuecommand),
        (SENTINEL_UFS_FREE_TAG, symbols.ufshcd_get_free_tag),
        (SENTINEL_UFS_HBA, symbols.g_ufs_hba),
        (SENTINEL_EFUSE, efuse_base),
    ];
    for (sentinel, value) in slots {
        match sentinel_offset(template, sentinel) {
            Some(at) => data[at..at + 4].copy_from_slice(&value.to_le_bytes()),
            None => debug!(sentinel = %format!("0x{sentinel:08X}"), "Slot absent from template"),
        }
    }

    info!(
        emmc = symbols.has_emmc(),
        ufs = symbols.has_ufs(),
        "Extension prepared ({} bytes)",
        data.len()
    );
    Some(ExtensionBlob { data, symbols })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOAD: u32 = 0x4000_0000;

    fn template() -> Vec<u8> {
        let mut t = vec![0xEEu8; 8];
        for s in [
            SENTINEL_DEVCTRL,
            SENTINEL_GET_CARD,
            SENTINEL_SET_PART_CONFIG,
            SENTINEL_RPMB_SEND,
            SENTINEL_UFS_QUEUECOMMAND,
            SENTINEL_UFS_FREE_TAG,
            SENTINEL_UFS_HBA,
            SENTINEL_EFUSE,
        ] {
            t.extend_from_slice(&s.to_le_bytes());
            t.extend_from_slice(&[0xEE; 4]);
        }
        t
    }

    fn slot(data: &[u8], index: usize) -> u32 {
        read_u32(data, 8 + index * 8).unwrap()
    }

    #[test]
    fn test_emmc_symbols() {
        let mut image = vec![0u8; 0x200];
        image[0x20..0x26].copy_from_slice(&[0x38, 0xB5, 0x05, 0x46, 0x0C, 0x20]);
        image[0x41..0x46].copy_from_slice(&[0x4B, 0x4F, 0xF4, 0x3C, 0x72]);
        image[0x80..0x88].copy_from_slice(&[0xF8, 0xB5, 0x06, 0x46, 0x9D, 0xF8, 0x18, 0x50]);

        let blob = build_extension(&template(), &image, LOAD, 0x1100_0000).unwrap();
        assert_eq!(slot(&blob.data, 0), LOAD + 0x21);
        assert_eq!(slot(&blob.data, 1), LOAD + 0x41);
        assert_eq!(slot(&blob.data, 2), 0);
        assert_eq!(slot(&blob.data, 3), LOAD + 0x81);
        // No HBA pointer: UFS slots zeroed.
        assert_eq!(slot(&blob.data, 4), 0);
        assert_eq!(slot(&blob.data, 5), 0);
        assert_eq!(slot(&blob.data, 6), 0);
        assert_eq!(slot(&blob.data, 7), 0x1100_0000);
        assert!(blob.symbols.has_emmc());
        assert!(!blob.symbols.has_ufs());
    }

    #[test]
    fn test_ufs_symbols() {
        let mut image = vec![0u8; 0x200];
        image[0x10..0x18].copy_from_slice(&[0x20, 0x46, 0x0D, 0xB0, 0xBD, 0xE8, 0xF0, 0x83]);
        image[0x18..0x1C].copy_from_slice(&0x4012_3450u32.to_le_bytes());
        image[0x40..0x45].copy_from_slice(&[0xB5, 0x7A, 0xB1, 0x90, 0xF8]);
        image[0x60..0x66].copy_from_slice(&[0x2D, 0xE9, 0xF8, 0x43, 0x01, 0x27]);

        let symbols = resolve_symbols(&image, LOAD);
        assert_eq!(symbols.g_ufs_hba, 0x4012_3450);
        assert_eq!(symbols.ufshcd_get_free_tag, (LOAD + 0x3F) | 1);
        assert_eq!(symbols.ufshcd_queuecommand, LOAD + 0x61);
        assert!(symbols.has_ufs());
    }

    #[test]
    fn test_set_part_config_prefers_marked_match() {
        let mut image = vec![0u8; 0x100];
        image[0x10..0x16].copy_from_slice(&[0xC3, 0x69, 0x0A, 0x46, 0x10, 0xB5]);
        image[0x40..0x46].copy_from_slice(&[0xC3, 0x69, 0x0A, 0x46, 0x10, 0xB5]);
        image[0x54..0x56].copy_from_slice(&[0xB3, 0x21]);
        assert_eq!(find_set_part_config(&image), Some(0x40));

        let mut fallback = vec![0u8; 0x40];
        fallback[0x08..0x0E].copy_from_slice(&[0xC3, 0x69, 0x13, 0xF0, 0x01, 0x03]);
        assert_eq!(find_set_part_config(&fallback), Some(0x08));
    }

    #[test]
    fn test_template_without_slots() {
        let mut t = vec![0u8; 16];
        t[0..4].copy_from_slice(&SENTINEL_DEVCTRL.to_le_bytes());
        assert!(build_extension(&t, &[0u8; 64], LOAD, 0).is_none());
    }
}
