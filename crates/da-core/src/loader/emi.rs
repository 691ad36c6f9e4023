//! DRAM configuration (EMI) extraction from preloader images.

use tracing::debug;

const PRELOADER_SIGNATURE: [u8; 8] = [0x4D, 0x4D, 0x4D, 0x01, 0x38, 0x00, 0x00, 0x00];
const BLOADER_TAG: &[u8] = b"MTK_BLOADER_INFO_v";
const MTK_BIN_TAG: &[u8] = b"MTK_BIN";
const MTK_BIN_SKIP: usize = 0xC;
const TRAILER_SIZE: usize = 0x800;

/// DRAM configuration blob pushed with `INIT_EXT_RAM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmiBlob {
    pub version: u32,
    pub data: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn trailing_u32(data: &[u8]) -> Option<u32> {
    u32_at(data, data.len().checked_sub(4)?)
}

/// Locate the DRAM blob inside a preloader image.
fn dram_region(preloader: &[u8]) -> Option<&[u8]> {
    let start = find(preloader, &PRELOADER_SIGNATURE)?;
    let mut data = &preloader[start..];

    let image_len = u32_at(data, 0x20)? as usize;
    let sig_len = u32_at(data, 0x2C)? as usize;
    data = data.get(..image_len.checked_sub(sig_len)?)?;

    let mut dram_size = trailing_u32(data)? as usize;
    if dram_size == 0 {
        data = data.get(..data.len().checked_sub(TRAILER_SIZE)?)?;
        dram_size = trailing_u32(data)? as usize;
    }
    let end = data.len().checked_sub(4)?;
    let begin = end.checked_sub(dram_size)?;
    data.get(begin..end)
}

/// Extract the EMI blob. `xflash` selects the v5 layout where the whole
/// region is sent when the info tag sits at its start.
///
/// Returns `None` when the preloader carries no recognisable DRAM config.
pub fn extract_emi(preloader: &[u8], xflash: bool) -> Option<EmiBlob> {
    let Some(data) = dram_region(preloader) else {
        debug!("Preloader signature not found, no EMI data");
        return None;
    };

    let idx = find(data, BLOADER_TAG)?;
    let version_bytes = data.get(idx + BLOADER_TAG.len()..idx + BLOADER_TAG.len() + 2)?;
    let version = std::str::from_utf8(version_bytes)
        .ok()?
        .trim_end_matches('\0')
        .parse::<u32>()
        .ok()?;

    let emi = if idx == 0 && xflash {
        data.to_vec()
    } else {
        let bin = find(data, MTK_BIN_TAG)?;
        data.get(bin + MTK_BIN_SKIP..)?.to_vec()
    };
    debug!(version, len = emi.len(), "EMI extracted");
    Some(EmiBlob { version, data: emi })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Preloader image with `dram` at the tail of the signed image area.
    fn preloader(dram: &[u8], with_trailer: bool) -> Vec<u8> {
        let mut image = vec![0xFFu8; 0x40];
        image[..8].copy_from_slice(&PRELOADER_SIGNATURE);

        let mut body = image.clone();
        body.extend_from_slice(dram);
        body.extend_from_slice(&(dram.len() as u32).to_le_bytes());
        if with_trailer {
            body.extend_from_slice(&[0u8; TRAILER_SIZE]);
        }
        let sig_len = 0x100u32;
        let image_len = body.len() as u32 + sig_len;
        body[0x20..0x24].copy_from_slice(&image_len.to_le_bytes());
        body[0x2C..0x30].copy_from_slice(&sig_len.to_le_bytes());
        body.extend_from_slice(&vec![0xEEu8; sig_len as usize]);

        let mut file = vec![0u8; 0x200];
        file.extend_from_slice(&body);
        file
    }

    fn dram_with_tag(prefix: &[u8]) -> Vec<u8> {
        let mut dram = prefix.to_vec();
        dram.extend_from_slice(b"MTK_BLOADER_INFO_v13\0\0");
        dram.extend_from_slice(&[0x11; 0x20]);
        dram
    }

    #[test]
    fn test_xflash_tag_at_start() {
        let dram = dram_with_tag(b"");
        let emi = extract_emi(&preloader(&dram, false), true).unwrap();
        assert_eq!(emi.version, 13);
        assert_eq!(emi.data, dram);
    }

    #[test]
    fn test_mtk_bin_variant() {
        let mut dram = dram_with_tag(b"");
        dram.extend_from_slice(b"MTK_BIN\0\0\0\0\0");
        dram.extend_from_slice(&[0x22; 0x10]);
        let emi = extract_emi(&preloader(&dram, false), false).unwrap();
        assert_eq!(emi.version, 13);
        assert_eq!(emi.data, vec![0x22; 0x10]);
    }

    #[test]
    fn test_zero_size_trailer_skipped() {
        let dram = dram_with_tag(b"");
        let emi = extract_emi(&preloader(&dram, true), true).unwrap();
        assert_eq!(emi.data, dram);
    }

    #[test]
    fn test_missing_signature() {
        assert!(extract_emi(&[0u8; 0x400], true).is_none());
        // Tag not at the start and no MTK_BIN marker.
        let dram = dram_with_tag(b"pad");
        assert!(extract_emi(&preloader(&dram, false), true).is_none());
    }
}
