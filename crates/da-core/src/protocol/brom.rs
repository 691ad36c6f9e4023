//! BROM / preloader command channel.
//!
//! Single-byte commands echoed by the device, big-endian arguments, and a
//! 16-bit status after each command. Used to identify the chip and to
//! upload and start the first DA stage.

use tracing::{debug, info, instrument};

use super::StatusCode;
use super::constants::*;
use crate::error::{DaError, Result};
use crate::transport::{Transport, TransportError};

/// Hardware identification returned by `GET_HW_SW_VER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwVersion {
    pub hw_sub_code: u16,
    pub hw_version: u16,
    pub sw_version: u16,
}

/// Security configuration reported by the boot ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetConfig(pub u32);

impl TargetConfig {
    pub fn secure_boot(&self) -> bool {
        self.0 & TARGET_CONFIG_SBC != 0
    }

    pub fn sla(&self) -> bool {
        self.0 & TARGET_CONFIG_SLA != 0
    }

    pub fn daa(&self) -> bool {
        self.0 & TARGET_CONFIG_DAA != 0
    }
}

/// Boot ROM / preloader client borrowing the session transport.
pub struct Brom<'t, T: Transport + ?Sized> {
    transport: &'t T,
}

/// 16-bit XOR over little-endian halfwords, odd tail byte folded in.
pub fn xor16_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u16;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum ^= u16::from_le_bytes([pair[0], pair[1]]);
    }
    if let [last] = chunks.remainder() {
        sum ^= *last as u16;
    }
    sum
}

impl<'t, T: Transport + ?Sized> Brom<'t, T> {
    pub fn new(transport: &'t T) -> Self {
        Self { transport }
    }

    /// Send the four-byte start sequence; each byte is answered with its complement.
    #[instrument(skip(self))]
    pub fn handshake(&self) -> Result<()> {
        for byte in BROM_HANDSHAKE {
            self.transport.write(&[byte])?;
            let reply = self.transport.read_exact(1)?;
            if reply[0] != !byte {
                return Err(DaError::Protocol(format!(
                    "Handshake byte 0x{byte:02X} answered with 0x{:02X}",
                    reply[0]
                )));
            }
        }
        info!("BROM handshake complete");
        Ok(())
    }

    fn read_u16(&self) -> Result<u16> {
        let bytes = self.transport.read_exact(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self) -> Result<u32> {
        let bytes = self.transport.read_exact(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn check_status(&self) -> Result<()> {
        let status = self.read_u16()?;
        if status != 0 {
            return Err(DaError::Status(StatusCode(status as u32)));
        }
        Ok(())
    }

    fn echo_u32(&self, value: u32) -> Result<()> {
        self.transport.echo(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn hw_code(&self) -> Result<u16> {
        self.transport.echo(&[BROM_CMD_GET_HW_CODE])?;
        let hw_code = self.read_u16()?;
        self.check_status()?;
        debug!(hw_code = %format!("0x{hw_code:04X}"), "Read hw code");
        Ok(hw_code)
    }

    pub fn hw_sw_version(&self) -> Result<HwVersion> {
        self.transport.echo(&[BROM_CMD_GET_HW_SW_VER])?;
        let version = HwVersion {
            hw_sub_code: self.read_u16()?,
            hw_version: self.read_u16()?,
            sw_version: self.read_u16()?,
        };
        self.check_status()?;
        Ok(version)
    }

    pub fn target_config(&self) -> Result<TargetConfig> {
        self.transport.echo(&[BROM_CMD_GET_TARGET_CONFIG])?;
        let config = self.read_u32()?;
        self.check_status()?;
        Ok(TargetConfig(config))
    }

    /// Upload a DA stage to `address`. `signature_len` bytes at the tail of
    /// `data` are the stage signature.
    #[instrument(skip(self, data), fields(address = %format!("0x{address:08X}"), len = data.len()))]
    pub fn send_da(&self, address: u32, data: &[u8], signature_len: u32) -> Result<u16> {
        self.transport.echo(&[BROM_CMD_SEND_DA])?;
        self.echo_u32(address)?;
        self.echo_u32(data.len() as u32)?;
        self.echo_u32(signature_len)?;
        self.check_status()?;

        for packet in data.chunks(BROM_UPLOAD_PACKET) {
            self.transport.write(packet)?;
        }

        let device_checksum = self.read_u16()?;
        self.check_status()?;
        let expected = xor16_checksum(data);
        if device_checksum != expected {
            return Err(DaError::Protocol(format!(
                "Upload checksum mismatch: device 0x{device_checksum:04X}, host 0x{expected:04X}"
            )));
        }
        info!(checksum = %format!("0x{expected:04X}"), "Stage uploaded");
        Ok(expected)
    }

    /// Jump to a previously uploaded stage.
    pub fn jump_da(&self, address: u32) -> Result<()> {
        self.transport.echo(&[BROM_CMD_JUMP_DA])?;
        self.echo_u32(address)?;
        self.check_status()?;
        info!(address = %format!("0x{address:08X}"), "Jumped to DA");
        Ok(())
    }

    /// Wait for the single sync byte the first stage sends once running.
    pub fn wait_da_sync(&self) -> Result<()> {
        let byte = self.transport.read_exact(1)?;
        if byte[0] != DA_SYNC_CHAR {
            return Err(DaError::Transport(TransportError::ReadFailed(format!(
                "Expected DA sync 0x{DA_SYNC_CHAR:02X}, got 0x{:02X}",
                byte[0]
            ))));
        }
        Ok(())
    }
}
