//! DA command client.
//!
//! Frames commands and payloads over a [`Transport`], reads back status
//! words and maps non-zero status to [`DaError::Status`]. Extension
//! commands go through the generic device-control opcode.

use tracing::{debug, info, instrument, trace, warn};

use super::constants::*;
use super::frame::{DataType, FrameHeader};
use super::status::{StatusCode, rpmb_error};
use super::{AddressEncoding, ProtocolGeneration};
use crate::error::{DaError, Result};
use crate::transport::Transport;

/// Expected response shape of a device-control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Only a trailing status word.
    StatusOnly,
    /// One data frame followed by a status word.
    Data,
}

const V6_HOST_CAPABILITIES: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
    "<da><version>1.0</version><command>CMD:HOST-SUPPORTED-COMMANDS</command>",
    "<arg><host_capability>CMD:DOWNLOAD-FILE^1@CMD:FILE-SYS-OPERATION^1@",
    "CMD:PROGRESS-REPORT^1@CMD:UPLOAD-FILE^1@</host_capability></arg></da>"
);

/// DA command client borrowing the session transport.
pub struct XFlash<'t, T: Transport + ?Sized> {
    transport: &'t T,
    generation: ProtocolGeneration,
    write_packet: usize,
    extension: bool,
}

/// Simple 16-bit additive checksum carried with each write packet.
pub fn sum16_checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

/// `<IIQQ` storage/partition/address/length block plus the NAND extension area.
pub fn storage_param(storage: u32, part: u32, address: u64, length: u64) -> Vec<u8> {
    let mut param = Vec::with_capacity(24 + NAND_EXT_PARAM_SIZE);
    param.extend_from_slice(&storage.to_le_bytes());
    param.extend_from_slice(&part.to_le_bytes());
    param.extend_from_slice(&address.to_le_bytes());
    param.extend_from_slice(&length.to_le_bytes());
    param.resize(24 + NAND_EXT_PARAM_SIZE, 0);
    param
}

impl<'t, T: Transport + ?Sized> XFlash<'t, T> {
    pub fn new(transport: &'t T, generation: ProtocolGeneration) -> Self {
        Self {
            transport,
            generation,
            write_packet: DEFAULT_WRITE_PACKET,
            extension: false,
        }
    }

    pub fn with_write_packet(mut self, write_packet: usize) -> Self {
        if write_packet > 0 {
            self.write_packet = write_packet;
        }
        self
    }

    pub fn with_extension(mut self, loaded: bool) -> Self {
        self.extension = loaded;
        self
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn extension_loaded(&self) -> bool {
        self.extension
    }

    // ---- framing ----

    fn send_frame(&self, data_type: DataType, payload: &[u8]) -> Result<()> {
        let mut packet = FrameHeader::new(data_type, payload.len() as u32).to_bytes();
        packet.extend_from_slice(payload);
        self.transport.write(&packet)?;
        trace!(len = payload.len(), "Frame sent");
        Ok(())
    }

    /// Send one protocol-flow frame.
    pub fn xsend(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(DataType::ProtocolFlow, payload)
    }

    pub fn send_u32(&self, value: u32) -> Result<()> {
        self.xsend(&value.to_le_bytes())
    }

    pub fn send_u64(&self, value: u64) -> Result<()> {
        self.xsend(&value.to_le_bytes())
    }

    /// Send an address using the generation's encoding.
    pub fn send_address(&self, address: u64) -> Result<()> {
        match self.generation.address_encoding() {
            AddressEncoding::Tagged64 => self.send_u64(address),
            AddressEncoding::Split32 => {
                self.send_u32(address as u32)?;
                self.send_u32((address >> 32) as u32)
            }
        }
    }

    /// Read one frame and return its payload.
    pub fn read_frame(&self) -> Result<Vec<u8>> {
        let header = FrameHeader::from_bytes(&self.transport.read_exact(FrameHeader::SIZE)?)?;
        if header.length == 0 {
            return Ok(Vec::new());
        }
        Ok(self.transport.read_exact(header.length as usize)?)
    }

    /// Read a status frame.
    pub fn status(&self) -> Result<StatusCode> {
        let payload = self.read_frame()?;
        match payload.len() {
            2 => Ok(StatusCode(u16::from_le_bytes([payload[0], payload[1]]) as u32)),
            4 => Ok(StatusCode(u32::from_le_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]))),
            n => Err(DaError::Protocol(format!("Status frame of {n} bytes"))),
        }
    }

    /// Read a status frame and fail on anything but zero.
    pub fn check_status(&self) -> Result<()> {
        let status = self.status()?;
        if !status.is_ok() {
            debug!(%status, "Command rejected");
            return Err(DaError::Status(status));
        }
        Ok(())
    }

    /// Send a top-level command code and require a zero status.
    pub fn command(&self, code: u32) -> Result<()> {
        self.send_u32(code)?;
        self.check_status()
    }

    /// `DEVICE_CTRL`, status, then the control code, status.
    pub fn device_ctrl(&self, code: u32) -> Result<()> {
        self.command(CMD_DEVICE_CTRL)?;
        self.command(code)
    }

    /// Run a device-control command: handshake, one frame per argument,
    /// then the reply. Any non-zero status aborts the exchange.
    pub fn execute(&self, code: u32, args: &[&[u8]], reply: Reply) -> Result<Vec<u8>> {
        self.device_ctrl(code)?;
        for arg in args {
            self.xsend(arg)?;
        }
        match reply {
            Reply::StatusOnly => {
                self.check_status()?;
                Ok(Vec::new())
            }
            Reply::Data => {
                let data = self.read_frame()?;
                self.check_status()?;
                Ok(data)
            }
        }
    }

    // ---- bring-up ----

    pub fn sync(&self) -> Result<()> {
        self.send_u32(DA_SYNC_SIGNAL)
    }

    /// Wait for the sync frame the DA sends once its hardware init is done.
    pub fn expect_sync(&self) -> Result<()> {
        let payload = self.read_frame()?;
        if payload != DA_SYNC_SIGNAL.to_le_bytes() {
            return Err(DaError::Protocol(format!(
                "Expected sync signal, got {payload:02X?}"
            )));
        }
        Ok(())
    }

    pub fn setup_environment(&self) -> Result<()> {
        self.command(CMD_SETUP_ENVIRONMENT)?;
        let mut param = Vec::with_capacity(20);
        for value in [DA_LOG_LEVEL, DA_LOG_CHANNEL_UART, DA_SYSTEM_OS_LINUX, 0, 0] {
            param.extend_from_slice(&value.to_le_bytes());
        }
        self.xsend(&param)?;
        self.check_status()
    }

    pub fn setup_hw_init(&self) -> Result<()> {
        self.command(CMD_SETUP_HW_INIT_PARAMS)?;
        self.send_u32(0)?;
        self.check_status()
    }

    /// Push the preloader DRAM configuration.
    pub fn init_ext_ram(&self, emi: &[u8]) -> Result<()> {
        self.command(CMD_INIT_EXT_RAM)?;
        self.send_u32(emi.len() as u32)?;
        self.xsend(emi)?;
        self.check_status()?;
        info!(len = emi.len(), "External RAM initialised");
        Ok(())
    }

    /// XML handshake announcing host capabilities.
    pub fn host_capabilities(&self) -> Result<()> {
        self.send_frame(DataType::Message, V6_HOST_CAPABILITIES.as_bytes())?;
        self.check_status()
    }

    /// Negotiated (write, read) packet lengths.
    pub fn packet_length(&self) -> Result<(u32, u32)> {
        let data = self.execute(CTRL_GET_PACKET_LENGTH, &[], Reply::Data)?;
        if data.len() < 8 {
            return Err(DaError::Protocol(format!(
                "Packet length reply of {} bytes",
                data.len()
            )));
        }
        let write = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let read = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Ok((write, read))
    }

    /// Hand `data` to the running DA for execution at `address`.
    #[instrument(skip(self, data), fields(address = %format!("0x{address:08X}"), len = data.len()))]
    pub fn boot_to(&self, address: u64, data: &[u8]) -> Result<()> {
        self.command(CMD_BOOT_TO)?;
        let mut param = Vec::with_capacity(16);
        param.extend_from_slice(&address.to_le_bytes());
        param.extend_from_slice(&(data.len() as u64).to_le_bytes());
        self.xsend(&param)?;
        self.xsend(data)?;
        self.check_status()?;
        info!("Boot-to image accepted");
        Ok(())
    }

    /// Verify the uploaded extension answers with its magic.
    pub fn extension_ack(&self) -> Result<()> {
        let ack = self.execute(XCMD_ACK, &[], Reply::Data)?;
        if ack.len() < 4 || ack[..4] != EXTENSION_ACK {
            return Err(DaError::Protocol(format!(
                "Extension returned invalid ack {ack:02X?}"
            )));
        }
        Ok(())
    }

    // ---- storage ----

    pub fn read_data(&self, storage: u32, part: u32, address: u64, length: usize) -> Result<Vec<u8>> {
        self.command(CMD_READ_DATA)?;
        self.xsend(&storage_param(storage, part, address, length as u64))?;
        self.check_status()?;

        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let packet = self.read_frame()?;
            if packet.is_empty() {
                return Err(DaError::Protocol("Empty read packet".into()));
            }
            out.extend_from_slice(&packet);
            self.send_u32(0)?;
        }
        self.check_status()?;
        out.truncate(length);
        Ok(out)
    }

    pub fn write_data(&self, storage: u32, part: u32, address: u64, data: &[u8]) -> Result<()> {
        self.command(CMD_WRITE_DATA)?;
        self.xsend(&storage_param(storage, part, address, data.len() as u64))?;
        self.check_status()?;

        for packet in data.chunks(self.write_packet) {
            self.send_u32(0)?;
            self.send_u32(sum16_checksum(packet) as u32)?;
            self.xsend(packet)?;
            self.check_status()?;
        }
        self.check_status()
    }

    pub fn format(&self, storage: u32, part: u32, address: u64, length: u64) -> Result<()> {
        self.command(CMD_FORMAT)?;
        self.xsend(&storage_param(storage, part, address, length))?;
        self.check_status()?;
        loop {
            let status = self.status()?;
            if status == StatusCode::CONTINUE {
                continue;
            }
            if status.is_ok() {
                return Ok(());
            }
            return Err(DaError::Status(status));
        }
    }

    // ---- extension register / memory access ----

    pub fn custom_readregister(&self, address: u32) -> Result<u32> {
        let data = self.execute(XCMD_READREGISTER, &[&address.to_le_bytes()], Reply::Data)?;
        if data.len() < 4 {
            return Err(DaError::Protocol(format!(
                "Register read returned {} bytes",
                data.len()
            )));
        }
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub fn custom_writeregister(&self, address: u32, value: u32) -> Result<()> {
        self.execute(
            XCMD_WRITEREGISTER,
            &[&address.to_le_bytes(), &value.to_le_bytes()],
            Reply::StatusOnly,
        )?;
        Ok(())
    }

    /// Bulk memory read, at most 64 KiB per transfer.
    pub fn custom_read(&self, address: u64, length: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let size = (length - out.len()).min(MAX_READ_TRANSFER);
            self.device_ctrl(XCMD_READMEM)?;
            self.send_address(address + out.len() as u64)?;
            self.send_u32(size as u32)?;
            let mut got = Vec::with_capacity(size);
            while got.len() < size {
                let packet = self.read_frame()?;
                if packet.is_empty() {
                    return Err(DaError::Protocol("Empty memory read packet".into()));
                }
                got.extend_from_slice(&packet);
            }
            self.check_status()?;
            got.truncate(size);
            out.extend_from_slice(&got);
        }
        Ok(out)
    }

    pub fn custom_write(&self, address: u64, data: &[u8]) -> Result<()> {
        self.device_ctrl(XCMD_WRITEMEM)?;
        self.send_address(address)?;
        self.send_u32(data.len() as u32)?;
        self.xsend(data)?;
        self.check_status()
    }

    /// Read `dwords` little-endian words starting at `address`.
    pub fn readmem(&self, address: u32, dwords: usize) -> Result<Vec<u32>> {
        let words = if dwords < REGISTER_BULK_THRESHOLD {
            (0..dwords)
                .map(|i| self.custom_readregister(address + (i as u32) * 4))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.custom_read(address as u64, dwords * 4)?
                .chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .collect()
        };
        trace!(address = %format!("0x{address:08X}"), ?words, "readmem");
        Ok(words)
    }

    /// Write little-endian words starting at `address`.
    pub fn writeregister(&self, address: u32, words: &[u32]) -> Result<()> {
        if words.len() < REGISTER_BULK_THRESHOLD {
            for (i, word) in words.iter().enumerate() {
                self.custom_writeregister(address + (i as u32) * 4, *word)?;
            }
            Ok(())
        } else {
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            self.custom_write(address as u64, &bytes)
        }
    }

    /// Write arbitrary bytes, zero-padding the final word.
    pub fn writemem(&self, address: u32, data: &[u8]) -> Result<()> {
        let words: Vec<u32> = data
            .chunks(4)
            .map(|c| {
                let mut w = [0u8; 4];
                w[..c.len()].copy_from_slice(c);
                u32::from_le_bytes(w)
            })
            .collect();
        self.writeregister(address, &words)
    }

    /// Select eMMC (`false`) or UFS (`true`) inside the extension.
    pub fn custom_set_storage(&self, ufs: bool) -> Result<()> {
        let mode: u32 = if ufs { 1 } else { 0 };
        self.execute(XCMD_SET_STORAGE, &[&mode.to_le_bytes()], Reply::StatusOnly)?;
        Ok(())
    }

    // ---- RPMB ----

    /// Program a host-derived key; returns the key as read back by the device.
    pub fn rpmb_set_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.execute(XCMD_RPMB_SET_KEY, &[key], Reply::Data)
    }

    /// Ask the device to derive its RPMB key; returns the derived key.
    pub fn rpmb_init(&self) -> Result<Vec<u8>> {
        self.device_ctrl(XCMD_RPMB_INIT)?;
        let status = self.status()?;
        if !status.is_ok() {
            return Err(DaError::RpmbKey(rpmb_error(status.value())));
        }
        let derived = self.read_frame()?;
        self.check_status()?;
        Ok(derived)
    }

    /// Read at most 16 sectors of 256-byte RPMB frames.
    pub fn rpmb_read(&self, sector: u32, count: u32) -> Result<Vec<u8>> {
        self.device_ctrl(XCMD_RPMB_READ)?;
        self.send_u32(sector)?;
        self.send_u32(count)?;
        let mut out = Vec::with_capacity(count as usize * RPMB_FRAME_SIZE);
        for i in 0..count {
            let frame = self.read_frame()?;
            if frame.len() != RPMB_FRAME_SIZE {
                let mut code = [0u8; 4];
                let n = frame.len().min(4);
                code[..n].copy_from_slice(&frame[..n]);
                return Err(DaError::Rpmb {
                    sector: sector + i,
                    reason: rpmb_error(u32::from_le_bytes(code)),
                });
            }
            out.extend_from_slice(&frame);
        }
        self.check_status()?;
        Ok(out)
    }

    /// Write at most 16 sectors; `data` must hold exactly `count` frames.
    pub fn rpmb_write(&self, sector: u32, count: u32, data: &[u8]) -> Result<()> {
        if data.len() != count as usize * RPMB_FRAME_SIZE {
            return Err(DaError::Rpmb {
                sector,
                reason: format!("Incorrect rpmb frame length {}", data.len()),
            });
        }
        self.device_ctrl(XCMD_RPMB_WRITE)?;
        self.send_u32(sector)?;
        self.send_u32(count)?;
        for (i, frame) in data.chunks_exact(RPMB_FRAME_SIZE).enumerate() {
            self.xsend(frame)?;
            let resp = self.read_frame()?;
            let code = match resp.as_slice() {
                [a, b, ..] => u16::from_le_bytes([*a, *b]),
                _ => {
                    return Err(DaError::Protocol("Empty rpmb frame response".into()));
                }
            };
            if code != 0 {
                // Drain the trailing status so the channel stays in step.
                if let Err(e) = self.status() {
                    warn!(error = %e, "No status after rpmb frame error, link may be out of step");
                }
                return Err(DaError::Rpmb {
                    sector: sector + i as u32,
                    reason: rpmb_error(code as u32),
                });
            }
        }
        self.check_status()
    }
}
