//! DA Session - high-level orchestrator for one connected device.
//!
//! A [`DaSession`] owns the transport, the loader repository and the
//! per-device [`FlashSession`]. Bring-up is `identify` → `select_loader`
//! → `patch_images` → `upload`; everything after that talks to the
//! running agent through the flash, RPMB and seccfg engines.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::crypto::{DeviceKeys, HwCrypto, NoCrypto, generate_keys};
use crate::error::{DaError, Result};
use crate::events::{FlashEvent, FlashObserver, FlashPhase, PacketDirection, TracingObserver};
use crate::flash::{BulkReport, FlashEngine, GptSettings, PartType, StorageKind};
use crate::loader::{LoaderImage, LoaderRepository, Stage, StageImage, extract_emi};
use crate::partition::{PartitionEntry, PartitionTable};
use crate::patch::{
    PatchReport, VbmetaFlags, apply_vbmeta_flags, build_extension, patch_first_stage,
    patch_second_stage,
};
use crate::protocol::{Brom, EXTENSION_LOAD_ADDRESS, ProtocolGeneration, XFlash};
use crate::rpmb::RpmbEngine;
use crate::seccfg::{LockFlag, SeccfgOutcome, toggle_seccfg};
use crate::state::{CancelToken, ChipInfo, FlashSession};
use crate::transport::{NusbTransport, Transport, TransportError};

/// Configuration for a DA session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Single loader file.
    pub loader_path: Option<String>,
    /// Directory scanned for `MTK_DA*` loader files.
    pub loader_dir: Option<String>,
    /// Preloader image carrying the DRAM config.
    pub preloader_path: Option<String>,
    /// DA extension template.
    pub extension_path: Option<String>,
    /// Patch stage images before upload.
    pub patch: bool,
    /// Storage override; detected default otherwise.
    pub storage: Option<StorageKind>,
    pub gpt_num_entries: u32,
    pub gpt_entry_size: u32,
    /// Device poll timeout in seconds.
    pub retry_timeout_secs: u64,
    /// Chip overrides.
    pub efuse_base: Option<u32>,
    pub rpmb_sectors: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let gpt = GptSettings::default();
        Self {
            loader_path: None,
            loader_dir: None,
            preloader_path: None,
            extension_path: None,
            patch: true,
            storage: None,
            gpt_num_entries: gpt.num_entries,
            gpt_entry_size: gpt.entry_size,
            retry_timeout_secs: 60,
            efuse_base: None,
            rpmb_sectors: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn gpt_settings(&self) -> GptSettings {
        GptSettings {
            num_entries: self.gpt_num_entries,
            entry_size: self.gpt_entry_size,
        }
    }

    /// Repository described by the loader settings; a single file wins
    /// over a directory.
    pub fn repository(&self) -> Result<LoaderRepository> {
        if let Some(path) = &self.loader_path {
            info!(path = %path, "Loading DA loader");
            return Ok(LoaderRepository::from_file(path)?);
        }
        if let Some(dir) = &self.loader_dir {
            info!(dir = %dir, "Scanning loader directory");
            return Ok(LoaderRepository::scan_dir(dir)?);
        }
        Ok(LoaderRepository::new())
    }
}

/// Stage images ready for upload.
#[derive(Debug, Clone)]
pub struct PreparedStages {
    pub first: StageImage,
    pub second: StageImage,
    /// One report per patched stage; empty when patching is off.
    pub reports: Vec<PatchReport>,
}

/// Replace the payload of a stage, keeping its signature.
fn with_payload(stage: &StageImage, payload: Vec<u8>) -> StageImage {
    let mut data = payload;
    data.extend_from_slice(&stage.data[stage.payload().len()..]);
    StageImage {
        data,
        signature_len: stage.signature_len,
        load_address: stage.load_address,
    }
}

/// DA Session - owns one device connection and its state.
pub struct DaSession<T: Transport, O: FlashObserver> {
    transport: T,
    observer: Arc<O>,
    config: SessionConfig,
    repository: LoaderRepository,
    state: FlashSession,
    crypto: Box<dyn HwCrypto + Send + Sync>,
}

impl<T: Transport> DaSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: Transport, O: FlashObserver + 'static> DaSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: T, config: SessionConfig, observer: Arc<O>) -> Result<Self> {
        let repository = config.repository()?;
        let state = FlashSession::new(config.storage.unwrap_or_default());
        Ok(Self {
            transport,
            observer,
            config,
            repository,
            state,
            crypto: Box::new(NoCrypto),
        })
    }

    pub fn with_crypto<C: HwCrypto + Send + Sync + 'static>(mut self, crypto: C) -> Self {
        self.crypto = Box::new(crypto);
        self
    }

    pub fn with_repository(mut self, repository: LoaderRepository) -> Self {
        self.repository = repository;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn repository(&self) -> &LoaderRepository {
        &self.repository
    }

    pub fn state(&self) -> &FlashSession {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Handle for cancelling the running chunked operation from elsewhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.state.cancel_token()
    }

    fn phase(&self, from: FlashPhase, to: FlashPhase) {
        self.observer.on_event(&FlashEvent::PhaseChanged { from, to });
    }

    fn with_xflash<R>(
        &mut self,
        f: impl FnOnce(&XFlash<'_, ObservableTransport<'_, T, O>>, &mut FlashSession) -> Result<R>,
    ) -> Result<R> {
        let Self {
            transport,
            observer,
            state,
            ..
        } = self;
        let link = ObservableTransport {
            inner: &*transport,
            observer: &**observer,
        };
        let xflash = XFlash::new(&link, state.generation)
            .with_write_packet(state.write_packet)
            .with_extension(state.extension_loaded);
        f(&xflash, state)
    }

    fn with_engine<R>(
        &mut self,
        f: impl FnOnce(&mut FlashEngine<'_, XFlash<'_, ObservableTransport<'_, T, O>>, O>) -> Result<R>,
    ) -> Result<R> {
        let Self {
            transport,
            observer,
            config,
            state,
            ..
        } = self;
        let link = ObservableTransport {
            inner: &*transport,
            observer: &**observer,
        };
        let xflash = XFlash::new(&link, state.generation)
            .with_write_packet(state.write_packet)
            .with_extension(state.extension_loaded);
        let mut engine =
            FlashEngine::new(xflash, state, &**observer).with_gpt_settings(config.gpt_settings());
        f(&mut engine)
    }

    fn with_rpmb<R>(
        &mut self,
        f: impl FnOnce(
            &mut RpmbEngine<'_, XFlash<'_, ObservableTransport<'_, T, O>>, dyn HwCrypto + Send + Sync, O>,
        ) -> Result<R>,
    ) -> Result<R> {
        let Self {
            transport,
            observer,
            state,
            crypto,
            ..
        } = self;
        let link = ObservableTransport {
            inner: &*transport,
            observer: &**observer,
        };
        let xflash = XFlash::new(&link, state.generation)
            .with_write_packet(state.write_packet)
            .with_extension(state.extension_loaded);
        let mut engine = RpmbEngine::new(xflash, &**crypto, state, &**observer);
        f(&mut engine)
    }

    // ---- bring-up ----

    /// Handshake with the boot ROM and read the chip identity.
    #[instrument(skip(self))]
    pub fn identify(&mut self) -> Result<ChipInfo> {
        self.observer.on_event(&FlashEvent::DeviceConnected {
            vid: self.transport.vendor_id(),
            pid: self.transport.product_id(),
        });
        self.phase(FlashPhase::WaitingForDevice, FlashPhase::Handshake);

        let (hw_code, version, target) = {
            let link = ObservableTransport {
                inner: &self.transport,
                observer: &*self.observer,
            };
            let brom = Brom::new(&link);
            brom.handshake()?;
            (brom.hw_code()?, brom.hw_sw_version()?, brom.target_config()?)
        };

        let chip = &mut self.state.chip;
        chip.hw_code = hw_code;
        chip.hw_sub_code = version.hw_sub_code;
        chip.hw_version = version.hw_version;
        chip.sw_version = version.sw_version;
        chip.target_config = target.0;
        if let Some(base) = self.config.efuse_base {
            chip.efuse_base = base;
        }
        if let Some(sectors) = self.config.rpmb_sectors {
            chip.rpmb_sectors = sectors;
        }

        info!(
            hw_code = %format!("0x{hw_code:04X}"),
            hw_version = %format!("0x{:04X}", version.hw_version),
            sw_version = %format!("0x{:04X}", version.sw_version),
            secure_boot = target.secure_boot(),
            sla = target.sla(),
            daa = target.daa(),
            "Chip identified"
        );
        self.observer.on_event(&FlashEvent::DeviceStatus {
            hw_code,
            hw_version: version.hw_version,
            sw_version: version.sw_version,
        });
        Ok(self.state.chip.clone())
    }

    /// Pick the loader image for the identified chip.
    pub fn select_loader(&mut self) -> Result<LoaderImage> {
        let chip = &self.state.chip;
        let image = self
            .repository
            .select(chip.hw_code, chip.hw_version, chip.sw_version)
            .cloned()
            .ok_or_else(|| {
                DaError::NotFound(format!("DA loader for hw code 0x{:04X}", chip.hw_code))
            })?;
        self.state.generation = image.generation;
        self.state.loader = Some(image.clone());
        self.observer.on_event(&FlashEvent::LoaderSelected {
            hw_code: image.hw_code,
            hw_version: image.hw_version,
            sw_version: image.sw_version,
            path: image.path.display().to_string(),
        });
        Ok(image)
    }

    /// Load both stages of the selected loader, patched when configured.
    pub fn patch_images(&mut self) -> Result<PreparedStages> {
        let loader = self
            .state
            .loader
            .as_ref()
            .ok_or_else(|| DaError::NotFound("selected DA loader".into()))?;
        let first = loader.read_stage(Stage::First)?;
        let second = loader.read_stage(Stage::Second)?;

        if !self.config.patch {
            self.state.patched = false;
            return Ok(PreparedStages {
                first,
                second,
                reports: Vec::new(),
            });
        }

        let (first_payload, first_report) = patch_first_stage(first.payload());
        let (second_payload, second_report) =
            patch_second_stage(second.payload(), second.load_address);
        for (stage, report) in [(1, &first_report), (2, &second_report)] {
            debug!("DA{stage} patches: {report}");
            self.observer.on_event(&FlashEvent::StagePatched {
                stage,
                patched: report.patched(),
            });
        }
        self.state.patched = true;
        Ok(PreparedStages {
            first: with_payload(&first, first_payload),
            second: with_payload(&second, second_payload),
            reports: vec![first_report, second_report],
        })
    }

    /// Upload both stages and, on a patched agent, the extension.
    #[instrument(skip_all)]
    pub fn upload(&mut self, stages: &PreparedStages) -> Result<()> {
        let preloader = match &self.config.preloader_path {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };
        let template = match &self.config.extension_path {
            Some(path) if self.state.patched => Some(std::fs::read(path)?),
            _ => None,
        };

        self.phase(FlashPhase::Handshake, FlashPhase::StageOneUpload);
        {
            let link = ObservableTransport {
                inner: &self.transport,
                observer: &*self.observer,
            };
            let brom = Brom::new(&link);
            let first = &stages.first;
            brom.send_da(first.load_address, &first.data, first.signature_len as u32)?;
            brom.jump_da(first.load_address)?;
            brom.wait_da_sync()?;
        }

        self.phase(FlashPhase::StageOneUpload, FlashPhase::StageTwoUpload);
        let second = &stages.second;
        self.with_xflash(|xflash, state| {
            if xflash.generation() == ProtocolGeneration::V6 {
                xflash.host_capabilities()?;
            }
            xflash.sync()?;
            xflash.setup_environment()?;
            xflash.setup_hw_init()?;
            xflash.expect_sync()?;

            match preloader
                .as_deref()
                .and_then(|p| extract_emi(p, xflash.generation() == ProtocolGeneration::V5))
            {
                Some(emi) => {
                    info!(version = emi.version, len = emi.data.len(), "Sending EMI data");
                    xflash.init_ext_ram(&emi.data)?;
                }
                None => debug!("No EMI data, DRAM assumed initialised"),
            }

            xflash.boot_to(second.load_address as u64, second.payload())?;
            let (write, read) = xflash.packet_length()?;
            debug!(write, read, "Packet lengths");
            if write > 0 {
                state.write_packet = write as usize;
            }
            Ok(())
        })?;
        info!("Successfully uploaded stage 2");

        if let Some(template) = template {
            self.upload_extension(&template, second)?;
        }

        self.phase(FlashPhase::StageTwoUpload, FlashPhase::Ready);
        self.observer.on_event(&FlashEvent::Ready);
        Ok(())
    }

    fn upload_extension(&mut self, template: &[u8], second: &StageImage) -> Result<()> {
        self.phase(FlashPhase::StageTwoUpload, FlashPhase::Extension);
        let efuse_base = self.state.chip.efuse_base;
        let Some(blob) = build_extension(template, second.payload(), second.load_address, efuse_base)
        else {
            warn!("Extension not built, continuing without it");
            return Ok(());
        };
        info!("Extension symbols:\n{}", blob.symbols);
        self.with_xflash(|xflash, state| {
            xflash.boot_to(EXTENSION_LOAD_ADDRESS as u64, &blob.data)?;
            xflash.extension_ack()?;
            state.extension_loaded = true;
            info!("DA extensions loaded");
            Ok(())
        })
    }

    // ---- flash ----

    pub fn partition_table(&mut self, part: PartType) -> Result<PartitionTable> {
        self.with_engine(|engine| engine.partition_table(part))
    }

    pub fn dump_gpt(&mut self, part: PartType) -> Result<Vec<u8>> {
        self.with_engine(|engine| engine.dump_gpt(part))
    }

    pub fn resolve_partition(&mut self, name: &str) -> Result<PartitionEntry> {
        self.with_engine(|engine| engine.resolve_partition(name, PartType::User))
    }

    pub fn read<W: Write + ?Sized>(
        &mut self,
        address: u64,
        length: u64,
        sink: &mut W,
        part: PartType,
    ) -> Result<u64> {
        self.with_engine(|engine| engine.read(address, length, sink, part))
    }

    pub fn write<R: Read + ?Sized>(
        &mut self,
        address: u64,
        length: u64,
        source: &mut R,
        part: PartType,
    ) -> Result<()> {
        self.with_engine(|engine| engine.write(address, length, source, part))
    }

    pub fn erase(&mut self, address: u64, length: u64, part: PartType) -> Result<()> {
        self.with_engine(|engine| engine.format(address, length, part))
    }

    pub fn read_partitions(&mut self, names: &[String], dir: &Path) -> Result<BulkReport> {
        self.with_engine(|engine| engine.read_partitions(names, dir))
    }

    pub fn write_partitions(&mut self, items: &[(String, PathBuf)]) -> Result<BulkReport> {
        self.with_engine(|engine| engine.write_partitions(items))
    }

    pub fn erase_partitions(&mut self, names: &[String]) -> Result<BulkReport> {
        self.with_engine(|engine| engine.erase_partitions(names))
    }

    pub fn erase_sectors(&mut self, items: &[(String, u64)]) -> Result<BulkReport> {
        self.with_engine(|engine| engine.erase_sectors(items))
    }

    pub fn patch_vbmeta(&mut self, flags: VbmetaFlags) -> Result<String> {
        self.with_engine(|engine| apply_vbmeta_flags(engine, flags))
    }

    // ---- security ----

    pub fn rpmb_read(&mut self, sector: u32, count: u32) -> Result<Vec<u8>> {
        let count = self.rpmb_count(count);
        self.with_rpmb(|rpmb| rpmb.read(sector, count))
    }

    pub fn rpmb_write(&mut self, sector: u32, count: u32, data: &[u8]) -> Result<()> {
        self.with_rpmb(|rpmb| rpmb.write(sector, count, data))
    }

    pub fn rpmb_erase(&mut self, sector: u32, count: u32) -> Result<()> {
        let count = self.rpmb_count(count);
        self.with_rpmb(|rpmb| rpmb.erase(sector, count))
    }

    fn rpmb_count(&self, count: u32) -> u32 {
        match (count, self.config.rpmb_sectors) {
            (0, Some(sectors)) => sectors,
            _ => count,
        }
    }

    /// Flip the seccfg lock state on the device.
    pub fn seccfg_toggle(&mut self, flag: LockFlag) -> Result<SeccfgOutcome> {
        let Self {
            transport,
            observer,
            config,
            state,
            crypto,
            ..
        } = self;
        let link = ObservableTransport {
            inner: &*transport,
            observer: &**observer,
        };
        let xflash = XFlash::new(&link, state.generation)
            .with_write_packet(state.write_packet)
            .with_extension(state.extension_loaded);
        let mut engine =
            FlashEngine::new(xflash, state, &**observer).with_gpt_settings(config.gpt_settings());
        let outcome = toggle_seccfg(&mut engine, flag, &**crypto)?;
        if let SeccfgOutcome::Rewritten { state, .. } = &outcome {
            observer.on_event(&FlashEvent::LockStateChanged { state: *state });
        }
        Ok(outcome)
    }

    /// Read the chip ids and derive the device key set.
    pub fn generate_keys(&mut self) -> Result<DeviceKeys> {
        let Self {
            transport,
            observer,
            state,
            crypto,
            ..
        } = self;
        let link = ObservableTransport {
            inner: &*transport,
            observer: &**observer,
        };
        let xflash = XFlash::new(&link, state.generation)
            .with_write_packet(state.write_packet)
            .with_extension(state.extension_loaded);
        generate_keys(&xflash, &**crypto, &mut state.chip)
    }

    // ---- memory ----

    pub fn peek(&mut self, address: u32, dwords: usize) -> Result<Vec<u32>> {
        self.with_xflash(|xflash, _| xflash.readmem(address, dwords))
    }

    pub fn poke(&mut self, address: u32, words: &[u32]) -> Result<()> {
        self.with_xflash(|xflash, _| xflash.writeregister(address, words))
    }

    /// Drop all device state; the session can be reused after reconnect.
    pub fn disconnect(&mut self) {
        self.observer.on_event(&FlashEvent::DeviceDisconnected);
        self.state.reset();
        info!("Session reset");
    }
}

/// Poll for a MediaTek device until one appears or `timeout_secs` passes.
pub fn wait_for_device(timeout_secs: u64) -> anyhow::Result<NusbTransport> {
    info!("Waiting for device...");
    let timeout = Duration::from_secs(timeout_secs.max(1));
    let start = Instant::now();
    let mut poll_count = 0u64;

    loop {
        poll_count += 1;

        match NusbTransport::open() {
            Ok(t) => {
                info!(
                    vid = format!("{:04X}", t.vendor_id()),
                    pid = format!("{:04X}", t.product_id()),
                    "Device found after {} polls",
                    poll_count
                );
                return Ok(t);
            }
            Err(TransportError::DeviceNotFound { .. }) => {
                if start.elapsed() > timeout {
                    return Err(anyhow!(
                        "Timeout waiting for device after {}s",
                        timeout.as_secs()
                    ));
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Transport wrapper that emits packet events.
pub struct ObservableTransport<'a, T: Transport + ?Sized, O: FlashObserver + ?Sized> {
    inner: &'a T,
    observer: &'a O,
}

impl<'a, T: Transport + ?Sized, O: FlashObserver + ?Sized> ObservableTransport<'a, T, O> {
    pub fn new(inner: &'a T, observer: &'a O) -> Self {
        Self { inner, observer }
    }
}

impl<T: Transport + ?Sized, O: FlashObserver + ?Sized> Transport for ObservableTransport<'_, T, O> {
    fn write(&self, data: &[u8]) -> std::result::Result<usize, TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            let packet_type = if data.len() < 32 { "Cmd/Hdr" } else { "Data" };
            self.observer.on_event(&FlashEvent::Packet {
                direction: PacketDirection::Tx,
                packet_type: packet_type.to_string(),
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn read(&self, max_len: usize) -> std::result::Result<Vec<u8>, TransportError> {
        let res = self.inner.read(max_len);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.observer.on_event(&FlashEvent::Packet {
                direction: PacketDirection::Rx,
                packet_type: "Data".to_string(),
                length: data.len(),
                data: Some(data.iter().take(32).cloned().collect()),
            });
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;
    use crate::loader::image::build_loader;
    use crate::protocol::{
        BROM_CMD_GET_HW_CODE, BROM_CMD_GET_HW_SW_VER, BROM_CMD_GET_TARGET_CONFIG,
    };
    use crate::transport::MockTransport;

    fn queue_identify(mock: &MockTransport) {
        mock.queue_raw(&[0x5F, 0xF5, 0xAF, 0xFA]);
        mock.queue_raw(&[BROM_CMD_GET_HW_CODE]);
        mock.queue_be16(0x0766);
        mock.queue_be16(0);
        mock.queue_raw(&[BROM_CMD_GET_HW_SW_VER]);
        mock.queue_be16(0x8A00);
        mock.queue_be16(0xCA00);
        mock.queue_be16(0x0000);
        mock.queue_be16(0);
        mock.queue_raw(&[BROM_CMD_GET_TARGET_CONFIG]);
        mock.queue_raw(&0x5u32.to_be_bytes());
        mock.queue_be16(0);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        let config = SessionConfig {
            loader_dir: Some("/opt/loaders".into()),
            storage: Some(StorageKind::Ufs),
            efuse_base: Some(0x11C1_0000),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_config_partial_file_keeps_defaults() {
        let config: SessionConfig = toml::from_str("patch = false\nretry_timeout_secs = 5\n").unwrap();
        assert!(!config.patch);
        assert_eq!(config.retry_timeout_secs, 5);
        assert_eq!(config.gpt_settings(), GptSettings::default());
    }

    #[test]
    fn test_identify() {
        let mock = MockTransport::new();
        queue_identify(&mock);
        let observer = Arc::new(RecordingObserver::default());
        let config = SessionConfig {
            efuse_base: Some(0x11C1_0000),
            rpmb_sectors: Some(0x2000),
            ..Default::default()
        };
        let mut session = DaSession::with_observer(mock, config, observer.clone()).unwrap();

        let chip = session.identify().unwrap();
        assert_eq!(chip.hw_code, 0x0766);
        assert_eq!(chip.hw_version, 0xCA00);
        assert_eq!(chip.target_config, 5);
        assert_eq!(chip.efuse_base, 0x11C1_0000);
        assert_eq!(session.state().chip.rpmb_sectors, 0x2000);
        assert_eq!(session.transport().pending_reads(), 0);

        let events = observer.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            FlashEvent::DeviceStatus { hw_code: 0x0766, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            FlashEvent::Packet { direction: PacketDirection::Rx, .. }
        )));
    }

    #[test]
    fn test_select_loader_without_match() {
        let mock = MockTransport::new();
        queue_identify(&mock);
        let mut session =
            DaSession::with_observer(mock, SessionConfig::default(), Arc::new(NullObserver)).unwrap();
        session.identify().unwrap();

        assert!(matches!(session.select_loader(), Err(DaError::NotFound(_))));
        assert!(matches!(session.patch_images(), Err(DaError::NotFound(_))));
        assert!(session.state().loader.is_none());
    }

    #[test]
    fn test_select_and_patch_from_loader_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MTK_AllInOne_DA.bin");
        std::fs::write(
            &path,
            build_loader(&[(0x0766, 0, 0, 0), (0x0813, 0, 0, 0)], false, &[0u8; 0x40]),
        )
        .unwrap();

        let mock = MockTransport::new();
        queue_identify(&mock);
        let observer = Arc::new(RecordingObserver::default());
        let config = SessionConfig {
            loader_path: Some(path.display().to_string()),
            ..Default::default()
        };
        let mut session = DaSession::with_observer(mock, config, observer.clone()).unwrap();
        session.identify().unwrap();

        let image = session.select_loader().unwrap();
        assert_eq!(image.hw_code, 0x0766);
        assert_eq!(session.state().generation, image.generation);

        let stages = session.patch_images().unwrap();
        assert!(session.state().patched);
        assert_eq!(stages.reports.len(), 2);
        assert_eq!(stages.first.load_address, 0x0020_0000);
        assert_eq!(stages.second.load_address, 0x4000_0000);

        assert_eq!(
            observer.count(|e| matches!(e, FlashEvent::LoaderSelected { hw_code: 0x0766, .. })),
            1
        );
        assert_eq!(observer.count(|e| matches!(e, FlashEvent::StagePatched { .. })), 2);
    }

    #[test]
    fn test_peek_through_session() {
        let mock = MockTransport::new();
        for value in [0xDEAD_BEEFu32, 0x0BAD_F00D] {
            mock.queue_status(0);
            mock.queue_status(0);
            mock.queue_frame(&value.to_le_bytes());
            mock.queue_status(0);
        }
        let mut session =
            DaSession::with_observer(mock, SessionConfig::default(), Arc::new(NullObserver)).unwrap();
        assert_eq!(session.peek(0x1000_0000, 2).unwrap(), vec![0xDEAD_BEEF, 0x0BAD_F00D]);
    }

    #[test]
    fn test_disconnect_resets_state() {
        let mock = MockTransport::new();
        queue_identify(&mock);
        let mut session =
            DaSession::with_observer(mock, SessionConfig::default(), Arc::new(NullObserver)).unwrap();
        session.identify().unwrap();
        let token = session.cancel_token();

        session.disconnect();
        assert_eq!(session.state().chip, ChipInfo::default());
        token.cancel();
        assert!(session.cancel_token().is_cancelled());
    }

    #[test]
    fn test_with_payload_keeps_signature() {
        let stage = StageImage {
            data: vec![1, 2, 3, 4, 0xEE, 0xEE],
            signature_len: 2,
            load_address: 0x0020_0000,
        };
        let patched = with_payload(&stage, vec![9, 9, 9, 9]);
        assert_eq!(patched.data, vec![9, 9, 9, 9, 0xEE, 0xEE]);
        assert_eq!(patched.payload(), &[9, 9, 9, 9]);
    }
}
