//! RPMB session: key setup and chunked authenticated sector I/O.
//!
//! Every transfer is split into round trips of at most
//! [`RPMB_MAX_SECTORS`] 256-byte frames. The first failing frame stops the
//! whole operation; sectors already written stay written.

use tracing::{debug, info, instrument, warn};

use crate::crypto::{CryptoEngine, CryptoMode, HwCrypto, to_hex};
use crate::error::{DaError, Result};
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::flash::StorageKind;
use crate::protocol::{RPMB_FRAME_SIZE, RPMB_MAX_SECTORS, XFlash};
use crate::state::FlashSession;
use crate::transport::Transport;

/// Sector count assumed for UFS when the device did not report one.
pub const UFS_RPMB_SECTORS: u32 = 512 * 256;

/// RPMB primitives exposed by the DA extension.
pub trait RpmbDevice {
    /// Program `key`; returns the key as read back.
    fn set_key(&self, key: &[u8]) -> Result<Vec<u8>>;
    /// Ask the device to derive its key; returns it.
    fn init(&self) -> Result<Vec<u8>>;
    fn read_frames(&self, sector: u32, count: u32) -> Result<Vec<u8>>;
    fn write_frames(&self, sector: u32, count: u32, data: &[u8]) -> Result<()>;
}

impl<D: RpmbDevice + ?Sized> RpmbDevice for &D {
    fn set_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        (**self).set_key(key)
    }

    fn init(&self) -> Result<Vec<u8>> {
        (**self).init()
    }

    fn read_frames(&self, sector: u32, count: u32) -> Result<Vec<u8>> {
        (**self).read_frames(sector, count)
    }

    fn write_frames(&self, sector: u32, count: u32, data: &[u8]) -> Result<()> {
        (**self).write_frames(sector, count, data)
    }
}

impl<T: Transport + ?Sized> RpmbDevice for XFlash<'_, T> {
    fn set_key(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.rpmb_set_key(key)
    }

    fn init(&self) -> Result<Vec<u8>> {
        self.rpmb_init()
    }

    fn read_frames(&self, sector: u32, count: u32) -> Result<Vec<u8>> {
        self.rpmb_read(sector, count)
    }

    fn write_frames(&self, sector: u32, count: u32, data: &[u8]) -> Result<()> {
        self.rpmb_write(sector, count, data)
    }
}

/// Attach the absolute sector to a failed round trip. Transport errors
/// pass through untouched so they stay fatal.
fn at_sector(sector: u32, err: DaError) -> DaError {
    match err {
        DaError::Rpmb { .. } | DaError::Transport(_) => err,
        other => DaError::Rpmb {
            sector,
            reason: other.to_string(),
        },
    }
}

pub struct RpmbEngine<'a, D: RpmbDevice, C: HwCrypto + ?Sized, O: FlashObserver + ?Sized> {
    device: D,
    crypto: &'a C,
    session: &'a mut FlashSession,
    observer: &'a O,
}

impl<'a, D: RpmbDevice, C: HwCrypto + ?Sized, O: FlashObserver + ?Sized> RpmbEngine<'a, D, C, O> {
    pub fn new(device: D, crypto: &'a C, session: &'a mut FlashSession, observer: &'a O) -> Self {
        Self {
            device,
            crypto,
            session,
            observer,
        }
    }

    /// Establish the session key.
    ///
    /// When the MEID is known, a SEJ key is derived and programmed first;
    /// a read-back that differs is [`DaError::KeyMismatch`]. The device
    /// then derives its own key, which is kept in the session.
    pub fn init(&mut self) -> Result<Vec<u8>> {
        if let Some(meid) = self.session.chip.meid.clone()
            && meid.iter().any(|&b| b != 0)
        {
            match self.crypto.derive(CryptoMode::RpmbKey, &meid, CryptoEngine::Sej) {
                Ok(key) => {
                    info!("Programming sej rpmb key");
                    let read_back = self.device.set_key(&key)?;
                    if read_back != key {
                        self.session.rpmb_key = None;
                        return Err(DaError::KeyMismatch);
                    }
                }
                Err(e) => warn!("No host rpmb key: {e}"),
            }
        }

        let derived = self.device.init()?;
        info!(key = %to_hex(&derived), "Derived rpmb key");
        self.session.rpmb_key = Some(derived.clone());
        Ok(derived)
    }

    fn ensure_key(&mut self) -> Result<()> {
        if self.session.rpmb_key.is_none() {
            self.init()?;
        }
        Ok(())
    }

    /// `0` means the whole RPMB area.
    fn resolve_count(&self, count: u32) -> Result<u32> {
        if count != 0 {
            return Ok(count);
        }
        match (self.session.chip.rpmb_sectors, self.session.storage) {
            (0, StorageKind::Ufs) => Ok(UFS_RPMB_SECTORS),
            (0, _) => Err(DaError::NotFound("RPMB size".into())),
            (n, _) => Ok(n),
        }
    }

    /// `sector..sector + count` must not wrap and must fit the RPMB when
    /// its size is known.
    fn check_range(&self, sector: u32, count: u32) -> Result<()> {
        let limit = self.session.chip.rpmb_sectors;
        match sector.checked_add(count) {
            Some(end) if limit == 0 || end <= limit => Ok(()),
            _ => Err(DaError::Rpmb {
                sector,
                reason: format!("{count} sectors past the end of rpmb ({limit} sectors)"),
            }),
        }
    }

    fn check_cancel(&self, sector: u32) -> Result<()> {
        if self.session.cancel_token().take() {
            return Err(DaError::Cancelled {
                offset: sector as u64 * RPMB_FRAME_SIZE as u64,
            });
        }
        Ok(())
    }

    fn progress(&self, operation: &str, done: u32, total: u32) {
        self.observer.on_event(&FlashEvent::Progress {
            phase: FlashPhase::Rpmb,
            operation: operation.to_string(),
            current: done as u64 * RPMB_FRAME_SIZE as u64,
            total: total as u64 * RPMB_FRAME_SIZE as u64,
        });
    }

    #[instrument(skip(self), fields(sector = %format!("0x{sector:X}")))]
    pub fn read(&mut self, sector: u32, count: u32) -> Result<Vec<u8>> {
        let count = self.resolve_count(count)?;
        self.check_range(sector, count)?;
        let mut out = Vec::with_capacity(count as usize * RPMB_FRAME_SIZE);
        let mut done = 0;
        while done < count {
            self.check_cancel(sector + done)?;
            let n = (count - done).min(RPMB_MAX_SECTORS);
            let frames = self
                .device
                .read_frames(sector + done, n)
                .map_err(|e| at_sector(sector + done, e))?;
            out.extend_from_slice(&frames);
            done += n;
            self.progress("RPMB read", done, count);
        }
        debug!(bytes = out.len(), "RPMB read complete");
        Ok(out)
    }

    /// Write `count` sectors from `data`. `0` writes as many whole frames
    /// as `data` holds, capped at the RPMB size when known.
    #[instrument(skip(self, data), fields(sector = %format!("0x{sector:X}")))]
    pub fn write(&mut self, sector: u32, count: u32, data: &[u8]) -> Result<()> {
        let available = (data.len() / RPMB_FRAME_SIZE) as u32;
        let count = if count == 0 {
            match self.session.chip.rpmb_sectors {
                0 => available,
                n => available.min(n),
            }
        } else {
            count
        };
        if available < count {
            return Err(DaError::Rpmb {
                sector,
                reason: format!(
                    "Incorrect rpmb frame length: {} bytes for {count} sectors",
                    data.len()
                ),
            });
        }
        self.check_range(sector, count)?;
        self.ensure_key()?;
        self.write_chunks("RPMB write", sector, count, |start, n| {
            &data[start as usize * RPMB_FRAME_SIZE..(start + n) as usize * RPMB_FRAME_SIZE]
        })
    }

    /// Zero-fill `count` sectors.
    #[instrument(skip(self), fields(sector = %format!("0x{sector:X}")))]
    pub fn erase(&mut self, sector: u32, count: u32) -> Result<()> {
        let count = self.resolve_count(count)?;
        self.check_range(sector, count)?;
        self.ensure_key()?;
        let zeros = vec![0u8; RPMB_MAX_SECTORS as usize * RPMB_FRAME_SIZE];
        self.write_chunks("RPMB erase", sector, count, |_, n| {
            &zeros[..n as usize * RPMB_FRAME_SIZE]
        })
    }

    fn write_chunks<'d>(
        &mut self,
        operation: &str,
        sector: u32,
        count: u32,
        frames: impl Fn(u32, u32) -> &'d [u8],
    ) -> Result<()> {
        let mut done = 0;
        while done < count {
            self.check_cancel(sector + done)?;
            let n = (count - done).min(RPMB_MAX_SECTORS);
            self.device
                .write_frames(sector + done, n, frames(done, n))
                .map_err(|e| at_sector(sector + done, e))?;
            done += n;
            self.progress(operation, done, count);
        }
        info!("{operation} of {count} sectors complete");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;

    use super::*;
    use crate::protocol::StatusCode;

    /// In-memory RPMB with an optional failing sector.
    pub struct MemoryRpmb {
        pub sectors: RefCell<Vec<[u8; RPMB_FRAME_SIZE]>>,
        pub calls: RefCell<Vec<(u32, u32)>>,
        pub device_key: Vec<u8>,
        /// Key read back from `set_key`; `None` echoes the input.
        pub read_back: Option<Vec<u8>>,
        pub fail_at: Option<u32>,
    }

    impl MemoryRpmb {
        pub fn new(sectors: usize) -> Self {
            Self {
                sectors: RefCell::new(vec![[0xAA; RPMB_FRAME_SIZE]; sectors]),
                calls: RefCell::new(Vec::new()),
                device_key: vec![0x11; 32],
                read_back: None,
                fail_at: None,
            }
        }
    }

    impl RpmbDevice for MemoryRpmb {
        fn set_key(&self, key: &[u8]) -> Result<Vec<u8>> {
            Ok(self.read_back.clone().unwrap_or_else(|| key.to_vec()))
        }

        fn init(&self) -> Result<Vec<u8>> {
            Ok(self.device_key.clone())
        }

        fn read_frames(&self, sector: u32, count: u32) -> Result<Vec<u8>> {
            self.calls.borrow_mut().push((sector, count));
            let sectors = self.sectors.borrow();
            Ok((sector..sector + count)
                .flat_map(|s| sectors[s as usize])
                .collect())
        }

        fn write_frames(&self, sector: u32, count: u32, data: &[u8]) -> Result<()> {
            self.calls.borrow_mut().push((sector, count));
            if self.fail_at.is_some_and(|f| (sector..sector + count).contains(&f)) {
                return Err(DaError::Status(StatusCode(0xC003_0007)));
            }
            let mut sectors = self.sectors.borrow_mut();
            for (i, frame) in data.chunks_exact(RPMB_FRAME_SIZE).enumerate() {
                sectors[sector as usize + i].copy_from_slice(frame);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryRpmb;
    use super::*;
    use crate::crypto::NoCrypto;
    use crate::crypto::testing::XorCrypto;
    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;
    use crate::protocol::ProtocolGeneration;
    use crate::transport::MockTransport;

    #[test]
    fn test_erase_stops_at_failing_chunk() {
        let device = MemoryRpmb {
            fail_at: Some(20),
            ..MemoryRpmb::new(64)
        };
        let mut session = FlashSession::default();
        let observer = RecordingObserver::default();
        let mut engine = RpmbEngine::new(&device, &NoCrypto, &mut session, &observer);

        match engine.erase(0, 32) {
            Err(DaError::Rpmb { sector, .. }) => assert_eq!(sector, 16),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(*device.calls.borrow(), vec![(0, 16), (16, 16)]);
        let sectors = device.sectors.borrow();
        assert!(sectors[..16].iter().all(|s| s.iter().all(|&b| b == 0)));
        assert!(sectors[16..].iter().all(|s| s[0] == 0xAA));
        assert_eq!(observer.progress_count(), 1);
        assert_eq!(session.rpmb_key, Some(vec![0x11; 32]));
    }

    #[test]
    fn test_read_chunks_and_whole_area() {
        let device = MemoryRpmb::new(40);
        let mut session = FlashSession::default();
        session.chip.rpmb_sectors = 40;
        let mut engine = RpmbEngine::new(&device, &NoCrypto, &mut session, &NullObserver);

        let data = engine.read(0, 0).unwrap();
        assert_eq!(data.len(), 40 * RPMB_FRAME_SIZE);
        assert_eq!(*device.calls.borrow(), vec![(0, 16), (16, 16), (32, 8)]);
        // Reads never need the key.
        assert!(session.rpmb_key.is_none());
    }

    #[test]
    fn test_range_past_end() {
        let device = MemoryRpmb::new(8);
        let mut session = FlashSession::default();
        let mut engine = RpmbEngine::new(&device, &NoCrypto, &mut session, &NullObserver);
        assert!(matches!(
            engine.read(u32::MAX - 5, 32),
            Err(DaError::Rpmb { sector, .. }) if sector == u32::MAX - 5
        ));
        assert!(matches!(engine.erase(u32::MAX, 1), Err(DaError::Rpmb { .. })));

        engine.session.chip.rpmb_sectors = 8;
        assert!(matches!(engine.read(4, 5), Err(DaError::Rpmb { sector: 4, .. })));
        assert!(matches!(
            engine.write(6, 4, &[0u8; 4 * RPMB_FRAME_SIZE]),
            Err(DaError::Rpmb { sector: 6, .. })
        ));
        assert!(device.calls.borrow().is_empty());
        assert_eq!(engine.read(4, 4).unwrap().len(), 4 * RPMB_FRAME_SIZE);
    }

    #[test]
    fn test_unknown_size() {
        let device = MemoryRpmb::new(1);
        let mut session = FlashSession::default();
        let mut engine = RpmbEngine::new(&device, &NoCrypto, &mut session, &NullObserver);
        assert!(matches!(engine.read(0, 0), Err(DaError::NotFound(_))));
    }

    #[test]
    fn test_write_short_data() {
        let device = MemoryRpmb::new(8);
        let mut session = FlashSession::default();
        let mut engine = RpmbEngine::new(&device, &NoCrypto, &mut session, &NullObserver);
        assert!(matches!(
            engine.write(2, 2, &[0u8; 0x180]),
            Err(DaError::Rpmb { sector: 2, .. })
        ));
        assert!(device.calls.borrow().is_empty());

        engine.write(2, 0, &[0x42u8; 0x200]).unwrap();
        assert_eq!(device.sectors.borrow()[3][0], 0x42);
    }

    #[test]
    fn test_init_key_mismatch() {
        let device = MemoryRpmb {
            read_back: Some(vec![0; 32]),
            ..MemoryRpmb::new(1)
        };
        let crypto = XorCrypto {
            key: 0x33,
            seccfg_engine: CryptoEngine::Software,
        };
        let mut session = FlashSession::default();
        session.chip.meid = Some(vec![0x01; 16]);
        let mut engine = RpmbEngine::new(&device, &crypto, &mut session, &NullObserver);
        assert!(matches!(engine.init(), Err(DaError::KeyMismatch)));
        assert!(session.rpmb_key.is_none());

        let device = MemoryRpmb::new(1);
        let mut engine = RpmbEngine::new(&device, &crypto, &mut session, &NullObserver);
        assert_eq!(engine.init().unwrap(), vec![0x11; 32]);
    }

    #[test]
    fn test_status_failure_over_wire() {
        let transport = MockTransport::new();
        // device_ctrl + command, then the first frame reports an error.
        transport.queue_status(0);
        transport.queue_status(0);
        transport.queue_frame(&0x0003u16.to_le_bytes());
        transport.queue_status(0);
        let xflash = XFlash::new(&transport, ProtocolGeneration::V5).with_extension(true);
        let mut session = FlashSession::default();
        session.rpmb_key = Some(vec![0; 32]);
        let mut engine = RpmbEngine::new(&xflash, &NoCrypto, &mut session, &NullObserver);

        match engine.write(0x20, 2, &[0u8; 0x200]) {
            Err(DaError::Rpmb { sector, .. }) => assert_eq!(sector, 0x20),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(transport.pending_reads(), 0);
    }
}
