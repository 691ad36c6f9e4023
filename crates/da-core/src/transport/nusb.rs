//! nusb-based USB transport for MediaTek ports.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use nusb::descriptors::TransferType;
use nusb::transfer::{Bulk, Direction, In, Out};
use nusb::{Device, DeviceInfo, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{Transport, TransportError};
use crate::protocol::constants::{MTK_VENDOR_ID, PID_BROM, PID_DA, PID_DA_META, PID_PRELOADER};

/// Buffer handed to nusb per direction; one DA packet fits.
const TRANSFER_BUFFER: usize = 0x1_0000;

/// Open order when several MediaTek ports are present: a running agent
/// first, then preloader, then boot ROM.
const PORT_PREFERENCE: [u16; 4] = [PID_DA, PID_DA_META, PID_PRELOADER, PID_BROM];

/// Bulk endpoint pair on one interface.
#[derive(Debug, Clone, Copy)]
struct BulkPair {
    interface: u8,
    in_ep: u8,
    out_ep: u8,
}

/// The CDC data interface carries the bulk pair; the control interface in
/// front of it only has an interrupt endpoint.
fn find_bulk_pair(device: &Device) -> Option<BulkPair> {
    for config in device.configurations() {
        for iface in config.interfaces() {
            for alt in iface.alt_settings() {
                let bulk = || alt.endpoints().filter(|ep| ep.transfer_type() == TransferType::Bulk);
                let in_ep = bulk().find(|ep| ep.direction() == Direction::In);
                let out_ep = bulk().find(|ep| ep.direction() == Direction::Out);
                if let (Some(i), Some(o)) = (in_ep, out_ep) {
                    return Some(BulkPair {
                        interface: iface.interface_number(),
                        in_ep: i.address(),
                        out_ep: o.address(),
                    });
                }
            }
        }
    }
    None
}

/// USB transport for MediaTek BROM, preloader and DA ports.
pub struct NusbTransport {
    interface: Interface,
    endpoints: BulkPair,
    vid: u16,
    pid: u16,
    alive: AtomicBool,
}

impl NusbTransport {
    /// Open the preferred MediaTek port currently enumerated.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| d.vendor_id() == MTK_VENDOR_ID)
            .filter_map(|d| {
                let rank = PORT_PREFERENCE.iter().position(|pid| *pid == d.product_id())?;
                Some((rank, d))
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, d)| d)
            .ok_or(TransportError::DeviceNotFound {
                vid: MTK_VENDOR_ID,
                pid: 0,
            })?;

        Self::open_device_info(device_info)
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();
        let port = match pid {
            PID_BROM => "brom",
            PID_PRELOADER => "preloader",
            _ => "da",
        };
        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            port,
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let endpoints = find_bulk_pair(&device).ok_or(TransportError::EndpointNotFound {
            ep_type: "Bulk".into(),
            direction: "In/Out".into(),
        })?;

        let interface = device
            .claim_interface(endpoints.interface)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: endpoints.interface,
                message: e.to_string(),
            })?;

        info!(
            interface = endpoints.interface,
            in_ep = %format!("0x{:02X}", endpoints.in_ep),
            out_ep = %format!("0x{:02X}", endpoints.out_ep),
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            endpoints,
            vid,
            pid,
            alive: AtomicBool::new(true),
        })
    }

    /// Map a transfer error, remembering that the link is gone unless the
    /// transfer merely timed out.
    fn transfer_error(&self, e: io::Error, wrap: fn(String) -> TransportError) -> TransportError {
        match e.kind() {
            io::ErrorKind::TimedOut => TransportError::Timeout { timeout_ms: 0 },
            io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => {
                self.alive.store(false, Ordering::SeqCst);
                TransportError::Disconnected
            }
            _ => {
                warn!(error = %e, "USB transfer failed");
                wrap(e.to_string())
            }
        }
    }

    fn check_alive(&self) -> Result<(), TransportError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl Transport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.check_alive()?;
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.endpoints.out_ep)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(TRANSFER_BUFFER);
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| self.transfer_error(e, TransportError::WriteFailed))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.check_alive()?;
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.endpoints.in_ep)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(TRANSFER_BUFFER);
        let mut buf = vec![0u8; max_len];
        let n = reader
            .read(&mut buf)
            .map_err(|e| self.transfer_error(e, TransportError::ReadFailed))?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
