//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow uploads, transfers and
//! RPMB work without the core depending on how progress is displayed.

use std::fmt;

use crate::state::LockState;

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    WaitingForDevice,
    /// BROM / preloader handshake and identification.
    Handshake,
    /// First DA stage over the boot ROM channel.
    StageOneUpload,
    /// Second DA stage through the first stage.
    StageTwoUpload,
    Extension,
    /// DA running and accepting storage commands.
    Ready,
    Reading,
    Writing,
    Erasing,
    Rpmb,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlashPhase::WaitingForDevice => "Waiting for Device",
            FlashPhase::Handshake => "Handshake",
            FlashPhase::StageOneUpload => "DA1 Upload",
            FlashPhase::StageTwoUpload => "DA2 Upload",
            FlashPhase::Extension => "Extension",
            FlashPhase::Ready => "Ready",
            FlashPhase::Reading => "Reading",
            FlashPhase::Writing => "Writing",
            FlashPhase::Erasing => "Erasing",
            FlashPhase::Rpmb => "RPMB",
        };
        f.write_str(name)
    }
}

/// Events emitted by a DA session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    DeviceConnected { vid: u16, pid: u16 },
    /// Link dropped or the session was reset.
    DeviceDisconnected,
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Progress of a chunked transfer, in bytes (sectors for RPMB).
    Progress {
        phase: FlashPhase,
        operation: String,
        current: u64,
        total: u64,
    },
    /// Chip identification read from the boot ROM.
    DeviceStatus {
        hw_code: u16,
        hw_version: u16,
        sw_version: u16,
    },
    /// Loader image chosen for the identified chip.
    LoaderSelected {
        hw_code: u16,
        hw_version: u16,
        sw_version: u16,
        path: String,
    },
    /// Patch targets applied to one DA stage.
    StagePatched {
        stage: u8,
        patched: Vec<&'static str>,
    },
    /// Seccfg record rewritten on the device.
    LockStateChanged { state: LockState },
    /// Raw link traffic.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Agent uploaded and ready for storage commands.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// Discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device connected");
            }
            FlashEvent::DeviceDisconnected => tracing::warn!("Device disconnected"),
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::Progress {
                phase,
                operation,
                current,
                total,
            } => {
                let pct = (*current * 100).checked_div(*total).unwrap_or(0);
                tracing::debug!(phase = %phase, operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            FlashEvent::DeviceStatus {
                hw_code,
                hw_version,
                sw_version,
            } => {
                tracing::debug!(
                    hw_code = %format!("0x{:04X}", hw_code),
                    hw_ver = %format!("0x{:04X}", hw_version),
                    sw_ver = %format!("0x{:04X}", sw_version),
                    "Device status"
                );
            }
            FlashEvent::LoaderSelected {
                hw_code,
                hw_version,
                sw_version,
                path,
            } => {
                tracing::info!(
                    hw_code = %format!("0x{:04X}", hw_code),
                    version = %format!("{:04X}/{:04X}", hw_version, sw_version),
                    path = %path,
                    "Loader selected"
                );
            }
            FlashEvent::StagePatched { stage, patched } => {
                tracing::info!(stage, patched = %patched.join(", "), "Stage patched");
            }
            FlashEvent::LockStateChanged { state } => {
                tracing::info!(state = %state, "Lock state changed");
            }
            FlashEvent::Packet {
                direction,
                packet_type,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, type_ = %packet_type, len = length, "USB Packet");
            }
            FlashEvent::Ready => tracing::info!("DA ready"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every event for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<FlashEvent>>,
    }

    impl FlashObserver for RecordingObserver {
        fn on_event(&self, event: &FlashEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl RecordingObserver {
        pub fn progress_count(&self) -> usize {
            self.count(|e| matches!(e, FlashEvent::Progress { .. }))
        }

        pub fn count(&self, pred: impl Fn(&FlashEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
        }
    }
}
