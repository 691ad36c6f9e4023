//! DA-Core: MediaTek Download Agent host engine in Rust.
//!
//! This crate drives a MediaTek SoC from the boot ROM up to a running
//! Download Agent and then provisions it: flash I/O, partition tables,
//! RPMB and the seccfg lock state.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Protocol**: BROM commands and the DA xflash command set
//! - **Loader**: DA loader files, version selection, preloader EMI
//! - **Flash**: Chunked storage I/O and bulk partition operations
//! - **Partition**: GPT and PMT tables
//! - **Patch**: Signature-based DA patching, extension and vbmeta
//! - **RPMB / Seccfg / Crypto**: Replay-protected storage, lock state, keys
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//! - **Facade**: Serialised access for filesystem adapters
//!
//! # Example
//!
//! ```no_run
//! use da_core::session::{DaSession, SessionConfig, wait_for_device};
//!
//! let config = SessionConfig {
//!     loader_dir: Some("loaders".to_string()),
//!     ..Default::default()
//! };
//!
//! let transport = wait_for_device(config.retry_timeout_secs).expect("no device");
//! let mut session = DaSession::new(transport, config).expect("bad loader config");
//! session.identify().expect("handshake failed");
//! session.select_loader().expect("no loader");
//! let stages = session.patch_images().expect("stage load failed");
//! session.upload(&stages).expect("upload failed");
//! ```

pub mod crypto;
pub mod error;
pub mod events;
pub mod facade;
pub mod flash;
pub mod loader;
pub mod partition;
pub mod patch;
pub mod protocol;
pub mod rpmb;
pub mod seccfg;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use crypto::{CryptoEngine, CryptoMode, DeviceKeys, HwCrypto, NoCrypto};
pub use error::{DaError, ParseError, Result};
pub use events::{FlashEvent, FlashObserver, FlashPhase, NullObserver, TracingObserver};
pub use facade::{MountBackend, PartitionInfo, SerializedFlash};
pub use flash::{BulkReport, FlashDevice, FlashEngine, GptSettings, PartType, StorageKind};
pub use loader::{EmiBlob, LoaderImage, LoaderRepository, Stage, extract_emi};
pub use partition::{PartitionEntry, PartitionTable, TableFormat};
pub use patch::{PatchReport, VbmetaFlags};
pub use protocol::{ProtocolGeneration, StatusCode};
pub use rpmb::{RpmbDevice, RpmbEngine};
pub use seccfg::{LockFlag, SeccfgOutcome, SeccfgRecord};
pub use session::{DaSession, PreparedStages, SessionConfig, wait_for_device};
pub use state::{CancelToken, ChipInfo, FlashSession, LockState};
pub use transport::{MockTransport, NusbTransport, Transport, TransportError};
