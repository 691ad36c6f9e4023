//! Protocol module - BROM and DA command protocol definitions.

pub mod brom;
pub mod constants;
pub mod frame;
pub mod status;
pub mod xflash;

pub use brom::{Brom, HwVersion, TargetConfig};
pub use constants::*;
pub use frame::{DataType, FrameHeader};
pub use status::{StatusCode, rpmb_error};
pub use xflash::{Reply, XFlash};

use std::fmt;

/// DA protocol generation, decided by the selected loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolGeneration {
    /// Binary xflash protocol.
    #[default]
    V5,
    /// XML-described protocol.
    V6,
}

/// How a 64-bit address travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEncoding {
    /// One 8-byte little-endian frame.
    Tagged64,
    /// Two 4-byte frames, low half first.
    Split32,
}

impl ProtocolGeneration {
    pub fn address_encoding(&self) -> AddressEncoding {
        match self {
            ProtocolGeneration::V5 => AddressEncoding::Tagged64,
            ProtocolGeneration::V6 => AddressEncoding::Split32,
        }
    }
}

impl fmt::Display for ProtocolGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolGeneration::V5 => write!(f, "v5 (xflash)"),
            ProtocolGeneration::V6 => write!(f, "v6 (xml)"),
        }
    }
}
