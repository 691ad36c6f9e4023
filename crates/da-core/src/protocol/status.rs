//! Device status words and their human-readable meanings.

use std::fmt;

/// Status word returned by the DA after each exchange. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);
    pub const CONTINUE: StatusCode = StatusCode(0x4004_0004);
    pub const COMPLETE: StatusCode = StatusCode(0x4004_0005);

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            0x0000_0000 => "OK",
            0x4004_0004 => "Continue",
            0x4004_0005 => "Complete",
            0xC001_0001 => "Error",
            0xC001_0002 => "Abort",
            0xC001_0003 => "Unsupported command",
            0xC001_0004 => "Unsupported ctrl code",
            0xC001_0005 => "Protocol error",
            0xC001_0006 => "Protocol buffer overflow",
            0xC001_0007 => "Insufficient buffer",
            0xC001_0008 => "USB scan error",
            0xC001_0009 => "Invalid hs number",
            0xC001_000A => "Invalid parameter",
            0xC001_000B => "Not implemented",
            0xC001_000C => "Checksum error",
            0xC001_000D => "Timeout",
            0xC002_0004 => "Hash binding check failed",
            0xC002_0005 => "Hash binding check failed (image)",
            0xC002_0039 => "DA version check failed",
            0xC002_0053 => "DA anti-rollback version check failed",
            0xC003_0007 => "Security policy violation",
            0xC004_000D => "Register read/write not allowed",
            0xC007_0004 => "Boot-to image hash check failed",
            0xC005_0001 => "Storage not supported",
            0xC005_0002 => "Storage not found",
            0xC005_0003 => "Storage read failed",
            0xC005_0004 => "Storage write failed",
            0xC005_0005 => "Storage erase failed",
            0xC006_0001 => "Write not allowed in current security state",
            _ => "Unknown status",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status 0x{:08X} ({})", self.0, self.description())
    }
}

/// Per-frame RPMB result codes returned by the extension.
pub fn rpmb_error(code: u32) -> String {
    const MESSAGES: [&str; 8] = [
        "",
        "General failure",
        "Authentication failure",
        "Counter failure",
        "Address failure",
        "Write failure",
        "Read failure",
        "Authentication key not yet programmed",
    ];
    match MESSAGES.get(code as usize) {
        Some(msg) if !msg.is_empty() => (*msg).to_string(),
        _ => format!("Error: 0x{code:X}"),
    }
}
