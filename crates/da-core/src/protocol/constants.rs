// USB identifiers
pub const MTK_VENDOR_ID: u16 = 0x0E8D;
pub const PID_BROM: u16 = 0x0003;
pub const PID_PRELOADER: u16 = 0x2000;
pub const PID_DA: u16 = 0x2001;
pub const PID_DA_META: u16 = 0x20FF;
pub const SUPPORTED_PIDS: [u16; 4] = [PID_BROM, PID_PRELOADER, PID_DA, PID_DA_META];

// BROM / preloader handshake
pub const BROM_HANDSHAKE: [u8; 4] = [0xA0, 0x0A, 0x50, 0x05];

// BROM / preloader commands (single byte, echoed)
pub const BROM_CMD_JUMP_DA: u8 = 0xD5;
pub const BROM_CMD_SEND_DA: u8 = 0xD7;
pub const BROM_CMD_GET_TARGET_CONFIG: u8 = 0xD8;
pub const BROM_CMD_GET_HW_SW_VER: u8 = 0xFC;
pub const BROM_CMD_GET_HW_CODE: u8 = 0xFD;
pub const BROM_UPLOAD_PACKET: usize = 0x400;

// Target config bits
pub const TARGET_CONFIG_SBC: u32 = 0x1;
pub const TARGET_CONFIG_SLA: u32 = 0x2;
pub const TARGET_CONFIG_DAA: u32 = 0x4;

// DA framing
pub const DA_MAGIC: u32 = 0xFEEEEEEF;
pub const DA_SYNC_SIGNAL: u32 = 0x434E5953;
pub const DA_SYNC_CHAR: u8 = 0xC0;

// DA top-level commands
pub const CMD_FORMAT: u32 = 0x010003;
pub const CMD_WRITE_DATA: u32 = 0x010004;
pub const CMD_READ_DATA: u32 = 0x010005;
pub const CMD_SHUTDOWN: u32 = 0x010007;
pub const CMD_BOOT_TO: u32 = 0x010008;
pub const CMD_DEVICE_CTRL: u32 = 0x010009;
pub const CMD_INIT_EXT_RAM: u32 = 0x01000A;
pub const CMD_SETUP_ENVIRONMENT: u32 = 0x010100;
pub const CMD_SETUP_HW_INIT_PARAMS: u32 = 0x010101;

// DA device-control codes
pub const CTRL_GET_PACKET_LENGTH: u32 = 0x040007;

// Extension device-control codes
pub const XCMD_ACK: u32 = 0x0F0000;
pub const XCMD_READMEM: u32 = 0x0F0001;
pub const XCMD_READREGISTER: u32 = 0x0F0002;
pub const XCMD_WRITEMEM: u32 = 0x0F0003;
pub const XCMD_WRITEREGISTER: u32 = 0x0F0004;
pub const XCMD_SET_STORAGE: u32 = 0x0F0005;
pub const XCMD_RPMB_SET_KEY: u32 = 0x0F0006;
pub const XCMD_RPMB_PROG_KEY: u32 = 0x0F0007;
pub const XCMD_RPMB_INIT: u32 = 0x0F0008;
pub const XCMD_RPMB_READ: u32 = 0x0F0009;
pub const XCMD_RPMB_WRITE: u32 = 0x0F000A;
pub const XCMD_SEJ_HW: u32 = 0x0F000B;

// Extension image
pub const EXTENSION_LOAD_ADDRESS: u32 = 0x6800_0000;
pub const EXTENSION_ACK: [u8; 4] = [0xA4, 0xA3, 0xA2, 0xA1];

// Transfer sizes
pub const MAX_READ_TRANSFER: usize = 0x10000;
pub const DEFAULT_WRITE_PACKET: usize = 0x10000;
pub const REGISTER_BULK_THRESHOLD: usize = 0x20;
pub const NAND_EXT_PARAM_SIZE: usize = 32;

// RPMB
pub const RPMB_FRAME_SIZE: usize = 0x100;
pub const RPMB_MAX_SECTORS: u32 = 0x10;

// Environment setup
pub const DA_LOG_LEVEL: u32 = 2;
pub const DA_LOG_CHANNEL_UART: u32 = 1;
pub const DA_SYSTEM_OS_LINUX: u32 = 1;

// Loader selection
pub const LEGACY_HW_CODE: u16 = 0x6261;
