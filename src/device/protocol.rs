//! Loupedeck serial protocol constants
//!
//! The device speaks a websocket dialect tunnelled over a CDC-ACM serial port:
//!   - Host opens the port and sends a literal HTTP upgrade request
//!   - Device answers with an `HTTP/1.1 101` response
//!   - Afterwards both sides exchange binary frames starting with 0x82
//!
//! Every binary frame carries one application frame:
//!   `[length][command][transaction id][payload...]`

use std::time::Duration;

/// First byte of every binary websocket frame (FIN + binary opcode)
pub const MAGIC_BYTE: u8 = 0x82;

/// Literal upgrade request that switches the device into websocket mode
pub const WS_UPGRADE_REQUEST: &str =
    "GET /index.html\nHTTP/1.1\nConnection: Upgrade\nUpgrade: websocket\nSec-WebSocket-Key: 123abc\n\n";

/// Expected prefix of the device's upgrade response
pub const WS_UPGRADE_RESPONSE: &str = "HTTP/1.1";

/// Outbound header size when the payload fits a single length byte
pub const SHORT_HEADER_LEN: usize = 6;

/// Outbound header size for payloads above 255 bytes
pub const EXTENDED_HEADER_LEN: usize = 14;

/// Application header: length, command, transaction id
pub const APP_HEADER_LEN: usize = 3;

/// Highest brightness level the firmware accepts
pub const MAX_BRIGHTNESS: u8 = 10;

/// Time a response-expecting command may stay unanswered after it was written
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay between a lost connection and the next reconnect attempt
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

pub const HANDSHAKE_ATTEMPTS: u32 = 3;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Read timeout of the blocking read loop, bounds how long a close takes to be noticed
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// USB ids of supported devices
pub const LOUPEDECK_VENDOR_ID: u16 = 0x2ec2;
pub const LIVE_S_PRODUCT_ID: u16 = 0x0006;
pub const RAZER_VENDOR_ID: u16 = 0x1532;
pub const RAZER_STREAM_CONTROLLER_PRODUCT_ID: u16 = 0x0d06;

/// Application-level command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ButtonPress = 0x00,
    KnobRotate = 0x01,
    SetColor = 0x02,
    Serial = 0x03,
    Reset = 0x06,
    Version = 0x07,
    SetBrightness = 0x09,
    Mcu = 0x0d,
    Draw = 0x0f,
    FrameBuffer = 0x10,
    SetVibration = 0x1b,
    Touch = 0x4d,
    TouchEnd = 0x6d,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::ButtonPress,
            0x01 => Self::KnobRotate,
            0x02 => Self::SetColor,
            0x03 => Self::Serial,
            0x06 => Self::Reset,
            0x07 => Self::Version,
            0x09 => Self::SetBrightness,
            0x0d => Self::Mcu,
            0x0f => Self::Draw,
            0x10 => Self::FrameBuffer,
            0x1b => Self::SetVibration,
            0x4d => Self::Touch,
            0x6d => Self::TouchEnd,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Haptic patterns understood by SET_VIBRATION
pub mod vibration {
    pub const SHORT: u8 = 0x01;
    pub const MEDIUM: u8 = 0x0a;
    pub const LONG: u8 = 0x0f;
    pub const LOW: u8 = 0x31;
    pub const SHORT_LOW: u8 = 0x32;
    pub const SHORT_LOWER: u8 = 0x33;
    pub const LOWER: u8 = 0x40;
    pub const LOWEST: u8 = 0x41;
    pub const DESCEND_SLOW: u8 = 0x46;
    pub const DESCEND_MED: u8 = 0x47;
    pub const DESCEND_FAST: u8 = 0x48;
    pub const ASCEND_SLOW: u8 = 0x52;
    pub const ASCEND_MED: u8 = 0x53;
    pub const ASCEND_FAST: u8 = 0x58;
    pub const REV_SLOWEST: u8 = 0x5e;
    pub const REV_SLOW: u8 = 0x5f;
    pub const REV_MED: u8 = 0x60;
    pub const REV_FAST: u8 = 0x61;
    pub const REV_FASTER: u8 = 0x62;
    pub const REV_FASTEST: u8 = 0x63;
    pub const RISE_FALL: u8 = 0x6a;
    pub const BUZZ: u8 = 0x70;
    pub const VERY_LONG: u8 = 0x76;
    pub const RUMBLE5: u8 = 0x77;
    pub const RUMBLE4: u8 = 0x78;
    pub const RUMBLE3: u8 = 0x79;
    pub const RUMBLE2: u8 = 0x7a;
    pub const RUMBLE1: u8 = 0x7b;

    pub const DEFAULT: u8 = SHORT_LOWER;
}

/// Convert a 0.0-1.0 brightness fraction to the device level (0-10).
///
/// Halfway values round to the even level, so 0.25 maps to 2 and 0.45 to 4.
#[inline]
pub fn brightness_level(fraction: f64) -> u8 {
    let level = (fraction * MAX_BRIGHTNESS as f64).round_ties_even();
    if level.is_nan() {
        return 0;
    }
    level.clamp(0.0, MAX_BRIGHTNESS as f64) as u8
}
