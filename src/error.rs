use thiserror::Error;

use crate::device::Command;

/// Errors raised by the device protocol stack
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The websocket-upgrade handshake never got an `HTTP/1.1` answer
    #[error("Handshake failed after {attempts} attempts: {reason}")]
    HandshakeFailure { attempts: u32, reason: String },

    /// Read or write on the serial link failed
    #[error("Link I/O error: {0}")]
    LinkIo(#[from] std::io::Error),

    /// Opening or configuring the serial port failed
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No response with a matching transaction id arrived in time
    #[error("Timeout waiting for response to {command:?}")]
    Timeout { command: Command },

    /// A buffer or frame did not have the shape the protocol requires
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The link is down (between a disconnect and the next reconnect)
    #[error("Device not connected")]
    NotConnected,

    /// The link dropped while the request was in flight
    #[error("Device disconnected")]
    Disconnected,

    /// The connection was shut down by the caller
    #[error("Connection closed")]
    Closed,

    #[error("Display '{0}' is not available on this device")]
    UnknownDisplay(String),

    #[error("Key {0} is not a valid key")]
    InvalidTile(usize),

    #[error("Text label must not be empty")]
    EmptyLabel,

    /// No font could be loaded for text labels
    #[error("Font unavailable: {0}")]
    Font(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
