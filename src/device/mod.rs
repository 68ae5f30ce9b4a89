mod buttons;
mod discovery;
mod framing;
mod geometry;
mod manager;
mod protocol;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use buttons::*;
pub use discovery::{discover, DiscoveredDevice};
pub use framing::{decode_outer_frame, encode_outer_frame, AppFrame, FrameReassembler};
pub use geometry::*;
pub use manager::{
    ButtonState, DeviceEvent, DeviceInfo, DeviceManager, TouchEvent, TouchKind, TouchPoint,
};
pub use protocol::*;
pub use transport::{Connector, LinkHandler, LinkState, SerialConnector, SerialLink, Transport};

/// Lock a std mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
