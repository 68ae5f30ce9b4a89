//! Serial transport: handshake, blocking read loop and reconnect supervision.
//!
//! ```text
//!   Idle → Handshaking → Connected ─(I/O error / EOF)→ Reconnecting ─(delay)→ Handshaking …
//!                            └──────────── close() ──────────────→ Closed
//! ```
//!
//! One dedicated thread owns the read half of the port and feeds the
//! [`FrameReassembler`]; frames are handed to a [`LinkHandler`] synchronously
//! from that thread. Writes go through [`Transport::send`] on a cloned port
//! handle.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use super::framing::{encode_outer_frame, FrameReassembler};
use super::lock;
use super::protocol::{WS_UPGRADE_REQUEST, WS_UPGRADE_RESPONSE};
use crate::config::LinkConfig;
use crate::error::{DeviceError, Result};

/// A byte-level duplex link to the device
pub trait SerialLink: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Independent handle to the same link, used as the write half
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        let clone = self.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(clone))
    }
}

/// Opens fresh links; called once per (re)connect attempt
pub trait Connector: Send + Sync {
    fn port_name(&self) -> &str;
    fn open(&self) -> Result<Box<dyn SerialLink>>;
}

/// Opens a real serial port at 8N1 without flow control
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

impl Connector for SerialConnector {
    fn port_name(&self) -> &str {
        &self.path
    }

    fn open(&self) -> Result<Box<dyn SerialLink>> {
        debug!("Opening {} at {} baud", self.path, self.baud_rate);
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(500))
            .open()?;
        Ok(Box::new(port))
    }
}

/// Receives lifecycle notifications and frames from the read thread
pub trait LinkHandler: Send + Sync {
    fn on_connected(&self, port: &str);
    fn on_frame(&self, body: &[u8]);
    fn on_disconnected(&self, port: &str, reason: Option<&str>);
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Handshaking,
    Connected,
    Reconnecting,
    Closed,
}

struct Shared {
    connector: Box<dyn Connector>,
    config: LinkConfig,
    handler: Arc<dyn LinkHandler>,
    writer: Mutex<Option<Box<dyn SerialLink>>>,
    state: Mutex<LinkState>,
    closed: AtomicBool,
    /// Set by a failed write so the read thread tears the link down
    fault: Mutex<Option<String>>,
}

/// Owner of the physical connection
pub struct Transport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Open the link, perform the handshake and start the read thread.
    ///
    /// Blocks for the duration of the handshake; a handshake that exhausts
    /// its attempts is returned as [`DeviceError::HandshakeFailure`].
    pub fn connect(
        connector: Box<dyn Connector>,
        config: LinkConfig,
        handler: Arc<dyn LinkHandler>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            connector,
            config,
            handler,
            writer: Mutex::new(None),
            state: Mutex::new(LinkState::Idle),
            closed: AtomicBool::new(false),
            fault: Mutex::new(None),
        });

        let link = match shared.establish() {
            Ok(link) => link,
            Err(e) => {
                shared.set_state(LinkState::Idle);
                return Err(e);
            }
        };

        let supervisor_shared = shared.clone();
        let supervisor = thread::Builder::new()
            .name("loupedeck-read".to_string())
            .spawn(move || supervisor_shared.supervise(link))?;

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.shared.state)
    }

    pub fn port_name(&self) -> &str {
        self.shared.connector.port_name()
    }

    /// Write one body wrapped in its transport header.
    ///
    /// A failed write tears the link down and hands over to reconnect; the
    /// write itself is not retried.
    pub fn send(&self, body: &[u8]) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }

        let frame = encode_outer_frame(body);
        let mut writer = lock(&self.shared.writer);
        let link = writer.as_mut().ok_or(DeviceError::NotConnected)?;

        if let Err(e) = link.write_all(&frame).and_then(|_| link.flush()) {
            warn!("Write to {} failed: {}", self.port_name(), e);
            *writer = None;
            *lock(&self.shared.fault) = Some(e.to_string());
            return Err(DeviceError::LinkIo(e));
        }
        Ok(())
    }

    /// Shut the link down for good; auto-reconnect is suppressed.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing connection to {}", self.port_name());
        lock(&self.shared.writer).take();

        if let Some(handle) = lock(&self.supervisor).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.shared.set_state(LinkState::Closed);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("Link state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open a link, handshake, and install its write half
    fn establish(&self) -> Result<Box<dyn SerialLink>> {
        self.set_state(LinkState::Handshaking);

        let mut link = self.connector.open()?;
        perform_handshake(link.as_mut(), &self.config)?;
        link.set_read_timeout(self.config.read_poll_interval)?;
        let writer = link.try_clone_link()?;

        {
            // close() flags first and then clears the writer, so checking
            // under the writer lock never leaves a link behind a closed transport
            let mut slot = lock(&self.writer);
            if self.is_closed() {
                return Err(DeviceError::Closed);
            }
            lock(&self.fault).take();
            *slot = Some(writer);
        }
        self.set_state(LinkState::Connected);

        info!("Connected to {}", self.connector.port_name());
        self.handler.on_connected(self.connector.port_name());
        Ok(link)
    }

    /// Body of the read thread: read until the link fails, then reconnect
    fn supervise(self: Arc<Self>, mut link: Box<dyn SerialLink>) {
        let port = self.connector.port_name().to_string();
        loop {
            let reason = self.read_loop(link.as_mut());
            lock(&self.writer).take();
            drop(link);

            if self.is_closed() {
                self.set_state(LinkState::Closed);
                self.handler.on_disconnected(&port, None);
                return;
            }

            warn!(
                "Lost connection to {}: {}",
                port,
                reason.as_deref().unwrap_or("unknown")
            );
            self.handler.on_disconnected(&port, reason.as_deref());

            match self.reconnect() {
                Some(next) => link = next,
                None => {
                    self.set_state(LinkState::Closed);
                    self.handler.on_disconnected(&port, None);
                    return;
                }
            }
        }
    }

    /// Returns the reason the link went down, `None` when closed by the caller
    fn read_loop(&self, link: &mut dyn SerialLink) -> Option<String> {
        let mut reassembler = FrameReassembler::new();
        let mut buf = [0u8; 1024];

        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(fault) = lock(&self.fault).take() {
                return Some(fault);
            }

            match link.read(&mut buf) {
                Ok(0) => return Some("end of stream".to_string()),
                Ok(n) => {
                    for frame in reassembler.feed(&buf[..n]) {
                        self.handler.on_frame(&frame);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    if self.is_closed() {
                        return None;
                    }
                    return Some(e.to_string());
                }
            }
        }
    }

    /// Retry [`Shared::establish`] every reconnect interval until it succeeds or the link is closed
    fn reconnect(&self) -> Option<Box<dyn SerialLink>> {
        loop {
            self.set_state(LinkState::Reconnecting);
            if !self.sleep_unless_closed(self.config.reconnect_interval) {
                return None;
            }

            match self.establish() {
                Ok(link) => return Some(link),
                Err(DeviceError::Closed) => return None,
                Err(e) => warn!("Reconnect to {} failed: {}", self.connector.port_name(), e),
            }
        }
    }

    /// Sleep in poll-sized slices; false if the link was closed meanwhile
    fn sleep_unless_closed(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_closed() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(self.config.read_poll_interval));
        }
    }
}

/// Send the upgrade request until the device answers with `HTTP/1.1`
fn perform_handshake(link: &mut dyn SerialLink, config: &LinkConfig) -> Result<()> {
    let attempts = config.handshake_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match try_handshake(link, config.handshake_timeout) {
            Ok(()) => {
                debug!("Handshake succeeded on attempt {}", attempt);
                return Ok(());
            }
            Err(e) => {
                warn!("Handshake attempt {} failed: {}", attempt, e);
                last_error = e.to_string();
                if attempt < attempts {
                    thread::sleep(config.handshake_retry_delay);
                }
            }
        }
    }

    Err(DeviceError::HandshakeFailure {
        attempts,
        reason: last_error,
    })
}

fn try_handshake(link: &mut dyn SerialLink, timeout: Duration) -> io::Result<()> {
    link.set_read_timeout(timeout)?;
    link.write_all(WS_UPGRADE_REQUEST.as_bytes())?;
    link.flush()?;

    let expected = WS_UPGRADE_RESPONSE.as_bytes();
    let deadline = Instant::now() + timeout;
    let mut response = Vec::new();
    let mut buf = [0u8; 1024];

    while response.len() < expected.len() {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no response received during the handshake",
            ));
        }
        let n = link.read(&mut buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "link closed during the handshake",
            ));
        }
        response.extend_from_slice(&buf[..n]);
    }

    if response[..expected.len()].eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "invalid handshake response: {}",
                String::from_utf8_lossy(&response)
            ),
        ))
    }
}
