//! In-memory device double for transport and engine tests.
//!
//! Plays the device side of the link: answers the upgrade request, records
//! every frame the host writes and lets tests inject inbound frames.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::framing::{decode_outer_frame, AppFrame};
use super::lock;
use super::protocol::MAGIC_BYTE;
use super::transport::{Connector, SerialLink};
use crate::config::LinkConfig;
use crate::error::{DeviceError, Result};

const HANDSHAKE_REPLY: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n";

#[derive(Default)]
struct State {
    inbound: Mutex<VecDeque<u8>>,
    inbound_ready: Condvar,
    writes: Mutex<Vec<Vec<u8>>>,
    writes_ready: Condvar,
    handshake_reply: Mutex<Option<Vec<u8>>>,
    handshakes: AtomicUsize,
    unplugged: AtomicBool,
    fail_writes: AtomicBool,
    open_links: AtomicUsize,
}

/// Shared handle to the simulated device
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<State>,
}

impl MockDevice {
    pub fn new() -> Self {
        let state = State::default();
        *lock(&state.handshake_reply) = Some(HANDSHAKE_REPLY.to_vec());
        Self {
            state: Arc::new(state),
        }
    }

    /// Link settings scaled down so tests run fast
    pub fn config() -> LinkConfig {
        LinkConfig {
            response_timeout: Duration::from_millis(1000),
            handshake_attempts: 3,
            handshake_timeout: Duration::from_millis(50),
            handshake_retry_delay: Duration::from_millis(10),
            reconnect_interval: Duration::from_millis(50),
            read_poll_interval: Duration::from_millis(10),
            ..LinkConfig::default()
        }
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(MockConnector {
            state: self.state.clone(),
        })
    }

    /// `None` makes the device ignore the upgrade request
    pub fn set_handshake_reply(&self, reply: Option<Vec<u8>>) {
        *lock(&self.state.handshake_reply) = reply;
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn unplug(&self) {
        self.state.unplugged.store(true, Ordering::SeqCst);
        self.state.inbound_ready.notify_all();
    }

    pub fn replug(&self) {
        self.state.unplugged.store(false, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Queue raw bytes for the host to read
    pub fn push_raw(&self, bytes: &[u8]) {
        lock(&self.state.inbound).extend(bytes.iter().copied());
        self.state.inbound_ready.notify_all();
    }

    /// Queue one `[0x82][len][body]` frame
    pub fn push_body(&self, body: &[u8]) {
        let mut bytes = vec![MAGIC_BYTE, body.len() as u8];
        bytes.extend_from_slice(body);
        self.push_raw(&bytes);
    }

    /// Queue an application frame `[len][command][transaction id][payload]`
    pub fn push_frame(&self, command: u8, transaction_id: u8, payload: &[u8]) {
        let frame = AppFrame {
            command,
            transaction_id,
            payload: payload.to_vec(),
        };
        self.push_body(&frame.encode());
    }

    /// Block until at least `count` non-handshake writes arrived, returning all of them
    pub fn wait_for_writes(&self, count: usize) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut writes = lock(&self.state.writes);
        while writes.len() < count {
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for {} writes", count);
            writes = self
                .state
                .writes_ready
                .wait_timeout(writes, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        writes.clone()
    }

    /// Like [`MockDevice::wait_for_writes`] but decoded into application frames
    pub fn wait_for_frames(&self, count: usize) -> Vec<AppFrame> {
        self.wait_for_writes(count)
            .iter()
            .map(|bytes| {
                let body = decode_outer_frame(bytes).expect("valid outer frame");
                AppFrame::decode(body).expect("valid application frame")
            })
            .collect()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state.writes).len()
    }

    /// Link halves the host currently holds open
    pub fn open_links(&self) -> usize {
        self.state.open_links.load(Ordering::SeqCst)
    }
}

struct MockConnector {
    state: Arc<State>,
}

impl Connector for MockConnector {
    fn port_name(&self) -> &str {
        "mock"
    }

    fn open(&self) -> Result<Box<dyn SerialLink>> {
        if self.state.unplugged.load(Ordering::SeqCst) {
            return Err(DeviceError::LinkIo(io::Error::new(
                io::ErrorKind::NotFound,
                "device unplugged",
            )));
        }
        Ok(Box::new(MockLink::new(
            self.state.clone(),
            Duration::from_millis(50),
        )))
    }
}

struct MockLink {
    state: Arc<State>,
    timeout: Duration,
}

impl MockLink {
    fn new(state: Arc<State>, timeout: Duration) -> Self {
        state.open_links.fetch_add(1, Ordering::SeqCst);
        Self { state, timeout }
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.state.open_links.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut inbound = lock(&self.state.inbound);
        loop {
            if self.state.unplugged.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            if !inbound.is_empty() {
                let n = buf.len().min(inbound.len());
                for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
            inbound = self
                .state
                .inbound_ready
                .wait_timeout(inbound, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.state.fail_writes.load(Ordering::SeqCst)
            || self.state.unplugged.load(Ordering::SeqCst)
        {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }

        if buf.starts_with(b"GET /index.html") {
            self.state.handshakes.fetch_add(1, Ordering::SeqCst);
            if let Some(reply) = lock(&self.state.handshake_reply).clone() {
                lock(&self.state.inbound).clear();
                self.state_push(&reply);
            }
            return Ok(buf.len());
        }

        lock(&self.state.writes).push(buf.to_vec());
        self.state.writes_ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl MockLink {
    fn state_push(&self, bytes: &[u8]) {
        lock(&self.state.inbound).extend(bytes.iter().copied());
        self.state.inbound_ready.notify_all();
    }
}

impl SerialLink for MockLink {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(MockLink::new(self.state.clone(), self.timeout)))
    }
}
