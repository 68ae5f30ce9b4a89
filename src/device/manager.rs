use image::RgbaImage;
use rusttype::Font;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use super::buttons::ButtonId;
use super::framing::AppFrame;
use super::geometry::{DeviceVariant, Geometry, LogicalTarget};
use super::lock;
use super::protocol::{brightness_level, Command};
use super::transport::{Connector, LinkHandler, LinkState, SerialConnector, Transport};
use crate::config::LinkConfig;
use crate::display::{encoder, text};
use crate::error::{DeviceError, Result};

/// Buffered events per subscriber before slow receivers start lagging
const EVENT_CAPACITY: usize = 256;

/// Button edge reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Down,
    Up,
}

/// One active finger on the touch surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchPoint {
    pub id: u8,
    pub x: i32,
    pub y: i32,
    pub target: LogicalTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchKind {
    Start,
    Move,
    End,
}

/// A touch change together with every touch still active after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchEvent {
    pub kind: TouchKind,
    /// Active touches ordered by id
    pub touches: Vec<TouchPoint>,
    pub changed: TouchPoint,
}

/// Events raised by the device and the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected { port: String },
    /// `reason` is `None` when the connection was closed deliberately
    Disconnected { port: String, reason: Option<String> },
    Button { id: ButtonId, state: ButtonState },
    Rotate { id: ButtonId, delta: i8 },
    Touch(TouchEvent),
}

/// Device information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub version: String,
}

/// A command waiting in the send queue
struct QueueItem {
    command: Command,
    payload: Vec<u8>,
    expects_response: bool,
    completion: oneshot::Sender<Result<Vec<u8>>>,
}

/// A written command waiting for its reply
struct PendingRequest {
    /// Distinguishes reuses of the same transaction id
    ticket: u64,
    command: Command,
    completion: oneshot::Sender<Result<Vec<u8>>>,
    timeout: Option<AbortHandle>,
}

impl PendingRequest {
    fn complete(self, result: Result<Vec<u8>>) {
        if let Some(timeout) = self.timeout {
            timeout.abort();
        }
        // The caller may have stopped waiting
        let _ = self.completion.send(result);
    }
}

/// Pending requests and active touches share one lock
#[derive(Default)]
struct Tables {
    pending: HashMap<u8, PendingRequest>,
    touches: BTreeMap<u8, TouchPoint>,
}

/// Routes inbound frames to pending requests and event subscribers.
///
/// Runs on the transport's read thread, so nothing here may block.
struct Dispatcher {
    geometry: Geometry,
    tables: Mutex<Tables>,
    events: broadcast::Sender<DeviceEvent>,
    /// Bumped on every successful (re)connect
    generation: AtomicU64,
    next_ticket: AtomicU64,
    /// Set once the caller closed the connection
    closed: AtomicBool,
}

impl Dispatcher {
    fn new(geometry: Geometry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            geometry,
            tables: Mutex::new(Tables::default()),
            events,
            generation: AtomicU64::new(0),
            next_ticket: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advance `counter` to the next id that is non-zero and not pending
    fn allocate_transaction_id(&self, counter: &mut u8) -> Option<u8> {
        let tables = lock(&self.tables);
        for _ in 0..u8::MAX {
            *counter = counter.wrapping_add(1);
            if *counter == 0 {
                *counter = 1;
            }
            if !tables.pending.contains_key(counter) {
                return Some(*counter);
            }
        }
        None
    }

    fn register(
        &self,
        transaction_id: u8,
        command: Command,
        completion: oneshot::Sender<Result<Vec<u8>>>,
    ) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        lock(&self.tables).pending.insert(
            transaction_id,
            PendingRequest {
                ticket,
                command,
                completion,
                timeout: None,
            },
        );
        ticket
    }

    /// Remove the entry only if it is still the same request
    fn take_pending(&self, transaction_id: u8, ticket: u64) -> Option<PendingRequest> {
        let mut tables = lock(&self.tables);
        let current = tables.pending.get(&transaction_id).map(|r| r.ticket);
        if current == Some(ticket) {
            tables.pending.remove(&transaction_id)
        } else {
            None
        }
    }

    fn arm_timeout(&self, transaction_id: u8, ticket: u64, timeout: AbortHandle) {
        let mut tables = lock(&self.tables);
        match tables.pending.get_mut(&transaction_id) {
            Some(request) if request.ticket == ticket => request.timeout = Some(timeout),
            // Already answered
            _ => timeout.abort(),
        }
    }

    fn expire(&self, transaction_id: u8, ticket: u64) {
        if let Some(request) = self.take_pending(transaction_id, ticket) {
            warn!(
                "Timeout waiting for {:?} (transaction {})",
                request.command, transaction_id
            );
            let command = request.command;
            request.complete(Err(DeviceError::Timeout { command }));
        }
    }

    fn fail(&self, transaction_id: u8, ticket: u64, error: DeviceError) {
        if let Some(request) = self.take_pending(transaction_id, ticket) {
            request.complete(Err(error));
        }
    }

    fn fail_all(&self, error: impl Fn() -> DeviceError) {
        let pending: Vec<PendingRequest> = lock(&self.tables)
            .pending
            .drain()
            .map(|(_, request)| request)
            .collect();
        if !pending.is_empty() {
            debug!("Failing {} pending requests", pending.len());
        }
        for request in pending {
            request.complete(Err(error()));
        }
    }

    fn handle_button(&self, payload: &[u8]) {
        let [code, state, ..] = payload else {
            debug!("Dropping short button frame");
            return;
        };
        let Some(id) = ButtonId::from_code(*code) else {
            debug!("Unknown button code 0x{:02x}", code);
            return;
        };
        let state = if *state == 0x00 {
            ButtonState::Down
        } else {
            ButtonState::Up
        };
        debug!("Button {:?} {:?}", id, state);
        self.emit(DeviceEvent::Button { id, state });
    }

    fn handle_rotate(&self, payload: &[u8]) {
        let [code, delta, ..] = payload else {
            debug!("Dropping short rotate frame");
            return;
        };
        let Some(id) = ButtonId::from_code(*code) else {
            debug!("Unknown knob code 0x{:02x}", code);
            return;
        };
        let delta = *delta as i8;
        debug!("Knob {:?} rotated by {}", id, delta);
        self.emit(DeviceEvent::Rotate { id, delta });
    }

    /// Touch payload: `[_, x_hi, x_lo, y_hi, y_lo, id, ..]`
    fn handle_touch(&self, payload: &[u8], ended: bool) {
        if payload.len() < 6 {
            debug!("Dropping short touch frame");
            return;
        }
        let x = u16::from_be_bytes([payload[1], payload[2]]) as i32;
        let y = u16::from_be_bytes([payload[3], payload[4]]) as i32;
        let id = payload[5];
        let changed = TouchPoint {
            id,
            x,
            y,
            target: self.geometry.resolve(x, y),
        };

        let event = {
            let mut tables = lock(&self.tables);
            let kind = if ended {
                tables.touches.remove(&id);
                TouchKind::End
            } else if tables.touches.insert(id, changed.clone()).is_some() {
                TouchKind::Move
            } else {
                TouchKind::Start
            };
            TouchEvent {
                kind,
                touches: tables.touches.values().cloned().collect(),
                changed,
            }
        };

        trace!("Touch {:?} {} at ({}, {})", event.kind, id, x, y);
        self.emit(DeviceEvent::Touch(event));
    }
}

impl LinkHandler for Dispatcher {
    fn on_connected(&self, port: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.emit(DeviceEvent::Connected {
            port: port.to_string(),
        });
    }

    fn on_frame(&self, body: &[u8]) {
        let frame = match AppFrame::decode(body) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping inbound frame: {}", e);
                return;
            }
        };

        let matched = lock(&self.tables).pending.remove(&frame.transaction_id);
        if let Some(request) = matched {
            trace!(
                "Response for {:?} (transaction {})",
                request.command,
                frame.transaction_id
            );
            request.complete(Ok(frame.payload.clone()));
        }

        match Command::from_byte(frame.command) {
            Some(Command::ButtonPress) => self.handle_button(&frame.payload),
            Some(Command::KnobRotate) => self.handle_rotate(&frame.payload),
            Some(Command::Touch) => self.handle_touch(&frame.payload, false),
            Some(Command::TouchEnd) => self.handle_touch(&frame.payload, true),
            _ => {}
        }
    }

    fn on_disconnected(&self, port: &str, reason: Option<&str>) {
        if reason.is_none() || self.closed.load(Ordering::Acquire) {
            self.fail_all(|| DeviceError::Closed);
        } else {
            self.fail_all(|| DeviceError::Disconnected);
        }
        lock(&self.tables).touches.clear();
        self.emit(DeviceEvent::Disconnected {
            port: port.to_string(),
            reason: reason.map(str::to_string),
        });
    }
}

struct Inner {
    variant: DeviceVariant,
    config: LinkConfig,
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
    queue: mpsc::UnboundedSender<QueueItem>,
    drain: Mutex<Option<JoinHandle<()>>>,
    font: Mutex<Option<Font<'static>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(drain) = lock(&self.drain).take() {
            drain.abort();
        }
        if self.dispatcher.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Closing joins the read thread, which must not happen on a runtime worker
        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || transport.close());
            }
            Err(_) => transport.close(),
        }
    }
}

/// Protocol engine for one Loupedeck-style controller.
///
/// Cheap to clone; every clone shares the same connection and send queue.
/// Dropping the last clone shuts the link down in the background; call
/// [`DeviceManager::close`] to wait for the shutdown to finish.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

impl DeviceManager {
    /// Open a serial port and connect
    pub async fn connect(
        port: impl Into<String>,
        baud_rate: u32,
        variant: DeviceVariant,
        config: LinkConfig,
    ) -> Result<Self> {
        let connector = SerialConnector::new(port, baud_rate);
        Self::connect_with(Box::new(connector), variant, config).await
    }

    /// Connect through any [`Connector`]; handshake failures are returned here
    pub async fn connect_with(
        connector: Box<dyn Connector>,
        variant: DeviceVariant,
        config: LinkConfig,
    ) -> Result<Self> {
        info!("Connecting to {} on {}", variant, connector.port_name());

        let dispatcher = Arc::new(Dispatcher::new(variant.geometry()));
        let handler: Arc<dyn LinkHandler> = dispatcher.clone();
        let link_config = config.clone();
        let transport = tokio::task::spawn_blocking(move || {
            Transport::connect(connector, link_config, handler)
        })
        .await
        .map_err(|e| DeviceError::LinkIo(io::Error::new(io::ErrorKind::Other, e)))??;
        let transport = Arc::new(transport);

        let (queue, receiver) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_queue(
            receiver,
            transport.clone(),
            dispatcher.clone(),
            config.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                variant,
                config,
                transport,
                dispatcher,
                queue,
                drain: Mutex::new(Some(drain)),
                font: Mutex::new(None),
            }),
        })
    }

    pub fn variant(&self) -> DeviceVariant {
        self.inner.variant
    }

    pub fn geometry(&self) -> &Geometry {
        &self.inner.dispatcher.geometry
    }

    pub fn port_name(&self) -> &str {
        self.inner.transport.port_name()
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.transport.state()
    }

    /// Receive device and link events until the receiver is dropped
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.dispatcher.events.subscribe()
    }

    async fn enqueue(
        &self,
        command: Command,
        payload: Vec<u8>,
        expects_response: bool,
    ) -> Result<Vec<u8>> {
        if self.inner.dispatcher.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }

        let (completion, result) = oneshot::channel();
        self.inner
            .queue
            .send(QueueItem {
                command,
                payload,
                expects_response,
                completion,
            })
            .map_err(|_| DeviceError::Closed)?;

        // A dropped completion means the queue was discarded on close
        result.await.unwrap_or(Err(DeviceError::Closed))
    }

    /// Send a command and wait for the reply carrying its transaction id
    pub async fn send_and_await(&self, command: Command, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.enqueue(command, payload, true).await
    }

    /// Send a command; completes once it has been written
    pub async fn send_fire_and_forget(&self, command: Command, payload: Vec<u8>) -> Result<()> {
        self.enqueue(command, payload, false).await.map(|_| ())
    }

    /// Query serial number and firmware version
    pub async fn get_info(&self) -> Result<DeviceInfo> {
        let serial = self.send_and_await(Command::Serial, Vec::new()).await?;
        let version = self.send_and_await(Command::Version, Vec::new()).await?;

        let &[major, minor, patch, ..] = version.as_slice() else {
            return Err(DeviceError::ProtocolMismatch(format!(
                "version reply of {} bytes",
                version.len()
            )));
        };

        Ok(DeviceInfo {
            serial: String::from_utf8_lossy(&serial)
                .trim_matches(char::from(0))
                .trim()
                .to_string(),
            version: format!("{}.{}.{}", major, minor, patch),
        })
    }

    /// Set display brightness from a 0.0-1.0 fraction
    pub async fn set_brightness(&self, fraction: f64) -> Result<()> {
        let level = brightness_level(fraction);
        debug!("Setting brightness to level {}", level);
        self.send_and_await(Command::SetBrightness, vec![level])
            .await
            .map(|_| ())
    }

    /// Set the LED colour of a physical button
    pub async fn set_button_color(&self, button: ButtonId, r: u8, g: u8, b: u8) -> Result<()> {
        self.send_and_await(Command::SetColor, vec![button.key_code(), r, g, b])
            .await
            .map(|_| ())
    }

    /// Play a haptic pattern (see [`super::vibration`])
    pub async fn vibrate(&self, pattern: u8) -> Result<()> {
        self.send_fire_and_forget(Command::SetVibration, vec![pattern])
            .await
    }

    pub async fn reset(&self) -> Result<()> {
        info!("Resetting device");
        self.send_fire_and_forget(Command::Reset, Vec::new()).await
    }

    /// Write an encoded RGB565 buffer into a display region
    #[allow(clippy::too_many_arguments)]
    pub async fn draw_buffer(
        &self,
        region: &str,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        buffer: &[u8],
        refresh: bool,
    ) -> Result<()> {
        let display = self.geometry().display(region)?;
        let payload = encoder::draw_payload(display.id, x, y, width, height, buffer)?;
        trace!("Drawing {}x{} at ({}, {}) on {}", width, height, x, y, region);

        self.send_and_await(Command::FrameBuffer, payload).await?;
        if refresh {
            self.refresh(region).await?;
        }
        Ok(())
    }

    /// Encode and draw an image at an offset within a region
    pub async fn draw_image(
        &self,
        region: &str,
        x: u32,
        y: u32,
        image: &RgbaImage,
        refresh: bool,
    ) -> Result<()> {
        let buffer = encoder::encode_image(image);
        self.draw_buffer(region, x, y, image.width(), image.height(), &buffer, refresh)
            .await
    }

    /// Fill a whole region; the image must match its dimensions
    pub async fn draw_screen(&self, region: &str, image: &RgbaImage) -> Result<()> {
        let display = self.geometry().display(region)?;
        if image.dimensions() != (display.width, display.height) {
            return Err(DeviceError::ProtocolMismatch(format!(
                "{} is {}x{}, image is {}x{}",
                region,
                display.width,
                display.height,
                image.width(),
                image.height()
            )));
        }
        self.draw_image(region, 0, 0, image, true).await
    }

    /// Draw one tile; the image must be exactly tile-sized
    pub async fn draw_key(&self, index: usize, image: &RgbaImage) -> Result<()> {
        let placement = self.geometry().tile_placement(index)?;
        if image.dimensions() != (placement.width, placement.height) {
            return Err(DeviceError::ProtocolMismatch(format!(
                "key {} is {}x{}, image is {}x{}",
                index,
                placement.width,
                placement.height,
                image.width(),
                image.height()
            )));
        }
        self.draw_image(placement.region, placement.x, placement.y, image, true)
            .await
    }

    /// Font used by [`DeviceManager::draw_text_key`]
    pub fn set_font(&self, font: Font<'static>) {
        *lock(&self.inner.font) = Some(font);
    }

    /// Draw `label` as white text on black into one tile
    pub async fn draw_text_key(&self, index: usize, label: &str) -> Result<()> {
        if label.trim().is_empty() {
            return Err(DeviceError::EmptyLabel);
        }
        let placement = self.geometry().tile_placement(index)?;
        let font = lock(&self.inner.font)
            .clone()
            .ok_or_else(|| DeviceError::Font("no font set".to_string()))?;

        let image = text::render_label(&font, placement.width, placement.height, label);
        self.draw_key(index, &image).await
    }

    /// Flip a region's written buffer onto the screen
    pub async fn refresh(&self, region: &str) -> Result<()> {
        let display = self.geometry().display(region)?;
        let payload = display.id.to_vec();
        if self.inner.config.await_refresh {
            self.send_and_await(Command::Draw, payload).await.map(|_| ())
        } else {
            self.send_fire_and_forget(Command::Draw, payload).await
        }
    }

    /// Shut down for good: stop reconnecting, drop queued commands and fail pending ones
    pub async fn close(&self) {
        if self.inner.dispatcher.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(drain) = lock(&self.inner.drain).take() {
            drain.abort();
        }

        let transport = self.inner.transport.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || transport.close()).await {
            warn!("Transport shutdown failed: {}", e);
        }
        self.inner.dispatcher.fail_all(|| DeviceError::Closed);
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock(&self.inner.dispatcher.tables).pending.len()
    }
}

/// The single writer: assigns transaction ids in queue order and writes each item
async fn drain_queue(
    mut receiver: mpsc::UnboundedReceiver<QueueItem>,
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
    config: LinkConfig,
) {
    let mut counter: u8 = 0;
    let mut generation = dispatcher.generation();

    while let Some(item) = receiver.recv().await {
        // Transaction state starts over on every new connection
        let current = dispatcher.generation();
        if current != generation {
            generation = current;
            counter = 0;
        }

        let Some(transaction_id) = dispatcher.allocate_transaction_id(&mut counter) else {
            let _ = item.completion.send(Err(DeviceError::ProtocolMismatch(
                "all transaction ids are pending".to_string(),
            )));
            continue;
        };

        let command = item.command;
        let body = AppFrame::new(command, transaction_id, item.payload).encode();
        trace!(
            "Writing {:?} (transaction {}, {} bytes)",
            command,
            transaction_id,
            body.len()
        );

        // Registered before the write so a fast reply always finds its entry
        let (ticket, completion) = if item.expects_response {
            (
                Some(dispatcher.register(transaction_id, command, item.completion)),
                None,
            )
        } else {
            (None, Some(item.completion))
        };

        let writer = transport.clone();
        let written = tokio::task::spawn_blocking(move || writer.send(&body))
            .await
            .unwrap_or_else(|e| Err(DeviceError::LinkIo(io::Error::new(io::ErrorKind::Other, e))));

        match (written, ticket) {
            (Ok(()), Some(ticket)) => {
                let expiry = dispatcher.clone();
                let window = config.response_timeout;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    expiry.expire(transaction_id, ticket);
                });
                dispatcher.arm_timeout(transaction_id, ticket, timer.abort_handle());
            }
            (Err(e), Some(ticket)) => {
                debug!("Write of {:?} failed: {}", command, e);
                dispatcher.fail(transaction_id, ticket, e);
            }
            (result, None) => {
                if let Some(completion) = completion {
                    let _ = completion.send(result.map(|_| Vec::new()));
                }
            }
        }
    }

    debug!("Send queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::MockDevice;
    use crate::device::{geometry::CENTER, vibration};
    use crate::display::text::tests::system_font;
    use image::Rgba;
    use std::time::Duration;

    async fn connect(device: &MockDevice) -> DeviceManager {
        DeviceManager::connect_with(device.connector(), DeviceVariant::LiveS, MockDevice::config())
            .await
            .unwrap()
    }

    async fn frames(device: &MockDevice, count: usize) -> Vec<AppFrame> {
        let device = device.clone();
        tokio::task::spawn_blocking(move || device.wait_for_frames(count))
            .await
            .unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_get_their_own_replies() {
        let device = MockDevice::new();
        let manager = connect(&device).await;

        let serial = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_and_await(Command::Serial, vec![]).await })
        };
        let version = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_and_await(Command::Version, vec![]).await })
        };

        let written = frames(&device, 2).await;
        let mut ids: Vec<u8> = written.iter().map(|f| f.transaction_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        // Answer in reverse order
        for frame in written.iter().rev() {
            device.push_frame(frame.command, frame.transaction_id, &[frame.command, 0xaa]);
        }

        assert_eq!(serial.await.unwrap().unwrap(), vec![0x03, 0xaa]);
        assert_eq!(version.await.unwrap().unwrap(), vec![0x07, 0xaa]);
        assert_eq!(manager.pending_count(), 0);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_removes_pending_and_late_reply_is_dropped() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        let result = manager.send_and_await(Command::Serial, vec![]).await;
        assert!(matches!(
            result,
            Err(DeviceError::Timeout {
                command: Command::Serial
            })
        ));
        assert_eq!(manager.pending_count(), 0);

        let written = frames(&device, 1).await;
        device.push_frame(0x03, written[0].transaction_id, b"late");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_touch_start_then_end() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        device.push_frame(0x4d, 0, &[0x00, 0x00, 20, 0x00, 15, 7]);
        let DeviceEvent::Touch(start) = next_event(&mut events).await else {
            panic!("expected a touch event");
        };
        assert_eq!(start.kind, TouchKind::Start);
        assert_eq!(start.changed.id, 7);
        assert_eq!((start.changed.x, start.changed.y), (20, 15));
        assert_eq!(
            start.changed.target,
            LogicalTarget {
                region: CENTER,
                tile: Some(0)
            }
        );
        assert_eq!(start.touches.len(), 1);

        device.push_frame(0x4d, 0, &[0x00, 0x00, 120, 0x00, 15, 7]);
        let DeviceEvent::Touch(moved) = next_event(&mut events).await else {
            panic!("expected a touch event");
        };
        assert_eq!(moved.kind, TouchKind::Move);
        assert_eq!(moved.changed.target.tile, Some(1));

        device.push_frame(0x6d, 0, &[0x00, 0x00, 120, 0x00, 15, 7]);
        let DeviceEvent::Touch(end) = next_event(&mut events).await else {
            panic!("expected a touch event");
        };
        assert_eq!(end.kind, TouchKind::End);
        assert_eq!(end.changed.id, 7);
        assert!(end.touches.is_empty());
        assert!(lock(&manager.inner.dispatcher.tables).touches.is_empty());
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_touch_snapshot_is_ordered_by_id() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        device.push_frame(0x4d, 0, &[0x00, 0x01, 0x00, 0x00, 50, 9]);
        device.push_frame(0x4d, 0, &[0x00, 0x00, 30, 0x00, 50, 2]);
        next_event(&mut events).await;
        let DeviceEvent::Touch(second) = next_event(&mut events).await else {
            panic!("expected a touch event");
        };
        let ids: Vec<u8> = second.touches.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 9]);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_button_and_rotate_events() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        device.push_frame(0x00, 0, &[0x07, 0x00]);
        device.push_frame(0x00, 0, &[0x07, 0x01]);
        device.push_frame(0x01, 0, &[0x01, 0xff]);
        device.push_frame(0x00, 0, &[0x7f, 0x00]); // unknown code, ignored
        device.push_frame(0x42, 0, &[0x01]); // unknown opcode, ignored
        device.push_frame(0x01, 0, &[0x04, 0x02]);

        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Button {
                id: ButtonId::Button0,
                state: ButtonState::Down
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Button {
                id: ButtonId::Button0,
                state: ButtonState::Up
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Rotate {
                id: ButtonId::KnobTopLeft,
                delta: -1
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Rotate {
                id: ButtonId::KnobTopRight,
                delta: 2
            }
        );
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_short_frames_are_dropped() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        device.push_body(&[0x02, 0x00]);
        device.push_frame(0x4d, 0, &[0x00, 0x01]);
        device.push_frame(0x00, 0, &[0x08, 0x00]);

        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Button {
                id: ButtonId::Button1,
                state: ButtonState::Down
            }
        );
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_fails_pending_requests() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        let request = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_and_await(Command::Version, vec![]).await })
        };
        frames(&device, 1).await;
        device.push_frame(0x4d, 0, &[0x00, 0x00, 20, 0x00, 15, 1]);
        next_event(&mut events).await;

        device.unplug();
        assert!(matches!(
            request.await.unwrap(),
            Err(DeviceError::Disconnected)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            DeviceEvent::Disconnected { reason: Some(_), .. }
        ));
        assert!(lock(&manager.inner.dispatcher.tables).touches.is_empty());

        device.replug();
        assert!(matches!(
            next_event(&mut events).await,
            DeviceEvent::Connected { .. }
        ));

        // Transaction ids start over on the new connection
        let request = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_and_await(Command::Serial, vec![]).await })
        };
        let written = frames(&device, 2).await;
        assert_eq!(written[1].transaction_id, 1);
        device.push_frame(0x03, 1, b"LDD123");
        assert_eq!(request.await.unwrap().unwrap(), b"LDD123".to_vec());
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fire_and_forget_completes_after_write() {
        let device = MockDevice::new();
        let manager = connect(&device).await;

        manager.vibrate(vibration::DEFAULT).await.unwrap();
        manager.reset().await.unwrap();

        let written = frames(&device, 2).await;
        assert_eq!(written[0].command, 0x1b);
        assert_eq!(written[0].payload, vec![0x33]);
        assert_eq!(written[1].command, 0x06);
        assert_eq!(manager.pending_count(), 0);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_draw_key_sends_framebuffer_then_refresh() {
        let device = MockDevice::new();
        let manager = connect(&device).await;

        let drawing = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let tile = RgbaImage::from_pixel(90, 90, Rgba([255, 255, 255, 255]));
                manager.draw_key(6, &tile).await
            })
        };

        let written = frames(&device, 1).await;
        let draw = &written[0];
        assert_eq!(draw.command, 0x10);
        assert_eq!(&draw.payload[..10], &[0x00, 0x4d, 0, 105, 0, 90, 0, 90, 0, 90]);
        assert_eq!(draw.payload.len(), 10 + 90 * 90 * 2);
        assert!(draw.payload[10..].iter().all(|&b| b == 0xff));
        device.push_frame(0x10, draw.transaction_id, &[]);

        drawing.await.unwrap().unwrap();
        let written = frames(&device, 2).await;
        assert_eq!(written[1].command, 0x0f);
        assert_eq!(written[1].payload, vec![0x00, 0x4d]);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_draw_rejects_bad_input_before_sending() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let tile = RgbaImage::new(90, 90);

        assert!(matches!(
            manager.draw_key(15, &tile).await,
            Err(DeviceError::InvalidTile(15))
        ));
        assert!(matches!(
            manager.draw_key(0, &RgbaImage::new(80, 80)).await,
            Err(DeviceError::ProtocolMismatch(_))
        ));
        assert!(matches!(
            manager.draw_screen("left", &tile).await,
            Err(DeviceError::UnknownDisplay(_))
        ));
        assert!(matches!(
            manager.draw_buffer(CENTER, 0, 0, 90, 90, &[0; 4], false).await,
            Err(DeviceError::ProtocolMismatch(_))
        ));
        assert_eq!(device.write_count(), 0);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_info_and_settings() {
        let device = MockDevice::new();
        let manager = connect(&device).await;

        let info = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_info().await })
        };
        let written = frames(&device, 1).await;
        device.push_frame(0x03, written[0].transaction_id, b"LDD1234567\0");
        let written = frames(&device, 2).await;
        assert_eq!(written[1].command, 0x07);
        device.push_frame(0x07, written[1].transaction_id, &[0, 10, 3]);

        let info = info.await.unwrap().unwrap();
        assert_eq!(info.serial, "LDD1234567");
        assert_eq!(info.version, "0.10.3");

        let brightness = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.set_brightness(0.46).await })
        };
        let written = frames(&device, 3).await;
        assert_eq!(written[2].command, 0x09);
        assert_eq!(written[2].payload, vec![5]);
        device.push_frame(0x09, written[2].transaction_id, &[]);
        brightness.await.unwrap().unwrap();

        let color = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.set_button_color(ButtonId::Button2, 1, 2, 3).await })
        };
        let written = frames(&device, 4).await;
        assert_eq!(written[3].payload, vec![0x09, 1, 2, 3]);
        device.push_frame(0x02, written[3].transaction_id, &[]);
        color.await.unwrap().unwrap();
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_fails_pending_and_rejects_new_sends() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        let request = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_and_await(Command::Serial, vec![]).await })
        };
        frames(&device, 1).await;

        manager.close().await;
        assert!(matches!(request.await.unwrap(), Err(DeviceError::Closed)));
        assert!(matches!(
            next_event(&mut events).await,
            DeviceEvent::Disconnected { reason: None, .. }
        ));
        assert_eq!(manager.link_state(), LinkState::Closed);
        assert!(matches!(
            manager.reset().await,
            Err(DeviceError::Closed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transaction_ids_wrap_and_skip_pending() {
        let device = MockDevice::new();
        let config = LinkConfig {
            response_timeout: Duration::from_secs(30),
            ..MockDevice::config()
        };
        let manager =
            DeviceManager::connect_with(device.connector(), DeviceVariant::LiveS, config)
                .await
                .unwrap();

        let serial = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_and_await(Command::Serial, vec![]).await })
        };
        assert_eq!(frames(&device, 1).await[0].transaction_id, 1);

        for _ in 0..256 {
            manager
                .send_fire_and_forget(Command::Reset, vec![])
                .await
                .unwrap();
        }

        let written = frames(&device, 257).await;
        let ids: Vec<u8> = written[1..].iter().map(|f| f.transaction_id).collect();
        assert!(!ids.contains(&0));
        assert!(!ids.contains(&1));
        assert_eq!(ids[0], 2);
        assert_eq!(&ids[251..], &[253, 254, 255, 2, 3]);

        device.push_frame(0x03, 1, b"LDD123");
        assert_eq!(serial.await.unwrap().unwrap(), b"LDD123".to_vec());
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reply_matches_by_transaction_id_not_opcode() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();

        let serial = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_and_await(Command::Serial, vec![]).await })
        };
        let written = frames(&device, 1).await;

        // A button frame that happens to carry the pending transaction id
        device.push_frame(0x00, written[0].transaction_id, &[0x07, 0x00]);

        assert_eq!(serial.await.unwrap().unwrap(), vec![0x07, 0x00]);
        assert_eq!(
            next_event(&mut events).await,
            DeviceEvent::Button {
                id: ButtonId::Button0,
                state: ButtonState::Down
            }
        );
        assert_eq!(manager.pending_count(), 0);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropping_last_handle_closes_link() {
        let device = MockDevice::new();
        let manager = connect(&device).await;
        let mut events = manager.subscribe();
        assert_eq!(device.open_links(), 2);

        drop(manager);

        assert!(matches!(
            next_event(&mut events).await,
            DeviceEvent::Disconnected { reason: None, .. }
        ));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while device.open_links() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "link still open after drop"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_draw_text_key_rejects_empty_label() {
        let device = MockDevice::new();
        let manager = connect(&device).await;

        assert!(matches!(
            manager.draw_text_key(0, "").await,
            Err(DeviceError::EmptyLabel)
        ));
        assert!(matches!(
            manager.draw_text_key(0, "Mute").await,
            Err(DeviceError::Font(_))
        ));
        assert_eq!(device.write_count(), 0);
        manager.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_draw_text_key_sends_rendered_label() {
        let Some(font) = system_font() else { return };
        let device = MockDevice::new();
        let manager = connect(&device).await;
        manager.set_font(font);

        assert!(matches!(
            manager.draw_text_key(15, "Mute").await,
            Err(DeviceError::InvalidTile(15))
        ));

        let draw = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.draw_text_key(5, "Mute").await })
        };
        let written = frames(&device, 1).await;
        assert_eq!(written[0].command, 0x10);
        assert_eq!(written[0].payload.len(), 10 + 90 * 90 * 2);
        assert!(written[0].payload[10..].iter().any(|&b| b != 0));
        device.push_frame(0x10, written[0].transaction_id, &[]);

        draw.await.unwrap().unwrap();
        let written = frames(&device, 2).await;
        assert_eq!(written[1].command, 0x0f);
        manager.close().await;
    }
}
