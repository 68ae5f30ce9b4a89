pub mod config;
pub mod device;
pub mod display;
pub mod error;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use config::Config;
use device::{
    discover, vibration, ButtonId, ButtonState, DeviceEvent, DeviceManager, DeviceVariant,
    TouchEvent, TouchKind, PHYSICAL_BUTTONS,
};
use display::{renderer, TileRenderer};

/// Brightness change per knob detent, in percent
const BRIGHTNESS_STEP: i32 = 10;

/// Pick the port to open: the configured one, else the first discovered controller
pub fn select_device(config: &Config) -> Result<(String, DeviceVariant)> {
    if let Some(port) = &config.device.port {
        return Ok((port.clone(), config.device.variant));
    }

    let found = discover()?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No compatible device found"))?;
    info!("Found {} on {}", found.variant, found.port);
    Ok((found.port, found.variant))
}

/// Main application struct
pub struct App {
    device: DeviceManager,
    renderer: TileRenderer,
    /// Current brightness (0-100)
    brightness: u8,
    /// Tile currently lit by each active touch
    highlighted: HashMap<u8, usize>,
}

impl App {
    /// Create a new application instance
    pub async fn new(config: Config) -> Result<Self> {
        let (port, variant) = select_device(&config)?;
        let baud_rate = config.device.baud_rate.unwrap_or(variant.default_baud_rate());

        let device = DeviceManager::connect(port, baud_rate, variant, config.link_config()).await?;
        let mut renderer = TileRenderer::new(device.geometry())?;
        match display::find_font(config.display.font_path.as_deref()) {
            Ok(font) => {
                device.set_font(font.clone());
                renderer = renderer.with_font(font, config.display.show_labels);
            }
            Err(e) => warn!("Tiles drawn without labels: {}", e),
        }

        Ok(Self {
            device,
            renderer,
            brightness: config.device.brightness.min(100),
            highlighted: HashMap::new(),
        })
    }

    /// Run the main application loop
    pub async fn run(&mut self) -> Result<()> {
        let mut events = self.device.subscribe();
        self.render_initial_display().await;

        info!("Running - press Ctrl+C to exit");
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} device events", skipped),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Close the connection
    pub async fn shutdown(&self) {
        info!("Shutting down...");
        self.device.close().await;
    }

    /// Brightness, tiles and button LEDs
    async fn render_initial_display(&self) {
        if let Err(e) = self.apply_brightness().await {
            warn!("Set brightness failed: {}", e);
        }

        for index in 0..self.renderer.tile_count() {
            self.draw_tile(index, false).await;
        }

        for button in PHYSICAL_BUTTONS {
            let (r, g, b) = renderer::button_color(button);
            if let Err(e) = self.device.set_button_color(button, r, g, b).await {
                warn!("Set color of {:?} failed: {}", button, e);
            }
        }
        info!("Initial display render complete");
    }

    async fn apply_brightness(&self) -> error::Result<()> {
        self.device
            .set_brightness(self.brightness as f64 / 100.0)
            .await
    }

    async fn draw_tile(&self, index: usize, highlighted: bool) {
        let result = match self.renderer.render(index, highlighted) {
            Ok(image) => self.device.draw_key(index, &image).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Drawing tile {} failed: {}", index, e);
        }
    }

    async fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected { port } => {
                info!("Device connected on {}", port);
                self.highlighted.clear();
                self.render_initial_display().await;
            }
            DeviceEvent::Disconnected { port, reason } => match reason {
                Some(reason) => warn!("Device on {} disconnected: {}", port, reason),
                None => info!("Device on {} closed", port),
            },
            DeviceEvent::Button { id, state } => self.handle_button(id, state).await,
            DeviceEvent::Rotate { id, delta } => self.handle_rotate(id, delta).await,
            DeviceEvent::Touch(touch) => self.handle_touch(touch).await,
        }
    }

    async fn handle_button(&self, id: ButtonId, state: ButtonState) {
        info!("Button {:?} {:?}", id, state);
        if id.is_knob() {
            return;
        }

        let (r, g, b) = match state {
            ButtonState::Down => (255, 255, 255),
            ButtonState::Up => renderer::button_color(id),
        };
        if let Err(e) = self.device.set_button_color(id, r, g, b).await {
            warn!("Set color of {:?} failed: {}", id, e);
        }
    }

    async fn handle_rotate(&mut self, id: ButtonId, delta: i8) {
        debug!("Knob {:?} rotated by {}", id, delta);
        if id != ButtonId::KnobTopLeft {
            return;
        }

        let brightness = (self.brightness as i32 + delta as i32 * BRIGHTNESS_STEP).clamp(0, 100);
        if brightness as u8 == self.brightness {
            return;
        }
        self.brightness = brightness as u8;
        info!("Brightness {}%", self.brightness);
        if let Err(e) = self.apply_brightness().await {
            warn!("Set brightness failed: {}", e);
        }
    }

    async fn handle_touch(&mut self, touch: TouchEvent) {
        let id = touch.changed.id;
        debug!(
            "Touch {:?} {} on {} tile {:?} ({} active)",
            touch.kind,
            id,
            touch.changed.target.region,
            touch.changed.target.tile,
            touch.touches.len()
        );

        match touch.kind {
            TouchKind::Start | TouchKind::Move => {
                let tile = touch.changed.target.tile;
                let previous = self.highlighted.get(&id).copied();
                if tile == previous {
                    return;
                }
                if let Some(previous) = previous {
                    self.highlighted.remove(&id);
                    self.restore_tile(previous).await;
                }
                if let Some(tile) = tile {
                    self.highlighted.insert(id, tile);
                    self.draw_tile(tile, true).await;
                    if touch.kind == TouchKind::Start {
                        if let Err(e) = self.device.vibrate(vibration::DEFAULT).await {
                            warn!("Vibrate failed: {}", e);
                        }
                    }
                }
            }
            TouchKind::End => {
                if let Some(tile) = self.highlighted.remove(&id) {
                    self.restore_tile(tile).await;
                }
            }
        }
    }

    /// Redraw a tile unless another touch still holds it
    async fn restore_tile(&self, tile: usize) {
        if !self.highlighted.values().any(|t| *t == tile) {
            self.draw_tile(tile, false).await;
        }
    }
}
