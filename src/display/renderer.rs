use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use rusttype::Font;

use super::text;
use crate::device::{ButtonId, Geometry, PHYSICAL_BUTTONS};
use crate::error::{DeviceError, Result};

/// Color constants
pub const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
pub const GREEN: Rgba<u8> = Rgba([0, 200, 100, 255]);
pub const RED: Rgba<u8> = Rgba([220, 60, 60, 255]);
pub const BLUE: Rgba<u8> = Rgba([60, 120, 200, 255]);
pub const PURPLE: Rgba<u8> = Rgba([140, 80, 200, 255]);
pub const GRAY: Rgba<u8> = Rgba([80, 85, 95, 255]);
pub const ORANGE: Rgba<u8> = Rgba([220, 140, 50, 255]);
pub const DARK_BG: Rgba<u8> = Rgba([15, 15, 22, 255]);
pub const SHADOW: Rgba<u8> = Rgba([0, 0, 0, 255]);

const PALETTE: [Rgba<u8>; 6] = [GREEN, BLUE, PURPLE, ORANGE, RED, GRAY];

/// Border width of a highlighted (touched) tile
const HIGHLIGHT_WIDTH: u32 = 4;

/// Base colour of a tile
pub fn tile_color(index: usize) -> Rgba<u8> {
    PALETTE[index % PALETTE.len()]
}

/// LED colour of a physical button
pub fn button_color(button: ButtonId) -> (u8, u8, u8) {
    let index = PHYSICAL_BUTTONS
        .iter()
        .position(|b| *b == button)
        .unwrap_or_default();
    let [r, g, b, _] = tile_color(index).0;
    (r, g, b)
}

fn scale(color: Rgba<u8>, factor: f32) -> Rgba<u8> {
    let [r, g, b, a] = color.0;
    let channel = |c: u8| (c as f32 * factor).round().clamp(0.0, 255.0) as u8;
    Rgba([channel(r), channel(g), channel(b), a])
}

/// Renders tile images sized for one device's geometry
pub struct TileRenderer {
    sizes: Vec<(u32, u32)>,
    font: Option<Font<'static>>,
    labels: bool,
}

impl TileRenderer {
    pub fn new(geometry: &Geometry) -> Result<Self> {
        let sizes = (0..geometry.tile_count())
            .map(|index| {
                geometry
                    .tile_placement(index)
                    .map(|p| (p.width, p.height))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            sizes,
            font: None,
            labels: false,
        })
    }

    /// Use `font` for text; tiles get their number printed when `labels` is set
    pub fn with_font(mut self, font: Font<'static>, labels: bool) -> Self {
        self.font = Some(font);
        self.labels = labels;
        self
    }

    pub fn font(&self) -> Option<&Font<'static>> {
        self.font.as_ref()
    }

    pub fn tile_count(&self) -> usize {
        self.sizes.len()
    }

    fn size(&self, index: usize) -> Result<(u32, u32)> {
        self.sizes
            .get(index)
            .copied()
            .ok_or(DeviceError::InvalidTile(index))
    }

    /// Render a tile in its palette colour, outlined when highlighted
    pub fn render(&self, index: usize, highlighted: bool) -> Result<RgbaImage> {
        let (width, height) = self.size(index)?;
        let base = tile_color(index);
        let mut img = RgbaImage::from_pixel(width, height, DARK_BG);

        // Vertical gradient from the base colour to a darker shade
        for y in 0..height {
            let t = y as f32 / height as f32;
            let row = scale(base, if highlighted { 1.2 - 0.3 * t } else { 0.9 - 0.5 * t });
            draw_filled_rect_mut(&mut img, Rect::at(0, y as i32).of_size(width, 1), row);
        }

        if highlighted {
            for inset in 0..HIGHLIGHT_WIDTH.min(width / 2).min(height / 2) {
                let rect = Rect::at(inset as i32, inset as i32)
                    .of_size(width - 2 * inset, height - 2 * inset);
                draw_hollow_rect_mut(&mut img, rect, WHITE);
            }
        } else {
            draw_hollow_rect_mut(&mut img, Rect::at(0, 0).of_size(width, height), DARK_BG);
        }

        if let (Some(font), true) = (&self.font, self.labels) {
            let label = (index + 1).to_string();
            let size = text::label_scale(&label);
            let x = (width as i32 - text::text_width(font, &label, size)) / 2;
            let y = (height as i32 - size as i32) / 2;
            text::draw_text(&mut img, font, &label, x + 1, y + 1, size, SHADOW);
            text::draw_text(&mut img, font, &label, x, y, size, WHITE);
        }

        Ok(img)
    }

    /// Render `text` as a white label on black, wrapped to the tile width
    pub fn render_text(&self, index: usize, label: &str) -> Result<RgbaImage> {
        if label.trim().is_empty() {
            return Err(DeviceError::EmptyLabel);
        }
        let (width, height) = self.size(index)?;
        let font = self
            .font
            .as_ref()
            .ok_or_else(|| DeviceError::Font("no font loaded".to_string()))?;
        Ok(text::render_label(font, width, height, label))
    }
}
