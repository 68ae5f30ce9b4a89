//! Text labels drawn with rusttype.
//!
//! No font ships with the crate: one is loaded from the configured path or
//! from the first common system font that exists.

use image::{Rgba, RgbaImage};
use rusttype::{point, Font, Scale};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{DeviceError, Result};

/// Fonts tried in order when none is configured
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/liberation-sans/LiberationSans-Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "C:\\Windows\\Fonts\\arialbd.ttf",
];

/// Horizontal room kept free on each side of a label
const PADDING: i32 = 4;

pub const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
pub const TEXT_BG: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Load a TrueType font from disk
pub fn load_font(path: &Path) -> Result<Font<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| DeviceError::Font(format!("{}: {}", path.display(), e)))?;
    Font::try_from_vec(data)
        .ok_or_else(|| DeviceError::Font(format!("{} is not a usable font", path.display())))
}

/// Load the configured font, or the first system font found
pub fn find_font(configured: Option<&Path>) -> Result<Font<'static>> {
    if let Some(path) = configured {
        return load_font(path);
    }

    for candidate in SYSTEM_FONTS.iter().map(PathBuf::from) {
        if !candidate.exists() {
            continue;
        }
        match load_font(&candidate) {
            Ok(font) => {
                debug!("Using font {}", candidate.display());
                return Ok(font);
            }
            Err(e) => debug!("Skipping font: {}", e),
        }
    }
    Err(DeviceError::Font("no system font found".to_string()))
}

/// Label size by length, larger for short labels
pub fn label_scale(text: &str) -> f32 {
    match text.chars().count() {
        0..=4 => 20.0,
        5..=6 => 16.0,
        _ => 13.0,
    }
}

/// Draw text with its top-left corner at (x, y), alpha blended
pub fn draw_text(
    image: &mut RgbaImage,
    font: &Font,
    text: &str,
    x: i32,
    y: i32,
    scale: f32,
    color: Rgba<u8>,
) {
    let scale = Scale::uniform(scale);
    let v_metrics = font.v_metrics(scale);
    let offset = point(x as f32, y as f32 + v_metrics.ascent);

    for glyph in font.layout(text, scale, offset) {
        let Some(bb) = glyph.pixel_bounding_box() else {
            continue;
        };
        glyph.draw(|gx, gy, alpha| {
            let px = bb.min.x + gx as i32;
            let py = bb.min.y + gy as i32;
            if px < 0 || py < 0 || px >= image.width() as i32 || py >= image.height() as i32 {
                return;
            }
            let pixel = image.get_pixel_mut(px as u32, py as u32);
            for channel in 0..3 {
                pixel[channel] = ((1.0 - alpha) * pixel[channel] as f32
                    + alpha * color[channel] as f32) as u8;
            }
        });
    }
}

/// Rendered width of a single line in pixels
pub fn text_width(font: &Font, text: &str, scale: f32) -> i32 {
    let scale = Scale::uniform(scale);
    let mut width = 0.0;

    for glyph in font.layout(text, scale, point(0.0, 0.0)) {
        if let Some(bb) = glyph.pixel_bounding_box() {
            width = bb.max.x as f32;
        } else {
            width += glyph.unpositioned().h_metrics().advance_width;
        }
    }

    width as i32
}

/// Break text into lines no wider than `max_width`; words that do not fit
/// on a line of their own are split between characters
pub fn wrap_text(font: &Font, text: &str, scale: f32, max_width: i32) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", current, word)
        };
        if text_width(font, &candidate, scale) <= max_width {
            current = candidate;
            continue;
        }

        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if text_width(font, word, scale) <= max_width {
            current = word.to_string();
            continue;
        }

        for c in word.chars() {
            current.push(c);
            if current.chars().count() > 1 && text_width(font, &current, scale) > max_width {
                current.pop();
                lines.push(std::mem::replace(&mut current, c.to_string()));
            }
        }
    }

    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// White text on black, wrapped and centred in a `width` x `height` image
pub fn render_label(font: &Font, width: u32, height: u32, text: &str) -> RgbaImage {
    let mut img = RgbaImage::from_pixel(width, height, TEXT_BG);
    let scale = label_scale(text.trim());
    let lines = wrap_text(font, text, scale, width as i32 - 2 * PADDING);

    let v_metrics = font.v_metrics(Scale::uniform(scale));
    let line_height = (v_metrics.ascent - v_metrics.descent + v_metrics.line_gap).ceil() as i32;
    let total_height = line_height * lines.len() as i32;
    let top = (height as i32 - total_height) / 2;

    for (row, line) in lines.iter().enumerate() {
        let x = ((width as i32 - text_width(font, line, scale)) / 2).max(0);
        let y = top + row as i32 * line_height;
        draw_text(&mut img, font, line, x, y, scale, TEXT_COLOR);
    }
    img
}
