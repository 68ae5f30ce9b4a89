//! RGB565 pixel encoding and framebuffer command payloads

use image::RgbaImage;

use crate::error::{DeviceError, Result};

/// Bytes per pixel in the device framebuffer
pub const BYTES_PER_PIXEL: usize = 2;

/// Quantize one 8-bit channel to `bits` bits, rounding to nearest
#[inline]
fn quantize(value: u8, bits: u32) -> u16 {
    let max = (1u32 << bits) - 1;
    ((value as u32 * max + 127) / 255) as u16
}

/// Pack an 8-bit RGB colour as RGB565
#[inline]
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    (quantize(r, 5) << 11) | (quantize(g, 6) << 5) | quantize(b, 5)
}

/// Encode a BGRA bitmap (4 bytes per pixel) into little-endian RGB565
pub fn encode_bgra(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    if data.len() != pixels * 4 {
        return Err(DeviceError::ProtocolMismatch(format!(
            "{}x{} bitmap needs {} bytes, got {}",
            width,
            height,
            pixels * 4,
            data.len()
        )));
    }

    let mut buffer = Vec::with_capacity(pixels * BYTES_PER_PIXEL);
    for px in data.chunks_exact(4) {
        let word = pack_rgb565(px[2], px[1], px[0]);
        buffer.extend_from_slice(&word.to_le_bytes());
    }
    Ok(buffer)
}

/// Encode an RGBA image; alpha is ignored
pub fn encode_image(image: &RgbaImage) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(image.len() / 4 * BYTES_PER_PIXEL);
    for px in image.pixels() {
        let [r, g, b, _] = px.0;
        buffer.extend_from_slice(&pack_rgb565(r, g, b).to_le_bytes());
    }
    buffer
}

fn coordinate(name: &str, value: u32) -> Result<[u8; 2]> {
    u16::try_from(value)
        .map(u16::to_be_bytes)
        .map_err(|_| DeviceError::ProtocolMismatch(format!("{} {} exceeds 16 bits", name, value)))
}

/// Build a framebuffer write: `region id ++ x ++ y ++ width ++ height ++ pixels`
///
/// The buffer must hold exactly `width * height` encoded pixels.
pub fn draw_payload(
    region_id: [u8; 2],
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    buffer: &[u8],
) -> Result<Vec<u8>> {
    let expected = width as usize * height as usize * BYTES_PER_PIXEL;
    if buffer.len() != expected {
        return Err(DeviceError::ProtocolMismatch(format!(
            "{}x{} region needs a {} byte buffer, got {}",
            width,
            height,
            expected,
            buffer.len()
        )));
    }

    let mut payload = Vec::with_capacity(10 + buffer.len());
    payload.extend_from_slice(&region_id);
    payload.extend_from_slice(&coordinate("x", x)?);
    payload.extend_from_slice(&coordinate("y", y)?);
    payload.extend_from_slice(&coordinate("width", width)?);
    payload.extend_from_slice(&coordinate("height", height)?);
    payload.extend_from_slice(buffer);
    Ok(payload)
}
