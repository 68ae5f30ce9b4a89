pub mod encoder;
pub mod renderer;
pub mod text;

pub use encoder::{draw_payload, encode_bgra, encode_image, pack_rgb565};
pub use renderer::TileRenderer;
pub use text::{find_font, load_font};
