//! Touch-coordinate and tile geometry per device variant
//!
//! Loupedeck Live S: one 480x270 panel, 5x3 grid of 90px tiles inside the
//! visible rectangle (15,10)-(464,269).
//!
//! Razer Stream Controller: the same 480x270 panel split into a 60px left
//! strip, a 360px centre grid (4x3) and a 60px right strip. The strips
//! behave as two extra tall tiles, 12 (left) and 13 (right).

use serde::{Deserialize, Serialize};

use super::protocol::{
    LIVE_S_PRODUCT_ID, LOUPEDECK_VENDOR_ID, RAZER_STREAM_CONTROLLER_PRODUCT_ID, RAZER_VENDOR_ID,
};
use crate::error::{DeviceError, Result};

pub const TILE_SIZE: u32 = 90;

pub const CENTER: &str = "center";
pub const LEFT: &str = "left";
pub const RIGHT: &str = "right";

/// An addressable pixel surface on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRegion {
    pub name: &'static str,
    pub id: [u8; 2],
    pub width: u32,
    pub height: u32,
}

/// Resolved target of a touch: region name plus tile index (`None` off-grid)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalTarget {
    pub region: &'static str,
    pub tile: Option<usize>,
}

/// Where a tile is painted: region, pixel offset and size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlacement {
    pub region: &'static str,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A narrow auxiliary display beside the grid that acts as a single tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SideStrip {
    region: &'static str,
    tile: usize,
    bound: StripBound,
}

/// Touch x-range owned by a side strip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StripBound {
    /// Everything left of this x
    Before(i32),
    /// Everything at or right of this x
    From(i32),
}

impl SideStrip {
    fn contains(&self, x: i32) -> bool {
        match self.bound {
            StripBound::Before(end) => x < end,
            StripBound::From(start) => x >= start,
        }
    }

    fn pixel_x(&self) -> u32 {
        match self.bound {
            StripBound::Before(_) => 0,
            StripBound::From(start) => start as u32,
        }
    }
}

/// Supported hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceVariant {
    #[default]
    LiveS,
    RazerStreamController,
}

impl DeviceVariant {
    pub const ALL: [DeviceVariant; 2] = [DeviceVariant::LiveS, DeviceVariant::RazerStreamController];

    pub fn name(self) -> &'static str {
        match self {
            Self::LiveS => "Loupedeck Live S",
            Self::RazerStreamController => "Razer Stream Controller",
        }
    }

    /// Identifier used in config files and on the command line
    pub fn slug(self) -> &'static str {
        match self {
            Self::LiveS => "live-s",
            Self::RazerStreamController => "razer-stream-controller",
        }
    }

    pub fn default_baud_rate(self) -> u32 {
        match self {
            Self::LiveS => 115_200,
            Self::RazerStreamController => 921_600,
        }
    }

    pub fn usb_id(self) -> (u16, u16) {
        match self {
            Self::LiveS => (LOUPEDECK_VENDOR_ID, LIVE_S_PRODUCT_ID),
            Self::RazerStreamController => (RAZER_VENDOR_ID, RAZER_STREAM_CONTROLLER_PRODUCT_ID),
        }
    }

    pub fn from_usb_id(vid: u16, pid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.usb_id() == (vid, pid))
    }

    pub fn geometry(self) -> Geometry {
        match self {
            Self::LiveS => Geometry {
                columns: 5,
                rows: 3,
                tile_width: TILE_SIZE,
                tile_height: TILE_SIZE,
                visible_x: (15, 464),
                visible_y: (10, 269),
                side_strips: Vec::new(),
                displays: vec![DisplayRegion {
                    name: CENTER,
                    id: [0x00, b'M'],
                    width: 480,
                    height: 270,
                }],
            },
            Self::RazerStreamController => Geometry {
                columns: 4,
                rows: 3,
                tile_width: TILE_SIZE,
                tile_height: TILE_SIZE,
                visible_x: (60, 420),
                visible_y: (0, 270),
                side_strips: vec![
                    SideStrip {
                        region: LEFT,
                        tile: 12,
                        bound: StripBound::Before(60),
                    },
                    SideStrip {
                        region: RIGHT,
                        tile: 13,
                        bound: StripBound::From(420),
                    },
                ],
                displays: vec![
                    DisplayRegion {
                        name: LEFT,
                        id: [0x00, b'L'],
                        width: 60,
                        height: 270,
                    },
                    DisplayRegion {
                        name: CENTER,
                        id: [0x00, b'M'],
                        width: 360,
                        height: 270,
                    },
                    DisplayRegion {
                        name: RIGHT,
                        id: [0x00, b'R'],
                        width: 60,
                        height: 270,
                    },
                ],
            },
        }
    }
}

impl std::fmt::Display for DeviceVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DeviceVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.slug().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|v| v.slug()).collect();
                format!("unknown variant '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Static geometry of one device variant, immutable for a connection's lifetime
#[derive(Debug, Clone)]
pub struct Geometry {
    pub columns: usize,
    pub rows: usize,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Inclusive clamp bounds of the grid area in touch coordinates
    pub visible_x: (i32, i32),
    pub visible_y: (i32, i32),
    side_strips: Vec<SideStrip>,
    displays: Vec<DisplayRegion>,
}

impl Geometry {
    /// Number of addressable tiles, grid plus side strips
    pub fn tile_count(&self) -> usize {
        self.columns * self.rows + self.side_strips.len()
    }

    pub fn display(&self, name: &str) -> Result<&DisplayRegion> {
        self.displays
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DeviceError::UnknownDisplay(name.to_string()))
    }

    /// Map an absolute touch coordinate to a region and tile.
    ///
    /// Side strips are tested first; everything else is clamped into the
    /// visible rectangle so off-panel coordinates land on the nearest edge tile.
    pub fn resolve(&self, x: i32, y: i32) -> LogicalTarget {
        if let Some(strip) = self.side_strips.iter().find(|s| s.contains(x)) {
            return LogicalTarget {
                region: strip.region,
                tile: Some(strip.tile),
            };
        }

        if self.columns == 0 || self.rows == 0 {
            return LogicalTarget {
                region: CENTER,
                tile: None,
            };
        }

        let x = x.clamp(self.visible_x.0, self.visible_x.1) - self.visible_x.0;
        let y = y.clamp(self.visible_y.0, self.visible_y.1) - self.visible_y.0;

        // The inclusive upper bound can sit exactly on a tile edge
        let column = ((x / self.tile_width as i32) as usize).min(self.columns - 1);
        let row = ((y / self.tile_height as i32) as usize).min(self.rows - 1);

        LogicalTarget {
            region: CENTER,
            tile: Some(row * self.columns + column),
        }
    }

    /// Pixel placement of a tile for drawing (inverse of the grid formula).
    ///
    /// Grid and strip tiles are all addressed through the centre display id,
    /// whose coordinate space spans the whole panel.
    pub fn tile_placement(&self, index: usize) -> Result<TilePlacement> {
        let grid = self.columns * self.rows;
        if index < grid {
            let column = (index % self.columns) as u32;
            let row = (index / self.columns) as u32;
            return Ok(TilePlacement {
                region: CENTER,
                x: self.visible_x.0 as u32 + column * self.tile_width,
                y: row * self.tile_height,
                width: self.tile_width,
                height: self.tile_height,
            });
        }

        let strip = self
            .side_strips
            .iter()
            .find(|s| s.tile == index)
            .ok_or(DeviceError::InvalidTile(index))?;
        let region = self.display(strip.region)?;
        Ok(TilePlacement {
            region: CENTER,
            x: strip.pixel_x(),
            y: 0,
            width: region.width,
            height: region.height,
        })
    }
}
