//! Common value types shared between the render engine and the core.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A discrete vertical layer of the map ("z-level").
pub type Floor = i32;

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Bit-exact key for hashing and equality lookups.
    ///
    /// `-0.0` is folded into `0.0` so both spellings of the origin resolve
    /// to the same key.
    pub fn bits(&self) -> (u64, u64) {
        ((self.lat + 0.0).to_bits(), (self.lng + 0.0).to_bits())
    }
}

/// Viewport bounding box in degrees: `[west, south, east, north]`.
///
/// `west > east` describes a box crossing the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self { west, south, east, north }
    }

    /// The whole world.
    pub fn world() -> Self {
        Self::new(-180.0, -85.0, 180.0, 85.0)
    }

}

/// Opaque identifier of a visual marker owned by the render engine.
///
/// Two handles are the same rendered object iff their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(pub Uuid);

impl HandleId {
    /// Creates a new random HandleId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic HandleId from a sequence number (for simulation).
    pub fn from_seq(seq: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seq.to_le_bytes());
        bytes[8..16].copy_from_slice(&seq.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Pin outline shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinShape {
    #[default]
    Marker,
    Circle,
}

/// Style of a pin drawn by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinStyle {
    pub color: String,
    pub shape: PinShape,
    pub size: u32,
    /// Icon glyph drawn inside the pin
    pub glyph: Option<String>,
    /// Short text drawn on the pin (cluster counts)
    pub label: Option<String>,
}

impl Default for PinStyle {
    fn default() -> Self {
        Self {
            color: "MazeBlue".to_string(),
            shape: PinShape::Marker,
            size: 30,
            glyph: None,
            label: None,
        }
    }
}

/// Style of a host-provided element anchored to a floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchoredStyle {
    /// Host element identifier or template name
    pub element: String,
    /// Pixel offset from the anchor point
    pub offset: [f64; 2],
    /// Opacity when the marker's floor is not the viewed floor
    pub off_floor_opacity: f64,
}

/// Everything the engine needs to draw one handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarkerStyle {
    Pin(PinStyle),
    Anchored(AnchoredStyle),
}

impl Default for MarkerStyle {
    fn default() -> Self {
        Self::Pin(PinStyle::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latlng_bits_folds_negative_zero() {
        assert_eq!(LatLng::new(-0.0, 0.0).bits(), LatLng::new(0.0, -0.0).bits());
    }

    #[test]
    fn test_handle_from_seq_deterministic() {
        assert_eq!(HandleId::from_seq(7), HandleId::from_seq(7));
        assert_ne!(HandleId::from_seq(7), HandleId::from_seq(8));
    }
}
