use crate::error::{Error, Result};
use crate::mask::{BoundingBox, Mask};
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random identifier (32 lowercase hex chars)
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(
    /// Identifier of an interactive single-image session
    SessionId
);
opaque_id!(
    /// Identifier of a dataset
    DatasetId
);
opaque_id!(
    /// Identifier of one image inside a dataset
    ImageId
);
opaque_id!(
    /// Identifier of a saved template
    TemplateId
);

/// Session-scoped component identity; the first one assigned is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub u64);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_positive() -> bool {
    true
}

/// A point prompt in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointPrompt {
    pub x_norm: f32,
    pub y_norm: f32,
    #[serde(default = "default_positive")]
    pub positive: bool,
}

impl PointPrompt {
    pub fn positive(x_norm: f32, y_norm: f32) -> Self {
        Self { x_norm, y_norm, positive: true }
    }

    pub fn negative(x_norm: f32, y_norm: f32) -> Self {
        Self { x_norm, y_norm, positive: false }
    }

    /// Both coordinates finite and inside [0, 1]
    pub fn is_valid(&self) -> bool {
        self.x_norm.is_finite()
            && self.y_norm.is_finite()
            && (0.0..=1.0).contains(&self.x_norm)
            && (0.0..=1.0).contains(&self.y_norm)
    }

    /// Map onto pixel coordinates of a `width` x `height` image, clamped to
    /// the valid pixel range.
    pub fn to_pixel(&self, width: u32, height: u32) -> (f32, f32) {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        let x = (self.x_norm * width as f32).clamp(0.0, max_x);
        let y = (self.y_norm * height as f32).clamp(0.0, max_y);
        (x, y)
    }
}

/// Counts reported back alongside an accumulated prompt list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointSummary {
    pub total: usize,
    pub positive: usize,
    pub negative: usize,
}

impl PointSummary {
    pub fn of(points: &[PointPrompt]) -> Self {
        let positive = points.iter().filter(|p| p.positive).count();
        Self {
            total: points.len(),
            positive,
            negative: points.len() - positive,
        }
    }
}

/// Immutable decoded RGB image with the SHA-256 of the bytes it came from.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pixels: RgbImage,
    fingerprint: String,
}

impl SourceImage {
    /// Decode any supported raster format and fingerprint the original bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("image data is empty".to_string()));
        }
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| Error::InvalidInput(format!("cannot decode image: {}", e)))?;
        Ok(Self {
            pixels: decoded.to_rgb8(),
            fingerprint: fingerprint(bytes),
        })
    }

    /// Wrap already-decoded pixels; the fingerprint is taken over the raw buffer.
    pub fn from_pixels(pixels: RgbImage) -> Self {
        let fingerprint = fingerprint(pixels.as_raw());
        Self { pixels, fingerprint }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

/// Hex SHA-256 of `bytes`
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A named, scored mask saved inside a session.
#[derive(Debug, Clone)]
pub struct Component {
    pub id: ComponentId,
    pub name: String,
    pub bbox: BoundingBox,
    pub area: u64,
    pub score: f32,
    pub mask: Arc<Mask>,
}

impl Component {
    pub fn info(&self) -> ComponentInfo {
        ComponentInfo {
            id: self.id,
            bbox: self.bbox,
            area: self.area,
            score: self.score,
            name: self.name.clone(),
        }
    }
}

/// Public view of a component; the mask itself is only returned on export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub bbox: BoundingBox,
    pub area: u64,
    pub score: f32,
    pub name: String,
}

/// A reusable region-selection recipe scoped to a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    /// Empty or absent means the template applies to every image
    #[serde(default, rename = "class")]
    pub class: Option<String>,
    pub points: Vec<PointPrompt>,
    #[serde(default)]
    pub source_filename: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    /// Whether this template should run against an image of class `image_class`
    pub fn applies_to(&self, image_class: Option<&str>) -> bool {
        match self.class.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(tag) => image_class
                .map(|c| c.trim().eq_ignore_ascii_case(tag))
                .unwrap_or(false),
        }
    }
}

/// Heuristic class inference from a filename ("pass"/"fail" substrings).
///
/// Fragile by nature: only used when the caller did not supply a class.
pub fn infer_class_from_filename(filename: &str) -> Option<String> {
    let lower = filename.to_ascii_lowercase();
    if lower.contains("fail") {
        Some("fail".to_string())
    } else if lower.contains("pass") {
        Some("pass".to_string())
    } else {
        None
    }
}
