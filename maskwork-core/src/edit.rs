//! Per-region photometric edit parameters
//!
//! Every field is optional in the wire form and defaults to "no adjustment".
//! Values are applied in a fixed order by the compositor: brightness,
//! contrast, gamma, hue/saturation, sharpen, noise, then the opacity blend.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct EditParams {
    /// Additive shift in normalized [0, 1] color space (typically -1.0 to +1.0)
    pub brightness: f32,

    /// Scale of the deviation from mid-gray: `(v - 0.5) * (1 + contrast) + 0.5`
    /// (typically -1.0 to +1.0)
    pub contrast: f32,

    /// Gamma delta around 1.0; output is `v^(1 / max(1e-3, 1 + gamma))`
    pub gamma: f32,

    /// Hue rotation in degrees; wraps around the color wheel
    pub hue: Option<f32>,

    /// Saturation delta; the HSV saturation is scaled by `1 + saturation`
    pub saturation: Option<f32>,

    /// Unsharp-mask amount (0.0 to 2.0 typical)
    pub sharpen: f32,

    /// Standard deviation of additive Gaussian noise (0.0 to 0.2 typical)
    pub noise: f32,

    /// Blend factor of the edited region over the pre-edit region.
    /// `None` or anything >= 1.0 keeps the edited result unmodified.
    pub opacity: Option<f32>,
}

impl Default for EditParams {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 0.0,
            gamma: 0.0,
            hue: None,
            saturation: None,
            sharpen: 0.0,
            noise: 0.0,
            opacity: None,
        }
    }
}

impl EditParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brightness(value: f32) -> Self {
        Self { brightness: value, ..Self::default() }
    }

    /// True when applying these parameters cannot change any pixel
    pub fn is_identity(&self) -> bool {
        self.brightness == 0.0
            && self.contrast == 0.0
            && self.gamma == 0.0
            && self.hue.map_or(true, |h| h % 360.0 == 0.0)
            && self.saturation.map_or(true, |s| s == 0.0)
            && self.sharpen <= 0.0
            && self.noise <= 0.0
            && self.opacity.map_or(true, |o| o >= 1.0 || o.is_nan())
    }

    /// Whether the HSV stage has anything to do
    pub fn touches_color(&self) -> bool {
        self.hue.map_or(false, |h| h % 360.0 != 0.0) || self.saturation.map_or(false, |s| s != 0.0)
    }

    /// Opacity clamped to [0, 1], or `None` when the edit is used as-is
    pub fn effective_opacity(&self) -> Option<f32> {
        match self.opacity {
            Some(o) if o.is_finite() => {
                let o = o.clamp(0.0, 1.0);
                if o < 1.0 {
                    Some(o)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Reject non-finite values before they reach pixel math
    pub fn validate(&self) -> Result<()> {
        let scalars = [
            ("brightness", Some(self.brightness)),
            ("contrast", Some(self.contrast)),
            ("gamma", Some(self.gamma)),
            ("hue", self.hue),
            ("saturation", self.saturation),
            ("sharpen", Some(self.sharpen)),
            ("noise", Some(self.noise)),
        ];
        for (name, value) in scalars {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(Error::InvalidInput(format!("edit parameter '{}' must be finite", name)));
                }
            }
        }
        if self.noise < 0.0 {
            return Err(Error::InvalidInput("edit parameter 'noise' must be >= 0".to_string()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_identity() {
        assert!(EditParams::default().is_identity());
        assert!(!EditParams::default().touches_color());
    }

    #[test]
    fn test_explicit_neutral_values_are_identity() {
        let params = EditParams {
            opacity: Some(1.0),
            hue: Some(0.0),
            saturation: Some(0.0),
            ..EditParams::default()
        };
        assert!(params.is_identity());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let params = EditParams::from_json(r#"{"brightness": 0.2, "hue": 30}"#).unwrap();
        assert_eq!(params.brightness, 0.2);
        assert_eq!(params.hue, Some(30.0));
        assert_eq!(params.contrast, 0.0);
        assert_eq!(params.opacity, None);
        assert!(!params.is_identity());
        assert!(params.touches_color());
    }

    #[test]
    fn test_effective_opacity() {
        assert_eq!(EditParams::default().effective_opacity(), None);
        let half = EditParams { opacity: Some(0.5), ..EditParams::default() };
        assert_eq!(half.effective_opacity(), Some(0.5));
        let over = EditParams { opacity: Some(3.0), ..EditParams::default() };
        assert_eq!(over.effective_opacity(), None);
        let under = EditParams { opacity: Some(-1.0), ..EditParams::default() };
        assert_eq!(under.effective_opacity(), Some(0.0));
    }

    #[test]
    fn test_validate() {
        assert!(EditParams::brightness(0.3).validate().is_ok());
        let bad = EditParams { gamma: f32::INFINITY, ..EditParams::default() };
        assert!(bad.validate().is_err());
        let negative_noise = EditParams { noise: -0.1, ..EditParams::default() };
        assert!(negative_noise.validate().is_err());
    }
}
