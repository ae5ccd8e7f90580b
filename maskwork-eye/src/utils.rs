//! Utility functions for pixel processing

use crate::error::VisionError;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbImage};

/// RGB in [0, 1] to HSV with hue in [0, 1)
pub fn rgb_to_hsv(rgb: [f32; 3]) -> [f32; 3] {
    let [r, g, b] = rgb;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { delta / max } else { 0.0 };
    if delta <= 0.0 {
        return [0.0, s, v];
    }

    let h = if max == r {
        ((g - b) / delta) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    [h.rem_euclid(1.0), s, v]
}

pub fn hsv_to_rgb(hsv: [f32; 3]) -> [f32; 3] {
    let [h, s, v] = hsv;
    if s <= 0.0 {
        return [v, v, v];
    }
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

/// Normalized 1-D Gaussian weights for offsets `-radius..=radius`
pub fn gaussian_kernel(sigma: f32, radius: u32) -> Vec<f32> {
    let sigma = sigma.max(1e-3);
    let r = radius as i32;
    let mut weights: Vec<f32> = (-r..=r)
        .map(|d| (-(d * d) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f32 = weights.iter().sum();
    for w in &mut weights {
        *w /= total;
    }
    weights
}

/// True when every pixel's channels differ by at most `tolerance`
pub fn is_grayscale(image: &RgbImage, tolerance: u8) -> bool {
    image.pixels().all(|p| {
        p[0].abs_diff(p[1]) <= tolerance && p[1].abs_diff(p[2]) <= tolerance && p[0].abs_diff(p[2]) <= tolerance
    })
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, VisionError> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out).write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: [f32; 3], b: [f32; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    #[test]
    fn test_hsv_primaries() {
        assert!(close(rgb_to_hsv([1.0, 0.0, 0.0]), [0.0, 1.0, 1.0]));
        assert!(close(rgb_to_hsv([0.0, 1.0, 0.0]), [1.0 / 3.0, 1.0, 1.0]));
        assert!(close(rgb_to_hsv([0.0, 0.0, 1.0]), [2.0 / 3.0, 1.0, 1.0]));
        assert!(close(rgb_to_hsv([0.5, 0.5, 0.5]), [0.0, 0.0, 0.5]));
    }

    #[test]
    fn test_hsv_round_trip() {
        for rgb in [[0.2, 0.4, 0.6], [0.9, 0.1, 0.3], [0.0, 0.0, 0.0], [1.0, 1.0, 0.0]] {
            assert!(close(hsv_to_rgb(rgb_to_hsv(rgb)), rgb));
        }
    }

    #[test]
    fn test_gaussian_kernel_normalized() {
        let k = gaussian_kernel(1.0, 3);
        assert_eq!(k.len(), 7);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(k[3] > k[2] && k[2] > k[1]);
        assert!((k[0] - k[6]).abs() < 1e-7);
    }

    #[test]
    fn test_is_grayscale() {
        let gray = RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90]));
        assert!(is_grayscale(&gray, 0));
        let mut tinted = gray.clone();
        tinted.put_pixel(1, 1, image::Rgb([90, 92, 90]));
        assert!(!is_grayscale(&tinted, 0));
        assert!(is_grayscale(&tinted, 2));
    }

    #[test]
    fn test_encode_png_decodes() {
        let img = RgbImage::from_pixel(3, 2, image::Rgb([1, 2, 3]));
        let bytes = encode_png(&img).unwrap();
        let back = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(back, img);
    }
}
