use image::{Rgb, Rgba, RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canvas::{BlendMode, RasterImage, composite_onto, resize_to};

/// Thresholds for flat-background detection and keying.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionThresholds {
    /// Corners with alpha below this already carry real transparency.
    pub opacity_threshold: u8,
    /// Max per-channel difference between corners to call them one color.
    pub corner_tolerance: u8,
    /// Max per-channel difference from the background color when keying.
    pub key_tolerance: u8,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            opacity_threshold: 250,
            corner_tolerance: 15,
            key_tolerance: 40,
        }
    }
}

#[inline]
fn max_channel_delta(a: [u8; 3], b: [u8; 3]) -> u8 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x.abs_diff(y)).max().unwrap_or(0)
}

// ============================================================================
// DETECTION & KEYING
// ============================================================================

/// Look for a flat background color in the four corners.
///
/// Returns `None` when any corner is already (partly) transparent, or when
/// the corners disagree by more than `corner_tolerance` on any channel.
/// Otherwise returns the corners' average color.
pub fn detect_solid_background(raster: &RasterImage, thresholds: &DetectionThresholds) -> Option<Rgb<u8>> {
    if raster.is_empty() {
        return None;
    }
    let (w, h) = raster.dimensions();
    let corners = [
        raster.get_pixel(0, 0),
        raster.get_pixel(w - 1, 0),
        raster.get_pixel(0, h - 1),
        raster.get_pixel(w - 1, h - 1),
    ];
    if corners.iter().any(|p| p[3] < thresholds.opacity_threshold) {
        return None;
    }
    let rgb: Vec<[u8; 3]> = corners.iter().map(|p| [p[0], p[1], p[2]]).collect();
    for (i, a) in rgb.iter().enumerate() {
        for b in &rgb[i + 1..] {
            if max_channel_delta(*a, *b) > thresholds.corner_tolerance {
                return None;
            }
        }
    }
    let mut avg = [0u8; 3];
    for (c, out) in avg.iter_mut().enumerate() {
        let sum: u32 = rgb.iter().map(|p| p[c] as u32).sum();
        *out = ((sum + 2) / 4) as u8;
    }
    Some(Rgb(avg))
}

/// Make every pixel within `tolerance` of `color` fully transparent.
pub fn key_out_color(raster: &RasterImage, color: Rgb<u8>, tolerance: u8) -> RasterImage {
    let mut out = raster.to_rgba_image();
    out.as_mut().par_chunks_exact_mut(4).for_each(|px| {
        if max_channel_delta([px[0], px[1], px[2]], color.0) <= tolerance {
            px[3] = 0;
        }
    });
    RasterImage::new(out)
}

/// Repair a foreground whose "transparent" background came back as a flat
/// color. Foregrounds with real alpha are returned untouched.
pub fn clean_foreground(raster: &RasterImage, thresholds: &DetectionThresholds) -> RasterImage {
    match detect_solid_background(raster, thresholds) {
        Some(color) => {
            debug!(?color, tolerance = thresholds.key_tolerance, "keying out flat background");
            key_out_color(raster, color, thresholds.key_tolerance)
        }
        None => raster.clone(),
    }
}

// ============================================================================
// BACKGROUND FILL
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Fill the canvas, cropping the overflowing dimension symmetrically.
    #[default]
    Cover,
    /// Fit entirely inside the canvas, leaving transparent bars.
    Contain,
}

#[derive(Clone, Debug)]
pub enum BackgroundFill {
    Color(Rgba<u8>),
    /// A user-supplied image.
    Image(RasterImage),
    /// An image produced by the edit collaborator from a text prompt.
    Generated(RasterImage),
}

/// Scale `bg` to exactly `width × height`, cropping symmetrically instead of
/// letterboxing.
pub fn cover_fit(bg: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (bw, bh) = bg.dimensions();
    if bw == 0 || bh == 0 || width == 0 || height == 0 {
        return RgbaImage::new(width, height);
    }
    let target = width as f64 / height as f64;
    let source = bw as f64 / bh as f64;
    let (cx, cy, cw, ch) = if source > target {
        let cw = ((bh as f64 * target).round() as u32).clamp(1, bw);
        ((bw - cw) / 2, 0, cw, bh)
    } else {
        let ch = ((bw as f64 / target).round() as u32).clamp(1, bh);
        (0, (bh - ch) / 2, bw, ch)
    };
    let cropped = imageops::crop_imm(bg, cx, cy, cw, ch).to_image();
    resize_to(&cropped, width, height)
}

fn contain_fit(bg: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let (bw, bh) = bg.dimensions();
    let mut out = RgbaImage::new(width, height);
    if bw == 0 || bh == 0 || width == 0 || height == 0 {
        return out;
    }
    let scale = (width as f64 / bw as f64).min(height as f64 / bh as f64);
    let sw = ((bw as f64 * scale).round() as u32).clamp(1, width);
    let sh = ((bh as f64 * scale).round() as u32).clamp(1, height);
    let scaled = resize_to(bg, sw, sh);
    imageops::overlay(&mut out, &scaled, ((width - sw) / 2) as i64, ((height - sh) / 2) as i64);
    out
}

/// Place `foreground` (unmodified) over the given fill at the foreground's
/// size.
pub fn composite_onto_background(foreground: &RasterImage, fill: &BackgroundFill, fit: FitMode) -> RasterImage {
    let (w, h) = foreground.dimensions();
    let mut surface = match fill {
        BackgroundFill::Color(color) => RgbaImage::from_pixel(w, h, *color),
        BackgroundFill::Image(bg) | BackgroundFill::Generated(bg) => match fit {
            FitMode::Cover => cover_fit(bg.pixels(), w, h),
            FitMode::Contain => contain_fit(bg.pixels(), w, h),
        },
    };
    composite_onto(&mut surface, foreground.pixels(), 0, 0, BlendMode::Normal, 1.0);
    RasterImage::new(surface)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_corners(fill: Rgba<u8>, corners: [Rgba<u8>; 4]) -> RasterImage {
        let mut img = RgbaImage::from_pixel(10, 8, fill);
        img.put_pixel(0, 0, corners[0]);
        img.put_pixel(9, 0, corners[1]);
        img.put_pixel(0, 7, corners[2]);
        img.put_pixel(9, 7, corners[3]);
        RasterImage::new(img)
    }

    #[test]
    fn uniform_light_corners_are_detected() {
        let grey = Rgba([250, 250, 250, 255]);
        let img = with_corners(Rgba([10, 10, 10, 255]), [grey; 4]);
        let found = detect_solid_background(&img, &DetectionThresholds::default());
        assert_eq!(found, Some(Rgb([250, 250, 250])));
    }

    #[test]
    fn one_black_corner_means_no_background() {
        let grey = Rgba([250, 250, 250, 255]);
        let img = with_corners(grey, [grey, grey, grey, Rgba([0, 0, 0, 255])]);
        assert_eq!(detect_solid_background(&img, &DetectionThresholds::default()), None);
    }

    #[test]
    fn transparent_corner_means_alpha_is_already_correct() {
        let grey = Rgba([250, 250, 250, 255]);
        let img = with_corners(grey, [grey, grey, Rgba([250, 250, 250, 249]), grey]);
        assert_eq!(detect_solid_background(&img, &DetectionThresholds::default()), None);
    }

    #[test]
    fn corners_within_tolerance_still_match() {
        let img = with_corners(
            Rgba([0, 0, 0, 255]),
            [
                Rgba([240, 240, 240, 255]),
                Rgba([255, 250, 248, 255]),
                Rgba([245, 245, 245, 255]),
                Rgba([250, 250, 250, 255]),
            ],
        );
        assert!(detect_solid_background(&img, &DetectionThresholds::default()).is_some());
    }

    #[test]
    fn keying_only_touches_near_colors() {
        let mut img = RgbaImage::from_pixel(3, 1, Rgba([250, 250, 250, 255]));
        img.put_pixel(1, 0, Rgba([215, 230, 250, 255]));
        img.put_pixel(2, 0, Rgba([30, 60, 90, 255]));
        let keyed = key_out_color(&RasterImage::new(img), Rgb([250, 250, 250]), 40);
        assert_eq!(keyed.get_pixel(0, 0)[3], 0);
        assert_eq!(keyed.get_pixel(1, 0)[3], 0);
        assert_eq!(keyed.get_pixel(2, 0), Rgba([30, 60, 90, 255]));
    }

    #[test]
    fn cover_fit_crops_longer_dimension_symmetrically() {
        // 40×10: red | green (20 wide) | blue
        let bg = RgbaImage::from_fn(40, 10, |x, _| match x {
            0..=9 => Rgba([255, 0, 0, 255]),
            10..=29 => Rgba([0, 255, 0, 255]),
            _ => Rgba([0, 0, 255, 255]),
        });
        let out = cover_fit(&bg, 20, 10);
        assert_eq!(out.dimensions(), (20, 10));
        assert!(out.pixels().all(|p| *p == Rgba([0, 255, 0, 255])));
    }

    #[test]
    fn foreground_is_drawn_unmodified_over_fill() {
        let mut fg = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        fg.put_pixel(1, 1, Rgba([12, 34, 56, 255]));
        let fg = RasterImage::new(fg);
        let out = composite_onto_background(&fg, &BackgroundFill::Color(Rgba([200, 0, 0, 255])), FitMode::Cover);
        assert_eq!(out.get_pixel(1, 1), Rgba([12, 34, 56, 255]));
        assert_eq!(out.get_pixel(0, 0), Rgba([200, 0, 0, 255]));

        let bg = RasterImage::filled(100, 20, Rgba([0, 0, 200, 255]));
        let out = composite_onto_background(&fg, &BackgroundFill::Image(bg), FitMode::Cover);
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.get_pixel(3, 3), Rgba([0, 0, 200, 255]));
    }

    #[test]
    fn contain_fit_leaves_transparent_bars() {
        let fg = RasterImage::filled(10, 10, Rgba([0, 0, 0, 0]));
        let bg = RasterImage::filled(10, 2, Rgba([9, 9, 9, 255]));
        let out = composite_onto_background(&fg, &BackgroundFill::Generated(bg), FitMode::Contain);
        assert_eq!(out.get_pixel(5, 0)[3], 0);
        assert_eq!(out.get_pixel(5, 5), Rgba([9, 9, 9, 255]));
    }
}
