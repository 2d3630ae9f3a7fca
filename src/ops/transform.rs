// ============================================================================
// TRANSFORM OPERATIONS: crop + straighten, quarter turns, flips
// ============================================================================

use egui::{Pos2, Vec2};
use image::{Rgba, RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canvas::{RasterImage, bilinear_sample};
use crate::io::MAX_RASTER_DIM;

/// Straightening is limited to small angles; larger turns use quarter turns.
pub const MAX_STRAIGHTEN_DEGREES: f32 = 45.0;

pub fn clamp_straighten(degrees: f32) -> f32 {
    if degrees.is_finite() {
        degrees.clamp(-MAX_STRAIGHTEN_DEGREES, MAX_STRAIGHTEN_DEGREES)
    } else {
        0.0
    }
}

/// Crop rectangle in displayed-image pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl CropRegion {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle spanned by two drag corners, in any order.
    pub fn from_corners(a: Pos2, b: Pos2) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    /// The whole displayed image.
    pub fn full(display_size: Vec2) -> Self {
        Self::new(0.0, 0.0, display_size.x, display_size.y)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Intersect with `[0, display_size]`.
    pub fn clamped_to(&self, display_size: Vec2) -> Self {
        let x0 = self.x.clamp(0.0, display_size.x);
        let y0 = self.y.clamp(0.0, display_size.y);
        let x1 = (self.x + self.width).clamp(0.0, display_size.x);
        let y1 = (self.y + self.height).clamp(0.0, display_size.y);
        Self::new(x0, y0, (x1 - x0).max(0.0), (y1 - y0).max(0.0))
    }
}

// ---------------------------------------------------------------------------
//  Crop + rotate
// ---------------------------------------------------------------------------

/// Crop and rotate `image`.
///
/// `region` is in display pixels, `scale` converts display to natural pixels
/// per axis and `dpr` is the device pixel ratio. The output is
/// `floor(region.w * scale.x * dpr) × floor(region.h * scale.y * dpr)`, each
/// side capped at [`MAX_RASTER_DIM`].
/// Rotation is clockwise around the center of the *uncropped* image, so
/// straightening and cropping compose regardless of where the crop sits.
///
/// A missing or zero-area region means the whole displayed image.
pub fn crop_rotate(
    image: &RasterImage,
    region: Option<CropRegion>,
    rotation_degrees: f32,
    scale: Vec2,
    dpr: f32,
) -> RasterImage {
    let (w, h) = image.dimensions();
    let sx = if scale.x > 0.0 { scale.x as f64 } else { 1.0 };
    let sy = if scale.y > 0.0 { scale.y as f64 } else { 1.0 };
    let dpr = if dpr > 0.0 { dpr as f64 } else { 1.0 };
    let rotation = if rotation_degrees.is_finite() { rotation_degrees as f64 } else { 0.0 };

    let region = match region {
        Some(r) if !r.is_empty() => r,
        _ => {
            if rotation == 0.0 && dpr == 1.0 {
                return image.clone();
            }
            CropRegion::full(Vec2::new((w as f64 / sx) as f32, (h as f64 / sy) as f32))
        }
    };

    let max_dim = MAX_RASTER_DIM as f64;
    let out_w = (region.width as f64 * sx * dpr).floor().clamp(0.0, max_dim) as u32;
    let out_h = (region.height as f64 * sy * dpr).floor().clamp(0.0, max_dim) as u32;
    let origin = (region.x as f64 * sx, region.y as f64 * sy);

    if rotation == 0.0 && dpr == 1.0 && origin == (0.0, 0.0) && (out_w, out_h) == (w, h) {
        return image.clone();
    }

    let mut dst = RgbaImage::new(out_w, out_h);
    if out_w == 0 || out_h == 0 || image.is_empty() {
        return RasterImage::new(dst);
    }

    let src = image.pixels();
    let (cx, cy) = (w as f64 * 0.5, h as f64 * 0.5);
    let (sin, cos) = rotation.to_radians().sin_cos();
    let inv_dpr = 1.0 / dpr;

    // Inverse mapping on pixel centers:
    //   src = c + R⁻¹ · (out / dpr + crop_origin - c)
    let row_bytes = out_w as usize * 4;
    dst.as_mut().par_chunks_mut(row_bytes).enumerate().for_each(|(oy, row)| {
        let vy = (oy as f64 + 0.5) * inv_dpr + origin.1 - cy;
        for ox in 0..out_w as usize {
            let vx = (ox as f64 + 0.5) * inv_dpr + origin.0 - cx;
            let src_x = cos * vx + sin * vy + cx - 0.5;
            let src_y = -sin * vx + cos * vy + cy - 0.5;
            let px = sample_footprint(src, src_x as f32, src_y as f32);
            row[ox * 4..ox * 4 + 4].copy_from_slice(&px.0);
        }
    });

    debug!(
        out_w,
        out_h,
        rotation,
        crop_x = region.x,
        crop_y = region.y,
        "crop/rotate applied"
    );
    RasterImage::new(dst)
}

/// Bilinear sample that replicates edge pixels inside the image footprint
/// and is transparent outside it.
fn sample_footprint(img: &RgbaImage, x: f32, y: f32) -> Rgba<u8> {
    let max_x = img.width() as f32 - 1.0;
    let max_y = img.height() as f32 - 1.0;
    if x < -0.5 || y < -0.5 || x > max_x + 0.5 || y > max_y + 0.5 {
        return Rgba([0, 0, 0, 0]);
    }
    bilinear_sample(img, x.clamp(0.0, max_x), y.clamp(0.0, max_y))
}

// ---------------------------------------------------------------------------
//  Exact transforms
// ---------------------------------------------------------------------------

/// Rotate by `turns × 90°` clockwise (negative turns rotate counter-clockwise).
pub fn rotate_quarter_turns(image: &RasterImage, turns: i32) -> RasterImage {
    match turns.rem_euclid(4) {
        1 => RasterImage::new(imageops::rotate90(image.pixels())),
        2 => RasterImage::new(imageops::rotate180(image.pixels())),
        3 => RasterImage::new(imageops::rotate270(image.pixels())),
        _ => image.clone(),
    }
}

/// Mirror left↔right.
pub fn flip_horizontal(image: &RasterImage) -> RasterImage {
    RasterImage::new(imageops::flip_horizontal(image.pixels()))
}

/// Mirror top↔bottom.
pub fn flip_vertical(image: &RasterImage) -> RasterImage {
    RasterImage::new(imageops::flip_vertical(image.pixels()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(w: u32, h: u32) -> RasterImage {
        RasterImage::new(RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x % 251) as u8, (y % 241) as u8, ((x * 3 + y) % 256) as u8, 255])
        }))
    }

    #[test]
    fn crop_at_zero_degrees_is_exact() {
        let src = pattern(800, 600);
        let out = crop_rotate(
            &src,
            Some(CropRegion::new(100.0, 100.0, 400.0, 300.0)),
            0.0,
            Vec2::splat(1.0),
            1.0,
        );
        assert_eq!(out.dimensions(), (400, 300));
        assert_eq!(out.get_pixel(0, 0), src.get_pixel(100, 100));
        assert_eq!(out.get_pixel(399, 299), src.get_pixel(499, 399));
        assert_eq!(out.get_pixel(17, 250), src.get_pixel(117, 350));
    }

    #[test]
    fn display_scale_maps_region_to_natural_pixels() {
        // Displayed at half size: display→natural scale is 2.
        let src = pattern(200, 100);
        let out = crop_rotate(
            &src,
            Some(CropRegion::new(10.0, 5.0, 20.0, 10.0)),
            0.0,
            Vec2::splat(2.0),
            1.0,
        );
        assert_eq!(out.dimensions(), (40, 20));
        assert_eq!(out.get_pixel(0, 0), src.get_pixel(20, 10));
    }

    #[test]
    fn full_frame_without_rotation_is_a_copy() {
        let src = pattern(31, 17);
        let out = crop_rotate(&src, None, 0.0, Vec2::splat(1.0), 1.0);
        assert_eq!(out, src);
        let zero_area = crop_rotate(&src, Some(CropRegion::default()), 0.0, Vec2::splat(1.0), 1.0);
        assert_eq!(zero_area, src);
        let explicit = crop_rotate(&src, Some(CropRegion::new(0.0, 0.0, 31.0, 17.0)), 0.0, Vec2::splat(1.0), 1.0);
        assert_eq!(explicit, src);
    }

    #[test]
    fn device_pixel_ratio_scales_output() {
        let src = RasterImage::filled(10, 6, Rgba([7, 8, 9, 255]));
        let out = crop_rotate(&src, None, 0.0, Vec2::splat(1.0), 2.0);
        assert_eq!(out.dimensions(), (20, 12));
        assert!(out.pixels().pixels().all(|p| *p == Rgba([7, 8, 9, 255])));
    }

    #[test]
    fn quarter_rotation_matches_exact_turn() {
        let src = pattern(12, 12);
        let rotated = crop_rotate(&src, None, 90.0, Vec2::splat(1.0), 1.0);
        assert_eq!(rotated, rotate_quarter_turns(&src, 1));
        let half = crop_rotate(&src, None, 180.0, Vec2::splat(1.0), 1.0);
        assert_eq!(half, rotate_quarter_turns(&src, 2));
    }

    #[test]
    fn straightening_leaves_transparent_corners() {
        let src = RasterImage::filled(100, 100, Rgba([255, 255, 255, 255]));
        let out = crop_rotate(&src, None, 30.0, Vec2::splat(1.0), 1.0);
        assert_eq!(out.dimensions(), (100, 100));
        assert_eq!(out.get_pixel(0, 0)[3], 0);
        assert_eq!(out.get_pixel(50, 50), Rgba([255, 255, 255, 255]));
        assert_eq!(clamp_straighten(80.0), 45.0);
        assert_eq!(clamp_straighten(f32::NAN), 0.0);
    }

    #[test]
    fn quarter_turns_and_flips() {
        let src = pattern(5, 3);
        assert_eq!(rotate_quarter_turns(&src, 1).dimensions(), (3, 5));
        assert_eq!(rotate_quarter_turns(&src, -1), rotate_quarter_turns(&src, 3));
        assert_eq!(rotate_quarter_turns(&src, 4), src);
        assert_eq!(flip_horizontal(&src).get_pixel(0, 0), src.get_pixel(4, 0));
        assert_eq!(flip_vertical(&flip_vertical(&src)), src);
    }

    #[test]
    fn crop_region_helpers() {
        let r = CropRegion::from_corners(Pos2::new(50.0, 10.0), Pos2::new(20.0, 40.0));
        assert_eq!(r, CropRegion::new(20.0, 10.0, 30.0, 30.0));
        let c = CropRegion::new(-10.0, 5.0, 50.0, 100.0).clamped_to(Vec2::new(30.0, 60.0));
        assert_eq!(c, CropRegion::new(0.0, 5.0, 30.0, 55.0));
        assert!(CropRegion::new(1.0, 1.0, 0.0, 5.0).is_empty());
    }

    #[test]
    fn oversized_region_output_is_capped() {
        let img = pattern(8, 8);
        let out = crop_rotate(
            &img,
            Some(CropRegion::new(0.0, 0.0, 1.0e9, 1.0)),
            0.0,
            Vec2::splat(1.0),
            1.0,
        );
        assert_eq!(out.dimensions(), (MAX_RASTER_DIM, 1));
        assert_eq!(out.get_pixel(0, 0), img.get_pixel(0, 0));
        assert_eq!(out.get_pixel(MAX_RASTER_DIM - 1, 0)[3], 0);
    }
}
