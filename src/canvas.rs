use std::sync::Arc;

use image::{Rgba, RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// ============================================================================
// RASTER IMAGE – immutable, cheaply clonable pixel snapshot
// ============================================================================

/// An immutable raster: natural width/height plus RGBA pixels.
///
/// Pixels live behind an `Arc`, so cloning a `RasterImage` only bumps a
/// reference count. Every edit produces a new `RasterImage`; nothing ever
/// mutates one in place. The pixel buffer is released when the last owner
/// (a history entry, an overlay layer, a pending request) is dropped.
#[derive(Clone, Debug)]
pub struct RasterImage {
    pixels: Arc<RgbaImage>,
}

impl RasterImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self { pixels: Arc::new(pixels) }
    }

    /// A raster filled with a single colour.
    pub fn filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, color))
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

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> Rgba<u8> {
        *self.pixels.get_pixel(x, y)
    }

    /// Owned copy of the pixels, for building a new raster from this one.
    pub fn to_rgba_image(&self) -> RgbaImage {
        self.pixels.as_ref().clone()
    }

    /// True when both handles point at the same pixel buffer.
    pub fn shares_pixels_with(&self, other: &RasterImage) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }

    /// Uncompressed size in bytes (4 bytes per RGBA pixel).
    pub fn memory_bytes(&self) -> usize {
        self.pixels.as_raw().len()
    }
}

impl From<RgbaImage> for RasterImage {
    fn from(pixels: RgbaImage) -> Self {
        Self::new(pixels)
    }
}

impl PartialEq for RasterImage {
    fn eq(&self, other: &Self) -> bool {
        self.shares_pixels_with(other)
            || (self.dimensions() == other.dimensions()
                && self.pixels.as_raw() == other.pixels.as_raw())
    }
}

impl Eq for RasterImage {}

// ============================================================================
// BLEND MODES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Additive,
    Reflect,
    Glow,
    ColorBurn,
    ColorDodge,
    Overlay,
    Difference,
    Negation,
    Lighten,
    Darken,
    Xor,
    Overwrite,
    HardLight,
    SoftLight,
    Exclusion,
    Subtract,
    Divide,
    LinearBurn,
    VividLight,
    LinearLight,
    PinLight,
    HardMix,
}

impl BlendMode {
    /// Every blend mode, in the order a layer panel lists them.
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Additive,
            BlendMode::Overlay,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Lighten,
            BlendMode::Darken,
            BlendMode::ColorBurn,
            BlendMode::ColorDodge,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Negation,
            BlendMode::Reflect,
            BlendMode::Glow,
            BlendMode::Subtract,
            BlendMode::Divide,
            BlendMode::LinearBurn,
            BlendMode::VividLight,
            BlendMode::LinearLight,
            BlendMode::PinLight,
            BlendMode::HardMix,
            BlendMode::Xor,
            BlendMode::Overwrite,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Additive => "Additive",
            BlendMode::Reflect => "Reflect",
            BlendMode::Glow => "Glow",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::Overlay => "Overlay",
            BlendMode::Difference => "Difference",
            BlendMode::Negation => "Negation",
            BlendMode::Lighten => "Lighten",
            BlendMode::Darken => "Darken",
            BlendMode::Xor => "Xor",
            BlendMode::Overwrite => "Overwrite",
            BlendMode::HardLight => "Hard Light",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::Exclusion => "Exclusion",
            BlendMode::Subtract => "Subtract",
            BlendMode::Divide => "Divide",
            BlendMode::LinearBurn => "Linear Burn",
            BlendMode::VividLight => "Vivid Light",
            BlendMode::LinearLight => "Linear Light",
            BlendMode::PinLight => "Pin Light",
            BlendMode::HardMix => "Hard Mix",
        }
    }

    /// Parse a blend mode from its display name or a CSS-style keyword
    /// (`"color-dodge"`, `"hard light"`, `"multiply"` …). Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::all().iter().copied().find(|mode| {
            let candidate: String = mode
                .name()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            candidate == wanted
        })
    }
}

// ============================================================================
// PIXEL BLENDING
// ============================================================================

/// Blend `top` over `base` with the given mode and layer opacity.
/// Operates on straight (non-premultiplied) RGBA.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel, nothing to blend
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }

    // Fast path: Normal blend, full opacity, fully opaque top pixel, just overwrite
    if matches!(mode, BlendMode::Normal) && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    match mode {
        BlendMode::Overwrite => {
            return Rgba([top[0], top[1], top[2], to_u8(top_a)]);
        }
        BlendMode::Xor => {
            let xor_a = base_a * (1.0 - top_a) + top_a * (1.0 - base_a);
            if xor_a == 0.0 {
                return Rgba([0, 0, 0, 0]);
            }
            let mix = |b: f32, t: f32| (b * base_a * (1.0 - top_a) + t * top_a * (1.0 - base_a)) / xor_a;
            return Rgba([
                to_u8(mix(base_r, top_r)),
                to_u8(mix(base_g, top_g)),
                to_u8(mix(base_b, top_b)),
                to_u8(xor_a),
            ]);
        }
        _ => {}
    }

    let (r, g, b) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        BlendMode::Additive => (
            (base_r + top_r).min(1.0),
            (base_g + top_g).min(1.0),
            (base_b + top_b).min(1.0),
        ),
        BlendMode::Overlay => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, overlay_channel),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Difference => ((base_r - top_r).abs(), (base_g - top_g).abs(), (base_b - top_b).abs()),
        BlendMode::Negation => (
            1.0 - (1.0 - base_r - top_r).abs(),
            1.0 - (1.0 - base_g - top_g).abs(),
            1.0 - (1.0 - base_b - top_b).abs(),
        ),
        BlendMode::ColorBurn => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, color_burn_channel),
        BlendMode::ColorDodge => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, color_dodge_channel),
        BlendMode::Reflect => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, reflect_channel),
        BlendMode::Glow => per_channel(top_r, top_g, top_b, base_r, base_g, base_b, reflect_channel),
        BlendMode::HardLight => per_channel(top_r, top_g, top_b, base_r, base_g, base_b, overlay_channel),
        BlendMode::SoftLight => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, soft_light_channel),
        BlendMode::Exclusion => (
            base_r + top_r - 2.0 * base_r * top_r,
            base_g + top_g - 2.0 * base_g * top_g,
            base_b + top_b - 2.0 * base_b * top_b,
        ),
        BlendMode::Subtract => (
            (base_r - top_r).max(0.0),
            (base_g - top_g).max(0.0),
            (base_b - top_b).max(0.0),
        ),
        BlendMode::Divide => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, divide_channel),
        BlendMode::LinearBurn => (
            (base_r + top_r - 1.0).max(0.0),
            (base_g + top_g - 1.0).max(0.0),
            (base_b + top_b - 1.0).max(0.0),
        ),
        BlendMode::VividLight => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, vivid_light_channel),
        BlendMode::LinearLight => (
            (base_r + 2.0 * top_r - 1.0).clamp(0.0, 1.0),
            (base_g + 2.0 * top_g - 1.0).clamp(0.0, 1.0),
            (base_b + 2.0 * top_b - 1.0).clamp(0.0, 1.0),
        ),
        BlendMode::PinLight => per_channel(base_r, base_g, base_b, top_r, top_g, top_b, pin_light_channel),
        BlendMode::HardMix => (
            if base_r + top_r >= 1.0 { 1.0 } else { 0.0 },
            if base_g + top_g >= 1.0 { 1.0 } else { 0.0 },
            if base_b + top_b >= 1.0 { 1.0 } else { 0.0 },
        ),
        // Handled by the early returns above.
        BlendMode::Xor | BlendMode::Overwrite => (top_r, top_g, top_b),
    };

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([to_u8(out_r), to_u8(out_g), to_u8(out_b), to_u8(out_a)])
}

#[inline]
fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
fn per_channel(
    ar: f32,
    ag: f32,
    ab: f32,
    br: f32,
    bg: f32,
    bb: f32,
    f: fn(f32, f32) -> f32,
) -> (f32, f32, f32) {
    (f(ar, br), f(ag, bg), f(ab, bb))
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if top == 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

fn reflect_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base * base / (1.0 - top)).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

fn divide_channel(base: f32, top: f32) -> f32 {
    if top <= 0.0 { 1.0 } else { (base / top).min(1.0) }
}

fn vivid_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        color_burn_channel(base, 2.0 * top)
    } else {
        color_dodge_channel(base, 2.0 * (top - 0.5))
    }
}

fn pin_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base.min(2.0 * top)
    } else {
        base.max(2.0 * (top - 0.5))
    }
}

// ============================================================================
// SURFACE OPERATIONS
// ============================================================================

/// Draw `src` onto `dst` with its top-left corner at `(dst_x, dst_y)`,
/// clipped to the destination bounds.
pub fn composite_onto(
    dst: &mut RgbaImage,
    src: &RgbaImage,
    dst_x: i64,
    dst_y: i64,
    mode: BlendMode,
    opacity: f32,
) {
    let dst_w = dst.width() as i64;
    let dst_h = dst.height() as i64;
    let x0 = dst_x.max(0);
    let y0 = dst_y.max(0);
    let x1 = (dst_x + src.width() as i64).min(dst_w);
    let y1 = (dst_y + src.height() as i64).min(dst_h);
    if x0 >= x1 || y0 >= y1 || opacity <= 0.0 {
        return;
    }

    let row_bytes = dst_w as usize * 4;
    dst.as_mut()
        .par_chunks_exact_mut(row_bytes)
        .enumerate()
        .skip(y0 as usize)
        .take((y1 - y0) as usize)
        .for_each(|(y, row)| {
            let sy = (y as i64 - dst_y) as u32;
            for x in x0..x1 {
                let sx = (x - dst_x) as u32;
                let top = *src.get_pixel(sx, sy);
                let idx = x as usize * 4;
                let base = Rgba([row[idx], row[idx + 1], row[idx + 2], row[idx + 3]]);
                let out = blend_pixel(base, top, mode, opacity);
                row[idx..idx + 4].copy_from_slice(&out.0);
            }
        });
}

/// Resize only when the target differs from the source size.
pub fn resize_to(src: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let width = width.max(1);
    let height = height.max(1);
    if src.dimensions() == (width, height) {
        src.clone()
    } else {
        imageops::resize(src, width, height, imageops::FilterType::Triangle)
    }
}

/// Bilinear interpolation sampling from an RgbaImage. Samples outside the
/// image read as fully transparent.
pub fn bilinear_sample(img: &RgbaImage, x: f32, y: f32) -> Rgba<u8> {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let (w, h) = (img.width() as i64, img.height() as i64);

    let sample = |sx: i64, sy: i64| -> [f32; 4] {
        if sx < 0 || sy < 0 || sx >= w || sy >= h {
            [0.0; 4]
        } else {
            let p = img.get_pixel(sx as u32, sy as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32, p[3] as f32]
        }
    };

    let tl = sample(x0, y0);
    let tr = sample(x0 + 1, y0);
    let bl = sample(x0, y0 + 1);
    let br = sample(x0 + 1, y0 + 1);

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = lerp(tl[c], tr[c], fx);
        let bot = lerp(bl[c], br[c], fx);
        out[c] = lerp(top, bot, fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_blend_at_full_opacity_replaces_opaque_pixels() {
        let out = blend_pixel(Rgba([10, 20, 30, 255]), Rgba([200, 100, 50, 255]), BlendMode::Normal, 1.0);
        assert_eq!(out, Rgba([200, 100, 50, 255]));
    }

    #[test]
    fn half_opacity_normal_blend_mixes_evenly() {
        let out = blend_pixel(Rgba([0, 0, 0, 255]), Rgba([255, 255, 255, 255]), BlendMode::Normal, 0.5);
        assert!((127..=128).contains(&out[0]), "got {:?}", out);
        assert_eq!(out[3], 255);
    }

    #[test]
    fn multiply_with_white_is_identity() {
        let base = Rgba([40, 80, 120, 255]);
        let out = blend_pixel(base, Rgba([255, 255, 255, 255]), BlendMode::Multiply, 1.0);
        assert_eq!(out, base);
    }

    #[test]
    fn screen_with_black_is_identity() {
        let base = Rgba([40, 80, 120, 255]);
        let out = blend_pixel(base, Rgba([0, 0, 0, 255]), BlendMode::Screen, 1.0);
        assert_eq!(out, base);
    }

    #[test]
    fn transparent_top_leaves_base_untouched() {
        let base = Rgba([1, 2, 3, 4]);
        for mode in BlendMode::all() {
            assert_eq!(blend_pixel(base, Rgba([9, 9, 9, 0]), *mode, 1.0), base, "{:?}", mode);
        }
    }

    #[test]
    fn blend_mode_names_round_trip_through_parser() {
        for mode in BlendMode::all() {
            assert_eq!(BlendMode::from_name(mode.name()), Some(*mode));
        }
        assert_eq!(BlendMode::from_name("color-dodge"), Some(BlendMode::ColorDodge));
        assert_eq!(BlendMode::from_name("nope"), None);
    }

    #[test]
    fn composite_onto_clips_to_destination() {
        let mut dst = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        let src = RgbaImage::from_pixel(3, 3, Rgba([255, 0, 0, 255]));
        composite_onto(&mut dst, &src, 2, -1, BlendMode::Normal, 1.0);
        assert_eq!(*dst.get_pixel(2, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(*dst.get_pixel(3, 1), Rgba([255, 0, 0, 255]));
        assert_eq!(*dst.get_pixel(3, 2), Rgba([0, 0, 0, 255]));
        assert_eq!(*dst.get_pixel(1, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn bilinear_sample_at_integer_coordinates_is_exact() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([10, 20, 30, 255]));
        img.put_pixel(1, 0, Rgba([200, 200, 200, 255]));
        assert_eq!(bilinear_sample(&img, 0.0, 0.0), Rgba([10, 20, 30, 255]));
        assert_eq!(bilinear_sample(&img, 1.0, 0.0), Rgba([200, 200, 200, 255]));
        assert_eq!(bilinear_sample(&img, -3.0, 0.0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn raster_equality_compares_pixels() {
        let a = RasterImage::filled(2, 2, Rgba([1, 2, 3, 255]));
        let b = RasterImage::filled(2, 2, Rgba([1, 2, 3, 255]));
        let c = RasterImage::filled(2, 2, Rgba([9, 2, 3, 255]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.clone().shares_pixels_with(&a));
    }
}
