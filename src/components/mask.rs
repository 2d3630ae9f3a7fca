use egui::Pos2;
use image::{GrayImage, Luma, Rgb, Rgba, RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canvas::RasterImage;

// ============================================================================
// MASK TOOLS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskTool {
    #[default]
    Brush,
    Eraser,
    LinearGradient,
    RadialGradient,
}

impl MaskTool {
    pub fn is_gradient(&self) -> bool {
        matches!(self, MaskTool::LinearGradient | MaskTool::RadialGradient)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "brush" => Some(MaskTool::Brush),
            "eraser" => Some(MaskTool::Eraser),
            "linear" | "linear_gradient" | "linear-gradient" => Some(MaskTool::LinearGradient),
            "radial" | "radial_gradient" | "radial-gradient" => Some(MaskTool::RadialGradient),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrushSettings {
    /// Diameter in display pixels.
    pub size: f32,
    /// 0–100. At 100 the stamp is a flat disc; lower values feather the edge.
    pub hardness: f32,
    /// Working alpha of painted pixels, 0.0–1.0.
    pub opacity: f32,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self {
            size: 40.0,
            hardness: 100.0,
            opacity: 0.5,
        }
    }
}

impl BrushSettings {
    fn radius(&self) -> f32 {
        (self.size * 0.5).max(0.5)
    }

    fn alpha_u8(&self) -> u8 {
        (self.opacity.clamp(0.0, 1.0) * 255.0).round() as u8
    }
}

/// Coverage of a brush stamp at distance `d` from its center.
#[inline]
fn stamp_coverage(d: f32, radius: f32, hardness: f32) -> f32 {
    if d >= radius {
        return 0.0;
    }
    let inner = radius * (hardness.clamp(0.0, 100.0) / 100.0);
    if d <= inner {
        1.0
    } else {
        1.0 - (d - inner) / (radius - inner)
    }
}

struct ActiveStroke {
    tool: MaskTool,
    /// Mask alpha before the stroke began.
    snapshot: GrayImage,
    /// Per-pixel max coverage accumulated by this stroke (0–255).
    coverage: GrayImage,
    start: Pos2,
    last: Pos2,
}

// ============================================================================
// MASK COMPOSITOR
// ============================================================================

/// Translucent selection raster at display (working) resolution.
///
/// Strokes accumulate into a per-stroke coverage buffer which is combined
/// with a snapshot taken at stroke start, so overlapping stamps inside one
/// stroke never compound and gradient previews can be redrawn from scratch on
/// every pointer move.
pub struct MaskCompositor {
    alpha: GrayImage,
    color: Rgb<u8>,
    tool: MaskTool,
    brush: BrushSettings,
    stroke: Option<ActiveStroke>,
}

impl MaskCompositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            alpha: GrayImage::new(width, height),
            color: Rgb([255, 0, 80]),
            tool: MaskTool::default(),
            brush: BrushSettings::default(),
            stroke: None,
        }
    }

    pub fn with_settings(width: u32, height: u32, brush: BrushSettings, color: Rgb<u8>) -> Self {
        let mut mask = Self::new(width, height);
        mask.brush = brush;
        mask.color = color;
        mask
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.alpha.dimensions()
    }

    pub fn tool(&self) -> MaskTool {
        self.tool
    }

    pub fn set_tool(&mut self, tool: MaskTool) {
        self.tool = tool;
    }

    pub fn brush(&self) -> BrushSettings {
        self.brush
    }

    pub fn set_brush(&mut self, brush: BrushSettings) {
        self.brush = BrushSettings {
            size: brush.size.max(1.0),
            hardness: brush.hardness.clamp(0.0, 100.0),
            opacity: brush.opacity.clamp(0.0, 1.0),
        };
    }

    pub fn color(&self) -> Rgb<u8> {
        self.color
    }

    pub fn set_color(&mut self, color: Rgb<u8>) {
        self.color = color;
    }

    pub fn alpha(&self) -> &GrayImage {
        &self.alpha
    }

    pub fn is_stroking(&self) -> bool {
        self.stroke.is_some()
    }

    /// True when no pixel carries any alpha.
    pub fn is_empty(&self) -> bool {
        self.alpha.as_raw().par_iter().all(|&a| a == 0)
    }

    pub fn clear(&mut self) {
        self.stroke = None;
        self.alpha.as_mut().fill(0);
    }

    /// Rescale the working raster, e.g. when the displayed image size changes.
    pub fn resize_working(&mut self, width: u32, height: u32) {
        if self.alpha.dimensions() == (width, height) {
            return;
        }
        self.stroke = None;
        self.alpha = if width == 0 || height == 0 {
            GrayImage::new(width, height)
        } else {
            imageops::resize(&self.alpha, width, height, imageops::FilterType::Triangle)
        };
    }

    // ========================================================================
    // STROKES
    // ========================================================================

    pub fn begin_stroke(&mut self, tool: MaskTool, point: Pos2) {
        self.tool = tool;
        let (w, h) = self.alpha.dimensions();
        self.stroke = Some(ActiveStroke {
            tool,
            snapshot: self.alpha.clone(),
            coverage: GrayImage::new(w, h),
            start: point,
            last: point,
        });
        if !tool.is_gradient() {
            self.stamp_segment(point, point);
        }
        self.recomposite();
    }

    pub fn continue_stroke(&mut self, point: Pos2) {
        let Some(stroke) = self.stroke.as_ref() else { return };
        let (tool, from, start) = (stroke.tool, stroke.last, stroke.start);
        if tool.is_gradient() {
            self.draw_gradient(tool, start, point);
        } else {
            self.stamp_segment(from, point);
        }
        if let Some(stroke) = self.stroke.as_mut() {
            stroke.last = point;
        }
        self.recomposite();
    }

    pub fn end_stroke(&mut self) {
        if let Some(stroke) = self.stroke.take() {
            debug!(tool = ?stroke.tool, "mask stroke finished");
        }
    }

    /// Stamp discs along `from → to` into the stroke coverage buffer.
    fn stamp_segment(&mut self, from: Pos2, to: Pos2) {
        let radius = self.brush.radius();
        let hardness = self.brush.hardness;
        let Some(stroke) = self.stroke.as_mut() else { return };

        let distance = from.distance(to);
        let spacing = (radius * 0.25).max(1.0);
        let steps = (distance / spacing).ceil().max(0.0) as usize;
        for i in 0..=steps {
            let t = if steps == 0 { 0.0 } else { i as f32 / steps as f32 };
            let center = from.lerp(to, t);
            stamp_disc(&mut stroke.coverage, center, radius, hardness);
        }
    }

    /// Replace the stroke coverage with a full-strength gradient.
    fn draw_gradient(&mut self, tool: MaskTool, start: Pos2, end: Pos2) {
        let Some(stroke) = self.stroke.as_mut() else { return };
        let coverage = &mut stroke.coverage;
        coverage.as_mut().fill(0);

        let dx = end.x - start.x;
        let dy = end.y - start.y;
        let len_sq = dx * dx + dy * dy;
        if len_sq < 1e-6 {
            return;
        }
        let len = len_sq.sqrt();
        let width = coverage.width() as usize;
        if width == 0 {
            return;
        }

        coverage
            .as_mut()
            .par_chunks_exact_mut(width)
            .enumerate()
            .for_each(|(y, row)| {
                let py = y as f32 + 0.5;
                for (x, px) in row.iter_mut().enumerate() {
                    let px_f = x as f32 + 0.5;
                    let t = match tool {
                        MaskTool::RadialGradient => {
                            ((px_f - start.x).powi(2) + (py - start.y).powi(2)).sqrt() / len
                        }
                        _ => ((px_f - start.x) * dx + (py - start.y) * dy) / len_sq,
                    };
                    let strength = 1.0 - t.clamp(0.0, 1.0);
                    *px = (strength * 255.0).round() as u8;
                }
            });
    }

    /// mask = snapshot ⊕ coverage, according to the stroke's tool.
    fn recomposite(&mut self) {
        let Some(stroke) = self.stroke.as_ref() else { return };
        let paint = self.brush.alpha_u8() as f32 / 255.0;
        let erase = stroke.tool == MaskTool::Eraser;
        self.alpha
            .as_mut()
            .par_iter_mut()
            .zip(stroke.snapshot.as_raw().par_iter())
            .zip(stroke.coverage.as_raw().par_iter())
            .for_each(|((out, &base), &cov)| {
                let base = base as f32 / 255.0;
                let cov = cov as f32 / 255.0;
                let a = if erase {
                    // destination-out
                    base * (1.0 - cov)
                } else {
                    let top = cov * paint;
                    top + base * (1.0 - top)
                };
                *out = (a * 255.0).round().clamp(0.0, 255.0) as u8;
            });
    }

    // ========================================================================
    // EXTERNAL MASKS & EXPORT
    // ========================================================================

    /// Add a black/white segmentation mask (any size) to the current mask.
    /// Pixels brighter than 50% become painted at the working alpha; darker
    /// pixels leave the mask as it is.
    pub fn merge_external_mask(&mut self, mask: &RasterImage) {
        let (w, h) = self.alpha.dimensions();
        if w == 0 || h == 0 || mask.is_empty() {
            return;
        }
        let luma = imageops::grayscale(mask.pixels());
        let luma = if luma.dimensions() == (w, h) {
            luma
        } else {
            imageops::resize(&luma, w, h, imageops::FilterType::Triangle)
        };
        let paint = self.brush.alpha_u8() as f32 / 255.0;
        self.alpha
            .as_mut()
            .par_iter_mut()
            .zip(luma.as_raw().par_iter())
            .for_each(|(out, &l)| {
                if l >= 128 {
                    let base = *out as f32 / 255.0;
                    let a = paint + base * (1.0 - paint);
                    *out = (a * 255.0).round() as u8;
                }
            });
        debug!(src_w = mask.width(), src_h = mask.height(), "merged external mask");
    }

    /// Binary mask at natural resolution: any covered pixel is opaque white,
    /// everything else opaque black.
    pub fn export_binary_mask(&self, natural_width: u32, natural_height: u32) -> RasterImage {
        let scaled = if self.alpha.dimensions() == (natural_width, natural_height)
            || self.alpha.width() == 0
            || self.alpha.height() == 0
        {
            self.alpha.clone()
        } else {
            imageops::resize(&self.alpha, natural_width, natural_height, imageops::FilterType::Triangle)
        };
        let mut out = RgbaImage::from_pixel(natural_width, natural_height, Rgba([0, 0, 0, 255]));
        if scaled.dimensions() != (natural_width, natural_height) {
            return RasterImage::new(out);
        }
        out.as_mut()
            .par_chunks_exact_mut(4)
            .zip(scaled.as_raw().par_iter())
            .for_each(|(px, &a)| {
                if a > 0 {
                    px.copy_from_slice(&[255, 255, 255, 255]);
                }
            });
        RasterImage::new(out)
    }

    /// The mask tinted with its color, for drawing over the image.
    pub fn preview(&self) -> RgbaImage {
        let (w, h) = self.alpha.dimensions();
        let Rgb([r, g, b]) = self.color;
        let mut out = RgbaImage::new(w, h);
        out.as_mut()
            .par_chunks_exact_mut(4)
            .zip(self.alpha.as_raw().par_iter())
            .for_each(|(px, &a)| px.copy_from_slice(&[r, g, b, a]));
        out
    }
}

/// Max-accumulate one feathered disc into `coverage`.
fn stamp_disc(coverage: &mut GrayImage, center: Pos2, radius: f32, hardness: f32) {
    let (w, h) = coverage.dimensions();
    let x0 = (center.x - radius).floor().max(0.0) as u32;
    let y0 = (center.y - radius).floor().max(0.0) as u32;
    let x1 = ((center.x + radius).ceil().max(0.0) as u32).min(w);
    let y1 = ((center.y + radius).ceil().max(0.0) as u32).min(h);
    for y in y0..y1 {
        for x in x0..x1 {
            let d = Pos2::new(x as f32 + 0.5, y as f32 + 0.5).distance(center);
            let c = stamp_coverage(d, radius, hardness);
            if c <= 0.0 {
                continue;
            }
            let c = (c * 255.0).round() as u8;
            if c > coverage.get_pixel(x, y).0[0] {
                coverage.put_pixel(x, y, Luma([c]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_opacity(size: f32) -> BrushSettings {
        BrushSettings {
            size,
            hardness: 100.0,
            opacity: 1.0,
        }
    }

    fn all_pixels(raster: &RasterImage, value: [u8; 4]) -> bool {
        raster.pixels().pixels().all(|p| p.0 == value)
    }

    #[test]
    fn full_canvas_brush_exports_white_then_black_after_clear() {
        let mut mask = MaskCompositor::new(40, 30);
        mask.set_brush(full_opacity(200.0));
        mask.begin_stroke(MaskTool::Brush, Pos2::new(0.0, 0.0));
        mask.continue_stroke(Pos2::new(40.0, 30.0));
        mask.end_stroke();

        let exported = mask.export_binary_mask(400, 300);
        assert_eq!(exported.dimensions(), (400, 300));
        assert!(all_pixels(&exported, [255, 255, 255, 255]));

        mask.clear();
        assert!(mask.is_empty());
        assert!(all_pixels(&mask.export_binary_mask(400, 300), [0, 0, 0, 255]));
    }

    #[test]
    fn overlapping_stamps_in_one_stroke_do_not_compound() {
        let mut mask = MaskCompositor::new(20, 20);
        mask.set_brush(BrushSettings {
            size: 10.0,
            hardness: 100.0,
            opacity: 0.5,
        });
        mask.begin_stroke(MaskTool::Brush, Pos2::new(10.0, 10.0));
        for _ in 0..5 {
            mask.continue_stroke(Pos2::new(10.0, 10.0));
        }
        mask.end_stroke();
        assert_eq!(mask.alpha().get_pixel(10, 10).0[0], 128);
    }

    #[test]
    fn soft_brush_fades_towards_the_edge() {
        let mut mask = MaskCompositor::new(40, 40);
        mask.set_brush(BrushSettings {
            size: 30.0,
            hardness: 0.0,
            opacity: 1.0,
        });
        mask.begin_stroke(MaskTool::Brush, Pos2::new(20.0, 20.0));
        mask.end_stroke();
        let center = mask.alpha().get_pixel(20, 20).0[0];
        let near_edge = mask.alpha().get_pixel(33, 20).0[0];
        assert!(center > 200, "center={center}");
        assert!(near_edge < center / 2, "edge={near_edge}");
        assert_eq!(mask.alpha().get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn eraser_removes_alpha() {
        let mut mask = MaskCompositor::new(20, 20);
        mask.set_brush(full_opacity(100.0));
        mask.begin_stroke(MaskTool::Brush, Pos2::new(10.0, 10.0));
        mask.end_stroke();
        assert!(!mask.is_empty());
        mask.begin_stroke(MaskTool::Eraser, Pos2::new(10.0, 10.0));
        mask.end_stroke();
        assert!(mask.is_empty());
    }

    #[test]
    fn gradient_preview_is_redrawn_not_accumulated() {
        let mut once = MaskCompositor::new(50, 10);
        once.set_brush(full_opacity(1.0));
        once.begin_stroke(MaskTool::LinearGradient, Pos2::new(0.0, 5.0));
        once.continue_stroke(Pos2::new(50.0, 5.0));
        once.end_stroke();

        let mut wiggled = MaskCompositor::new(50, 10);
        wiggled.set_brush(full_opacity(1.0));
        wiggled.begin_stroke(MaskTool::LinearGradient, Pos2::new(0.0, 5.0));
        for x in [10.0, 45.0, 30.0, 50.0, 50.0] {
            wiggled.continue_stroke(Pos2::new(x, 5.0));
        }
        wiggled.end_stroke();

        assert_eq!(once.alpha(), wiggled.alpha());
        assert!(once.alpha().get_pixel(0, 5).0[0] > 240);
        assert!(once.alpha().get_pixel(49, 5).0[0] < 10);
    }

    #[test]
    fn zero_length_gradient_draws_nothing() {
        let mut mask = MaskCompositor::new(10, 10);
        mask.begin_stroke(MaskTool::RadialGradient, Pos2::new(5.0, 5.0));
        mask.continue_stroke(Pos2::new(5.0, 5.0));
        mask.end_stroke();
        assert!(mask.is_empty());
    }

    #[test]
    fn external_mask_is_thresholded_and_added() {
        let mut mask = MaskCompositor::new(4, 2);
        mask.set_brush(full_opacity(1.0));
        let mut src = RgbaImage::from_pixel(4, 2, Rgba([0, 0, 0, 255]));
        src.put_pixel(0, 0, Rgba([255, 255, 255, 255]));
        src.put_pixel(1, 0, Rgba([140, 140, 140, 255]));
        src.put_pixel(2, 0, Rgba([100, 100, 100, 255]));
        mask.merge_external_mask(&RasterImage::new(src));
        assert_eq!(mask.alpha().get_pixel(0, 0).0[0], 255);
        assert_eq!(mask.alpha().get_pixel(1, 0).0[0], 255);
        assert_eq!(mask.alpha().get_pixel(2, 0).0[0], 0);
        assert_eq!(mask.alpha().get_pixel(3, 1).0[0], 0);
    }

    #[test]
    fn external_mask_only_adds_to_existing_alpha() {
        let mut mask = MaskCompositor::new(20, 20);
        mask.set_brush(BrushSettings {
            size: 100.0,
            hardness: 100.0,
            opacity: 0.5,
        });
        mask.begin_stroke(MaskTool::Brush, Pos2::new(10.0, 10.0));
        mask.end_stroke();
        let before = mask.alpha().clone();
        assert_eq!(before.get_pixel(5, 5).0[0], 128);

        // White left half, black right half.
        let src = RgbaImage::from_fn(20, 20, |x, _| {
            if x < 10 { Rgba([255, 255, 255, 255]) } else { Rgba([0, 0, 0, 255]) }
        });
        mask.merge_external_mask(&RasterImage::new(src));

        for (x, y, after) in mask.alpha().enumerate_pixels() {
            let was = before.get_pixel(x, y).0[0];
            assert!(after.0[0] >= was, "({x},{y}) dropped from {was} to {}", after.0[0]);
        }
        assert!(mask.alpha().get_pixel(2, 10).0[0] > 128);
        assert_eq!(mask.alpha().get_pixel(17, 10).0[0], 128);
    }

    #[test]
    fn radial_gradient_falls_off_to_zero_at_radius() {
        let mut mask = MaskCompositor::new(41, 41);
        mask.set_brush(full_opacity(1.0));
        mask.begin_stroke(MaskTool::RadialGradient, Pos2::new(20.5, 20.5));
        mask.continue_stroke(Pos2::new(40.5, 20.5));
        mask.end_stroke();

        let alpha = mask.alpha();
        assert_eq!(alpha.get_pixel(20, 20).0[0], 255);
        let halfway = alpha.get_pixel(30, 20).0[0];
        assert!((120..=136).contains(&halfway), "halfway={halfway}");
        assert_eq!(alpha.get_pixel(40, 20).0[0], 0);
        assert_eq!(alpha.get_pixel(20, 0).0[0], 0);
        assert_eq!(alpha.get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn tool_names_parse() {
        assert_eq!(MaskTool::from_name("radial"), Some(MaskTool::RadialGradient));
        assert_eq!(MaskTool::from_name("Eraser"), Some(MaskTool::Eraser));
        assert_eq!(MaskTool::from_name("lasso"), None);
    }
}
