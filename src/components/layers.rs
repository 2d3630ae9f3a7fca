use image::imageops;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canvas::{BlendMode, RasterImage, composite_onto};

pub const DEFAULT_LAYER_SIZE: f32 = 50.0;
pub const DEFAULT_LAYER_POSITION: (f32, f32) = (25.0, 25.0);

/// An overlay drawn on top of the base image when the stack is flattened.
#[derive(Clone, Debug)]
pub struct OverlayLayer {
    pub id: u64,
    pub name: String,
    pub raster: RasterImage,
    /// 0.0–1.0.
    pub opacity: f32,
    /// Drawn width as a percentage of the base width. Height follows the
    /// layer's own aspect ratio.
    pub relative_size: f32,
    /// Top-left corner as percentages of the base width/height.
    pub position: (f32, f32),
    pub blend_mode: BlendMode,
    pub visible: bool,
}

impl OverlayLayer {
    /// Drawn rectangle `(x, y, w, h)` in base pixels.
    pub fn placement(&self, base_width: u32, base_height: u32) -> (i64, i64, u32, u32) {
        let w = (self.relative_size / 100.0 * base_width as f32).round().max(1.0);
        let aspect = if self.raster.width() == 0 {
            1.0
        } else {
            self.raster.height() as f32 / self.raster.width() as f32
        };
        let h = (w * aspect).round().max(1.0);
        let x = (self.position.0 / 100.0 * base_width as f32).round() as i64;
        let y = (self.position.1 / 100.0 * base_height as f32).round() as i64;
        (x, y, w as u32, h as u32)
    }
}

/// Serializable layer properties (no pixels), for session snapshots and logs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub id: u64,
    pub name: String,
    pub opacity: f32,
    pub relative_size: f32,
    pub position: (f32, f32),
    pub blend_mode: BlendMode,
    pub visible: bool,
}

impl From<&OverlayLayer> for LayerInfo {
    fn from(layer: &OverlayLayer) -> Self {
        Self {
            id: layer.id,
            name: layer.name.clone(),
            opacity: layer.opacity,
            relative_size: layer.relative_size,
            position: layer.position,
            blend_mode: layer.blend_mode,
            visible: layer.visible,
        }
    }
}

// ============================================================================
// LAYER STACK
// ============================================================================

/// Ordered overlay list. Index 0 is painted first (bottom); list order is the
/// only z-order.
#[derive(Default)]
pub struct LayerStack {
    layers: Vec<OverlayLayer>,
    next_id: u64,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new layer on top and return its id. Ids are never reused.
    pub fn add(&mut self, name: impl Into<String>, raster: RasterImage) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.layers.push(OverlayLayer {
            id,
            name: name.into(),
            raster,
            opacity: 1.0,
            relative_size: DEFAULT_LAYER_SIZE,
            position: DEFAULT_LAYER_POSITION,
            blend_mode: BlendMode::Normal,
            visible: true,
        });
        debug!(id, count = self.layers.len(), "layer added");
        id
    }

    /// Remove a layer; its raster is released once nothing else holds it.
    pub fn remove(&mut self, id: u64) -> Option<OverlayLayer> {
        let index = self.index_of(id)?;
        Some(self.layers.remove(index))
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[OverlayLayer] {
        &self.layers
    }

    pub fn iter(&self) -> impl Iterator<Item = &OverlayLayer> {
        self.layers.iter()
    }

    pub fn get(&self, id: u64) -> Option<&OverlayLayer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut OverlayLayer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    pub fn index_of(&self, id: u64) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    /// Move a layer to `index` (clamped to the list).
    pub fn move_to(&mut self, id: u64, index: usize) -> bool {
        let Some(from) = self.index_of(id) else { return false };
        let to = index.min(self.layers.len() - 1);
        if from != to {
            let layer = self.layers.remove(from);
            self.layers.insert(to, layer);
        }
        true
    }

    /// One step towards the top.
    pub fn raise(&mut self, id: u64) -> bool {
        match self.index_of(id) {
            Some(i) if i + 1 < self.layers.len() => {
                self.layers.swap(i, i + 1);
                true
            }
            _ => false,
        }
    }

    /// One step towards the bottom.
    pub fn lower(&mut self, id: u64) -> bool {
        match self.index_of(id) {
            Some(i) if i > 0 => {
                self.layers.swap(i, i - 1);
                true
            }
            _ => false,
        }
    }

    pub fn set_opacity(&mut self, id: u64, opacity: f32) -> bool {
        self.update(id, |l| l.opacity = opacity.clamp(0.0, 1.0))
    }

    pub fn set_visible(&mut self, id: u64, visible: bool) -> bool {
        self.update(id, |l| l.visible = visible)
    }

    pub fn set_blend_mode(&mut self, id: u64, mode: BlendMode) -> bool {
        self.update(id, |l| l.blend_mode = mode)
    }

    pub fn set_relative_size(&mut self, id: u64, percent: f32) -> bool {
        self.update(id, |l| l.relative_size = percent.max(0.0))
    }

    pub fn set_position(&mut self, id: u64, x_percent: f32, y_percent: f32) -> bool {
        self.update(id, |l| l.position = (x_percent, y_percent))
    }

    pub fn rename(&mut self, id: u64, name: impl Into<String>) -> bool {
        let name = name.into();
        self.update(id, |l| l.name = name)
    }

    pub fn infos(&self) -> Vec<LayerInfo> {
        self.layers.iter().map(LayerInfo::from).collect()
    }

    fn update(&mut self, id: u64, f: impl FnOnce(&mut OverlayLayer)) -> bool {
        match self.get_mut(id) {
            Some(layer) => {
                f(layer);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// FLATTEN
// ============================================================================

/// Composite `layers` (bottom to top) onto a copy of `base`.
///
/// Each visible layer is resized to its drawn size and blended with its own
/// mode and opacity; invisible layers are skipped entirely.
pub fn flatten<'a>(base: &RasterImage, layers: impl IntoIterator<Item = &'a OverlayLayer>) -> RasterImage {
    let (bw, bh) = base.dimensions();
    let mut surface = base.to_rgba_image();
    let mut drawn = 0usize;

    for layer in layers {
        if !layer.visible || layer.raster.is_empty() {
            continue;
        }
        let (x, y, w, h) = layer.placement(bw, bh);
        let src = layer.raster.pixels();
        let scaled;
        let src = if src.dimensions() == (w, h) {
            src
        } else {
            scaled = imageops::resize(src, w, h, imageops::FilterType::Triangle);
            &scaled
        };
        composite_onto(&mut surface, src, x, y, layer.blend_mode, layer.opacity);
        drawn += 1;
    }

    debug!(drawn, width = bw, height = bh, "flattened layers");
    RasterImage::new(surface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn base() -> RasterImage {
        RasterImage::filled(100, 80, Rgba([20, 40, 60, 255]))
    }

    #[test]
    fn invisible_layer_is_a_true_no_op() {
        let mut stack = LayerStack::new();
        let id = stack.add("logo", RasterImage::filled(10, 10, Rgba([255, 0, 0, 255])));
        stack.set_visible(id, false);
        assert_eq!(flatten(&base(), stack.iter()), flatten(&base(), []));
        assert_eq!(flatten(&base(), []), base());
    }

    #[test]
    fn layer_is_placed_by_percentages() {
        let mut stack = LayerStack::new();
        // 20×10 layer at 50% of width → 50×25, at (25%, 25%) → (25, 20).
        let id = stack.add("red", RasterImage::filled(20, 10, Rgba([255, 0, 0, 255])));
        let layer = stack.get(id).expect("layer");
        assert_eq!(layer.placement(100, 80), (25, 20, 50, 25));

        let out = flatten(&base(), stack.iter());
        assert_eq!(out.get_pixel(25, 20), Rgba([255, 0, 0, 255]));
        assert_eq!(out.get_pixel(74, 44), Rgba([255, 0, 0, 255]));
        assert_eq!(out.get_pixel(75, 20), Rgba([20, 40, 60, 255]));
        assert_eq!(out.get_pixel(25, 45), Rgba([20, 40, 60, 255]));
    }

    #[test]
    fn order_is_paint_order() {
        let mut stack = LayerStack::new();
        let red = stack.add("red", RasterImage::filled(4, 4, Rgba([255, 0, 0, 255])));
        let blue = stack.add("blue", RasterImage::filled(4, 4, Rgba([0, 0, 255, 255])));
        let out = flatten(&base(), stack.iter());
        assert_eq!(out.get_pixel(40, 30), Rgba([0, 0, 255, 255]));

        assert!(stack.raise(red));
        assert_eq!(stack.index_of(red), Some(1));
        let out = flatten(&base(), stack.iter());
        assert_eq!(out.get_pixel(40, 30), Rgba([255, 0, 0, 255]));

        assert!(stack.move_to(blue, 99));
        assert_eq!(stack.index_of(blue), Some(1));
        assert!(!stack.raise(blue));
    }

    #[test]
    fn opacity_and_blend_mode_apply() {
        let mut stack = LayerStack::new();
        let id = stack.add("white", RasterImage::filled(4, 4, Rgba([255, 255, 255, 255])));
        stack.set_blend_mode(id, BlendMode::Multiply);
        let out = flatten(&base(), stack.iter());
        assert_eq!(out.get_pixel(40, 30), Rgba([20, 40, 60, 255]));

        stack.set_blend_mode(id, BlendMode::Normal);
        assert!(stack.set_opacity(id, 7.0));
        assert_eq!(stack.get(id).expect("layer").opacity, 1.0);
        stack.set_opacity(id, 0.0);
        assert_eq!(flatten(&base(), stack.iter()), base());
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut stack = LayerStack::new();
        let a = stack.add("a", base());
        let b = stack.add("b", base());
        assert!(stack.remove(b).is_some());
        let c = stack.add("c", base());
        assert!(a < b && b < c);
        assert!(stack.remove(b).is_none());
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn removed_layer_releases_its_raster() {
        let raster = RasterImage::filled(2, 2, Rgba([1, 1, 1, 255]));
        let original = raster.clone();
        let mut stack = LayerStack::new();
        let id = stack.add("tmp", raster);
        assert!(stack.get(id).expect("layer").raster.shares_pixels_with(&original));
        drop(stack.remove(id));
        stack.clear();
        assert!(stack.is_empty());
    }
}
