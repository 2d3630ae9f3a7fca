// ============================================================================
// VIEWPORT: zoom/pan state and screen ↔ image coordinate mapping
// ============================================================================
//
// Three coordinate frames are involved:
//   * screen   : raw pointer position
//   * container: screen minus the container's top-left corner
//   * natural  : pixel position in the full-resolution image
//
// The image element is fitted ("contain") inside the container and then the
// whole content is transformed by `translate(pan) scale(scale)` with its
// origin at the container's top-left corner. "Display" coordinates are
// positions on the fitted, untransformed image element.

use egui::{Pos2, Rect, Vec2};

pub const MIN_SCALE: f32 = 1.0;
pub const MAX_SCALE: f32 = 8.0;

/// Container rectangle (screen space) plus the natural size of the image
/// shown inside it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportLayout {
    pub container: Rect,
    pub natural_size: Vec2,
}

impl ViewportLayout {
    pub fn new(container: Rect, natural_width: u32, natural_height: u32) -> Self {
        Self {
            container,
            natural_size: Vec2::new(natural_width as f32, natural_height as f32),
        }
    }

    /// Rect of the fitted image element in container coordinates, before the
    /// zoom/pan transform. Letterboxed symmetrically on the short axis.
    pub fn fitted_image_rect(&self) -> Rect {
        let box_size = self.container.size();
        if self.natural_size.x <= 0.0 || self.natural_size.y <= 0.0 {
            return Rect::from_min_size(Pos2::ZERO, Vec2::ZERO);
        }
        let fit = (box_size.x / self.natural_size.x).min(box_size.y / self.natural_size.y);
        let size = self.natural_size * fit;
        let min = Pos2::new((box_size.x - size.x) * 0.5, (box_size.y - size.y) * 0.5);
        Rect::from_min_size(min, size)
    }

    /// Size of the image as rendered (display pixels) before zoom.
    pub fn rendered_size(&self) -> Vec2 {
        self.fitted_image_rect().size()
    }

    /// Factor converting display pixels into natural pixels, per axis.
    pub fn display_to_natural(&self) -> Vec2 {
        let rendered = self.rendered_size();
        if rendered.x <= 0.0 || rendered.y <= 0.0 {
            return Vec2::splat(1.0);
        }
        Vec2::new(self.natural_size.x / rendered.x, self.natural_size.y / rendered.y)
    }
}

/// A pointer position resolved into both frames a hotspot needs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MappedPoint {
    /// Position on the displayed (fitted, unzoomed) image element.
    pub display: Pos2,
    /// Position in natural image pixels.
    pub natural: Pos2,
}

/// Whether a wheel event was turned into a zoom or left for the host to scroll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WheelOutcome {
    Consumed,
    PassThrough,
}

/// Zoom/pan state. Scale stays within `[MIN_SCALE, MAX_SCALE]`; pan is
/// unconstrained.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportTransform {
    scale: f32,
    pan: Vec2,
}

impl Default for ViewportTransform {
    fn default() -> Self {
        Self {
            scale: MIN_SCALE,
            pan: Vec2::ZERO,
        }
    }
}

impl ViewportTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn pan(&self) -> Vec2 {
        self.pan
    }

    pub fn is_identity(&self) -> bool {
        self.scale == MIN_SCALE && self.pan == Vec2::ZERO
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn pan_by(&mut self, delta: Vec2) {
        self.pan += delta;
    }

    /// Zoom to `new_scale` keeping the content under `anchor` (container
    /// coordinates) visually stationary.
    ///
    /// Pure math: the pan is not snapped back to the origin at scale 1, so
    /// callers that want that (wheel zoom-out) must do it themselves.
    pub fn zoom_at_point(&mut self, new_scale: f32, anchor: Pos2) {
        let new_scale = new_scale.clamp(MIN_SCALE, MAX_SCALE);
        let content = (anchor.to_vec2() - self.pan) / self.scale;
        self.pan = anchor.to_vec2() - content * new_scale;
        self.scale = new_scale;
    }

    /// Container point → point on the untransformed content.
    pub fn container_to_content(&self, p: Pos2) -> Pos2 {
        ((p.to_vec2() - self.pan) / self.scale).to_pos2()
    }

    /// Point on the untransformed content → container point.
    pub fn content_to_container(&self, p: Pos2) -> Pos2 {
        (p.to_vec2() * self.scale + self.pan).to_pos2()
    }

    /// Map a screen-space pointer position to display and natural image
    /// coordinates. Returns `None` over the letterbox area around the image.
    pub fn map_pointer_to_coordinates(&self, layout: &ViewportLayout, screen: Pos2) -> Option<MappedPoint> {
        let fitted = layout.fitted_image_rect();
        if fitted.width() <= 0.0 || fitted.height() <= 0.0 {
            return None;
        }
        let container_point = (screen - layout.container.min).to_pos2();
        let content = self.container_to_content(container_point);
        if content.x < fitted.min.x
            || content.y < fitted.min.y
            || content.x >= fitted.max.x
            || content.y >= fitted.max.y
        {
            return None;
        }
        let display = (content - fitted.min).to_pos2();
        let ratio = layout.display_to_natural();
        let natural = Pos2::new(display.x * ratio.x, display.y * ratio.y);
        Some(MappedPoint { display, natural })
    }

    /// Inverse of [`Self::map_pointer_to_coordinates`]: where a natural-space
    /// point currently appears on screen (e.g. to draw the hotspot marker).
    pub fn natural_to_screen(&self, layout: &ViewportLayout, natural: Pos2) -> Pos2 {
        let fitted = layout.fitted_image_rect();
        let ratio = layout.display_to_natural();
        let display = Vec2::new(natural.x / ratio.x, natural.y / ratio.y);
        let content = fitted.min + display;
        layout.container.min + self.content_to_container(content).to_vec2()
    }

    /// Rect of the rendered (zoomed, panned) image in screen coordinates.
    pub fn rendered_image_rect(&self, layout: &ViewportLayout) -> Rect {
        let fitted = layout.fitted_image_rect();
        let min = self.content_to_container(fitted.min);
        let max = self.content_to_container(fitted.max);
        Rect::from_min_max(min, max).translate(layout.container.min.to_vec2())
    }

    /// Wheel zoom. Only pointer positions over the rendered image are
    /// intercepted; zooming out at minimum scale is handed back to the host so
    /// the page scrolls normally. `delta_y > 0` zooms out.
    pub fn handle_wheel(&mut self, layout: &ViewportLayout, screen: Pos2, delta_y: f32, step: f32) -> WheelOutcome {
        if delta_y == 0.0 || !self.rendered_image_rect(layout).contains(screen) {
            return WheelOutcome::PassThrough;
        }
        let zoom_out = delta_y > 0.0;
        if zoom_out && self.scale <= MIN_SCALE {
            return WheelOutcome::PassThrough;
        }
        let factor = 1.0 + step.max(0.0);
        let target = if zoom_out { self.scale / factor } else { self.scale * factor };
        let anchor = (screen - layout.container.min).to_pos2();
        self.zoom_at_point(target, anchor);
        if self.scale <= MIN_SCALE {
            self.pan = Vec2::ZERO;
        }
        WheelOutcome::Consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ViewportLayout {
        // 1000×500 container showing an 800×600 image: fitted to 666.67×500,
        // letterboxed horizontally.
        ViewportLayout::new(
            Rect::from_min_size(Pos2::new(100.0, 50.0), Vec2::new(1000.0, 500.0)),
            800,
            600,
        )
    }

    #[test]
    fn identity_mapping_scales_display_to_natural() {
        let view = ViewportTransform::new();
        let layout = layout();
        let fitted = layout.fitted_image_rect();
        let screen = layout.container.min + fitted.min.to_vec2() + Vec2::new(10.0, 20.0);
        let mapped = view.map_pointer_to_coordinates(&layout, screen).expect("inside image");
        assert!((mapped.display.x - 10.0).abs() < 1e-3);
        assert!((mapped.display.y - 20.0).abs() < 1e-3);
        assert!((mapped.natural.x - 12.0).abs() < 1e-2);
        assert!((mapped.natural.y - 24.0).abs() < 1e-2);
    }

    #[test]
    fn letterbox_clicks_are_ignored() {
        let view = ViewportTransform::new();
        let layout = layout();
        assert_eq!(view.map_pointer_to_coordinates(&layout, Pos2::new(110.0, 300.0)), None);
    }

    #[test]
    fn zoom_at_point_keeps_anchor_stationary() {
        let layout = layout();
        let anchor_screen = Pos2::new(640.0, 310.0);
        let anchor = (anchor_screen - layout.container.min).to_pos2();
        for &s in &[1.0f32, 1.5, 2.0, 3.7, 8.0] {
            let mut view = ViewportTransform::new();
            view.zoom_at_point(2.5, anchor);
            view.pan_by(Vec2::new(13.0, -7.0));
            let before = view.map_pointer_to_coordinates(&layout, anchor_screen).expect("before");
            view.zoom_at_point(s, anchor);
            let after = view.map_pointer_to_coordinates(&layout, anchor_screen).expect("after");
            assert!((before.natural.x - after.natural.x).abs() < 1e-2, "scale {s}");
            assert!((before.natural.y - after.natural.y).abs() < 1e-2, "scale {s}");
        }
    }

    #[test]
    fn scale_is_clamped() {
        let mut view = ViewportTransform::new();
        view.zoom_at_point(20.0, Pos2::ZERO);
        assert_eq!(view.scale(), MAX_SCALE);
        view.zoom_at_point(0.2, Pos2::ZERO);
        assert_eq!(view.scale(), MIN_SCALE);
    }

    #[test]
    fn natural_to_screen_inverts_mapping() {
        let layout = layout();
        let mut view = ViewportTransform::new();
        view.zoom_at_point(3.0, Pos2::new(400.0, 200.0));
        let screen = Pos2::new(600.0, 300.0);
        let mapped = view.map_pointer_to_coordinates(&layout, screen).expect("inside");
        let back = view.natural_to_screen(&layout, mapped.natural);
        assert!((back.x - screen.x).abs() < 1e-2);
        assert!((back.y - screen.y).abs() < 1e-2);
    }

    #[test]
    fn wheel_zoom_out_at_minimum_passes_through() {
        let layout = layout();
        let mut view = ViewportTransform::new();
        let over_image = layout.rendered_image_center();
        assert_eq!(view.handle_wheel(&layout, over_image, 1.0, 0.1), WheelOutcome::PassThrough);
        assert_eq!(view.handle_wheel(&layout, over_image, -1.0, 0.1), WheelOutcome::Consumed);
        assert!(view.scale() > MIN_SCALE);
        // Letterbox area is never intercepted.
        assert_eq!(
            view.handle_wheel(&layout, Pos2::new(101.0, 60.0), -1.0, 0.1),
            WheelOutcome::PassThrough
        );
    }

    #[test]
    fn wheel_back_to_minimum_resets_pan() {
        let layout = layout();
        let mut view = ViewportTransform::new();
        let p = layout.rendered_image_center() + Vec2::new(40.0, 10.0);
        view.handle_wheel(&layout, p, -1.0, 0.5);
        assert_ne!(view.pan(), Vec2::ZERO);
        view.handle_wheel(&layout, p, 1.0, 0.5);
        assert_eq!(view.scale(), MIN_SCALE);
        assert_eq!(view.pan(), Vec2::ZERO);
    }

    impl ViewportLayout {
        fn rendered_image_center(&self) -> Pos2 {
            self.container.min + self.fitted_image_rect().center().to_vec2()
        }
    }
}
