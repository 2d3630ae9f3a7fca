use std::fmt;

use ab_glyph::FontArc;
use image::Rgba;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canvas::{BlendMode, RasterImage, composite_onto, resize_to};
use crate::ops::text::rasterize_line;

pub const DEFAULT_MARGIN_RATIO: f32 = 0.02;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HorizontalAnchor {
    Left,
    Center,
    #[default]
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerticalAnchor {
    Top,
    Middle,
    #[default]
    Bottom,
}

/// One cell of the 3×3 placement grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Anchor {
    pub vertical: VerticalAnchor,
    pub horizontal: HorizontalAnchor,
}

impl Anchor {
    pub fn new(vertical: VerticalAnchor, horizontal: HorizontalAnchor) -> Self {
        Self { vertical, horizontal }
    }

    /// Parse `"top-left"`, `"middle center"`, `"bottom_right"` and the
    /// single word `"center"`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s == "center" || s == "centre" || s == "middle" {
            return Some(Self::new(VerticalAnchor::Middle, HorizontalAnchor::Center));
        }
        let mut parts = s.split(|c: char| c == '-' || c == '_' || c.is_whitespace()).filter(|p| !p.is_empty());
        let vertical = match parts.next()? {
            "top" => VerticalAnchor::Top,
            "middle" | "center" | "centre" => VerticalAnchor::Middle,
            "bottom" => VerticalAnchor::Bottom,
            _ => return None,
        };
        let horizontal = match parts.next()? {
            "left" => HorizontalAnchor::Left,
            "center" | "centre" | "middle" => HorizontalAnchor::Center,
            "right" => HorizontalAnchor::Right,
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(vertical, horizontal))
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = match self.vertical {
            VerticalAnchor::Top => "top",
            VerticalAnchor::Middle => "middle",
            VerticalAnchor::Bottom => "bottom",
        };
        let h = match self.horizontal {
            HorizontalAnchor::Left => "left",
            HorizontalAnchor::Center => "center",
            HorizontalAnchor::Right => "right",
        };
        write!(f, "{v}-{h}")
    }
}

#[derive(Clone)]
pub enum WatermarkContent {
    Text {
        text: String,
        font: FontArc,
        /// Font size as a fraction of the canvas width.
        font_scale: f32,
        color: Rgba<u8>,
    },
    Logo {
        raster: RasterImage,
        /// Drawn width as a percentage of the canvas width.
        width_percent: f32,
    },
}

#[derive(Clone)]
pub struct WatermarkSettings {
    pub anchor: Anchor,
    /// 0.0–1.0.
    pub opacity: f32,
    /// Margin as a fraction of the canvas width.
    pub margin_ratio: f32,
    pub content: WatermarkContent,
}

impl WatermarkSettings {
    pub fn new(content: WatermarkContent) -> Self {
        Self {
            anchor: Anchor::default(),
            opacity: 1.0,
            margin_ratio: DEFAULT_MARGIN_RATIO,
            content,
        }
    }
}

/// Top-left corner for content of `content` size on a `canvas` sized image.
pub fn place(anchor: Anchor, canvas: (u32, u32), content: (u32, u32), margin: f32) -> (i64, i64) {
    let (cw, ch) = (canvas.0 as f32, canvas.1 as f32);
    let (w, h) = (content.0 as f32, content.1 as f32);
    let x = match anchor.horizontal {
        HorizontalAnchor::Left => margin,
        HorizontalAnchor::Center => (cw - w) * 0.5,
        HorizontalAnchor::Right => cw - w - margin,
    };
    let y = match anchor.vertical {
        VerticalAnchor::Top => margin,
        VerticalAnchor::Middle => (ch - h) * 0.5,
        VerticalAnchor::Bottom => ch - h - margin,
    };
    (x.round() as i64, y.round() as i64)
}

/// Stamp the watermark onto a copy of `image`.
pub fn apply(image: &RasterImage, settings: &WatermarkSettings) -> RasterImage {
    let (w, h) = image.dimensions();
    if image.is_empty() || settings.opacity <= 0.0 {
        return image.clone();
    }

    let stamp = match &settings.content {
        WatermarkContent::Text {
            text,
            font,
            font_scale,
            color,
        } => {
            let font_size = (w as f32 * font_scale).max(1.0);
            rasterize_line(font, text, font_size, color.0)
        }
        WatermarkContent::Logo { raster, width_percent } => {
            if raster.is_empty() {
                return image.clone();
            }
            let lw = (w as f32 * width_percent / 100.0).round().max(1.0);
            let lh = (lw * raster.height() as f32 / raster.width() as f32).round().max(1.0);
            resize_to(raster.pixels(), lw as u32, lh as u32)
        }
    };
    if stamp.width() == 0 || stamp.height() == 0 {
        return image.clone();
    }

    let margin = w as f32 * settings.margin_ratio;
    let (x, y) = place(settings.anchor, (w, h), stamp.dimensions(), margin);
    let mut out = image.to_rgba_image();
    composite_onto(&mut out, &stamp, x, y, BlendMode::Normal, settings.opacity.clamp(0.0, 1.0));
    debug!(anchor = %settings.anchor, x, y, sw = stamp.width(), sh = stamp.height(), "watermark applied");
    RasterImage::new(out)
}
