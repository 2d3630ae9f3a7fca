use ab_glyph::{Font, FontArc, GlyphId, ScaleFont, point};
use image::{Rgba, RgbaImage};

/// Text alignment relative to the layout origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextAlignment {
    #[default]
    Left,
    Center,
    Right,
}

/// A single laid-out line.
pub struct LineLayout {
    /// `(glyph, x, baseline_y)` for each glyph.
    pub glyphs: Vec<(GlyphId, f32, f32)>,
    pub width: f32,
    pub ascent: f32,
    pub descent: f32,
}

impl LineLayout {
    /// Ascent to descent, in pixels.
    pub fn height(&self) -> f32 {
        self.ascent - self.descent
    }
}

/// Lay out a single line of text with kerning. Baseline sits at `ascent`.
pub fn layout_text(font: &FontArc, text: &str, font_size: f32, alignment: TextAlignment) -> LineLayout {
    let scaled = font.as_scaled(font_size);
    let ascent = scaled.ascent();
    let descent = scaled.descent();

    let mut glyphs = Vec::new();
    let mut cursor_x = 0.0f32;
    let mut last_glyph: Option<GlyphId> = None;

    for ch in text.chars().filter(|c| !c.is_control()) {
        let glyph_id = font.glyph_id(ch);
        if let Some(prev) = last_glyph {
            cursor_x += scaled.kern(prev, glyph_id);
        }
        glyphs.push((glyph_id, cursor_x, ascent));
        cursor_x += scaled.h_advance(glyph_id);
        last_glyph = Some(glyph_id);
    }

    let width = cursor_x;
    let offset = match alignment {
        TextAlignment::Left => 0.0,
        TextAlignment::Center => -width * 0.5,
        TextAlignment::Right => -width,
    };
    for glyph in &mut glyphs {
        glyph.1 += offset;
    }

    LineLayout {
        glyphs,
        width,
        ascent,
        descent,
    }
}

/// Render one left-aligned line into a buffer exactly `ceil(width) ×
/// ceil(ascent - descent)` pixels, colored with `color` and anti-aliased
/// coverage as alpha.
pub fn rasterize_line(font: &FontArc, text: &str, font_size: f32, color: [u8; 4]) -> RgbaImage {
    let layout = layout_text(font, text, font_size, TextAlignment::Left);
    let buf_w = layout.width.ceil().max(0.0) as u32;
    let buf_h = layout.height().ceil().max(0.0) as u32;
    if buf_w == 0 || buf_h == 0 {
        return RgbaImage::new(buf_w, buf_h);
    }

    let mut coverage = vec![0.0f32; buf_w as usize * buf_h as usize];
    for &(glyph_id, gx, gy) in &layout.glyphs {
        let glyph = glyph_id.with_scale_and_position(font_size, point(gx, gy));
        let Some(outlined) = font.outline_glyph(glyph) else { continue };
        let bounds = outlined.px_bounds();
        outlined.draw(|px, py, cov| {
            let x = px as i32 + bounds.min.x as i32;
            let y = py as i32 + bounds.min.y as i32;
            if x >= 0 && y >= 0 && (x as u32) < buf_w && (y as u32) < buf_h {
                let idx = y as usize * buf_w as usize + x as usize;
                coverage[idx] = coverage[idx].max(cov);
            }
        });
    }

    let mut out = RgbaImage::new(buf_w, buf_h);
    for (px, &cov) in out.pixels_mut().zip(coverage.iter()) {
        if cov > 0.001 {
            let a = (color[3] as f32 * cov.min(1.0)).round() as u8;
            *px = Rgba([color[0], color[1], color[2], a]);
        }
    }
    out
}

/// Enumerate system font families, sorted and deduplicated.
pub fn enumerate_system_fonts() -> Vec<String> {
    match font_kit::source::SystemSource::new().all_families() {
        Ok(mut families) => {
            families.sort();
            families.dedup();
            families
        }
        Err(_) => Vec::new(),
    }
}

/// Load a font by family name, weight, and style from the system.
/// `weight` is a CSS-style weight value (100=Thin, 400=Regular, 700=Bold, etc.)
/// Returns None if the font cannot be found.
pub fn load_system_font(family: &str, weight: u16, italic: bool) -> Option<FontArc> {
    use font_kit::family_name::FamilyName;
    load_best_match(&[FamilyName::Title(family.to_string())], weight, italic)
}

/// The platform's default sans-serif face.
pub fn default_font() -> Option<FontArc> {
    use font_kit::family_name::FamilyName;
    load_best_match(&[FamilyName::SansSerif], 400, false)
}

/// Load a font file (TTF/OTF) from disk.
pub fn load_font_file(path: &std::path::Path) -> Option<FontArc> {
    let bytes = std::fs::read(path).ok()?;
    FontArc::try_from_vec(bytes).ok()
}

fn load_best_match(families: &[font_kit::family_name::FamilyName], weight: u16, italic: bool) -> Option<FontArc> {
    use font_kit::properties::{Properties, Style, Weight};
    use font_kit::source::SystemSource;

    let mut props = Properties::new();
    props.weight = Weight(weight as f32);
    if italic {
        props.style = Style::Italic;
    }

    let handle = SystemSource::new().select_best_match(families, &props).ok()?;
    let font_data = handle.load().ok()?;
    let font_data_copy = font_data.copy_font_data()?;
    let bytes: Vec<u8> = (*font_data_copy).clone();
    FontArc::try_from_vec(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_alignment_shifts_glyphs() {
        let Some(font) = default_font() else { return };
        let left = layout_text(&font, "Hello", 32.0, TextAlignment::Left);
        let right = layout_text(&font, "Hello", 32.0, TextAlignment::Right);
        assert!(left.width > 0.0);
        assert_eq!(left.glyphs.len(), 5);
        assert!((right.glyphs[0].1 + left.width - left.glyphs[0].1).abs() < 1e-3);
    }

    #[test]
    fn rasterized_line_has_measured_size_and_ink() {
        let Some(font) = default_font() else { return };
        let img = rasterize_line(&font, "Watermark", 40.0, [255, 255, 255, 255]);
        let layout = layout_text(&font, "Watermark", 40.0, TextAlignment::Left);
        assert_eq!(img.width(), layout.width.ceil() as u32);
        assert_eq!(img.height(), layout.height().ceil() as u32);
        assert!(img.pixels().any(|p| p[3] > 0));
        assert_eq!(rasterize_line(&font, "", 40.0, [0, 0, 0, 255]).width(), 0);
    }
}
