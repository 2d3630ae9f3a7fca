// ============================================================================
// RetouchFE CLI: headless batch retouching via command-line arguments
// ============================================================================
//
// Usage examples:
//   retouchfe -i photo.png --crop 100,100,400,300 -o cropped.png
//   retouchfe -i shot.jpg --key-background --bg-color "#1e3a8a" -o product.png
//   retouchfe -i *.jpg --watermark-text "© Studio" --anchor bottom-right --output-dir out/
//   retouchfe -i scan.png --rotate 3.5 --turns 1 --format jpeg --quality 85
//   retouchfe --list-fonts
//
// Each step is committed to an in-memory edit history exactly as the
// interactive engine would, so the pipeline runs through the same code paths.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use image::Rgba;
use tracing::{debug, warn};

use crate::io::{self, ExportFormat};
use crate::ops::background::{BackgroundFill, FitMode};
use crate::ops::text;
use crate::ops::transform::CropRegion;
use crate::ops::watermark::{Anchor, WatermarkContent, WatermarkSettings};
use crate::project::{Project, SessionCommand};
use crate::settings::EngineSettings;
use crate::store::MemorySessionStore;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// RetouchFE headless image retoucher.
#[derive(Parser, Debug)]
#[command(
    name = "retouchfe",
    about = "RetouchFE headless batch retoucher",
    long_about = "Crop, straighten, replace backgrounds and watermark image files\n\
                  without opening an editor. Reads PNG, JPEG and WEBP; writes PNG,\n\
                  JPEG (lossy, --quality) and WEBP (lossless).\n\n\
                  Example:\n  \
                  retouchfe -i photo.png --crop 100,100,400,300 -o cropped.png\n  \
                  retouchfe -i *.jpg --watermark-text \"(c) me\" --output-dir out/"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    #[arg(short, long, num_args = 1.., required_unless_present = "list_fonts")]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png, jpeg, webp. Inferred from --output when omitted.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// JPEG quality (1–100). Defaults to the configured export quality.
    #[arg(short, long, value_name = "1-100")]
    pub quality: Option<u8>,

    /// Crop rectangle in image pixels.
    #[arg(long, value_name = "X,Y,W,H", value_parser = parse_crop)]
    pub crop: Option<CropRegion>,

    /// Straighten by this many degrees (−45…45), applied with the crop.
    #[arg(long, value_name = "DEGREES", allow_hyphen_values = true)]
    pub rotate: Option<f32>,

    /// Quarter turns clockwise (negative = counter-clockwise).
    #[arg(long, value_name = "N", allow_hyphen_values = true)]
    pub turns: Option<i32>,

    /// Mirror the image: "h" (horizontal) or "v" (vertical).
    #[arg(long, value_name = "h|v")]
    pub flip: Option<String>,

    /// Key out a flat background color detected in the corners.
    #[arg(long)]
    pub key_background: bool,

    /// Place the image over a solid color ("#rrggbb" or "#rrggbbaa").
    #[arg(long, value_name = "HEX", value_parser = parse_hex_color, conflicts_with = "bg_image")]
    pub bg_color: Option<Rgba<u8>>,

    /// Place the image over another image.
    #[arg(long, value_name = "FILE")]
    pub bg_image: Option<PathBuf>,

    /// How --bg-image is fitted: cover or contain.
    #[arg(long, default_value = "cover", value_name = "MODE")]
    pub fit: String,

    /// Text watermark.
    #[arg(long, value_name = "TEXT", conflicts_with = "watermark_logo")]
    pub watermark_text: Option<String>,

    /// Image watermark (logo).
    #[arg(long, value_name = "FILE")]
    pub watermark_logo: Option<PathBuf>,

    /// Watermark corner, e.g. "bottom-right", "top-left", "center".
    #[arg(long, value_name = "ANCHOR")]
    pub anchor: Option<String>,

    /// Watermark opacity (0.0–1.0).
    #[arg(long, value_name = "0-1")]
    pub opacity: Option<f32>,

    /// Font family for --watermark-text, or a path to a TTF/OTF file.
    #[arg(long, value_name = "FAMILY|FILE")]
    pub font: Option<String>,

    /// Settings file to use instead of the platform default.
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Print the installed font families and exit.
    #[arg(long)]
    pub list_fonts: bool,

    /// Print per-file history and timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    if args.list_fonts {
        for family in text::enumerate_system_fonts() {
            println!("{family}");
        }
        return ExitCode::SUCCESS;
    }

    let settings = match &args.settings {
        Some(path) => EngineSettings::load_from(path),
        None => EngineSettings::load(),
    };

    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let plan = match Plan::from_args(&args, &settings) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = &args.output_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
            return ExitCode::FAILURE;
        }
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();

        let Some(output_path) =
            build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref(), plan.format)
        else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        match run_one(input_path, &output_path, &plan, &settings) {
            Ok(labels) => {
                if args.verbose {
                    println!("  history: {}", labels.join(" → "));
                }
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                eprintln!("  error: {e}");
                any_failure = true;
            }
        }
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

// ============================================================================
// Per-file processing pipeline
// ============================================================================

/// Everything resolved from the arguments once, shared by every input.
pub struct Plan {
    pub crop: Option<CropRegion>,
    pub rotation: f32,
    pub turns: i32,
    /// `Some(true)` = horizontal.
    pub flip: Option<bool>,
    pub key_background: bool,
    pub background: Option<(BackgroundFill, FitMode)>,
    pub watermark: Option<WatermarkSettings>,
    pub format: ExportFormat,
    pub quality: u8,
}

impl Plan {
    pub fn from_args(args: &CliArgs, settings: &EngineSettings) -> Result<Self, String> {
        let format = match args.format.as_deref() {
            Some(name) => ExportFormat::from_name(name).ok_or_else(|| format!("unknown format '{name}'"))?,
            None => args
                .output
                .as_deref()
                .and_then(ExportFormat::from_path)
                .unwrap_or(settings.export.format),
        };

        let flip = match args.flip.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => None,
            Some("h" | "horizontal") => Some(true),
            Some("v" | "vertical") => Some(false),
            Some(other) => return Err(format!("--flip expects 'h' or 'v', got '{other}'")),
        };

        let fit = match args.fit.to_ascii_lowercase().as_str() {
            "cover" => FitMode::Cover,
            "contain" => FitMode::Contain,
            other => return Err(format!("--fit expects 'cover' or 'contain', got '{other}'")),
        };

        let background = if let Some(color) = args.bg_color {
            Some((BackgroundFill::Color(color), fit))
        } else if let Some(path) = &args.bg_image {
            let raster =
                io::load_image_sync(path).map_err(|e| format!("background '{}': {}", path.display(), e))?;
            Some((BackgroundFill::Image(raster), fit))
        } else {
            None
        };

        let watermark = Self::watermark_from_args(args, settings)?;

        Ok(Self {
            crop: args.crop,
            rotation: args.rotate.unwrap_or(0.0),
            turns: args.turns.unwrap_or(0),
            flip,
            key_background: args.key_background,
            background,
            watermark,
            format,
            quality: args.quality.unwrap_or(settings.export.quality),
        })
    }

    fn watermark_from_args(args: &CliArgs, settings: &EngineSettings) -> Result<Option<WatermarkSettings>, String> {
        let defaults = &settings.watermark;
        let content = if let Some(text) = &args.watermark_text {
            let family = args.font.clone().or_else(|| defaults.font_family.clone());
            let font = match family {
                Some(f) if Path::new(&f).is_file() => text::load_font_file(Path::new(&f)),
                Some(f) => text::load_system_font(&f, 400, false).or_else(|| {
                    warn!(family = %f, "font not found, using default");
                    text::default_font()
                }),
                None => text::default_font(),
            }
            .ok_or_else(|| "no usable font found for --watermark-text".to_string())?;
            WatermarkContent::Text {
                text: text.clone(),
                font,
                font_scale: defaults.font_scale,
                color: Rgba(defaults.text_color),
            }
        } else if let Some(path) = &args.watermark_logo {
            let raster = io::load_image_sync(path).map_err(|e| format!("logo '{}': {}", path.display(), e))?;
            WatermarkContent::Logo {
                raster,
                width_percent: defaults.logo_width_percent,
            }
        } else {
            return Ok(None);
        };

        let anchor = match args.anchor.as_deref() {
            Some(s) => Anchor::parse(s).ok_or_else(|| format!("unknown anchor '{s}'"))?,
            None => defaults.anchor,
        };
        let mut wm = WatermarkSettings::new(content);
        wm.anchor = anchor;
        wm.opacity = args.opacity.unwrap_or(defaults.opacity).clamp(0.0, 1.0);
        wm.margin_ratio = defaults.margin_ratio;
        Ok(Some(wm))
    }
}

/// Run the plan on one file and write the result. Returns the history labels.
pub fn run_one(input: &Path, output: &Path, plan: &Plan, settings: &EngineSettings) -> Result<Vec<String>, String> {
    let mut project = Project::new(
        input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
        Box::new(MemorySessionStore::new()),
        settings.clone(),
    );

    // -- Step 1: Load ----------------------------------------------------
    project.load_file(input).map_err(|e| format!("load failed: {e}"))?;

    // -- Step 2: Geometry ------------------------------------------------
    if plan.crop.is_some() || plan.rotation != 0.0 {
        project
            .apply(SessionCommand::SetCropRegion(plan.crop))
            .and_then(|_| project.apply(SessionCommand::SetRotation(plan.rotation)))
            .and_then(|_| project.apply_crop())
            .map_err(|e| format!("crop failed: {e}"))?;
    }
    if plan.turns != 0 {
        project.rotate_quarter(plan.turns).map_err(|e| format!("rotate failed: {e}"))?;
    }
    if let Some(horizontal) = plan.flip {
        project.flip(horizontal).map_err(|e| format!("flip failed: {e}"))?;
    }

    // -- Step 3: Background ----------------------------------------------
    match &plan.background {
        Some((fill, fit)) => project.apply_background(fill, *fit),
        None if plan.key_background => project.clean_background(),
        None => Ok(project.history.pointer()),
    }
    .map_err(|e| format!("background failed: {e}"))?;

    // -- Step 4: Watermark -----------------------------------------------
    if let Some(wm) = &plan.watermark {
        project.apply_watermark(wm).map_err(|e| format!("watermark failed: {e}"))?;
    }

    // -- Step 5: Export --------------------------------------------------
    project
        .export_to(output, plan.format, plan.quality)
        .map_err(|e| format!("save failed: {e}"))?;

    let labels: Vec<String> = project.history.labels().iter().map(|s| s.to_string()).collect();
    debug!(input = %input.display(), steps = labels.len(), "file processed");
    Ok(labels)
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);
        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{pattern}' matched no files.");
                }
            }
            Err(e) => eprintln!("warning: invalid glob '{pattern}': {e}"),
        }
    }

    result
}

/// `"x,y,w,h"` → crop rectangle.
pub fn parse_crop(s: &str) -> Result<CropRegion, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("'{p}': {e}")))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x, y, w, h] if *w > 0.0 && *h > 0.0 => Ok(CropRegion::new(*x, *y, *w, *h)),
        [_, _, _, _] => Err("crop width and height must be positive".to_string()),
        _ => Err(format!("expected X,Y,W,H, got '{s}'")),
    }
}

/// `"#rrggbb"` / `"#rrggbbaa"` (leading `#` optional).
pub fn parse_hex_color(s: &str) -> Result<Rgba<u8>, String> {
    let hex = s.trim().trim_start_matches('#');
    if !hex.is_ascii() {
        return Err(format!("expected #rrggbb or #rrggbbaa, got '{s}'"));
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| format!("'{s}': {e}"));
    match hex.len() {
        6 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => Err(format!("expected #rrggbb or #rrggbbaa, got '{s}'")),
    }
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, used for single-file input)
/// 2. `--output-dir` (batch directory, derives filename from input stem)
/// 3. Fallback: same directory as input, same stem, new extension
///    (appends `_out` to stem if it would collide with the input path)
pub fn build_output_path(
    input: &Path,
    output: Option<&Path>,
    output_dir: Option<&Path>,
    format: ExportFormat,
) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }

    let ext = format.extension();
    let stem = input.file_stem()?.to_string_lossy().into_owned();

    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{stem}.{ext}")));
    }

    let parent = input.parent().unwrap_or(Path::new("."));
    let candidate = parent.join(format!("{stem}.{ext}"));
    if candidate == input {
        Some(parent.join(format!("{stem}_out.{ext}")))
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::RasterImage;

    fn solid(w: u32, h: u32, color: [u8; 4]) -> RasterImage {
        RasterImage::filled(w, h, Rgba(color))
    }

    #[test]
    fn crop_argument_parsing() {
        assert_eq!(parse_crop("10, 20,300,200"), Ok(CropRegion::new(10.0, 20.0, 300.0, 200.0)));
        assert!(parse_crop("1,2,3").is_err());
        assert!(parse_crop("1,2,0,4").is_err());
        assert!(parse_crop("a,b,c,d").is_err());
    }

    #[test]
    fn hex_colors() {
        assert_eq!(parse_hex_color("#1e3a8a"), Ok(Rgba([0x1e, 0x3a, 0x8a, 255])));
        assert_eq!(parse_hex_color("ffffff80"), Ok(Rgba([255, 255, 255, 0x80])));
        assert!(parse_hex_color("#fff").is_err());
        assert!(parse_hex_color("#zzzzzz").is_err());
    }

    #[test]
    fn output_path_never_overwrites_input() {
        let input = Path::new("shots/a.png");
        assert_eq!(
            build_output_path(input, None, None, ExportFormat::Png),
            Some(PathBuf::from("shots/a_out.png"))
        );
        assert_eq!(
            build_output_path(input, None, None, ExportFormat::Jpeg),
            Some(PathBuf::from("shots/a.jpg"))
        );
        assert_eq!(
            build_output_path(input, None, Some(Path::new("out")), ExportFormat::Webp),
            Some(PathBuf::from("out/a.webp"))
        );
    }

    #[test]
    fn pipeline_crops_flips_and_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.png");
        let output = dir.path().join("out.png");
        io::encode_and_write(&solid(80, 60, [10, 20, 30, 255]), &input, ExportFormat::Png, 90).expect("write");

        let plan = Plan {
            crop: Some(CropRegion::new(10.0, 10.0, 40.0, 30.0)),
            rotation: 0.0,
            turns: 1,
            flip: Some(true),
            key_background: false,
            background: None,
            watermark: None,
            format: ExportFormat::Png,
            quality: 90,
        };
        let labels = run_one(&input, &output, &plan, &EngineSettings::default()).expect("run");
        assert_eq!(labels, vec!["Open in.png", "Crop", "Rotate right", "Flip horizontal"]);

        let written = io::load_image_sync(&output).expect("read back");
        assert_eq!(written.dimensions(), (30, 40));
    }
}
