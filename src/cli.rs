// ============================================================================
// BananaSlice CLI: headless mask, normalize and composite commands
// ============================================================================
//
// Usage examples:
//   bananaslice mask -i photo.png --rect 10,20,50,50 --transform 0,0,2,2 -o mask.png
//   bananaslice mask -i photo.png --polygon "10,10;90,15;50,80" --feather 6 -o mask.png --result-mask clip.png
//   bananaslice normalize --size 300x100
//   bananaslice composite project.bsp -o flat.jpg
//   bananaslice patch --base photo.png --patch fill.png --x 40 --y 30 --width 128 --height 128 -o out.png
//
// Everything runs synchronously on the current thread.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};

use crate::canvas::{ImageTransform, PolygonPoint};
use crate::io::{self, ExportFormat};
use crate::ops::aspect;
use crate::ops::composite::{self, CompositeRequest};
use crate::ops::inpaint;
use crate::ops::selection::Selection;
use crate::project;
use crate::settings::Settings;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// BananaSlice headless selection and compositing tools.
#[derive(Parser, Debug)]
#[command(
    name = "bananaslice",
    about = "BananaSlice headless selection, mask and compositing tools"
)]
pub struct CliArgs {
    /// Print timing information.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the inpainting mask for a selection on an image.
    Mask {
        /// Source image.
        #[arg(short, long)]
        input: PathBuf,
        /// Rectangle selection in canvas space: x,y,w,h
        #[arg(long, value_parser = parse_rect, conflicts_with = "polygon")]
        rect: Option<Selection>,
        /// Lasso selection in canvas space: "x,y;x,y;x,y..."
        #[arg(long, value_parser = parse_polygon)]
        polygon: Option<Selection>,
        /// Canvas placement of the image: offsetX,offsetY,scaleX,scaleY
        #[arg(long, value_parser = parse_transform)]
        transform: Option<ImageTransform>,
        /// Feather radius for the lasso result mask.
        #[arg(long, default_value_t = 0.0)]
        feather: f32,
        /// Send the whole image as context, marking only the selection.
        #[arg(long)]
        context: bool,
        /// Inpainting mask output (PNG).
        #[arg(short, long)]
        output: PathBuf,
        /// Optional result mask output for lasso selections (PNG).
        #[arg(long)]
        result_mask: Option<PathBuf>,
        /// Also write the cropped source region (PNG).
        #[arg(long)]
        crop: Option<PathBuf>,
    },
    /// Print the nearest supported aspect ratio for a size.
    Normalize {
        /// Size as WxH
        #[arg(long, value_parser = parse_size)]
        size: (u32, u32),
        /// Ratio tolerance (defaults to the configured value).
        #[arg(long)]
        tolerance: Option<f64>,
    },
    /// Flatten a project file (.bsp or .json) to an image.
    Composite {
        project: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// png, jpeg or webp; inferred from the output extension when omitted.
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Alpha-blend a patch onto a base image.
    Patch {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        patch: PathBuf,
        #[arg(long, default_value_t = 0)]
        x: u32,
        #[arg(long, default_value_t = 0)]
        y: u32,
        /// Resize the patch to this width (with --height) before blending.
        #[arg(long, default_value_t = 0)]
        width: u32,
        #[arg(long, default_value_t = 0)]
        height: u32,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        format: Option<String>,
    },
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run one command and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let settings = Settings::load_or_init();
    let start = Instant::now();
    let verbose = args.verbose;
    match execute(args.command, &settings) {
        Ok(()) => {
            if verbose {
                println!("done in {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            crate::log_err!("CLI command failed: {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

pub fn execute(command: Command, settings: &Settings) -> Result<(), String> {
    match command {
        Command::Mask {
            input,
            rect,
            polygon,
            transform,
            feather,
            context,
            output,
            result_mask,
            crop,
        } => {
            let selection = rect.or(polygon);
            let transform = transform.unwrap_or_default();
            run_mask(&input, selection.as_ref(), &transform, feather, context, &output, result_mask.as_deref(), crop.as_deref(), settings)
        }
        Command::Normalize { size, tolerance } => {
            let line = normalize_line(size.0, size.1, tolerance.unwrap_or(settings.aspect_tolerance))?;
            println!("{}", line);
            Ok(())
        }
        Command::Composite { project, output, format } => {
            let format = resolve_format(format.as_deref(), &output, settings);
            run_composite(&project, &output, format)
        }
        Command::Patch {
            base,
            patch,
            x,
            y,
            width,
            height,
            output,
            format,
        } => {
            let format = resolve_format(format.as_deref(), &output, settings);
            run_patch(&base, &patch, x, y, width, height, &output, format)
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn run_mask(
    input: &Path,
    selection: Option<&Selection>,
    transform: &ImageTransform,
    feather: f32,
    context: bool,
    output: &Path,
    result_mask: Option<&Path>,
    crop: Option<&Path>,
    settings: &Settings,
) -> Result<(), String> {
    let image = io::load_image(input).map_err(|e| format!("could not load '{}': {}", input.display(), e))?;
    let mut options = settings.fill_options("");
    options.feather_radius = feather;
    options.full_image_context = context;

    let prepared = inpaint::prepare_fill(&image, transform, selection, &options).map_err(|e| e.to_string())?;
    io::save_mask(&prepared.mask, output).map_err(|e| e.to_string())?;
    if let Some(path) = result_mask {
        match &prepared.result_mask {
            Some(mask) => io::save_mask(mask, path).map_err(|e| e.to_string())?,
            None => eprintln!("warning: result mask only applies to polygon selections"),
        }
    }
    if let Some(path) = crop {
        io::save_image(&prepared.cropped, path, ExportFormat::Png).map_err(|e| e.to_string())?;
    }

    let s = prepared.selection;
    let p = prepared.processing;
    println!("selection {},{} {}x{}", s.x, s.y, s.width, s.height);
    println!("processing {},{} {}x{}", p.x, p.y, p.width, p.height);
    Ok(())
}

fn normalize_line(width: u32, height: u32, tolerance: f64) -> Result<String, String> {
    let adj = aspect::normalize(width, height, tolerance).ok_or("size must be non-zero")?;
    Ok(format!(
        "{} {}x{}{}",
        adj.ratio.label(),
        adj.width,
        adj.height,
        if adj.needs_adjustment { " (expanded)" } else { "" }
    ))
}

fn run_composite(project_path: &Path, output: &Path, format: ExportFormat) -> Result<(), String> {
    let stack = project::load_project(project_path).map_err(|e| e.to_string())?;
    let flat = composite::flatten(&stack);
    io::save_image(&flat, output, format).map_err(|e| e.to_string())
}

fn run_patch(
    base: &Path,
    patch: &Path,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    output: &Path,
    format: ExportFormat,
) -> Result<(), String> {
    let (base_b64, _, _) = io::load_image_base64(base).map_err(|e| format!("could not load '{}': {}", base.display(), e))?;
    let (patch_b64, _, _) =
        io::load_image_base64(patch).map_err(|e| format!("could not load '{}': {}", patch.display(), e))?;
    let request = CompositeRequest {
        base_image_base64: base_b64,
        patch_image_base64: patch_b64,
        x,
        y,
        target_width: width,
        target_height: height,
        format: format.name().to_string(),
    };
    let response = composite::composite_patch(&request);
    match (response.success, response.image_base64) {
        (true, Some(data)) => {
            let image = io::decode_base64_image(&data).map_err(|e| e.to_string())?;
            io::save_image(&image, output, format).map_err(|e| e.to_string())
        }
        _ => Err(response.error.unwrap_or_else(|| "composite failed".to_string())),
    }
}

fn resolve_format(explicit: Option<&str>, output: &Path, settings: &Settings) -> ExportFormat {
    match explicit {
        Some(name) => ExportFormat::parse(name),
        None if output.extension().is_some() => ExportFormat::from_path(output),
        None => settings.export_format,
    }
}

// ============================================================================
// Argument parsers
// ============================================================================

fn parse_numbers(s: &str, expected: usize) -> Result<Vec<f64>, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|_| format!("'{}' is not a number", v.trim())))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != expected {
        return Err(format!("expected {} comma-separated values, got {}", expected, values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err("values must be finite".to_string());
    }
    Ok(values)
}

pub fn parse_rect(s: &str) -> Result<Selection, String> {
    let v = parse_numbers(s, 4)?;
    Ok(Selection::rectangle(v[0], v[1], v[2], v[3]))
}

pub fn parse_polygon(s: &str) -> Result<Selection, String> {
    let points = s
        .split(';')
        .filter(|p| !p.trim().is_empty())
        .map(|p| parse_numbers(p, 2).map(|v| PolygonPoint::new(v[0], v[1])))
        .collect::<Result<Vec<_>, _>>()?;
    if points.len() < 3 {
        return Err("a polygon needs at least 3 points".to_string());
    }
    Ok(Selection::Polygon(points))
}

pub fn parse_transform(s: &str) -> Result<ImageTransform, String> {
    let v = parse_numbers(s, 4)?;
    ImageTransform::new(v[0], v[1], v[2], v[3]).ok_or_else(|| "scales must be positive".to_string())
}

pub fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("'{}' is not WxH", s))?;
    let w = w.trim().parse::<u32>().map_err(|e| e.to_string())?;
    let h = h.trim().parse::<u32>().map_err(|e| e.to_string())?;
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn parses_selection_arguments() {
        assert_eq!(parse_rect("10, 20,50,50").unwrap(), Selection::rectangle(10.0, 20.0, 50.0, 50.0));
        assert!(parse_rect("1,2,3").is_err());
        assert!(parse_polygon("0,0;10,0").is_err());
        assert!(parse_polygon("0,0;10,0;5,8;").unwrap().is_polygon());
        assert!(parse_transform("0,0,0,1").is_err());
        assert_eq!(parse_size("300x100").unwrap(), (300, 100));
        assert!(parse_size("300").is_err());
    }

    #[test]
    fn clap_accepts_mask_command() {
        let args = CliArgs::try_parse_from([
            "bananaslice",
            "mask",
            "-i",
            "in.png",
            "--rect",
            "10,20,50,50",
            "--transform",
            "0,0,2,2",
            "-o",
            "mask.png",
        ])
        .unwrap();
        match args.command {
            Command::Mask { rect, transform, .. } => {
                assert!(rect.is_some());
                assert_eq!(transform.map(|t| t.scale_x), Some(2.0));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn normalize_reports_ratio_and_size() {
        assert_eq!(normalize_line(300, 100, 0.01).unwrap(), "21:9 300x129 (expanded)");
        assert_eq!(normalize_line(1920, 1080, 0.01).unwrap(), "16:9 1920x1080");
        assert!(normalize_line(0, 5, 0.01).is_err());
    }

    #[test]
    fn mask_command_writes_scaled_mask() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.png");
        io::save_image(&RgbaImage::from_pixel(200, 150, Rgba([9, 9, 9, 255])), &input, ExportFormat::Png).unwrap();
        let output = dir.path().join("mask.png");

        let command = Command::Mask {
            input,
            rect: Some(Selection::rectangle(10.0, 20.0, 50.0, 50.0)),
            polygon: None,
            transform: ImageTransform::new(0.0, 0.0, 2.0, 2.0),
            feather: 0.0,
            context: false,
            output: output.clone(),
            result_mask: None,
            crop: None,
        };
        execute(command, &Settings::default()).unwrap();
        let mask = image::open(&output).unwrap().into_luma8();
        assert_eq!(mask.dimensions(), (25, 25));
    }

    #[test]
    fn mask_command_rejects_out_of_bounds_selection() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.png");
        io::save_image(&RgbaImage::new(20, 20), &input, ExportFormat::Png).unwrap();
        let command = Command::Mask {
            input,
            rect: Some(Selection::rectangle(500.0, 500.0, 10.0, 10.0)),
            polygon: None,
            transform: None,
            feather: 0.0,
            context: false,
            output: dir.path().join("mask.png"),
            result_mask: None,
            crop: None,
        };
        assert!(execute(command, &Settings::default()).is_err());
    }

    #[test]
    fn patch_command_blends_onto_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.png");
        let patch = dir.path().join("patch.png");
        io::save_image(&RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255])), &base, ExportFormat::Png).unwrap();
        io::save_image(&RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 255])), &patch, ExportFormat::Png).unwrap();
        let output = dir.path().join("out.png");

        let command = Command::Patch {
            base,
            patch,
            x: 2,
            y: 2,
            width: 4,
            height: 4,
            output: output.clone(),
            format: None,
        };
        execute(command, &Settings::default()).unwrap();
        let out = image::open(&output).unwrap().into_rgba8();
        assert_eq!(*out.get_pixel(3, 3), Rgba([255, 255, 255, 255]));
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert_eq!(*out.get_pixel(6, 6), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn format_resolution_prefers_explicit_then_extension() {
        let settings = Settings { export_format: ExportFormat::Webp, ..Settings::default() };
        assert_eq!(resolve_format(Some("jpg"), Path::new("a.png"), &settings), ExportFormat::Jpeg);
        assert_eq!(resolve_format(None, Path::new("a.png"), &settings), ExportFormat::Png);
        assert_eq!(resolve_format(None, Path::new("a"), &settings), ExportFormat::Webp);
    }
}
