// ============================================================================
// PaintStack CLI: headless compositing and conversion
// ============================================================================
//
// Usage examples:
//   paintstack -i project.pfs -o flat.png
//   paintstack -i project.pfs -o crop.jpg --region 0,0,256,256 --quality 85
//   paintstack -i *.pfs --output-dir renders/ --format png
//   paintstack -i photo.jpg -o photo.pfs              (raster -> project)
//   paintstack -i project.pfs --tree                  (print the layer tree)
//
// All processing runs on the calling thread; compositing itself fans out
// over rayon.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::compositor;
use crate::geometry::PixelRect;
use crate::io::{ExportFormat, encode_and_write, load_image, save_pfs};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// PaintStack headless compositor.
#[derive(Parser, Debug)]
#[command(
    name = "paintstack",
    version,
    about = "Composite layered .pfs projects and convert images without a UI",
    long_about = "Load .pfs projects or raster images (PNG, JPEG, WEBP, BMP, TGA, ICO,\n\
                  TIFF), composite every visible layer and write the result as PNG,\n\
                  JPEG, BMP, TGA or a .pfs project.\n\n\
                  Example:\n  \
                  paintstack -i project.pfs -o flat.png\n  \
                  paintstack -i *.pfs --output-dir out/ --format jpg --quality 85"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.pfs", "shots/*.png").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png, jpg, bmp, tga, pfs.
    /// When omitted, the format is inferred from --output's extension, defaulting to png.
    #[arg(short, long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// JPEG quality (1–100).
    #[arg(short, long, default_value_t = 90, value_name = "1-100")]
    pub quality: u8,

    /// Composite only this canvas rectangle: x,y,width,height.
    #[arg(long, value_name = "X,Y,W,H", value_parser = parse_region)]
    pub region: Option<PixelRect>,

    /// Print each input's layer tree instead of writing output.
    #[arg(long)]
    pub tree: bool,

    /// Print per-file timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Where a processed file goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Raster(ExportFormat),
    Project,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Raster(f) => f.extension(),
            OutputFormat::Project => "pfs",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        if ext.eq_ignore_ascii_case("pfs") {
            return Some(OutputFormat::Project);
        }
        ExportFormat::from_extension(ext).map(OutputFormat::Raster)
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if args.tree {
        let mut any_failure = false;
        for input in &inputs {
            match load_image(input) {
                Ok(stack) => {
                    println!("{} ({}x{})", input.display(), stack.width(), stack.height());
                    print!("{}", stack.describe_tree());
                }
                Err(e) => {
                    eprintln!("error: {}: {e}", input.display());
                    any_failure = true;
                }
            }
        }
        return if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS };
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let format = match parse_format(args.format.as_deref(), args.output.as_deref()) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if format == OutputFormat::Project && args.region.is_some() {
        eprintln!("error: --region only applies to flattened output formats.");
        return ExitCode::FAILURE;
    }

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {e}", dir.display());
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }
        let file_start = Instant::now();

        let Some(output_path) = build_output_path(input_path, args.output.as_deref(), args.output_dir.as_deref(), format)
        else {
            eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
            any_failure = true;
            continue;
        };

        match run_one(input_path, &output_path, format, args.quality, args.region) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                tracing::error!(input = %input_path.display(), "{e}");
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

fn run_one(input: &Path, output: &Path, format: OutputFormat, quality: u8, region: Option<PixelRect>) -> Result<(), String> {
    let stack = load_image(input).map_err(|e| format!("load failed: {e}"))?;

    match format {
        OutputFormat::Project => save_pfs(&stack, output).map_err(|e| format!("project save failed: {e}"))?,
        OutputFormat::Raster(export) => {
            let image = match region {
                Some(rect) => compositor::composite_region(&stack, rect).map_err(|e| format!("composite failed: {e}"))?,
                None => compositor::composite(&stack),
            };
            encode_and_write(&image, output, export, quality).map_err(|e| format!("save failed: {e}"))?;
        }
    }
    Ok(())
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

/// `--format` wins over the output extension; PNG when neither is known.
fn parse_format(format_arg: Option<&str>, output: Option<&Path>) -> Result<OutputFormat, String> {
    if let Some(f) = format_arg {
        return OutputFormat::from_extension(f).ok_or_else(|| format!("unknown format '{f}' (png, jpg, bmp, tga, pfs)"));
    }
    Ok(output
        .and_then(|out| out.extension())
        .and_then(|e| e.to_str())
        .and_then(OutputFormat::from_extension)
        .unwrap_or(OutputFormat::Raster(ExportFormat::Png)))
}

fn parse_region(s: &str) -> Result<PixelRect, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, w, h] = parts.as_slice() else {
        return Err(format!("expected X,Y,W,H, got '{s}'"));
    };
    let num = |v: &str| v.parse::<i64>().map_err(|e| format!("'{v}': {e}"));
    let (x, y, w, h) = (num(x)?, num(y)?, num(w)?, num(h)?);
    if w <= 0 || h <= 0 {
        return Err("region width and height must be positive".to_string());
    }
    let fit = |v: i64| i32::try_from(v).map_err(|_| format!("{v} is out of range"));
    Ok(PixelRect::new(fit(x)?, fit(y)?, fit(w)? as u32, fit(h)? as u32))
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, used for single-file input)
/// 2. `--output-dir` (batch directory, derives filename from input stem)
/// 3. Fallback: same directory as input, same stem, new extension
///    (appends `_out` to stem if it would collide with the input path)
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>, format: OutputFormat) -> Option<PathBuf> {
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

    #[test]
    fn region_parsing() {
        assert_eq!(parse_region("1, 2,30,40"), Ok(PixelRect::new(1, 2, 30, 40)));
        assert!(parse_region("1,2,3").is_err());
        assert!(parse_region("0,0,0,5").is_err());
        assert!(parse_region("a,0,1,1").is_err());
    }

    #[test]
    fn format_resolution() {
        assert_eq!(parse_format(Some("PFS"), None), Ok(OutputFormat::Project));
        assert_eq!(
            parse_format(None, Some(Path::new("x/out.jpeg"))),
            Ok(OutputFormat::Raster(ExportFormat::Jpeg))
        );
        assert_eq!(parse_format(None, None), Ok(OutputFormat::Raster(ExportFormat::Png)));
        assert!(parse_format(Some("gif"), None).is_err());
    }

    #[test]
    fn output_path_avoids_overwriting_input() {
        let png = OutputFormat::Raster(ExportFormat::Png);
        assert_eq!(
            build_output_path(Path::new("dir/a.png"), None, None, png),
            Some(PathBuf::from("dir/a_out.png"))
        );
        assert_eq!(
            build_output_path(Path::new("dir/a.pfs"), None, Some(Path::new("out")), png),
            Some(PathBuf::from("out/a.png"))
        );
    }

    #[test]
    fn clap_definition_is_consistent() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
        let args = CliArgs::try_parse_from(["paintstack", "-i", "a.pfs", "--region", "0,0,8,8", "--tree"]).unwrap();
        assert!(args.tree);
        assert_eq!(args.region, Some(PixelRect::new(0, 0, 8, 8)));
    }

    #[test]
    fn converts_project_to_png() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.pfs");
        let stack = crate::stack::LayerStack::with_background(4, 3, image::Rgba([1, 2, 3, 255])).unwrap();
        save_pfs(&stack, &src).unwrap();
        let out = dir.path().join("doc.png");
        run_one(&src, &out, OutputFormat::Raster(ExportFormat::Png), 90, Some(PixelRect::new(1, 1, 2, 2))).unwrap();
        let img = image::open(&out).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(*img.get_pixel(0, 0), image::Rgba([1, 2, 3, 255]));
    }
}
