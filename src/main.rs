use clap::{Parser, Subcommand};
use simple_edit::config::{self, CONFIG_FILENAME};
use simple_edit::host::TracingNotifier;
use simple_edit::imaging::{
    FilterKind, ImageData, ResizeTarget, Rotation, TextWatermark, Transform, watermark,
};
use simple_edit::output::{self, RenderSummary};
use simple_edit::preview::{PreviewOrchestrator, RenderOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "simple-edit")]
#[command(about = "Headless photo editor: filters, watermarks, transforms")]
#[command(long_about = "\
Headless photo editor: filters, watermarks, transforms

Runs the same preview pipeline an interactive editor uses: filters are
applied in a fixed order (brightness, contrast, saturation, hue, sepia,
grayscale, invert, blur), large images are processed on worker threads,
and watermarks are drawn last.

Examples:

  simple-edit render photo.jpg --preset vintage
  simple-edit render photo.jpg -o out.png --filter brightness=20 --filter blur=2
  simple-edit render photo.jpg --rotate 90 --resize 1200x800 --text '(c) 2024' --font DejaVuSans.ttf

Logging goes to stderr; set RUST_LOG=simple_edit=debug for detail.
Run 'simple-edit gen-config' to generate a documented simple-edit.toml.")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./simple-edit.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Image to edit
    input: PathBuf,

    /// Output file; the format follows the extension [default: <input>-edit.png]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Start from a named preset (see `simple-edit presets`)
    #[arg(long)]
    preset: Option<String>,

    /// Set a filter, e.g. `brightness=20`. Repeatable; applied after the preset.
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(FilterKind, f64)>,

    /// Clockwise rotation in degrees (multiple of 90)
    #[arg(long, value_parser = parse_rotation)]
    rotate: Option<Rotation>,

    #[arg(long)]
    flip_h: bool,

    #[arg(long)]
    flip_v: bool,

    /// Resize to WIDTHxHEIGHT before filtering
    #[arg(long, value_parser = parse_resize)]
    resize: Option<ResizeTarget>,

    /// Text watermark
    #[arg(long)]
    text: Option<String>,

    /// Font for the text watermark (overrides `watermark.font_path`)
    #[arg(long)]
    font: Option<PathBuf>,

    /// Process everything on the calling thread
    #[arg(long)]
    no_workers: bool,

    /// Print pipeline metrics after rendering
    #[arg(long)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Apply edits to an image and write the result
    Render(RenderArgs),
    /// List the built-in filter presets
    Presets,
    /// Print a stock simple-edit.toml with all options documented
    GenConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Render(args) => {
            let config_path = cli
                .config
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));
            render(&config_path, args).await?;
        }
        Command::Presets => {
            output::print_presets();
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

async fn render(config_path: &Path, args: RenderArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = config::load_config(config_path)?;
    if args.no_workers {
        config.workers.enabled = false;
    }

    let source = image::open(&args.input)?.to_rgba8();
    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input));

    let mut builder = PreviewOrchestrator::builder(config).notifier(Arc::new(TracingNotifier));
    if let Some(path) = &args.font {
        builder = builder.font(watermark::load_font(path)?);
    }
    let editor = builder.build();

    editor.load_image(ImageData::from_rgba_image(source))?;
    if let Some(name) = &args.preset {
        editor.apply_preset(name)?;
    }
    for (kind, value) in &args.filters {
        editor.apply_filter(Some(*kind), Some(*value));
    }
    let transform = Transform {
        rotation: args.rotate.unwrap_or_default(),
        flip_horizontal: args.flip_h,
        flip_vertical: args.flip_v,
        resize: args.resize,
    };
    editor.set_transform(transform);
    if let Some(text) = &args.text {
        editor.set_text_watermark(Some(TextWatermark {
            text: text.clone(),
            ..TextWatermark::default()
        }));
    }

    let outcome = editor.render_preview().await?;
    editor.export_frame(&output_path)?;

    let dimensions = editor
        .current_frame()
        .map(|f| f.dimensions())
        .unwrap_or_default();
    let path = match outcome {
        RenderOutcome::Rendered(path) => path.name(),
        RenderOutcome::Skipped => "unchanged",
    };
    output::print_render_output(&RenderSummary {
        input: &args.input,
        output: &output_path,
        dimensions,
        path,
        filters: editor.filters(),
        transform,
        watermark_text: args.text.as_deref(),
    });
    if args.metrics {
        output::print_metrics(&editor.get_performance_metrics());
    }
    editor.shutdown();
    Ok(())
}

/// `photo.jpg` → `photo-edit.png` next to the input.
fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    input.with_file_name(format!("{stem}-edit.png"))
}

fn parse_filter(s: &str) -> Result<(FilterKind, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))?;
    let kind: FilterKind = name.parse().map_err(|e| format!("{e}"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("`{value}` is not a number"))?;
    if !value.is_finite() {
        return Err(format!("`{value}` is not a finite number"));
    }
    Ok((kind, value))
}

fn parse_rotation(s: &str) -> Result<Rotation, String> {
    let degrees: i32 = s.trim().parse().map_err(|_| format!("`{s}` is not a number"))?;
    Rotation::from_degrees(degrees).ok_or_else(|| format!("{degrees} is not a multiple of 90"))
}

fn parse_resize(s: &str) -> Result<ResizeTarget, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{s}`"))?;
    let width: u32 = w.trim().parse().map_err(|_| format!("bad width `{w}`"))?;
    let height: u32 = h.trim().parse().map_err(|_| format!("bad height `{h}`"))?;
    if width == 0 || height == 0 {
        return Err("dimensions must be positive".to_string());
    }
    Ok(ResizeTarget { width, height })
}
