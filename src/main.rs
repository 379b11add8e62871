use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use manhwa_overlay_rust::ocr::DetectorContext;

#[derive(Parser, Debug)]
#[command(
    name = "manhwa-overlay-rust",
    version,
    about = "Replace speech-bubble text on a manhwa page with its translation"
)]
struct Cli {
    /// Source page image
    #[arg(long = "image", required_unless_present = "show_ocr_languages")]
    image: Option<PathBuf>,

    /// Output image (default: <image>.translated.png); format follows the extension
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Pre-computed detections (JSON array) instead of running tesseract
    #[arg(long = "detections")]
    detections: Option<PathBuf>,

    /// Model name or provider:model (e.g. gemini:gemini-2.5-flash)
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// API key (overrides environment variables); TEST runs offline
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Source language name used in prompts (default from settings: Korean)
    #[arg(short = 'L', long = "source-lang")]
    source_lang: Option<String>,

    /// Target language name used in prompts (default from settings: English)
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// Tesseract language codes, joined with '+' (e.g. kor+eng)
    #[arg(long = "ocr-lang")]
    ocr_lang: Option<String>,

    /// Overlay mode: glass or solid
    #[arg(long = "mode")]
    mode: Option<String>,

    /// Translate one bubble per request instead of in batches
    #[arg(long = "single", conflicts_with = "strategy")]
    single: bool,

    /// Translation strategy: batch or single
    #[arg(long = "strategy")]
    strategy: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Write regions, layout plans and oracle exchanges as JSON
    #[arg(long = "debug-report")]
    debug_report: Option<PathBuf>,

    /// Show installed tesseract languages and exit
    #[arg(long = "show-ocr-languages")]
    show_ocr_languages: bool,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    manhwa_overlay_rust::logging::init(cli.verbose)?;

    let strategy = if cli.single {
        Some("single".to_string())
    } else {
        cli.strategy
    };
    let detectors = DetectorContext::new();
    let output = manhwa_overlay_rust::run(
        manhwa_overlay_rust::Config {
            image: cli.image,
            output: cli.output,
            detections: cli.detections,
            model: cli.model,
            key: cli.key,
            source_lang: cli.source_lang,
            lang: cli.lang,
            ocr_languages: cli.ocr_lang,
            mode: cli.mode,
            strategy,
            settings_path: cli.read_settings,
            debug_report: cli.debug_report,
            show_ocr_languages: cli.show_ocr_languages,
        },
        &detectors,
    )
    .await?;

    println!("{}", output);
    Ok(())
}
