use anyhow::{Context, Result, anyhow};
use image::ImageFormat;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub mod bubble;
pub mod data;
pub mod layout;
pub mod logging;
pub mod ocr;
pub mod providers;
pub mod render;
pub mod settings;
pub mod translations;
pub mod translator;

#[cfg(test)]
mod test_util;

use bubble::{BubbleKind, merge_regions};
use layout::{Fitter, OverlayFont, OverlayFonts, overlay_fallback_fonts, resolve_overlay_font};
use ocr::{Detector, DetectorContext, JsonDetections, TesseractDetector};
use render::{OverlayStyle, PageCanvas, RenderedPage, render_page, render_svg_bytes};
use settings::{FontChoice, LayoutMode, Settings};
use translations::{BatchOrchestrator, TranslationStrategy};

pub use providers::{Provider, ProviderKind, ProviderUsage};
pub use translator::Translator;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub image: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub detections: Option<PathBuf>,
    pub model: Option<String>,
    pub key: Option<String>,
    pub source_lang: Option<String>,
    pub lang: Option<String>,
    pub ocr_languages: Option<String>,
    pub mode: Option<String>,
    pub strategy: Option<String>,
    pub settings_path: Option<String>,
    pub debug_report: Option<PathBuf>,
    pub show_ocr_languages: bool,
}

/// Outcome of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub regions: usize,
    pub failed: usize,
    pub output: PathBuf,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rendered {} regions ({} failed) -> {}",
            self.regions,
            self.failed,
            self.output.display()
        )
    }
}

#[derive(Serialize)]
struct DebugReport<'a> {
    image: String,
    mode: &'static str,
    strategy: TranslationStrategy,
    #[serde(flatten)]
    page: &'a RenderedPage,
}

pub async fn run(config: Config, detectors: &DetectorContext) -> Result<String> {
    if config.show_ocr_languages {
        return Ok(ocr::list_tesseract_languages()?.join("\n"));
    }
    let summary = translate_page(config, detectors).await?;
    Ok(summary.to_string())
}

/// Detects, translates and re-renders a single page.
pub async fn translate_page(config: Config, detectors: &DetectorContext) -> Result<RunSummary> {
    let image_path = config
        .image
        .clone()
        .ok_or_else(|| anyhow!("--image is required"))?;
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    apply_overrides(&mut settings, &config)?;

    let output = config
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&image_path));
    let format = ImageFormat::from_path(&output)
        .with_context(|| format!("unsupported output format: {}", output.display()))?;

    let attachment = data::load_image_attachment(&image_path)?;
    let page = image::load_from_memory(&attachment.bytes)
        .with_context(|| format!("failed to decode image: {}", image_path.display()))?;
    let (width, height) = (page.width(), page.height());
    info!("page {}x{}: {}", width, height, image_path.display());

    // Detections files belong to one page; only the OCR engine is shared.
    let detector: Arc<dyn Detector> = match &config.detections {
        Some(path) => Arc::new(JsonDetections::load(path)?),
        None => detectors.handle(|| -> Result<Arc<dyn Detector>> {
            Ok(Arc::new(TesseractDetector::initialize(
                &settings.detection.languages,
            )?))
        })?,
    };
    let raw = detector
        .detect(&page)
        .with_context(|| format!("{} detection failed", detector.name()))?;
    let regions = bubble::ingest_detections(&raw, width, height, &settings.detection.ingest_options());
    let regions = merge_regions(regions, settings.merge.overlap_threshold);
    info!("{} regions after merge", regions.len());

    let fonts = resolve_fonts(&settings);
    let fitter = Fitter::new(fonts.clone(), settings.layout.ladder(), settings.layout.padding);

    let selection =
        providers::resolve_provider_selection(config.model.as_deref(), config.key.as_deref())?;
    let key = providers::resolve_key(selection.provider, config.key.as_deref())?;
    let model = selection
        .requested_model
        .clone()
        .unwrap_or_else(|| selection.provider.default_model().to_string());
    let provider = providers::build_provider(selection.provider, key, model);
    info!("translating with {}", provider.name());
    let options = settings.translation.batch_options();
    let sentinel = options.sentinel.clone();
    let orchestrator = BatchOrchestrator::new(Translator::new(provider), options);

    let style = OverlayStyle::from_settings(&settings.overlay, settings.layout.mode);
    // resvg only embeds PNG, JPEG and GIF, so the page is always re-encoded.
    let background = data::DataAttachment::png(&page, "page.png")?;
    let mut canvas = PageCanvas::new(
        &background.bytes,
        &background.mime,
        width,
        height,
        style,
        fonts.clone(),
    );
    let rendered = render_page(
        &mut canvas,
        &orchestrator,
        settings.translation.strategy,
        &fitter,
        &page,
        regions,
    )
    .await;

    let bytes = render_svg_bytes(&canvas.finish(), format, &fonts.font_data())?;
    std::fs::write(&output, bytes)
        .with_context(|| format!("failed to write output: {}", output.display()))?;

    if let Some(report_path) = &config.debug_report {
        let report = DebugReport {
            image: image_path.display().to_string(),
            mode: settings.layout.mode.as_str(),
            strategy: settings.translation.strategy,
            page: &rendered,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(report_path, json).with_context(|| {
            format!("failed to write debug report: {}", report_path.display())
        })?;
        info!("debug report: {}", report_path.display());
    }

    Ok(RunSummary {
        regions: rendered.regions.len(),
        failed: rendered.failed_count(&sentinel),
        output,
    })
}

fn apply_overrides(settings: &mut Settings, config: &Config) -> Result<()> {
    if let Some(lang) = non_blank(config.source_lang.as_deref()) {
        settings.translation.source_language = lang.to_string();
    }
    if let Some(lang) = non_blank(config.lang.as_deref()) {
        settings.translation.target_language = lang.to_string();
    }
    if let Some(languages) = non_blank(config.ocr_languages.as_deref()) {
        settings.detection.languages = languages.to_string();
    }
    if let Some(mode) = non_blank(config.mode.as_deref()) {
        settings.layout.mode = mode.parse::<LayoutMode>()?;
    }
    if let Some(strategy) = non_blank(config.strategy.as_deref()) {
        settings.translation.strategy = strategy.parse::<TranslationStrategy>()?;
    }
    Ok(())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Resolves each distinct font choice once; kinds sharing a choice share the
/// loaded font data.
fn resolve_fonts(settings: &Settings) -> OverlayFonts {
    let overlay = &settings.overlay;
    let normal = resolve_font(BubbleKind::Normal, &overlay.font);
    let shout = if overlay.shout_font() == &overlay.font {
        normal.clone()
    } else {
        resolve_font(BubbleKind::Shout, overlay.shout_font())
    };
    let whisper = if overlay.whisper_font() == &overlay.font {
        normal.clone()
    } else if overlay.whisper_font() == overlay.shout_font() {
        shout.clone()
    } else {
        resolve_font(BubbleKind::Whisper, overlay.whisper_font())
    };
    OverlayFonts {
        normal,
        shout,
        whisper,
    }
}

fn resolve_font(kind: BubbleKind, choice: &FontChoice) -> OverlayFont {
    let path = choice.font_path.as_deref().map(Path::new);
    match resolve_overlay_font(path, choice.font_family.as_deref(), overlay_fallback_fonts()) {
        Ok(font) => font,
        Err(err) => {
            warn!(
                "{} font unavailable ({}), using estimated metrics",
                kind.as_str(),
                err
            );
            OverlayFont::default()
        }
    }
}

fn default_output_path(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("page");
    image.with_file_name(format!("{}.translated.png", stem))
}
