use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::bubble::IngestOptions;
use crate::layout::FontLadder;
use crate::providers::GenerationConfig;
use crate::translations::{BatchOptions, TranslationStrategy};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");
const HOME_DIR_NAME: &str = ".manhwa-overlay-rust";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub detection: DetectionSettings,
    pub merge: MergeSettings,
    pub layout: LayoutSettings,
    pub overlay: OverlaySettings,
    pub translation: TranslationSettings,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub languages: String,
    pub min_confidence: f32,
    pub padding: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub font_hint_floor: u32,
    pub font_hint_scale: f32,
    pub font_hint_blend: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        let ingest = IngestOptions::default();
        Self {
            languages: "kor".to_string(),
            min_confidence: ingest.min_confidence,
            padding: ingest.padding,
            min_width: ingest.min_width,
            min_height: ingest.min_height,
            font_hint_floor: ingest.font_hint_floor,
            font_hint_scale: ingest.font_hint_scale,
            font_hint_blend: ingest.font_hint_blend,
        }
    }
}

impl DetectionSettings {
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            min_confidence: self.min_confidence,
            padding: self.padding,
            min_width: self.min_width,
            min_height: self.min_height,
            font_hint_floor: self.font_hint_floor,
            font_hint_scale: self.font_hint_scale,
            font_hint_blend: self.font_hint_blend,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeSettings {
    pub overlap_threshold: f64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.5,
        }
    }
}

/// Visual pass: translucent plate over the erased bubble, or opaque fill only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutMode {
    #[default]
    Glass,
    Solid,
}

impl LayoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutMode::Glass => "glass",
            LayoutMode::Solid => "solid",
        }
    }

    pub fn ladder(&self) -> FontLadder {
        match self {
            LayoutMode::Glass => FontLadder::GLASS,
            LayoutMode::Solid => FontLadder::SOLID,
        }
    }

    pub fn draws_plate(&self) -> bool {
        matches!(self, LayoutMode::Glass)
    }
}

impl FromStr for LayoutMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "glass" => Ok(LayoutMode::Glass),
            "solid" => Ok(LayoutMode::Solid),
            other => Err(anyhow!("unknown layout mode '{}' (glass, solid)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayoutSettings {
    pub mode: LayoutMode,
    pub ladder_step: Option<u32>,
    pub ladder_floor: Option<u32>,
    pub padding: u32,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            mode: LayoutMode::Glass,
            ladder_step: None,
            ladder_floor: None,
            padding: 10,
        }
    }
}

impl LayoutSettings {
    /// The mode's ladder with any explicit overrides applied.
    pub fn ladder(&self) -> FontLadder {
        let base = self.mode.ladder();
        FontLadder {
            step: self.ladder_step.unwrap_or(base.step),
            floor: self.ladder_floor.unwrap_or(base.floor),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FontChoice {
    pub font_path: Option<String>,
    pub font_family: Option<String>,
}

impl FontChoice {
    fn is_set(&self) -> bool {
        self.font_path.is_some() || self.font_family.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub erase_color: String,
    pub text_color: String,
    pub plate_color: String,
    pub plate_opacity: f32,
    pub plate_padding: u32,
    pub text_inset: u32,
    pub font: FontChoice,
    pub shout: FontChoice,
    pub whisper: FontChoice,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            erase_color: "#ffffff".to_string(),
            text_color: "#000000".to_string(),
            plate_color: "#ffffff".to_string(),
            plate_opacity: 0.47,
            plate_padding: 3,
            text_inset: 5,
            font: FontChoice::default(),
            shout: FontChoice::default(),
            whisper: FontChoice::default(),
        }
    }
}

impl OverlaySettings {
    /// Font for shouted bubbles, falling back to the base font.
    pub fn shout_font(&self) -> &FontChoice {
        if self.shout.is_set() {
            &self.shout
        } else {
            &self.font
        }
    }

    pub fn whisper_font(&self) -> &FontChoice {
        if self.whisper.is_set() {
            &self.whisper
        } else {
            &self.font
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslationSettings {
    pub source_language: String,
    pub target_language: String,
    pub strategy: TranslationStrategy,
    pub batch_size: usize,
    pub sentinel: String,
    pub empty_marker: String,
    pub timeout_secs: u64,
    pub retry_backoff_ms: u64,
    pub batch_temperature: f32,
    pub batch_max_output_tokens: u32,
    pub single_temperature: f32,
    pub single_max_output_tokens: u32,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            source_language: "Korean".to_string(),
            target_language: "English".to_string(),
            strategy: TranslationStrategy::Batch,
            batch_size: 10,
            sentinel: "[Translation failed]".to_string(),
            empty_marker: "[No text detected]".to_string(),
            timeout_secs: 120,
            retry_backoff_ms: 2000,
            batch_temperature: 0.2,
            batch_max_output_tokens: 2000,
            single_temperature: 0.3,
            single_max_output_tokens: 100,
        }
    }
}

impl TranslationSettings {
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size.max(1),
            sentinel: self.sentinel.clone(),
            empty_marker: self.empty_marker.clone(),
            source_language: self.source_language.clone(),
            target_language: self.target_language.clone(),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            batch_generation: GenerationConfig {
                temperature: self.batch_temperature,
                max_output_tokens: self.batch_max_output_tokens,
            },
            single_generation: GenerationConfig {
                temperature: self.single_temperature,
                max_output_tokens: self.single_max_output_tokens,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    detection: Option<DetectionFile>,
    merge: Option<MergeFile>,
    layout: Option<LayoutFile>,
    overlay: Option<OverlayFile>,
    translation: Option<TranslationFile>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionFile {
    languages: Option<String>,
    min_confidence: Option<f32>,
    padding: Option<u32>,
    min_width: Option<u32>,
    min_height: Option<u32>,
    font_hint_floor: Option<u32>,
    font_hint_scale: Option<f32>,
    font_hint_blend: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct MergeFile {
    overlap_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct LayoutFile {
    mode: Option<String>,
    ladder_step: Option<u32>,
    ladder_floor: Option<u32>,
    padding: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct FontFile {
    font_path: Option<String>,
    font_family: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OverlayFile {
    erase_color: Option<String>,
    text_color: Option<String>,
    plate_color: Option<String>,
    plate_opacity: Option<f32>,
    plate_padding: Option<u32>,
    text_inset: Option<u32>,
    font_path: Option<String>,
    font_family: Option<String>,
    shout: Option<FontFile>,
    whisper: Option<FontFile>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslationFile {
    source_language: Option<String>,
    target_language: Option<String>,
    strategy: Option<String>,
    batch_size: Option<usize>,
    sentinel: Option<String>,
    empty_marker: Option<String>,
    timeout_secs: Option<u64>,
    retry_backoff_ms: Option<u64>,
    batch_temperature: Option<f32>,
    batch_max_output_tokens: Option<u32>,
    single_temperature: Option<f32>,
    single_max_output_tokens: Option<u32>,
}

/// Loads the embedded defaults, then every settings file that exists, in
/// increasing priority: working directory, home directory, `extra_path`.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    settings.merge(parse_settings(DEFAULT_SETTINGS_TOML, Path::new("<default>"))?)?;
    ensure_home_settings_file()?;

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];
    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }
    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings.merge(parse_settings(&content, &path)?)?;
        }
    }

    Ok(settings)
}

fn parse_settings(content: &str, path: &Path) -> Result<SettingsFile> {
    toml::from_str(content).with_context(|| format!("failed to parse settings: {}", path.display()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn merge_font(target: &mut FontChoice, font_path: Option<String>, font_family: Option<String>) {
    if let Some(path) = non_empty(font_path) {
        target.font_path = Some(path);
    }
    if let Some(family) = non_empty(font_family) {
        target.font_family = Some(family);
    }
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(detection) = incoming.detection {
            let target = &mut self.detection;
            if let Some(languages) = non_empty(detection.languages) {
                target.languages = languages;
            }
            if let Some(value) = detection.min_confidence {
                target.min_confidence = value.clamp(0.0, 1.0);
            }
            if let Some(value) = detection.padding {
                target.padding = value;
            }
            if let Some(value) = detection.min_width {
                target.min_width = value;
            }
            if let Some(value) = detection.min_height {
                target.min_height = value;
            }
            if let Some(value) = detection.font_hint_floor
                && value > 0
            {
                target.font_hint_floor = value;
            }
            if let Some(value) = detection.font_hint_scale
                && value > 0.0
            {
                target.font_hint_scale = value;
            }
            if let Some(value) = detection.font_hint_blend {
                target.font_hint_blend = value.clamp(0.0, 1.0);
            }
        }
        if let Some(merge) = incoming.merge
            && let Some(threshold) = merge.overlap_threshold
        {
            self.merge.overlap_threshold = threshold;
        }
        if let Some(layout) = incoming.layout {
            if let Some(mode) = non_empty(layout.mode) {
                self.layout.mode = mode.parse()?;
            }
            if let Some(step) = layout.ladder_step
                && step > 0
            {
                self.layout.ladder_step = Some(step);
            }
            if let Some(floor) = layout.ladder_floor
                && floor > 0
            {
                self.layout.ladder_floor = Some(floor);
            }
            if let Some(padding) = layout.padding {
                self.layout.padding = padding;
            }
        }
        if let Some(overlay) = incoming.overlay {
            let target = &mut self.overlay;
            if let Some(color) = non_empty(overlay.erase_color) {
                target.erase_color = color;
            }
            if let Some(color) = non_empty(overlay.text_color) {
                target.text_color = color;
            }
            if let Some(color) = non_empty(overlay.plate_color) {
                target.plate_color = color;
            }
            if let Some(opacity) = overlay.plate_opacity {
                target.plate_opacity = opacity.clamp(0.0, 1.0);
            }
            if let Some(padding) = overlay.plate_padding {
                target.plate_padding = padding;
            }
            if let Some(inset) = overlay.text_inset {
                target.text_inset = inset;
            }
            merge_font(&mut target.font, overlay.font_path, overlay.font_family);
            if let Some(shout) = overlay.shout {
                merge_font(&mut target.shout, shout.font_path, shout.font_family);
            }
            if let Some(whisper) = overlay.whisper {
                merge_font(&mut target.whisper, whisper.font_path, whisper.font_family);
            }
        }
        if let Some(translation) = incoming.translation {
            let target = &mut self.translation;
            if let Some(lang) = non_empty(translation.source_language) {
                target.source_language = lang;
            }
            if let Some(lang) = non_empty(translation.target_language) {
                target.target_language = lang;
            }
            if let Some(strategy) = non_empty(translation.strategy) {
                target.strategy = strategy.parse()?;
            }
            if let Some(size) = translation.batch_size
                && size > 0
            {
                target.batch_size = size;
            }
            if let Some(sentinel) = non_empty(translation.sentinel) {
                target.sentinel = sentinel;
            }
            if let Some(marker) = non_empty(translation.empty_marker) {
                target.empty_marker = marker;
            }
            if let Some(secs) = translation.timeout_secs
                && secs > 0
            {
                target.timeout_secs = secs;
            }
            if let Some(ms) = translation.retry_backoff_ms {
                target.retry_backoff_ms = ms;
            }
            if let Some(value) = translation.batch_temperature {
                target.batch_temperature = value;
            }
            if let Some(value) = translation.batch_max_output_tokens
                && value > 0
            {
                target.batch_max_output_tokens = value;
            }
            if let Some(value) = translation.single_temperature {
                target.single_temperature = value;
            }
            if let Some(value) = translation.single_max_output_tokens
                && value > 0
            {
                target.single_max_output_tokens = value;
            }
        }
        Ok(())
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(HOME_DIR_NAME))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_temp_home;

    #[test]
    fn embedded_defaults_match_the_built_in_values() {
        let mut settings = Settings::default();
        settings
            .merge(parse_settings(DEFAULT_SETTINGS_TOML, Path::new("<default>")).unwrap())
            .unwrap();
        assert_eq!(settings.detection.languages, "kor");
        assert_eq!(settings.detection.min_width, 50);
        assert_eq!(settings.merge.overlap_threshold, 0.5);
        assert_eq!(settings.layout.mode, LayoutMode::Glass);
        assert_eq!(settings.layout.ladder(), FontLadder::GLASS);
        assert_eq!(settings.overlay.plate_padding, 3);
        assert_eq!(settings.translation.batch_size, 10);
        assert_eq!(settings.translation.sentinel, "[Translation failed]");
        assert_eq!(settings.translation.strategy, TranslationStrategy::Batch);
    }

    #[test]
    fn home_settings_file_is_created_and_layered() {
        with_temp_home(|home| {
            let dir = home.join(HOME_DIR_NAME);
            let extra = home.join("extra.toml");
            fs::write(
                &extra,
                "[layout]\nmode = \"solid\"\nladder_floor = 18\n\n[overlay.shout]\nfont_family = \"Impact\"\n",
            )
            .unwrap();

            let settings = load_settings(Some(&extra)).unwrap();
            assert!(dir.join("settings.toml").exists());
            assert_eq!(settings.layout.mode, LayoutMode::Solid);
            assert_eq!(settings.layout.ladder(), FontLadder { step: 5, floor: 18 });
            assert_eq!(
                settings.overlay.shout_font().font_family.as_deref(),
                Some("Impact")
            );
            assert!(settings.overlay.whisper_font().font_family.is_none());
        });
    }

    #[test]
    fn home_local_settings_override_home_settings() {
        with_temp_home(|home| {
            let dir = home.join(HOME_DIR_NAME);
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("settings.local.toml"),
                "[translation]\ntarget_language = \"Spanish\"\nbatch_size = 4\n",
            )
            .unwrap();
            let settings = load_settings(None).unwrap();
            assert_eq!(settings.translation.target_language, "Spanish");
            assert_eq!(settings.translation.batch_size, 4);
            assert_eq!(settings.translation.source_language, "Korean");
        });
    }

    #[test]
    fn missing_extra_settings_is_an_error() {
        with_temp_home(|home| {
            let err = load_settings(Some(&home.join("nope.toml"))).unwrap_err();
            assert!(err.to_string().contains("settings file not found"));
        });
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut settings = Settings::default();
        let parsed = parse_settings("[layout]\nmode = \"neon\"\n", Path::new("x")).unwrap();
        assert!(settings.merge(parsed).is_err());
    }

    #[test]
    fn batch_options_follow_translation_settings() {
        let settings = TranslationSettings {
            batch_size: 0,
            timeout_secs: 30,
            ..TranslationSettings::default()
        };
        let options = settings.batch_options();
        assert_eq!(options.batch_size, 1);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.batch_generation.max_output_tokens, 2000);
        assert_eq!(options.single_generation.max_output_tokens, 100);
    }
}
