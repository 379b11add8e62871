use anyhow::{Context, Result, anyhow};
use image::DynamicImage;
use std::process::Command;
use tracing::{debug, warn};

use super::Detector;
use super::tsv::parse_tsv_detections;
use crate::bubble::RawDetection;

/// Sparse text mode: bubbles are scattered across the page.
const DEFAULT_PSM: u32 = 11;

/// Runs the `tesseract` binary once per page.
#[derive(Debug, Clone)]
pub struct TesseractDetector {
    languages: String,
    psm: u32,
}

impl TesseractDetector {
    /// Checks the requested languages against the installed traineddata.
    pub fn initialize(requested: &str) -> Result<Self> {
        let languages = normalize_languages(requested)?;
        debug!("tesseract languages: {}", languages);
        Ok(Self {
            languages,
            psm: DEFAULT_PSM,
        })
    }
}

impl Detector for TesseractDetector {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>> {
        let file = tempfile::Builder::new()
            .prefix("manhwa-page-")
            .suffix(".png")
            .tempfile()
            .with_context(|| "failed to create temp page file")?;
        image
            .save_with_format(file.path(), image::ImageFormat::Png)
            .with_context(|| "failed to write temp page file")?;
        let tsv = run_tesseract_tsv(file.path(), &self.languages, self.psm)?;
        let detections = parse_tsv_detections(&tsv);
        debug!("tesseract found {} text lines", detections.len());
        Ok(detections)
    }
}

pub fn list_tesseract_languages() -> Result<Vec<String>> {
    let output = Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .with_context(|| "failed to run tesseract --list-langs")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract --list-langs failed: {}", stderr.trim()));
    }
    Ok(parse_language_list(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_language_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_languages(requested: &str) -> Result<String> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("detection languages is empty"));
    }
    match list_tesseract_languages() {
        Ok(available) => select_languages(trimmed, &available),
        Err(err) => {
            warn!("could not list tesseract languages: {}", err);
            Ok(split_languages(trimmed).join("+"))
        }
    }
}

fn split_languages(requested: &str) -> Vec<&str> {
    requested
        .split(['+', ',', ' '])
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .collect()
}

fn select_languages(requested: &str, available: &[String]) -> Result<String> {
    let (chosen, missing): (Vec<&str>, Vec<&str>) = split_languages(requested)
        .into_iter()
        .partition(|lang| available.iter().any(|value| value == lang));

    if chosen.is_empty() {
        return Err(anyhow!(
            "detection language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        ));
    }
    if !missing.is_empty() {
        warn!(
            "detection language(s) not available: {} (available: {})",
            missing.join(", "),
            available.join(", ")
        );
    }
    Ok(chosen.join("+"))
}

fn run_tesseract_tsv(path: &std::path::Path, languages: &str, psm: u32) -> Result<String> {
    let output = Command::new("tesseract")
        .arg(path)
        .arg("stdout")
        .arg("-l")
        .arg(languages)
        .arg("--oem")
        .arg("1")
        .arg("--psm")
        .arg(psm.to_string())
        .arg("tsv")
        .output()
        .with_context(|| "failed to run tesseract (is it installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("tesseract failed: {}", stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
