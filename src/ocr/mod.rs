mod tesseract;
mod tsv;

use anyhow::{Context, Result, anyhow};
use image::DynamicImage;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

use crate::bubble::RawDetection;

pub use tesseract::{TesseractDetector, list_tesseract_languages};

/// Finds text on a page. Implementations are long-lived and shared.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>>;
}

/// Process-wide owner of the detector handle.
///
/// The detector is built on first use and reused afterwards. Initialisation
/// runs behind a lock, so concurrent first callers build it once.
#[derive(Default)]
pub struct DetectorContext {
    detector: OnceLock<Arc<dyn Detector>>,
    init_lock: Mutex<()>,
}

impl DetectorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.detector.get().is_some()
    }

    pub fn handle<F>(&self, factory: F) -> Result<Arc<dyn Detector>>
    where
        F: FnOnce() -> Result<Arc<dyn Detector>>,
    {
        if let Some(detector) = self.detector.get() {
            return Ok(detector.clone());
        }
        let _guard = self
            .init_lock
            .lock()
            .map_err(|_| anyhow!("detector initialisation lock poisoned"))?;
        if let Some(detector) = self.detector.get() {
            return Ok(detector.clone());
        }
        let detector = factory().with_context(|| "failed to initialise detector")?;
        info!("detector initialised: {}", detector.name());
        let _ = self.detector.set(detector.clone());
        Ok(detector)
    }
}

/// Detections computed ahead of time and stored as JSON.
#[derive(Debug, Clone)]
pub struct JsonDetections {
    detections: Vec<RawDetection>,
}

impl JsonDetections {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detections: {}", path.display()))?;
        let detections: Vec<RawDetection> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse detections: {}", path.display()))?;
        debug!("loaded {} detections from {}", detections.len(), path.display());
        Ok(Self { detections })
    }
}

impl Detector for JsonDetections {
    fn name(&self) -> &str {
        "json"
    }

    fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>> {
        Ok(self.detections.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDetector;

    impl Detector for FixedDetector {
        fn name(&self) -> &str {
            "fixed"
        }

        fn detect(&self, _image: &DynamicImage) -> Result<Vec<RawDetection>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn detector_is_built_once() {
        let context = DetectorContext::new();
        let calls = AtomicUsize::new(0);
        assert!(!context.is_initialized());
        for _ in 0..3 {
            let detector = context
                .handle(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FixedDetector))
                })
                .expect("handle");
            assert_eq!(detector.name(), "fixed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(context.is_initialized());
    }

    #[test]
    fn concurrent_first_use_builds_once() {
        let context = Arc::new(DetectorContext::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let threads = (0..8)
            .map(|_| {
                let context = context.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    context
                        .handle(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok(Arc::new(FixedDetector))
                        })
                        .map(|_| ())
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().expect("join").expect("handle");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_initialisation_can_be_retried() {
        let context = DetectorContext::new();
        assert!(context.handle(|| Err(anyhow!("no model"))).is_err());
        assert!(!context.is_initialized());
        assert!(context.handle(|| Ok(Arc::new(FixedDetector))).is_ok());
    }

    #[test]
    fn json_detections_round_through_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.json");
        std::fs::write(
            &path,
            r#"[{"quad":[[10,20],[90,20],[90,40],[10,40]],"text":"안녕","confidence":0.9}]"#,
        )
        .expect("write");
        let detections = JsonDetections::load(&path).expect("load");
        let found = detections
            .detect(&DynamicImage::new_rgb8(4, 4))
            .expect("detect");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text, "안녕");
        assert_eq!(found[0].quad[2], [90.0, 40.0]);
    }

    #[test]
    fn invalid_detections_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(JsonDetections::load(&path).is_err());
    }
}
