use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, info};

use super::canvas::Surface;
use crate::bubble::Region;
use crate::layout::{BoxSize, Fitter, LayoutPlan};
use crate::providers::Provider;
use crate::translations::{BatchDebug, BatchOrchestrator, TranslationStrategy};

/// One region after pass 2.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedRegion {
    #[serde(flatten)]
    pub region: Region,
    pub translation: String,
    pub plan: LayoutPlan,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedPage {
    pub regions: Vec<PlacedRegion>,
    pub batches: Vec<BatchDebug>,
}

impl RenderedPage {
    /// Regions whose translation equals `sentinel`.
    pub fn failed_count(&self, sentinel: &str) -> usize {
        self.regions
            .iter()
            .filter(|placed| placed.translation == sentinel)
            .count()
    }
}

/// Top-to-bottom reading order. Stable, so equal `y` keeps detection order.
pub fn order_regions(mut regions: Vec<Region>) -> Vec<Region> {
    regions.sort_by_key(|region| region.bbox.y);
    regions
}

/// Two-pass render: every region is erased before any translation is
/// requested or drawn, so later text never sits under a later erase.
pub async fn render_page<P, S>(
    surface: &mut S,
    orchestrator: &BatchOrchestrator<P>,
    strategy: TranslationStrategy,
    fitter: &Fitter,
    page: &DynamicImage,
    regions: Vec<Region>,
) -> RenderedPage
where
    P: Provider + Clone,
    S: Surface,
{
    let regions = order_regions(regions);

    for region in &regions {
        surface.erase(region.bbox);
    }
    debug!("erased {} regions", regions.len());

    let (translations, batches) = orchestrator.translate_page(strategy, page, &regions).await;

    let mut placed = Vec::with_capacity(regions.len());
    for (region, translation) in regions.into_iter().zip(translations) {
        let plan = fitter.fit(
            &translation,
            BoxSize {
                width: region.bbox.w,
                height: region.bbox.h,
            },
            region.kind,
            region.font_hint,
        );
        if !plan.fits {
            debug!(
                "region at y={} overflows at {}px: '{}'",
                region.bbox.y, plan.font_size, translation
            );
        }
        surface.draw_text(&region, &plan);
        placed.push(PlacedRegion {
            region,
            translation,
            plan,
        });
    }
    info!("rendered {} regions", placed.len());

    RenderedPage {
        regions: placed,
        batches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bubble::{BBoxPx, BubbleKind};
    use crate::data::DataAttachment;
    use crate::layout::{FontLadder, OverlayFonts};
    use crate::providers::{GenerationConfig, ProviderFuture, ProviderResponse};
    use crate::translations::BatchOptions;
    use crate::translator::Translator;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct RecordingSurface {
        log: Log,
    }

    impl Surface for RecordingSurface {
        fn erase(&mut self, bbox: BBoxPx) {
            self.log.lock().unwrap().push(format!("erase {}", bbox.y));
        }

        fn draw_text(&mut self, region: &Region, plan: &LayoutPlan) {
            self.log
                .lock()
                .unwrap()
                .push(format!("draw {} {}", region.bbox.y, plan.lines.join("|")));
        }
    }

    #[derive(Clone)]
    struct TestProvider {
        log: Log,
        reply: Option<String>,
    }

    impl Provider for TestProvider {
        fn append_system_input(self, _input: String) -> Self {
            self
        }

        fn append_user_input(self, _input: String) -> Self {
            self
        }

        fn append_user_data(self, _data: DataAttachment) -> Self {
            self
        }

        fn with_generation(self, _generation: GenerationConfig) -> Self {
            self
        }

        fn generate(self) -> ProviderFuture {
            Box::pin(async move {
                self.log.lock().unwrap().push("translate".to_string());
                match self.reply {
                    Some(text) => Ok(ProviderResponse {
                        text,
                        model: None,
                        usage: None,
                    }),
                    None => Err(anyhow!("HTTP 503")),
                }
            })
        }
    }

    fn region(y: u32, text: &str) -> Region {
        Region {
            bbox: BBoxPx {
                x: 10,
                y,
                w: 200,
                h: 60,
            },
            kind: BubbleKind::Normal,
            source_text: text.to_string(),
            confidence: 0.9,
            font_hint: 30,
        }
    }

    async fn run(reply: Option<&str>, regions: Vec<Region>) -> (RenderedPage, Vec<String>) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let provider = TestProvider {
            log: log.clone(),
            reply: reply.map(str::to_string),
        };
        let orchestrator = BatchOrchestrator::new(Translator::new(provider), BatchOptions::default());
        let fitter = Fitter::new(OverlayFonts::default(), FontLadder::GLASS, 10);
        let mut surface = RecordingSurface { log: log.clone() };
        let page = DynamicImage::new_rgb8(300, 400);
        let rendered = render_page(
            &mut surface,
            &orchestrator,
            TranslationStrategy::Batch,
            &fitter,
            &page,
            regions,
        )
        .await;
        let entries = log.lock().unwrap().clone();
        (rendered, entries)
    }

    #[test]
    fn regions_are_ordered_top_to_bottom() {
        let ordered = order_regions(vec![region(100, "a"), region(50, "b")]);
        assert_eq!(ordered[0].bbox.y, 50);
        assert_eq!(ordered[1].bbox.y, 100);
    }

    #[test]
    fn equal_y_keeps_detection_order() {
        let ordered = order_regions(vec![region(20, "first"), region(20, "second"), region(5, "top")]);
        let texts = ordered
            .iter()
            .map(|region| region.source_text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["top", "first", "second"]);
    }

    #[tokio::test]
    async fn every_erase_happens_before_translation_and_drawing() {
        let (rendered, log) = run(
            Some("[1] Up here\n[2] Down there"),
            vec![region(200, "아래"), region(40, "위")],
        )
        .await;

        assert_eq!(
            log,
            vec![
                "erase 40".to_string(),
                "erase 200".to_string(),
                "translate".to_string(),
                "draw 40 Up here".to_string(),
                "draw 200 Down there".to_string(),
            ]
        );
        assert_eq!(rendered.regions[0].translation, "Up here");
        assert_eq!(rendered.batches.len(), 1);
        assert_eq!(rendered.failed_count("[Translation failed]"), 0);
    }

    #[tokio::test]
    async fn failed_batch_still_draws_the_sentinel() {
        let (rendered, log) = run(None, vec![region(10, "a"), region(90, "b")]).await;

        assert_eq!(rendered.regions.len(), 2);
        assert_eq!(rendered.failed_count("[Translation failed]"), 2);
        assert!(log.iter().any(|entry| entry.starts_with("draw 10 [Translation")));
        let last_erase = log.iter().rposition(|entry| entry.starts_with("erase")).unwrap();
        let first_draw = log.iter().position(|entry| entry.starts_with("draw")).unwrap();
        assert!(last_erase < first_draw);
    }

    #[tokio::test]
    async fn no_regions_means_no_oracle_call() {
        let (rendered, log) = run(Some("unused"), Vec::new()).await;
        assert!(rendered.regions.is_empty());
        assert!(log.is_empty());
    }
}
