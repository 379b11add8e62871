mod parse;

use anyhow::{Context, Result, anyhow};
use image::DynamicImage;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use tera::{Context as TeraContext, Tera};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bubble::{BubbleKind, Region};
use crate::data::DataAttachment;
use crate::providers::{GenerationConfig, MessagePart, Provider};
use crate::translator::Translator;

pub use parse::{NumberedEntry, complete_translations, parse_numbered_response};

const BATCH_PROMPT: &str = include_str!("prompts/batch_prompt.tera");
const NORMAL_PROMPT: &str = include_str!("prompts/normal.tera");
const SHOUT_PROMPT: &str = include_str!("prompts/shout.tera");
const WHISPER_PROMPT: &str = include_str!("prompts/whisper.tera");

/// Why an oracle call produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleFailure {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle call failed: {0}")]
    Transport(String),
    #[error("oracle returned an empty response")]
    Empty,
}

/// How regions are sent to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationStrategy {
    /// One call per `batch_size` regions, with the whole page as context.
    #[default]
    Batch,
    /// One call per region through the single-region retry path.
    Single,
}

impl FromStr for TranslationStrategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "batch" => Ok(TranslationStrategy::Batch),
            "single" => Ok(TranslationStrategy::Single),
            other => Err(anyhow!("unknown translation strategy '{}' (batch, single)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub sentinel: String,
    pub empty_marker: String,
    pub source_language: String,
    pub target_language: String,
    pub timeout: Duration,
    pub retry_backoff: Duration,
    pub batch_generation: GenerationConfig,
    pub single_generation: GenerationConfig,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            sentinel: "[Translation failed]".to_string(),
            empty_marker: "[No text detected]".to_string(),
            source_language: "Korean".to_string(),
            target_language: "English".to_string(),
            timeout: Duration::from_secs(120),
            retry_backoff: Duration::from_secs(2),
            batch_generation: GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 2000,
            },
            single_generation: GenerationConfig {
                temperature: 0.3,
                max_output_tokens: 100,
            },
        }
    }
}

/// What happened to one oracle call, kept for the debug report.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDebug {
    pub batch: usize,
    pub count: usize,
    pub source_texts: Vec<String>,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub translations: Vec<String>,
}

pub fn render_batch_prompt(count: usize, options: &BatchOptions) -> Result<String> {
    let mut context = TeraContext::new();
    context.insert("count", &count);
    context.insert("source_lang", options.source_language.as_str());
    context.insert("target_lang", options.target_language.as_str());
    Tera::one_off(BATCH_PROMPT, &context, false).with_context(|| "failed to render batch prompt")
}

pub fn render_kind_prompt(kind: BubbleKind, options: &BatchOptions) -> Result<String> {
    let template = match kind {
        BubbleKind::Normal => NORMAL_PROMPT,
        BubbleKind::Shout => SHOUT_PROMPT,
        BubbleKind::Whisper => WHISPER_PROMPT,
    };
    let mut context = TeraContext::new();
    context.insert("source_lang", options.source_language.as_str());
    context.insert("target_lang", options.target_language.as_str());
    Tera::one_off(template, &context, false)
        .map(|prompt| prompt.trim().to_string())
        .with_context(|| format!("failed to render {} prompt", kind.as_str()))
}

/// Turns regions into translated strings, one per region, in order.
///
/// Nothing here fails the page: every oracle problem ends up as the sentinel
/// string in the affected slots.
#[derive(Debug, Clone)]
pub struct BatchOrchestrator<P: Provider + Clone> {
    translator: Translator<P>,
    options: BatchOptions,
}

impl<P: Provider + Clone> BatchOrchestrator<P> {
    pub fn new(translator: Translator<P>, options: BatchOptions) -> Self {
        Self {
            translator,
            options,
        }
    }

    pub async fn translate_batch(&self, page: &DynamicImage, regions: &[Region]) -> Vec<String> {
        self.translate_batch_with_report(page, regions).await.0
    }

    /// Sends `regions` in sequential batches of `batch_size`; one failed batch
    /// does not affect the others.
    pub async fn translate_batch_with_report(
        &self,
        page: &DynamicImage,
        regions: &[Region],
    ) -> (Vec<String>, Vec<BatchDebug>) {
        let mut translations = Vec::with_capacity(regions.len());
        let mut report = Vec::new();
        if regions.is_empty() {
            return (translations, report);
        }

        let page_attachment = page_context(page);
        let batch_size = self.options.batch_size.max(1);
        for (batch_idx, batch) in regions.chunks(batch_size).enumerate() {
            info!(
                "translating batch {}: {} bubbles",
                batch_idx + 1,
                batch.len()
            );
            let outcome = self
                .run_batch(batch_idx + 1, page, page_attachment.as_ref(), batch)
                .await;
            info!(
                "batch {}: got {} translations",
                batch_idx + 1,
                outcome.translations.len()
            );
            translations.extend(outcome.translations.iter().cloned());
            report.push(outcome);
        }
        (translations, report)
    }

    async fn run_batch(
        &self,
        batch_number: usize,
        page: &DynamicImage,
        page_attachment: Option<&DataAttachment>,
        batch: &[Region],
    ) -> BatchDebug {
        let count = batch.len();
        let source_texts = batch
            .iter()
            .map(|region| region.source_text.clone())
            .collect::<Vec<_>>();
        let mut outcome = BatchDebug {
            batch: batch_number,
            count,
            source_texts,
            prompt: String::new(),
            response: None,
            error: None,
            translations: Vec::new(),
        };

        let prompt = match render_batch_prompt(count, &self.options) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!("batch {} failed: {:#}", batch_number, err);
                outcome.error = Some(format!("{:#}", err));
                outcome.translations = self.sentinels(count);
                return outcome;
            }
        };
        outcome.prompt = prompt.clone();
        debug!("batch {} prompt:\n{}", batch_number, prompt);

        let mut parts = Vec::with_capacity(2 + count * 3);
        if let Some(attachment) = page_attachment {
            parts.push(MessagePart::Text("Full page for context:".to_string()));
            parts.push(MessagePart::Data(attachment.clone()));
        }
        for (offset, region) in batch.iter().enumerate() {
            let index = offset + 1;
            debug!(
                "  [{}] {}: {}",
                index, self.options.source_language, region.source_text
            );
            parts.push(MessagePart::Text(format!(
                "[{}] {} text: {}",
                index, self.options.source_language, region.source_text
            )));
            if let Some(crop) = region_crop(page, region, index) {
                parts.push(MessagePart::Text(format!("[{}] Image:", index)));
                parts.push(MessagePart::Data(crop));
            }
        }

        match self
            .call_oracle(prompt, parts, self.options.batch_generation)
            .await
        {
            Ok(text) => {
                debug!("batch {} response:\n{}", batch_number, text);
                let entries = parse_numbered_response(&text);
                if entries.len() != count {
                    warn!(
                        "batch {}: expected {} numbered entries, parsed {}",
                        batch_number,
                        count,
                        entries.len()
                    );
                }
                outcome.translations = complete_translations(&entries, count, &self.options.sentinel);
                for (offset, translation) in outcome.translations.iter().enumerate() {
                    debug!("  [{}] -> '{}'", offset + 1, translation);
                }
                outcome.response = Some(text);
            }
            Err(failure) => {
                warn!("batch {} failed: {}", batch_number, failure);
                outcome.error = Some(failure.to_string());
                outcome.translations = self.sentinels(count);
            }
        }
        outcome
    }

    /// Translates one region with its kind prompt. A failed first call is
    /// retried once, after the backoff, without the page image.
    pub async fn translate_one(&self, page: &DynamicImage, region: &Region) -> String {
        self.run_single(1, page, region)
            .await
            .translations
            .pop()
            .unwrap_or_else(|| self.options.sentinel.clone())
    }

    async fn run_single(&self, number: usize, page: &DynamicImage, region: &Region) -> BatchDebug {
        let mut outcome = BatchDebug {
            batch: number,
            count: 1,
            source_texts: vec![region.source_text.clone()],
            prompt: String::new(),
            response: None,
            error: None,
            translations: Vec::new(),
        };
        let prompt = match render_kind_prompt(region.kind, &self.options) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!("single translation failed: {:#}", err);
                outcome.error = Some(format!("{:#}", err));
                outcome.translations = self.sentinels(1);
                return outcome;
            }
        };
        outcome.prompt = prompt.clone();

        let mut reduced = vec![MessagePart::Text(format!(
            "{} text: {}",
            self.options.source_language, region.source_text
        ))];
        if let Some(crop) = region_crop(page, region, number) {
            reduced.push(MessagePart::Data(crop));
        }
        let mut full = reduced.clone();
        if let Some(attachment) = page_context(page) {
            full.push(MessagePart::Text("Full page context:".to_string()));
            full.push(MessagePart::Data(attachment));
        }

        let generation = self.options.single_generation;
        let first = self.call_oracle(prompt.clone(), full, generation).await;
        let result = match first {
            Err(failure) if failure != OracleFailure::Empty => {
                warn!(
                    "single translation failed ({}); retrying in {:?} without page context",
                    failure, self.options.retry_backoff
                );
                outcome.error = Some(failure.to_string());
                tokio::time::sleep(self.options.retry_backoff).await;
                self.call_oracle(prompt, reduced, generation).await
            }
            other => other,
        };

        let translation = match result {
            Ok(text) => {
                outcome.response = Some(text.clone());
                text
            }
            Err(OracleFailure::Empty) => self.options.empty_marker.clone(),
            Err(failure) => {
                warn!("single translation retry failed: {}", failure);
                outcome.error = Some(failure.to_string());
                self.options.sentinel.clone()
            }
        };
        outcome.translations = vec![translation];
        outcome
    }

    /// Region-at-a-time variant of `translate_batch_with_report`.
    pub async fn translate_each_with_report(
        &self,
        page: &DynamicImage,
        regions: &[Region],
    ) -> (Vec<String>, Vec<BatchDebug>) {
        let mut translations = Vec::with_capacity(regions.len());
        let mut report = Vec::with_capacity(regions.len());
        for (idx, region) in regions.iter().enumerate() {
            let outcome = self.run_single(idx + 1, page, region).await;
            let translation = outcome
                .translations
                .first()
                .cloned()
                .unwrap_or_else(|| self.options.sentinel.clone());
            debug!("[{}] -> '{}'", idx + 1, translation);
            translations.push(translation);
            report.push(outcome);
        }
        (translations, report)
    }

    pub async fn translate_page(
        &self,
        strategy: TranslationStrategy,
        page: &DynamicImage,
        regions: &[Region],
    ) -> (Vec<String>, Vec<BatchDebug>) {
        match strategy {
            TranslationStrategy::Batch => self.translate_batch_with_report(page, regions).await,
            TranslationStrategy::Single => self.translate_each_with_report(page, regions).await,
        }
    }

    async fn call_oracle(
        &self,
        system_prompt: String,
        parts: Vec<MessagePart>,
        generation: GenerationConfig,
    ) -> Result<String, OracleFailure> {
        let call = self.translator.generate(system_prompt, parts, generation);
        match tokio::time::timeout(self.options.timeout, call).await {
            Err(_) => Err(OracleFailure::Timeout(self.options.timeout)),
            Ok(Err(err)) => Err(OracleFailure::Transport(format!("{:#}", err))),
            Ok(Ok(response)) => {
                let text = response.text.trim();
                if text.is_empty() {
                    Err(OracleFailure::Empty)
                } else {
                    Ok(text.to_string())
                }
            }
        }
    }

    fn sentinels(&self, count: usize) -> Vec<String> {
        vec![self.options.sentinel.clone(); count]
    }
}

fn page_context(page: &DynamicImage) -> Option<DataAttachment> {
    match DataAttachment::png(page, "page.png") {
        Ok(attachment) => Some(attachment),
        Err(err) => {
            warn!("page context unavailable: {:#}", err);
            None
        }
    }
}

/// Crop of the region from the unmodified page.
fn region_crop(page: &DynamicImage, region: &Region, index: usize) -> Option<DataAttachment> {
    let bbox = region.bbox;
    if bbox.right() > page.width() || bbox.bottom() > page.height() {
        warn!(
            "[{}] region {}x{} at ({}, {}) lies outside the page; sending text only",
            index, bbox.w, bbox.h, bbox.x, bbox.y
        );
        return None;
    }
    let crop = page.crop_imm(bbox.x, bbox.y, bbox.w, bbox.h);
    match DataAttachment::png(&crop, format!("bubble-{}.png", index)) {
        Ok(attachment) => Some(attachment),
        Err(err) => {
            warn!("[{}] crop unavailable: {:#}", index, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bubble::BBoxPx;
    use crate::providers::{ProviderFuture, ProviderResponse};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    enum Reply {
        Text(String),
        Fail,
        Hang,
        Echo,
    }

    /// Plays back scripted replies and records each request's text parts.
    #[derive(Clone)]
    struct TestProvider {
        replies: Arc<Mutex<VecDeque<Reply>>>,
        requests: Arc<Mutex<Vec<Vec<String>>>>,
        current: Vec<String>,
        images: usize,
    }

    impl TestProvider {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                requests: Arc::new(Mutex::new(Vec::new())),
                current: Vec::new(),
                images: 0,
            }
        }

        fn requests(&self) -> Vec<Vec<String>> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Provider for TestProvider {
        fn append_system_input(self, _input: String) -> Self {
            self
        }

        fn append_user_input(mut self, input: String) -> Self {
            self.current.push(input);
            self
        }

        fn append_user_data(mut self, _data: DataAttachment) -> Self {
            self.images += 1;
            self.current.push("<image>".to_string());
            self
        }

        fn with_generation(self, _generation: GenerationConfig) -> Self {
            self
        }

        fn generate(self) -> ProviderFuture {
            Box::pin(async move {
                self.requests.lock().unwrap().push(self.current.clone());
                let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Echo);
                match reply {
                    Reply::Text(text) => Ok(ProviderResponse {
                        text,
                        model: None,
                        usage: None,
                    }),
                    Reply::Fail => Err(anyhow!("HTTP 500")),
                    Reply::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Err(anyhow!("unreachable"))
                    }
                    Reply::Echo => {
                        let lines = self
                            .current
                            .iter()
                            .filter_map(|part| {
                                let (head, text) = part.split_once(" Korean text: ")?;
                                Some(format!("{} T:{}", head, text))
                            })
                            .collect::<Vec<_>>();
                        Ok(ProviderResponse {
                            text: lines.join("\n"),
                            model: None,
                            usage: None,
                        })
                    }
                }
            })
        }
    }

    fn regions(count: usize) -> Vec<Region> {
        (0..count)
            .map(|idx| Region {
                bbox: BBoxPx {
                    x: 0,
                    y: (idx as u32 % 10) * 10,
                    w: 20,
                    h: 10,
                },
                kind: BubbleKind::Normal,
                source_text: format!("s{}", idx),
                confidence: 0.9,
                font_hint: 40,
            })
            .collect()
    }

    fn page() -> DynamicImage {
        DynamicImage::new_rgb8(40, 100)
    }

    fn orchestrator(provider: TestProvider) -> BatchOrchestrator<TestProvider> {
        let options = BatchOptions {
            timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(1),
            ..BatchOptions::default()
        };
        BatchOrchestrator::new(Translator::new(provider), options)
    }

    #[tokio::test]
    async fn output_length_always_matches_input() {
        for count in [0, 1, 10, 11, 35] {
            let provider = TestProvider::new(Vec::new());
            let orchestrator = orchestrator(provider.clone());
            let input = regions(count);
            let output = orchestrator.translate_batch(&page(), &input).await;
            assert_eq!(output.len(), count, "count {}", count);
            for (idx, text) in output.iter().enumerate() {
                assert_eq!(text, &format!("T:s{}", idx));
            }
            assert_eq!(provider.requests().len(), count.div_ceil(10));
        }
    }

    #[tokio::test]
    async fn short_response_is_padded_with_the_sentinel() {
        let provider = TestProvider::new(vec![Reply::Text("[1] One\n[4] Four".to_string())]);
        let output = orchestrator(provider).translate_batch(&page(), &regions(5)).await;
        let sentinel = "[Translation failed]";
        assert_eq!(output, vec!["One", sentinel, sentinel, "Four", sentinel]);
    }

    #[tokio::test]
    async fn failed_batch_does_not_affect_the_next() {
        let provider = TestProvider::new(vec![Reply::Fail, Reply::Echo]);
        let (output, report) = orchestrator(provider)
            .translate_batch_with_report(&page(), &regions(12))
            .await;
        assert_eq!(output.len(), 12);
        assert!(output[..10].iter().all(|text| text == "[Translation failed]"));
        assert_eq!(output[10], "T:s10");
        assert_eq!(output[11], "T:s11");
        assert!(report[0].error.as_deref().unwrap().contains("HTTP 500"));
        assert!(report[0].response.is_none());
        assert_eq!(report[1].count, 2);
        assert!(report[1].error.is_none());
    }

    #[tokio::test]
    async fn hung_batch_times_out_into_sentinels() {
        let provider = TestProvider::new(vec![Reply::Hang]);
        let (output, report) = orchestrator(provider)
            .translate_batch_with_report(&page(), &regions(3))
            .await;
        assert_eq!(output, vec!["[Translation failed]"; 3]);
        assert!(report[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn empty_response_is_a_batch_failure() {
        let provider = TestProvider::new(vec![Reply::Text("   ".to_string())]);
        let output = orchestrator(provider).translate_batch(&page(), &regions(2)).await;
        assert_eq!(output, vec!["[Translation failed]"; 2]);
    }

    #[tokio::test]
    async fn batch_request_carries_page_then_numbered_regions() {
        let provider = TestProvider::new(Vec::new());
        orchestrator(provider.clone())
            .translate_batch(&page(), &regions(2))
            .await;
        let requests = provider.requests();
        assert_eq!(
            requests[0],
            vec![
                "Full page for context:",
                "<image>",
                "[1] Korean text: s0",
                "[1] Image:",
                "<image>",
                "[2] Korean text: s1",
                "[2] Image:",
                "<image>",
            ]
        );
    }

    #[tokio::test]
    async fn single_retry_drops_the_page_image() {
        let provider = TestProvider::new(vec![Reply::Fail, Reply::Text("Hi".to_string())]);
        let region = &regions(1)[0];
        let text = orchestrator(provider.clone())
            .translate_one(&page(), region)
            .await;
        assert_eq!(text, "Hi");
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0],
            vec!["Korean text: s0", "<image>", "Full page context:", "<image>"]
        );
        assert_eq!(requests[1], vec!["Korean text: s0", "<image>"]);
    }

    #[tokio::test]
    async fn single_gives_up_after_one_retry() {
        let provider = TestProvider::new(vec![Reply::Fail, Reply::Hang, Reply::Text("late".into())]);
        let text = orchestrator(provider.clone())
            .translate_one(&page(), &regions(1)[0])
            .await;
        assert_eq!(text, "[Translation failed]");
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn single_empty_reply_is_the_empty_marker() {
        let provider = TestProvider::new(vec![Reply::Text(String::new())]);
        let text = orchestrator(provider.clone())
            .translate_one(&page(), &regions(1)[0])
            .await;
        assert_eq!(text, "[No text detected]");
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn single_strategy_calls_once_per_region() {
        let provider = TestProvider::new(vec![
            Reply::Text("A".into()),
            Reply::Text("B".into()),
            Reply::Text("C".into()),
        ]);
        let (output, report) = orchestrator(provider.clone())
            .translate_page(TranslationStrategy::Single, &page(), &regions(3))
            .await;
        assert_eq!(output, vec!["A", "B", "C"]);
        assert_eq!(report.len(), 3);
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn single_report_keeps_response_and_failure() {
        let provider = TestProvider::new(vec![
            Reply::Fail,
            Reply::Text("Hi".into()),
            Reply::Text("Yo".into()),
        ]);
        let (output, report) = orchestrator(provider)
            .translate_page(TranslationStrategy::Single, &page(), &regions(2))
            .await;
        assert_eq!(output, vec!["Hi", "Yo"]);
        assert_eq!(report[0].batch, 1);
        assert_eq!(report[0].response.as_deref(), Some("Hi"));
        assert!(report[0].error.as_deref().unwrap().contains("HTTP 500"));
        assert!(report[0].prompt.contains("Korean"));
        assert_eq!(report[1].batch, 2);
        assert_eq!(report[1].response.as_deref(), Some("Yo"));
        assert!(report[1].error.is_none());
    }

    #[test]
    fn kind_prompts_are_distinct() {
        let options = BatchOptions::default();
        let normal = render_kind_prompt(BubbleKind::Normal, &options).unwrap();
        let shout = render_kind_prompt(BubbleKind::Shout, &options).unwrap();
        let whisper = render_kind_prompt(BubbleKind::Whisper, &options).unwrap();
        assert!(normal.contains("Korean") && normal.contains("English"));
        assert!(shout.contains("energetic"));
        assert!(whisper.contains("soft"));
    }

    #[test]
    fn batch_prompt_names_the_count() {
        let prompt = render_batch_prompt(7, &BatchOptions::default()).unwrap();
        assert!(prompt.contains("Translate 7 Korean text strings to English"));
        assert!(prompt.contains("[1] to [7]"));
    }

    #[test]
    fn strategy_parses() {
        assert_eq!("Single".parse::<TranslationStrategy>().unwrap(), TranslationStrategy::Single);
        assert!("parallel".parse::<TranslationStrategy>().is_err());
    }
}
