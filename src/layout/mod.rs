mod font;
mod wrap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bubble::BubbleKind;

pub use font::{
    EstimatedMetrics, FontMetrics, OverlayFont, OverlayFonts, TextMeasure, load_font_metrics,
    overlay_fallback_fonts, resolve_overlay_font,
};
pub use wrap::wrap_words;

/// Candidate font sizes, tried largest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FontLadder {
    pub step: u32,
    pub floor: u32,
}

impl FontLadder {
    /// Descends by 4 to 16; used for translucent overlays.
    pub const GLASS: FontLadder = FontLadder { step: 4, floor: 16 };
    /// Descends by 5 to 20; used for opaque overlays.
    pub const SOLID: FontLadder = FontLadder { step: 5, floor: 20 };

    pub fn sizes(&self, start: u32) -> Vec<u32> {
        let step = self.step.max(1);
        let mut sizes = Vec::new();
        let mut size = start;
        while size >= self.floor && size > 0 {
            sizes.push(size);
            match size.checked_sub(step) {
                Some(next) => size = next,
                None => break,
            }
        }
        sizes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxSize {
    pub width: u32,
    pub height: u32,
}

/// Where and how big the text of one bubble is drawn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutPlan {
    pub font_size: u32,
    pub lines: Vec<String>,
    pub line_height: f32,
    pub fits: bool,
    /// Top of the text block, relative to the bubble's top edge.
    pub origin_y: f32,
    /// Baseline offset from the top of each line.
    pub ascent: f32,
    /// Width of the widest line.
    pub text_width: f32,
    pub text_height: f32,
}

impl LayoutPlan {
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

/// Chooses font size and wrapping so text fits its bubble.
#[derive(Debug, Clone)]
pub struct Fitter {
    fonts: OverlayFonts,
    ladder: FontLadder,
    padding: f32,
}

impl Fitter {
    pub fn new(fonts: OverlayFonts, ladder: FontLadder, padding: u32) -> Self {
        Self {
            fonts,
            ladder,
            padding: padding as f32,
        }
    }

    /// Largest ladder size whose wrapped text fits, else a top-anchored
    /// floor-size layout with overflow lines dropped. Never fails.
    pub fn fit(&self, text: &str, rect: BoxSize, kind: BubbleKind, start_size: u32) -> LayoutPlan {
        let measure = self.fonts.for_kind(kind).measure();
        let max_width = rect.width as f32 - 2.0 * self.padding;
        let max_height = rect.height as f32 - 2.0 * self.padding;

        for size in self.ladder.sizes(start_size) {
            let font_size = size as f32;
            let lines = wrap_words(text, font_size, max_width, measure);
            let line_height = measure.line_height(font_size);
            let text_height = line_height * lines.len() as f32;
            if text_height <= max_height {
                debug!(
                    "fit {}pt, {} lines, height={:.1}px",
                    size,
                    lines.len(),
                    text_height
                );
                return self.plan(size, lines, measure, true, (rect.height as f32 - text_height) / 2.0);
            }
        }

        self.fallback(text, rect, measure)
    }

    fn fallback(&self, text: &str, rect: BoxSize, measure: &dyn TextMeasure) -> LayoutPlan {
        let size = self.ladder.floor.max(1);
        let font_size = size as f32;
        let max_width = rect.width as f32 - 2.0 * self.padding;
        let mut lines = wrap_words(text, font_size, max_width, measure);
        let line_height = measure.line_height(font_size);
        let available = rect.height as f32 - 2.0 * self.padding;
        let max_lines = if line_height > 0.0 {
            ((available / line_height).floor().max(1.0)) as usize
        } else {
            1
        };
        if lines.len() > max_lines {
            debug!(
                "fallback {}pt: dropping {} of {} lines",
                size,
                lines.len() - max_lines,
                lines.len()
            );
            lines.truncate(max_lines);
        }
        self.plan(size, lines, measure, false, self.padding)
    }

    fn plan(
        &self,
        size: u32,
        lines: Vec<String>,
        measure: &dyn TextMeasure,
        fits: bool,
        origin_y: f32,
    ) -> LayoutPlan {
        let font_size = size as f32;
        let line_height = measure.line_height(font_size);
        let text_width = lines
            .iter()
            .map(|line| measure.text_width(line, font_size))
            .fold(0.0, f32::max);
        LayoutPlan {
            font_size: size,
            line_height,
            fits,
            origin_y,
            ascent: measure.ascent(font_size),
            text_width,
            text_height: line_height * lines.len() as f32,
            lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fitter(ladder: FontLadder) -> Fitter {
        Fitter::new(OverlayFonts::default(), ladder, 10)
    }

    fn size(width: u32, height: u32) -> BoxSize {
        BoxSize { width, height }
    }

    #[test]
    fn ladders_descend_to_their_floor() {
        assert_eq!(FontLadder::GLASS.sizes(40), vec![40, 36, 32, 28, 24, 20, 16]);
        assert_eq!(FontLadder::SOLID.sizes(40), vec![40, 35, 30, 25, 20]);
        assert_eq!(FontLadder::GLASS.sizes(18), vec![18]);
        assert!(FontLadder::SOLID.sizes(12).is_empty());
        let zero_step = FontLadder { step: 0, floor: 10 };
        assert_eq!(zero_step.sizes(12), vec![12, 11, 10]);
    }

    #[test]
    fn picks_largest_size_that_fits() {
        let plan = fitter(FontLadder::GLASS).fit(
            "Hello, how are you doing today?",
            size(200, 60),
            BubbleKind::Normal,
            40,
        );
        assert!(plan.fits);
        assert_eq!(plan.font_size, 16);
        assert_eq!(plan.lines, vec!["Hello, how are you", "doing today?"]);
        assert!(plan.text_height <= 40.0);
        assert!((plan.origin_y - (60.0 - plan.text_height) / 2.0).abs() < 1e-4);
    }

    #[test]
    fn roomy_box_keeps_the_start_size() {
        let plan = fitter(FontLadder::GLASS).fit("Yes", size(400, 200), BubbleKind::Shout, 40);
        assert!(plan.fits);
        assert_eq!(plan.font_size, 40);
        assert_eq!(plan.line_count(), 1);
    }

    #[test]
    fn falls_back_to_floor_and_drops_overflow() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let plan = fitter(FontLadder::GLASS).fit(text, size(80, 60), BubbleKind::Normal, 40);
        assert!(!plan.fits);
        assert_eq!(plan.font_size, 16);
        assert_eq!(plan.origin_y, 10.0);
        // 40px of room at 18.4px per line
        assert_eq!(plan.line_count(), 2);
    }

    #[test]
    fn fallback_keeps_at_least_one_line() {
        let plan = fitter(FontLadder::SOLID).fit("Hello there", size(30, 10), BubbleKind::Whisper, 40);
        assert!(!plan.fits);
        assert_eq!(plan.font_size, 20);
        assert_eq!(plan.line_count(), 1);
    }

    #[test]
    fn empty_text_still_produces_a_line() {
        let plan = fitter(FontLadder::GLASS).fit("", size(200, 60), BubbleKind::Normal, 40);
        assert!(plan.line_count() >= 1);
        assert!(plan.fits);
    }

    #[test]
    fn oversized_word_never_panics() {
        let word = "x".repeat(200);
        let plan = fitter(FontLadder::GLASS).fit(&word, size(50, 40), BubbleKind::Normal, 40);
        assert_eq!(plan.lines, vec![word]);
    }

    #[test]
    fn start_below_floor_uses_fallback() {
        let plan = fitter(FontLadder::SOLID).fit("Hi", size(200, 100), BubbleKind::Normal, 12);
        assert!(!plan.fits);
        assert_eq!(plan.font_size, 20);
        assert_eq!(plan.lines, vec!["Hi"]);
    }

    #[test]
    fn chosen_size_is_monotonic_in_box_size() {
        let text = "I told you already, we are not going back there tonight!";
        let fitter = fitter(FontLadder::GLASS);
        let mut previous = 0;
        for width in (40..=600).step_by(20) {
            let plan = fitter.fit(text, size(width, 120), BubbleKind::Normal, 48);
            assert!(plan.font_size >= previous, "width {}", width);
            previous = plan.font_size;
        }
        let mut previous = 0;
        for height in (20..=400).step_by(20) {
            let plan = fitter.fit(text, size(240, height), BubbleKind::Normal, 48);
            assert!(plan.font_size >= previous, "height {}", height);
            previous = plan.font_size;
        }
    }

    #[test]
    fn text_width_tracks_widest_line() {
        let plan = fitter(FontLadder::GLASS).fit(
            "Hello, how are you doing today?",
            size(200, 60),
            BubbleKind::Normal,
            40,
        );
        let widest = EstimatedMetrics.text_width("Hello, how are you", 16.0);
        assert!((plan.text_width - widest).abs() < 1e-3);
    }
}
