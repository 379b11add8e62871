use std::collections::BTreeMap;

use crate::bubble::{BBoxPx, RawDetection, union_bbox};

#[derive(Clone)]
struct WordToken {
    text: String,
    bbox: BBoxPx,
    conf: f32,
    len: usize,
}

/// Groups word rows of `tesseract … tsv` output into line detections.
///
/// Words sharing (page, block, paragraph, line) become one detection. A wide
/// horizontal gap inside a line starts a new detection so that two bubbles
/// side by side are not glued together. Confidence is length-weighted and
/// scaled to 0..=1.
pub(crate) fn parse_tsv_detections(tsv: &str) -> Vec<RawDetection> {
    let mut word_map: BTreeMap<(i32, i32, i32, i32), Vec<WordToken>> = BTreeMap::new();

    for (idx, row) in tsv.lines().enumerate() {
        if idx == 0 {
            continue;
        }
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 {
            continue;
        }
        let level: i32 = cols[0].parse().unwrap_or(0);
        if level != 5 {
            continue;
        }
        let page_num: i32 = cols[1].parse().unwrap_or(0);
        let block_num: i32 = cols[2].parse().unwrap_or(0);
        let par_num: i32 = cols[3].parse().unwrap_or(0);
        let line_num: i32 = cols[4].parse().unwrap_or(0);
        let left: u32 = cols[6].parse().unwrap_or(0);
        let top: u32 = cols[7].parse().unwrap_or(0);
        let width: u32 = cols[8].parse().unwrap_or(0);
        let height: u32 = cols[9].parse().unwrap_or(0);
        let conf: f32 = cols[10].parse().unwrap_or(-1.0);
        let text = cols[11].trim();
        if text.is_empty() || conf < 0.0 || width == 0 || height == 0 {
            continue;
        }

        let key = (page_num, block_num, par_num, line_num);
        word_map.entry(key).or_default().push(WordToken {
            text: text.to_string(),
            bbox: BBoxPx {
                x: left,
                y: top,
                w: width,
                h: height,
            },
            conf,
            len: text.chars().count().max(1),
        });
    }

    let mut detections = Vec::new();
    for (_, mut words) in word_map {
        words.sort_by_key(|word| word.bbox.x);
        for segment in split_word_segments(words) {
            if let Some(detection) = build_detection(&segment) {
                detections.push(detection);
            }
        }
    }
    detections
}

fn split_word_segments(words: Vec<WordToken>) -> Vec<Vec<WordToken>> {
    if words.len() <= 1 {
        return vec![words];
    }

    let mut heights = words.iter().map(|word| word.bbox.h).collect::<Vec<_>>();
    heights.sort_unstable();
    let median_h = heights[heights.len() / 2].max(1) as f32;
    let gap_threshold = (median_h * 2.5).clamp(12.0, 120.0);

    let mut segments: Vec<Vec<WordToken>> = Vec::new();
    let mut current: Vec<WordToken> = Vec::new();
    let mut last_right = 0u32;
    for word in words {
        let gap = word.bbox.x.saturating_sub(last_right);
        if !current.is_empty() && gap as f32 > gap_threshold {
            segments.push(std::mem::take(&mut current));
        }
        last_right = if current.is_empty() {
            word.bbox.right()
        } else {
            last_right.max(word.bbox.right())
        };
        current.push(word);
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn build_detection(words: &[WordToken]) -> Option<RawDetection> {
    let first = words.first()?;
    let text = words
        .iter()
        .map(|word| word.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let mut bbox = first.bbox;
    let mut conf_sum = 0.0;
    let mut len_sum = 0.0;
    for word in words {
        bbox = union_bbox(&bbox, &word.bbox);
        let weight = word.len as f32;
        conf_sum += word.conf * weight;
        len_sum += weight;
    }
    let conf = if len_sum > 0.0 { conf_sum / len_sum } else { 0.0 };

    Some(RawDetection::from_bbox(
        bbox,
        text,
        (conf / 100.0).clamp(0.0, 1.0),
    ))
}
