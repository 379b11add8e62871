use std::collections::HashSet;

use tracing::debug;

use super::Region;
use super::geom::{iou, union_bbox};

/// Collapses overlapping detections into single bubbles.
///
/// One pass in input order: each unused region seeds an accumulator, and every
/// later unused region whose IoU against the accumulator's current rectangle is
/// strictly greater than `overlap_threshold` is folded in. The seed keeps its
/// kind, confidence becomes the maximum, the rectangle becomes the union.
pub fn merge_regions(regions: Vec<Region>, overlap_threshold: f64) -> Vec<Region> {
    if regions.len() <= 1 {
        return regions;
    }

    let mut used = HashSet::new();
    let mut merged = Vec::with_capacity(regions.len());

    for (i, seed) in regions.iter().enumerate() {
        if used.contains(&i) {
            continue;
        }
        let mut acc = seed.clone();

        for (j, other) in regions.iter().enumerate().skip(i + 1) {
            if used.contains(&j) {
                continue;
            }
            let overlap = iou(&acc.bbox, &other.bbox);
            if overlap > overlap_threshold {
                debug!("merging region {} into {} (iou={:.3})", j, i, overlap);
                fold_into(&mut acc, other);
                used.insert(j);
            }
        }

        used.insert(i);
        merged.push(acc);
    }

    merged
}

fn fold_into(acc: &mut Region, other: &Region) {
    acc.bbox = union_bbox(&acc.bbox, &other.bbox);
    acc.confidence = acc.confidence.max(other.confidence);
    acc.font_hint = acc.font_hint.max(other.font_hint);
    acc.source_text = join_text(&acc.source_text, &other.source_text);
}

fn join_text(left: &str, right: &str) -> String {
    let left = left.trim();
    let right = right.trim();
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{} {}", left, right),
    }
}
