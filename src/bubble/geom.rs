use super::BBoxPx;

/// Intersection over union. Zero when the union area is zero.
pub fn iou(a: &BBoxPx, b: &BBoxPx) -> f64 {
    let ix1 = a.x.max(b.x);
    let iy1 = a.y.max(b.y);
    let ix2 = a.right().min(b.right());
    let iy2 = a.bottom().min(b.bottom());

    let inter = if ix2 <= ix1 || iy2 <= iy1 {
        0
    } else {
        (ix2 - ix1) as u64 * (iy2 - iy1) as u64
    };
    let union = a.area() + b.area() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

pub fn union_bbox(a: &BBoxPx, b: &BBoxPx) -> BBoxPx {
    let x1 = a.x.min(b.x);
    let y1 = a.y.min(b.y);
    let x2 = a.right().max(b.right());
    let y2 = a.bottom().max(b.bottom());
    BBoxPx {
        x: x1,
        y: y1,
        w: x2 - x1,
        h: y2 - y1,
    }
}

/// True when `outer` fully covers `inner`.
pub fn contains(outer: &BBoxPx, inner: &BBoxPx) -> bool {
    outer.x <= inner.x
        && outer.y <= inner.y
        && outer.right() >= inner.right()
        && outer.bottom() >= inner.bottom()
}
