use crate::pipeline::types::{BBox, Ring};
use geo::BoundingRect;
use geo_types::{LineString, MultiPolygon, Polygon};
use image::DynamicImage;

/// Convert a configured ring to a geo_types Polygon
fn to_geo_polygon(ring: &Ring) -> Polygon<f64> {
    let coords: Vec<(f64, f64)> = ring.iter().map(|&(x, y)| (x as f64, y as f64)).collect();
    Polygon::new(LineString::from(coords), vec![])
}

/// Pixel bounds `[x1, y1, x2, y2)` enclosing every vertex of every ring.
///
/// The maximum vertex is included, so a ring spanning `100..=200` covers 101
/// pixels.
pub fn polygon_bounds(rings: &[Ring]) -> Option<[i64; 4]> {
    let mp = MultiPolygon(rings.iter().map(to_geo_polygon).collect());
    let rect = mp.bounding_rect()?;
    let (min, max) = (rect.min(), rect.max());

    Some([
        min.x as i64,
        min.y as i64,
        max.x as i64 + 1,
        max.y as i64 + 1,
    ])
}

/// Clips half-open bounds to a `width` x `height` frame.
/// Returns `None` when nothing of the region remains.
pub fn clip_to_frame(bounds: [i64; 4], width: u32, height: u32) -> Option<BBox> {
    let [x1, y1, x2, y2] = bounds;

    let x1 = x1.clamp(0, width as i64);
    let y1 = y1.clamp(0, height as i64);
    let x2 = x2.clamp(0, width as i64);
    let y2 = y2.clamp(0, height as i64);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(BBox {
        x: x1 as u32,
        y: y1 as u32,
        w: (x2 - x1) as u32,
        h: (y2 - y1) as u32,
    })
}

/// The whole frame, or `None` for an empty image.
pub fn full_frame(width: u32, height: u32) -> Option<BBox> {
    clip_to_frame([0, 0, width as i64, height as i64], width, height)
}

/// Copies the pixels under `bbox` into a new, independently owned image.
pub fn crop_region(img: &DynamicImage, bbox: &BBox) -> DynamicImage {
    img.crop_imm(bbox.x, bbox.y, bbox.w, bbox.h)
}
