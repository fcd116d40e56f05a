use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::dilate;

use crate::error::MetricUnavailable;

/// Canny edges thickened by one 3x3 dilation
fn edge_map(luma: &GrayImage, low: f32, high: f32) -> GrayImage {
    dilate(&canny(luma, low, high), Norm::LInf, 1)
}

/// Intersection-over-union of the dilated edge maps, x100. two edge-free images
/// agree perfectly.
pub fn edge_iou(reference: &GrayImage, candidate: &GrayImage, low: f32, high: f32) -> Result<f64, MetricUnavailable> {
    profiling::scope!("edge_iou");
    if reference.dimensions() != candidate.dimensions() {
        return Err(MetricUnavailable::new("edge", "dimension mismatch"));
    }
    let a = edge_map(reference, low, high);
    let b = edge_map(candidate, low, high);
    let (mut inter, mut union) = (0u64, 0u64);
    for (p, q) in a.pixels().zip(b.pixels()) {
        let (ea, eb) = (p.0[0] > 0, q.0[0] > 0);
        inter += u64::from(ea && eb);
        union += u64::from(ea || eb);
    }
    if union == 0 {
        return Ok(100.0);
    }
    Ok(inter as f64 / union as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn square(offset: u32) -> GrayImage {
        GrayImage::from_fn(32, 32, |x, y| {
            let inside = (8 + offset..24 + offset).contains(&x) && (8..24).contains(&y);
            Luma([if inside { 255 } else { 0 }])
        })
    }

    #[test]
    fn test_identical_edges_overlap_fully() {
        assert_eq!(edge_iou(&square(0), &square(0), 100.0, 200.0).unwrap(), 100.0);
    }

    #[test]
    fn test_blank_is_perfect() {
        let blank = GrayImage::new(16, 16);
        assert_eq!(edge_iou(&blank, &blank, 100.0, 200.0).unwrap(), 100.0);
    }

    #[test]
    fn test_missing_edges_score_zero() {
        let blank = GrayImage::new(32, 32);
        assert_eq!(edge_iou(&square(0), &blank, 100.0, 200.0).unwrap(), 0.0);
    }

    #[test]
    fn test_shift_reduces_overlap() {
        let s = edge_iou(&square(0), &square(3), 100.0, 200.0).unwrap();
        assert!(s > 0.0 && s < 100.0);
    }
}
