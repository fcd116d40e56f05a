use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::error::MetricUnavailable;

/// raw component / hole counts behind the topology sub-score
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyStats {
    pub reference_components: usize,
    pub candidate_components: usize,
    pub reference_holes: usize,
    pub candidate_holes: usize,
}

const COMPONENT_WEIGHT: f64 = 0.6;
const HOLE_WEIGHT: f64 = 0.4;

/// foreground = luminance above `threshold`
fn binarize(luma: &GrayImage, threshold: u8, foreground: bool) -> GrayImage {
    GrayImage::from_fn(luma.width(), luma.height(), |x, y| {
        let fg = luma.get_pixel(x, y).0[0] > threshold;
        Luma([if fg == foreground { 255 } else { 0 }])
    })
}

/// 8-connected components of the non-zero pixels with at least `min_area` pixels
fn count_components(mask: &GrayImage, min_area: u32) -> usize {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut areas: Vec<u32> = Vec::new();
    for p in labels.pixels() {
        let l = p.0[0] as usize;
        if l == 0 {
            continue;
        }
        if areas.len() < l {
            areas.resize(l, 0);
        }
        areas[l - 1] += 1;
    }
    areas.iter().filter(|&&a| a >= min_area).count()
}

/// 1 - |a - b| / max(a, b, 1), never below 0
fn agreement(a: usize, b: usize) -> f64 {
    let diff = a.abs_diff(b) as f64;
    (1.0 - diff / a.max(b).max(1) as f64).max(0.0)
}

/// Topology agreement (0..100) between two luminance images of the same size:
/// foreground components and background holes are counted on both and compared.
pub fn compare(
    reference: &GrayImage,
    candidate: &GrayImage,
    threshold: u8,
    min_area: u32,
) -> Result<(f64, TopologyStats), MetricUnavailable> {
    profiling::scope!("topology::compare");
    if reference.dimensions() != candidate.dimensions() {
        return Err(MetricUnavailable::new("topology", "dimension mismatch"));
    }
    let stats = TopologyStats {
        reference_components: count_components(&binarize(reference, threshold, true), min_area),
        candidate_components: count_components(&binarize(candidate, threshold, true), min_area),
        reference_holes: count_components(&binarize(reference, threshold, false), min_area),
        candidate_holes: count_components(&binarize(candidate, threshold, false), min_area),
    };
    let score = COMPONENT_WEIGHT * agreement(stats.reference_components, stats.candidate_components)
        + HOLE_WEIGHT * agreement(stats.reference_holes, stats.candidate_holes);
    Ok((score * 100.0, stats))
}
