// Metric engine: composite fidelity between a reference raster and a rendered candidate.
// Each submodule owns one sub-metric; this file combines them.

pub mod color;
pub mod edges;
pub mod metrics;
pub mod ssim;
pub mod topology;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MetricUnavailable, Result, VectorizeError};
use crate::raster::RasterImage;

pub use topology::TopologyStats;

/// relative weights of the four sub-scores in the composite
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricWeights {
    pub ssim: f64,
    pub topology: f64,
    pub edge: f64,
    pub color: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            ssim: 0.4,
            topology: 0.3,
            edge: 0.2,
            color: 0.1,
        }
    }
}

impl MetricWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [self.ssim, self.topology, self.edge, self.color];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(VectorizeError::invalid_config("metric weights must be finite and non-negative"));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(VectorizeError::invalid_config("metric weights must not all be zero"));
        }
        Ok(())
    }

    fn sum(&self) -> f64 {
        self.ssim + self.topology + self.edge + self.color
    }
}

/// metric engine configuration; fixed for the lifetime of an engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub weights: MetricWeights,
    /// luminance above this is foreground for the topology check
    pub luminance_threshold: u8,
    /// components smaller than this (px) are noise
    pub min_component_area: u32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// colour sub-score = max(0, 100 - mean dE * scale)
    pub delta_e_scale: f64,
    /// side of the uniform SSIM window (odd)
    pub ssim_window: usize,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            weights: MetricWeights::default(),
            luminance_threshold: 127,
            min_component_area: 10,
            canny_low: 100.0,
            canny_high: 200.0,
            delta_e_scale: 5.0,
            ssim_window: 7,
        }
    }
}

impl MetricConfig {
    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        if !(self.canny_low >= 0.0 && self.canny_low <= self.canny_high) {
            return Err(VectorizeError::invalid_config("canny thresholds must satisfy 0 <= low <= high"));
        }
        if !(self.delta_e_scale.is_finite() && self.delta_e_scale >= 0.0) {
            return Err(VectorizeError::invalid_config("delta_e_scale must be finite and non-negative"));
        }
        if self.ssim_window < 3 || self.ssim_window % 2 == 0 {
            return Err(VectorizeError::invalid_config("ssim_window must be odd and at least 3"));
        }
        Ok(())
    }
}

/// one 0..100 sub-score; unavailable sub-scores hold 0
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubScore {
    pub value: f64,
    pub available: bool,
}

impl SubScore {
    pub fn new(value: f64) -> Self {
        Self { value: value.clamp(0.0, 100.0), available: true }
    }

    pub const UNAVAILABLE: SubScore = SubScore { value: 0.0, available: false };

    fn from_result(metric: Result<f64, MetricUnavailable>) -> Self {
        match metric {
            Ok(v) if v.is_finite() => SubScore::new(v),
            Ok(v) => {
                debug!(value = v, "non-finite sub-score");
                SubScore::UNAVAILABLE
            }
            Err(e) => {
                debug!(error = %e, "sub-metric unavailable");
                SubScore::UNAVAILABLE
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FidelityScore {
    /// weighted combination, 0..100
    pub composite: f64,
    /// structural similarity x 100
    pub ssim: SubScore,
    pub topology: SubScore,
    pub edge: SubScore,
    /// mapped from the mean CIEDE2000 error
    pub color: SubScore,
    /// mean CIEDE2000 (lower is better); None when unavailable
    pub delta_e: Option<f64>,
    pub psnr: f64,
    /// mean absolute error per channel, 0..255
    pub mae: f64,
    pub topology_stats: Option<TopologyStats>,
    /// the candidate was resampled to the reference size first
    pub resized: bool,
}

impl FidelityScore {
    /// score for a candidate that could not be evaluated at all
    pub fn unavailable() -> Self {
        Self {
            composite: 0.0,
            ssim: SubScore::UNAVAILABLE,
            topology: SubScore::UNAVAILABLE,
            edge: SubScore::UNAVAILABLE,
            color: SubScore::UNAVAILABLE,
            delta_e: None,
            psnr: 0.0,
            mae: 255.0,
            topology_stats: None,
            resized: false,
        }
    }

    pub fn is_fully_available(&self) -> bool {
        self.ssim.available && self.topology.available && self.edge.available && self.color.available
    }

    /// fidelity gate: every sub-metric computed and the composite at or above `floor`
    pub fn passes(&self, floor: f64) -> bool {
        self.is_fully_available() && self.composite >= floor
    }
}

/// Stateless scorer; cheap to clone and safe to share across threads.
#[derive(Clone, Debug)]
pub struct MetricEngine {
    config: MetricConfig,
}

impl MetricEngine {
    pub fn new(config: MetricConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MetricConfig {
        &self.config
    }

    /// Score `candidate` against `reference`. The candidate is resampled to the
    /// reference size when they differ; the reference is never touched.
    pub fn score(&self, reference: &RasterImage, candidate: &RasterImage) -> FidelityScore {
        profiling::scope!("MetricEngine::score");
        if reference.is_empty() || candidate.is_empty() {
            return FidelityScore::unavailable();
        }
        let (w, h) = reference.dimensions();
        let resized = candidate.dimensions() != (w, h);
        let candidate = candidate.resized(w, h);

        let ref_rgb = reference.to_rgb();
        let cand_rgb = candidate.to_rgb();
        let ref_luma = crate::raster::luma_of(&ref_rgb);
        let cand_luma = crate::raster::luma_of(&cand_rgb);
        let cfg = &self.config;

        let ((ssim, topo), ((edge, delta_e), (mae, psnr))) = rayon::join(
            || {
                rayon::join(
                    || ssim::ssim_rgb(&ref_rgb, &cand_rgb, cfg.ssim_window),
                    || topology::compare(&ref_luma, &cand_luma, cfg.luminance_threshold, cfg.min_component_area),
                )
            },
            || {
                rayon::join(
                    || {
                        rayon::join(
                            || edges::edge_iou(&ref_luma, &cand_luma, cfg.canny_low, cfg.canny_high),
                            || color::mean_ciede2000(&ref_rgb, &cand_rgb),
                        )
                    },
                    || metrics::mae_psnr(&ref_rgb, &cand_rgb),
                )
            },
        );

        let (topology, topology_stats) = match topo {
            Ok((score, stats)) => (SubScore::new(score), Some(stats)),
            Err(e) => (SubScore::from_result(Err(e)), None),
        };
        let delta_e = delta_e.ok().filter(|d| d.is_finite());
        let color = match delta_e {
            Some(d) => SubScore::new((100.0 - d * cfg.delta_e_scale).max(0.0)),
            None => SubScore::UNAVAILABLE,
        };
        let ssim = SubScore::from_result(ssim.map(|s| s * 100.0));
        let edge = SubScore::from_result(edge);

        let w8 = &cfg.weights;
        let weighted = w8.ssim * ssim.value + w8.topology * topology.value + w8.edge * edge.value + w8.color * color.value;
        let composite = (weighted / w8.sum()).clamp(0.0, 100.0);

        FidelityScore {
            composite,
            ssim,
            topology,
            edge,
            color,
            delta_e,
            psnr,
            mae,
            topology_stats,
            resized,
        }
    }

    /// Score two encoded images (PNG/JPEG bytes). Undecodable input yields an
    /// all-unavailable score rather than an error.
    pub fn score_encoded(&self, reference: &[u8], candidate: &[u8]) -> FidelityScore {
        match (RasterImage::decode(reference), RasterImage::decode(candidate)) {
            (Ok(r), Ok(c)) => self.score(&r, &c),
            (r, c) => {
                debug!(reference_ok = r.is_ok(), candidate_ok = c.is_ok(), "decode failed");
                FidelityScore::unavailable()
            }
        }
    }
}

impl Default for MetricEngine {
    fn default() -> Self {
        Self { config: MetricConfig::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disks() -> RasterImage {
        RasterImage::from_fn(48, 32, |x, y| {
            let d1 = (x as f64 - 12.0).hypot(y as f64 - 16.0);
            let d2 = (x as f64 - 36.0).hypot(y as f64 - 16.0);
            if d1 < 8.0 || d2 < 8.0 {
                [20, 20, 20, 255]
            } else {
                [250, 250, 250, 255]
            }
        })
    }

    #[test]
    fn test_identical_images_score_100() {
        let img = disks();
        let s = MetricEngine::default().score(&img, &img);
        assert!((s.composite - 100.0).abs() < 1e-9, "{}", s.composite);
        assert_eq!(s.delta_e, Some(0.0));
        assert!(s.is_fully_available());
        assert!(!s.resized);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let a = disks();
        let b = RasterImage::filled(48, 32, [250, 250, 250, 255]);
        let engine = MetricEngine::default();
        assert_eq!(engine.score(&a, &b), engine.score(&a, &b));
        assert!(engine.score(&a, &b).composite < 90.0);
    }

    #[test]
    fn test_blank_images_have_full_edge_overlap() {
        let blank = RasterImage::filled(16, 16, [255, 255, 255, 255]);
        let s = MetricEngine::default().score(&blank, &blank);
        assert_eq!(s.edge.value, 100.0);
    }

    #[test]
    fn test_tiny_image_marks_ssim_unavailable() {
        let a = RasterImage::filled(2, 8, [0, 0, 0, 255]);
        let s = MetricEngine::default().score(&a, &a);
        assert!(!s.ssim.available);
        assert_eq!(s.ssim.value, 0.0);
        assert!(!s.passes(0.0));
        assert!(s.composite <= 60.0 + 1e-9);
    }

    #[test]
    fn test_candidate_is_resized_to_reference() {
        let reference = RasterImage::filled(16, 16, [10, 200, 10, 255]);
        let candidate = RasterImage::filled(8, 8, [10, 200, 10, 255]);
        let s = MetricEngine::default().score(&reference, &candidate);
        assert!(s.resized);
        assert!(s.composite > 99.0);
    }

    #[test]
    fn test_undecodable_bytes_are_unavailable() {
        let s = MetricEngine::default().score_encoded(b"not an image", b"nope");
        assert_eq!(s, FidelityScore::unavailable());
        assert!(!s.passes(0.0));
    }

    #[test]
    fn test_weights_are_validated() {
        let bad = MetricConfig {
            weights: MetricWeights { ssim: -1.0, ..MetricWeights::default() },
            ..MetricConfig::default()
        };
        assert!(MetricEngine::new(bad).is_err());
        let zero = MetricConfig {
            weights: MetricWeights { ssim: 0.0, topology: 0.0, edge: 0.0, color: 0.0 },
            ..MetricConfig::default()
        };
        assert!(MetricEngine::new(zero).is_err());
    }

    #[test]
    fn test_composite_respects_weights() {
        let a = disks();
        let b = RasterImage::filled(48, 32, [250, 250, 250, 255]);
        let only_color = MetricConfig {
            weights: MetricWeights { ssim: 0.0, topology: 0.0, edge: 0.0, color: 1.0 },
            ..MetricConfig::default()
        };
        let s = MetricEngine::new(only_color).unwrap().score(&a, &b);
        assert!((s.composite - s.color.value).abs() < 1e-9);
    }
}
