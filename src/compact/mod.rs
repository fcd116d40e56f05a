//! Post-trace optimizer: shrinks a candidate's SVG while holding the composite score at
//! or above a floor. Every transform is re-rendered and re-scored; a transform that
//! breaks the floor is rolled back before the next one runs.

pub mod transforms;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::candidate::VectorCandidate;
use crate::error::{Result, VectorizeError};
use crate::fitness::{FidelityScore, MetricEngine};
use crate::raster::RasterImage;
use crate::trace::TraceAdapter;

/// Scores a candidate against a fixed reference.
pub trait FidelityOracle {
    fn score(&self, candidate: &VectorCandidate) -> FidelityScore;
}

/// Renders through the adapter and scores with the metric engine. A render failure
/// scores as all-unavailable, which never passes a floor.
pub struct ReferenceOracle<'a> {
    pub adapter: &'a TraceAdapter,
    pub engine: &'a MetricEngine,
    pub reference: &'a RasterImage,
}

impl FidelityOracle for ReferenceOracle<'_> {
    fn score(&self, candidate: &VectorCandidate) -> FidelityScore {
        let (w, h) = self.reference.dimensions();
        match self.adapter.render(candidate, w, h) {
            Ok(preview) => self.engine.score(self.reference, &preview),
            Err(e) => {
                debug!(error = %e, "compaction render failed");
                FidelityScore::unavailable()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Precision,
    ColorMerge,
    Prune,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// lower coordinate precision one digit at a time
    pub precision: bool,
    pub min_precision: u8,
    /// collapse near-identical fills
    pub color_merge: bool,
    /// CIEDE2000 below which two fills are the same swatch (~1 JND)
    pub merge_threshold: f64,
    /// drop degenerate / occluded / duplicate shapes
    pub prune: bool,
    /// shapes with less area (px^2) are degenerate
    pub min_shape_area: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            precision: true,
            min_precision: 0,
            color_merge: true,
            merge_threshold: 2.3,
            prune: true,
            min_shape_area: 0.5,
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.merge_threshold.is_finite() && self.merge_threshold >= 0.0) {
            return Err(VectorizeError::invalid_config("compaction.merge_threshold must be non-negative"));
        }
        if !(self.min_shape_area.is_finite() && self.min_shape_area >= 0.0) {
            return Err(VectorizeError::invalid_config("compaction.min_shape_area must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub reduction_percent: f64,
    pub score_before: f64,
    pub score_after: f64,
    /// score_after - score_before
    pub fidelity_delta: f64,
    pub applied: Vec<Transform>,
    /// attempted but rolled back
    pub rejected: Vec<Transform>,
    pub final_precision: u8,
    pub cancelled: bool,
}

impl CompactionStats {
    fn untouched(candidate: &VectorCandidate, bytes: usize, score: f64) -> Self {
        Self {
            bytes_before: bytes,
            bytes_after: bytes,
            reduction_percent: 0.0,
            score_before: score,
            score_after: score,
            fidelity_delta: 0.0,
            applied: Vec::new(),
            rejected: Vec::new(),
            final_precision: candidate.precision,
            cancelled: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompactionResult {
    pub candidate: VectorCandidate,
    pub score: FidelityScore,
    pub stats: CompactionStats,
}

// the best candidate so far and what it costs
struct Current {
    candidate: VectorCandidate,
    score: FidelityScore,
    bytes: usize,
}

impl Current {
    /// keep `trial` if it holds the floor without growing the document
    fn try_accept(&mut self, trial: VectorCandidate, oracle: &dyn FidelityOracle, floor: f64) -> bool {
        let bytes = trial.byte_size();
        if bytes > self.bytes {
            return false;
        }
        let score = oracle.score(&trial);
        if !score.passes(floor) {
            debug!(composite = score.composite, floor, "transform rolled back");
            return false;
        }
        *self = Current { candidate: trial, score, bytes };
        true
    }
}

#[derive(Clone, Debug, Default)]
pub struct PostTraceOptimizer {
    config: CompactionConfig,
}

impl PostTraceOptimizer {
    pub fn new(config: CompactionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Run the transform pipeline against `floor`. The input comes back untouched, with
    /// zero reduction, when it already scores below the floor or nothing passes.
    pub fn optimize(
        &self,
        input: &VectorCandidate,
        floor: f64,
        oracle: &dyn FidelityOracle,
        cancel: &CancelToken,
    ) -> CompactionResult {
        profiling::scope!("PostTraceOptimizer::optimize");
        let bytes_before = input.byte_size();
        let baseline = oracle.score(input);
        let untouched = |score: FidelityScore, cancelled: bool| {
            let mut stats = CompactionStats::untouched(input, bytes_before, score.composite);
            stats.cancelled = cancelled;
            CompactionResult { candidate: input.clone(), score, stats }
        };
        if !baseline.passes(floor) {
            info!(composite = baseline.composite, floor, "candidate already below floor, skipping compaction");
            return untouched(baseline, false);
        }
        if cancel.is_cancelled() {
            return untouched(baseline, true);
        }

        let cfg = &self.config;
        let mut current = Current { candidate: input.clone(), score: baseline.clone(), bytes: bytes_before };
        let mut applied = Vec::new();
        let mut rejected = Vec::new();
        let mut cancelled = false;

        if cfg.precision {
            let start = current.candidate.precision;
            let mut lowered = false;
            for p in (cfg.min_precision..start).rev() {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                // always from the unrounded input so rungs never compound rounding
                let trial = input.with_precision(p);
                if !current.try_accept(trial, oracle, floor) {
                    // coarser steps only lose more
                    rejected.push(Transform::Precision);
                    break;
                }
                lowered = true;
            }
            if lowered {
                info!(from = start, to = current.candidate.precision, "precision reduced");
                applied.push(Transform::Precision);
            }
        }

        let steps: [(bool, Transform, &dyn Fn(&VectorCandidate) -> VectorCandidate); 2] = [
            (cfg.color_merge, Transform::ColorMerge, &|c: &VectorCandidate| transforms::merge_colors(c, cfg.merge_threshold)),
            (cfg.prune, Transform::Prune, &|c: &VectorCandidate| transforms::prune(c, cfg.min_shape_area)),
        ];
        for (enabled, transform, apply) in steps {
            if !enabled {
                continue;
            }
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let trial = apply(&current.candidate);
            if trial == current.candidate {
                continue;
            }
            let shapes_before = current.candidate.shape_count();
            if current.try_accept(trial, oracle, floor) {
                info!(?transform, shapes_before, shapes_after = current.candidate.shape_count(), "transform applied");
                applied.push(transform);
            } else {
                rejected.push(transform);
            }
        }

        if applied.is_empty() {
            let mut result = untouched(baseline, cancelled);
            result.stats.rejected = rejected;
            return result;
        }

        let bytes_after = current.bytes;
        let reduction_percent = if bytes_before > 0 {
            (bytes_before - bytes_after) as f64 / bytes_before as f64 * 100.0
        } else {
            0.0
        };
        let stats = CompactionStats {
            bytes_before,
            bytes_after,
            reduction_percent,
            score_before: baseline.composite,
            score_after: current.score.composite,
            fidelity_delta: current.score.composite - baseline.composite,
            applied,
            rejected,
            final_precision: current.candidate.precision,
            cancelled,
        };
        info!(
            bytes_before,
            bytes_after,
            reduction_percent,
            score_after = stats.score_after,
            "compaction done"
        );
        CompactionResult { candidate: current.candidate, score: current.score, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::candidate::{FillRule, Geometry, Rgb, Shape, Subpath};
    use crate::fitness::SubScore;
    use crate::geom::Point;

    /// scores by precision alone: 100 at 3 digits, minus 5 per digit dropped
    struct PrecisionOracle {
        calls: Cell<usize>,
    }

    impl FidelityOracle for PrecisionOracle {
        fn score(&self, c: &VectorCandidate) -> FidelityScore {
            self.calls.set(self.calls.get() + 1);
            let v = 100.0 - 5.0 * (3 - c.precision.min(3)) as f64;
            FidelityScore {
                composite: v,
                ssim: SubScore::new(v),
                topology: SubScore::new(v),
                edge: SubScore::new(v),
                color: SubScore::new(v),
                delta_e: Some(0.0),
                ..FidelityScore::unavailable()
            }
        }
    }

    fn wobbly() -> VectorCandidate {
        let pts: Vec<Point> = (0..12)
            .map(|i| {
                let a = i as f64 / 12.0 * std::f64::consts::TAU;
                Point::new(16.0 + 9.123_456 * a.cos(), 16.0 + 9.654_321 * a.sin())
            })
            .collect();
        let shape = Shape::new(
            Geometry::Path { subpaths: vec![Subpath::polygon(&pts).unwrap()], fill_rule: FillRule::NonZero },
            Rgb([10, 20, 30]),
        );
        VectorCandidate::new(32, 32, vec![shape]).with_precision(3)
    }

    fn precision_only() -> PostTraceOptimizer {
        PostTraceOptimizer::new(CompactionConfig { color_merge: false, prune: false, ..CompactionConfig::default() })
            .unwrap()
    }

    #[test]
    fn test_precision_stops_at_floor() {
        let oracle = PrecisionOracle { calls: Cell::new(0) };
        let out = precision_only().optimize(&wobbly(), 90.0, &oracle, &CancelToken::new());
        // 3 -> 2 (95) -> 1 (90) pass; 0 (85) fails
        assert_eq!(out.stats.final_precision, 1);
        assert_eq!(out.candidate.precision, 1);
        assert!(out.score.composite >= 90.0);
        assert_eq!(out.stats.applied, vec![Transform::Precision]);
        assert_eq!(out.stats.rejected, vec![Transform::Precision]);
        assert!(out.stats.bytes_after < out.stats.bytes_before);
        assert!(out.stats.reduction_percent > 0.0);
        assert_eq!(out.stats.fidelity_delta, -10.0);
    }

    #[test]
    fn test_precision_rungs_round_the_input_once() {
        let oracle = PrecisionOracle { calls: Cell::new(0) };
        // unrounded geometry: 1.2449 -> 1.245 -> 1.25 if rungs compounded
        let rect = Geometry::Rect { x: 1.2449, y: 2.3449, width: 10.0, height: 10.0 };
        let input = VectorCandidate::new(32, 32, vec![Shape::new(rect, Rgb([10, 20, 30]))]);
        assert_eq!(input.precision, 3);
        let out = precision_only().optimize(&input, 95.0, &oracle, &CancelToken::new());
        assert_eq!(out.candidate.precision, 2);
        let once = input.with_precision(2);
        match (&out.candidate.shapes[0].geometry, &once.shapes[0].geometry) {
            (Geometry::Rect { x, y, .. }, Geometry::Rect { x: ox, y: oy, .. }) => {
                assert_eq!((*x, *y), (*ox, *oy));
                assert_eq!((*x, *y), (1.24, 2.34));
            }
            other => panic!("unexpected geometry {other:?}"),
        }
    }

    #[test]
    fn test_below_floor_input_is_untouched() {
        let oracle = PrecisionOracle { calls: Cell::new(0) };
        let input = wobbly().with_precision(0);
        let out = precision_only().optimize(&input, 90.0, &oracle, &CancelToken::new());
        assert_eq!(out.candidate.to_svg(), input.to_svg());
        assert_eq!(out.stats.reduction_percent, 0.0);
        assert!(out.stats.applied.is_empty());
        assert_eq!(oracle.calls.get(), 1);
    }

    #[test]
    fn test_nothing_passes_returns_identical_bytes() {
        let oracle = PrecisionOracle { calls: Cell::new(0) };
        let input = wobbly();
        let out = precision_only().optimize(&input, 100.0, &oracle, &CancelToken::new());
        assert_eq!(out.candidate.to_svg(), input.to_svg());
        assert_eq!(out.stats.bytes_after, out.stats.bytes_before);
        assert_eq!(out.stats.rejected, vec![Transform::Precision]);
    }

    #[test]
    fn test_cancel_returns_input() {
        let oracle = PrecisionOracle { calls: Cell::new(0) };
        let cancel = CancelToken::new();
        cancel.cancel();
        let input = wobbly();
        let out = PostTraceOptimizer::default().optimize(&input, 50.0, &oracle, &cancel);
        assert_eq!(out.candidate, input);
        assert!(out.stats.cancelled);
    }
}
