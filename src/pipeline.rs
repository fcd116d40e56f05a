//! End-to-end run: search -> optional compaction -> run summary.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cancel::CancelToken;
use crate::candidate::VectorCandidate;
use crate::compact::{CompactionStats, PostTraceOptimizer, ReferenceOracle};
use crate::error::{Result, SearchExhausted, VectorizeError};
use crate::fitness::{FidelityScore, MetricEngine};
use crate::params::{ParamSchema, ParameterSet};
use crate::raster::RasterImage;
use crate::search::{SearchController, SearchOutcome, Termination};
use crate::settings::VectorizeSettings;
use crate::trace::{AdapterConfig, ReferenceBackend, TraceAdapter, TraceBackend};

/// What a run reports about its final output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// composite of the final (possibly compacted) candidate
    pub achieved_score: f64,
    pub target_score: f64,
    pub target_met: bool,
    /// svg elements, background included
    pub element_count: usize,
    pub path_count: usize,
    pub point_count: usize,
    pub byte_size: usize,
    pub duration_secs: f64,
    pub termination: Termination,
    pub evaluations: usize,
    pub failures: usize,
    pub params: Option<ParameterSet>,
    pub compaction: Option<CompactionStats>,
}

impl RunSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Clone, Debug)]
pub struct VectorizeOutput {
    pub candidate: VectorCandidate,
    pub svg: String,
    pub score: FidelityScore,
    pub summary: RunSummary,
    pub search: SearchOutcome,
}

/// The whole closed loop, configured once. Each [`Vectorizer::run`] owns its own
/// search state, so one instance can serve many images.
#[derive(Debug)]
pub struct Vectorizer {
    settings: VectorizeSettings,
    adapter: TraceAdapter,
    engine: MetricEngine,
    search: SearchController,
    // None when compaction is switched off
    compaction: Option<PostTraceOptimizer>,
}

impl Vectorizer {
    pub fn new(settings: VectorizeSettings, backend: Arc<dyn TraceBackend>, schema: ParamSchema) -> Result<Self> {
        settings.validate()?;
        let engine = MetricEngine::new(settings.metric.clone())?;
        let search = SearchController::new(settings.search_config(&schema)?, engine.clone());
        let adapter = TraceAdapter::new(backend, schema, AdapterConfig::try_from(&settings)?);
        let compaction = if settings.compaction.enabled {
            Some(PostTraceOptimizer::new(settings.compaction.transforms.clone())?)
        } else {
            None
        };
        Ok(Self { settings, adapter, engine, search, compaction })
    }

    /// bundled palette tracer + cpu renderer with the reference schema
    pub fn with_reference_backend(settings: VectorizeSettings) -> Result<Self> {
        Self::new(settings, Arc::new(ReferenceBackend::default()), ParamSchema::reference())
    }

    pub fn settings(&self) -> &VectorizeSettings {
        &self.settings
    }

    pub fn adapter(&self) -> &TraceAdapter {
        &self.adapter
    }

    pub fn engine(&self) -> &MetricEngine {
        &self.engine
    }

    /// Vectorize `image`. A search that misses its target still returns its best
    /// candidate (see [`RunSummary::target_met`]); only a run without any successful
    /// trace fails with [`VectorizeError::SearchExhausted`].
    pub fn run(&self, image: &RasterImage, cancel: &CancelToken) -> Result<VectorizeOutput> {
        profiling::scope!("Vectorizer::run");
        let started = Instant::now();
        if image.is_empty() {
            return Err(VectorizeError::EmptyImage);
        }
        info!(width = image.width(), height = image.height(), "vectorize started");

        let search = self.search.run(&self.adapter, image, cancel)?;
        let (Some(best), Some(best_score)) = (search.best.clone(), search.best_score.clone()) else {
            return Err(SearchExhausted {
                reason: search.termination,
                best_score: 0.0,
                target: search.target,
            }
            .into());
        };

        let (candidate, score, compaction) = match &self.compaction {
            Some(optimizer) => {
                let oracle = ReferenceOracle { adapter: &self.adapter, engine: &self.engine, reference: image };
                let result = optimizer.optimize(&best, self.settings.compaction_floor(), &oracle, cancel);
                (result.candidate, result.score, Some(result.stats))
            }
            None => (best, best_score, None),
        };

        let svg = candidate.to_svg();
        let target_score = self.settings.search.target_score;
        let summary = RunSummary {
            achieved_score: score.composite,
            target_score,
            target_met: score.passes(target_score),
            element_count: candidate.element_count(),
            path_count: candidate.path_count(),
            point_count: candidate.point_count(),
            byte_size: svg.len(),
            duration_secs: started.elapsed().as_secs_f64(),
            termination: search.termination,
            evaluations: search.evaluations.len(),
            failures: search.failures,
            params: candidate.params.clone(),
            compaction,
        };
        info!(
            achieved = summary.achieved_score,
            target = target_score,
            target_met = summary.target_met,
            elements = summary.element_count,
            bytes = summary.byte_size,
            "vectorize finished"
        );

        Ok(VectorizeOutput { candidate, svg, score, summary, search })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag() -> RasterImage {
        RasterImage::from_fn(40, 24, |x, _| match x {
            0..=12 => [0, 85, 164, 255],
            13..=26 => [255, 255, 255, 255],
            _ => [239, 65, 53, 255],
        })
    }

    #[test]
    fn test_reference_pipeline_reaches_target() {
        let mut settings = VectorizeSettings::default();
        settings.search.target_score = 95.0;
        let v = Vectorizer::with_reference_backend(settings).unwrap();
        let out = v.run(&flag(), &CancelToken::new()).unwrap();
        assert!(out.summary.target_met, "{:?}", out.summary);
        assert_eq!(out.summary.termination, Termination::TargetMet);
        assert_eq!(out.summary.byte_size, out.svg.len());
        assert!(out.svg.starts_with("<svg"));
        assert!(out.summary.compaction.is_some());
        assert!(out.summary.to_json().unwrap().contains("\"achieved_score\""));
    }

    #[test]
    fn test_disabled_compaction_is_none() {
        let mut settings = VectorizeSettings::default();
        settings.compaction.enabled = false;
        settings.search.target_score = 95.0;
        let v = Vectorizer::with_reference_backend(settings).unwrap();
        let out = v.run(&flag(), &CancelToken::new()).unwrap();
        assert!(out.summary.compaction.is_none());
        assert_eq!(Some(&out.candidate), out.search.best.as_ref());
    }

    #[test]
    fn test_huge_timeout_is_rejected_not_a_panic() {
        let mut settings = VectorizeSettings::default();
        settings.adapter.trace_timeout_secs = 1e20;
        assert!(matches!(
            Vectorizer::with_reference_backend(settings),
            Err(VectorizeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_sliver_image_never_reports_target_met() {
        // 2 px wide: ssim cannot be computed
        let sliver = RasterImage::from_fn(2, 16, |_, y| if y < 8 { [0, 0, 0, 255] } else { [255, 255, 255, 255] });
        let mut settings = VectorizeSettings::default();
        settings.search.target_score = 50.0;
        let v = Vectorizer::with_reference_backend(settings).unwrap();
        let out = v.run(&sliver, &CancelToken::new()).unwrap();
        assert!(!out.score.ssim.available);
        assert!(!out.summary.target_met);
        assert_ne!(out.summary.termination, Termination::TargetMet);
        let stats = out.summary.compaction.unwrap();
        assert!(stats.applied.is_empty());
        assert_eq!(stats.bytes_after, stats.bytes_before);
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let v = Vectorizer::with_reference_backend(VectorizeSettings::default()).unwrap();
        let empty = RasterImage::filled(0, 0, [0, 0, 0, 0]);
        assert!(matches!(v.run(&empty, &CancelToken::new()), Err(VectorizeError::EmptyImage)));
    }

    #[test]
    fn test_zero_budget_has_nothing_to_return() {
        let mut settings = VectorizeSettings::default();
        settings.search.max_evaluations = 0;
        let v = Vectorizer::with_reference_backend(settings).unwrap();
        let err = v.run(&flag(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, VectorizeError::SearchExhausted(_)));
    }
}
