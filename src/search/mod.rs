//! Search controller: drives the trace adapter toward a target composite score.

pub mod bayesian;
mod grid;
mod state;

pub use bayesian::{BayesianSettings, SurrogateBelief};
pub use state::{Evaluation, SearchState};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::candidate::VectorCandidate;
use crate::error::{Result, SearchExhausted, VectorizeError};
use crate::fitness::{FidelityScore, MetricEngine};
use crate::params::{ParamSchema, ParamValue, ParameterSet};
use crate::raster::RasterImage;
use crate::settings::duration_secs;
use crate::trace::TraceAdapter;

use state::Trial;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// every point of a small Cartesian grid, in enumeration order
    Grid,
    /// GP surrogate + expected improvement, strictly sequential
    Bayesian,
}

/// Why a search run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    TargetMet,
    IterationBudget,
    TimeBudget,
    Patience,
    Cancelled,
    /// grid finished or no unseen proposal could be found
    SpaceExhausted,
    /// too many trace/render failures
    FailureRatio,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub strategy: Strategy,
    /// composite score (0..100) that ends the search
    pub target_score: f64,
    /// adapter round trips allowed per run; 0 = none
    pub max_evaluations: usize,
    pub time_budget_secs: Option<f64>,
    /// stop after this many evaluations without a new best; None = never
    pub patience: Option<usize>,
    /// give up once failures / evaluations exceeds this
    pub failure_ratio: f64,
    /// the failure ratio is only checked after this many evaluations
    pub min_evaluations_for_failure_ratio: usize,
    /// parallel grid evaluations (1 = sequential). ignored by the bayesian strategy
    pub workers: usize,
    /// upper bound on the grid size
    pub max_grid_points: usize,
    pub seed: u64,
    /// per-knob grid values replacing the schema's declared grid
    pub grid: BTreeMap<String, Vec<ParamValue>>,
    pub bayesian: BayesianSettings,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::Grid,
            target_score: 98.0,
            max_evaluations: 50,
            time_budget_secs: None,
            patience: None,
            failure_ratio: 0.5,
            min_evaluations_for_failure_ratio: 4,
            workers: 1,
            max_grid_points: 50,
            seed: 0,
            grid: BTreeMap::new(),
            bayesian: BayesianSettings::default(),
        }
    }
}

impl SearchSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_score.is_finite() && (0.0..=100.0).contains(&self.target_score)) {
            return Err(VectorizeError::invalid_config("search.target_score must lie in 0..=100"));
        }
        if self.time_budget_secs.is_some_and(|t| !(t.is_finite() && t >= 0.0)) {
            return Err(VectorizeError::invalid_config("search.time_budget_secs must be non-negative"));
        }
        if let Some(secs) = self.time_budget_secs {
            duration_secs("search.time_budget_secs", secs)?;
        }
        if self.patience == Some(0) {
            return Err(VectorizeError::invalid_config("search.patience must be positive when set"));
        }
        if !(self.failure_ratio.is_finite() && (0.0..=1.0).contains(&self.failure_ratio)) {
            return Err(VectorizeError::invalid_config("search.failure_ratio must lie in 0..=1"));
        }
        if self.max_grid_points == 0 {
            return Err(VectorizeError::invalid_config("search.max_grid_points must be positive"));
        }
        self.bayesian.validate().map_err(VectorizeError::InvalidConfig)
    }
}

/// Validated search configuration bound to one parameter schema.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub(crate) settings: SearchSettings,
    pub(crate) time_budget: Option<Duration>,
    /// enumeration order of the grid strategy; empty for bayesian
    pub(crate) grid: Vec<ParameterSet>,
}

impl SearchConfig {
    pub fn new(settings: &SearchSettings, schema: &ParamSchema) -> Result<Self> {
        settings.validate()?;
        let grid = match settings.strategy {
            Strategy::Grid => {
                let grid = schema.grid(&settings.grid)?;
                if grid.len() > settings.max_grid_points {
                    return Err(VectorizeError::invalid_config(format!(
                        "grid has {} points, above max_grid_points = {}",
                        grid.len(),
                        settings.max_grid_points
                    )));
                }
                grid
            }
            Strategy::Bayesian => Vec::new(),
        };
        Ok(Self {
            settings: settings.clone(),
            time_budget: settings
                .time_budget_secs
                .map(|secs| duration_secs("search.time_budget_secs", secs))
                .transpose()?,
            grid,
        })
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn grid(&self) -> &[ParameterSet] {
        &self.grid
    }
}

/// What a finished search hands back. Always carries the best effort, even when the
/// target was missed.
#[derive(Clone, Debug, Serialize)]
pub struct SearchOutcome {
    #[serde(skip)]
    pub best: Option<VectorCandidate>,
    pub best_params: Option<ParameterSet>,
    pub best_score: Option<FidelityScore>,
    pub target: f64,
    pub target_met: bool,
    pub termination: Termination,
    pub evaluations: Vec<Evaluation>,
    pub failures: usize,
    pub elapsed_secs: f64,
}

impl SearchOutcome {
    /// composite of the best candidate, 0 when nothing succeeded
    pub fn achieved(&self) -> f64 {
        self.best_score.as_ref().map_or(0.0, |s| s.composite)
    }

    pub fn exhausted(&self) -> Option<SearchExhausted> {
        (!self.target_met).then(|| SearchExhausted {
            reason: self.termination,
            best_score: self.achieved(),
            target: self.target,
        })
    }

    /// the best candidate, or [`SearchExhausted`] when it misses the target
    pub fn require_target(self) -> Result<VectorCandidate> {
        if let Some(exhausted) = self.exhausted() {
            return Err(exhausted.into());
        }
        self.best.ok_or(VectorizeError::SearchExhausted(SearchExhausted {
            reason: self.termination,
            best_score: 0.0,
            target: self.target,
        }))
    }
}

#[derive(Clone, Debug)]
pub struct SearchController {
    config: SearchConfig,
    engine: MetricEngine,
}

impl SearchController {
    pub fn new(config: SearchConfig, engine: MetricEngine) -> Self {
        Self { config, engine }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn engine(&self) -> &MetricEngine {
        &self.engine
    }

    /// Search for parameters whose trace of `reference` meets the target. Backend
    /// failures are logged as zero-score evaluations; only configuration problems and
    /// out-of-domain proposals are returned as errors.
    pub fn run(&self, adapter: &TraceAdapter, reference: &RasterImage, cancel: &CancelToken) -> Result<SearchOutcome> {
        profiling::scope!("SearchController::run");
        if reference.is_empty() {
            return Err(VectorizeError::EmptyImage);
        }
        let settings = &self.config.settings;
        info!(
            strategy = ?settings.strategy,
            target = settings.target_score,
            budget = settings.max_evaluations,
            "search started"
        );

        let mut state = SearchState::new();
        let termination = match settings.strategy {
            Strategy::Grid => {
                let (done, result) = grid::run(self, adapter, reference, cancel, &self.config.grid, state);
                state = done;
                result?
            }
            Strategy::Bayesian => bayesian::run(self, adapter, reference, cancel, &mut state)?,
        };
        if termination == Termination::FailureRatio {
            warn!(failures = state.failures(), evaluations = state.evaluation_count(), "failure ratio exceeded");
        }

        let elapsed = state.elapsed();
        let (best, best_score, evaluations, failures) = state.into_parts();
        let achieved = best_score.as_ref().map_or(0.0, |s| s.composite);
        let target_met = best.is_some() && best_score.as_ref().is_some_and(|s| s.passes(settings.target_score));
        info!(
            ?termination,
            achieved,
            target_met,
            evaluations = evaluations.len(),
            failures,
            "search finished"
        );

        Ok(SearchOutcome {
            best_params: best.as_ref().and_then(|c| c.params.clone()),
            best,
            best_score,
            target: settings.target_score,
            target_met,
            termination,
            evaluations,
            failures,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    /// one trace -> render -> score round trip
    pub(crate) fn evaluate(&self, adapter: &TraceAdapter, reference: &RasterImage, params: &ParameterSet) -> Result<Trial> {
        profiling::scope!("SearchController::evaluate");
        let started = Instant::now();
        let failed = |msg: String| Trial {
            params: params.clone(),
            candidate: None,
            score: FidelityScore::unavailable(),
            failure: Some(msg),
            elapsed: started.elapsed(),
        };

        let candidate = match adapter.trace(reference, params) {
            Ok(c) => c,
            Err(VectorizeError::Trace(e)) => {
                warn!(%params, error = %e, "trace failed");
                return Ok(failed(e.to_string()));
            }
            Err(fatal) => return Err(fatal),
        };
        let (w, h) = reference.dimensions();
        let preview = match adapter.render(&candidate, w, h) {
            Ok(p) => p,
            Err(e) => {
                warn!(%params, error = %e, "render failed");
                return Ok(failed(e.to_string()));
            }
        };
        let score = self.engine.score(reference, &preview);
        debug!(
            %params,
            composite = score.composite,
            shapes = candidate.shape_count(),
            "evaluated"
        );
        Ok(Trial {
            params: params.clone(),
            candidate: Some(candidate),
            score,
            failure: None,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::candidate::{Geometry, Rgb, Shape};
    use crate::error::{RenderFailure, TraceFailure};
    use crate::params::{ParamDomain, ParamSpec};
    use crate::render::CpuRenderer;
    use crate::trace::{AdapterConfig, Reentrancy, TraceBackend};

    /// "n" picks how many 8px columns of the reference get painted black; 0 fails
    struct ColumnBackend {
        calls: AtomicUsize,
        reentrancy: Reentrancy,
    }

    impl ColumnBackend {
        fn new(reentrancy: Reentrancy) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), reentrancy })
        }
    }

    impl TraceBackend for ColumnBackend {
        fn name(&self) -> &str {
            "columns"
        }

        fn trace(&self, image: &RasterImage, params: &ParameterSet) -> std::result::Result<VectorCandidate, TraceFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = params.get_i64("n").unwrap_or(0);
            if n == 0 {
                return Err(TraceFailure::Rejected("n = 0".into()));
            }
            let shapes = (0..n)
                .map(|i| {
                    Shape::new(
                        Geometry::Rect { x: i as f64 * 8.0, y: 0.0, width: 8.0, height: 32.0 },
                        Rgb::BLACK,
                    )
                })
                .collect();
            Ok(VectorCandidate::new(image.width(), image.height(), shapes).with_background(Some(Rgb::WHITE)))
        }

        fn render(&self, c: &VectorCandidate, w: u32, h: u32) -> std::result::Result<RasterImage, RenderFailure> {
            CpuRenderer::default().render(c, w, h)
        }

        fn reentrancy(&self) -> Reentrancy {
            self.reentrancy
        }
    }

    fn schema() -> ParamSchema {
        ParamSchema::new(vec![ParamSpec::new("n", ParamDomain::Int { min: 0, max: 4 }, 1i64)
            .with_grid((0..=4).map(ParamValue::Int).collect())])
        .unwrap()
    }

    /// black for the first 16 columns, white elsewhere: exactly n = 2
    fn reference() -> RasterImage {
        RasterImage::from_fn(32, 32, |x, _| if x < 16 { [0, 0, 0, 255] } else { [255, 255, 255, 255] })
    }

    fn controller(settings: SearchSettings) -> SearchController {
        SearchController::new(SearchConfig::new(&settings, &schema()).unwrap(), MetricEngine::default())
    }

    fn adapter(backend: Arc<ColumnBackend>) -> TraceAdapter {
        TraceAdapter::new(backend, schema(), AdapterConfig::default())
    }

    #[test]
    fn test_zero_budget_makes_no_calls() {
        let backend = ColumnBackend::new(Reentrancy::Serialized);
        let settings = SearchSettings { max_evaluations: 0, target_score: 99.9, ..SearchSettings::default() };
        let out = controller(settings).run(&adapter(backend.clone()), &reference(), &CancelToken::new()).unwrap();
        assert!(!out.target_met);
        assert_eq!(out.termination, Termination::IterationBudget);
        assert!(out.best.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(out.exhausted().is_some());
    }

    #[test]
    fn test_grid_stops_at_target() {
        let backend = ColumnBackend::new(Reentrancy::Serialized);
        let settings = SearchSettings { target_score: 99.0, ..SearchSettings::default() };
        let out = controller(settings).run(&adapter(backend.clone()), &reference(), &CancelToken::new()).unwrap();
        assert!(out.target_met);
        assert_eq!(out.termination, Termination::TargetMet);
        assert_eq!(out.best_params.as_ref().and_then(|p| p.get_i64("n")), Some(2));
        // n = 0 (failure), 1, 2
        assert_eq!(out.evaluations.len(), 3);
        assert_eq!(out.failures, 1);
        assert!(out.evaluations[0].is_failure());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unreachable_target_exhausts_grid() {
        let backend = ColumnBackend::new(Reentrancy::Serialized);
        let settings = SearchSettings { target_score: 99.9, failure_ratio: 1.0, ..SearchSettings::default() };
        let ctl = controller(settings);
        let out = ctl.run(&adapter(backend), &reference(), &CancelToken::new()).unwrap();
        // n = 2 reproduces the reference exactly
        assert_eq!(out.termination, Termination::TargetMet);

        let off = RasterImage::from_fn(32, 32, |x, _| if x < 12 { [0, 0, 0, 255] } else { [255, 255, 255, 255] });
        let out = ctl.run(&adapter(ColumnBackend::new(Reentrancy::Serialized)), &off, &CancelToken::new()).unwrap();
        assert_eq!(out.termination, Termination::SpaceExhausted);
        assert_eq!(out.evaluations.len(), 5);
        assert!(!out.target_met);
        assert!(out.require_target().is_err());
    }

    #[test]
    fn test_unavailable_metric_never_meets_target() {
        // too narrow for the ssim window
        let sliver = RasterImage::from_fn(2, 32, |_, _| [0, 0, 0, 255]);
        let settings = SearchSettings { target_score: 50.0, failure_ratio: 1.0, ..SearchSettings::default() };
        let out = controller(settings)
            .run(&adapter(ColumnBackend::new(Reentrancy::Serialized)), &sliver, &CancelToken::new())
            .unwrap();
        let best = out.best_score.clone().unwrap();
        assert!(!best.ssim.available);
        assert!(!out.target_met);
        assert_eq!(out.termination, Termination::SpaceExhausted);
        assert_eq!(out.evaluations.len(), 5);
        assert!(out.exhausted().is_some());
    }

    #[test]
    fn test_parallel_grid_matches_sequential() {
        let off = RasterImage::from_fn(32, 32, |x, _| if x < 20 { [0, 0, 0, 255] } else { [255, 255, 255, 255] });
        let run = |workers| {
            let settings = SearchSettings { target_score: 100.0, workers, failure_ratio: 1.0, ..SearchSettings::default() };
            controller(settings)
                .run(&adapter(ColumnBackend::new(Reentrancy::Concurrent)), &off, &CancelToken::new())
                .unwrap()
        };
        let seq = run(1);
        let par = run(3);
        assert_eq!(seq.best_params, par.best_params);
        assert_eq!(seq.achieved(), par.achieved());
        let ordinals: Vec<usize> = par.evaluations.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_failure_ratio_ends_run() {
        let backend = ColumnBackend::new(Reentrancy::Serialized);
        let mut settings = SearchSettings {
            target_score: 100.0,
            failure_ratio: 0.5,
            min_evaluations_for_failure_ratio: 1,
            ..SearchSettings::default()
        };
        settings.grid.insert("n".into(), vec![ParamValue::Int(0), ParamValue::Int(1)]);
        let out = controller(settings).run(&adapter(backend.clone()), &reference(), &CancelToken::new()).unwrap();
        assert_eq!(out.termination, Termination::FailureRatio);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let backend = ColumnBackend::new(Reentrancy::Serialized);
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = controller(SearchSettings::default()).run(&adapter(backend.clone()), &reference(), &cancel).unwrap();
        assert_eq!(out.termination, Termination::Cancelled);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_patience() {
        let backend = ColumnBackend::new(Reentrancy::Serialized);
        let off = RasterImage::from_fn(32, 32, |x, _| if x < 4 { [0, 0, 0, 255] } else { [255, 255, 255, 255] });
        let settings = SearchSettings {
            target_score: 100.0,
            patience: Some(2),
            failure_ratio: 1.0,
            ..SearchSettings::default()
        };
        let out = controller(settings).run(&adapter(backend), &off, &CancelToken::new()).unwrap();
        assert_eq!(out.termination, Termination::Patience);
        assert_eq!(out.best_params.as_ref().and_then(|p| p.get_i64("n")), Some(1));
        assert_eq!(out.evaluations.len(), 4);
    }

    #[test]
    fn test_bayesian_is_deterministic_and_dedups() {
        let run = || {
            let settings = SearchSettings {
                strategy: Strategy::Bayesian,
                target_score: 100.0,
                max_evaluations: 8,
                failure_ratio: 1.0,
                seed: 3,
                ..SearchSettings::default()
            };
            controller(settings)
                .run(&adapter(ColumnBackend::new(Reentrancy::Serialized)), &reference(), &CancelToken::new())
                .unwrap()
        };
        let a = run();
        let b = run();
        let pa: Vec<_> = a.evaluations.iter().map(|e| e.params.clone()).collect();
        let pb: Vec<_> = b.evaluations.iter().map(|e| e.params.clone()).collect();
        assert_eq!(pa, pb);
        // only five distinct points exist
        assert!(pa.len() <= 5);
        let unique: std::collections::HashSet<_> = pa.iter().collect();
        assert_eq!(unique.len(), pa.len());
        // defaults first
        assert_eq!(pa[0], schema().defaults());
    }

    #[test]
    fn test_oversized_grid_is_rejected() {
        let settings = SearchSettings { max_grid_points: 3, ..SearchSettings::default() };
        assert!(SearchConfig::new(&settings, &schema()).is_err());
    }
}
