//! Gaussian-process surrogate over the unit-cube encoding of a [`ParamSchema`], with
//! expected improvement as the acquisition function.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::params::{ParamSchema, ParameterSet};
use crate::raster::RasterImage;
use crate::trace::TraceAdapter;

use super::state::SearchState;
use super::{SearchController, Termination};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianSettings {
    /// evaluations before the surrogate is consulted; the first one is the schema defaults
    pub initial_points: usize,
    /// random points scored by expected improvement per proposal
    pub candidates: usize,
    /// RBF length scale in unit-cube coordinates
    pub length_scale: f64,
    /// observation noise added to the kernel diagonal (standardized units)
    pub noise: f64,
    /// exploration margin of expected improvement
    pub xi: f64,
}

impl Default for BayesianSettings {
    fn default() -> Self {
        Self {
            initial_points: 4,
            candidates: 256,
            length_scale: 0.3,
            noise: 1e-4,
            xi: 0.01,
        }
    }
}

impl BayesianSettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.candidates == 0 {
            return Err("bayesian.candidates must be positive".into());
        }
        if !(self.length_scale.is_finite() && self.length_scale > 0.0) {
            return Err("bayesian.length_scale must be positive".into());
        }
        if !(self.noise.is_finite() && self.noise > 0.0) {
            return Err("bayesian.noise must be positive".into());
        }
        if !(self.xi.is_finite() && self.xi >= 0.0) {
            return Err("bayesian.xi must be non-negative".into());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub x: Vec<f64>,
    pub y: f64,
}

/// Everything the surrogate has learned in one run. Plain data so it can be dumped
/// next to the evaluation log; the fitted model is rebuilt from it on demand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurrogateBelief {
    pub length_scale: f64,
    pub noise: f64,
    pub observations: Vec<Observation>,
}

impl SurrogateBelief {
    pub fn new(settings: &BayesianSettings) -> Self {
        Self {
            length_scale: settings.length_scale,
            noise: settings.noise,
            observations: Vec::new(),
        }
    }

    pub fn observe(&mut self, x: Vec<f64>, y: f64) {
        self.observations.push(Observation { x, y });
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// condition the GP on every observation. None when there is nothing to fit or the
    /// kernel matrix stays singular after jittering.
    pub fn fit(&self) -> Option<FittedGp> {
        profiling::scope!("SurrogateBelief::fit");
        let n = self.observations.len();
        if n == 0 {
            return None;
        }
        let ys: Vec<f64> = self.observations.iter().map(|o| o.y).collect();
        let mean = ys.iter().sum::<f64>() / n as f64;
        let var = ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64;
        let std = if var.sqrt() > 1e-9 { var.sqrt() } else { 1.0 };
        let y = DVector::from_iterator(n, ys.iter().map(|v| (v - mean) / std));

        let mut jitter = self.noise;
        for _ in 0..5 {
            let k = DMatrix::from_fn(n, n, |i, j| {
                let base = rbf(&self.observations[i].x, &self.observations[j].x, self.length_scale);
                if i == j {
                    base + jitter
                } else {
                    base
                }
            });
            if let Some(chol) = k.cholesky() {
                let alpha = chol.solve(&y);
                let best = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                return Some(FittedGp {
                    xs: self.observations.iter().map(|o| o.x.clone()).collect(),
                    chol,
                    alpha,
                    length_scale: self.length_scale,
                    best,
                });
            }
            jitter *= 10.0;
        }
        debug!(observations = n, "kernel matrix not positive definite");
        None
    }
}

fn rbf(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (-d2 / (2.0 * length_scale * length_scale)).exp()
}

/// GP posterior in standardized target units.
pub struct FittedGp {
    xs: Vec<Vec<f64>>,
    chol: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    length_scale: f64,
    best: f64,
}

impl FittedGp {
    /// posterior (mean, standard deviation) at `x`
    pub fn predict(&self, x: &[f64]) -> (f64, f64) {
        let k = DVector::from_iterator(self.xs.len(), self.xs.iter().map(|xi| rbf(xi, x, self.length_scale)));
        let mean = k.dot(&self.alpha);
        let v = self.chol.solve(&k);
        let var = (1.0 - k.dot(&v)).max(0.0);
        (mean, var.sqrt())
    }

    /// best observation, standardized
    pub fn incumbent(&self) -> f64 {
        self.best
    }
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// EI of a point with posterior N(mean, sigma^2) over `best` (maximization)
pub fn expected_improvement(mean: f64, sigma: f64, best: f64, xi: f64) -> f64 {
    let gain = mean - best - xi;
    if sigma <= 1e-12 {
        return gain.max(0.0);
    }
    let z = gain / sigma;
    gain * normal_cdf(z) + sigma * normal_pdf(z)
}

fn random_point(dims: usize, rng: &mut Pcg32) -> Vec<f64> {
    (0..dims).map(|_| rng.random::<f64>()).collect()
}

fn random_unseen(schema: &ParamSchema, state: &SearchState, rng: &mut Pcg32, attempts: usize) -> Option<ParameterSet> {
    (0..attempts)
        .map(|_| schema.decode(&random_point(schema.dims(), rng)))
        .find(|p| !state.is_seen(p))
}

/// next parameter set for `ordinal`: defaults, then the random initial design, then
/// argmax EI. None once no unseen point can be found.
fn propose(
    ordinal: usize,
    schema: &ParamSchema,
    settings: &BayesianSettings,
    state: &SearchState,
    rng: &mut Pcg32,
) -> Option<ParameterSet> {
    profiling::scope!("bayesian::propose");
    if ordinal == 0 {
        let defaults = schema.defaults();
        if !state.is_seen(&defaults) {
            return Some(defaults);
        }
    }
    if ordinal < settings.initial_points {
        return random_unseen(schema, state, rng, settings.candidates);
    }
    let Some(gp) = state.surrogate.as_ref().and_then(SurrogateBelief::fit) else {
        return random_unseen(schema, state, rng, settings.candidates);
    };

    let incumbent = gp.incumbent();
    let mut best: Option<(f64, ParameterSet)> = None;
    for _ in 0..settings.candidates {
        let params = schema.decode(&random_point(schema.dims(), rng));
        if state.is_seen(&params) {
            continue;
        }
        // score the snapped point, not the raw sample
        let (mean, sigma) = gp.predict(&schema.encode(&params));
        let ei = expected_improvement(mean, sigma, incumbent, settings.xi);
        if best.as_ref().map_or(true, |(b, _)| ei > *b) {
            best = Some((ei, params));
        }
    }
    best.map(|(ei, params)| {
        debug!(ordinal, ei, %params, "acquisition");
        params
    })
}

/// Sequential model-based search. Failed evaluations are observed as score 0 so the
/// surrogate steers away from them.
pub(super) fn run(
    controller: &SearchController,
    adapter: &TraceAdapter,
    reference: &RasterImage,
    cancel: &CancelToken,
    state: &mut SearchState,
) -> Result<Termination> {
    let settings = &controller.config().settings;
    let schema = adapter.schema();
    let mut rng = Pcg32::seed_from_u64(settings.seed);
    state.surrogate = Some(SurrogateBelief::new(&settings.bayesian));

    loop {
        if let Some(reason) = state.check(controller.config(), cancel) {
            return Ok(reason);
        }
        let ordinal = state.evaluation_count();
        let Some(params) = propose(ordinal, schema, &settings.bayesian, state, &mut rng) else {
            return Ok(Termination::SpaceExhausted);
        };
        state.claim(&params);
        let trial = controller.evaluate(adapter, reference, &params)?;
        let observed = if trial.failure.is_some() { 0.0 } else { trial.score.composite };
        if let Some(belief) = state.surrogate.as_mut() {
            belief.observe(schema.encode(&params), observed);
        }
        state.record(ordinal, trial);
    }
}
