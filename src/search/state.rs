use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::candidate::VectorCandidate;
use crate::fitness::FidelityScore;
use crate::params::ParameterSet;

use super::bayesian::SurrogateBelief;
use super::{SearchConfig, Termination};

/// One adapter round trip as it lands in the evaluation log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Evaluation {
    /// proposal order; the tie-break of last resort
    pub ordinal: usize,
    pub params: ParameterSet,
    pub score: FidelityScore,
    pub shape_count: usize,
    /// trace / render failure message; the score is then all-unavailable
    pub failure: Option<String>,
    pub elapsed_ms: f64,
}

impl Evaluation {
    pub fn composite(&self) -> f64 {
        self.score.composite
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Result of one trace -> render -> score round trip.
#[derive(Debug)]
pub(crate) struct Trial {
    pub params: ParameterSet,
    pub candidate: Option<VectorCandidate>,
    pub score: FidelityScore,
    pub failure: Option<String>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
struct Best {
    candidate: VectorCandidate,
    score: FidelityScore,
    ordinal: usize,
}

impl Best {
    // fully scored first, then higher composite, then fewer shapes, then earlier proposal
    fn rank(&self, score: &FidelityScore, shapes: usize, ordinal: usize) -> Ordering {
        score
            .is_fully_available()
            .cmp(&self.score.is_fully_available())
            .then_with(|| score.composite.total_cmp(&self.score.composite))
            .then_with(|| self.candidate.shape_count().cmp(&shapes))
            .then_with(|| self.ordinal.cmp(&ordinal))
    }
}

/// Everything one search run knows; owned by that run and dropped with it.
#[derive(Debug)]
pub struct SearchState {
    started: Instant,
    evaluations: Vec<Evaluation>,
    seen: HashSet<ParameterSet>,
    best: Option<Best>,
    failures: usize,
    pub(crate) surrogate: Option<SurrogateBelief>,
}

impl Default for SearchState {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            evaluations: Vec::new(),
            seen: HashSet::new(),
            best: None,
            failures: 0,
            surrogate: None,
        }
    }

    /// Reserve `params` for evaluation. false when it was already proposed in this run.
    pub fn claim(&mut self, params: &ParameterSet) -> bool {
        if self.seen.contains(params) {
            return false;
        }
        self.seen.insert(params.clone());
        true
    }

    pub fn is_seen(&self, params: &ParameterSet) -> bool {
        self.seen.contains(params)
    }

    /// Log a trial and promote it to best if it ranks higher. Returns true on promotion.
    pub(crate) fn record(&mut self, ordinal: usize, trial: Trial) -> bool {
        let shape_count = trial.candidate.as_ref().map_or(0, VectorCandidate::shape_count);
        if trial.failure.is_some() {
            self.failures += 1;
        }
        self.evaluations.push(Evaluation {
            ordinal,
            params: trial.params,
            score: trial.score.clone(),
            shape_count,
            failure: trial.failure,
            elapsed_ms: trial.elapsed.as_secs_f64() * 1000.0,
        });

        let Some(candidate) = trial.candidate else {
            return false;
        };
        let promote = match &self.best {
            None => true,
            Some(best) => best.rank(&trial.score, shape_count, ordinal) == Ordering::Greater,
        };
        if promote {
            self.best = Some(Best { candidate, score: trial.score, ordinal });
        }
        promote
    }

    pub fn evaluations(&self) -> &[Evaluation] {
        &self.evaluations
    }

    pub fn evaluation_count(&self) -> usize {
        self.evaluations.len()
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// composite of the best candidate, 0 before any success
    pub fn best_score(&self) -> f64 {
        self.best.as_ref().map_or(0.0, |b| b.score.composite)
    }

    pub fn best_fidelity(&self) -> Option<&FidelityScore> {
        self.best.as_ref().map(|b| &b.score)
    }

    pub fn best_candidate(&self) -> Option<&VectorCandidate> {
        self.best.as_ref().map(|b| &b.candidate)
    }

    /// evaluations proposed after the current best (all of them before any success)
    pub fn stale(&self) -> usize {
        match &self.best {
            Some(best) => self.evaluations.iter().filter(|e| e.ordinal > best.ordinal).count(),
            None => self.evaluations.len(),
        }
    }

    /// first stop condition that holds, if any
    pub fn check(&self, config: &SearchConfig, cancel: &CancelToken) -> Option<Termination> {
        let settings = &config.settings;
        // a best with any unavailable sub-metric cannot meet the target
        if self.best_fidelity().is_some_and(|s| s.passes(settings.target_score)) {
            return Some(Termination::TargetMet);
        }
        let n = self.evaluations.len();
        if n >= settings.min_evaluations_for_failure_ratio
            && n > 0
            && self.failures as f64 / n as f64 > settings.failure_ratio
        {
            return Some(Termination::FailureRatio);
        }
        if cancel.is_cancelled() {
            return Some(Termination::Cancelled);
        }
        if n >= settings.max_evaluations {
            return Some(Termination::IterationBudget);
        }
        if config.time_budget.is_some_and(|budget| self.elapsed() >= budget) {
            return Some(Termination::TimeBudget);
        }
        if settings.patience.is_some_and(|p| self.best.is_some() && self.stale() >= p) {
            return Some(Termination::Patience);
        }
        None
    }

    pub(crate) fn sort_log(&mut self) {
        self.evaluations.sort_by_key(|e| e.ordinal);
    }

    pub(crate) fn into_parts(self) -> (Option<VectorCandidate>, Option<FidelityScore>, Vec<Evaluation>, usize) {
        let (candidate, score) = match self.best {
            Some(b) => (Some(b.candidate), Some(b.score)),
            None => (None, None),
        };
        (candidate, score, self.evaluations, self.failures)
    }
}
