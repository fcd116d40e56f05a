//! Exhaustive grid: proposals in enumeration order, optionally fanned out over a
//! bounded rayon pool in batches of `workers`.

use std::sync::Mutex;

use rayon::prelude::*;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Result, VectorizeError};
use crate::params::ParameterSet;
use crate::raster::RasterImage;
use crate::trace::TraceAdapter;

use super::state::SearchState;
use super::{SearchController, Termination};

pub(super) fn run(
    controller: &SearchController,
    adapter: &TraceAdapter,
    reference: &RasterImage,
    cancel: &CancelToken,
    points: &[ParameterSet],
    state: SearchState,
) -> (SearchState, Result<Termination>) {
    let workers = controller.config().settings.workers.max(1);
    if workers == 1 {
        let mut state = state;
        let result = run_sequential(controller, adapter, reference, cancel, points, &mut state);
        return (state, result);
    }

    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("grid-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => return (state, Err(VectorizeError::invalid_config(format!("grid worker pool: {e}")))),
    };

    let shared = Mutex::new(state);
    let result = run_batched(controller, adapter, reference, cancel, points, &shared, &pool, workers);
    let mut state = shared.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    state.sort_log();
    (state, result)
}

fn run_sequential(
    controller: &SearchController,
    adapter: &TraceAdapter,
    reference: &RasterImage,
    cancel: &CancelToken,
    points: &[ParameterSet],
    state: &mut SearchState,
) -> Result<Termination> {
    for (ordinal, params) in points.iter().enumerate() {
        if let Some(reason) = state.check(controller.config(), cancel) {
            return Ok(reason);
        }
        if !state.claim(params) {
            continue;
        }
        let trial = controller.evaluate(adapter, reference, params)?;
        state.record(ordinal, trial);
    }
    Ok(state.check(controller.config(), cancel).unwrap_or(Termination::SpaceExhausted))
}

#[allow(clippy::too_many_arguments)]
fn run_batched(
    controller: &SearchController,
    adapter: &TraceAdapter,
    reference: &RasterImage,
    cancel: &CancelToken,
    points: &[ParameterSet],
    shared: &Mutex<SearchState>,
    pool: &rayon::ThreadPool,
    workers: usize,
) -> Result<Termination> {
    let budget = controller.config().settings.max_evaluations;
    let mut next = 0;
    loop {
        // claim the next batch under the lock, in enumeration order
        let batch: Vec<(usize, &ParameterSet)> = {
            let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(reason) = state.check(controller.config(), cancel) {
                return Ok(reason);
            }
            let room = workers.min(budget.saturating_sub(state.evaluation_count()));
            let mut batch = Vec::with_capacity(room);
            while batch.len() < room && next < points.len() {
                if state.claim(&points[next]) {
                    batch.push((next, &points[next]));
                }
                next += 1;
            }
            if batch.is_empty() {
                return Ok(state.check(controller.config(), cancel).unwrap_or(Termination::SpaceExhausted));
            }
            batch
        };
        debug!(size = batch.len(), first = batch[0].0, "grid batch");

        let outcomes: Vec<Result<()>> = pool.install(|| {
            batch
                .par_iter()
                .map(|&(ordinal, params)| {
                    let trial = controller.evaluate(adapter, reference, params)?;
                    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).record(ordinal, trial);
                    Ok(())
                })
                .collect()
        });
        // first fatal error in enumeration order
        outcomes.into_iter().collect::<Result<Vec<()>>>()?;
    }
}
