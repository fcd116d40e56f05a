//! Trace invocation adapter: the only place the control loop touches a backend.

mod contour;
mod palette;

pub use palette::PaletteTracer;

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::candidate::{Rgb, VectorCandidate};
use crate::error::{RenderFailure, Result, TraceFailure, VectorizeError};
use crate::params::{ParamSchema, ParameterSet};
use crate::raster::RasterImage;
use crate::render::CpuRenderer;

/// Whether a backend tolerates overlapping calls from several threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reentrancy {
    Serialized,
    Concurrent,
}

/// An external raster->vector tracer plus the renderer used to re-evaluate its output.
/// Implementations must be deterministic for a given (image, parameters) pair.
pub trait TraceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn trace(&self, image: &RasterImage, params: &ParameterSet) -> Result<VectorCandidate, TraceFailure>;

    fn render(&self, candidate: &VectorCandidate, width: u32, height: u32) -> Result<RasterImage, RenderFailure>;

    fn reentrancy(&self) -> Reentrancy {
        Reentrancy::Serialized
    }
}

/// Bundled backend: [`PaletteTracer`] for tracing, [`CpuRenderer`] for previews.
/// Both are pure functions of their inputs.
#[derive(Clone, Debug, Default)]
pub struct ReferenceBackend {
    pub tracer: PaletteTracer,
    pub renderer: CpuRenderer,
}

impl TraceBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "palette"
    }

    fn trace(&self, image: &RasterImage, params: &ParameterSet) -> Result<VectorCandidate, TraceFailure> {
        self.tracer.trace(image, params)
    }

    fn render(&self, candidate: &VectorCandidate, width: u32, height: u32) -> Result<RasterImage, RenderFailure> {
        self.renderer.render(candidate, width, height)
    }

    fn reentrancy(&self) -> Reentrancy {
        Reentrancy::Concurrent
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AdapterConfig {
    pub trace_timeout: Duration,
    pub render_timeout: Duration,
    /// decimal digits applied to every traced candidate
    pub precision: u8,
    /// fill painted under every traced candidate that brings none of its own
    pub background: Option<Rgb>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            trace_timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(30),
            precision: VectorCandidate::DEFAULT_PRECISION,
            background: None,
        }
    }
}

/// Wraps a [`TraceBackend`] with parameter validation, bounded timeouts and call
/// serialization. Holds no state beyond configuration; clones share the backend and
/// the serialization gate.
#[derive(Clone)]
pub struct TraceAdapter {
    backend: Arc<dyn TraceBackend>,
    schema: ParamSchema,
    config: AdapterConfig,
    // Some = one backend call at a time; resolved once from the backend's reentrancy
    gate: Option<Arc<Mutex<()>>>,
}

impl std::fmt::Debug for TraceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceAdapter")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("serialized", &self.gate.is_some())
            .finish()
    }
}

impl TraceAdapter {
    pub fn new(backend: Arc<dyn TraceBackend>, schema: ParamSchema, config: AdapterConfig) -> Self {
        let gate = match backend.reentrancy() {
            Reentrancy::Serialized => Some(Arc::new(Mutex::new(()))),
            Reentrancy::Concurrent => None,
        };
        Self { backend, schema, config, gate }
    }

    /// bundled palette tracer with the reference schema
    pub fn reference(config: AdapterConfig) -> Self {
        Self::new(Arc::new(ReferenceBackend::default()), ParamSchema::reference(), config)
    }

    pub fn schema(&self) -> &ParamSchema {
        &self.schema
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn is_serialized(&self) -> bool {
        self.gate.is_some()
    }

    /// Trace `image` with `params`. Out-of-domain parameters fail with
    /// [`VectorizeError::InvalidParameterSet`] before the backend is called; backend
    /// problems come back as [`VectorizeError::Trace`].
    pub fn trace(&self, image: &RasterImage, params: &ParameterSet) -> Result<VectorCandidate> {
        profiling::scope!("TraceAdapter::trace");
        self.schema.validate(params)?;

        let backend = Arc::clone(&self.backend);
        let (img, p) = (image.clone(), params.clone());
        let traced = self
            .call_with_timeout("trace", self.config.trace_timeout, move || backend.trace(&img, &p))
            .map_err(|e| match e {
                CallError::TimedOut => TraceFailure::TimedOut(self.config.trace_timeout),
                CallError::Disconnected => TraceFailure::Disconnected,
            })?;
        let candidate = traced?;

        if candidate.shapes.is_empty() && candidate.background.is_none() {
            return Err(VectorizeError::Trace(TraceFailure::EmptyGeometry));
        }

        let background = candidate.background.or(self.config.background);
        Ok(candidate
            .with_precision(self.config.precision)
            .with_background(background)
            .with_params(params.clone()))
    }

    /// Render `candidate` at (width, height). A preview cached on the candidate at the
    /// same size is reused; a fresh render is cached on it.
    pub fn render(&self, candidate: &VectorCandidate, width: u32, height: u32) -> Result<RasterImage, RenderFailure> {
        profiling::scope!("TraceAdapter::render");
        if let Some(preview) = candidate.preview() {
            if preview.dimensions() == (width, height) {
                return Ok(preview.clone());
            }
        }

        let backend = Arc::clone(&self.backend);
        let cand = candidate.clone();
        let rendered = self
            .call_with_timeout("render", self.config.render_timeout, move || backend.render(&cand, width, height))
            .map_err(|e| match e {
                CallError::TimedOut => RenderFailure::TimedOut(self.config.render_timeout),
                CallError::Disconnected => RenderFailure::Disconnected,
            })??;
        candidate.set_preview(rendered.clone());
        Ok(rendered)
    }

    // run `f` on a named worker and wait at most `timeout` for it. a timed-out worker
    // is left to finish on its own; it keeps holding the gate until it does.
    fn call_with_timeout<T, F>(&self, what: &str, timeout: Duration, f: F) -> Result<T, CallError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let gate = self.gate.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{what}", self.backend.name()))
            .spawn(move || {
                let _guard = gate.as_ref().map(|g| g.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
                let _ = tx.send(f());
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn backend worker");
            return Err(CallError::Disconnected);
        }

        match rx.recv_timeout(timeout) {
            Ok(v) => Ok(v),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(backend = self.backend.name(), call = what, ?timeout, "backend call timed out");
                Err(CallError::TimedOut)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(CallError::Disconnected),
        }
    }
}

enum CallError {
    TimedOut,
    Disconnected,
}
