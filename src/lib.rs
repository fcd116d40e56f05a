//! Closed-loop raster to vector conversion.
//!
//! A [`trace::TraceAdapter`] wraps an opaque tracing backend, the [`fitness::MetricEngine`]
//! scores re-rendered candidates against the source raster, the [`search`] controller
//! steers backend parameters toward a target score and [`compact`] shrinks the winning
//! SVG without letting fidelity drop below a floor. [`pipeline::Vectorizer`] wires the
//! whole loop together from one [`settings::VectorizeSettings`].

pub mod cancel;
pub mod candidate;
pub mod compact;
pub mod error;
pub mod fitness;
pub mod geom;
pub mod params;
pub mod pipeline;
pub mod raster;
pub mod render;
pub mod search;
pub mod settings;
pub mod svg;
pub mod trace;

pub use cancel::CancelToken;
pub use candidate::{Geometry, Rgb, Shape, VectorCandidate};
pub use compact::{CompactionResult, CompactionStats, PostTraceOptimizer};
pub use error::{Result, VectorizeError};
pub use fitness::{FidelityScore, MetricEngine, MetricWeights};
pub use params::{ParamSchema, ParamValue, ParameterSet};
pub use pipeline::{RunSummary, VectorizeOutput, Vectorizer};
pub use raster::RasterImage;
pub use search::{SearchController, SearchOutcome, Strategy, Termination};
pub use settings::VectorizeSettings;
pub use trace::{Reentrancy, TraceAdapter, TraceBackend};
