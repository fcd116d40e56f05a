/// run settings for vectalab
/// one serde tree for every component; converted into runtime configs up front
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::candidate::{Rgb, VectorCandidate};
use crate::compact::CompactionConfig;
use crate::error::{Result, VectorizeError};
use crate::fitness::MetricConfig;
use crate::params::ParamSchema;
use crate::search::{SearchConfig, SearchSettings};
use crate::trace::AdapterConfig;

/// post-trace compaction
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// minimum composite every transform must hold; None = the search target
    pub floor: Option<f64>,
    pub transforms: CompactionConfig,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            floor: None,
            transforms: CompactionConfig::default(),
        }
    }
}

/// backend call limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub trace_timeout_secs: f64,
    pub render_timeout_secs: f64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            trace_timeout_secs: 30.0,
            render_timeout_secs: 30.0,
        }
    }
}

/// svg output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvgSettings {
    /// decimal digits per coordinate before compaction
    pub precision: u8,
    /// painted under traces that bring no background of their own
    pub background: Option<Rgb>,
}

impl Default for SvgSettings {
    fn default() -> Self {
        Self {
            precision: VectorCandidate::DEFAULT_PRECISION,
            background: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizeSettings {
    pub metric: MetricConfig,
    pub search: SearchSettings,
    pub compaction: CompactionSettings,
    pub adapter: AdapterSettings,
    pub svg: SvgSettings,
}

impl VectorizeSettings {
    /// parse and validate; missing keys take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// load settings from a JSON file, or return defaults if it is missing or broken
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(settings) => settings,
            Err(VectorizeError::Io(_)) => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unusable settings file, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.metric.validate()?;
        self.search.validate()?;
        self.compaction.transforms.validate()?;
        if let Some(floor) = self.compaction.floor {
            if !(floor.is_finite() && (0.0..=100.0).contains(&floor)) {
                return Err(VectorizeError::invalid_config("compaction.floor must lie in 0..=100"));
            }
        }
        for (name, secs) in [
            ("adapter.trace_timeout_secs", self.adapter.trace_timeout_secs),
            ("adapter.render_timeout_secs", self.adapter.render_timeout_secs),
        ] {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(VectorizeError::invalid_config(format!("{name} must be positive")));
            }
            duration_secs(name, secs)?;
        }
        if self.svg.precision > 8 {
            return Err(VectorizeError::invalid_config("svg.precision must be at most 8"));
        }
        if self.compaction.transforms.min_precision > self.svg.precision {
            return Err(VectorizeError::invalid_config(
                "compaction.transforms.min_precision exceeds svg.precision",
            ));
        }
        Ok(())
    }

    /// fidelity floor of the compaction pass
    pub fn compaction_floor(&self) -> f64 {
        self.compaction.floor.unwrap_or(self.search.target_score)
    }

    pub fn search_config(&self, schema: &ParamSchema) -> Result<SearchConfig> {
        SearchConfig::new(&self.search, schema)
    }
}

/// seconds as a `Duration`; values too large to represent are a config error
pub(crate) fn duration_secs(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| VectorizeError::invalid_config(format!("{name} = {secs} is not a usable duration: {e}")))
}

impl TryFrom<&VectorizeSettings> for AdapterConfig {
    type Error = VectorizeError;

    fn try_from(settings: &VectorizeSettings) -> Result<Self> {
        Ok(Self {
            trace_timeout: duration_secs("adapter.trace_timeout_secs", settings.adapter.trace_timeout_secs)?,
            render_timeout: duration_secs("adapter.render_timeout_secs", settings.adapter.render_timeout_secs)?,
            precision: settings.svg.precision,
            background: settings.svg.background,
        })
    }
}
