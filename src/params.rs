//! Tracing knobs: values, declared domains and the schema the adapter validates against.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::ParamError;

/// float knobs are snapped to 1/1000 when decoded from the unit cube, so the
/// surrogate can't propose two sets that differ only in noise digits
const FLOAT_STEPS: f64 = 1000.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Choice(String),
}

impl ParamValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// ints widen to floats so `"curve_tolerance": 1` in JSON is accepted
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Choice(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Choice(s) => Some(s),
            _ => None,
        }
    }
}

// floats compare and hash by bit pattern so a ParameterSet can key a HashSet
impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (ParamValue::Float(a), ParamValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ParamValue::Choice(a), ParamValue::Choice(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ParamValue::Int(v) => v.hash(state),
            ParamValue::Float(v) => v.to_bits().hash(state),
            ParamValue::Choice(s) => s.hash(state),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Choice(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Choice(v.to_owned())
    }
}

/// Immutable mapping from knob name to value. Ordered so hashing, display and JSON are
/// stable across runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, ParamValue>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder-style insert; returns a new set
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.0.insert(name.to_owned(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParamValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_f64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParamValue::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamDomain {
    Choice { options: Vec<String> },
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
}

impl ParamDomain {
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamDomain::Choice { options }, ParamValue::Choice(s)) => options.iter().any(|o| o == s),
            (ParamDomain::Int { min, max }, ParamValue::Int(v)) => (*min..=*max).contains(v),
            (ParamDomain::Float { min, max }, v) => v
                .as_f64()
                .is_some_and(|x| x.is_finite() && *min <= x && x <= *max),
            _ => false,
        }
    }

    /// map a value onto [0, 1]. choices land on the centre of their bucket so decode()
    /// is the exact inverse.
    pub fn encode(&self, value: &ParamValue) -> f64 {
        let u = match (self, value) {
            (ParamDomain::Choice { options }, ParamValue::Choice(s)) => {
                let idx = options.iter().position(|o| o == s).unwrap_or(0);
                (idx as f64 + 0.5) / options.len().max(1) as f64
            }
            (ParamDomain::Int { min, max }, ParamValue::Int(v)) => {
                if max == min {
                    0.5
                } else {
                    (*v - *min) as f64 / (*max - *min) as f64
                }
            }
            (ParamDomain::Float { min, max }, v) => {
                let x = v.as_f64().unwrap_or(*min);
                if max <= min {
                    0.5
                } else {
                    (x - min) / (max - min)
                }
            }
            _ => 0.5,
        };
        u.clamp(0.0, 1.0)
    }

    pub fn decode(&self, u: f64) -> ParamValue {
        let u = if u.is_finite() { u.clamp(0.0, 1.0) } else { 0.5 };
        match self {
            ParamDomain::Choice { options } => {
                let n = options.len().max(1);
                let idx = ((u * n as f64).floor() as usize).min(n - 1);
                ParamValue::Choice(options.get(idx).cloned().unwrap_or_default())
            }
            ParamDomain::Int { min, max } => {
                let span = (*max - *min) as f64;
                ParamValue::Int((*min + (u * span).round() as i64).clamp(*min, *max))
            }
            ParamDomain::Float { min, max } => {
                let x = min + u * (max - min);
                let snapped = (x * FLOAT_STEPS).round() / FLOAT_STEPS;
                ParamValue::Float(snapped.clamp(*min, *max))
            }
        }
    }

    fn is_well_formed(&self) -> bool {
        match self {
            ParamDomain::Choice { options } => !options.is_empty(),
            ParamDomain::Int { min, max } => min <= max,
            ParamDomain::Float { min, max } => min.is_finite() && max.is_finite() && min <= max,
        }
    }
}

impl fmt::Display for ParamDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamDomain::Choice { options } => write!(f, "{{{}}}", options.join(", ")),
            ParamDomain::Int { min, max } => write!(f, "{min}..={max}"),
            ParamDomain::Float { min, max } => write!(f, "{min}..={max}"),
        }
    }
}

/// one declared knob: its domain, its default and the values the exhaustive grid walks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub domain: ParamDomain,
    pub default: ParamValue,
    /// empty = the grid holds this knob at its default
    #[serde(default)]
    pub grid: Vec<ParamValue>,
}

impl ParamSpec {
    pub fn new(name: &str, domain: ParamDomain, default: impl Into<ParamValue>) -> Self {
        Self { name: name.to_owned(), domain, default: default.into(), grid: Vec::new() }
    }

    pub fn with_grid(mut self, grid: Vec<ParamValue>) -> Self {
        self.grid = grid;
        self
    }

    fn grid_values(&self) -> Vec<ParamValue> {
        if self.grid.is_empty() {
            vec![self.default.clone()]
        } else {
            self.grid.clone()
        }
    }
}

/// Fixed declaration of every knob a backend accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    specs: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new(specs: Vec<ParamSpec>) -> Result<Self, String> {
        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.as_str()) {
                return Err(format!("duplicate option `{}`", spec.name));
            }
            if !spec.domain.is_well_formed() {
                return Err(format!("option `{}` has an empty domain", spec.name));
            }
            if !spec.domain.contains(&spec.default) {
                return Err(format!("default of `{}` lies outside {}", spec.name, spec.domain));
            }
            if let Some(bad) = spec.grid.iter().find(|v| !spec.domain.contains(v)) {
                return Err(format!("grid value {bad} of `{}` lies outside {}", spec.name, spec.domain));
            }
        }
        Ok(Self { specs })
    }

    /// knobs understood by the bundled palette tracer
    pub fn reference() -> Self {
        let quality = ["clean", "balanced", "high", "ultra"];
        Self {
            specs: vec![
                ParamSpec::new(
                    "quality",
                    ParamDomain::Choice { options: quality.iter().map(|s| s.to_string()).collect() },
                    "balanced",
                )
                .with_grid(quality.iter().map(|&s| ParamValue::from(s)).collect()),
                ParamSpec::new("colors", ParamDomain::Int { min: 0, max: 64 }, 0i64)
                    .with_grid([0, 2, 4, 8, 16].into_iter().map(ParamValue::Int).collect()),
                ParamSpec::new("speckle", ParamDomain::Int { min: 0, max: 4096 }, 4i64),
                ParamSpec::new("curve_tolerance", ParamDomain::Float { min: 0.0, max: 8.0 }, 0.0),
                ParamSpec::new("corner_threshold", ParamDomain::Float { min: 0.0, max: 180.0 }, 60.0),
            ],
        }
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// dimensionality of the unit-cube encoding
    pub fn dims(&self) -> usize {
        self.specs.len()
    }

    pub fn defaults(&self) -> ParameterSet {
        self.specs
            .iter()
            .fold(ParameterSet::new(), |set, s| set.with(&s.name, s.default.clone()))
    }

    /// exact-match check: every declared knob present, nothing undeclared, every value
    /// inside its domain. values are never clamped.
    pub fn validate(&self, set: &ParameterSet) -> Result<(), ParamError> {
        if let Some((name, _)) = set.iter().find(|(name, _)| self.spec(name).is_none()) {
            return Err(ParamError::UnknownOption(name.to_owned()));
        }
        for spec in &self.specs {
            let value = set
                .get(&spec.name)
                .ok_or_else(|| ParamError::MissingOption(spec.name.clone()))?;
            if !spec.domain.contains(value) {
                return Err(ParamError::out_of_domain(&spec.name, value, &spec.domain));
            }
        }
        Ok(())
    }

    /// fill unspecified knobs with their defaults, then validate
    pub fn complete(&self, partial: &ParameterSet) -> Result<ParameterSet, ParamError> {
        let mut set = partial.clone();
        for spec in &self.specs {
            if set.get(&spec.name).is_none() {
                set = set.with(&spec.name, spec.default.clone());
            }
        }
        self.validate(&set)?;
        Ok(set)
    }

    pub fn encode(&self, set: &ParameterSet) -> Vec<f64> {
        self.specs
            .iter()
            .map(|s| set.get(&s.name).map_or(0.5, |v| s.domain.encode(v)))
            .collect()
    }

    pub fn decode(&self, point: &[f64]) -> ParameterSet {
        self.specs.iter().enumerate().fold(ParameterSet::new(), |set, (i, s)| {
            let u = point.get(i).copied().unwrap_or(0.5);
            set.with(&s.name, s.domain.decode(u))
        })
    }

    /// Cartesian product of the per-knob grids, first knob varying slowest.
    /// `overrides` replaces a knob's declared grid.
    pub fn grid(&self, overrides: &BTreeMap<String, Vec<ParamValue>>) -> Result<Vec<ParameterSet>, ParamError> {
        if let Some(name) = overrides.keys().find(|n| self.spec(n).is_none()) {
            return Err(ParamError::UnknownOption(name.clone()));
        }
        let mut points = vec![ParameterSet::new()];
        for spec in &self.specs {
            let values = match overrides.get(&spec.name) {
                Some(vals) if !vals.is_empty() => {
                    if let Some(bad) = vals.iter().find(|v| !spec.domain.contains(v)) {
                        return Err(ParamError::out_of_domain(&spec.name, bad, &spec.domain));
                    }
                    vals.clone()
                }
                _ => spec.grid_values(),
            };
            points = points
                .into_iter()
                .flat_map(|p| values.iter().map(move |v| p.clone().with(&spec.name, v.clone())))
                .collect();
        }
        Ok(points)
    }
}
