//! Job configuration.
//!
//! `Configuration` is a flat, read-only key/value view (keys like
//! `polyplan.loop.max_iterations`). It can be built from pairs, from the
//! environment, or from a YAML document. `JobConfig` is the typed snapshot a
//! job takes when it starts; unknown keys are ignored, malformed values for
//! known keys are an error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::PlatformId;

pub const KEY_PREFIX: &str = "polyplan.";
pub const PIN_PREFIX: &str = "polyplan.pin.";
pub const MAX_ITERATIONS: &str = "polyplan.loop.max_iterations";
pub const STRICT_CONVERGENCE: &str = "polyplan.loop.strict_convergence";
pub const MAX_PARALLELISM: &str = "polyplan.executor.max_parallelism";
pub const SCRATCH_DIR: &str = "polyplan.executor.scratch_dir";
pub const INSTRUMENTATION: &str = "polyplan.instrumentation";
pub const ENUMERATION_LIMIT: &str = "polyplan.optimizer.enumeration_limit";
pub const REOPTIMIZE_THRESHOLD: &str = "polyplan.optimizer.reoptimize_threshold";

const KNOWN_KEYS: &[&str] = &[
    MAX_ITERATIONS,
    STRICT_CONVERGENCE,
    MAX_PARALLELISM,
    SCRATCH_DIR,
    INSTRUMENTATION,
    ENUMERATION_LIMIT,
    REOPTIMIZE_THRESHOLD,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Read `POLYPLAN_*` environment variables.
    ///
    /// - `POLYPLAN_LOOP_MAX_ITERATIONS` -> `polyplan.loop.max_iterations` (and
    ///   likewise for every other known key)
    /// - `POLYPLAN_PIN_<name>` -> `polyplan.pin.<name>` (name kept verbatim)
    pub fn from_env() -> Self {
        Self::from_env_vars(std::env::vars())
    }

    pub fn from_env_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut cfg = Self::default();
        for (name, value) in vars {
            if let Some(key) = env_to_key(&name) {
                cfg.entries.insert(key, value);
            }
        }
        cfg
    }

    /// Parse a YAML document. Nested mappings are flattened with `.`:
    ///
    /// ```yaml
    /// polyplan:
    ///   loop:
    ///     max_iterations: 20
    ///   pin:
    ///     tokenize: spark
    /// ```
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
        let mut cfg = Self::default();
        flatten_yaml("", &doc, &mut cfg.entries)?;
        Ok(cfg)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Shorthand for `polyplan.pin.<operator_name> = <platform>`.
    pub fn with_pin(self, operator_name: &str, platform: impl Into<String>) -> Self {
        self.with(format!("{PIN_PREFIX}{operator_name}"), platform)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| Error::Config(format!("{key} = '{raw}': {e}"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Typed snapshot with defaults applied.
    pub fn job_config(&self) -> Result<JobConfig> {
        let mut cfg = JobConfig::default();

        for (key, value) in &self.entries {
            if let Some(name) = key.strip_prefix(PIN_PREFIX) {
                if name.is_empty() || value.trim().is_empty() {
                    return Err(Error::Config(format!("malformed pin '{key}' = '{value}'")));
                }
                cfg.pins.insert(name.to_string(), PlatformId::new(value.trim()));
            }
        }

        if let Some(v) = self.get_parsed::<usize>(MAX_ITERATIONS)? {
            if v == 0 {
                return Err(Error::Config(format!("{MAX_ITERATIONS} must be at least 1")));
            }
            cfg.max_iterations = v;
        }
        if let Some(v) = self.get_parsed::<bool>(STRICT_CONVERGENCE)? {
            cfg.strict_convergence = v;
        }
        if let Some(v) = self.get_parsed::<usize>(MAX_PARALLELISM)? {
            if v == 0 {
                return Err(Error::Config(format!("{MAX_PARALLELISM} must be at least 1")));
            }
            cfg.max_parallelism = Some(v);
        }
        if let Some(v) = self.get(SCRATCH_DIR) {
            cfg.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = self.get_parsed::<InstrumentationMode>(INSTRUMENTATION)? {
            cfg.instrumentation = v;
        }
        if let Some(v) = self.get_parsed::<u64>(ENUMERATION_LIMIT)? {
            cfg.enumeration_limit = v;
        }
        if let Some(v) = self.get_parsed::<f64>(REOPTIMIZE_THRESHOLD)? {
            if !(v >= 1.0) {
                return Err(Error::Config(format!(
                    "{REOPTIMIZE_THRESHOLD} must be a factor >= 1.0, got {v}"
                )));
            }
            cfg.reoptimize_threshold = Some(v);
        }

        Ok(cfg)
    }
}

fn env_to_key(name: &str) -> Option<String> {
    let rest = name.strip_prefix("POLYPLAN_")?;
    if let Some(op) = rest.strip_prefix("PIN_") {
        return (!op.is_empty()).then(|| format!("{PIN_PREFIX}{op}"));
    }
    let wanted = format!("polyplan_{}", rest.to_ascii_lowercase());
    KNOWN_KEYS
        .iter()
        .find(|k| k.replace('.', "_") == wanted)
        .map(|k| k.to_string())
}

fn flatten_yaml(
    prefix: &str,
    value: &serde_yaml::Value,
    out: &mut BTreeMap<String, String>,
) -> Result<()> {
    use serde_yaml::Value;

    let scalar = match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let part = match k {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(Error::Config(format!("unsupported YAML key {other:?}")))
                    }
                };
                let key = if prefix.is_empty() {
                    part
                } else {
                    format!("{prefix}.{part}")
                };
                flatten_yaml(&key, v, out)?;
            }
            return Ok(());
        }
        Value::Null => return Ok(()),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Sequence(_) | Value::Tagged(_) => {
            return Err(Error::Config(format!("'{prefix}' must be a scalar")));
        }
    };
    if prefix.is_empty() {
        return Err(Error::Config("configuration document must be a mapping".into()));
    }
    out.insert(prefix.to_string(), scalar);
    Ok(())
}

/// How much the executor measures per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentationMode {
    /// Time and count every dispatch and feed the estimators.
    #[default]
    Full,
    /// Lineage only.
    None,
}

impl FromStr for InstrumentationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "none" | "off" => Ok(Self::None),
            other => Err(format!("unknown instrumentation strategy '{other}'")),
        }
    }
}

/// Typed per-job configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Operator name -> platform. Hard constraint for the optimizer.
    pub pins: BTreeMap<String, PlatformId>,

    /// Iteration cap applied to every loop.
    pub max_iterations: usize,

    /// Fail with `NotConverged` instead of stopping quietly at the cap.
    pub strict_convergence: bool,

    /// Concurrent dispatches. `None` = unbounded.
    pub max_parallelism: Option<usize>,

    pub instrumentation: InstrumentationMode,

    /// Above this many assignments the optimizer switches to a greedy pass.
    pub enumeration_limit: u64,

    /// Cardinality misestimation factor that triggers re-optimization.
    pub reoptimize_threshold: Option<f64>,

    /// Where file-backed channel instances are written.
    pub scratch_dir: PathBuf,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            pins: BTreeMap::new(),
            max_iterations: 100,
            strict_convergence: false,
            max_parallelism: None,
            instrumentation: InstrumentationMode::Full,
            enumeration_limit: 100_000,
            reoptimize_threshold: None,
            scratch_dir: std::env::temp_dir().join("polyplan"),
        }
    }
}

impl JobConfig {
    pub fn pin_for(&self, operator_name: Option<&str>) -> Option<&PlatformId> {
        operator_name.and_then(|n| self.pins.get(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let cfg = Configuration::new()
            .with("some.other.key", "x")
            .job_config()
            .unwrap();
        assert_eq!(cfg.max_iterations, 100);
        assert!(!cfg.strict_convergence);
        assert_eq!(cfg.max_parallelism, None);
        assert_eq!(cfg.instrumentation, InstrumentationMode::Full);
        assert_eq!(cfg.enumeration_limit, 100_000);
        assert!(cfg.pins.is_empty());
    }

    #[test]
    fn pins_and_typed_values_parse() {
        let cfg = Configuration::new()
            .with_pin("tokenize", "spark")
            .with(MAX_ITERATIONS, "7")
            .with(INSTRUMENTATION, "none")
            .with(REOPTIMIZE_THRESHOLD, "4.0")
            .job_config()
            .unwrap();
        assert_eq!(cfg.pin_for(Some("tokenize")), Some(&PlatformId::new("spark")));
        assert_eq!(cfg.max_iterations, 7);
        assert_eq!(cfg.instrumentation, InstrumentationMode::None);
        assert_eq!(cfg.reoptimize_threshold, Some(4.0));
    }

    #[test]
    fn malformed_known_key_is_an_error() {
        let err = Configuration::new()
            .with(MAX_PARALLELISM, "lots")
            .job_config()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_vars_map_onto_dotted_keys() {
        let cfg = Configuration::from_env_vars(vec![
            ("POLYPLAN_LOOP_MAX_ITERATIONS".to_string(), "3".to_string()),
            ("POLYPLAN_PIN_wordCount".to_string(), "java".to_string()),
            ("POLYPLAN_NOT_A_KEY".to_string(), "1".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);
        assert_eq!(cfg.get(MAX_ITERATIONS), Some("3"));
        assert_eq!(cfg.get("polyplan.pin.wordCount"), Some("java"));
        assert_eq!(cfg.len(), 2);
    }

    #[test]
    fn yaml_documents_flatten() {
        let yaml = r#"
polyplan:
  loop:
    max_iterations: 20
    strict_convergence: true
  pin:
    upper: beta
"#;
        let cfg = Configuration::from_yaml_str(yaml).unwrap().job_config().unwrap();
        assert_eq!(cfg.max_iterations, 20);
        assert!(cfg.strict_convergence);
        assert_eq!(cfg.pins.get("upper"), Some(&PlatformId::new("beta")));
    }
}
