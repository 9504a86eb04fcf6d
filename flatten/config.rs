//! # Run Configuration
//!
//! The typed TOML schema of one flattening run. Every optional input is an
//! `Option`, every switch a `bool` with a serde default. Unknown keys are rejected.
//! Relative paths are resolved against the directory of the configuration file.
//!
//! ```toml
//! n_workers = 8
//! drop_insufficient_lookahead = true
//!
//! [prediction_times]
//! path = "visits.parquet"
//!
//! [quarantine]
//! path = "admissions.csv"
//! interval_days = 730
//!
//! [[sources]]
//! name = "hba1c"
//! path = "hba1c.csv"
//! value_col = "result"
//!
//! [[predictors]]
//! sources = ["hba1c"]
//! interval_days = [365, 730]
//! aggregations = ["mean", "max"]
//!
//! [[outcomes]]
//! sources = ["t2d"]
//! interval_days = [365]
//! aggregations = ["max"]
//! incident = true
//!
//! [output]
//! dir = "flattened"
//! ```

use crate::engine::FlattenOptions;
use crate::errors::ConfigurationError;
use crate::spec::{OutcomeGroupSpec, PredictorGroupSpec, TemporalSpec, default_fallback_nan};
use crate::split::SplitConfig;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

fn default_entity_id_col() -> String {
    "entity_id".to_string()
}

fn default_timestamp_col() -> String {
    "timestamp".to_string()
}

fn default_value_col() -> String {
    "value".to_string()
}

fn default_birthdate_col() -> String {
    "date_of_birth".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictionTimesConfig {
    pub path: PathBuf,
    #[serde(default = "default_entity_id_col")]
    pub entity_id_col: String,
    #[serde(default = "default_timestamp_col")]
    pub timestamp_col: String,
}

/// Both `path` and `interval_days` must be given, or the section left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuarantineConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_entity_id_col")]
    pub entity_id_col: String,
    #[serde(default = "default_timestamp_col")]
    pub timestamp_col: String,
    #[serde(default)]
    pub interval_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_entity_id_col")]
    pub entity_id_col: String,
    #[serde(default = "default_timestamp_col")]
    pub timestamp_col: String,
    #[serde(default = "default_value_col")]
    pub value_col: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgeConfig {
    pub path: PathBuf,
    #[serde(default = "default_entity_id_col")]
    pub entity_id_col: String,
    #[serde(default = "default_birthdate_col")]
    pub birthdate_col: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticFeatureConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_entity_id_col")]
    pub entity_id_col: String,
    #[serde(default = "default_value_col")]
    pub value_col: String,
    #[serde(default = "default_fallback_nan")]
    pub fallback: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Drop prediction times whose lookbehind window starts before the source's first event.
    #[serde(default = "default_true")]
    pub drop_insufficient_lookbehind: bool,
    /// Drop prediction times whose lookahead window ends after the source's last event.
    #[serde(default = "default_true")]
    pub drop_insufficient_lookahead: bool,
    #[serde(default)]
    pub n_workers: Option<usize>,
    pub prediction_times: PredictionTimesConfig,
    #[serde(default)]
    pub quarantine: Option<QuarantineConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub predictors: Vec<PredictorGroupSpec>,
    #[serde(default)]
    pub outcomes: Vec<OutcomeGroupSpec>,
    #[serde(default)]
    pub age: Option<AgeConfig>,
    #[serde(default)]
    pub static_features: Vec<StaticFeatureConfig>,
    #[serde(default)]
    pub split: SplitConfig,
    pub output: OutputConfig,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl RunConfig {
    /// Parses and validates a configuration; relative paths stay relative to the
    /// current directory.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigurationError::InvalidSpec {
            column: path.display().to_string(),
            reason: format!("could not read the configuration file: {e}"),
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        log::info!(
            "Loaded configuration '{}' with {} sources and {} predictor / {} outcome groups",
            path.display(),
            config.sources.len(),
            config.predictors.len(),
            config.outcomes.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(quarantine) = &self.quarantine {
            if quarantine.path.is_none() || quarantine.interval_days.is_none() {
                return Err(ConfigurationError::QuarantineIncomplete {
                    has_events: quarantine.path.is_some(),
                    interval_days: quarantine.interval_days,
                });
            }
        }

        let mut names = AHashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(ConfigurationError::InvalidSpec {
                    column: source.name.clone(),
                    reason: "the source name is declared twice".to_string(),
                });
            }
        }
        let referenced = self
            .predictors
            .iter()
            .flat_map(|g| g.sources.iter())
            .chain(self.outcomes.iter().flat_map(|g| g.sources.iter()));
        for source in referenced {
            if !names.contains(source.as_str()) {
                return Err(ConfigurationError::UnknownSource(source.clone()));
            }
        }

        self.split.validate()
    }

    pub fn flatten_options(&self) -> FlattenOptions {
        FlattenOptions {
            drop_insufficient_lookbehind: self.drop_insufficient_lookbehind,
            drop_insufficient_lookahead: self.drop_insufficient_lookahead,
            n_workers: self.n_workers,
        }
    }

    /// Every windowed column of the run: predictors first, then outcomes.
    pub fn temporal_specs(&self) -> Vec<TemporalSpec> {
        self.predictors
            .iter()
            .flat_map(PredictorGroupSpec::expand)
            .chain(self.outcomes.iter().flat_map(OutcomeGroupSpec::expand))
            .collect()
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}
