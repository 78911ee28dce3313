//! Lag projection configuration.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table_io::TableLayout;

pub const LAG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_LOOKBACK_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformRule {
    /// Prior value verbatim.
    Copy,
    /// `1` when the prior value equals the current one, `0` otherwise.
    EqualityFlag,
}

impl TransformRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::EqualityFlag => "equality_flag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LagConfig {
    pub lookback_count: usize,
    pub source_attributes: Vec<String>,
    /// Attributes without an entry use [`TransformRule::Copy`].
    pub transform_rules: BTreeMap<String, TransformRule>,
    pub max_events: Option<usize>,
    pub parallel: bool,
    pub schema_version: u32,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self {
            lookback_count: DEFAULT_LOOKBACK_COUNT,
            source_attributes: Vec::new(),
            transform_rules: BTreeMap::new(),
            max_events: None,
            parallel: false,
            schema_version: LAG_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LagConfigError {
    #[error("invalid lag config: {0}")]
    InvalidConfig(String),
    #[error("source attribute '{attribute}' does not exist in any input event")]
    UnknownAttribute { attribute: String },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// A [`LagConfig`] that passed validation, with one resolved rule per
/// source attribute in configured order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedLagConfig {
    lookback_count: usize,
    attributes: Vec<(String, TransformRule)>,
    max_events: Option<usize>,
    parallel: bool,
    schema_version: u32,
}

impl ValidatedLagConfig {
    pub fn lookback_count(&self) -> usize {
        self.lookback_count
    }

    pub fn attributes(&self) -> &[(String, TransformRule)] {
        &self.attributes
    }

    pub fn rule_for(&self, attribute: &str) -> Option<TransformRule> {
        self.attributes
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, rule)| *rule)
    }

    pub fn max_events(&self) -> Option<usize> {
        self.max_events
    }

    pub fn parallel(&self) -> bool {
        self.parallel
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl LagConfig {
    pub fn new<I, S>(source_attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_attributes: source_attributes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_rule(mut self, attribute: impl Into<String>, rule: TransformRule) -> Self {
        self.transform_rules.insert(attribute.into(), rule);
        self
    }

    pub fn with_lookback(mut self, lookback_count: usize) -> Self {
        self.lookback_count = lookback_count;
        self
    }

    /// Lags every given column when no source attribute was configured.
    pub fn or_source_columns(mut self, columns: &[String]) -> Self {
        if self.source_attributes.is_empty() {
            self.source_attributes = columns.to_vec();
        }
        self
    }

    /// Shape checks that need no input data.
    pub fn validate(&self) -> Result<ValidatedLagConfig, LagConfigError> {
        if self.lookback_count == 0 {
            return Err(LagConfigError::InvalidConfig(
                "lookback_count must be > 0".to_string(),
            ));
        }

        if self.schema_version != LAG_SCHEMA_VERSION {
            return Err(LagConfigError::InvalidConfig(format!(
                "schema_version must equal LAG_SCHEMA_VERSION ({LAG_SCHEMA_VERSION})"
            )));
        }

        if self.source_attributes.is_empty() {
            return Err(LagConfigError::InvalidConfig(
                "source_attributes must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for attribute in &self.source_attributes {
            if attribute.trim().is_empty() {
                return Err(LagConfigError::InvalidConfig(
                    "source_attributes entries must be non-blank".to_string(),
                ));
            }
            if !seen.insert(attribute.as_str()) {
                return Err(LagConfigError::InvalidConfig(format!(
                    "source attribute '{attribute}' is listed more than once"
                )));
            }
        }

        for attribute in self.transform_rules.keys() {
            if !seen.contains(attribute.as_str()) {
                return Err(LagConfigError::InvalidConfig(format!(
                    "transform rule for '{attribute}' has no matching source attribute"
                )));
            }
        }

        let attributes = self
            .source_attributes
            .iter()
            .map(|attribute| {
                let rule = self
                    .transform_rules
                    .get(attribute)
                    .copied()
                    .unwrap_or(TransformRule::Copy);
                (attribute.clone(), rule)
            })
            .collect();

        Ok(ValidatedLagConfig {
            lookback_count: self.lookback_count,
            attributes,
            max_events: self.max_events,
            parallel: self.parallel,
            schema_version: self.schema_version,
        })
    }

    /// [`LagConfig::validate`] plus a check that every source attribute
    /// exists in the observed input schema.
    pub fn validate_against_schema(
        &self,
        schema: &BTreeSet<String>,
    ) -> Result<ValidatedLagConfig, LagConfigError> {
        let validated = self.validate()?;
        for (attribute, _) in validated.attributes() {
            if !schema.contains(attribute) {
                return Err(LagConfigError::UnknownAttribute {
                    attribute: attribute.clone(),
                });
            }
        }
        Ok(validated)
    }
}

/// File-level settings for the batch binary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub layout: TableLayout,
    pub lag: LagConfig,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load_run_config(path: &Path) -> Result<RunConfig, ConfigLoadError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigLoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}
