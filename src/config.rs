//! TOML configuration.
//!
//! Every section and field is optional. A minimal file only needs the model
//! lists:
//!
//! ```toml
//! [[evaluators]]
//! model = "openai/gpt-4o-mini"
//!
//! [[writers]]
//! model = "anthropic/claude-3.5-sonnet"
//! name = "Sonnet"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::flywheel::FlywheelConfig;
use crate::judge::{JudgeConfig, ModelSpec};
use crate::rubric::RubricWeights;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_context() -> usize {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Unchanged lines around each change.
    #[serde(default = "default_context")]
    pub context: usize,
    /// Write iteration-to-iteration diffs alongside flywheel artifacts.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            context: default_context(),
            enabled: true,
        }
    }
}

fn default_generation_concurrency() -> usize {
    4
}

fn default_bench_temperature() -> f32 {
    0.7
}

fn default_bench_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_bench_temperature")]
    pub temperature: f32,
    #[serde(default = "default_bench_max_tokens")]
    pub max_tokens: u32,
    /// Overrides the built-in writer system prompt.
    pub system_prompt: Option<String>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            generation_concurrency: default_generation_concurrency(),
            temperature: default_bench_temperature(),
            max_tokens: default_bench_max_tokens(),
            system_prompt: None,
        }
    }
}

/// A `[[evaluators]]` or `[[writers]]` entry. `id` and `name` are derived
/// from `model` when omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ModelEntry {
    pub fn to_spec(&self) -> ModelSpec {
        let derived = ModelSpec::from_model(&self.model);
        ModelSpec {
            id: self.id.clone().unwrap_or(derived.id),
            name: self.name.clone().unwrap_or(derived.name),
            model: derived.model,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuillConfig {
    pub rubric: RubricWeights,
    pub judge: JudgeConfig,
    pub flywheel: FlywheelConfig,
    pub diff: DiffConfig,
    pub bench: BenchConfig,
    pub evaluators: Vec<ModelEntry>,
    pub writers: Vec<ModelEntry>,
}

impl QuillConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: QuillConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that do not depend on which command runs. Model lists are
    /// checked by the command that needs them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.judge.concurrency == 0 {
            return Err(ConfigError::Invalid("judge.concurrency must be >= 1".into()));
        }
        if !self.judge.divergence_warning.is_finite() || self.judge.divergence_warning < 0.0 {
            return Err(ConfigError::Invalid(
                "judge.divergence_warning must be finite and >= 0".into(),
            ));
        }
        if self.bench.generation_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "bench.generation_concurrency must be >= 1".into(),
            ));
        }
        self.flywheel
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        for spec in self.evaluator_specs() {
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate evaluator id: {}",
                    spec.id
                )));
            }
        }
        seen.clear();
        for spec in self.writer_specs() {
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate writer id: {}", spec.id)));
            }
        }
        Ok(())
    }

    pub fn evaluator_specs(&self) -> Vec<ModelSpec> {
        self.evaluators.iter().map(ModelEntry::to_spec).collect()
    }

    pub fn writer_specs(&self) -> Vec<ModelSpec> {
        self.writers.iter().map(ModelEntry::to_spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::Criterion;

    #[test]
    fn empty_file_uses_defaults() {
        let config = QuillConfig::from_toml_str("").unwrap();
        assert_eq!(config, QuillConfig::default());
        assert_eq!(config.judge.concurrency, 4);
        assert_eq!(config.judge.max_repair_attempts, 1);
        assert_eq!(config.flywheel.threshold, 85.0);
        assert_eq!(config.diff.context, 3);
        assert!(config.diff.enabled);
        assert_eq!(config.bench.generation_concurrency, 4);
        assert_eq!(config.rubric, RubricWeights::default());
    }

    #[test]
    fn full_file_parses() {
        let raw = r#"
[rubric]
narrative = 40
accuracy = 60

[judge]
concurrency = 2
max_repair_attempts = 2

[flywheel]
max_iterations = 3
threshold = 90
patience = 2

[diff]
enabled = false

[[evaluators]]
model = "openai/gpt-4o-mini"

[[evaluators]]
model = "google/gemini-2.0-flash"
id = "gemini"
name = "Gemini Flash"

[[writers]]
model = "anthropic/claude-3.5-sonnet"
"#;
        let config = QuillConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.rubric.len(), 2);
        assert_eq!(config.rubric.weight(Criterion::Accuracy), Some(60.0));
        assert_eq!(config.judge.concurrency, 2);
        assert_eq!(config.judge.max_tokens, 2048);
        assert_eq!(config.flywheel.max_iterations, 3);
        assert!(!config.diff.enabled);

        let evaluators = config.evaluator_specs();
        assert_eq!(evaluators[0].id, "openai-gpt-4o-mini");
        assert_eq!(evaluators[1].id, "gemini");
        assert_eq!(evaluators[1].name, "Gemini Flash");
        assert_eq!(config.writer_specs()[0].name, "claude-3.5-sonnet");
    }

    #[test]
    fn invalid_values_are_reported() {
        let cases = [
            "[judge]\nconcurrency = 0\n",
            "[flywheel]\nthreshold = 150\n",
            "[flywheel]\nmax_iterations = 2\npatience = 3\n",
            "[bench]\ngeneration_concurrency = 0\n",
            "[[evaluators]]\nmodel = \"a/b\"\n[[evaluators]]\nmodel = \"a/b\"\n",
        ];
        for raw in cases {
            assert!(
                matches!(QuillConfig::from_toml_str(raw), Err(ConfigError::Invalid(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn bad_rubric_is_a_parse_error() {
        assert!(matches!(
            QuillConfig::from_toml_str("[rubric]\nnarrative = -1\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
