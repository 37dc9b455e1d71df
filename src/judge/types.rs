//! Judgment data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rubric::Criterion;

/// A writer or evaluator identity backed by one gateway model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Filesystem-safe identifier, used in artifact paths.
    pub id: String,
    pub name: String,
    /// OpenRouter model id, e.g. "openai/gpt-4o-mini".
    pub model: String,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: model.into(),
        }
    }

    /// Derive id and name from the model id alone.
    pub fn from_model(model: impl Into<String>) -> Self {
        let model = model.into();
        let id = model
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let name = model.rsplit('/').next().unwrap_or(&model).to_string();
        Self {
            id,
            name,
            model,
        }
    }
}

/// One document under evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub text: String,
}

impl Subject {
    pub fn new(id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion: Criterion,
    /// In [1, 100].
    pub score: f64,
    pub feedback: String,
}

/// A validated evaluator verdict on one subject.
///
/// `computed_overall` is always derived from `scores` with the rubric
/// weights. `evaluator_reported_overall` is what the evaluator claimed and is
/// kept for diagnostics only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentResult {
    pub evaluator_id: String,
    pub evaluator_name: String,
    pub subject_id: String,
    pub scores: Vec<CriterionScore>,
    pub evaluator_reported_overall: f64,
    pub computed_overall: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Repair round-trips used before the response validated.
    #[serde(default)]
    pub repair_attempts: u32,
    /// Served from the judgment cache instead of a live call.
    #[serde(default)]
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
}

impl JudgmentResult {
    pub fn score(&self, criterion: Criterion) -> Option<f64> {
        self.scores
            .iter()
            .find(|s| s.criterion == criterion)
            .map(|s| s.score)
    }
}

/// An evaluator/subject pair that produced no valid judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub evaluator_id: String,
    pub evaluator_name: String,
    pub subject_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one evaluation wave. Failures never abort the wave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationBatch {
    pub judgments: Vec<JudgmentResult>,
    pub failures: Vec<EvaluationFailure>,
}

impl EvaluationBatch {
    pub fn is_empty(&self) -> bool {
        self.judgments.is_empty() && self.failures.is_empty()
    }

    /// Mean of evaluator-reported overalls, if any judgment succeeded.
    pub fn reported_average(&self) -> Option<f64> {
        if self.judgments.is_empty() {
            return None;
        }
        let mut reported: Vec<f64> = self
            .judgments
            .iter()
            .map(|j| j.evaluator_reported_overall)
            .collect();
        reported.sort_by(f64::total_cmp);
        Some(reported.iter().sum::<f64>() / reported.len() as f64)
    }
}
