//! Rubric criteria and weights.
//!
//! A rubric is a set of named criteria, each with a positive weight. Weights
//! are relative; the aggregator divides by the sum of weights present, so
//! they never need to add up to 100.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One scored dimension of a document.
///
/// Declaration order is the canonical order used for prompts, missing-key
/// checks and floating-point summation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Criterion {
    Narrative,
    Structure,
    AudienceFit,
    Accuracy,
    AiDetection,
}

impl Criterion {
    pub const ALL: [Criterion; 5] = [
        Criterion::Narrative,
        Criterion::Structure,
        Criterion::AudienceFit,
        Criterion::Accuracy,
        Criterion::AiDetection,
    ];

    /// Wire key, as it appears in evaluator JSON and config files.
    pub fn key(self) -> &'static str {
        match self {
            Criterion::Narrative => "narrative",
            Criterion::Structure => "structure",
            Criterion::AudienceFit => "audienceFit",
            Criterion::Accuracy => "accuracy",
            Criterion::AiDetection => "aiDetection",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Criterion::Narrative => "Narrative",
            Criterion::Structure => "Structure",
            Criterion::AudienceFit => "Audience fit",
            Criterion::Accuracy => "Accuracy",
            Criterion::AiDetection => "AI detection",
        }
    }

    /// What the evaluator is asked to judge for this criterion.
    pub fn description(self) -> &'static str {
        match self {
            Criterion::Narrative => {
                "Flow and storytelling: does the piece carry the reader from opening to close?"
            }
            Criterion::Structure => {
                "Organization: headings, paragraphing and ordering of ideas support the argument."
            }
            Criterion::AudienceFit => {
                "Tone, vocabulary and depth suit the intended readers."
            }
            Criterion::Accuracy => {
                "Claims are correct, specific and not overstated."
            }
            Criterion::AiDetection => {
                "Reads as written by a person: no filler, stock phrases or formulaic cadence. Higher is more human."
            }
        }
    }

    /// Resolve an evaluator-supplied criterion name.
    ///
    /// Matching ignores case and any non-alphanumeric characters, so
    /// `"Audience Fit"`, `"audience_fit"` and `"AUDIENCE-FIT"` all resolve.
    /// The only synonyms are `flow` (narrative) and `audience` (audienceFit).
    pub fn from_name(raw: &str) -> Option<Criterion> {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "narrative" | "flow" => Some(Criterion::Narrative),
            "structure" => Some(Criterion::Structure),
            "audiencefit" | "audience" => Some(Criterion::AudienceFit),
            "accuracy" => Some(Criterion::Accuracy),
            "aidetection" => Some(Criterion::AiDetection),
            _ => None,
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RubricError {
    #[error("rubric must name at least one criterion")]
    Empty,
    #[error("unknown criterion: {0}")]
    UnknownCriterion(String),
    #[error("weight for {criterion} must be finite and > 0 (got {weight})")]
    InvalidWeight { criterion: Criterion, weight: f64 },
}

/// Criterion → positive weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct RubricWeights {
    weights: BTreeMap<Criterion, f64>,
}

impl Default for RubricWeights {
    fn default() -> Self {
        let weights = BTreeMap::from([
            (Criterion::Narrative, 30.0),
            (Criterion::Structure, 20.0),
            (Criterion::AudienceFit, 20.0),
            (Criterion::Accuracy, 15.0),
            (Criterion::AiDetection, 15.0),
        ]);
        Self { weights }
    }
}

impl RubricWeights {
    pub fn new(entries: impl IntoIterator<Item = (Criterion, f64)>) -> Result<Self, RubricError> {
        let mut weights = BTreeMap::new();
        for (criterion, weight) in entries {
            if !weight.is_finite() || weight <= 0.0 {
                return Err(RubricError::InvalidWeight { criterion, weight });
            }
            weights.insert(criterion, weight);
        }
        if weights.is_empty() {
            return Err(RubricError::Empty);
        }
        Ok(Self { weights })
    }

    pub fn weight(&self, criterion: Criterion) -> Option<f64> {
        self.weights.get(&criterion).copied()
    }

    pub fn contains(&self, criterion: Criterion) -> bool {
        self.weights.contains_key(&criterion)
    }

    /// Criteria in canonical order.
    pub fn criteria(&self) -> impl Iterator<Item = Criterion> + '_ {
        self.weights.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Criterion, f64)> + '_ {
        self.weights.iter().map(|(c, w)| (*c, *w))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Stable hash of keys and weights, used in judgment cache keys.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (criterion, weight) in &self.weights {
            hasher.update(criterion.key().as_bytes());
            hasher.update(b"=");
            hasher.update(&weight.to_bits().to_le_bytes());
            hasher.update(b";");
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl TryFrom<BTreeMap<String, f64>> for RubricWeights {
    type Error = RubricError;

    fn try_from(raw: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        let mut entries = Vec::with_capacity(raw.len());
        for (name, weight) in raw {
            let criterion =
                Criterion::from_name(&name).ok_or(RubricError::UnknownCriterion(name))?;
            entries.push((criterion, weight));
        }
        RubricWeights::new(entries)
    }
}

impl From<RubricWeights> for BTreeMap<String, f64> {
    fn from(rubric: RubricWeights) -> Self {
        rubric
            .weights
            .into_iter()
            .map(|(c, w)| (c.key().to_string(), w))
            .collect()
    }
}
