//! Evaluator response parsing and validation.
//!
//! Raw evaluator text becomes a [`ParsedJudgment`] or a [`ValidationError`]
//! whose message is specific enough to send back in a repair request.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::types::CriterionScore;
use crate::aggregate::ScoreAggregator;
use crate::rubric::{Criterion, RubricWeights};

/// First fenced block, with or without a language tag. A tag may sit on the
/// same line as the body (```` ```json{...}``` ````).
static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:[A-Za-z0-9_+-]*[ \t]*\r?\n|[A-Za-z0-9_+-]+[ \t]*)?(.*?)```")
        .expect("Invalid fence regex")
});

pub const DEFAULT_DIVERGENCE_WARNING: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("top-level JSON value must be an object")]
    NotAnObject,
    #[error("`scores` must be an array")]
    ScoresNotArray,
    #[error("`overallScore` must be a number")]
    OverallNotNumber,
    #[error("`overallScore` must be between 1 and 100 (got {0})")]
    OverallOutOfRange(f64),
    #[error("scores[{0}] must be an object")]
    EntryNotObject(usize),
    #[error("scores[{0}] is missing a `criterion` name")]
    MissingCriterionName(usize),
    #[error("unknown criterion: {0}")]
    UnknownCriterion(String),
    #[error("criterion not in rubric: {0}")]
    NotInRubric(Criterion),
    #[error("duplicate criterion: {0}")]
    DuplicateCriterion(Criterion),
    #[error("score for {0} must be a number")]
    ScoreNotNumber(Criterion),
    #[error("score for {criterion} must be between 1 and 100 (got {score})")]
    ScoreOutOfRange { criterion: Criterion, score: f64 },
    #[error("missing feedback for {0}")]
    MissingFeedback(Criterion),
    #[error("missing criterion: {0}")]
    MissingCriterion(Criterion),
}

/// A schema-valid evaluator response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJudgment {
    /// One entry per rubric criterion, in canonical order.
    pub scores: Vec<CriterionScore>,
    pub reported_overall: f64,
    pub computed_overall: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JudgmentParser {
    aggregator: ScoreAggregator,
    divergence_warning: f64,
}

impl JudgmentParser {
    pub fn new(rubric: RubricWeights) -> Self {
        Self {
            aggregator: ScoreAggregator::new(rubric),
            divergence_warning: DEFAULT_DIVERGENCE_WARNING,
        }
    }

    /// Warn when reported and computed overall differ by at least `points`.
    pub fn with_divergence_warning(mut self, points: f64) -> Self {
        self.divergence_warning = points;
        self
    }

    pub fn rubric(&self) -> &RubricWeights {
        self.aggregator.weights()
    }

    pub fn aggregator(&self) -> &ScoreAggregator {
        &self.aggregator
    }

    pub fn parse(&self, raw: &str) -> Result<ParsedJudgment, ValidationError> {
        let body = extract_payload(raw);
        let value: Value =
            serde_json::from_str(body).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;

        let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;
        let entries = obj
            .get("scores")
            .and_then(Value::as_array)
            .ok_or(ValidationError::ScoresNotArray)?;
        let reported_overall = obj
            .get("overallScore")
            .and_then(Value::as_f64)
            .ok_or(ValidationError::OverallNotNumber)?;
        if !(1.0..=100.0).contains(&reported_overall) {
            return Err(ValidationError::OverallOutOfRange(reported_overall));
        }

        let rubric = self.rubric();
        let mut seen = BTreeSet::new();
        let mut scores = Vec::with_capacity(entries.len());
        let mut warnings = Vec::new();

        for (idx, entry) in entries.iter().enumerate() {
            let entry = entry
                .as_object()
                .ok_or(ValidationError::EntryNotObject(idx))?;
            let name = entry
                .get("criterion")
                .and_then(Value::as_str)
                .ok_or(ValidationError::MissingCriterionName(idx))?;
            let criterion = Criterion::from_name(name)
                .ok_or_else(|| ValidationError::UnknownCriterion(name.to_string()))?;
            if !rubric.contains(criterion) {
                return Err(ValidationError::NotInRubric(criterion));
            }
            if !seen.insert(criterion) {
                return Err(ValidationError::DuplicateCriterion(criterion));
            }

            let score = entry
                .get("score")
                .and_then(Value::as_f64)
                .ok_or(ValidationError::ScoreNotNumber(criterion))?;
            if !(1.0..=100.0).contains(&score) {
                return Err(ValidationError::ScoreOutOfRange { criterion, score });
            }

            let feedback = entry
                .get("feedback")
                .and_then(Value::as_str)
                .ok_or(ValidationError::MissingFeedback(criterion))?;
            if feedback.trim().is_empty() {
                warnings.push(format!("empty feedback for {criterion}"));
            }

            scores.push(CriterionScore {
                criterion,
                score,
                feedback: feedback.trim().to_string(),
            });
        }

        if let Some(missing) = rubric.criteria().find(|c| !seen.contains(c)) {
            return Err(ValidationError::MissingCriterion(missing));
        }

        scores.sort_by_key(|s| s.criterion);
        let computed_overall = self.aggregator.judgment_overall(&scores);

        let divergence = (computed_overall - reported_overall).abs();
        if divergence >= self.divergence_warning {
            warnings.push(format!(
                "reported overall {reported_overall:.1} diverges from computed {computed_overall:.1} by {divergence:.1} points"
            ));
        }

        Ok(ParsedJudgment {
            scores,
            reported_overall,
            computed_overall,
            warnings,
        })
    }
}

/// Trimmed text, or the inside of its first fenced code block.
fn extract_payload(raw: &str) -> &str {
    let trimmed = raw.trim();
    match FENCED_BLOCK.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_response(overall: f64) -> String {
        serde_json::json!({
            "scores": [
                {"criterion": "narrative", "score": 80, "feedback": "Good arc."},
                {"criterion": "structure", "score": 70, "feedback": "Clear sections."},
                {"criterion": "audienceFit", "score": 60, "feedback": "A bit dense."},
                {"criterion": "accuracy", "score": 90, "feedback": "Solid."},
                {"criterion": "aiDetection", "score": 50, "feedback": "Formulaic."}
            ],
            "overallScore": overall
        })
        .to_string()
    }

    fn parser() -> JudgmentParser {
        JudgmentParser::new(RubricWeights::default())
    }

    #[test]
    fn valid_response_computes_weighted_overall() {
        let parsed = parser().parse(&full_response(71.0)).unwrap();
        assert_eq!(parsed.scores.len(), 5);
        assert_eq!(parsed.computed_overall, 71.0);
        assert_eq!(parsed.reported_overall, 71.0);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn fenced_block_is_unwrapped() {
        let raw = format!("Here you go:\n```json\n{}\n```\nThanks!", full_response(70.0));
        assert!(parser().parse(&raw).is_ok());

        let bare = format!("```\n{}\n```", full_response(70.0));
        assert!(parser().parse(&bare).is_ok());
    }

    #[test]
    fn single_line_fence_with_tag_is_unwrapped() {
        let compact = full_response(70.0).replace('\n', "");
        for raw in [
            format!("```json{compact}```"),
            format!("```json {compact}```"),
            format!("```{compact}```"),
        ] {
            let parsed = parser().parse(&raw).unwrap();
            assert_eq!(parsed.reported_overall, 70.0);
        }
    }

    #[test]
    fn prose_wrapper_without_fence_is_invalid() {
        let raw = format!("Sure! {}", full_response(70.0));
        assert!(matches!(
            parser().parse(&raw),
            Err(ValidationError::InvalidJson(_))
        ));
    }

    #[test]
    fn synonyms_and_spacing_are_accepted() {
        let raw = full_response(71.0)
            .replace("\"narrative\"", "\"Flow\"")
            .replace("\"audienceFit\"", "\"Audience\"")
            .replace("\"aiDetection\"", "\"AI detection\"");
        let parsed = parser().parse(&raw).unwrap();
        assert_eq!(parsed.computed_overall, 71.0);
    }

    #[test]
    fn missing_criterion_is_named() {
        let raw = serde_json::json!({
            "scores": [
                {"criterion": "narrative", "score": 80, "feedback": "x"},
                {"criterion": "structure", "score": 70, "feedback": "x"},
                {"criterion": "audienceFit", "score": 60, "feedback": "x"},
                {"criterion": "aiDetection", "score": 50, "feedback": "x"}
            ],
            "overallScore": 70
        })
        .to_string();
        let err = parser().parse(&raw).unwrap_err();
        assert_eq!(err, ValidationError::MissingCriterion(Criterion::Accuracy));
        assert!(err.to_string().contains("accuracy"));
    }

    #[test]
    fn duplicate_criterion_is_rejected() {
        let raw = full_response(70.0).replace("\"structure\"", "\"Narrative\"");
        let err = parser().parse(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn out_of_range_and_non_numeric_scores_are_rejected() {
        let raw = full_response(70.0).replace("\"score\":90", "\"score\":101");
        assert!(matches!(
            parser().parse(&raw),
            Err(ValidationError::ScoreOutOfRange { score, .. }) if score == 101.0
        ));

        let raw = full_response(70.0).replace("\"score\":80", "\"score\":\"80\"");
        assert_eq!(
            parser().parse(&raw).unwrap_err(),
            ValidationError::ScoreNotNumber(Criterion::Narrative)
        );

        assert!(matches!(
            parser().parse(&full_response(0.0)),
            Err(ValidationError::OverallOutOfRange(_))
        ));
    }

    #[test]
    fn unknown_criterion_is_rejected() {
        let raw = full_response(70.0).replace("\"accuracy\"", "\"vibes\"");
        assert_eq!(
            parser().parse(&raw).unwrap_err(),
            ValidationError::UnknownCriterion("vibes".into())
        );
    }

    #[test]
    fn criterion_outside_rubric_is_rejected() {
        let rubric = RubricWeights::new([(Criterion::Narrative, 1.0)]).unwrap();
        let err = JudgmentParser::new(rubric)
            .parse(&full_response(70.0))
            .unwrap_err();
        assert_eq!(err, ValidationError::NotInRubric(Criterion::Structure));
    }

    #[test]
    fn empty_feedback_and_divergence_warn() {
        let raw = full_response(90.0).replace("\"Solid.\"", "\"  \"");
        let parsed = parser().parse(&raw).unwrap();
        assert_eq!(parsed.warnings.len(), 2);
        assert!(parsed.warnings[0].contains("empty feedback for accuracy"));
        assert!(parsed.warnings[1].contains("diverges"));
    }

    #[test]
    fn missing_feedback_is_an_error() {
        let raw = full_response(70.0).replace(",\"feedback\":\"Formulaic.\"", "");
        assert_eq!(
            parser().parse(&raw).unwrap_err(),
            ValidationError::MissingFeedback(Criterion::AiDetection)
        );
    }

    #[test]
    fn score_order_does_not_change_result() {
        let reversed = serde_json::json!({
            "scores": [
                {"criterion": "aiDetection", "score": 50, "feedback": "Formulaic."},
                {"criterion": "accuracy", "score": 90, "feedback": "Solid."},
                {"criterion": "audienceFit", "score": 60, "feedback": "A bit dense."},
                {"criterion": "structure", "score": 70, "feedback": "Clear sections."},
                {"criterion": "narrative", "score": 80, "feedback": "Good arc."}
            ],
            "overallScore": 71
        })
        .to_string();
        assert_eq!(
            parser().parse(&reversed).unwrap(),
            parser().parse(&full_response(71.0)).unwrap()
        );
    }
}
