//! Score aggregation and ranking.
//!
//! Every overall score in the crate comes from here. Both formulas divide by
//! the sum of weights actually present, so a partial score set still lands
//! on the 1-100 scale. Evaluator-reported totals are never consulted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::judge::{CriterionScore, JudgmentResult, Subject};
use crate::rubric::{Criterion, RubricWeights};

/// Aggregate view of one subject across all of its judgments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// 1-based position in the ranking.
    pub rank: usize,
    pub subject_id: String,
    pub subject_name: String,
    pub per_criterion_average: BTreeMap<Criterion, f64>,
    pub overall_average: f64,
    pub contributing_judgments: usize,
}

#[derive(Debug, Clone)]
pub struct ScoreAggregator {
    weights: RubricWeights,
}

impl ScoreAggregator {
    pub fn new(weights: RubricWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RubricWeights {
        &self.weights
    }

    /// Weighted mean over the rubric criteria present in `values`.
    pub fn weighted_overall(&self, values: &BTreeMap<Criterion, f64>) -> f64 {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (criterion, weight) in self.weights.iter() {
            if let Some(value) = values.get(&criterion) {
                weighted += weight * value;
                total += weight;
            }
        }
        if total > 0.0 {
            weighted / total
        } else {
            0.0
        }
    }

    /// Single-judgment overall.
    pub fn judgment_overall(&self, scores: &[CriterionScore]) -> f64 {
        let values: BTreeMap<Criterion, f64> =
            scores.iter().map(|s| (s.criterion, s.score)).collect();
        self.weighted_overall(&values)
    }

    /// Mean score per criterion across `judgments`.
    ///
    /// Values are sorted before summing so the result does not depend on the
    /// order judgments arrived in.
    pub fn criterion_averages<'a>(
        &self,
        judgments: impl IntoIterator<Item = &'a JudgmentResult>,
    ) -> BTreeMap<Criterion, f64> {
        let mut by_criterion: BTreeMap<Criterion, Vec<f64>> = BTreeMap::new();
        for judgment in judgments {
            for score in &judgment.scores {
                by_criterion
                    .entry(score.criterion)
                    .or_default()
                    .push(score.score);
            }
        }

        by_criterion
            .into_iter()
            .map(|(criterion, mut values)| {
                values.sort_by(f64::total_cmp);
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                (criterion, mean)
            })
            .collect()
    }

    /// Aggregate one subject from the judgments that target it. Unranked.
    pub fn aggregate_subject(
        &self,
        subject: &Subject,
        judgments: &[JudgmentResult],
    ) -> AggregatedResult {
        let relevant: Vec<&JudgmentResult> = judgments
            .iter()
            .filter(|j| j.subject_id == subject.id)
            .collect();
        let per_criterion_average = self.criterion_averages(relevant.iter().copied());
        let overall_average = self.weighted_overall(&per_criterion_average);

        AggregatedResult {
            rank: 0,
            subject_id: subject.id.clone(),
            subject_name: subject.name.clone(),
            per_criterion_average,
            overall_average,
            contributing_judgments: relevant.len(),
        }
    }

    /// Aggregate and rank all subjects, best first. Ties keep input order.
    pub fn aggregate(
        &self,
        subjects: &[Subject],
        judgments: &[JudgmentResult],
    ) -> Vec<AggregatedResult> {
        let mut results: Vec<AggregatedResult> = subjects
            .iter()
            .map(|s| self.aggregate_subject(s, judgments))
            .collect();

        results.sort_by(|a, b| b.overall_average.total_cmp(&a.overall_average));
        for (idx, result) in results.iter_mut().enumerate() {
            result.rank = idx + 1;
        }
        results
    }
}

/// First-ranked subject, if any.
pub fn winner(ranked: &[AggregatedResult]) -> Option<&AggregatedResult> {
    ranked.first()
}
