//! Iterative refinement loop.
//!
//! ```text
//! Running(i) → Evaluating(i) → Deciding(i) ─┬→ Refining(i) → Running(i+1)
//!                                            └→ Stopped(reason)
//! ```
//!
//! Each iteration scores the current candidate with every evaluator, records
//! it, and either stops or asks the writer for a revision built from the
//! evaluators' feedback. Stop reasons are checked in order: `threshold`,
//! `no_improvement`, `max_iterations`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest};
use crate::judge::{EvaluationFailure, Judge, JudgmentResult, ModelSpec, Subject};
use crate::prompts;

// =============================================================================
// Configuration
// =============================================================================

fn default_max_iterations() -> u32 {
    5
}

fn default_threshold() -> f64 {
    85.0
}

fn default_keep_best() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlywheelConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Stop once an iteration scores at least this much (1-100).
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Return the best iteration rather than the last one.
    #[serde(default = "default_keep_best")]
    pub keep_best: bool,
    /// A score must beat the best by more than this to count as improvement.
    pub min_improvement: f64,
    /// Stop after this many consecutive non-improving iterations. 0 disables.
    pub patience: u32,
    /// Writer sampling temperature for revisions.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for FlywheelConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            threshold: default_threshold(),
            keep_best: default_keep_best(),
            min_improvement: 0.0,
            patience: 0,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl FlywheelConfig {
    pub fn validate(&self) -> Result<(), FlywheelError> {
        if self.max_iterations == 0 {
            return Err(FlywheelError::InvalidConfig(
                "max_iterations must be >= 1".into(),
            ));
        }
        if !(1.0..=100.0).contains(&self.threshold) {
            return Err(FlywheelError::InvalidConfig(format!(
                "threshold must be between 1 and 100 (got {})",
                self.threshold
            )));
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            return Err(FlywheelError::InvalidConfig(format!(
                "min_improvement must be finite and >= 0 (got {})",
                self.min_improvement
            )));
        }
        if self.patience > self.max_iterations {
            return Err(FlywheelError::InvalidConfig(format!(
                "patience ({}) cannot exceed max_iterations ({})",
                self.patience, self.max_iterations
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlywheelError {
    #[error("invalid flywheel configuration: {0}")]
    InvalidConfig(String),
    #[error("refinement after iteration {iteration} failed: {reason}")]
    Refinement { iteration: u32, reason: String },
}

// =============================================================================
// State and session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Threshold,
    NoImprovement,
    MaxIterations,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::Threshold => "threshold",
            StopReason::NoImprovement => "no_improvement",
            StopReason::MaxIterations => "max_iterations",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlywheelState {
    Running(u32),
    Evaluating(u32),
    Deciding(u32),
    Refining(u32),
    Stopped(StopReason),
}

/// One evaluated candidate. Immutable once appended to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlywheelIteration {
    /// 1-based.
    pub index: u32,
    pub candidate_text: String,
    pub judgments: Vec<JudgmentResult>,
    pub failures: Vec<EvaluationFailure>,
    pub computed_score: f64,
    /// Mean of evaluator-reported overalls; `None` when every evaluator failed.
    pub evaluator_reported_score_average: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl FlywheelIteration {
    /// Artifact and subject id, e.g. `iteration-03`.
    pub fn label(&self) -> String {
        iteration_label(self.index)
    }
}

pub fn iteration_label(index: u32) -> String {
    format!("iteration-{index:02}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlywheelSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub original_text: String,
    pub writer: ModelSpec,
    pub evaluators: Vec<ModelSpec>,
    pub config: FlywheelConfig,
    pub iterations: Vec<FlywheelIteration>,
    pub best_score: f64,
    pub best_iteration_index: u32,
    pub final_text: String,
    pub final_score: f64,
    pub stop_reason: StopReason,
}

impl FlywheelSession {
    pub fn iteration(&self, index: u32) -> Option<&FlywheelIteration> {
        self.iterations.iter().find(|it| it.index == index)
    }
}

// =============================================================================
// Observer
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub enum FlywheelUpdate<'a> {
    /// Emitted right after an iteration is appended.
    Iteration {
        iteration: &'a FlywheelIteration,
        best_score: f64,
        best_iteration_index: u32,
    },
    /// Emitted once, with the finished session.
    Stopped(&'a FlywheelSession),
}

pub trait FlywheelObserver: Send + Sync {
    fn on_update(&self, update: FlywheelUpdate<'_>);
}

impl<F> FlywheelObserver for F
where
    F: Fn(FlywheelUpdate<'_>) + Send + Sync,
{
    fn on_update(&self, update: FlywheelUpdate<'_>) {
        self(update)
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct Flywheel {
    gateway: Arc<dyn ChatGateway>,
    judge: Judge,
    config: FlywheelConfig,
}

impl Flywheel {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        judge: Judge,
        config: FlywheelConfig,
    ) -> Result<Self, FlywheelError> {
        config.validate()?;
        Ok(Self {
            gateway,
            judge,
            config,
        })
    }

    pub fn config(&self) -> &FlywheelConfig {
        &self.config
    }

    fn stop_reason(&self, score: f64, index: u32, stale: u32) -> Option<StopReason> {
        if score >= self.config.threshold {
            Some(StopReason::Threshold)
        } else if self.config.patience > 0 && stale >= self.config.patience {
            Some(StopReason::NoImprovement)
        } else if index >= self.config.max_iterations {
            Some(StopReason::MaxIterations)
        } else {
            None
        }
    }

    pub async fn run(
        &self,
        starting_text: &str,
        writer: &ModelSpec,
        evaluators: &[ModelSpec],
        observer: Option<&dyn FlywheelObserver>,
    ) -> Result<FlywheelSession, FlywheelError> {
        if evaluators.is_empty() {
            return Err(FlywheelError::InvalidConfig(
                "at least one evaluator is required".into(),
            ));
        }
        if starting_text.trim().is_empty() {
            return Err(FlywheelError::InvalidConfig(
                "starting text is empty".into(),
            ));
        }

        let session_id = Uuid::new_v4();
        let created_at = Utc::now();
        let aggregator = self.judge.aggregator();

        let mut iterations: Vec<FlywheelIteration> = Vec::new();
        let mut best: Option<(f64, u32)> = None;
        let mut stale = 0u32;
        let mut candidate = starting_text.to_string();
        let mut index = 1u32;
        let mut state = FlywheelState::Running(index);

        let stop_reason = loop {
            debug!(?state, "flywheel transition");
            state = FlywheelState::Evaluating(index);
            debug!(?state, "flywheel transition");

            let subject = Subject::new(iteration_label(index), iteration_label(index), &candidate);
            let batch = self
                .judge
                .evaluate_many(evaluators, std::slice::from_ref(&subject), None)
                .await;
            let aggregate = aggregator.aggregate_subject(&subject, &batch.judgments);
            let score = aggregate.overall_average;

            let iteration = FlywheelIteration {
                index,
                candidate_text: candidate.clone(),
                evaluator_reported_score_average: batch.reported_average(),
                judgments: batch.judgments,
                failures: batch.failures,
                computed_score: score,
                created_at: Utc::now(),
            };

            match best {
                Some((best_score, _)) if score <= best_score + self.config.min_improvement => {
                    stale += 1;
                }
                _ => {
                    best = Some((score, index));
                    stale = 0;
                }
            }
            let (best_score, best_index) = best.unwrap_or((score, index));

            info!(
                session = %session_id,
                iteration = index,
                score,
                best_score,
                best_iteration = best_index,
                failures = iteration.failures.len(),
                "flywheel iteration scored"
            );

            iterations.push(iteration);
            if let (Some(obs), Some(latest)) = (observer, iterations.last()) {
                obs.on_update(FlywheelUpdate::Iteration {
                    iteration: latest,
                    best_score,
                    best_iteration_index: best_index,
                });
            }

            state = FlywheelState::Deciding(index);
            debug!(?state, "flywheel transition");
            if let Some(reason) = self.stop_reason(score, index, stale) {
                break reason;
            }

            state = FlywheelState::Refining(index);
            debug!(?state, "flywheel transition");
            let latest = iterations.last().ok_or_else(|| FlywheelError::Refinement {
                iteration: index,
                reason: "no iteration recorded".into(),
            })?;
            candidate = self.refine(session_id, writer, latest).await?;

            index += 1;
            state = FlywheelState::Running(index);
        };

        debug!(state = ?FlywheelState::Stopped(stop_reason), "flywheel transition");

        let (best_score, best_iteration_index) = best.unwrap_or((0.0, 1));
        let chosen_index = if self.config.keep_best {
            best_iteration_index
        } else {
            index
        };
        let (final_text, final_score) = iterations
            .iter()
            .find(|it| it.index == chosen_index)
            .map(|it| (it.candidate_text.clone(), it.computed_score))
            .unwrap_or_else(|| (candidate.clone(), 0.0));

        let session = FlywheelSession {
            id: session_id,
            created_at,
            original_text: starting_text.to_string(),
            writer: writer.clone(),
            evaluators: evaluators.to_vec(),
            config: self.config.clone(),
            iterations,
            best_score,
            best_iteration_index,
            final_text,
            final_score,
            stop_reason,
        };

        info!(
            session = %session.id,
            iterations = session.iterations.len(),
            stop_reason = %session.stop_reason,
            final_score = session.final_score,
            "flywheel stopped"
        );
        if let Some(obs) = observer {
            obs.on_update(FlywheelUpdate::Stopped(&session));
        }

        Ok(session)
    }

    async fn refine(
        &self,
        session_id: Uuid,
        writer: &ModelSpec,
        latest: &FlywheelIteration,
    ) -> Result<String, FlywheelError> {
        let averages = self
            .judge
            .aggregator()
            .criterion_averages(latest.judgments.iter());
        let prompt = prompts::refinement_prompt(
            &latest.candidate_text,
            &latest.judgments,
            &averages,
            latest.computed_score,
        );
        let request = ChatRequest::new(
            ChatModel::openrouter(&writer.model),
            prompt.to_messages(),
            Attribution::new("flywheel::refine").with_session(session_id),
        )
        .temperature(self.config.temperature)
        .max_tokens(self.config.max_tokens);

        let response = self
            .gateway
            .chat(request)
            .await
            .map_err(|e| FlywheelError::Refinement {
                iteration: latest.index,
                reason: e.to_string(),
            })?;

        let text = response.content.trim();
        if text.is_empty() {
            return Err(FlywheelError::Refinement {
                iteration: latest.index,
                reason: "writer returned an empty candidate".into(),
            });
        }
        Ok(text.to_string())
    }
}
