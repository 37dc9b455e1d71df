//! Progress hooks for evaluation waves.
//!
//! Observers are called synchronously from the task that produced the
//! event, so they should be quick (logging, counters, progress bars).

use super::types::{EvaluationFailure, JudgmentResult, ModelSpec, Subject};

#[derive(Debug, Clone, Copy)]
pub enum JudgeEvent<'a> {
    Started {
        evaluator: &'a ModelSpec,
        subject: &'a Subject,
    },
    Completed(&'a JudgmentResult),
    Failed(&'a EvaluationFailure),
}

pub trait JudgeObserver: Send + Sync {
    fn on_event(&self, event: JudgeEvent<'_>);
}

impl<F> JudgeObserver for F
where
    F: Fn(JudgeEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: JudgeEvent<'_>) {
        self(event)
    }
}

/// Logs each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingJudgeObserver;

impl JudgeObserver for TracingJudgeObserver {
    fn on_event(&self, event: JudgeEvent<'_>) {
        match event {
            JudgeEvent::Started { evaluator, subject } => tracing::debug!(
                evaluator = %evaluator.id,
                subject = %subject.id,
                "evaluation started"
            ),
            JudgeEvent::Completed(judgment) => tracing::info!(
                evaluator = %judgment.evaluator_id,
                subject = %judgment.subject_id,
                score = judgment.computed_overall,
                repairs = judgment.repair_attempts,
                cached = judgment.cached,
                "evaluation complete"
            ),
            JudgeEvent::Failed(failure) => tracing::warn!(
                evaluator = %failure.evaluator_id,
                subject = %failure.subject_id,
                error = %failure.error,
                "evaluation failed"
            ),
        }
    }
}
