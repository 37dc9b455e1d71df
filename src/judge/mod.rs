//! Multi-evaluator judging.
//!
//! - `types`: judgment data model
//! - `parse`: raw evaluator text → validated score set
//! - `evaluate`: gateway calls, repair round-trips, bounded evaluation waves
//! - `hooks`: synchronous progress observers

pub mod evaluate;
pub mod hooks;
pub mod parse;
pub mod types;

pub use evaluate::{Judge, JudgeConfig, JudgeError};
pub use hooks::{JudgeEvent, JudgeObserver, TracingJudgeObserver};
pub use parse::{JudgmentParser, ParsedJudgment, ValidationError};
pub use types::{
    CriterionScore, EvaluationBatch, EvaluationFailure, JudgmentResult, ModelSpec, Subject,
};
