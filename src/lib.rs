#![forbid(unsafe_code)]

//! # quill-harness
//!
//! Multi-judge rubric scoring and iterative refinement for LLM-written
//! documents.
//!
//! Several evaluator models score each document against a weighted rubric.
//! Their raw replies are parsed, validated and (once, by default) repaired;
//! the authoritative score is always recomputed from the per-criterion
//! scores, never taken from an evaluator's own total. On top of that engine
//! sit two workflows:
//!
//! - **bench**: several writers answer the same brief, every evaluator scores
//!   every post, posts are ranked.
//! - **flywheel**: one document is scored, revised from the feedback and
//!   re-scored until it clears a threshold, stalls or runs out of iterations.
//!   Consecutive drafts are recorded as unified diffs.

pub mod aggregate;
pub mod artifacts;
pub mod cache;
pub mod config;
pub mod diff;
pub mod flywheel;
pub mod gateway;
pub mod judge;
pub mod pipeline;
pub mod prompts;
pub mod rubric;
pub mod scheduler;

pub use aggregate::{winner, AggregatedResult, ScoreAggregator};
pub use artifacts::{ArtifactError, ArtifactWriter};
pub use cache::{JudgmentCache, JudgmentCacheKey, SqliteJudgmentCache};
pub use config::{ConfigError, QuillConfig};
pub use diff::{unified_diff, DiffOptions};
pub use flywheel::{
    Flywheel, FlywheelConfig, FlywheelError, FlywheelObserver, FlywheelSession, FlywheelUpdate,
    StopReason,
};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use judge::{
    EvaluationBatch, EvaluationFailure, Judge, JudgeConfig, JudgeError, JudgeObserver,
    JudgmentParser, JudgmentResult, ModelSpec, Subject, ValidationError,
};
pub use pipeline::{run_bench, BenchError, BenchRequest, BenchSession};
pub use rubric::{Criterion, RubricError, RubricWeights};
pub use scheduler::{BoundedScheduler, SchedulerError};
