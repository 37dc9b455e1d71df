//! Multi-writer generation → multi-evaluator judging → ranking.
//!
//! One bench run:
//! 1. **Generate**: send the same prompt to every writer, bounded by
//!    `generation_concurrency`. A failed writer is recorded, not fatal.
//! 2. **Judge**: every evaluator scores every generated post in one wave.
//! 3. **Rank**: aggregate per post and order best first.
//!
//! Usage:
//! ```bash
//! quill bench --prompt-file brief.md --out runs/launch-post
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::{winner, AggregatedResult};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest};
use crate::judge::{
    EvaluationFailure, Judge, JudgeObserver, JudgmentResult, ModelSpec, Subject,
};
use crate::prompts;
use crate::scheduler::{BoundedScheduler, SchedulerError};

// =============================================================================
// Types
// =============================================================================

fn default_generation_concurrency() -> usize {
    4
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

/// Full bench request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BenchRequest {
    /// The writing brief sent to every writer.
    pub prompt: String,
    /// Overrides the built-in writer system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub writers: Vec<ModelSpec>,
    pub evaluators: Vec<ModelSpec>,
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

/// One writer's post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub writer_id: String,
    pub writer_name: String,
    pub model: String,
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
}

impl Generation {
    pub fn subject(&self) -> Subject {
        Subject::new(&self.writer_id, &self.writer_name, &self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFailure {
    pub writer_id: String,
    pub writer_name: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Full bench session output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub prompt: String,
    pub writers: Vec<ModelSpec>,
    pub evaluators: Vec<ModelSpec>,
    pub generations: Vec<Generation>,
    pub generation_failures: Vec<GenerationFailure>,
    pub judgments: Vec<JudgmentResult>,
    pub failures: Vec<EvaluationFailure>,
    pub ranking: Vec<AggregatedResult>,
    /// Subject id of the top-ranked post; `None` when nothing was generated.
    pub winner: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

// =============================================================================
// Generate phase
// =============================================================================

async fn generate_all(
    gateway: &dyn ChatGateway,
    req: &BenchRequest,
    session_id: Uuid,
) -> Result<Vec<Result<Generation, GenerationFailure>>, BenchError> {
    let scheduler = BoundedScheduler::new(req.generation_concurrency)?;
    let prompt = prompts::writer_prompt(req.system_prompt.as_deref(), &req.prompt);

    let factories = req.writers.iter().map(|writer| {
        let chat_req = ChatRequest::new(
            ChatModel::openrouter(&writer.model),
            prompt.to_messages(),
            Attribution::new("pipeline::generate").with_session(session_id),
        )
        .temperature(req.temperature)
        .max_tokens(req.max_tokens);

        move || async move {
            let start = Instant::now();
            let failure = |error: String| GenerationFailure {
                writer_id: writer.id.clone(),
                writer_name: writer.name.clone(),
                error,
                timestamp: Utc::now(),
            };
            match gateway.chat(chat_req).await {
                Ok(resp) if resp.content.trim().is_empty() => {
                    Err(failure("writer returned an empty response".into()))
                }
                Ok(resp) => Ok(Generation {
                    writer_id: writer.id.clone(),
                    writer_name: writer.name.clone(),
                    model: writer.model.clone(),
                    text: resp.content.trim().to_string(),
                    input_tokens: resp.input_tokens,
                    output_tokens: resp.output_tokens,
                    latency_ms: start.elapsed().as_millis() as u64,
                }),
                Err(e) => Err(failure(e.to_string())),
            }
        }
    });

    Ok(scheduler.run(factories).await)
}

// =============================================================================
// Pipeline
// =============================================================================

/// Generate with every writer, judge every post, rank.
pub async fn run_bench(
    gateway: Arc<dyn ChatGateway>,
    judge: &Judge,
    req: BenchRequest,
    observer: Option<&dyn JudgeObserver>,
) -> Result<BenchSession, BenchError> {
    if req.prompt.trim().is_empty() {
        return Err(BenchError::InvalidRequest("prompt must not be empty".into()));
    }
    if req.writers.is_empty() {
        return Err(BenchError::InvalidRequest(
            "at least one writer is required".into(),
        ));
    }
    if req.evaluators.is_empty() {
        return Err(BenchError::InvalidRequest(
            "at least one evaluator is required".into(),
        ));
    }

    let session_id = Uuid::new_v4();

    // --- Phase 1: Generate ---
    info!(session = %session_id, writers = req.writers.len(), "generating posts");
    let mut generations = Vec::new();
    let mut generation_failures = Vec::new();
    for outcome in generate_all(gateway.as_ref(), &req, session_id).await? {
        match outcome {
            Ok(gen) => {
                info!(
                    writer = %gen.writer_id,
                    output_tokens = gen.output_tokens,
                    latency_ms = gen.latency_ms,
                    "post generated"
                );
                generations.push(gen);
            }
            Err(failure) => {
                warn!(writer = %failure.writer_id, error = %failure.error, "generation failed");
                generation_failures.push(failure);
            }
        }
    }

    // --- Phase 2: Judge ---
    let subjects: Vec<Subject> = generations.iter().map(Generation::subject).collect();
    info!(
        posts = subjects.len(),
        evaluators = req.evaluators.len(),
        "judging posts"
    );
    let batch = judge.evaluate_many(&req.evaluators, &subjects, observer).await;

    // --- Phase 3: Rank ---
    let ranking = judge.aggregator().aggregate(&subjects, &batch.judgments);
    let winner = winner(&ranking).map(|w| w.subject_id.clone());
    for entry in &ranking {
        info!(
            rank = entry.rank,
            subject = %entry.subject_id,
            score = entry.overall_average,
            judgments = entry.contributing_judgments,
            "ranked"
        );
    }

    Ok(BenchSession {
        id: session_id,
        created_at: Utc::now(),
        prompt: req.prompt,
        writers: req.writers,
        evaluators: req.evaluators,
        generations,
        generation_failures,
        judgments: batch.judgments,
        failures: batch.failures,
        ranking,
        winner,
    })
}
