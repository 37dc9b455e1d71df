//! Evaluator invocation with validation and repair.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::hooks::{JudgeEvent, JudgeObserver};
use super::parse::{JudgmentParser, ParsedJudgment, ValidationError};
use super::types::{EvaluationBatch, EvaluationFailure, JudgmentResult, ModelSpec, Subject};
use crate::aggregate::ScoreAggregator;
use crate::cache::{CachedResponse, JudgmentCache, JudgmentCacheKey};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};
use crate::prompts::{self, JUDGE_PROMPT};
use crate::rubric::RubricWeights;
use crate::scheduler::{BoundedScheduler, SchedulerError};

fn default_concurrency() -> usize {
    4
}

fn default_max_repair_attempts() -> u32 {
    1
}

fn default_divergence_warning() -> f64 {
    super::parse::DEFAULT_DIVERGENCE_WARNING
}

fn default_max_tokens() -> u32 {
    2048
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Evaluator calls in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Repair round-trips allowed per evaluator/subject pair.
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
    /// Warn when reported and computed overall differ by this many points.
    #[serde(default = "default_divergence_warning")]
    pub divergence_warning: f64,
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_repair_attempts: default_max_repair_attempts(),
            divergence_warning: default_divergence_warning(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("evaluator {evaluator} failed on {subject}: {source}")]
    Provider {
        evaluator: String,
        subject: String,
        #[source]
        source: ProviderError,
    },
    #[error(
        "evaluator {evaluator} returned an invalid judgment for {subject} after {repairs} repair attempt(s): {source}"
    )]
    Invalid {
        evaluator: String,
        subject: String,
        repairs: u32,
        #[source]
        source: ValidationError,
    },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("invalid judge configuration: {0}")]
    InvalidConfig(String),
}

/// Runs evaluators against subjects.
pub struct Judge {
    gateway: Arc<dyn ChatGateway>,
    parser: JudgmentParser,
    scheduler: BoundedScheduler,
    config: JudgeConfig,
    cache: Option<Arc<dyn JudgmentCache>>,
    session_id: Option<Uuid>,
}

impl Judge {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        rubric: RubricWeights,
        config: JudgeConfig,
    ) -> Result<Self, JudgeError> {
        let scheduler = BoundedScheduler::new(config.concurrency)?;
        if !config.divergence_warning.is_finite() || config.divergence_warning < 0.0 {
            return Err(JudgeError::InvalidConfig(format!(
                "divergence_warning must be finite and >= 0 (got {})",
                config.divergence_warning
            )));
        }
        let parser = JudgmentParser::new(rubric).with_divergence_warning(config.divergence_warning);
        Ok(Self {
            gateway,
            parser,
            scheduler,
            config,
            cache: None,
            session_id: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn JudgmentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Tag every gateway request with this session id.
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn rubric(&self) -> &RubricWeights {
        self.parser.rubric()
    }

    pub fn aggregator(&self) -> &ScoreAggregator {
        self.parser.aggregator()
    }

    fn attribution(&self, caller: &'static str) -> Attribution {
        match self.session_id {
            Some(id) => Attribution::new(caller).with_session(id),
            None => Attribution::new(caller),
        }
    }

    fn request(&self, evaluator: &ModelSpec, messages: Vec<Message>, caller: &'static str) -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter(&evaluator.model),
            messages,
            self.attribution(caller),
        )
        .temperature(self.config.temperature)
        .max_tokens(self.config.max_tokens)
        .json()
    }

    /// Score one subject with one evaluator.
    ///
    /// An invalid response triggers up to `max_repair_attempts` repair
    /// round-trips, each carrying the original prompt, the rejected response
    /// and the validation error.
    pub async fn evaluate(
        &self,
        evaluator: &ModelSpec,
        subject: &Subject,
    ) -> Result<JudgmentResult, JudgeError> {
        let prompt = prompts::judge_prompt(self.rubric(), subject);
        let cache_key = self.cache.as_ref().map(|_| {
            JudgmentCacheKey::new(
                &evaluator.model,
                JUDGE_PROMPT.slug,
                &JUDGE_PROMPT.hash(),
                &self.rubric().fingerprint(),
                &prompt.user,
            )
            .with_sampling(self.config.temperature, self.config.max_tokens)
        });

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            match cache.get(key).await {
                Ok(Some(hit)) => match self.parser.parse(&hit.raw) {
                    Ok(parsed) => {
                        debug!(evaluator = %evaluator.id, subject = %subject.id, "judgment cache hit");
                        return Ok(self.build_result(evaluator, subject, parsed, 0, true));
                    }
                    Err(err) => {
                        warn!(error = %err, "Cached judgment no longer validates; re-evaluating")
                    }
                },
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Cache read failed; falling back to live evaluation"),
            }
        }

        let provider_err = |source: ProviderError| JudgeError::Provider {
            evaluator: evaluator.id.clone(),
            subject: subject.id.clone(),
            source,
        };

        let mut response = self
            .gateway
            .chat(self.request(evaluator, prompt.to_messages(), "judge::evaluate"))
            .await
            .map_err(provider_err)?;

        let mut repairs = 0u32;
        let parsed = loop {
            match self.parser.parse(&response.content) {
                Ok(parsed) => break parsed,
                Err(err) if repairs < self.config.max_repair_attempts => {
                    repairs += 1;
                    warn!(
                        evaluator = %evaluator.id,
                        subject = %subject.id,
                        attempt = repairs,
                        error = %err,
                        "invalid judgment; requesting repair"
                    );
                    let mut messages = prompt.to_messages();
                    messages.push(Message::assistant(&response.content));
                    messages.push(Message::user(prompts::repair_instruction(&err)));
                    response = self
                        .gateway
                        .chat(self.request(evaluator, messages, "judge::repair"))
                        .await
                        .map_err(provider_err)?;
                }
                Err(err) => {
                    return Err(JudgeError::Invalid {
                        evaluator: evaluator.id.clone(),
                        subject: subject.id.clone(),
                        repairs,
                        source: err,
                    })
                }
            }
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            let entry = CachedResponse {
                raw: response.content.clone(),
                input_tokens: Some(response.input_tokens),
                output_tokens: Some(response.output_tokens),
            };
            if let Err(err) = cache.put(key, &entry).await {
                warn!(error = %err, "Cache write failed");
            }
        }

        Ok(self.build_result(evaluator, subject, parsed, repairs, false))
    }

    fn build_result(
        &self,
        evaluator: &ModelSpec,
        subject: &Subject,
        parsed: ParsedJudgment,
        repair_attempts: u32,
        cached: bool,
    ) -> JudgmentResult {
        JudgmentResult {
            evaluator_id: evaluator.id.clone(),
            evaluator_name: evaluator.name.clone(),
            subject_id: subject.id.clone(),
            scores: parsed.scores,
            evaluator_reported_overall: parsed.reported_overall,
            computed_overall: parsed.computed_overall,
            warnings: parsed.warnings,
            repair_attempts,
            cached,
            timestamp: Utc::now(),
        }
    }

    /// Every evaluator on every subject, bounded by `concurrency`.
    ///
    /// Work is submitted subject-major. A failing pair becomes an
    /// [`EvaluationFailure`] and never affects its siblings.
    pub async fn evaluate_many(
        &self,
        evaluators: &[ModelSpec],
        subjects: &[Subject],
        observer: Option<&dyn JudgeObserver>,
    ) -> EvaluationBatch {
        let pairs: Vec<(&ModelSpec, &Subject)> = subjects
            .iter()
            .flat_map(|s| evaluators.iter().map(move |e| (e, s)))
            .collect();

        let factories = pairs.iter().map(|&(evaluator, subject)| {
            move || async move {
                if let Some(obs) = observer {
                    obs.on_event(JudgeEvent::Started { evaluator, subject });
                }
                match self.evaluate(evaluator, subject).await {
                    Ok(judgment) => {
                        if let Some(obs) = observer {
                            obs.on_event(JudgeEvent::Completed(&judgment));
                        }
                        Ok(judgment)
                    }
                    Err(err) => {
                        let failure = EvaluationFailure {
                            evaluator_id: evaluator.id.clone(),
                            evaluator_name: evaluator.name.clone(),
                            subject_id: subject.id.clone(),
                            error: err.to_string(),
                            timestamp: Utc::now(),
                        };
                        if let Some(obs) = observer {
                            obs.on_event(JudgeEvent::Failed(&failure));
                        }
                        Err(failure)
                    }
                }
            }
        });

        let mut batch = EvaluationBatch::default();
        for outcome in self.scheduler.run(factories).await {
            match outcome {
                Ok(judgment) => batch.judgments.push(judgment),
                Err(failure) => batch.failures.push(failure),
            }
        }

        debug!(
            judgments = batch.judgments.len(),
            failures = batch.failures.len(),
            "evaluation wave settled"
        );
        batch
    }
}
