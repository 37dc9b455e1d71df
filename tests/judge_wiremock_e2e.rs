use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quill_harness::cache::SqliteJudgmentCache;
use quill_harness::gateway::openrouter::OpenRouterAdapter;
use quill_harness::gateway::{GatewayConfig, NoopUsageSink, ProviderGateway};
use quill_harness::judge::{Judge, JudgeConfig, JudgeEvent, ModelSpec, Subject};
use quill_harness::rubric::RubricWeights;
use serde_json::{json, Value};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn judgment(score: u32) -> String {
    json!({
        "scores": [
            {"criterion": "narrative", "score": score, "feedback": "Arc holds."},
            {"criterion": "structure", "score": score, "feedback": "Sections flow."},
            {"criterion": "audienceFit", "score": score, "feedback": "Right level."},
            {"criterion": "accuracy", "score": score, "feedback": "Claims check out."},
            {"criterion": "aiDetection", "score": score, "feedback": "Sounds human."}
        ],
        "overallScore": score
    })
    .to_string()
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 100, "completion_tokens": 50 }
    }))
}

/// Behaviour keyed on the requested model:
/// - `good/*` answers with a valid judgment
/// - `flaky/*` answers with prose first and a valid judgment on repair
/// - `broken/*` never produces JSON
/// - `slow/*` answers with a valid judgment after 500 ms
struct EvaluatorResponder;

impl Respond for EvaluatorResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let model = body["model"].as_str().unwrap_or_default();
        let is_repair = body["messages"].as_array().map(Vec::len).unwrap_or(0) > 2;
        if model.starts_with("good/") {
            completion(&judgment(80))
        } else if model.starts_with("slow/") {
            completion(&judgment(70)).set_delay(Duration::from_millis(500))
        } else if model.starts_with("flaky/") {
            if is_repair {
                completion(&format!("```json\n{}\n```", judgment(60)))
            } else {
                completion("Overall this is a strong post, I'd give it 60.")
            }
        } else {
            completion("I'd rather describe my thoughts in prose.")
        }
    }
}

async fn gateway(server: &MockServer) -> Arc<ProviderGateway<NoopUsageSink>> {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(EvaluatorResponder)
        .mount(server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    ))
}

#[tokio::test]
async fn wave_isolates_an_evaluator_that_fails_after_repair() {
    let server = MockServer::start().await;
    let judge = Judge::new(
        gateway(&server).await,
        RubricWeights::default(),
        JudgeConfig::default(),
    )
    .unwrap();

    let evaluators = vec![
        ModelSpec::from_model("good/judge"),
        ModelSpec::from_model("flaky/judge"),
        ModelSpec::from_model("broken/judge"),
    ];
    let subject = Subject::new("post-a", "Post A", "We shipped the thing.");

    let events = Mutex::new(Vec::new());
    let observer = |event: JudgeEvent<'_>| {
        let tag = match event {
            JudgeEvent::Started { .. } => "started",
            JudgeEvent::Completed(_) => "completed",
            JudgeEvent::Failed(_) => "failed",
        };
        events.lock().unwrap().push(tag);
    };

    let batch = judge
        .evaluate_many(&evaluators, std::slice::from_ref(&subject), Some(&observer))
        .await;

    assert_eq!(batch.judgments.len(), 2);
    assert_eq!(batch.failures.len(), 1);

    let good = batch
        .judgments
        .iter()
        .find(|j| j.evaluator_id == "good-judge")
        .unwrap();
    assert_eq!(good.computed_overall, 80.0);
    assert_eq!(good.repair_attempts, 0);

    let flaky = batch
        .judgments
        .iter()
        .find(|j| j.evaluator_id == "flaky-judge")
        .unwrap();
    assert_eq!(flaky.computed_overall, 60.0);
    assert_eq!(flaky.repair_attempts, 1);

    let failure = &batch.failures[0];
    assert_eq!(failure.evaluator_id, "broken-judge");
    assert_eq!(failure.subject_id, "post-a");
    assert!(failure.error.contains("1 repair attempt"));

    // good: 1 call, flaky: 2, broken: 2 (original + one repair).
    assert_eq!(server.received_requests().await.unwrap().len(), 5);

    let events = events.lock().unwrap();
    assert_eq!(events.iter().filter(|e| **e == "started").count(), 3);
    assert_eq!(events.iter().filter(|e| **e == "completed").count(), 2);
    assert_eq!(events.iter().filter(|e| **e == "failed").count(), 1);

    let ranking = judge.aggregator().aggregate(&[subject], &batch.judgments);
    assert_eq!(ranking[0].contributing_judgments, 2);
    assert_eq!(ranking[0].overall_average, 70.0);
}

#[tokio::test]
async fn cached_judgment_skips_the_provider() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let cache = Arc::new(SqliteJudgmentCache::new(dir.path().join("cache.sqlite")).unwrap());
    let judge = Judge::new(
        gateway(&server).await,
        RubricWeights::default(),
        JudgeConfig::default(),
    )
    .unwrap()
    .with_cache(cache);

    let evaluator = ModelSpec::from_model("flaky/judge");
    let subject = Subject::new("post-a", "Post A", "We shipped the thing.");

    let live = judge.evaluate(&evaluator, &subject).await.unwrap();
    assert!(!live.cached);
    assert_eq!(live.repair_attempts, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let hit = judge.evaluate(&evaluator, &subject).await.unwrap();
    assert!(hit.cached);
    assert_eq!(hit.computed_overall, 60.0);
    assert_eq!(hit.scores, live.scores);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    // Different text, different key.
    let other = Subject::new("post-b", "Post B", "We shipped another thing.");
    let miss = judge.evaluate(&evaluator, &other).await.unwrap();
    assert!(!miss.cached);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);

    // Same text under another title renders a different prompt.
    let renamed = Subject::new("post-a", "Post A, revised title", "We shipped the thing.");
    assert!(!judge.evaluate(&evaluator, &renamed).await.unwrap().cached);
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
}

#[tokio::test]
async fn sampling_settings_are_part_of_the_cache_key() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let db = dir.path().join("cache.sqlite");
    let gw = gateway(&server).await;

    let evaluator = ModelSpec::from_model("good/judge");
    let subject = Subject::new("post-a", "Post A", "We shipped the thing.");

    let cool = Judge::new(gw.clone(), RubricWeights::default(), JudgeConfig::default())
        .unwrap()
        .with_cache(Arc::new(SqliteJudgmentCache::new(&db).unwrap()));
    assert!(!cool.evaluate(&evaluator, &subject).await.unwrap().cached);
    assert!(cool.evaluate(&evaluator, &subject).await.unwrap().cached);

    let warm_config = JudgeConfig {
        temperature: JudgeConfig::default().temperature + 0.5,
        ..JudgeConfig::default()
    };
    let warm = Judge::new(gw, RubricWeights::default(), warm_config)
        .unwrap()
        .with_cache(Arc::new(SqliteJudgmentCache::new(&db).unwrap()));
    assert!(!warm.evaluate(&evaluator, &subject).await.unwrap().cached);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn changing_the_rubric_invalidates_the_cache() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let db = dir.path().join("cache.sqlite");
    let gw = gateway(&server).await;

    let evaluator = ModelSpec::from_model("good/judge");
    let subject = Subject::new("post-a", "Post A", "We shipped the thing.");

    let default_judge = Judge::new(gw.clone(), RubricWeights::default(), JudgeConfig::default())
        .unwrap()
        .with_cache(Arc::new(SqliteJudgmentCache::new(&db).unwrap()));
    default_judge.evaluate(&evaluator, &subject).await.unwrap();

    let custom: RubricWeights = serde_json::from_value(json!({
        "narrative": 50, "structure": 10, "audienceFit": 10, "accuracy": 15, "aiDetection": 15
    }))
    .unwrap();
    let custom_judge = Judge::new(gw, custom, JudgeConfig::default())
        .unwrap()
        .with_cache(Arc::new(SqliteJudgmentCache::new(&db).unwrap()));
    let result = custom_judge.evaluate(&evaluator, &subject).await.unwrap();
    assert!(!result.cached);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn completion_events_fire_as_each_evaluation_settles() {
    let server = MockServer::start().await;
    let judge = Judge::new(
        gateway(&server).await,
        RubricWeights::default(),
        JudgeConfig::default(),
    )
    .unwrap();

    let evaluators = vec![
        ModelSpec::from_model("slow/judge"),
        ModelSpec::from_model("good/judge"),
        ModelSpec::from_model("broken/judge"),
    ];
    let subject = Subject::new("post-a", "Post A", "We shipped the thing.");

    let started = Instant::now();
    let settled = Mutex::new(Vec::new());
    let observer = |event: JudgeEvent<'_>| {
        let id = match event {
            JudgeEvent::Completed(judgment) => judgment.evaluator_id.clone(),
            JudgeEvent::Failed(failure) => failure.evaluator_id.clone(),
            JudgeEvent::Started { .. } => return,
        };
        settled.lock().unwrap().push((id, started.elapsed()));
    };

    let batch = judge
        .evaluate_many(&evaluators, std::slice::from_ref(&subject), Some(&observer))
        .await;
    assert_eq!(batch.judgments.len(), 2);
    assert_eq!(batch.failures.len(), 1);
    // Results stay in submission order.
    assert_eq!(batch.judgments[0].evaluator_id, "slow-judge");

    let settled = settled.lock().unwrap();
    assert_eq!(settled.len(), 3);
    assert_eq!(settled[2].0, "slow-judge");
    for (id, at) in settled.iter().take(2) {
        assert_ne!(id, "slow-judge");
        assert!(*at < Duration::from_millis(400), "{id} settled at {at:?}");
    }
    assert!(settled[2].1 >= Duration::from_millis(500));
}
