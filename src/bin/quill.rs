#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use quill_harness::aggregate::ScoreAggregator;
use quill_harness::artifacts::ArtifactWriter;
use quill_harness::cache::SqliteJudgmentCache;
use quill_harness::config::QuillConfig;
use quill_harness::diff::{self, DiffOptions};
use quill_harness::flywheel::{Flywheel, FlywheelUpdate};
use quill_harness::gateway::{ChatGateway, ProviderGateway, TracingUsageSink};
use quill_harness::judge::{
    Judge, JudgmentResult, ModelSpec, Subject, TracingJudgeObserver,
};
use quill_harness::pipeline::{self, BenchRequest};

const DEFAULT_CONFIG: &str = "quill.toml";

#[derive(Parser)]
#[command(name = "quill", version, about = "Multi-judge rubric scoring for LLM-written text")]
struct Cli {
    /// TOML config (default: ./quill.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct CacheArgs {
    /// SQLite judgment cache (default: $QUILL_CACHE_PATH or .quill_judgment_cache.sqlite)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Disable the judgment cache
    #[arg(long, conflicts_with = "cache")]
    no_cache: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one post per writer, score every post with every evaluator, rank
    Bench {
        /// Inline brief
        #[arg(long, group = "input")]
        prompt: Option<String>,

        /// Read the brief from a file
        #[arg(long, group = "input")]
        prompt_file: Option<PathBuf>,

        /// Comma-separated writer model ids (overrides [[writers]])
        #[arg(long, value_delimiter = ',')]
        writers: Option<Vec<String>>,

        /// Comma-separated evaluator model ids (overrides [[evaluators]])
        #[arg(long, value_delimiter = ',')]
        evaluators: Option<Vec<String>>,

        /// Output directory for the session and per-judgment artifacts
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Score, revise and re-score one document until it clears the threshold
    Flywheel {
        /// Starting document
        #[arg(long)]
        input: PathBuf,

        /// Writer model id used for revisions (overrides the first [[writers]])
        #[arg(long)]
        writer: Option<String>,

        /// Comma-separated evaluator model ids (overrides [[evaluators]])
        #[arg(long, value_delimiter = ',')]
        evaluators: Option<Vec<String>>,

        /// Output directory for the session, drafts and diffs
        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        max_iterations: Option<u32>,

        #[arg(long)]
        threshold: Option<f64>,

        #[arg(long)]
        patience: Option<u32>,

        #[arg(long)]
        min_improvement: Option<f64>,

        /// Return the last iteration instead of the best one
        #[arg(long)]
        no_keep_best: bool,

        /// Skip iteration diffs
        #[arg(long)]
        no_diff: bool,

        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Score one document with every evaluator
    Judge {
        #[arg(long)]
        input: PathBuf,

        /// Comma-separated evaluator model ids (overrides [[evaluators]])
        #[arg(long, value_delimiter = ',')]
        evaluators: Option<Vec<String>>,

        /// Write judgments and failures here
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        cache: CacheArgs,
    },
    /// Rank subjects from a JSON array of judgments (no LLM calls)
    Aggregate {
        #[arg(long)]
        judgments: PathBuf,

        /// Write the ranking JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Unified line diff between two files
    Diff {
        old: PathBuf,
        new: PathBuf,

        /// Unchanged lines around each change (default: [diff].context)
        #[arg(long)]
        context: Option<usize>,

        /// Print only added/removed line counts
        #[arg(long)]
        stat: bool,
    },
    /// Print the effective rubric
    Rubric,
    /// Export the judgment cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the judgment cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Bench {
            prompt,
            prompt_file,
            writers,
            evaluators,
            out,
            cache,
        } => {
            let prompt_text = if let Some(p) = prompt {
                p
            } else if let Some(path) = prompt_file {
                std::fs::read_to_string(&path)?
            } else {
                return Err("bench requires --prompt or --prompt-file".into());
            };
            let writers = resolve_models(writers, config.writer_specs(), "writer")?;
            let evaluators = resolve_models(evaluators, config.evaluator_specs(), "evaluator")?;

            let gateway = gateway()?;
            let judge = build_judge(gateway.clone(), &config, &cache)?;
            let req = BenchRequest {
                prompt: prompt_text,
                system_prompt: config.bench.system_prompt.clone(),
                writers,
                evaluators,
                generation_concurrency: config.bench.generation_concurrency,
                temperature: config.bench.temperature,
                max_tokens: config.bench.max_tokens,
            };

            let session =
                pipeline::run_bench(gateway, &judge, req, Some(&TracingJudgeObserver)).await?;
            let path = ArtifactWriter::new(&out).write_bench_session(&session)?;

            for entry in &session.ranking {
                println!(
                    "{:>2}. {:<32} {:>6.2}  ({} judgments)",
                    entry.rank,
                    entry.subject_name,
                    entry.overall_average,
                    entry.contributing_judgments
                );
            }
            if !session.generation_failures.is_empty() || !session.failures.is_empty() {
                println!(
                    "{} generation failure(s), {} evaluation failure(s)",
                    session.generation_failures.len(),
                    session.failures.len()
                );
            }
            println!("session written to {}", path.display());
        }
        Commands::Flywheel {
            input,
            writer,
            evaluators,
            out,
            max_iterations,
            threshold,
            patience,
            min_improvement,
            no_keep_best,
            no_diff,
            cache,
        } => {
            let text = std::fs::read_to_string(&input)?;
            let writer = match writer {
                Some(model) => ModelSpec::from_model(model),
                None => config
                    .writer_specs()
                    .into_iter()
                    .next()
                    .ok_or("flywheel requires --writer or a [[writers]] entry")?,
            };
            let evaluators = resolve_models(evaluators, config.evaluator_specs(), "evaluator")?;

            let mut fw_config = config.flywheel.clone();
            if let Some(v) = max_iterations {
                fw_config.max_iterations = v;
            }
            if let Some(v) = threshold {
                fw_config.threshold = v;
            }
            if let Some(v) = patience {
                fw_config.patience = v;
            }
            if let Some(v) = min_improvement {
                fw_config.min_improvement = v;
            }
            if no_keep_best {
                fw_config.keep_best = false;
            }

            let gateway = gateway()?;
            let judge = build_judge(gateway.clone(), &config, &cache)?;
            let flywheel = Flywheel::new(gateway, judge, fw_config)?;

            let progress = |update: FlywheelUpdate<'_>| {
                if let FlywheelUpdate::Iteration {
                    iteration,
                    best_score,
                    best_iteration_index,
                } = update
                {
                    eprintln!(
                        "[flywheel] {} scored {:.2} (best {:.2} at iteration {})",
                        iteration.label(),
                        iteration.computed_score,
                        best_score,
                        best_iteration_index
                    );
                }
            };
            let session = flywheel
                .run(&text, &writer, &evaluators, Some(&progress))
                .await?;

            let diff_opts = (config.diff.enabled && !no_diff)
                .then(|| DiffOptions::default().context(config.diff.context));
            let writer_out = ArtifactWriter::new(&out);
            let path = writer_out.write_flywheel_session(&session, diff_opts.as_ref())?;
            writer_out.write_text("final.md", &session.final_text)?;

            println!(
                "stopped: {} after {} iteration(s); final score {:.2} (best {:.2} at iteration {})",
                session.stop_reason,
                session.iterations.len(),
                session.final_score,
                session.best_score,
                session.best_iteration_index
            );
            println!("session written to {}", path.display());
        }
        Commands::Judge {
            input,
            evaluators,
            out,
            cache,
        } => {
            let text = std::fs::read_to_string(&input)?;
            let evaluators = resolve_models(evaluators, config.evaluator_specs(), "evaluator")?;
            let name = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            let subject = Subject::new("document", name, text);

            let gateway = gateway()?;
            let judge = build_judge(gateway, &config, &cache)?;
            let batch = judge
                .evaluate_many(
                    &evaluators,
                    std::slice::from_ref(&subject),
                    Some(&TracingJudgeObserver),
                )
                .await;

            if let Some(dir) = out {
                let artifacts = ArtifactWriter::new(dir);
                for judgment in &batch.judgments {
                    artifacts.write_judgment(judgment)?;
                }
                artifacts.write_failures(&batch.failures)?;
            }

            let ranking = judge.aggregator().aggregate(&[subject], &batch.judgments);
            print_json(&ranking)?;
            if !batch.failures.is_empty() {
                eprintln!("{} evaluator(s) failed", batch.failures.len());
            }
        }
        Commands::Aggregate { judgments, out } => {
            let judgments: Vec<JudgmentResult> = read_json(&judgments)?;
            let mut seen = BTreeSet::new();
            let subjects: Vec<Subject> = judgments
                .iter()
                .filter(|j| seen.insert(j.subject_id.clone()))
                .map(|j| Subject::new(&j.subject_id, &j.subject_id, ""))
                .collect();
            let ranking = ScoreAggregator::new(config.rubric.clone()).aggregate(&subjects, &judgments);
            match out {
                Some(path) => write_json(&path, &ranking)?,
                None => print_json(&ranking)?,
            }
        }
        Commands::Diff {
            old,
            new,
            context,
            stat,
        } => {
            let old_text = std::fs::read_to_string(&old)?;
            let new_text = std::fs::read_to_string(&new)?;
            if stat {
                let s = diff::stat(&old_text, &new_text);
                println!("+{} -{}", s.added, s.removed);
            } else {
                let opts = DiffOptions::default()
                    .context(context.unwrap_or(config.diff.context))
                    .labels(old.display().to_string(), new.display().to_string());
                print!("{}", diff::unified_diff(&old_text, &new_text, &opts));
            }
        }
        Commands::Rubric => {
            let total = config.rubric.total_weight();
            for (criterion, weight) in config.rubric.iter() {
                println!(
                    "{:<12} {:>6.2} ({:>5.1}%)  {}",
                    criterion.key(),
                    weight,
                    weight / total * 100.0,
                    criterion.description()
                );
            }
            println!("fingerprint {}", config.rubric.fingerprint());
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteJudgmentCache::default_path);
            let cache = SqliteJudgmentCache::new(path)?;
            let rows = cache.export_jsonl(&out).await?;
            println!("exported {rows} rows to {}", out.display());
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteJudgmentCache::default_path);
            let cache = SqliteJudgmentCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
}

fn load_config(path: Option<&Path>) -> Result<QuillConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(QuillConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(QuillConfig::load(DEFAULT_CONFIG)?),
        None => Ok(QuillConfig::default()),
    }
}

fn gateway() -> Result<Arc<dyn ChatGateway>, Box<dyn std::error::Error>> {
    Ok(Arc::new(ProviderGateway::from_env(Arc::new(
        TracingUsageSink,
    ))?))
}

fn build_judge(
    gateway: Arc<dyn ChatGateway>,
    config: &QuillConfig,
    cache: &CacheArgs,
) -> Result<Judge, Box<dyn std::error::Error>> {
    let judge = Judge::new(gateway, config.rubric.clone(), config.judge.clone())?;
    if cache.no_cache {
        return Ok(judge);
    }
    let path = cache
        .cache
        .clone()
        .unwrap_or_else(SqliteJudgmentCache::default_path);
    Ok(judge.with_cache(Arc::new(SqliteJudgmentCache::new(path)?)))
}

/// CLI models win over config models; at least one is required.
fn resolve_models(
    cli: Option<Vec<String>>,
    from_config: Vec<ModelSpec>,
    role: &str,
) -> Result<Vec<ModelSpec>, Box<dyn std::error::Error>> {
    let specs: Vec<ModelSpec> = match cli {
        Some(models) => models
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .map(ModelSpec::from_model)
            .collect(),
        None => from_config,
    };
    if specs.is_empty() {
        return Err(format!("at least one {role} is required (--{role}s or [[{role}s]])").into());
    }
    let mut ids = BTreeSet::new();
    for spec in &specs {
        if !ids.insert(spec.id.as_str()) {
            return Err(format!("duplicate {role}: {}", spec.id).into());
        }
    }
    Ok(specs)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let mut json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    json.push('\n');
    std::fs::write(path, json)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    println!("{json}");
    Ok(())
}
