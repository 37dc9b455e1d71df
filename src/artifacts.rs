//! On-disk layout for bench and flywheel runs.
//!
//! ```text
//! <out>/
//!   bench-session.json | flywheel-session.json
//!   failures.json
//!   judgments/<subject>/<evaluator>.json
//!   posts/<writer>.md                      (bench)
//!   iterations/iteration-NN.md             (flywheel)
//!   diffs/iteration-NN-to-MM.diff          (flywheel, when enabled)
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::diff::{self, DiffOptions};
use crate::flywheel::{iteration_label, FlywheelSession};
use crate::judge::{EvaluationFailure, JudgmentResult};
use crate::pipeline::BenchSession;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Replaces anything outside `[A-Za-z0-9._-]` so ids are safe as file names.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_bytes(&self, rel: &Path, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.root.join(rel);
        let io_err = |source| ArtifactError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&path, bytes).map_err(io_err)?;
        debug!(path = %path.display(), bytes = bytes.len(), "artifact written");
        Ok(path)
    }

    /// Pretty JSON with a trailing newline.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        rel: impl AsRef<Path>,
        value: &T,
    ) -> Result<PathBuf, ArtifactError> {
        let rel = rel.as_ref();
        let mut json = serde_json::to_string_pretty(value).map_err(|source| ArtifactError::Json {
            path: self.root.join(rel),
            source,
        })?;
        json.push('\n');
        self.write_bytes(rel, json.as_bytes())
    }

    pub fn write_text(&self, rel: impl AsRef<Path>, text: &str) -> Result<PathBuf, ArtifactError> {
        self.write_bytes(rel.as_ref(), text.as_bytes())
    }

    pub fn write_judgment(&self, judgment: &JudgmentResult) -> Result<PathBuf, ArtifactError> {
        let rel = Path::new("judgments")
            .join(sanitize_name(&judgment.subject_id))
            .join(format!("{}.json", sanitize_name(&judgment.evaluator_id)));
        self.write_json(rel, judgment)
    }

    pub fn write_failures(&self, failures: &[EvaluationFailure]) -> Result<PathBuf, ArtifactError> {
        self.write_json("failures.json", failures)
    }

    /// Session summary, one markdown file per post, every judgment and the
    /// failure list. Returns the session file path.
    pub fn write_bench_session(&self, session: &BenchSession) -> Result<PathBuf, ArtifactError> {
        for gen in &session.generations {
            self.write_text(
                Path::new("posts").join(format!("{}.md", sanitize_name(&gen.writer_id))),
                &with_trailing_newline(&gen.text),
            )?;
        }
        for judgment in &session.judgments {
            self.write_judgment(judgment)?;
        }
        self.write_failures(&session.failures)?;
        self.write_json("bench-session.json", session)
    }

    /// Session summary, one markdown file per iteration, every judgment, the
    /// failure list across iterations and, when `diff` is set, one diff per
    /// consecutive iteration pair. Returns the session file path.
    pub fn write_flywheel_session(
        &self,
        session: &FlywheelSession,
        diff: Option<&DiffOptions>,
    ) -> Result<PathBuf, ArtifactError> {
        for iteration in &session.iterations {
            self.write_text(
                Path::new("iterations").join(format!("{}.md", iteration.label())),
                &with_trailing_newline(&iteration.candidate_text),
            )?;
            for judgment in &iteration.judgments {
                self.write_judgment(judgment)?;
            }
        }

        let failures: Vec<&EvaluationFailure> = session
            .iterations
            .iter()
            .flat_map(|it| it.failures.iter())
            .collect();
        self.write_json("failures.json", &failures)?;

        if let Some(opts) = diff {
            for pair in session.iterations.windows(2) {
                let (old, new) = (&pair[0], &pair[1]);
                let opts = opts
                    .clone()
                    .labels(iteration_label(old.index), iteration_label(new.index));
                let rendered = diff::unified_diff(&old.candidate_text, &new.candidate_text, &opts);
                self.write_text(
                    Path::new("diffs").join(format!(
                        "iteration-{:02}-to-{:02}.diff",
                        old.index, new.index
                    )),
                    &rendered,
                )?;
            }
        }

        self.write_json("flywheel-session.json", session)
    }
}

fn with_trailing_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}
