//! Prompt templates for judging, repair, writing and refinement.
//!
//! Rendering only. Callers decide which model sees which prompt.

use std::collections::BTreeMap;
use std::fmt::{Display, Write as _};

use crate::gateway::Message;
use crate::judge::{JudgmentResult, Subject};
use crate::rubric::{Criterion, RubricWeights};

// =============================================================================
// Prompt instances
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// blake3 of the template text; part of every judgment cache key.
    pub fn hash(&self) -> String {
        blake3::hash(format!("{}\n{}", self.system, self.user).as_bytes())
            .to_hex()
            .to_string()
    }
}

// =============================================================================
// Judge
// =============================================================================

pub const JUDGE_PROMPT: PromptTemplate = PromptTemplate {
    slug: "judge_v1",
    system: r#"You are a demanding editor scoring a document against a fixed rubric. Score every criterion from 1 (very poor) to 100 (exceptional) and give one or two sentences of concrete, actionable feedback per criterion.

Rubric:
{rubric}

Output only valid JSON with exactly this shape, one entry per rubric criterion, no prose before or after:
{"scores": [{"criterion": "<key>", "score": <1-100>, "feedback": "<text>"}], "overallScore": <1-100>}"#,
    user: r#"<document title="{title}">
{document}
</document>

json:"#,
};

fn render_rubric(rubric: &RubricWeights) -> String {
    let total = rubric.total_weight();
    let mut out = String::new();
    for (criterion, weight) in rubric.iter() {
        let _ = writeln!(
            out,
            "- {} ({:.0}%): {}",
            criterion.key(),
            weight / total * 100.0,
            criterion.description()
        );
    }
    out.trim_end().to_string()
}

pub fn judge_prompt(rubric: &RubricWeights, subject: &Subject) -> PromptInstance {
    PromptInstance {
        template_slug: JUDGE_PROMPT.slug.to_string(),
        system: JUDGE_PROMPT
            .system
            .replace("{rubric}", &render_rubric(rubric))
            .trim()
            .to_string(),
        user: JUDGE_PROMPT
            .user
            .replace("{title}", &escape_xml_chars(&subject.name))
            .replace("{document}", &escape_xml_chars(subject.text.trim())),
    }
}

/// Follow-up sent after an invalid judge response.
pub fn repair_instruction(error: &impl Display) -> String {
    format!(
        "Your previous response could not be used: {error}.\n\
         Reply again with only the JSON object in the required shape: every rubric criterion exactly once, \
         numeric scores between 1 and 100, a feedback string for each, and a numeric overallScore. \
         No markdown fences, no commentary."
    )
}

// =============================================================================
// Writers
// =============================================================================

pub const WRITER_SYSTEM: &str = "You are a skilled writer. Write the requested document in Markdown. \
Return only the document itself, with no preamble or closing remarks.";

pub fn writer_prompt(system: Option<&str>, prompt: &str) -> PromptInstance {
    PromptInstance {
        template_slug: "writer_v1".to_string(),
        system: system.unwrap_or(WRITER_SYSTEM).trim().to_string(),
        user: prompt.trim().to_string(),
    }
}

pub const REFINE_SYSTEM: &str = "You are revising a document using editor feedback. \
Keep its subject, facts and voice. Return only the full revised document, with no preamble or notes.";

/// Feedback block summarising one evaluated iteration.
///
/// Lists every evaluator's scores with its non-empty feedback, the computed
/// overall, and the criteria to prioritise (lowest average first).
pub fn refinement_feedback(
    judgments: &[JudgmentResult],
    averages: &BTreeMap<Criterion, f64>,
    computed_overall: f64,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Current overall score: {computed_overall:.1}/100");

    for judgment in judgments {
        let _ = writeln!(out, "\n## {}", judgment.evaluator_name);
        for score in &judgment.scores {
            if score.feedback.is_empty() {
                let _ = writeln!(out, "- {}: {:.0}", score.criterion.label(), score.score);
            } else {
                let _ = writeln!(
                    out,
                    "- {}: {:.0} - {}",
                    score.criterion.label(),
                    score.score,
                    score.feedback
                );
            }
        }
    }

    let mut ordered: Vec<(Criterion, f64)> = averages.iter().map(|(c, v)| (*c, *v)).collect();
    ordered.sort_by(|a, b| a.1.total_cmp(&b.1));
    if !ordered.is_empty() {
        let focus: Vec<String> = ordered
            .iter()
            .map(|(c, v)| format!("{} ({v:.1})", c.label()))
            .collect();
        let _ = writeln!(out, "\nPriority, weakest first: {}", focus.join(", "));
    }

    out.push_str(
        "\nRevise the document to raise the lower-scoring criteria while preserving what already scores well.",
    );
    out
}

pub fn refinement_prompt(
    current_text: &str,
    judgments: &[JudgmentResult],
    averages: &BTreeMap<Criterion, f64>,
    computed_overall: f64,
) -> PromptInstance {
    let feedback = refinement_feedback(judgments, averages, computed_overall);
    PromptInstance {
        template_slug: "refine_v1".to_string(),
        system: REFINE_SYSTEM.to_string(),
        user: format!(
            "<document>\n{}\n</document>\n\n<feedback>\n{}\n</feedback>",
            current_text.trim(),
            feedback.trim()
        ),
    }
}

// =============================================================================
// TESTS
// =============================================================================
