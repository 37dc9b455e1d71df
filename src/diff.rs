//! Line diffs between flywheel iterations.
//!
//! Myers shortest-edit-script over lines, kept as an explicit trace table
//! (one frontier per edit distance) and walked back iteratively. The edit
//! script is grouped into context-padded hunks and rendered in unified
//! format. `apply` reverses the rendering so a stored diff can be checked
//! against the texts it came from.

use std::fmt::Write as _;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Equal,
    Delete,
    Insert,
}

/// One step of an edit script.
///
/// `old_index` / `new_index` are 0-based. For a `Delete` the new index is the
/// number of new lines consumed so far; for an `Insert` the old index is the
/// number of old lines consumed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edit {
    pub kind: EditKind,
    pub old_index: usize,
    pub new_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Context,
    Added,
    Removed,
}

impl LineTag {
    fn prefix(self) -> char {
        match self {
            LineTag::Context => ' ',
            LineTag::Added => '+',
            LineTag::Removed => '-',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub tag: LineTag,
    /// Line content without its terminator.
    pub text: String,
    /// False only for a final line with no trailing newline.
    pub newline: bool,
}

/// A context-padded region of changes.
///
/// Starts are 1-based as rendered; a zero-length side carries the number of
/// the line preceding the change (0 at the top of the file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub context: usize,
    pub old_label: String,
    pub new_label: String,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context: 3,
            old_label: "a".to_string(),
            new_label: "b".to_string(),
        }
    }
}

impl DiffOptions {
    pub fn labels(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.old_label = old.into();
        self.new_label = new.into();
        self
    }

    pub fn context(mut self, context: usize) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DiffStat {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("malformed hunk header: {0}")]
    MalformedHeader(String),
    #[error("malformed diff line: {0:?}")]
    MalformedLine(String),
    #[error("hunk starting at old line {0} is out of range or overlaps a previous hunk")]
    OutOfRange(usize),
    #[error("old line {line} does not match diff: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("hunk body does not match header {0}")]
    HunkLength(String),
}

// =============================================================================
// Edit script
// =============================================================================

/// Minimal edit script turning `old` into `new`.
///
/// Within each contiguous change run, deletions precede insertions.
pub fn edit_script<T: PartialEq>(old: &[T], new: &[T]) -> Vec<Edit> {
    let trace = shortest_edit_trace(old, new);
    let mut edits = backtrack(&trace, old.len(), new.len());
    removals_first(&mut edits);
    edits
}

/// Forward Myers pass.
///
/// `trace[d]` is the frontier after `d` edits, holding only the diagonals
/// reachable at that distance: `k` in `-d..=d` with the parity of `d`, stored
/// at `(k + d) / 2`. The layer that reaches the end is never read by the
/// backtrack and is not stored, so the edit distance is `trace.len()`.
fn shortest_edit_trace<T: PartialEq>(old: &[T], new: &[T]) -> Vec<Vec<usize>> {
    let n = old.len() as isize;
    let m = new.len() as isize;
    let max = n + m;
    let offset = max + 1;
    let mut v = vec![0usize; (2 * offset + 1) as usize];
    let mut trace = Vec::new();

    for d in 0..=max {
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            // Move down (insert) whenever that lands at least as far as moving
            // right: v[k + 1] >= v[k - 1] + 1.
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1] as isize
            } else {
                v[idx - 1] as isize + 1
            };
            let mut y = x - k;
            while x < n && y < m && old[x as usize] == new[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x as usize;
            if x >= n && y >= m {
                return trace;
            }
            k += 2;
        }
        trace.push(
            (0..=d)
                .map(|i| v[(2 * i - d + offset) as usize])
                .collect(),
        );
    }
    trace
}

fn backtrack(trace: &[Vec<usize>], n: usize, m: usize) -> Vec<Edit> {
    let mut edits = Vec::with_capacity(n + m);
    let mut x = n as isize;
    let mut y = m as isize;

    for d in (1..=trace.len()).rev() {
        let layer = &trace[d - 1];
        let d = d as isize;
        let at = |k: isize| layer[((k + d - 1) / 2) as usize] as isize;
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            edits.push(Edit {
                kind: EditKind::Equal,
                old_index: x as usize,
                new_index: y as usize,
            });
        }

        if x == prev_x {
            edits.push(Edit {
                kind: EditKind::Insert,
                old_index: x as usize,
                new_index: prev_y as usize,
            });
        } else {
            edits.push(Edit {
                kind: EditKind::Delete,
                old_index: prev_x as usize,
                new_index: y as usize,
            });
        }

        x = prev_x;
        y = prev_y;
    }

    // Leading snake from the origin.
    while x > 0 && y > 0 {
        x -= 1;
        y -= 1;
        edits.push(Edit {
            kind: EditKind::Equal,
            old_index: x as usize,
            new_index: y as usize,
        });
    }

    edits.reverse();
    edits
}

fn removals_first(edits: &mut [Edit]) {
    let mut i = 0;
    while i < edits.len() {
        if edits[i].kind == EditKind::Equal {
            i += 1;
            continue;
        }
        let start = i;
        while i < edits.len() && edits[i].kind != EditKind::Equal {
            i += 1;
        }

        let run = &mut edits[start..i];
        let old0 = run[0].old_index;
        let new0 = run[0].new_index;
        let removed = run.iter().filter(|e| e.kind == EditKind::Delete).count();

        for (t, edit) in run.iter_mut().enumerate() {
            *edit = if t < removed {
                Edit {
                    kind: EditKind::Delete,
                    old_index: old0 + t,
                    new_index: new0,
                }
            } else {
                Edit {
                    kind: EditKind::Insert,
                    old_index: old0 + removed,
                    new_index: new0 + (t - removed),
                }
            };
        }
    }
}

// =============================================================================
// Hunks and rendering
// =============================================================================

fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn diff_line(tag: LineTag, raw: &str) -> DiffLine {
    DiffLine {
        tag,
        text: raw.strip_suffix('\n').unwrap_or(raw).to_string(),
        newline: raw.ends_with('\n'),
    }
}

pub fn stat(old: &str, new: &str) -> DiffStat {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    edit_script(&old_lines, &new_lines)
        .iter()
        .fold(DiffStat::default(), |mut acc, e| {
            match e.kind {
                EditKind::Insert => acc.added += 1,
                EditKind::Delete => acc.removed += 1,
                EditKind::Equal => {}
            }
            acc
        })
}

/// Group the line edit script of `old` → `new` into hunks.
///
/// Change runs separated by at most `2 * context` unchanged lines share a
/// hunk, since their padded ranges would overlap or touch.
pub fn hunks(old: &str, new: &str, context: usize) -> Vec<DiffHunk> {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let edits = edit_script(&old_lines, &new_lines);

    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < edits.len() {
        if edits[i].kind == EditKind::Equal {
            i += 1;
            continue;
        }
        let start = i;
        while i < edits.len() && edits[i].kind != EditKind::Equal {
            i += 1;
        }
        match runs.last_mut() {
            Some(last) if start - last.1 <= 2 * context => last.1 = i,
            _ => runs.push((start, i)),
        }
    }

    runs.into_iter()
        .map(|(start, end)| {
            let lo = start.saturating_sub(context);
            let hi = (end + context).min(edits.len());
            let span = &edits[lo..hi];

            let mut lines = Vec::with_capacity(span.len());
            let mut old_len = 0;
            let mut new_len = 0;
            for edit in span {
                match edit.kind {
                    EditKind::Equal => {
                        old_len += 1;
                        new_len += 1;
                        lines.push(diff_line(LineTag::Context, old_lines[edit.old_index]));
                    }
                    EditKind::Delete => {
                        old_len += 1;
                        lines.push(diff_line(LineTag::Removed, old_lines[edit.old_index]));
                    }
                    EditKind::Insert => {
                        new_len += 1;
                        lines.push(diff_line(LineTag::Added, new_lines[edit.new_index]));
                    }
                }
            }

            let old0 = span[0].old_index;
            let new0 = span[0].new_index;
            DiffHunk {
                old_start: if old_len == 0 { old0 } else { old0 + 1 },
                old_len,
                new_start: if new_len == 0 { new0 } else { new0 + 1 },
                new_len,
                lines,
            }
        })
        .collect()
}

/// Unified diff of `old` → `new`. Empty when the texts are identical.
pub fn unified_diff(old: &str, new: &str, opts: &DiffOptions) -> String {
    let hunks = hunks(old, new, opts.context);
    if hunks.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let _ = writeln!(out, "--- {}", opts.old_label);
    let _ = writeln!(out, "+++ {}", opts.new_label);
    for hunk in &hunks {
        let _ = writeln!(
            out,
            "@@ -{},{} +{},{} @@",
            hunk.old_start, hunk.old_len, hunk.new_start, hunk.new_len
        );
        for line in &hunk.lines {
            out.push(line.tag.prefix());
            out.push_str(&line.text);
            out.push('\n');
            if !line.newline {
                out.push_str("\\ No newline at end of file\n");
            }
        }
    }
    out
}

// =============================================================================
// Apply
// =============================================================================

fn parse_range(raw: &str, sign: char) -> Option<(usize, usize)> {
    let raw = raw.strip_prefix(sign)?;
    match raw.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((raw.parse().ok()?, 1)),
    }
}

fn parse_header(line: &str) -> Result<(usize, usize, usize, usize), DiffError> {
    let malformed = || DiffError::MalformedHeader(line.to_string());
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(malformed)?;
    let (old, new) = inner.split_once(' ').ok_or_else(malformed)?;
    let (old_start, old_len) = parse_range(old, '-').ok_or_else(malformed)?;
    let (new_start, new_len) = parse_range(new, '+').ok_or_else(malformed)?;
    if (old_len > 0 && old_start == 0) || (new_len > 0 && new_start == 0) {
        return Err(malformed());
    }
    Ok((old_start, old_len, new_start, new_len))
}

/// Apply a unified diff produced by [`unified_diff`] to `old`.
pub fn apply(old: &str, diff: &str) -> Result<String, DiffError> {
    let old_lines = split_lines(old);
    let mut out = String::with_capacity(old.len() + diff.len());
    let mut cursor = 0usize;

    let mut lines = diff
        .split_inclusive('\n')
        .map(|l| l.strip_suffix('\n').unwrap_or(l))
        .skip_while(|l| !l.starts_with("@@"))
        .peekable();

    while let Some(header) = lines.next() {
        let (old_start, old_len, _, new_len) = parse_header(header)?;
        let start0 = if old_len == 0 { old_start } else { old_start - 1 };
        if start0 < cursor || start0 > old_lines.len() {
            return Err(DiffError::OutOfRange(old_start));
        }
        for line in &old_lines[cursor..start0] {
            out.push_str(line);
        }
        cursor = start0;

        let mut old_seen = 0;
        let mut new_seen = 0;
        let mut wrote_last = false;

        while let Some(line) = lines.next_if(|l| !l.starts_with("@@")) {
            let mut chars = line.chars();
            let marker = chars.next();
            let text = chars.as_str();
            match marker {
                Some(' ') | Some('-') => {
                    let found = old_lines.get(cursor).copied().unwrap_or("");
                    let found = found.strip_suffix('\n').unwrap_or(found);
                    if cursor >= old_lines.len() || found != text {
                        return Err(DiffError::ContextMismatch {
                            line: cursor + 1,
                            expected: text.to_string(),
                            found: found.to_string(),
                        });
                    }
                    cursor += 1;
                    old_seen += 1;
                    if marker == Some(' ') {
                        out.push_str(text);
                        out.push('\n');
                        new_seen += 1;
                        wrote_last = true;
                    } else {
                        wrote_last = false;
                    }
                }
                Some('+') => {
                    out.push_str(text);
                    out.push('\n');
                    new_seen += 1;
                    wrote_last = true;
                }
                Some('\\') => {
                    if wrote_last {
                        out.pop();
                    }
                }
                _ => return Err(DiffError::MalformedLine(line.to_string())),
            }
        }

        if old_seen != old_len || new_seen != new_len {
            return Err(DiffError::HunkLength(header.to_string()));
        }
    }

    for line in &old_lines[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(old: &str, new: &str) -> String {
        unified_diff(old, new, &DiffOptions::default())
    }

    #[test]
    fn identical_texts_render_empty() {
        assert_eq!(render("a\nb\n", "a\nb\n"), "");
        assert_eq!(render("", ""), "");
    }

    #[test]
    fn single_replacement() {
        assert_eq!(
            render("a\nb\nc\n", "a\nx\nc\n"),
            "--- a\n+++ b\n@@ -1,3 +1,3 @@\n a\n-b\n+x\n c\n"
        );
    }

    #[test]
    fn removals_precede_additions() {
        assert_eq!(
            render("a\nb\n", "c\nd\n"),
            "--- a\n+++ b\n@@ -1,2 +1,2 @@\n-a\n-b\n+c\n+d\n"
        );
    }

    #[test]
    fn zero_length_side_uses_preceding_line() {
        assert_eq!(render("", "a\n"), "--- a\n+++ b\n@@ -0,0 +1,1 @@\n+a\n");
        assert_eq!(render("a\n", ""), "--- a\n+++ b\n@@ -1,1 +0,0 @@\n-a\n");

        let hunks = hunks("a\nb\n", "a\nb\nc\n", 0);
        assert_eq!(hunks.len(), 1);
        assert_eq!((hunks[0].old_start, hunks[0].old_len), (2, 0));
        assert_eq!((hunks[0].new_start, hunks[0].new_len), (3, 1));
    }

    #[test]
    fn missing_final_newline_is_marked() {
        assert_eq!(
            render("a\nb", "a\nc"),
            "--- a\n+++ b\n@@ -1,2 +1,2 @@\n a\n-b\n\\ No newline at end of file\n+c\n\\ No newline at end of file\n"
        );
        assert_eq!(
            render("a\n", "a"),
            "--- a\n+++ b\n@@ -1,1 +1,1 @@\n-a\n+a\n\\ No newline at end of file\n"
        );
    }

    #[test]
    fn nearby_changes_share_a_hunk() {
        let old: String = (1..=10).map(|i| format!("{i}\n")).collect();

        // Lines 2 and 9 changed: six unchanged lines between them.
        let near = old.replace("2\n", "two\n").replace("9\n", "nine\n");
        assert_eq!(hunks(&old, &near, 3).len(), 1);

        // Lines 2 and 10 changed: seven unchanged lines between them.
        let far = old.replace("2\n", "two\n").replace("10\n", "ten\n");
        let split = hunks(&old, &far, 3);
        assert_eq!(split.len(), 2);
        assert_eq!((split[0].old_start, split[0].old_len), (1, 5));
        assert_eq!((split[1].old_start, split[1].old_len), (7, 4));
    }

    #[test]
    fn trace_keeps_one_slot_per_reachable_diagonal() {
        let old = ["a", "b", "c"];
        let new = ["x", "y"];
        let trace = shortest_edit_trace(&old, &new);
        assert_eq!(trace.len(), 5);
        for (d, layer) in trace.iter().enumerate() {
            assert_eq!(layer.len(), d + 1);
        }
        assert!(shortest_edit_trace(&old, &old).is_empty());
    }

    #[test]
    fn full_rewrite_of_a_long_text() {
        let old: String = (0..1000).map(|i| format!("old {i}\n")).collect();
        let new: String = (0..1000).map(|i| format!("new {i}\n")).collect();
        let s = stat(&old, &new);
        assert_eq!((s.removed, s.added), (1000, 1000));
        assert_eq!(apply(&old, &render(&old, &new)).unwrap(), new);
    }

    #[test]
    fn edit_script_is_minimal() {
        let old = ["a", "b", "c", "a", "b", "b", "a"];
        let new = ["c", "b", "a", "b", "a", "c"];
        let edits = edit_script(&old, &new);
        let changes = edits.iter().filter(|e| e.kind != EditKind::Equal).count();
        assert_eq!(changes, 5);
    }

    #[test]
    fn apply_reproduces_new_text() {
        let pairs = [
            ("a\nb\nc\n", "a\nx\nc\n"),
            ("", "hello\nworld"),
            ("one\ntwo\nthree", "one\ntwo\nthree\n"),
            ("x\n\ny\n", "\nx\ny\n\n"),
        ];
        for (old, new) in pairs {
            let diff = unified_diff(old, new, &DiffOptions::default().context(1));
            assert_eq!(apply(old, &diff).unwrap(), new, "diff was:\n{diff}");
        }
    }

    #[test]
    fn apply_rejects_mismatched_context() {
        let diff = render("a\nb\nc\n", "a\nx\nc\n");
        let err = apply("a\nB\nc\n", &diff).unwrap_err();
        assert!(matches!(err, DiffError::ContextMismatch { line: 2, .. }));
    }

    #[test]
    fn stat_counts_lines() {
        assert_eq!(
            stat("a\nb\nc\n", "a\nx\ny\n"),
            DiffStat {
                added: 2,
                removed: 2
            }
        );
    }
}
