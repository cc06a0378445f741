//! Unified diffs: applying candidate patches and rendering approver views.

const CONTEXT_LINES: usize = 3;

/// Above this many LCS cells the renderer falls back to a whole-file hunk.
const MAX_LCS_CELLS: usize = 4_000_000;

/// A single line in a diff hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

/// Parses the hunks of a unified diff. File header lines are optional.
pub fn parse_hunks(diff: &str) -> Result<Vec<DiffHunk>, String> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut hunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].starts_with("@@ ") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        } else {
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err("no hunks found in diff".to_string());
    }
    Ok(hunks)
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(format!("invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];
        if line.starts_with("@@ ") || line.starts_with("diff ") {
            break;
        }

        if let Some(rest) = line.strip_prefix('+') {
            if !line.starts_with("+++ ") {
                diff_lines.push(DiffLine::Add(rest.to_string()));
            }
        } else if let Some(rest) = line.strip_prefix('-') {
            if !line.starts_with("--- ") {
                diff_lines.push(DiffLine::Remove(rest.to_string()));
            }
        } else if let Some(rest) = line.strip_prefix(' ') {
            diff_lines.push(DiffLine::Context(rest.to_string()));
        } else if line.is_empty() {
            diff_lines.push(DiffLine::Context(String::new()));
        }
        // "\ No newline at end of file" and similar markers are ignored

        *idx += 1;
    }

    let removed = diff_lines
        .iter()
        .filter(|l| !matches!(l, DiffLine::Add(_)))
        .count();
    if removed != old_count {
        return Err(format!(
            "hunk '{}' declares {} original lines but contains {}",
            header, old_count, removed
        ));
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

fn parse_range(s: &str) -> Result<(usize, usize), String> {
    match s.split_once(',') {
        Some((start, count)) => {
            let start = start
                .parse()
                .map_err(|_| format!("invalid range start: {}", s))?;
            let count = count
                .parse()
                .map_err(|_| format!("invalid range count: {}", s))?;
            Ok((start, count))
        }
        None => {
            let start = s.parse().map_err(|_| format!("invalid line number: {}", s))?;
            Ok((start, 1))
        }
    }
}

/// Applies a unified diff to `original`.
///
/// Every context and removed line must match the original exactly; a diff
/// that does not apply cleanly is rejected rather than partially applied.
pub fn apply_unified_diff(original: &str, diff: &str) -> Result<String, String> {
    let mut hunks = parse_hunks(diff)?;
    hunks.sort_by_key(|h| h.old_start);

    let orig: Vec<&str> = original.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(orig.len());
    let mut cursor = 0usize;

    for hunk in &hunks {
        let start = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if start < cursor {
            return Err(format!("overlapping hunk at line {}", hunk.old_start));
        }
        if start > orig.len() {
            return Err(format!(
                "hunk starts at line {} but file has {} lines",
                hunk.old_start,
                orig.len()
            ));
        }

        out.extend(orig[cursor..start].iter().map(|s| s.to_string()));
        let mut pos = start;

        for line in &hunk.lines {
            match line {
                DiffLine::Context(expected) | DiffLine::Remove(expected) => {
                    match orig.get(pos) {
                        Some(actual) if actual == expected => {}
                        Some(actual) => {
                            return Err(format!(
                                "line {} does not match: expected '{}', found '{}'",
                                pos + 1,
                                expected,
                                actual
                            ))
                        }
                        None => return Err(format!("line {} is past end of file", pos + 1)),
                    }
                    if let DiffLine::Context(s) = line {
                        out.push(s.clone());
                    }
                    pos += 1;
                }
                DiffLine::Add(s) => out.push(s.clone()),
            }
        }
        cursor = pos;
    }

    out.extend(orig[cursor..].iter().map(|s| s.to_string()));

    let mut result = out.join("\n");
    let keep_trailing = original.ends_with('\n') || original.is_empty();
    if keep_trailing && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditOp {
    Equal,
    Delete,
    Insert,
}

#[derive(Debug, Clone, Copy)]
struct Edit<'a> {
    op: EditOp,
    text: &'a str,
    /// Old-file line index at this edit.
    old: usize,
    /// New-file line index at this edit.
    new: usize,
}

fn edit_script<'a>(a: &[&'a str], b: &[&'a str]) -> Vec<Edit<'a>> {
    let (n, m) = (a.len(), b.len());
    let mut edits = Vec::with_capacity(n + m);

    if (n + 1).saturating_mul(m + 1) > MAX_LCS_CELLS {
        edits.extend(a.iter().enumerate().map(|(i, t)| Edit {
            op: EditOp::Delete,
            text: t,
            old: i,
            new: 0,
        }));
        edits.extend(b.iter().enumerate().map(|(j, t)| Edit {
            op: EditOp::Insert,
            text: t,
            old: n,
            new: j,
        }));
        return edits;
    }

    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if a[i] == b[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            edits.push(Edit { op: EditOp::Equal, text: a[i], old: i, new: j });
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            edits.push(Edit { op: EditOp::Delete, text: a[i], old: i, new: j });
            i += 1;
        } else {
            edits.push(Edit { op: EditOp::Insert, text: b[j], old: i, new: j });
            j += 1;
        }
    }
    while i < n {
        edits.push(Edit { op: EditOp::Delete, text: a[i], old: i, new: j });
        i += 1;
    }
    while j < m {
        edits.push(Edit { op: EditOp::Insert, text: b[j], old: i, new: j });
        j += 1;
    }
    edits
}

/// Renders a unified diff between two versions of `path`.
///
/// `None` stands for "file does not exist". Returns an empty string when the
/// contents are identical.
pub fn render_unified_diff(path: &str, old: Option<&str>, new: Option<&str>) -> String {
    let a: Vec<&str> = old.unwrap_or("").lines().collect();
    let b: Vec<&str> = new.unwrap_or("").lines().collect();
    let edits = edit_script(&a, &b);

    let changes: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| e.op != EditOp::Equal)
        .map(|(i, _)| i)
        .collect();
    if changes.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    out.push_str(&match old {
        Some(_) => format!("--- a/{}\n", path),
        None => "--- /dev/null\n".to_string(),
    });
    out.push_str(&match new {
        Some(_) => format!("+++ b/{}\n", path),
        None => "+++ /dev/null\n".to_string(),
    });

    // Group changes whose context windows touch.
    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &c in &changes {
        let start = c.saturating_sub(CONTEXT_LINES);
        let end = (c + CONTEXT_LINES + 1).min(edits.len());
        match groups.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => groups.push((start, end)),
        }
    }

    for (start, end) in groups {
        let slice = &edits[start..end];
        let old_count = slice.iter().filter(|e| e.op != EditOp::Insert).count();
        let new_count = slice.iter().filter(|e| e.op != EditOp::Delete).count();
        let old_start = if old_count == 0 { slice[0].old } else { slice[0].old + 1 };
        let new_start = if new_count == 0 { slice[0].new } else { slice[0].new + 1 };

        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_count, new_start, new_count
        ));
        for edit in slice {
            let marker = match edit.op {
                EditOp::Equal => ' ',
                EditOp::Delete => '-',
                EditOp::Insert => '+',
            };
            out.push(marker);
            out.push_str(edit.text);
            out.push('\n');
        }
    }

    out
}
