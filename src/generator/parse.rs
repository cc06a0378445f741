//! Strict parsing of generator output into [`CandidateFix`].
//!
//! Anything that does not match the schema is a
//! [`GenerationError::Malformed`] carrying a message precise enough to feed
//! back in a corrective prompt.

use serde::Deserialize;

use crate::candidate::{CandidateFix, FileChange, FileOpKind, FileOperation, RiskTier, CANDIDATE_SCHEMA_VERSION};
use crate::error::GenerationError;

#[derive(Debug, Deserialize)]
struct RawCandidate {
    schema_version: Option<u32>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    risk: Option<String>,
    #[serde(default)]
    operations: Vec<RawOperation>,
}

#[derive(Debug, Deserialize)]
struct RawOperation {
    #[serde(default)]
    path: String,
    #[serde(default)]
    kind: String,
    content: Option<String>,
    diff: Option<String>,
}

/// Finds the JSON object in free-form model output.
///
/// Prefers a fenced ```json block, then falls back to the outermost braces.
pub(crate) fn extract_json(output: &str) -> Option<&str> {
    if let Some(start) = output.find("```json") {
        let json_start = start + 7;
        if let Some(end) = output[json_start..].find("```") {
            return Some(output[json_start..json_start + end].trim());
        }
    }

    let json_start = output.find('{')?;
    let json_end = output.rfind('}')?;
    if json_start < json_end {
        Some(&output[json_start..=json_end])
    } else {
        None
    }
}

fn malformed(msg: impl Into<String>) -> GenerationError {
    GenerationError::Malformed(msg.into())
}

fn parse_operation(idx: usize, raw: RawOperation) -> Result<FileOperation, GenerationError> {
    let at = |msg: &str| malformed(format!("operations[{}]: {}", idx, msg));

    if raw.path.trim().is_empty() {
        return Err(at("missing path"));
    }
    let kind = match raw.kind.trim().to_lowercase().as_str() {
        "create" => FileOpKind::Create,
        "modify" => FileOpKind::Modify,
        "delete" => FileOpKind::Delete,
        "" => return Err(at("missing kind")),
        other => return Err(at(&format!("unknown kind '{}'", other))),
    };

    let change = match (kind, raw.content, raw.diff) {
        (FileOpKind::Delete, None, None) => None,
        (FileOpKind::Delete, _, _) => return Err(at("delete takes no content or diff")),
        (FileOpKind::Create, Some(content), None) => Some(FileChange::Content(content)),
        (FileOpKind::Create, _, Some(_)) => return Err(at("create requires content, not a diff")),
        (FileOpKind::Create, None, None) => return Err(at("create requires content")),
        (FileOpKind::Modify, Some(content), None) => Some(FileChange::Content(content)),
        (FileOpKind::Modify, None, Some(diff)) => Some(FileChange::Diff(diff)),
        (FileOpKind::Modify, Some(_), Some(_)) => {
            return Err(at("modify takes either content or diff, not both"))
        }
        (FileOpKind::Modify, None, None) => return Err(at("modify requires content or diff")),
    };

    Ok(FileOperation {
        path: raw.path.trim().to_string(),
        kind,
        change,
    })
}

/// Parses one generator reply into a candidate for `request_id`.
pub fn parse_candidate(output: &str, request_id: &str) -> Result<CandidateFix, GenerationError> {
    let json = extract_json(output).ok_or_else(|| malformed("no JSON object found in output"))?;
    let raw: RawCandidate =
        serde_json::from_str(json).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

    match raw.schema_version {
        None => return Err(malformed("missing schema_version")),
        Some(v) if v != CANDIDATE_SCHEMA_VERSION => {
            return Err(malformed(format!(
                "unsupported schema_version {} (expected {})",
                v, CANDIDATE_SCHEMA_VERSION
            )))
        }
        Some(_) => {}
    }
    if raw.title.trim().is_empty() {
        return Err(malformed("missing title"));
    }
    let risk: RiskTier = raw
        .risk
        .as_deref()
        .ok_or_else(|| malformed("missing risk"))?
        .parse()
        .map_err(malformed)?;
    if raw.operations.is_empty() {
        return Err(malformed("operations must not be empty"));
    }

    let operations = raw
        .operations
        .into_iter()
        .enumerate()
        .map(|(idx, op)| parse_operation(idx, op))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CandidateFix::new(
        request_id,
        raw.title.trim(),
        raw.description,
        risk,
        operations,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"Here is the fix:
```json
{
  "schema_version": 1,
  "title": "Fix off-by-one",
  "description": "n - 1 should be n",
  "risk": "low",
  "operations": [
    {"path": "src/discount.py", "kind": "modify", "content": "def d(n):\n    return n\n"},
    {"path": "old.py", "kind": "delete"}
  ]
}
```"#;

    #[test]
    fn extract_json_finds_code_block() {
        let output = "text ```json\n{\"a\": 1}\n``` more";
        assert_eq!(extract_json(output), Some("{\"a\": 1}"));
    }

    #[test]
    fn extract_json_finds_raw_json() {
        let output = "prefix {\"a\": 1} suffix";
        assert_eq!(extract_json(output), Some("{\"a\": 1}"));
        assert_eq!(extract_json("no braces here"), None);
    }

    #[test]
    fn parses_valid_candidate() {
        let c = parse_candidate(VALID, "req-1").unwrap();
        assert_eq!(c.request_id, "req-1");
        assert_eq!(c.title, "Fix off-by-one");
        assert_eq!(c.risk, RiskTier::Low);
        assert_eq!(c.operations.len(), 2);
        assert_eq!(c.operations[1].kind, FileOpKind::Delete);
    }

    fn error_of(json: &str) -> String {
        match parse_candidate(json, "r") {
            Err(GenerationError::Malformed(msg)) => msg,
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn rejects_schema_violations() {
        assert!(error_of("I cannot help").contains("no JSON"));
        assert!(error_of("{\"title\": \"x\"}").contains("schema_version"));
        assert!(error_of(r#"{"schema_version": 2, "title": "x", "risk": "low"}"#).contains("unsupported"));
        assert!(error_of(r#"{"schema_version": 1, "title": "x", "risk": "extreme", "operations": []}"#)
            .contains("unknown risk tier"));
        assert!(error_of(r#"{"schema_version": 1, "title": "x", "risk": "low", "operations": []}"#)
            .contains("must not be empty"));
        assert!(error_of(
            r#"{"schema_version": 1, "title": "x", "risk": "low", "operations": [{"path": "a", "kind": "create"}]}"#
        )
        .contains("operations[0]: create requires content"));
        assert!(error_of(
            r#"{"schema_version": 1, "title": "x", "risk": "low", "operations": [{"path": "a", "kind": "modify", "content": "", "diff": ""}]}"#
        )
        .contains("not both"));
    }

    #[test]
    fn diff_operations_are_kept_as_diffs() {
        let json = r#"{"schema_version": 1, "title": "x", "risk": "medium",
            "operations": [{"path": "a.py", "kind": "modify", "diff": "@@ -1 +1 @@\n-a\n+b\n"}]}"#;
        let c = parse_candidate(json, "r").unwrap();
        assert!(matches!(c.operations[0].change, Some(FileChange::Diff(_))));
    }
}
