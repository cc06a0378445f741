//! Prompt construction for candidate generation.

use crate::candidate::{CandidateFix, FileChange, CANDIDATE_SCHEMA_VERSION};
use crate::context::{truncate_chars, GenerationContext};
use crate::failure::FailureAnalysis;
use crate::request::RemediationRequest;

/// Output schema shown to the backend.
pub fn candidate_schema() -> String {
    format!(
        r#"Respond with exactly one JSON object and nothing else:

```json
{{
  "schema_version": {version},
  "title": "short summary of the fix",
  "description": "why this change fixes the problem",
  "risk": "low | medium | high",
  "operations": [
    {{ "path": "relative/path.ext", "kind": "create", "content": "full file content" }},
    {{ "path": "relative/path.ext", "kind": "modify", "content": "full new file content" }},
    {{ "path": "relative/path.ext", "kind": "modify", "diff": "unified diff against the current file" }},
    {{ "path": "relative/path.ext", "kind": "delete" }}
  ]
}}
```

Rules:
- paths are relative to the repository root
- "create" requires "content"; "modify" requires exactly one of "content" or "diff"; "delete" takes neither
- at least one operation
- only import packages listed in the dependency manifest or modules that exist in the repository"#,
        version = CANDIDATE_SCHEMA_VERSION
    )
}

/// The prompt every slot of a request receives.
pub fn initial_prompt(request: &RemediationRequest, context: &GenerationContext) -> String {
    let mut prompt = String::from("You are fixing a problem in an existing codebase.\n\n## Request\n\n");
    prompt.push_str(request.description.trim());
    prompt.push('\n');
    if let Some(severity) = request.severity {
        prompt.push_str(&format!("\nSeverity: {}\n", severity));
    }
    if let Some(category) = &request.category {
        prompt.push_str(&format!("Category: {}\n", category));
    }

    if !context.excerpts.is_empty() {
        prompt.push_str("\n## Relevant code\n");
        for excerpt in &context.excerpts {
            prompt.push_str(&format!(
                "\n### {} (from line {})\n```\n{}\n```\n",
                excerpt.path, excerpt.start_line, excerpt.content
            ));
        }
    }

    prompt.push_str("\n## Dependency manifest\n\n");
    prompt.push_str(&context.manifest.render());
    prompt.push('\n');

    if !context.examples.is_empty() {
        prompt.push_str("\n## Previously applied fixes in related files\n");
        for example in &context.examples {
            prompt.push_str(&format!("\n### {}\n```diff\n{}\n```\n", example.title, example.diff));
        }
    }

    prompt.push_str("\n## Output format\n\n");
    prompt.push_str(&candidate_schema());
    prompt.push('\n');
    prompt
}

/// Re-prompt after output failed to parse.
pub fn corrective_prompt(original: &str, error: &str, output: &str) -> String {
    format!(
        "{original}\n\n## Your previous answer was rejected\n\nError: {error}\n\nStart of your previous answer:\n```\n{excerpt}\n```\n\nAnswer again following the output format exactly.\n\n{schema}\n",
        original = original,
        error = error,
        excerpt = truncate_chars(output, 2000),
        schema = candidate_schema(),
    )
}

fn push_list(prompt: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    prompt.push_str(&format!("\n{}:\n", heading));
    for item in items {
        prompt.push_str(&format!("- {}\n", item));
    }
}

/// Prompt for another attempt after a candidate failed its tests.
///
/// `earlier` holds older failed attempts with their analyses, oldest first.
pub fn refix_prompt(
    request: &RemediationRequest,
    context: &GenerationContext,
    failed: &CandidateFix,
    analysis: &FailureAnalysis,
    earlier: &[(CandidateFix, FailureAnalysis)],
) -> String {
    let mut prompt = initial_prompt(request, context);

    prompt.push_str("\n## A previous fix failed the test suite\n\n");
    prompt.push_str(&format!("Title: {}\n", failed.title));
    if !failed.description.trim().is_empty() {
        prompt.push_str(&format!("Description: {}\n", failed.description.trim()));
    }
    for op in &failed.operations {
        prompt.push_str(&format!("\n### {} {}\n", op.kind, op.path));
        match &op.change {
            Some(FileChange::Content(text)) => {
                prompt.push_str(&format!("```\n{}\n```\n", truncate_chars(text, 4000)));
            }
            Some(FileChange::Diff(diff)) => {
                prompt.push_str(&format!("```diff\n{}\n```\n", truncate_chars(diff, 4000)));
            }
            None => {}
        }
    }

    push_list(&mut prompt, "Failed tests", &analysis.failed_tests);
    let categories: Vec<String> = analysis.categories.iter().map(|c| c.to_string()).collect();
    prompt.push_str(&format!("\nError types: {}\n", categories.join(", ")));
    prompt.push_str(&format!("Root cause: {}\n", analysis.root_cause));
    push_list(&mut prompt, "Error messages", &analysis.messages);

    if !earlier.is_empty() {
        prompt.push_str(&format!("\n## Earlier attempts ({}) - do not repeat these\n", earlier.len()));
        for (i, (candidate, analysis)) in earlier.iter().enumerate() {
            prompt.push_str(&format!(
                "\nAttempt {}: {}\n- Root cause: {}\n- Still failed\n",
                i + 1,
                candidate.title,
                analysis.root_cause
            ));
        }
    }

    prompt.push_str("\nFix the actual error shown above. Answer with a complete fix in the output format above.\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{FileOperation, RiskTier};
    use crate::context::Excerpt;
    use crate::request::Severity;

    #[test]
    fn initial_prompt_carries_request_and_context() {
        let request = RemediationRequest::new("fix off-by-one in discount calculation")
            .with_severity(Severity::High)
            .with_category("billing");
        let mut context = GenerationContext::default();
        context.excerpts.push(Excerpt {
            path: "src/discount.py".to_string(),
            start_line: 3,
            content: "return n - 1".to_string(),
            score: 1.0,
        });
        context.manifest.extend("requirements.txt", ["requests".to_string()]);

        let prompt = initial_prompt(&request, &context);
        assert!(prompt.contains("fix off-by-one in discount calculation"));
        assert!(prompt.contains("Category: billing"));
        assert!(prompt.contains("### src/discount.py (from line 3)"));
        assert!(prompt.contains("requests"));
        assert!(prompt.contains("\"schema_version\": 1"));
    }

    #[test]
    fn corrective_prompt_shows_error_and_output() {
        let prompt = corrective_prompt("ORIGINAL", "missing title", "{\"risk\": \"low\"}");
        assert!(prompt.starts_with("ORIGINAL"));
        assert!(prompt.contains("Error: missing title"));
        assert!(prompt.contains("{\"risk\": \"low\"}"));
        assert!(prompt.contains("Output format") || prompt.contains("schema_version"));
    }

    #[test]
    fn refix_prompt_carries_failure_and_history() {
        let request = RemediationRequest::new("fix off-by-one in discount calculation");
        let failed = CandidateFix::new(
            &request.id,
            "use inclusive range",
            "",
            RiskTier::Low,
            vec![FileOperation::modify("shop/pricing.py", "return total - rate\n")],
        );
        let analysis = FailureAnalysis::from_log(
            "E   NameError: name 'rate' is not defined\nFAILED tests/test_pricing.py::test_discount\n",
        );
        let older = CandidateFix::new(&request.id, "clamp the percentage", "", RiskTier::Low, vec![]);
        let older_analysis = FailureAnalysis::from_log("E   AssertionError: assert 9 == 10\n");

        let prompt = refix_prompt(
            &request,
            &GenerationContext::default(),
            &failed,
            &analysis,
            &[(older, older_analysis)],
        );

        assert!(prompt.contains("fix off-by-one in discount calculation"));
        assert!(prompt.contains("### modify shop/pricing.py"));
        assert!(prompt.contains("- tests/test_pricing.py::test_discount"));
        assert!(prompt.contains("Root cause: Variable or function not defined"));
        assert!(prompt.contains("NameError: name 'rate' is not defined"));
        assert!(prompt.contains("Attempt 1: clamp the percentage"));
        assert!(prompt.contains("do not repeat these"));
        assert!(prompt.contains("\"schema_version\": 1"));
    }
}
