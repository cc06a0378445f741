//! Grounding material for candidate generation.
//!
//! [`ContextBuilder`] asks a [`CodebaseSearch`] collaborator for excerpts
//! relevant to a request, adds the dependency manifest and a few previously
//! applied proposals that touched related files. Search is bounded by the
//! execution budget and degrades to an empty excerpt list.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::budget::ExecutionBudget;
use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::manifest::DependencyManifest;
use crate::proposal::{ProposalQuery, ProposalState, ProposalStore};
use crate::request::RemediationRequest;
use crate::snapshot::CodebaseSnapshot;

/// A ranked piece of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Excerpt {
    pub path: String,
    /// 1-based line the excerpt starts at.
    pub start_line: usize,
    pub content: String,
    pub score: f64,
}

/// External free-text search over the codebase.
#[async_trait]
pub trait CodebaseSearch: Send + Sync {
    /// Best `limit` excerpts for `query`, highest score first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Excerpt>>;

    fn name(&self) -> &str;
}

/// A previously applied proposal shown to the generator as an example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingExample {
    pub proposal_id: String,
    pub title: String,
    pub paths: Vec<String>,
    pub diff: String,
}

/// Everything the generator is grounded on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub excerpts: Vec<Excerpt>,
    pub manifest: DependencyManifest,
    pub examples: Vec<WorkingExample>,
    /// Search failed or timed out and excerpts are missing.
    pub degraded: bool,
}

/// Cuts `text` to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "when", "that", "this", "from", "into", "fix", "bug", "should",
    "does", "not", "are", "was", "has", "have", "its", "our", "all",
];

/// Lowercase search terms of at least three characters.
fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(str::to_lowercase)
        .filter(|t| t.len() >= 3 && !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Keyword search over the text files of a snapshot.
pub struct LocalSearch {
    snapshot: Arc<CodebaseSnapshot>,
    window_lines: usize,
}

impl LocalSearch {
    pub fn new(snapshot: Arc<CodebaseSnapshot>) -> Self {
        Self {
            snapshot,
            window_lines: 40,
        }
    }

    fn score_file(path: &str, content: &str, terms: &[String]) -> Option<(f64, usize)> {
        let path_lower = path.to_lowercase();
        let mut score = 0.0;
        let mut first_hit: Option<usize> = None;

        for (idx, line) in content.lines().enumerate() {
            let lower = line.to_lowercase();
            let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
            if hits > 0 {
                score += hits as f64;
                first_hit.get_or_insert(idx);
            }
        }
        score += 5.0 * terms.iter().filter(|t| path_lower.contains(t.as_str())).count() as f64;

        (score > 0.0).then(|| (score, first_hit.unwrap_or(0)))
    }

    fn search_blocking(&self, query: &str, limit: usize) -> Vec<Excerpt> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut excerpts: Vec<Excerpt> = self
            .snapshot
            .files()
            .filter_map(|path| {
                let content = self.snapshot.read(path)?;
                let (score, hit) = Self::score_file(path, &content, &terms)?;
                let start = hit.saturating_sub(self.window_lines / 4);
                let body: Vec<&str> = content
                    .lines()
                    .skip(start)
                    .take(self.window_lines)
                    .collect();
                Some(Excerpt {
                    path: path.to_string(),
                    start_line: start + 1,
                    content: body.join("\n"),
                    score,
                })
            })
            .collect();

        sort_excerpts(&mut excerpts);
        excerpts.truncate(limit);
        excerpts
    }
}

#[async_trait]
impl CodebaseSearch for LocalSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Excerpt>> {
        let search = LocalSearch {
            snapshot: Arc::clone(&self.snapshot),
            window_lines: self.window_lines,
        };
        let query = query.to_string();
        tokio::task::spawn_blocking(move || search.search_blocking(&query, limit))
            .await
            .map_err(|e| Error::Store(format!("search task failed: {}", e)))
    }

    fn name(&self) -> &str {
        "local"
    }
}

fn sort_excerpts(excerpts: &mut [Excerpt]) {
    excerpts.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

pub struct ContextBuilder {
    search: Arc<dyn CodebaseSearch>,
    history: Option<Arc<dyn ProposalStore>>,
    config: ContextConfig,
    budget: ExecutionBudget,
}

impl ContextBuilder {
    pub fn new(search: Arc<dyn CodebaseSearch>, config: ContextConfig, budget: ExecutionBudget) -> Self {
        Self {
            search,
            history: None,
            config,
            budget,
        }
    }

    /// Uses applied proposals from `store` as working examples.
    pub fn with_history(mut self, store: Arc<dyn ProposalStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Builds the context for `request`. Never fails.
    pub async fn build(&self, request: &RemediationRequest, manifest: &DependencyManifest) -> GenerationContext {
        let mut query = request.description.clone();
        if let Some(category) = &request.category {
            query.push(' ');
            query.push_str(category);
        }

        let searched = match tokio::time::timeout(
            self.budget.search_timeout,
            self.search.search(&query, self.config.max_excerpts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "codebase search after {}s",
                self.budget.search_timeout.as_secs()
            ))),
        };

        let (mut excerpts, degraded) = match searched {
            Ok(excerpts) => (excerpts, false),
            Err(e) => {
                tracing::warn!(request_id = %request.id, search = %self.search.name(), error = %e, "codebase search failed, continuing without excerpts");
                (Vec::new(), true)
            }
        };

        sort_excerpts(&mut excerpts);
        let mut seen = HashSet::new();
        excerpts.retain(|e| seen.insert((e.path.clone(), e.start_line)));
        excerpts.truncate(self.config.max_excerpts);
        for excerpt in &mut excerpts {
            let cut = truncate_chars(&excerpt.content, self.config.max_excerpt_chars).len();
            excerpt.content.truncate(cut);
        }

        let examples = self.working_examples(&excerpts).await;

        tracing::info!(
            request_id = %request.id,
            excerpts = excerpts.len(),
            examples = examples.len(),
            degraded,
            "built generation context"
        );

        GenerationContext {
            excerpts,
            manifest: manifest.clone(),
            examples,
            degraded,
        }
    }

    async fn working_examples(&self, excerpts: &[Excerpt]) -> Vec<WorkingExample> {
        let Some(store) = &self.history else {
            return Vec::new();
        };
        if self.config.max_examples == 0 || excerpts.is_empty() {
            return Vec::new();
        }

        let store = Arc::clone(store);
        let loaded = tokio::task::spawn_blocking(move || {
            store.query(&ProposalQuery::in_state(ProposalState::Applied))
        })
        .await;
        let applied = match loaded {
            Ok(Ok(applied)) => applied,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to load applied proposals for examples");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "history lookup task failed");
                return Vec::new();
            }
        };

        let paths: BTreeSet<&str> = excerpts.iter().map(|e| e.path.as_str()).collect();
        let dirs: BTreeSet<&str> = paths.iter().map(|p| parent_dir(p)).collect();

        let mut related: Vec<_> = applied
            .into_iter()
            .filter(|p| {
                p.operations
                    .iter()
                    .any(|op| paths.contains(op.path.as_str()) || dirs.contains(parent_dir(&op.path)))
            })
            .collect();
        related.sort_by(|a, b| b.applied_at.cmp(&a.applied_at).then_with(|| a.id.cmp(&b.id)));

        related
            .into_iter()
            .take(self.config.max_examples)
            .map(|p| WorkingExample {
                paths: p.touched_paths(),
                diff: truncate_chars(&p.diff, self.config.max_excerpt_chars).to_string(),
                proposal_id: p.id,
                title: p.title,
            })
            .collect()
    }
}
