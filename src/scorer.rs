//! Ranking of tested candidates.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::candidate::{CandidateFix, RiskTier};
use crate::config::ScoringConfig;
use crate::test_runner::TestResult;

fn default_test_ratio_weight() -> f64 {
    1000.0
}

fn default_risk_weight() -> f64 {
    5.0
}

fn default_cleanliness_weight() -> f64 {
    0.5
}

fn default_files_touched_weight() -> f64 {
    0.1
}

/// Weights of the scoring inputs. Higher scores rank first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Multiplies the pass ratio (0.0..=1.0).
    #[serde(default = "default_test_ratio_weight")]
    pub test_ratio: f64,
    /// Subtracted per risk tier above low.
    #[serde(default = "default_risk_weight")]
    pub risk: f64,
    /// Subtracted per validation warning.
    #[serde(default = "default_cleanliness_weight")]
    pub cleanliness: f64,
    /// Subtracted per touched file.
    #[serde(default = "default_files_touched_weight")]
    pub files_touched: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            test_ratio: default_test_ratio_weight(),
            risk: default_risk_weight(),
            cleanliness: default_cleanliness_weight(),
            files_touched: default_files_touched_weight(),
        }
    }
}

/// Ranking inputs and weighted value for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub candidate_id: String,
    pub passed: u32,
    pub total: u32,
    pub test_ratio: f64,
    pub risk: RiskTier,
    /// Validation warnings; fewer is cleaner.
    pub warnings: usize,
    pub files_touched: usize,
    pub value: f64,
}

/// Scores and ranks candidates that reached a test result.
#[derive(Debug, Clone, Default)]
pub struct CandidateScorer {
    config: ScoringConfig,
}

impl CandidateScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, candidate: &CandidateFix, warnings: usize, test: &TestResult) -> Score {
        let w = &self.config.weights;
        let test_ratio = test.pass_ratio();
        let files_touched = candidate.files_touched();
        let value = w.test_ratio * test_ratio
            - w.risk * f64::from(candidate.risk.rank())
            - w.cleanliness * warnings as f64
            - w.files_touched * files_touched as f64;

        Score {
            candidate_id: candidate.id.clone(),
            passed: test.passed,
            total: test.total,
            test_ratio,
            risk: candidate.risk,
            warnings,
            files_touched,
            value,
        }
    }

    /// A candidate is viable if at least one test passed and its pass ratio
    /// meets the configured minimum.
    pub fn is_viable(&self, score: &Score) -> bool {
        score.passed > 0 && score.test_ratio >= self.config.min_pass_ratio
    }

    /// Sorts best first. Equal values fall back to pass ratio, then lower
    /// risk, fewer warnings, fewer files and finally candidate id.
    pub fn rank(&self, mut scores: Vec<Score>) -> Vec<Score> {
        scores.sort_by(compare);
        scores
    }

    /// The best viable candidate, if any.
    pub fn select(&self, scores: Vec<Score>) -> Option<Score> {
        self.rank(scores).into_iter().find(|s| self.is_viable(s))
    }
}

fn compare(a: &Score, b: &Score) -> Ordering {
    b.value
        .total_cmp(&a.value)
        .then_with(|| b.test_ratio.total_cmp(&a.test_ratio))
        .then_with(|| a.risk.cmp(&b.risk))
        .then_with(|| a.warnings.cmp(&b.warnings))
        .then_with(|| a.files_touched.cmp(&b.files_touched))
        .then_with(|| a.candidate_id.cmp(&b.candidate_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::FileOperation;
    use std::time::Duration;

    fn candidate(id: &str, risk: RiskTier, files: usize) -> CandidateFix {
        let mut c = CandidateFix::new(
            "req",
            id,
            "",
            risk,
            (0..files)
                .map(|i| FileOperation::modify(format!("f{}.py", i), "x = 1\n"))
                .collect(),
        );
        c.id = id.to_string();
        c
    }

    fn result(passed: u32, total: u32) -> TestResult {
        TestResult {
            session_id: "s".to_string(),
            passed,
            total,
            duration: Duration::from_secs(1),
            log_path: None,
        }
    }

    #[test]
    fn higher_pass_ratio_wins_over_lower_risk() {
        let scorer = CandidateScorer::default();
        let x = scorer.score(&candidate("x", RiskTier::Medium, 1), 0, &result(40, 40));
        let y = scorer.score(&candidate("y", RiskTier::Low, 1), 0, &result(38, 40));

        let best = scorer.select(vec![y, x]).unwrap();
        assert_eq!(best.candidate_id, "x");
    }

    #[test]
    fn equal_ratio_prefers_lower_risk_then_cleanliness_then_fewer_files() {
        let scorer = CandidateScorer::default();
        let ranked = scorer.rank(vec![
            scorer.score(&candidate("high", RiskTier::High, 1), 0, &result(10, 10)),
            scorer.score(&candidate("low-many", RiskTier::Low, 3), 0, &result(10, 10)),
            scorer.score(&candidate("low-warn", RiskTier::Low, 1), 2, &result(10, 10)),
            scorer.score(&candidate("low", RiskTier::Low, 1), 0, &result(10, 10)),
        ]);
        let order: Vec<&str> = ranked.iter().map(|s| s.candidate_id.as_str()).collect();
        assert_eq!(order, vec!["low", "low-many", "low-warn", "high"]);
    }

    #[test]
    fn zero_passed_is_not_viable() {
        let scorer = CandidateScorer::default();
        let none = scorer.score(&candidate("a", RiskTier::Low, 1), 0, &result(0, 40));
        let timed_out = scorer.score(&candidate("b", RiskTier::Low, 1), 0, &result(0, 0));
        assert!(scorer.select(vec![none, timed_out]).is_none());
    }

    #[test]
    fn minimum_ratio_filters_candidates() {
        let scorer = CandidateScorer::new(ScoringConfig {
            min_pass_ratio: 0.9,
            ..ScoringConfig::default()
        });
        let partial = scorer.score(&candidate("a", RiskTier::Low, 1), 0, &result(30, 40));
        assert!(!scorer.is_viable(&partial));
        assert!(scorer.select(vec![partial]).is_none());
    }

    #[test]
    fn identical_scores_order_by_id() {
        let scorer = CandidateScorer::default();
        let ranked = scorer.rank(vec![
            scorer.score(&candidate("b", RiskTier::Low, 1), 0, &result(5, 5)),
            scorer.score(&candidate("a", RiskTier::Low, 1), 0, &result(5, 5)),
        ]);
        assert_eq!(ranked[0].candidate_id, "a");
    }
}
