//! Remediation requests: the natural-language intake of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reported severity of the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Intake accepted, pipeline not finished.
    #[default]
    Open,
    /// Pipeline reached a terminal outcome (proposal or no viable fix).
    Completed,
    /// Cancelled before a proposal was applied.
    Cancelled,
}

/// A bug report or improvement recommendation to remediate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRequest {
    /// Unique request identifier.
    pub id: String,
    /// Free-text description of the problem.
    pub description: String,
    /// Optional severity.
    #[serde(default)]
    pub severity: Option<Severity>,
    /// Optional category (e.g. "performance", "security").
    #[serde(default)]
    pub category: Option<String>,
    /// When the request was created.
    pub created_at: DateTime<Utc>,
    /// Current status.
    #[serde(default)]
    pub status: RequestStatus,
    /// Human-readable terminal reason, set when the request leaves `Open`.
    #[serde(default)]
    pub outcome: Option<String>,
}

impl RemediationRequest {
    /// Creates an open request with a fresh id.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            severity: None,
            category: None,
            created_at: Utc::now(),
            status: RequestStatus::Open,
            outcome: None,
        }
    }

    /// Sets the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Sets the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RequestStatus::Open
    }

    /// Marks the request completed with the given reason.
    pub fn complete(&mut self, outcome: impl Into<String>) {
        self.status = RequestStatus::Completed;
        self.outcome = Some(outcome.into());
    }

    /// Marks the request cancelled with the given reason.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.status = RequestStatus::Cancelled;
        self.outcome = Some(reason.into());
    }
}
