//! Candidate generation.
//!
//! [`CandidateGenerator`] fills N independent slots per request. Each slot
//! calls the [`TextGenerator`] with the same prompt and its own sampling
//! parameters. Output that does not parse earns one corrective re-prompt;
//! a slot that still fails is reported as a [`SlotFailure`] and contributes
//! no candidate.
//!
//! [`CandidateGenerator::refine`] fills one extra slot after every candidate
//! failed its tests, prompting with the failure analysis.

mod command;
mod parse;
mod prompt;

pub use command::CommandGenerator;
pub use parse::parse_candidate;
pub use prompt::{candidate_schema, corrective_prompt, initial_prompt, refix_prompt};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::budget::ExecutionBudget;
use crate::cancel::CancelToken;
use crate::candidate::CandidateFix;
use crate::config::GenerationConfig;
use crate::context::GenerationContext;
use crate::error::{Error, GenerationError, Result};
use crate::events::{EventSink, NullSink, PipelineEvent};
use crate::failure::FailureAnalysis;
use crate::request::RemediationRequest;

/// One call to the text-generation backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    /// Slot index, for backends that seed on it.
    pub sample: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationReply {
    Text(String),
    Refusal(String),
}

/// External text-generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationReply>;

    fn name(&self) -> &str;
}

/// A slot that produced no candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotFailure {
    pub slot: usize,
    pub error: GenerationError,
    pub attempts: u32,
}

/// Everything one request's generation produced.
#[derive(Debug, Clone, Default)]
pub struct GenerationBatch {
    /// Ordered by slot.
    pub candidates: Vec<CandidateFix>,
    pub failures: Vec<SlotFailure>,
    /// Generation stopped early because the request was cancelled.
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct CandidateGenerator {
    backend: Arc<dyn TextGenerator>,
    config: GenerationConfig,
    budget: ExecutionBudget,
    events: Arc<dyn EventSink>,
}

impl CandidateGenerator {
    pub fn new(backend: Arc<dyn TextGenerator>, config: GenerationConfig, budget: ExecutionBudget) -> Self {
        Self {
            backend,
            config,
            budget,
            events: Arc::new(NullSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Temperature for `slot`, spread symmetrically around the base.
    pub fn slot_temperature(&self, slot: usize) -> f32 {
        let n = self.config.candidates.max(1) as f32;
        let offset = slot as f32 - (n - 1.0) / 2.0;
        (self.config.temperature + offset * self.config.temperature_spread).clamp(0.0, 2.0)
    }

    /// Fills every slot for `request`.
    pub async fn generate(
        &self,
        request: &RemediationRequest,
        context: &GenerationContext,
        cancel: &CancelToken,
    ) -> GenerationBatch {
        let prompt = Arc::new(initial_prompt(request, context));
        let semaphore = Arc::new(Semaphore::new(self.config.capacity.max(1)));
        let mut tasks = JoinSet::new();

        for slot in 0..self.config.candidates {
            let generator = self.clone();
            let prompt = Arc::clone(&prompt);
            let semaphore = Arc::clone(&semaphore);
            let request_id = request.id.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| SlotFailure {
                        slot,
                        error: GenerationError::Backend(e.to_string()),
                        attempts: 0,
                    })?;
                let temperature = generator.slot_temperature(slot);
                generator.fill_slot(&request_id, slot, temperature, &prompt).await
            });
        }

        let mut batch = GenerationBatch::default();
        let mut filled: Vec<(usize, CandidateFix)> = Vec::new();
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    batch.cancelled = true;
                    tracing::info!(request_id = %request.id, "generation cancelled");
                    break;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok(Ok((slot, candidate))) => {
                    self.events.emit(PipelineEvent::CandidateGenerated {
                        request_id: request.id.clone(),
                        candidate_id: candidate.id.clone(),
                        slot,
                    });
                    filled.push((slot, candidate));
                }
                Ok(Err(failure)) => {
                    self.events.emit(PipelineEvent::GenerationFailed {
                        request_id: request.id.clone(),
                        slot: failure.slot,
                        reason: failure.error.to_string(),
                    });
                    batch.failures.push(failure);
                }
                Err(e) => tracing::error!(request_id = %request.id, error = %e, "generation task failed"),
            }
        }

        filled.sort_by_key(|(slot, _)| *slot);
        batch.candidates = filled.into_iter().map(|(_, c)| c).collect();
        batch.failures.sort_by_key(|f| f.slot);

        tracing::info!(
            request_id = %request.id,
            requested = self.config.candidates,
            generated = batch.candidates.len(),
            failed = batch.failures.len(),
            "generation finished"
        );
        batch
    }

    /// Generates re-fix attempt `attempt` (1-based) for a request whose
    /// candidates all failed.
    ///
    /// Uses the slot after the regular ones so backends that seed on the
    /// sample index do not repeat an earlier answer.
    pub async fn refine(
        &self,
        request: &RemediationRequest,
        context: &GenerationContext,
        failed: &CandidateFix,
        analysis: &FailureAnalysis,
        earlier: &[(CandidateFix, FailureAnalysis)],
        attempt: u32,
    ) -> std::result::Result<CandidateFix, SlotFailure> {
        let slot = self.config.candidates + attempt.saturating_sub(1) as usize;
        let prompt = refix_prompt(request, context, failed, analysis, earlier);
        tracing::info!(
            request_id = %request.id,
            attempt,
            slot,
            root_cause = %analysis.root_cause,
            "requesting re-fix"
        );

        match self
            .fill_slot(&request.id, slot, self.config.refix_temperature, &prompt)
            .await
        {
            Ok((slot, candidate)) => {
                self.events.emit(PipelineEvent::CandidateGenerated {
                    request_id: request.id.clone(),
                    candidate_id: candidate.id.clone(),
                    slot,
                });
                Ok(candidate)
            }
            Err(failure) => {
                self.events.emit(PipelineEvent::GenerationFailed {
                    request_id: request.id.clone(),
                    slot: failure.slot,
                    reason: failure.error.to_string(),
                });
                Err(failure)
            }
        }
    }

    async fn fill_slot(
        &self,
        request_id: &str,
        slot: usize,
        temperature: f32,
        prompt: &str,
    ) -> std::result::Result<(usize, CandidateFix), SlotFailure> {
        let attempts = self.budget.generation_attempts();
        let mut call = GenerationRequest {
            prompt: prompt.to_string(),
            temperature,
            sample: slot,
        };
        let mut last_error = GenerationError::Backend("no attempt made".to_string());

        for attempt in 1..=attempts {
            let reply = tokio::time::timeout(self.budget.generation_timeout, self.backend.generate(&call)).await;

            let error = match reply {
                Err(_) => GenerationError::Timeout(self.budget.generation_timeout.as_millis() as u64),
                Ok(Err(Error::Generation(e))) => e,
                Ok(Err(e)) => GenerationError::Backend(e.to_string()),
                Ok(Ok(GenerationReply::Refusal(reason))) => GenerationError::Refusal(reason),
                Ok(Ok(GenerationReply::Text(text))) => match parse_candidate(&text, request_id) {
                    Ok(candidate) => {
                        tracing::debug!(request_id = %request_id, slot, attempt, candidate_id = %candidate.id, "slot filled");
                        return Ok((slot, candidate));
                    }
                    Err(e) => {
                        if let GenerationError::Malformed(msg) = &e {
                            call.prompt = corrective_prompt(prompt, msg, &text);
                        }
                        e
                    }
                },
            };

            tracing::warn!(
                request_id = %request_id,
                slot,
                attempt,
                attempts,
                error = %error,
                "generation attempt failed"
            );
            last_error = error;
        }

        Err(SlotFailure {
            slot,
            error: last_error,
            attempts,
        })
    }
}
