//! Adaptive refinement loop.
//!
//! Generate a draft, critique it, diagnose the weakest dimension and revise with
//! the next strategy for that dimension. A revision that drops the diagnosed
//! dimension by more than the tolerance is reverted and never becomes the
//! result; its strategy is marked failed. When the diagnosed dimension stalls
//! across two accepted iterations, a bounded sweep tries several strategies
//! against the same base draft and ends the run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RefineConfig;
use crate::critic::{CriticError, CriticReport};
use crate::draft::Draft;
use crate::gateway::RetryPolicy;
use crate::trace::{emit, AuditEvent, AuditSink};

use super::hooks::{DraftGenerator, DraftScorer, GenerationRequest, GeneratorError, RevisionFeedback};
use super::strategy::{Dimension, Pattern, PatternCatalog, StrategyBook};

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Initial,
    Revision,
    Sweep { attempt: usize },
}

impl Phase {
    fn label(&self) -> String {
        match self {
            Phase::Initial => "initial".to_string(),
            Phase::Revision => "revision".to_string(),
            Phase::Sweep { attempt } => format!("sweep_{attempt}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Accepted,
    Reverted,
    GenerationFailed,
    SweepAttempt,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::Accepted => "accepted",
            IterationStatus::Reverted => "reverted",
            IterationStatus::GenerationFailed => "generation_failed",
            IterationStatus::SweepAttempt => "sweep_attempt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Passed,
    MaxIterationsReached,
    Exhausted,
    Cancelled,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::Passed => "passed",
            TerminalState::MaxIterationsReached => "max_iterations_reached",
            TerminalState::Exhausted => "exhausted",
            TerminalState::Cancelled => "cancelled",
        }
    }
}

/// One committed step of a run. Records are append-only.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub index: usize,
    /// Accepted iterations so far (the budget counter).
    pub iteration: usize,
    #[serde(flatten)]
    pub phase: Phase,
    pub status: IterationStatus,
    pub pattern_id: String,
    /// Dimension the step was trying to improve; `None` for the first draft.
    pub dimension: Option<Dimension>,
    pub draft: Option<Draft>,
    pub report: Option<CriticReport>,
    /// Strategy marked failed by this step, with the dimension it failed on.
    pub failed_strategy: Option<(String, Dimension)>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IterationRecord {
    pub fn mean_score(&self) -> Option<f64> {
        self.report.as_ref().map(|r| r.mean_score)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BestSoFar {
    pub draft: Draft,
    pub mean_score: f64,
    pub record_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefinementOutcome {
    pub run_id: Uuid,
    pub terminal: TerminalState,
    pub passed: bool,
    /// The passing draft, otherwise the best-scoring draft seen.
    pub final_draft: Option<Draft>,
    pub final_score: Option<f64>,
    /// Draft the loop was working on when it stopped.
    pub working_draft: Option<Draft>,
    pub records: Vec<IterationRecord>,
    pub best: Option<BestSoFar>,
    pub failures: Vec<(String, Dimension)>,
}

impl RefinementOutcome {
    pub fn accepted(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == IterationStatus::Accepted)
            .count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("scoring failed: {0}")]
    Scoring(#[from] CriticError),
}

// =============================================================================
// Controller
// =============================================================================

pub struct RefinementController {
    catalog: Arc<PatternCatalog>,
    generator: Arc<dyn DraftGenerator>,
    scorer: Arc<dyn DraftScorer>,
    config: RefineConfig,
    retry: RetryPolicy,
    audit: Option<Arc<dyn AuditSink>>,
}

impl RefinementController {
    pub fn new(
        catalog: Arc<PatternCatalog>,
        generator: Arc<dyn DraftGenerator>,
        scorer: Arc<dyn DraftScorer>,
        config: RefineConfig,
    ) -> Self {
        Self {
            catalog,
            generator,
            scorer,
            config,
            retry: RetryPolicy::default(),
            audit: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run the loop to a terminal state. Only scoring failures abort the run.
    pub async fn run(
        &self,
        constraints: &[String],
        cancel: Option<&AtomicBool>,
    ) -> Result<RefinementOutcome, ControllerError> {
        let mut run = Run {
            ctl: self,
            constraints,
            cancel,
            run_id: Uuid::new_v4(),
            book: StrategyBook::new(),
            records: Vec::new(),
            best: None,
            hints: Vec::new(),
            swept: HashSet::new(),
            accepted: 0,
        };
        run.drive().await
    }
}

/// A scored draft the loop can revise.
struct Working {
    draft: Draft,
    report: CriticReport,
}

struct Run<'a> {
    ctl: &'a RefinementController,
    constraints: &'a [String],
    cancel: Option<&'a AtomicBool>,
    run_id: Uuid,
    book: StrategyBook,
    records: Vec<IterationRecord>,
    best: Option<BestSoFar>,
    hints: Vec<String>,
    swept: HashSet<Dimension>,
    accepted: usize,
}

impl<'a> Run<'a> {
    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn audit(&self, event: AuditEvent) {
        emit(self.ctl.audit.as_deref(), Some(self.run_id), event);
    }

    async fn drive(&mut self) -> Result<RefinementOutcome, ControllerError> {
        let max_iterations = self.ctl.config.max_iterations;

        // First draft: walk initial candidates until one generates.
        let mut working = loop {
            if self.cancelled() {
                return Ok(self.finish(TerminalState::Cancelled, None, None));
            }
            let Some((pattern, dimension)) = self.book.initial(&self.ctl.catalog) else {
                return Ok(self.finish(TerminalState::Exhausted, None, None));
            };
            let pattern = pattern.clone();
            match self.generate(&pattern, None, None).await {
                Ok(draft) => {
                    if self.cancelled() {
                        return Ok(self.finish(TerminalState::Cancelled, None, None));
                    }
                    let report = self.ctl.scorer.score(&draft, &pattern).await?;
                    self.accepted += 1;
                    let index = self.commit(
                        Phase::Initial,
                        IterationStatus::Accepted,
                        &pattern.id,
                        None,
                        Some(&draft),
                        Some(&report),
                        None,
                        None,
                    );
                    self.consider_best(&draft, &report, index);
                    break Working { draft, report };
                }
                Err(err) => {
                    // A failed first draft still spends budget.
                    self.accepted += 1;
                    self.book.mark_failed(&pattern.id, dimension);
                    self.commit(
                        Phase::Initial,
                        IterationStatus::GenerationFailed,
                        &pattern.id,
                        None,
                        None,
                        None,
                        Some((pattern.id.clone(), dimension)),
                        Some(err.to_string()),
                    );
                    if self.accepted >= max_iterations {
                        return Ok(self.finish(TerminalState::MaxIterationsReached, None, None));
                    }
                }
            }
        };

        let mut previous: Option<CriticReport> = None;
        loop {
            if working.report.passed {
                let terminal = TerminalState::Passed;
                return Ok(self.finish(terminal, Some(&working), Some(working.draft.clone())));
            }
            if self.accepted >= max_iterations {
                return Ok(self.finish(
                    TerminalState::MaxIterationsReached,
                    None,
                    Some(working.draft.clone()),
                ));
            }
            if self.cancelled() {
                return Ok(self.finish(TerminalState::Cancelled, None, Some(working.draft.clone())));
            }

            let dimension = working.report.dimension;
            if let Some(prev) = &previous {
                if self.stalled(prev, &working.report, dimension) && !self.swept.contains(&dimension) {
                    return self.sweep(dimension, working).await;
                }
            }

            let Some(candidate) = self.book.next_for(&self.ctl.catalog, dimension) else {
                info!(dimension = %dimension, "no strategy left for the diagnosed dimension");
                return Ok(self.finish(TerminalState::Exhausted, None, Some(working.draft.clone())));
            };
            let candidate = candidate.clone();
            self.hints.extend(candidate.revision_hints());
            let feedback = self.feedback(&working.report, dimension);

            let draft = match self
                .generate(&candidate, Some(&working.draft), Some(&feedback))
                .await
            {
                Ok(draft) => draft,
                Err(err) => {
                    self.book.mark_failed(&candidate.id, dimension);
                    self.commit(
                        Phase::Revision,
                        IterationStatus::GenerationFailed,
                        &candidate.id,
                        Some(dimension),
                        None,
                        None,
                        Some((candidate.id.clone(), dimension)),
                        Some(err.to_string()),
                    );
                    continue;
                }
            };
            if self.cancelled() {
                return Ok(self.finish(TerminalState::Cancelled, None, Some(working.draft.clone())));
            }
            let report = self.ctl.scorer.score(&draft, &candidate).await?;

            let baseline = working.report.dimension_score(dimension).unwrap_or(0.0);
            let current = report.dimension_score(dimension).unwrap_or(0.0);
            if current < baseline - self.ctl.config.rollback_tolerance {
                self.book.mark_failed(&candidate.id, dimension);
                let index = self.commit(
                    Phase::Revision,
                    IterationStatus::Reverted,
                    &candidate.id,
                    Some(dimension),
                    Some(&draft),
                    Some(&report),
                    Some((candidate.id.clone(), dimension)),
                    None,
                );
                warn!(
                    pattern_id = %candidate.id,
                    dimension = %dimension,
                    baseline,
                    current,
                    "revision regressed; rolling back"
                );
                self.audit(AuditEvent::RolledBack {
                    index,
                    pattern_id: candidate.id.clone(),
                    dimension,
                    baseline,
                    current,
                });
                continue;
            }

            self.accepted += 1;
            let index = self.commit(
                Phase::Revision,
                IterationStatus::Accepted,
                &candidate.id,
                Some(dimension),
                Some(&draft),
                Some(&report),
                None,
                None,
            );
            self.consider_best(&draft, &report, index);
            let replaced = std::mem::replace(&mut working, Working { draft, report });
            previous = Some(replaced.report);
        }
    }

    /// Bounded search over strategies for one stalled dimension. Always terminal.
    async fn sweep(
        &mut self,
        dimension: Dimension,
        base: Working,
    ) -> Result<RefinementOutcome, ControllerError> {
        self.swept.insert(dimension);
        let base_score = base.report.dimension_score(dimension).unwrap_or(0.0);
        info!(dimension = %dimension, base_score, "dimension stalled; starting sweep");
        self.audit(AuditEvent::SweepStarted {
            dimension,
            base_score,
        });

        let mut best_attempt: Option<Working> = None;
        let mut attempts = 0;
        for attempt in 1..=self.ctl.config.max_sweep_attempts {
            if self.cancelled() {
                return Ok(self.finish(TerminalState::Cancelled, None, Some(base.draft.clone())));
            }
            let Some(candidate) = self.book.next_for(&self.ctl.catalog, dimension) else {
                debug!(dimension = %dimension, "sweep ran out of strategies");
                break;
            };
            let candidate = candidate.clone();
            attempts = attempt;
            self.hints.extend(candidate.revision_hints());
            let feedback = self.feedback(&base.report, dimension);

            let draft = match self
                .generate(&candidate, Some(&base.draft), Some(&feedback))
                .await
            {
                Ok(draft) => draft,
                Err(err) => {
                    self.book.mark_failed(&candidate.id, dimension);
                    self.commit(
                        Phase::Sweep { attempt },
                        IterationStatus::GenerationFailed,
                        &candidate.id,
                        Some(dimension),
                        None,
                        None,
                        Some((candidate.id.clone(), dimension)),
                        Some(err.to_string()),
                    );
                    continue;
                }
            };
            if self.cancelled() {
                return Ok(self.finish(TerminalState::Cancelled, None, Some(base.draft.clone())));
            }
            let report = self.ctl.scorer.score(&draft, &candidate).await?;
            let index = self.commit(
                Phase::Sweep { attempt },
                IterationStatus::SweepAttempt,
                &candidate.id,
                Some(dimension),
                Some(&draft),
                Some(&report),
                None,
                None,
            );
            self.consider_best(&draft, &report, index);

            let attempt_result = Working { draft, report };
            if attempt_result.report.passed {
                self.audit(AuditEvent::SweepFinished {
                    dimension,
                    attempts,
                    passed: true,
                });
                let working = Some(attempt_result.draft.clone());
                return Ok(self.finish(TerminalState::Passed, Some(&attempt_result), working));
            }
            let better = best_attempt
                .as_ref()
                .map_or(true, |b| attempt_result.report.mean_score > b.report.mean_score);
            if better {
                best_attempt = Some(attempt_result);
            }
        }

        self.audit(AuditEvent::SweepFinished {
            dimension,
            attempts,
            passed: false,
        });
        let working = best_attempt.map_or(base.draft, |b| b.draft);
        Ok(self.finish(TerminalState::Exhausted, None, Some(working)))
    }

    fn stalled(&self, previous: &CriticReport, current: &CriticReport, dimension: Dimension) -> bool {
        match (
            previous.dimension_score(dimension),
            current.dimension_score(dimension),
        ) {
            (Some(before), Some(now)) => now <= before + self.ctl.config.stagnation_margin,
            _ => false,
        }
    }

    fn feedback(&self, report: &CriticReport, dimension: Dimension) -> RevisionFeedback {
        RevisionFeedback {
            dimension: Some(dimension),
            role_scores: report.role_scores(),
            hints: self.hints.clone(),
            failed_strategies: self.book.failures(),
        }
    }

    /// Call the generator under the retry policy.
    async fn generate(
        &self,
        pattern: &Pattern,
        prior_draft: Option<&Draft>,
        feedback: Option<&RevisionFeedback>,
    ) -> Result<Draft, GeneratorError> {
        let retry = &self.ctl.retry;
        let mut attempt: u32 = 0;
        loop {
            let req = GenerationRequest {
                pattern,
                constraints: self.constraints,
                prior_draft,
                feedback,
            };
            match self.ctl.generator.generate(req).await {
                Ok(draft) => return Ok(draft),
                Err(err) if attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    debug!(
                        pattern_id = %pattern.id,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying draft generation"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(pattern_id = %pattern.id, error = %err, "draft generation failed");
                    return Err(err);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &mut self,
        phase: Phase,
        status: IterationStatus,
        pattern_id: &str,
        dimension: Option<Dimension>,
        draft: Option<&Draft>,
        report: Option<&CriticReport>,
        failed_strategy: Option<(String, Dimension)>,
        error: Option<String>,
    ) -> usize {
        let index = self.records.len();
        let record = IterationRecord {
            index,
            iteration: self.accepted,
            phase,
            status,
            pattern_id: pattern_id.to_string(),
            dimension,
            draft: draft.cloned(),
            report: report.cloned(),
            failed_strategy,
            error,
            timestamp: Utc::now(),
        };
        info!(
            index,
            iteration = record.iteration,
            phase = %phase.label(),
            status = status.as_str(),
            pattern_id,
            mean = ?record.mean_score(),
            "iteration committed"
        );
        self.audit(AuditEvent::IterationCommitted {
            index,
            iteration: record.iteration,
            phase: phase.label(),
            status: status.as_str().to_string(),
            pattern_id: pattern_id.to_string(),
            mean_score: record.mean_score(),
            passed: report.is_some_and(|r| r.passed),
        });
        self.records.push(record);
        index
    }

    fn consider_best(&mut self, draft: &Draft, report: &CriticReport, record_index: usize) {
        let improves = self
            .best
            .as_ref()
            .map_or(true, |b| report.mean_score > b.mean_score);
        if improves {
            self.best = Some(BestSoFar {
                draft: draft.clone(),
                mean_score: report.mean_score,
                record_index,
            });
        }
    }

    fn finish(
        &mut self,
        terminal: TerminalState,
        passing: Option<&Working>,
        working_draft: Option<Draft>,
    ) -> RefinementOutcome {
        let (final_draft, final_score) = match passing {
            Some(w) => (Some(w.draft.clone()), Some(w.report.mean_score)),
            None => match &self.best {
                Some(b) => (Some(b.draft.clone()), Some(b.mean_score)),
                None => (None, None),
            },
        };
        let passed = terminal == TerminalState::Passed;
        info!(
            run_id = %self.run_id,
            terminal = terminal.as_str(),
            passed,
            final_score = ?final_score,
            records = self.records.len(),
            "refinement finished"
        );
        self.audit(AuditEvent::RunFinished {
            terminal: terminal.as_str().to_string(),
            passed,
            final_score,
            records: self.records.len(),
        });
        RefinementOutcome {
            run_id: self.run_id,
            terminal,
            passed,
            final_draft,
            final_score,
            working_draft,
            records: std::mem::take(&mut self.records),
            best: self.best.clone(),
            failures: self.book.failures(),
        }
    }
}
