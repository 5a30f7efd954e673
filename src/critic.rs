//! The critic: blind comparisons per role, calibrated score inference, optional
//! densification and the pass decision, folded into one [`CriticReport`].

use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::JudgementCache;
use crate::config::{CriticConfig, PassMode};
use crate::densify::{self, densify_reasons};
use crate::draft::Draft;
use crate::gateway::ChatGateway;
use crate::inference::{infer_score, observations, Estimate};
use crate::judge::{BlindComparator, Comparison, JudgeError, Role, RUBRIC_VERSION};
use crate::pass::{self, PassAudit};
use crate::reference::{select_initial_anchors, Anchor, Card, ReferenceIndex, CARD_VERSION};
use crate::refine::{Dimension, DraftScorer, Pattern};
use crate::trace::{emit, AuditEvent, AuditSink, RoleRoundSummary};

#[derive(Debug, thiserror::Error)]
pub enum CriticError {
    #[error(transparent)]
    Judge(#[from] JudgeError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleScore {
    pub role: Role,
    pub score: f64,
    pub estimate: Estimate,
    pub comparisons: Vec<Comparison>,
    pub anchors: usize,
    /// Comparisons are a neutral fallback rather than real judgements.
    pub degraded: bool,
    pub cached: bool,
}

impl RoleScore {
    fn summary(&self) -> RoleRoundSummary {
        RoleRoundSummary {
            role: self.role,
            score: self.score,
            loss: self.estimate.loss,
            mean_strength: self.estimate.mean_strength,
            monotonicity_violations: self.estimate.monotonicity_violations,
            degraded: self.degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DensifySummary {
    pub center: f64,
    pub added: usize,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CriticReport {
    pub pattern_id: String,
    /// One entry per role, in [`Role::ALL`] order.
    pub roles: Vec<RoleScore>,
    pub mean_score: f64,
    pub passed: bool,
    pub pass: PassAudit,
    /// Weakest role; first in role order on ties.
    pub weakest: Role,
    pub dimension: Dimension,
    /// Anchors of the final round.
    pub anchors: Vec<Anchor>,
    pub rounds: u8,
    pub densified: Option<DensifySummary>,
    /// False when anchors were unavailable or a role fell back to neutral comparisons.
    pub reliable: bool,
    pub rubric_version: &'static str,
    pub card_version: &'static str,
}

impl CriticReport {
    pub fn score(&self, role: Role) -> Option<f64> {
        self.roles.iter().find(|r| r.role == role).map(|r| r.score)
    }

    pub fn dimension_score(&self, dimension: Dimension) -> Option<f64> {
        self.score(Role::for_dimension(dimension))
    }

    pub fn role_scores(&self) -> Vec<(Role, f64)> {
        self.roles.iter().map(|r| (r.role, r.score)).collect()
    }
}

fn weakest(roles: &[RoleScore]) -> Role {
    let mut weakest: Option<&RoleScore> = None;
    for r in roles {
        if weakest.map_or(true, |w| r.score < w.score) {
            weakest = Some(r);
        }
    }
    weakest.map_or(Role::Novelty, |r| r.role)
}

pub struct Critic {
    comparator: BlindComparator,
    index: Arc<ReferenceIndex>,
    config: CriticConfig,
    audit: Option<Arc<dyn AuditSink>>,
    run_id: Option<Uuid>,
}

impl Critic {
    /// Builds a critic; out-of-range config values are corrected and logged.
    pub fn new(gateway: Arc<dyn ChatGateway>, index: Arc<ReferenceIndex>, mut config: CriticConfig) -> Self {
        for w in config.validate() {
            warn!(field = w.field, message = %w.message, "critic config value corrected");
        }
        Self {
            comparator: BlindComparator::new(gateway, config.judge.clone()),
            index,
            config,
            audit: None,
            run_id: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn JudgementCache>) -> Self {
        self.comparator = self.comparator.with_cache(cache);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.comparator = self.comparator.with_audit(audit.clone());
        self.audit = Some(audit);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.comparator = self.comparator.with_run_id(run_id);
        self.run_id = Some(run_id);
        self
    }

    pub fn config(&self) -> &CriticConfig {
        &self.config
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    fn audit(&self, event: AuditEvent) {
        emit(self.audit.as_deref(), self.run_id, event);
    }

    /// Critique a draft written from `pattern`.
    pub async fn review(&self, draft: &Draft, pattern: &Pattern) -> Result<CriticReport, CriticError> {
        let card = Card::from_draft(draft);
        let anchors = select_initial_anchors(
            &self.index,
            &pattern.id,
            &pattern.exemplar_ids,
            &self.config.anchors,
        );
        if anchors.is_empty() {
            warn!(pattern_id = %pattern.id, "no anchors available; using neutral scores");
            return Ok(self.neutral_report(&pattern.id));
        }

        let mut roles = self.run_round(&card, &anchors).await?;
        self.audit(AuditEvent::RoundScored {
            pattern_id: pattern.id.clone(),
            round: 1,
            anchors: anchors.len(),
            roles: roles.iter().map(RoleScore::summary).collect(),
        });

        let mut final_anchors = anchors;
        let mut rounds = 1;
        let mut densified = None;
        if self.config.densify.enabled {
            let reasons = {
                let estimates: Vec<(Role, &Estimate)> =
                    roles.iter().map(|r| (r.role, &r.estimate)).collect();
                densify_reasons(&estimates, &self.config.densify)
            };
            if !reasons.is_empty() {
                let first_scores: Vec<f64> = roles.iter().map(|r| r.score).collect();
                match densify::plan(
                    &self.index,
                    &pattern.id,
                    &final_anchors,
                    &first_scores,
                    reasons,
                    &self.config.anchors,
                    &self.config.densify,
                ) {
                    Some(plan) => {
                        info!(
                            pattern_id = %pattern.id,
                            center = plan.center,
                            added = plan.added,
                            total = plan.anchors.len(),
                            reasons = ?plan.reasons,
                            "densifying anchors for a second round"
                        );
                        self.audit(AuditEvent::Densified {
                            pattern_id: pattern.id.clone(),
                            center: plan.center,
                            added: plan.added,
                            reasons: plan.reasons.clone(),
                        });
                        roles = self.run_round(&card, &plan.anchors).await?;
                        self.audit(AuditEvent::RoundScored {
                            pattern_id: pattern.id.clone(),
                            round: 2,
                            anchors: plan.anchors.len(),
                            roles: roles.iter().map(RoleScore::summary).collect(),
                        });
                        densified = Some(DensifySummary {
                            center: plan.center,
                            added: plan.added,
                            reasons: plan.reasons,
                        });
                        final_anchors = plan.anchors;
                        rounds = 2;
                    }
                    None => info!(pattern_id = %pattern.id, "no new anchors; skipping second round"),
                }
            }
        }

        let reliable = roles.iter().all(|r| !r.degraded && r.estimate.informative);
        Ok(self.finish(&pattern.id, roles, final_anchors, rounds, densified, reliable))
    }

    async fn run_round(&self, card: &Card, anchors: &[Anchor]) -> Result<Vec<RoleScore>, CriticError> {
        let futures = Role::ALL.into_iter().map(|role| {
            let card = card.clone();
            async move { self.score_role(role, &card, anchors).await }
        });
        try_join_all(futures).await
    }

    async fn score_role(
        &self,
        role: Role,
        card: &Card,
        anchors: &[Anchor],
    ) -> Result<RoleScore, CriticError> {
        let outcome = self.comparator.judge(role, card, anchors).await?;
        let obs = observations(
            anchors,
            &outcome.comparisons,
            &self.config.inference.strength_weights,
        );
        let estimate = infer_score(
            &obs,
            self.config.inference.tau.for_role(role),
            &self.config.inference,
        );
        Ok(RoleScore {
            role,
            score: estimate.score,
            estimate,
            comparisons: outcome.comparisons,
            anchors: anchors.len(),
            degraded: outcome.degraded,
            cached: outcome.cached,
        })
    }

    fn neutral_report(&self, pattern_id: &str) -> CriticReport {
        let neutral = self.config.inference.neutral_score;
        let roles = Role::ALL
            .into_iter()
            .map(|role| RoleScore {
                role,
                score: neutral,
                estimate: Estimate {
                    score: neutral,
                    loss: 0.0,
                    ci_low: None,
                    ci_high: None,
                    mean_strength: 0.0,
                    monotonicity_violations: 0,
                    tau: self.config.inference.tau.for_role(role),
                    comparisons: 0,
                    informative: false,
                },
                comparisons: Vec::new(),
                anchors: 0,
                degraded: false,
                cached: false,
            })
            .collect();
        self.finish(pattern_id, roles, Vec::new(), 0, None, false)
    }

    fn finish(
        &self,
        pattern_id: &str,
        roles: Vec<RoleScore>,
        anchors: Vec<Anchor>,
        rounds: u8,
        densified: Option<DensifySummary>,
        reliable: bool,
    ) -> CriticReport {
        let scores: Vec<(Role, f64)> = roles.iter().map(|r| (r.role, r.score)).collect();
        let pass = if anchors.is_empty() {
            let mut fixed = self.config.pass.clone();
            fixed.mode = PassMode::Fixed;
            pass::decide(&self.index, pattern_id, &scores, &fixed)
        } else {
            pass::decide(&self.index, pattern_id, &scores, &self.config.pass)
        };
        self.audit(AuditEvent::PassDecided {
            pattern_id: pattern_id.to_string(),
            audit: pass.clone(),
        });

        let weakest = weakest(&roles);
        info!(
            pattern_id,
            mean = pass.mean,
            passed = pass.passed,
            weakest = %weakest,
            rounds,
            reliable,
            "critique finished"
        );
        CriticReport {
            pattern_id: pattern_id.to_string(),
            mean_score: pass.mean,
            passed: pass.passed,
            weakest,
            dimension: weakest.dimension(),
            roles,
            pass,
            anchors,
            rounds,
            densified,
            reliable,
            rubric_version: RUBRIC_VERSION,
            card_version: CARD_VERSION,
        }
    }
}

#[async_trait::async_trait]
impl DraftScorer for Critic {
    async fn score(&self, draft: &Draft, pattern: &Pattern) -> Result<CriticReport, CriticError> {
        self.review(draft, pattern).await
    }
}
