use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use critic_harness::config::{PassConfig, PassMode, RefineConfig};
use critic_harness::critic::{CriticError, CriticReport, RoleScore};
use critic_harness::draft::Draft;
use critic_harness::gateway::RetryPolicy;
use critic_harness::inference::Estimate;
use critic_harness::judge::{JudgeError, Role, RUBRIC_VERSION};
use critic_harness::pass;
use critic_harness::reference::{ReferenceIndex, CARD_VERSION};
use critic_harness::refine::{
    ControllerError, Dimension, DraftGenerator, DraftScorer, GenerationRequest, GeneratorError,
    IterationStatus, Pattern, PatternCatalog, Phase, RefinementController, TerminalState,
};
use critic_harness::trace::{AuditEvent, MemoryAuditSink};

// =============================================================================
// Fakes
// =============================================================================

#[derive(Clone, Copy)]
enum Step {
    /// Methodology, novelty, storyteller.
    Scores([f64; 3]),
    Fail,
}

#[derive(Debug, Clone)]
struct SeenRequest {
    pattern_id: String,
    prior: Option<String>,
    dimension: Option<Dimension>,
    failed: Vec<(String, Dimension)>,
    constraints: Vec<String>,
}

/// Writes a draft titled after the pattern, carrying the scores the scorer will report.
struct ScriptedGenerator {
    steps: HashMap<&'static str, Step>,
    seen: Mutex<Vec<SeenRequest>>,
    calls: AtomicUsize,
    cancel_on: Option<(&'static str, Arc<AtomicBool>)>,
}

impl ScriptedGenerator {
    fn new(steps: &[(&'static str, Step)]) -> Self {
        Self {
            steps: steps.iter().copied().collect(),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            cancel_on: None,
        }
    }

    fn cancelling_on(mut self, pattern_id: &'static str, flag: Arc<AtomicBool>) -> Self {
        self.cancel_on = Some((pattern_id, flag));
        self
    }

    fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DraftGenerator for ScriptedGenerator {
    async fn generate(&self, req: GenerationRequest<'_>) -> Result<Draft, GeneratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(SeenRequest {
            pattern_id: req.pattern.id.clone(),
            prior: req.prior_draft.map(|d| d.title.clone()),
            dimension: req.feedback.and_then(|f| f.dimension),
            failed: req
                .feedback
                .map(|f| f.failed_strategies.clone())
                .unwrap_or_default(),
            constraints: req.constraints.to_vec(),
        });
        if let Some((id, flag)) = &self.cancel_on {
            if req.pattern.id == *id {
                flag.store(true, Ordering::SeqCst);
            }
        }
        match self.steps.get(req.pattern.id.as_str()) {
            Some(Step::Scores(scores)) => {
                let mut draft = Draft::new(req.pattern.id.clone()).problem("a problem");
                draft.extra.insert("scores".to_string(), json!(scores));
                Ok(draft)
            }
            Some(Step::Fail) | None => Err(GeneratorError::Message("model unavailable".into())),
        }
    }
}

/// Reports the scores embedded in the draft; passes on a mean of at least 7.
struct EmbeddedScorer {
    fail: bool,
}

#[async_trait]
impl DraftScorer for EmbeddedScorer {
    async fn score(&self, draft: &Draft, pattern: &Pattern) -> Result<CriticReport, CriticError> {
        if self.fail {
            return Err(CriticError::Judge(JudgeError::SchemaInvalid {
                role: Role::Novelty,
                attempts: 3,
                reason: "unparseable".into(),
            }));
        }
        let values: Vec<f64> = serde_json::from_value(draft.extra["scores"].clone()).unwrap();
        Ok(report(&pattern.id, &values))
    }
}

fn report(pattern_id: &str, values: &[f64]) -> CriticReport {
    let roles: Vec<RoleScore> = Role::ALL
        .into_iter()
        .zip(values)
        .map(|(role, &score)| RoleScore {
            role,
            score,
            estimate: Estimate {
                score,
                loss: 0.0,
                ci_low: None,
                ci_high: None,
                mean_strength: 2.0,
                monotonicity_violations: 0,
                tau: 1.0,
                comparisons: 5,
                informative: true,
            },
            comparisons: Vec::new(),
            anchors: 5,
            degraded: false,
            cached: false,
        })
        .collect();
    let scores: Vec<(Role, f64)> = roles.iter().map(|r| (r.role, r.score)).collect();
    let config = PassConfig {
        mode: PassMode::Fixed,
        ..PassConfig::default()
    };
    let audit = pass::decide(&ReferenceIndex::default(), pattern_id, &scores, &config);
    let mut weakest = &roles[0];
    for r in &roles {
        if r.score < weakest.score {
            weakest = r;
        }
    }
    let weakest = weakest.role;
    CriticReport {
        pattern_id: pattern_id.to_string(),
        mean_score: audit.mean,
        passed: audit.passed,
        pass: audit,
        weakest,
        dimension: weakest.dimension(),
        roles,
        anchors: Vec::new(),
        rounds: 1,
        densified: None,
        reliable: true,
        rubric_version: RUBRIC_VERSION,
        card_version: CARD_VERSION,
    }
}

fn catalog(rankings: &[(Dimension, &[&str])]) -> Arc<PatternCatalog> {
    let mut ids: Vec<&str> = rankings.iter().flat_map(|(_, ids)| ids.iter().copied()).collect();
    ids.sort_unstable();
    ids.dedup();
    let patterns = ids
        .iter()
        .map(|id| {
            let mut p = Pattern::new(*id);
            p.story_guides = vec![format!("guide from {id}")];
            p
        })
        .collect();
    let rankings: BTreeMap<Dimension, Vec<String>> = rankings
        .iter()
        .map(|(d, ids)| (*d, ids.iter().map(|s| s.to_string()).collect()))
        .collect();
    Arc::new(PatternCatalog::new(patterns, rankings).unwrap())
}

fn controller(
    catalog: Arc<PatternCatalog>,
    generator: Arc<ScriptedGenerator>,
    config: RefineConfig,
) -> RefinementController {
    RefinementController::new(catalog, generator, Arc::new(EmbeddedScorer { fail: false }), config)
        .with_retry(RetryPolicy::none())
}

fn titles(outcome: &critic_harness::refine::RefinementOutcome) -> Vec<(String, IterationStatus)> {
    outcome
        .records
        .iter()
        .map(|r| (r.pattern_id.clone(), r.status))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn revision_of_the_weakest_dimension_reaches_a_pass() {
    let catalog = catalog(&[
        (Dimension::Stability, &["p1", "p2", "p3"]),
        (Dimension::Novelty, &["p4"]),
    ]);
    let generator = Arc::new(ScriptedGenerator::new(&[
        ("p1", Step::Scores([5.0, 6.0, 6.0])),
        ("p2", Step::Scores([8.0, 7.5, 7.5])),
    ]));
    let outcome = controller(catalog, generator.clone(), RefineConfig::default())
        .run(&[], None)
        .await
        .unwrap();

    assert_eq!(outcome.terminal, TerminalState::Passed);
    assert!(outcome.passed);
    assert_eq!(outcome.accepted(), 2);
    assert_eq!(outcome.final_draft.as_ref().unwrap().title, "p2");
    assert!((outcome.final_score.unwrap() - 23.0 / 3.0).abs() < 1e-9);

    let seen = generator.seen();
    assert_eq!(seen[0].prior, None);
    assert_eq!(seen[1].pattern_id, "p2");
    assert_eq!(seen[1].prior.as_deref(), Some("p1"));
    assert_eq!(seen[1].dimension, Some(Dimension::Stability));
    assert_eq!(outcome.records[0].phase, Phase::Initial);
    assert_eq!(outcome.records[1].phase, Phase::Revision);
    assert_eq!(outcome.records[1].dimension, Some(Dimension::Stability));
}

#[tokio::test]
async fn regression_is_rolled_back_without_spending_budget() {
    let catalog = catalog(&[(Dimension::Stability, &["p1", "p2", "p3"])]);
    let generator = Arc::new(ScriptedGenerator::new(&[
        ("p1", Step::Scores([5.0, 6.0, 6.0])),
        ("p2", Step::Scores([4.0, 8.0, 8.0])),
        ("p3", Step::Scores([6.5, 6.0, 6.0])),
    ]));
    let audit = Arc::new(MemoryAuditSink::new());
    let config = RefineConfig {
        max_iterations: 2,
        ..RefineConfig::default()
    };
    let outcome = controller(catalog, generator.clone(), config)
        .with_audit(audit.clone())
        .run(&[], None)
        .await
        .unwrap();

    assert_eq!(outcome.terminal, TerminalState::MaxIterationsReached);
    assert_eq!(
        titles(&outcome),
        [
            ("p1".to_string(), IterationStatus::Accepted),
            ("p2".to_string(), IterationStatus::Reverted),
            ("p3".to_string(), IterationStatus::Accepted),
        ]
    );
    // The reverted step did not advance the budget counter.
    assert_eq!(outcome.records[1].iteration, 1);
    assert_eq!(
        outcome.records[1].failed_strategy,
        Some(("p2".to_string(), Dimension::Stability))
    );
    assert_eq!(outcome.failures, [("p2".to_string(), Dimension::Stability)]);

    // The next revision starts from the draft that was restored.
    let seen = generator.seen();
    assert_eq!(seen[2].prior.as_deref(), Some("p1"));
    assert_eq!(seen[2].failed, [("p2".to_string(), Dimension::Stability)]);

    assert_eq!(outcome.working_draft.as_ref().unwrap().title, "p3");
    // The reverted draft had the highest mean but is discarded.
    assert_eq!(outcome.final_draft.as_ref().unwrap().title, "p3");
    assert_eq!(outcome.best.as_ref().unwrap().record_index, 2);
    let final_title = &outcome.final_draft.as_ref().unwrap().title;
    assert!(outcome
        .records
        .iter()
        .filter(|r| r.status == IterationStatus::Reverted)
        .all(|r| &r.draft.as_ref().unwrap().title != final_title));

    let rollbacks: Vec<_> = audit
        .events()
        .into_iter()
        .filter(|e| matches!(e, AuditEvent::RolledBack { .. }))
        .collect();
    assert_eq!(rollbacks.len(), 1);
    match &rollbacks[0] {
        AuditEvent::RolledBack {
            baseline, current, ..
        } => {
            assert_eq!(*baseline, 5.0);
            assert_eq!(*current, 4.0);
        }
        _ => unreachable!(),
    }
    assert!(matches!(
        audit.events().last(),
        Some(AuditEvent::RunFinished { .. })
    ));
}

#[tokio::test]
async fn small_drop_within_tolerance_is_accepted() {
    let catalog = catalog(&[(Dimension::Stability, &["p1", "p2"])]);
    let generator = Arc::new(ScriptedGenerator::new(&[
        ("p1", Step::Scores([5.0, 6.0, 6.0])),
        ("p2", Step::Scores([4.95, 6.0, 6.0])),
    ]));
    let config = RefineConfig {
        max_iterations: 2,
        ..RefineConfig::default()
    };
    let outcome = controller(catalog, generator, config).run(&[], None).await.unwrap();
    assert_eq!(outcome.records[1].status, IterationStatus::Accepted);
    assert_eq!(outcome.terminal, TerminalState::MaxIterationsReached);
}

#[tokio::test]
async fn generation_failure_is_retried_then_skipped() {
    let catalog = catalog(&[(Dimension::Stability, &["p1", "p2", "p3"])]);
    let generator = Arc::new(ScriptedGenerator::new(&[
        ("p1", Step::Scores([5.0, 6.0, 6.0])),
        ("p2", Step::Fail),
        ("p3", Step::Scores([7.5, 7.0, 7.0])),
    ]));
    let retry = RetryPolicy::none()
        .with_max_retries(2)
        .with_base_delay(Duration::from_millis(1));
    let outcome = controller(catalog, generator.clone(), RefineConfig::default())
        .with_retry(retry)
        .run(&[], None)
        .await
        .unwrap();

    assert_eq!(outcome.terminal, TerminalState::Passed);
    // One initial call, three attempts for p2, one for p3.
    assert_eq!(generator.calls.load(Ordering::SeqCst), 5);
    let failed = &outcome.records[1];
    assert_eq!(failed.status, IterationStatus::GenerationFailed);
    assert!(failed.draft.is_none());
    assert!(failed.error.as_deref().unwrap().contains("model unavailable"));
    assert_eq!(outcome.failures, [("p2".to_string(), Dimension::Stability)]);
    assert_eq!(outcome.accepted(), 2);
}

#[tokio::test]
async fn failed_first_draft_spends_budget_and_moves_on() {
    let catalog = catalog(&[(Dimension::Stability, &["p1", "p2"])]);
    let generator = Arc::new(ScriptedGenerator::new(&[
        ("p1", Step::Fail),
        ("p2", Step::Scores([8.0, 8.0, 8.0])),
    ]));
    let outcome = controller(catalog.clone(), generator, RefineConfig::default())
        .run(&[], None)
        .await
        .unwrap();
    assert_eq!(outcome.terminal, TerminalState::Passed);
    assert_eq!(outcome.records[0].status, IterationStatus::GenerationFailed);
    assert_eq!(outcome.records[1].phase, Phase::Initial);
    assert_eq!(outcome.records[1].iteration, 2);

    let generator = Arc::new(ScriptedGenerator::new(&[("p1", Step::Fail)]));
    let config = RefineConfig {
        max_iterations: 1,
        ..RefineConfig::default()
    };
    let outcome = controller(catalog, generator, config).run(&[], None).await.unwrap();
    assert_eq!(outcome.terminal, TerminalState::MaxIterationsReached);
    assert!(outcome.final_draft.is_none());
}

#[tokio::test]
async fn stalled_dimension_triggers_a_sweep_from_the_same_base() {
    let catalog = catalog(&[
        (Dimension::Stability, &["p1", "p2", "p3", "p5"]),
        (Dimension::Novelty, &["p4"]),
    ]);
    let generator = Arc::new(ScriptedGenerator::new(&[
        ("p1", Step::Scores([5.0, 6.0, 6.0])),
        ("p2", Step::Scores([5.2, 6.0, 6.0])),
        ("p3", Step::Scores([5.5, 6.0, 6.0])),
        ("p5", Step::Scores([6.0, 6.2, 6.0])),
    ]));
    let audit = Arc::new(MemoryAuditSink::new());
    let config = RefineConfig {
        max_iterations: 5,
        ..RefineConfig::default()
    };
    let outcome = controller(catalog, generator.clone(), config)
        .with_audit(audit.clone())
        .run(&[], None)
        .await
        .unwrap();

    assert_eq!(outcome.terminal, TerminalState::Exhausted);
    let phases: Vec<Phase> = outcome.records.iter().map(|r| r.phase).collect();
    assert_eq!(
        phases,
        [
            Phase::Initial,
            Phase::Revision,
            Phase::Sweep { attempt: 1 },
            Phase::Sweep { attempt: 2 },
        ]
    );
    assert!(outcome.records[2..]
        .iter()
        .all(|r| r.status == IterationStatus::SweepAttempt));

    // Every sweep attempt revises the draft the sweep started from.
    let seen = generator.seen();
    assert_eq!(seen[2].prior.as_deref(), Some("p2"));
    assert_eq!(seen[3].prior.as_deref(), Some("p2"));

    // Sweep attempts do not spend the iteration budget.
    assert_eq!(outcome.accepted(), 2);
    assert_eq!(outcome.working_draft.as_ref().unwrap().title, "p5");
    assert_eq!(outcome.final_draft.as_ref().unwrap().title, "p5");

    let events = audit.events();
    assert!(events.iter().any(|e| matches!(
        e,
        AuditEvent::SweepStarted {
            dimension: Dimension::Stability,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        AuditEvent::SweepFinished {
            attempts: 2,
            passed: false,
            ..
        }
    )));
}

#[tokio::test]
async fn sweep_attempt_that_passes_ends_the_run() {
    let catalog = catalog(&[(Dimension::Stability, &["p1", "p2", "p3", "p5"])]);
    let generator = Arc::new(ScriptedGenerator::new(&[
        ("p1", Step::Scores([5.0, 6.0, 6.0])),
        ("p2", Step::Scores([5.1, 6.0, 6.0])),
        ("p3", Step::Scores([8.0, 8.0, 8.0])),
        ("p5", Step::Scores([9.0, 9.0, 9.0])),
    ]));
    let config = RefineConfig {
        max_iterations: 5,
        ..RefineConfig::default()
    };
    let outcome = controller(catalog, generator.clone(), config).run(&[], None).await.unwrap();

    assert_eq!(outcome.terminal, TerminalState::Passed);
    assert_eq!(outcome.final_draft.as_ref().unwrap().title, "p3");
    // p5 was never tried.
    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn no_candidate_for_the_diagnosed_dimension_exhausts() {
    let catalog = catalog(&[
        (Dimension::Stability, &["p1"]),
        (Dimension::Novelty, &["p2"]),
    ]);
    let generator = Arc::new(ScriptedGenerator::new(&[("p1", Step::Scores([5.0, 6.0, 6.0]))]));
    let outcome = controller(catalog, generator, RefineConfig::default())
        .run(&[], None)
        .await
        .unwrap();
    assert_eq!(outcome.terminal, TerminalState::Exhausted);
    assert_eq!(outcome.final_draft.as_ref().unwrap().title, "p1");
    assert_eq!(outcome.records.len(), 1);
}

#[tokio::test]
async fn empty_catalog_exhausts_immediately() {
    let catalog = Arc::new(PatternCatalog::default());
    let generator = Arc::new(ScriptedGenerator::new(&[]));
    let outcome = controller(catalog, generator.clone(), RefineConfig::default())
        .run(&[], None)
        .await
        .unwrap();
    assert_eq!(outcome.terminal, TerminalState::Exhausted);
    assert!(outcome.records.is_empty());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_is_observed_between_steps() {
    let catalog = catalog(&[(Dimension::Stability, &["p1", "p2"])]);

    let flag = AtomicBool::new(true);
    let generator = Arc::new(ScriptedGenerator::new(&[("p1", Step::Scores([5.0, 6.0, 6.0]))]));
    let outcome = controller(catalog.clone(), generator.clone(), RefineConfig::default())
        .run(&[], Some(&flag))
        .await
        .unwrap();
    assert_eq!(outcome.terminal, TerminalState::Cancelled);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

    let flag = Arc::new(AtomicBool::new(false));
    let generator = Arc::new(
        ScriptedGenerator::new(&[
            ("p1", Step::Scores([5.0, 6.0, 6.0])),
            ("p2", Step::Scores([9.0, 9.0, 9.0])),
        ])
        .cancelling_on("p2", flag.clone()),
    );
    let outcome = controller(catalog, generator, RefineConfig::default())
        .run(&[], Some(flag.as_ref()))
        .await
        .unwrap();
    assert_eq!(outcome.terminal, TerminalState::Cancelled);
    assert!(!outcome.passed);
    // The draft generated after cancellation is never scored or committed.
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.final_draft.as_ref().unwrap().title, "p1");
}

#[tokio::test]
async fn constraints_reach_the_generator_and_scoring_errors_abort() {
    let catalog = catalog(&[(Dimension::Stability, &["p1"])]);
    let generator = Arc::new(ScriptedGenerator::new(&[("p1", Step::Scores([5.0, 6.0, 6.0]))]));
    let ctl = RefinementController::new(
        catalog,
        generator.clone(),
        Arc::new(EmbeddedScorer { fail: true }),
        RefineConfig::default(),
    )
    .with_retry(RetryPolicy::none());
    let constraints = vec!["no human subjects".to_string()];
    let err = ctl.run(&constraints, None).await.unwrap_err();
    assert!(matches!(err, ControllerError::Scoring(_)));
    assert_eq!(generator.seen()[0].constraints, constraints);
}
