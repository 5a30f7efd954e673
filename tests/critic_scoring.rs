mod common;

use std::sync::Arc;

use common::{corpus_json, draft_at, ScriptedGateway};
use critic_harness::config::{CriticConfig, DensifyConfig, JudgeConfig, PassMode};
use critic_harness::critic::{Critic, CriticError};
use critic_harness::judge::{JudgeError, Role};
use critic_harness::pass::Distribution;
use critic_harness::reference::Corpus;
use critic_harness::refine::Pattern;
use critic_harness::trace::{AuditEvent, MemoryAuditSink};

fn corpus(n: usize) -> Corpus {
    Corpus::from_json(&corpus_json(n)).unwrap()
}

fn no_densify() -> CriticConfig {
    CriticConfig {
        densify: DensifyConfig {
            enabled: false,
            ..DensifyConfig::default()
        },
        ..CriticConfig::default()
    }
}

fn critic(gateway: Arc<ScriptedGateway>, corpus: &Corpus, config: CriticConfig) -> Critic {
    Critic::new(gateway, Arc::new(corpus.index.clone()), config)
}

fn p1(corpus: &Corpus) -> Pattern {
    corpus.catalog.get("p1").cloned().unwrap()
}

#[tokio::test]
async fn strong_draft_passes_against_the_pattern_distribution() {
    let corpus = corpus(30);
    let gateway = Arc::new(ScriptedGateway::by_level());
    let critic = critic(gateway.clone(), &corpus, no_densify());

    let report = critic.review(&draft_at(9.5), &p1(&corpus)).await.unwrap();
    assert_eq!(gateway.calls(), 3);
    let roles: Vec<Role> = report.roles.iter().map(|r| r.role).collect();
    assert_eq!(roles, Role::ALL);
    assert_eq!(report.rounds, 1);
    assert_eq!(report.anchors.len(), 5);
    assert!(report.reliable);
    assert_eq!(report.pass.mode, PassMode::QuantileVote);
    assert_eq!(report.pass.distribution, Distribution::Pattern);
    assert_eq!(report.pass.n, 30);
    assert!(report.passed, "{:?}", report.pass);
    assert!(report.mean_score > 7.8);
}

#[tokio::test]
async fn weak_draft_fails_and_scores_below_a_strong_one() {
    let corpus = corpus(30);
    let gateway = Arc::new(ScriptedGateway::by_level());
    let critic = critic(gateway, &corpus, no_densify());
    let pattern = p1(&corpus);

    let weak = critic.review(&draft_at(2.0), &pattern).await.unwrap();
    let strong = critic.review(&draft_at(8.5), &pattern).await.unwrap();
    assert!(!weak.passed);
    assert!(weak.mean_score < strong.mean_score);
    for role in Role::ALL {
        assert!(weak.score(role).unwrap() < 5.0);
    }
    assert_eq!(weak.dimension, weak.weakest.dimension());
}

#[tokio::test]
async fn indecisive_judge_triggers_a_densified_second_round() {
    let corpus = corpus(30);
    let gateway = Arc::new(ScriptedGateway::uniform("tie", "weak"));
    let audit = Arc::new(MemoryAuditSink::new());
    let critic = critic(gateway.clone(), &corpus, CriticConfig::default()).with_audit(audit.clone());

    let report = critic.review(&draft_at(5.0), &p1(&corpus)).await.unwrap();
    assert_eq!(report.rounds, 2);
    assert_eq!(gateway.calls(), 6);
    let densified = report.densified.as_ref().unwrap();
    assert!(densified.added > 0);
    assert!(densified.reasons.iter().any(|r| r.contains("mean strength")));
    assert_eq!(report.anchors.len(), 5 + densified.added);
    assert!(report.anchors.len() <= CriticConfig::default().anchors.max_total);

    let events = audit.events();
    let rounds: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            AuditEvent::RoundScored { round, .. } => Some(*round),
            _ => None,
        })
        .collect();
    assert_eq!(rounds, [1, 2]);
    assert!(events.iter().any(|e| matches!(e, AuditEvent::Densified { .. })));
    assert!(matches!(events.last(), Some(AuditEvent::PassDecided { .. })));
}

#[tokio::test]
async fn pattern_without_references_gets_a_neutral_unreliable_report() {
    let corpus = corpus(30);
    let gateway = Arc::new(ScriptedGateway::by_level());
    let critic = critic(gateway.clone(), &corpus, CriticConfig::default());
    let p2 = corpus.catalog.get("p2").cloned().unwrap();

    let report = critic.review(&draft_at(9.0), &p2).await.unwrap();
    assert_eq!(gateway.calls(), 0);
    assert!(!report.reliable);
    assert!(report.anchors.is_empty());
    assert_eq!(report.pass.mode, PassMode::Fixed);
    assert!(!report.passed);
    assert!(report.roles.iter().all(|r| r.score == 5.0));
}

#[tokio::test]
async fn small_pattern_falls_back_to_global_quantiles() {
    let corpus = corpus(8);
    let gateway = Arc::new(ScriptedGateway::by_level());
    let critic = critic(gateway, &corpus, no_densify());

    let report = critic.review(&draft_at(9.8), &p1(&corpus)).await.unwrap();
    assert_eq!(report.pass.distribution, Distribution::Global);
}

#[tokio::test]
async fn lenient_judging_marks_the_report_unreliable() {
    let corpus = corpus(30);
    let gateway = Arc::new(ScriptedGateway::new(|_, _| Ok("not json".to_string())));
    let mut config = no_densify();
    config.judge = JudgeConfig {
        strict: false,
        repair_attempts: 0,
        ..JudgeConfig::default()
    };
    let critic = critic(gateway, &corpus, config);

    let report = critic.review(&draft_at(6.0), &p1(&corpus)).await.unwrap();
    assert!(!report.reliable);
    assert!(report.roles.iter().all(|r| r.degraded));
}

#[tokio::test]
async fn strict_judging_fails_the_review() {
    let corpus = corpus(30);
    let gateway = Arc::new(ScriptedGateway::new(|_, _| Ok("not json".to_string())));
    let mut config = no_densify();
    config.judge.repair_attempts = 0;
    let critic = critic(gateway, &corpus, config);

    let err = critic.review(&draft_at(6.0), &p1(&corpus)).await.unwrap_err();
    assert!(matches!(
        err,
        CriticError::Judge(JudgeError::SchemaInvalid { .. })
    ));
}

#[tokio::test]
async fn out_of_range_inference_settings_are_corrected() {
    let corpus = corpus(30);
    let gateway = Arc::new(ScriptedGateway::by_level());
    let mut config = no_densify();
    config.inference.grid_step = 0.0;
    let critic = critic(gateway, &corpus, config);
    assert_eq!(critic.config().inference.grid_step, 0.01);

    let report = critic.review(&draft_at(7.0), &p1(&corpus)).await.unwrap();
    assert!(report.roles.iter().all(|r| (1.0..=10.0).contains(&r.score)));
}
