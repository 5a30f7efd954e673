//! Second-round densification: when the first round looks unreliable, add
//! anchors concentrated around the first-round estimate and score again.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::{AnchorConfig, DensifyConfig};
use crate::inference::Estimate;
use crate::judge::Role;
use crate::reference::{bucket_center, merge_anchors, select_bucket_anchors, Anchor, ReferenceIndex};

/// Why a round should be densified, one entry per failing role check.
pub fn densify_reasons(estimates: &[(Role, &Estimate)], config: &DensifyConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    for (role, est) in estimates {
        if est.loss > config.loss_threshold {
            reasons.push(format!("{role}: loss {:.4} > {}", est.loss, config.loss_threshold));
        }
        if est.monotonicity_violations >= 1 {
            reasons.push(format!(
                "{role}: {} monotonicity violations",
                est.monotonicity_violations
            ));
        }
        if est.mean_strength < config.min_mean_strength {
            reasons.push(format!(
                "{role}: mean strength {:.2} < {}",
                est.mean_strength, config.min_mean_strength
            ));
        }
    }
    reasons
}

#[derive(Debug, Clone, Serialize)]
pub struct DensifyPlan {
    pub center: f64,
    pub hint: f64,
    /// Merged anchor set, relabelled.
    pub anchors: Vec<Anchor>,
    pub added: usize,
    pub reasons: Vec<String>,
}

/// Build the second-round anchor set, or `None` when no new anchor exists.
pub fn plan(
    index: &ReferenceIndex,
    pattern_id: &str,
    first_round: &[Anchor],
    first_scores: &[f64],
    reasons: Vec<String>,
    anchors: &AnchorConfig,
    config: &DensifyConfig,
) -> Option<DensifyPlan> {
    let hint = if first_scores.is_empty() {
        5.0
    } else {
        first_scores.iter().sum::<f64>() / first_scores.len() as f64
    };
    let center = bucket_center(hint);
    let exclude: HashSet<&str> = first_round.iter().map(Anchor::id).collect();
    let extra = select_bucket_anchors(
        index,
        pattern_id,
        center,
        config.bucket_width,
        config.bucket_count,
        &exclude,
    );
    let merged = merge_anchors(first_round, extra, anchors.max_total);
    let added = merged.len().saturating_sub(first_round.len());
    if added == 0 {
        return None;
    }
    Some(DensifyPlan {
        center,
        hint,
        anchors: merged,
        added,
        reasons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnchorConfig;
    use crate::reference::index::tests::raw;
    use crate::reference::select_initial_anchors;

    fn estimate(loss: f64, violations: usize, strength: f64) -> Estimate {
        Estimate {
            score: 5.0,
            loss,
            ci_low: None,
            ci_high: None,
            mean_strength: strength,
            monotonicity_violations: violations,
            tau: 1.0,
            comparisons: 3,
            informative: true,
        }
    }

    #[test]
    fn each_trigger_is_reported() {
        let config = DensifyConfig::default();
        let calm = estimate(0.01, 0, 2.5);
        assert!(densify_reasons(&[(Role::Novelty, &calm)], &config).is_empty());

        let lossy = estimate(0.5, 0, 2.5);
        let inverted = estimate(0.01, 2, 2.5);
        let timid = estimate(0.01, 0, 1.0);
        let reasons = densify_reasons(
            &[
                (Role::Methodology, &lossy),
                (Role::Novelty, &inverted),
                (Role::Storyteller, &timid),
            ],
            &config,
        );
        assert_eq!(reasons.len(), 3);
        assert!(reasons[0].starts_with("Methodology"));
    }

    #[test]
    fn plan_adds_bucket_anchors_and_caps_total() {
        let items = (0..30)
            .map(|i| raw(&format!("r{i:02}"), "p", i as f64 / 29.0, 3))
            .collect();
        let index = ReferenceIndex::from_raw(items).unwrap();
        let config = AnchorConfig::default();
        let first = select_initial_anchors(&index, "p", &[], &config);
        assert_eq!(first.len(), 5);

        let plan = plan(
            &index,
            "p",
            &first,
            &[6.2, 6.4, 6.0],
            vec!["x".into()],
            &config,
            &DensifyConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.center, 6.0);
        assert_eq!(plan.added, 3);
        assert_eq!(plan.anchors.len(), 8);
        let ids: HashSet<&str> = plan.anchors.iter().map(Anchor::id).collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(plan.anchors[7].label, "A8");
    }

    #[test]
    fn no_new_anchor_skips_the_round() {
        let items = (0..3)
            .map(|i| raw(&format!("r{i}"), "p", i as f64 / 2.0, 3))
            .collect();
        let index = ReferenceIndex::from_raw(items).unwrap();
        let config = AnchorConfig::default();
        let first = select_initial_anchors(&index, "p", &[], &config);
        assert!(plan(&index, "p", &first, &[5.0], vec![], &config, &DensifyConfig::default()).is_none());
    }
}
