//! Pass decision against the reference distribution.

use serde::Serialize;
use tracing::debug;

use crate::config::{PassConfig, PassFallback, PassMode};
use crate::judge::Role;
use crate::reference::{QuantileSummary, ReferenceIndex, Scope};

/// Which population the thresholds came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    Pattern,
    Global,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleFlag {
    pub role: Role,
    pub score: f64,
    pub at_q75: bool,
}

/// Everything that went into a pass decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassAudit {
    pub mode: PassMode,
    pub distribution: Distribution,
    pub pattern_id: String,
    /// Population of the distribution used (0 for a fixed threshold).
    pub n: usize,
    pub q50: Option<f64>,
    pub q75: Option<f64>,
    pub fixed_threshold: Option<f64>,
    pub roles: Vec<RoleFlag>,
    pub roles_at_q75: usize,
    pub mean: f64,
    pub mean_ok: bool,
    pub passed: bool,
}

pub fn mean_score(scores: &[(Role, f64)]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|(_, s)| s).sum::<f64>() / scores.len() as f64
}

/// Decide pass or fail for one set of role scores.
pub fn decide(
    index: &ReferenceIndex,
    pattern_id: &str,
    scores: &[(Role, f64)],
    config: &PassConfig,
) -> PassAudit {
    let mean = mean_score(scores);

    let summary = match config.mode {
        PassMode::Fixed => None,
        PassMode::QuantileVote => {
            let pattern = Scope::Pattern(pattern_id);
            if index.population(pattern) >= config.min_pattern_population {
                index
                    .quantile_summary(pattern)
                    .map(|s| (Distribution::Pattern, s))
            } else if config.fallback == PassFallback::Global {
                index
                    .quantile_summary(Scope::Global)
                    .map(|s| (Distribution::Global, s))
            } else {
                None
            }
        }
    };

    let audit = match summary {
        Some((distribution, QuantileSummary { n, q50, q75 })) => {
            let roles: Vec<RoleFlag> = scores
                .iter()
                .map(|&(role, score)| RoleFlag {
                    role,
                    score,
                    at_q75: score >= q75,
                })
                .collect();
            let roles_at_q75 = roles.iter().filter(|r| r.at_q75).count();
            let mean_ok = mean >= q50;
            PassAudit {
                mode: config.mode,
                distribution,
                pattern_id: pattern_id.to_string(),
                n,
                q50: Some(q50),
                q75: Some(q75),
                fixed_threshold: None,
                roles,
                roles_at_q75,
                mean,
                mean_ok,
                passed: roles_at_q75 >= config.min_roles_at_q75 && mean_ok,
            }
        }
        None => {
            let mean_ok = mean >= config.fixed_threshold;
            PassAudit {
                mode: config.mode,
                distribution: Distribution::Fixed,
                pattern_id: pattern_id.to_string(),
                n: 0,
                q50: None,
                q75: None,
                fixed_threshold: Some(config.fixed_threshold),
                roles: scores
                    .iter()
                    .map(|&(role, score)| RoleFlag {
                        role,
                        score,
                        at_q75: false,
                    })
                    .collect(),
                roles_at_q75: 0,
                mean,
                mean_ok,
                passed: mean_ok,
            }
        }
    };

    debug!(
        pattern_id,
        distribution = ?audit.distribution,
        n = audit.n,
        q50 = ?audit.q50,
        q75 = ?audit.q75,
        roles_at_q75 = audit.roles_at_q75,
        mean = audit.mean,
        passed = audit.passed,
        "pass decision"
    );
    audit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::index::tests::raw;
    use crate::reference::ReferenceItem;

    /// 20 items in "big" scoring 1.0, 1.25, ..., 5.75 and 3 items in "small".
    fn index() -> ReferenceIndex {
        let mut items: Vec<ReferenceItem> = (0..20)
            .map(|i| {
                let mut item = ReferenceItem::from_raw(raw(&format!("b{i:02}"), "big", 0.0, 2))
                    .unwrap();
                item.score10 = 1.0 + 0.25 * i as f64;
                item
            })
            .collect();
        items.extend(
            (0..3).map(|i| ReferenceItem::from_raw(raw(&format!("s{i}"), "small", 0.2 * i as f64, 2)).unwrap()),
        );
        ReferenceIndex::from_items(items).unwrap()
    }

    fn scores(m: f64, n: f64, s: f64) -> Vec<(Role, f64)> {
        vec![
            (Role::Methodology, m),
            (Role::Novelty, n),
            (Role::Storyteller, s),
        ]
    }

    #[test]
    fn pattern_rule_boundary() {
        let index = index();
        let summary = index.quantile_summary(Scope::Pattern("big")).unwrap();
        let (q50, q75) = (summary.q50, summary.q75);
        assert_eq!((q50, q75), (3.5, 4.5));
        let config = PassConfig::default();

        // Two roles exactly at q75, third chosen so the mean is exactly q50.
        let third = 3.0 * q50 - 2.0 * q75;
        let audit = decide(&index, "big", &scores(q75, q75, third), &config);
        assert_eq!(audit.distribution, Distribution::Pattern);
        assert_eq!(audit.n, 20);
        assert!(audit.passed, "{audit:?}");

        let audit = decide(&index, "big", &scores(q75, q75 - 0.01, third + 0.01), &config);
        assert_eq!(audit.roles_at_q75, 1);
        assert!(!audit.passed);

        let audit = decide(&index, "big", &scores(q75, q75, third - 0.01), &config);
        assert!(!audit.mean_ok);
        assert!(!audit.passed);
    }

    #[test]
    fn small_pattern_falls_back_to_global() {
        let index = index();
        let audit = decide(&index, "small", &scores(9.0, 9.0, 9.0), &PassConfig::default());
        assert_eq!(audit.distribution, Distribution::Global);
        assert_eq!(audit.n, 23);
        assert!(audit.passed);
    }

    #[test]
    fn fixed_fallback_and_empty_corpus() {
        let config = PassConfig {
            fallback: PassFallback::Fixed,
            ..PassConfig::default()
        };
        let audit = decide(&index(), "small", &scores(7.0, 7.0, 7.0), &config);
        assert_eq!(audit.distribution, Distribution::Fixed);
        assert!(audit.passed);

        let empty = ReferenceIndex::default();
        let audit = decide(&empty, "p", &scores(6.9, 7.0, 7.0), &PassConfig::default());
        assert_eq!(audit.distribution, Distribution::Fixed);
        assert!(!audit.passed);
    }

    #[test]
    fn fixed_mode_ignores_quantiles() {
        let config = PassConfig {
            mode: PassMode::Fixed,
            fixed_threshold: 6.0,
            ..PassConfig::default()
        };
        let audit = decide(&index(), "big", &scores(6.0, 6.0, 6.0), &config);
        assert_eq!(audit.distribution, Distribution::Fixed);
        assert!(audit.passed);
    }
}
