//! Score inference: maximum-likelihood placement of a draft on the anchor scale.
//!
//! Each comparison is a Bernoulli observation of "draft beats anchor" with
//! `P(better | S, a) = sigmoid((S - a) / tau)`. Ties count as y = 0.5. The
//! draft score `S` minimizes the weighted binary cross-entropy over a grid on
//! [1, 10]; the grid is built by index so the same step always visits the same
//! points.

use serde::Serialize;
use tracing::warn;

use crate::config::{InferenceConfig, StrengthWeights};
use crate::judge::{Comparison, Judgement, Strength};
use crate::reference::Anchor;

const PROB_EPS: f64 = 1e-9;
const SCALE_MIN: f64 = 1.0;
const SCALE_MAX: f64 = 10.0;
/// Outcome gap counted as a monotonicity violation.
const VIOLATION_GAP: f64 = 0.1;

// ---------------------------------------------------------------------
//  Observations
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Observation {
    pub anchor_score10: f64,
    pub anchor_weight: f64,
    /// 1 for better, 0.5 for tie, 0 for worse.
    pub outcome: f64,
    pub strength_multiplier: f64,
}

impl Observation {
    pub fn weight(&self) -> f64 {
        self.anchor_weight * self.strength_multiplier
    }
}

pub fn strength_multiplier(strength: Strength, weights: &StrengthWeights) -> f64 {
    match strength {
        Strength::Weak => weights.weak,
        Strength::Medium => weights.medium,
        Strength::Strong => weights.strong,
    }
}

/// Pair anchors with their comparisons. An anchor without a comparison counts
/// as a weak tie.
pub fn observations(
    anchors: &[Anchor],
    comparisons: &[Comparison],
    weights: &StrengthWeights,
) -> Vec<Observation> {
    anchors
        .iter()
        .map(|anchor| {
            let (judgement, strength) = comparisons
                .iter()
                .find(|c| c.anchor_id == anchor.label)
                .map_or((Judgement::Tie, Strength::Weak), |c| (c.judgement, c.strength));
            Observation {
                anchor_score10: anchor.score10(),
                anchor_weight: anchor.weight(),
                outcome: judgement.outcome(),
                strength_multiplier: strength_multiplier(strength, weights),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------
//  Estimate
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub score: f64,
    /// Weighted loss at the chosen score.
    pub loss: f64,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
    pub mean_strength: f64,
    pub monotonicity_violations: usize,
    pub tau: f64,
    pub comparisons: usize,
    /// False when there was no usable evidence and `score` is the neutral value.
    pub informative: bool,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn bce(y: f64, p: f64) -> f64 {
    let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Weighted loss of placing the draft at `s`.
pub fn loss_at(s: f64, observations: &[Observation], tau: f64) -> f64 {
    observations
        .iter()
        .map(|o| o.weight() * bce(o.outcome, sigmoid((s - o.anchor_score10) / tau)))
        .sum()
}

/// Grid points over [1, 10] for `step`, always including both ends.
pub fn grid(step: f64) -> Vec<f64> {
    let span = SCALE_MAX - SCALE_MIN;
    let steps = ((span / step) + 1e-9).floor() as usize;
    let mut points: Vec<f64> = (0..=steps)
        .map(|i| (SCALE_MIN + i as f64 * step).min(SCALE_MAX))
        .collect();
    if points.last().is_some_and(|&last| last < SCALE_MAX - 1e-9) {
        points.push(SCALE_MAX);
    }
    points
}

/// Pairs where the strictly higher anchor got a more favorable outcome for the draft.
pub fn monotonicity_violations(observations: &[Observation]) -> usize {
    let mut count = 0;
    for (i, lower) in observations.iter().enumerate() {
        for higher in &observations[i + 1..] {
            let (lo, hi) = if lower.anchor_score10 <= higher.anchor_score10 {
                (lower, higher)
            } else {
                (higher, lower)
            };
            if hi.anchor_score10 > lo.anchor_score10 && hi.outcome > lo.outcome + VIOLATION_GAP {
                count += 1;
            }
        }
    }
    count
}

fn effective_tau(tau: f64) -> f64 {
    if tau.is_finite() && tau > 0.0 {
        tau
    } else {
        warn!(tau, "non-positive tau; using 1.0");
        1.0
    }
}

const DEFAULT_GRID_STEP: f64 = 0.01;

fn effective_step(step: f64) -> f64 {
    if step.is_finite() && step > 0.0 && step <= SCALE_MAX - SCALE_MIN {
        step
    } else {
        warn!(step, "invalid grid step; using {DEFAULT_GRID_STEP}");
        DEFAULT_GRID_STEP
    }
}

/// Infer the draft's score from its observations.
pub fn infer_score(observations: &[Observation], tau: f64, config: &InferenceConfig) -> Estimate {
    let tau = effective_tau(tau);
    let mean_strength = if observations.is_empty() {
        config.strength_weights.weak
    } else {
        observations.iter().map(|o| o.strength_multiplier).sum::<f64>() / observations.len() as f64
    };
    let monotonicity_violations = monotonicity_violations(observations);

    let total_weight: f64 = observations.iter().map(Observation::weight).sum();
    if !(total_weight.is_finite() && total_weight > 0.0) {
        return Estimate {
            score: config.neutral_score,
            loss: 0.0,
            ci_low: None,
            ci_high: None,
            mean_strength,
            monotonicity_violations,
            tau,
            comparisons: observations.len(),
            informative: false,
        };
    }

    let points = grid(effective_step(config.grid_step));
    let losses: Vec<f64> = points.iter().map(|&s| loss_at(s, observations, tau)).collect();

    // First strict minimum wins.
    let mut best = 0;
    for (i, &loss) in losses.iter().enumerate() {
        if loss < losses[best] {
            best = i;
        }
    }
    let best_loss = losses[best];

    let threshold = best_loss + config.ci_loss_delta;
    let mut within = points
        .iter()
        .zip(&losses)
        .filter(|(_, &l)| l <= threshold)
        .map(|(&s, _)| s);
    let ci_low = within.next();
    let ci_high = within.last().or(ci_low);

    Estimate {
        score: points[best],
        loss: best_loss,
        ci_low,
        ci_high,
        mean_strength,
        monotonicity_violations,
        tau,
        comparisons: observations.len(),
        informative: true,
    }
}
