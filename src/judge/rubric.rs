//! Reviewer roles and their rubrics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::refine::Dimension;

/// Bumped whenever rubric text changes; part of every cache key.
pub const RUBRIC_VERSION: &str = "rubric_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Methodology,
    Novelty,
    Storyteller,
}

impl Role {
    /// Evaluation order; also the tie-break order when diagnosing the weakest role.
    pub const ALL: [Role; 3] = [Role::Methodology, Role::Novelty, Role::Storyteller];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Methodology => "Methodology",
            Role::Novelty => "Novelty",
            Role::Storyteller => "Storyteller",
        }
    }

    pub fn rubric(&self) -> &'static str {
        match self {
            Role::Methodology => {
                "Evaluate technical soundness: clarity of method, feasibility, experimental \
                 rigor, and reproducibility. Reward well-justified design choices and complete \
                 evaluation plans; penalize vague or brittle methods."
            }
            Role::Novelty => {
                "Evaluate originality: novelty of the problem framing, method innovation beyond \
                 common combinations, and the uniqueness of the contribution. Penalize routine \
                 stacking or obvious extensions."
            }
            Role::Storyteller => {
                "Evaluate narrative quality: motivation, gap, method, experiment and conclusion \
                 should form one coherent arc with clear claims. Penalize gaps, hand-wavy claims, \
                 or missing experimental closure."
            }
        }
    }

    /// The improvement dimension a weak score in this role points at.
    pub fn dimension(&self) -> Dimension {
        match self {
            Role::Methodology => Dimension::Stability,
            Role::Novelty => Dimension::Novelty,
            Role::Storyteller => Dimension::DomainDistance,
        }
    }

    pub fn for_dimension(dimension: Dimension) -> Role {
        match dimension {
            Dimension::Stability => Role::Methodology,
            Dimension::Novelty => Role::Novelty,
            Dimension::DomainDistance => Role::Storyteller,
        }
    }

    pub(crate) fn caller(&self) -> &'static str {
        match self {
            Role::Methodology => "judge::methodology",
            Role::Novelty => "judge::novelty",
            Role::Storyteller => "judge::storyteller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "methodology" => Ok(Role::Methodology),
            "novelty" => Ok(Role::Novelty),
            "storyteller" => Ok(Role::Storyteller),
            other => Err(format!("unknown role: {other}")),
        }
    }
}
