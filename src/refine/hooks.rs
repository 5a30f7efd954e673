//! Seams between the refinement loop and the outside world.
//!
//! The controller stays agnostic of how drafts are written and scored. Callers inject:
//! - a [`DraftGenerator`] that writes or revises a draft from a pattern
//! - a [`DraftScorer`] that critiques a draft (the [`crate::critic::Critic`] in production)

use serde::Serialize;

use crate::critic::{CriticError, CriticReport};
use crate::draft::Draft;
use crate::judge::Role;

use super::strategy::{Dimension, Pattern};

/// What the generator learns from the last critique.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RevisionFeedback {
    pub dimension: Option<Dimension>,
    pub role_scores: Vec<(Role, f64)>,
    /// Hints accumulated from every pattern tried so far.
    pub hints: Vec<String>,
    /// Patterns that already failed, with the dimension they failed on.
    pub failed_strategies: Vec<(String, Dimension)>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub pattern: &'a Pattern,
    /// Free-form constraints carried through the whole run.
    pub constraints: &'a [String],
    /// Draft being revised; `None` for the first draft.
    pub prior_draft: Option<&'a Draft>,
    pub feedback: Option<&'a RevisionFeedback>,
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator failed: {0}")]
    Message(String),
    #[error("generator returned an unusable draft: {0}")]
    InvalidDraft(String),
}

#[async_trait::async_trait]
pub trait DraftGenerator: Send + Sync {
    async fn generate(&self, req: GenerationRequest<'_>) -> Result<Draft, GeneratorError>;
}

#[async_trait::async_trait]
pub trait DraftScorer: Send + Sync {
    async fn score(&self, draft: &Draft, pattern: &Pattern) -> Result<CriticReport, CriticError>;
}
