//! Adaptive refinement: strategy bookkeeping, injection seams and the loop itself.

pub mod controller;
pub mod hooks;
pub mod strategy;

pub use controller::{
    BestSoFar, ControllerError, IterationRecord, IterationStatus, Phase, RefinementController,
    RefinementOutcome, TerminalState,
};
pub use hooks::{DraftGenerator, DraftScorer, GenerationRequest, GeneratorError, RevisionFeedback};
pub use strategy::{CatalogError, Dimension, Pattern, PatternCatalog, StrategyBook};
