#![forbid(unsafe_code)]

//! # critic-harness
//!
//! A blind comparative-judgment critic for research-proposal drafts, and an
//! adaptive refinement loop built on top of it.
//!
//! Instead of asking an LLM to "rate this proposal 1–10" (unreliable,
//! miscalibrated), the critic shows three reviewer roles the draft next to a
//! handful of anonymised reference proposals with known review scores and asks
//! for better / tie / worse judgements. A one-dimensional logistic fit turns those
//! judgements into a calibrated 1–10 score per role, with a loss-based confidence
//! band. The pass verdict compares role scores against the score quantiles of the
//! draft's pattern in the reference corpus.
//!
//! The [`refine::RefinementController`] drives generate → critique → diagnose →
//! revise, rolling back regressions and sweeping strategies when a dimension
//! stalls.

pub mod cache;
pub mod config;
pub mod critic;
pub mod densify;
pub mod draft;
pub mod gateway;
pub mod inference;
pub mod judge;
pub mod pass;
pub mod reference;
pub mod refine;
pub mod trace;

pub use cache::{JudgementCache, JudgementCacheKey, SqliteJudgementCache};
pub use config::{CriticConfig, PassMode};
pub use critic::{Critic, CriticError, CriticReport, RoleScore};
pub use draft::Draft;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use judge::{BlindComparator, Comparison, JudgeError, Judgement, Role, Strength};
pub use reference::{Anchor, Card, Corpus, ReferenceIndex};
pub use refine::{
    Dimension, DraftGenerator, DraftScorer, Pattern, PatternCatalog, RefinementController,
    RefinementOutcome, TerminalState,
};
pub use trace::{AuditEvent, AuditSink, JsonlAuditSink, MemoryAuditSink};
