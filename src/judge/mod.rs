//! Blind comparative judging of a draft card against anchor cards.

pub mod comparator;
pub mod prompts;
pub mod rubric;

pub use comparator::{
    extract_json, validate_response, BlindComparator, Comparison, InvalidReason, JudgeError,
    JudgeOutcome, Judgement, Strength, FORBIDDEN_TERMS, NEUTRAL_RATIONALE,
};
pub use prompts::{PromptInstance, PromptTemplate, JUDGE_V1, REPAIR_V1};
pub use rubric::{Role, RUBRIC_VERSION};
