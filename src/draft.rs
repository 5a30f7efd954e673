//! The proposal draft exchanged between the generator, the critic and the controller.

use serde::{Deserialize, Serialize};

/// A research-proposal draft.
///
/// Only the fields below are read by the critic; anything else the generator
/// emits is carried through untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "problem_definition")]
    pub problem_framing: String,
    #[serde(default)]
    pub method_skeleton: String,
    #[serde(default, alias = "claims")]
    pub innovation_claims: Vec<String>,
    #[serde(default)]
    pub experiments_plan: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    #[serde(default)]
    pub application: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Draft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn problem(mut self, text: impl Into<String>) -> Self {
        self.problem_framing = text.into();
        self
    }

    pub fn method(mut self, text: impl Into<String>) -> Self {
        self.method_skeleton = text.into();
        self
    }

    pub fn claim(mut self, text: impl Into<String>) -> Self {
        self.innovation_claims.push(text.into());
        self
    }

    pub fn experiments(mut self, text: impl Into<String>) -> Self {
        self.experiments_plan = text.into();
        self
    }
}
