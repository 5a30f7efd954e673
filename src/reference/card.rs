//! Blind cards: the only view of a draft or a reference item the judge sees.
//!
//! A card never carries scores, titles, authors, links or identifiers. Builders
//! cap every field, collapse newlines and scrub URLs, DOIs, arXiv ids and
//! score-like fragments from free text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::draft::Draft;

pub const CARD_VERSION: &str = "blind_card_v1";

/// Per-field character cap.
pub const MAX_FIELD_CHARS: usize = 800;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bhttps?://\S+").expect("valid regex"));
static DOI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(doi:\s*)?10\.\d{4,9}/\S+").expect("valid regex"));
static ARXIV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(arxiv:?\s*)?\d{4}\.\d{4,5}(v\d+)?\b").expect("valid regex")
});
static SCORE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(score10|score|rating)\s*[:=]?\s*\d+(\.\d+)?|\b\d{1,2}(\.\d+)?\s*/\s*10\b")
        .expect("valid regex")
});
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Free-text fields of a reference item as they appear in the corpus file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardFields {
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, alias = "contrib")]
    pub contribution: Option<String>,
    #[serde(default)]
    pub experiments_plan: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub sub_domains: Vec<String>,
    #[serde(default)]
    pub application: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Card {
    pub problem: String,
    pub method: String,
    pub contribution: String,
    pub experiments_plan: String,
    pub domain: String,
    pub sub_domains: String,
    pub application: String,
    /// Missing-field markers such as "problem:missing".
    pub notes: Vec<String>,
}

impl Card {
    pub fn from_draft(draft: &Draft) -> Self {
        let contribution = draft.innovation_claims.join("; ");
        let mut notes = Vec::new();
        for (name, value) in [
            ("problem", draft.problem_framing.as_str()),
            ("method", draft.method_skeleton.as_str()),
            ("contrib", contribution.as_str()),
            ("experiments_plan", draft.experiments_plan.as_str()),
        ] {
            if value.trim().is_empty() {
                notes.push(format!("{name}:missing"));
            }
        }

        Self {
            problem: clean_text(&draft.problem_framing),
            method: clean_text(&draft.method_skeleton),
            contribution: clean_text(&contribution),
            experiments_plan: clean_text(&draft.experiments_plan),
            domain: clean_text(&draft.domain),
            sub_domains: clean_text(&draft.sub_domains.join(", ")),
            application: clean_text(&draft.application),
            notes,
        }
    }

    pub fn from_reference(fields: &CardFields) -> Self {
        let text = |v: &Option<String>| v.as_deref().unwrap_or("").trim().to_string();
        let problem = text(&fields.problem);
        let method = text(&fields.method);
        let contribution = text(&fields.contribution);
        let experiments = text(&fields.experiments_plan);

        let mut notes = Vec::new();
        if problem.is_empty() {
            notes.push("problem:missing".to_string());
        }
        if method.is_empty() {
            notes.push("method:missing".to_string());
        }
        if contribution.is_empty() {
            notes.push("contrib:missing".to_string());
        }
        let experiments = if experiments.is_empty() {
            notes.push("experiments_plan:unknown".to_string());
            "unknown".to_string()
        } else {
            experiments
        };

        Self {
            problem: clean_text(&problem),
            method: clean_text(&method),
            contribution: clean_text(&contribution),
            experiments_plan: clean_text(&experiments),
            domain: clean_text(&text(&fields.domain)),
            sub_domains: clean_text(&fields.sub_domains.join(", ")),
            application: clean_text(&text(&fields.application)),
            notes,
        }
    }

    /// Plain-text rendering used inside judge prompts and cache keys.
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Problem: {}", self.problem),
            format!("Method: {}", self.method),
            format!("Contribution: {}", self.contribution),
            format!("Experiments: {}", self.experiments_plan),
        ];
        if !self.domain.is_empty() {
            lines.push(format!("Domain: {}", self.domain));
        }
        if !self.sub_domains.is_empty() {
            lines.push(format!("Sub-domains: {}", self.sub_domains));
        }
        if !self.application.is_empty() {
            lines.push(format!("Application: {}", self.application));
        }
        if !self.notes.is_empty() {
            lines.push(format!("Notes: {}", self.notes.join(", ")));
        }
        lines.join("\n")
    }
}

/// Scrub identifiers and score fragments, flatten whitespace and cap the length.
pub fn clean_text(text: &str) -> String {
    let text = URL_RE.replace_all(text, " ");
    let text = DOI_RE.replace_all(&text, " ");
    let text = ARXIV_RE.replace_all(&text, " ");
    let text = SCORE_RE.replace_all(&text, " ");
    let text = SPACE_RE.replace_all(&text, " ");
    let text = text.trim();

    if text.chars().count() > MAX_FIELD_CHARS {
        let mut capped: String = text.chars().take(MAX_FIELD_CHARS).collect();
        capped.truncate(capped.trim_end().len());
        capped.push('…');
        capped
    } else {
        text.to_string()
    }
}
