//! Blind draft-vs-anchor comparisons: request, strict validation, bounded repair.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CachedComparisons, JudgementCache, JudgementCacheKey};
use crate::config::JudgeConfig;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};
use crate::reference::{Anchor, Card};
use crate::trace::{emit, AuditEvent, AuditSink};

use super::prompts::{render_judge_prompt, render_repair_prompt, JUDGE_V1};
use super::rubric::{Role, RUBRIC_VERSION};

/// Substrings a rationale may not contain (case-insensitive).
pub const FORBIDDEN_TERMS: [&str; 9] = [
    "score", "score10", "paper_id", "title", "author", "link", "doi", "arxiv", "pattern_id",
];

pub const NEUTRAL_RATIONALE: &str = "Unable to parse; neutral comparison.";

static SCORE_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(10|[1-9])(\.\d+)?\s*/\s*10\b").expect("valid regex"));
static ARXIV_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}\.\d{4,5}(v\d+)?\b").expect("valid regex"));

// =============================================================================
// Comparison types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Judgement {
    Better,
    Tie,
    Worse,
}

impl Judgement {
    /// Observed outcome for the draft: better 1, tie 0.5, worse 0.
    pub fn outcome(&self) -> f64 {
        match self {
            Judgement::Better => 1.0,
            Judgement::Tie => 0.5,
            Judgement::Worse => 0.0,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "better" => Some(Judgement::Better),
            "tie" => Some(Judgement::Tie),
            "worse" => Some(Judgement::Worse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

impl Strength {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weak" => Some(Strength::Weak),
            "medium" => Some(Strength::Medium),
            "strong" => Some(Strength::Strong),
            _ => None,
        }
    }
}

/// One validated draft-vs-anchor judgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub anchor_id: String,
    pub judgement: Judgement,
    pub strength: Strength,
    pub rationale: String,
}

impl Comparison {
    fn neutral(label: &str) -> Self {
        Self {
            anchor_id: label.to_string(),
            judgement: Judgement::Tie,
            strength: Strength::Weak,
            rationale: NEUTRAL_RATIONALE.to_string(),
        }
    }
}

/// Why a judge response was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    ParseFailed(String),
    SchemaInvalid(String),
    MissingAnchors(Vec<String>),
    /// The call returned no judgement at all (refusal, empty or truncated reply).
    Unusable(String),
}

impl InvalidReason {
    pub fn code(&self) -> &'static str {
        match self {
            InvalidReason::ParseFailed(_) => "parse_failed",
            InvalidReason::SchemaInvalid(_) => "schema_invalid",
            InvalidReason::MissingAnchors(_) => "missing_anchors",
            InvalidReason::Unusable(_) => "unusable_reply",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::ParseFailed(detail)
            | InvalidReason::SchemaInvalid(detail)
            | InvalidReason::Unusable(detail) => {
                write!(f, "{}: {detail}", self.code())
            }
            InvalidReason::MissingAnchors(labels) => {
                write!(f, "{}: {}", self.code(), labels.join(", "))
            }
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Extract the first balanced JSON object from a response that may carry prose.
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let remainder = &trimmed[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn rationale_problem(rationale: &str, max_words: usize) -> Option<String> {
    let text = rationale.trim();
    if text.is_empty() {
        return Some("empty rationale".to_string());
    }
    let words = text.split_whitespace().count();
    if words > max_words {
        return Some(format!("rationale has {words} words (max {max_words})"));
    }
    let lower = text.to_lowercase();
    if let Some(term) = FORBIDDEN_TERMS.iter().find(|t| lower.contains(*t)) {
        return Some(format!("rationale mentions forbidden term {term:?}"));
    }
    if SCORE_LIKE_RE.is_match(text) {
        return Some("rationale contains a score-like number".to_string());
    }
    if ARXIV_ID_RE.is_match(text) {
        return Some("rationale contains an identifier".to_string());
    }
    None
}

/// Validate a raw judge response against the anchor labels shown.
///
/// Unknown and duplicate anchor ids are ignored. Every label must be covered;
/// the result is returned in label order.
pub fn validate_response(
    raw: &str,
    labels: &[String],
    max_words: usize,
) -> Result<Vec<Comparison>, InvalidReason> {
    let json = extract_json(raw)
        .ok_or_else(|| InvalidReason::ParseFailed("no JSON object found".to_string()))?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| InvalidReason::ParseFailed(e.to_string()))?;
    let entries = value
        .get("comparisons")
        .and_then(Value::as_array)
        .ok_or_else(|| InvalidReason::SchemaInvalid("missing 'comparisons' array".to_string()))?;

    let known: HashSet<&str> = labels.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut found: Vec<Comparison> = Vec::with_capacity(labels.len());

    for entry in entries {
        let Some(obj) = entry.as_object() else {
            return Err(InvalidReason::SchemaInvalid(
                "comparison entry is not an object".to_string(),
            ));
        };
        let anchor_id = obj
            .get("anchor_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if !known.contains(anchor_id) || seen.contains(anchor_id) {
            debug!(anchor_id, "ignoring unknown or duplicate anchor id");
            continue;
        }

        let text = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default();
        let judgement = Judgement::parse(text("judgement")).ok_or_else(|| {
            InvalidReason::SchemaInvalid(format!("invalid judgement for {anchor_id}"))
        })?;
        let strength = Strength::parse(text("strength")).ok_or_else(|| {
            InvalidReason::SchemaInvalid(format!("invalid strength for {anchor_id}"))
        })?;
        let rationale = text("rationale").trim();
        if let Some(problem) = rationale_problem(rationale, max_words) {
            return Err(InvalidReason::SchemaInvalid(format!("{anchor_id}: {problem}")));
        }

        seen.insert(anchor_id.to_string());
        found.push(Comparison {
            anchor_id: anchor_id.to_string(),
            judgement,
            strength,
            rationale: rationale.to_string(),
        });
    }

    let missing: Vec<String> = labels
        .iter()
        .filter(|l| !seen.contains(l.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(InvalidReason::MissingAnchors(missing));
    }

    let mut ordered = Vec::with_capacity(labels.len());
    for label in labels {
        if let Some(pos) = found.iter().position(|c| &c.anchor_id == label) {
            ordered.push(found.swap_remove(pos));
        }
    }
    Ok(ordered)
}

// =============================================================================
// Comparator
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("{role} judge output still invalid after {attempts} attempts ({reason})")]
    SchemaInvalid {
        role: Role,
        attempts: u32,
        reason: String,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Comparisons for one role plus how they were obtained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JudgeOutcome {
    /// One entry per anchor, in anchor order.
    pub comparisons: Vec<Comparison>,
    /// Neutral fallback produced after repairs ran out.
    pub degraded: bool,
    pub cached: bool,
    pub repairs: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

enum Reply {
    Text(String),
    Unusable(String),
}

pub struct BlindComparator {
    gateway: Arc<dyn ChatGateway>,
    config: JudgeConfig,
    cache: Option<Arc<dyn JudgementCache>>,
    audit: Option<Arc<dyn AuditSink>>,
    run_id: Option<Uuid>,
}

impl BlindComparator {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: JudgeConfig) -> Self {
        Self {
            gateway,
            config,
            cache: None,
            audit: None,
            run_id: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn JudgementCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    fn request(&self, role: Role, messages: Vec<Message>) -> ChatRequest {
        let mut attribution = Attribution::new(role.caller());
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        ChatRequest::new(ChatModel::new(&self.config.model), messages, attribution)
            .temperature(self.config.temperature)
            .max_tokens(self.config.max_tokens)
            .json()
    }

    fn audit(&self, event: AuditEvent) {
        emit(self.audit.as_deref(), self.run_id, event);
    }

    /// Judge the draft against every anchor for one role.
    pub async fn judge(
        &self,
        role: Role,
        draft: &Card,
        anchors: &[Anchor],
    ) -> Result<JudgeOutcome, JudgeError> {
        if anchors.is_empty() {
            return Ok(JudgeOutcome::default());
        }
        let labels: Vec<String> = anchors.iter().map(|a| a.label.clone()).collect();
        let anchor_cards: Vec<(&str, &Card)> = anchors
            .iter()
            .map(|a| (a.label.as_str(), &a.item.card))
            .collect();

        let rendered_anchors: Vec<(&str, String)> = anchor_cards
            .iter()
            .map(|(label, card)| (*label, card.render()))
            .collect();
        let key = JudgementCacheKey::new(
            &self.config.model,
            role,
            RUBRIC_VERSION,
            &JUDGE_V1.hash(),
            &draft.render(),
            &rendered_anchors,
        );

        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(hit)) if hit.comparisons.len() == labels.len() => {
                    debug!(role = %role, key = %key.key_hash, "judgement cache hit");
                    return Ok(JudgeOutcome {
                        comparisons: hit.comparisons,
                        cached: true,
                        ..Default::default()
                    });
                }
                Ok(_) => {}
                Err(err) => warn!(role = %role, error = %err, "judgement cache read failed"),
            }
        }

        let max_words = self.config.rationale_max_words;
        let prompt = render_judge_prompt(role, draft, &anchor_cards, max_words);
        let mut outcome = JudgeOutcome::default();
        let mut reply = self.ask(role, prompt.to_messages(), &mut outcome).await?;
        let mut last_reason;

        loop {
            let checked = match &reply {
                Reply::Text(text) => validate_response(text, &labels, max_words),
                Reply::Unusable(detail) => Err(InvalidReason::Unusable(detail.clone())),
            };
            match checked {
                Ok(comparisons) => {
                    if outcome.repairs > 0 {
                        info!(role = %role, repairs = outcome.repairs, "judge output repaired");
                        self.audit(AuditEvent::JudgeRecovered {
                            role,
                            repairs: outcome.repairs,
                        });
                    }
                    outcome.comparisons = comparisons;
                    self.store(&key, &outcome).await;
                    return Ok(outcome);
                }
                Err(reason) => {
                    warn!(
                        role = %role,
                        attempt = outcome.repairs,
                        reason = %reason,
                        "judge output invalid"
                    );
                    self.audit(AuditEvent::JudgeInvalid {
                        role,
                        attempt: outcome.repairs,
                        reason: reason.to_string(),
                    });
                    last_reason = reason;
                }
            }

            if outcome.repairs >= self.config.repair_attempts {
                break;
            }
            outcome.repairs += 1;
            let previous = match &reply {
                Reply::Text(text) => text.as_str(),
                Reply::Unusable(_) => "",
            };
            let repair = render_repair_prompt(
                previous,
                &labels,
                &last_reason.to_string(),
                max_words,
                self.config.repair_echo_chars,
            );
            reply = self.ask(role, repair.to_messages(), &mut outcome).await?;
        }

        if self.config.strict {
            return Err(JudgeError::SchemaInvalid {
                role,
                attempts: outcome.repairs + 1,
                reason: last_reason.to_string(),
            });
        }

        warn!(role = %role, reason = %last_reason, "falling back to neutral comparisons");
        self.audit(AuditEvent::JudgeNeutralFallback {
            role,
            reason: last_reason.to_string(),
        });
        outcome.comparisons = labels.iter().map(|l| Comparison::neutral(l)).collect();
        outcome.degraded = true;
        Ok(outcome)
    }

    /// One judge call. A reply without a judgement goes down the repair path
    /// like malformed JSON; every other gateway failure is returned.
    async fn ask(
        &self,
        role: Role,
        messages: Vec<Message>,
        outcome: &mut JudgeOutcome,
    ) -> Result<Reply, ProviderError> {
        match self.gateway.chat(self.request(role, messages)).await {
            Ok(response) => {
                outcome.input_tokens += response.input_tokens;
                outcome.output_tokens += response.output_tokens;
                Ok(Reply::Text(response.content))
            }
            Err(err) if err.is_judgement_failure() => Ok(Reply::Unusable(err.to_string())),
            Err(err) => Err(err),
        }
    }

    async fn store(&self, key: &JudgementCacheKey, outcome: &JudgeOutcome) {
        let Some(cache) = &self.cache else {
            return;
        };
        let value = CachedComparisons {
            comparisons: outcome.comparisons.clone(),
            input_tokens: Some(outcome.input_tokens),
            output_tokens: Some(outcome.output_tokens),
        };
        if let Err(err) = cache.put(key, &value).await {
            warn!(error = %err, "judgement cache write failed");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("A{i}")).collect()
    }

    #[test]
    fn accepts_valid_output_in_label_order() {
        let raw = r#"Here you go:
{"comparisons": [
  {"anchor_id": "A2", "judgement": "worse", "strength": "medium", "rationale": "Weaker evaluation plan."},
  {"anchor_id": "A1", "judgement": "Better", "strength": "STRONG", "rationale": "Clearer method {with braces}."}
]}
trailing text"#;
        let out = validate_response(raw, &labels(2), 25).unwrap();
        assert_eq!(out[0].anchor_id, "A1");
        assert_eq!(out[0].judgement, Judgement::Better);
        assert_eq!(out[0].strength, Strength::Strong);
        assert_eq!(out[1].judgement, Judgement::Worse);
    }

    #[test]
    fn unknown_and_duplicate_ids_are_ignored() {
        let raw = r#"{"comparisons": [
  {"anchor_id": "A1", "judgement": "tie", "strength": "weak", "rationale": "Similar."},
  {"anchor_id": "A1", "judgement": "bogus", "strength": "weak", "rationale": "Ignored duplicate."},
  {"anchor_id": "A9", "judgement": "better", "strength": "weak", "rationale": "Unknown."}
]}"#;
        let out = validate_response(raw, &labels(1), 25).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].judgement, Judgement::Tie);
    }

    #[test]
    fn missing_labels_are_reported() {
        let raw = r#"{"comparisons": [{"anchor_id": "A1", "judgement": "tie", "strength": "weak", "rationale": "Same."}]}"#;
        let err = validate_response(raw, &labels(3), 25).unwrap_err();
        assert_eq!(
            err,
            InvalidReason::MissingAnchors(vec!["A2".to_string(), "A3".to_string()])
        );
    }

    #[test]
    fn schema_violations() {
        let bad_enum = r#"{"comparisons": [{"anchor_id": "A1", "judgement": "much better", "strength": "weak", "rationale": "x"}]}"#;
        assert_eq!(
            validate_response(bad_enum, &labels(1), 25).unwrap_err().code(),
            "schema_invalid"
        );

        let long = vec!["word"; 26].join(" ");
        let too_long = format!(
            r#"{{"comparisons": [{{"anchor_id": "A1", "judgement": "tie", "strength": "weak", "rationale": "{long}"}}]}}"#
        );
        assert_eq!(
            validate_response(&too_long, &labels(1), 25).unwrap_err().code(),
            "schema_invalid"
        );

        for rationale in ["The score is higher.", "Rated 8/10 overall.", "Like 2301.01234v2 work.", ""] {
            let raw = format!(
                r#"{{"comparisons": [{{"anchor_id": "A1", "judgement": "tie", "strength": "weak", "rationale": "{rationale}"}}]}}"#
            );
            assert!(
                validate_response(&raw, &labels(1), 25).is_err(),
                "accepted {rationale:?}"
            );
        }
    }

    #[test]
    fn unparseable_output() {
        assert_eq!(
            validate_response("no json here", &labels(1), 25).unwrap_err().code(),
            "parse_failed"
        );
        assert_eq!(
            validate_response("{\"comparisons\": [", &labels(1), 25)
                .unwrap_err()
                .code(),
            "parse_failed"
        );
    }

    #[test]
    fn extract_json_skips_braces_inside_strings() {
        let raw = r#"note {"a": "}", "b": {"c": 1}} tail"#;
        assert_eq!(extract_json(raw), Some(r#"{"a": "}", "b": {"c": 1}}"#));
    }
}
