//! Prompt templates for blind draft-vs-anchor comparisons.
//!
//! Domain logic for rendering judge prompts. Provider-agnostic.

use crate::gateway::Message;
use crate::reference::Card;

use super::rubric::{Role, RUBRIC_VERSION};

// =============================================================================
// Rendered prompt
// =============================================================================

/// Rendered prompt ready for the judge.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters so card text cannot break the prompt's tags.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Templates
// =============================================================================

/// A prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Stable hash of the template text, used in cache keys.
    pub fn hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.slug.as_bytes());
        hasher.update(b"|");
        hasher.update(self.system.as_bytes());
        hasher.update(b"|");
        hasher.update(self.user.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn fill(&self, text: &str, vars: &[(&str, &str)]) -> String {
        let mut out = text.to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out.trim().to_string()
    }
}

const OUTPUT_SHAPE: &str = r#"{"rubric_version": "{rubric_version}", "comparisons": [{"anchor_id": "A1", "judgement": "better|tie|worse", "strength": "weak|medium|strong", "rationale": "..."}]}"#;

pub const JUDGE_V1: PromptTemplate = PromptTemplate {
    slug: "blind_judge_v1",
    system: r#"You are a strict reviewer focused on {role}.
You MUST NOT output any numeric score, title, author, link, identifier or any other real-world reference.
You compare one Draft card against several anonymous Anchor cards using only the card content.
Return JSON only, no markdown."#,
    user: r#"<rubric role="{role}">
{rubric}
</rubric>

<draft_card>
{draft_card}
</draft_card>

<anchor_cards>
{anchor_cards}
</anchor_cards>

For EACH anchor ({anchor_ids}) judge the Draft against that Anchor on {role}:
- judgement: better | tie | worse (is the Draft better than the Anchor?)
- strength: weak | medium | strong
- rationale: at most {max_words} words, about card content only; never mention scores or identifiers.

Return exactly:
{output_shape}"#,
};

pub const REPAIR_V1: PromptTemplate = PromptTemplate {
    slug: "blind_judge_repair_v1",
    system: r#"You fix malformed reviewer output into strict JSON. Return JSON only, no markdown, no explanation."#,
    user: r#"Rules:
1) Output JSON ONLY.
2) "comparisons" must contain exactly one entry per anchor: {anchor_ids}.
3) judgement must be one of: better|tie|worse.
4) strength must be one of: weak|medium|strong.
5) rationale must be at most {max_words} words and MUST NOT mention scores or identifiers.
Last problem found: {reason}.

<previous_output>
{previous_output}
</previous_output>

Return ONLY the corrected JSON:
{output_shape}"#,
};

fn output_shape() -> String {
    OUTPUT_SHAPE.replace("{rubric_version}", RUBRIC_VERSION)
}

/// First prompt of a judge call.
pub fn render_judge_prompt(
    role: Role,
    draft: &Card,
    anchors: &[(&str, &Card)],
    max_words: usize,
) -> PromptInstance {
    let anchor_blocks: Vec<String> = anchors
        .iter()
        .map(|(label, card)| {
            format!(
                "<anchor id=\"{label}\">\n{}\n</anchor>",
                escape_xml_chars(&card.render())
            )
        })
        .collect();
    let anchor_ids = anchors
        .iter()
        .map(|(label, _)| *label)
        .collect::<Vec<_>>()
        .join(", ");
    let draft_card = escape_xml_chars(&draft.render());
    let anchor_cards = anchor_blocks.join("\n\n");
    let max_words = max_words.to_string();
    let shape = output_shape();

    let vars = [
        ("role", role.as_str()),
        ("rubric", role.rubric()),
        ("draft_card", draft_card.as_str()),
        ("anchor_cards", anchor_cards.as_str()),
        ("anchor_ids", anchor_ids.as_str()),
        ("max_words", max_words.as_str()),
        ("output_shape", shape.as_str()),
    ];

    PromptInstance {
        template_slug: JUDGE_V1.slug,
        system: JUDGE_V1.fill(JUDGE_V1.system, &vars),
        user: JUDGE_V1.fill(JUDGE_V1.user, &vars),
    }
}

/// Repair prompt echoing (a capped prefix of) the invalid output.
pub fn render_repair_prompt(
    previous_output: &str,
    anchor_labels: &[String],
    reason: &str,
    max_words: usize,
    echo_chars: usize,
) -> PromptInstance {
    let echoed: String = previous_output.chars().take(echo_chars).collect();
    let echoed = escape_xml_chars(&echoed);
    let anchor_ids = anchor_labels.join(", ");
    let max_words = max_words.to_string();
    let shape = output_shape();

    let vars = [
        ("anchor_ids", anchor_ids.as_str()),
        ("max_words", max_words.as_str()),
        ("reason", reason),
        ("previous_output", echoed.as_str()),
        ("output_shape", shape.as_str()),
    ];

    PromptInstance {
        template_slug: REPAIR_V1.slug,
        system: REPAIR_V1.fill(REPAIR_V1.system, &vars),
        user: REPAIR_V1.fill(REPAIR_V1.user, &vars),
    }
}

// =============================================================================
// TESTS
// =============================================================================
