#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use critic_harness::draft::Draft;
use critic_harness::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError};

static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bA(\d+)\b").unwrap());
static ANCHOR_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<anchor id="(A\d+)">(.*?)</anchor>"#).unwrap());
static LEVEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"level (\d+(?:\.\d+)?)").unwrap());

type Responder = dyn Fn(usize, &ChatRequest) -> Result<String, ProviderError> + Send + Sync;

/// In-process judge: every call is answered by a closure of (call index, request).
pub struct ScriptedGateway {
    responder: Box<Responder>,
    calls: AtomicUsize,
    callers: Mutex<Vec<&'static str>>,
}

impl ScriptedGateway {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(usize, &ChatRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            callers: Mutex::new(Vec::new()),
        }
    }

    /// Same verdict for every anchor.
    pub fn uniform(judgement: &'static str, strength: &'static str) -> Self {
        Self::new(move |_, req| Ok(comparisons_json(&labels_in(req), judgement, strength)))
    }

    /// Compares the draft's "level N" marker against each anchor's.
    pub fn by_level() -> Self {
        Self::new(|_, req| Ok(level_judgements(req)))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn callers(&self) -> Vec<&'static str> {
        self.callers.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.callers.lock().unwrap().push(req.attribution.caller);
        let content = (self.responder)(n, &req)?;
        Ok(ChatResponse::text(content))
    }
}

fn user_text(req: &ChatRequest) -> String {
    req.messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Anchor labels mentioned anywhere in the request, in numeric order.
pub fn labels_in(req: &ChatRequest) -> Vec<String> {
    let text = user_text(req);
    let mut numbers: Vec<u32> = LABEL_RE
        .captures_iter(&text)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    numbers.sort_unstable();
    numbers.dedup();
    numbers.into_iter().map(|n| format!("A{n}")).collect()
}

pub fn comparisons_json(labels: &[String], judgement: &str, strength: &str) -> String {
    let comparisons: Vec<_> = labels
        .iter()
        .map(|l| {
            json!({
                "anchor_id": l,
                "judgement": judgement,
                "strength": strength,
                "rationale": "clearer framing of the core question"
            })
        })
        .collect();
    json!({ "rubric_version": "rubric_v1", "comparisons": comparisons }).to_string()
}

fn level_judgements(req: &ChatRequest) -> String {
    let text = user_text(req);
    let draft_level = text
        .split("<draft_card>")
        .nth(1)
        .and_then(|rest| LEVEL_RE.captures(rest))
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(5.0);
    let comparisons: Vec<_> = ANCHOR_BLOCK_RE
        .captures_iter(&text)
        .map(|c| {
            let anchor_level = LEVEL_RE
                .captures(&c[2])
                .and_then(|l| l[1].parse::<f64>().ok())
                .unwrap_or(5.0);
            let (judgement, strength) = if draft_level > anchor_level + 0.25 {
                ("better", "strong")
            } else if draft_level < anchor_level - 0.25 {
                ("worse", "strong")
            } else {
                ("tie", "medium")
            };
            json!({
                "anchor_id": &c[1],
                "judgement": judgement,
                "strength": strength,
                "rationale": "compared on the stated method"
            })
        })
        .collect();
    json!({ "rubric_version": "rubric_v1", "comparisons": comparisons }).to_string()
}

/// Corpus JSON with `n` items for pattern `p1`, evenly spread over quality [0, 1].
///
/// Each card carries a "level X" marker equal to its score on the 1–10 scale.
pub fn corpus_json(n: usize) -> String {
    let items: Vec<_> = (0..n)
        .map(|i| {
            let quality = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.5 };
            let level = 1.0 + 9.0 * quality;
            json!({
                "id": format!("r{i:02}"),
                "pattern_id": "p1",
                "problem": format!("Reference problem at level {level:.2}"),
                "method": "a method",
                "contrib": "a contribution",
                "quality": quality,
                "review_count": 3,
                "highest": (quality + 0.02).min(1.0),
                "lowest": (quality - 0.02).max(0.0)
            })
        })
        .collect();
    json!({
        "items": items,
        "patterns": [
            { "id": "p1", "name": "Pattern one", "size": n, "story_guides": ["lead with the failure case"] },
            { "id": "p2", "name": "Pattern two" }
        ],
        "rankings": { "stability": ["p1", "p2"], "novelty": ["p2", "p1"] }
    })
    .to_string()
}

pub fn draft_at(level: f64) -> Draft {
    Draft::new("A draft")
        .problem(format!("Draft problem at level {level:.2}"))
        .method("a method")
        .claim("a contribution")
        .experiments("a plan")
}
