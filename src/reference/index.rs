//! Reference corpus index: per-pattern score distributions and anchor weights.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::card::{Card, CardFields};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("duplicate reference id: {0}")]
    DuplicateId(String),
    #[error("reference {id} has non-finite quality")]
    InvalidQuality { id: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid corpus json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One reference item as stored in the corpus file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReference {
    pub id: String,
    pub pattern_id: String,
    #[serde(flatten)]
    pub card: CardFields,
    /// Mean normalized review quality in [0, 1].
    pub quality: f64,
    #[serde(default)]
    pub review_count: u32,
    /// Highest and lowest normalized review measurement, when known.
    #[serde(default)]
    pub highest: Option<f64>,
    #[serde(default)]
    pub lowest: Option<f64>,
}

/// An indexed, immutable reference item.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceItem {
    pub id: String,
    pub pattern_id: String,
    pub card: Card,
    pub quality: f64,
    pub review_count: u32,
    /// `1 + 9 * quality`.
    pub score10: f64,
    /// Spread of the underlying reviews on the 10-point scale.
    pub dispersion10: f64,
    /// `ln(1 + review_count) / (1 + dispersion10)`.
    pub weight: f64,
}

impl ReferenceItem {
    pub fn from_raw(raw: RawReference) -> Result<Self, IndexError> {
        if !raw.quality.is_finite() {
            return Err(IndexError::InvalidQuality { id: raw.id });
        }
        let quality = if (0.0..=1.0).contains(&raw.quality) {
            raw.quality
        } else {
            warn!(id = %raw.id, quality = raw.quality, "quality outside [0, 1]; clamping");
            raw.quality.clamp(0.0, 1.0)
        };

        let dispersion10 = match (raw.highest, raw.lowest) {
            (Some(hi), Some(lo)) if hi.is_finite() && lo.is_finite() => (9.0 * (hi - lo)).max(0.0),
            _ => 0.0,
        };
        let score10 = 1.0 + 9.0 * quality;
        let weight = (1.0 + raw.review_count as f64).ln() / (1.0 + dispersion10);

        Ok(Self {
            card: Card::from_reference(&raw.card),
            id: raw.id,
            pattern_id: raw.pattern_id,
            quality,
            review_count: raw.review_count,
            score10,
            dispersion10,
            weight,
        })
    }
}

/// Which population a quantile query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Pattern(&'a str),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuantileSummary {
    pub n: usize,
    pub q50: f64,
    pub q75: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    items: Vec<ReferenceItem>,
    by_id: HashMap<String, usize>,
    /// Item positions per pattern, ordered by (score10, id).
    by_pattern: BTreeMap<String, Vec<usize>>,
    global_scores: Vec<f64>,
}

impl ReferenceIndex {
    pub fn from_raw(raw: Vec<RawReference>) -> Result<Self, IndexError> {
        let items = raw
            .into_iter()
            .map(ReferenceItem::from_raw)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_items(items)
    }

    pub fn from_items(mut items: Vec<ReferenceItem>) -> Result<Self, IndexError> {
        items.sort_by(|a, b| a.score10.total_cmp(&b.score10).then_with(|| a.id.cmp(&b.id)));

        let mut by_id = HashMap::with_capacity(items.len());
        let mut by_pattern: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, item) in items.iter().enumerate() {
            if by_id.insert(item.id.clone(), idx).is_some() {
                return Err(IndexError::DuplicateId(item.id.clone()));
            }
            by_pattern
                .entry(item.pattern_id.clone())
                .or_default()
                .push(idx);
        }
        let global_scores = items.iter().map(|i| i.score10).collect();

        Ok(Self {
            items,
            by_id,
            by_pattern,
            global_scores,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ReferenceItem> {
        self.by_id.get(id).map(|&idx| &self.items[idx])
    }

    pub fn pattern_ids(&self) -> impl Iterator<Item = &str> {
        self.by_pattern.keys().map(String::as_str)
    }

    /// Items of one pattern ordered by (score10, id). Empty for unknown patterns.
    pub fn items_for_pattern(&self, pattern_id: &str) -> Vec<&ReferenceItem> {
        self.by_pattern
            .get(pattern_id)
            .map(|idxs| idxs.iter().map(|&i| &self.items[i]).collect())
            .unwrap_or_default()
    }

    pub fn pattern_size(&self, pattern_id: &str) -> usize {
        self.by_pattern.get(pattern_id).map_or(0, Vec::len)
    }

    pub fn population(&self, scope: Scope<'_>) -> usize {
        match scope {
            Scope::Pattern(id) => self.pattern_size(id),
            Scope::Global => self.items.len(),
        }
    }

    /// Nearest-rank quantile of score10; `None` when the population is empty.
    pub fn quantile(&self, scope: Scope<'_>, q: f64) -> Option<f64> {
        match scope {
            Scope::Global => quantile_sorted(&self.global_scores, q),
            Scope::Pattern(id) => {
                let scores: Vec<f64> = self
                    .items_for_pattern(id)
                    .iter()
                    .map(|i| i.score10)
                    .collect();
                quantile_sorted(&scores, q)
            }
        }
    }

    pub fn quantile_summary(&self, scope: Scope<'_>) -> Option<QuantileSummary> {
        Some(QuantileSummary {
            n: self.population(scope),
            q50: self.quantile(scope, 0.5)?,
            q75: self.quantile(scope, 0.75)?,
        })
    }
}

/// Index of the nearest-rank element for quantile `q` in a population of `n`.
pub fn nearest_rank(n: usize, q: f64) -> usize {
    if n == 0 {
        return 0;
    }
    let q = if q.is_finite() { q.clamp(0.0, 1.0) } else { 0.5 };
    ((q * (n - 1) as f64).round() as usize).min(n - 1)
}

fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    Some(sorted[nearest_rank(sorted.len(), q)])
}
