//! Deterministic anchor selection.
//!
//! Initial anchors span a pattern's score distribution at fixed quantiles and may
//! be padded with curated exemplars. Bucket anchors concentrate near a score hint
//! and feed the densified second round.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;

use crate::config::AnchorConfig;

use super::index::{nearest_rank, ReferenceIndex, ReferenceItem};

/// Why an item was picked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnchorSource {
    /// Nearest-rank item for a quantile.
    Quantile { q: f64 },
    /// Population no larger than the quantile list: every item is an anchor.
    Population,
    Exemplar,
    Bucket { center: f64 },
}

/// A reference item presented to the judge under an opaque label.
#[derive(Debug, Clone, Serialize)]
pub struct Anchor {
    pub label: String,
    pub item: ReferenceItem,
    pub source: AnchorSource,
}

impl Anchor {
    fn new(item: &ReferenceItem, source: AnchorSource) -> Self {
        Self {
            label: String::new(),
            item: item.clone(),
            source,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    pub fn score10(&self) -> f64 {
        self.item.score10
    }

    pub fn weight(&self) -> f64 {
        self.item.weight
    }
}

/// Initial anchors for one pattern.
///
/// Returns at most `max_initial` anchors and, for a non-empty pattern, at least
/// `min(population, quantiles.len(), max_initial)`. Labels are `A1..An`.
pub fn select_initial_anchors(
    index: &ReferenceIndex,
    pattern_id: &str,
    exemplar_ids: &[String],
    config: &AnchorConfig,
) -> Vec<Anchor> {
    let items = index.items_for_pattern(pattern_id);
    let n = items.len();
    let mut anchors: Vec<Anchor> = Vec::new();

    if n <= config.quantiles.len() {
        anchors.extend(items.iter().map(|i| Anchor::new(i, AnchorSource::Population)));
    } else {
        let mut taken = vec![false; n];
        for &q in &config.quantiles {
            if let Some(idx) = nearest_free(nearest_rank(n, q), &taken) {
                taken[idx] = true;
                anchors.push(Anchor::new(items[idx], AnchorSource::Quantile { q }));
            }
        }
    }

    let mut exemplars: Vec<&ReferenceItem> = exemplar_ids
        .iter()
        .filter_map(|id| index.get(id))
        .collect();
    exemplars.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| b.review_count.cmp(&a.review_count))
            .then_with(|| a.id.cmp(&b.id))
    });
    exemplars.dedup_by(|a, b| a.id == b.id);

    let mut added = 0;
    for item in exemplars {
        if added >= config.max_exemplars {
            break;
        }
        if anchors.iter().any(|a| a.item.id == item.id) {
            continue;
        }
        anchors.push(Anchor::new(item, AnchorSource::Exemplar));
        added += 1;
    }

    if anchors.len() > config.max_initial {
        anchors.sort_by(by_weight_then_score);
        anchors.truncate(config.max_initial);
    }

    relabel(&mut anchors);
    anchors
}

/// Anchors concentrated in `center ± width / 2`, backfilled by distance.
///
/// Items whose ids are in `exclude` are never returned.
pub fn select_bucket_anchors(
    index: &ReferenceIndex,
    pattern_id: &str,
    center: f64,
    width: f64,
    count: usize,
    exclude: &HashSet<&str>,
) -> Vec<Anchor> {
    let half = width / 2.0;
    let source = AnchorSource::Bucket { center };
    let candidates: Vec<&ReferenceItem> = index
        .items_for_pattern(pattern_id)
        .into_iter()
        .filter(|i| !exclude.contains(i.id.as_str()))
        .collect();

    let (mut inside, mut outside): (Vec<&ReferenceItem>, Vec<&ReferenceItem>) = candidates
        .into_iter()
        .partition(|i| (i.score10 - center).abs() <= half + 1e-9);

    inside.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| a.score10.total_cmp(&b.score10))
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut anchors: Vec<Anchor> = inside
        .into_iter()
        .take(count)
        .map(|i| Anchor::new(i, source))
        .collect();

    if anchors.len() < count {
        outside.sort_by(|a, b| {
            let da = (a.score10 - center).abs();
            let db = (b.score10 - center).abs();
            da.total_cmp(&db)
                .then_with(|| b.weight.total_cmp(&a.weight))
                .then_with(|| a.id.cmp(&b.id))
        });
        let missing = count - anchors.len();
        anchors.extend(outside.into_iter().take(missing).map(|i| Anchor::new(i, source)));
    }

    relabel(&mut anchors);
    anchors
}

/// Bucket center for a score hint, snapped to the nearest half point.
pub fn bucket_center(hint: f64) -> f64 {
    (hint * 2.0).round() / 2.0
}

/// Append `extra` anchors not already in `base` (by item id), cap the total and relabel.
pub fn merge_anchors(base: &[Anchor], extra: Vec<Anchor>, max_total: usize) -> Vec<Anchor> {
    let mut merged: Vec<Anchor> = base.to_vec();
    for anchor in extra {
        if merged.len() >= max_total {
            break;
        }
        if merged.iter().any(|a| a.item.id == anchor.item.id) {
            continue;
        }
        merged.push(anchor);
    }
    relabel(&mut merged);
    merged
}

fn relabel(anchors: &mut [Anchor]) {
    for (i, anchor) in anchors.iter_mut().enumerate() {
        anchor.label = format!("A{}", i + 1);
    }
}

fn by_weight_then_score(a: &Anchor, b: &Anchor) -> Ordering {
    b.item
        .weight
        .total_cmp(&a.item.weight)
        .then_with(|| a.item.score10.total_cmp(&b.item.score10))
        .then_with(|| a.item.id.cmp(&b.item.id))
}

/// Closest index to `rank` not yet taken, preferring the lower side on ties.
fn nearest_free(rank: usize, taken: &[bool]) -> Option<usize> {
    let n = taken.len();
    for d in 0..n {
        if d <= rank && !taken[rank - d] {
            return Some(rank - d);
        }
        if rank + d < n && !taken[rank + d] {
            return Some(rank + d);
        }
    }
    None
}
