//! Revision strategies: patterns ranked per improvement dimension, plus the
//! run-scoped bookkeeping of which ones were used or failed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// What a revision tries to improve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Novelty,
    Stability,
    DomainDistance,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [
        Dimension::Stability,
        Dimension::Novelty,
        Dimension::DomainDistance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Novelty => "novelty",
            Dimension::Stability => "stability",
            Dimension::DomainDistance => "domain_distance",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pattern of the reference corpus, used as a revision strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Number of corpus documents in the cluster.
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub solution_approaches: Vec<String>,
    #[serde(default)]
    pub story_guides: Vec<String>,
    #[serde(default)]
    pub common_tricks: Vec<String>,
    /// Curated reference ids worth showing the judge as extra anchors.
    #[serde(default)]
    pub exemplar_ids: Vec<String>,
}

impl Pattern {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            ..Default::default()
        }
    }

    /// Instructions handed to the generator when revising with this pattern.
    pub fn revision_hints(&self) -> Vec<String> {
        let name = if self.name.is_empty() { &self.id } else { &self.name };
        let mut hints = Vec::new();
        if let Some(approach) = self.solution_approaches.iter().find(|a| !a.trim().is_empty()) {
            hints.push(format!(
                "Rework the method around the core approach of {name}: {}",
                truncate_chars(approach, 200)
            ));
        }
        if let Some(guide) = self.story_guides.first() {
            hints.push(format!("Framing: {}", truncate_chars(guide, 200)));
        }
        let tricks: Vec<&str> = self
            .common_tricks
            .iter()
            .map(String::as_str)
            .filter(|t| !t.trim().is_empty())
            .take(2)
            .collect();
        if !tricks.is_empty() {
            hints.push(format!("Key techniques from {name}: {}", tricks.join(" + ")));
        }
        if hints.is_empty() {
            hints.push(format!("Fuse the core idea of {name} into the current method"));
        }
        hints
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("ranking for {dimension} references unknown pattern {pattern_id}")]
    UnknownPattern {
        dimension: Dimension,
        pattern_id: String,
    },
    #[error("duplicate pattern id: {0}")]
    DuplicatePattern(String),
}

/// Patterns plus a ranked candidate list per dimension.
#[derive(Debug, Clone, Default)]
pub struct PatternCatalog {
    patterns: HashMap<String, Pattern>,
    ranked: BTreeMap<Dimension, Vec<String>>,
}

impl PatternCatalog {
    /// Build a catalog. Dimensions without an explicit ranking fall back to:
    /// stability by cluster size descending, novelty by size ascending, domain
    /// distance in declaration order.
    pub fn new(
        patterns: Vec<Pattern>,
        rankings: BTreeMap<Dimension, Vec<String>>,
    ) -> Result<Self, CatalogError> {
        let order: Vec<String> = patterns.iter().map(|p| p.id.clone()).collect();
        let mut by_id = HashMap::with_capacity(patterns.len());
        for p in patterns {
            let id = p.id.clone();
            if by_id.insert(id.clone(), p).is_some() {
                return Err(CatalogError::DuplicatePattern(id));
            }
        }

        let mut ranked = BTreeMap::new();
        for dimension in Dimension::ALL {
            let list = match rankings.get(&dimension) {
                Some(list) => {
                    for id in list {
                        if !by_id.contains_key(id) {
                            return Err(CatalogError::UnknownPattern {
                                dimension,
                                pattern_id: id.clone(),
                            });
                        }
                    }
                    list.clone()
                }
                None => {
                    let mut list = order.clone();
                    let size = |id: &String| by_id.get(id).map_or(0, |p: &Pattern| p.size);
                    match dimension {
                        Dimension::Stability => {
                            list.sort_by(|a, b| size(b).cmp(&size(a)).then_with(|| a.cmp(b)))
                        }
                        Dimension::Novelty => {
                            list.sort_by(|a, b| size(a).cmp(&size(b)).then_with(|| a.cmp(b)))
                        }
                        Dimension::DomainDistance => {}
                    }
                    list
                }
            };
            ranked.insert(dimension, list);
        }

        Ok(Self {
            patterns: by_id,
            ranked,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn ranked(&self, dimension: Dimension) -> &[String] {
        self.ranked.get(&dimension).map_or(&[], Vec::as_slice)
    }
}

/// Run-scoped strategy state owned by the controller.
///
/// A pattern marked failed for a dimension is never offered for that dimension
/// again within the run.
#[derive(Debug, Clone, Default)]
pub struct StrategyBook {
    cursors: HashMap<Dimension, usize>,
    used: HashSet<String>,
    failed: BTreeMap<String, BTreeSet<Dimension>>,
}

impl StrategyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// First pattern to generate from: stability first, then novelty, then anything.
    pub fn initial<'c>(&mut self, catalog: &'c PatternCatalog) -> Option<(&'c Pattern, Dimension)> {
        for dimension in [Dimension::Stability, Dimension::Novelty, Dimension::DomainDistance] {
            if let Some(p) = self.next_for(catalog, dimension) {
                return Some((p, dimension));
            }
        }
        None
    }

    /// Next untried, non-failed candidate for `dimension`, advancing the cursor.
    pub fn next_for<'c>(
        &mut self,
        catalog: &'c PatternCatalog,
        dimension: Dimension,
    ) -> Option<&'c Pattern> {
        let ranked = catalog.ranked(dimension);
        let cursor = self.cursors.entry(dimension).or_insert(0);
        while *cursor < ranked.len() {
            let id = &ranked[*cursor];
            *cursor += 1;
            let failed = self
                .failed
                .get(id)
                .is_some_and(|dims| dims.contains(&dimension));
            if failed || self.used.contains(id) {
                continue;
            }
            if let Some(pattern) = catalog.get(id) {
                self.used.insert(id.clone());
                return Some(pattern);
            }
        }
        None
    }

    pub fn mark_failed(&mut self, pattern_id: &str, dimension: Dimension) {
        self.failed
            .entry(pattern_id.to_string())
            .or_default()
            .insert(dimension);
    }

    pub fn is_failed(&self, pattern_id: &str, dimension: Dimension) -> bool {
        self.failed
            .get(pattern_id)
            .is_some_and(|dims| dims.contains(&dimension))
    }

    pub fn failures(&self) -> Vec<(String, Dimension)> {
        self.failed
            .iter()
            .flat_map(|(id, dims)| dims.iter().map(move |d| (id.clone(), *d)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(id: &str, size: usize) -> Pattern {
        Pattern {
            size,
            ..Pattern::new(id)
        }
    }

    fn catalog() -> PatternCatalog {
        PatternCatalog::new(
            vec![sized("big", 40), sized("mid", 12), sized("tiny", 3)],
            BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn default_rankings_follow_cluster_size() {
        let c = catalog();
        assert_eq!(c.ranked(Dimension::Stability), ["big", "mid", "tiny"]);
        assert_eq!(c.ranked(Dimension::Novelty), ["tiny", "mid", "big"]);
        assert_eq!(c.ranked(Dimension::DomainDistance), ["big", "mid", "tiny"]);
    }

    #[test]
    fn explicit_ranking_must_reference_known_patterns() {
        let rankings = BTreeMap::from([(Dimension::Novelty, vec!["ghost".to_string()])]);
        let err = PatternCatalog::new(vec![sized("a", 1)], rankings).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownPattern { .. }));
    }

    #[test]
    fn initial_prefers_stability_and_marks_used() {
        let c = catalog();
        let mut book = StrategyBook::new();
        let (p, dim) = book.initial(&c).unwrap();
        assert_eq!(p.id, "big");
        assert_eq!(dim, Dimension::Stability);
        // "big" is used, so novelty walks tiny -> mid and never offers big.
        assert_eq!(book.next_for(&c, Dimension::Novelty).unwrap().id, "tiny");
        assert_eq!(book.next_for(&c, Dimension::Novelty).unwrap().id, "mid");
        assert!(book.next_for(&c, Dimension::Novelty).is_none());
    }

    #[test]
    fn failed_patterns_are_skipped_for_that_dimension_only() {
        let c = catalog();
        let mut book = StrategyBook::new();
        book.mark_failed("tiny", Dimension::Novelty);
        assert!(book.is_failed("tiny", Dimension::Novelty));
        assert!(!book.is_failed("tiny", Dimension::Stability));
        assert_eq!(book.next_for(&c, Dimension::Novelty).unwrap().id, "mid");
        assert_eq!(
            book.failures(),
            vec![("tiny".to_string(), Dimension::Novelty)]
        );
    }

    #[test]
    fn hints_fall_back_to_the_pattern_name() {
        let p = Pattern::new("contrastive-pretraining");
        assert_eq!(p.revision_hints().len(), 1);
        let rich = Pattern {
            solution_approaches: vec!["Use momentum encoders".into()],
            common_tricks: vec!["queue".into(), "temperature".into(), "extra".into()],
            ..Pattern::new("moco")
        };
        let hints = rich.revision_hints();
        assert_eq!(hints.len(), 2);
        assert!(hints[1].contains("queue + temperature"));
    }
}
