//! Reference corpus: blind cards, the score index and anchor selection.

pub mod anchors;
pub mod card;
pub mod index;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::refine::{CatalogError, Dimension, Pattern, PatternCatalog};

pub use anchors::{
    bucket_center, merge_anchors, select_bucket_anchors, select_initial_anchors, Anchor,
    AnchorSource,
};
pub use card::{clean_text, Card, CardFields, CARD_VERSION};
pub use index::{
    nearest_rank, IndexError, QuantileSummary, RawReference, ReferenceIndex, ReferenceItem, Scope,
};

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("io error reading corpus: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid corpus json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk corpus: reference items, patterns and optional per-dimension rankings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorpusFile {
    #[serde(default)]
    pub items: Vec<RawReference>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub rankings: BTreeMap<Dimension, Vec<String>>,
}

/// A loaded corpus.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub index: ReferenceIndex,
    pub catalog: PatternCatalog,
}

impl Corpus {
    pub fn from_file(file: CorpusFile) -> Result<Self, CorpusError> {
        let index = ReferenceIndex::from_raw(file.items)?;
        let catalog = PatternCatalog::new(file.patterns, file.rankings)?;
        Ok(Self { index, catalog })
    }

    pub fn from_json(raw: &str) -> Result<Self, CorpusError> {
        let file: CorpusFile = serde_json::from_str(raw)?;
        Self::from_file(file)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let corpus = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            items = corpus.index.len(),
            patterns = corpus.catalog.len(),
            "loaded reference corpus"
        );
        Ok(corpus)
    }
}
