//! Dataset type classification by governing temporal dimension.

use std::collections::HashMap;
use std::fmt;

use crate::types::DatasetType;

/// Which temporal quantity decides whether a dataset has left the embargo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemporalAnchor {
    /// Selected through `visit` dimension records.
    Visit,
    /// Selected through `exposure` dimension records.
    Exposure,
    /// No temporal dimension; selected by ingest timestamp.
    IngestDate,
}

impl TemporalAnchor {
    /// Classify a dataset type. `visit` wins over `exposure` when both are
    /// present.
    pub fn of(dataset_type: &DatasetType) -> Self {
        if dataset_type.has_dimension("visit") {
            TemporalAnchor::Visit
        } else if dataset_type.has_dimension("exposure") {
            TemporalAnchor::Exposure
        } else {
            TemporalAnchor::IngestDate
        }
    }

    /// Dimension element to query, if the anchor is dimension-bound.
    pub fn dimension(&self) -> Option<&'static str> {
        match self {
            TemporalAnchor::Visit => Some("visit"),
            TemporalAnchor::Exposure => Some("exposure"),
            TemporalAnchor::IngestDate => None,
        }
    }
}

impl fmt::Display for TemporalAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemporalAnchor::Visit => write!(f, "visit-bound"),
            TemporalAnchor::Exposure => write!(f, "exposure-bound"),
            TemporalAnchor::IngestDate => write!(f, "timestamp-bound"),
        }
    }
}

/// Caches classifications by dataset type name for the duration of a run.
#[derive(Debug, Default)]
pub struct Classifier {
    cache: HashMap<String, TemporalAnchor>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, dataset_type: &DatasetType) -> TemporalAnchor {
        *self
            .cache
            .entry(dataset_type.name.clone())
            .or_insert_with(|| TemporalAnchor::of(dataset_type))
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
