//! Great-delta classification.
//!
//! A write only earns a backup of the previous canonical document when it
//! changes the document substantially, either in serialized size or in the
//! set of top-level keys.

use crate::core::{Document, without_key};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaThresholds {
    /// Relative change of serialized length that counts as great.
    pub size_ratio: f64,
    /// Added plus removed keys, relative to the previous key count.
    pub key_ratio: f64,
}

impl Default for DeltaThresholds {
    fn default() -> Self {
        Self {
            size_ratio: 0.2,
            key_ratio: 0.3,
        }
    }
}

/// Measured difference between two documents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaReport {
    pub identical: bool,
    pub previous_keys: usize,
    pub size_ratio: f64,
    pub key_ratio: f64,
}

impl DeltaReport {
    pub fn is_great(&self, thresholds: &DeltaThresholds) -> bool {
        if self.identical || self.previous_keys == 0 {
            return false;
        }
        self.size_ratio >= thresholds.size_ratio || self.key_ratio >= thresholds.key_ratio
    }
}

/// Computes size and key ratios between `previous` and `next`, ignoring
/// `ignored_key` on both sides.
pub fn measure_delta(previous: &Document, next: &Document, ignored_key: Option<&str>) -> DeltaReport {
    let (previous, next) = match ignored_key {
        Some(key) => (without_key(previous, key), without_key(next, key)),
        None => (previous.clone(), next.clone()),
    };

    let prev_serialized = serde_json::to_string(&previous).unwrap_or_default();
    let next_serialized = serde_json::to_string(&next).unwrap_or_default();

    let prev_len = prev_serialized.len().max(1) as f64;
    let size_ratio = next_serialized.len().abs_diff(prev_serialized.len()) as f64 / prev_len;

    let prev_keys: BTreeSet<&String> = previous.keys().collect();
    let next_keys: BTreeSet<&String> = next.keys().collect();
    let changed_keys = prev_keys.symmetric_difference(&next_keys).count();
    let key_ratio = changed_keys as f64 / prev_keys.len().max(1) as f64;

    DeltaReport {
        identical: prev_serialized == next_serialized,
        previous_keys: prev_keys.len(),
        size_ratio,
        key_ratio,
    }
}

pub fn is_great_delta(
    previous: &Document,
    next: &Document,
    thresholds: &DeltaThresholds,
    ignored_key: Option<&str>,
) -> bool {
    measure_delta(previous, next, ignored_key).is_great(thresholds)
}
