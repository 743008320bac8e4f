//! Composite aggregation buckets and query descriptors.
//!
//! A bucket is one row of a multi-field group-by over flow logs: an ordered key,
//! a document count, nested term aggregations and numeric aggregations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One named value of a composite key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeAggregationSourceValue {
    pub name: String,
    pub value: serde_json::Value,
}

impl CompositeAggregationSourceValue {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// String value, or empty if the value is not a string.
    pub fn as_str(&self) -> &str { self.value.as_str().unwrap_or("") }

    /// Numeric value, or 0 if the value is not a number.
    pub fn as_f64(&self) -> f64 { self.value.as_f64().unwrap_or(0.0) }
}

/// Ordered composite key. Serializes as a JSON list of `{name, value}` so that
/// positional ordering survives the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeAggregationKey(pub SmallVec<[CompositeAggregationSourceValue; 16]>);

impl CompositeAggregationKey {
    pub fn new(values: impl IntoIterator<Item = CompositeAggregationSourceValue>) -> Self {
        Self(values.into_iter().collect())
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn get(&self, idx: usize) -> Option<&CompositeAggregationSourceValue> { self.0.get(idx) }

    /// String value at `idx`, empty if missing or not a string.
    pub fn str_at(&self, idx: usize) -> &str { self.0.get(idx).map(|v| v.as_str()).unwrap_or("") }

    /// Numeric value at `idx`, 0 if missing or not a number.
    pub fn f64_at(&self, idx: usize) -> f64 { self.0.get(idx).map(|v| v.as_f64()).unwrap_or(0.0) }

    pub fn set(&mut self, idx: usize, value: CompositeAggregationSourceValue) {
        if let Some(slot) = self.0.get_mut(idx) { *slot = value; }
    }

    /// The first `n` entries as a new key.
    pub fn prefix(&self, n: usize) -> Self { Self(self.0.iter().take(n).cloned().collect()) }

    /// True if every value of `self` equals the value at the same position in `other`.
    /// `other` must have at least as many entries.
    pub fn same_bucket(&self, other: &CompositeAggregationKey) -> bool {
        if other.len() < self.len() { return false; }
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a.value == b.value)
    }
}

/// Results of a nested terms aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedTerm {
    pub doc_count: i64,
    pub buckets: BTreeMap<String, i64>,
}

impl AggregatedTerm {
    pub fn new(doc_count: i64) -> Self { Self { doc_count, buckets: BTreeMap::new() } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeAggregationBucket {
    pub key: CompositeAggregationKey,
    pub doc_count: i64,
    #[serde(default)]
    pub aggregated_terms: BTreeMap<String, AggregatedTerm>,
    #[serde(default)]
    pub aggregated_sums: BTreeMap<String, f64>,
    #[serde(default)]
    pub aggregated_max: BTreeMap<String, f64>,
    #[serde(default)]
    pub aggregated_min: BTreeMap<String, f64>,
    #[serde(default)]
    pub aggregated_mean: BTreeMap<String, f64>,
}

impl CompositeAggregationBucket {
    pub fn new(doc_count: i64) -> Self { Self { doc_count, ..Default::default() } }

    pub fn with_key(key: CompositeAggregationKey, doc_count: i64) -> Self { Self { key, doc_count, ..Default::default() } }

    /// Merge `other` into this bucket. The key is not compared.
    pub fn aggregate(&mut self, other: &CompositeAggregationBucket) {
        let total = self.doc_count + other.doc_count;
        for (name, mean_in) in other.aggregated_mean.iter() {
            let out = self.aggregated_mean.entry(name.clone()).or_insert(0.0);
            *out = if total == 0 { 0.0 } else { (*out * self.doc_count as f64 + mean_in * other.doc_count as f64) / total as f64 };
        }
        self.doc_count = total;

        for (name, tin) in other.aggregated_terms.iter() {
            let tout = self.aggregated_terms.entry(name.clone()).or_default();
            tout.doc_count += tin.doc_count;
            for (k, v) in tin.buckets.iter() {
                *tout.buckets.entry(k.clone()).or_insert(0) += v;
            }
        }
        for (name, v) in other.aggregated_sums.iter() {
            *self.aggregated_sums.entry(name.clone()).or_insert(0.0) += v;
        }
        for (name, v) in other.aggregated_max.iter() {
            let out = self.aggregated_max.entry(name.clone()).or_insert(*v);
            *out = out.max(*v);
        }
        for (name, v) in other.aggregated_min.iter() {
            let out = self.aggregated_min.entry(name.clone()).or_insert(*v);
            *out = out.min(*v);
        }
    }

    /// Replace the buckets of term `name` with `values`, each counted with the term doc
    /// count. A missing term is created with the bucket doc count.
    pub fn set_aggregated_terms_from_strings<S: AsRef<str>>(&mut self, name: &str, values: &[S]) {
        let doc_count = self.doc_count;
        let term = self.aggregated_terms.entry(name.to_string()).or_insert_with(|| AggregatedTerm::new(doc_count));
        term.buckets.clear();
        for v in values {
            term.buckets.insert(v.as_ref().to_string(), term.doc_count);
        }
    }
}

/// A terms source of the composite aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeSourceInfo {
    pub name: String,
    pub field: String,
}

/// A nested single-term aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedTermInfo {
    pub name: String,
    pub path: String,
    pub term: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumInfo {
    pub name: String,
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Description of a composite aggregation search, executed by the log store layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeAggregationQuery {
    pub document_index: String,
    /// Store-native filter query, passed through untouched.
    #[serde(default)]
    pub query: serde_json::Value,
    pub name: String,
    #[serde(default)]
    pub composite_sources: Vec<CompositeSourceInfo>,
    #[serde(default)]
    pub nested_terms: Vec<NestedTermInfo>,
    #[serde(default)]
    pub sums: Vec<SumInfo>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}
