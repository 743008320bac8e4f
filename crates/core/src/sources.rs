//! Composite source layout used by the preview pipeline.
//!
//! This module provides:
//! - The ordered composite sources requested from the log store (identity first)
//! - Stable indexes into raw and output keys
//! - Nested term and sum aggregations carried through the pipeline
//! - Query augmentation that keeps the UI sources as a prefix

use crate::aggregation::{CompositeAggregationQuery, CompositeSourceInfo, NestedTermInfo, SumInfo};

pub const FLOW_INDEX: &str = "tigera_secure_ee_flows";
pub const FLOWLOG_BUCKETS: &str = "flog_buckets";
pub const FLOW_NAME_AGGREGATED: &str = "-";
pub const FLOW_NAMESPACE_NONE: &str = "-";
pub const FLOW_IP_NONE: &str = "0.0.0.0";

// ---------------- Raw key indexes (stable) ----------------
pub const RAW_IDX_SOURCE_TYPE: usize = 0;
pub const RAW_IDX_SOURCE_NAMESPACE: usize = 1;
pub const RAW_IDX_SOURCE_NAME_AGGR: usize = 2;
pub const RAW_IDX_DEST_TYPE: usize = 3;
pub const RAW_IDX_DEST_NAMESPACE: usize = 4;
pub const RAW_IDX_DEST_NAME_AGGR: usize = 5;
pub const RAW_IDX_REPORTER: usize = 6;
pub const RAW_IDX_ACTION: usize = 7;
pub const RAW_IDX_PROTO: usize = 8;
pub const RAW_IDX_SOURCE_IP: usize = 9;
pub const RAW_IDX_SOURCE_NAME: usize = 10;
pub const RAW_IDX_SOURCE_PORT: usize = 11;
pub const RAW_IDX_DEST_IP: usize = 12;
pub const RAW_IDX_DEST_NAME: usize = 13;
pub const RAW_IDX_DEST_PORT: usize = 14;
pub const RAW_NUM_SOURCES: usize = 15;

/// Number of leading key entries that identify a flow group. When these change the
/// pipeline has clocked to the next group.
pub const NUM_IDENTITY_SOURCES: usize = 6;

// ---------------- Output key indexes (stable) ----------------
pub const OUT_IDX_REPORTER: usize = 6;
pub const OUT_IDX_ACTION: usize = 7;
pub const OUT_IDX_SOURCE_ACTION: usize = 8;
pub const OUT_IDX_IMPACTED: usize = 9;
pub const OUT_NUM_SOURCES: usize = 10;

pub const TERMS_POLICIES: &str = "policies";
pub const TERMS_SOURCE_LABELS: &str = "source_labels";
pub const TERMS_DEST_LABELS: &str = "dest_labels";

fn src(name: &str, field: &str) -> CompositeSourceInfo { CompositeSourceInfo { name: name.to_string(), field: field.to_string() } }

/// Sources the UI asks for.
pub fn ui_composite_sources() -> Vec<CompositeSourceInfo> {
    vec![
        src("source_type", "source_type"),
        src("source_namespace", "source_namespace"),
        src("source_name", "source_name_aggr"),
        src("dest_type", "dest_type"),
        src("dest_namespace", "dest_namespace"),
        src("dest_name", "dest_name_aggr"),
        src("reporter", "reporter"),
        src("action", "action"),
    ]
}

/// Full source list for a preview query. Order matters: the store returns buckets
/// sorted by these sources, which lets the pipeline close a group as soon as the
/// identity sources change.
pub fn pip_composite_sources() -> Vec<CompositeSourceInfo> {
    let mut out = ui_composite_sources();
    out.extend([
        src("proto", "proto"),
        src("source_ip", "source_ip"),
        // The UI "source_name" is backed by source_name_aggr, so the full name needs its own alias.
        src("source_name_full", "source_name"),
        src("source_port", "source_port"),
        src("dest_ip", "dest_ip"),
        src("dest_name_full", "dest_name"),
        src("dest_port", "dest_port"),
    ]);
    out
}

pub fn pip_nested_terms() -> Vec<NestedTermInfo> {
    let t = |name: &str, term: &str, field: &str| NestedTermInfo { name: name.to_string(), path: name.to_string(), term: term.to_string(), field: field.to_string() };
    vec![
        t(TERMS_POLICIES, "by_tiered_policy", "policies.all_policies"),
        t(TERMS_DEST_LABELS, "by_kvpair", "dest_labels.labels"),
        t(TERMS_SOURCE_LABELS, "by_kvpair", "source_labels.labels"),
    ]
}

pub fn ui_sums() -> Vec<SumInfo> {
    [
        ("sum_num_flows_started", "num_flows_started"),
        ("sum_num_flows_completed", "num_flows_completed"),
        ("sum_packets_in", "packets_in"),
        ("sum_bytes_in", "bytes_in"),
        ("sum_packets_out", "packets_out"),
        ("sum_bytes_out", "bytes_out"),
        ("sum_http_requests_allowed_in", "http_requests_allowed_in"),
        ("sum_http_requests_denied_in", "http_requests_denied_in"),
    ]
    .iter()
    .map(|(name, field)| SumInfo { name: name.to_string(), field: field.to_string() })
    .collect()
}

impl CompositeAggregationQuery {
    /// Query with the extra sources, terms and sums needed by the preview, keeping
    /// the caller's index, filter, name and time range.
    ///
    /// The UI sources are always the leading entries of the preview layout, and the
    /// pipeline addresses key entries by position, so the composite sources are
    /// replaced wholesale rather than merged.
    pub fn augment_for_preview(&self) -> CompositeAggregationQuery {
        let sources = pip_composite_sources();

        let mut sums = self.sums.clone();
        for s in ui_sums() {
            if !sums.iter().any(|x| x.name == s.name) { sums.push(s); }
        }
        let mut nested_terms = self.nested_terms.clone();
        for t in pip_nested_terms() {
            if !nested_terms.iter().any(|x| x.name == t.name) { nested_terms.push(t); }
        }

        CompositeAggregationQuery {
            document_index: if self.document_index.is_empty() { FLOW_INDEX.to_string() } else { self.document_index.clone() },
            query: self.query.clone(),
            name: if self.name.is_empty() { FLOWLOG_BUCKETS.to_string() } else { self.name.clone() },
            composite_sources: sources,
            nested_terms,
            sums,
            time_range: self.time_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pip_sources_match_raw_indexes() {
        let s = pip_composite_sources();
        assert_eq!(s.len(), RAW_NUM_SOURCES);
        assert_eq!(s[RAW_IDX_REPORTER].name, "reporter");
        assert_eq!(s[RAW_IDX_ACTION].name, "action");
        assert_eq!(s[RAW_IDX_SOURCE_NAME].field, "source_name");
        assert_eq!(s[RAW_IDX_DEST_PORT].name, "dest_port");
    }

    #[test]
    fn augment_keeps_ui_prefix_and_filter() {
        let q = CompositeAggregationQuery {
            document_index: "tigera_secure_ee_flows.cluster.*".into(),
            query: serde_json::json!({ "bool": { "must": [] } }),
            name: "flog_buckets".into(),
            composite_sources: ui_composite_sources(),
            ..Default::default()
        };
        let aq = q.augment_for_preview();
        assert_eq!(aq.document_index, q.document_index);
        assert_eq!(aq.query, q.query);
        assert_eq!(&aq.composite_sources[..q.composite_sources.len()], &q.composite_sources[..]);
        assert_eq!(aq.composite_sources, pip_composite_sources());
        assert_eq!(aq.nested_terms.len(), 3);
        assert_eq!(aq.sums.len(), 8);
    }

    #[test]
    fn augment_fills_defaults_for_empty_query() {
        let aq = CompositeAggregationQuery::default().augment_for_preview();
        assert_eq!(aq.document_index, FLOW_INDEX);
        assert_eq!(aq.name, FLOWLOG_BUCKETS);
        assert_eq!(aq.composite_sources.len(), 15);
    }
}
