//! Raw bucket to [`Flow`] conversion.

use std::net::IpAddr;

use pip_core::sources::*;
use pip_core::{protocol_number, Action, CompositeAggregationBucket, CompositeAggregationKey, EndpointType, Flow, FlowEndpointData, Labels, Reporter};
use serde_json::Value;
use tracing::warn;

struct EndpointIdx {
    endpoint_type: usize,
    namespace: usize,
    name_aggr: usize,
    name: usize,
    ip: usize,
    port: usize,
    labels: &'static str,
}

const SOURCE: EndpointIdx = EndpointIdx {
    endpoint_type: RAW_IDX_SOURCE_TYPE,
    namespace: RAW_IDX_SOURCE_NAMESPACE,
    name_aggr: RAW_IDX_SOURCE_NAME_AGGR,
    name: RAW_IDX_SOURCE_NAME,
    ip: RAW_IDX_SOURCE_IP,
    port: RAW_IDX_SOURCE_PORT,
    labels: TERMS_SOURCE_LABELS,
};

const DEST: EndpointIdx = EndpointIdx {
    endpoint_type: RAW_IDX_DEST_TYPE,
    namespace: RAW_IDX_DEST_NAMESPACE,
    name_aggr: RAW_IDX_DEST_NAME_AGGR,
    name: RAW_IDX_DEST_NAME,
    ip: RAW_IDX_DEST_IP,
    port: RAW_IDX_DEST_PORT,
    labels: TERMS_DEST_LABELS,
};

/// Non-negative integer at `idx`, from either a JSON number or a numeric string.
fn uint_at(key: &CompositeAggregationKey, idx: usize) -> Option<u64> {
    match &key.get(idx)?.value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn protocol_at(key: &CompositeAggregationKey, idx: usize) -> Option<u8> {
    match &key.get(idx)?.value {
        Value::String(s) => protocol_number(s),
        _ => uint_at(key, idx).and_then(|n| u8::try_from(n).ok()),
    }
}

/// Labels from `k=v` term keys. If a key appears with several values the most
/// frequent one wins.
fn labels_from_terms(bucket: &CompositeAggregationBucket, term: &str) -> Option<Labels> {
    let t = bucket.aggregated_terms.get(term)?;
    let mut best: std::collections::BTreeMap<&str, (&str, i64)> = Default::default();
    for (kv, count) in &t.buckets {
        let Some((k, v)) = kv.split_once('=') else { continue };
        match best.get(k) {
            Some((_, c)) if *c >= *count => {}
            _ => {
                best.insert(k, (v, *count));
            }
        }
    }
    Some(best.into_iter().map(|(k, (v, _))| (k.to_string(), v.to_string())).collect())
}

fn endpoint(bucket: &CompositeAggregationBucket, idx: &EndpointIdx) -> FlowEndpointData {
    let key = &bucket.key;
    let full = key.str_at(idx.name);
    let name = if full.is_empty() || full == FLOW_NAME_AGGREGATED { key.str_at(idx.name_aggr) } else { full };
    let namespace = match key.str_at(idx.namespace) {
        FLOW_NAMESPACE_NONE => "",
        ns => ns,
    };
    let ip = match key.str_at(idx.ip) {
        "" | FLOW_IP_NONE => None,
        s => s.parse::<IpAddr>().ok(),
    };
    FlowEndpointData {
        endpoint_type: EndpointType::parse(key.str_at(idx.endpoint_type)),
        namespace: namespace.to_string(),
        name: name.to_string(),
        labels: labels_from_terms(bucket, idx.labels),
        ip,
        port: uint_at(key, idx.port).and_then(|p| u16::try_from(p).ok()).filter(|p| *p != 0),
        service_account: None,
        named_ports: None,
    }
}

/// Build the flow a raw bucket describes. Returns `None` (with a warning) when the
/// reporter is not recognised.
pub fn flow_from_bucket(bucket: &CompositeAggregationBucket) -> Option<Flow> {
    let key = &bucket.key;
    let Some(reporter) = Reporter::parse(key.str_at(RAW_IDX_REPORTER)) else {
        warn!(reporter = %key.str_at(RAW_IDX_REPORTER), "skipping bucket with unknown reporter");
        return None;
    };
    let source = endpoint(bucket, &SOURCE);
    let destination = endpoint(bucket, &DEST);
    let ip_version = match (source.ip, destination.ip) {
        (Some(IpAddr::V6(_)), _) | (_, Some(IpAddr::V6(_))) => 6,
        _ => 4,
    };
    let policies = bucket
        .aggregated_terms
        .get(TERMS_POLICIES)
        .map(|t| t.buckets.keys().cloned().collect())
        .unwrap_or_default();
    Some(Flow {
        reporter,
        source,
        destination,
        action: Action::parse(key.str_at(RAW_IDX_ACTION)),
        proto: protocol_at(key, RAW_IDX_PROTO),
        ip_version: Some(ip_version),
        policies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pip_core::{AggregatedTerm, CompositeAggregationSourceValue as V, PROTO_TCP, PROTO_UDP};

    fn raw(values: [Value; 15]) -> CompositeAggregationBucket {
        let names = pip_composite_sources();
        CompositeAggregationBucket::with_key(
            CompositeAggregationKey::new(names.iter().zip(values).map(|(s, v)| V::new(s.name.clone(), v))),
            3,
        )
    }

    fn standard() -> CompositeAggregationBucket {
        use serde_json::json;
        raw([
            json!("wep"), json!("ns1"), json!("client-*"),
            json!("hep"), json!("-"), json!("node1"),
            json!("src"), json!("deny"),
            json!("tcp"), json!("10.0.0.1"), json!("client-abc"), json!(0),
            json!("0.0.0.0"), json!("-"), json!(443),
        ])
    }

    #[test]
    fn converts_key_fields() {
        let f = flow_from_bucket(&standard()).unwrap();
        assert_eq!(f.reporter, Reporter::Source);
        assert_eq!(f.action, Action::Deny);
        assert_eq!(f.proto, Some(PROTO_TCP));
        assert_eq!(f.ip_version, Some(4));
        assert_eq!(f.source.endpoint_type, EndpointType::Wep);
        assert_eq!(f.source.name, "client-abc");
        assert_eq!(f.source.ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(f.source.port, None);
        assert_eq!(f.destination.endpoint_type, EndpointType::Hep);
        assert_eq!(f.destination.namespace, "");
        assert_eq!(f.destination.name, "node1");
        assert_eq!(f.destination.ip, None);
        assert_eq!(f.destination.port, Some(443));
        assert!(f.source.labels.is_none());
        assert!(f.policies.is_empty());
    }

    #[test]
    fn numeric_protocol_and_ipv6() {
        let mut b = standard();
        b.key.set(RAW_IDX_PROTO, V::new("proto", 17));
        b.key.set(RAW_IDX_DEST_IP, V::new("dest_ip", "fd00::1"));
        let f = flow_from_bucket(&b).unwrap();
        assert_eq!(f.proto, Some(PROTO_UDP));
        assert_eq!(f.ip_version, Some(6));
    }

    #[test]
    fn labels_keep_most_frequent_value_and_policies_come_from_terms() {
        let mut b = standard();
        let mut labels = AggregatedTerm::new(3);
        labels.buckets.insert("app=web".into(), 1);
        labels.buckets.insert("app=api".into(), 2);
        labels.buckets.insert("tier=fe".into(), 3);
        labels.buckets.insert("garbage".into(), 3);
        b.aggregated_terms.insert(TERMS_SOURCE_LABELS.into(), labels);
        let mut pols = AggregatedTerm::new(3);
        pols.buckets.insert("0|t|t.p|deny|0".into(), 3);
        b.aggregated_terms.insert(TERMS_POLICIES.into(), pols);

        let f = flow_from_bucket(&b).unwrap();
        let l = f.source.labels.unwrap();
        assert_eq!(l.len(), 2);
        assert_eq!(l["app"], "api");
        assert_eq!(l["tier"], "fe");
        assert_eq!(f.policies, vec!["0|t|t.p|deny|0".to_string()]);
    }

    #[test]
    fn empty_label_term_gives_empty_labels() {
        let mut b = standard();
        b.aggregated_terms.insert(TERMS_SOURCE_LABELS.into(), AggregatedTerm::new(3));
        let f = flow_from_bucket(&b).unwrap();
        assert_eq!(f.source.labels, Some(Default::default()));
        assert!(f.destination.labels.is_none());
    }

    #[test]
    fn unknown_reporter_is_skipped() {
        let mut b = standard();
        b.key.set(RAW_IDX_REPORTER, V::new("reporter", "both"));
        assert!(flow_from_bucket(&b).is_none());
    }
}
