use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use pip_core::sources::*;
use pip_core::{
    Action, Calculator, CompositeAggregationBucket, CompositeAggregationKey, CompositeAggregationQuery,
    CompositeAggregationSourceValue as V, EndpointResponse, Flow, PreviewConfig, Reporter, Response,
};
use pip_pipeline::{start_pipeline, BucketList, BucketSource, PipelineError, PipelineHandle, ProcessedFlows};
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Before: the recorded action on the reporting side, Allow on the other.
/// After: Allow everywhere, with the destination reachable when the source denied.
struct AllowEverything;

impl Calculator for AllowEverything {
    fn calculate(&self, flow: &Flow) -> (bool, Response, Response) {
        let src = flow.reporter == Reporter::Source;
        let before = Response {
            source: EndpointResponse { include: src, action: if src { flow.action } else { Action::Allow }, policies: None },
            destination: EndpointResponse { include: !src, action: flow.action, policies: None },
        };
        let after = Response {
            source: EndpointResponse { include: src, action: Action::Allow, policies: Some(vec!["0|t|t.allow|allow|0".into()]) },
            destination: EndpointResponse { include: !src || flow.action == Action::Deny, action: Action::Allow, policies: None },
        };
        (true, before, after)
    }
}

fn raw(src: &str, dst: &str, reporter: &str, action: &str, port: u16, count: i64) -> CompositeAggregationBucket {
    let values = [
        json!("wep"), json!("ns1"), json!(format!("{src}-*")),
        json!("wep"), json!("ns2"), json!(format!("{dst}-*")),
        json!(reporter), json!(action),
        json!("tcp"), json!("10.0.0.1"), json!(src), json!(0),
        json!("10.0.0.2"), json!(dst), json!(port),
    ];
    let key = CompositeAggregationKey::new(pip_composite_sources().into_iter().zip(values).map(|(s, v)| V::new(s.name, v)));
    CompositeAggregationBucket::with_key(key, count)
}

type Row = (String, String, String, i64, bool);

fn rows(buckets: &[CompositeAggregationBucket]) -> Vec<Row> {
    buckets
        .iter()
        .map(|b| {
            (
                b.key.str_at(OUT_IDX_REPORTER).to_string(),
                b.key.str_at(OUT_IDX_ACTION).to_string(),
                b.key.str_at(OUT_IDX_SOURCE_ACTION).to_string(),
                b.doc_count,
                b.key.get(OUT_IDX_IMPACTED).and_then(|v| v.value.as_bool()).unwrap_or(false),
            )
        })
        .collect()
}

fn row(reporter: &str, action: &str, source_action: &str, count: i64, impacted: bool) -> Row {
    (reporter.into(), action.into(), source_action.into(), count, impacted)
}

/// Single-use source over a prepared stream, recording what the pipeline asked for.
struct StreamSource {
    stream: Mutex<Option<BoxStream<'static, anyhow::Result<CompositeAggregationBucket>>>>,
    seen: Mutex<Option<(CompositeAggregationQuery, CancellationToken)>>,
}

impl StreamSource {
    fn new(s: impl Stream<Item = anyhow::Result<CompositeAggregationBucket>> + Send + 'static) -> Self {
        Self { stream: Mutex::new(Some(s.boxed())), seen: Mutex::new(None) }
    }
}

impl BucketSource for StreamSource {
    fn search(&self, query: CompositeAggregationQuery, cancel: CancellationToken) -> BoxStream<'static, anyhow::Result<CompositeAggregationBucket>> {
        *self.seen.lock().unwrap() = Some((query, cancel));
        self.stream.lock().unwrap().take().unwrap_or_else(|| futures::stream::empty().boxed())
    }
}

fn config() -> PreviewConfig { PreviewConfig::default() }

async fn drain(mut handle: PipelineHandle) -> (Vec<ProcessedFlows>, Vec<PipelineError>) {
    let mut batches = Vec::new();
    let mut errors = Vec::new();
    while let Some(item) = timeout(Duration::from_secs(5), handle.next()).await.expect("pipeline stalled") {
        match item {
            Ok(b) => batches.push(b),
            Err(e) => errors.push(e),
        }
    }
    timeout(Duration::from_secs(5), handle.join()).await.expect("task still running").unwrap();
    (batches, errors)
}

#[tokio::test]
async fn three_bucket_group_end_to_end() {
    let source = BucketList(vec![
        raw("a", "b", "dst", "allow", 80, 1),
        raw("a", "b", "dst", "allow", 443, 1),
        raw("a", "b", "src", "allow", 80, 1),
    ]);
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, config(), &CancellationToken::new());
    let (batches, errors) = drain(handle).await;
    assert!(errors.is_empty());
    assert_eq!(batches.len(), 1);
    let expected = vec![row("dst", "allow", "allow", 2, false), row("src", "allow", "allow", 1, false)];
    assert_eq!(rows(&batches[0].before), expected);
    assert_eq!(rows(&batches[0].after), expected);
    // Identity entries come first, then the output fields.
    let key = &batches[0].before[0].key;
    assert_eq!(key.len(), OUT_NUM_SOURCES);
    assert_eq!(key.get(2).unwrap().name, "source_name");
    assert_eq!(key.str_at(2), "a-*");
}

#[tokio::test]
async fn impacted_is_applied_to_the_whole_group() {
    let source = BucketList(vec![
        raw("a", "b", "src", "allow", 80, 1),
        raw("a", "b", "src", "deny", 80, 3),
        raw("a", "b", "src", "allow", 443, 1),
        raw("c", "d", "src", "allow", 80, 1),
    ]);
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, config(), &CancellationToken::new());
    let (batches, errors) = drain(handle).await;
    assert!(errors.is_empty());
    assert_eq!(batches.len(), 2);

    assert_eq!(rows(&batches[0].before), vec![row("src", "allow", "allow", 2, true), row("src", "deny", "deny", 3, true)]);
    // The denied flow becomes allowed and its destination side appears.
    assert_eq!(rows(&batches[0].after), vec![row("dst", "allow", "allow", 3, true), row("src", "allow", "allow", 5, true)]);
    let policies = &batches[0].after[1].aggregated_terms;
    assert!(policies.get(TERMS_POLICIES).is_some_and(|t| t.buckets.contains_key("0|t|t.allow|allow|0")));

    assert_eq!(rows(&batches[1].before), vec![row("src", "allow", "allow", 1, false)]);
}

#[tokio::test]
async fn impacted_only_drops_unchanged_groups() {
    let source = BucketList(vec![
        raw("a", "b", "src", "allow", 80, 1),
        raw("c", "d", "src", "deny", 80, 1),
        raw("e", "f", "dst", "allow", 80, 1),
    ]);
    let cfg = PreviewConfig { impacted_only: true, ..config() };
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, cfg, &CancellationToken::new());
    let (batches, _) = drain(handle).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].before[0].key.str_at(2), "c-*");
}

#[tokio::test]
async fn max_flows_stops_upstream() {
    let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();
    let source = StreamSource::new(async_stream::stream! {
        let _guard = dropped_tx;
        for i in 0.. {
            yield Ok(raw(&format!("s{i}"), "d", "src", "allow", 80, 1));
            yield Ok(raw(&format!("s{i}"), "d", "src", "deny", 80, 1));
        }
    });
    let cfg = PreviewConfig { max_flows: 3, ..config() };
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, cfg, &CancellationToken::new());
    let token = handle.cancellation_token().clone();
    let (batches, errors) = drain(handle).await;
    assert!(errors.is_empty());
    // Two before-buckets per group: the limit is crossed by the second batch.
    assert_eq!(batches.len(), 2);
    assert!(token.is_cancelled());
    assert!(timeout(Duration::from_secs(1), dropped_rx).await.unwrap().is_err());
}

#[tokio::test]
async fn cancellation_closes_channels_and_drops_upstream() {
    let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();
    let source = StreamSource::new(async_stream::stream! {
        let _guard = dropped_tx;
        yield Ok(raw("a", "b", "src", "allow", 80, 1));
        futures::future::pending::<()>().await;
    });
    let parent = CancellationToken::new();
    let mut handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, config(), &parent);
    assert!(timeout(Duration::from_millis(50), handle.next()).await.is_err());

    parent.cancel();
    let next = timeout(Duration::from_secs(5), handle.next()).await.expect("channels not closed");
    assert!(next.is_none());
    timeout(Duration::from_secs(5), handle.join()).await.unwrap().unwrap();
    assert!(timeout(Duration::from_secs(1), dropped_rx).await.unwrap().is_err());
    let (_, child) = source.seen.lock().unwrap().take().unwrap();
    assert!(child.is_cancelled());
}

#[tokio::test]
async fn upstream_error_discards_partial_group() {
    let source = StreamSource::new(async_stream::stream! {
        yield Ok(raw("a", "b", "src", "allow", 80, 1));
        yield Ok(raw("c", "d", "src", "allow", 80, 1));
        yield Ok(raw("c", "d", "src", "allow", 443, 1));
        yield Err(anyhow::anyhow!("search failed"));
        yield Ok(raw("e", "f", "src", "allow", 80, 1));
    });
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, config(), &CancellationToken::new());
    let (batches, errors) = drain(handle).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].before[0].key.str_at(2), "a-*");
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], PipelineError::Upstream(_)));
    assert!(errors[0].to_string().contains("search failed"));
}

#[tokio::test]
async fn short_key_is_an_internal_error() {
    let mut short = raw("a", "b", "src", "allow", 80, 1);
    short.key.0.truncate(NUM_IDENTITY_SOURCES);
    let source = BucketList(vec![short]);
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, config(), &CancellationToken::new());
    let (batches, errors) = drain(handle).await;
    assert!(batches.is_empty());
    assert!(matches!(errors.as_slice(), [PipelineError::Internal(_)]));
}

#[tokio::test]
async fn unknown_reporter_is_skipped() {
    let source = BucketList(vec![raw("a", "b", "both", "allow", 80, 1), raw("a", "b", "src", "allow", 80, 1)]);
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, config(), &CancellationToken::new());
    let (batches, errors) = drain(handle).await;
    assert!(errors.is_empty());
    assert_eq!(rows(&batches[0].before), vec![row("src", "allow", "allow", 1, false)]);
}

#[tokio::test]
async fn search_receives_augmented_query() {
    let source = StreamSource::new(futures::stream::empty());
    let query = CompositeAggregationQuery { document_index: "flows-x".into(), ..Default::default() };
    let handle = start_pipeline(&source, &query, AllowEverything, config(), &CancellationToken::new());
    let (batches, _) = drain(handle).await;
    assert!(batches.is_empty());
    let (seen, _) = source.seen.lock().unwrap().take().unwrap();
    assert_eq!(seen.document_index, "flows-x");
    assert_eq!(seen.composite_sources.len(), RAW_NUM_SOURCES);
    assert!(seen.nested_terms.iter().any(|t| t.name == TERMS_POLICIES));
}

#[tokio::test]
async fn batches_serialize_keys_as_lists() {
    let source = BucketList(vec![raw("a", "b", "src", "deny", 80, 2)]);
    let handle = start_pipeline(&source, &CompositeAggregationQuery::default(), AllowEverything, config(), &CancellationToken::new());
    let (batches, _) = drain(handle).await;
    let v = serde_json::to_value(&batches[0]).unwrap();
    let key = v["before"][0]["key"].as_array().unwrap();
    assert_eq!(key.len(), OUT_NUM_SOURCES);
    assert_eq!(key[OUT_IDX_REPORTER], json!({ "name": "reporter", "value": "src" }));
    assert_eq!(key[OUT_IDX_IMPACTED], json!({ "name": "flow_impacted", "value": true }));
    assert_eq!(v["before"][0]["doc_count"], json!(2));
}
