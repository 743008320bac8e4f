//! Streaming before/after re-aggregation of raw flow-log buckets.
//!
//! [`start_pipeline`] pulls sorted raw buckets from a [`BucketSource`], runs each flow
//! through a [`Calculator`], and emits one [`ProcessedFlows`] batch per endpoint
//! identity group on a bounded channel. A single background task owns all state;
//! the caller drains the [`PipelineHandle`].

#![forbid(unsafe_code)]

mod cache;
pub mod convert;

use futures::stream::BoxStream;
use futures::StreamExt;
use pip_core::sources::{NUM_IDENTITY_SOURCES, RAW_NUM_SOURCES};
use pip_core::{Calculator, CompositeAggregationBucket, CompositeAggregationKey, CompositeAggregationQuery, PreviewConfig, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::OutputCache;
pub use crate::convert::flow_from_bucket;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upstream error: {0:#}")]
    Upstream(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// One emitted batch: the before and after output buckets of one identity group,
/// each sorted by (reporter, action, source action).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFlows {
    pub before: Vec<CompositeAggregationBucket>,
    pub after: Vec<CompositeAggregationBucket>,
}

/// Producer of raw buckets sorted by composite key.
///
/// The returned stream should stop promptly once `cancel` fires; the pipeline drops
/// it either way when it terminates.
pub trait BucketSource: Send + Sync {
    fn search(&self, query: CompositeAggregationQuery, cancel: CancellationToken) -> BoxStream<'static, anyhow::Result<CompositeAggregationBucket>>;
}

/// In-memory source yielding a fixed list of buckets, regardless of the query.
#[derive(Debug, Clone, Default)]
pub struct BucketList(pub Vec<CompositeAggregationBucket>);

impl BucketSource for BucketList {
    fn search(&self, _query: CompositeAggregationQuery, _cancel: CancellationToken) -> BoxStream<'static, anyhow::Result<CompositeAggregationBucket>> {
        futures::stream::iter(self.0.clone().into_iter().map(Ok)).boxed()
    }
}

/// Consumer side of a running pipeline.
///
/// Both channels close when the producer stops. Batches already queued before an
/// error remain valid.
pub struct PipelineHandle {
    pub results: mpsc::Receiver<ProcessedFlows>,
    pub errors: mpsc::Receiver<PipelineError>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stop the producer. Queued batches can still be drained.
    pub fn cancel(&self) { self.cancel.cancel() }

    pub fn cancellation_token(&self) -> &CancellationToken { &self.cancel }

    /// Next batch or error, preferring queued batches. `None` once both channels are
    /// closed and drained.
    pub async fn next(&mut self) -> Option<Result<ProcessedFlows, PipelineError>> {
        tokio::select! {
            biased;
            Some(batch) = self.results.recv() => Some(Ok(batch)),
            Some(err) = self.errors.recv() => Some(Err(err)),
            else => None,
        }
    }

    /// Wait for the producer task to finish.
    pub async fn join(self) -> Result<(), PipelineError> {
        self.task.await.map_err(|e| PipelineError::Internal(format!("pipeline task failed: {e}")))
    }
}

/// Start the pipeline on the current tokio runtime.
///
/// `query` is augmented with the fields the preview needs before being handed to
/// `source`. The producer runs under a child of `cancel` and cancels that child itself
/// on termination, including when `cfg.max_flows` before-buckets have been sent
/// (0 means no limit).
pub fn start_pipeline<S, C>(source: &S, query: &CompositeAggregationQuery, calc: C, cfg: PreviewConfig, cancel: &CancellationToken) -> PipelineHandle
where
    S: BucketSource + ?Sized,
    C: Calculator + 'static,
{
    let token = cancel.child_token();
    let (results_tx, results) = mpsc::channel(cfg.max_flows.max(1));
    let (errors_tx, errors) = mpsc::channel(1);
    let stream = source.search(query.augment_for_preview(), token.clone());
    info!(index = %query.document_index, max_flows = cfg.max_flows, impacted_only = cfg.impacted_only, "starting preview pipeline");
    let producer = Producer { calc, cfg, results: results_tx, errors: errors_tx, token: token.clone(), group: None, sent: 0 };
    let task = tokio::spawn(producer.run(stream));
    PipelineHandle { results, errors, cancel: token, task }
}

/// Why the producer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exhausted,
    Limit,
    Cancelled,
    ReceiverClosed,
    Failed,
}

/// Accumulation state of the current identity group.
struct Group {
    identity: CompositeAggregationKey,
    before: OutputCache,
    after: OutputCache,
    impacted: bool,
}

impl Group {
    fn new(identity: CompositeAggregationKey) -> Self {
        Self { identity, before: OutputCache::default(), after: OutputCache::default(), impacted: false }
    }

    /// Merge one calculated raw bucket. Returns true if this bucket changed an action.
    fn add(&mut self, raw: &CompositeAggregationBucket, processed: bool, before: &Response, after: &Response) -> bool {
        let changed = processed
            && (before.source.action != after.source.action || before.destination.action != after.destination.action);
        if changed && !self.impacted {
            self.impacted = true;
            self.before.mark_impacted();
            self.after.mark_impacted();
        }
        self.before.aggregate(&self.identity, raw, before, self.impacted);
        self.after.aggregate(&self.identity, raw, after, self.impacted);
        changed
    }
}

struct Producer<C> {
    calc: C,
    cfg: PreviewConfig,
    results: mpsc::Sender<ProcessedFlows>,
    errors: mpsc::Sender<PipelineError>,
    token: CancellationToken,
    group: Option<Group>,
    sent: usize,
}

impl<C: Calculator> Producer<C> {
    async fn run(mut self, mut stream: BoxStream<'static, anyhow::Result<CompositeAggregationBucket>>) {
        let stop = loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break Stop::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(raw)) => {
                    if let Err(stop) = self.ingest(raw).await { break stop; }
                }
                Some(Err(e)) => {
                    metrics::counter!("pip_upstream_errors_total", 1u64);
                    break self.fail(PipelineError::Upstream(e));
                }
                None => break self.flush().await.err().unwrap_or(Stop::Exhausted),
            }
        };
        self.token.cancel();
        drop(stream);
        info!(?stop, sent = self.sent, "preview pipeline stopped");
    }

    async fn ingest(&mut self, raw: CompositeAggregationBucket) -> Result<(), Stop> {
        if raw.key.len() < RAW_NUM_SOURCES {
            return Err(self.fail(PipelineError::Internal(format!(
                "raw bucket key has {} entries, expected {RAW_NUM_SOURCES}",
                raw.key.len()
            ))));
        }
        let identity = raw.key.prefix(NUM_IDENTITY_SOURCES);
        if self.group.as_ref().is_some_and(|g| g.identity != identity) {
            self.flush().await?;
        }
        let Some(flow) = flow_from_bucket(&raw) else { return Ok(()) };
        let (processed, before, after) = self.calc.calculate(&flow);
        if processed { metrics::counter!("pip_flows_processed_total", 1u64); }
        let group = self.group.get_or_insert_with(|| Group::new(identity));
        if group.add(&raw, processed, &before, &after) {
            metrics::counter!("pip_flows_impacted_total", 1u64);
            debug!(reporter = %flow.reporter.as_str(), action = %flow.action, "flow impacted");
        }
        Ok(())
    }

    /// Emit the current group, if it has anything to emit.
    async fn flush(&mut self) -> Result<(), Stop> {
        let Some(mut group) = self.group.take() else { return Ok(()) };
        if self.cfg.impacted_only && !group.impacted { return Ok(()); }
        if group.before.is_empty() && group.after.is_empty() { return Ok(()); }
        let batch = ProcessedFlows { before: group.before.take_sorted(), after: group.after.take_sorted() };
        let count = batch.before.len();
        metrics::histogram!("pip_batch_size", (batch.before.len() + batch.after.len()) as f64);
        tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Stop::Cancelled),
            sent = self.results.send(batch) => {
                if sent.is_err() { return Err(Stop::ReceiverClosed); }
            }
        }
        metrics::counter!("pip_batches_sent_total", 1u64);
        self.sent += count;
        if self.cfg.max_flows > 0 && self.sent >= self.cfg.max_flows {
            debug!(sent = self.sent, max_flows = self.cfg.max_flows, "flow limit reached");
            return Err(Stop::Limit);
        }
        Ok(())
    }

    /// Report `err` and stop.
    ///
    /// The group being accumulated is discarded rather than flushed: the upstream
    /// may not have returned every bucket of its identity yet, so its before and after
    /// totals would be partial. Batches already sent stay valid.
    fn fail(&mut self, err: PipelineError) -> Stop {
        warn!(error = %err, "preview pipeline failed");
        self.group = None;
        // Only one error is ever sent and the channel holds one.
        let _ = self.errors.try_send(err);
        Stop::Failed
    }
}
