//! Policy impact preview façade.
//!
//! [`PreviewService`] owns the current policy configuration, turns a
//! [`PreviewRequest`] into a primed [`PolicyCalculator`] and starts the aggregation
//! pipeline over a caller-supplied [`BucketSource`]. Frontends (CLI, HTTP
//! middleware) depend on this crate only.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use pip_core::{CompositeAggregationQuery, PreviewConfig, TimeRange};
use pip_pipeline::{start_pipeline, BucketSource, PipelineError, PipelineHandle};
use pip_policycalc::{
    apply_resource_changes, CalcError, EndpointCache, HostEndpoint, PolicyCalculator, Resource, ResourceChange, ResourceData,
    ResourceKind, DEFAULT_TIER,
};
use pip_selector::SelectorRegistry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use pip_pipeline::ProcessedFlows;

/// API errors suitable for transport.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum PreviewError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("calculator: {0}")]
    Calculator(String),
    #[error("pipeline: {0}")]
    Pipeline(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type PreviewResult<T> = Result<T, PreviewError>;

impl From<CalcError> for PreviewError {
    fn from(e: CalcError) -> Self {
        match &e {
            CalcError::MissingResource(_) => PreviewError::NotFound(e.to_string()),
            CalcError::UnknownTier(_)
            | CalcError::DuplicateResource(_)
            | CalcError::Unnamed(_)
            | CalcError::InvalidResource(..) => PreviewError::Validation(e.to_string()),
            _ => PreviewError::Calculator(e.to_string()),
        }
    }
}

impl From<PipelineError> for PreviewError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Internal(msg) => PreviewError::Internal(msg),
            upstream => PreviewError::Pipeline(upstream.to_string()),
        }
    }
}

/// A set of proposed changes to preview over a window of flow logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub resource_changes: Vec<ResourceChange>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl PreviewRequest {
    /// Reject requests that cannot describe a preview. Tiered Calico policies must
    /// carry their tier as a name prefix.
    pub fn validate(&self) -> PreviewResult<()> {
        if self.resource_changes.is_empty() {
            return Err(PreviewError::Validation("no resource changes in preview request".into()));
        }
        for change in &self.resource_changes {
            let Resource::Policy(p) = &change.resource else { continue };
            if !matches!(p.id.kind, ResourceKind::NetworkPolicy | ResourceKind::GlobalNetworkPolicy) { continue; }
            let tier = if p.tier.is_empty() { DEFAULT_TIER } else { p.tier.as_str() };
            if !p.id.name.starts_with(&format!("{tier}.")) {
                return Err(PreviewError::Validation(format!(
                    "policy name '{}' is not correct for the configured tier '{tier}'",
                    p.id.name
                )));
            }
        }
        Ok(())
    }
}

/// Supplier of endpoint details used to fill in what flow logs lack.
#[async_trait::async_trait]
pub trait EndpointSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Add known endpoints to `cache`, returning how many were added. `time_range`
    /// is the preview window, for sources that hold history.
    async fn populate(&self, cache: &mut EndpointCache, time_range: Option<TimeRange>) -> anyhow::Result<usize>;
}

/// Pods currently in the cluster.
pub struct KubePods {
    client: kube::Client,
}

impl KubePods {
    pub fn new(client: kube::Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = kube::Client::try_default().await.context("connecting to the cluster")?;
        Ok(Self::new(client))
    }
}

#[async_trait::async_trait]
impl EndpointSource for KubePods {
    fn name(&self) -> &'static str { "cluster" }

    async fn populate(&self, cache: &mut EndpointCache, _time_range: Option<TimeRange>) -> anyhow::Result<usize> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default()).await.context("listing pods")?;
        for pod in &pods.items {
            cache.add_pod(pod);
        }
        Ok(pods.items.len())
    }
}

/// Fixed endpoint data, e.g. an exported archive or test fixtures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticEndpoints {
    pub pods: Vec<Pod>,
    pub host_endpoints: Vec<HostEndpoint>,
}

#[async_trait::async_trait]
impl EndpointSource for StaticEndpoints {
    fn name(&self) -> &'static str { "static" }

    async fn populate(&self, cache: &mut EndpointCache, _time_range: Option<TimeRange>) -> anyhow::Result<usize> {
        self.pods.iter().for_each(|p| cache.add_pod(p));
        self.host_endpoints.iter().for_each(|h| cache.add_host_endpoint(h));
        Ok(self.pods.len() + self.host_endpoints.len())
    }
}

/// Previews proposed changes against a fixed "before" configuration.
///
/// The selector registry is shared by every calculator the service builds.
pub struct PreviewService {
    config: PreviewConfig,
    before: ResourceData,
    registry: Arc<SelectorRegistry>,
    current: Option<Arc<dyn EndpointSource>>,
    archive: Option<Arc<dyn EndpointSource>>,
}

impl PreviewService {
    pub fn new(config: PreviewConfig, before: ResourceData) -> Self {
        Self { config, before, registry: Arc::new(SelectorRegistry::new()), current: None, archive: None }
    }

    /// Source consulted when `augment_with_current_configuration` is set.
    pub fn with_current_endpoints(mut self, source: Arc<dyn EndpointSource>) -> Self {
        self.current = Some(source);
        self
    }

    /// Source consulted when `augment_with_audit_data` is set and the request has a
    /// time range.
    pub fn with_archived_endpoints(mut self, source: Arc<dyn EndpointSource>) -> Self {
        self.archive = Some(source);
        self
    }

    pub fn config(&self) -> &PreviewConfig { &self.config }
    pub fn before(&self) -> &ResourceData { &self.before }

    async fn endpoint_cache(&self, time_range: Option<TimeRange>) -> EndpointCache {
        let mut cache = EndpointCache::new();
        let mut sources = Vec::new();
        if self.config.augment_with_audit_data {
            match (&self.archive, time_range) {
                (Some(s), Some(_)) => sources.push(s),
                (Some(_), None) => debug!("no time range, skipping archived endpoints"),
                (None, _) => debug!("no archived endpoint source configured"),
            }
        }
        if self.config.augment_with_current_configuration {
            match &self.current {
                Some(s) => sources.push(s),
                None => debug!("no current endpoint source configured"),
            }
        }
        for source in sources {
            match source.populate(&mut cache, time_range).await {
                Ok(n) => debug!(source = source.name(), endpoints = n, "endpoint cache populated"),
                Err(e) => warn!(source = source.name(), error = %format!("{e:#}"), "failed to populate endpoint cache"),
            }
        }
        cache
    }

    /// Apply the request's changes and build the calculator for them.
    pub async fn policy_calculator(&self, request: &PreviewRequest) -> PreviewResult<PolicyCalculator> {
        let t0 = Instant::now();
        request.validate()?;
        let (after, impacted) = apply_resource_changes(&self.before, &request.resource_changes)?;
        let endpoints = self.endpoint_cache(request.time_range).await;
        let calc = PolicyCalculator::with_registry(self.config.clone(), endpoints, &self.before, &after, impacted, Arc::clone(&self.registry))?;
        info!(changes = request.resource_changes.len(), took_ms = %t0.elapsed().as_millis(), "api: policy calculator built");
        Ok(calc)
    }

    /// Start a preview over the buckets `source` returns for `query`.
    ///
    /// The request time range, when present, replaces the query's.
    pub async fn preview<S>(&self, request: &PreviewRequest, source: &S, query: &CompositeAggregationQuery, cancel: &CancellationToken) -> PreviewResult<PipelineHandle>
    where
        S: BucketSource + ?Sized,
    {
        let calc = self.policy_calculator(request).await?;
        let mut query = query.clone();
        if request.time_range.is_some() {
            query.time_range = request.time_range;
        }
        metrics::counter!("pip_previews_total", 1u64);
        Ok(start_pipeline(source, &query, calc, self.config.clone(), cancel))
    }
}

/// Drain a running preview, stopping at the first error.
pub async fn collect(mut handle: PipelineHandle) -> PreviewResult<Vec<ProcessedFlows>> {
    let mut out = Vec::new();
    while let Some(next) = handle.next().await {
        match next {
            Ok(batch) => out.push(batch),
            Err(e) => {
                handle.cancel();
                return Err(e.into());
            }
        }
    }
    handle.join().await?;
    Ok(out)
}
