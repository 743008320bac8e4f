use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use pip_api::{PreviewRequest, PreviewService, StaticEndpoints};
use pip_core::config::DEFAULT_MAX_FLOWS;
use pip_core::sources::*;
use pip_core::{CompositeAggregationBucket, CompositeAggregationQuery, EndpointType, FlowEndpointData, PreviewConfig};
use pip_pipeline::{BucketList, ProcessedFlows};
use pip_policycalc::{ResourceChange, ResourceData};
use pip_selector::SelectorRegistry;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pipctl", version, about = "Policy impact preview CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Preview resource changes against recorded flow buckets
    Preview {
        /// Current configuration (YAML or JSON ResourceData)
        #[arg(long = "resources")]
        resources: PathBuf,
        /// Proposed changes: a preview request or a bare list of changes
        #[arg(long = "changes")]
        changes: PathBuf,
        /// JSON array of raw flow buckets, sorted by composite key
        #[arg(long = "flows")]
        flows: PathBuf,
        /// Archived endpoints (pods and host endpoints) used with --augment-with-audit-data
        #[arg(long = "endpoints")]
        endpoints: Option<PathBuf>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Evaluate a label selector against an endpoint
    Selector {
        /// Selector expression, e.g. "app == 'web' && has(tier)"
        expr: String,
        /// Endpoint label as key=value (repeatable)
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
        /// Treat the endpoint labels as unknown
        #[arg(long = "unknown-labels", action = ArgAction::SetTrue)]
        unknown_labels: bool,
        /// Endpoint type: wep, hep, ns or net
        #[arg(long = "type", default_value = "wep")]
        endpoint_type: String,
    },
    /// Print the composite aggregation query a preview issues
    Query {
        /// Flow log index
        #[arg(long = "index", default_value = FLOW_INDEX)]
        index: String,
        /// Aggregation name
        #[arg(long = "name", default_value = FLOWLOG_BUCKETS)]
        name: String,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Always use the calculated action for "before", even if it disagrees with the flow log
    #[arg(long, env = "PIP_CALCULATE_ORIGINAL_ACTION", action = ArgAction::SetTrue)]
    calculate_original_action: bool,
    /// Fill in endpoint details from archived data
    #[arg(long, env = "PIP_AUGMENT_WITH_AUDIT_DATA", action = ArgAction::SetTrue)]
    augment_with_audit_data: bool,
    /// Fill in endpoint details from the pods currently in the cluster
    #[arg(long, env = "PIP_AUGMENT_WITH_CURRENT_CONFIGURATION", action = ArgAction::SetTrue)]
    augment_with_current_configuration: bool,
    /// Stop after this many "before" buckets (0 = no limit)
    #[arg(long, env = "PIP_MAX_FLOWS", default_value_t = DEFAULT_MAX_FLOWS)]
    max_flows: usize,
    /// Only emit groups whose outcome changed
    #[arg(long, env = "PIP_IMPACTED_ONLY", action = ArgAction::SetTrue)]
    impacted_only: bool,
}

impl From<ConfigArgs> for PreviewConfig {
    fn from(a: ConfigArgs) -> Self {
        PreviewConfig {
            calculate_original_action: a.calculate_original_action,
            augment_with_audit_data: a.augment_with_audit_data,
            augment_with_current_configuration: a.augment_with_current_configuration,
            max_flows: a.max_flows,
            impacted_only: a.impacted_only,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChangesFile {
    Request(PreviewRequest),
    Changes(Vec<ResourceChange>),
}

impl From<ChangesFile> for PreviewRequest {
    fn from(f: ChangesFile) -> Self {
        match f {
            ChangesFile::Request(r) => r,
            ChangesFile::Changes(resource_changes) => PreviewRequest { resource_changes, time_range: None },
        }
    }
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())).ok_or_else(|| format!("expected key=value, got {s:?}"))
}

fn init_tracing() {
    let env = std::env::var("PIP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PIP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PIP_METRICS_ADDR; expected host:port");
        }
    }
}

/// Read a YAML or JSON file.
fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_batch(n: usize, batch: &ProcessedFlows) {
    let row = |b: &CompositeAggregationBucket| {
        let impacted = b.key.get(OUT_IDX_IMPACTED).and_then(|v| v.value.as_bool()).unwrap_or(false);
        format!(
            "  {:<3} {:<7} src={:<7} {} {}/{} → {} {}/{} docs={}{}",
            b.key.str_at(OUT_IDX_REPORTER),
            b.key.str_at(OUT_IDX_ACTION),
            b.key.str_at(OUT_IDX_SOURCE_ACTION),
            b.key.str_at(RAW_IDX_SOURCE_TYPE),
            b.key.str_at(RAW_IDX_SOURCE_NAMESPACE),
            b.key.str_at(RAW_IDX_SOURCE_NAME_AGGR),
            b.key.str_at(RAW_IDX_DEST_TYPE),
            b.key.str_at(RAW_IDX_DEST_NAMESPACE),
            b.key.str_at(RAW_IDX_DEST_NAME_AGGR),
            b.doc_count,
            if impacted { " *" } else { "" },
        )
    };
    println!("batch {n}");
    println!(" before:");
    batch.before.iter().for_each(|b| println!("{}", row(b)));
    println!(" after:");
    batch.after.iter().for_each(|b| println!("{}", row(b)));
}

async fn preview(output: Output, resources: &Path, changes: &Path, flows: &Path, endpoints: Option<&Path>, cfg: PreviewConfig) -> Result<()> {
    let before: ResourceData = load(resources)?;
    let request: PreviewRequest = load::<ChangesFile>(changes)?.into();
    let buckets: Vec<CompositeAggregationBucket> = load(flows)?;
    info!(tiers = before.tiers.len(), changes = request.resource_changes.len(), buckets = buckets.len(), "preview invoked");

    let mut service = PreviewService::new(cfg.clone(), before);
    if let Some(path) = endpoints {
        let archived: StaticEndpoints = load(path)?;
        service = service.with_archived_endpoints(Arc::new(archived));
    }
    if cfg.augment_with_current_configuration {
        match pip_api::KubePods::try_default().await {
            Ok(pods) => service = service.with_current_endpoints(Arc::new(pods)),
            Err(e) => warn!(error = %format!("{e:#}"), "cluster unavailable; not using current endpoints"),
        }
    }

    let cancel = CancellationToken::new();
    let mut handle = service.preview(&request, &BucketList(buckets), &CompositeAggregationQuery::default(), &cancel).await?;
    let mut batches = Vec::new();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted; cancelling preview");
                cancel.cancel();
            }
            next = handle.next() => match next {
                Some(Ok(batch)) => {
                    if output == Output::Human { print_batch(batches.len(), &batch); }
                    batches.push(batch);
                }
                Some(Err(e)) => {
                    error!(error = %e, "preview failed");
                    return Err(e.into());
                }
                None => break,
            },
        }
    }
    handle.join().await?;
    match output {
        Output::Human => println!("{} batch(es)", batches.len()),
        Output::Json => println!("{}", serde_json::to_string_pretty(&batches)?),
    }
    Ok(())
}

fn selector(output: Output, expr: &str, labels: Vec<(String, String)>, unknown_labels: bool, endpoint_type: &str) -> Result<()> {
    let registry = SelectorRegistry::new();
    let matcher = registry.get_selector_endpoint_matcher(expr)?;
    let ep = FlowEndpointData {
        endpoint_type: EndpointType::parse(endpoint_type),
        labels: if unknown_labels { None } else { Some(labels.into_iter().collect()) },
        ..Default::default()
    };
    let mut cache = registry.create_selector_cache();
    let result = matcher.evaluate(&ep, &mut cache);
    match output {
        Output::Human => println!("{:?}", result),
        Output::Json => println!(
            "{}",
            serde_json::json!({ "selector": expr, "type": ep.endpoint_type.as_str(), "labels": ep.labels, "result": format!("{result:?}") })
        ),
    }
    Ok(())
}

fn query(output: Output, index: String, name: String) -> Result<()> {
    let q = CompositeAggregationQuery { document_index: index, name, ..Default::default() }.augment_for_preview();
    match output {
        Output::Human => {
            println!("{} • {}", q.document_index, q.name);
            for (i, s) in q.composite_sources.iter().enumerate() {
                println!("  {:>2} {:<20} {}", i, s.name, s.field);
            }
            for t in &q.nested_terms {
                println!("  terms {:<15} {}", t.name, t.field);
            }
            for s in &q.sums {
                println!("  sum   {:<30} {}", s.name, s.field);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&q)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Preview { resources, changes, flows, endpoints, config } => {
            preview(cli.output, &resources, &changes, &flows, endpoints.as_deref(), config.into()).await
        }
        Commands::Selector { expr, labels, unknown_labels, endpoint_type } => selector(cli.output, &expr, labels, unknown_labels, &endpoint_type),
        Commands::Query { index, name } => query(cli.output, index, name),
    }
}
