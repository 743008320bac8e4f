use k8s_openapi::api::core::v1::Pod;
use pip_core::{protocol_number, FlowEndpointData, Labels, NamedPort, PROTO_TCP};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What is known about an endpoint beyond the flow record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointData {
    pub labels: Labels,
    pub service_account: Option<String>,
    pub named_ports: Vec<NamedPort>,
}

/// A host endpoint as stored in the datastore or an archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostEndpoint {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub named_ports: Vec<NamedPort>,
}

/// Endpoint details keyed by (namespace, name).
///
/// Pods are also registered under their aggregated flow-log name `<generateName>*`.
/// When replicas under one aggregated name disagree the aggregated entry is marked
/// ambiguous and never used for augmentation.
#[derive(Debug, Default)]
pub struct EndpointCache {
    inner: FxHashMap<(String, String), Option<EndpointData>>,
}

impl EndpointCache {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.inner.len() }
    pub fn is_empty(&self) -> bool { self.inner.is_empty() }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&EndpointData> {
        self.inner.get(&(namespace.to_string(), name.to_string())).and_then(Option::as_ref)
    }

    pub fn insert(&mut self, namespace: &str, name: &str, data: EndpointData) {
        self.inner.insert((namespace.to_string(), name.to_string()), Some(data));
    }

    fn insert_aggregated(&mut self, namespace: &str, name: &str, data: EndpointData) {
        let key = (namespace.to_string(), name.to_string());
        match self.inner.get_mut(&key) {
            None => {
                self.inner.insert(key, Some(data));
            }
            Some(slot) => {
                if slot.as_ref().is_some_and(|existing| existing != &data) {
                    debug!(namespace, name, "aggregated endpoint data is ambiguous");
                    *slot = None;
                }
            }
        }
    }

    pub fn add_pod(&mut self, pod: &Pod) {
        let Some(name) = pod.metadata.name.as_deref() else {
            warn!("ignoring pod without a name");
            return;
        };
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let data = EndpointData {
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            service_account: pod.spec.as_ref().and_then(|s| s.service_account_name.clone()),
            named_ports: pod_named_ports(pod),
        };
        if let Some(generate_name) = pod.metadata.generate_name.as_deref().filter(|g| !g.is_empty()) {
            self.insert_aggregated(namespace, &format!("{}*", generate_name), data.clone());
        }
        self.insert(namespace, name, data);
    }

    pub fn add_host_endpoint(&mut self, hep: &HostEndpoint) {
        let data = EndpointData { labels: hep.labels.clone(), service_account: None, named_ports: hep.named_ports.clone() };
        self.insert("", &hep.name, data);
    }

    /// Fill in labels, service account and named ports a Calico-managed flow endpoint
    /// is missing. Values already present on the flow are kept; an empty label set
    /// counts as missing.
    pub fn augment(&self, ep: &mut FlowEndpointData) -> bool {
        if !ep.is_calico_managed() { return false; }
        let Some(data) = self.get(&ep.namespace, &ep.name) else { return false };
        if ep.labels.as_ref().map_or(true, Labels::is_empty) { ep.labels = Some(data.labels.clone()); }
        if ep.service_account.is_none() { ep.service_account = data.service_account.clone(); }
        if ep.named_ports.is_none() { ep.named_ports = Some(data.named_ports.clone()); }
        true
    }
}

fn pod_named_ports(pod: &Pod) -> Vec<NamedPort> {
    let Some(spec) = pod.spec.as_ref() else { return Vec::new() };
    spec.containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            let name = p.name.clone()?;
            let port = u16::try_from(p.container_port).ok()?;
            let protocol = p.protocol.as_deref().map_or(Some(PROTO_TCP), protocol_number)?;
            Some(NamedPort { name, protocol, port })
        })
        .collect()
}
