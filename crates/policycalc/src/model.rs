use std::cmp::Ordering;
use std::fmt;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIER: &str = "default";
pub const KNP_PREFIX: &str = "knp.default.";
pub const STAGED_PREFIX: &str = "staged:";
/// Order given to converted Kubernetes network policies.
pub const KNP_ORDER: f64 = 1000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    NetworkPolicy,
    GlobalNetworkPolicy,
    StagedNetworkPolicy,
    StagedGlobalNetworkPolicy,
    KubernetesNetworkPolicy,
    Namespace,
    ServiceAccount,
}

impl ResourceKind {
    pub fn is_policy(&self) -> bool { !matches!(self, ResourceKind::Namespace | ResourceKind::ServiceAccount) }
    pub fn is_staged(&self) -> bool {
        matches!(self, ResourceKind::StagedNetworkPolicy | ResourceKind::StagedGlobalNetworkPolicy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(str::to_string), name: name.to_string() }
    }
    pub fn namespace(name: &str) -> Self { Self::new(ResourceKind::Namespace, None, name) }
    pub fn service_account(namespace: &str, name: &str) -> Self {
        Self::new(ResourceKind::ServiceAccount, Some(namespace), name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?}({}/{})", self.kind, ns, self.name),
            None => write!(f, "{:?}({})", self.kind, self.name),
        }
    }
}

/// What enforcing a staged policy does to its enforced counterpart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum StagedAction {
    #[default]
    Set,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PolicyType {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum RuleAction {
    #[default]
    Allow,
    Deny,
    Pass,
    Log,
}

/// Protocol given by name or number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProtocolSpec {
    Number(u8),
    Name(String),
}

/// A port number, a `"min:max"` range, or a named port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u16),
    Text(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IcmpFields {
    #[serde(default, rename = "type")]
    pub icmp_type: Option<u8>,
    #[serde(default)]
    pub code: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpMatch {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub paths: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceAccountMatch {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityRule {
    pub selector: Option<String>,
    pub not_selector: Option<String>,
    pub namespace_selector: Option<String>,
    pub nets: Vec<String>,
    pub not_nets: Vec<String>,
    pub ports: Vec<PortSpec>,
    pub not_ports: Vec<PortSpec>,
    pub service_accounts: Option<ServiceAccountMatch>,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    pub action: RuleAction,
    pub protocol: Option<ProtocolSpec>,
    pub not_protocol: Option<ProtocolSpec>,
    pub ip_version: Option<u8>,
    pub icmp: Option<IcmpFields>,
    pub not_icmp: Option<IcmpFields>,
    pub http: Option<HttpMatch>,
    pub source: EntityRule,
    pub destination: EntityRule,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(flatten)]
    pub id: ResourceId,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default)]
    pub order: Option<f64>,
    #[serde(default)]
    pub selector: String,
    /// Only meaningful for global policies.
    #[serde(default)]
    pub namespace_selector: Option<String>,
    /// Empty means ingress, plus egress when egress rules are present.
    #[serde(default)]
    pub types: Vec<PolicyType>,
    #[serde(default)]
    pub ingress: Vec<Rule>,
    #[serde(default)]
    pub egress: Vec<Rule>,
    /// Only meaningful for staged policies.
    #[serde(default)]
    pub staged_action: StagedAction,
}

fn default_tier() -> String { DEFAULT_TIER.to_string() }

impl Policy {
    pub fn staged(&self) -> bool { self.id.kind.is_staged() }

    pub fn is_namespaced(&self) -> bool { self.id.namespace.is_some() }

    pub fn applies_to(&self, t: PolicyType) -> bool {
        if !self.types.is_empty() { return self.types.contains(&t); }
        match t {
            PolicyType::Ingress => true,
            PolicyType::Egress => !self.egress.is_empty(),
        }
    }

    pub fn rules(&self, t: PolicyType) -> &[Rule] {
        match t {
            PolicyType::Ingress => &self.ingress,
            PolicyType::Egress => &self.egress,
        }
    }

    /// Name as it appears in flow-log policy hits, e.g. `ns1/staged:tier1.p1`.
    pub fn flow_log_name(&self) -> String { self.hit_name(self.staged()) }

    /// Hit name once enforced. A previewed staged policy reports as its enforced form.
    pub fn enforced_flow_log_name(&self) -> String { self.hit_name(false) }

    fn hit_name(&self, staged: bool) -> String {
        let prefix = if staged { STAGED_PREFIX } else { "" };
        match &self.id.namespace {
            Some(ns) => format!("{}/{}{}", ns, prefix, self.id.name),
            None => format!("{}{}", prefix, self.id.name),
        }
    }

    /// Id of the enforced policy a staged policy stands in for.
    pub fn enforced_id(&self) -> Option<ResourceId> {
        let kind = match self.id.kind {
            ResourceKind::StagedNetworkPolicy => ResourceKind::NetworkPolicy,
            ResourceKind::StagedGlobalNetworkPolicy => ResourceKind::GlobalNetworkPolicy,
            _ => return None,
        };
        Some(ResourceId { kind, ..self.id.clone() })
    }

    /// Whether `other` evaluates any flow differently. Order only decides position
    /// within the tier, so it is ignored.
    pub fn differs_for_preview(&self, other: &Policy) -> bool {
        let strip = |p: &Policy| Policy { order: None, ..p.clone() };
        strip(self) != strip(other)
    }

    /// Kubernetes network policies live in the default tier under a `knp.default.` name.
    pub fn into_calico(mut self) -> Self {
        if self.id.kind == ResourceKind::KubernetesNetworkPolicy {
            self.id = knp_alias(&self.id);
            self.tier = DEFAULT_TIER.to_string();
            self.order.get_or_insert(KNP_ORDER);
        }
        self
    }
}

/// The Calico id a Kubernetes network policy is evaluated under.
pub fn knp_alias(id: &ResourceId) -> ResourceId {
    ResourceId {
        kind: ResourceKind::NetworkPolicy,
        namespace: id.namespace.clone(),
        name: format!("{}{}", KNP_PREFIX, id.name),
    }
}

/// Lower order first, unordered last, then by name.
pub(crate) fn order_cmp(a: (Option<f64>, &str), b: (Option<f64>, &str)) -> Ordering {
    let by_order = match (a.0, b.0) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_order.then_with(|| a.1.cmp(b.1))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Tier {
    pub name: String,
    #[serde(default)]
    pub order: Option<f64>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl Tier {
    pub fn new(name: &str, order: Option<f64>) -> Self { Self { name: name.to_string(), order, policies: Vec::new() } }

    pub fn sort_policies(&mut self) {
        self.policies.sort_by(|a, b| order_cmp((a.order, &a.id.name), (b.order, &b.id.name)));
    }
}

/// A snapshot of the policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceData {
    pub tiers: Vec<Tier>,
    pub namespaces: Vec<Namespace>,
    pub service_accounts: Vec<ServiceAccount>,
}

impl ResourceData {
    /// Tiers sorted by order and policies sorted within each tier; Kubernetes policies
    /// are converted to their Calico form.
    pub fn normalized(mut self) -> Self {
        for tier in &mut self.tiers {
            tier.policies = std::mem::take(&mut tier.policies).into_iter().map(Policy::into_calico).collect();
            tier.sort_policies();
        }
        self.tiers.sort_by(|a, b| order_cmp((a.order, &a.name), (b.order, &b.name)));
        self
    }

    pub fn find_policy(&self, id: &ResourceId) -> Option<&Policy> {
        self.tiers.iter().flat_map(|t| t.policies.iter()).find(|p| &p.id == id)
    }

    pub fn policies(&self) -> impl Iterator<Item = &Policy> { self.tiers.iter().flat_map(|t| t.policies.iter()) }
}
