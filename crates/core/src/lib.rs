//! Policy impact preview core types.
//!
//! Flow records as seen by the policy calculator, the before/after responses it
//! produces, and the composite aggregation shapes used on the pipeline wire.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub mod aggregation;
pub mod config;
pub mod sources;

pub use aggregation::{
    AggregatedTerm, CompositeAggregationBucket, CompositeAggregationKey, CompositeAggregationQuery,
    CompositeAggregationSourceValue, CompositeSourceInfo, NestedTermInfo, SumInfo, TimeRange,
};
pub use config::PreviewConfig;

pub type Labels = BTreeMap<String, String>;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;
pub const PROTO_SCTP: u8 = 132;
pub const PROTO_UDPLITE: u8 = 136;

/// Resolve a protocol name (case-insensitive) or number to its IANA protocol number.
pub fn protocol_number(s: &str) -> Option<u8> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Some(PROTO_TCP),
        "udp" => Some(PROTO_UDP),
        "icmp" => Some(PROTO_ICMP),
        "icmpv6" => Some(PROTO_ICMPV6),
        "sctp" => Some(PROTO_SCTP),
        "udplite" => Some(PROTO_UDPLITE),
        other => other.parse::<u8>().ok(),
    }
}

/// Which side of the connection recorded a flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reporter {
    #[serde(rename = "src")]
    Source,
    #[serde(rename = "dst")]
    Destination,
}

impl Reporter {
    pub fn as_str(&self) -> &'static str {
        match self { Reporter::Source => "src", Reporter::Destination => "dst" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "src" => Some(Reporter::Source),
            "dst" => Some(Reporter::Destination),
            _ => None,
        }
    }
}

/// Endpoint kinds as they appear in flow logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum EndpointType {
    /// Workload endpoint (pod).
    #[serde(rename = "wep")]
    Wep,
    /// Host endpoint.
    #[serde(rename = "hep")]
    Hep,
    /// Network set: labelled, but not policed.
    #[serde(rename = "ns")]
    NetworkSet,
    /// Bare network address.
    #[serde(rename = "net")]
    #[default]
    Net,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::Wep => "wep",
            EndpointType::Hep => "hep",
            EndpointType::NetworkSet => "ns",
            EndpointType::Net => "net",
        }
    }

    /// Unrecognised strings are treated as a bare network.
    pub fn parse(s: &str) -> Self {
        match s {
            "wep" => EndpointType::Wep,
            "hep" => EndpointType::Hep,
            "ns" => EndpointType::NetworkSet,
            _ => EndpointType::Net,
        }
    }

    /// Endpoints that have policy applied to them.
    pub fn is_calico_managed(&self) -> bool { matches!(self, EndpointType::Wep | EndpointType::Hep) }

    /// Endpoints that can carry labels and so can be matched by selectors.
    pub fn supports_labels(&self) -> bool { !matches!(self, EndpointType::Net) }
}

/// Flow and policy actions.
///
/// `Pass` is only ever a per-tier verdict; a calculated endpoint action is one of the
/// other four. `Invalid` means the side does not apply to the flow at all, whereas
/// `Unknown` means it applies but could not be determined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Pass,
    #[default]
    Unknown,
    Invalid,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Pass => "pass",
            Action::Unknown => "unknown",
            Action::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Action::Allow,
            "deny" => Action::Deny,
            "pass" => Action::Pass,
            "invalid" => Action::Invalid,
            _ => Action::Unknown,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// A named container port on an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamedPort {
    pub name: String,
    pub protocol: u8,
    pub port: u16,
}

/// One end of a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlowEndpointData {
    #[serde(rename = "type", default)]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    /// `None` when the labels are not known, which is distinct from an empty set.
    #[serde(default)]
    pub labels: Option<Labels>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub named_ports: Option<Vec<NamedPort>>,
}

impl FlowEndpointData {
    pub fn is_calico_managed(&self) -> bool { self.endpoint_type.is_calico_managed() }
}

/// An aggregated traffic record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub reporter: Reporter,
    pub source: FlowEndpointData,
    pub destination: FlowEndpointData,
    /// Action as originally recorded.
    pub action: Action,
    #[serde(default)]
    pub proto: Option<u8>,
    #[serde(default)]
    pub ip_version: Option<u8>,
    /// Flow-log policy hit strings recorded at capture time.
    #[serde(default)]
    pub policies: Vec<String>,
}

/// Calculated outcome for one side of a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointResponse {
    /// Whether this side produces an output row.
    pub include: bool,
    pub action: Action,
    /// Policies that decided the action, or `None` when the recorded policies stand.
    pub policies: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub source: EndpointResponse,
    pub destination: EndpointResponse,
}

/// Computes the before/after outcome of a flow.
///
/// Returns `(processed, before, after)`; `processed` is false when the flow was not
/// re-evaluated because no changed resource applies to it.
pub trait Calculator: Send {
    fn calculate(&self, flow: &Flow) -> (bool, Response, Response);
}

impl<C: Calculator + Sync + ?Sized> Calculator for std::sync::Arc<C> {
    fn calculate(&self, flow: &Flow) -> (bool, Response, Response) { (**self).calculate(flow) }
}

impl<C: Calculator + ?Sized> Calculator for Box<C> {
    fn calculate(&self, flow: &Flow) -> (bool, Response, Response) { (**self).calculate(flow) }
}
