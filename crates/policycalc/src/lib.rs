//! Network policy evaluation of flows before and after a set of proposed changes.
//!
//! [`apply_resource_changes`] turns a snapshot plus changes into the "after" snapshot
//! and the [`ImpactedResources`]; [`PolicyCalculator`] compiles both snapshots and
//! implements [`pip_core::Calculator`].

#![forbid(unsafe_code)]

mod calculator;
mod compile;
pub mod endpoints;
pub mod error;
pub mod hits;
pub mod impacted;
pub mod model;
mod namespaces;

pub use calculator::{unchanged_response, PolicyCalculator, END_OF_TIER_RULE, NAMESPACE_PROFILE_PREFIX, NO_MATCH_PROFILE, PROFILE_TIER};
pub use endpoints::{EndpointCache, EndpointData, HostEndpoint};
pub use error::{CalcError, CalcResult};
pub use hits::{enforced_hits, hits_equal_ignoring_order_duplicates_and_staged, PolicyHit};
pub use impacted::{apply_resource_changes, ChangeAction, Impact, ImpactedResources, Resource, ResourceChange};
pub use model::{
    DEFAULT_TIER, EntityRule, HttpMatch, IcmpFields, Policy, PolicyType, PortSpec, ProtocolSpec, ResourceData, ResourceId,
    ResourceKind, Rule, RuleAction, ServiceAccountMatch, StagedAction, Tier,
};
pub use namespaces::NAMESPACE_NAME_LABEL;
