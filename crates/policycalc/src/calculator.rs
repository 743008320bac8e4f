use std::sync::Arc;
use std::time::Instant;

use pip_core::{Action, Calculator, EndpointResponse, EndpointType, Flow, FlowEndpointData, PreviewConfig, Reporter, Response};
use pip_selector::{MatchType, SelectorRegistry};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::compile::{CompiledPolicies, EvalContext, PolicyOutcome, SelectorCaches, Side, Snapshot};
use crate::endpoints::EndpointCache;
use crate::error::CalcResult;
use crate::hits::{enforced_hits, hits_equal_ignoring_order_duplicates_and_staged};
use crate::impacted::ImpactedResources;
use crate::model::{PolicyType, ResourceData, ResourceId, ResourceKind, RuleAction};

pub const PROFILE_TIER: &str = "__PROFILE__";
pub const NO_MATCH_PROFILE: &str = "__PROFILE__.__NO_MATCH__";
pub const NAMESPACE_PROFILE_PREFIX: &str = "__PROFILE__.kns.";
pub const END_OF_TIER_RULE: i64 = -1;

/// Per-flow memo shared by the before and after passes.
struct FlowCache {
    selectors: SelectorCaches,
    policies: FxHashMap<(PolicyType, ResourceId), PolicyOutcome>,
}

/// Computes how a flow would be treated under the policy configuration before and
/// after a set of proposed changes.
pub struct PolicyCalculator {
    config: PreviewConfig,
    endpoints: EndpointCache,
    registry: Arc<SelectorRegistry>,
    before: CompiledPolicies,
    after: CompiledPolicies,
    impacted: ImpactedResources,
    /// Unmodified policy outcomes can be carried from the before pass; not when
    /// namespace or service account labels changed under them.
    reuse_outcomes: bool,
}

impl PolicyCalculator {
    /// Compile both snapshots. Fails on the first policy that does not compile.
    pub fn new(
        config: PreviewConfig,
        endpoints: EndpointCache,
        before: &ResourceData,
        after: &ResourceData,
        impacted: ImpactedResources,
    ) -> CalcResult<Self> {
        Self::with_registry(config, endpoints, before, after, impacted, Arc::new(SelectorRegistry::new()))
    }

    pub fn with_registry(
        config: PreviewConfig,
        endpoints: EndpointCache,
        before: &ResourceData,
        after: &ResourceData,
        impacted: ImpactedResources,
        registry: Arc<SelectorRegistry>,
    ) -> CalcResult<Self> {
        let before = CompiledPolicies::compile(&before.clone().normalized(), Snapshot::Before, &impacted, &registry)?;
        let after = CompiledPolicies::compile(&after.clone().normalized(), Snapshot::After, &impacted, &registry)?;
        let reuse_outcomes = !impacted
            .iter()
            .any(|(id, _)| matches!(id.kind, ResourceKind::Namespace | ResourceKind::ServiceAccount));
        info!(
            impacted = impacted.len(),
            selectors = registry.len(),
            endpoints = endpoints.len(),
            "policy calculator ready"
        );
        Ok(Self { config, endpoints, registry, before, after, impacted, reuse_outcomes })
    }

    pub fn config(&self) -> &PreviewConfig { &self.config }
    pub fn impacted(&self) -> &ImpactedResources { &self.impacted }

    fn compiled(&self, s: Snapshot) -> &CompiledPolicies {
        match s {
            Snapshot::Before => &self.before,
            Snapshot::After => &self.after,
        }
    }

    fn namespace_modified(&self, ep: &FlowEndpointData) -> bool {
        if !ep.is_calico_managed() || ep.namespace.is_empty() { return false; }
        self.impacted.is_impacted(&ResourceId::namespace(&ep.namespace))
            || ep
                .service_account
                .as_deref()
                .is_some_and(|sa| self.impacted.is_impacted(&ResourceId::service_account(&ep.namespace, sa)))
    }

    /// Whether any impacted resource could affect this flow.
    fn is_flow_affected(&self, flow: &Flow, cache: &mut FlowCache) -> bool {
        if self.namespace_modified(&flow.source) || self.namespace_modified(&flow.destination) { return true; }
        for snapshot in [Snapshot::Before, Snapshot::After] {
            let compiled = self.compiled(snapshot);
            let mut ctx = EvalContext { flow, caches: &mut cache.selectors, namespaces: &compiled.namespaces };
            for (t, side) in [(PolicyType::Egress, Side::Source), (PolicyType::Ingress, Side::Destination)] {
                let affected = compiled
                    .tiers(t)
                    .iter()
                    .flat_map(|tier| tier.policies.iter())
                    .filter(|p| p.impacted)
                    .any(|p| p.applies(side, &mut ctx) != MatchType::False);
                if affected { return true; }
            }
        }
        false
    }

    /// Walk the tiers of one snapshot for the endpoint on `side`.
    fn evaluate_endpoint(&self, snapshot: Snapshot, side: Side, flow: &Flow, cache: &mut FlowCache) -> EndpointResponse {
        let ep = match side {
            Side::Source => &flow.source,
            Side::Destination => &flow.destination,
        };
        if !ep.is_calico_managed() {
            return EndpointResponse { include: false, action: Action::Allow, policies: None };
        }
        let mut hits = Vec::new();
        let action = self.walk_tiers(snapshot, side, flow, cache, &mut hits).unwrap_or_else(|| {
            if ep.endpoint_type == EndpointType::Wep {
                let profile = format!("{}{}", NAMESPACE_PROFILE_PREFIX, ep.namespace);
                push_hit(&mut hits, PROFILE_TIER, &profile, Action::Allow, END_OF_TIER_RULE);
                Action::Allow
            } else {
                push_hit(&mut hits, PROFILE_TIER, NO_MATCH_PROFILE, Action::Deny, END_OF_TIER_RULE);
                Action::Deny
            }
        });
        EndpointResponse { include: false, action, policies: Some(hits) }
    }

    /// Returns `None` when every tier passed.
    fn walk_tiers(
        &self,
        snapshot: Snapshot,
        side: Side,
        flow: &Flow,
        cache: &mut FlowCache,
        hits: &mut Vec<String>,
    ) -> Option<Action> {
        let t = match side {
            Side::Source => PolicyType::Egress,
            Side::Destination => PolicyType::Ingress,
        };
        let compiled = self.compiled(snapshot);
        let namespaces = &compiled.namespaces;
        'tiers: for tier in compiled.tiers(t) {
            let mut last_applied = None;
            for policy in &tier.policies {
                let mut ctx = EvalContext { flow, caches: &mut cache.selectors, namespaces };
                match policy.applies(side, &mut ctx) {
                    MatchType::False => continue,
                    MatchType::True => {}
                    MatchType::Uncertain | MatchType::Unknown => {
                        debug!(policy = %policy.id, "policy selection undetermined");
                        return Some(Action::Unknown);
                    }
                }
                last_applied = Some(policy);
                let key = (t, policy.id.clone());
                let reuse = snapshot == Snapshot::After && self.reuse_outcomes && !policy.modified;
                let outcome = match cache.policies.get(&key).filter(|_| reuse) {
                    Some(o) => *o,
                    None => {
                        let o = policy.evaluate_rules(&mut ctx);
                        if snapshot == Snapshot::Before { cache.policies.insert(key, o); }
                        o
                    }
                };
                match outcome {
                    PolicyOutcome::NoMatch => {}
                    PolicyOutcome::Indeterminate => {
                        debug!(policy = %policy.id, "rule match undetermined");
                        return Some(Action::Unknown);
                    }
                    PolicyOutcome::Matched { action, rule } => {
                        let a = match action {
                            RuleAction::Allow => Action::Allow,
                            RuleAction::Deny => Action::Deny,
                            RuleAction::Pass | RuleAction::Log => Action::Pass,
                        };
                        push_hit(hits, &tier.name, &policy.name, a, rule as i64);
                        if a == Action::Pass { continue 'tiers; }
                        return Some(a);
                    }
                }
            }
            if let Some(p) = last_applied {
                push_hit(hits, &tier.name, &p.name, Action::Deny, END_OF_TIER_RULE);
                return Some(Action::Deny);
            }
        }
        None
    }

    /// Use the calculated value unless it contradicts what was recorded.
    fn reconcile(&self, calculated: EndpointResponse, recorded: Action, recorded_policies: &[String]) -> EndpointResponse {
        let agrees = calculated.action == recorded
            && (recorded_policies.is_empty()
                || calculated
                    .policies
                    .as_deref()
                    .is_some_and(|calc| hits_equal_ignoring_order_duplicates_and_staged(recorded_policies, calc)));
        if self.config.calculate_original_action || agrees {
            return calculated;
        }
        debug!(calculated = %calculated.action, recorded = %recorded, "using recorded action");
        EndpointResponse { include: calculated.include, action: recorded, policies: Some(enforced_hits(recorded_policies)) }
    }

    fn calculate_before(&self, flow: &Flow, cache: &mut FlowCache) -> Response {
        let src = self.evaluate_endpoint(Snapshot::Before, Side::Source, flow, cache);
        let source = match flow.reporter {
            Reporter::Source => EndpointResponse { include: true, ..self.reconcile(src, flow.action, &flow.policies) },
            // Reported at the destination, so the source let it through.
            Reporter::Destination => self.reconcile(src, Action::Allow, &[]),
        };
        let destination = match flow.reporter {
            // Recalculated as denied at source, so the destination never sees it.
            Reporter::Destination if source.action == Action::Deny => not_included(),
            Reporter::Destination => {
                let dst = self.evaluate_endpoint(Snapshot::Before, Side::Destination, flow, cache);
                EndpointResponse { include: true, ..self.reconcile(dst, flow.action, &flow.policies) }
            }
            Reporter::Source => not_included(),
        };
        Response { source, destination }
    }

    fn calculate_after(&self, flow: &Flow, cache: &mut FlowCache) -> Response {
        let mut source = self.evaluate_endpoint(Snapshot::After, Side::Source, flow, cache);
        source.include = flow.reporter == Reporter::Source;
        let compute_destination = match flow.reporter {
            Reporter::Destination => source.action != Action::Deny,
            Reporter::Source => {
                flow.action == Action::Deny
                    && matches!(source.action, Action::Allow | Action::Unknown)
                    && flow.destination.is_calico_managed()
            }
        };
        let destination = if compute_destination {
            EndpointResponse { include: true, ..self.evaluate_endpoint(Snapshot::After, Side::Destination, flow, cache) }
        } else {
            not_included()
        };
        Response { source, destination }
    }
}

fn not_included() -> EndpointResponse { EndpointResponse { include: false, action: Action::Invalid, policies: None } }

fn push_hit(hits: &mut Vec<String>, tier: &str, name: &str, action: Action, rule: i64) {
    let idx = hits.len();
    hits.push(format!("{}|{}|{}|{}|{}", idx, tier, name, action, rule));
}

/// Response for a flow no impacted resource applies to: the recorded outcome, without
/// staged policy hits.
pub fn unchanged_response(flow: &Flow) -> Response {
    let recorded = || Some(enforced_hits(&flow.policies));
    let source = match flow.reporter {
        Reporter::Source => EndpointResponse { include: true, action: flow.action, policies: recorded() },
        Reporter::Destination => EndpointResponse { include: false, action: Action::Allow, policies: None },
    };
    let destination = match flow.reporter {
        Reporter::Destination => EndpointResponse { include: true, action: flow.action, policies: recorded() },
        Reporter::Source => not_included(),
    };
    Response { source, destination }
}

impl Calculator for PolicyCalculator {
    fn calculate(&self, flow: &Flow) -> (bool, Response, Response) {
        let started = Instant::now();
        let mut flow = flow.clone();
        self.endpoints.augment(&mut flow.source);
        self.endpoints.augment(&mut flow.destination);

        let mut cache = FlowCache { selectors: SelectorCaches::new(&self.registry, &flow), policies: FxHashMap::default() };
        if !self.is_flow_affected(&flow, &mut cache) {
            debug!(reporter = flow.reporter.as_str(), src = %flow.source.name, dst = %flow.destination.name, "flow not affected");
            let r = unchanged_response(&flow);
            return (false, r.clone(), r);
        }
        let before = self.calculate_before(&flow, &mut cache);
        let after = self.calculate_after(&flow, &mut cache);
        metrics::histogram!("pip_calculate_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(
            reporter = flow.reporter.as_str(),
            src = %flow.source.name,
            dst = %flow.destination.name,
            before_src = %before.source.action,
            after_src = %after.source.action,
            before_dst = %before.destination.action,
            after_dst = %after.destination.action,
            "calculated flow"
        );
        (true, before, after)
    }
}
