//! Policies compiled against a selector registry for repeated flow evaluation.

use std::sync::Arc;

use ipnetwork::IpNetwork;
use pip_core::{protocol_number, Flow, FlowEndpointData, EndpointType};
use pip_selector::{MatchType, Matcher, Selector, SelectorError, SelectorRegistry};

use crate::error::{CalcError, CalcResult};
use crate::impacted::ImpactedResources;
use crate::model::{EntityRule, Policy, PolicyType, PortSpec, ProtocolSpec, ResourceData, ResourceId, Rule, RuleAction};
use crate::namespaces::NamespaceHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Source,
    Destination,
}

impl Side {
    fn endpoint(self, flow: &Flow) -> &FlowEndpointData {
        match self {
            Side::Source => &flow.source,
            Side::Destination => &flow.destination,
        }
    }
}

/// Per-flow selector results for each side.
///
/// A side whose labels are not known gets an empty cache; every selector is then
/// `Uncertain` for it and nothing is stored.
#[derive(Debug, Default)]
pub(crate) struct SelectorCaches {
    source: Vec<MatchType>,
    destination: Vec<MatchType>,
}

impl SelectorCaches {
    pub(crate) fn new(registry: &SelectorRegistry, flow: &Flow) -> Self {
        let alloc = |ep: &FlowEndpointData| {
            if ep.labels.is_some() { registry.create_selector_cache() } else { Vec::new() }
        };
        Self { source: alloc(&flow.source), destination: alloc(&flow.destination) }
    }

    fn side(&mut self, side: Side) -> &mut [MatchType] {
        match side {
            Side::Source => &mut self.source,
            Side::Destination => &mut self.destination,
        }
    }
}

/// Shared evaluation inputs for one flow against one snapshot.
pub(crate) struct EvalContext<'a> {
    pub flow: &'a Flow,
    pub caches: &'a mut SelectorCaches,
    pub namespaces: &'a NamespaceHandler,
}

#[derive(Debug)]
enum PortMatch {
    Range(u16, u16),
    Named(String),
}

#[derive(Debug)]
enum Criterion {
    Protocol { proto: u8, negate: bool },
    IpVersion(u8),
    /// ICMP, HTTP and domain matches; flow records carry no such detail.
    Undeterminable,
    InNamespace { side: Side, namespace: String },
    NamespaceSelector { side: Side, selector: Selector },
    Selector { side: Side, matcher: Arc<Matcher>, negate: bool },
    Nets { side: Side, nets: Vec<IpNetwork>, negate: bool },
    Ports { side: Side, ports: Vec<PortMatch>, negate: bool },
    ServiceAccounts { side: Side, names: Vec<String>, selector: Option<Selector> },
}

fn namespace_selector_match(selector: &Selector, ep: &FlowEndpointData, namespaces: &NamespaceHandler) -> MatchType {
    if !ep.endpoint_type.supports_labels() { return MatchType::False; }
    if selector.is_global() { return MatchType::from_bool(ep.namespace.is_empty()); }
    if ep.namespace.is_empty() { return MatchType::False; }
    MatchType::from_bool(selector.evaluate(&namespaces.namespace_labels(&ep.namespace)))
}

fn any_match(results: impl Iterator<Item = MatchType>) -> MatchType {
    let mut out = MatchType::False;
    for r in results {
        match r {
            MatchType::True => return MatchType::True,
            MatchType::Uncertain | MatchType::Unknown => out = MatchType::Uncertain,
            MatchType::False => {}
        }
    }
    out
}

fn negate_if(m: MatchType, negate: bool) -> MatchType { if negate { m.not() } else { m } }

impl Criterion {
    fn evaluate(&self, ctx: &mut EvalContext<'_>) -> MatchType {
        let flow = ctx.flow;
        match self {
            Criterion::Protocol { proto, negate } => match flow.proto {
                Some(p) => negate_if(MatchType::from_bool(p == *proto), *negate),
                None => MatchType::Uncertain,
            },
            Criterion::IpVersion(v) => flow.ip_version.map_or(MatchType::Uncertain, |fv| MatchType::from_bool(fv == *v)),
            Criterion::Undeterminable => MatchType::Uncertain,
            Criterion::InNamespace { side, namespace } => MatchType::from_bool(&side.endpoint(flow).namespace == namespace),
            Criterion::NamespaceSelector { side, selector } => {
                namespace_selector_match(selector, side.endpoint(flow), ctx.namespaces)
            }
            Criterion::Selector { side, matcher, negate } => {
                negate_if(matcher.evaluate(side.endpoint(flow), ctx.caches.side(*side)), *negate)
            }
            Criterion::Nets { side, nets, negate } => match side.endpoint(flow).ip {
                Some(ip) => negate_if(MatchType::from_bool(nets.iter().any(|n| n.contains(ip))), *negate),
                None => MatchType::Uncertain,
            },
            Criterion::Ports { side, ports, negate } => {
                let ep = side.endpoint(flow);
                let Some(port) = ep.port else { return MatchType::Uncertain };
                let m = any_match(ports.iter().map(|p| match p {
                    PortMatch::Range(lo, hi) => MatchType::from_bool((*lo..=*hi).contains(&port)),
                    PortMatch::Named(name) => match (ep.named_ports.as_ref(), flow.proto) {
                        (Some(named), Some(proto)) => MatchType::from_bool(
                            named.iter().any(|np| &np.name == name && np.port == port && np.protocol == proto),
                        ),
                        _ => MatchType::Uncertain,
                    },
                }));
                negate_if(m, *negate)
            }
            Criterion::ServiceAccounts { side, names, selector } => {
                let ep = side.endpoint(flow);
                if ep.endpoint_type != EndpointType::Wep { return MatchType::False; }
                let Some(sa) = ep.service_account.as_deref() else { return MatchType::Uncertain };
                if !names.is_empty() && !names.iter().any(|n| n == sa) { return MatchType::False; }
                match selector {
                    None => MatchType::True,
                    Some(sel) => match ctx.namespaces.service_account_labels(&ep.namespace, sa) {
                        Some(labels) => MatchType::from_bool(sel.evaluate(labels)),
                        None => MatchType::Uncertain,
                    },
                }
            }
        }
    }
}

/// Result of walking one policy's rules for a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PolicyOutcome {
    NoMatch,
    /// A rule could not be decided before any rule matched.
    Indeterminate,
    Matched { action: RuleAction, rule: usize },
}

#[derive(Debug)]
pub(crate) struct CompiledRule {
    index: usize,
    action: RuleAction,
    criteria: Vec<Criterion>,
}

impl CompiledRule {
    fn evaluate(&self, ctx: &mut EvalContext<'_>) -> MatchType {
        let mut result = MatchType::True;
        for c in &self.criteria {
            result = result.and(c.evaluate(ctx));
            if result == MatchType::False { break; }
        }
        result
    }
}

#[derive(Debug)]
pub(crate) struct CompiledPolicy {
    pub id: ResourceId,
    /// Flow-log name, also the key for reusing outcomes between snapshots.
    pub name: String,
    pub impacted: bool,
    pub modified: bool,
    selector: Arc<Matcher>,
    namespace: Option<String>,
    namespace_selector: Option<Selector>,
    rules: Vec<CompiledRule>,
}

impl CompiledPolicy {
    /// Whether the policy selects the endpoint on `side`.
    pub(crate) fn applies(&self, side: Side, ctx: &mut EvalContext<'_>) -> MatchType {
        let ep = side.endpoint(ctx.flow);
        if !ep.is_calico_managed() { return MatchType::False; }
        if let Some(ns) = &self.namespace {
            if &ep.namespace != ns { return MatchType::False; }
        }
        let mut result = MatchType::True;
        if let Some(sel) = &self.namespace_selector {
            result = namespace_selector_match(sel, ep, ctx.namespaces);
            if result == MatchType::False { return result; }
        }
        result.and(self.selector.evaluate(ep, ctx.caches.side(side)))
    }

    /// First decisive rule wins; `Log` rules never decide.
    pub(crate) fn evaluate_rules(&self, ctx: &mut EvalContext<'_>) -> PolicyOutcome {
        for rule in self.rules.iter().filter(|r| r.action != RuleAction::Log) {
            match rule.evaluate(ctx) {
                MatchType::True => return PolicyOutcome::Matched { action: rule.action, rule: rule.index },
                MatchType::False => {}
                MatchType::Uncertain | MatchType::Unknown => return PolicyOutcome::Indeterminate,
            }
        }
        PolicyOutcome::NoMatch
    }
}

#[derive(Debug)]
pub(crate) struct CompiledTier {
    pub name: String,
    pub policies: Vec<CompiledPolicy>,
}

/// One snapshot compiled for both directions.
#[derive(Debug)]
pub(crate) struct CompiledPolicies {
    pub ingress: Vec<CompiledTier>,
    pub egress: Vec<CompiledTier>,
    pub namespaces: NamespaceHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Snapshot {
    Before,
    After,
}

impl CompiledPolicies {
    /// Compile the enforced policies of `data`. Staged policies are only enforced in the
    /// after snapshot, and only when impacted.
    pub(crate) fn compile(
        data: &ResourceData,
        snapshot: Snapshot,
        impacted: &ImpactedResources,
        registry: &SelectorRegistry,
    ) -> CalcResult<Self> {
        let mut ingress = Vec::with_capacity(data.tiers.len());
        let mut egress = Vec::with_capacity(data.tiers.len());
        for tier in &data.tiers {
            let mut ing = CompiledTier { name: tier.name.clone(), policies: Vec::new() };
            let mut eg = CompiledTier { name: tier.name.clone(), policies: Vec::new() };
            for p in &tier.policies {
                let is_impacted = impacted.is_impacted(&p.id);
                if p.staged() && !(snapshot == Snapshot::After && is_impacted) { continue; }
                let modified = snapshot == Snapshot::After && impacted.is_modified(&p.id);
                for (t, out) in [(PolicyType::Ingress, &mut ing), (PolicyType::Egress, &mut eg)] {
                    if p.applies_to(t) {
                        out.policies.push(compile_policy(p, t, is_impacted, modified, registry)?);
                    }
                }
            }
            ingress.push(ing);
            egress.push(eg);
        }
        Ok(Self { ingress, egress, namespaces: NamespaceHandler::new(data) })
    }

    pub(crate) fn tiers(&self, t: PolicyType) -> &[CompiledTier] {
        match t {
            PolicyType::Ingress => &self.ingress,
            PolicyType::Egress => &self.egress,
        }
    }
}

struct Compiler<'a> {
    policy: &'a Policy,
    name: &'a str,
    registry: &'a SelectorRegistry,
}

impl Compiler<'_> {
    fn selector_err(&self, source: SelectorError) -> CalcError {
        CalcError::Selector { policy: self.name.to_string(), source }
    }

    fn matcher(&self, expr: &str) -> CalcResult<Arc<Matcher>> {
        self.registry.get_selector_endpoint_matcher(expr).map_err(|e| self.selector_err(e))
    }

    fn selector(&self, expr: &str) -> CalcResult<Selector> { Selector::parse(expr).map_err(|e| self.selector_err(e)) }

    fn protocol(&self, spec: &ProtocolSpec) -> CalcResult<u8> {
        match spec {
            ProtocolSpec::Number(n) => Ok(*n),
            ProtocolSpec::Name(s) => protocol_number(s)
                .ok_or_else(|| CalcError::InvalidProtocol { policy: self.name.to_string(), protocol: s.clone() }),
        }
    }

    fn nets(&self, nets: &[String]) -> CalcResult<Vec<IpNetwork>> {
        nets.iter()
            .map(|n| n.parse::<IpNetwork>().map_err(|_| CalcError::InvalidCidr { policy: self.name.to_string(), cidr: n.clone() }))
            .collect()
    }

    fn ports(&self, ports: &[PortSpec]) -> CalcResult<Vec<PortMatch>> {
        ports.iter().map(|p| self.port(p)).collect()
    }

    fn port(&self, spec: &PortSpec) -> CalcResult<PortMatch> {
        let invalid = |s: &str| CalcError::InvalidPort { policy: self.name.to_string(), port: s.to_string() };
        match spec {
            PortSpec::Number(n) => Ok(PortMatch::Range(*n, *n)),
            PortSpec::Text(s) => {
                if let Some((lo, hi)) = s.split_once(':') {
                    let lo = lo.trim().parse::<u16>().map_err(|_| invalid(s))?;
                    let hi = hi.trim().parse::<u16>().map_err(|_| invalid(s))?;
                    if lo > hi { return Err(invalid(s)); }
                    Ok(PortMatch::Range(lo, hi))
                } else if let Ok(n) = s.trim().parse::<u16>() {
                    Ok(PortMatch::Range(n, n))
                } else if s.trim().is_empty() {
                    Err(invalid(s))
                } else {
                    Ok(PortMatch::Named(s.trim().to_string()))
                }
            }
        }
    }

    fn entity(&self, side: Side, e: &EntityRule, out: &mut Vec<Criterion>) -> CalcResult<()> {
        if let Some(ns_sel) = &e.namespace_selector {
            out.push(Criterion::NamespaceSelector { side, selector: self.selector(ns_sel)? });
        } else if e.selector.is_some() || e.not_selector.is_some() {
            if let Some(ns) = &self.policy.id.namespace {
                out.push(Criterion::InNamespace { side, namespace: ns.clone() });
            }
        }
        if let Some(s) = &e.selector {
            out.push(Criterion::Selector { side, matcher: self.matcher(s)?, negate: false });
        }
        if let Some(s) = &e.not_selector {
            out.push(Criterion::Selector { side, matcher: self.matcher(s)?, negate: true });
        }
        if let Some(sa) = &e.service_accounts {
            let selector = sa.selector.as_deref().map(|s| self.selector(s)).transpose()?;
            out.push(Criterion::ServiceAccounts { side, names: sa.names.clone(), selector });
        }
        if !e.nets.is_empty() {
            out.push(Criterion::Nets { side, nets: self.nets(&e.nets)?, negate: false });
        }
        if !e.not_nets.is_empty() {
            out.push(Criterion::Nets { side, nets: self.nets(&e.not_nets)?, negate: true });
        }
        if !e.ports.is_empty() {
            out.push(Criterion::Ports { side, ports: self.ports(&e.ports)?, negate: false });
        }
        if !e.not_ports.is_empty() {
            out.push(Criterion::Ports { side, ports: self.ports(&e.not_ports)?, negate: true });
        }
        if !e.domains.is_empty() {
            out.push(Criterion::Undeterminable);
        }
        Ok(())
    }

    fn rule(&self, index: usize, r: &Rule) -> CalcResult<CompiledRule> {
        let mut criteria = Vec::new();
        if let Some(p) = &r.protocol {
            criteria.push(Criterion::Protocol { proto: self.protocol(p)?, negate: false });
        }
        if let Some(p) = &r.not_protocol {
            criteria.push(Criterion::Protocol { proto: self.protocol(p)?, negate: true });
        }
        if let Some(v) = r.ip_version {
            criteria.push(Criterion::IpVersion(v));
        }
        self.entity(Side::Source, &r.source, &mut criteria)?;
        self.entity(Side::Destination, &r.destination, &mut criteria)?;
        if r.icmp.is_some() || r.not_icmp.is_some() || r.http.is_some() {
            criteria.push(Criterion::Undeterminable);
        }
        Ok(CompiledRule { index, action: r.action, criteria })
    }
}

fn compile_policy(
    p: &Policy,
    t: PolicyType,
    impacted: bool,
    modified: bool,
    registry: &SelectorRegistry,
) -> CalcResult<CompiledPolicy> {
    let name = p.enforced_flow_log_name();
    let c = Compiler { policy: p, name: &name, registry };
    let selector = c.matcher(&p.selector)?;
    let namespace_selector = match (&p.id.namespace, &p.namespace_selector) {
        (None, Some(s)) => Some(c.selector(s)?),
        _ => None,
    };
    let rules = p.rules(t).iter().enumerate().map(|(i, r)| c.rule(i, r)).collect::<CalcResult<Vec<_>>>()?;
    Ok(CompiledPolicy {
        id: p.id.clone(),
        name,
        impacted,
        modified,
        selector,
        namespace: p.id.namespace.clone(),
        namespace_selector,
        rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceKind, ServiceAccountMatch, StagedAction};
    use pip_core::{Action, Labels, NamedPort, Reporter, PROTO_TCP, PROTO_UDP};

    fn labels(l: &[(&str, &str)]) -> Option<Labels> { Some(l.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()) }

    fn flow() -> Flow {
        Flow {
            reporter: Reporter::Source,
            source: FlowEndpointData {
                endpoint_type: EndpointType::Wep,
                namespace: "ns1".into(),
                name: "a".into(),
                labels: labels(&[("app", "a")]),
                ip: Some("10.0.0.1".parse().unwrap()),
                service_account: Some("sa-a".into()),
                ..Default::default()
            },
            destination: FlowEndpointData {
                endpoint_type: EndpointType::Wep,
                namespace: "ns2".into(),
                name: "b".into(),
                labels: labels(&[("app", "b")]),
                ip: Some("10.1.0.1".parse().unwrap()),
                port: Some(8080),
                named_ports: Some(vec![NamedPort { name: "http".into(), protocol: PROTO_TCP, port: 8080 }]),
                ..Default::default()
            },
            action: Action::Allow,
            proto: Some(PROTO_TCP),
            ip_version: Some(4),
            policies: vec![],
        }
    }

    fn policy(ns: Option<&str>, egress: Vec<Rule>) -> Policy {
        let kind = if ns.is_some() { ResourceKind::NetworkPolicy } else { ResourceKind::GlobalNetworkPolicy };
        Policy {
            id: ResourceId::new(kind, ns, "t.p"),
            tier: "t".into(),
            order: None,
            selector: "all()".into(),
            namespace_selector: None,
            types: vec![PolicyType::Egress],
            ingress: vec![],
            egress,
            staged_action: StagedAction::Set,
        }
    }

    fn eval_rule(p: &Policy, f: &Flow) -> PolicyOutcome {
        let registry = SelectorRegistry::new();
        let cp = compile_policy(p, PolicyType::Egress, false, false, &registry).unwrap();
        let mut caches = SelectorCaches::new(&registry, f);
        let namespaces = NamespaceHandler::default();
        let mut ctx = EvalContext { flow: f, caches: &mut caches, namespaces: &namespaces };
        cp.evaluate_rules(&mut ctx)
    }

    fn dst_rule(e: EntityRule) -> Rule { Rule { action: RuleAction::Deny, destination: e, ..Default::default() } }

    #[test]
    fn namespaced_rule_selector_is_restricted_to_policy_namespace() {
        let rule = dst_rule(EntityRule { selector: Some("app == 'b'".into()), ..Default::default() });
        assert_eq!(eval_rule(&policy(Some("ns1"), vec![rule.clone()]), &flow()), PolicyOutcome::NoMatch);
        assert_eq!(eval_rule(&policy(None, vec![rule]), &flow()), PolicyOutcome::Matched { action: RuleAction::Deny, rule: 0 });

        let any_ns = dst_rule(EntityRule {
            selector: Some("app == 'b'".into()),
            namespace_selector: Some("all()".into()),
            ..Default::default()
        });
        assert!(matches!(eval_rule(&policy(Some("ns1"), vec![any_ns]), &flow()), PolicyOutcome::Matched { .. }));
    }

    #[test]
    fn first_decisive_rule_wins_and_log_is_skipped() {
        let rules = vec![
            Rule { action: RuleAction::Log, ..Default::default() },
            dst_rule(EntityRule { nets: vec!["192.168.0.0/16".into()], ..Default::default() }),
            Rule { action: RuleAction::Pass, protocol: Some(ProtocolSpec::Name("TCP".into())), ..Default::default() },
            Rule { action: RuleAction::Allow, ..Default::default() },
        ];
        assert_eq!(eval_rule(&policy(None, rules), &flow()), PolicyOutcome::Matched { action: RuleAction::Pass, rule: 2 });
    }

    #[test]
    fn missing_flow_data_is_indeterminate() {
        let mut f = flow();
        f.destination.port = None;
        let rule = dst_rule(EntityRule { ports: vec![PortSpec::Number(8080)], ..Default::default() });
        assert_eq!(eval_rule(&policy(None, vec![rule.clone()]), &f), PolicyOutcome::Indeterminate);
        assert!(matches!(eval_rule(&policy(None, vec![rule]), &flow()), PolicyOutcome::Matched { .. }));

        // A False criterion still decides even with other data missing.
        let mut f = flow();
        f.proto = None;
        let rule = Rule {
            action: RuleAction::Deny,
            protocol: Some(ProtocolSpec::Number(PROTO_UDP)),
            destination: EntityRule { nets: vec!["192.168.0.0/16".into()], ..Default::default() },
            ..Default::default()
        };
        assert_eq!(eval_rule(&policy(None, vec![rule]), &f), PolicyOutcome::NoMatch);
    }

    #[test]
    fn ports_ranges_and_named_ports() {
        let ok = |ports: Vec<PortSpec>| eval_rule(&policy(None, vec![dst_rule(EntityRule { ports, ..Default::default() })]), &flow());
        assert!(matches!(ok(vec![PortSpec::Text("8000:8100".into())]), PolicyOutcome::Matched { .. }));
        assert!(matches!(ok(vec![PortSpec::Text("http".into())]), PolicyOutcome::Matched { .. }));
        assert_eq!(ok(vec![PortSpec::Text("grpc".into()), PortSpec::Number(80)]), PolicyOutcome::NoMatch);

        let not_ports = dst_rule(EntityRule { not_ports: vec![PortSpec::Number(8080)], ..Default::default() });
        assert_eq!(eval_rule(&policy(None, vec![not_ports]), &flow()), PolicyOutcome::NoMatch);
    }

    #[test]
    fn service_accounts_and_uncertain_criteria() {
        let sa = |names: Vec<&str>| Rule {
            action: RuleAction::Allow,
            source: EntityRule {
                service_accounts: Some(ServiceAccountMatch { names: names.into_iter().map(Into::into).collect(), selector: None }),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(eval_rule(&policy(None, vec![sa(vec!["sa-a"])]), &flow()), PolicyOutcome::Matched { .. }));
        assert_eq!(eval_rule(&policy(None, vec![sa(vec!["sa-z"])]), &flow()), PolicyOutcome::NoMatch);

        let http = Rule { action: RuleAction::Allow, http: Some(Default::default()), ..Default::default() };
        assert_eq!(eval_rule(&policy(None, vec![http]), &flow()), PolicyOutcome::Indeterminate);
    }

    #[test]
    fn compile_errors_name_the_policy() {
        let registry = SelectorRegistry::new();
        let mut p = policy(None, vec![dst_rule(EntityRule { nets: vec!["10.0.0.0/99".into()], ..Default::default() })]);
        assert!(matches!(
            compile_policy(&p, PolicyType::Egress, false, false, &registry),
            Err(CalcError::InvalidCidr { policy, .. }) if policy == "t.p"
        ));
        p.egress.clear();
        p.selector = "app ==".into();
        assert!(matches!(compile_policy(&p, PolicyType::Egress, false, false, &registry), Err(CalcError::Selector { .. })));
    }

    #[test]
    fn applies_checks_namespace_and_selector() {
        let registry = SelectorRegistry::new();
        let mut p = policy(Some("ns1"), vec![]);
        p.selector = "app == 'a'".into();
        let cp = compile_policy(&p, PolicyType::Egress, false, false, &registry).unwrap();
        let f = flow();
        let mut caches = SelectorCaches::new(&registry, &f);
        let namespaces = NamespaceHandler::default();
        let mut ctx = EvalContext { flow: &f, caches: &mut caches, namespaces: &namespaces };
        assert_eq!(cp.applies(Side::Source, &mut ctx), MatchType::True);
        assert_eq!(cp.applies(Side::Destination, &mut ctx), MatchType::False);

        let mut f = flow();
        f.source.labels = None;
        let mut caches = SelectorCaches::new(&registry, &f);
        let mut ctx = EvalContext { flow: &f, caches: &mut caches, namespaces: &namespaces };
        assert_eq!(cp.applies(Side::Source, &mut ctx), MatchType::Uncertain);
    }
}
