use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalcError, CalcResult};
use crate::model::{knp_alias, Policy, ResourceData, ResourceId, ResourceKind, StagedAction};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Impact {
    pub deleted: bool,
    pub modified: bool,
}

/// Resources touched by a preview request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpactedResources(BTreeMap<ResourceId, Impact>);

impl ImpactedResources {
    pub fn new() -> Self { Self::default() }

    /// Record `impact` for `id`; repeated changes accumulate. A Kubernetes network policy
    /// is also recorded under its Calico alias.
    pub fn add(&mut self, id: ResourceId, impact: Impact) {
        if id.kind == ResourceKind::KubernetesNetworkPolicy {
            self.merge(knp_alias(&id), impact);
        }
        self.merge(id, impact);
    }

    fn merge(&mut self, id: ResourceId, impact: Impact) {
        let e = self.0.entry(id).or_default();
        e.deleted = impact.deleted;
        e.modified |= impact.modified;
    }

    pub fn get(&self, id: &ResourceId) -> Option<Impact> { self.0.get(id).copied() }
    pub fn is_impacted(&self, id: &ResourceId) -> bool { self.0.contains_key(id) }
    pub fn is_modified(&self, id: &ResourceId) -> bool { self.0.get(id).is_some_and(|i| i.modified || i.deleted) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Impact)> { self.0.iter() }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    Policy(Policy),
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
}

impl Resource {
    pub fn id(&self) -> CalcResult<ResourceId> {
        match self {
            Resource::Policy(p) => Ok(p.id.clone()),
            Resource::Namespace(ns) => {
                let name = ns.metadata.name.as_deref().ok_or(CalcError::Unnamed("namespace"))?;
                Ok(ResourceId::namespace(name))
            }
            Resource::ServiceAccount(sa) => {
                let name = sa.metadata.name.as_deref().ok_or(CalcError::Unnamed("service account"))?;
                let ns = sa.metadata.namespace.as_deref().unwrap_or("default");
                Ok(ResourceId::service_account(ns, name))
            }
        }
    }
}

/// A single proposed configuration change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChange {
    pub action: ChangeAction,
    pub resource: Resource,
}

/// Apply `changes` in order to a copy of `before`.
///
/// Returns the "after" snapshot and the set of impacted resources.
pub fn apply_resource_changes(before: &ResourceData, changes: &[ResourceChange]) -> CalcResult<(ResourceData, ImpactedResources)> {
    let mut after = before.clone().normalized();
    let mut impacted = ImpactedResources::new();
    for change in changes {
        let id = change.resource.id()?;
        let impact = match &change.resource {
            Resource::Policy(p) => {
                apply_policy(&mut after, &mut impacted, change.action, p.clone())?;
                continue;
            }
            Resource::Namespace(ns) => apply_named(&mut after.namespaces, change.action, ns, &id, |n| {
                ResourceId::namespace(n.metadata.name.as_deref().unwrap_or_default())
            })?,
            Resource::ServiceAccount(sa) => apply_named(&mut after.service_accounts, change.action, sa, &id, |s| {
                ResourceId::service_account(
                    s.metadata.namespace.as_deref().unwrap_or("default"),
                    s.metadata.name.as_deref().unwrap_or_default(),
                )
            })?,
        };
        debug!(resource = %id, action = ?change.action, modified = impact.modified, "applied resource change");
        impacted.add(id, impact);
    }
    Ok((after, impacted))
}

fn validate_scope(p: &Policy) -> CalcResult<()> {
    let namespaced = matches!(
        p.id.kind,
        ResourceKind::NetworkPolicy | ResourceKind::StagedNetworkPolicy | ResourceKind::KubernetesNetworkPolicy
    );
    if !p.id.kind.is_policy() {
        return Err(CalcError::InvalidResource(p.id.clone(), "not a policy kind".into()));
    }
    if namespaced != p.is_namespaced() {
        let msg = if namespaced { "namespace is required" } else { "namespace is not allowed" };
        return Err(CalcError::InvalidResource(p.id.clone(), msg.into()));
    }
    Ok(())
}

/// Creating or updating a staged policy previews enforcing it: the staged policy
/// replaces its enforced counterpart, or only removes it for a staged delete.
fn apply_policy(data: &mut ResourceData, impacted: &mut ImpactedResources, action: ChangeAction, policy: Policy) -> CalcResult<()> {
    validate_scope(&policy)?;
    let requested = policy.id.clone();
    let policy = policy.into_calico();
    let id = policy.id.clone();
    let enforced = policy.enforced_id();
    if action == ChangeAction::Delete {
        take_policy(data, &id).ok_or_else(|| CalcError::MissingResource(requested.clone()))?;
        debug!(resource = %requested, "deleted policy");
        impacted.add(requested, Impact { deleted: true, modified: false });
        return Ok(());
    }

    let existing = take_policy(data, &id);
    match (action, existing) {
        (ChangeAction::Create, Some(old)) => {
            insert_policy(data, old)?;
            return Err(CalcError::DuplicateResource(requested));
        }
        (ChangeAction::Update, None) if enforced.is_none() => return Err(CalcError::MissingResource(requested)),
        (_, existing) => {
            let modified = existing.as_ref().map_or(true, |old| old.differs_for_preview(&policy));
            if enforced.is_some() && policy.staged_action == StagedAction::Delete {
                debug!(resource = %requested, "staged delete");
            } else {
                insert_policy(data, policy)?;
                debug!(resource = %requested, action = ?action, modified, "applied policy change");
                impacted.add(requested, Impact { deleted: false, modified });
            }
        }
    }
    if let Some(enforced) = enforced {
        if take_policy(data, &enforced).is_some() {
            debug!(resource = %enforced, "staged policy replaces enforced policy");
        }
        impacted.add(enforced, Impact { deleted: true, modified: false });
    }
    Ok(())
}

fn take_policy(data: &mut ResourceData, id: &ResourceId) -> Option<Policy> {
    data.tiers.iter_mut().find_map(|t| {
        let pos = t.policies.iter().position(|p| &p.id == id)?;
        Some(t.policies.remove(pos))
    })
}

fn insert_policy(data: &mut ResourceData, policy: Policy) -> CalcResult<()> {
    let tier = data
        .tiers
        .iter_mut()
        .find(|t| t.name == policy.tier)
        .ok_or_else(|| CalcError::UnknownTier(policy.tier.clone()))?;
    tier.policies.push(policy);
    tier.sort_policies();
    Ok(())
}

fn apply_named<T: Clone + PartialEq>(
    list: &mut Vec<T>,
    action: ChangeAction,
    resource: &T,
    id: &ResourceId,
    id_of: impl Fn(&T) -> ResourceId,
) -> CalcResult<Impact> {
    let pos = list.iter().position(|r| &id_of(r) == id);
    match (action, pos) {
        (ChangeAction::Create, Some(_)) => Err(CalcError::DuplicateResource(id.clone())),
        (ChangeAction::Create, None) => {
            list.push(resource.clone());
            Ok(Impact { deleted: false, modified: true })
        }
        (ChangeAction::Update, Some(i)) => {
            let modified = list[i] != *resource;
            list[i] = resource.clone();
            Ok(Impact { deleted: false, modified })
        }
        (ChangeAction::Delete, Some(i)) => {
            list.remove(i);
            Ok(Impact { deleted: true, modified: false })
        }
        (ChangeAction::Update | ChangeAction::Delete, None) => Err(CalcError::MissingResource(id.clone())),
    }
}
