//! Flow-log policy hit strings: `<index>|<tier>|<name>|<action>[|<rule>]`.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use pip_core::Action;

use crate::model::STAGED_PREFIX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyHit {
    pub index: usize,
    pub tier: String,
    pub name: String,
    pub action: Action,
    /// Absent in the older four-field form.
    pub rule: Option<i64>,
}

impl PolicyHit {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('|');
        let index = parts.next()?.parse().ok()?;
        let tier = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        let action = Action::parse(parts.next()?);
        let rule = match parts.next() {
            Some(r) => Some(r.parse().ok()?),
            None => None,
        };
        if parts.next().is_some() { return None; }
        Some(Self { index, tier, name, action, rule })
    }

    pub fn is_staged(&self) -> bool { self.name.contains(STAGED_PREFIX) }
}

/// Enforced hits as (tier, name) -> action. `None` if any hit is unparseable or one
/// policy is recorded with two different actions.
fn enforced_actions(hits: &[String]) -> Option<BTreeMap<(String, String), Action>> {
    let mut out = BTreeMap::new();
    for s in hits {
        let h = PolicyHit::parse(s)?;
        if h.is_staged() { continue; }
        match out.entry((h.tier, h.name)) {
            Entry::Vacant(e) => {
                e.insert(h.action);
            }
            Entry::Occupied(e) if *e.get() != h.action => return None,
            Entry::Occupied(_) => {}
        }
    }
    Some(out)
}

/// Whether every enforced calculated hit was also recorded with the same action.
/// Staged policies, ordering and repeats are ignored, as are recorded hits the
/// calculation did not produce. Unparseable input never compares equal.
pub fn hits_equal_ignoring_order_duplicates_and_staged(recorded: &[String], calculated: &[String]) -> bool {
    match (enforced_actions(recorded), enforced_actions(calculated)) {
        (Some(rec), Some(calc)) => calc.iter().all(|(k, a)| rec.get(k) == Some(a)),
        _ => false,
    }
}

/// Recorded hits with staged policies dropped, in match order. Unparseable entries are
/// kept at the end.
pub fn enforced_hits(recorded: &[String]) -> Vec<String> {
    let mut out: Vec<(Option<usize>, &String)> = recorded
        .iter()
        .filter_map(|s| match PolicyHit::parse(s) {
            Some(h) if h.is_staged() => None,
            Some(h) => Some((Some(h.index), s)),
            None => Some((None, s)),
        })
        .collect();
    out.sort_by_key(|(idx, _)| idx.unwrap_or(usize::MAX));
    out.into_iter().map(|(_, s)| s.clone()).collect()
}
