//! Endpoint selector matching with per-flow memoization.
//!
//! Selectors are compiled once into a [`Matcher`] held by a [`SelectorRegistry`].
//! Each matcher owns a fixed slot in the per-flow cache returned by
//! [`SelectorRegistry::create_selector_cache`], so repeated evaluation of the same
//! selector against the same endpoint (both reporter sides, both snapshots) is
//! computed once.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use pip_core::FlowEndpointData;
use rustc_hash::FxHashMap;
use tracing::debug;

pub mod parser;

pub use parser::Selector;

/// Result of matching a selector against an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MatchType {
    /// Not evaluated yet. Only ever seen as an initial cache slot.
    #[default]
    Unknown,
    /// The endpoint can carry labels but they are not known.
    Uncertain,
    False,
    True,
}

impl MatchType {
    pub fn from_bool(b: bool) -> Self { if b { MatchType::True } else { MatchType::False } }

    /// Conjunction: `False` dominates, then `Uncertain`.
    pub fn and(self, other: MatchType) -> MatchType {
        match (self, other) {
            (MatchType::False, _) | (_, MatchType::False) => MatchType::False,
            (MatchType::True, MatchType::True) => MatchType::True,
            _ => MatchType::Uncertain,
        }
    }

    /// Logical negation; `Uncertain` stays uncertain.
    pub fn not(self) -> MatchType {
        match self {
            MatchType::True => MatchType::False,
            MatchType::False => MatchType::True,
            other => other,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid selector {expression:?} at offset {position}: {message}")]
pub struct SelectorError {
    pub expression: String,
    pub position: usize,
    pub message: String,
}

impl SelectorError {
    pub fn new(expression: &str, position: usize, message: impl Into<String>) -> Self {
        Self { expression: expression.to_string(), position, message: message.into() }
    }
}

/// A compiled selector bound to a cache slot.
#[derive(Debug)]
pub struct Matcher {
    index: usize,
    expression: String,
    selector: Selector,
}

impl Matcher {
    pub fn index(&self) -> usize { self.index }
    pub fn expression(&self) -> &str { &self.expression }
    pub fn selector(&self) -> &Selector { &self.selector }

    /// Evaluate against `ep`, reading and filling slot `index` of `cache`.
    ///
    /// Endpoint types without labels are always `False`. Unknown labels on a
    /// label-capable endpoint give `Uncertain`. A cache allocated before this matcher
    /// was registered is too short to hold its slot; the result is then computed
    /// without being stored.
    pub fn evaluate(&self, ep: &FlowEndpointData, cache: &mut [MatchType]) -> MatchType {
        if !ep.endpoint_type.supports_labels() { return MatchType::False; }
        if let Some(cached) = cache.get(self.index) {
            if *cached != MatchType::Unknown { return *cached; }
        }
        let result = match ep.labels.as_ref() {
            Some(labels) => MatchType::from_bool(self.selector.evaluate(labels)),
            None => MatchType::Uncertain,
        };
        if let Some(slot) = cache.get_mut(self.index) { *slot = result; }
        result
    }
}

/// Registry of compiled selectors keyed by exact expression text.
///
/// Safe to share between concurrent requests; registration is serialized by a mutex.
#[derive(Debug, Default)]
pub struct SelectorRegistry {
    inner: Mutex<FxHashMap<String, Arc<Matcher>>>,
}

impl SelectorRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.inner.lock().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Return the matcher for `expression`, compiling and registering it on first use.
    /// Identical strings share one matcher; equivalent but differently written
    /// expressions get their own.
    pub fn get_selector_endpoint_matcher(&self, expression: &str) -> Result<Arc<Matcher>, SelectorError> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(m) = map.get(expression) { return Ok(Arc::clone(m)); }
        let selector = Selector::parse(expression)?;
        let matcher = Arc::new(Matcher { index: map.len(), expression: expression.to_string(), selector });
        map.insert(expression.to_string(), Arc::clone(&matcher));
        debug!(selector = %expression, index = matcher.index, "registered selector");
        metrics::counter!("pip_selectors_registered_total", 1u64);
        metrics::gauge!("pip_selector_registry_size", map.len() as f64);
        Ok(matcher)
    }

    /// A fresh per-endpoint cache with one `Unknown` slot per registered selector.
    pub fn create_selector_cache(&self) -> Vec<MatchType> { vec![MatchType::Unknown; self.len()] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pip_core::{EndpointType, Labels};

    fn ep(t: EndpointType, labels: Option<&[(&str, &str)]>) -> FlowEndpointData {
        FlowEndpointData {
            endpoint_type: t,
            labels: labels.map(|l| l.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<Labels>()),
            ..Default::default()
        }
    }

    #[test]
    fn identical_expression_reuses_matcher() {
        let reg = SelectorRegistry::new();
        let a = reg.get_selector_endpoint_matcher("color == 'red'").unwrap();
        assert_eq!(reg.len(), 1);
        let b = reg.get_selector_endpoint_matcher("color == 'red'").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
        // Equivalent but not identical.
        let c = reg.get_selector_endpoint_matcher("color=='red'").unwrap();
        assert_eq!(reg.len(), 2);
        assert_ne!(a.index(), c.index());
    }

    #[test]
    fn parse_failure_is_reported_and_not_registered() {
        let reg = SelectorRegistry::new();
        assert!(reg.get_selector_endpoint_matcher("color ==").is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn cache_starts_unknown_and_fills_single_slot() {
        let reg = SelectorRegistry::new();
        let red = reg.get_selector_endpoint_matcher("color == 'red'").unwrap();
        let blue = reg.get_selector_endpoint_matcher("color == 'blue'").unwrap();
        let mut cache = reg.create_selector_cache();
        assert_eq!(cache, vec![MatchType::Unknown, MatchType::Unknown]);

        let e = ep(EndpointType::Wep, Some(&[("color", "red")]));
        assert_eq!(red.evaluate(&e, &mut cache), MatchType::True);
        assert_eq!(red.evaluate(&e, &mut cache), MatchType::True);
        assert_eq!(cache[red.index()], MatchType::True);
        assert_eq!(cache[blue.index()], MatchType::Unknown);

        assert_eq!(blue.evaluate(&e, &mut cache), MatchType::False);
        assert_eq!(cache[red.index()], MatchType::True);
    }

    #[test]
    fn cached_value_wins_over_recomputation() {
        let reg = SelectorRegistry::new();
        let red = reg.get_selector_endpoint_matcher("color == 'red'").unwrap();
        let mut cache = reg.create_selector_cache();
        cache[red.index()] = MatchType::False;
        let e = ep(EndpointType::Wep, Some(&[("color", "red")]));
        assert_eq!(red.evaluate(&e, &mut cache), MatchType::False);
    }

    #[test]
    fn unknown_labels_are_uncertain_and_networks_never_match() {
        let reg = SelectorRegistry::new();
        let sels = ["all()", "has(x)", "color != 'red'", "!has(x)"];
        for s in sels {
            let m = reg.get_selector_endpoint_matcher(s).unwrap();
            let mut cache = reg.create_selector_cache();
            assert_eq!(m.evaluate(&ep(EndpointType::Wep, None), &mut cache), MatchType::Uncertain, "{}", s);
            let mut cache = reg.create_selector_cache();
            assert_eq!(m.evaluate(&ep(EndpointType::NetworkSet, None), &mut cache), MatchType::Uncertain, "{}", s);
            let mut cache = reg.create_selector_cache();
            assert_eq!(m.evaluate(&ep(EndpointType::Net, None), &mut cache), MatchType::False, "{}", s);
            assert_eq!(m.evaluate(&ep(EndpointType::Net, Some(&[("x", "1")])), &mut cache), MatchType::False, "{}", s);
        }
    }

    #[test]
    fn short_cache_is_not_written() {
        let reg = SelectorRegistry::new();
        let mut cache = reg.create_selector_cache();
        let m = reg.get_selector_endpoint_matcher("all()").unwrap();
        assert_eq!(m.evaluate(&ep(EndpointType::Hep, Some(&[])), &mut cache), MatchType::True);
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_registration_assigns_unique_slots() {
        let reg = Arc::new(SelectorRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for i in 0..16 {
                        reg.get_selector_endpoint_matcher(&format!("k{} == 'v'", (t + i) % 20)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles { h.join().unwrap(); }
        assert_eq!(reg.len(), 20);
        let mut idx: Vec<usize> = (0..20).map(|i| reg.get_selector_endpoint_matcher(&format!("k{} == 'v'", i)).unwrap().index()).collect();
        idx.sort_unstable();
        assert_eq!(idx, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn match_type_combinators() {
        assert_eq!(MatchType::True.and(MatchType::Uncertain), MatchType::Uncertain);
        assert_eq!(MatchType::Uncertain.and(MatchType::False), MatchType::False);
        assert_eq!(MatchType::True.and(MatchType::True), MatchType::True);
        assert_eq!(MatchType::Uncertain.not(), MatchType::Uncertain);
        assert_eq!(MatchType::False.not(), MatchType::True);
    }
}
