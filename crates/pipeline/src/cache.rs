//! Output bucket accumulation for one flow group.

use pip_core::sources::*;
use pip_core::{Action, CompositeAggregationBucket, CompositeAggregationKey, CompositeAggregationSourceValue as V, EndpointResponse, Reporter, Response};

/// Output buckets for one pass (before or after) of the current group.
///
/// Buckets are found by a linear scan on (reporter, action, source action). A group has
/// at most 2 reporters x 5 actions x 5 source actions = 50 distinct buckets, and in
/// practice a handful.
#[derive(Debug, Default)]
pub(crate) struct OutputCache {
    buckets: Vec<CompositeAggregationBucket>,
}

fn output_key(identity: &CompositeAggregationKey, reporter: Reporter, action: Action, source_action: Action, impacted: bool) -> CompositeAggregationKey {
    let mut key = identity.clone();
    key.0.push(V::new("reporter", reporter.as_str()));
    key.0.push(V::new("action", action.as_str()));
    key.0.push(V::new("source_action", source_action.as_str()));
    key.0.push(V::new("flow_impacted", impacted));
    key
}

impl OutputCache {
    pub(crate) fn is_empty(&self) -> bool { self.buckets.is_empty() }

    /// The bucket for (reporter, action, source action), created with a zero doc count
    /// when missing.
    fn find_or_create(
        &mut self,
        identity: &CompositeAggregationKey,
        reporter: Reporter,
        action: Action,
        source_action: Action,
        impacted: bool,
    ) -> &mut CompositeAggregationBucket {
        let pos = self.buckets.iter().position(|b| {
            b.key.str_at(OUT_IDX_REPORTER) == reporter.as_str()
                && b.key.str_at(OUT_IDX_ACTION) == action.as_str()
                && b.key.str_at(OUT_IDX_SOURCE_ACTION) == source_action.as_str()
        });
        let idx = match pos {
            Some(i) => i,
            None => {
                self.buckets.push(CompositeAggregationBucket::with_key(
                    output_key(identity, reporter, action, source_action, impacted),
                    0,
                ));
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[idx]
    }

    /// Merge `raw` into the buckets of every included side of `resp`. Each merge works
    /// on its own copy of the raw terms, with the policy terms replaced when the side
    /// carries recalculated policies.
    pub(crate) fn aggregate(&mut self, identity: &CompositeAggregationKey, raw: &CompositeAggregationBucket, resp: &Response, impacted: bool) {
        let sides: [(Reporter, &EndpointResponse); 2] = [(Reporter::Source, &resp.source), (Reporter::Destination, &resp.destination)];
        for (reporter, side) in sides {
            if !side.include { continue; }
            let out = self.find_or_create(identity, reporter, side.action, resp.source.action, impacted);
            match &side.policies {
                Some(policies) => {
                    let mut contribution = raw.clone();
                    contribution.set_aggregated_terms_from_strings(TERMS_POLICIES, policies);
                    out.aggregate(&contribution);
                }
                None => out.aggregate(raw),
            }
        }
    }

    pub(crate) fn mark_impacted(&mut self) {
        for b in &mut self.buckets {
            b.key.set(OUT_IDX_IMPACTED, V::new("flow_impacted", true));
        }
    }

    /// Drain the buckets sorted by (reporter, action, source action).
    pub(crate) fn take_sorted(&mut self) -> Vec<CompositeAggregationBucket> {
        let mut out = std::mem::take(&mut self.buckets);
        out.sort_by(|a, b| {
            let k = |x: &CompositeAggregationBucket| {
                (x.key.str_at(OUT_IDX_REPORTER).to_string(), x.key.str_at(OUT_IDX_ACTION).to_string(), x.key.str_at(OUT_IDX_SOURCE_ACTION).to_string())
            };
            k(a).cmp(&k(b))
        });
        out
    }
}
