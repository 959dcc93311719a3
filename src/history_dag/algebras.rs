//! The standard weight algebras: CM summary, branching-process
//! log-likelihood, allele count, and Hamming parsimony.
//!
//! All of them honor the leaf-adjacency collapse rule: a leaf hanging below a
//! same-sequence parent is the parent's own observed genotype, not an edge of
//! the collapsed tree, so it contributes nothing, and the parent's self-label
//! clade does not count as a mutant clade.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ordered_float::OrderedFloat;
use primitive_types::U256;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::likelihood::{LikelihoodError, LlKernel};
use crate::sequence::hamming_distance;

use super::weight::WeightAlgebra;
use super::{DagError, HistoryDag, NodeId};

/// Decimal places retained in the observable value of a [StableFloat].
const ROUND_DECIMALS: u32 = 8;

// -------------------------------------------------------------------------------------------------
// Order-stable float weight.

/// A float-valued weight backed by a decimal accumulator.
///
/// Decimal addition at fixed scale is exact, so sums do not depend on the
/// order in which the DAG is traversed; the observable value exposed for
/// comparison and hashing is the accumulator rounded to 8 decimal places, so
/// tied values compare equal regardless of summation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableFloat {
    state: Decimal,
    view: OrderedFloat<f64>,
}

impl StableFloat {
    pub fn zero() -> Self {
        StableFloat::from_state(Decimal::ZERO)
    }

    pub fn from_f64(value: f64) -> Self {
        StableFloat::from_state(Decimal::from_f64(value).unwrap_or(Decimal::MIN))
    }

    fn from_state(state: Decimal) -> Self {
        let view = state
            .round_dp(ROUND_DECIMALS)
            .to_f64()
            .unwrap_or(f64::NEG_INFINITY);
        StableFloat {
            state,
            view: OrderedFloat(view),
        }
    }

    /// The rounded observable value.
    pub fn value(&self) -> f64 {
        self.view.into_inner()
    }

    pub fn sum<I: IntoIterator<Item = StableFloat>>(values: I) -> Self {
        let state = values
            .into_iter()
            .fold(Decimal::ZERO, |acc, v| acc.saturating_add(v.state));
        StableFloat::from_state(state)
    }
}

impl PartialEq for StableFloat {
    fn eq(&self, other: &Self) -> bool {
        self.view == other.view
    }
}

impl Eq for StableFloat {}

impl PartialOrd for StableFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StableFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.view.cmp(&other.view)
    }
}

impl std::hash::Hash for StableFloat {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.view.hash(state);
    }
}

// -------------------------------------------------------------------------------------------------
// CM summary pieces shared by the CM and likelihood algebras.

/// The `(c, m)` contribution of an edge's child node, or `None` when the
/// child collapses into the parent (same-sequence leaf).
///
/// The root pseudocount applies here: an unobserved unifurcation `(0, 1)`
/// directly below the universal ancestor becomes `(1, 1)`. Only the
/// universal-ancestor edge qualifies — a `(0, 1)` node deeper in a history
/// is a genuine zero-likelihood event and is reported as such by the
/// likelihood algebra.
fn edge_cm(dag: &HistoryDag, parent: NodeId, child: NodeId) -> Option<(u32, u32)> {
    if dag.is_leaf(child) && dag.same_sequence(parent, child) {
        return None;
    }
    let mut m = dag.clade_count(child) as u32;
    if dag.has_self_clade(child) {
        m -= 1;
    }
    let c = dag.label(child).map_or(0, |label| label.abundance);
    if dag.is_ua(parent) && (c, m) == (0, 1) {
        return Some((1, 1));
    }
    Some((c, m))
}

// -------------------------------------------------------------------------------------------------
// CM-counter algebra.

/// Multiset of `(c, m)` pairs.
pub type CmMultiset = BTreeMap<(u32, u32), u32>;

/// Accumulates the CM summary of each history, with the root pseudocount
/// applied on the universal-ancestor edge — the same definition the
/// likelihood algebra and the collapse normalizer use.
pub struct CmCounter;

impl WeightAlgebra for CmCounter {
    type Weight = CmMultiset;

    fn start(&self, _dag: &HistoryDag, _node: NodeId) -> CmMultiset {
        CmMultiset::new()
    }

    fn edge_weight(
        &self,
        dag: &HistoryDag,
        parent: NodeId,
        child: NodeId,
    ) -> Result<CmMultiset, DagError> {
        Ok(match edge_cm(dag, parent, child) {
            None => CmMultiset::new(),
            Some(cm) => [(cm, 1)].into_iter().collect(),
        })
    }

    fn accum(&self, weights: Vec<CmMultiset>) -> CmMultiset {
        let mut union = CmMultiset::new();
        for weight in weights {
            for (cm, count) in weight {
                *union.entry(cm).or_insert(0) += count;
            }
        }
        union
    }
}

// -------------------------------------------------------------------------------------------------
// Log-likelihood algebra.

/// Branching-process log-likelihood of each history at fixed `(p, q)`.
///
/// The kernel cache sits behind a mutex so a single table serves the whole
/// DP; the monotone-fill discipline makes results independent of which call
/// grows it. The root pseudocount applies on the universal-ancestor edge.
pub struct LlGenotype {
    kernel: Mutex<LlKernel>,
}

impl LlGenotype {
    pub fn new(p: f64, q: f64) -> Result<Self, LikelihoodError> {
        Ok(LlGenotype {
            kernel: Mutex::new(LlKernel::new(p, q)?),
        })
    }
}

impl WeightAlgebra for LlGenotype {
    type Weight = StableFloat;

    fn start(&self, _dag: &HistoryDag, _node: NodeId) -> StableFloat {
        StableFloat::zero()
    }

    fn edge_weight(
        &self,
        dag: &HistoryDag,
        parent: NodeId,
        child: NodeId,
    ) -> Result<StableFloat, DagError> {
        let Some((c, m)) = edge_cm(dag, parent, child) else {
            return Ok(StableFloat::zero());
        };
        let (ll, _) = self
            .kernel
            .lock()
            .expect("likelihood kernel mutex poisoned")
            .ll_genotype(c, m)?;
        Ok(StableFloat::from_f64(ll))
    }

    fn accum(&self, weights: Vec<StableFloat>) -> StableFloat {
        StableFloat::sum(weights)
    }
}

// -------------------------------------------------------------------------------------------------
// Allele count algebra.

/// Number of alleles of a history: one per edge whose endpoint labels differ,
/// which counts the unique sequences of the tree.
pub struct AlleleCount;

impl WeightAlgebra for AlleleCount {
    type Weight = u32;

    fn start(&self, _dag: &HistoryDag, _node: NodeId) -> u32 {
        0
    }

    fn edge_weight(&self, dag: &HistoryDag, parent: NodeId, child: NodeId) -> Result<u32, DagError> {
        Ok(u32::from(dag.label(parent) != dag.label(child)))
    }

    fn accum(&self, weights: Vec<u32>) -> u32 {
        weights.into_iter().sum()
    }
}

// -------------------------------------------------------------------------------------------------
// Hamming parsimony algebra.

/// Total Hamming distance along the edges of a history.
pub struct HammingParsimony;

impl WeightAlgebra for HammingParsimony {
    type Weight = u32;

    fn start(&self, _dag: &HistoryDag, _node: NodeId) -> u32 {
        0
    }

    fn edge_weight(&self, dag: &HistoryDag, parent: NodeId, child: NodeId) -> Result<u32, DagError> {
        Ok(match (dag.label(parent), dag.label(child)) {
            (Some(a), Some(b)) => hamming_distance(&a.sequence, &b.sequence),
            _ => 0,
        })
    }

    fn accum(&self, weights: Vec<u32>) -> u32 {
        weights.into_iter().sum()
    }
}

impl HistoryDag {
    /// The multiset of Hamming parsimony weights over all histories.
    pub fn hamming_parsimony_count(
        &self,
    ) -> Result<std::collections::HashMap<u32, U256>, DagError> {
        self.weight_count(&HammingParsimony)
    }
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_float_rounding_makes_ties_compare_equal() {
        // Two different summation orders of values that differ only past the
        // rounding precision.
        let parts = [-1.000000001, -2.000000002, -3.1];
        let forward = StableFloat::sum(parts.iter().map(|v| StableFloat::from_f64(*v)));
        let backward = StableFloat::sum(parts.iter().rev().map(|v| StableFloat::from_f64(*v)));
        assert_eq!(forward, backward);
        assert_eq!(forward.cmp(&backward), std::cmp::Ordering::Equal);
    }

    #[test]
    fn stable_float_view_is_rounded() {
        let value = StableFloat::from_f64(-1.23456789012345);
        assert_eq!(value.value(), -1.23456789);
    }

    #[test]
    fn stable_float_orders_by_value() {
        let a = StableFloat::from_f64(-2.0);
        let b = StableFloat::from_f64(-1.0);
        assert!(a < b);
    }
}
