//! Weight algebras over the history DAG.
//!
//! A weight algebra is the triple (`start`, `edge_weight`, `accum`): a base
//! weight per node, a weight per edge, and an associative, commutative
//! aggregation over a list of weights. The weight of a history is the
//! aggregate of its node starts and edge weights; consumers stay ignorant of
//! which metric is being computed.
//!
//! Three DAG operations consume an algebra:
//! - [HistoryDag::weight_count]: the multiset of weights over all histories,
//! - [HistoryDag::optimal_weight_annotate]: the optimal weight under a
//!   comparator,
//! - [HistoryDag::trim_optimal_weight]: subset the DAG to exactly the
//!   histories achieving the optimum.
//!
//! Algebras compose by tuple; the aggregation and optimum then operate
//! componentwise (or on any score of the tuple).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use primitive_types::U256;

use super::{DagError, HistoryDag, NodeId};

pub trait WeightAlgebra {
    type Weight: Clone + Eq + Hash;

    /// Base weight contributed by a node itself (usually an identity).
    fn start(&self, dag: &HistoryDag, node: NodeId) -> Self::Weight;

    /// Weight contributed by the edge from `parent` to `child`.
    fn edge_weight(
        &self,
        dag: &HistoryDag,
        parent: NodeId,
        child: NodeId,
    ) -> Result<Self::Weight, DagError>;

    /// Aggregate a list of weights. Must be associative and commutative with
    /// `start` values acting as identities.
    fn accum(&self, weights: Vec<Self::Weight>) -> Self::Weight;
}

impl HistoryDag {
    /// The multiset of history weights: weight value to number of histories.
    pub fn weight_count<A: WeightAlgebra>(
        &self,
        algebra: &A,
    ) -> Result<HashMap<A::Weight, U256>, DagError> {
        let mut maps: Vec<HashMap<A::Weight, U256>> = vec![HashMap::new(); self.nodes.len()];
        for id in self.postorder() {
            let mut acc: HashMap<A::Weight, U256> = HashMap::new();
            acc.insert(algebra.start(self, id), U256::one());
            for ce in &self.nodes[id].clades {
                let mut clade_map: HashMap<A::Weight, U256> = HashMap::new();
                for target in &ce.targets {
                    let edge = algebra.edge_weight(self, id, *target)?;
                    for (weight, count) in &maps[*target] {
                        let combined = algebra.accum(vec![edge.clone(), weight.clone()]);
                        let entry = clade_map.entry(combined).or_insert_with(U256::zero);
                        *entry = entry.saturating_add(*count);
                    }
                }
                let mut next = HashMap::new();
                for (a, ca) in &acc {
                    for (b, cb) in &clade_map {
                        let combined = algebra.accum(vec![a.clone(), b.clone()]);
                        let entry = next.entry(combined).or_insert_with(U256::zero);
                        *entry = entry.saturating_add(ca.saturating_mul(*cb));
                    }
                }
                acc = next;
            }
            maps[id] = acc;
        }
        Ok(maps[self.ua].clone())
    }

    /// The optimal history weight under the comparator (minimized).
    pub fn optimal_weight_annotate<A, C>(
        &self,
        algebra: &A,
        cmp: &C,
    ) -> Result<A::Weight, DagError>
    where
        A: WeightAlgebra,
        C: Fn(&A::Weight, &A::Weight) -> Ordering,
    {
        let downs = self.optimal_downs(algebra, cmp)?;
        downs[self.ua].clone().ok_or(DagError::EmptyForest)
    }

    /// Subset the DAG to exactly those histories achieving the optimal
    /// weight, and return that weight.
    pub fn trim_optimal_weight<A, C>(&mut self, algebra: &A, cmp: &C) -> Result<A::Weight, DagError>
    where
        A: WeightAlgebra,
        C: Fn(&A::Weight, &A::Weight) -> Ordering,
    {
        let downs = self.optimal_downs(algebra, cmp)?;
        let optimum = downs[self.ua].clone().ok_or(DagError::EmptyForest)?;

        for id in self.postorder() {
            if downs[id].is_none() {
                continue;
            }
            for ci in 0..self.nodes[id].clades.len() {
                let targets = self.nodes[id].clades[ci].targets.clone();
                let mut weighted: Vec<(NodeId, A::Weight)> = Vec::with_capacity(targets.len());
                for target in targets {
                    if let Some(sub) = &downs[target] {
                        let edge = algebra.edge_weight(self, id, target)?;
                        weighted.push((target, algebra.accum(vec![edge, sub.clone()])));
                    }
                }
                let best = weighted
                    .iter()
                    .map(|(_, w)| w.clone())
                    .min_by(|a, b| cmp(a, b))
                    .expect("clade with no realizable target");
                self.nodes[id].clades[ci].targets = weighted
                    .into_iter()
                    .filter(|(_, w)| cmp(w, &best) == Ordering::Equal)
                    .map(|(t, _)| t)
                    .collect();
            }
        }
        self.canonicalize();
        Ok(optimum)
    }

    /// Per-node optimal sub-history weights, children before parents.
    fn optimal_downs<A, C>(
        &self,
        algebra: &A,
        cmp: &C,
    ) -> Result<Vec<Option<A::Weight>>, DagError>
    where
        A: WeightAlgebra,
        C: Fn(&A::Weight, &A::Weight) -> Ordering,
    {
        let mut downs: Vec<Option<A::Weight>> = vec![None; self.nodes.len()];
        for id in self.postorder() {
            let mut parts = vec![algebra.start(self, id)];
            let mut realizable = true;
            for ce in &self.nodes[id].clades {
                let mut best: Option<A::Weight> = None;
                for target in &ce.targets {
                    if let Some(sub) = &downs[*target] {
                        let edge = algebra.edge_weight(self, id, *target)?;
                        let weight = algebra.accum(vec![edge, sub.clone()]);
                        best = match best {
                            None => Some(weight),
                            Some(current) => {
                                if cmp(&weight, &current) == Ordering::Less {
                                    Some(weight)
                                } else {
                                    Some(current)
                                }
                            }
                        };
                    }
                }
                match best {
                    Some(weight) => parts.push(weight),
                    None => {
                        realizable = false;
                        break;
                    }
                }
            }
            if realizable {
                downs[id] = Some(algebra.accum(parts));
            }
        }
        Ok(downs)
    }
}

// -------------------------------------------------------------------------------------------------
// Product composition.

impl<A: WeightAlgebra, B: WeightAlgebra> WeightAlgebra for (A, B) {
    type Weight = (A::Weight, B::Weight);

    fn start(&self, dag: &HistoryDag, node: NodeId) -> Self::Weight {
        (self.0.start(dag, node), self.1.start(dag, node))
    }

    fn edge_weight(
        &self,
        dag: &HistoryDag,
        parent: NodeId,
        child: NodeId,
    ) -> Result<Self::Weight, DagError> {
        Ok((
            self.0.edge_weight(dag, parent, child)?,
            self.1.edge_weight(dag, parent, child)?,
        ))
    }

    fn accum(&self, weights: Vec<Self::Weight>) -> Self::Weight {
        let (lefts, rights): (Vec<_>, Vec<_>) = weights.into_iter().unzip();
        (self.0.accum(lefts), self.1.accum(rights))
    }
}

impl<A, B, C, D> WeightAlgebra for (A, B, C, D)
where
    A: WeightAlgebra,
    B: WeightAlgebra,
    C: WeightAlgebra,
    D: WeightAlgebra,
{
    type Weight = (A::Weight, B::Weight, C::Weight, D::Weight);

    fn start(&self, dag: &HistoryDag, node: NodeId) -> Self::Weight {
        (
            self.0.start(dag, node),
            self.1.start(dag, node),
            self.2.start(dag, node),
            self.3.start(dag, node),
        )
    }

    fn edge_weight(
        &self,
        dag: &HistoryDag,
        parent: NodeId,
        child: NodeId,
    ) -> Result<Self::Weight, DagError> {
        Ok((
            self.0.edge_weight(dag, parent, child)?,
            self.1.edge_weight(dag, parent, child)?,
            self.2.edge_weight(dag, parent, child)?,
            self.3.edge_weight(dag, parent, child)?,
        ))
    }

    fn accum(&self, weights: Vec<Self::Weight>) -> Self::Weight {
        let mut ws = Vec::with_capacity(weights.len());
        let mut xs = Vec::with_capacity(weights.len());
        let mut ys = Vec::with_capacity(weights.len());
        let mut zs = Vec::with_capacity(weights.len());
        for (w, x, y, z) in weights {
            ws.push(w);
            xs.push(x);
            ys.push(y);
            zs.push(z);
        }
        (
            self.0.accum(ws),
            self.1.accum(xs),
            self.2.accum(ys),
            self.3.accum(zs),
        )
    }
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::super::{CladeEdges, DagNode, HistoryDag, Label, NodeAttr};
    use super::*;
    use std::collections::BTreeSet;

    /// Edge counter: weight 1 per edge below the universal ancestor.
    struct EdgeCount;

    impl WeightAlgebra for EdgeCount {
        type Weight = u32;

        fn start(&self, _dag: &HistoryDag, _node: NodeId) -> u32 {
            0
        }

        fn edge_weight(
            &self,
            dag: &HistoryDag,
            parent: NodeId,
            _child: NodeId,
        ) -> Result<u32, DagError> {
            Ok(u32::from(!dag.is_ua(parent)))
        }

        fn accum(&self, weights: Vec<u32>) -> u32 {
            weights.into_iter().sum()
        }
    }

    fn label(seq: &str, abundance: u32) -> Label {
        Label {
            sequence: seq.to_string(),
            abundance,
        }
    }

    fn clade(labels: &[&Label]) -> BTreeSet<Label> {
        labels.iter().map(|l| (*l).clone()).collect()
    }

    /// Two histories: a root with either a cherry over (x, y) or the two
    /// leaves directly under a different internal arrangement.
    fn two_history_dag() -> HistoryDag {
        let x = label("AATA", 1);
        let y = label("AACA", 1);
        let nodes = vec![
            // 0: universal ancestor
            DagNode {
                label: None,
                clades: vec![CladeEdges {
                    clade: clade(&[&x, &y]),
                    targets: vec![3, 4],
                }],
                attr: NodeAttr::default(),
                parents: vec![],
            },
            // 1, 2: leaves
            DagNode {
                label: Some(x.clone()),
                clades: vec![],
                attr: NodeAttr::default(),
                parents: vec![],
            },
            DagNode {
                label: Some(y.clone()),
                clades: vec![],
                attr: NodeAttr::default(),
                parents: vec![],
            },
            // 3: root variant with both leaves as separate clades
            DagNode {
                label: Some(label("AAAA", 0)),
                clades: vec![
                    CladeEdges {
                        clade: clade(&[&x]),
                        targets: vec![1],
                    },
                    CladeEdges {
                        clade: clade(&[&y]),
                        targets: vec![2],
                    },
                ],
                attr: NodeAttr::default(),
                parents: vec![],
            },
            // 4: root variant with a cherry node in between
            DagNode {
                label: Some(label("AAAA", 0)),
                clades: vec![CladeEdges {
                    clade: clade(&[&x, &y]),
                    targets: vec![5],
                }],
                attr: NodeAttr::default(),
                parents: vec![],
            },
            // 5: cherry
            DagNode {
                label: Some(label("AATT", 0)),
                clades: vec![
                    CladeEdges {
                        clade: clade(&[&x]),
                        targets: vec![1],
                    },
                    CladeEdges {
                        clade: clade(&[&y]),
                        targets: vec![2],
                    },
                ],
                attr: NodeAttr::default(),
                parents: vec![],
            },
        ];
        let mut dag = HistoryDag { nodes, ua: 0 };
        dag.recompute_parents();
        dag
    }

    #[test]
    fn weight_count_enumerates_both_histories() {
        let dag = two_history_dag();
        assert_eq!(dag.count_histories(), 2.into());
        let counts = dag.weight_count(&EdgeCount).unwrap();
        // One history has 2 edges, the other 3.
        assert_eq!(counts[&2], U256::one());
        assert_eq!(counts[&3], U256::one());
    }

    #[test]
    fn optimal_weight_is_comparator_minimum() {
        let dag = two_history_dag();
        let best = dag.optimal_weight_annotate(&EdgeCount, &u32::cmp).unwrap();
        assert_eq!(best, 2);
        let worst = dag
            .optimal_weight_annotate(&EdgeCount, &|a: &u32, b: &u32| b.cmp(a))
            .unwrap();
        assert_eq!(worst, 3);
    }

    #[test]
    fn trim_keeps_exactly_the_optimal_class() {
        let mut dag = two_history_dag();
        let best = dag.trim_optimal_weight(&EdgeCount, &u32::cmp).unwrap();
        assert_eq!(best, 2);
        assert_eq!(dag.count_histories(), U256::one());
        let counts = dag.weight_count(&EdgeCount).unwrap();
        assert_eq!(counts.len(), 1, "exactly one weight class after trimming");
        assert!(counts.contains_key(&2));
    }

    #[test]
    fn tuple_algebras_operate_componentwise() {
        let dag = two_history_dag();
        let pair = (EdgeCount, EdgeCount);
        let counts = dag.weight_count(&pair).unwrap();
        assert_eq!(counts[&(2, 2)], U256::one());
        assert_eq!(counts[&(3, 3)], U256::one());
    }
}
