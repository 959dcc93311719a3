//! Bootstrap support for collapsed-tree nodes.
//!
//! Every non-root node induces a bipartition of the observed taxa: the
//! observed names inside its subtree against the rest. Support counts how
//! many bootstrap trees exhibit the identical bipartition; in compatibility
//! mode it instead counts the trees that do not exhibit a contradicting one.
//! Bipartitions compare equal as unordered pairs of sets.

use std::collections::BTreeSet;

use super::{CollapsedTree, CompareError};

/// An unordered bipartition of observed taxon names, stored with the
/// lexicographically smaller side first.
pub(crate) type Split = (BTreeSet<String>, BTreeSet<String>);

impl CollapsedTree {
    /// The bipartition induced by clipping the edge above `id`.
    fn observed_split(&self, id: usize) -> Split {
        let inside_ids: BTreeSet<usize> = self.subtree_ids(id).into_iter().collect();
        let mut inside = BTreeSet::new();
        let mut outside = BTreeSet::new();
        for observed in self.observed_ids() {
            let names = self.node(observed).name.names();
            if inside_ids.contains(&observed) {
                inside.extend(names);
            } else {
                outside.extend(names);
            }
        }
        if inside <= outside {
            (inside, outside)
        } else {
            (outside, inside)
        }
    }

    fn splits_compatible(a: &Split, b: &Split) -> Result<bool, CompareError> {
        let cover_a: BTreeSet<&String> = a.0.union(&a.1).collect();
        let cover_b: BTreeSet<&String> = b.0.union(&b.1).collect();
        if cover_a != cover_b {
            let diff: Vec<&&String> = cover_a.symmetric_difference(&cover_b).collect();
            return Err(CompareError::SplitCoverMismatch {
                diff: format!("{:?}", diff),
            });
        }
        for side_a in [&a.0, &a.1] {
            for side_b in [&b.0, &b.1] {
                if side_a.is_disjoint(side_b) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Compute per-node support from bootstrap trees and store it on the
    /// `support` field of every non-root node.
    ///
    /// `weights` weighs each bootstrap tree (e.g. to spread weight across
    /// parsimony-degenerate trees); `compatibility` switches from identical-
    /// split counting to non-contradicting-split counting.
    pub fn add_support(
        &mut self,
        bootstrap_trees: &[CollapsedTree],
        weights: Option<&[f64]>,
        compatibility: bool,
    ) -> Result<(), CompareError> {
        let boot_splits: Vec<Vec<Split>> = bootstrap_trees
            .iter()
            .map(|tree| {
                tree.node_ids()
                    .skip(1)
                    .map(|id| tree.observed_split(id))
                    .collect()
            })
            .collect();

        for id in self.node_ids().skip(1) {
            let split = self.observed_split(id);
            let mut support = 0.0;
            let mut compatible_weight = 0.0;
            for (i, splits) in boot_splits.iter().enumerate() {
                let weight = weights.map_or(1.0, |w| w[i]);
                let mut compatible = true;
                let mut supported = false;
                for boot_split in splits {
                    if compatibility
                        && compatible
                        && !Self::splits_compatible(&split, boot_split)?
                    {
                        compatible = false;
                    }
                    if !compatibility && !supported && *boot_split == split {
                        supported = true;
                    }
                }
                if supported {
                    support += weight;
                }
                if compatible {
                    compatible_weight += weight;
                }
            }
            self.node_mut(id).support = Some(if compatibility {
                compatible_weight
            } else {
                support
            });
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use crate::tree::{CollapsedTree, RawNode, RawTree};

    fn caterpillar(group_ab: bool) -> CollapsedTree {
        // Root with one internal node grouping either {a, b} or {a, c}.
        let mut raw = RawTree::new(RawNode::new("root", "AAAA", 1));
        let inner = raw.add_child(0, RawNode::new("inner", "AATT", 0));
        if group_ab {
            raw.add_child(inner, RawNode::new("a", "AATC", 1));
            raw.add_child(inner, RawNode::new("b", "AATG", 1));
            raw.add_child(0, RawNode::new("c", "CAAA", 1));
        } else {
            raw.add_child(inner, RawNode::new("a", "AATC", 1));
            raw.add_child(inner, RawNode::new("c", "CAAA", 1));
            raw.add_child(0, RawNode::new("b", "AATG", 1));
        }
        CollapsedTree::from_raw(&raw, false).unwrap()
    }

    #[test]
    fn identical_trees_fully_support_each_other() {
        let mut tree = caterpillar(true);
        let boots = vec![caterpillar(true), caterpillar(true)];
        tree.add_support(&boots, None, false).unwrap();
        for id in tree.node_ids().skip(1) {
            assert_eq!(tree.node(id).support, Some(2.0));
        }
    }

    #[test]
    fn conflicting_grouping_reduces_support() {
        let mut tree = caterpillar(true);
        let boots = vec![caterpillar(true), caterpillar(false)];
        tree.add_support(&boots, None, false).unwrap();
        // The {a, b} grouping is present in exactly one bootstrap tree.
        let grouped = tree
            .node_ids()
            .find(|id| {
                let node = tree.node(*id);
                node.abundance == 0 && !node.children.is_empty()
            })
            .unwrap();
        assert_eq!(tree.node(grouped).support, Some(1.0));
    }

    #[test]
    fn weights_scale_support() {
        let mut tree = caterpillar(true);
        let boots = vec![caterpillar(true), caterpillar(true)];
        tree.add_support(&boots, Some(&[0.25, 0.5]), false).unwrap();
        for id in tree.node_ids().skip(1) {
            assert_eq!(tree.node(id).support, Some(0.75));
        }
    }
}
