//! History DAG construction from parsimony trees.
//!
//! Input trees must share a root name and root sequence; leaf abundances are
//! stamped from a sequence-to-abundance map. Construction proceeds as:
//!
//! 1. add a zero-distance pseudo-leaf below each root, so the observed root
//!    genotype survives collapse and is representable as a leaf,
//! 2. disambiguate observed leaf sequences per tree (warning that the choice
//!    is arbitrary), deduplicating leaves that share a resolved sequence,
//! 3. union the trees into the DAG keyed on (sequence, abundance),
//! 4. expand internal-node ambiguities to all resolutions, unless the
//!    implicit resolution count exceeds the guard threshold, in which case
//!    each tree is disambiguated individually instead,
//! 5. add every edge compatible with the clade structure, trim to the
//!    minimum Hamming parsimony weight, collapse zero-length internal edges,
//!    and enforce the leaf-adjacency invariant,
//! 6. reject if more than one parsimony weight class remains.

use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};
use logging_timer::stime;
use primitive_types::U256;

use crate::sequence::{is_ambiguous, resolution_count, Disambiguate};
use crate::tree::RawTree;

use super::algebras::HammingParsimony;
use super::{merge_attrs, Clade, CladeEdges, DagError, DagNode, HistoryDag, Label, NodeAttr, NodeId};

/// Guard threshold for the implicit history-times-resolutions count. Above
/// it, per-tree disambiguation replaces full ambiguity expansion.
pub const AMBIGUITY_GUARD: u64 = 5_000_000;

type NodeKey = (Option<Label>, Vec<Clade>);

/// Build a history DAG from parsimony trees.
///
/// `abundances` maps observed sequences to abundances and is used only to
/// stamp root and leaf nodes; `resolver` supplies concrete resolutions for
/// ambiguous observed sequences.
#[stime("debug")]
pub fn build_dag(
    trees: &[RawTree],
    abundances: &HashMap<String, u32>,
    resolver: &dyn Disambiguate,
) -> Result<HistoryDag, DagError> {
    if trees.is_empty() {
        return Err(DagError::EmptyForest);
    }

    let root_name = trees[0].root().name.clone();
    let mut trees: Vec<RawTree> = trees.to_vec();
    for tree in &mut trees {
        stamp_abundances(tree, abundances);
        add_root_pseudo_leaf(tree);
    }

    if trees[0]
        .leaf_ids()
        .any(|id| is_ambiguous(&trees[0].node(id).sequence))
    {
        warn!(
            "some observed sequences are ambiguous; a disambiguation consistent with each input \
             tree will be chosen arbitrarily"
        );
        for tree in &mut trees {
            disambiguate_leaves(tree, &root_name, resolver);
        }
    }

    let mut dag = union_into_dag(&trees)?;

    // Ambiguity explosion guard: expanding every internal resolution can be
    // combinatorial, in which case each tree is resolved individually and
    // fewer parsimony trees may be found.
    let plain = dag.count_histories();
    let expanded = dag.count_histories_with(|id| match dag.label(id) {
        Some(label) => resolution_count(&label.sequence),
        None => U256::one(),
    });
    if expanded == U256::MAX || expanded / plain.max(U256::one()) > U256::from(AMBIGUITY_GUARD) {
        warn!(
            "parsimony trees have too many ambiguities for full expansion; disambiguating trees \
             individually"
        );
        for tree in &mut trees {
            disambiguate_all(tree, resolver);
        }
        dag = union_into_dag(&trees)?;
    }

    dag.explode_ambiguities();
    dag.add_all_allowed_edges();
    let parsimony = dag.trim_optimal_weight(&HammingParsimony, &u32::cmp)?;
    debug!("trimmed history DAG to parsimony weight {}", parsimony);

    for id in dag.node_ids() {
        if dag.is_ua(id) || dag.is_leaf(id) {
            continue;
        }
        if let Some(label) = dag.label(id) {
            if label.abundance != 0 {
                return Err(DagError::InternalAbundance {
                    name: dag
                        .attr(id)
                        .name
                        .clone()
                        .unwrap_or_else(|| super::UNNAMED_SEQ.to_string()),
                    abundance: label.abundance,
                });
            }
        }
    }

    dag.collapse_zero_length_edges();
    dag.enforce_leaf_adjacency();

    let weights = dag.hamming_parsimony_count()?;
    if weights.len() > 1 {
        let mut classes: Vec<u32> = weights.keys().copied().collect();
        classes.sort_unstable();
        return Err(DagError::MultipleParsimonyWeights {
            weights: format!("{:?}", classes),
        });
    }

    Ok(dag)
}

/// Stamp root and leaf abundances from the sequence map; internal nodes are
/// unobserved. Leaves with no original ids get their own name as one.
fn stamp_abundances(tree: &mut RawTree, abundances: &HashMap<String, u32>) {
    for id in tree.node_ids() {
        let is_observable = id == tree.root_id() || tree.is_leaf(id);
        let node = tree.node_mut(id);
        node.abundance = if is_observable {
            abundances.get(&node.sequence).copied().unwrap_or(0)
        } else {
            0
        };
    }
    for id in tree.leaf_ids().collect::<Vec<_>>() {
        let node = tree.node_mut(id);
        if node.original_ids.is_empty() {
            node.original_ids = [node.name.clone()].into_iter().collect();
        }
    }
}

/// The observed root genotype must be representable as a leaf in the DAG.
fn add_root_pseudo_leaf(tree: &mut RawTree) {
    let root = tree.root();
    let mut pseudo = crate::tree::RawNode::new(
        root.name.clone(),
        root.sequence.clone(),
        root.abundance,
    );
    pseudo.isotype = root.isotype.clone();
    pseudo.original_ids = if root.original_ids.is_empty() {
        [root.name.clone()].into_iter().collect()
    } else {
        root.original_ids.clone()
    };
    tree.add_child(0, pseudo);
}

/// Resolve every sequence of the tree in preorder.
fn disambiguate_all(tree: &mut RawTree, resolver: &dyn Disambiguate) {
    for id in tree.preorder() {
        let parent_seq = tree
            .parent(id)
            .map(|p| tree.node(p).sequence.clone());
        let resolved = resolver.resolve(parent_seq.as_deref(), &tree.node(id).sequence);
        tree.node_mut(id).sequence = resolved;
    }
}

/// Resolve leaf sequences only (internal ambiguity is expanded later), then
/// deduplicate leaves sharing a resolved sequence: the representative is the
/// root-named pseudo-leaf when present, abundances sum, original ids unite.
fn disambiguate_leaves(tree: &mut RawTree, root_name: &str, resolver: &dyn Disambiguate) {
    let mut resolved: Vec<Option<String>> = vec![None; tree.node_count()];
    for id in tree.preorder() {
        let parent_seq = tree
            .parent(id)
            .and_then(|p| resolved[p].clone());
        resolved[id] = Some(resolver.resolve(parent_seq.as_deref(), &tree.node(id).sequence));
    }
    for id in tree.leaf_ids().collect::<Vec<_>>() {
        tree.node_mut(id).sequence = resolved[id].clone().expect("preorder visits every node");
    }

    let mut by_sequence: HashMap<String, Vec<usize>> = HashMap::new();
    for id in tree.leaf_ids() {
        by_sequence
            .entry(tree.node(id).sequence.clone())
            .or_default()
            .push(id);
    }
    for (_, mut group) in by_sequence {
        if group.len() < 2 {
            continue;
        }
        let rep_position = group
            .iter()
            .position(|id| tree.node(*id).name == root_name)
            .unwrap_or(0);
        let rep = group.remove(rep_position);
        let mut total = tree.node(rep).abundance;
        let mut ids: BTreeSet<String> = tree.node(rep).original_ids.clone();
        for dup in &group {
            total += tree.node(*dup).abundance;
            ids.extend(tree.node(*dup).original_ids.iter().cloned());
            detach_leaf(tree, *dup);
        }
        let rep_node = tree.node_mut(rep);
        rep_node.abundance = total;
        rep_node.original_ids = ids;
    }

    remove_unifurcations(tree);
}

fn detach_leaf(tree: &mut RawTree, id: usize) {
    if let Some(parent) = tree.parent(id) {
        tree.nodes[parent].children.retain(|c| *c != id);
        tree.nodes[id].parent = None;
    }
}

/// Splice out non-root internal nodes left with a single child.
fn remove_unifurcations(tree: &mut RawTree) {
    for id in tree.postorder() {
        if id == tree.root_id() || tree.nodes[id].parent.is_none() {
            continue;
        }
        if tree.nodes[id].children.len() == 1 {
            let parent = tree.nodes[id].parent.expect("non-root node has a parent");
            let child = tree.nodes[id].children[0];
            tree.nodes[child].parent = Some(parent);
            let position = tree.nodes[parent]
                .children
                .iter()
                .position(|c| *c == id)
                .expect("child missing from parent's child list");
            tree.nodes[parent].children[position] = child;
            tree.nodes[id].children.clear();
            tree.nodes[id].parent = None;
        }
    }
}

/// Union the trees into a fresh DAG keyed on (label, clade partition).
fn union_into_dag(trees: &[RawTree]) -> Result<HistoryDag, DagError> {
    let mut dag = HistoryDag::new();
    let mut index: HashMap<NodeKey, NodeId> = HashMap::new();
    for tree in trees {
        let (root_id, root_clade) = insert_subtree(&mut dag, &mut index, tree, tree.root_id());
        if dag.nodes[dag.ua].clades.is_empty() {
            let ua = dag.ua;
            dag.nodes[ua].clades.push(CladeEdges {
                clade: root_clade,
                targets: vec![root_id],
            });
        } else {
            let ua = dag.ua;
            if dag.nodes[ua].clades[0].clade != root_clade {
                let diff: Vec<&Label> = dag.nodes[ua].clades[0]
                    .clade
                    .symmetric_difference(&root_clade)
                    .collect();
                return Err(DagError::LeafSetMismatch {
                    diff: format!("{:?}", diff),
                });
            }
            if !dag.nodes[ua].clades[0].targets.contains(&root_id) {
                dag.nodes[ua].clades[0].targets.push(root_id);
            }
        }
    }
    dag.canonicalize();
    Ok(dag)
}

fn insert_subtree(
    dag: &mut HistoryDag,
    index: &mut HashMap<NodeKey, NodeId>,
    tree: &RawTree,
    id: usize,
) -> (NodeId, Clade) {
    let node = tree.node(id);
    if tree.is_leaf(id) {
        let label = Label {
            sequence: node.sequence.clone(),
            abundance: node.abundance,
        };
        let clade: Clade = [label.clone()].into_iter().collect();
        let attr = NodeAttr {
            name: Some(node.name.clone()),
            original_ids: node.original_ids.clone(),
            isotype: node.isotype.clone(),
        };
        let dag_id = intern(dag, index, Some(label), Vec::new(), attr);
        return (dag_id, clade);
    }

    let mut clades: Vec<CladeEdges> = Vec::new();
    let mut union = Clade::new();
    for child in tree.children(id).to_vec() {
        let (child_id, child_clade) = insert_subtree(dag, index, tree, child);
        union.extend(child_clade.iter().cloned());
        clades.push(CladeEdges {
            clade: child_clade,
            targets: vec![child_id],
        });
    }
    clades.sort_by(|a, b| a.clade.cmp(&b.clade));
    let label = Label {
        sequence: node.sequence.clone(),
        abundance: 0,
    };
    let attr = NodeAttr {
        name: Some(node.name.clone()),
        original_ids: BTreeSet::new(),
        isotype: crate::isotype::IsotypeMap::new(),
    };
    let dag_id = intern(dag, index, Some(label), clades, attr);
    (dag_id, union)
}

fn intern(
    dag: &mut HistoryDag,
    index: &mut HashMap<NodeKey, NodeId>,
    label: Option<Label>,
    clades: Vec<CladeEdges>,
    attr: NodeAttr,
) -> NodeId {
    let key: NodeKey = (
        label.clone(),
        clades.iter().map(|ce| ce.clade.clone()).collect(),
    );
    match index.get(&key) {
        Some(&existing) => {
            for (ce_existing, ce_new) in dag.nodes[existing].clades.iter_mut().zip(clades) {
                for target in ce_new.targets {
                    if !ce_existing.targets.contains(&target) {
                        ce_existing.targets.push(target);
                    }
                }
            }
            merge_attrs(&mut dag.nodes[existing].attr, &attr);
            existing
        }
        None => {
            let new_id = dag.nodes.len();
            dag.nodes.push(DagNode {
                label,
                clades,
                attr,
                parents: Vec::new(),
            });
            index.insert(key, new_id);
            new_id
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::MinDistanceDisambiguator;
    use crate::tree::{CollapsedTree, RawNode};

    fn abundance_map(entries: &[(&str, u32)]) -> HashMap<String, u32> {
        entries
            .iter()
            .map(|(seq, a)| (seq.to_string(), *a))
            .collect()
    }

    fn two_leaf_tree(grouped: bool) -> RawTree {
        // Two arrangements of the same three observed genotypes.
        let mut tree = RawTree::new(RawNode::new("root", "AAAA", 0));
        if grouped {
            let inner = tree.add_child(0, RawNode::new("inner", "AATA", 0));
            tree.add_child(inner, RawNode::new("x", "AATT", 0));
            tree.add_child(inner, RawNode::new("y", "AATC", 0));
            tree.add_child(0, RawNode::new("z", "CAAA", 0));
        } else {
            let inner = tree.add_child(0, RawNode::new("inner", "AATC", 0));
            tree.add_child(inner, RawNode::new("x", "AATT", 0));
            tree.add_child(inner, RawNode::new("y", "AATC", 0));
            tree.add_child(0, RawNode::new("z", "CAAA", 0));
        }
        tree
    }

    fn abundances() -> HashMap<String, u32> {
        abundance_map(&[("AAAA", 2), ("AATT", 3), ("AATC", 1), ("CAAA", 1)])
    }

    #[test]
    fn union_of_trees_shares_leaves() {
        let trees = vec![two_leaf_tree(true), two_leaf_tree(false)];
        let dag = build_dag(&trees, &abundances(), &MinDistanceDisambiguator).unwrap();
        assert!(dag.count_histories() >= U256::one());
        // One leaf per observed genotype, including the root pseudo-leaf.
        assert_eq!(dag.leaf_ids().count(), 4);
    }

    #[test]
    fn all_histories_share_one_parsimony_weight() {
        let trees = vec![two_leaf_tree(true), two_leaf_tree(false)];
        let dag = build_dag(&trees, &abundances(), &MinDistanceDisambiguator).unwrap();
        let weights = dag.hamming_parsimony_count().unwrap();
        assert_eq!(weights.len(), 1);
    }

    #[test]
    fn sampled_history_collapses_with_observed_root() {
        use rand::rngs::SmallRng;
        use rand::SeedableRng;

        let trees = vec![two_leaf_tree(true)];
        let dag = build_dag(&trees, &abundances(), &MinDistanceDisambiguator).unwrap();
        let mut rng = SmallRng::seed_from_u64(3);
        let raw = dag.sample(&mut rng).unwrap();
        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        assert!(tree.root().name.contains("root"));
        assert_eq!(tree.root().abundance, 2, "root abundance survives via pseudo-leaf");
    }

    #[test]
    fn histories_enumerate_in_index_order() {
        let trees = vec![two_leaf_tree(true), two_leaf_tree(false)];
        let dag = build_dag(&trees, &abundances(), &MinDistanceDisambiguator).unwrap();
        let total = dag.count_histories();
        let listed = dag.histories().count();
        assert_eq!(U256::from(listed), total);
    }

    #[test]
    fn ambiguous_leaves_are_resolved_and_deduplicated() {
        let mut tree = RawTree::new(RawNode::new("root", "AAAA", 0));
        let inner = tree.add_child(0, RawNode::new("inner", "AATA", 0));
        tree.add_child(inner, RawNode::new("x", "AATT", 0));
        // Resolves to AATT as well, so the two leaves merge.
        tree.add_child(inner, RawNode::new("amb", "AATK", 0));
        tree.add_child(0, RawNode::new("z", "CAAA", 0));

        let map = abundance_map(&[("AAAA", 1), ("AATT", 2), ("AATK", 3), ("CAAA", 1)]);
        let dag = build_dag(&[tree], &map, &MinDistanceDisambiguator).unwrap();
        let merged_leaf = dag
            .leaf_ids()
            .find(|id| dag.label(*id).unwrap().sequence == "AATT")
            .expect("merged leaf present");
        assert_eq!(
            dag.label(merged_leaf).unwrap().abundance,
            5,
            "duplicate leaf abundances sum"
        );
        let attr = dag.attr(merged_leaf);
        assert!(attr.original_ids.contains("x") && attr.original_ids.contains("amb"));
    }

    #[test]
    fn internal_ambiguity_explodes_to_resolutions() {
        // Internal RA resolves to AA or GA; both resolutions reach the same
        // total parsimony weight (3), so both survive the trim.
        let mut tree = RawTree::new(RawNode::new("root", "AA", 0));
        let inner = tree.add_child(0, RawNode::new("inner", "RA", 0));
        tree.add_child(inner, RawNode::new("x", "GA", 0));
        tree.add_child(inner, RawNode::new("y", "CT", 0));

        let map = abundance_map(&[("AA", 1), ("GA", 1), ("CT", 1)]);
        let dag = build_dag(&[tree], &map, &MinDistanceDisambiguator).unwrap();
        assert!(
            dag.count_histories() >= U256::from(2u64),
            "expected both internal resolutions to survive, got {}",
            dag.count_histories()
        );
        assert_eq!(dag.hamming_parsimony_count().unwrap().len(), 1);
    }

    #[test]
    fn empty_forest_is_rejected() {
        assert!(matches!(
            build_dag(&[], &HashMap::new(), &MinDistanceDisambiguator),
            Err(DagError::EmptyForest)
        ));
    }

    #[test]
    fn mismatched_leaf_sets_are_rejected() {
        let mut a = RawTree::new(RawNode::new("root", "AAAA", 0));
        a.add_child(0, RawNode::new("x", "AATT", 0));
        let mut b = RawTree::new(RawNode::new("root", "AAAA", 0));
        b.add_child(0, RawNode::new("y", "CCTT", 0));

        let map = abundance_map(&[("AAAA", 1), ("AATT", 1), ("CCTT", 1)]);
        assert!(matches!(
            build_dag(&[a, b], &map, &MinDistanceDisambiguator),
            Err(DagError::LeafSetMismatch { .. })
        ));
    }
}
