//! Implicit DAG representation of a forest of trees.
//!
//! A *history DAG* stores many trees compactly: a node is identified by its
//! label (sequence plus leaf abundance) together with the partition of its
//! leaf set into child clades, and trees sharing subclades share nodes. A
//! *history* is a maximal subgraph that realizes each node's clade partition
//! with exactly one edge per clade; histories correspond one-to-one to the
//! candidate trees of the forest.
//!
//! The DAG supports history counting (in [U256], since counts grow
//! combinatorially), deterministic extraction by mixed-radix index, uniform
//! sampling, collapse of zero-length internal edges, and the weight-algebra
//! operations in [weight].
//!
//! A synthetic universal-ancestor node sits above the tree roots; it carries
//! no label and exactly one clade (the full leaf set), whose edges point at
//! the possible root nodes.

use std::collections::{BTreeSet, HashMap};

use log::debug;
use primitive_types::U256;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::isotype::merge_isotype_maps;
use crate::isotype::IsotypeMap;
use crate::likelihood::LikelihoodError;
use crate::tree::{RawNode, RawTree};

pub mod algebras;
pub mod builder;
pub mod weight;

pub type NodeId = usize;

/// Placeholder name for nodes whose identifier was lost to disambiguation or
/// merging; collapse renames every unobserved node, so this must never
/// survive into a finalized tree.
pub const UNNAMED_SEQ: &str = "unnamed_seq";

/// Node label: the sequence together with the observed (leaf) abundance.
/// Internal nodes carry abundance 0 until the leaf-adjacency pass copies a
/// same-sequence leaf label onto its parent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub sequence: String,
    pub abundance: u32,
}

/// A clade: the set of leaf labels below one child of a node.
pub type Clade = BTreeSet<Label>;

/// Non-identity annotations carried by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttr {
    pub name: Option<String>,
    pub original_ids: BTreeSet<String>,
    pub isotype: IsotypeMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CladeEdges {
    pub clade: Clade,
    pub targets: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DagNode {
    /// `None` only for the universal ancestor.
    pub label: Option<Label>,
    /// Empty for leaves.
    pub clades: Vec<CladeEdges>,
    pub attr: NodeAttr,
    pub parents: Vec<NodeId>,
}

/// The history DAG. All nodes are reachable from the universal ancestor;
/// mutating operations re-canonicalize so that equal (label, clade-partition)
/// keys refer to a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDag {
    pub(crate) nodes: Vec<DagNode>,
    pub(crate) ua: NodeId,
}

impl HistoryDag {
    pub(crate) fn new() -> Self {
        HistoryDag {
            nodes: vec![DagNode {
                label: None,
                clades: Vec::new(),
                attr: NodeAttr::default(),
                parents: Vec::new(),
            }],
            ua: 0,
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Accessors.

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> std::ops::Range<NodeId> {
        0..self.nodes.len()
    }

    pub fn ua(&self) -> NodeId {
        self.ua
    }

    pub fn is_ua(&self, id: NodeId) -> bool {
        id == self.ua
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].clades.is_empty() && id != self.ua
    }

    pub fn label(&self, id: NodeId) -> Option<&Label> {
        self.nodes[id].label.as_ref()
    }

    pub fn attr(&self, id: NodeId) -> &NodeAttr {
        &self.nodes[id].attr
    }

    pub fn attr_mut(&mut self, id: NodeId) -> &mut NodeAttr {
        &mut self.nodes[id].attr
    }

    /// Number of child clades of the node.
    pub fn clade_count(&self, id: NodeId) -> usize {
        self.nodes[id].clades.len()
    }

    /// True if one of the node's clades is exactly the singleton of its own
    /// label (the self-label clade that collapses with a leaf child).
    pub fn has_self_clade(&self, id: NodeId) -> bool {
        match &self.nodes[id].label {
            None => false,
            Some(label) => self.nodes[id]
                .clades
                .iter()
                .any(|ce| ce.clade.len() == 1 && ce.clade.contains(label)),
        }
    }

    /// True if both nodes carry a label with the same sequence.
    pub fn same_sequence(&self, a: NodeId, b: NodeId) -> bool {
        match (&self.nodes[a].label, &self.nodes[b].label) {
            (Some(la), Some(lb)) => la.sequence == lb.sequence,
            _ => false,
        }
    }

    /// The set of leaf labels below this node (the node's own label for a
    /// leaf).
    pub fn clade_union(&self, id: NodeId) -> Clade {
        if self.is_leaf(id) {
            let mut clade = Clade::new();
            if let Some(label) = &self.nodes[id].label {
                clade.insert(label.clone());
            }
            clade
        } else {
            let mut clade = Clade::new();
            for ce in &self.nodes[id].clades {
                clade.extend(ce.clade.iter().cloned());
            }
            clade
        }
    }

    pub fn leaf_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.node_ids().filter(|id| self.is_leaf(*id))
    }

    // ---------------------------------------------------------------------------------------------
    // Traversal.

    /// Node ids with every edge target before its source.
    pub(crate) fn postorder(&self) -> Vec<NodeId> {
        enum Visit {
            Enter(NodeId),
            Exit(NodeId),
        }
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![Visit::Enter(self.ua)];
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(id) => {
                    if visited[id] {
                        continue;
                    }
                    visited[id] = true;
                    stack.push(Visit::Exit(id));
                    for ce in &self.nodes[id].clades {
                        for target in &ce.targets {
                            if !visited[*target] {
                                stack.push(Visit::Enter(*target));
                            }
                        }
                    }
                }
                Visit::Exit(id) => order.push(id),
            }
        }
        order
    }

    pub(crate) fn recompute_parents(&mut self) {
        for node in &mut self.nodes {
            node.parents.clear();
        }
        for id in 0..self.nodes.len() {
            let targets: Vec<NodeId> = self.nodes[id]
                .clades
                .iter()
                .flat_map(|ce| ce.targets.iter().copied())
                .collect();
            for target in targets {
                if !self.nodes[target].parents.contains(&id) {
                    self.nodes[target].parents.push(id);
                }
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Canonicalization.

    /// Rebuild the arena bottom-up, deduplicating nodes by (label, clade
    /// partition), merging edge sets and attributes of duplicates, and
    /// dropping unreachable nodes.
    pub(crate) fn canonicalize(&mut self) {
        let order = self.postorder();
        let mut index: HashMap<(Option<Label>, Vec<Clade>), NodeId> = HashMap::new();
        let mut old_to_new: HashMap<NodeId, NodeId> = HashMap::new();
        let mut nodes: Vec<DagNode> = Vec::new();

        for old in order {
            let old_node = &self.nodes[old];
            let mut clades: Vec<CladeEdges> = old_node
                .clades
                .iter()
                .map(|ce| {
                    let mut targets: Vec<NodeId> =
                        ce.targets.iter().map(|t| old_to_new[t]).collect();
                    targets.sort_unstable();
                    targets.dedup();
                    CladeEdges {
                        clade: ce.clade.clone(),
                        targets,
                    }
                })
                .collect();
            clades.sort_by(|a, b| a.clade.cmp(&b.clade));
            let key = (
                old_node.label.clone(),
                clades.iter().map(|ce| ce.clade.clone()).collect::<Vec<_>>(),
            );
            match index.get(&key) {
                Some(&existing) => {
                    for (ce_existing, ce_new) in nodes[existing].clades.iter_mut().zip(clades) {
                        for target in ce_new.targets {
                            if !ce_existing.targets.contains(&target) {
                                ce_existing.targets.push(target);
                            }
                        }
                        ce_existing.targets.sort_unstable();
                    }
                    let attr = old_node.attr.clone();
                    merge_attrs(&mut nodes[existing].attr, &attr);
                    old_to_new.insert(old, existing);
                }
                None => {
                    let new_id = nodes.len();
                    nodes.push(DagNode {
                        label: old_node.label.clone(),
                        clades,
                        attr: old_node.attr.clone(),
                        parents: Vec::new(),
                    });
                    index.insert(key, new_id);
                    old_to_new.insert(old, new_id);
                }
            }
        }

        self.ua = old_to_new[&self.ua];
        self.nodes = nodes;
        self.recompute_parents();
    }

    // ---------------------------------------------------------------------------------------------
    // History counting.

    /// Number of histories (trees) in the DAG, saturating at [U256::MAX].
    pub fn count_histories(&self) -> U256 {
        self.count_histories_with(|_| U256::one())
    }

    /// History count with a per-node multiplier, e.g. the number of sequence
    /// resolutions of each node for the ambiguity-explosion guard.
    pub(crate) fn count_histories_with<F>(&self, multiplier: F) -> U256
    where
        F: Fn(NodeId) -> U256,
    {
        let counts = self.subtree_counts_with(&multiplier);
        counts[self.ua]
    }

    fn subtree_counts(&self) -> Vec<U256> {
        self.subtree_counts_with(&|_| U256::one())
    }

    fn subtree_counts_with<F>(&self, multiplier: &F) -> Vec<U256>
    where
        F: Fn(NodeId) -> U256,
    {
        let mut counts = vec![U256::zero(); self.nodes.len()];
        for id in self.postorder() {
            let own = if self.is_ua(id) {
                if self.nodes[id].clades.is_empty() {
                    // No trees were added.
                    continue;
                }
                U256::one()
            } else {
                multiplier(id)
            };
            let mut total = own;
            for ce in &self.nodes[id].clades {
                let clade_sum = ce
                    .targets
                    .iter()
                    .fold(U256::zero(), |acc, t| acc.saturating_add(counts[*t]));
                total = total.saturating_mul(clade_sum);
            }
            counts[id] = total;
        }
        counts
    }

    // ---------------------------------------------------------------------------------------------
    // History extraction.

    /// Uniformly sample one history as an input tree.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<RawTree, DagError> {
        let counts = self.subtree_counts();
        if counts[self.ua].is_zero() {
            return Err(DagError::EmptyForest);
        }
        let root = self.pick_weighted(rng, &self.nodes[self.ua].clades[0].targets, &counts);
        let mut raw = RawTree::new(self.raw_node(root));
        self.sample_children(rng, &counts, root, &mut raw, 0);
        Ok(raw)
    }

    fn pick_weighted<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        targets: &[NodeId],
        counts: &[U256],
    ) -> NodeId {
        let total = targets
            .iter()
            .fold(U256::zero(), |acc, t| acc.saturating_add(counts[*t]));
        let mut draw = random_below(rng, total);
        for target in targets {
            if draw < counts[*target] {
                return *target;
            }
            draw = draw - counts[*target];
        }
        *targets.last().expect("weighted pick over empty target list")
    }

    fn sample_children<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        counts: &[U256],
        node: NodeId,
        raw: &mut RawTree,
        raw_parent: usize,
    ) {
        for ce in &self.nodes[node].clades {
            let target = self.pick_weighted(rng, &ce.targets, counts);
            let child = raw.add_child(raw_parent, self.raw_node(target));
            self.sample_children(rng, counts, target, raw, child);
        }
    }

    /// Extract the history with the given mixed-radix index, in a fixed
    /// deterministic order. `None` when the index is out of range.
    pub fn history_by_index(&self, index: U256) -> Option<RawTree> {
        self.history_by_index_with(&self.subtree_counts(), index)
    }

    fn history_by_index_with(&self, counts: &[U256], index: U256) -> Option<RawTree> {
        if index >= counts[self.ua] {
            return None;
        }
        // The universal ancestor has one clade; decompose over its targets.
        let mut remainder = index;
        let targets = &self.nodes[self.ua].clades[0].targets;
        for target in targets {
            if remainder < counts[*target] {
                let mut raw = RawTree::new(self.raw_node(*target));
                self.extract_children(counts, *target, remainder, &mut raw, 0);
                return Some(raw);
            }
            remainder = remainder - counts[*target];
        }
        None
    }

    fn extract_children(
        &self,
        counts: &[U256],
        node: NodeId,
        index: U256,
        raw: &mut RawTree,
        raw_parent: usize,
    ) {
        // Little-endian mixed radix over the clades; within a clade the digit
        // decomposes over targets by cumulative subtree counts.
        let mut remainder = index;
        for ce in &self.nodes[node].clades {
            let radix = ce
                .targets
                .iter()
                .fold(U256::zero(), |acc, t| acc.saturating_add(counts[*t]));
            let mut digit = remainder % radix;
            remainder = remainder / radix;
            for target in &ce.targets {
                if digit < counts[*target] {
                    let child = raw.add_child(raw_parent, self.raw_node(*target));
                    self.extract_children(counts, *target, digit, raw, child);
                    break;
                }
                digit = digit - counts[*target];
            }
        }
    }

    /// Iterate over all histories in index order.
    pub fn histories(&self) -> Histories<'_> {
        let counts = self.subtree_counts();
        let total = counts[self.ua];
        Histories {
            dag: self,
            counts,
            next: U256::zero(),
            total,
        }
    }

    fn raw_node(&self, id: NodeId) -> RawNode {
        let node = &self.nodes[id];
        let label = node.label.as_ref().expect("history node without a label");
        let mut raw = RawNode::new(
            node.attr
                .name
                .clone()
                .unwrap_or_else(|| UNNAMED_SEQ.to_string()),
            label.sequence.clone(),
            if self.is_leaf(id) { label.abundance } else { 0 },
        );
        raw.isotype = node.attr.isotype.clone();
        raw.original_ids = node.attr.original_ids.clone();
        raw
    }

    // ---------------------------------------------------------------------------------------------
    // Structural passes.

    /// Contract zero-length internal edges: an edge between two internal
    /// nodes with the same label merges the child's clades into the parent.
    /// Applied deepest-first until no such edge remains.
    pub(crate) fn collapse_zero_length_edges(&mut self) {
        let mut passes = 0usize;
        loop {
            self.canonicalize();
            if !self.collapse_one_edge() {
                break;
            }
            passes += 1;
        }
        debug!("collapsed {} zero-length internal edges", passes);
    }

    fn collapse_one_edge(&mut self) -> bool {
        self.recompute_parents();
        for n in self.postorder() {
            if self.is_ua(n) || self.is_leaf(n) {
                continue;
            }
            let found = self.nodes[n].clades.iter().enumerate().find_map(|(ci, ce)| {
                ce.targets
                    .iter()
                    .find(|t| !self.is_leaf(**t) && self.nodes[**t].label == self.nodes[n].label)
                    .map(|t| (ci, *t))
            });
            let Some((ci, t)) = found else {
                continue;
            };

            // Build the merged node: n's clades with clade ci replaced by
            // t's clades. Deepest-first order guarantees t itself has no
            // same-label internal targets left.
            let mut clades: Vec<CladeEdges> = self.nodes[n]
                .clades
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != ci)
                .map(|(_, ce)| ce.clone())
                .collect();
            clades.extend(self.nodes[t].clades.iter().cloned());
            clades.sort_by(|a, b| a.clade.cmp(&b.clade));
            let mut attr = self.nodes[n].attr.clone();
            let t_attr = self.nodes[t].attr.clone();
            merge_attrs(&mut attr, &t_attr);
            let label = self.nodes[n].label.clone();

            let merged = self.nodes.len();
            self.nodes.push(DagNode {
                label,
                clades,
                attr,
                parents: Vec::new(),
            });

            // Every parent of n can reach the merged node instead.
            for p in self.nodes[n].parents.clone() {
                for ce in &mut self.nodes[p].clades {
                    if ce.targets.contains(&n) && !ce.targets.contains(&merged) {
                        ce.targets.push(merged);
                    }
                }
            }

            // Remove the collapsed edge; n survives only if the clade still
            // has other realizations.
            self.nodes[n].clades[ci].targets.retain(|x| *x != t);
            if self.nodes[n].clades[ci].targets.is_empty() {
                self.remove_node_cascade(n);
            }
            return true;
        }
        false
    }

    /// Detach a node from all parents; parents left with an unrealizable
    /// clade are removed in turn.
    fn remove_node_cascade(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            for p in self.nodes[node].parents.clone() {
                let mut emptied = false;
                for ce in &mut self.nodes[p].clades {
                    ce.targets.retain(|t| *t != node);
                    emptied |= ce.targets.is_empty();
                }
                if emptied && !self.is_ua(p) {
                    stack.push(p);
                }
            }
            self.nodes[node].parents.clear();
        }
    }

    /// Copy each leaf's label onto same-sequence parents, so that collapse
    /// semantics apply identically in the weight algebras (the parent then
    /// carries the observed abundance and a self-label clade).
    pub(crate) fn enforce_leaf_adjacency(&mut self) {
        self.recompute_parents();
        let mut changed = false;
        for leaf in self.leaf_ids().collect::<Vec<_>>() {
            let label = self.nodes[leaf]
                .label
                .clone()
                .expect("leaf node without a label");
            for p in self.nodes[leaf].parents.clone() {
                if self.is_ua(p) || self.is_leaf(p) {
                    continue;
                }
                let parent_label = self.nodes[p].label.as_ref();
                if parent_label.map(|pl| pl.sequence == label.sequence) == Some(true)
                    && parent_label != Some(&label)
                {
                    self.nodes[p].label = Some(label.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.canonicalize();
        }
    }

    /// Expand every ambiguous internal-node sequence to all of its concrete
    /// resolutions.
    pub(crate) fn explode_ambiguities(&mut self) {
        use crate::sequence;

        let mut variants: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in self.node_ids().collect::<Vec<_>>() {
            if self.is_ua(id) || self.is_leaf(id) {
                continue;
            }
            let Some(label) = self.nodes[id].label.clone() else {
                continue;
            };
            if !sequence::is_ambiguous(&label.sequence) {
                continue;
            }
            let mut ids = Vec::new();
            for resolved in sequence::resolutions(&label.sequence) {
                let variant = self.nodes.len();
                let mut node = self.nodes[id].clone();
                node.label = Some(Label {
                    sequence: resolved,
                    abundance: label.abundance,
                });
                node.parents.clear();
                self.nodes.push(node);
                ids.push(variant);
            }
            variants.insert(id, ids);
        }
        if variants.is_empty() {
            return;
        }
        for id in 0..self.nodes.len() {
            for ci in 0..self.nodes[id].clades.len() {
                let targets = std::mem::take(&mut self.nodes[id].clades[ci].targets);
                let mut expanded = Vec::with_capacity(targets.len());
                for t in targets {
                    match variants.get(&t) {
                        Some(ids) => expanded.extend(ids.iter().copied()),
                        None => expanded.push(t),
                    }
                }
                self.nodes[id].clades[ci].targets = expanded;
            }
        }
        self.canonicalize();
    }

    /// Add every edge compatible with the clade structure: node `c` becomes a
    /// target of clade `ce` of node `n` whenever `c`'s leaf set equals
    /// `ce`'s clade.
    pub(crate) fn add_all_allowed_edges(&mut self) {
        let mut by_union: HashMap<Clade, Vec<NodeId>> = HashMap::new();
        for id in self.node_ids() {
            if self.is_ua(id) {
                continue;
            }
            by_union.entry(self.clade_union(id)).or_default().push(id);
        }
        for id in 0..self.nodes.len() {
            for ci in 0..self.nodes[id].clades.len() {
                if let Some(candidates) = by_union.get(&self.nodes[id].clades[ci].clade) {
                    for candidate in candidates.clone() {
                        if candidate != id
                            && !self.nodes[id].clades[ci].targets.contains(&candidate)
                        {
                            self.nodes[id].clades[ci].targets.push(candidate);
                        }
                    }
                }
            }
        }
        self.canonicalize();
    }
}

/// Iterator over all histories of a DAG in index order.
pub struct Histories<'a> {
    dag: &'a HistoryDag,
    counts: Vec<U256>,
    next: U256,
    total: U256,
}

impl Iterator for Histories<'_> {
    type Item = RawTree;

    fn next(&mut self) -> Option<RawTree> {
        if self.next >= self.total {
            return None;
        }
        let tree = self.dag.history_by_index_with(&self.counts, self.next);
        self.next = self.next + U256::one();
        tree
    }
}

pub(crate) fn merge_attrs(into: &mut NodeAttr, from: &NodeAttr) {
    if into.name.is_none() {
        into.name = from.name.clone();
    }
    into.original_ids.extend(from.original_ids.iter().cloned());
    merge_isotype_maps(&mut into.isotype, &from.isotype);
}

/// Uniform draw below the (nonzero) bound.
fn random_below<R: Rng + ?Sized>(rng: &mut R, bound: U256) -> U256 {
    if bound <= U256::one() {
        return U256::zero();
    }
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    U256::from_big_endian(&bytes) % bound
}

// -------------------------------------------------------------------------------------------------
// Errors.

#[derive(Error, Debug)]
pub enum DagError {
    #[error("history DAG contains no histories")]
    EmptyForest,
    #[error("input trees do not share a leaf label set; offending tree differs by: {diff}")]
    LeafSetMismatch { diff: String },
    #[error("internal node {name:?} was found with nonzero abundance {abundance}")]
    InternalAbundance { name: String, abundance: u32 },
    #[error("parsimony search resulted in trees of unexpected weights: {weights}")]
    MultipleParsimonyWeights { weights: String },
    #[error(transparent)]
    Likelihood(#[from] LikelihoodError),
}
