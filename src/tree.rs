//! Collapsed genotype trees.
//!
//! The input to the core is a tree whose nodes carry a sequence, an observed
//! abundance, and a name ([RawTree]). A [CollapsedTree] is the canonical form
//! of such a tree after contracting every zero-length edge: zero-length
//! descendants represent the same genotype as their parent, so abundances
//! merge by `max`, isotype observations merge key-wise by `max`, and names
//! unite into a set when both sides are observed genotypes. The collapse
//! preserves the set of observed genotypes and, unless explicitly permitted,
//! rejects trees in which two distinct nodes share a sequence with positive
//! abundance.
//!
//! A collapsed tree is canonically ladderized: children are ordered by
//! ascending *partition* (the total abundance in the subtree) with sequence
//! as tie-break, and unobserved nodes get deterministic deduplicated names.
//! The multiset of `(c, m)` pairs over the nodes (the CM summary) is the
//! sufficient statistic consumed by the likelihood kernel.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::isotype::{inferred_isotype, merge_isotype_maps, Isotype, IsotypeMap};
use crate::likelihood::{self, CmCounts, Gradient, LikelihoodError, LlKernel};
use crate::sequence::hamming_distance;

mod local_branching;
mod simulation;
mod support;

pub use simulation::{simulate, simulate_genotype};

// -------------------------------------------------------------------------------------------------
// Input entity.

/// A node of an uncollapsed input tree.
///
/// This is the boundary type of the crate: file decoders (out of scope here)
/// produce these, as does history extraction from the DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNode {
    pub name: String,
    pub sequence: String,
    pub abundance: u32,
    pub isotype: IsotypeMap,
    pub original_ids: BTreeSet<String>,
    pub(crate) children: Vec<usize>,
    pub(crate) parent: Option<usize>,
}

impl RawNode {
    pub fn new(name: impl Into<String>, sequence: impl Into<String>, abundance: u32) -> Self {
        RawNode {
            name: name.into(),
            sequence: sequence.into(),
            abundance,
            isotype: IsotypeMap::new(),
            original_ids: BTreeSet::new(),
            children: Vec::new(),
            parent: None,
        }
    }
}

/// An arena-allocated input tree; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTree {
    pub(crate) nodes: Vec<RawNode>,
}

impl RawTree {
    pub fn new(mut root: RawNode) -> Self {
        root.parent = None;
        RawTree { nodes: vec![root] }
    }

    /// Attach `child` below `parent`, returning the new node's id.
    pub fn add_child(&mut self, parent: usize, mut child: RawNode) -> usize {
        let id = self.nodes.len();
        child.parent = Some(parent);
        self.nodes.push(child);
        self.nodes[parent].children.push(id);
        id
    }

    pub fn root_id(&self) -> usize {
        0
    }

    pub fn root(&self) -> &RawNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: usize) -> &RawNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: usize) -> &mut RawNode {
        &mut self.nodes[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> std::ops::Range<usize> {
        0..self.nodes.len()
    }

    pub fn children(&self, id: usize) -> &[usize] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: usize) -> Option<usize> {
        self.nodes[id].parent
    }

    pub fn is_leaf(&self, id: usize) -> bool {
        self.nodes[id].children.is_empty()
    }

    pub fn leaf_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.node_ids().filter(|id| self.is_leaf(*id))
    }

    /// Node ids with children before parents.
    pub fn postorder(&self) -> Vec<usize> {
        let mut order = self.preorder();
        order.reverse();
        order
    }

    /// Node ids with parents before children, siblings in insertion order.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.nodes[id].children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }
}

// -------------------------------------------------------------------------------------------------
// Collapsed tree.

/// Name of a collapsed node: a single identifier, or the united identifiers
/// of observed genotypes that merged during collapse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeName {
    Single(String),
    Merged(BTreeSet<String>),
}

impl NodeName {
    pub fn names(&self) -> BTreeSet<String> {
        match self {
            NodeName::Single(name) => [name.clone()].into_iter().collect(),
            NodeName::Merged(names) => names.clone(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            NodeName::Single(single) => single == name,
            NodeName::Merged(names) => names.contains(name),
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            NodeName::Single(name) => Some(name),
            NodeName::Merged(_) => None,
        }
    }

    fn from_set(names: BTreeSet<String>) -> Self {
        if names.len() == 1 {
            NodeName::Single(names.into_iter().next().unwrap())
        } else {
            NodeName::Merged(names)
        }
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeName::Single(name) => write!(f, "{}", name),
            NodeName::Merged(names) => {
                let joined: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join("|"))
            }
        }
    }
}

/// A node of a collapsed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: NodeName,
    pub sequence: String,
    pub abundance: u32,
    /// Hamming distance to the parent; 0 at the root.
    pub dist: u32,
    pub isotype: IsotypeMap,
    pub inferred_isotype: Option<Isotype>,
    pub original_ids: BTreeSet<String>,
    /// Bootstrap support, if computed.
    pub support: Option<f64>,
    /// Local branching index / ratio, if computed.
    pub lbi: Option<f64>,
    pub lbr: Option<f64>,
    pub(crate) children: Vec<usize>,
    pub(crate) parent: Option<usize>,
}

impl TreeNode {
    pub(crate) fn new(name: NodeName, sequence: String, abundance: u32, dist: u32) -> Self {
        TreeNode {
            name,
            sequence,
            abundance,
            dist,
            isotype: IsotypeMap::new(),
            inferred_isotype: None,
            original_ids: BTreeSet::new(),
            support: None,
            lbi: None,
            lbr: None,
            children: Vec::new(),
            parent: None,
        }
    }
}

/// A collapsed tree, modeled as an infinite-type Galton–Watson process run to
/// extinction. Node 0 is the root; the node order is canonical preorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollapsedTree {
    nodes: Vec<TreeNode>,
    cm_counts: CmCounts,
}

impl CollapsedTree {
    /// Collapse an input tree.
    ///
    /// `allow_repeats` tolerates distinct post-collapse nodes sharing a
    /// sequence with positive abundance (e.g. in bootstrap samples), warning
    /// instead of failing.
    pub fn from_raw(raw: &RawTree, allow_repeats: bool) -> Result<Self, CollapseError> {
        Collapser::new(raw).run(allow_repeats)
    }

    /// Assemble a tree that is collapsed by construction (simulation).
    pub(crate) fn from_nodes_unchecked(nodes: Vec<TreeNode>) -> Self {
        let cm_counts = build_cm_counts(&nodes);
        CollapsedTree { nodes, cm_counts }
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn root_id(&self) -> usize {
        0
    }

    pub fn node(&self, id: usize) -> &TreeNode {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: usize) -> &mut TreeNode {
        &mut self.nodes[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> std::ops::Range<usize> {
        0..self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.iter()
    }

    pub fn children(&self, id: usize) -> &[usize] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: usize) -> Option<usize> {
        self.nodes[id].parent
    }

    pub fn is_leaf(&self, id: usize) -> bool {
        self.nodes[id].children.is_empty()
    }

    /// Node ids of observed genotypes: positive abundance, or the root.
    pub fn observed_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.node_ids()
            .filter(|id| self.nodes[*id].abundance > 0 || *id == 0)
    }

    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            order.push(id);
            for child in self.nodes[id].children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    pub fn postorder(&self) -> Vec<usize> {
        let mut order = self.preorder();
        order.reverse();
        order
    }

    /// The CM summary: `(c, m)` pairs with multiplicities, root pseudocount
    /// applied.
    pub fn cm_counts(&self) -> &CmCounts {
        &self.cm_counts
    }

    /// Total Hamming parsimony weight of the tree.
    pub fn parsimony_score(&self) -> u32 {
        self.nodes.iter().map(|n| n.dist).sum()
    }

    /// Log likelihood of `(p, q)` given this tree, with gradient.
    pub fn ll(&self, kernel: &mut LlKernel) -> Result<(f64, Gradient), LikelihoodError> {
        likelihood::ll_tree(kernel, &self.cm_counts)
    }

    /// Maximum likelihood estimate of `(p, q)` for this tree alone.
    pub fn mle(&self) -> Result<(f64, f64), LikelihoodError> {
        let mut kernel = LlKernel::new(0.5, 0.5)?;
        likelihood::mle::mle(|p, q| {
            kernel.set_params(p, q)?;
            likelihood::ll_tree(&mut kernel, &self.cm_counts)
        })
    }

    /// Rebuild an input tree from this collapsed tree. Merged names flatten
    /// to their display form.
    pub fn to_raw(&self) -> RawTree {
        let mut raw_nodes: Vec<RawNode> = self
            .nodes
            .iter()
            .map(|node| RawNode {
                name: node.name.to_string(),
                sequence: node.sequence.clone(),
                abundance: node.abundance,
                isotype: node.isotype.clone(),
                original_ids: node.original_ids.clone(),
                children: node.children.clone(),
                parent: node.parent,
            })
            .collect();
        raw_nodes[0].parent = None;
        RawTree { nodes: raw_nodes }
    }

    fn ancestors(&self, mut id: usize) -> Vec<usize> {
        let mut path = vec![id];
        while let Some(parent) = self.nodes[id].parent {
            path.push(parent);
            id = parent;
        }
        path
    }

    fn mrca(&self, a: usize, b: usize) -> usize {
        let ancestors_a: BTreeSet<usize> = self.ancestors(a).into_iter().collect();
        for id in self.ancestors(b) {
            if ancestors_a.contains(&id) {
                return id;
            }
        }
        0
    }

    fn find_by_sequence(&self, sequence: &str) -> Option<usize> {
        self.node_ids().find(|id| self.nodes[*id].sequence == sequence)
    }

    fn subtree_ids(&self, id: usize) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            ids.push(cur);
            stack.extend(self.nodes[cur].children.iter().copied());
        }
        ids
    }

    // ---------------------------------------------------------------------------------------------
    // Tree comparison.

    /// Identity comparison: lexicographic equality of the multisets of
    /// `(sequence, abundance, parent sequence)` triples.
    pub fn identical(&self, other: &CollapsedTree) -> bool {
        fn triples(tree: &CollapsedTree) -> Vec<(String, u32, Option<String>)> {
            let mut list: Vec<_> = tree
                .node_ids()
                .map(|id| {
                    let node = tree.node(id);
                    (
                        node.sequence.clone(),
                        node.abundance,
                        node.parent.map(|p| tree.node(p).sequence.clone()),
                    )
                })
                .collect();
            list.sort();
            list
        }
        triples(self) == triples(other)
    }

    /// Mean normalized Hamming distance between MRCA sequences over all pairs
    /// of observed taxa.
    pub fn mrca_distance(&self, other: &CollapsedTree) -> Result<f64, CompareError> {
        let taxa: Vec<String> = self
            .node_ids()
            .filter(|id| self.nodes[*id].abundance > 0)
            .map(|id| self.nodes[id].sequence.clone())
            .collect();
        let mut distance_sum = 0.0;
        let mut site_sum = 0.0;
        for i in 0..taxa.len() {
            for j in (i + 1)..taxa.len() {
                let self_i = self.locate_taxon(&taxa[i])?;
                let self_j = self.locate_taxon(&taxa[j])?;
                let other_i = other.locate_taxon(&taxa[i])?;
                let other_j = other.locate_taxon(&taxa[j])?;
                let mrca_self = &self.nodes[self.mrca(self_i, self_j)].sequence;
                let mrca_other = &other.nodes[other.mrca(other_i, other_j)].sequence;
                distance_sum += f64::from(hamming_distance(mrca_self, mrca_other));
                site_sum += mrca_self.len() as f64;
            }
        }
        Ok(distance_sum / site_sum)
    }

    fn locate_taxon(&self, sequence: &str) -> Result<usize, CompareError> {
        self.find_by_sequence(sequence)
            .ok_or_else(|| CompareError::TaxonNotFound {
                sequence: sequence.to_string(),
            })
    }

    /// Robinson–Foulds distance on sequence labels, as unrooted trees, after
    /// adding an explicit observed-leaf child under every positive-abundance
    /// node.
    pub fn rf_distance(&self, other: &CollapsedTree) -> Result<u32, CompareError> {
        let (leaves_a, splits_a) = self.sequence_splits();
        let (leaves_b, splits_b) = other.sequence_splits();
        if leaves_a != leaves_b {
            return Err(CompareError::LeafSetMismatch);
        }
        Ok(splits_a.symmetric_difference(&splits_b).count() as u32)
    }

    /// Leaf sequence set and canonical nontrivial bipartitions of the tree
    /// with observed-leaf children attached.
    fn sequence_splits(&self) -> (BTreeSet<String>, BTreeSet<BTreeSet<String>>) {
        // Attaching a leaf child under every observed node means the leaf set
        // is exactly: observed sequences, plus original zero-abundance leaves.
        let is_taxon = |id: usize| {
            self.nodes[id].abundance > 0 || self.nodes[id].children.is_empty()
        };
        let leaves: BTreeSet<String> = self
            .node_ids()
            .filter(|id| is_taxon(*id))
            .map(|id| self.nodes[id].sequence.clone())
            .collect();
        let mut splits = BTreeSet::new();
        for id in self.node_ids().skip(1) {
            if self.nodes[id].children.is_empty() {
                continue;
            }
            let side: BTreeSet<String> = self
                .subtree_ids(id)
                .into_iter()
                .filter(|n| is_taxon(*n))
                .map(|n| self.nodes[n].sequence.clone())
                .collect();
            let complement: BTreeSet<String> = leaves.difference(&side).cloned().collect();
            if side.len() < 2 || complement.len() < 2 {
                continue;
            }
            splits.insert(side.min(complement));
        }
        (leaves, splits)
    }
}

// -------------------------------------------------------------------------------------------------
// Collapse algorithm.

struct WorkNode {
    name: NodeName,
    sequence: String,
    abundance: u32,
    dist: u32,
    isotype: IsotypeMap,
    inferred: Option<Isotype>,
    original_ids: BTreeSet<String>,
    children: Vec<usize>,
    parent: Option<usize>,
    alive: bool,
}

struct Collapser {
    nodes: Vec<WorkNode>,
}

impl Collapser {
    fn new(raw: &RawTree) -> Self {
        let nodes = raw
            .nodes
            .iter()
            .map(|node| WorkNode {
                name: NodeName::Single(node.name.clone()),
                sequence: node.sequence.clone(),
                abundance: node.abundance,
                dist: 0,
                isotype: node.isotype.clone(),
                inferred: None,
                original_ids: node.original_ids.clone(),
                children: node.children.clone(),
                parent: node.parent,
                alive: true,
            })
            .collect();
        Collapser { nodes }
    }

    fn run(mut self, allow_repeats: bool) -> Result<CollapsedTree, CollapseError> {
        self.delete_unobserved_unifurcations();
        self.recompute_distances();

        let observed_names = self.observed_names();
        self.contract_zero_edges(&observed_names);
        self.set_inferred_isotypes();
        self.check_observed_names(&observed_names)?;
        self.check_repeats(allow_repeats)?;
        self.ladderize_and_rename();

        Ok(self.compact())
    }

    fn alive_ids(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|id| self.nodes[*id].alive)
    }

    /// Reattach the node's children to its parent and drop the node.
    fn splice(&mut self, id: usize) {
        let parent = self.nodes[id].parent.expect("cannot splice the root");
        let children = std::mem::take(&mut self.nodes[id].children);
        for child in &children {
            self.nodes[*child].parent = Some(parent);
        }
        let position = self.nodes[parent]
            .children
            .iter()
            .position(|c| *c == id)
            .expect("child missing from parent's child list");
        self.nodes[parent].children.remove(position);
        self.nodes[parent].children.extend(children);
        self.nodes[id].alive = false;
    }

    fn delete_unobserved_unifurcations(&mut self) {
        for id in 1..self.nodes.len() {
            if self.nodes[id].alive
                && self.nodes[id].abundance == 0
                && self.nodes[id].children.len() == 1
            {
                self.splice(id);
            }
        }
    }

    fn recompute_distances(&mut self) {
        for id in self.alive_ids().collect::<Vec<_>>() {
            if let Some(parent) = self.nodes[id].parent {
                self.nodes[id].dist =
                    hamming_distance(&self.nodes[id].sequence, &self.nodes[parent].sequence);
            } else {
                self.nodes[id].dist = 0;
            }
        }
    }

    /// Flattened identifiers of observed genotypes, plus the root's.
    fn observed_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for id in self.alive_ids() {
            if self.nodes[id].abundance > 0 || id == 0 {
                names.extend(self.nodes[id].name.names());
            }
        }
        names
    }

    fn contract_zero_edges(&mut self, observed_names: &BTreeSet<String>) {
        for id in self.postorder() {
            if id == 0 || !self.nodes[id].alive || self.nodes[id].dist != 0 {
                continue;
            }
            let parent = self.nodes[id].parent.expect("non-root node has a parent");

            // A nonzero abundance on either side is the abundance of the
            // shared genotype.
            self.nodes[parent].abundance =
                self.nodes[parent].abundance.max(self.nodes[id].abundance);

            let child_isotype = self.nodes[id].isotype.clone();
            merge_isotype_maps(&mut self.nodes[parent].isotype, &child_isotype);

            let child_ids = self.nodes[id].original_ids.clone();
            self.nodes[parent].original_ids.extend(child_ids);

            let node_set = self.nodes[id].name.names();
            let parent_set = self.nodes[parent].name.names();
            if parent_set.is_subset(observed_names) {
                if node_set.is_subset(observed_names) {
                    self.nodes[parent].name =
                        NodeName::from_set(node_set.union(&parent_set).cloned().collect());
                }
            } else if node_set.is_subset(observed_names) {
                self.nodes[parent].name = NodeName::from_set(node_set);
            }

            self.splice(id);
        }
    }

    fn set_inferred_isotypes(&mut self) {
        for id in 0..self.nodes.len() {
            if self.nodes[id].alive {
                self.nodes[id].inferred = inferred_isotype(&self.nodes[id].isotype);
            }
        }
    }

    fn check_observed_names(&self, before: &BTreeSet<String>) -> Result<(), CollapseError> {
        let after = self.observed_names();
        if &after != before {
            let diff: BTreeSet<String> = before.symmetric_difference(&after).cloned().collect();
            return Err(CollapseError::ObservedNamesChanged {
                before: format!("{:?}", before),
                after: format!("{:?}", after),
                diff: format!("{:?}", diff),
            });
        }
        Ok(())
    }

    fn check_repeats(&self, allow_repeats: bool) -> Result<(), CollapseError> {
        let observed: Vec<&str> = self
            .alive_ids()
            .filter(|id| self.nodes[*id].abundance > 0)
            .map(|id| self.nodes[id].sequence.as_str())
            .collect();
        let distinct: BTreeSet<&str> = observed.iter().copied().collect();
        let repeats = observed.len() - distinct.len();
        if repeats > 0 {
            if allow_repeats {
                warn!(
                    "repeated observed sequences in collapsed tree: {} repeats",
                    repeats
                );
            } else {
                return Err(CollapseError::RepeatedSequences { count: repeats });
            }
        }
        Ok(())
    }

    /// Sort children by (partition, sequence) and give unobserved nodes
    /// canonical deduplicated names, in one postorder pass.
    fn ladderize_and_rename(&mut self) {
        let mut partition: Vec<u64> = vec![0; self.nodes.len()];
        let mut unobserved_count: u32 = 1;
        let mut unobserved_names: BTreeMap<String, String> = BTreeMap::new();

        for id in self.postorder() {
            partition[id] = u64::from(self.nodes[id].abundance)
                + self.nodes[id]
                    .children
                    .iter()
                    .map(|c| partition[*c])
                    .sum::<u64>();
            let mut children = std::mem::take(&mut self.nodes[id].children);
            children.sort_by(|a, b| {
                (partition[*a], &self.nodes[*a].sequence)
                    .cmp(&(partition[*b], &self.nodes[*b].sequence))
            });
            self.nodes[id].children = children;

            if self.nodes[id].abundance == 0 && id != 0 {
                let sequence = self.nodes[id].sequence.clone();
                let name = unobserved_names.entry(sequence).or_insert_with(|| {
                    let name = unobserved_count.to_string();
                    unobserved_count += 1;
                    name
                });
                self.nodes[id].name = NodeName::Single(name.clone());
            }
        }
    }

    /// Postorder over alive nodes, children before parents.
    fn postorder(&self) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().copied());
        }
        order.reverse();
        order
    }

    /// Renumber alive nodes into canonical preorder and build the CM summary.
    fn compact(self) -> CollapsedTree {
        let mut mapping: BTreeMap<usize, usize> = BTreeMap::new();
        let mut order = Vec::new();
        let mut stack = vec![0usize];
        while let Some(id) = stack.pop() {
            mapping.insert(id, order.len());
            order.push(id);
            for child in self.nodes[id].children.iter().rev() {
                stack.push(*child);
            }
        }

        let nodes: Vec<TreeNode> = order
            .iter()
            .map(|old| {
                let work = &self.nodes[*old];
                TreeNode {
                    name: work.name.clone(),
                    sequence: work.sequence.clone(),
                    abundance: work.abundance,
                    dist: work.dist,
                    isotype: work.isotype.clone(),
                    inferred_isotype: work.inferred,
                    original_ids: work.original_ids.clone(),
                    support: None,
                    lbi: None,
                    lbr: None,
                    children: work.children.iter().map(|c| mapping[c]).collect(),
                    parent: work.parent.map(|p| mapping[&p]),
                }
            })
            .collect();

        let cm_counts = build_cm_counts(&nodes);
        CollapsedTree { nodes, cm_counts }
    }
}

/// CM summary of a node arena, with the root pseudocount rule: an unobserved
/// root unifurcation `(0, 1)` is replaced by `(1, 1)`.
fn build_cm_counts(nodes: &[TreeNode]) -> CmCounts {
    let mut counter: BTreeMap<(u32, u32), u32> = BTreeMap::new();
    for (id, node) in nodes.iter().enumerate() {
        let mut cm = (node.abundance, node.children.len() as u32);
        if id == 0 && cm == (0, 1) {
            cm = (1, 1);
        }
        *counter.entry(cm).or_insert(0) += 1;
    }
    counter.into_iter().collect()
}

// -------------------------------------------------------------------------------------------------
// Errors.

#[derive(Error, Debug)]
pub enum CollapseError {
    #[error(
        "observed genotypes don't match after collapse\n\tbefore: {before}\n\tafter: {after}\n\tsymmetric diff: {diff}"
    )]
    ObservedNamesChanged {
        before: String,
        after: String,
        diff: String,
    },
    #[error("repeated observed sequences in collapsed tree: {count} sequences were found repeated")]
    RepeatedSequences { count: usize },
}

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("no node with sequence {sequence:?} in comparison tree")]
    TaxonNotFound { sequence: String },
    #[error("trees do not cover the same taxa")]
    LeafSetMismatch,
    #[error("splits do not cover the same taxa; taxa not in both: {diff}")]
    SplitCoverMismatch { diff: String },
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;

    fn leafless_root(seq: &str, abundance: u32) -> RawTree {
        RawTree::new(RawNode::new("root", seq, abundance))
    }

    #[test]
    fn chain_of_zero_length_edges_merges_to_one_node() {
        // root(2) - A(0, dist 0) - B(3, dist 0), all the same sequence.
        let mut raw = leafless_root("AAAA", 2);
        let a = raw.add_child(0, RawNode::new("A", "AAAA", 0));
        raw.add_child(a, RawNode::new("B", "AAAA", 3));

        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root().abundance, 3, "abundances merge by max");
        assert!(tree.root().name.contains("root"));
        assert!(tree.root().name.contains("B"));
        assert_eq!(tree.cm_counts(), &vec![((3, 0), 1)]);
    }

    #[test]
    fn balanced_depth_two_cm_summary() {
        let mut raw = leafless_root("AAAA", 0);
        let left = raw.add_child(0, RawNode::new("i1", "AATA", 0));
        let right = raw.add_child(0, RawNode::new("i2", "TTAA", 0));
        raw.add_child(left, RawNode::new("l1", "CATA", 1));
        raw.add_child(left, RawNode::new("l2", "GATA", 1));
        raw.add_child(right, RawNode::new("l3", "TTCA", 1));
        raw.add_child(right, RawNode::new("l4", "TTGA", 1));

        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        assert_eq!(tree.cm_counts(), &vec![((0, 2), 3), ((1, 0), 4)]);
    }

    #[test]
    fn unobserved_unifurcations_are_spliced_out() {
        let mut raw = leafless_root("AAAA", 1);
        let u = raw.add_child(0, RawNode::new("u", "AATA", 0));
        raw.add_child(u, RawNode::new("leaf", "AATT", 2));

        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        assert_eq!(tree.node_count(), 2);
        let leaf = tree.node(tree.children(0)[0]);
        assert_eq!(leaf.dist, 2, "distance spans the removed unifurcation");
    }

    #[test]
    fn root_pseudocount_applies_to_unobserved_unifurcating_root() {
        let mut raw = leafless_root("AAAA", 0);
        raw.add_child(0, RawNode::new("leaf", "AATA", 1));
        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        assert_eq!(tree.cm_counts(), &vec![((1, 0), 1), ((1, 1), 1)]);
    }

    #[test]
    fn observed_names_survive_collapse() {
        let mut raw = leafless_root("AAAA", 1);
        let mid = raw.add_child(0, RawNode::new("mid", "AATA", 0));
        raw.add_child(mid, RawNode::new("same", "AATA", 2));
        raw.add_child(mid, RawNode::new("other", "AACA", 1));

        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        let mut names = BTreeSet::new();
        for id in tree.observed_ids() {
            names.extend(tree.node(id).name.names());
        }
        for expected in ["root", "same", "other"] {
            assert!(names.contains(expected), "{} missing", expected);
        }
        assert!(!names.contains("mid"), "unobserved name replaced");
    }

    #[test]
    fn repeated_observed_sequences_rejected_unless_allowed() {
        let mut raw = leafless_root("AAAA", 1);
        raw.add_child(0, RawNode::new("x", "AATA", 1));
        raw.add_child(0, RawNode::new("y", "AATA", 1));

        assert!(matches!(
            CollapsedTree::from_raw(&raw, false),
            Err(CollapseError::RepeatedSequences { count: 1 })
        ));
        assert!(CollapsedTree::from_raw(&raw, true).is_ok());
    }

    #[test]
    fn collapse_is_idempotent() {
        let mut raw = leafless_root("AAAA", 2);
        let a = raw.add_child(0, RawNode::new("A", "AAAA", 0));
        let b = raw.add_child(a, RawNode::new("B", "AATA", 3));
        raw.add_child(b, RawNode::new("C", "AATT", 1));
        raw.add_child(b, RawNode::new("D", "CATA", 1));

        let once = CollapsedTree::from_raw(&raw, false).unwrap();
        let twice = CollapsedTree::from_raw(&once.to_raw(), false).unwrap();
        assert!(once.identical(&twice));
    }

    #[test]
    fn children_are_ladderized_by_partition_then_sequence() {
        let mut raw = leafless_root("AAAA", 0);
        let big = raw.add_child(0, RawNode::new("big", "TTTT", 0));
        raw.add_child(big, RawNode::new("b1", "TTTA", 2));
        raw.add_child(big, RawNode::new("b2", "TTTC", 2));
        raw.add_child(0, RawNode::new("small", "AATA", 1));

        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        let kids = tree.children(0);
        assert_eq!(tree.node(kids[0]).sequence, "AATA", "smaller partition first");
        assert_eq!(tree.node(kids[1]).sequence, "TTTT");
    }

    #[test]
    fn unobserved_nodes_get_deduplicated_names() {
        let mut raw = leafless_root("AAAA", 1);
        let u1 = raw.add_child(0, RawNode::new("internal-x", "AATT", 0));
        raw.add_child(u1, RawNode::new("l1", "AATC", 1));
        raw.add_child(u1, RawNode::new("l2", "AATG", 1));

        let tree = CollapsedTree::from_raw(&raw, false).unwrap();
        let unobserved: Vec<&TreeNode> = tree
            .nodes()
            .filter(|n| n.abundance == 0)
            .collect();
        assert_eq!(unobserved.len(), 1);
        assert_eq!(unobserved[0].name, NodeName::Single("1".to_string()));
    }

    #[test]
    fn identity_comparison_ignores_names() {
        let mut raw_a = leafless_root("AAAA", 1);
        raw_a.add_child(0, RawNode::new("x", "AATA", 1));
        let mut raw_b = leafless_root("AAAA", 1);
        raw_b.add_child(0, RawNode::new("renamed", "AATA", 1));

        let a = CollapsedTree::from_raw(&raw_a, false).unwrap();
        let b = CollapsedTree::from_raw(&raw_b, false).unwrap();
        assert!(a.identical(&b));
    }

    #[test]
    fn mrca_distance_zero_for_identical_trees() {
        let mut raw = leafless_root("AAAA", 1);
        raw.add_child(0, RawNode::new("x", "AATA", 1));
        raw.add_child(0, RawNode::new("y", "AACA", 1));
        let a = CollapsedTree::from_raw(&raw, false).unwrap();
        let b = CollapsedTree::from_raw(&raw, false).unwrap();
        assert_eq!(a.mrca_distance(&b).unwrap(), 0.0);
    }

    #[test]
    fn rf_distance_detects_topology_changes() {
        // Four taxa under the root in two different groupings.
        let mut raw_a = leafless_root("AAAA", 1);
        let i1 = raw_a.add_child(0, RawNode::new("i1", "AATT", 0));
        raw_a.add_child(i1, RawNode::new("a", "AATC", 1));
        raw_a.add_child(i1, RawNode::new("b", "AATG", 1));
        let i2 = raw_a.add_child(0, RawNode::new("i2", "CCAA", 0));
        raw_a.add_child(i2, RawNode::new("c", "CCAT", 1));
        raw_a.add_child(i2, RawNode::new("d", "CCAG", 1));

        let mut raw_b = leafless_root("AAAA", 1);
        let j1 = raw_b.add_child(0, RawNode::new("j1", "AATT", 0));
        raw_b.add_child(j1, RawNode::new("a", "AATC", 1));
        raw_b.add_child(j1, RawNode::new("c", "CCAT", 1));
        let j2 = raw_b.add_child(0, RawNode::new("j2", "CCAA", 0));
        raw_b.add_child(j2, RawNode::new("b", "AATG", 1));
        raw_b.add_child(j2, RawNode::new("d", "CCAG", 1));

        let a = CollapsedTree::from_raw(&raw_a, false).unwrap();
        let b = CollapsedTree::from_raw(&raw_b, false).unwrap();
        assert_eq!(a.rf_distance(&a).unwrap(), 0);
        assert!(a.rf_distance(&b).unwrap() > 0);
    }

    #[test]
    fn cm_sufficiency_for_likelihood() {
        // Two different topologies with the same CM summary.
        let mut raw_a = leafless_root("AAAA", 1);
        raw_a.add_child(0, RawNode::new("x", "AATA", 1));
        raw_a.add_child(0, RawNode::new("y", "AACA", 1));

        let mut raw_b = leafless_root("CCCC", 1);
        raw_b.add_child(0, RawNode::new("x", "CCCA", 1));
        raw_b.add_child(0, RawNode::new("y", "CCCG", 1));

        let a = CollapsedTree::from_raw(&raw_a, false).unwrap();
        let b = CollapsedTree::from_raw(&raw_b, false).unwrap();
        assert_eq!(a.cm_counts(), b.cm_counts());

        let mut kernel = LlKernel::new(0.4, 0.3).unwrap();
        let (ll_a, grad_a) = a.ll(&mut kernel).unwrap();
        let (ll_b, grad_b) = b.ll(&mut kernel).unwrap();
        assert_eq!(ll_a, ll_b);
        assert_eq!(grad_a, grad_b);
    }
}
