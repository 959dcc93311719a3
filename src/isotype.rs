//! Isotype switching order and observed-isotype bookkeeping.
//!
//! Isotypes (IgM, IgG1, ...) switch along a fixed total order during B-cell
//! differentiation: transitions along tree edges must be non-decreasing in
//! that order. Observed isotypes attach to observed genotypes as a map from
//! isotype to the number of cells observed with it; unobserved ancestors get
//! the minimum (least differentiated) isotype consistent with their
//! descendants, which is the parsimonious resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history_dag::{HistoryDag, NodeId};
use crate::history_dag::weight::WeightAlgebra;
use crate::history_dag::DagError;

/// Rank of an isotype in the switching order. Lower ranks are less
/// differentiated; switching can only increase the rank.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Isotype(pub u8);

/// Observed isotypes of a genotype: isotype rank to observed cell count.
pub type IsotypeMap = BTreeMap<Isotype, u32>;

/// Key-wise max merge, the same rule abundances use when zero-length
/// descendants collapse into their parent.
pub fn merge_isotype_maps(parent: &mut IsotypeMap, child: &IsotypeMap) {
    for (iso, count) in child {
        let entry = parent.entry(*iso).or_insert(0);
        *entry = (*entry).max(*count);
    }
}

/// The least differentiated isotype present, or `None` for an empty map.
pub fn inferred_isotype(map: &IsotypeMap) -> Option<Isotype> {
    map.keys().next().copied()
}

// -------------------------------------------------------------------------------------------------
// Switching order.

/// Total order on isotype names, from most naive to most differentiated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsotypeOrder {
    names: Vec<String>,
}

impl Default for IsotypeOrder {
    fn default() -> Self {
        IsotypeOrder {
            names: ["IgM", "IgG3", "IgG1", "IgA1", "IgG2", "IgG4", "IgE", "IgA2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl IsotypeOrder {
    pub fn new(names: Vec<String>) -> Result<Self, IsotypeError> {
        let distinct: BTreeSet<&String> = names.iter().collect();
        if distinct.len() != names.len() || names.is_empty() {
            return Err(IsotypeError::InvalidOrder { names });
        }
        Ok(IsotypeOrder { names })
    }

    pub fn rank(&self, name: &str) -> Result<Isotype, IsotypeError> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| Isotype(i as u8))
            .ok_or_else(|| IsotypeError::UnknownIsotype {
                name: name.to_string(),
            })
    }

    pub fn name(&self, isotype: Isotype) -> Option<&str> {
        self.names.get(isotype.0 as usize).map(String::as_str)
    }
}

// -------------------------------------------------------------------------------------------------
// File parsers.

/// Parse a CSV file mapping original sequence ids to observed isotype names:
/// `some_sequence_id,some_isotype` per line, no header.
pub fn parse_isotype_map(path: &Path) -> Result<HashMap<String, String>, IsotypeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut map = HashMap::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < 2 {
            continue;
        }
        map.insert(record[0].to_string(), record[1].to_string());
    }
    Ok(map)
}

/// Parse a CSV file mapping genotype names to colon-separated original
/// sequence ids: `seqid,cellid1:cellid2` per line, no header.
pub fn parse_id_map(path: &Path) -> Result<HashMap<String, BTreeSet<String>>, IsotypeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut map = HashMap::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < 2 {
            continue;
        }
        let ids: BTreeSet<String> = record[1]
            .split(':')
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if !ids.is_empty() {
            map.insert(record[0].to_string(), ids);
        }
    }
    Ok(map)
}

/// Observed isotype map for one genotype, resolving its original ids through
/// the cell-level isotype map. Missing cells are warned about and skipped.
pub fn observed_isotypes(
    original_ids: &BTreeSet<String>,
    isotype_map: &HashMap<String, String>,
    order: &IsotypeOrder,
) -> Result<IsotypeMap, IsotypeError> {
    let mut observed = IsotypeMap::new();
    for id in original_ids {
        match isotype_map.get(id) {
            Some(name) => {
                let rank = order.rank(name)?;
                *observed.entry(rank).or_insert(0) += 1;
            }
            None => warn!("no isotype observation for sequence id {:?}", id),
        }
    }
    Ok(observed)
}

// -------------------------------------------------------------------------------------------------
// Weight algebra.

/// Isotype parsimony on the history DAG: the number of isotype transitions
/// along tree edges, minimized over ancestral assignments that respect the
/// switching order.
///
/// The inferred isotype of a node is the minimum observed rank in its
/// annotated isotype map (stamped by forest isotype annotation from the
/// leaves below it, which are fixed by the node's clades and so identical
/// across histories). An edge counts one transition when the inferred rank
/// changes; a switching-order violation also counts one, the minimum any
/// order-respecting resolution must pay.
pub struct IsotypeParsimony {
    enabled: bool,
}

impl IsotypeParsimony {
    /// Score isotype transitions from the DAG's isotype annotations.
    pub fn new() -> Self {
        IsotypeParsimony { enabled: true }
    }

    /// Placeholder with no isotype information: every edge weighs zero.
    pub fn disabled() -> Self {
        IsotypeParsimony { enabled: false }
    }
}

impl Default for IsotypeParsimony {
    fn default() -> Self {
        IsotypeParsimony::new()
    }
}

impl WeightAlgebra for IsotypeParsimony {
    type Weight = u32;

    fn start(&self, _dag: &HistoryDag, _node: NodeId) -> u32 {
        0
    }

    fn edge_weight(&self, dag: &HistoryDag, parent: NodeId, child: NodeId) -> Result<u32, DagError> {
        if !self.enabled {
            return Ok(0);
        }
        // A leaf that collapses into its same-sequence parent is not an edge
        // of the collapsed tree.
        if dag.is_leaf(child) && dag.same_sequence(parent, child) {
            return Ok(0);
        }
        let from = inferred_isotype(&dag.attr(parent).isotype);
        let to = inferred_isotype(&dag.attr(child).isotype);
        Ok(match (from, to) {
            (Some(a), Some(b)) => {
                if b >= a {
                    u32::from(b != a)
                } else {
                    1
                }
            }
            _ => 0,
        })
    }

    fn accum(&self, weights: Vec<u32>) -> u32 {
        weights.into_iter().sum()
    }
}

// -------------------------------------------------------------------------------------------------
// Errors.

#[derive(Error, Debug)]
pub enum IsotypeError {
    #[error("isotype {name:?} does not appear in the switching order")]
    UnknownIsotype { name: String },
    #[error("isotype order must be non-empty and duplicate-free: {names:?}")]
    InvalidOrder { names: Vec<String> },
    #[error("error reading isotype CSV file")]
    CsvError(#[from] csv::Error),
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_ranks_igm_first() {
        let order = IsotypeOrder::default();
        assert_eq!(order.rank("IgM").unwrap(), Isotype(0));
        assert_eq!(order.rank("IgA2").unwrap(), Isotype(7));
        assert!(order.rank("IgX").is_err());
    }

    #[test]
    fn merge_takes_keywise_max() {
        let mut parent: IsotypeMap = [(Isotype(0), 2), (Isotype(1), 1)].into_iter().collect();
        let child: IsotypeMap = [(Isotype(1), 3), (Isotype(2), 1)].into_iter().collect();
        merge_isotype_maps(&mut parent, &child);
        assert_eq!(parent[&Isotype(0)], 2);
        assert_eq!(parent[&Isotype(1)], 3);
        assert_eq!(parent[&Isotype(2)], 1);
    }

    #[test]
    fn inferred_isotype_is_minimum_rank() {
        let map: IsotypeMap = [(Isotype(3), 1), (Isotype(1), 4)].into_iter().collect();
        assert_eq!(inferred_isotype(&map), Some(Isotype(1)));
        assert_eq!(inferred_isotype(&IsotypeMap::new()), None);
    }

    #[test]
    fn observed_isotypes_counts_cells() {
        let order = IsotypeOrder::default();
        let ids: BTreeSet<String> = ["c1", "c2", "c3"].iter().map(|s| s.to_string()).collect();
        let isotype_map: HashMap<String, String> = [
            ("c1".to_string(), "IgM".to_string()),
            ("c2".to_string(), "IgM".to_string()),
            ("c3".to_string(), "IgG1".to_string()),
        ]
        .into_iter()
        .collect();
        let observed = observed_isotypes(&ids, &isotype_map, &order).unwrap();
        assert_eq!(observed[&Isotype(0)], 2);
        assert_eq!(observed[&Isotype(2)], 1);
    }
}
