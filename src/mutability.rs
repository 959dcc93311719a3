//! Context-sensitive mutability parsimony.
//!
//! An external mutation model assigns each k-mer context a mutability (how
//! likely the center base is to mutate at all) and a substitution row (where
//! it goes when it does). The mutability parsimony of a tree edge is the
//! summed negative log-probability of its substitutions under that model;
//! trees whose mutations sit in implausible contexts are penalized.
//!
//! Sequences that concatenate two chains (heavy/light) are handled by
//! treating the split index as a k-mer boundary: context windows never read
//! across it, the out-of-segment positions padding with `N`. Contexts
//! containing `N` average the table rows over the concrete contexts they
//! cover.

use std::collections::HashMap;
use std::path::Path;

use log::warn;
use thiserror::Error;

use crate::history_dag::algebras::StableFloat;
use crate::history_dag::weight::WeightAlgebra;
use crate::history_dag::{DagError, HistoryDag, NodeId};
use crate::sequence::{base_index, resolutions};

/// Probability floor for contexts or substitutions missing from the tables.
const PROBABILITY_FLOOR: f64 = 1e-10;

/// A k-mer mutability/substitution model (e.g. S5F).
#[derive(Debug, Clone)]
pub struct MutationModel {
    k: usize,
    mutability: HashMap<String, f64>,
    substitution: HashMap<String, [f64; 4]>,
    splits: Vec<usize>,
}

impl MutationModel {
    /// Build from in-memory tables. The context width is inferred from the
    /// motifs and must be odd.
    pub fn from_tables(
        mutability: HashMap<String, f64>,
        substitution: HashMap<String, [f64; 4]>,
        splits: Vec<usize>,
    ) -> Result<Self, MutabilityError> {
        let k = mutability
            .keys()
            .next()
            .map(String::len)
            .ok_or(MutabilityError::EmptyTable)?;
        if k % 2 == 0 || mutability.keys().any(|m| m.len() != k) {
            return Err(MutabilityError::BadMotifLength { k });
        }
        Ok(MutationModel {
            k,
            mutability,
            substitution,
            splits,
        })
    }

    /// Parse space-separated mutability (`motif value ...`) and substitution
    /// (`motif A C G T`) tables with header rows, as published for S5F.
    pub fn from_files(
        mutability_file: &Path,
        substitution_file: &Path,
        splits: Vec<usize>,
    ) -> Result<Self, MutabilityError> {
        let mut mutability = HashMap::new();
        for record in table_records(mutability_file)? {
            let record = record?;
            if record.len() < 2 {
                continue;
            }
            let value: f64 = record[1]
                .parse()
                .map_err(|_| MutabilityError::BadNumber {
                    field: record[1].to_string(),
                })?;
            mutability.insert(record[0].to_uppercase(), value);
        }

        let mut substitution = HashMap::new();
        for record in table_records(substitution_file)? {
            let record = record?;
            if record.len() < 5 {
                continue;
            }
            let mut row = [0.0f64; 4];
            for (i, slot) in row.iter_mut().enumerate() {
                *slot = record[i + 1]
                    .parse()
                    .map_err(|_| MutabilityError::BadNumber {
                        field: record[i + 1].to_string(),
                    })?;
            }
            substitution.insert(record[0].to_uppercase(), row);
        }

        Self::from_tables(mutability, substitution, splits)
    }

    /// The k-mer context around `pos`, padded with `N` at sequence edges and
    /// chain-split boundaries.
    fn context(&self, sequence: &str, pos: usize) -> String {
        let half = (self.k / 2) as isize;
        let chars: Vec<char> = sequence.chars().collect();
        let (lo, hi) = self.segment_bounds(pos, chars.len());
        (-half..=half)
            .map(|offset| {
                let j = pos as isize + offset;
                if j < lo as isize || j >= hi as isize {
                    'N'
                } else {
                    chars[j as usize]
                }
            })
            .collect()
    }

    /// Bounds of the chain segment containing `pos`.
    fn segment_bounds(&self, pos: usize, len: usize) -> (usize, usize) {
        let mut lo = 0;
        let mut hi = len;
        for split in &self.splits {
            if pos < *split {
                hi = hi.min(*split);
            } else {
                lo = lo.max(*split);
            }
        }
        (lo, hi)
    }

    /// Mutability of a context, averaging over the concrete contexts an
    /// ambiguous one covers.
    fn mutability_of(&self, context: &str) -> f64 {
        if let Some(value) = self.mutability.get(context) {
            return *value;
        }
        let values: Vec<f64> = resolutions(context)
            .filter_map(|concrete| self.mutability.get(&concrete).copied())
            .collect();
        if values.is_empty() {
            warn!("context {:?} missing from mutability table", context);
            return PROBABILITY_FLOOR;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Probability of substituting the context's center base by `target`.
    fn substitution_of(&self, context: &str, target: char) -> f64 {
        let Some(column) = base_index(target) else {
            return PROBABILITY_FLOOR;
        };
        if let Some(row) = self.substitution.get(context) {
            return row[column];
        }
        let values: Vec<f64> = resolutions(context)
            .filter_map(|concrete| self.substitution.get(&concrete).map(|row| row[column]))
            .collect();
        if values.is_empty() {
            warn!("context {:?} missing from substitution table", context);
            return PROBABILITY_FLOOR;
        }
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Negative log-probability of the substitutions along one edge.
    pub fn edge_penalty(&self, parent: &str, child: &str) -> f64 {
        let mut penalty = 0.0;
        for (pos, (a, b)) in parent.chars().zip(child.chars()).enumerate() {
            if a == b {
                continue;
            }
            let context = self.context(parent, pos);
            let mutability = self.mutability_of(&context).max(PROBABILITY_FLOOR);
            let substitution = self.substitution_of(&context, b).max(PROBABILITY_FLOOR);
            penalty -= mutability.ln() + substitution.ln();
        }
        penalty
    }
}

fn table_records(
    path: &Path,
) -> Result<impl Iterator<Item = Result<csv::StringRecord, csv::Error>>, MutabilityError> {
    let reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    Ok(reader.into_records())
}

// -------------------------------------------------------------------------------------------------
// Weight algebra.

/// Mutability parsimony on the history DAG: the model's edge penalty summed
/// over tree edges. Without a model every edge weighs zero, which is the
/// placeholder used when no tables were supplied.
pub struct MutabilityParsimony {
    model: Option<MutationModel>,
}

impl MutabilityParsimony {
    pub fn new(model: MutationModel) -> Self {
        MutabilityParsimony { model: Some(model) }
    }

    pub fn disabled() -> Self {
        MutabilityParsimony { model: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_some()
    }
}

impl WeightAlgebra for MutabilityParsimony {
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
        let Some(model) = &self.model else {
            return Ok(StableFloat::zero());
        };
        Ok(match (dag.label(parent), dag.label(child)) {
            (Some(a), Some(b)) => StableFloat::from_f64(model.edge_penalty(&a.sequence, &b.sequence)),
            _ => StableFloat::zero(),
        })
    }

    fn accum(&self, weights: Vec<StableFloat>) -> StableFloat {
        StableFloat::sum(weights)
    }
}

// -------------------------------------------------------------------------------------------------
// Errors.

#[derive(Error, Debug)]
pub enum MutabilityError {
    #[error("mutability table is empty")]
    EmptyTable,
    #[error("mutation model motifs must have a common odd length, got {k}")]
    BadMotifLength { k: usize },
    #[error("malformed numeric field {field:?} in mutation model table")]
    BadNumber { field: String },
    #[error("error reading mutation model table")]
    CsvError(#[from] csv::Error),
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_model(splits: Vec<usize>) -> MutationModel {
        // All 3-mer contexts over {A,C,G,T,N} with mutability 0.5 and uniform
        // substitution rows.
        let mut mutability = HashMap::new();
        let mut substitution = HashMap::new();
        let alphabet = ['A', 'C', 'G', 'T', 'N'];
        for a in alphabet {
            for b in alphabet {
                for c in alphabet {
                    let motif: String = [a, b, c].into_iter().collect();
                    mutability.insert(motif.clone(), 0.5);
                    substitution.insert(motif, [0.25; 4]);
                }
            }
        }
        MutationModel::from_tables(mutability, substitution, splits).unwrap()
    }

    #[test]
    fn context_pads_sequence_edges_with_n() {
        let model = uniform_model(vec![]);
        assert_eq!(model.context("ACGT", 0), "NAC");
        assert_eq!(model.context("ACGT", 3), "GTN");
        assert_eq!(model.context("ACGT", 2), "CGT");
    }

    #[test]
    fn chain_split_is_a_context_boundary() {
        let model = uniform_model(vec![2]);
        // Position 1 is the last base of the first chain; position 2 opens
        // the second chain.
        assert_eq!(model.context("ACGT", 1), "ACN");
        assert_eq!(model.context("ACGT", 2), "NGT");
    }

    #[test]
    fn penalty_counts_each_substitution() {
        let model = uniform_model(vec![]);
        let single = model.edge_penalty("AAAA", "AACA");
        let double = model.edge_penalty("AAAA", "AACC");
        let expected_single = -(0.5f64.ln() + 0.25f64.ln());
        assert!((single - expected_single).abs() < 1e-12);
        assert!((double - 2.0 * expected_single).abs() < 1e-12);
        assert_eq!(model.edge_penalty("AAAA", "AAAA"), 0.0);
    }

    #[test]
    fn ambiguous_contexts_average_known_rows() {
        let mut mutability = HashMap::new();
        mutability.insert("AAA".to_string(), 0.2);
        mutability.insert("AAC".to_string(), 0.4);
        let mut substitution = HashMap::new();
        substitution.insert("AAA".to_string(), [0.0, 0.5, 0.25, 0.25]);
        substitution.insert("AAC".to_string(), [0.0, 0.5, 0.25, 0.25]);
        let model = MutationModel::from_tables(mutability, substitution, vec![]).unwrap();
        // Context "AAM" covers AAA and AAC.
        assert!((model.mutability_of("AAM") - 0.3).abs() < 1e-12);
    }
}
