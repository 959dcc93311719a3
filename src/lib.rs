// Licensed under the MIT license
// (see LICENSE or <http://opensource.org/licenses/MIT>) All files in the project carrying such
// notice may not be copied, modified, or distributed except according to those terms.

//! # Branching-process phylogenetics for B-cell receptor lineages
//!
//! This library models an observed, genotype-collapsed lineage tree as the
//! outcome of a two-parameter Galton–Watson branching process with mutation,
//! and selects, among candidate trees produced by an external parsimony
//! program, those that maximize the branching-process likelihood under
//! additional tie-breaking criteria.
//!
//! ## What is contained in this code
//!
//! - a memoized likelihood evaluator for the "spaceship distribution"
//!   `P(c, m | p, q)` with analytic gradients ([LlKernel]), and a bounded
//!   quasi-Newton MLE on top of it,
//! - the collapse normalizer turning raw trees into canonical
//!   [CollapsedTree]s and their `(c, m)` sufficient statistics,
//! - a history DAG over many candidate trees supporting counting, weight
//!   aggregation under composable algebras, trimming to optimal-weight
//!   subsets, and sampling ([HistoryDag]),
//! - the [CollapsedForest] facade tying these together: likelihood, MLE,
//!   ranking by likelihood plus isotype/mutability/allele criteria, and
//!   validated tree extraction.
//!
//! File decoding (PHYLIP, FASTA), the dnapars driver, and rendering are
//! external collaborators; the CLI in this crate operates on
//! bincode-serialized forests.
//!
//! ## Rust API
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use gwtree::{CollapsedForest, FilterOptions, RawNode, RawTree};
//!
//! fn main() {
//!     // Candidate trees arrive from an external parsimony program.
//!     let mut tree = RawTree::new(RawNode::new("seq1", "GAGGTGCAGCTG", 0));
//!     tree.add_child(0, RawNode::new("seq2", "GAGGTGCAGCTA", 0));
//!     tree.add_child(0, RawNode::new("seq3", "GAGGTGCACCTG", 0));
//!
//!     let abundances: HashMap<String, u32> = [
//!         ("GAGGTGCAGCTG".to_string(), 10),
//!         ("GAGGTGCAGCTA".to_string(), 4),
//!         ("GAGGTGCACCTG".to_string(), 1),
//!     ]
//!     .into_iter()
//!     .collect();
//!
//!     let mut forest = CollapsedForest::from_trees(&[tree], &abundances).unwrap();
//!     let (p, q) = forest.mle(true).unwrap();
//!     println!("fit parameters: ({}, {})", p, q);
//!
//!     let (best_trees, weights) = forest
//!         .filter_trees(&FilterOptions::default(), None, None)
//!         .unwrap();
//!     println!(
//!         "{} best trees with log-likelihood {}",
//!         best_trees.n_trees(),
//!         weights.log_likelihood
//!     );
//! }
//! ```

pub mod cli;
pub mod read_write_utils;
pub mod utils;

pub mod sequence;
pub use sequence::{Disambiguate, MinDistanceDisambiguator};

mod likelihood;
pub use likelihood::mle::mle;
pub use likelihood::{ll_tree, CmCounts, CmPair, Gradient, LikelihoodError, LlKernel};

mod tree;
pub use tree::{
    simulate, simulate_genotype, CollapseError, CollapsedTree, CompareError, NodeName, RawNode,
    RawTree, TreeNode,
};

pub mod history_dag;
pub use history_dag::{DagError, HistoryDag, Label};

mod isotype;
pub use isotype::{Isotype, IsotypeError, IsotypeMap, IsotypeOrder, IsotypeParsimony};

mod mutability;
pub use mutability::{MutabilityError, MutabilityParsimony, MutationModel};

mod forest;
pub use forest::{
    CollapsedForest, FilterOptions, ForestError, RankedWeights, RankingChoices, RankingConfig,
    RankingConfigBuilder, RankingConfigError, ValidationStats,
};
