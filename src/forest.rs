//! A collection of candidate trees over one set of observed genotypes.
//!
//! A [CollapsedForest] is backed either by a history DAG built from input
//! parsimony trees, or by a list of simulated collapsed trees. It exposes the
//! joint and marginal branching-process likelihood, maximum-likelihood
//! fitting of `(p, q)`, ranking and trimming of the DAG under auxiliary
//! criteria ([CollapsedForest::filter_trees]), and extraction of individual
//! trees with validation against the invariants recorded at construction.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;

use log::{debug, info, warn};
use logging_timer::stime;
use ordered_float::OrderedFloat;
use primitive_types::U256;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history_dag::algebras::{AlleleCount, CmCounter, LlGenotype, StableFloat};
use crate::history_dag::{builder, DagError, HistoryDag, UNNAMED_SEQ};
use crate::isotype::{IsotypeError, IsotypeOrder, IsotypeParsimony};
use crate::likelihood::{self, CmCounts, Gradient, LikelihoodError, LlKernel};
use crate::mutability::{MutabilityParsimony, MutationModel};
use crate::sequence::{base_options, is_ambiguous, Disambiguate, MinDistanceDisambiguator};
use crate::tree::{simulate, CollapseError, CollapsedTree, RawTree};

mod config;
pub use config::{RankingChoices, RankingConfig, RankingConfigBuilder, RankingConfigError};

// -------------------------------------------------------------------------------------------------
// Main structs.

/// Invariants recorded from the first input tree; every tree extracted from
/// the DAG is validated against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStats {
    root_name: String,
    /// Expected abundance per observed genotype name, root included.
    counts: HashMap<String, u32>,
    parsimony_score: u32,
    /// The (possibly ambiguous) root sequence.
    root_sequence: String,
    /// Leaf sequence to leaf name, absent when observed sequences carried
    /// ambiguity codes.
    leaf_seqs: Option<HashMap<String, String>>,
}

/// A collection of trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollapsedForest {
    dag: Option<HistoryDag>,
    ctrees: Option<Vec<CollapsedTree>>,
    validation: Option<ValidationStats>,
    /// CM classes with multiplicities; derived data, rebuilt on demand and
    /// deliberately excluded from serialization.
    #[serde(skip)]
    cm_classes: Option<Vec<(CmCounts, U256)>>,
    /// Fit branching-process parameters, once `mle` has run.
    pub parameters: Option<(f64, f64)>,
    is_isotyped: bool,
}

/// The combined ranking weight of one history: log-likelihood, isotype
/// parsimony, mutability parsimony, allele count.
pub type WeightTuple = (StableFloat, u32, StableFloat, u32);

/// Ranking weights of a history, with observable float views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedWeights {
    pub log_likelihood: f64,
    pub isotype_parsimony: u32,
    pub mutability_parsimony: f64,
    pub alleles: u32,
}

impl RankedWeights {
    fn from_tuple(tuple: &WeightTuple) -> Self {
        RankedWeights {
            log_likelihood: tuple.0.value(),
            isotype_parsimony: tuple.1,
            mutability_parsimony: tuple.2.value(),
            alleles: tuple.3,
        }
    }
}

/// Options for [CollapsedForest::filter_trees].
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Coefficients for isotype parsimony, mutability parsimony, and allele
    /// count; log-likelihood gets coefficient −1. Without coefficients,
    /// ranking is lexicographic.
    pub ranking_coeffs: Option<Vec<f64>>,
    pub mutation_model: Option<MutationModel>,
    pub ignore_isotype: bool,
}

impl CollapsedForest {
    /// Build a forest from parsimony trees, using the default ambiguity
    /// resolver.
    pub fn from_trees(
        trees: &[RawTree],
        abundances: &HashMap<String, u32>,
    ) -> Result<Self, ForestError> {
        Self::from_trees_with(trees, abundances, &MinDistanceDisambiguator)
    }

    /// Build a forest from parsimony trees with an explicit ambiguity
    /// resolver.
    #[stime("debug")]
    pub fn from_trees_with(
        trees: &[RawTree],
        abundances: &HashMap<String, u32>,
        resolver: &dyn Disambiguate,
    ) -> Result<Self, ForestError> {
        if trees.is_empty() {
            return Err(ForestError::EmptyTreeList);
        }
        let validation = ValidationStats::from_first_tree(&trees[0], abundances, resolver);
        let dag = builder::build_dag(trees, abundances, resolver)?;
        info!("history DAG holds {} trees", dag.count_histories());
        Ok(CollapsedForest {
            dag: Some(dag),
            ctrees: None,
            validation: Some(validation),
            cm_classes: None,
            parameters: None,
            is_isotyped: false,
        })
    }

    /// Simulate a forest of collapsed trees.
    pub fn simulate<R: Rng + ?Sized>(
        p: f64,
        q: f64,
        n_trees: usize,
        rng: &mut R,
    ) -> Result<Self, ForestError> {
        if n_trees == 0 {
            return Err(ForestError::EmptyTreeList);
        }
        let mut ctrees = Vec::with_capacity(n_trees);
        for _ in 0..n_trees {
            ctrees.push(simulate(p, q, rng)?);
        }
        Ok(CollapsedForest {
            dag: None,
            ctrees: Some(ctrees),
            validation: None,
            cm_classes: None,
            parameters: None,
            is_isotyped: false,
        })
    }

    /// Number of trees in the forest.
    pub fn n_trees(&self) -> U256 {
        match (&self.dag, &self.ctrees) {
            (Some(dag), _) => dag.count_histories(),
            (None, Some(ctrees)) => U256::from(ctrees.len()),
            (None, None) => U256::zero(),
        }
    }

    pub fn dag(&self) -> Option<&HistoryDag> {
        self.dag.as_ref()
    }

    // ---------------------------------------------------------------------------------------------
    // Likelihood and MLE.

    /// Log likelihood of `(p, q)` given the forest.
    ///
    /// With `marginal` the likelihood marginalizes over trees,
    /// `log(Σᵢ P(Tᵢ | p, q))`; otherwise it is the joint sum.
    pub fn ll(&mut self, p: f64, q: f64, marginal: bool) -> Result<(f64, Gradient), ForestError> {
        self.ensure_cm_classes()?;
        let classes = self.cm_classes.as_ref().expect("cm classes just built");
        let mut kernel = LlKernel::new(p, q)?;
        Ok(forest_ll(&mut kernel, classes, marginal)?)
    }

    /// Maximum likelihood estimate of `(p, q)`, stored on the forest.
    #[stime("debug")]
    pub fn mle(&mut self, marginal: bool) -> Result<(f64, f64), ForestError> {
        self.ensure_cm_classes()?;
        let classes = self.cm_classes.clone().expect("cm classes just built");
        let mut kernel = LlKernel::new(0.5, 0.5)?;
        let fit = likelihood::mle::mle(|p, q| {
            kernel.set_params(p, q)?;
            forest_ll(&mut kernel, &classes, marginal)
        })?;
        info!("fit branching process parameters (p, q) = {:?}", fit);
        self.parameters = Some(fit);
        Ok(fit)
    }

    /// CM classes with multiplicities, built from the DAG's CM counter
    /// (which applies the root pseudocount on the universal-ancestor edge)
    /// or from the simulated trees.
    fn ensure_cm_classes(&mut self) -> Result<(), ForestError> {
        if self.cm_classes.is_some() {
            return Ok(());
        }
        let classes = if let Some(dag) = &self.dag {
            let counters = dag.weight_count(&CmCounter)?;
            counters
                .into_iter()
                .map(|(mset, count)| (mset.into_iter().collect(), count))
                .collect()
        } else if let Some(ctrees) = &self.ctrees {
            let mut counter: HashMap<CmCounts, U256> = HashMap::new();
            for tree in ctrees {
                let entry = counter
                    .entry(tree.cm_counts().clone())
                    .or_insert_with(U256::zero);
                *entry = entry.saturating_add(U256::one());
            }
            counter.into_iter().collect()
        } else {
            return Err(ForestError::EmptyTreeList);
        };
        self.cm_classes = Some(classes);
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Isotype annotation.

    /// Stamp observed isotype maps onto the DAG: leaves from the cell-level
    /// isotype map (through the optional name-to-cells id map), internal
    /// nodes as the key-wise max over the leaves below them.
    pub fn add_isotypes(
        &mut self,
        isotype_map: &HashMap<String, String>,
        id_map: Option<&HashMap<String, BTreeSet<String>>>,
        order: &IsotypeOrder,
    ) -> Result<(), ForestError> {
        let dag = self.dag.as_mut().ok_or(ForestError::RequiresDag)?;

        for leaf in dag.leaf_ids().collect::<Vec<_>>() {
            let cells: BTreeSet<String> = match id_map {
                Some(map) => dag
                    .attr(leaf)
                    .original_ids
                    .iter()
                    .flat_map(|seq_id| {
                        map.get(seq_id).cloned().unwrap_or_default().into_iter()
                    })
                    .collect(),
                None => dag.attr(leaf).original_ids.clone(),
            };
            let observed = crate::isotype::observed_isotypes(&cells, isotype_map, order)?;
            dag.attr_mut(leaf).isotype = observed;
        }

        // Internal observed maps are fixed by the leaf set below each node.
        let mut leaf_isotypes = HashMap::new();
        for leaf in dag.leaf_ids() {
            if let Some(label) = dag.label(leaf) {
                leaf_isotypes.insert(label.clone(), dag.attr(leaf).isotype.clone());
            }
        }
        for id in dag.node_ids().collect::<Vec<_>>() {
            if dag.is_leaf(id) || dag.is_ua(id) {
                continue;
            }
            let mut merged = crate::isotype::IsotypeMap::new();
            for label in dag.clade_union(id) {
                if let Some(map) = leaf_isotypes.get(&label) {
                    crate::isotype::merge_isotype_maps(&mut merged, map);
                }
            }
            dag.attr_mut(id).isotype = merged;
        }

        self.is_isotyped = true;
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Ranking.

    /// Trim the forest to the histories optimizing branching-process
    /// likelihood plus auxiliary penalties.
    ///
    /// With ranking coefficients `(a_iso, a_mut, a_all)` the minimized score
    /// is `−ℓℓ + a_iso·iso + a_mut·mut + a_all·alleles`; without them the
    /// ranking is lexicographic over `(−ℓℓ, iso, mut, alleles)`. Optional
    /// writers receive the forest summary block and the per-tree stats table.
    #[stime("debug")]
    pub fn filter_trees(
        &mut self,
        options: &FilterOptions,
        mut summary: Option<&mut dyn Write>,
        mut tree_stats: Option<&mut dyn Write>,
    ) -> Result<(CollapsedForest, RankedWeights), ForestError> {
        if let Some(coeffs) = &options.ranking_coeffs {
            if coeffs.len() != 3 {
                return Err(ForestError::BadRankingCoefficients { got: coeffs.len() });
            }
        }
        if self.parameters.is_none() {
            self.mle(true)?;
        }
        let (p, q) = self.parameters.expect("parameters fit above");
        let dag = self.dag.as_ref().ok_or(ForestError::RequiresDag)?;

        let iso_enabled = self.is_isotyped && !options.ignore_isotype;
        let isotype = if iso_enabled {
            info!("isotype parsimony will be used as a ranking criterion");
            self.warn_on_missing_isotypes(dag);
            IsotypeParsimony::new()
        } else {
            IsotypeParsimony::disabled()
        };
        let mut_enabled = options.mutation_model.is_some();
        let mutability = match options.mutation_model.clone() {
            Some(model) => {
                info!("mutation model parsimony will be used as a ranking criterion");
                MutabilityParsimony::new(model)
            }
            None => MutabilityParsimony::disabled(),
        };
        let algebra = (LlGenotype::new(p, q)?, isotype, mutability, AlleleCount);

        let coeffs = options.ranking_coeffs.clone();
        let score = move |w: &WeightTuple| -> Option<OrderedFloat<f64>> {
            coeffs.as_ref().map(|c| {
                OrderedFloat(
                    -w.0.value()
                        + c[0] * f64::from(w.1)
                        + c[1] * w.2.value()
                        + c[2] * f64::from(w.3),
                )
            })
        };
        let cmp = |a: &WeightTuple, b: &WeightTuple| match (score(a), score(b)) {
            (Some(sa), Some(sb)) => sa.cmp(&sb),
            _ => {
                let key = |w: &WeightTuple| {
                    (OrderedFloat(-w.0.value()), w.1, w.2.clone(), w.3)
                };
                key(a).cmp(&key(b))
            }
        };

        let mut trimmed = dag.clone();
        trimmed.trim_optimal_weight(&algebra, &cmp)?;

        // Make sure trimming worked as expected.
        let remaining = trimmed.weight_count(&algebra)?;
        let mut tuples: Vec<&WeightTuple> = remaining.keys().collect();
        tuples.sort_by(|a, b| cmp(a, b));
        if tuples
            .windows(2)
            .any(|pair| cmp(pair[0], pair[1]) != std::cmp::Ordering::Equal)
        {
            let scores: Vec<RankedWeights> =
                tuples.iter().map(|t| RankedWeights::from_tuple(t)).collect();
            return Err(ForestError::FilterInconsistent {
                weights: format!("{:?}", scores),
            });
        }

        let best = trimmed.optimal_weight_annotate(&algebra, &cmp)?;
        debug!(
            "optimal weight tuple after trimming: {:?}",
            RankedWeights::from_tuple(&best)
        );

        if let Some(writer) = summary.as_deref_mut() {
            self.write_summary(
                writer,
                dag,
                &algebra,
                (p, q),
                &best,
                iso_enabled,
                mut_enabled,
            )?;
        }
        if let Some(writer) = tree_stats.as_deref_mut() {
            write_tree_stats(
                writer,
                dag,
                &algebra,
                &|a, b| cmp(a, b),
                &|w| score(w).map(OrderedFloat::into_inner),
            )?;
        }

        let trimmed_forest = CollapsedForest {
            dag: Some(trimmed),
            ctrees: None,
            validation: self.validation.clone(),
            cm_classes: None,
            parameters: self.parameters,
            is_isotyped: self.is_isotyped,
        };
        Ok((trimmed_forest, RankedWeights::from_tuple(&best)))
    }

    fn warn_on_missing_isotypes(&self, dag: &HistoryDag) {
        let root_name = self
            .validation
            .as_ref()
            .map(|stats| stats.root_name.clone());
        let missing = dag.leaf_ids().any(|leaf| {
            dag.attr(leaf).isotype.is_empty()
                && dag.attr(leaf).name.as_deref() != root_name.as_deref()
        });
        if missing {
            warn!("some isotype data seems to be missing; isotype parsimony scores may be incorrect");
        }
    }

    /// Per auxiliary metric, the achievable range of every other metric when
    /// that metric is optimized alone.
    #[allow(clippy::too_many_arguments)]
    fn write_summary(
        &self,
        writer: &mut dyn Write,
        dag: &HistoryDag,
        algebra: &(LlGenotype, IsotypeParsimony, MutabilityParsimony, AlleleCount),
        params: (f64, f64),
        best: &WeightTuple,
        iso_enabled: bool,
        mut_enabled: bool,
    ) -> Result<(), ForestError> {
        let metrics = enabled_metrics(iso_enabled, mut_enabled);
        writeln!(writer, "Parameters: {:?}", params)?;

        let mut independent_best: Vec<f64> = Vec::new();
        for (index, name) in &metrics {
            for maximize in [false, true] {
                let mut tempdag = dag.clone();
                let optimum =
                    tempdag.trim_optimal_weight(algebra, &component_cmp(*index, maximize))?;
                let opt_value = component_value(&optimum, *index);
                if (*index == 0) == maximize {
                    // Optimizing this metric alone: max for likelihood, min
                    // for the penalties.
                    independent_best.push(opt_value);
                }
                writeln!(
                    writer,
                    "\nAmong trees with {} {} of: {}",
                    if maximize { "max" } else { "min" },
                    name,
                    format_metric(&optimum, *index)
                )?;
                for (other, other_name) in &metrics {
                    if other == index {
                        continue;
                    }
                    let low = tempdag.optimal_weight_annotate(algebra, &component_cmp(*other, false))?;
                    let high = tempdag.optimal_weight_annotate(algebra, &component_cmp(*other, true))?;
                    writeln!(
                        writer,
                        "\t{} range: {} to {}",
                        other_name,
                        format_metric(&low, *other),
                        format_metric(&high, *other)
                    )?;
                }
            }
        }

        writeln!(writer, "\nHighest ranked tree: loss from best value")?;
        for ((index, name), best_alone) in metrics.iter().zip(independent_best) {
            writeln!(
                writer,
                "\t{}: {:.6}",
                name,
                component_value(best, *index) - best_alone
            )?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Tree extraction.

    /// Sample a random tree from the forest.
    pub fn sample_tree<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<CollapsedTree, ForestError> {
        if let Some(ctrees) = &self.ctrees {
            let choice = rng.gen_range(0..ctrees.len());
            return Ok(ctrees[choice].clone());
        }
        let dag = self.dag.as_ref().ok_or(ForestError::EmptyTreeList)?;
        let raw = dag.sample(rng)?;
        self.collapse_and_validate(&raw)
    }

    /// Iterate over every tree of the forest, collapsing and validating each.
    pub fn iter_trees(
        &self,
    ) -> Box<dyn Iterator<Item = Result<CollapsedTree, ForestError>> + '_> {
        if let Some(ctrees) = &self.ctrees {
            return Box::new(ctrees.iter().cloned().map(Ok));
        }
        match &self.dag {
            Some(dag) => Box::new(
                dag.histories()
                    .map(move |raw| self.collapse_and_validate(&raw)),
            ),
            None => Box::new(std::iter::empty()),
        }
    }

    /// Collapse a history extracted from the DAG and validate it against the
    /// stored invariants.
    pub fn collapse_and_validate(&self, raw: &RawTree) -> Result<CollapsedTree, ForestError> {
        let ctree = CollapsedTree::from_raw(raw, false)?;

        // Names and sequences must biject over the nodes.
        let mut names = BTreeSet::new();
        let mut seqs = BTreeSet::new();
        for node in ctree.nodes() {
            names.insert(node.name.clone());
            seqs.insert(node.sequence.clone());
        }
        if names.len() != ctree.node_count() || seqs.len() != ctree.node_count() {
            return Err(ForestError::NameSequenceBijection {
                nodes: ctree.node_count(),
                names: names.len(),
                sequences: seqs.len(),
            });
        }

        for node in ctree.nodes() {
            if node.name.contains(UNNAMED_SEQ) {
                return Err(ForestError::UnnamedSequence);
            }
        }

        let Some(stats) = &self.validation else {
            warn!("no validation was performed on tree");
            return Ok(ctree);
        };

        if !ctree.root().name.contains(&stats.root_name) {
            return Err(ForestError::RootNameMismatch {
                expected: stats.root_name.clone(),
                found: ctree.root().name.to_string(),
            });
        }

        // Abundances match the recorded counts, both per pre-collapse leaf
        // and per collapsed node.
        for id in raw.leaf_ids() {
            let leaf = raw.node(id);
            let expected: u32 = leaf
                .original_ids
                .iter()
                .map(|og| stats.counts.get(og).copied().unwrap_or(0))
                .sum();
            if expected != leaf.abundance || !leaf.original_ids.contains(&leaf.name) {
                return Err(ForestError::AbundanceMismatch {
                    name: leaf.name.clone(),
                    expected,
                    found: leaf.abundance,
                });
            }
        }
        let mut total = 0u32;
        for node in ctree.nodes() {
            total += node.abundance;
            match node.name.as_single() {
                Some(name) if stats.counts.contains_key(name) => {
                    let expected: u32 = node
                        .original_ids
                        .iter()
                        .map(|og| stats.counts.get(og).copied().unwrap_or(0))
                        .sum();
                    if expected != node.abundance || !node.original_ids.contains(name) {
                        return Err(ForestError::AbundanceMismatch {
                            name: name.to_string(),
                            expected,
                            found: node.abundance,
                        });
                    }
                }
                _ => {
                    if node.abundance != 0 {
                        return Err(ForestError::AbundanceMismatch {
                            name: node.name.to_string(),
                            expected: 0,
                            found: node.abundance,
                        });
                    }
                }
            }
        }
        let expected_total: u32 = stats.counts.values().sum();
        if total != expected_total {
            return Err(ForestError::AbundanceMismatch {
                name: "<total>".to_string(),
                expected: expected_total,
                found: total,
            });
        }

        if ctree.parsimony_score() != stats.parsimony_score {
            return Err(ForestError::ParsimonyMismatch {
                expected: stats.parsimony_score,
                found: ctree.parsimony_score(),
            });
        }

        // The root sequence must be a resolution of the recorded one.
        let root_seq = &ctree.root().sequence;
        let compatible = root_seq.len() == stats.root_sequence.len()
            && root_seq
                .chars()
                .zip(stats.root_sequence.chars())
                .all(|(base, ambig)| base_options(ambig).contains(&base));
        if !compatible {
            return Err(ForestError::RootSequenceMismatch {
                expected: stats.root_sequence.clone(),
                found: root_seq.clone(),
            });
        }

        if let Some(leaf_seqs) = &stats.leaf_seqs {
            for id in ctree.node_ids().skip(1) {
                let node = ctree.node(id);
                if node.abundance == 0 {
                    continue;
                }
                match leaf_seqs.get(&node.sequence) {
                    Some(expected) if node.name.contains(expected) => {}
                    _ => {
                        return Err(ForestError::LeafNameMismatch {
                            sequence: node.sequence.clone(),
                            found: node.name.to_string(),
                        })
                    }
                }
            }
            let observed_seqs: BTreeSet<&String> = ctree
                .node_ids()
                .skip(1)
                .filter(|id| ctree.node(*id).abundance > 0)
                .map(|id| &ctree.node(id).sequence)
                .collect();
            let nonroot_leaf_seqs: BTreeSet<&String> = leaf_seqs
                .keys()
                .filter(|seq| **seq != ctree.root().sequence)
                .collect();
            let observed_nonroot: BTreeSet<&String> = observed_seqs
                .into_iter()
                .filter(|seq| **seq != ctree.root().sequence)
                .collect();
            if nonroot_leaf_seqs != observed_nonroot {
                return Err(ForestError::LeafNameMismatch {
                    sequence: "<leaf set>".to_string(),
                    found: "observed non-root sequences differ from recorded leaf sequences"
                        .to_string(),
                });
            }
        }

        Ok(ctree)
    }
}

// -------------------------------------------------------------------------------------------------
// Validation stats.

impl ValidationStats {
    fn from_first_tree(
        tree: &RawTree,
        abundances: &HashMap<String, u32>,
        resolver: &dyn Disambiguate,
    ) -> Self {
        let mut model = tree.clone();
        for id in model.node_ids() {
            let observable = id == model.root_id() || model.is_leaf(id);
            let node = model.node_mut(id);
            node.abundance = if observable {
                abundances.get(&node.sequence).copied().unwrap_or(0)
            } else {
                0
            };
        }

        let root_sequence = model.root().sequence.clone();
        let any_ambiguous_leaf = model
            .leaf_ids()
            .any(|id| is_ambiguous(&model.node(id).sequence));
        let leaf_seqs = (!any_ambiguous_leaf).then(|| {
            model
                .leaf_ids()
                .map(|id| {
                    let node = model.node(id);
                    (node.sequence.clone(), node.name.clone())
                })
                .collect()
        });

        // Resolve ambiguities, then score parsimony on the resolved tree.
        for id in model.preorder() {
            let parent_seq = model.parent(id).map(|p| model.node(p).sequence.clone());
            let resolved = resolver.resolve(parent_seq.as_deref(), &model.node(id).sequence);
            model.node_mut(id).sequence = resolved;
        }
        let parsimony_score: u32 = model
            .node_ids()
            .skip(1)
            .map(|id| {
                let parent = model.parent(id).expect("non-root node has a parent");
                crate::sequence::hamming_distance(
                    &model.node(id).sequence,
                    &model.node(parent).sequence,
                )
            })
            .sum();

        let mut counts: HashMap<String, u32> = model
            .leaf_ids()
            .map(|id| (model.node(id).name.clone(), model.node(id).abundance))
            .collect();
        counts.insert(model.root().name.clone(), model.root().abundance);

        ValidationStats {
            root_name: model.root().name.clone(),
            counts,
            parsimony_score,
            root_sequence,
            leaf_seqs,
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Likelihood over CM classes.

/// Forest likelihood over CM classes. The kernel is bulk-filled once, then
/// classes evaluate in parallel against the read-only table.
fn forest_ll(
    kernel: &mut LlKernel,
    classes: &[(CmCounts, U256)],
    marginal: bool,
) -> Result<(f64, Gradient), LikelihoodError> {
    let (mut max_c, mut max_m) = (0, 0);
    for (cm_counts, _) in classes {
        for ((c, m), _) in cm_counts {
            max_c = max_c.max(*c);
            max_m = max_m.max(*m);
        }
    }
    kernel.fill(max_c, max_m);
    let kernel = &*kernel;

    let terms: Vec<(f64, Gradient, f64)> = classes
        .par_iter()
        .map(|(cm_counts, count)| {
            let mut ll = 0.0;
            let mut grad = [0.0, 0.0];
            for ((c, m), n) in cm_counts {
                let (cell_ll, cell_grad) = kernel.ll_genotype_cached(*c, *m)?;
                let n = f64::from(*n);
                ll += n * cell_ll;
                grad[0] += n * cell_grad[0];
                grad[1] += n * cell_grad[1];
            }
            Ok((ll, grad, u256_to_f64(*count)))
        })
        .collect::<Result<_, LikelihoodError>>()?;

    if marginal {
        let shift = terms
            .iter()
            .map(|(ll, _, _)| *ll)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut weight_sum = 0.0;
        let mut count_sum = 0.0;
        let mut grad = [0.0, 0.0];
        for (ll, g, n) in &terms {
            let weight = n * (ll - shift).exp();
            weight_sum += weight;
            count_sum += n;
            grad[0] += weight * g[0];
            grad[1] += weight * g[1];
        }
        grad[0] /= weight_sum;
        grad[1] /= weight_sum;
        Ok((weight_sum.ln() + shift - count_sum.ln(), grad))
    } else {
        let mut ll = 0.0;
        let mut grad = [0.0, 0.0];
        for (cell_ll, g, n) in &terms {
            ll += n * cell_ll;
            grad[0] += n * g[0];
            grad[1] += n * g[1];
        }
        Ok((ll, grad))
    }
}

fn u256_to_f64(value: U256) -> f64 {
    if value.bits() <= 128 {
        value.as_u128() as f64
    } else {
        let shift = value.bits() - 64;
        ((value >> shift).as_u64() as f64) * 2f64.powi(shift as i32)
    }
}

// -------------------------------------------------------------------------------------------------
// Report helpers.

fn enabled_metrics(iso_enabled: bool, mut_enabled: bool) -> Vec<(usize, &'static str)> {
    let mut metrics = vec![(0, "Log Likelihood")];
    if iso_enabled {
        metrics.push((1, "Isotype Pars."));
    }
    if mut_enabled {
        metrics.push((2, "Mut. Pars."));
    }
    metrics.push((3, "Alleles"));
    metrics
}

fn component_value(tuple: &WeightTuple, index: usize) -> f64 {
    match index {
        0 => tuple.0.value(),
        1 => f64::from(tuple.1),
        2 => tuple.2.value(),
        _ => f64::from(tuple.3),
    }
}

fn format_metric(tuple: &WeightTuple, index: usize) -> String {
    match index {
        0 => format!("{:.6}", tuple.0.value()),
        1 => tuple.1.to_string(),
        2 => format!("{:.6}", tuple.2.value()),
        _ => tuple.3.to_string(),
    }
}

fn component_cmp(
    index: usize,
    maximize: bool,
) -> impl Fn(&WeightTuple, &WeightTuple) -> std::cmp::Ordering {
    move |a, b| {
        let ord = match index {
            0 => a.0.cmp(&b.0),
            1 => a.1.cmp(&b.1),
            2 => a.2.cmp(&b.2),
            _ => a.3.cmp(&b.3),
        };
        if maximize {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// Cap on expanded per-tree stat rows; beyond it, weight classes are written
/// with a multiplicity column instead.
const TREE_STATS_ROW_CAP: u64 = 16_384;

/// Tab-separated ranking table: index, alleles, log-likelihood, isotype
/// parsimony, mutability parsimony, and the score when coefficients were
/// given.
fn write_tree_stats(
    writer: &mut dyn Write,
    dag: &HistoryDag,
    algebra: &(LlGenotype, IsotypeParsimony, MutabilityParsimony, AlleleCount),
    cmp: &dyn Fn(&WeightTuple, &WeightTuple) -> std::cmp::Ordering,
    score: &dyn Fn(&WeightTuple) -> Option<f64>,
) -> Result<(), ForestError> {
    let counts = dag.weight_count(algebra)?;
    let mut classes: Vec<(&WeightTuple, &U256)> = counts.iter().collect();
    if classes.is_empty() {
        return Ok(());
    }
    classes.sort_by(|a, b| cmp(a.0, b.0));

    let total: U256 = classes
        .iter()
        .fold(U256::zero(), |acc, (_, n)| acc.saturating_add(**n));
    let expand = total <= U256::from(TREE_STATS_ROW_CAP);
    if !expand {
        warn!(
            "forest holds {} trees; writing per-class rows with a count column instead of \
             per-tree rows",
            total
        );
    }

    let scored = score(classes[0].0).is_some();
    let mut header = vec!["tree", "alleles", "ll", "isotype_pars", "mutability_pars"];
    if scored {
        header.push("score");
    }
    if !expand {
        header.push("count");
    }
    writeln!(writer, "{}", header.join("\t"))?;

    let mut index = 1u64;
    for (tuple, count) in classes {
        let repeats = if expand { count.as_u64() } else { 1 };
        for _ in 0..repeats {
            let mut fields = vec![
                index.to_string(),
                tuple.3.to_string(),
                format!("{:.6}", tuple.0.value()),
                tuple.1.to_string(),
                format!("{:.6}", tuple.2.value()),
            ];
            if scored {
                fields.push(format!(
                    "{:.6}",
                    score(tuple).expect("scored ranking produces a score")
                ));
            }
            if !expand {
                fields.push(count.to_string());
            }
            writeln!(writer, "{}", fields.join("\t"))?;
            index += 1;
        }
    }
    Ok(())
}

// -------------------------------------------------------------------------------------------------
// Errors.

#[derive(Error, Debug)]
pub enum ForestError {
    #[error("passed empty tree list")]
    EmptyTreeList,
    #[error("this operation requires a forest built from input trees, not simulation")]
    RequiresDag,
    #[error("ranking coefficients must have exactly 3 entries, got {got}")]
    BadRankingCoefficients { got: usize },
    #[error("filtering was not successful; after trimming these weights are represented: {weights}")]
    FilterInconsistent { weights: String },
    #[error("collapsed tree has {nodes} nodes but {names} names and {sequences} sequences")]
    NameSequenceBijection {
        nodes: usize,
        names: usize,
        sequences: usize,
    },
    #[error("some node names are missing")]
    UnnamedSequence,
    #[error("collapsed tree should have root name {expected:?} but has instead {found:?}")]
    RootNameMismatch { expected: String, found: String },
    #[error("abundance mismatch at {name:?}: expected {expected}, found {found}")]
    AbundanceMismatch {
        name: String,
        expected: u32,
        found: u32,
    },
    #[error("history DAG tree parsimony score {found} does not match expected score {expected}")]
    ParsimonyMismatch { expected: u32, found: u32 },
    #[error("history DAG root sequence {found:?} is not a resolution of {expected:?}")]
    RootSequenceMismatch { expected: String, found: String },
    #[error("history DAG tree leaf names don't match sequences (at {sequence:?}: {found})")]
    LeafNameMismatch { sequence: String, found: String },
    #[error(transparent)]
    Collapse(#[from] CollapseError),
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error(transparent)]
    Likelihood(#[from] LikelihoodError),
    #[error(transparent)]
    Isotype(#[from] IsotypeError),
    #[error("error writing report")]
    Report(#[from] std::io::Error),
}

// -------------------------------------------------------------------------------------------------
// Unit tests.
