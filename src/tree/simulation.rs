//! Galton–Watson simulation of collapsed trees.
//!
//! At each would-be node the process branches with probability `p`; each of
//! the two children is independently a mutant with probability `q`. Clonal
//! descendants accumulate into the node's `c`, mutant clades into its `m` and
//! are then simulated as child subtrees at edge distance 1. Simulated trees
//! are collapsed by construction and carry no sequences.

use log::warn;
use rand::Rng;

use crate::likelihood::LikelihoodError;

use super::{CollapsedTree, NodeName, TreeNode};

/// Draw `(c, m)` for a single genotype.
///
/// Warns when `p ≥ 0.5` (supercritical): termination is no longer
/// guaranteed.
pub fn simulate_genotype<R: Rng + ?Sized>(
    p: f64,
    q: f64,
    rng: &mut R,
) -> Result<(u32, u32), LikelihoodError> {
    validate(p, q)?;
    Ok(draw_genotype(p, q, rng))
}

/// Simulate a collapsed tree run to extinction.
pub fn simulate<R: Rng + ?Sized>(
    p: f64,
    q: f64,
    rng: &mut R,
) -> Result<CollapsedTree, LikelihoodError> {
    validate(p, q)?;
    let mut nodes = Vec::new();
    build_subtree(p, q, rng, &mut nodes, None, 0);
    Ok(CollapsedTree::from_nodes_unchecked(nodes))
}

fn validate(p: f64, q: f64) -> Result<(), LikelihoodError> {
    if !(0.0..=1.0).contains(&p) || !(0.0..=1.0).contains(&q) {
        return Err(LikelihoodError::InvalidParameters { p, q });
    }
    if p >= 0.5 {
        warn!(
            "p = {} is not subcritical, tree simulations not guaranteed to terminate",
            p
        );
    }
    Ok(())
}

/// Breadth-first walk of the clonal part of the process: mutant clades
/// terminate in this view and are counted, not recursed.
fn draw_genotype<R: Rng + ?Sized>(p: f64, q: f64, rng: &mut R) -> (u32, u32) {
    let mut cumsum_clones: i64 = 0;
    let mut len_tree: i64 = 0;
    let mut c = 0u32;
    let mut m = 0u32;
    while cumsum_clones > len_tree - 1 {
        if rng.gen::<f64>() < p {
            let mutants = (0..2).filter(|_| rng.gen::<f64>() < q).count() as u32;
            m += mutants;
            cumsum_clones += i64::from(2 - mutants);
        } else {
            c += 1;
        }
        len_tree += 1;
    }
    debug_assert_eq!(cumsum_clones, len_tree - 1);
    (c, m)
}

fn build_subtree<R: Rng + ?Sized>(
    p: f64,
    q: f64,
    rng: &mut R,
    nodes: &mut Vec<TreeNode>,
    parent: Option<usize>,
    dist: u32,
) -> usize {
    let (c, m) = draw_genotype(p, q, rng);
    let id = nodes.len();
    let mut node = TreeNode::new(NodeName::Single(String::new()), String::new(), c, dist);
    node.parent = parent;
    nodes.push(node);
    for _ in 0..m {
        let child = build_subtree(p, q, rng, nodes, Some(id), 1);
        nodes[id].children.push(child);
    }
    id
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::LlKernel;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn genotypes_never_hit_the_zero_likelihood_domain() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut kernel = LlKernel::new(0.3, 0.4).unwrap();
        for _ in 0..200 {
            let (c, m) = simulate_genotype(0.3, 0.4, &mut rng).unwrap();
            assert!(
                !(c == 0 && m <= 1),
                "simulation produced impossible genotype ({}, {})",
                c,
                m
            );
            kernel.ll_genotype(c, m).unwrap();
        }
    }

    #[test]
    fn simulated_trees_have_positive_likelihood() {
        let mut rng = SmallRng::seed_from_u64(13);
        let mut kernel = LlKernel::new(0.35, 0.5).unwrap();
        for _ in 0..50 {
            let tree = simulate(0.35, 0.5, &mut rng).unwrap();
            let (ll, _) = tree.ll(&mut kernel).unwrap();
            assert!(ll.is_finite() && ll < 0.0);
        }
    }

    #[test]
    fn invalid_parameters_rejected() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(simulate_genotype(1.5, 0.5, &mut rng).is_err());
        assert!(simulate_genotype(0.4, -0.1, &mut rng).is_err());
    }
}
