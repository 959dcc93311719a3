//! Branching-process likelihood for collapsed trees.
//!
//! A collapsed tree is summarized by the multiset of `(c, m)` pairs over its
//! nodes, where `c` counts clonal leaves and `m` counts mutant child-clades.
//! This module evaluates the log-probability of a single `(c, m)` genotype
//! under branching probability `p` and mutation probability `q` (the
//! "spaceship distribution"), the log-likelihood of a whole CM summary, and
//! the maximum-likelihood estimate of `(p, q)`.

use thiserror::Error;

mod kernel;
pub use kernel::LlKernel;

pub mod mle;

/// One `(c, m)` entry of a CM summary: clonal leaves, mutant clades.
pub type CmPair = (u32, u32);

/// A CM summary: `(c, m)` pairs with multiplicities. The sufficient statistic
/// for the branching-process likelihood.
pub type CmCounts = Vec<(CmPair, u32)>;

/// Gradient with respect to `(p, q)`.
pub type Gradient = [f64; 2];

// -------------------------------------------------------------------------------------------------
// Per-tree likelihood.

/// Log likelihood of `(p, q)` given a CM summary, with gradient.
///
/// Pure in its CM input: two trees with identical summaries give identical
/// results for every `(p, q)`.
pub fn ll_tree(
    kernel: &mut LlKernel,
    cm_counts: &[(CmPair, u32)],
) -> Result<(f64, Gradient), LikelihoodError> {
    let mut logf = 0.0;
    let mut grad = [0.0, 0.0];
    for ((c, m), count) in cm_counts {
        let (ll, dll) = kernel.ll_genotype(*c, *m)?;
        let n = f64::from(*count);
        logf += n * ll;
        grad[0] += n * dll[0];
        grad[1] += n * dll[1];
    }
    Ok((logf, grad))
}

// -------------------------------------------------------------------------------------------------
// Numerics helpers.

/// Log of the sum of exponentials, stabilized by the max term.
pub(crate) fn logsumexp(terms: &[f64]) -> f64 {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
}

/// Softmax weights of the terms, stabilized by the max term.
pub(crate) fn softmax(terms: &[f64]) -> Vec<f64> {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = terms.iter().map(|t| (t - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

// -------------------------------------------------------------------------------------------------
// Errors.

#[derive(Error, Debug)]
pub enum LikelihoodError {
    #[error("zero likelihood event at (c, m) = ({c}, {m})")]
    ZeroLikelihood { c: u32, m: u32 },
    #[error("branching parameters must lie strictly inside the unit interval: p = {p}, q = {q}")]
    InvalidParameters { p: f64, q: f64 },
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn logsumexp_matches_naive_sum() {
        let terms: [f64; 3] = [-1.0, -2.0, -3.5];
        let naive: f64 = terms.iter().map(|t| t.exp()).sum::<f64>().ln();
        assert_relative_eq!(logsumexp(&terms), naive, max_relative = 1e-12);
    }

    #[test]
    fn softmax_weights_sum_to_one() {
        let weights = softmax(&[-100.0, -101.0, -105.0]);
        assert_relative_eq!(weights.iter().sum::<f64>(), 1.0, max_relative = 1e-12);
        assert!(weights[0] > weights[1] && weights[1] > weights[2]);
    }

    #[test]
    fn ll_tree_scales_with_multiplicity() {
        let mut kernel = LlKernel::new(0.4, 0.3).unwrap();
        let (single, grad_single) = ll_tree(&mut kernel, &[((1, 0), 1)]).unwrap();
        let (double, grad_double) = ll_tree(&mut kernel, &[((1, 0), 2)]).unwrap();
        assert_relative_eq!(double, 2.0 * single, max_relative = 1e-12);
        assert_relative_eq!(grad_double[0], 2.0 * grad_single[0], max_relative = 1e-12);
    }

    #[test]
    fn ll_tree_two_mutant_leaves_closed_form() {
        // Root with two mutant children, each a single-abundance leaf:
        // CM = {((0,2), 1), ((1,0), 2)}.
        let (p, q) = (0.4, 0.3);
        let mut kernel = LlKernel::new(p, q).unwrap();
        let (ll, _) = ll_tree(&mut kernel, &[((0, 2), 1), ((1, 0), 2)]).unwrap();
        let expected = p.ln() + 2.0 * q.ln() + 2.0 * (1.0 - p).ln();
        assert_relative_eq!(ll, expected, max_relative = 1e-12);
    }
}
