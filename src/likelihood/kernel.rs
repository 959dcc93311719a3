//! Memoized evaluator for the spaceship distribution.
//!
//! `ll_genotype(c, m)` is the log-probability that a subtree rooted at a node
//! has `c` clonal leaves and `m` mutant child-clades, given branching
//! probability `p` and mutation probability `q`, together with its gradient
//! with respect to `(p, q)`.
//!
//! The recurrence is naturally recursive but its depth scales with tree size,
//! so the evaluator instead fills a 2-D table iteratively. The table only
//! ever grows: a request beyond the filled rectangle extends it by filling
//! the three missing rectangles
//!
//! ```text
//!   |1 3
//!   |X 2
//! ```
//!
//! (axes are `c` and `m`, `X` already filled) in an order that has every
//! recursive dependency present before the dependent cell is computed. The
//! final table contents therefore do not depend on the access sequence.
//!
//! The cache is keyed on `(p, q)`: changing parameters clears it. For
//! parallel use, either give each worker its own kernel or share one behind a
//! mutex after a bulk [LlKernel::fill].

use serde::{Deserialize, Serialize};

use super::{logsumexp, softmax, Gradient, LikelihoodError};

const BUG: &str = "[Bug in likelihood kernel]";

type Cell = (f64, Gradient);

/// Memoized spaceship-distribution evaluator for a fixed `(p, q)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlKernel {
    p: f64,
    q: f64,
    /// Row-major `(c, m)` table; `None` marks zero-likelihood cells.
    cells: Vec<Option<Cell>>,
    /// Exclusive bounds of the filled rectangle.
    c_dim: u32,
    m_dim: u32,
}

impl LlKernel {
    /// Constructor. Parameters must lie strictly inside the unit interval.
    pub fn new(p: f64, q: f64) -> Result<Self, LikelihoodError> {
        if !(p > 0.0 && p < 1.0 && q > 0.0 && q < 1.0) {
            return Err(LikelihoodError::InvalidParameters { p, q });
        }
        Ok(LlKernel {
            p,
            q,
            cells: Vec::new(),
            c_dim: 0,
            m_dim: 0,
        })
    }

    pub fn params(&self) -> (f64, f64) {
        (self.p, self.q)
    }

    /// Re-key the cache. A parameter change invalidates all entries.
    pub fn set_params(&mut self, p: f64, q: f64) -> Result<(), LikelihoodError> {
        if !(p > 0.0 && p < 1.0 && q > 0.0 && q < 1.0) {
            return Err(LikelihoodError::InvalidParameters { p, q });
        }
        if (p, q) != (self.p, self.q) {
            self.p = p;
            self.q = q;
            self.cells.clear();
            self.c_dim = 0;
            self.m_dim = 0;
        }
        Ok(())
    }

    /// Log-probability and gradient of the `(c, m)` genotype, growing the
    /// table as needed.
    pub fn ll_genotype(&mut self, c: u32, m: u32) -> Result<(f64, Gradient), LikelihoodError> {
        if c >= self.c_dim || m >= self.m_dim {
            self.fill(c, m);
        }
        self.cell(c, m).ok_or(LikelihoodError::ZeroLikelihood { c, m })
    }

    /// Read a value from the already-filled table without growing it.
    ///
    /// Intended for read-only sharing across workers after a bulk [fill];
    /// requesting a cell outside the filled rectangle is a caller bug.
    ///
    /// [fill]: LlKernel::fill
    pub fn ll_genotype_cached(&self, c: u32, m: u32) -> Result<(f64, Gradient), LikelihoodError> {
        assert!(
            c < self.c_dim && m < self.m_dim,
            "{} cached read at ({}, {}) outside filled bounds ({}, {})",
            BUG,
            c,
            m,
            self.c_dim,
            self.m_dim
        );
        self.cell(c, m).ok_or(LikelihoodError::ZeroLikelihood { c, m })
    }

    /// Extend the filled rectangle to include `(c, m)`.
    pub fn fill(&mut self, c: u32, m: u32) {
        let (old_c, old_m) = (self.c_dim, self.m_dim);
        let new_c = old_c.max(c + 1);
        let new_m = old_m.max(m + 1);
        if (new_c, new_m) == (old_c, old_m) {
            return;
        }

        // Re-stride the storage to the new width, then extend.
        let mut cells = vec![None; (new_c as usize) * (new_m as usize)];
        for cx in 0..old_c {
            for mx in 0..old_m {
                cells[(cx as usize) * (new_m as usize) + mx as usize] =
                    self.cells[(cx as usize) * (old_m as usize) + mx as usize];
            }
        }
        self.cells = cells;
        self.c_dim = new_c;
        self.m_dim = new_m;

        // Rectangle 1: old rows, new columns.
        for cx in 0..old_c {
            for mx in old_m..new_m {
                let cell = self.compute_cell(cx, mx);
                self.set(cx, mx, cell);
            }
        }
        // Rectangle 2: new rows, old columns.
        for mx in 0..old_m {
            for cx in old_c..new_c {
                let cell = self.compute_cell(cx, mx);
                self.set(cx, mx, cell);
            }
        }
        // Rectangle 3: new rows, new columns.
        for mx in old_m..new_m {
            for cx in old_c..new_c {
                let cell = self.compute_cell(cx, mx);
                self.set(cx, mx, cell);
            }
        }
    }

    fn cell(&self, c: u32, m: u32) -> Option<Cell> {
        self.cells[(c as usize) * (self.m_dim as usize) + m as usize]
    }

    fn set(&mut self, c: u32, m: u32, cell: Option<Cell>) {
        self.cells[(c as usize) * (self.m_dim as usize) + m as usize] = cell;
    }

    /// Evaluate one cell from its (already filled) dependencies.
    fn compute_cell(&self, c: u32, m: u32) -> Option<Cell> {
        let (p, q) = (self.p, self.q);
        if c == 0 && m <= 1 {
            // Zero-likelihood domain.
            return None;
        }
        if c == 1 && m == 0 {
            return Some(((1.0 - p).ln(), [-1.0 / (1.0 - p), 0.0]));
        }
        if c == 0 && m == 2 {
            return Some((p.ln() + 2.0 * q.ln(), [1.0 / p, 2.0 / q]));
        }

        let mut logg = Vec::new();
        let mut dlogg_dp = Vec::new();
        let mut dlogg_dq = Vec::new();

        // Asymmetric split: one clonal lineage continues, the other mutates.
        // (c, m-1) is never in the zero-likelihood domain when this branch is
        // reached, so the unwrap encodes a fill-order invariant.
        if m >= 1 {
            let (nl, [ndp, ndq]) = self
                .cell(c, m - 1)
                .unwrap_or_else(|| panic!("{} missing dependency ({}, {})", BUG, c, m - 1));
            logg.push(2f64.ln() + p.ln() + q.ln() + (1.0 - q).ln() + nl);
            dlogg_dp.push(1.0 / p + ndp);
            dlogg_dq.push(1.0 / q - 1.0 / (1.0 - q) + ndq);
        }

        // Symmetric split: both child lineages stay clonal, partitioning the
        // genotype between them.
        for cx in 0..=c {
            for mx in 0..=m {
                if (cx > 0 || mx > 1) && (c - cx > 0 || m - mx > 1) {
                    let (l1, [dp1, dq1]) = self
                        .cell(cx, mx)
                        .unwrap_or_else(|| panic!("{} missing dependency ({}, {})", BUG, cx, mx));
                    let (l2, [dp2, dq2]) = self.cell(c - cx, m - mx).unwrap_or_else(|| {
                        panic!("{} missing dependency ({}, {})", BUG, c - cx, m - mx)
                    });
                    logg.push(p.ln() + 2.0 * (1.0 - q).ln() + l1 + l2);
                    dlogg_dp.push(1.0 / p + dp1 + dp2);
                    dlogg_dq.push(-2.0 / (1.0 - q) + dq1 + dq2);
                }
            }
        }

        if logg.is_empty() {
            return None;
        }

        let logf = logsumexp(&logg);
        let weights = softmax(&logg);
        let dp: f64 = weights.iter().zip(&dlogg_dp).map(|(w, d)| w * d).sum();
        let dq: f64 = weights.iter().zip(&dlogg_dq).map(|(w, d)| w * d).sum();
        Some((logf, [dp, dq]))
    }
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn base_case_one_clonal_leaf() {
        let (p, q) = (0.4, 0.3);
        let mut kernel = LlKernel::new(p, q).unwrap();
        let (ll, grad) = kernel.ll_genotype(1, 0).unwrap();
        assert_relative_eq!(ll, (1.0 - p).ln(), max_relative = 1e-12);
        assert_relative_eq!(grad[0], -1.0 / (1.0 - p), max_relative = 1e-12);
        assert_relative_eq!(grad[1], 0.0);
    }

    #[test]
    fn base_case_two_mutant_clades() {
        let (p, q) = (0.4, 0.3);
        let mut kernel = LlKernel::new(p, q).unwrap();
        let (ll, grad) = kernel.ll_genotype(0, 2).unwrap();
        assert_relative_eq!(ll, p.ln() + 2.0 * q.ln(), max_relative = 1e-12);
        assert_relative_eq!(grad[0], 1.0 / p, max_relative = 1e-12);
        assert_relative_eq!(grad[1], 2.0 / q, max_relative = 1e-12);
    }

    #[test]
    fn single_root_scenario_value() {
        let mut kernel = LlKernel::new(0.4, 0.3).unwrap();
        let (ll, _) = kernel.ll_genotype(1, 0).unwrap();
        assert_relative_eq!(ll, -0.5108256237659907, max_relative = 1e-12);
    }

    #[test]
    fn zero_likelihood_domain_errors() {
        let mut kernel = LlKernel::new(0.4, 0.3).unwrap();
        assert!(matches!(
            kernel.ll_genotype(0, 0),
            Err(LikelihoodError::ZeroLikelihood { c: 0, m: 0 })
        ));
        assert!(matches!(
            kernel.ll_genotype(0, 1),
            Err(LikelihoodError::ZeroLikelihood { c: 0, m: 1 })
        ));
        // The rest of the table is still usable afterwards.
        assert!(kernel.ll_genotype(2, 3).is_ok());
    }

    #[test]
    fn parameters_validated() {
        assert!(LlKernel::new(0.0, 0.5).is_err());
        assert!(LlKernel::new(0.5, 1.0).is_err());
        assert!(LlKernel::new(-0.1, 0.5).is_err());
    }

    #[test]
    fn gradient_matches_central_differences() {
        let h = 1e-6;
        for &p in &[0.3, 0.5, 0.7] {
            for &q in &[0.2, 0.4, 0.6] {
                let mut kernel = LlKernel::new(p, q).unwrap();
                for c in 0..=8u32 {
                    for m in 0..=8u32 {
                        if c == 0 && m <= 1 {
                            continue;
                        }
                        let (_, grad) = kernel.ll_genotype(c, m).unwrap();

                        let mut at = |pp: f64, qq: f64| {
                            LlKernel::new(pp, qq).unwrap().ll_genotype(c, m).unwrap().0
                        };
                        let dp = (at(p + h, q) - at(p - h, q)) / (2.0 * h);
                        let dq = (at(p, q + h) - at(p, q - h)) / (2.0 * h);

                        assert_relative_eq!(grad[0], dp, epsilon = 1e-4, max_relative = 1e-4);
                        assert_relative_eq!(grad[1], dq, epsilon = 1e-4, max_relative = 1e-4);
                    }
                }
            }
        }
    }

    #[test]
    fn parameter_change_invalidates_cache() {
        let mut kernel = LlKernel::new(0.3, 0.2).unwrap();
        kernel.ll_genotype(5, 5).unwrap();

        kernel.set_params(0.6, 0.4).unwrap();
        let (ll, grad) = kernel.ll_genotype(5, 5).unwrap();

        let mut fresh = LlKernel::new(0.6, 0.4).unwrap();
        let (fresh_ll, fresh_grad) = fresh.ll_genotype(5, 5).unwrap();
        assert_eq!(ll, fresh_ll);
        assert_eq!(grad, fresh_grad);
    }

    #[test]
    fn monotone_fill_is_access_order_independent() {
        // Any access sequence must leave the same table as one bulk fill to
        // the coordinate-wise maxima.
        let mut staged = LlKernel::new(0.35, 0.25).unwrap();
        staged.ll_genotype(1, 6).unwrap();
        staged.ll_genotype(4, 2).unwrap();
        staged.ll_genotype(6, 0).unwrap();
        staged.ll_genotype(3, 5).unwrap();

        let mut bulk = LlKernel::new(0.35, 0.25).unwrap();
        bulk.fill(6, 6);

        assert_eq!(staged.c_dim, bulk.c_dim);
        assert_eq!(staged.m_dim, bulk.m_dim);
        for c in 0..staged.c_dim {
            for m in 0..staged.m_dim {
                assert_eq!(
                    staged.cell(c, m),
                    bulk.cell(c, m),
                    "table mismatch at ({}, {})",
                    c,
                    m
                );
            }
        }
    }

    #[test]
    fn cached_reads_match_growing_reads() {
        let mut kernel = LlKernel::new(0.4, 0.6).unwrap();
        kernel.fill(10, 10);
        let cached = kernel.ll_genotype_cached(7, 3).unwrap();
        let grown = kernel.ll_genotype(7, 3).unwrap();
        assert_eq!(cached, grown);
    }
}
