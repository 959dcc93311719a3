//! Maximum-likelihood estimation of the branching parameters.
//!
//! Minimizes the negated log-likelihood over the box `[ε, 1−ε]²` with
//! `ε = 10⁻⁶`, starting from `(0.5, 0.5)`, using the analytic gradient and a
//! projected BFGS iteration with Armijo backtracking. Mirrors the posture of
//! a bounded quasi-Newton solver: a gradient/finite-difference mismatch or a
//! non-converged run is warned about and otherwise tolerated.

use log::warn;

use super::{Gradient, LikelihoodError};

const EPSILON: f64 = 1e-6;
const FTOL: f64 = 1e-10;
const MAX_ITERATIONS: usize = 200;
const GRAD_CHECK_TOLERANCE: f64 = 1e-3;

/// Maximize the given log-likelihood over `(p, q)`.
///
/// `ll` returns the log-likelihood and its gradient at `(p, q)`; any error it
/// returns aborts the optimization.
pub fn mle<F>(mut ll: F) -> Result<(f64, f64), LikelihoodError>
where
    F: FnMut(f64, f64) -> Result<(f64, Gradient), LikelihoodError>,
{
    // Negate: we minimize.
    let mut f = |x: [f64; 2]| -> Result<(f64, [f64; 2]), LikelihoodError> {
        let (value, grad) = ll(x[0], x[1])?;
        Ok((-value, [-grad[0], -grad[1]]))
    };

    let mut x = [0.5, 0.5];
    check_gradient(&mut f, x)?;

    let (mut fx, mut gx) = f(x)?;
    // Inverse Hessian approximation.
    let mut h = [[1.0, 0.0], [0.0, 1.0]];

    let mut converged = false;
    for _ in 0..MAX_ITERATIONS {
        let pg = projected_gradient(x, gx);
        if pg[0].abs().max(pg[1].abs()) < 1e-9 {
            converged = true;
            break;
        }

        // Newton-ish direction; fall back to steepest descent if the
        // approximation has lost positive-definiteness.
        let mut d = [
            -(h[0][0] * gx[0] + h[0][1] * gx[1]),
            -(h[1][0] * gx[0] + h[1][1] * gx[1]),
        ];
        if d[0] * gx[0] + d[1] * gx[1] >= 0.0 {
            h = [[1.0, 0.0], [0.0, 1.0]];
            d = [-gx[0], -gx[1]];
        }

        // Armijo backtracking on the projected step.
        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..40 {
            let x_new = clamp_to_box([x[0] + alpha * d[0], x[1] + alpha * d[1]]);
            let step = [x_new[0] - x[0], x_new[1] - x[1]];
            if step[0] == 0.0 && step[1] == 0.0 {
                break;
            }
            let (f_new, g_new) = f(x_new)?;
            if f_new <= fx + 1e-4 * (gx[0] * step[0] + gx[1] * step[1]) {
                accepted = Some((x_new, step, f_new, g_new));
                break;
            }
            alpha *= 0.5;
        }

        let Some((x_new, step, f_new, g_new)) = accepted else {
            // No acceptable step left; we are as converged as we will get.
            converged = true;
            break;
        };

        if (fx - f_new).abs() <= FTOL * (1.0 + fx.abs()) {
            x = x_new;
            fx = f_new;
            gx = g_new;
            converged = true;
            break;
        }

        // BFGS update of the inverse Hessian.
        let y = [g_new[0] - gx[0], g_new[1] - gx[1]];
        let sy = step[0] * y[0] + step[1] * y[1];
        if sy > 1e-12 {
            let rho = 1.0 / sy;
            let hy = [
                h[0][0] * y[0] + h[0][1] * y[1],
                h[1][0] * y[0] + h[1][1] * y[1],
            ];
            let yhy = y[0] * hy[0] + y[1] * hy[1];
            for i in 0..2 {
                for j in 0..2 {
                    h[i][j] += (1.0 + rho * yhy) * rho * step[i] * step[j]
                        - rho * (hy[i] * step[j] + step[i] * hy[j]);
                }
            }
        }

        x = x_new;
        fx = f_new;
        gx = g_new;
    }

    if !converged {
        warn!(
            "optimization did not converge within {} iterations; returning current iterate",
            MAX_ITERATIONS
        );
    }

    Ok((x[0], x[1]))
}

fn clamp_to_box(x: [f64; 2]) -> [f64; 2] {
    [
        x[0].clamp(EPSILON, 1.0 - EPSILON),
        x[1].clamp(EPSILON, 1.0 - EPSILON),
    ]
}

/// Zero out gradient components that point outside the active box bounds.
fn projected_gradient(x: [f64; 2], g: [f64; 2]) -> [f64; 2] {
    let mut pg = g;
    for i in 0..2 {
        if (x[i] <= EPSILON && g[i] > 0.0) || (x[i] >= 1.0 - EPSILON && g[i] < 0.0) {
            pg[i] = 0.0;
        }
    }
    pg
}

/// Compare the analytic gradient against central differences at the starting
/// point; mismatch is a warning, not a failure.
fn check_gradient<F>(f: &mut F, x: [f64; 2]) -> Result<(), LikelihoodError>
where
    F: FnMut([f64; 2]) -> Result<(f64, [f64; 2]), LikelihoodError>,
{
    let h = 1e-7;
    let (_, grad) = f(x)?;
    let mut err = 0.0;
    for i in 0..2 {
        let mut hi = x;
        let mut lo = x;
        hi[i] += h;
        lo[i] -= h;
        let fd = (f(hi)?.0 - f(lo)?.0) / (2.0 * h);
        err += (grad[i] - fd) * (grad[i] - fd);
    }
    let err = err.sqrt();
    if err > GRAD_CHECK_TOLERANCE {
        warn!(
            "gradient mismatches finite difference approximation by {:.3e}",
            err
        );
    }
    Ok(())
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn recovers_quadratic_minimum_inside_box() {
        // ll(p, q) = -((p - 0.3)^2 + (q - 0.7)^2), maximized at (0.3, 0.7).
        let (p, q) = mle(|p, q| {
            let value = -((p - 0.3).powi(2) + (q - 0.7).powi(2));
            Ok((value, [-2.0 * (p - 0.3), -2.0 * (q - 0.7)]))
        })
        .unwrap();
        assert_relative_eq!(p, 0.3, epsilon = 1e-5);
        assert_relative_eq!(q, 0.7, epsilon = 1e-5);
    }

    #[test]
    fn clamps_to_box_when_optimum_is_outside() {
        // Maximized at q = 2, outside the box; expect the upper bound.
        let (_, q) = mle(|p, q| {
            let value = -((p - 0.5).powi(2) + (q - 2.0).powi(2));
            Ok((value, [-2.0 * (p - 0.5), -2.0 * (q - 2.0)]))
        })
        .unwrap();
        assert_relative_eq!(q, 1.0 - EPSILON, epsilon = 1e-9);
    }

    #[test]
    fn propagates_evaluation_errors() {
        let result = mle(|p, q| Err(LikelihoodError::InvalidParameters { p, q }));
        assert!(result.is_err());
    }
}
