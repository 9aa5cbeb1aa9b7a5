//! # Least Angle Regression
//!
//! Cholesky-based LARS with the LASSO modification, used as the per-column
//! sparse solver of the coding step. Solves
//!
//! ```text
//! min_beta 0.5 * ||y - X beta||^2 + lambda1 * ||beta||_1 + 0.5 * lambda2 * ||beta||^2
//! ```
//!
//! exactly (up to floating point), by following the regularization path down
//! to `lambda1`. The Elastic-Net case is handled by folding `lambda2` into the
//! diagonal of the Gram matrix, which turns it into a LASSO on the augmented
//! system.

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1};

// Floor for both the path position and the Cholesky pivot; the pivot comes
// out of a cancellation-prone subtraction, so this sits well above machine
// epsilon.
const DEFAULT_TOLERANCE: f64 = 1e-10;

/// Sparse linear regression against a fixed design matrix.
///
/// Borrows a precomputed Gram matrix `X^T X` so that many right-hand sides can
/// be solved against the same design without recomputing it. The Gram matrix
/// is taken without the `lambda2` ridge term; the solver adds it where needed.
pub struct Lars<'a> {
    gram: ArrayView2<'a, f64>,
    lambda1: f64,
    lambda2: f64,
    tolerance: f64,
}

impl<'a> Lars<'a> {
    pub fn new(gram: ArrayView2<'a, f64>, lambda1: f64, lambda2: f64) -> Self {
        Lars {
            gram,
            lambda1,
            lambda2,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Solves for the sparse coefficients of `y` and writes them directly into
    /// `beta`.
    ///
    /// `beta` is typically a column view into a shared coefficient matrix; the
    /// solver never reads or writes outside the supplied slice, so disjoint
    /// columns may be solved concurrently.
    pub fn solve(
        &self,
        x: ArrayView2<'_, f64>,
        y: ArrayView1<'_, f64>,
        mut beta: ArrayViewMut1<'_, f64>,
    ) -> Result<()> {
        let n = x.ncols();
        if self.gram.nrows() != n || self.gram.ncols() != n {
            bail!(
                "Gram matrix is {}x{} but the design matrix has {} columns",
                self.gram.nrows(),
                self.gram.ncols(),
                n
            );
        }
        if x.nrows() != y.len() {
            bail!(
                "design matrix has {} rows but the response has {} entries",
                x.nrows(),
                y.len()
            );
        }
        if beta.len() != n {
            bail!(
                "coefficient slice has {} entries but the design matrix has {} columns",
                beta.len(),
                n
            );
        }

        beta.fill(0.0);
        if n == 0 {
            return Ok(());
        }

        let mut corr = x.t().dot(&y);
        let mut active: Vec<usize> = Vec::new();
        let mut is_active = vec![false; n];
        let mut is_ignored = vec![false; n];
        let mut n_ignored = 0usize;
        // Upper-triangular Cholesky factor of the active Gram block (plus the
        // lambda2 ridge), grown and shrunk as variables enter and leave.
        let mut chol = Array2::<f64>::zeros((0, 0));
        let mut lasso_cond = false;

        let stop = self.lambda1.max(self.tolerance);
        let max_steps = 100 * (n + 1);
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > max_steps {
                bail!("LARS failed to converge; the Gram system is numerically degenerate");
            }

            // Current position on the path, and the best inactive candidate.
            let mut cur_lambda = 0.0f64;
            let mut max_inactive = 0.0f64;
            let mut change_ind = None;
            for j in 0..n {
                if is_ignored[j] {
                    continue;
                }
                let c = corr[j].abs();
                cur_lambda = cur_lambda.max(c);
                if !is_active[j] && c > max_inactive {
                    max_inactive = c;
                    change_ind = Some(j);
                }
            }
            if cur_lambda <= stop {
                break;
            }

            // A candidate only enters once its correlation has caught up with
            // the active level; after a singular insert the runner-up has not.
            if max_inactive < cur_lambda * (1.0 - 1e-10) {
                change_ind = None;
            }
            if !lasso_cond {
                if let Some(j) = change_ind {
                    if self.cholesky_insert(&mut chol, j, &active) {
                        active.push(j);
                        is_active[j] = true;
                    } else {
                        // The active Gram block would go singular; drop the
                        // variable for good and look for another one.
                        is_ignored[j] = true;
                        n_ignored += 1;
                        continue;
                    }
                }
            }
            lasso_cond = false;

            if active.is_empty() {
                // Every remaining candidate has been ignored.
                break;
            }
            let k = active.len();

            // Equiangular direction over the active set:
            // solve R^T w = s, then R u = w, so u = (G_A)^-1 s.
            let signs = Array1::from_iter(active.iter().map(|&j| corr[j].signum()));
            let w = solve_lower_transposed(&chol, signs.view());
            let u = solve_upper(&chol, w.view());
            let denom = signs.dot(&u);
            if denom <= 0.0 {
                bail!("active Gram system is not positive definite");
            }
            let nu = 1.0 / denom.sqrt();
            let direction = u.mapv(|v| v * nu);

            // Step length: distance to the joint least-squares solution of the
            // active set, shortened by whichever event comes first.
            let mut gamma = cur_lambda / nu;
            let mut dir_corr = vec![0.0f64; n];
            if k + n_ignored < n {
                for j in 0..n {
                    if is_active[j] || is_ignored[j] {
                        continue;
                    }
                    let mut a = 0.0;
                    for (i, &ai) in active.iter().enumerate() {
                        a += self.gram[[j, ai]] * direction[i];
                    }
                    dir_corr[j] = a;
                    let val1 = (cur_lambda - corr[j]) / (nu - a);
                    let val2 = (cur_lambda + corr[j]) / (nu + a);
                    if val1 > 0.0 && val1 < gamma {
                        gamma = val1;
                    }
                    if val2 > 0.0 && val2 < gamma {
                        gamma = val2;
                    }
                }
            }

            // Stop exactly at the requested penalty level.
            let mut final_step = false;
            if self.lambda1 > 0.0 {
                let bound = (cur_lambda - self.lambda1) / nu;
                if bound <= gamma {
                    gamma = bound;
                    final_step = true;
                }
            }

            // A coefficient crossing zero leaves the active set first.
            let mut kick = None;
            for (i, &j) in active.iter().enumerate() {
                if direction[i] == 0.0 {
                    continue;
                }
                let val = -beta[j] / direction[i];
                if val > 0.0 && val < gamma {
                    gamma = val;
                    kick = Some(i);
                }
            }
            if kick.is_some() {
                lasso_cond = true;
                final_step = false;
            }

            for (i, &j) in active.iter().enumerate() {
                beta[j] += gamma * direction[i];
            }
            for j in 0..n {
                if is_active[j] || is_ignored[j] {
                    continue;
                }
                corr[j] -= gamma * dir_corr[j];
            }
            // The active correlations shrink uniformly; set them exactly.
            let new_level = cur_lambda - gamma * nu;
            for (i, &j) in active.iter().enumerate() {
                corr[j] = signs[i] * new_level;
            }

            if let Some(i) = kick {
                let j = active[i];
                beta[j] = 0.0;
                is_active[j] = false;
                active.remove(i);
                cholesky_delete(&mut chol, i);
            }
            if final_step {
                break;
            }
        }

        Ok(())
    }

    /// Grows the upper Cholesky factor by the Gram row/column of variable `j`.
    /// Returns false (leaving the factor untouched) if the extended block is
    /// numerically singular.
    fn cholesky_insert(&self, chol: &mut Array2<f64>, j: usize, active: &[usize]) -> bool {
        let k = chol.nrows();
        let diag = self.gram[[j, j]] + self.lambda2;
        if k == 0 {
            if diag.sqrt() <= self.tolerance {
                return false;
            }
            *chol = Array2::from_elem((1, 1), diag.sqrt());
            return true;
        }

        let col = Array1::from_iter(active.iter().map(|&a| self.gram[[a, j]]));
        let z = solve_lower_transposed(chol, col.view());
        let d2 = diag - z.dot(&z);
        let pivot = if d2 > 0.0 { d2.sqrt() } else { 0.0 };
        if pivot <= self.tolerance {
            return false;
        }

        let mut next = Array2::zeros((k + 1, k + 1));
        next.slice_mut(s![..k, ..k]).assign(chol);
        for i in 0..k {
            next[[i, k]] = z[i];
        }
        next[[k, k]] = pivot;
        *chol = next;
        true
    }
}

/// Back substitution with the upper factor `R`.
fn solve_upper(r: &Array2<f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let k = r.nrows();
    let mut out = Array1::zeros(k);
    for i in (0..k).rev() {
        let mut sum = b[i];
        for j in i + 1..k {
            sum -= r[[i, j]] * out[j];
        }
        out[i] = sum / r[[i, i]];
    }
    out
}

/// Forward substitution with `R^T` (the lower factor), without materializing
/// the transpose.
fn solve_lower_transposed(r: &Array2<f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let k = r.nrows();
    let mut out = Array1::zeros(k);
    for i in 0..k {
        let mut sum = b[i];
        for j in 0..i {
            sum -= r[[j, i]] * out[j];
        }
        out[i] = sum / r[[i, i]];
    }
    out
}

/// Removes row/column `pos` from the upper factor, restoring triangularity
/// with Givens rotations.
fn cholesky_delete(r: &mut Array2<f64>, pos: usize) {
    let k = r.nrows();
    if pos == k - 1 {
        *r = r.slice(s![..k - 1, ..k - 1]).to_owned();
        return;
    }

    let mut m = Array2::zeros((k, k - 1));
    for j in 0..k - 1 {
        let src = if j < pos { j } else { j + 1 };
        m.column_mut(j).assign(&r.column(src));
    }
    for col in pos..k - 1 {
        let (a, b) = (m[[col, col]], m[[col + 1, col]]);
        let h = a.hypot(b);
        let (c, s) = if h == 0.0 { (1.0, 0.0) } else { (a / h, b / h) };
        for j in col..k - 1 {
            let (t1, t2) = (m[[col, j]], m[[col + 1, j]]);
            m[[col, j]] = c * t1 + s * t2;
            m[[col + 1, j]] = -s * t1 + c * t2;
        }
    }
    *r = m.slice(s![..k - 1, ..]).to_owned();
}
