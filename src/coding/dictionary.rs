//! Dictionary step: refits the atoms to the current codes by solving the dual
//! of the norm-constrained quadratic program with Newton's method.

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, Axis};
use nshare::{IntoNalgebra, IntoNdarray1, IntoNdarray2};

use crate::init;

use super::SparseCoding;

const ARMIJO_C: f64 = 1e-4;
const ARMIJO_RHO: f64 = 0.9;

impl SparseCoding {
    /// Updates the dictionary for the current codes.
    ///
    /// `adjacencies` is the nonzero `(atom, point)` set of the codes matrix
    /// (see [`SparseCoding::adjacencies`]); atoms absent from it are inactive
    /// and get reinitialized from random data columns instead of entering the
    /// linear system. Dual variables start from zero on every call.
    ///
    /// Returns the final dual-gradient norm, for diagnostics only.
    pub fn optimize_dictionary(
        &mut self,
        adjacencies: &[(usize, usize)],
        newton_tolerance: f64,
    ) -> Result<f64> {
        let visible = self.data.nrows();
        let points = self.data.ncols();

        let mut used = vec![false; self.atoms];
        for &(atom, point) in adjacencies {
            if atom >= self.atoms || point >= points {
                bail!(
                    "adjacency ({}, {}) is out of range for {} atoms and {} points",
                    atom,
                    point,
                    self.atoms,
                    points
                );
            }
            used[atom] = true;
        }
        let active: Vec<usize> = (0..self.atoms).filter(|&j| used[j]).collect();
        let inactive: Vec<usize> = (0..self.atoms).filter(|&j| !used[j]).collect();
        let n_active = active.len();

        if !inactive.is_empty() {
            warn!(
                "There are {} inactive atoms. They will be reinitialized randomly.",
                inactive.len()
            );
        }

        let mut active_dictionary = Array2::<f64>::zeros((visible, 0));
        let mut gradient_norm = 0.0f64;

        if n_active > 0 {
            debug!("Solving the dictionary dual via Newton's method.");

            // Restrict the codes to the active atoms; with no inactive atoms
            // these are the full codes products.
            let active_codes = self.codes.select(Axis(0), &active);
            let codes_xt = active_codes.dot(&self.data.t());
            let codes_zt = active_codes.dot(&active_codes.t());

            let mut dual_vars = Array1::<f64>::zeros(n_active);
            let mut converged = false;
            let mut t = 1usize;
            // Matches the `t != max` loop convention: a cap of 0 runs until
            // the gradient norm drops below the tolerance.
            while !converged && t != self.newton_max_iterations {
                let a = add_diagonal(&codes_zt, &dual_vars);
                let lu = a.into_nalgebra().lu();
                let solved = lu
                    .solve(&codes_xt.clone().into_nalgebra())
                    .ok_or_else(|| anyhow!("dual system matrix is singular"))?;
                let a_inv: DMatrix<f64> = lu
                    .try_inverse()
                    .ok_or_else(|| anyhow!("dual system matrix is singular"))?;
                let x = solved.into_ndarray2().into_owned();
                let a_inv = a_inv.into_ndarray2().into_owned();

                // Dual gradient: 1 - ||X_k,:||^2 per coordinate.
                let gradient = Array1::from_iter(
                    x.rows()
                        .into_iter()
                        .map(|row| 1.0 - row.iter().map(|v| v * v).sum::<f64>()),
                );

                // The dual Hessian is 2 (X X^T) .* A^-1; the Newton direction
                // solves it against the negated gradient.
                let hessian = 2.0 * x.dot(&x.t()) * &a_inv;
                let direction = hessian
                    .into_nalgebra()
                    .lu()
                    .solve(&gradient.mapv(|v| -v).into_nalgebra())
                    .ok_or_else(|| anyhow!("dual Hessian is singular"))?
                    .into_ndarray1()
                    .into_owned();

                // Armijo backtracking; every trial step re-solves the linear
                // system against the candidate dual variables.
                let sufficient_decrease = ARMIJO_C * gradient.dot(&direction);
                let f_old = (&codes_xt * &x).sum() + dual_vars.sum();
                let mut alpha = 1.0f64;
                let (step, improvement) = loop {
                    let candidate = &dual_vars + &direction.mapv(|v| alpha * v);
                    let trial = add_diagonal(&codes_zt, &candidate)
                        .into_nalgebra()
                        .lu()
                        .solve(&codes_xt.clone().into_nalgebra())
                        .ok_or_else(|| {
                            anyhow!("dual system matrix is singular during line search")
                        })?
                        .into_ndarray2()
                        .into_owned();
                    let f_new = (&codes_xt * &trial).sum() + candidate.sum();
                    if f_new <= f_old + alpha * sufficient_decrease {
                        break (direction.mapv(|v| alpha * v), f_old - f_new);
                    }
                    alpha *= ARMIJO_RHO;
                };
                dual_vars += &step;

                gradient_norm = gradient.dot(&gradient).sqrt();
                debug!("Newton iteration {}:", t);
                debug!("  Gradient norm: {:e}.", gradient_norm);
                debug!("  Improvement: {:e}.", improvement);

                if gradient_norm < newton_tolerance {
                    converged = true;
                }
                t += 1;
            }

            // One last solve against the converged dual variables gives the
            // updated atoms.
            let solved = add_diagonal(&codes_zt, &dual_vars)
                .into_nalgebra()
                .lu()
                .solve(&codes_xt.into_nalgebra())
                .ok_or_else(|| anyhow!("dual system matrix is singular"))?
                .into_ndarray2()
                .into_owned();
            active_dictionary = solved.reversed_axes();
        }

        if inactive.is_empty() {
            if n_active > 0 {
                self.dictionary = active_dictionary;
            }
        } else {
            // Merge in ascending atom order; active columns keep their
            // relative order from the reduced solve.
            let mut seen_inactive = 0usize;
            for j in 0..self.atoms {
                if seen_inactive < inactive.len() && inactive[seen_inactive] == j {
                    if points > 0 {
                        let atom = init::random_combined_atom(self.data.view(), &mut self.rng);
                        self.dictionary.column_mut(j).assign(&atom);
                    }
                    seen_inactive += 1;
                } else {
                    self.dictionary
                        .column_mut(j)
                        .assign(&active_dictionary.column(j - seen_inactive));
                }
            }
        }

        Ok(gradient_norm)
    }
}

fn add_diagonal(matrix: &Array2<f64>, diagonal: &Array1<f64>) -> Array2<f64> {
    let mut out = matrix.clone();
    for (k, v) in diagonal.iter().enumerate() {
        out[[k, k]] += v;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::SparseCodingBuilder;
    use crate::init::GivenInitializer;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_data(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.random_range(-1.0..1.0))
    }

    #[test]
    fn dictionary_step_reduces_reconstruction_error() {
        let data = random_data(5, 25, 31);
        let mut model = SparseCodingBuilder::new(7)
            .lambda1(0.05)
            .random_seed(8)
            .newton_max_iterations(50)
            .build(data)
            .unwrap();
        model.optimize_code().unwrap();

        let residual_sq = |m: &crate::coding::SparseCoding| {
            let r = m.data() - &m.dictionary().dot(m.codes());
            r.iter().map(|v| v * v).sum::<f64>()
        };

        let before = residual_sq(&model);
        let adjacencies = model.adjacencies();
        let gradient_norm = model.optimize_dictionary(&adjacencies, 1e-6).unwrap();
        let after = residual_sq(&model);

        assert!(gradient_norm.is_finite());
        // Codes are fixed; the refit dictionary can only fit them better.
        assert!(after <= before + 1e-6, "residual grew from {} to {}", before, after);
    }

    #[test]
    fn all_inactive_atoms_are_reinitialized() {
        let data = random_data(4, 10, 41);
        let mut model = SparseCodingBuilder::new(5)
            .lambda1(0.1)
            .random_seed(6)
            .build(data)
            .unwrap();

        // Codes were never optimized, so every atom is inactive.
        assert!(model.adjacencies().is_empty());
        let gradient_norm = model.optimize_dictionary(&[], 1e-6).unwrap();
        assert_eq!(gradient_norm, 0.0);
        for atom in model.dictionary().columns() {
            let norm = atom.dot(&atom).sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
            assert!(atom.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn inactive_atoms_merge_back_in_order() {
        let data = random_data(4, 12, 51);
        let dictionary = {
            let mut d = random_data(4, 3, 52);
            for mut atom in d.columns_mut() {
                let norm = atom.dot(&atom).sqrt();
                atom.mapv_inplace(|v| v / norm);
            }
            d
        };
        let mut model = SparseCodingBuilder::new(3)
            .initializer(GivenInitializer::new(dictionary))
            .random_seed(10)
            .newton_max_iterations(50)
            .build(data)
            .unwrap();

        // Leave the middle atom unused; the two used rows must not be
        // proportional or the reduced system would be singular.
        model.codes.row_mut(0).fill(0.3);
        for (k, v) in model.codes.row_mut(2).iter_mut().enumerate() {
            *v = -0.2 + 0.05 * k as f64;
        }

        let adjacencies = model.adjacencies();
        model.optimize_dictionary(&adjacencies, 1e-6).unwrap();

        let reinit = model.dictionary().column(1);
        let norm = reinit.dot(&reinit).sqrt();
        assert!((norm - 1.0).abs() < 1e-12);
        assert!(model.dictionary().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn out_of_range_adjacency_fails_fast() {
        let data = random_data(3, 4, 61);
        let mut model = SparseCodingBuilder::new(2)
            .random_seed(1)
            .build(data)
            .unwrap();
        assert!(model.optimize_dictionary(&[(5, 0)], 1e-6).is_err());
    }
}
