//! # Sparse Coding
//!
//! Alternating optimization of a sparse codes matrix and an overcomplete
//! dictionary. Each outer iteration first refits the dictionary to the current
//! codes (a constrained quadratic program solved in the dual, see
//! [`SparseCoding::optimize_dictionary`]) and then re-solves every data column
//! as a LASSO/Elastic-Net problem against the new dictionary.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::init::{DataInitializer, DictionaryInitializer};
use crate::lars::Lars;

mod dictionary;

/// Builder-style configuration for [`SparseCoding`].
///
/// The dictionary initialization strategy is resolved at build time through
/// the generic parameter; no dispatch remains afterwards.
pub struct SparseCodingBuilder<I: DictionaryInitializer> {
    atoms: usize,
    lambda1: f64,
    lambda2: f64,
    initializer: I,
    random_seed: Option<u64>,
    newton_max_iterations: usize,
}

impl SparseCodingBuilder<DataInitializer> {
    pub fn new(atoms: usize) -> Self {
        SparseCodingBuilder {
            atoms,
            lambda1: 0.0,
            lambda2: 0.0,
            initializer: DataInitializer,
            random_seed: None,
            newton_max_iterations: 0,
        }
    }
}

impl<I: DictionaryInitializer> SparseCodingBuilder<I> {
    /// L1 penalty weight on the codes.
    pub fn lambda1(mut self, lambda1: f64) -> Self {
        self.lambda1 = lambda1;
        self
    }

    /// L2 penalty weight on the codes (Elastic-Net when combined with
    /// `lambda1`).
    pub fn lambda2(mut self, lambda2: f64) -> Self {
        self.lambda2 = lambda2;
        self
    }

    /// Replaces the dictionary initialization strategy.
    pub fn initializer<J: DictionaryInitializer>(self, initializer: J) -> SparseCodingBuilder<J> {
        SparseCodingBuilder {
            atoms: self.atoms,
            lambda1: self.lambda1,
            lambda2: self.lambda2,
            initializer,
            random_seed: self.random_seed,
            newton_max_iterations: self.newton_max_iterations,
        }
    }

    /// Seeds the random source used for initialization and inactive-atom
    /// reinitialization, making runs reproducible.
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Caps the Newton iterations of each dictionary step; 0 means run to
    /// convergence.
    pub fn newton_max_iterations(mut self, iterations: usize) -> Self {
        self.newton_max_iterations = iterations;
        self
    }

    /// Takes ownership of the data matrix (one observation per column),
    /// initializes the dictionary and zero-fills the codes.
    pub fn build(self, data: Array2<f64>) -> Result<SparseCoding> {
        if self.lambda1 < 0.0 || self.lambda2 < 0.0 {
            bail!(
                "regularization weights must be non-negative (lambda1 = {}, lambda2 = {})",
                self.lambda1,
                self.lambda2
            );
        }

        let mut rng = match self.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let dictionary = self
            .initializer
            .initialize(data.view(), self.atoms, &mut rng)
            .context("dictionary initialization failed")?;
        if dictionary.nrows() != data.nrows() || dictionary.ncols() != self.atoms {
            bail!(
                "initializer produced a {}x{} dictionary, expected {}x{}",
                dictionary.nrows(),
                dictionary.ncols(),
                data.nrows(),
                self.atoms
            );
        }

        let codes = Array2::zeros((self.atoms, data.ncols()));
        Ok(SparseCoding {
            data,
            dictionary,
            codes,
            atoms: self.atoms,
            lambda1: self.lambda1,
            lambda2: self.lambda2,
            newton_max_iterations: self.newton_max_iterations,
            rng,
        })
    }
}

/// Sparse coding model: a data matrix together with the learned dictionary
/// and codes.
///
/// The data is never mutated after construction; the dictionary and codes are
/// updated in place by the two optimization steps.
pub struct SparseCoding {
    data: Array2<f64>,
    dictionary: Array2<f64>,
    codes: Array2<f64>,
    atoms: usize,
    lambda1: f64,
    lambda2: f64,
    newton_max_iterations: usize,
    rng: StdRng,
}

impl SparseCoding {
    /// Runs alternating optimization until the objective improves by less than
    /// `obj_tolerance` between outer iterations, or `max_iterations` is
    /// reached (0 means unbounded).
    ///
    /// `newton_tolerance` is the dual-gradient norm at which each dictionary
    /// step stops.
    pub fn encode(
        &mut self,
        max_iterations: usize,
        obj_tolerance: f64,
        newton_tolerance: f64,
    ) -> Result<()> {
        let mut last_objective = f64::MAX;

        // The initial coding step happens before entering the main loop; the
        // convergence baseline is taken from it.
        info!("Initial coding step.");
        self.optimize_code()?;
        let mut adjacencies = self.adjacencies();
        info!("  Sparsity level: {:.4}%.", self.sparsity_percent(&adjacencies));
        info!("  Objective value: {}.", self.objective());

        let mut t = 1usize;
        while t != max_iterations {
            if max_iterations != 0 {
                info!("Iteration {} of {}.", t, max_iterations);
            } else {
                info!("Iteration {}.", t);
            }

            info!("Performing dictionary step...");
            let gradient_norm = self.optimize_dictionary(&adjacencies, newton_tolerance)?;
            debug!("  Final dual gradient norm: {:e}.", gradient_norm);
            info!("  Objective value: {}.", self.objective());

            info!("Performing coding step...");
            self.optimize_code()?;
            adjacencies = self.adjacencies();
            info!("  Sparsity level: {:.4}%.", self.sparsity_percent(&adjacencies));

            let current_objective = self.objective();
            let improvement = last_objective - current_objective;
            info!(
                "  Objective value: {} (improvement {:e}).",
                current_objective, improvement
            );

            if improvement < obj_tolerance {
                info!("Converged within tolerance {}.", obj_tolerance);
                break;
            }
            last_objective = current_objective;
            t += 1;
        }

        Ok(())
    }

    /// Re-solves the sparse code of every data column against the current
    /// dictionary, writing each solution into its column of the codes matrix.
    ///
    /// Columns are independent given the shared Gram matrix, so they are
    /// solved in parallel.
    pub fn optimize_code(&mut self) -> Result<()> {
        // With the Cholesky LARS variant this Gram matrix stays correct even
        // when lambda2 > 0.
        let gram = self.dictionary.t().dot(&self.dictionary);
        let dictionary = self.dictionary.view();
        let data = self.data.view();
        let (lambda1, lambda2) = (self.lambda1, self.lambda2);

        self.codes
            .axis_iter_mut(Axis(1))
            .into_par_iter()
            .enumerate()
            .try_for_each(|(i, code)| {
                if i % 100 == 0 {
                    debug!("Optimizing code for point {}.", i);
                }
                Lars::new(gram.view(), lambda1, lambda2)
                    .solve(dictionary, data.column(i), code)
                    .with_context(|| format!("sparse code solve failed for point {}", i))
            })
    }

    /// Clips every atom back into the unit ball. Idempotent.
    pub fn project_dictionary(&mut self) {
        for (j, mut atom) in self.dictionary.columns_mut().into_iter().enumerate() {
            let norm = atom.dot(&atom).sqrt();
            if norm > 1.0 {
                info!("Norm of atom {} exceeds 1 ({:e}); shrinking.", j, norm);
                atom.mapv_inplace(|v| v / norm);
            }
        }
    }

    /// Current value of the loss
    /// `0.5 * ||data - dictionary * codes||_F^2 + lambda1 * ||codes||_1
    ///  + 0.5 * lambda2 * ||codes||_F^2`.
    pub fn objective(&self) -> f64 {
        let residual = &self.data - &self.dictionary.dot(&self.codes);
        let residual_sq = residual.iter().map(|v| v * v).sum::<f64>();
        let l1_norm = self.codes.iter().map(|v| v.abs()).sum::<f64>();

        if self.lambda2 > 0.0 {
            let codes_sq = self.codes.iter().map(|v| v * v).sum::<f64>();
            0.5 * (residual_sq + self.lambda2 * codes_sq) + self.lambda1 * l1_norm
        } else {
            0.5 * residual_sq + self.lambda1 * l1_norm
        }
    }

    /// Nonzero `(atom, point)` pairs of the codes matrix, in column-major
    /// order. Recomputed from scratch; consumed by the dictionary step.
    pub fn adjacencies(&self) -> Vec<(usize, usize)> {
        let mut adjacencies = Vec::new();
        for (i, column) in self.codes.columns().into_iter().enumerate() {
            for (j, &value) in column.iter().enumerate() {
                if value != 0.0 {
                    adjacencies.push((j, i));
                }
            }
        }
        adjacencies
    }

    fn sparsity_percent(&self, adjacencies: &[(usize, usize)]) -> f64 {
        let total = self.atoms * self.data.ncols();
        if total == 0 {
            return 0.0;
        }
        100.0 * adjacencies.len() as f64 / total as f64
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn dictionary(&self) -> &Array2<f64> {
        &self.dictionary
    }

    pub fn codes(&self) -> &Array2<f64> {
        &self.codes
    }

    pub fn atoms(&self) -> usize {
        self.atoms
    }

    pub fn lambda1(&self) -> f64 {
        self.lambda1
    }

    pub fn lambda2(&self) -> f64 {
        self.lambda2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::{GivenInitializer, RandomInitializer};
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_data(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.random_range(-1.0..1.0))
    }

    fn random_unit_dictionary(rows: usize, atoms: usize, seed: u64) -> Array2<f64> {
        let mut dictionary = random_data(rows, atoms, seed);
        for mut atom in dictionary.columns_mut() {
            let norm = atom.dot(&atom).sqrt();
            atom.mapv_inplace(|v| v / norm);
        }
        dictionary
    }

    #[test]
    fn negative_weights_are_rejected() {
        let data = random_data(4, 6, 0);
        assert!(SparseCodingBuilder::new(2)
            .lambda1(-0.5)
            .build(data.clone())
            .is_err());
        assert!(SparseCodingBuilder::new(2)
            .lambda2(-0.1)
            .build(data)
            .is_err());
    }

    #[test]
    fn mismatched_preset_dictionary_is_rejected() {
        let data = random_data(4, 6, 1);
        let wrong = Array2::zeros((3, 2));
        assert!(SparseCodingBuilder::new(2)
            .initializer(GivenInitializer::new(wrong))
            .build(data)
            .is_err());
    }

    #[test]
    fn orthonormal_dictionary_reconstructs_exactly() {
        // Unregularized coding against a complete orthonormal dictionary is
        // plain least squares; the residual (and so the objective) vanishes.
        let data = array![[3.0], [4.0]];
        let identity = Array2::eye(2);
        let mut model = SparseCodingBuilder::new(2)
            .initializer(GivenInitializer::new(identity))
            .build(data)
            .unwrap();

        model.optimize_code().unwrap();
        assert_abs_diff_eq!(model.codes()[[0, 0]], 3.0, epsilon = 1e-10);
        assert_abs_diff_eq!(model.codes()[[1, 0]], 4.0, epsilon = 1e-10);
        assert_abs_diff_eq!(model.objective(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn coding_step_never_increases_the_objective() {
        let data = random_data(6, 20, 5);
        let mut model = SparseCodingBuilder::new(8)
            .lambda1(0.15)
            .random_seed(3)
            .newton_max_iterations(50)
            .build(data)
            .unwrap();

        model.optimize_code().unwrap();
        for _ in 0..3 {
            let adjacencies = model.adjacencies();
            let gradient_norm = model.optimize_dictionary(&adjacencies, 1e-6).unwrap();
            assert!(gradient_norm.is_finite());

            let before = model.objective();
            model.optimize_code().unwrap();
            assert!(model.objective() <= before + 1e-8);
        }
    }

    #[test]
    fn sparsity_grows_with_lambda1() {
        let data = random_data(5, 30, 11);
        let dictionary = random_unit_dictionary(5, 10, 12);

        let nonzeros = |lambda1: f64| {
            let mut model = SparseCodingBuilder::new(10)
                .lambda1(lambda1)
                .initializer(GivenInitializer::new(dictionary.clone()))
                .build(data.clone())
                .unwrap();
            model.optimize_code().unwrap();
            model.adjacencies().len()
        };

        assert!(nonzeros(0.5) <= nonzeros(0.05));
    }

    #[test]
    fn projection_is_idempotent_and_bounds_atom_norms() {
        let oversized = array![[3.0, 0.5], [4.0, 0.0]];
        let data = random_data(2, 4, 21);
        let mut model = SparseCodingBuilder::new(2)
            .initializer(GivenInitializer::new(oversized))
            .build(data)
            .unwrap();

        model.project_dictionary();
        for atom in model.dictionary().columns() {
            assert!(atom.dot(&atom).sqrt() <= 1.0 + 1e-12);
        }
        // A short atom is left alone.
        assert_abs_diff_eq!(model.dictionary()[[0, 1]], 0.5, epsilon = 1e-15);

        let once = model.dictionary().clone();
        model.project_dictionary();
        assert_eq!(model.dictionary(), &once);
    }

    #[test]
    fn encode_runs_to_convergence() {
        let data = random_data(6, 24, 7);
        let mut model = SparseCodingBuilder::new(9)
            .lambda1(0.1)
            .random_seed(4)
            .newton_max_iterations(50)
            .build(data)
            .unwrap();

        model.encode(10, 0.01, 1e-6).unwrap();
        assert!(model.objective().is_finite());
        assert_eq!(model.codes().dim(), (9, 24));
        assert_eq!(model.dictionary().dim(), (6, 9));
    }

    #[test]
    fn zero_points_degenerate_run() {
        let data = Array2::<f64>::zeros((4, 0));
        let mut model = SparseCodingBuilder::new(3)
            .lambda1(0.1)
            .initializer(RandomInitializer)
            .random_seed(9)
            .build(data)
            .unwrap();

        model.encode(5, 0.01, 1e-6).unwrap();
        assert_eq!(model.codes().dim(), (3, 0));
        assert_abs_diff_eq!(model.objective(), 0.0);
    }

    #[test]
    fn zero_atoms_degenerate_run() {
        let data = random_data(4, 5, 13);
        let expected = 0.5 * data.iter().map(|v| v * v).sum::<f64>();
        let mut model = SparseCodingBuilder::new(0)
            .lambda1(0.1)
            .random_seed(2)
            .build(data)
            .unwrap();

        model.encode(3, 0.01, 1e-6).unwrap();
        assert_eq!(model.dictionary().dim(), (4, 0));
        assert_eq!(model.codes().dim(), (0, 5));
        assert_abs_diff_eq!(model.objective(), expected, epsilon = 1e-12);
    }
}
