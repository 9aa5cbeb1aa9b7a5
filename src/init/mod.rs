//! Dictionary initialization strategies.
//!
//! The coding model is generic over how its dictionary starts out; a strategy
//! receives the data and the atom count and produces the initial dictionary.
//! Resolution happens once, at construction.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;

const MAX_REDRAWS: usize = 10;

pub trait DictionaryInitializer {
    fn initialize<R: Rng>(
        &self,
        data: ArrayView2<'_, f64>,
        atoms: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>>;
}

/// Initializes every atom as the normalized sum of three uniformly drawn data
/// columns. This is also the routine used to revive atoms that fell out of
/// use during dictionary optimization.
pub struct DataInitializer;

impl DictionaryInitializer for DataInitializer {
    fn initialize<R: Rng>(
        &self,
        data: ArrayView2<'_, f64>,
        atoms: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        if atoms > 0 && data.ncols() == 0 {
            bail!("cannot draw atoms from a data matrix with no columns");
        }

        let mut dictionary = Array2::zeros((data.nrows(), atoms));
        for mut atom in dictionary.columns_mut() {
            atom.assign(&random_combined_atom(data, rng));
        }
        Ok(dictionary)
    }
}

/// Initializes atoms with standard-normal entries, normalized to unit length.
pub struct RandomInitializer;

impl DictionaryInitializer for RandomInitializer {
    fn initialize<R: Rng>(
        &self,
        data: ArrayView2<'_, f64>,
        atoms: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let mut dictionary: Array2<f64> = Array2::zeros((data.nrows(), atoms));
        for mut atom in dictionary.columns_mut() {
            for value in atom.iter_mut() {
                *value = rng.sample(StandardNormal);
            }
            let norm = atom.dot(&atom).sqrt();
            if norm > 0.0 {
                atom.mapv_inplace(|v| v / norm);
            }
        }
        Ok(dictionary)
    }
}

/// Wraps a preset dictionary, for warm starts and tests.
pub struct GivenInitializer {
    dictionary: Array2<f64>,
}

impl GivenInitializer {
    pub fn new(dictionary: Array2<f64>) -> Self {
        GivenInitializer { dictionary }
    }
}

impl DictionaryInitializer for GivenInitializer {
    fn initialize<R: Rng>(
        &self,
        data: ArrayView2<'_, f64>,
        atoms: usize,
        _rng: &mut R,
    ) -> Result<Array2<f64>> {
        if self.dictionary.nrows() != data.nrows() || self.dictionary.ncols() != atoms {
            bail!(
                "preset dictionary is {}x{}, expected {}x{}",
                self.dictionary.nrows(),
                self.dictionary.ncols(),
                data.nrows(),
                atoms
            );
        }
        Ok(self.dictionary.clone())
    }
}

/// Normalized sum of three data columns, drawn uniformly with replacement.
///
/// An all-zero draw (possible when the data itself contains zero columns) is
/// redrawn a bounded number of times; if every attempt sums to zero the first
/// canonical basis vector is used instead, so callers never divide by zero.
pub(crate) fn random_combined_atom<R: Rng>(data: ArrayView2<'_, f64>, rng: &mut R) -> Array1<f64> {
    let points = data.ncols();
    for _ in 0..MAX_REDRAWS {
        let mut atom = data.column(rng.random_range(0..points)).to_owned();
        atom += &data.column(rng.random_range(0..points));
        atom += &data.column(rng.random_range(0..points));
        let norm = atom.dot(&atom).sqrt();
        if norm > 0.0 {
            return atom / norm;
        }
    }

    let mut fallback = Array1::zeros(data.nrows());
    if !fallback.is_empty() {
        fallback[0] = 1.0;
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_data(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.random_range(-1.0..1.0))
    }

    #[test]
    fn data_initializer_produces_unit_atoms() {
        let data = random_data(6, 12, 1);
        let mut rng = StdRng::seed_from_u64(2);
        let dictionary = DataInitializer.initialize(data.view(), 4, &mut rng).unwrap();
        assert_eq!(dictionary.dim(), (6, 4));
        for atom in dictionary.columns() {
            let norm = atom.dot(&atom).sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn data_initializer_rejects_empty_data() {
        let data = Array2::<f64>::zeros((6, 0));
        let mut rng = StdRng::seed_from_u64(2);
        assert!(DataInitializer.initialize(data.view(), 4, &mut rng).is_err());
        // Zero atoms from zero points is fine.
        assert!(DataInitializer.initialize(data.view(), 0, &mut rng).is_ok());
    }

    #[test]
    fn random_initializer_is_reproducible() {
        let data = random_data(5, 3, 3);
        let mut rng_a = StdRng::seed_from_u64(7);
        let mut rng_b = StdRng::seed_from_u64(7);
        let a = RandomInitializer.initialize(data.view(), 3, &mut rng_a).unwrap();
        let b = RandomInitializer.initialize(data.view(), 3, &mut rng_b).unwrap();
        assert_eq!(a, b);
        for atom in a.columns() {
            let norm = atom.dot(&atom).sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn zero_data_columns_fall_back_to_a_basis_vector() {
        let data = array![[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]];
        let mut rng = StdRng::seed_from_u64(5);
        let atom = random_combined_atom(data.view(), &mut rng);
        assert_eq!(atom, array![1.0, 0.0, 0.0]);
    }
}
