//! # sparse_coding
//!
//! Dictionary learning for dense data: every data column is expressed as a
//! sparse linear combination of learned atoms, under an L1 (LASSO) or L1+L2
//! (Elastic-Net) penalty. Training alternates between an exact per-column
//! sparse regression (least angle regression with the LASSO modification) and
//! a norm-constrained dictionary refit solved in the dual with Newton's
//! method.
//!
//! ```
//! use ndarray::Array2;
//! use sparse_coding::SparseCodingBuilder;
//!
//! let data = Array2::from_shape_fn((4, 30), |(i, j)| ((i * 7 + j * 3) % 11) as f64 / 11.0 - 0.5);
//!
//! let mut model = SparseCodingBuilder::new(6)
//!     .lambda1(0.1)
//!     .random_seed(42)
//!     .newton_max_iterations(50)
//!     .build(data)
//!     .unwrap();
//! model.encode(5, 0.01, 1e-6).unwrap();
//!
//! assert_eq!(model.dictionary().dim(), (4, 6));
//! assert_eq!(model.codes().dim(), (6, 30));
//! ```

pub mod coding;
pub mod init;
pub mod lars;
pub mod viz;

pub use coding::{SparseCoding, SparseCodingBuilder};
pub use init::{DataInitializer, DictionaryInitializer, GivenInitializer, RandomInitializer};
pub use lars::Lars;
