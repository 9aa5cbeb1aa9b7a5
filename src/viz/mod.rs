//! Display-side helpers for learned dictionaries.
//!
//! These consumers only read a copy of the dictionary (or any matrix whose
//! columns are flattened image patches): columns are rescaled independently
//! and tiled into a bordered grid that can be written out as an image. They
//! never touch the model itself.

use anyhow::{bail, Result};
use ndarray::{s, Array2, ArrayView2};

/// Scales every column by its own maximum absolute value; all-zero columns
/// are left untouched.
pub fn normalize_cols_by_max(input: ArrayView2<'_, f64>) -> Array2<f64> {
    let mut output = input.to_owned();
    for mut column in output.columns_mut() {
        let max = column.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
        if max != 0.0 {
            column.mapv_inplace(|v| v / max);
        }
    }
    output
}

/// Extracts the first-layer weight block of a stacked parameter matrix,
/// centers it around the global mean and normalizes each column, producing
/// one displayable column per hidden unit.
pub fn maximal_inputs(parameters: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
    if parameters.nrows() < 1 || parameters.ncols() < 1 {
        bail!("parameter matrix must be non-empty");
    }
    let hidden = (parameters.nrows() - 1) / 2;
    let block = parameters.slice(s![..hidden, ..parameters.ncols() - 1]);

    let mut transposed = block.t().to_owned();
    let mean = transposed.mean().unwrap_or(0.0);
    transposed -= mean;
    Ok(normalize_cols_by_max(transposed.view()))
}

/// Tiles matrix columns into a 2-D grid of blocks separated by a border.
///
/// Each column is reshaped column-major into a `block_height` x `block_width`
/// cell; unset block dimensions default to a square derived from the column
/// height. Optionally rescales the final grid into `[min_range, max_range]`.
pub struct ColumnsToBlocks {
    rows: usize,
    cols: usize,
    block_height: usize,
    block_width: usize,
    buf_size: usize,
    buf_value: f64,
    min_range: f64,
    max_range: f64,
    scale: bool,
}

impl ColumnsToBlocks {
    /// Grid layout of `rows` x `cols` blocks, with a one-cell border of -1
    /// and no rescaling.
    pub fn new(rows: usize, cols: usize) -> Self {
        ColumnsToBlocks {
            rows,
            cols,
            block_height: 0,
            block_width: 0,
            buf_size: 1,
            buf_value: -1.0,
            min_range: 0.0,
            max_range: 255.0,
            scale: false,
        }
    }

    pub fn block_height(mut self, height: usize) -> Self {
        self.block_height = height;
        self
    }

    pub fn block_width(mut self, width: usize) -> Self {
        self.block_width = width;
        self
    }

    pub fn buf_size(mut self, size: usize) -> Self {
        self.buf_size = size;
        self
    }

    pub fn buf_value(mut self, value: f64) -> Self {
        self.buf_value = value;
        self
    }

    pub fn min_range(mut self, value: f64) -> Self {
        self.min_range = value;
        self
    }

    pub fn max_range(mut self, value: f64) -> Self {
        self.max_range = value;
        self
    }

    pub fn scale(mut self, scale: bool) -> Self {
        self.scale = scale;
        self
    }

    pub fn transform(&self, input: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        let height = input.nrows();
        let (block_height, block_width) = if self.block_height == 0 || self.block_width == 0 {
            let side = (height as f64).sqrt().round() as usize;
            if side * side != height {
                bail!(
                    "{} rows cannot be tiled into square blocks; set explicit block dimensions",
                    height
                );
            }
            (side, side)
        } else {
            (self.block_height, self.block_width)
        };
        if block_height * block_width != height {
            bail!(
                "block dimensions {}x{} do not match the column height {}",
                block_height,
                block_width,
                height
            );
        }

        let row_offset = block_height + self.buf_size;
        let col_offset = block_width + self.buf_size;
        let mut output = Array2::from_elem(
            (
                self.buf_size + self.rows * row_offset,
                self.buf_size + self.cols * col_offset,
            ),
            self.buf_value,
        );

        let mut k = 0;
        'blocks: for i in 0..self.rows {
            for j in 0..self.cols {
                if k >= input.ncols() {
                    break 'blocks;
                }
                let column = input.column(k);
                let r0 = self.buf_size + i * row_offset;
                let c0 = self.buf_size + j * col_offset;
                for c in 0..block_width {
                    for r in 0..block_height {
                        output[[r0 + r, c0 + c]] = column[c * block_height + r];
                    }
                }
                k += 1;
            }
        }

        if self.scale {
            let max = output.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
            let min = output.fold(f64::INFINITY, |acc, &v| acc.min(v));
            if max - min != 0.0 {
                let span = self.max_range - self.min_range;
                output.mapv_inplace(|v| (v - min) / (max - min) * span + self.min_range);
            }
        }

        Ok(output)
    }
}
