//! Data pipeline: matrix loading, shuffling, splitting and batching.
//!
//! Training data is a plain text matrix, one sample per row, columns
//! separated by commas or whitespace. Lines starting with `#` are skipped,
//! and a leading non-numeric row is treated as a header.
//!
//! * **[`load_matrix`]** — read a file into a row-major [`Matrix`].
//! * **[`train_val_split`]** — consistent shuffle + split of several matrices.
//! * **[`batch_ranges`]** — row ranges for one epoch of mini-batches.
//! * **[`count_fruitless`]** — epochs since the best validation loss.

use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

// ── Matrix ──────────────────────────────────────────────────────────────────

/// Dense row-major f32 matrix held on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> AnyhowResult<Self> {
        if data.len() != rows * cols {
            anyhow::bail!(
                "matrix data has {} values, expected {rows} x {cols}",
                data.len()
            );
        }
        Ok(Self { data, rows, cols })
    }

    /// Build from a slice of equally sized rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> AnyhowResult<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                anyhow::bail!("row {i} has {} columns, expected {cols}", row.len());
            }
            data.extend_from_slice(row);
        }
        Self::new(data, rows.len(), cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Gather rows in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            data,
            rows: indices.len(),
            cols: self.cols,
        }
    }

    /// Contiguous block of rows.
    pub fn slice_rows(&self, range: Range<usize>) -> Self {
        let rows = range.end - range.start;
        Self {
            data: self.data[range.start * self.cols..range.end * self.cols].to_vec(),
            rows,
            cols: self.cols,
        }
    }

    /// Upload as a `(rows, cols)` F32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.data, (self.rows, self.cols), device)
    }

    /// Download a 2-D tensor.
    pub fn from_tensor(t: &Tensor) -> AnyhowResult<Self> {
        let (rows, cols) = t.dims2()?;
        let data = t.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;
        Self::new(data, rows, cols)
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

/// Parse a text matrix (CSV or whitespace separated).
pub fn parse_matrix(text: &str) -> AnyhowResult<Matrix> {
    let mut rows: Vec<Vec<f32>> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        let parsed: std::result::Result<Vec<f32>, _> =
            fields.iter().map(|f| f.parse::<f32>()).collect();
        match parsed {
            Ok(row) => rows.push(row),
            // Header: only allowed before any data row.
            Err(_) if rows.is_empty() => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("parse line {}", line_no + 1));
            }
        }
    }
    if rows.is_empty() {
        anyhow::bail!("no numeric rows found");
    }
    Matrix::from_rows(&rows)
}

/// Load a text matrix from `path`.
pub fn load_matrix(path: &Path) -> AnyhowResult<Matrix> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read data file {}", path.display()))?;
    parse_matrix(&text).with_context(|| format!("parse data file {}", path.display()))
}

/// Write a matrix as CSV.
pub fn write_matrix(path: &Path, m: &Matrix) -> AnyhowResult<()> {
    let mut out = String::with_capacity(m.rows * m.cols * 10);
    for i in 0..m.rows {
        let row: Vec<String> = m.row(i).iter().map(|v| v.to_string()).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    std::fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

// ── Shuffling & splitting ───────────────────────────────────────────────────

/// Permute the rows of several matrices with one shared permutation.
pub fn random_permutation_multiple<R: Rng + ?Sized>(
    rng: &mut R,
    arrays: &[&Matrix],
) -> AnyhowResult<Vec<Matrix>> {
    let n = match arrays.first() {
        Some(a) => a.rows(),
        None => return Ok(Vec::new()),
    };
    if let Some(bad) = arrays.iter().find(|a| a.rows() != n) {
        anyhow::bail!("row count mismatch: {} vs {n}", bad.rows());
    }
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    Ok(arrays.iter().map(|a| a.select_rows(&perm)).collect())
}

/// Shuffle then split rows into `(train, val)`; the last
/// `round(val_prop * n)` rows of the shuffled data form the validation set.
pub fn train_val_split<R: Rng + ?Sized>(
    rng: &mut R,
    arrays: &[&Matrix],
    val_prop: f64,
) -> AnyhowResult<(Vec<Matrix>, Vec<Matrix>)> {
    if !(0.0..=1.0).contains(&val_prop) {
        anyhow::bail!("val_prop must be in [0, 1], got {val_prop}");
    }
    let shuffled = random_permutation_multiple(rng, arrays)?;
    let n = shuffled.first().map(|a| a.rows()).unwrap_or(0);
    let n_val = (val_prop * n as f64).round() as usize;
    let n_train = n - n_val;
    let train = shuffled.iter().map(|a| a.slice_rows(0..n_train)).collect();
    let val = shuffled.iter().map(|a| a.slice_rows(n_train..n)).collect();
    Ok((train, val))
}

// ── Batching ────────────────────────────────────────────────────────────────

/// Row ranges of full mini-batches; a trailing partial batch is dropped.
/// When fewer than `batch_size` rows exist, one batch covers all of them.
pub fn batch_ranges(n: usize, batch_size: usize) -> Vec<Range<usize>> {
    if n == 0 {
        return Vec::new();
    }
    if batch_size == 0 || n <= batch_size {
        return vec![0..n];
    }
    (0..=n - batch_size)
        .step_by(batch_size)
        .map(|start| start..start + batch_size)
        .collect()
}

/// Row ranges of `batch_size` chunks covering every row; the last chunk may
/// be short. Used where no row may be skipped, e.g. validation.
pub fn chunk_ranges(n: usize, batch_size: usize) -> Vec<Range<usize>> {
    if batch_size == 0 {
        return if n == 0 { Vec::new() } else { vec![0..n] };
    }
    (0..n)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(n))
        .collect()
}

/// Number of epochs since the minimum loss.
pub fn count_fruitless(losses: &[f32]) -> usize {
    let min_idx = losses
        .iter()
        .enumerate()
        .fold(None::<(usize, f32)>, |best, (i, &l)| match best {
            Some((_, b)) if b <= l => best,
            _ => Some((i, l)),
        })
        .map(|(i, _)| i);
    match min_idx {
        Some(i) => losses.len() - i - 1,
        None => 0,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
