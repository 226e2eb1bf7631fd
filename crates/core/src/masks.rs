//! Constant 0/1 masks for autoregressive networks.
//!
//! Masks are built on the host as row-major `(out, in)` buffers and uploaded
//! once with [`mask_tensor`]; they never receive gradients.

use candle_core::{Device, Result, Tensor};

/// Repeat `x` until it has exactly `len` elements.
pub fn tile_until_length<T: Copy>(x: &[T], len: usize) -> Vec<T> {
    if x.is_empty() {
        return Vec::new();
    }
    x.iter().copied().cycle().take(len).collect()
}

/// MADE connectivity: `mask[o][i] = 1` iff `out_ranks[o] > in_ranks[i]`
/// (`strict`) or `out_ranks[o] >= in_ranks[i]`.
pub fn rank_based_mask(in_ranks: &[i64], out_ranks: &[i64], strict: bool) -> Vec<f32> {
    let mut mask = Vec::with_capacity(in_ranks.len() * out_ranks.len());
    for &o in out_ranks {
        for &i in in_ranks {
            let connected = if strict { o > i } else { o >= i };
            mask.push(if connected { 1.0 } else { 0.0 });
        }
    }
    mask
}

/// Block-diagonal mask with `n_blocks` blocks of `(rows, cols)`.
pub fn block_diag_mask(block_shape: (usize, usize), n_blocks: usize) -> Vec<f32> {
    let (r, c) = block_shape;
    let (rows, cols) = (r * n_blocks, c * n_blocks);
    let mut mask = vec![0.0; rows * cols];
    for row in 0..rows {
        for col in 0..cols {
            if row / r == col / c {
                mask[row * cols + col] = 1.0;
            }
        }
    }
    mask
}

/// Strictly lower block-triangular mask (diagonal blocks excluded).
pub fn block_tril_mask(block_shape: (usize, usize), n_blocks: usize) -> Vec<f32> {
    let (r, c) = block_shape;
    let (rows, cols) = (r * n_blocks, c * n_blocks);
    let mut mask = vec![0.0; rows * cols];
    for row in 0..rows {
        for col in 0..cols {
            if row / r > col / c {
                mask[row * cols + col] = 1.0;
            }
        }
    }
    mask
}

/// Lower-triangular mask; `strict` excludes the diagonal.
pub fn tril_mask(n: usize, strict: bool) -> Vec<f32> {
    let mut mask = vec![0.0; n * n];
    for row in 0..n {
        for col in 0..n {
            if col < row || (!strict && col == row) {
                mask[row * n + col] = 1.0;
            }
        }
    }
    mask
}

/// Identity matrix buffer.
pub fn eye(n: usize) -> Vec<f32> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

/// Upload a `(rows, cols)` mask buffer.
pub fn mask_tensor(mask: Vec<f32>, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    Tensor::from_vec(mask, (rows, cols), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_until_length_cases() {
        assert_eq!(tile_until_length(&[1, 2], 4), vec![1, 2, 1, 2]);
        assert_eq!(tile_until_length(&[1, 2], 3), vec![1, 2, 1]);
        assert_eq!(tile_until_length(&[1, 2], 1), vec![1]);
    }

    #[test]
    fn strict_rank_mask_blocks_self_connection() {
        let m = rank_based_mask(&[0, 1, 2], &[0, 1, 2], true);
        #[rustfmt::skip]
        let expected = vec![
            0.0, 0.0, 0.0,
            1.0, 0.0, 0.0,
            1.0, 1.0, 0.0,
        ];
        assert_eq!(m, expected);
        let m = rank_based_mask(&[0, 1], &[1], false);
        assert_eq!(m, vec![1.0, 1.0]);
    }

    #[test]
    fn block_masks_partition_lower_triangle() {
        let diag = block_diag_mask((2, 1), 2);
        let tril = block_tril_mask((2, 1), 2);
        // (4, 2) matrices.
        assert_eq!(diag, vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
        assert_eq!(tril, vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn tril_and_eye() {
        assert_eq!(tril_mask(2, false), vec![1.0, 0.0, 1.0, 1.0]);
        assert_eq!(tril_mask(2, true), vec![0.0, 0.0, 1.0, 0.0]);
        assert_eq!(eye(2), vec![1.0, 0.0, 0.0, 1.0]);
    }
}
