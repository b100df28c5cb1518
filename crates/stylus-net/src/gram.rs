// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Gram Matrix
// ─────────────────────────────────────────────────────────────────────
//! Texture statistics of a feature map.
//!
//! The (B, C, H, W) map is viewed as F with B·C rows of length H·W, and
//! G = F·Fᵀ / (B·C·H·W). G is symmetric by construction and its diagonal
//! holds squared row norms, so it is non-negative. Spatial arrangement is
//! discarded; only cross-channel co-activation survives.

use stylus_types::{StyleError, StyleResult};

use crate::tensor::Tensor;

/// Rows, row length and normaliser of the flattened view.
fn flat_view(x: &Tensor) -> StyleResult<(usize, usize, f64)> {
    let (b, c, h, w) = x.dims4()?;
    let norm = (b * c * h * w) as f64;
    if norm == 0.0 {
        return Err(StyleError::Shape(format!(
            "gram matrix of empty feature map {:?}",
            x.shape()
        )));
    }
    Ok((b * c, h * w, norm))
}

/// G = F·Fᵀ / (B·C·H·W), returned as a `[B·C, B·C]` tensor.
pub fn gram_matrix(x: &Tensor) -> StyleResult<Tensor> {
    let (rows, cols, norm) = flat_view(x)?;
    let f = x.data();
    let mut g = vec![0.0; rows * rows];
    for i in 0..rows {
        let fi = &f[i * cols..(i + 1) * cols];
        for j in i..rows {
            let fj = &f[j * cols..(j + 1) * cols];
            let dot: f64 = fi.iter().zip(fj.iter()).map(|(a, b)| a * b).sum();
            g[i * rows + j] = dot / norm;
            g[j * rows + i] = dot / norm;
        }
    }
    Tensor::new(vec![rows, rows], g)
}

/// ∂L/∂F given ∂L/∂G: (D + Dᵀ)·F / (B·C·H·W).
pub fn gram_backward(x: &Tensor, grad_gram: &Tensor) -> StyleResult<Tensor> {
    let (rows, cols, norm) = flat_view(x)?;
    if grad_gram.shape() != [rows, rows] {
        return Err(StyleError::Shape(format!(
            "gram gradient shape {:?} does not match [{rows}, {rows}]",
            grad_gram.shape()
        )));
    }
    let f = x.data();
    let d = grad_gram.data();
    let mut dx = vec![0.0; x.numel()];
    for i in 0..rows {
        let out = &mut dx[i * cols..(i + 1) * cols];
        for j in 0..rows {
            let coeff = (d[i * rows + j] + d[j * rows + i]) / norm;
            if coeff == 0.0 {
                continue;
            }
            let fj = &f[j * cols..(j + 1) * cols];
            for (o, v) in out.iter_mut().zip(fj.iter()) {
                *o += coeff * v;
            }
        }
    }
    x.with_data(dx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::tests::check_input_gradient;

    fn features() -> Tensor {
        Tensor::new(
            vec![1, 4, 3, 3],
            (0..36).map(|i| ((i as f64) * 1.3).sin() + 0.2).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_symmetric_nonneg_diagonal() {
        let g = gram_matrix(&features()).unwrap();
        assert_eq!(g.shape(), &[4, 4]);
        let d = g.data();
        for i in 0..4 {
            assert!(d[i * 4 + i] >= 0.0);
            for j in 0..4 {
                assert_eq!(d[i * 4 + j], d[j * 4 + i]);
            }
        }
    }

    #[test]
    fn test_known_values() {
        // Two channels of one pixel each: F = [[1], [2]], norm = 2.
        let x = Tensor::new(vec![1, 2, 1, 1], vec![1.0, 2.0]).unwrap();
        let g = gram_matrix(&x).unwrap();
        assert_eq!(g.data(), &[0.5, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_invariant_to_spatial_permutation() {
        let x = features();
        let mut shuffled = x.clone();
        // Reverse the pixel order of every channel identically.
        for c in 0..4 {
            let plane = &mut shuffled.data_mut()[c * 9..(c + 1) * 9];
            plane.reverse();
        }
        let a = gram_matrix(&x).unwrap();
        let b = gram_matrix(&shuffled).unwrap();
        for (u, v) in a.data().iter().zip(b.data().iter()) {
            assert!((u - v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_scale_normalisation() {
        // Doubling the spatial extent of a constant map leaves G unchanged.
        let small = Tensor::full(vec![1, 2, 2, 2], 0.5);
        let large = Tensor::full(vec![1, 2, 4, 4], 0.5);
        let gs = gram_matrix(&small).unwrap();
        let gl = gram_matrix(&large).unwrap();
        for (u, v) in gs.data().iter().zip(gl.data().iter()) {
            assert!((u - v).abs() < 1e-12);
        }
    }

    #[test]
    fn test_empty_map_rejected() {
        assert!(gram_matrix(&Tensor::zeros(vec![1, 2, 0, 3])).is_err());
    }

    #[test]
    fn test_gradient_matches_fd() {
        let x = features();
        check_input_gradient(
            &x,
            |t| gram_matrix(t).unwrap(),
            |t, g| gram_backward(t, g).unwrap(),
        );
    }
}
