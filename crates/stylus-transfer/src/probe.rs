// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Loss Probes
// ─────────────────────────────────────────────────────────────────────
//! Transparent pipeline stages that compare the live activation at their
//! position against a target captured once at build time.
//!
//! A probe never alters the data flowing through it. Its forward pass
//! hands back the untouched input together with the measured loss, so
//! callers collect losses explicitly instead of reading probe state.

use stylus_net::{gram_backward, gram_matrix, mse, mse_grad, Tensor};
use stylus_types::StyleResult;

/// Shared behaviour of content and style probes.
pub trait LossProbe {
    /// Pass `x` through unchanged and report the loss against the target.
    fn forward<'a>(&self, x: &'a Tensor) -> StyleResult<(&'a Tensor, f64)>;

    /// ∂(scale · loss)/∂x.
    fn backward(&self, x: &Tensor, scale: f64) -> StyleResult<Tensor>;

    fn target(&self) -> &Tensor;
}

/// Mean-squared error between raw activations.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentProbe {
    target: Tensor,
}

impl ContentProbe {
    /// Snapshot `activation` as the target. Later changes to the source
    /// tensor do not reach the probe.
    pub fn new(activation: &Tensor) -> Self {
        Self {
            target: activation.clone(),
        }
    }
}

impl LossProbe for ContentProbe {
    fn forward<'a>(&self, x: &'a Tensor) -> StyleResult<(&'a Tensor, f64)> {
        Ok((x, mse(x, &self.target)?))
    }

    fn backward(&self, x: &Tensor, scale: f64) -> StyleResult<Tensor> {
        mse_grad(x, &self.target, scale)
    }

    fn target(&self) -> &Tensor {
        &self.target
    }
}

/// Mean-squared error between Gram matrices.
///
/// The stored target is the Gram matrix of the build-time activation, not
/// the activation itself.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleProbe {
    target: Tensor,
}

impl StyleProbe {
    pub fn new(activation: &Tensor) -> StyleResult<Self> {
        Ok(Self {
            target: gram_matrix(activation)?,
        })
    }
}

impl LossProbe for StyleProbe {
    fn forward<'a>(&self, x: &'a Tensor) -> StyleResult<(&'a Tensor, f64)> {
        let g = gram_matrix(x)?;
        Ok((x, mse(&g, &self.target)?))
    }

    fn backward(&self, x: &Tensor, scale: f64) -> StyleResult<Tensor> {
        let g = gram_matrix(x)?;
        let d_gram = mse_grad(&g, &self.target, scale)?;
        gram_backward(x, &d_gram)
    }

    fn target(&self) -> &Tensor {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activation(seed: f64) -> Tensor {
        Tensor::new(
            vec![1, 3, 4, 4],
            (0..48).map(|i| ((i as f64) * seed).sin().abs()).collect(),
        )
        .unwrap()
    }

    fn check_probe_gradient(probe: &dyn LossProbe, x: &Tensor, scale: f64) {
        let analytic = probe.backward(x, scale).unwrap();
        let eps = 1e-6;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data_mut()[i] += eps;
            let mut minus = x.clone();
            minus.data_mut()[i] -= eps;
            let fd = scale * (probe.forward(&plus).unwrap().1 - probe.forward(&minus).unwrap().1)
                / (2.0 * eps);
            let a = analytic.data()[i];
            assert!(
                (a - fd).abs() < 1e-6 * (1.0 + fd.abs()),
                "component {i}: analytic={a:.10}, fd={fd:.10}"
            );
        }
    }

    #[test]
    fn test_content_zero_at_target() {
        let t = activation(0.7);
        let probe = ContentProbe::new(&t);
        let (_, loss) = probe.forward(&t).unwrap();
        assert_eq!(loss, 0.0);
        assert!(probe.backward(&t, 1.0).unwrap().data().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_content_positive_elsewhere() {
        let probe = ContentProbe::new(&activation(0.7));
        let (_, loss) = probe.forward(&activation(0.3)).unwrap();
        assert!(loss > 0.0);
    }

    #[test]
    fn test_forward_is_passthrough() {
        let x = activation(0.5);
        let content = ContentProbe::new(&activation(0.9));
        let style = StyleProbe::new(&activation(0.9)).unwrap();
        let (out, _) = content.forward(&x).unwrap();
        assert!(std::ptr::eq(out, &x));
        let (out, _) = style.forward(&x).unwrap();
        assert!(std::ptr::eq(out, &x));
    }

    #[test]
    fn test_target_is_a_snapshot() {
        let mut source = activation(0.7);
        let probe = ContentProbe::new(&source);
        source.data_mut()[0] += 5.0;
        assert_ne!(probe.target(), &source);
    }

    #[test]
    fn test_style_target_is_gram() {
        let t = activation(0.7);
        let probe = StyleProbe::new(&t).unwrap();
        assert_eq!(probe.target().shape(), &[3, 3]);
        assert_eq!(probe.target(), &gram_matrix(&t).unwrap());
    }

    #[test]
    fn test_style_zero_for_same_gram() {
        let t = activation(0.7);
        let probe = StyleProbe::new(&t).unwrap();
        assert_eq!(probe.forward(&t).unwrap().1, 0.0);

        // Transposing every channel plane keeps each inner product.
        let mut moved = t.clone();
        for c in 0..3 {
            for y in 0..4 {
                for x in 0..4 {
                    moved.data_mut()[c * 16 + y * 4 + x] = t.data()[c * 16 + x * 4 + y];
                }
            }
        }
        assert_ne!(moved, t);
        let (_, loss) = probe.forward(&moved).unwrap();
        assert!(loss.abs() < 1e-20, "loss = {loss}");
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let probe = ContentProbe::new(&activation(0.7));
        assert!(probe.forward(&Tensor::zeros(vec![1, 3, 2, 2])).is_err());
        let probe = StyleProbe::new(&activation(0.7)).unwrap();
        assert!(probe.forward(&Tensor::zeros(vec![1, 2, 4, 4])).is_err());
    }

    #[test]
    fn test_content_gradient() {
        let probe = ContentProbe::new(&activation(0.7));
        check_probe_gradient(&probe, &activation(0.3), 2.5);
    }

    #[test]
    fn test_style_gradient() {
        let probe = StyleProbe::new(&activation(0.7)).unwrap();
        check_probe_gradient(&probe, &activation(0.3), 1000.0);
    }
}
