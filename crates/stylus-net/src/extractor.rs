// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Pretrained Feature Extractor
// ─────────────────────────────────────────────────────────────────────
//! Ordered layer sequence of a pretrained convolutional network.
//!
//! The extractor is read-only from the transfer kernel's point of view.
//! Descriptions arrive from outside (JSON with embedded weights), so the
//! layer enum carries an `Unsupported` variant for layer types the
//! description contains but this kernel does not model.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use stylus_types::{StyleError, StyleResult};

use crate::layers::{BatchNorm2d, Conv2d, MaxPool2d, Relu};
use crate::tensor::Tensor;

/// The closed set of layer kinds a style pipeline can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Convolution,
    Activation,
    SpatialPool,
    BatchNormalize,
}

impl LayerKind {
    /// Prefix of the canonical stage name (`conv_3`, `relu_3`, ...).
    pub fn prefix(self) -> &'static str {
        match self {
            LayerKind::Convolution => "conv",
            LayerKind::Activation => "relu",
            LayerKind::SpatialPool => "pool",
            LayerKind::BatchNormalize => "bn",
        }
    }
}

/// One layer of an externally supplied extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorLayer {
    Convolution(Conv2d),
    Activation(Relu),
    SpatialPool(MaxPool2d),
    BatchNormalize(BatchNorm2d),
    /// A layer type outside the supported set (dropout, linear, ...).
    Unsupported { type_name: String },
}

impl ExtractorLayer {
    pub fn type_name(&self) -> &str {
        match self {
            ExtractorLayer::Convolution(_) => "Conv2d",
            ExtractorLayer::Activation(_) => "ReLU",
            ExtractorLayer::SpatialPool(_) => "MaxPool2d",
            ExtractorLayer::BatchNormalize(_) => "BatchNorm2d",
            ExtractorLayer::Unsupported { type_name } => type_name,
        }
    }
}

/// Ordered, structurally immutable layer sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureExtractor {
    layers: Vec<ExtractorLayer>,
}

impl FeatureExtractor {
    pub fn new(layers: Vec<ExtractorLayer>) -> StyleResult<Self> {
        let extractor = Self { layers };
        extractor.validate()?;
        Ok(extractor)
    }

    pub fn layers(&self) -> &[ExtractorLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Check parameter shapes of every supported layer.
    ///
    /// Unsupported layers are left for the pipeline builder to reject.
    pub fn validate(&self) -> StyleResult<()> {
        for (pos, layer) in self.layers.iter().enumerate() {
            let checked = match layer {
                ExtractorLayer::Convolution(conv) => conv.validate(),
                ExtractorLayer::BatchNormalize(bn) => bn.validate(),
                ExtractorLayer::SpatialPool(pool) if pool.kernel == 0 || pool.stride == 0 => Err(
                    StyleError::Shape("pool kernel and stride must be >= 1".to_string()),
                ),
                _ => Ok(()),
            };
            checked.map_err(|e| StyleError::Shape(format!("layer {pos}: {e}")))?;
        }
        Ok(())
    }

    /// Load a description with embedded weights from JSON.
    pub fn from_json(json: &str) -> StyleResult<Self> {
        let extractor: Self = serde_json::from_str(json)
            .map_err(|e| StyleError::Config(format!("extractor JSON parse error: {e}")))?;
        extractor.validate()?;
        log::debug!("Loaded feature extractor with {} layers", extractor.len());
        Ok(extractor)
    }

    pub fn to_json(&self) -> StyleResult<String> {
        serde_json::to_string(self)
            .map_err(|e| StyleError::Config(format!("extractor JSON encode error: {e}")))
    }

    /// Plain inference through every layer.
    ///
    /// In-place activations overwrite their input here; nothing else holds
    /// the intermediate tensors.
    pub fn forward(&self, x: &Tensor) -> StyleResult<Tensor> {
        let mut act = x.clone();
        for (pos, layer) in self.layers.iter().enumerate() {
            act = match layer {
                ExtractorLayer::Convolution(conv) => conv.forward(&act)?,
                ExtractorLayer::Activation(relu) if relu.inplace => {
                    relu.forward_inplace(&mut act);
                    act
                }
                ExtractorLayer::Activation(relu) => relu.forward(&act)?,
                ExtractorLayer::SpatialPool(pool) => pool.forward(&act)?,
                ExtractorLayer::BatchNormalize(bn) => bn.forward(&act)?,
                ExtractorLayer::Unsupported { type_name } => {
                    return Err(StyleError::UnrecognizedLayer {
                        position: pos,
                        type_name: type_name.clone(),
                    })
                }
            };
        }
        Ok(act)
    }

    /// VGG-shaped extractor with He-normal weights and zero bias.
    ///
    /// One block per entry of `widths`: `convs_per_block` × (3×3 conv,
    /// in-place ReLU), then a 2×2 max pool. Deterministic for a given seed.
    pub fn vgg_like(
        in_channels: usize,
        widths: &[usize],
        convs_per_block: usize,
        seed: u64,
    ) -> StyleResult<Self> {
        if in_channels == 0 || convs_per_block == 0 || widths.contains(&0) {
            return Err(StyleError::Config(
                "vgg_like needs non-zero channels, widths and convs_per_block".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut layers = Vec::with_capacity(widths.len() * (2 * convs_per_block + 1));
        let mut prev = in_channels;

        for &width in widths {
            for _ in 0..convs_per_block {
                let fan_in = prev * 9;
                let normal = Normal::new(0.0, (2.0 / fan_in as f64).sqrt())
                    .map_err(|e| StyleError::Config(format!("weight init: {e}")))?;
                let weight = (0..width * fan_in).map(|_| normal.sample(&mut rng)).collect();
                layers.push(ExtractorLayer::Convolution(Conv2d::new(
                    prev,
                    width,
                    3,
                    1,
                    1,
                    weight,
                    vec![0.0; width],
                )?));
                layers.push(ExtractorLayer::Activation(Relu { inplace: true }));
                prev = width;
            }
            layers.push(ExtractorLayer::SpatialPool(MaxPool2d::new(2, 2)));
        }
        Self::new(layers)
    }
}
