// ─────────────────────────────────────────────────────────────────────
// Stylus Kernel — Pipeline Builder
// ─────────────────────────────────────────────────────────────────────
//! Turns a pretrained extractor plus a probe plan into a `StyleModel`.
//!
//! Steps:
//!   1. Check the content/style image pair
//!   2. Classify every layer (fails before any forward pass)
//!   3. Assign canonical names, substitute out-of-place activations
//!   4. Attach content/style probes at configured names
//!   5. Truncate after the last probe

use std::collections::BTreeSet;

use log::{debug, info, warn};

use stylus_net::{ExtractorLayer, FeatureExtractor, LayerKind, Normalization, Relu, Tensor};
use stylus_types::{StyleError, StyleResult, TransferConfig};

use crate::pipeline::{Pipeline, StageOp, StyleModel};
use crate::probe::{ContentProbe, StyleProbe};

/// Canonical names that receive probes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbePlan {
    pub content_layers: BTreeSet<String>,
    pub style_layers: BTreeSet<String>,
}

impl ProbePlan {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            content_layers: cfg.content_layers.clone(),
            style_layers: cfg.style_layers.clone(),
        }
    }
}

/// Block-index naming: the index advances at every convolution and every
/// other layer inherits the index of the most recent one.
#[derive(Debug, Default)]
pub struct CanonicalNamer {
    block: usize,
}

impl CanonicalNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&mut self, kind: LayerKind) -> String {
        if kind == LayerKind::Convolution {
            self.block += 1;
        }
        format!("{}_{}", kind.prefix(), self.block)
    }
}

/// Content and style images must be batch-1 NCHW tensors of one shape
/// whose channel count matches the normalization stage.
pub fn check_image_pair(
    content: &Tensor,
    style: &Tensor,
    normalization: &Normalization,
) -> StyleResult<()> {
    if content.shape() != style.shape() {
        return Err(StyleError::Precondition(format!(
            "content image {:?} and style image {:?} differ in shape",
            content.shape(),
            style.shape()
        )));
    }
    let (n, c, h, w) = content
        .dims4()
        .map_err(|e| StyleError::Precondition(e.to_string()))?;
    if n != 1 {
        return Err(StyleError::Precondition(format!(
            "expected a single-image batch, got batch size {n}"
        )));
    }
    if c != normalization.channels() {
        return Err(StyleError::Precondition(format!(
            "images have {c} channels, normalization expects {}",
            normalization.channels()
        )));
    }
    if h == 0 || w == 0 {
        return Err(StyleError::Precondition(format!("images have empty spatial extent {h}x{w}")));
    }
    Ok(())
}

/// Owned copy of one extractor layer as a pipeline op.
fn classify(pos: usize, layer: &ExtractorLayer) -> StyleResult<(LayerKind, StageOp)> {
    match layer {
        ExtractorLayer::Convolution(conv) => Ok((
            LayerKind::Convolution,
            StageOp::Convolution(conv.clone()),
        )),
        ExtractorLayer::Activation(_) => Ok((
            LayerKind::Activation,
            StageOp::Activation(Relu::out_of_place()),
        )),
        ExtractorLayer::SpatialPool(pool) => Ok((
            LayerKind::SpatialPool,
            StageOp::SpatialPool(*pool),
        )),
        ExtractorLayer::BatchNormalize(bn) => Ok((
            LayerKind::BatchNormalize,
            StageOp::BatchNormalize(bn.clone()),
        )),
        ExtractorLayer::Unsupported { type_name } => Err(StyleError::UnrecognizedLayer {
            position: pos,
            type_name: type_name.clone(),
        }),
    }
}

/// Fixed image pushed lazily through the pipeline as it grows.
struct Cursor {
    activation: Tensor,
    next_stage: usize,
}

impl Cursor {
    fn new(image: &Tensor) -> Self {
        Self {
            activation: image.clone(),
            next_stage: 0,
        }
    }

    /// Activation after every stage built so far.
    fn advance(&mut self, pipeline: &Pipeline) -> StyleResult<&Tensor> {
        for stage in &pipeline.stages()[self.next_stage..] {
            if let Some(next) = stage.op.apply(&self.activation)? {
                self.activation = next;
            }
        }
        self.next_stage = pipeline.len();
        Ok(&self.activation)
    }
}

/// Build the probe-instrumented pipeline.
///
/// The extractor is only read; every layer in the result is an owned copy.
pub fn build_style_model(
    extractor: &FeatureExtractor,
    normalization: &Normalization,
    style_img: &Tensor,
    content_img: &Tensor,
    plan: &ProbePlan,
) -> StyleResult<StyleModel> {
    check_image_pair(content_img, style_img, normalization)?;

    let ops = extractor
        .layers()
        .iter()
        .enumerate()
        .map(|(pos, layer)| classify(pos, layer))
        .collect::<StyleResult<Vec<_>>>()?;

    let mut pipeline = Pipeline::new(normalization.clone());
    let mut namer = CanonicalNamer::new();
    let mut content_cursor = Cursor::new(content_img);
    let mut style_cursor = Cursor::new(style_img);
    let mut content_probes = Vec::new();
    let mut style_probes = Vec::new();
    let mut matched = BTreeSet::new();

    for (kind, op) in ops {
        let name = namer.name(kind);
        pipeline.push(name.clone(), op)?;

        if plan.content_layers.contains(&name) {
            let target = content_cursor.advance(&pipeline)?;
            content_probes.push(ContentProbe::new(target));
            pipeline.push(
                format!("content_loss_{name}"),
                StageOp::ContentProbe(content_probes.len() - 1),
            )?;
            debug!("Content probe after {name}, target shape {:?}", target.shape());
            matched.insert(name.clone());
        }

        if plan.style_layers.contains(&name) {
            let target = style_cursor.advance(&pipeline)?;
            style_probes.push(StyleProbe::new(target)?);
            pipeline.push(
                format!("style_loss_{name}"),
                StageOp::StyleProbe(style_probes.len() - 1),
            )?;
            debug!("Style probe after {name}, target shape {:?}", target.shape());
            matched.insert(name);
        }
    }

    for missing in plan
        .content_layers
        .union(&plan.style_layers)
        .filter(|n| !matched.contains(*n))
    {
        warn!("Configured layer '{missing}' does not occur in the extractor");
    }

    if content_probes.is_empty() && style_probes.is_empty() {
        return Err(StyleError::Pipeline(
            "no configured layer name matched the extractor".to_string(),
        ));
    }

    let removed = pipeline.truncate_after_last_probe();
    info!(
        "Built style pipeline: {} stages, {} style probes, {} content probes ({removed} trailing layers dropped)",
        pipeline.len(),
        style_probes.len(),
        content_probes.len()
    );

    Ok(StyleModel {
        pipeline,
        style_probes,
        content_probes,
    })
}
