use burn::{
    config::Config,
    nn::{
        Dropout, DropoutConfig,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::{Int, activation::relu},
};

use super::{
    crp::{ChainedResidualPool, DEFAULT_CRP_STAGES},
    encoder::PyramidFeatures,
    head::{ClassificationHead, HEAD_INPUT_CHANNELS},
};
use crate::{
    imprint::embedding::{EmbeddingSet, masked_embeddings},
    model::refinenet::{
        ForwardMode, PyramidLevel,
        interpolate::{ScoreInterpolation, hw, resize_bilinear_aligned, resize_scores},
    },
};

fn pointwise<B: Backend>(device: &B::Device, channels: [usize; 2]) -> Conv2d<B> {
    Conv2dConfig::new(channels, [1, 1])
        .with_bias(false)
        .init(device)
}

/// One refinement step of the decoder.
///
/// The coarsest stage reduces its level, applies ReLU and pools. Finer stages
/// reduce and adapt their level, add the upsampled coarser output and apply
/// ReLU before pooling. All but the finest stage end with a `joint` projection
/// to the head width.
#[derive(Module, Debug)]
pub struct FusionStage<B: Backend> {
    reduce: Conv2d<B>,
    adapt: Option<Conv2d<B>>,
    crp: ChainedResidualPool<B>,
    joint: Option<Conv2d<B>>,
}

impl<B: Backend> FusionStage<B> {
    pub fn top(
        device: &B::Device,
        in_channels: usize,
        top_features: usize,
        crp_stages: usize,
    ) -> Self {
        Self {
            reduce: pointwise(device, [in_channels, top_features]),
            adapt: None,
            crp: ChainedResidualPool::new(device, top_features, crp_stages),
            joint: Some(pointwise(device, [top_features, HEAD_INPUT_CHANNELS])),
        }
    }

    pub fn lateral(device: &B::Device, in_channels: usize, crp_stages: usize, joint: bool) -> Self {
        let width = HEAD_INPUT_CHANNELS;
        Self {
            reduce: pointwise(device, [in_channels, width]),
            adapt: Some(pointwise(device, [width, width])),
            crp: ChainedResidualPool::new(device, width, crp_stages),
            joint: joint.then(|| pointwise(device, [width, width])),
        }
    }

    /// Fused output at the resolution of `level`.
    pub fn forward(&self, level: Tensor<B, 4>, coarser: Option<Tensor<B, 4>>) -> Tensor<B, 4> {
        let mut x = self.reduce.forward(level);
        if let Some(adapt) = &self.adapt {
            x = adapt.forward(x);
        }
        if let Some(coarser) = coarser {
            x = x + coarser;
        }
        x = self.crp.forward(relu(x));

        match &self.joint {
            Some(joint) => joint.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct PyramidDecoderConfig {
    /// Channel widths of backbone levels l1..l4.
    pub level_channels: [usize; 4],
    pub n_classes: usize,
    #[config(default = "512")]
    pub top_features: usize,
    #[config(default = "DEFAULT_CRP_STAGES")]
    pub crp_stages: usize,
    #[config(default = "0.5")]
    pub dropout: f64,
}

impl PyramidDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PyramidDecoder<B> {
        let [c1, c2, c3, c4] = self.level_channels;
        let crp = self.crp_stages;

        PyramidDecoder {
            stage4: FusionStage::top(device, c4, self.top_features, crp),
            stage3: FusionStage::lateral(device, c3, crp, true),
            stage2: FusionStage::lateral(device, c2, crp, true),
            stage1: FusionStage::lateral(device, c1, crp, false),
            clf: ClassificationHead::new(device, self.n_classes),
            clf_l2: ClassificationHead::new(device, self.n_classes),
            clf_l3: ClassificationHead::new(device, self.n_classes),
            clf_l4: ClassificationHead::new(device, self.n_classes),
            dropout: DropoutConfig::new(self.dropout).init(),
            n_classes: self.n_classes,
        }
    }
}

/// Pre-head fused tensors, each at its own backbone level's resolution.
#[derive(Debug, Clone)]
pub struct FusedPyramid<B: Backend> {
    pub stage4: Tensor<B, 4>,
    pub stage3: Tensor<B, 4>,
    pub stage2: Tensor<B, 4>,
    pub stage1: Tensor<B, 4>,
}

impl<B: Backend> FusedPyramid<B> {
    pub fn get(&self, level: PyramidLevel) -> &Tensor<B, 4> {
        match level {
            PyramidLevel::L1 => &self.stage1,
            PyramidLevel::L2 => &self.stage2,
            PyramidLevel::L3 => &self.stage3,
            PyramidLevel::L4 => &self.stage4,
        }
    }
}

/// Training-mode score maps at native stage resolution.
#[derive(Debug, Clone)]
pub struct DeepSupervision<B: Backend> {
    pub primary: Tensor<B, 4>,
    pub aux_l4: Tensor<B, 4>,
    pub aux_l3: Tensor<B, 4>,
    pub aux_l2: Tensor<B, 4>,
}

impl<B: Backend> DeepSupervision<B> {
    /// Maps in the order primary, l4, l3, l2.
    pub fn into_vec(self) -> Vec<Tensor<B, 4>> {
        vec![self.primary, self.aux_l4, self.aux_l3, self.aux_l2]
    }
}

#[derive(Debug, Clone)]
pub enum DecoderOutput<B: Backend> {
    DeepSupervision(DeepSupervision<B>),
    /// Sum of all four maps at input resolution.
    Fused(Tensor<B, 4>),
}

impl<B: Backend> DecoderOutput<B> {
    pub fn fused(self) -> Option<Tensor<B, 4>> {
        match self {
            Self::Fused(scores) => Some(scores),
            Self::DeepSupervision(_) => None,
        }
    }

    pub fn deep_supervision(self) -> Option<DeepSupervision<B>> {
        match self {
            Self::DeepSupervision(maps) => Some(maps),
            Self::Fused(_) => None,
        }
    }
}

#[derive(Module, Debug)]
pub struct PyramidDecoder<B: Backend> {
    stage4: FusionStage<B>,
    stage3: FusionStage<B>,
    stage2: FusionStage<B>,
    stage1: FusionStage<B>,
    clf: ClassificationHead<B>,
    clf_l2: ClassificationHead<B>,
    clf_l3: ClassificationHead<B>,
    clf_l4: ClassificationHead<B>,
    dropout: Dropout,
    n_classes: usize,
}

impl<B: Backend> PyramidDecoder<B> {
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Runs the four fusion stages, coarsest first.
    pub fn fuse(&self, features: PyramidFeatures<B>, mode: ForwardMode) -> FusedPyramid<B> {
        let PyramidFeatures { l1, l2, l3, l4 } = features;
        let (l3, l4) = match mode {
            ForwardMode::Training => (self.dropout.forward(l3), self.dropout.forward(l4)),
            ForwardMode::Inference => (l3, l4),
        };

        let size3 = hw(&l3);
        let size2 = hw(&l2);
        let size1 = hw(&l1);

        let stage4 = self.stage4.forward(l4, None);
        let stage3 = self
            .stage3
            .forward(l3, Some(resize_bilinear_aligned(stage4.clone(), size3)));
        let stage2 = self
            .stage2
            .forward(l2, Some(resize_bilinear_aligned(stage3.clone(), size2)));
        let stage1 = self
            .stage1
            .forward(l1, Some(resize_bilinear_aligned(stage2.clone(), size1)));

        log::debug!(
            "fused pyramid: l4 {:?}, l3 {:?}, l2 {:?}, l1 {:?}",
            stage4.dims(),
            stage3.dims(),
            stage2.dims(),
            stage1.dims()
        );

        FusedPyramid {
            stage4,
            stage3,
            stage2,
            stage1,
        }
    }

    /// Score mode. `input_size` is the image height and width, used only when
    /// fusing in inference mode.
    pub fn forward(
        &self,
        features: PyramidFeatures<B>,
        input_size: [usize; 2],
        mode: ForwardMode,
        interpolation: ScoreInterpolation,
    ) -> DecoderOutput<B> {
        let fused = self.fuse(features, mode);

        let maps = DeepSupervision {
            primary: self.clf.forward(fused.stage1),
            aux_l4: self.clf_l4.forward(fused.stage4),
            aux_l3: self.clf_l3.forward(fused.stage3),
            aux_l2: self.clf_l2.forward(fused.stage2),
        };

        match mode {
            ForwardMode::Training => DecoderOutput::DeepSupervision(maps),
            ForwardMode::Inference => {
                let resize = |map: Tensor<B, 4>| resize_scores(map, input_size, interpolation);
                DecoderOutput::Fused(
                    resize(maps.primary)
                        + resize(maps.aux_l2)
                        + resize(maps.aux_l3)
                        + resize(maps.aux_l4),
                )
            }
        }
    }

    /// Embedding mode: class-masked means of every stage's pre-head tensor.
    pub fn extract(
        &self,
        features: PyramidFeatures<B>,
        labels: Tensor<B, 3, Int>,
        class_slots: usize,
        ignore_index: usize,
    ) -> EmbeddingSet<B> {
        let fused = self.fuse(features, ForwardMode::Inference);
        let embed = |feature: Tensor<B, 4>| {
            masked_embeddings(feature, labels.clone(), class_slots, ignore_index)
        };

        EmbeddingSet {
            l4: embed(fused.stage4),
            l3: embed(fused.stage3),
            l2: embed(fused.stage2),
            l1: embed(fused.stage1),
        }
    }

    pub fn head(&self, level: PyramidLevel) -> &ClassificationHead<B> {
        match level {
            PyramidLevel::L1 => &self.clf,
            PyramidLevel::L2 => &self.clf_l2,
            PyramidLevel::L3 => &self.clf_l3,
            PyramidLevel::L4 => &self.clf_l4,
        }
    }

    pub(crate) fn replace_head(&mut self, level: PyramidLevel, head: ClassificationHead<B>) {
        let slot = match level {
            PyramidLevel::L1 => &mut self.clf,
            PyramidLevel::L2 => &mut self.clf_l2,
            PyramidLevel::L3 => &mut self.clf_l3,
            PyramidLevel::L4 => &mut self.clf_l4,
        };
        *slot = head;
    }

    pub(crate) fn set_n_classes(&mut self, n_classes: usize) {
        self.n_classes = n_classes;
    }

    /// Panics unless every head reads the fused width and emits `n_classes` maps.
    pub fn check_heads(&self) {
        for level in PyramidLevel::ALL {
            let head = self.head(level);
            assert_eq!(
                head.input_channels(),
                HEAD_INPUT_CHANNELS,
                "{level:?} head reads {} channels",
                head.input_channels()
            );
            assert_eq!(
                head.classes(),
                self.n_classes,
                "{level:?} head emits {} classes, decoder expects {}",
                head.classes(),
                self.n_classes
            );
        }
    }
}
