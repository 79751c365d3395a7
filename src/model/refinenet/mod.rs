use std::path::Path;

use burn::{
    module::{Ignored, Module},
    prelude::*,
    record::{HalfPrecisionSettings, NamedMpkFileRecorder, RecorderError},
    tensor::Int,
};

pub mod layers {
    pub mod crp;
    pub mod decoder;
    pub mod encoder;
    pub mod head;
}
pub mod interpolate;

pub use interpolate::ScoreInterpolation;
pub use layers::{
    decoder::{DecoderOutput, DeepSupervision, FusedPyramid, PyramidDecoder, PyramidDecoderConfig},
    encoder::{BackboneDepth, PyramidFeatures, ResNetEncoder},
    head::{ClassificationHead, HEAD_INPUT_CHANNELS},
};

use super::{ModelError, PretrainedWeights, WeightScope};
use crate::imprint::embedding::EmbeddingSet;
use interpolate::hw;
use layers::crp::DEFAULT_CRP_STAGES;

/// Backbone level, and the fusion stage and head attached to it. L4 is coarsest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PyramidLevel {
    L1,
    L2,
    L3,
    L4,
}

impl PyramidLevel {
    /// Decoding order, coarsest first.
    pub const ALL: [Self; 4] = [Self::L4, Self::L3, Self::L2, Self::L1];

    pub fn head_name(self) -> &'static str {
        match self {
            Self::L1 => "clf",
            Self::L2 => "clf_l2",
            Self::L3 => "clf_l3",
            Self::L4 => "clf_l4",
        }
    }
}

#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Four score maps at native stage resolution, dropout on l3/l4.
    Training,
    /// One summed score map at input resolution.
    Inference,
}

impl Default for ForwardMode {
    fn default() -> Self {
        Self::Inference
    }
}

#[derive(Config, Debug)]
pub struct RefineNetConfig {
    pub depth: BackboneDepth,
    pub n_classes: usize,
    #[config(default = "512")]
    pub top_features: usize,
    #[config(default = "DEFAULT_CRP_STAGES")]
    pub crp_stages: usize,
    #[config(default = "0.5")]
    pub dropout: f64,
    #[config(default = "255")]
    pub ignore_index: usize,
    /// Initialise the encoder from ImageNet weights.
    #[config(default = "false")]
    pub imagenet: bool,
    /// Initialise the whole model from a dataset checkpoint when one exists for
    /// `n_classes`.
    #[config(default = "true")]
    pub pretrained: bool,
    #[config(default = "ScoreInterpolation::AlignCorners")]
    pub score_interpolation: ScoreInterpolation,
    #[config(default = "ForwardMode::Inference")]
    pub mode: ForwardMode,
}

impl RefineNetConfig {
    pub fn rf_lw50(n_classes: usize) -> Self {
        Self::new(BackboneDepth::ResNet50, n_classes)
    }

    pub fn rf_lw101(n_classes: usize) -> Self {
        Self::new(BackboneDepth::ResNet101, n_classes)
    }

    pub fn rf_lw152(n_classes: usize) -> Self {
        Self::new(BackboneDepth::ResNet152, n_classes)
    }

    pub fn decoder(&self) -> PyramidDecoderConfig {
        PyramidDecoderConfig::new(self.depth.level_channels(), self.n_classes)
            .with_top_features(self.top_features)
            .with_crp_stages(self.crp_stages)
            .with_dropout(self.dropout)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> RefineNet<B> {
        RefineNet::new(device, self.clone())
    }
}

/// Light-weight RefineNet: ResNet encoder and four-stage fusion decoder.
#[derive(Module, Debug)]
pub struct RefineNet<B: Backend> {
    encoder: ResNetEncoder<B>,
    decoder: PyramidDecoder<B>,
    mode: Ignored<ForwardMode>,
    score_interpolation: Ignored<ScoreInterpolation>,
    ignore_index: Ignored<usize>,
}

impl<B: Backend> RefineNet<B> {
    pub fn new(device: &B::Device, config: RefineNetConfig) -> Self {
        Self {
            encoder: ResNetEncoder::new(device, config.depth),
            decoder: config.decoder().init(device),
            mode: Ignored(config.mode),
            score_interpolation: Ignored(config.score_interpolation),
            ignore_index: Ignored(config.ignore_index),
        }
    }

    pub fn load(
        device: &B::Device,
        depth: BackboneDepth,
        n_classes: usize,
        checkpoint_path: impl AsRef<Path>,
    ) -> Result<Self, RecorderError> {
        Self::load_with_config(
            device,
            RefineNetConfig::new(depth, n_classes),
            checkpoint_path,
        )
    }

    pub fn load_with_config(
        device: &B::Device,
        config: RefineNetConfig,
        checkpoint_path: impl AsRef<Path>,
    ) -> Result<Self, RecorderError> {
        let checkpoint_path = checkpoint_path.as_ref();
        let recorder = NamedMpkFileRecorder::<HalfPrecisionSettings>::new();
        Self::new(device, config).load_file(checkpoint_path, &recorder, device)
    }

    /// Builds the model and initialises it from the converted checkpoint in
    /// `cache_dir` that matches the configuration.
    ///
    /// Configurations without a published checkpoint keep their fresh weights.
    /// A published checkpoint that has not been converted into `cache_dir` yet
    /// is an error.
    pub fn from_pretrained(
        device: &B::Device,
        config: RefineNetConfig,
        cache_dir: impl AsRef<Path>,
    ) -> Result<Self, ModelError> {
        let depth = config.depth;
        let n_classes = config.n_classes;
        let imagenet = config.imagenet;
        let model = Self::new(device, config.clone());

        if !imagenet && !config.pretrained {
            return Ok(model);
        }

        let Some(weights) = PretrainedWeights::resolve(depth, n_classes, imagenet) else {
            log::info!(
                "no pretrained weights for ResNet-{} with {n_classes} classes (imagenet: {imagenet}); keeping fresh initialisation",
                depth.layers()
            );
            return Ok(model);
        };

        let path = weights.checkpoint_path(cache_dir);
        if !path.exists() {
            return Err(ModelError::MissingCheckpoint {
                key: weights.key,
                url: weights.url.to_string(),
                path,
            });
        }

        let recorder = NamedMpkFileRecorder::<HalfPrecisionSettings>::new();
        let checkpoint_error = |err: RecorderError| ModelError::Checkpoint {
            path: path.clone(),
            message: err.to_string(),
        };

        let model = match weights.scope {
            WeightScope::EncoderOnly => {
                let Self {
                    encoder,
                    decoder,
                    mode,
                    score_interpolation,
                    ignore_index,
                } = model;
                let encoder = encoder
                    .load_file(&path, &recorder, device)
                    .map_err(checkpoint_error)?;
                Self {
                    encoder,
                    decoder,
                    mode,
                    score_interpolation,
                    ignore_index,
                }
            }
            WeightScope::FullModel => model
                .load_file(&path, &recorder, device)
                .map_err(checkpoint_error)?,
        };

        log::info!(
            "loaded {} ({:?}) from {}",
            weights.key,
            weights.scope,
            path.display()
        );
        Ok(model)
    }

    pub fn encoder(&self) -> &ResNetEncoder<B> {
        &self.encoder
    }

    pub fn decoder(&self) -> &PyramidDecoder<B> {
        &self.decoder
    }

    pub(crate) fn decoder_mut(&mut self) -> &mut PyramidDecoder<B> {
        &mut self.decoder
    }

    pub fn n_classes(&self) -> usize {
        self.decoder.n_classes()
    }

    pub fn ignore_index(&self) -> usize {
        self.ignore_index.0
    }

    pub fn score_interpolation(&self) -> ScoreInterpolation {
        self.score_interpolation.0
    }

    pub fn mode(&self) -> ForwardMode {
        self.mode.0
    }

    pub fn set_mode(&mut self, mode: ForwardMode) {
        self.mode = Ignored(mode);
    }

    pub fn train(mut self) -> Self {
        self.set_mode(ForwardMode::Training);
        self
    }

    pub fn eval(mut self) -> Self {
        self.set_mode(ForwardMode::Inference);
        self
    }

    /// Score mode in the model's current [`ForwardMode`].
    pub fn forward(&self, input: Tensor<B, 4>) -> DecoderOutput<B> {
        self.forward_with_mode(input, self.mode())
    }

    pub fn forward_with_mode(&self, input: Tensor<B, 4>, mode: ForwardMode) -> DecoderOutput<B> {
        let input_size = hw(&input);
        let features = self.encoder.forward(input);
        self.decoder
            .forward(features, input_size, mode, self.score_interpolation())
    }

    /// Fused `[N, n_classes, H, W]` scores regardless of the current mode.
    pub fn infer(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.forward_with_mode(input, ForwardMode::Inference) {
            DecoderOutput::Fused(scores) => scores,
            DecoderOutput::DeepSupervision(maps) => maps.primary,
        }
    }

    /// Embedding mode for one batch of images and their `[N, h, w]` label maps.
    pub fn extract(
        &self,
        input: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
        class_slots: usize,
    ) -> EmbeddingSet<B> {
        let features = self.encoder.forward(input);
        self.decoder
            .extract(features, labels, class_slots, self.ignore_index())
    }
}
