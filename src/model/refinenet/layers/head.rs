use burn::{
    module::Param,
    nn::{
        Initializer,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
};

/// Width of the fused features every classification head reads.
pub const HEAD_INPUT_CHANNELS: usize = 256;

/// Bias-free 1x1 projection from fused features to per-class scores.
///
/// Heads are never resized in place. Changing the class count builds a new head
/// from a weight tensor and the decoder swaps it in.
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> ClassificationHead<B> {
    pub fn new(device: &B::Device, n_classes: usize) -> Self {
        let conv = Conv2dConfig::new([HEAD_INPUT_CHANNELS, n_classes], [1, 1])
            .with_bias(false)
            .init(device);
        Self { conv }
    }

    /// Builds a head whose kernel is exactly `weight` (`[classes, channels, 1, 1]`).
    pub fn from_weight(weight: Tensor<B, 4>) -> Self {
        let [classes, channels, kernel_h, kernel_w] = weight.dims();
        let mut conv = Conv2dConfig::new([channels, classes], [kernel_h, kernel_w])
            .with_bias(false)
            .with_initializer(Initializer::Zeros)
            .init(&weight.device());
        conv.weight = Param::from_tensor(weight);
        Self { conv }
    }

    pub fn weight(&self) -> Tensor<B, 4> {
        self.conv.weight.val()
    }

    pub fn classes(&self) -> usize {
        self.conv.weight.val().dims()[0]
    }

    pub fn input_channels(&self) -> usize {
        self.conv.weight.val().dims()[1]
    }

    pub fn device(&self) -> B::Device {
        self.conv.weight.val().device()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x)
    }
}
