use burn::{
    module::Ignored,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
        norm::{BatchNorm, BatchNormConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::activation::relu,
};

#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum BackboneDepth {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

impl Default for BackboneDepth {
    fn default() -> Self {
        Self::ResNet50
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    Basic,
    Bottleneck,
}

impl BlockKind {
    pub fn expansion(self) -> usize {
        match self {
            BlockKind::Basic => 1,
            BlockKind::Bottleneck => 4,
        }
    }
}

impl BackboneDepth {
    pub fn from_layers(depth: usize) -> Option<Self> {
        match depth {
            18 => Some(Self::ResNet18),
            34 => Some(Self::ResNet34),
            50 => Some(Self::ResNet50),
            101 => Some(Self::ResNet101),
            152 => Some(Self::ResNet152),
            _ => None,
        }
    }

    pub fn layers(self) -> usize {
        match self {
            Self::ResNet18 => 18,
            Self::ResNet34 => 34,
            Self::ResNet50 => 50,
            Self::ResNet101 => 101,
            Self::ResNet152 => 152,
        }
    }

    pub fn block(self) -> BlockKind {
        match self {
            Self::ResNet18 | Self::ResNet34 => BlockKind::Basic,
            _ => BlockKind::Bottleneck,
        }
    }

    pub fn blocks_per_layer(self) -> [usize; 4] {
        match self {
            Self::ResNet18 => [2, 2, 2, 2],
            Self::ResNet34 | Self::ResNet50 => [3, 4, 6, 3],
            Self::ResNet101 => [3, 4, 23, 3],
            Self::ResNet152 => [3, 8, 36, 3],
        }
    }

    /// Channel depth of l1..l4.
    pub fn level_channels(self) -> [usize; 4] {
        let expansion = self.block().expansion();
        LAYER_PLANES.map(|planes| planes * expansion)
    }
}

const STEM_CHANNELS: usize = 64;
const LAYER_PLANES: [usize; 4] = [64, 128, 256, 512];

/// The four backbone levels, l1 finest to l4 coarsest.
#[derive(Debug, Clone)]
pub struct PyramidFeatures<B: Backend> {
    pub l1: Tensor<B, 4>,
    pub l2: Tensor<B, 4>,
    pub l3: Tensor<B, 4>,
    pub l4: Tensor<B, 4>,
}

fn conv<B: Backend>(
    device: &B::Device,
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(device: &B::Device, channels: [usize; 2], stride: usize) -> Self {
        Self {
            conv: conv(device, channels, 1, stride),
            bn: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(
        device: &B::Device,
        in_planes: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample<B>>,
    ) -> Self {
        Self {
            conv1: conv(device, [in_planes, planes], 3, stride),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv(device, [planes, planes], 3, 1),
            bn2: BatchNormConfig::new(planes).init(device),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        relu(out + residual)
    }
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(
        device: &B::Device,
        in_planes: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample<B>>,
    ) -> Self {
        let expanded = planes * BlockKind::Bottleneck.expansion();
        Self {
            conv1: conv(device, [in_planes, planes], 1, 1),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv(device, [planes, planes], 3, stride),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: conv(device, [planes, expanded], 1, 1),
            bn3: BatchNormConfig::new(expanded).init(device),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = relu(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));
        relu(out + residual)
    }
}

/// Residual block variant, fixed by the backbone depth at construction.
#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    fn new(
        device: &B::Device,
        kind: BlockKind,
        in_planes: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Downsample<B>>,
    ) -> Self {
        match kind {
            BlockKind::Basic => Self::Basic(BasicBlock::new(
                device, in_planes, planes, stride, downsample,
            )),
            BlockKind::Bottleneck => Self::Bottleneck(Bottleneck::new(
                device, in_planes, planes, stride, downsample,
            )),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(x),
            Self::Bottleneck(block) => block.forward(x),
        }
    }
}

#[derive(Module, Debug)]
pub struct ResNetEncoder<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    maxpool: MaxPool2d,
    layer1: Vec<ResidualBlock<B>>,
    layer2: Vec<ResidualBlock<B>>,
    layer3: Vec<ResidualBlock<B>>,
    layer4: Vec<ResidualBlock<B>>,
    depth: Ignored<BackboneDepth>,
}

impl<B: Backend> ResNetEncoder<B> {
    pub fn new(device: &B::Device, depth: BackboneDepth) -> Self {
        let kind = depth.block();
        let blocks = depth.blocks_per_layer();
        let mut in_planes = STEM_CHANNELS;

        let mut make_layer = |planes: usize, count: usize, stride: usize| {
            let expanded = planes * kind.expansion();
            let downsample = (stride != 1 || in_planes != expanded)
                .then(|| Downsample::new(device, [in_planes, expanded], stride));

            let mut layer = Vec::with_capacity(count);
            layer.push(ResidualBlock::new(
                device, kind, in_planes, planes, stride, downsample,
            ));
            in_planes = expanded;
            for _ in 1..count {
                layer.push(ResidualBlock::new(device, kind, in_planes, planes, 1, None));
            }
            layer
        };

        let layer1 = make_layer(LAYER_PLANES[0], blocks[0], 1);
        let layer2 = make_layer(LAYER_PLANES[1], blocks[1], 2);
        let layer3 = make_layer(LAYER_PLANES[2], blocks[2], 2);
        let layer4 = make_layer(LAYER_PLANES[3], blocks[3], 2);

        Self {
            conv1: conv(device, [3, STEM_CHANNELS], 7, 2),
            bn1: BatchNormConfig::new(STEM_CHANNELS).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1,
            layer2,
            layer3,
            layer4,
            depth: Ignored(depth),
        }
    }

    pub fn depth(&self) -> BackboneDepth {
        self.depth.0
    }

    pub fn level_channels(&self) -> [usize; 4] {
        self.depth.0.level_channels()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> PyramidFeatures<B> {
        let x = relu(self.bn1.forward(self.conv1.forward(x)));
        let x = self.maxpool.forward(x);

        let run = |layer: &[ResidualBlock<B>], mut x: Tensor<B, 4>| {
            for block in layer {
                x = block.forward(x);
            }
            x
        };

        let l1 = run(&self.layer1, x);
        let l2 = run(&self.layer2, l1.clone());
        let l3 = run(&self.layer3, l2.clone());
        let l4 = run(&self.layer4, l3.clone());

        PyramidFeatures { l1, l2, l3, l4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = crate::InferenceBackend;

    #[test]
    fn depth_table_matches_resnet_family() {
        assert_eq!(BackboneDepth::ResNet50.blocks_per_layer(), [3, 4, 6, 3]);
        assert_eq!(BackboneDepth::ResNet152.blocks_per_layer(), [3, 8, 36, 3]);
        assert_eq!(BackboneDepth::ResNet18.block(), BlockKind::Basic);
        assert_eq!(BackboneDepth::ResNet101.block(), BlockKind::Bottleneck);
        assert_eq!(
            BackboneDepth::ResNet50.level_channels(),
            [256, 512, 1024, 2048]
        );
        assert_eq!(BackboneDepth::ResNet34.level_channels(), [64, 128, 256, 512]);
        assert_eq!(BackboneDepth::from_layers(101), Some(BackboneDepth::ResNet101));
        assert_eq!(BackboneDepth::from_layers(42), None);
    }

    #[test]
    fn levels_shrink_spatially_and_grow_in_depth() {
        let device = <TestBackend as Backend>::Device::default();
        let encoder = ResNetEncoder::<TestBackend>::new(&device, BackboneDepth::ResNet18);
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);

        let features = encoder.forward(input);

        assert_eq!(features.l1.dims(), [1, 64, 16, 16]);
        assert_eq!(features.l2.dims(), [1, 128, 8, 8]);
        assert_eq!(features.l3.dims(), [1, 256, 4, 4]);
        assert_eq!(features.l4.dims(), [1, 512, 2, 2]);
    }

    #[test]
    fn bottleneck_blocks_expand_channels() {
        let device = <TestBackend as Backend>::Device::default();
        let encoder = ResNetEncoder::<TestBackend>::new(&device, BackboneDepth::ResNet50);
        assert!(matches!(encoder.layer1[0], ResidualBlock::Bottleneck(_)));
        assert_eq!(encoder.layer3.len(), 6);

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        let features = encoder.forward(input);

        assert_eq!(features.l1.dims(), [1, 256, 8, 8]);
        assert_eq!(features.l4.dims(), [1, 2048, 1, 1]);
    }
}
