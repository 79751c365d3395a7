use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
};

pub const DEFAULT_CRP_STAGES: usize = 4;

const POOL_SIZE: usize = 5;
const POOL_PAD: usize = POOL_SIZE / 2;

/// Chained residual pooling.
///
/// Each stage max-pools the previous stage's output (5x5, stride 1) and projects
/// it with a bias-free 1x1 convolution; every stage output is added to the input.
#[derive(Module, Debug)]
pub struct ChainedResidualPool<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> ChainedResidualPool<B> {
    pub fn new(device: &B::Device, channels: usize, stages: usize) -> Self {
        let convs = (0..stages)
            .map(|_| {
                Conv2dConfig::new([channels, channels], [1, 1])
                    .with_bias(false)
                    .init(device)
            })
            .collect();

        // Padded with -inf in `forward`.
        let pool = MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
            .with_strides([1, 1])
            .init();

        Self { convs, pool }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut top = x.clone();
        let mut out = x;
        for conv in &self.convs {
            let padded = top.pad((POOL_PAD, POOL_PAD, POOL_PAD, POOL_PAD), f32::NEG_INFINITY);
            top = conv.forward(self.pool.forward(padded));
            out = out + top.clone();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::Param;

    type TestBackend = crate::InferenceBackend;

    #[test]
    fn preserves_shape() {
        let device = <TestBackend as Backend>::Device::default();
        let crp = ChainedResidualPool::<TestBackend>::new(&device, 8, DEFAULT_CRP_STAGES);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 8, 5, 7],
            burn::tensor::Distribution::Default,
            &device,
        );

        assert_eq!(crp.convs.len(), 4);
        assert_eq!(crp.forward(input).dims(), [2, 8, 5, 7]);
    }

    #[test]
    fn identity_convs_accumulate_pooled_maxima() {
        let device = <TestBackend as Backend>::Device::default();
        let mut crp = ChainedResidualPool::<TestBackend>::new(&device, 1, 2);
        for conv in crp.convs.iter_mut() {
            conv.weight = Param::from_tensor(Tensor::ones([1, 1, 1, 1], &device));
        }

        // A single peak spreads over the 5x5 window each stage: x + pool(x) + pool(pool(x)).
        let mut values = vec![0.0f32; 9];
        values[4] = 2.0;
        let input = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device)
            .reshape([1, 1, 3, 3]);

        let output = crp.forward(input);
        let mut expected = vec![4.0f32; 9];
        expected[4] = 6.0;
        let expected = Tensor::<TestBackend, 1>::from_floats(expected.as_slice(), &device)
            .reshape([1, 1, 3, 3]);

        assert!(output.all_close(expected, Some(1e-6), Some(1e-6)));
    }

    #[test]
    fn pools_single_pixel_maps() {
        let device = <TestBackend as Backend>::Device::default();
        let mut crp = ChainedResidualPool::<TestBackend>::new(&device, 512, DEFAULT_CRP_STAGES);
        for conv in crp.convs.iter_mut() {
            conv.weight = Param::from_tensor(
                Tensor::<TestBackend, 2>::eye(512, &device).reshape([512, 512, 1, 1]),
            );
        }
        let input = Tensor::<TestBackend, 4>::random(
            [1, 512, 1, 1],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        // A 1x1 window only sees its own pixel, so every stage is the identity.
        let output = crp.forward(input.clone());

        assert_eq!(output.dims(), [1, 512, 1, 1]);
        assert!(output.all_close(input.mul_scalar(5.0), Some(1e-4), Some(1e-4)));
    }
}
