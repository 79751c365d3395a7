use burn::{
    config::Config,
    tensor::{
        Int, Tensor,
        backend::Backend,
        module,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

/// How per-level score maps are brought to the input resolution before summing.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum ScoreInterpolation {
    /// Bilinear with aligned corners, evaluated on the backend.
    AlignCorners,
    /// Bilinear with half-pixel centres, evaluated on the host.
    HalfPixel,
}

impl Default for ScoreInterpolation {
    fn default() -> Self {
        Self::AlignCorners
    }
}

pub(crate) fn hw<B: Backend>(tensor: &Tensor<B, 4>) -> [usize; 2] {
    let dims = tensor.dims();
    [dims[2], dims[3]]
}

fn bilinear_sample(input: &[f32], in_width: usize, in_height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = (x0 + 1.0).min((in_width - 1) as f32);
    let y1 = (y0 + 1.0).min((in_height - 1) as f32);

    let x0_idx = x0.max(0.0) as usize;
    let y0_idx = y0.max(0.0) as usize;
    let x1_idx = x1.max(0.0) as usize;
    let y1_idx = y1.max(0.0) as usize;

    let dx = (x - x0).clamp(0.0, 1.0);
    let dy = (y - y0).clamp(0.0, 1.0);

    let top_left = input[y0_idx * in_width + x0_idx];
    let top_right = input[y0_idx * in_width + x1_idx];
    let bottom_left = input[y1_idx * in_width + x0_idx];
    let bottom_right = input[y1_idx * in_width + x1_idx];

    let top = top_left * (1.0 - dx) + top_right * dx;
    let bottom = bottom_left * (1.0 - dx) + bottom_right * dx;

    top * (1.0 - dy) + bottom * dy
}

/// Bilinear resize with aligned corners, the upsampling used between fusion stages.
pub fn resize_bilinear_aligned<B: Backend>(
    input: Tensor<B, 4>,
    output_size: [usize; 2],
) -> Tensor<B, 4> {
    if hw(&input) == output_size {
        return input;
    }

    module::interpolate(
        input,
        output_size,
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}

/// Bilinear resize with half-pixel centres (`align_corners = false`).
///
/// Runs on the host, so it round-trips the tensor through `f32` data.
pub fn resize_bilinear_half_pixel<B: Backend>(
    input: Tensor<B, 4>,
    output_size: [usize; 2],
) -> Tensor<B, 4> {
    let [batch, channels, in_height, in_width] = input.dims();
    let [out_height, out_width] = output_size;

    if in_height == out_height && in_width == out_width {
        return input;
    }

    assert!(
        out_height > 0 && out_width > 0,
        "output size must be positive"
    );

    let device = input.device();
    let values = input
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .expect("score tensor data should convert to Vec<f32>");

    let mut output = vec![0.0f32; batch * channels * out_height * out_width];

    let scale_y = in_height as f32 / out_height as f32;
    let scale_x = in_width as f32 / out_width as f32;
    let plane = in_height * in_width;

    for map in 0..batch * channels {
        let source = &values[map * plane..(map + 1) * plane];
        let target = &mut output[map * out_height * out_width..(map + 1) * out_height * out_width];

        for oy in 0..out_height {
            let in_y = ((oy as f32 + 0.5) * scale_y - 0.5).max(0.0);
            for ox in 0..out_width {
                let in_x = ((ox as f32 + 0.5) * scale_x - 0.5).max(0.0);
                target[oy * out_width + ox] =
                    bilinear_sample(source, in_width, in_height, in_x, in_y);
            }
        }
    }

    Tensor::<B, 1>::from_floats(output.as_slice(), &device).reshape([
        batch,
        channels,
        out_height,
        out_width,
    ])
}

pub fn resize_scores<B: Backend>(
    scores: Tensor<B, 4>,
    output_size: [usize; 2],
    method: ScoreInterpolation,
) -> Tensor<B, 4> {
    match method {
        ScoreInterpolation::AlignCorners => resize_bilinear_aligned(scores, output_size),
        ScoreInterpolation::HalfPixel => resize_bilinear_half_pixel(scores, output_size),
    }
}

/// Nearest-neighbour resize of an integer label map `[N, H, W]`.
pub fn resize_labels_nearest<B: Backend>(
    labels: Tensor<B, 3, Int>,
    output_size: [usize; 2],
) -> Tensor<B, 3, Int> {
    let [batch, height, width] = labels.dims();
    if [height, width] == output_size {
        return labels;
    }

    let resized = module::interpolate(
        labels.float().reshape([batch, 1, height, width]),
        output_size,
        InterpolateOptions::new(InterpolateMode::Nearest),
    );

    resized
        .reshape([batch, output_size[0], output_size[1]])
        .round()
        .int()
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = crate::InferenceBackend;

    fn tensor_from_values(
        device: &<TestBackend as Backend>::Device,
        values: &[f32],
        shape: [usize; 4],
    ) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 1>::from_floats(values, device).reshape(shape)
    }

    #[test]
    fn aligned_and_half_pixel_upsampling_match_expected() {
        let device = <TestBackend as Backend>::Device::default();
        let input = tensor_from_values(&device, &[1.0, 2.0, 3.0, 4.0], [1, 1, 2, 2]);

        let aligned = resize_scores(input.clone(), [4, 4], ScoreInterpolation::AlignCorners);
        let half_pixel = resize_scores(input, [4, 4], ScoreInterpolation::HalfPixel);

        let expected_aligned = tensor_from_values(
            &device,
            &[
                1.0, 1.3333334, 1.6666666, 2.0, //
                1.6666666, 2.0, 2.3333333, 2.6666667, //
                2.3333333, 2.6666667, 3.0, 3.3333333, //
                3.0, 3.3333333, 3.6666667, 4.0,
            ],
            [1, 1, 4, 4],
        );
        let expected_half_pixel = tensor_from_values(
            &device,
            &[
                1.0, 1.25, 1.75, 2.0, //
                1.5, 1.75, 2.25, 2.5, //
                2.5, 2.75, 3.25, 3.5, //
                3.0, 3.25, 3.75, 4.0,
            ],
            [1, 1, 4, 4],
        );

        assert!(
            aligned
                .clone()
                .all_close(expected_aligned, Some(1e-5), Some(1e-5)),
            "aligned output {aligned:?} did not match expected values"
        );
        assert!(
            half_pixel
                .clone()
                .all_close(expected_half_pixel, Some(1e-5), Some(1e-5)),
            "half-pixel output {half_pixel:?} did not match expected values"
        );
    }

    #[test]
    fn resize_to_same_size_is_identity() {
        let device = <TestBackend as Backend>::Device::default();
        let input = tensor_from_values(&device, &[4.0, 1.0, 0.0, 2.0], [1, 1, 2, 2]);

        for method in [ScoreInterpolation::AlignCorners, ScoreInterpolation::HalfPixel] {
            let output = resize_scores(input.clone(), [2, 2], method);
            assert!(output.all_close(input.clone(), Some(1e-6), Some(1e-6)));
        }
    }

    #[test]
    fn label_resize_keeps_integer_classes() {
        let device = <TestBackend as Backend>::Device::default();
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 7, 3, 255].as_slice(), &device)
            .reshape([1, 2, 2]);

        let resized = resize_labels_nearest(labels, [4, 4]);
        assert_eq!(resized.dims(), [1, 4, 4]);

        let values = resized
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .unwrap();
        assert_eq!(
            values,
            vec![
                0, 0, 7, 7, //
                0, 0, 7, 7, //
                3, 3, 255, 255, //
                3, 3, 255, 255,
            ]
        );
    }
}
