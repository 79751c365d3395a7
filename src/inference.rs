use burn::{prelude::*, tensor::Int};
use image::{Rgb, RgbImage};

use crate::model::refinenet::RefineNet;

/// Per-channel ImageNet statistics the encoder was trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

fn checked_len(width: usize, height: usize, channels: usize) -> Result<usize, String> {
    width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(channels))
        .ok_or_else(|| "image dimensions overflowed while preparing input".to_string())
}

/// Converts packed RGB bytes into a normalized tensor suitable for `RefineNet::infer`.
///
/// The input slice must contain `width * height * 3` bytes in row-major order.
/// The output tensor is channel-first (`NCHW`), scaled to `[0, 1]` and then
/// standardised with [`IMAGENET_MEAN`] and [`IMAGENET_STD`].
pub fn rgb_to_input_tensor<B: Backend>(
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>, String> {
    let expected_len = checked_len(width, height, 3)?;
    if rgb.len() != expected_len {
        return Err(format!(
            "expected {expected_len} RGB bytes for {width}x{height}, got {}",
            rgb.len()
        ));
    }

    let hw = width * height;
    let mut data = vec![0.0f32; 3 * hw];

    for (idx, pixel) in rgb.chunks_exact(3).enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * hw + idx] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    Ok(Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, 3, height, width]))
}

/// Converts a single-channel mask (one class index per byte) into a `[1, H, W]`
/// label tensor. Byte 255 is kept as is and acts as the ignore label.
pub fn mask_to_label_tensor<B: Backend>(
    mask: &[u8],
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 3, Int>, String> {
    let expected_len = checked_len(width, height, 1)?;
    if mask.len() != expected_len {
        return Err(format!(
            "expected {expected_len} mask bytes for {width}x{height}, got {}",
            mask.len()
        ));
    }

    let labels: Vec<i64> = mask.iter().map(|&value| value as i64).collect();
    Ok(Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device).reshape([1, height, width]))
}

pub struct Segmentation<B: Backend> {
    /// Fused `[N, n_classes, H, W]` scores.
    pub scores: Tensor<B, 4>,
    /// Arg-max class per pixel, `[N, H, W]`.
    pub labels: Tensor<B, 3, Int>,
}

pub fn segment<B: Backend>(model: &RefineNet<B>, input: Tensor<B, 4>) -> Segmentation<B> {
    let scores = model.infer(input);
    let labels = scores.clone().argmax(1).squeeze_dim::<3>(1);
    Segmentation { scores, labels }
}

/// Runs the RefineNet model directly from packed RGB bytes.
///
/// This helper combines [`rgb_to_input_tensor`] and [`segment`].
pub fn segment_from_rgb<B: Backend>(
    model: &RefineNet<B>,
    rgb: &[u8],
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Segmentation<B>, String> {
    let input = rgb_to_input_tensor::<B>(rgb, width, height, device)?;
    Ok(segment(model, input))
}

/// PASCAL VOC style colour for a class index: the bits of the index are
/// spread over the high bits of the three channels.
pub fn palette_color(label: usize) -> Rgb<u8> {
    let mut rgb = [0u8; 3];
    let mut class = label;
    for shift in (0..8).rev() {
        for (channel, value) in rgb.iter_mut().enumerate() {
            *value |= (((class >> channel) & 1) as u8) << shift;
        }
        class >>= 3;
    }
    Rgb(rgb)
}

/// Colours the first label map of a `[N, H, W]` batch.
pub fn colorize_labels<B: Backend>(labels: Tensor<B, 3, Int>) -> Result<RgbImage, String> {
    let [_, height, width] = labels.dims();
    let values = labels
        .slice([0..1, 0..height, 0..width])
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| format!("failed to read label map: {err:?}"))?;

    let mut image = RgbImage::new(width as u32, height as u32);
    for (pixel, label) in image.pixels_mut().zip(values) {
        *pixel = palette_color(label.max(0) as usize);
    }
    Ok(image)
}
