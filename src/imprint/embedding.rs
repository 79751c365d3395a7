use burn::{prelude::*, tensor::Int};

use crate::model::refinenet::{PyramidLevel, interpolate::resize_labels_nearest};

/// Class-masked mean features of one fusion stage.
///
/// `embeddings` is `[images, class_slots, channels]`; `presence` is
/// `[images, class_slots]` and holds 1.0 where the class covered at least one
/// pixel of that image. Absent classes carry a zero vector and contribute
/// nothing downstream.
#[derive(Debug, Clone)]
pub struct StageEmbeddings<B: Backend> {
    pub embeddings: Tensor<B, 3>,
    pub presence: Tensor<B, 2>,
}

impl<B: Backend> StageEmbeddings<B> {
    pub fn images(&self) -> usize {
        self.embeddings.dims()[0]
    }

    pub fn class_slots(&self) -> usize {
        self.embeddings.dims()[1]
    }

    pub fn channels(&self) -> usize {
        self.embeddings.dims()[2]
    }

    /// Stacks collections along the image axis. No averaging happens here.
    pub fn concat(parts: Vec<Self>) -> Option<Self> {
        if parts.is_empty() {
            return None;
        }

        let (embeddings, presence): (Vec<_>, Vec<_>) = parts
            .into_iter()
            .map(|part| (part.embeddings, part.presence))
            .unzip();

        Some(Self {
            embeddings: Tensor::cat(embeddings, 0),
            presence: Tensor::cat(presence, 0),
        })
    }

    /// Number of images each class slot was observed in.
    pub fn class_image_counts(&self) -> Tensor<B, 1> {
        let slots = self.class_slots();
        self.presence.clone().sum_dim(0).reshape([slots])
    }
}

/// Per-stage embeddings for the four pyramid levels.
#[derive(Debug, Clone)]
pub struct EmbeddingSet<B: Backend> {
    pub l1: StageEmbeddings<B>,
    pub l2: StageEmbeddings<B>,
    pub l3: StageEmbeddings<B>,
    pub l4: StageEmbeddings<B>,
}

impl<B: Backend> EmbeddingSet<B> {
    pub fn get(&self, level: PyramidLevel) -> &StageEmbeddings<B> {
        match level {
            PyramidLevel::L1 => &self.l1,
            PyramidLevel::L2 => &self.l2,
            PyramidLevel::L3 => &self.l3,
            PyramidLevel::L4 => &self.l4,
        }
    }

    pub fn images(&self) -> usize {
        self.l1.images()
    }

    pub fn concat(sets: Vec<Self>) -> Option<Self> {
        let mut l1 = Vec::with_capacity(sets.len());
        let mut l2 = Vec::with_capacity(sets.len());
        let mut l3 = Vec::with_capacity(sets.len());
        let mut l4 = Vec::with_capacity(sets.len());
        for set in sets {
            l1.push(set.l1);
            l2.push(set.l2);
            l3.push(set.l3);
            l4.push(set.l4);
        }

        Some(Self {
            l1: StageEmbeddings::concat(l1)?,
            l2: StageEmbeddings::concat(l2)?,
            l3: StageEmbeddings::concat(l3)?,
            l4: StageEmbeddings::concat(l4)?,
        })
    }
}

/// Averages `feature` (`[N, C, H, W]`) over the pixels of every class slot.
///
/// `labels` (`[N, h, w]`) is resized to `H x W` with nearest sampling first.
/// Pixels labelled `ignore_index`, or with a label outside `0..class_slots`,
/// belong to no slot.
pub fn masked_embeddings<B: Backend>(
    feature: Tensor<B, 4>,
    labels: Tensor<B, 3, Int>,
    class_slots: usize,
    ignore_index: usize,
) -> StageEmbeddings<B> {
    let [batch, channels, height, width] = feature.dims();
    let label_batch = labels.dims()[0];
    assert_eq!(
        label_batch, batch,
        "label batch ({label_batch}) must match feature batch ({batch})"
    );

    let device = feature.device();
    let pixels = height * width;

    let labels = resize_labels_nearest(labels, [height, width]);
    let ignored = labels.clone().equal_elem(ignore_index as i64);
    let labels = labels
        .mask_fill(ignored, -1)
        .reshape([batch, 1, pixels])
        .repeat_dim(1, class_slots);

    let slots = Tensor::<B, 1, Int>::arange(0..class_slots as i64, &device)
        .reshape([1, class_slots, 1])
        .repeat_dim(0, batch)
        .repeat_dim(2, pixels);

    let masks = labels.equal(slots).float();
    let counts = masks.clone().sum_dim(2);

    let features = feature.reshape([batch, channels, pixels]).swap_dims(1, 2);
    let embeddings = masks.matmul(features) / counts.clone().clamp_min(1.0);
    let presence = counts.greater_elem(0.0).float().reshape([batch, class_slots]);

    log::debug!(
        "masked embeddings: {batch} image(s), {class_slots} slot(s), {channels} channel(s) at {height}x{width}"
    );

    StageEmbeddings {
        embeddings,
        presence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = crate::InferenceBackend;

    fn to_vec<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    #[test]
    fn averages_features_per_class() {
        let device = <TestBackend as Backend>::Device::default();
        // Two channels over a 2x2 map.
        let feature = Tensor::<TestBackend, 1>::from_floats(
            [1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0].as_slice(),
            &device,
        )
        .reshape([1, 2, 2, 2]);
        let labels =
            Tensor::<TestBackend, 1, Int>::from_ints([0, 0, 1, 255].as_slice(), &device)
                .reshape([1, 2, 2]);

        let stage = masked_embeddings(feature, labels, 3, 255);

        assert_eq!(stage.embeddings.dims(), [1, 3, 2]);
        assert_eq!(
            to_vec(stage.embeddings),
            vec![1.5, 15.0, 3.0, 30.0, 0.0, 0.0]
        );
        assert_eq!(to_vec(stage.presence), vec![1.0, 1.0, 0.0]);
    }

    #[test]
    fn labels_are_resized_to_feature_resolution() {
        let device = <TestBackend as Backend>::Device::default();
        let feature = Tensor::<TestBackend, 1>::from_floats([5.0, 7.0].as_slice(), &device)
            .reshape([1, 1, 1, 2]);
        // 2x4 labels collapse to 1x2 with nearest sampling: columns 0 and 2.
        let labels = Tensor::<TestBackend, 1, Int>::from_ints(
            [1, 1, 0, 0, 1, 1, 0, 0].as_slice(),
            &device,
        )
        .reshape([1, 2, 4]);

        let stage = masked_embeddings(feature, labels, 2, 255);

        assert_eq!(to_vec(stage.embeddings), vec![7.0, 5.0]);
        assert_eq!(to_vec(stage.presence), vec![1.0, 1.0]);
    }

    #[test]
    fn concat_stacks_images_without_averaging() {
        let device = <TestBackend as Backend>::Device::default();
        let feature = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let first = masked_embeddings(
            feature.clone(),
            Tensor::<TestBackend, 3, Int>::zeros([1, 2, 2], &device),
            2,
            255,
        );
        let second = masked_embeddings(
            feature.mul_scalar(3.0),
            Tensor::<TestBackend, 3, Int>::ones([1, 2, 2], &device),
            2,
            255,
        );

        let stacked = StageEmbeddings::concat(vec![first, second]).unwrap();

        assert_eq!(stacked.images(), 2);
        assert_eq!(stacked.class_slots(), 2);
        assert_eq!(stacked.channels(), 4);
        assert_eq!(to_vec(stacked.class_image_counts()), vec![1.0, 1.0]);
        assert_eq!(
            to_vec(stacked.embeddings),
            vec![
                1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, 3.0, 3.0, 3.0, 3.0,
            ]
        );
    }

    #[test]
    fn concat_of_nothing_is_none() {
        assert!(StageEmbeddings::<TestBackend>::concat(Vec::new()).is_none());
    }
}
