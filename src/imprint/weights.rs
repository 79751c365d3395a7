use burn::prelude::*;

use super::embedding::StageEmbeddings;

const NORM_EPS: f32 = 1e-12;

/// Turns class-masked embeddings into the kernel of a resized classification head.
///
/// Implementations must keep every original row (unchanged or blended) in the
/// first `old_classes` rows of the result, and return exactly `new_classes` rows.
pub trait WeightImprinter<B: Backend> {
    fn compute_weight(
        &self,
        embeddings: &StageEmbeddings<B>,
        old_classes: usize,
        new_classes: usize,
        old_weight: Tensor<B, 4>,
        alpha: f32,
    ) -> Tensor<B, 4>;
}

/// Mean of the per-image embeddings, L2-normalised per class.
///
/// Original classes seen in the imprinting set become
/// `alpha * imprinted + (1 - alpha) * old`; unseen ones keep their row. Novel
/// classes take the normalised embedding and are appended after the originals.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedMeanImprinter;

impl NormalizedMeanImprinter {
    /// `[rows, channels]` normalised class means and a `[rows, 1]` seen mask.
    fn class_means<B: Backend>(
        embeddings: &StageEmbeddings<B>,
        rows: usize,
    ) -> (Tensor<B, 2>, Tensor<B, 2, Bool>) {
        let slots = embeddings.class_slots();
        let channels = embeddings.channels();
        let device = embeddings.embeddings.device();

        let counts = embeddings.class_image_counts().reshape([slots, 1]);
        let sums = (embeddings.embeddings.clone()
            * embeddings.presence.clone().reshape([embeddings.images(), slots, 1]))
        .sum_dim(0)
        .reshape([slots, channels]);
        let means = sums / counts.clone().clamp_min(1.0);
        let norms = means
            .clone()
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .clamp_min(NORM_EPS);
        let means = means / norms;

        if slots >= rows {
            (
                means.slice([0..rows, 0..channels]),
                counts.slice([0..rows, 0..1]).greater_elem(0.0),
            )
        } else {
            let missing = rows - slots;
            let means = Tensor::cat(
                vec![means, Tensor::zeros([missing, channels], &device)],
                0,
            );
            let counts = Tensor::cat(vec![counts, Tensor::zeros([missing, 1], &device)], 0);
            (means, counts.greater_elem(0.0))
        }
    }
}

impl<B: Backend> WeightImprinter<B> for NormalizedMeanImprinter {
    fn compute_weight(
        &self,
        embeddings: &StageEmbeddings<B>,
        old_classes: usize,
        new_classes: usize,
        old_weight: Tensor<B, 4>,
        alpha: f32,
    ) -> Tensor<B, 4> {
        let [rows, channels, kernel_h, kernel_w] = old_weight.dims();
        assert_eq!(
            rows, old_classes,
            "head holds {rows} rows but {old_classes} classes were expected"
        );
        assert!(
            new_classes >= old_classes,
            "imprinting cannot drop classes ({old_classes} -> {new_classes})"
        );
        assert_eq!(
            embeddings.channels(),
            channels * kernel_h * kernel_w,
            "embedding width must match the head input width"
        );

        let (imprinted, seen) = Self::class_means(embeddings, new_classes);

        let old = old_weight.reshape([old_classes, channels * kernel_h * kernel_w]);
        let width = old.dims()[1];
        let blended = imprinted
            .clone()
            .slice([0..old_classes, 0..width])
            .mul_scalar(alpha)
            + old.clone().mul_scalar(1.0 - alpha);
        let seen_base = seen
            .slice([0..old_classes, 0..1])
            .repeat_dim(1, width);
        let base = old.mask_where(seen_base, blended);

        let weight = if new_classes > old_classes {
            let novel = imprinted.slice([old_classes..new_classes, 0..width]);
            Tensor::cat(vec![base, novel], 0)
        } else {
            base
        };

        weight.reshape([new_classes, channels, kernel_h, kernel_w])
    }
}
