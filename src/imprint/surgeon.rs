use std::collections::BTreeSet;

use burn::{prelude::*, tensor::Int};
use serde::{Deserialize, Serialize};

use super::{
    ImprintConfig, ImprintError, ImprintResult,
    embedding::EmbeddingSet,
    weights::{NormalizedMeanImprinter, WeightImprinter},
};
use crate::model::refinenet::{ClassificationHead, PyramidLevel, RefineNet};

/// How many classes the heads hold after imprinting and after reverting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassCountPolicy {
    /// One row per distinct novel label. Novel labels must run contiguously
    /// from the current class count; reverting restores the snapshot's count.
    Observed,
    /// Fixed counts regardless of the labels seen.
    Fixed { imprinted: usize, reverted: usize },
}

impl Default for ClassCountPolicy {
    fn default() -> Self {
        Self::Observed
    }
}

/// Decides whether a freshly built head lives where the model computes.
pub trait PlacementCheck<B: Backend> {
    fn is_placed(&self, expected: &B::Device, weight: &Tensor<B, 4>) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SameDevice;

impl<B: Backend> PlacementCheck<B> for SameDevice {
    fn is_placed(&self, expected: &B::Device, weight: &Tensor<B, 4>) -> bool {
        weight.device() == *expected
    }
}

fn detached<B: Backend>(weight: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = weight.device();
    Tensor::from_data(weight.into_data(), &device)
}

/// Independent copies of the four head kernels.
#[derive(Debug, Clone)]
pub struct SavedHeadWeights<B: Backend> {
    clf: Tensor<B, 4>,
    clf_l2: Tensor<B, 4>,
    clf_l3: Tensor<B, 4>,
    clf_l4: Tensor<B, 4>,
}

impl<B: Backend> SavedHeadWeights<B> {
    fn capture(model: &RefineNet<B>) -> Self {
        let weight = |level| detached(model.decoder().head(level).weight());
        Self {
            clf: weight(PyramidLevel::L1),
            clf_l2: weight(PyramidLevel::L2),
            clf_l3: weight(PyramidLevel::L3),
            clf_l4: weight(PyramidLevel::L4),
        }
    }

    pub fn weight(&self, level: PyramidLevel) -> &Tensor<B, 4> {
        match level {
            PyramidLevel::L1 => &self.clf,
            PyramidLevel::L2 => &self.clf_l2,
            PyramidLevel::L3 => &self.clf_l3,
            PyramidLevel::L4 => &self.clf_l4,
        }
    }

    pub fn classes(&self) -> usize {
        self.clf.dims()[0]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImprintSummary {
    pub images: usize,
    pub old_classes: usize,
    pub new_classes: usize,
    /// Distinct labels at or above the old class count, ignore index excluded.
    pub novel_labels: Vec<usize>,
}

/// A [`RefineNet`] whose classification heads can be imprinted with novel
/// classes, snapshotted and restored.
pub struct ImprintingRefineNet<B: Backend, W = NormalizedMeanImprinter, P = SameDevice> {
    model: RefineNet<B>,
    snapshot: Option<SavedHeadWeights<B>>,
    policy: ClassCountPolicy,
    imprinter: W,
    placement: P,
}

impl<B: Backend> ImprintingRefineNet<B> {
    pub fn new(model: RefineNet<B>) -> Self {
        Self {
            model,
            snapshot: None,
            policy: ClassCountPolicy::default(),
            imprinter: NormalizedMeanImprinter,
            placement: SameDevice,
        }
    }

    pub fn from_config(model: RefineNet<B>, config: &ImprintConfig) -> Self {
        Self::new(model).with_policy(config.policy)
    }
}

impl<B, W, P> ImprintingRefineNet<B, W, P>
where
    B: Backend,
    W: WeightImprinter<B>,
    P: PlacementCheck<B>,
{
    pub fn with_policy(mut self, policy: ClassCountPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_imprinter<W2: WeightImprinter<B>>(
        self,
        imprinter: W2,
    ) -> ImprintingRefineNet<B, W2, P> {
        ImprintingRefineNet {
            model: self.model,
            snapshot: self.snapshot,
            policy: self.policy,
            imprinter,
            placement: self.placement,
        }
    }

    pub fn with_placement<P2: PlacementCheck<B>>(
        self,
        placement: P2,
    ) -> ImprintingRefineNet<B, W, P2> {
        ImprintingRefineNet {
            model: self.model,
            snapshot: self.snapshot,
            policy: self.policy,
            imprinter: self.imprinter,
            placement,
        }
    }

    pub fn model(&self) -> &RefineNet<B> {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut RefineNet<B> {
        &mut self.model
    }

    pub fn into_inner(self) -> RefineNet<B> {
        self.model
    }

    pub fn policy(&self) -> ClassCountPolicy {
        self.policy
    }

    pub fn n_classes(&self) -> usize {
        self.model.n_classes()
    }

    pub fn snapshot(&self) -> Option<&SavedHeadWeights<B>> {
        self.snapshot.as_ref()
    }

    /// Fused scores with the current heads.
    pub fn infer(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.model.infer(input)
    }

    /// Replaces all four heads with imprinted ones.
    ///
    /// Each pair is an image batch `[N, 3, H, W]` and its label maps `[N, H, W]`.
    /// Embeddings of every pair are gathered before any head changes, so an
    /// error leaves the model untouched.
    pub fn imprint(
        &mut self,
        images: &[Tensor<B, 4>],
        labels: &[Tensor<B, 3, Int>],
        alpha: f32,
    ) -> ImprintResult<ImprintSummary> {
        if images.is_empty() {
            return Err(ImprintError::EmptyImageSet);
        }
        if images.len() != labels.len() {
            return Err(ImprintError::MismatchedPairs {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ImprintError::InvalidAlpha(alpha));
        }
        for (index, (image, label)) in images.iter().zip(labels).enumerate() {
            let image_batch = image.dims()[0];
            let label_batch = label.dims()[0];
            if image_batch != label_batch {
                return Err(ImprintError::PairBatch {
                    index,
                    images: image_batch,
                    labels: label_batch,
                });
            }
        }

        let old_classes = self.model.n_classes();
        let novel_labels = self.novel_labels(labels, old_classes)?;
        let new_classes = self.imprinted_classes(old_classes, &novel_labels)?;

        let sets = images
            .iter()
            .zip(labels)
            .map(|(image, label)| {
                self.model
                    .extract(image.clone(), label.clone(), new_classes)
            })
            .collect::<Vec<_>>();
        let embeddings = EmbeddingSet::concat(sets).ok_or(ImprintError::EmptyImageSet)?;
        let image_count = embeddings.images();

        let decoder = self.model.decoder();
        let mut replacements = Vec::with_capacity(PyramidLevel::ALL.len());
        for level in PyramidLevel::ALL {
            let old_head = decoder.head(level);
            let device = old_head.device();
            let weight = self.imprinter.compute_weight(
                embeddings.get(level),
                old_classes,
                new_classes,
                old_head.weight(),
                alpha,
            );
            let rows = weight.dims()[0];
            assert!(
                rows >= old_classes,
                "{} imprinting dropped classes ({old_classes} -> {rows})",
                level.head_name()
            );
            assert_eq!(
                rows,
                new_classes,
                "{} imprinting produced {rows} rows, expected {new_classes}",
                level.head_name()
            );
            replacements.push((level, device, ClassificationHead::from_weight(weight)));
        }

        self.install(replacements, new_classes);

        log::info!(
            "imprinted {} novel class(es) {:?} from {image_count} image(s): \
             {old_classes} -> {new_classes} classes (alpha {alpha})",
            novel_labels.len(),
            novel_labels
        );

        Ok(ImprintSummary {
            images: image_count,
            old_classes,
            new_classes,
            novel_labels,
        })
    }

    /// Copies the current head kernels into the snapshot slot, replacing any
    /// earlier snapshot.
    pub fn save_original_weights(&mut self) {
        let snapshot = SavedHeadWeights::capture(&self.model);
        log::info!("saved head weights ({} classes)", snapshot.classes());
        self.snapshot = Some(snapshot);
    }

    /// Restores the heads from the snapshot and returns the restored class
    /// count. The snapshot stays available for later reversals.
    pub fn reverse_imprinting(&mut self) -> ImprintResult<usize> {
        let snapshot = self.snapshot.as_ref().ok_or(ImprintError::MissingSnapshot)?;
        let rows = snapshot.classes();
        let n_classes = match self.policy {
            ClassCountPolicy::Observed => rows,
            ClassCountPolicy::Fixed { reverted, .. } if reverted == rows => reverted,
            ClassCountPolicy::Fixed { reverted, .. } => {
                return Err(ImprintError::ClassCountMismatch {
                    expected: reverted,
                    found: rows,
                });
            }
        };

        let decoder = self.model.decoder();
        let replacements = PyramidLevel::ALL
            .into_iter()
            .map(|level| {
                let device = decoder.head(level).device();
                let weight = detached(snapshot.weight(level).clone());
                let head = ClassificationHead::from_weight(weight);
                (level, device, head)
            })
            .collect::<Vec<_>>();

        let previous = self.model.n_classes();
        self.install(replacements, n_classes);
        log::info!("reverted imprinting: {previous} -> {n_classes} classes");

        Ok(n_classes)
    }

    fn install(
        &mut self,
        replacements: Vec<(PyramidLevel, B::Device, ClassificationHead<B>)>,
        n_classes: usize,
    ) {
        for (level, device, head) in &replacements {
            assert!(
                self.placement.is_placed(device, &head.weight()),
                "{} head is not placed on the model device",
                level.head_name()
            );
        }

        let decoder = self.model.decoder_mut();
        for (level, _, head) in replacements {
            decoder.replace_head(level, head);
        }
        decoder.set_n_classes(n_classes);
        decoder.check_heads();
    }

    fn novel_labels(
        &self,
        labels: &[Tensor<B, 3, Int>],
        old_classes: usize,
    ) -> ImprintResult<Vec<usize>> {
        let ignore_index = self.model.ignore_index();
        let mut novel = BTreeSet::new();
        for label in labels {
            let values = label
                .clone()
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .map_err(|err| ImprintError::LabelData(format!("{err:?}")))?;
            novel.extend(
                values
                    .into_iter()
                    .filter(|value| *value >= 0)
                    .map(|value| value as usize)
                    .filter(|value| *value >= old_classes && *value != ignore_index),
            );
        }
        Ok(novel.into_iter().collect())
    }

    fn imprinted_classes(
        &self,
        old_classes: usize,
        novel_labels: &[usize],
    ) -> ImprintResult<usize> {
        match self.policy {
            ClassCountPolicy::Observed => {
                let contiguous = novel_labels
                    .iter()
                    .enumerate()
                    .all(|(offset, label)| *label == old_classes + offset);
                if !contiguous {
                    return Err(ImprintError::NonContiguousNovelLabels {
                        start: old_classes,
                        found: novel_labels.to_vec(),
                    });
                }
                Ok(old_classes + novel_labels.len())
            }
            ClassCountPolicy::Fixed { imprinted, .. } => {
                if imprinted < old_classes {
                    return Err(ImprintError::ClassCountMismatch {
                        expected: old_classes,
                        found: imprinted,
                    });
                }
                if let Some(label) = novel_labels.iter().find(|label| **label >= imprinted) {
                    log::warn!(
                        "label {label} has no row with {imprinted} imprinted classes and is skipped"
                    );
                }
                Ok(imprinted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::refinenet::{BackboneDepth, HEAD_INPUT_CHANNELS, RefineNetConfig};

    use std::{
        cell::Cell,
        panic::{self, AssertUnwindSafe},
    };

    type TestBackend = crate::InferenceBackend;
    type Device = <TestBackend as Backend>::Device;

    const SIZE: usize = 32;

    fn model(device: &Device, n_classes: usize) -> RefineNet<TestBackend> {
        RefineNetConfig::new(BackboneDepth::ResNet18, n_classes)
            .with_pretrained(false)
            .init(device)
    }

    fn image(device: &Device) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [1, 3, SIZE, SIZE],
            burn::tensor::Distribution::Default,
            device,
        )
    }

    /// Horizontal bands of equal height, one per entry of `classes`.
    fn bands(device: &Device, classes: &[i64]) -> Tensor<TestBackend, 3, Int> {
        let rows_per_band = SIZE.div_ceil(classes.len());
        let values: Vec<i64> = (0..SIZE * SIZE)
            .map(|index| classes[(index / SIZE) / rows_per_band])
            .collect();
        Tensor::<TestBackend, 1, Int>::from_ints(values.as_slice(), device)
            .reshape([1, SIZE, SIZE])
    }

    /// Top half `top`, bottom half `bottom`.
    fn labels(device: &Device, top: i64, bottom: i64) -> Tensor<TestBackend, 3, Int> {
        bands(device, &[top, bottom])
    }

    fn head_weights<W, P>(surgeon: &ImprintingRefineNet<TestBackend, W, P>) -> Vec<Tensor<TestBackend, 4>>
    where
        W: WeightImprinter<TestBackend>,
        P: PlacementCheck<TestBackend>,
    {
        PyramidLevel::ALL
            .into_iter()
            .map(|level| surgeon.model().decoder().head(level).weight())
            .collect()
    }

    fn assert_head_widths(surgeon: &ImprintingRefineNet<TestBackend>) {
        for level in PyramidLevel::ALL {
            assert_eq!(
                surgeon.model().decoder().head(level).input_channels(),
                HEAD_INPUT_CHANNELS
            );
        }
    }

    #[test]
    fn imprint_adds_one_row_per_novel_label() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3));
        let images: Vec<_> = (0..5).map(|_| image(&device)).collect();
        let labels = vec![
            bands(&device, &[0, 3, 4]),
            labels(&device, 3, 255),
            bands(&device, &[4, 1, 3]),
            labels(&device, 4, 2),
            labels(&device, 255, 3),
        ];

        let summary = surgeon.imprint(&images, &labels, 0.5).unwrap();

        assert_eq!(summary.images, 5);
        assert_eq!(summary.old_classes, 3);
        assert_eq!(summary.novel_labels, vec![3, 4]);
        assert_eq!(summary.new_classes, 5);
        assert_eq!(surgeon.n_classes(), 5);
        for level in PyramidLevel::ALL {
            assert_eq!(surgeon.model().decoder().head(level).classes(), 5);
        }
        assert_head_widths(&surgeon);
        assert_eq!(surgeon.infer(image(&device)).dims(), [1, 5, SIZE, SIZE]);
    }

    #[test]
    fn reverse_restores_saved_weights_exactly() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3));
        surgeon.save_original_weights();
        let saved = head_weights(&surgeon);

        surgeon
            .imprint(&[image(&device)], &[labels(&device, 1, 3)], 0.5)
            .unwrap();
        assert_eq!(surgeon.n_classes(), 4);

        assert_eq!(surgeon.reverse_imprinting().unwrap(), 3);
        assert_eq!(surgeon.n_classes(), 3);
        assert_head_widths(&surgeon);
        for (restored, saved) in head_weights(&surgeon).into_iter().zip(saved) {
            assert_eq!(restored.into_data(), saved.into_data());
        }

        // The snapshot outlives the reversal.
        assert!(surgeon.snapshot().is_some());
        assert_eq!(surgeon.reverse_imprinting().unwrap(), 3);
    }

    #[test]
    fn reverse_without_snapshot_is_rejected() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3));

        assert!(matches!(
            surgeon.reverse_imprinting(),
            Err(ImprintError::MissingSnapshot)
        ));
        assert_eq!(surgeon.n_classes(), 3);
    }

    #[test]
    fn blending_only_keeps_class_count() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3));
        let before = head_weights(&surgeon);

        let summary = surgeon
            .imprint(&[image(&device)], &[labels(&device, 0, 255)], 0.0)
            .unwrap();

        assert_eq!(summary.new_classes, 3);
        assert!(summary.novel_labels.is_empty());
        for (after, before) in head_weights(&surgeon).into_iter().zip(before) {
            assert!(after.all_close(before, Some(1e-6), Some(1e-6)));
        }
    }

    #[test]
    fn invalid_requests_leave_the_model_untouched() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3));

        assert!(matches!(
            surgeon.imprint(&[], &[], 0.5),
            Err(ImprintError::EmptyImageSet)
        ));
        assert!(matches!(
            surgeon.imprint(&[image(&device)], &[], 0.5),
            Err(ImprintError::MismatchedPairs { images: 1, labels: 0 })
        ));
        assert!(matches!(
            surgeon.imprint(&[image(&device)], &[labels(&device, 0, 3)], 1.5),
            Err(ImprintError::InvalidAlpha(_))
        ));
        assert!(matches!(
            surgeon.imprint(&[image(&device)], &[labels(&device, 0, 5)], 0.5),
            Err(ImprintError::NonContiguousNovelLabels { start: 3, .. })
        ));
        assert_eq!(surgeon.n_classes(), 3);
    }

    #[test]
    fn fixed_policy_reproduces_seventeen_sixteen_cycle() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 16)).with_policy(
            ClassCountPolicy::Fixed {
                imprinted: 17,
                reverted: 16,
            },
        );
        surgeon.save_original_weights();

        let summary = surgeon
            .imprint(&[image(&device)], &[labels(&device, 2, 16)], 0.5)
            .unwrap();
        assert_eq!(summary.new_classes, 17);
        assert_eq!(surgeon.n_classes(), 17);

        assert_eq!(surgeon.reverse_imprinting().unwrap(), 16);
        assert_eq!(surgeon.n_classes(), 16);
    }

    #[test]
    fn fixed_policy_rejects_snapshot_of_other_size() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3)).with_policy(
            ClassCountPolicy::Fixed {
                imprinted: 17,
                reverted: 16,
            },
        );
        surgeon.save_original_weights();

        assert!(matches!(
            surgeon.reverse_imprinting(),
            Err(ImprintError::ClassCountMismatch {
                expected: 16,
                found: 3
            })
        ));
    }

    /// Accepts the first `remaining` heads, then rejects the rest.
    struct PlacedFor {
        remaining: Cell<usize>,
    }

    impl PlacementCheck<TestBackend> for PlacedFor {
        fn is_placed(&self, _expected: &Device, _weight: &Tensor<TestBackend, 4>) -> bool {
            let remaining = self.remaining.get();
            self.remaining.set(remaining.saturating_sub(1));
            remaining > 0
        }
    }

    #[test]
    fn rejected_placement_keeps_every_head() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3)).with_placement(PlacedFor {
            remaining: Cell::new(1),
        });
        let before = head_weights(&surgeon);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            surgeon.imprint(&[image(&device)], &[labels(&device, 0, 3)], 0.5)
        }));

        assert!(result.is_err());
        assert_eq!(surgeon.n_classes(), 3);
        for level in PyramidLevel::ALL {
            assert_eq!(surgeon.model().decoder().head(level).classes(), 3);
        }
        for (after, before) in head_weights(&surgeon).into_iter().zip(before) {
            assert_eq!(after.into_data(), before.into_data());
        }
    }

    struct Nowhere;

    impl PlacementCheck<TestBackend> for Nowhere {
        fn is_placed(&self, _expected: &Device, _weight: &Tensor<TestBackend, 4>) -> bool {
            false
        }
    }

    #[test]
    #[should_panic(expected = "not placed on the model device")]
    fn misplaced_head_is_fatal() {
        let device = Device::default();
        let mut surgeon = ImprintingRefineNet::new(model(&device, 3)).with_placement(Nowhere);

        let _ = surgeon.imprint(&[image(&device)], &[labels(&device, 0, 3)], 0.5);
    }
}
