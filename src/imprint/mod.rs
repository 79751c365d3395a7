//! Weight imprinting: grow the classification heads with novel classes
//! computed from class-masked embeddings, without gradient updates.

pub mod embedding;
pub mod surgeon;
pub mod weights;

use burn::config::Config;
use thiserror::Error;

pub use embedding::{EmbeddingSet, StageEmbeddings, masked_embeddings};
pub use surgeon::{
    ClassCountPolicy, ImprintSummary, ImprintingRefineNet, PlacementCheck, SameDevice,
    SavedHeadWeights,
};
pub use weights::{NormalizedMeanImprinter, WeightImprinter};

pub type ImprintResult<T> = Result<T, ImprintError>;

#[derive(Debug, Error)]
pub enum ImprintError {
    #[error("no saved head weights to restore; call save_original_weights first")]
    MissingSnapshot,
    #[error("imprinting needs at least one image/label pair")]
    EmptyImageSet,
    #[error("got {images} image(s) but {labels} label map(s)")]
    MismatchedPairs { images: usize, labels: usize },
    #[error("pair {index}: image batch {images} does not match label batch {labels}")]
    PairBatch {
        index: usize,
        images: usize,
        labels: usize,
    },
    #[error("alpha must lie in [0, 1], got {0}")]
    InvalidAlpha(f32),
    #[error("novel labels {found:?} must be contiguous from {start}")]
    NonContiguousNovelLabels { start: usize, found: Vec<usize> },
    #[error("class count mismatch: expected {expected}, found {found}")]
    ClassCountMismatch { expected: usize, found: usize },
    #[error("label map could not be read back: {0}")]
    LabelData(String),
}

/// Defaults for an imprinting session.
#[derive(Config, Debug)]
pub struct ImprintConfig {
    /// Blend factor for base classes seen in the imprinting set.
    #[config(default = "0.5")]
    pub alpha: f32,
    #[config(default = "ClassCountPolicy::Observed")]
    pub policy: ClassCountPolicy,
}
