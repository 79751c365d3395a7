pub mod refinenet;

use std::path::{Path, PathBuf};

use refinenet::BackboneDepth;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("checkpoint `{key}` is not in the cache at {path}; convert it from {url} first")]
    MissingCheckpoint {
        key: String,
        url: String,
        path: PathBuf,
    },
    #[error("failed to load checkpoint {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },
    #[error("unsupported backbone depth {0}; expected 18, 34, 50, 101 or 152")]
    UnsupportedDepth(usize),
}

/// Datasets with published RefineNet-LW checkpoints, keyed by class count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatasetFamily {
    Person,
    Voc,
    Nyu,
    Context,
}

impl DatasetFamily {
    pub fn from_classes(n_classes: usize) -> Option<Self> {
        match n_classes {
            7 => Some(Self::Person),
            21 => Some(Self::Voc),
            40 => Some(Self::Nyu),
            60 => Some(Self::Context),
            _ => None,
        }
    }

    pub fn classes(self) -> usize {
        match self {
            Self::Person => 7,
            Self::Voc => 21,
            Self::Nyu => 40,
            Self::Context => 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Voc => "voc",
            Self::Nyu => "nyu",
            Self::Context => "context",
        }
    }
}

const DATASET_URLS: &[(usize, DatasetFamily, &str)] = &[
    (50, DatasetFamily::Person, "https://cloudstor.aarnet.edu.au/plus/s/mLA7NxVSPjNL7Oo/download"),
    (101, DatasetFamily::Person, "https://cloudstor.aarnet.edu.au/plus/s/f1tGGpwdCnYS3xu/download"),
    (152, DatasetFamily::Person, "https://cloudstor.aarnet.edu.au/plus/s/Ql64rWqiTvWGAA0/download"),
    (50, DatasetFamily::Voc, "https://cloudstor.aarnet.edu.au/plus/s/2E1KrdF2Rfc5khB/download"),
    (101, DatasetFamily::Voc, "https://cloudstor.aarnet.edu.au/plus/s/CPRKWiaCIDRdOwF/download"),
    (152, DatasetFamily::Voc, "https://cloudstor.aarnet.edu.au/plus/s/2w8bFOd45JtPqbD/download"),
    (50, DatasetFamily::Nyu, "https://cloudstor.aarnet.edu.au/plus/s/gE8dnQmHr9svpfu/download"),
    (101, DatasetFamily::Nyu, "https://cloudstor.aarnet.edu.au/plus/s/VnsaSUHNZkuIqeB/download"),
    (152, DatasetFamily::Nyu, "https://cloudstor.aarnet.edu.au/plus/s/EkPQzB2KtrrDnKf/download"),
    (101, DatasetFamily::Context, "https://cloudstor.aarnet.edu.au/plus/s/hqmplxWOBbOYYjN/download"),
    (152, DatasetFamily::Context, "https://cloudstor.aarnet.edu.au/plus/s/O84NszlYlsu00fW/download"),
];

const IMAGENET_URLS: &[(usize, &str)] = &[
    (50, "https://download.pytorch.org/models/resnet50-19c8e357.pth"),
    (101, "https://download.pytorch.org/models/resnet101-5d3b4d8f.pth"),
    (152, "https://download.pytorch.org/models/resnet152-b121ed2d.pth"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightScope {
    /// Backbone classification weights; only the encoder record is loaded.
    EncoderOnly,
    /// Encoder and decoder trained on a segmentation dataset.
    FullModel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PretrainedWeights {
    pub key: String,
    pub url: &'static str,
    pub scope: WeightScope,
}

impl PretrainedWeights {
    /// ImageNet weights win over dataset weights when both are requested.
    pub fn resolve(depth: BackboneDepth, n_classes: usize, imagenet: bool) -> Option<Self> {
        let layers = depth.layers();

        if imagenet {
            return IMAGENET_URLS
                .iter()
                .find(|(entry, _)| *entry == layers)
                .map(|(_, url)| Self {
                    key: format!("{layers}_imagenet"),
                    url: *url,
                    scope: WeightScope::EncoderOnly,
                });
        }

        let family = DatasetFamily::from_classes(n_classes)?;
        DATASET_URLS
            .iter()
            .find(|(entry, entry_family, _)| *entry == layers && *entry_family == family)
            .map(|(_, _, url)| Self {
                key: format!("rf_lw{layers}_{}", family.as_str()),
                url: *url,
                scope: WeightScope::FullModel,
            })
    }

    /// Location of the converted `.mpk` record inside `cache_dir`.
    pub fn checkpoint_path(&self, cache_dir: impl AsRef<Path>) -> PathBuf {
        cache_dir.as_ref().join(format!("{}.mpk", self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_keys_follow_depth_and_family() {
        let weights = PretrainedWeights::resolve(BackboneDepth::ResNet101, 40, false).unwrap();

        assert_eq!(weights.key, "rf_lw101_nyu");
        assert_eq!(weights.scope, WeightScope::FullModel);
        assert!(weights.url.ends_with("VnsaSUHNZkuIqeB/download"));
    }

    #[test]
    fn context_is_missing_for_resnet50() {
        assert!(PretrainedWeights::resolve(BackboneDepth::ResNet50, 60, false).is_none());
        assert!(PretrainedWeights::resolve(BackboneDepth::ResNet152, 60, false).is_some());
    }

    #[test]
    fn unknown_class_count_has_no_weights() {
        assert!(PretrainedWeights::resolve(BackboneDepth::ResNet50, 17, false).is_none());
        assert!(PretrainedWeights::resolve(BackboneDepth::ResNet18, 21, false).is_none());
    }

    #[test]
    fn imagenet_takes_precedence_and_loads_encoder_only() {
        let weights = PretrainedWeights::resolve(BackboneDepth::ResNet50, 21, true).unwrap();

        assert_eq!(weights.key, "50_imagenet");
        assert_eq!(weights.scope, WeightScope::EncoderOnly);
        assert_eq!(
            weights.checkpoint_path("/tmp/cache"),
            PathBuf::from("/tmp/cache/50_imagenet.mpk")
        );
    }

    #[test]
    fn family_roundtrips_through_class_count() {
        for family in [
            DatasetFamily::Person,
            DatasetFamily::Voc,
            DatasetFamily::Nyu,
            DatasetFamily::Context,
        ] {
            assert_eq!(DatasetFamily::from_classes(family.classes()), Some(family));
        }
    }
}
