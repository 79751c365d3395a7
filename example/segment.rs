use std::path::PathBuf;

use burn::prelude::*;
use burn_refinenet::{
    InferenceBackend,
    inference::{colorize_labels, segment_from_rgb},
    model::{
        ModelError,
        refinenet::{BackboneDepth, RefineNet, RefineNetConfig},
    },
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Segment an image with RefineNet-LW")]
struct Args {
    #[arg(long, value_name = "PATH", default_value = "assets/image/test.jpg")]
    image: PathBuf,

    /// Burn checkpoint to load instead of the cached pretrained weights.
    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_name = "DIR", default_value = "assets/model")]
    cache_dir: PathBuf,

    #[arg(long, default_value_t = 50)]
    depth: usize,

    #[arg(long, default_value_t = 21)]
    classes: usize,

    #[arg(long, value_name = "PATH", default_value = "assets/image/segmentation.png")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let device = <InferenceBackend as Backend>::Device::default();
    let depth = BackboneDepth::from_layers(args.depth)
        .ok_or(ModelError::UnsupportedDepth(args.depth))?;
    let config = RefineNetConfig::new(depth, args.classes);

    let model = match &args.checkpoint {
        Some(path) => RefineNet::<InferenceBackend>::load_with_config(&device, config, path)
            .map_err(|err| format!("Failed to load checkpoint `{}`: {err}", path.display()))?,
        None => RefineNet::<InferenceBackend>::from_pretrained(&device, config, &args.cache_dir)?,
    };

    let image = image::open(&args.image)
        .map_err(|err| format!("Failed to load image `{}`: {err}", args.image.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();

    let result = segment_from_rgb::<InferenceBackend>(
        &model,
        image.as_raw(),
        width as usize,
        height as usize,
        &device,
    )
    .map_err(|err| format!("Failed to run inference: {err}"))?;

    let labels = result
        .labels
        .clone()
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| format!("Failed to read labels: {err:?}"))?;
    let mut counts = vec![0usize; model.n_classes()];
    for label in labels {
        if let Some(count) = counts.get_mut(label as usize) {
            *count += 1;
        }
    }
    for (class, count) in counts.iter().enumerate().filter(|(_, count)| **count > 0) {
        println!("class {class:>3}: {count} px");
    }

    colorize_labels(result.labels)?.save(&args.output)?;
    println!("Saved segmentation to {}", args.output.display());
    Ok(())
}
