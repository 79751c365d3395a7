use std::path::{Path, PathBuf};

use burn::{prelude::*, tensor::Int};
use burn_refinenet::{
    InferenceBackend,
    imprint::{ClassCountPolicy, ImprintConfig, ImprintingRefineNet},
    inference::{colorize_labels, mask_to_label_tensor, rgb_to_input_tensor, segment},
    model::{
        ModelError,
        refinenet::{BackboneDepth, RefineNet, RefineNetConfig},
    },
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Imprint novel classes into RefineNet-LW from image/mask pairs"
)]
struct Args {
    /// Support image; repeat once per pair.
    #[arg(long = "image", value_name = "PATH", required = true)]
    images: Vec<PathBuf>,

    /// Greyscale mask holding one class index per pixel; repeat once per pair.
    #[arg(long = "mask", value_name = "PATH", required = true)]
    masks: Vec<PathBuf>,

    /// Image segmented after imprinting.
    #[arg(long, value_name = "PATH")]
    query: PathBuf,

    #[arg(long, default_value_t = 0.5)]
    alpha: f32,

    /// Fixed class counts `IMPRINTED,REVERTED` instead of one row per novel label.
    #[arg(long, value_name = "N,M", value_parser = parse_fixed_policy)]
    fixed: Option<ClassCountPolicy>,

    /// Restore the original heads afterwards and segment the query again.
    #[arg(long, default_value_t = false)]
    reverse: bool,

    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_name = "DIR", default_value = "assets/model")]
    cache_dir: PathBuf,

    #[arg(long, default_value_t = 50)]
    depth: usize,

    #[arg(long, default_value_t = 21)]
    classes: usize,

    #[arg(long, value_name = "PATH", default_value = "assets/image/imprinted.png")]
    output: PathBuf,
}

fn parse_fixed_policy(value: &str) -> Result<ClassCountPolicy, String> {
    let (imprinted, reverted) = value
        .split_once(',')
        .ok_or_else(|| format!("expected IMPRINTED,REVERTED, got `{value}`"))?;
    let parse = |field: &str| {
        field
            .trim()
            .parse::<usize>()
            .map_err(|err| format!("invalid class count `{field}`: {err}"))
    };
    Ok(ClassCountPolicy::Fixed {
        imprinted: parse(imprinted)?,
        reverted: parse(reverted)?,
    })
}

type Device = <InferenceBackend as Backend>::Device;

fn load_image(
    path: &Path,
    device: &Device,
) -> Result<(Tensor<InferenceBackend, 4>, u32, u32), String> {
    let image = image::open(path)
        .map_err(|err| format!("Failed to load image `{}`: {err}", path.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    let tensor = rgb_to_input_tensor(image.as_raw(), width as usize, height as usize, device)?;
    Ok((tensor, width, height))
}

fn load_mask(
    path: &Path,
    width: u32,
    height: u32,
    device: &Device,
) -> Result<Tensor<InferenceBackend, 3, Int>, String> {
    let mask = image::open(path)
        .map_err(|err| format!("Failed to load mask `{}`: {err}", path.display()))?
        .to_luma8();
    if mask.dimensions() != (width, height) {
        return Err(format!(
            "mask `{}` is {:?} but its image is {width}x{height}",
            path.display(),
            mask.dimensions()
        ));
    }
    mask_to_label_tensor(mask.as_raw(), width as usize, height as usize, device)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let device = Device::default();
    let depth = BackboneDepth::from_layers(args.depth)
        .ok_or(ModelError::UnsupportedDepth(args.depth))?;
    let config = RefineNetConfig::new(depth, args.classes);

    let model = match &args.checkpoint {
        Some(path) => RefineNet::<InferenceBackend>::load_with_config(&device, config, path)
            .map_err(|err| format!("Failed to load checkpoint `{}`: {err}", path.display()))?,
        None => RefineNet::<InferenceBackend>::from_pretrained(&device, config, &args.cache_dir)?,
    };

    let mut imprint_config = ImprintConfig::new().with_alpha(args.alpha);
    if let Some(policy) = args.fixed {
        imprint_config = imprint_config.with_policy(policy);
    }
    let mut surgeon = ImprintingRefineNet::from_config(model, &imprint_config);
    surgeon.save_original_weights();

    let mut images = Vec::with_capacity(args.images.len());
    let mut labels = Vec::with_capacity(args.masks.len());
    for (image_path, mask_path) in args.images.iter().zip(&args.masks) {
        let (image, width, height) = load_image(image_path, &device)?;
        labels.push(load_mask(mask_path, width, height, &device)?);
        images.push(image);
    }
    if args.images.len() != args.masks.len() {
        log::warn!(
            "{} image(s) and {} mask(s) given; only complete pairs are used",
            args.images.len(),
            args.masks.len()
        );
    }

    let summary = surgeon.imprint(&images, &labels, imprint_config.alpha)?;
    println!(
        "Imprinted {:?} from {} image(s): {} -> {} classes",
        summary.novel_labels, summary.images, summary.old_classes, summary.new_classes
    );

    let (query, _, _) = load_image(&args.query, &device)?;
    let imprinted = segment(surgeon.model(), query.clone());
    colorize_labels(imprinted.labels)?.save(&args.output)?;
    println!("Saved imprinted segmentation to {}", args.output.display());

    if args.reverse {
        let restored = surgeon.reverse_imprinting()?;
        let reverted = segment(surgeon.model(), query);
        let output = args.output.with_file_name(format!(
            "{}_reverted.png",
            args.output
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("segmentation")
        ));
        colorize_labels(reverted.labels)?.save(&output)?;
        println!(
            "Reverted to {restored} classes; saved segmentation to {}",
            output.display()
        );
    }

    Ok(())
}
