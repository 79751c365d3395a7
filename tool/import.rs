use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{HalfPrecisionSettings, NamedMpkFileRecorder, Record, Recorder},
    tensor::backend::Backend,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use burn_refinenet::model::{
    ModelError, PretrainedWeights,
    refinenet::{
        BackboneDepth, RefineNet, RefineNetConfig, RefineNetRecord, ResNetEncoder,
        layers::encoder::ResNetEncoderRecord,
    },
};
use clap::Parser;
use serde_json::Value;

type ImportBackend = burn::backend::NdArray<f32>;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Convert RefineNet-LW or ImageNet ResNet PyTorch weights into Burn checkpoints"
)]
struct Args {
    /// PyTorch `.pth` state dict.
    #[arg(long, value_name = "PATH")]
    weights: Option<PathBuf>,

    /// Backbone depth: 18, 34, 50, 101 or 152.
    #[arg(long, default_value_t = 50)]
    depth: usize,

    #[arg(long, default_value_t = 21)]
    classes: usize,

    /// Treat the checkpoint as a torchvision ResNet and keep only the encoder.
    #[arg(long, default_value_t = false)]
    imagenet: bool,

    /// Output path; defaults to the cache entry the model loader looks for.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "DIR", default_value = "assets/model")]
    cache_dir: PathBuf,

    #[arg(long, value_name = "BOOL", default_value_t = false)]
    dry_run: bool,

    /// Write the Burn parameter paths of the target record, one per line.
    #[arg(long, value_name = "PATH")]
    dump_template: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let depth = BackboneDepth::from_layers(args.depth)
        .ok_or(ModelError::UnsupportedDepth(args.depth))?;
    let config = RefineNetConfig::new(depth, args.classes).with_pretrained(false);
    let device = <ImportBackend as Backend>::Device::default();

    if let Some(path) = &args.dump_template {
        if args.imagenet {
            let encoder = ResNetEncoder::<ImportBackend>::new(&device, depth);
            dump_template(encoder.into_record(), path)?;
        } else {
            let model = RefineNet::<ImportBackend>::new(&device, config.clone());
            dump_template(model.into_record(), path)?;
        }
        if args.dry_run {
            return Ok(());
        }
    }

    let weights = args.weights.clone().ok_or("--weights is required unless --dry-run")?;
    if !weights.exists() {
        return Err(format!("Checkpoint `{}` not found.", weights.display()).into());
    }

    let output = match &args.output {
        Some(path) => path.clone(),
        None => default_output(&args, depth)?,
    };

    log::info!("loading {}", weights.display());
    let load_args = key_remaps(LoadArgs::new(weights), !args.imagenet);
    let recorder = PyTorchFileRecorder::<HalfPrecisionSettings>::default();

    if args.imagenet {
        let record: ResNetEncoderRecord<ImportBackend> = recorder
            .load(load_args, &device)
            .map_err(|err| format!("Failed to decode encoder state: {err}"))?;
        let encoder = ResNetEncoder::<ImportBackend>::new(&device, depth).load_record(record);
        save(encoder, &output, args.dry_run)
    } else {
        let record: RefineNetRecord<ImportBackend> = recorder
            .load(load_args, &device)
            .map_err(|err| format!("Failed to decode model state: {err}"))?;
        let model = RefineNet::<ImportBackend>::new(&device, config).load_record(record);
        log::info!(
            "decoded ResNet-{} RefineNet-LW with {} classes",
            depth.layers(),
            model.n_classes()
        );
        save(model, &output, args.dry_run)
    }
}

fn default_output(
    args: &Args,
    depth: BackboneDepth,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let weights = PretrainedWeights::resolve(depth, args.classes, args.imagenet).ok_or_else(|| {
        format!(
            "no published checkpoint for ResNet-{} with {} classes; pass --output",
            depth.layers(),
            args.classes
        )
    })?;
    Ok(weights.checkpoint_path(&args.cache_dir))
}

/// PyTorch names to Burn record paths.
fn key_remaps(args: LoadArgs, full_model: bool) -> LoadArgs {
    let mut args = args.with_key_remap(r"^module\.", "");

    if full_model {
        args = args.with_key_remap(r"^(conv1|bn1|layer[1-4])\.", "encoder.$1.");
    }

    args = args
        .with_key_remap(r"\.downsample\.0\.", ".downsample.conv.")
        .with_key_remap(r"\.downsample\.1\.", ".downsample.bn.")
        .with_key_remap(r"(bn\d*)\.weight$", "$1.gamma")
        .with_key_remap(r"(bn\d*)\.bias$", "$1.beta");

    if !full_model {
        return args;
    }

    // Stage naming runs from the coarsest level: outl1/g1 is stage 4, outl4/g4 is stage 1.
    for (from, stage) in [(1, 4), (2, 3), (3, 2), (4, 1)] {
        args = args
            .with_key_remap(
                &format!(r"^p_ims1d2_outl{from}_dimred\."),
                &format!("decoder.stage{stage}.reduce."),
            )
            .with_key_remap(
                &format!(r"^mflow_conv_g{from}_b3_joint_varout_dimred\."),
                &format!("decoder.stage{stage}.joint."),
            )
            .with_key_remap(
                &format!(r"^adapt_stage{from}_b2_joint_varout_dimred\."),
                &format!("decoder.stage{stage}.adapt."),
            );
        for step in 1..=4 {
            args = args.with_key_remap(
                &format!(r"^mflow_conv_g{from}_pool\.0\.{step}_outvar_dimred\."),
                &format!("decoder.stage{stage}.crp.convs.{}.", step - 1),
            );
        }
    }

    args.with_key_remap(r"^clf_conv\.", "decoder.clf.conv.")
        .with_key_remap(r"^clf_l([2-4])_conv\.", "decoder.clf_l$1.conv.")
}

fn save<M: Module<ImportBackend>>(
    module: M,
    output: &Path,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if dry_run {
        println!("Dry run enabled; checkpoint not written.");
        return Ok(());
    }

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    module
        .save_file(output.to_path_buf(), &NamedMpkFileRecorder::<HalfPrecisionSettings>::new())
        .map_err(|err| format!("Failed to save checkpoint: {err}"))?;
    println!("Saved Burn checkpoint to {}", output.display());
    Ok(())
}

fn dump_template<R: Record<ImportBackend>>(
    record: R,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let value = serde_json::to_value(record.into_item::<HalfPrecisionSettings>())?;

    let mut paths = Vec::new();
    collect_paths(&value, String::new(), &mut paths);
    paths.sort();
    std::fs::write(path, paths.join("\n"))?;
    println!("Wrote template paths to {}", path.display());
    Ok(())
}

/// Dotted paths of every serialized tensor (objects holding `bytes`).
fn collect_paths(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if map.contains_key("bytes") {
                out.push(prefix.trim_end_matches('.').to_string());
                return;
            }
            for (key, child) in map {
                collect_paths(child, format!("{prefix}{key}."), out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                collect_paths(child, format!("{prefix}{index}."), out);
            }
        }
        _ => {}
    }
}
