use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use flow_core::{LossMode, OptimizerKind, Preprocess};
use inference::{load_model, PredictOptions};
use tch::Device;
use trainer::{build_loader, evaluate, CropType, DatasetKind, FileSummaryWriter, Split, Trainer, TrainerConfig};

#[derive(Parser)]
#[command(author, version, about = "Multi-resolution optical flow training and inference", long_about = None)]
struct Cli {
    /// cpu, cuda, cuda:N or auto
    #[arg(long, global = true, default_value = "auto", value_parser = parse_device)]
    device: Device,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a flow network
    Train(TrainArgs),
    /// Predict flow for one frame pair
    Pred {
        /// Source and target frames
        #[arg(short, long, num_args = 2, value_names = ["SRC", "TGT"], required = true)]
        input: Vec<PathBuf>,

        /// Output .flo; a colour-coded .png is written next to it
        #[arg(short, long, default_value = "output.flo")]
        output: PathBuf,

        /// Checkpoint file or run directory
        #[arg(long)]
        load: PathBuf,

        #[command(flatten)]
        shape: ShapeArgs,

        /// Open the rendered flow in the system image viewer
        #[arg(long)]
        show: bool,
    },
    /// Report the mean end-point error on the test split
    Eval {
        /// Checkpoint file
        #[arg(long)]
        load: PathBuf,
    },
}

#[derive(Args, Default)]
struct ShapeArgs {
    /// Centre/random crop as HEIGHT WIDTH
    #[arg(long, num_args = 2, value_names = ["H", "W"])]
    crop_shape: Option<Vec<usize>>,

    /// Resize to HEIGHT WIDTH
    #[arg(long, num_args = 2, value_names = ["H", "W"], conflicts_with = "resize_scale")]
    resize_shape: Option<Vec<usize>>,

    /// Uniform resize factor
    #[arg(long)]
    resize_scale: Option<f64>,
}

/// Every flag overrides the value from `--config` (or the default).
#[derive(Args)]
struct TrainArgs {
    /// YAML training config to start from
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    dataset: Option<DatasetKind>,
    #[arg(long)]
    dataset_dir: Option<PathBuf>,
    #[arg(long)]
    crop_type: Option<CropType>,
    #[command(flatten)]
    shape: ShapeArgs,
    #[arg(long)]
    num_workers: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    input_norm: bool,

    #[arg(long)]
    num_levels: Option<usize>,
    #[arg(long, num_args = 1..)]
    lv_chs: Option<Vec<i64>>,
    #[arg(long)]
    search_range: Option<i64>,
    #[arg(long)]
    no_correlation: bool,
    #[arg(long)]
    corr_activation: bool,
    #[arg(long)]
    use_warping_layer: bool,
    #[arg(long)]
    use_context_network: bool,

    /// L1, L2, PyramidL1 or PyramidL2
    #[arg(long)]
    loss: Option<LossMode>,
    #[arg(long, num_args = 1..)]
    weights: Option<Vec<f64>>,
    #[arg(long)]
    epsilon: Option<f64>,
    #[arg(long)]
    q: Option<f64>,

    /// SGD or Adam
    #[arg(long)]
    optimizer: Option<OptimizerKind>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    momentum: Option<f64>,
    #[arg(long)]
    beta: Option<f64>,
    #[arg(long)]
    weight_decay: Option<f64>,

    #[arg(long)]
    total_step: Option<usize>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long)]
    summary_interval: Option<usize>,
    #[arg(long)]
    log_interval: Option<usize>,
    #[arg(long)]
    checkpoint_interval: Option<usize>,
    #[arg(long)]
    max_output: Option<usize>,
}

fn parse_device(s: &str) -> Result<Device> {
    match s {
        "auto" => Ok(Device::cuda_if_available()),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda(0)),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(index)) => Ok(Device::Cuda(index)),
            _ => bail!("unknown device '{}', expected cpu, cuda, cuda:N or auto", other),
        },
    }
}

fn pair(values: Option<Vec<usize>>) -> Option<[usize; 2]> {
    values.map(|v| [v[0], v[1]])
}

macro_rules! set_if_some {
    ($($target:expr => $value:expr),+ $(,)?) => {
        $(if let Some(v) = $value {
            $target = v;
        })+
    };
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainerConfig> {
        let mut config = match &self.config {
            Some(path) => TrainerConfig::from_yaml_file(path)?,
            None => TrainerConfig::default(),
        };

        set_if_some! {
            config.dataset => self.dataset,
            config.dataset_dir => self.dataset_dir,
            config.crop_type => self.crop_type,
            config.num_workers => self.num_workers,
            config.batch_size => self.batch_size,
            config.net.num_levels => self.num_levels,
            config.net.lv_chs => self.lv_chs,
            config.net.search_range => self.search_range,
            config.loss.mode => self.loss,
            config.loss.weights => self.weights,
            config.loss.epsilon => self.epsilon,
            config.loss.q => self.q,
            config.optimizer.kind => self.optimizer,
            config.optimizer.lr => self.lr,
            config.optimizer.momentum => self.momentum,
            config.optimizer.beta => self.beta,
            config.optimizer.weight_decay => self.weight_decay,
            config.total_step => self.total_step,
            config.log_dir => self.log_dir,
            config.summary_interval => self.summary_interval,
            config.log_interval => self.log_interval,
            config.checkpoint_interval => self.checkpoint_interval,
            config.max_output => self.max_output,
        }
        if let Some(crop) = pair(self.shape.crop_shape) {
            config.crop_shape = Some(crop);
        }
        if let Some(shape) = pair(self.shape.resize_shape) {
            config.resize_shape = Some(shape);
            config.resize_scale = None;
        }
        if let Some(scale) = self.shape.resize_scale {
            config.resize_scale = Some(scale);
            config.resize_shape = None;
        }
        config.input_norm |= self.input_norm;
        config.net.use_correlation &= !self.no_correlation;
        config.net.corr_activation |= self.corr_activation;
        config.net.use_warping_layer |= self.use_warping_layer;
        config.net.use_context_network |= self.use_context_network;

        config.validate()?;
        Ok(config)
    }
}

fn train(args: TrainArgs, device: Device) -> Result<()> {
    let config = args.into_config()?;
    let loader = build_loader(&config, Split::Train)?;
    let mut summary = FileSummaryWriter::new(&config.log_dir)?;
    let mut trainer = Trainer::new(config, device)?;
    let report = trainer.train(&loader, &mut summary)?;
    tracing::info!(
        "done: {} steps ({} skipped), last loss {:?}",
        report.steps,
        report.skipped_batches,
        report.last_loss
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    tracing::info!("device: {:?}", cli.device);

    match cli.command {
        Commands::Train(args) => train(args, cli.device)?,
        Commands::Pred {
            input,
            output,
            load,
            shape,
            show,
        } => {
            let preprocess = Preprocess::new(
                pair(shape.crop_shape),
                pair(shape.resize_shape),
                shape.resize_scale,
            )?;
            let predictor = load_model(&load, cli.device)?.into_predictor(cli.device);
            let options = PredictOptions {
                src: input[0].clone(),
                tgt: input[1].clone(),
                output,
                preprocess,
                show,
            };
            let image = predictor.run(&options)?;
            println!("Flow written to {:?} ({:?})", options.output, image);
        }
        Commands::Eval { load } => {
            let report = evaluate(&load, cli.device)?;
            println!("EPE: {:.4} over {} samples", report.mean_epe, report.samples);
        }
    }

    Ok(())
}
