use anyhow::Result;
use tch::Device;

use trainer::{build_loader, FileSummaryWriter, Split, Trainer, TrainerConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/training_config.yaml".to_string());
    let config = TrainerConfig::from_yaml_file(&config_path)?;
    config.validate()?;

    let device = Device::cuda_if_available();
    log::info!("using device {:?}, config {}", device, config_path);

    let loader = build_loader(&config, Split::Train)?;
    let mut summary = FileSummaryWriter::new(&config.log_dir)?;
    let mut trainer = Trainer::new(config, device)?;
    let report = trainer.train(&loader, &mut summary)?;

    log::info!(
        "finished {} steps, last loss {:?}",
        report.steps,
        report.last_loss
    );
    Ok(())
}
