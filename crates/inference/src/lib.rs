use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flow_core::{load_checkpoint, ModelConfig, PwcNet};
use tch::{nn, Device};

pub mod predictor;

pub use predictor::{PredictOptions, Predictor};

pub use flow_core::RUN_CONFIG_FILE;

pub struct LoadedModel {
    pub model: PwcNet,
    pub config: ModelConfig,
    pub checkpoint: PathBuf,
    /// Owns the weights the model points into.
    pub vs: nn::VarStore,
}

impl LoadedModel {
    pub fn into_predictor(self, device: Device) -> Predictor<PwcNet> {
        Predictor::new(self.model, device, self.config.input_norm)
    }
}

/// `<step>.safetensors` with the highest step in `dir`.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "safetensors") {
            continue;
        }
        let step = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(step) = step {
            if best.as_ref().map_or(true, |(b, _)| step > *b) {
                best = Some((step, path));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Loads a checkpoint file, or the latest one when `path` is a run directory,
/// together with the network settings stored in that run's `config.json`.
pub fn load_model(path: &Path, device: Device) -> Result<LoadedModel> {
    let checkpoint = if path.is_dir() {
        match latest_checkpoint(path)? {
            Some(checkpoint) => checkpoint,
            None => bail!("no <step>.safetensors checkpoint found in {:?}", path),
        }
    } else {
        path.to_path_buf()
    };

    let dir = checkpoint.parent().unwrap_or_else(|| Path::new("."));
    let config_path = dir.join(RUN_CONFIG_FILE);
    let config: ModelConfig = if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {:?}", config_path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", config_path))?
    } else {
        tracing::warn!("{:?} not found, assuming the default network", config_path);
        ModelConfig::default()
    };

    let mut vs = nn::VarStore::new(device);
    let model = PwcNet::new(&vs.root(), &config.net)?;
    load_checkpoint(&mut vs, &checkpoint)
        .with_context(|| format!("Failed to load checkpoint {:?}", checkpoint))?;
    tracing::info!("loaded weights from {:?}", checkpoint);

    Ok(LoadedModel {
        model,
        config,
        checkpoint,
        vs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::{save_checkpoint, NetConfig};

    fn tiny() -> ModelConfig {
        ModelConfig {
            net: NetConfig {
                num_levels: 2,
                lv_chs: vec![4, 6],
                search_range: 1,
                ..Default::default()
            },
            input_norm: true,
        }
    }

    fn write_run(dir: &Path, steps: &[u64]) {
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = PwcNet::new(&vs.root(), &tiny().net).unwrap();
        for step in steps {
            save_checkpoint(&vs, dir.join(format!("{}.safetensors", step))).unwrap();
        }
        // The trainer writes its whole config; unknown fields are ignored.
        let mut json = serde_json::to_value(tiny()).unwrap();
        json["batch_size"] = serde_json::json!(8);
        std::fs::write(dir.join(RUN_CONFIG_FILE), json.to_string()).unwrap();
    }

    #[test]
    fn latest_checkpoint_orders_steps_numerically() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), &[2, 10, 9]);
        std::fs::write(dir.path().join("notes.safetensors"), b"").unwrap();
        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("10.safetensors"));
    }

    #[test]
    fn loads_from_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), &[100]);
        let loaded = load_model(dir.path(), Device::Cpu).unwrap();
        assert_eq!(loaded.config, tiny());
        assert!(loaded.checkpoint.ends_with("100.safetensors"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_model(dir.path(), Device::Cpu).is_err());
    }

    #[test]
    fn mismatched_network_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_run(dir.path(), &[1]);
        let mut other = tiny();
        other.net.lv_chs = vec![4, 8];
        std::fs::write(
            dir.path().join(RUN_CONFIG_FILE),
            serde_json::to_string(&other).unwrap(),
        )
        .unwrap();
        assert!(load_model(&dir.path().join("1.safetensors"), Device::Cpu).is_err());
    }
}
