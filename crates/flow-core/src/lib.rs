pub mod checkpoint;
pub mod config;
pub mod error;
pub mod flow;
pub mod flow_io;
pub mod flow_vis;
pub mod loss;
pub mod network;
pub mod pyramid;
pub mod transforms;

pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use config::{LossConfig, LossMode, ModelConfig, NetConfig, OptimizerConfig, OptimizerKind};
pub use error::{FlowError, Result};
pub use flow::FlowField;
pub use loss::LossAggregator;
pub use network::{FlowModel, FlowOutput, PwcNet};
pub use pyramid::build_flow_pyramid;
pub use transforms::{Preprocess, Resize};

/// Resolved run configuration the trainer writes next to its checkpoints and
/// inference reads back.
pub const RUN_CONFIG_FILE: &str = "config.json";
