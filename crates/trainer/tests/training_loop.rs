use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flow_core::{flow_io, load_checkpoint, FlowField, FlowModel, FlowOutput, LossConfig, LossMode, NetConfig, PwcNet};
use image::{Rgb, RgbImage};
use tch::{nn, Device, Kind, Tensor};
use trainer::{
    evaluate, DataLoader, FileSummaryWriter, InMemoryDataset, Sample, SampleTransform,
    StepOptimizer, Trainer, TrainerConfig, RUN_CONFIG_FILE,
};

/// Predicts a constant flow everywhere from a single learnable bias.
struct ConstantFlow {
    bias: Tensor,
    levels: usize,
}

impl ConstantFlow {
    fn new(vs: &nn::VarStore, levels: usize) -> Self {
        Self {
            bias: vs.root().zeros("bias", &[1, 2, 1, 1]),
            levels,
        }
    }
}

impl FlowModel for ConstantFlow {
    fn forward(&self, src: &Tensor, _tgt: &Tensor) -> FlowOutput {
        let size = src.size();
        let (b, h, w) = (size[0], size[2], size[3]);
        let fill = |h: i64, w: i64| &self.bias * Tensor::ones([b, 2, h, w], (Kind::Float, Device::Cpu));
        let pyramid = (0..self.levels)
            .map(|k| {
                let factor = 1i64 << (self.levels - k);
                fill(h / factor, w / factor)
            })
            .collect();
        FlowOutput {
            flow: fill(h, w),
            pyramid,
        }
    }
}

#[derive(Default)]
struct CountingOptimizer {
    zero_grads: usize,
    steps: usize,
}

impl StepOptimizer for CountingOptimizer {
    fn zero_grad(&mut self) {
        self.zero_grads += 1;
    }

    fn step(&mut self) {
        self.steps += 1;
    }
}

fn tiny_net() -> NetConfig {
    NetConfig {
        num_levels: 2,
        lv_chs: vec![4, 6],
        search_range: 1,
        ..Default::default()
    }
}

fn config(log_dir: &Path, batch_size: usize, total_step: usize) -> TrainerConfig {
    TrainerConfig {
        crop_shape: None,
        batch_size,
        total_step,
        net: tiny_net(),
        loss: LossConfig {
            mode: LossMode::PyramidL1,
            weights: vec![1.0, 0.5],
            ..Default::default()
        },
        log_dir: log_dir.to_path_buf(),
        summary_interval: 1,
        log_interval: 1,
        checkpoint_interval: 2,
        max_output: 1,
        num_workers: 0,
        ..Default::default()
    }
}

fn samples(n: usize, size: u32) -> Vec<Sample> {
    (0..n)
        .map(|i| {
            let mut flow = FlowField::zeros(size as usize, size as usize);
            flow.set(1, 1, (1.0 + i as f32, -2.0));
            Sample {
                src: RgbImage::from_fn(size, size, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, i as u8])),
                tgt: RgbImage::from_fn(size, size, |x, y| Rgb([(y * 10) as u8, (x * 10) as u8, i as u8])),
                flow,
            }
        })
        .collect()
}

fn loader(n: usize, batch_size: usize) -> DataLoader {
    let dataset = Arc::new(InMemoryDataset::new(samples(n, 8)));
    DataLoader::new(dataset, batch_size, false, SampleTransform::default()).unwrap()
}

fn stub_trainer(config: TrainerConfig) -> Trainer<ConstantFlow, CountingOptimizer> {
    let vs = nn::VarStore::new(Device::Cpu);
    let model = ConstantFlow::new(&vs, config.net.num_levels);
    Trainer::from_parts(config, vs, model, CountingOptimizer::default(), Device::Cpu).unwrap()
}

#[test]
fn partial_batches_never_reach_the_optimizer() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("run");
    // 5 samples in batches of 2: two full batches and one partial per epoch.
    let mut trainer = stub_trainer(config(&log_dir, 2, 6));
    let mut summary = FileSummaryWriter::new(&log_dir).unwrap();

    let report = trainer.train(&loader(5, 2), &mut summary).unwrap();

    assert_eq!(report.steps, 6);
    assert_eq!(report.epochs, 2);
    assert_eq!(report.skipped_batches, 2);
    assert_eq!(report.optimizer_steps, 4);
    assert_eq!(trainer.optimizer().steps, 4);
    assert_eq!(trainer.optimizer().zero_grads, 4);
    assert!(report.last_loss.unwrap() > 0.0);
}

#[test]
fn writes_run_config_checkpoints_and_summaries() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("run");
    let mut trainer = stub_trainer(config(&log_dir, 2, 6));
    let mut summary = FileSummaryWriter::new(&log_dir).unwrap();
    trainer.train(&loader(5, 2), &mut summary).unwrap();
    drop(summary);

    // Steps 3 and 6 hold the partial batch, so only 2 and 4 are saved.
    assert!(log_dir.join("2.safetensors").exists());
    assert!(log_dir.join("4.safetensors").exists());
    assert!(!log_dir.join("6.safetensors").exists());

    let saved = TrainerConfig::for_checkpoint(log_dir.join("4.safetensors")).unwrap();
    assert_eq!(saved.net, tiny_net());
    assert_eq!(saved.loss.mode, LossMode::PyramidL1);

    let scalars = fs::read_to_string(log_dir.join("scalars.jsonl")).unwrap();
    for tag in ["\"loss\"", "\"L1-loss-lv0\"", "\"L2-loss-lv1\""] {
        assert!(scalars.contains(tag), "missing {}", tag);
    }
    assert!(log_dir.join("images").join("flow_gt-lv1").join("00000001_0.png").exists());
    assert!(log_dir.join("images").join("src_tgt").join("00000001_0.png").exists());

    let mut restored = nn::VarStore::new(Device::Cpu);
    let _model = ConstantFlow::new(&restored, 2);
    load_checkpoint(&mut restored, log_dir.join("4.safetensors")).unwrap();
}

/// Predicts one level too few.
struct ShallowFlow(ConstantFlow);

impl FlowModel for ShallowFlow {
    fn forward(&self, src: &Tensor, tgt: &Tensor) -> FlowOutput {
        let mut out = self.0.forward(src, tgt);
        out.pyramid.remove(0);
        out
    }
}

#[test]
fn misaligned_pyramid_aborts_training() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("run"), 2, 4);
    let vs = nn::VarStore::new(Device::Cpu);
    let model = ShallowFlow(ConstantFlow::new(&vs, 2));
    let mut trainer =
        Trainer::from_parts(config, vs, model, CountingOptimizer::default(), Device::Cpu).unwrap();
    let mut summary = FileSummaryWriter::new(dir.path().join("run")).unwrap();

    assert!(trainer.train(&loader(4, 2), &mut summary).is_err());
    assert_eq!(trainer.optimizer().steps, 0);
}

#[test]
fn step_timings_accumulate_across_log_intervals() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("run");
    // log_interval is 1, so every trained step also logs.
    let mut trainer = stub_trainer(config(&log_dir, 2, 6));
    let mut summary = FileSummaryWriter::new(&log_dir).unwrap();

    trainer.train(&loader(5, 2), &mut summary).unwrap();
    let (forward, backward) = (trainer.forward_time(), trainer.backward_time());
    assert_eq!(trainer.timed_steps(), 4);
    assert!(forward > Duration::ZERO);
    assert!(backward > Duration::ZERO);

    trainer.train(&loader(5, 2), &mut summary).unwrap();
    assert_eq!(trainer.timed_steps(), 8);
    assert!(trainer.forward_time() > forward);
    assert!(trainer.backward_time() > backward);
}

#[test]
fn dataset_smaller_than_batch_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("run");
    let mut trainer = stub_trainer(config(&log_dir, 2, 4));
    let mut summary = FileSummaryWriter::new(&log_dir).unwrap();

    let err = trainer.train(&loader(1, 2), &mut summary).unwrap_err();
    assert!(err.to_string().contains("batch_size 2"), "{}", err);
    assert_eq!(trainer.optimizer().zero_grads, 0);
    assert!(!log_dir.join(RUN_CONFIG_FILE).exists());

    // Exactly one full batch is enough.
    let report = trainer.train(&loader(2, 2), &mut summary).unwrap();
    assert_eq!(report.optimizer_steps, 4);
}

fn write_flying_chairs(root: &Path, n: usize, size: u32) {
    let data = root.join("data");
    fs::create_dir_all(&data).unwrap();
    for (i, sample) in samples(n, size).into_iter().enumerate() {
        sample.src.save(data.join(format!("{:05}_img1.ppm", i + 1))).unwrap();
        sample.tgt.save(data.join(format!("{:05}_img2.ppm", i + 1))).unwrap();
        flow_io::write_flo(data.join(format!("{:05}_flow.flo", i + 1)), &sample.flow).unwrap();
    }
}

#[test]
fn pwc_network_trains_and_evaluates_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("chairs");
    write_flying_chairs(&data_dir, 3, 16);

    let log_dir = dir.path().join("run");
    let config = TrainerConfig {
        dataset_dir: data_dir,
        batch_size: 1,
        input_norm: true,
        ..config(&log_dir, 1, 2)
    };
    let loader = trainer::build_loader(&config, trainer::Split::Train).unwrap();
    assert_eq!(loader.num_samples(), 2);

    let mut trainer = Trainer::new(config, Device::Cpu).unwrap();
    let mut summary = FileSummaryWriter::new(&log_dir).unwrap();
    let report = trainer.train(&loader, &mut summary).unwrap();
    assert_eq!(report.optimizer_steps, 2);
    assert!(report.last_loss.unwrap().is_finite());

    let checkpoint = log_dir.join("2.safetensors");
    let mut vs = nn::VarStore::new(Device::Cpu);
    let _net = PwcNet::new(&vs.root(), &tiny_net()).unwrap();
    load_checkpoint(&mut vs, &checkpoint).unwrap();

    let eval = evaluate(&checkpoint, Device::Cpu).unwrap();
    assert_eq!(eval.samples, 1);
    assert!(eval.mean_epe.is_finite());
}
