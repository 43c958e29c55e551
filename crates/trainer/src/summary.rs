use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::RgbImage;
use serde::Serialize;

/// Sink for training scalars and images.
pub trait SummaryWriter {
    fn scalar_summary(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    fn image_summary(&mut self, tag: &str, images: &[RgbImage], step: usize) -> Result<()>;
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    step: usize,
    tag: &'a str,
    value: f64,
}

/// Appends scalars to `<dir>/scalars.jsonl` and writes images to
/// `<dir>/images/<tag>/<step>_<i>.png`.
pub struct FileSummaryWriter {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl FileSummaryWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let path = dir.join("scalars.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }
}

/// Tags such as `src & tgt` become `src_tgt`.
fn tag_dir(tag: &str) -> String {
    let mut out = String::with_capacity(tag.len());
    for c in tag.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out
}

impl SummaryWriter for FileSummaryWriter {
    fn scalar_summary(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        serde_json::to_writer(&mut self.scalars, &ScalarRecord { step, tag, value })?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }

    fn image_summary(&mut self, tag: &str, images: &[RgbImage], step: usize) -> Result<()> {
        let dir = self.dir.join("images").join(tag_dir(tag));
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
        for (i, img) in images.iter().enumerate() {
            let path = dir.join(format!("{:08}_{}.png", step, i));
            img.save(&path)
                .with_context(|| format!("Failed to write {:?}", path))?;
        }
        self.scalars.flush()?;
        Ok(())
    }
}

impl Drop for FileSummaryWriter {
    fn drop(&mut self) {
        if let Err(e) = self.scalars.flush() {
            log::warn!("failed to flush summaries in {:?}: {}", self.dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_scalars_and_images() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = FileSummaryWriter::new(dir.path()).unwrap();
            writer.scalar_summary("loss", 0.5, 100).unwrap();
            writer.scalar_summary("L1-loss-lv0", 1.25, 100).unwrap();
            writer
                .image_summary("src & tgt", &[RgbImage::new(2, 2), RgbImage::new(2, 2)], 100)
                .unwrap();
        }

        let lines: Vec<serde_json::Value> = fs::read_to_string(dir.path().join("scalars.jsonl"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["tag"], "L1-loss-lv0");
        assert_eq!(lines[1]["value"], 1.25);

        let images = dir.path().join("images").join("src_tgt");
        assert!(images.join("00000100_0.png").exists());
        assert!(images.join("00000100_1.png").exists());
    }

    #[test]
    fn tag_dir_sanitizes() {
        assert_eq!(tag_dir("flow&gt-lv2"), "flow_gt-lv2");
        assert_eq!(tag_dir("src & tgt"), "src_tgt");
    }
}
