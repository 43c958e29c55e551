use std::borrow::Cow;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, SafeTensors, View};
use tch::{nn, Device, Kind, Tensor};

use crate::error::{FlowError, Result};

/// Host copy of one variable, laid out as little-endian f32.
struct HostTensor {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl HostTensor {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.size().iter().map(|&d| d as usize).collect();
        let flat = tensor
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous()
            .view([-1]);
        let values = Vec::<f32>::try_from(&flat)?;
        let mut bytes = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(&values, &mut bytes);
        Ok(Self { shape, bytes })
    }
}

impl View for &HostTensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Writes every variable of `vs` to `path` in safetensors format.
///
/// The file is first written next to its destination, read back and compared
/// byte for byte, and only then renamed into place. A checkpoint that exists
/// under its final name is therefore complete.
pub fn save_checkpoint<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let path = path.as_ref();
    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    let host = variables
        .iter()
        .map(|(name, t)| Ok((name.clone(), HostTensor::from_tensor(t)?)))
        .collect::<Result<Vec<_>>>()?;

    let tmp = staging_path(path);
    safetensors::serialize_to_file(host.iter().map(|(n, t)| (n.as_str(), t)), &None, &tmp)?;

    if let Err(e) = verify_written(&tmp, &host) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn verify_written(path: &Path, expected: &[(String, HostTensor)]) -> Result<()> {
    let bytes = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&bytes)?;
    if tensors.len() != expected.len() {
        return Err(FlowError::Checkpoint(format!(
            "{} holds {} tensors after writing {}",
            path.display(),
            tensors.len(),
            expected.len()
        )));
    }
    for (name, host) in expected {
        let view = tensors.tensor(name)?;
        if view.shape() != host.shape.as_slice() || view.data() != host.bytes.as_slice() {
            return Err(FlowError::Checkpoint(format!(
                "tensor '{}' in {} does not match what was written",
                name,
                path.display()
            )));
        }
    }
    Ok(())
}

/// Loads a checkpoint written by [`save_checkpoint`] into `vs`.
///
/// Every variable of the store must be present with the same shape, and the
/// file must not carry variables the store does not know. Anything else means
/// the checkpoint belongs to a differently configured network.
pub fn load_checkpoint<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();

    for name in tensors.names() {
        if !variables.contains_key(name.as_str()) {
            return Err(FlowError::Checkpoint(format!(
                "{} contains '{}', which the model does not define",
                path.display(),
                name
            )));
        }
    }

    for (name, var) in variables.iter_mut() {
        let view = tensors.tensor(name).map_err(|_| {
            FlowError::Checkpoint(format!("{} is missing '{}'", path.display(), name))
        })?;
        if view.dtype() != Dtype::F32 {
            return Err(FlowError::Checkpoint(format!(
                "'{}' has dtype {:?}, expected F32",
                name,
                view.dtype()
            )));
        }
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            return Err(FlowError::Checkpoint(format!(
                "'{}' has shape {:?} in {} but {:?} in the model",
                name,
                shape,
                path.display(),
                var.size()
            )));
        }
        let loaded = Tensor::from_data_size(view.data(), &shape, Kind::Float).to_device(device);
        tch::no_grad(|| {
            var.copy_(&loaded);
        });
    }
    log::debug!("loaded {} tensors from {}", variables.len(), path.display());
    Ok(())
}
