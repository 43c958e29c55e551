//! Middlebury `.flo` files: an f32 magic, i32 width, i32 height, then
//! row-major interleaved `(dx, dy)` f32 values, all little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::path::Path;

use crate::error::{FlowError, Result};
use crate::flow::FlowField;

pub const FLO_MAGIC: f32 = 202021.25;

pub fn write_flo<P: AsRef<Path>>(path: P, flow: &FlowField) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_flo_to(&mut writer, flow)?;
    writer.flush()?;
    Ok(())
}

pub fn read_flo<P: AsRef<Path>>(path: P) -> Result<FlowField> {
    let mut reader = BufReader::new(File::open(path)?);
    read_flo_from(&mut reader)
}

/// Largest field accepted from a header, in pixels.
pub const MAX_FLO_PIXELS: usize = 1 << 26;

pub fn write_flo_to<W: Write>(writer: &mut W, flow: &FlowField) -> Result<()> {
    let dim = |v: usize| {
        i32::try_from(v).map_err(|_| FlowError::InvalidFlowFile(format!("dimension {} does not fit a .flo header", v)))
    };
    writer.write_f32::<LittleEndian>(FLO_MAGIC)?;
    writer.write_i32::<LittleEndian>(dim(flow.width())?)?;
    writer.write_i32::<LittleEndian>(dim(flow.height())?)?;
    for &v in flow.data() {
        writer.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

pub fn read_flo_from<R: Read>(reader: &mut R) -> Result<FlowField> {
    let magic = reader.read_f32::<LittleEndian>()?;
    if magic != FLO_MAGIC {
        return Err(FlowError::InvalidFlowFile(format!(
            "bad magic {} (expected {})",
            magic, FLO_MAGIC
        )));
    }

    let width = reader.read_i32::<LittleEndian>()?;
    let height = reader.read_i32::<LittleEndian>()?;
    if width <= 0 || height <= 0 {
        return Err(FlowError::InvalidFlowFile(format!(
            "invalid dimensions {}x{}",
            width, height
        )));
    }
    let (w, h) = (width as usize, height as usize);
    let pixels = w
        .checked_mul(h)
        .filter(|&p| p <= MAX_FLO_PIXELS)
        .ok_or_else(|| {
            FlowError::InvalidFlowFile(format!(
                "{}x{} exceeds the {} pixel limit",
                width, height, MAX_FLO_PIXELS
            ))
        })?;
    let count = pixels * 2;

    // The buffer grows with what the file actually holds, not with the header.
    let mut bytes = Vec::new();
    reader.take((count * 4) as u64).read_to_end(&mut bytes)?;
    if bytes.len() != count * 4 {
        return Err(FlowError::InvalidFlowFile(format!(
            "truncated payload for {}x{}: {} of {} bytes",
            width,
            height,
            bytes.len(),
            count * 4
        )));
    }
    let mut data = vec![0f32; count];
    LittleEndian::read_f32_into(&bytes, &mut data);

    FlowField::new(w, h, data)
}
