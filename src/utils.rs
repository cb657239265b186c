use std::io::{Read, Write};

use crate::error::Result;

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buffer = [0u8; std::mem::size_of::<u32>()];
    r.read_exact(&mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

pub fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buffer = [0u8; std::mem::size_of::<f32>()];
    r.read_exact(&mut buffer)?;
    Ok(f32::from_le_bytes(buffer))
}

pub fn read_f32_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<f32>> {
    let mut values = Vec::with_capacity(len);
    for _ in 0..len {
        values.push(read_f32(r)?);
    }
    Ok(values)
}

pub fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn write_f32_slice<W: Write>(w: &mut W, values: &[f32]) -> Result<()> {
    for value in values {
        w.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}
