//! Typed access to raw pixel bytes.

use sha2::{Digest, Sha256};

use crate::{Error, PixelType, Result};

fn pixel_count(buffer: &[u8], pixel_type: PixelType) -> usize {
    match pixel_type.byte_width() {
        Some(w) => buffer.len() / w,
        None => buffer.len() * 8,
    }
}

fn check_index(buffer: &[u8], index: usize, pixel_type: PixelType) -> Result<()> {
    let count = pixel_count(buffer, pixel_type);
    if index >= count {
        return Err(Error::IndexOutOfBounds { index, count });
    }
    Ok(())
}

fn get_bit(buffer: &[u8], index: usize) -> bool {
    buffer[index / 8] & (0x80 >> (index % 8)) != 0
}

fn set_bit(buffer: &mut [u8], index: usize, on: bool) {
    let mask = 0x80 >> (index % 8);
    if on {
        buffer[index / 8] |= mask;
    } else {
        buffer[index / 8] &= !mask;
    }
}

fn be<const N: usize>(buffer: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buffer[offset..offset + N]);
    out
}

/// Read the pixel at `index` (a pixel index, not a byte offset).
pub fn get_pixel_value(buffer: &[u8], index: usize, pixel_type: PixelType) -> Result<f64> {
    check_index(buffer, index, pixel_type)?;
    let o = pixel_type.byte_width().map_or(0, |w| index * w);
    let value = match pixel_type {
        PixelType::Bit => {
            if get_bit(buffer, index) {
                1.0
            } else {
                0.0
            }
        }
        PixelType::Int8 => buffer[o] as i8 as f64,
        PixelType::Uint8 => buffer[o] as f64,
        PixelType::Int16 => i16::from_be_bytes(be(buffer, o)) as f64,
        PixelType::Uint16 => u16::from_be_bytes(be(buffer, o)) as f64,
        PixelType::Int32 => i32::from_be_bytes(be(buffer, o)) as f64,
        PixelType::Uint32 => u32::from_be_bytes(be(buffer, o)) as f64,
        PixelType::Float => f32::from_be_bytes(be(buffer, o)) as f64,
        PixelType::Double => f64::from_be_bytes(be(buffer, o)),
    };
    Ok(value)
}

/// Write the pixel at `index`, saturating to the range of integer types.
///
/// For bit data any non-zero value sets the bit; neighbouring bits are untouched.
pub fn set_pixel_value(
    buffer: &mut [u8],
    index: usize,
    value: f64,
    pixel_type: PixelType,
) -> Result<()> {
    check_index(buffer, index, pixel_type)?;
    let o = pixel_type.byte_width().map_or(0, |w| index * w);
    match pixel_type {
        PixelType::Bit => set_bit(buffer, index, value != 0.0),
        PixelType::Int8 => buffer[o] = value as i8 as u8,
        PixelType::Uint8 => buffer[o] = value as u8,
        PixelType::Int16 => buffer[o..o + 2].copy_from_slice(&(value as i16).to_be_bytes()),
        PixelType::Uint16 => buffer[o..o + 2].copy_from_slice(&(value as u16).to_be_bytes()),
        PixelType::Int32 => buffer[o..o + 4].copy_from_slice(&(value as i32).to_be_bytes()),
        PixelType::Uint32 => buffer[o..o + 4].copy_from_slice(&(value as u32).to_be_bytes()),
        PixelType::Float => buffer[o..o + 4].copy_from_slice(&(value as f32).to_be_bytes()),
        PixelType::Double => buffer[o..o + 8].copy_from_slice(&value.to_be_bytes()),
    }
    Ok(())
}

/// Copy `count` pixels between buffers of the same type.
///
/// Whole-byte types copy bytes; bit data is shifted bit by bit, so neither
/// side needs to be byte aligned.
pub fn copy_pixels(
    src: &[u8],
    src_index: usize,
    dst: &mut [u8],
    dst_index: usize,
    count: usize,
    pixel_type: PixelType,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    check_index(src, src_index + count - 1, pixel_type)?;
    check_index(dst, dst_index + count - 1, pixel_type)?;
    match pixel_type.byte_width() {
        Some(w) => {
            dst[dst_index * w..(dst_index + count) * w]
                .copy_from_slice(&src[src_index * w..(src_index + count) * w]);
        }
        None => {
            for i in 0..count {
                set_bit(dst, dst_index + i, get_bit(src, src_index + i));
            }
        }
    }
    Ok(())
}

/// SHA-256 of a byte slice.
pub fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

/// Pixels read from or destined for a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelData {
    pixel_type: PixelType,
    data: Vec<u8>,
}

impl PixelData {
    pub fn new(pixel_type: PixelType, data: Vec<u8>) -> Self {
        Self { pixel_type, data }
    }

    /// Zero-filled storage for `pixel_count` pixels.
    pub fn zeroed(pixel_type: PixelType, pixel_count: u64) -> Self {
        Self::new(pixel_type, vec![0; pixel_type.byte_len(pixel_count) as usize])
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of addressable pixels; for bit data this includes padding bits.
    pub fn len(&self) -> usize {
        pixel_count(&self.data, self.pixel_type)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_pixel_value(&self, index: usize) -> Result<f64> {
        get_pixel_value(&self.data, index, self.pixel_type)
    }

    pub fn set_pixel_value(&mut self, index: usize, value: f64) -> Result<()> {
        set_pixel_value(&mut self.data, index, value, self.pixel_type)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn digest(&self) -> [u8; 32] {
        digest(&self.data)
    }
}

impl AsRef<[u8]> for PixelData {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
