//! Byte offsets into a 5D pixel buffer laid out in X, Y, Z, C, T raster order.
//!
//! Every offset operation validates its indices before computing anything.
//! Indices are taken as `i64` so that negative values coming from callers are
//! rejected with [Error::DimensionsOutOfBounds] rather than wrapping.

use crate::{Axis, Error, ImageDescriptor, PixelType, Result};

/// Extent and encoding of a buffer, as seen by offset arithmetic.
///
/// For pyramids this reflects the current resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub size_x: u64,
    pub size_y: u64,
    pub size_z: u64,
    pub size_c: u64,
    pub size_t: u64,
    pub pixel_type: PixelType,
}

impl From<&ImageDescriptor> for Dimensions {
    fn from(value: &ImageDescriptor) -> Self {
        Self {
            size_x: value.size_x() as u64,
            size_y: value.size_y() as u64,
            size_z: value.size_z() as u64,
            size_c: value.size_c() as u64,
            size_t: value.size_t() as u64,
            pixel_type: value.pixel_type(),
        }
    }
}

impl Dimensions {
    /// The same Z/C/T extent with a different plane size.
    pub fn with_plane(self, size_x: u32, size_y: u32) -> Self {
        Self {
            size_x: size_x as u64,
            size_y: size_y as u64,
            ..self
        }
    }

    pub fn size(&self, axis: Axis) -> u64 {
        match axis {
            Axis::X => self.size_x,
            Axis::Y => self.size_y,
            Axis::Z => self.size_z,
            Axis::C => self.size_c,
            Axis::T => self.size_t,
        }
    }

    /// Validate one index, returning it unsigned.
    pub fn check(&self, axis: Axis, value: i64) -> Result<u64> {
        let bound = self.size(axis);
        if value < 0 || value as u64 >= bound {
            return Err(Error::DimensionsOutOfBounds { axis, value, bound });
        }
        Ok(value as u64)
    }

    pub fn check_zct(&self, z: i64, c: i64, t: i64) -> Result<(u64, u64, u64)> {
        Ok((
            self.check(Axis::Z, z)?,
            self.check(Axis::C, c)?,
            self.check(Axis::T, t)?,
        ))
    }

    /// Bytes in one row; rows of bit data round up to whole bytes.
    pub fn row_size(&self) -> u64 {
        self.pixel_type.byte_len(self.size_x)
    }

    /// Bytes in one plane; bit planes are packed across rows.
    pub fn plane_size(&self) -> u64 {
        self.pixel_type.byte_len(self.size_x * self.size_y)
    }

    pub fn stack_size(&self) -> u64 {
        self.plane_size() * self.size_z
    }

    pub fn timepoint_size(&self) -> u64 {
        self.stack_size() * self.size_c
    }

    pub fn total_size(&self) -> u64 {
        self.timepoint_size() * self.size_t
    }

    pub fn plane_pixels(&self) -> u64 {
        self.size_x * self.size_y
    }

    pub fn row_offset(&self, y: i64, z: i64, c: i64, t: i64) -> Result<u64> {
        let y = self.check(Axis::Y, y)?;
        Ok(self.plane_offset(z, c, t)? + y * self.row_size())
    }

    pub fn plane_offset(&self, z: i64, c: i64, t: i64) -> Result<u64> {
        let (z, c, t) = self.check_zct(z, c, t)?;
        Ok(t * self.timepoint_size() + c * self.stack_size() + z * self.plane_size())
    }

    pub fn stack_offset(&self, c: i64, t: i64) -> Result<u64> {
        let c = self.check(Axis::C, c)?;
        let t = self.check(Axis::T, t)?;
        Ok(t * self.timepoint_size() + c * self.stack_size())
    }

    pub fn timepoint_offset(&self, t: i64) -> Result<u64> {
        let t = self.check(Axis::T, t)?;
        Ok(t * self.timepoint_size())
    }
}
