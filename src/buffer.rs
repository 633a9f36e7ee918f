//! The uniform pixel buffer capability and its implementations.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::{
    Dimensions, Error, ImageDescriptor, PixelData, PixelType, Result, TileCoordinate,
};

mod flat;
mod pyramid;

pub use flat::FlatPixelBuffer;
pub use pyramid::{PyramidOptions, PyramidPixelBuffer};

/// Read and write access to the pixels of one image, independent of storage format.
///
/// Coordinates are pixel indices at the current resolution level. Operations a
/// format cannot perform fail with [Error::Unsupported].
/// A buffer is not safe for concurrent mutation; callers keep one writer per image.
pub trait PixelBufferTraits {
    fn descriptor(&self) -> &ImageDescriptor;

    /// Backing file or container.
    fn path(&self) -> &Path;

    fn id(&self) -> u64 {
        self.descriptor().id()
    }

    fn pixel_type(&self) -> PixelType {
        self.descriptor().pixel_type()
    }

    /// Plane width at the current resolution level.
    fn size_x(&self) -> u32 {
        self.descriptor().size_x()
    }

    /// Plane height at the current resolution level.
    fn size_y(&self) -> u32 {
        self.descriptor().size_y()
    }

    fn size_z(&self) -> u32 {
        self.descriptor().size_z()
    }

    fn size_c(&self) -> u32 {
        self.descriptor().size_c()
    }

    fn size_t(&self) -> u32 {
        self.descriptor().size_t()
    }

    /// Offset arithmetic at the current resolution level.
    fn dimensions(&self) -> Dimensions {
        self.descriptor()
            .dimensions()
            .with_plane(self.size_x(), self.size_y())
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn resolution_levels(&self) -> usize {
        1
    }

    fn resolution_level(&self) -> usize {
        0
    }

    fn set_resolution_level(&mut self, level: usize) -> Result<()> {
        if level == 0 {
            Ok(())
        } else {
            Err(Error::InvalidResolutionLevel { level, levels: 1 })
        }
    }

    /// Plane width and height of every resolution level, level 0 first.
    fn resolution_descriptions(&self) -> Vec<(u32, u32)> {
        vec![(self.descriptor().size_x(), self.descriptor().size_y())]
    }

    /// Read a region of one plane. Regions running past the plane edge are clipped.
    fn get_tile(&mut self, tile: TileCoordinate) -> Result<PixelData>;

    fn set_tile(&mut self, _tile: TileCoordinate, _pixels: &[u8]) -> Result<()> {
        Err(Error::unsupported(format!(
            "tile writes to pixels {} at {}",
            self.id(),
            self.path().display()
        )))
    }

    fn get_row(&mut self, y: u32, z: u32, c: u32, t: u32) -> Result<PixelData> {
        let width = self.size_x();
        self.get_tile(TileCoordinate::new(z, c, t, 0, y, width, 1))
    }

    fn get_col(&mut self, x: u32, z: u32, c: u32, t: u32) -> Result<PixelData> {
        let height = self.size_y();
        self.get_tile(TileCoordinate::new(z, c, t, x, 0, 1, height))
    }

    fn get_plane(&mut self, z: u32, c: u32, t: u32) -> Result<PixelData> {
        let (width, height) = (self.size_x(), self.size_y());
        self.get_tile(TileCoordinate::plane(z, c, t, width, height))
    }

    fn get_stack(&mut self, c: u32, t: u32) -> Result<PixelData> {
        let dims = self.dimensions();
        dims.check(crate::Axis::C, c as i64)?;
        dims.check(crate::Axis::T, t as i64)?;
        let mut out = Vec::with_capacity(dims.stack_size() as usize);
        for z in 0..self.size_z() {
            out.extend_from_slice(self.get_plane(z, c, t)?.as_bytes());
        }
        Ok(PixelData::new(self.pixel_type(), out))
    }

    fn get_timepoint(&mut self, t: u32) -> Result<PixelData> {
        let dims = self.dimensions();
        dims.check(crate::Axis::T, t as i64)?;
        let mut out = Vec::with_capacity(dims.timepoint_size() as usize);
        for c in 0..self.size_c() {
            out.extend_from_slice(self.get_stack(c, t)?.as_bytes());
        }
        Ok(PixelData::new(self.pixel_type(), out))
    }

    /// Copy `count` pixels starting at pixel `start_index` of a plane into `out`.
    #[allow(clippy::too_many_arguments)]
    fn get_plane_region_direct(
        &mut self,
        _z: u32,
        _c: u32,
        _t: u32,
        _count: u64,
        _start_index: u64,
        _out: &mut [u8],
    ) -> Result<()> {
        Err(Error::unsupported("direct plane region reads"))
    }

    fn set_row(&mut self, _y: u32, _z: u32, _c: u32, _t: u32, _pixels: &[u8]) -> Result<()> {
        Err(Error::unsupported("row writes"))
    }

    fn set_plane(&mut self, _z: u32, _c: u32, _t: u32, _pixels: &[u8]) -> Result<()> {
        Err(Error::unsupported("plane writes"))
    }

    fn set_stack(&mut self, _c: u32, _t: u32, _pixels: &[u8]) -> Result<()> {
        Err(Error::unsupported("stack writes"))
    }

    fn set_timepoint(&mut self, _t: u32, _pixels: &[u8]) -> Result<()> {
        Err(Error::unsupported("timepoint writes"))
    }

    /// SHA-256 over every plane at the current resolution level, in raster order.
    fn message_digest(&mut self) -> Result<[u8; 32]> {
        let mut hasher = Sha256::new();
        for t in 0..self.size_t() {
            for c in 0..self.size_c() {
                for z in 0..self.size_z() {
                    hasher.update(self.get_plane(z, c, t)?.as_bytes());
                }
            }
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Ok(out)
    }

    /// Release file handles. The next access reopens them.
    fn close(&mut self) -> Result<()>;
}

/// A pixel buffer in one of the supported storage formats.
pub enum PixelBuffer {
    Flat(FlatPixelBuffer),
    Pyramid(PyramidPixelBuffer),
    /// Supplied by an original-file metadata provider, e.g. a vendor format
    /// wrapped for read-only access.
    External(Box<dyn PixelBufferTraits + Send>),
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelBuffer::Flat(b) => f.debug_tuple("Flat").field(b).finish(),
            PixelBuffer::Pyramid(b) => f.debug_tuple("Pyramid").field(b).finish(),
            PixelBuffer::External(b) => f
                .debug_tuple("External")
                .field(&b.path().display())
                .finish(),
        }
    }
}

impl From<FlatPixelBuffer> for PixelBuffer {
    fn from(value: FlatPixelBuffer) -> Self {
        Self::Flat(value)
    }
}

impl From<PyramidPixelBuffer> for PixelBuffer {
    fn from(value: PyramidPixelBuffer) -> Self {
        Self::Pyramid(value)
    }
}

impl PixelBuffer {
    pub fn is_pyramid(&self) -> bool {
        matches!(self, PixelBuffer::Pyramid(_))
    }

    pub fn as_flat(&self) -> Option<&FlatPixelBuffer> {
        match self {
            PixelBuffer::Flat(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_pyramid(&self) -> Option<&PyramidPixelBuffer> {
        match self {
            PixelBuffer::Pyramid(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_pyramid_mut(&mut self) -> Option<&mut PyramidPixelBuffer> {
        match self {
            PixelBuffer::Pyramid(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $buffer:ident => $body:expr) => {
        match $self {
            PixelBuffer::Flat($buffer) => $body,
            PixelBuffer::Pyramid($buffer) => $body,
            PixelBuffer::External($buffer) => $body,
        }
    };
}

impl PixelBufferTraits for PixelBuffer {
    fn descriptor(&self) -> &ImageDescriptor {
        dispatch!(self, b => b.descriptor())
    }

    fn path(&self) -> &Path {
        dispatch!(self, b => b.path())
    }

    fn id(&self) -> u64 {
        dispatch!(self, b => b.id())
    }

    fn pixel_type(&self) -> PixelType {
        dispatch!(self, b => b.pixel_type())
    }

    fn size_x(&self) -> u32 {
        dispatch!(self, b => b.size_x())
    }

    fn size_y(&self) -> u32 {
        dispatch!(self, b => b.size_y())
    }

    fn size_z(&self) -> u32 {
        dispatch!(self, b => b.size_z())
    }

    fn size_c(&self) -> u32 {
        dispatch!(self, b => b.size_c())
    }

    fn size_t(&self) -> u32 {
        dispatch!(self, b => b.size_t())
    }

    fn dimensions(&self) -> Dimensions {
        dispatch!(self, b => b.dimensions())
    }

    fn is_writable(&self) -> bool {
        dispatch!(self, b => b.is_writable())
    }

    fn resolution_levels(&self) -> usize {
        dispatch!(self, b => b.resolution_levels())
    }

    fn resolution_level(&self) -> usize {
        dispatch!(self, b => b.resolution_level())
    }

    fn set_resolution_level(&mut self, level: usize) -> Result<()> {
        dispatch!(self, b => b.set_resolution_level(level))
    }

    fn resolution_descriptions(&self) -> Vec<(u32, u32)> {
        dispatch!(self, b => b.resolution_descriptions())
    }

    fn get_tile(&mut self, tile: TileCoordinate) -> Result<PixelData> {
        dispatch!(self, b => b.get_tile(tile))
    }

    fn set_tile(&mut self, tile: TileCoordinate, pixels: &[u8]) -> Result<()> {
        dispatch!(self, b => b.set_tile(tile, pixels))
    }

    fn get_row(&mut self, y: u32, z: u32, c: u32, t: u32) -> Result<PixelData> {
        dispatch!(self, b => b.get_row(y, z, c, t))
    }

    fn get_col(&mut self, x: u32, z: u32, c: u32, t: u32) -> Result<PixelData> {
        dispatch!(self, b => b.get_col(x, z, c, t))
    }

    fn get_plane(&mut self, z: u32, c: u32, t: u32) -> Result<PixelData> {
        dispatch!(self, b => b.get_plane(z, c, t))
    }

    fn get_stack(&mut self, c: u32, t: u32) -> Result<PixelData> {
        dispatch!(self, b => b.get_stack(c, t))
    }

    fn get_timepoint(&mut self, t: u32) -> Result<PixelData> {
        dispatch!(self, b => b.get_timepoint(t))
    }

    #[allow(clippy::too_many_arguments)]
    fn get_plane_region_direct(
        &mut self,
        z: u32,
        c: u32,
        t: u32,
        count: u64,
        start_index: u64,
        out: &mut [u8],
    ) -> Result<()> {
        dispatch!(self, b => b.get_plane_region_direct(z, c, t, count, start_index, out))
    }

    fn set_row(&mut self, y: u32, z: u32, c: u32, t: u32, pixels: &[u8]) -> Result<()> {
        dispatch!(self, b => b.set_row(y, z, c, t, pixels))
    }

    fn set_plane(&mut self, z: u32, c: u32, t: u32, pixels: &[u8]) -> Result<()> {
        dispatch!(self, b => b.set_plane(z, c, t, pixels))
    }

    fn set_stack(&mut self, c: u32, t: u32, pixels: &[u8]) -> Result<()> {
        dispatch!(self, b => b.set_stack(c, t, pixels))
    }

    fn set_timepoint(&mut self, t: u32, pixels: &[u8]) -> Result<()> {
        dispatch!(self, b => b.set_timepoint(t, pixels))
    }

    fn message_digest(&mut self) -> Result<[u8; 32]> {
        dispatch!(self, b => b.message_digest())
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(self, b => b.close())
    }
}
