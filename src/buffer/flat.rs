use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, info};

use super::PixelBufferTraits;
use crate::{
    Axis, Dimensions, Error, ImageDescriptor, PixelData, PixelType, Result, TileCoordinate,
    pixel_data::copy_pixels, shard::ensure_parent_dirs,
};

/// Pixels stored as one contiguous file in X, Y, Z, C, T raster order.
///
/// Offsets come from [Dimensions]; every index is validated before any I/O.
#[derive(Debug)]
pub struct FlatPixelBuffer {
    descriptor: ImageDescriptor,
    dims: Dimensions,
    path: PathBuf,
    file: Option<File>,
    writable: bool,
}

impl FlatPixelBuffer {
    /// Open an existing buffer, read-write only if `writable`.
    pub fn open(
        path: impl Into<PathBuf>,
        descriptor: ImageDescriptor,
        writable: bool,
    ) -> Result<Self> {
        let mut buffer = Self {
            dims: descriptor.dimensions(),
            descriptor,
            path: path.into(),
            file: None,
            writable,
        };
        let metadata = buffer.file()?.metadata();
        let len = metadata
            .map_err(|e| buffer.resource("stat pixels file", e))?
            .len();
        if len < buffer.dims.total_size() {
            return Err(buffer.resource(
                "open pixels file",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "file holds {len} bytes, pixels need {}",
                        buffer.dims.total_size()
                    ),
                ),
            ));
        }
        debug!(
            "opened flat pixels {} at {} ({})",
            buffer.descriptor.id(),
            buffer.path.display(),
            if writable { "read-write" } else { "read-only" }
        );
        Ok(buffer)
    }

    /// Create a new zero-filled, writable buffer, including any missing parent directories.
    pub fn create(path: impl Into<PathBuf>, descriptor: ImageDescriptor) -> Result<Self> {
        let path = path.into();
        let id = descriptor.id();
        ensure_parent_dirs(&path)
            .map_err(|e| Error::resource(id, "create pixels directory", &path, e))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::resource(id, "create pixels file", &path, e))?;
        let dims = descriptor.dimensions();
        file.set_len(dims.total_size())
            .map_err(|e| Error::resource(id, "size pixels file", &path, e))?;
        info!(
            "created flat pixels {id} at {} ({} bytes)",
            path.display(),
            dims.total_size()
        );
        Ok(Self {
            descriptor,
            dims,
            path,
            file: Some(file),
            writable: true,
        })
    }

    pub fn row_size(&self) -> u64 {
        self.dims.row_size()
    }

    pub fn plane_size(&self) -> u64 {
        self.dims.plane_size()
    }

    pub fn stack_size(&self) -> u64 {
        self.dims.stack_size()
    }

    pub fn timepoint_size(&self) -> u64 {
        self.dims.timepoint_size()
    }

    pub fn total_size(&self) -> u64 {
        self.dims.total_size()
    }

    fn resource(&self, operation: &'static str, source: io::Error) -> Error {
        Error::resource(self.descriptor.id(), operation, &self.path, source)
    }

    fn file(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .read(true)
                .write(self.writable)
                .open(&self.path)
                .map_err(|e| self.resource("open pixels file", e))?,
        };
        Ok(self.file.insert(file))
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly {
                image_id: self.descriptor.id(),
                path: self.path.clone(),
            })
        }
    }

    fn check_len(expected: u64, pixels: &[u8]) -> Result<()> {
        if pixels.len() as u64 != expected {
            return Err(Error::BufferSize {
                expected,
                actual: pixels.len() as u64,
            });
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        let file = self.file()?;
        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut out));
        result.map_err(|e| self.resource("read pixels", e))?;
        Ok(out)
    }

    fn write_at(&mut self, offset: u64, pixels: &[u8]) -> Result<()> {
        self.check_writable()?;
        let file = self.file()?;
        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(pixels));
        result.map_err(|e| self.resource("write pixels", e))
    }

    /// `count` pixels starting at pixel `first` of the plane at `plane_offset`.
    ///
    /// Bit data comes back packed from bit 0 of the first byte.
    fn read_pixels(&mut self, plane_offset: u64, first: u64, count: u64) -> Result<Vec<u8>> {
        let pixel_type = self.descriptor.pixel_type();
        match pixel_type.byte_width() {
            Some(w) => self.read_at(plane_offset + first * w as u64, count * w as u64),
            None => {
                let start = first / 8;
                let end = (first + count).div_ceil(8);
                let raw = self.read_at(plane_offset + start, end - start)?;
                let mut out = vec![0u8; count.div_ceil(8) as usize];
                copy_pixels(
                    &raw,
                    (first % 8) as usize,
                    &mut out,
                    0,
                    count as usize,
                    PixelType::Bit,
                )?;
                Ok(out)
            }
        }
    }

    fn write_pixels(
        &mut self,
        plane_offset: u64,
        first: u64,
        count: u64,
        pixels: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        let pixel_type = self.descriptor.pixel_type();
        match pixel_type.byte_width() {
            Some(w) => self.write_at(plane_offset + first * w as u64, pixels),
            None => {
                // read-modify-write so neighbouring bits survive
                let start = first / 8;
                let end = (first + count).div_ceil(8);
                let mut raw = self.read_at(plane_offset + start, end - start)?;
                copy_pixels(
                    pixels,
                    0,
                    &mut raw,
                    (first % 8) as usize,
                    count as usize,
                    PixelType::Bit,
                )?;
                self.write_at(plane_offset + start, &raw)
            }
        }
    }

    /// Clip `tile` to the plane after validating its origin.
    fn clip(&self, tile: TileCoordinate) -> Result<TileCoordinate> {
        let dims = self.dims;
        let x = dims.check(Axis::X, tile.x as i64)?;
        let y = dims.check(Axis::Y, tile.y as i64)?;
        dims.check_zct(tile.z as i64, tile.c as i64, tile.t as i64)?;
        if tile.width == 0 || tile.height == 0 {
            return Err(Error::general(format!("empty tile {tile:?}")));
        }
        Ok(TileCoordinate {
            width: tile.width.min((dims.size_x - x) as u32),
            height: tile.height.min((dims.size_y - y) as u32),
            ..tile
        })
    }

    /// Raw bytes `offset..offset + size` of the file.
    pub fn get_region(&mut self, size: u64, offset: u64) -> Result<Vec<u8>> {
        let total = self.dims.total_size();
        if offset.checked_add(size).is_none_or(|end| end > total) {
            return Err(Error::general(format!(
                "region of {size} bytes at {offset} exceeds buffer of {total} bytes"
            )));
        }
        self.read_at(offset, size)
    }
}

impl PixelBufferTraits for FlatPixelBuffer {
    fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn dimensions(&self) -> Dimensions {
        self.dims
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn get_tile(&mut self, tile: TileCoordinate) -> Result<PixelData> {
        let tile = self.clip(tile)?;
        let plane_offset =
            self.dims
                .plane_offset(tile.z as i64, tile.c as i64, tile.t as i64)?;
        let size_x = self.dims.size_x;
        let pixel_type = self.descriptor.pixel_type();

        if tile.x == 0 && tile.width as u64 == size_x {
            let data =
                self.read_pixels(plane_offset, tile.y as u64 * size_x, tile.pixel_count())?;
            return Ok(PixelData::new(pixel_type, data));
        }

        let mut out = PixelData::zeroed(pixel_type, tile.pixel_count());
        for row in 0..tile.height {
            let first = (tile.y + row) as u64 * size_x + tile.x as u64;
            let pixels = self.read_pixels(plane_offset, first, tile.width as u64)?;
            copy_pixels(
                &pixels,
                0,
                out.as_bytes_mut(),
                row as usize * tile.width as usize,
                tile.width as usize,
                pixel_type,
            )?;
        }
        Ok(out)
    }

    fn get_row(&mut self, y: u32, z: u32, c: u32, t: u32) -> Result<PixelData> {
        let pixel_type = self.descriptor.pixel_type();
        let row_offset = self.dims.row_offset(y as i64, z as i64, c as i64, t as i64)?;
        let data = if pixel_type.is_bit() {
            let plane_offset = self.dims.plane_offset(z as i64, c as i64, t as i64)?;
            let size_x = self.dims.size_x;
            self.read_pixels(plane_offset, y as u64 * size_x, size_x)?
        } else {
            self.read_at(row_offset, self.dims.row_size())?
        };
        Ok(PixelData::new(pixel_type, data))
    }

    fn get_col(&mut self, x: u32, z: u32, c: u32, t: u32) -> Result<PixelData> {
        self.dims.check(Axis::X, x as i64)?;
        let pixel_type = self.descriptor.pixel_type();
        let plane = self.get_plane(z, c, t)?;
        let (size_x, size_y) = (self.dims.size_x as usize, self.dims.size_y as usize);
        let mut out = PixelData::zeroed(pixel_type, size_y as u64);
        for y in 0..size_y {
            copy_pixels(
                plane.as_bytes(),
                y * size_x + x as usize,
                out.as_bytes_mut(),
                y,
                1,
                pixel_type,
            )?;
        }
        Ok(out)
    }

    fn get_plane(&mut self, z: u32, c: u32, t: u32) -> Result<PixelData> {
        let offset = self.dims.plane_offset(z as i64, c as i64, t as i64)?;
        let data = self.read_at(offset, self.dims.plane_size())?;
        Ok(PixelData::new(self.descriptor.pixel_type(), data))
    }

    fn get_stack(&mut self, c: u32, t: u32) -> Result<PixelData> {
        let offset = self.dims.stack_offset(c as i64, t as i64)?;
        let data = self.read_at(offset, self.dims.stack_size())?;
        Ok(PixelData::new(self.descriptor.pixel_type(), data))
    }

    fn get_timepoint(&mut self, t: u32) -> Result<PixelData> {
        let offset = self.dims.timepoint_offset(t as i64)?;
        let data = self.read_at(offset, self.dims.timepoint_size())?;
        Ok(PixelData::new(self.descriptor.pixel_type(), data))
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
        let plane_offset = self.dims.plane_offset(z as i64, c as i64, t as i64)?;
        let plane_pixels = self.dims.plane_pixels();
        if start_index.saturating_add(count) > plane_pixels {
            return Err(Error::IndexOutOfBounds {
                index: start_index.saturating_add(count) as usize,
                count: plane_pixels as usize,
            });
        }
        let len = self.descriptor.pixel_type().byte_len(count);
        if (out.len() as u64) < len {
            return Err(Error::BufferSize {
                expected: len,
                actual: out.len() as u64,
            });
        }
        let data = self.read_pixels(plane_offset, start_index, count)?;
        out[..data.len()].copy_from_slice(&data);
        Ok(())
    }

    fn set_row(&mut self, y: u32, z: u32, c: u32, t: u32, pixels: &[u8]) -> Result<()> {
        let row_offset = self.dims.row_offset(y as i64, z as i64, c as i64, t as i64)?;
        Self::check_len(self.dims.row_size(), pixels)?;
        if self.descriptor.pixel_type().is_bit() {
            let plane_offset = self.dims.plane_offset(z as i64, c as i64, t as i64)?;
            let size_x = self.dims.size_x;
            self.write_pixels(plane_offset, y as u64 * size_x, size_x, pixels)
        } else {
            self.write_at(row_offset, pixels)
        }
    }

    fn set_plane(&mut self, z: u32, c: u32, t: u32, pixels: &[u8]) -> Result<()> {
        let offset = self.dims.plane_offset(z as i64, c as i64, t as i64)?;
        Self::check_len(self.dims.plane_size(), pixels)?;
        self.write_at(offset, pixels)
    }

    fn set_stack(&mut self, c: u32, t: u32, pixels: &[u8]) -> Result<()> {
        let offset = self.dims.stack_offset(c as i64, t as i64)?;
        Self::check_len(self.dims.stack_size(), pixels)?;
        self.write_at(offset, pixels)
    }

    fn set_timepoint(&mut self, t: u32, pixels: &[u8]) -> Result<()> {
        let offset = self.dims.timepoint_offset(t as i64)?;
        Self::check_len(self.dims.timepoint_size(), pixels)?;
        self.write_at(offset, pixels)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take()
            && self.writable
        {
            file.sync_all()
                .map_err(|e| self.resource("sync pixels file", e))?;
        }
        Ok(())
    }
}
