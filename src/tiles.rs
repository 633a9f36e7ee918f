//! Enumeration of the tiles covering a 5D buffer.
//!
//! Tiles are visited with T outermost, then C, Z, Y and X innermost, i.e.
//! raster order within each plane. Tile indices count up from 0 in that
//! order, so digests collected by index line up between two passes.

use crate::{Error, PixelBufferTraits, Result};

/// A rectangular region of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoordinate {
    pub z: u32,
    pub c: u32,
    pub t: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileCoordinate {
    pub fn new(z: u32, c: u32, t: u32, x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            z,
            c,
            t,
            x,
            y,
            width,
            height,
        }
    }

    /// The whole `size_x` by `size_y` plane at (z, c, t).
    pub fn plane(z: u32, c: u32, t: u32, size_x: u32, size_y: u32) -> Self {
        Self::new(z, c, t, 0, 0, size_x, size_y)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// The tiling of a buffer, clipped at the right and bottom plane edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
    pub size_c: u32,
    pub size_t: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl TileGrid {
    /// `sizes` in X, Y, Z, C, T order.
    pub fn new(sizes: [u32; 5], tile_width: u32, tile_height: u32) -> Result<Self> {
        if tile_width == 0 || tile_height == 0 {
            return Err(Error::general(format!(
                "invalid tile size {tile_width}x{tile_height}"
            )));
        }
        let [size_x, size_y, size_z, size_c, size_t] = sizes;
        Ok(Self {
            size_x,
            size_y,
            size_z,
            size_c,
            size_t,
            tile_width,
            tile_height,
        })
    }

    /// Grid over `buffer` at its current resolution level.
    pub fn for_buffer<B: PixelBufferTraits + ?Sized>(
        buffer: &B,
        tile_width: u32,
        tile_height: u32,
    ) -> Result<Self> {
        Self::new(
            [
                buffer.size_x(),
                buffer.size_y(),
                buffer.size_z(),
                buffer.size_c(),
                buffer.size_t(),
            ],
            tile_width,
            tile_height,
        )
    }

    pub fn tiles_x(&self) -> u32 {
        self.size_x.div_ceil(self.tile_width)
    }

    pub fn tiles_y(&self) -> u32 {
        self.size_y.div_ceil(self.tile_height)
    }

    pub fn tiles_per_plane(&self) -> u64 {
        self.tiles_x() as u64 * self.tiles_y() as u64
    }

    pub fn tile_count(&self) -> u64 {
        self.tiles_per_plane() * self.size_z as u64 * self.size_c as u64 * self.size_t as u64
    }

    /// Tile at grid position (`tile_x`, `tile_y`) of plane (z, c, t), clipped to the plane.
    pub fn tile(&self, z: u32, c: u32, t: u32, tile_x: u32, tile_y: u32) -> TileCoordinate {
        let x = tile_x * self.tile_width;
        let y = tile_y * self.tile_height;
        TileCoordinate::new(
            z,
            c,
            t,
            x,
            y,
            self.tile_width.min(self.size_x - x),
            self.tile_height.min(self.size_y - y),
        )
    }

    pub fn iter(&self) -> TileIter {
        TileIter {
            grid: *self,
            index: 0,
            count: self.tile_count(),
        }
    }
}

impl IntoIterator for &TileGrid {
    type Item = TileCoordinate;
    type IntoIter = TileIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [TileGrid] in t, c, z, y, x order.
#[derive(Debug, Clone)]
pub struct TileIter {
    grid: TileGrid,
    index: u64,
    count: u64,
}

impl Iterator for TileIter {
    type Item = TileCoordinate;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let g = &self.grid;
        let mut rest = self.index;
        let tile_x = (rest % g.tiles_x() as u64) as u32;
        rest /= g.tiles_x() as u64;
        let tile_y = (rest % g.tiles_y() as u64) as u32;
        rest /= g.tiles_y() as u64;
        let z = (rest % g.size_z as u64) as u32;
        rest /= g.size_z as u64;
        let c = (rest % g.size_c as u64) as u32;
        let t = (rest / g.size_c as u64) as u32;
        self.index += 1;
        Some(g.tile(z, c, t, tile_x, tile_y))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.count - self.index) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for TileIter {}

/// Call `callback` once for every tile of `buffer` at its current resolution level.
///
/// The callback receives the buffer back so it can read or write the tile.
/// Iteration stops at the first error. Returns the number of tiles visited.
pub fn for_each_tile<B, F>(
    buffer: &mut B,
    tile_width: u32,
    tile_height: u32,
    mut callback: F,
) -> Result<u64>
where
    B: PixelBufferTraits + ?Sized,
    F: FnMut(&mut B, TileCoordinate, u64) -> Result<()>,
{
    let grid = TileGrid::for_buffer(buffer, tile_width, tile_height)?;
    let mut visited = 0;
    for (index, tile) in grid.iter().enumerate() {
        callback(buffer, tile, index as u64)?;
        visited += 1;
    }
    Ok(visited)
}

/// SHA-256 of every tile's pixels, in tile index order.
pub fn tile_digests<B>(buffer: &mut B, tile_width: u32, tile_height: u32) -> Result<Vec<[u8; 32]>>
where
    B: PixelBufferTraits + ?Sized,
{
    let mut digests = Vec::new();
    for_each_tile(buffer, tile_width, tile_height, |buffer, tile, _| {
        digests.push(buffer.get_tile(tile)?.digest());
        Ok(())
    })?;
    Ok(digests)
}
