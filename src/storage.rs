//! Zarr V3 pyramid container on the local filesystem.
//!
//! ```text
//! <id>.pyramid/
//!   zarr.json        root group; attributes hold the PyramidMetadata
//!   <level>/         one array per resolution level, shape [T, C, Z, Y, X]
//!     zarr.json
//!     c/<t>/<c>/<z>/<tileY>/<tileX>
//! ```
//!
//! Chunks are single tiles, so edge chunks are clipped to the level extent.
//! Chunks that were never written read back as zeros.

use std::{
    borrow::Cow,
    fmt::Display,
    fs, io,
    num::NonZeroU64,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};
use zarrs::{
    array::{
        Array, ArrayMetadataV3, FillValueMetadata,
        chunk_grid::{RegularBoundedChunkGrid, RegularBoundedChunkGridConfiguration},
        data_type,
    },
    filesystem::FilesystemStore,
    group::{Group, GroupMetadataV3},
    metadata::v3::MetadataV3,
    plugin::{ExtensionAliasesV3, ExtensionName},
};

use crate::{
    Error, PixelData, PixelType, Result, TileCoordinate, TileGrid,
    metadata::{Compression, LevelDimensions, PyramidMetadata},
    pixel_data::get_pixel_value,
};

/// Runs `$body` with `$t` naming the element type of a non-bit pixel type.
macro_rules! with_element_type {
    ($pixel_type:expr, |$t:ident| $body:expr) => {
        match $pixel_type {
            PixelType::Int8 => {
                type $t = i8;
                $body
            }
            PixelType::Uint8 => {
                type $t = u8;
                $body
            }
            PixelType::Int16 => {
                type $t = i16;
                $body
            }
            PixelType::Uint16 => {
                type $t = u16;
                $body
            }
            PixelType::Int32 => {
                type $t = i32;
                $body
            }
            PixelType::Uint32 => {
                type $t = u32;
                $body
            }
            PixelType::Float => {
                type $t = f32;
                $body
            }
            PixelType::Double => {
                type $t = f64;
                $body
            }
            PixelType::Bit => Err(bit_unsupported()),
        }
    };
}

fn bit_unsupported() -> Error {
    Error::unsupported("pyramids of bit pixel data are not supported")
}

/// Store path of the array holding resolution `level`.
pub fn level_path(level: usize) -> String {
    format!("/{level}")
}

fn convert_data_type(pixel_type: PixelType) -> Result<MetadataV3> {
    let data_type = match pixel_type {
        PixelType::Int8 => data_type::int8(),
        PixelType::Uint8 => data_type::uint8(),
        PixelType::Int16 => data_type::int16(),
        PixelType::Uint16 => data_type::uint16(),
        PixelType::Int32 => data_type::int32(),
        PixelType::Uint32 => data_type::uint32(),
        PixelType::Float => data_type::float32(),
        PixelType::Double => data_type::float64(),
        PixelType::Bit => return Err(bit_unsupported()),
    };
    let name = data_type
        .name_v3()
        .map_or_else(String::new, Cow::into_owned);
    let configuration = data_type.configuration_v3();
    let out = if configuration.is_empty() {
        MetadataV3::new(name)
    } else {
        MetadataV3::new_with_configuration(name, configuration)
    };
    Ok(out)
}

/// One chunk per tile; chunk shape is in T, C, Z, Y, X order.
fn convert_chunk_grid(tile_width: u32, tile_height: u32) -> Result<MetadataV3> {
    let chunk_shape = [1, 1, 1, tile_height as u64, tile_width as u64]
        .into_iter()
        .map(|n| NonZeroU64::new(n).ok_or_else(|| Error::general("zero tile size")))
        .collect::<Result<Vec<_>>>()?;
    let out = MetadataV3::new_with_serializable_configuration(
        RegularBoundedChunkGrid::aliases_v3()
            .default_name
            .clone()
            .to_string(),
        &RegularBoundedChunkGridConfiguration { chunk_shape },
    )?;
    Ok(out)
}

/// Big-endian bytes, then the configured compressor.
fn convert_codecs(compression: Compression) -> Result<Vec<MetadataV3>> {
    let mut codecs = vec![MetadataV3::new_with_serializable_configuration(
        "bytes".to_string(),
        &serde_json::json!({ "endian": "big" }),
    )?];
    match compression {
        Compression::Raw => {}
        Compression::Gzip { level } => {
            if level > 9 {
                return Err(Error::general(format!(
                    "invalid gzip compression level {level}"
                )));
            }
            codecs.push(MetadataV3::new_with_serializable_configuration(
                "gzip".to_string(),
                &serde_json::json!({ "level": level }),
            )?);
        }
    }
    Ok(codecs)
}

fn convert_chunk_key_encoding() -> Result<MetadataV3> {
    let out = MetadataV3::new_with_serializable_configuration(
        "default".to_string(),
        &serde_json::json!({ "separator": "/" }),
    )?;
    Ok(out)
}

/// Zarr metadata of the array holding resolution `level`.
fn level_metadata(metadata: &PyramidMetadata, level: usize) -> Result<ArrayMetadataV3> {
    let dims = metadata
        .resolution_levels
        .get(level)
        .ok_or(Error::InvalidResolutionLevel {
            level,
            levels: metadata.resolution_levels.len(),
        })?;
    let [_, _, size_z, size_c, size_t] = metadata.dimensions;
    let shape = vec![
        size_t as u64,
        size_c as u64,
        size_z as u64,
        dims.size_y as u64,
        dims.size_x as u64,
    ];
    let (tile_width, tile_height) = metadata.tile_size();
    let out = ArrayMetadataV3::new(
        shape,
        convert_chunk_grid(tile_width, tile_height)?,
        convert_data_type(metadata.data_type)?,
        FillValueMetadata::Number(serde_json::Number::from(0)),
        convert_codecs(metadata.compression)?,
    )
    .with_chunk_key_encoding(convert_chunk_key_encoding()?);
    Ok(out)
}

fn invalid_data(image_id: u64, operation: &'static str, root: &Path, e: impl Display) -> Error {
    Error::resource(
        image_id,
        operation,
        root,
        io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
    )
}

pub struct PyramidStore {
    root: PathBuf,
    metadata: PyramidMetadata,
    arrays: Vec<Array<FilesystemStore>>,
    writable: bool,
}

impl std::fmt::Debug for PyramidStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidStore")
            .field("root", &self.root)
            .field("levels", &self.arrays.len())
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl PyramidStore {
    /// Create an empty, writable container at `root`.
    pub fn create(root: impl Into<PathBuf>, metadata: PyramidMetadata) -> Result<Self> {
        let root = root.into();
        let image_id = metadata.image_id;
        let array_metadata = (0..metadata.resolution_levels.len())
            .map(|level| level_metadata(&metadata, level))
            .collect::<Result<Vec<_>>>()?;
        fs::create_dir_all(&root)
            .map_err(|e| Error::resource(image_id, "create pyramid directory", &root, e))?;
        let store = Arc::new(FilesystemStore::new(&root).map_err(Error::wrap)?);

        let serde_json::Value::Object(attributes) = serde_json::to_value(&metadata)? else {
            return Err(Error::general("pyramid metadata is not a JSON object"));
        };
        let group = Group::new_with_metadata(
            store.clone(),
            "/",
            GroupMetadataV3::default().with_attributes(attributes).into(),
        )
        .map_err(Error::wrap)?;
        group.store_metadata().map_err(Error::wrap)?;

        let arrays = array_metadata
            .into_iter()
            .enumerate()
            .map(|(level, meta)| {
                let array = Array::new_with_metadata(store.clone(), &level_path(level), meta.into())
                    .map_err(Error::wrap)?;
                array.store_metadata().map_err(Error::wrap)?;
                Ok(array)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root,
            metadata,
            arrays,
            writable: true,
        })
    }

    /// Open an existing container read-only.
    ///
    /// `image_id` is only used for error context.
    pub fn open(root: impl Into<PathBuf>, image_id: u64) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::resource(
                image_id,
                "open pyramid",
                &root,
                io::Error::new(io::ErrorKind::NotFound, "no pyramid directory"),
            ));
        }
        let store = Arc::new(FilesystemStore::new(&root).map_err(Error::wrap)?);
        let group = Group::open(store.clone(), "/")
            .map_err(|e| invalid_data(image_id, "open pyramid group", &root, e))?;
        let metadata: PyramidMetadata =
            serde_json::from_value(serde_json::Value::Object(group.attributes().clone()))
                .map_err(|e| invalid_data(image_id, "parse pyramid attributes", &root, e))?;
        if metadata.resolution_levels.is_empty() {
            return Err(invalid_data(
                image_id,
                "parse pyramid attributes",
                &root,
                "no resolution levels",
            ));
        }

        let mut arrays = Vec::with_capacity(metadata.resolution_levels.len());
        for (level, dims) in metadata.resolution_levels.iter().enumerate() {
            let array = Array::open(store.clone(), &level_path(level))
                .map_err(|e| invalid_data(image_id, "open resolution level", &root, e))?;
            let plane = [dims.size_y as u64, dims.size_x as u64];
            if array.shape().get(3..) != Some(&plane[..]) {
                return Err(invalid_data(
                    image_id,
                    "open resolution level",
                    &root,
                    format!("level {level} has shape {:?}", array.shape()),
                ));
            }
            arrays.push(array);
        }
        Ok(Self {
            root,
            metadata,
            arrays,
            writable: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &PyramidMetadata {
        &self.metadata
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn levels(&self) -> &[LevelDimensions] {
        &self.metadata.resolution_levels
    }

    pub fn level(&self, level: usize) -> Result<LevelDimensions> {
        self.levels()
            .get(level)
            .copied()
            .ok_or(Error::InvalidResolutionLevel {
                level,
                levels: self.levels().len(),
            })
    }

    /// Tiling of resolution `level`.
    pub fn grid(&self, level: usize) -> Result<TileGrid> {
        let dims = self.level(level)?;
        let [_, _, size_z, size_c, size_t] = self.metadata.dimensions;
        let (tile_width, tile_height) = self.metadata.tile_size();
        TileGrid::new(
            [dims.size_x, dims.size_y, size_z, size_c, size_t],
            tile_width,
            tile_height,
        )
    }

    fn array(&self, level: usize) -> Result<&Array<FilesystemStore>> {
        self.arrays.get(level).ok_or(Error::InvalidResolutionLevel {
            level,
            levels: self.arrays.len(),
        })
    }

    fn bytes_per_pixel(&self) -> Result<usize> {
        self.metadata
            .data_type
            .byte_width()
            .ok_or_else(bit_unsupported)
    }

    /// Chunk indices of a grid tile, most significant first.
    fn chunk_indices(&self, tile: &TileCoordinate) -> [u64; 5] {
        let (tile_width, tile_height) = self.metadata.tile_size();
        [
            tile.t as u64,
            tile.c as u64,
            tile.z as u64,
            (tile.y / tile_height) as u64,
            (tile.x / tile_width) as u64,
        ]
    }

    /// Big-endian pixels of one grid tile.
    fn read_block(&self, level: usize, tile: &TileCoordinate) -> Result<Vec<u8>> {
        let array = self.array(level)?;
        let indices = self.chunk_indices(tile);
        let image_id = self.metadata.image_id;
        with_element_type!(self.metadata.data_type, |T| {
            let elements: Vec<T> = array
                .retrieve_chunk(&indices)
                .map_err(|e| invalid_data(image_id, "read tile", &self.root, e))?;
            Ok(elements.iter().flat_map(|v| v.to_be_bytes()).collect())
        })
    }

    fn check_region(&self, level: usize, region: &TileCoordinate) -> Result<LevelDimensions> {
        let dims = self.level(level)?;
        let [_, _, size_z, size_c, size_t] = self.metadata.dimensions;
        let inside = region.width > 0
            && region.height > 0
            && region.x as u64 + region.width as u64 <= dims.size_x as u64
            && region.y as u64 + region.height as u64 <= dims.size_y as u64
            && region.z < size_z
            && region.c < size_c
            && region.t < size_t;
        if !inside {
            return Err(Error::general(format!(
                "region {region:?} outside of level {level} ({}x{})",
                dims.size_x, dims.size_y
            )));
        }
        Ok(dims)
    }

    /// Pixels of an arbitrary region of resolution `level`, assembled from tiles.
    pub fn read_region(&self, level: usize, region: TileCoordinate) -> Result<Vec<u8>> {
        self.check_region(level, &region)?;
        let bpp = self.bytes_per_pixel()?;
        let grid = self.grid(level)?;
        let TileCoordinate {
            z,
            c,
            t,
            x,
            y,
            width,
            height,
        } = region;
        let mut out = vec![0u8; region.pixel_count() as usize * bpp];

        for tile_y in y / grid.tile_height..=(y + height - 1) / grid.tile_height {
            for tile_x in x / grid.tile_width..=(x + width - 1) / grid.tile_width {
                let tile = grid.tile(z, c, t, tile_x, tile_y);
                let block = self.read_block(level, &tile)?;
                let x0 = x.max(tile.x);
                let x1 = (x + width).min(tile.x + tile.width);
                let y0 = y.max(tile.y);
                let y1 = (y + height).min(tile.y + tile.height);
                let len = (x1 - x0) as usize * bpp;
                for row in y0..y1 {
                    let src = ((row - tile.y) as usize * tile.width as usize
                        + (x0 - tile.x) as usize)
                        * bpp;
                    let dst =
                        ((row - y) as usize * width as usize + (x0 - x) as usize) * bpp;
                    out[dst..dst + len].copy_from_slice(&block[src..src + len]);
                }
            }
        }
        Ok(out)
    }

    /// Store one whole grid tile of resolution `level`.
    pub fn write_tile(&mut self, level: usize, tile: TileCoordinate, pixels: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly {
                image_id: self.metadata.image_id,
                path: self.root.clone(),
            });
        }
        self.check_region(level, &tile)?;
        let grid = self.grid(level)?;
        let (tile_width, tile_height) = self.metadata.tile_size();
        if tile.x % tile_width != 0 || tile.y % tile_height != 0 {
            return Err(Error::unsupported(format!(
                "tile at ({}, {}) not aligned to {tile_width}x{tile_height} grid",
                tile.x, tile.y
            )));
        }
        let expected = grid.tile(
            tile.z,
            tile.c,
            tile.t,
            tile.x / tile_width,
            tile.y / tile_height,
        );
        if expected != tile {
            return Err(Error::unsupported(format!(
                "tile {tile:?} does not cover grid tile {expected:?}"
            )));
        }
        let bpp = self.bytes_per_pixel()?;
        let len = tile.pixel_count() * bpp as u64;
        if pixels.len() as u64 != len {
            return Err(Error::BufferSize {
                expected: len,
                actual: pixels.len() as u64,
            });
        }

        let array = self.array(level)?;
        let indices = self.chunk_indices(&tile);
        with_element_type!(self.metadata.data_type, |T| {
            let elements: Vec<T> = pixels
                .chunks_exact(bpp)
                .map(|b| {
                    let mut be = [0u8; size_of::<T>()];
                    be.copy_from_slice(b);
                    T::from_be_bytes(be)
                })
                .collect();
            array.store_chunk(&indices, elements).map_err(Error::wrap)
        })
    }

    /// Generate every level below 0 from the one above it by 2x2 box averaging.
    ///
    /// Works one output tile at a time. Integer types round to nearest.
    pub fn build_levels(&mut self) -> Result<()> {
        let pixel_type = self.metadata.data_type;
        for level in 1..self.levels().len() {
            let above = self.level(level - 1)?;
            let grid = self.grid(level)?;
            debug!(
                "generating level {level} ({}x{}) of pixels {}",
                grid.size_x, grid.size_y, self.metadata.image_id
            );
            for tile in grid.iter() {
                let src_x = tile.x * 2;
                let src_y = tile.y * 2;
                let src_width = (tile.width * 2).min(above.size_x - src_x);
                let src_height = (tile.height * 2).min(above.size_y - src_y);
                let src = self.read_region(
                    level - 1,
                    TileCoordinate::new(
                        tile.z, tile.c, tile.t, src_x, src_y, src_width, src_height,
                    ),
                )?;

                let mut dst = PixelData::zeroed(pixel_type, tile.pixel_count());
                for dy in 0..tile.height {
                    for dx in 0..tile.width {
                        let mut sum = 0.0;
                        let mut n = 0;
                        for (ox, oy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                            let (sx, sy) = (dx * 2 + ox, dy * 2 + oy);
                            if sx < src_width && sy < src_height {
                                let index = sy as usize * src_width as usize + sx as usize;
                                sum += get_pixel_value(&src, index, pixel_type)?;
                                n += 1;
                            }
                        }
                        let mut value = sum / n as f64;
                        if !pixel_type.is_float() {
                            value = value.round();
                        }
                        let index = dy as usize * tile.width as usize + dx as usize;
                        dst.set_pixel_value(index, value)?;
                    }
                }
                self.write_tile(level, tile, dst.as_bytes())?;
            }
        }
        info!(
            "generated {} resolution levels for pixels {}",
            self.levels().len(),
            self.metadata.image_id
        );
        Ok(())
    }
}
