use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{info, warn};

use super::PixelBufferTraits;
use crate::{
    Axis, Dimensions, Error, ImageDescriptor, PixelData, Result, TileCoordinate,
    lock::LockToken,
    metadata::{Compression, LevelDimensions, PyramidMetadata},
    shard::{ensure_parent_dirs, pyramid_staging_path},
    storage::PyramidStore,
};

/// Tiling and compression of newly built pyramids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidOptions {
    pub tile_width: u32,
    pub tile_height: u32,
    pub compression: Compression,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        Self {
            tile_width: 256,
            tile_height: 256,
            compression: Compression::default(),
        }
    }
}

#[derive(Debug)]
struct Build {
    staging: PathBuf,
    _lock: LockToken,
}

/// Tiled, multi-resolution pixels.
///
/// Resolution level 0 is the original resolution and each following level
/// is smaller. Buffers open at level 0.
///
/// A buffer returned by [PyramidPixelBuffer::create] is under construction:
/// it accepts level 0 tile writes into a staging directory while holding the
/// build lock, and [PixelBufferTraits::close] generates the lower levels,
/// moves the pyramid into place and releases the lock.
#[derive(Debug)]
pub struct PyramidPixelBuffer {
    descriptor: ImageDescriptor,
    path: PathBuf,
    levels: Vec<LevelDimensions>,
    tile_size: (u32, u32),
    level: usize,
    store: Option<PyramidStore>,
    build: Option<Build>,
}

impl PyramidPixelBuffer {
    /// Open a complete pyramid read-only.
    pub fn open(path: impl Into<PathBuf>, descriptor: ImageDescriptor) -> Result<Self> {
        let path = path.into();
        let store = PyramidStore::open(&path, descriptor.id())?;
        let metadata = store.metadata();
        if !metadata.matches(&descriptor) {
            return Err(Error::resource(
                descriptor.id(),
                "open pyramid",
                &path,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "pyramid of {:?} {} does not match pixels of {:?} {}",
                        metadata.dimensions,
                        metadata.data_type,
                        descriptor.sizes(),
                        descriptor.pixel_type()
                    ),
                ),
            ));
        }
        info!(
            "opened pyramid for pixels {} with {} levels",
            descriptor.id(),
            metadata.resolution_levels.len()
        );
        Ok(Self {
            levels: metadata.resolution_levels.clone(),
            tile_size: metadata.tile_size(),
            descriptor,
            path,
            level: 0,
            store: Some(store),
            build: None,
        })
    }

    /// Start building a new pyramid that will appear at `path` once closed.
    ///
    /// Holding `lock` for this image is what makes the build exclusive.
    pub fn create(
        path: impl Into<PathBuf>,
        descriptor: ImageDescriptor,
        options: PyramidOptions,
        lock: LockToken,
    ) -> Result<Self> {
        let path = path.into();
        let id = descriptor.id();
        if lock.image_id() != id {
            return Err(Error::general(format!(
                "lock for pixels {} cannot build pyramid of pixels {id}",
                lock.image_id()
            )));
        }
        let metadata = PyramidMetadata::new(
            &descriptor,
            (options.tile_width, options.tile_height),
            options.compression,
        )?;

        let staging = pyramid_staging_path(&path);
        match fs::remove_dir_all(&staging) {
            Ok(()) => warn!(
                "removed abandoned pyramid build for pixels {id} at {}",
                staging.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::resource(id, "remove abandoned pyramid", &staging, e)),
        }
        ensure_parent_dirs(&staging)
            .map_err(|e| Error::resource(id, "create pyramid directory", &staging, e))?;

        let levels = metadata.resolution_levels.clone();
        let store = PyramidStore::create(&staging, metadata)?;
        info!(
            "building pyramid for pixels {id} ({} levels of {}x{} tiles)",
            levels.len(),
            options.tile_width,
            options.tile_height
        );
        Ok(Self {
            descriptor,
            path,
            levels,
            tile_size: (options.tile_width, options.tile_height),
            level: 0,
            store: Some(store),
            build: Some(Build {
                staging,
                _lock: lock,
            }),
        })
    }

    /// Whether the pyramid is still under construction.
    pub fn is_building(&self) -> bool {
        self.build.is_some()
    }

    /// Native tile width and height.
    pub fn tile_size(&self) -> (u32, u32) {
        self.tile_size
    }

    fn store(&mut self) -> Result<&mut PyramidStore> {
        let store = match self.store.take() {
            Some(store) => store,
            None => PyramidStore::open(&self.path, self.descriptor.id())?,
        };
        Ok(self.store.insert(store))
    }

    fn level_dims(&self) -> LevelDimensions {
        self.levels[self.level]
    }

    fn clip(&self, tile: TileCoordinate) -> Result<TileCoordinate> {
        let dims = self.dimensions();
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

    fn finish_build(&mut self) -> Result<()> {
        let Some(build) = self.build.take() else {
            return Ok(());
        };
        let id = self.descriptor.id();
        let result = self.store().and_then(|store| store.build_levels());
        self.store = None;
        let result = result.and_then(|()| {
            fs::rename(&build.staging, &self.path)
                .map_err(|e| Error::resource(id, "move pyramid into place", &self.path, e))
        });
        match &result {
            Ok(()) => info!("finished pyramid for pixels {id} at {}", self.path.display()),
            Err(e) => {
                warn!("pyramid build for pixels {id} failed: {e}");
                if let Err(e) = fs::remove_dir_all(&build.staging) {
                    warn!(
                        "could not remove failed pyramid build {}: {e}",
                        build.staging.display()
                    );
                }
            }
        }
        // the lock in `build` is released here, after the pyramid is in place
        drop(build);
        result
    }
}

impl PixelBufferTraits for PyramidPixelBuffer {
    fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn size_x(&self) -> u32 {
        self.level_dims().size_x
    }

    fn size_y(&self) -> u32 {
        self.level_dims().size_y
    }

    fn dimensions(&self) -> Dimensions {
        let dims = self.level_dims();
        self.descriptor
            .dimensions()
            .with_plane(dims.size_x, dims.size_y)
    }

    fn is_writable(&self) -> bool {
        self.is_building()
    }

    fn resolution_levels(&self) -> usize {
        self.levels.len()
    }

    fn resolution_level(&self) -> usize {
        self.level
    }

    fn set_resolution_level(&mut self, level: usize) -> Result<()> {
        if level >= self.levels.len() {
            return Err(Error::InvalidResolutionLevel {
                level,
                levels: self.levels.len(),
            });
        }
        self.level = level;
        Ok(())
    }

    fn resolution_descriptions(&self) -> Vec<(u32, u32)> {
        self.levels.iter().map(|l| (l.size_x, l.size_y)).collect()
    }

    fn get_tile(&mut self, tile: TileCoordinate) -> Result<PixelData> {
        let tile = self.clip(tile)?;
        let level = self.level;
        let pixel_type = self.descriptor.pixel_type();
        let data = self.store()?.read_region(level, tile)?;
        Ok(PixelData::new(pixel_type, data))
    }

    fn set_tile(&mut self, tile: TileCoordinate, pixels: &[u8]) -> Result<()> {
        if !self.is_building() {
            return Err(Error::ReadOnly {
                image_id: self.descriptor.id(),
                path: self.path.clone(),
            });
        }
        if self.level != 0 {
            return Err(Error::unsupported(format!(
                "tile writes at resolution level {}",
                self.level
            )));
        }
        let tile = self.clip(tile)?;
        self.store()?.write_tile(0, tile, pixels)
    }

    fn close(&mut self) -> Result<()> {
        let result = self.finish_build();
        self.store = None;
        result
    }
}

impl Drop for PyramidPixelBuffer {
    fn drop(&mut self) {
        if let Some(build) = self.build.take() {
            warn!(
                "pyramid build for pixels {} abandoned before close",
                self.descriptor.id()
            );
            self.store = None;
            if let Err(e) = fs::remove_dir_all(&build.staging) {
                warn!(
                    "could not remove abandoned pyramid build {}: {e}",
                    build.staging.display()
                );
            }
        }
    }
}
