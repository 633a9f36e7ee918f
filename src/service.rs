//! Selection of the storage format backing an image's pixels.
//!
//! [PixelBufferService::get_pixel_buffer] resolves a request as follows:
//!
//! 1. an existing pyramid is always reused;
//! 2. an existing flat file is opened, unless policy requires a pyramid, in
//!    which case the missing pyramid is signalled and the request fails or,
//!    if a listener asks for it, is retried after backing off;
//! 3. with nothing on disk, the original-file provider may supply a buffer;
//! 4. otherwise a new pyramid (under the build lock) or a new flat file is created.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};

use crate::{
    CleanupFailure, Error, FlatPixelBuffer, ImageDescriptor, PixelBuffer, PixelBufferTraits,
    PyramidPixelBuffer, Result, ServiceConfig,
    lock::PyramidLocks,
    shard::PathLayout,
    signal::{MissingPyramidListener, MissingPyramidSignal, SignalBus},
    tiles::{for_each_tile, tile_digests},
};

/// Decides whether an image must be stored as a pyramid.
pub trait PyramidPolicy: Send + Sync {
    fn require_pyramid(&self, descriptor: &ImageDescriptor) -> bool;
}

impl<F> PyramidPolicy for F
where
    F: Fn(&ImageDescriptor) -> bool + Send + Sync,
{
    fn require_pyramid(&self, descriptor: &ImageDescriptor) -> bool {
        self(descriptor)
    }
}

/// Require a pyramid once a plane holds more pixels than the maximum plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneSizePolicy {
    pub max_plane_width: u32,
    pub max_plane_height: u32,
}

impl PyramidPolicy for PlaneSizePolicy {
    fn require_pyramid(&self, descriptor: &ImageDescriptor) -> bool {
        descriptor.plane_pixels() > self.max_plane_width as u64 * self.max_plane_height as u64
    }
}

/// Source of buffers reading pixels straight from an image's original file.
pub trait OriginalFileMetadataProvider {
    /// A ready-made buffer, or `None` if the original file cannot serve these pixels.
    fn pixel_buffer(&self, descriptor: &ImageDescriptor) -> Result<Option<PixelBuffer>>;
}

/// Provider for images without readable original files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOriginalFiles;

impl OriginalFileMetadataProvider for NoOriginalFiles {
    fn pixel_buffer(&self, _descriptor: &ImageDescriptor) -> Result<Option<PixelBuffer>> {
        Ok(None)
    }
}

/// Hands out pixel buffers for images under one storage root.
pub struct PixelBufferService {
    layout: PathLayout,
    config: ServiceConfig,
    policy: Box<dyn PyramidPolicy>,
    signals: SignalBus,
    locks: PyramidLocks,
}

impl std::fmt::Debug for PixelBufferService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBufferService")
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("signals", &self.signals)
            .finish_non_exhaustive()
    }
}

impl PixelBufferService {
    /// Service over `root` using the plane size policy from `config`.
    pub fn new(root: impl Into<PathBuf>, config: ServiceConfig) -> Self {
        Self {
            layout: PathLayout::new(root),
            policy: Box::new(PlaneSizePolicy {
                max_plane_width: config.max_plane_width,
                max_plane_height: config.max_plane_height,
            }),
            signals: SignalBus::default(),
            locks: config.locks(),
            config,
        }
    }

    pub fn with_policy(mut self, policy: impl PyramidPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn MissingPyramidListener>) -> Self {
        self.signals.subscribe(listener);
        self
    }

    /// Share build locks with other services in this process.
    pub fn with_locks(mut self, locks: PyramidLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn locks(&self) -> &PyramidLocks {
        &self.locks
    }

    pub fn pixels_path(&self, id: u64) -> PathBuf {
        self.layout.pixels_path(id)
    }

    pub fn pyramid_path(&self, id: u64) -> PathBuf {
        self.layout.pyramid_path(id)
    }

    pub fn files_path(&self, id: u64) -> PathBuf {
        self.layout.files_path(id)
    }

    /// Whether a complete pyramid exists. Pyramids under construction do not count.
    pub fn pyramid_exists(&self, id: u64) -> bool {
        self.pyramid_path(id).is_dir()
    }

    pub fn requires_pyramid(&self, descriptor: &ImageDescriptor) -> bool {
        self.policy.require_pyramid(descriptor)
    }

    /// Resolve the buffer for `descriptor`, creating storage if none exists.
    ///
    /// Existing flat files are opened read-write only if `allow_modification`.
    pub fn get_pixel_buffer(
        &self,
        descriptor: &ImageDescriptor,
        provider: &dyn OriginalFileMetadataProvider,
        allow_modification: bool,
    ) -> Result<PixelBuffer> {
        let id = descriptor.id();
        let pyramid_path = self.pyramid_path(id);
        if pyramid_path.is_dir() {
            debug!("reusing pyramid for pixels {id}");
            return Ok(PyramidPixelBuffer::open(pyramid_path, descriptor.clone())?.into());
        }

        let require_pyramid = self.requires_pyramid(descriptor);
        let pixels_path = self.pixels_path(id);
        if pixels_path.is_file() {
            if require_pyramid {
                return self.missing_pyramid(descriptor, pyramid_path);
            }
            return Ok(
                FlatPixelBuffer::open(pixels_path, descriptor.clone(), allow_modification)?.into(),
            );
        }

        if let Some(buffer) = provider.pixel_buffer(descriptor)? {
            info!("pixels {id} served from original file");
            return Ok(buffer);
        }

        if require_pyramid {
            self.create_pyramid(descriptor)
        } else {
            self.create_flat(descriptor, &pixels_path, allow_modification)
        }
    }

    fn create_flat(
        &self,
        descriptor: &ImageDescriptor,
        path: &Path,
        allow_modification: bool,
    ) -> Result<PixelBuffer> {
        match FlatPixelBuffer::create(path, descriptor.clone()) {
            Ok(buffer) if allow_modification => Ok(buffer.into()),
            Ok(mut buffer) => {
                buffer.close()?;
                Ok(FlatPixelBuffer::open(path, descriptor.clone(), false)?.into())
            }
            // another writer created it first
            Err(Error::Resource { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                Ok(FlatPixelBuffer::open(path, descriptor.clone(), false)?.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Start building a pyramid, or open the one another writer finished while we waited.
    fn create_pyramid(&self, descriptor: &ImageDescriptor) -> Result<PixelBuffer> {
        let id = descriptor.id();
        let path = self.pyramid_path(id);
        let lock = self.locks.acquire(
            id,
            &self.layout.pyramid_lock_path(id),
            self.config.lock_timeout(),
        )?;
        if path.is_dir() {
            drop(lock);
            debug!("pyramid for pixels {id} was built while waiting for the lock");
            return Ok(PyramidPixelBuffer::open(path, descriptor.clone())?.into());
        }
        Ok(
            PyramidPixelBuffer::create(path, descriptor.clone(), self.config.pyramid_options(), lock)?
                .into(),
        )
    }

    fn missing_pyramid(&self, descriptor: &ImageDescriptor, path: PathBuf) -> Result<PixelBuffer> {
        let id = descriptor.id();
        let back_off = self.config.back_off;
        let mut attempt = 0;
        loop {
            warn!("pyramid for pixels {id} missing at {}", path.display());
            let signal = MissingPyramidSignal::new(id, &path);
            if !self.signals.publish(&signal) || attempt >= back_off.max_retries {
                return Err(Error::MissingPyramid { image_id: id, path });
            }
            attempt += 1;
            let waited = back_off.back_off(attempt);
            info!("retry {attempt} for pyramid of pixels {id} after {waited:?}");
            if path.is_dir() {
                return Ok(PyramidPixelBuffer::open(path, descriptor.clone())?.into());
            }
        }
    }

    /// Convert the flat buffer of `descriptor` into a pyramid, one tile at a time.
    ///
    /// Returns the existing pyramid if there already is one.
    pub fn make_pyramid(&self, descriptor: &ImageDescriptor) -> Result<PixelBuffer> {
        let id = descriptor.id();
        let path = self.pyramid_path(id);
        if path.is_dir() {
            return Ok(PyramidPixelBuffer::open(path, descriptor.clone())?.into());
        }
        let pixels_path = self.pixels_path(id);
        let mut source = FlatPixelBuffer::open(&pixels_path, descriptor.clone(), false)?;

        let lock = self.locks.acquire(
            id,
            &self.layout.pyramid_lock_path(id),
            self.config.lock_timeout(),
        )?;
        if path.is_dir() {
            drop(lock);
            return Ok(PyramidPixelBuffer::open(path, descriptor.clone())?.into());
        }
        let mut pyramid =
            PyramidPixelBuffer::create(&path, descriptor.clone(), self.config.pyramid_options(), lock)?;
        let (tile_width, tile_height) = pyramid.tile_size();
        let tiles = for_each_tile(&mut source, tile_width, tile_height, |source, tile, _| {
            let pixels = source.get_tile(tile)?;
            pyramid.set_tile(tile, pixels.as_bytes())
        })?;
        pyramid.close()?;
        source.close()?;
        info!("converted pixels {id} into a pyramid of {tiles} base tiles");
        Ok(PyramidPixelBuffer::open(path, descriptor.clone())?.into())
    }

    /// Whether level 0 of the pyramid holds exactly the pixels of the flat buffer.
    pub fn verify_pyramid(&self, descriptor: &ImageDescriptor) -> Result<bool> {
        let id = descriptor.id();
        let mut pyramid = PyramidPixelBuffer::open(self.pyramid_path(id), descriptor.clone())?;
        let mut flat = FlatPixelBuffer::open(self.pixels_path(id), descriptor.clone(), false)?;
        let (tile_width, tile_height) = pyramid.tile_size();
        let expected = tile_digests(&mut flat, tile_width, tile_height)?;
        let actual = tile_digests(&mut pyramid, tile_width, tile_height)?;
        let mismatched = expected
            .iter()
            .zip(&actual)
            .filter(|(a, b)| a != b)
            .count();
        if mismatched > 0 {
            warn!("{mismatched} of {} pyramid tiles of pixels {id} differ", expected.len());
        }
        Ok(mismatched == 0 && expected.len() == actual.len())
    }

    /// Delete every stored form of `id`.
    ///
    /// Files that are already gone are skipped; the rest are attempted even
    /// after a failure and reported together.
    pub fn remove_pixels(&self, id: u64) -> Result<()> {
        let mut failure = CleanupFailure::default();
        let candidates = [
            self.layout.pixels_path(id),
            self.layout.pyramid_path(id),
            self.layout.pyramid_staging_path(id),
            self.layout.pyramid_lock_path(id),
        ];
        for path in candidates {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("could not remove {}: {e}", path.display());
                    failure.push(path, e);
                }
            }
        }
        if failure.is_empty() {
            Ok(())
        } else {
            Err(failure.into())
        }
    }
}
