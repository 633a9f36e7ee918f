use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    buffer::PyramidOptions,
    lock::{PyramidLocks, SimpleBackOff},
    metadata::Compression,
};

/// Settings of a [crate::PixelBufferService], read from camelCase JSON.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Images with planes larger than `max_plane_width * max_plane_height`
    /// pixels are stored as pyramids.
    pub max_plane_width: u32,
    pub max_plane_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub compression: Compression,
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    /// Lock files older than this are reclaimed even if their owner looks alive.
    pub stale_lock_after_ms: Option<u64>,
    pub back_off: SimpleBackOff,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_plane_width: 3192,
            max_plane_height: 3192,
            tile_width: 256,
            tile_height: 256,
            compression: Compression::default(),
            lock_timeout_ms: 30_000,
            lock_poll_interval_ms: 50,
            stale_lock_after_ms: None,
            back_off: SimpleBackOff::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_json_str(s: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            crate::Error::general(format!(
                "could not open configuration {}: {e}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn pyramid_options(&self) -> PyramidOptions {
        PyramidOptions {
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            compression: self.compression,
        }
    }

    pub fn locks(&self) -> PyramidLocks {
        PyramidLocks::new(
            Duration::from_millis(self.lock_poll_interval_ms),
            self.stale_lock_after_ms.map(Duration::from_millis),
        )
    }
}
