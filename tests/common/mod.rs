#![allow(dead_code)]

use std::time::Duration;

use pixel_store::{
    ImageDescriptor, PixelBufferService, PixelType, ServiceConfig,
    lock::SimpleBackOff,
    metadata::Compression,
};
use tempfile::TempDir;

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

pub fn scratch() -> TempDir {
    init_logging();
    tempfile::tempdir().expect("should be able to create a temporary directory")
}

pub fn descriptor(id: u64, sizes: [u32; 5], pixel_type: PixelType) -> ImageDescriptor {
    ImageDescriptor::new(id, sizes, pixel_type).expect("sizes should be valid")
}

/// Small tiles and short waits so tests exercise every level quickly.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        max_plane_width: 64,
        max_plane_height: 64,
        tile_width: 16,
        tile_height: 16,
        compression: Compression::Gzip { level: 1 },
        lock_timeout_ms: 2_000,
        lock_poll_interval_ms: 5,
        stale_lock_after_ms: None,
        back_off: SimpleBackOff {
            scaling_factor_ms: 5,
            warm_up_factor_ms: 1,
            max_retries: 3,
        },
    }
}

pub fn service(dir: &TempDir) -> PixelBufferService {
    PixelBufferService::new(dir.path(), test_config())
}

pub const SHORT: Duration = Duration::from_millis(100);

/// Distinct, deterministic uint16 content for pixel (x, y) of plane (z, c, t).
pub fn uint16_value(x: u32, y: u32, z: u32, c: u32, t: u32) -> u16 {
    (x.wrapping_mul(7) + y.wrapping_mul(13) + z * 101 + c * 211 + t * 307) as u16
}

/// Big-endian uint16 bytes of a whole plane filled by [uint16_value].
pub fn uint16_plane(size_x: u32, size_y: u32, z: u32, c: u32, t: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((size_x * size_y * 2) as usize);
    for y in 0..size_y {
        for x in 0..size_x {
            out.extend_from_slice(&uint16_value(x, y, z, c, t).to_be_bytes());
        }
    }
    out
}
