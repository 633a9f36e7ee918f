pub mod buffer;
pub mod config;
pub mod dimensions;
mod error;
pub mod lock;
pub mod metadata;
pub mod pixel_data;
pub mod service;
pub mod shard;
pub mod signal;
pub mod storage;
pub mod tiles;

pub use buffer::{FlatPixelBuffer, PixelBuffer, PixelBufferTraits, PyramidPixelBuffer};
pub use config::ServiceConfig;
pub use dimensions::Dimensions;
pub use error::{Axis, CleanupFailure, Error, Result};
pub use metadata::{ImageDescriptor, PixelType};
pub use pixel_data::PixelData;
pub use service::PixelBufferService;
pub use tiles::{TileCoordinate, TileGrid, for_each_tile};
