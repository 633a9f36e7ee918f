use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::dimensions::Dimensions;

/// Version written into the `pyramid` attribute of every container's root group.
pub const PYRAMID_FORMAT_VERSION: &str = "1.0.0";

/// Supported pixel encodings.
///
/// Multi-byte values are stored big-endian.
/// `Bit` is packed eight pixels to a byte, most significant bit first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    Bit,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float,
    Double,
}

impl PixelType {
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            PixelType::Bit => 1,
            PixelType::Int8 | PixelType::Uint8 => 8,
            PixelType::Int16 | PixelType::Uint16 => 16,
            PixelType::Int32 | PixelType::Uint32 | PixelType::Float => 32,
            PixelType::Double => 64,
        }
    }

    /// Bytes per pixel; `0.125` for [PixelType::Bit].
    pub fn bytes_per_pixel(&self) -> f64 {
        self.bits_per_pixel() as f64 / 8.0
    }

    /// Whole bytes per pixel, or `None` for packed bit data.
    pub fn byte_width(&self) -> Option<usize> {
        match self {
            PixelType::Bit => None,
            t => Some(t.bits_per_pixel() as usize / 8),
        }
    }

    /// Number of bytes occupied by `pixel_count` packed pixels.
    pub fn byte_len(&self, pixel_count: u64) -> u64 {
        (pixel_count * self.bits_per_pixel() as u64).div_ceil(8)
    }

    pub fn is_bit(&self) -> bool {
        matches!(self, PixelType::Bit)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            PixelType::Int8
                | PixelType::Int16
                | PixelType::Int32
                | PixelType::Float
                | PixelType::Double
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, PixelType::Float | PixelType::Double)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelType::Bit => "bit",
            PixelType::Int8 => "int8",
            PixelType::Uint8 => "uint8",
            PixelType::Int16 => "int16",
            PixelType::Uint16 => "uint16",
            PixelType::Int32 => "int32",
            PixelType::Uint32 => "uint32",
            PixelType::Float => "float",
            PixelType::Double => "double",
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s {
            "bit" => PixelType::Bit,
            "int8" => PixelType::Int8,
            "uint8" => PixelType::Uint8,
            "int16" => PixelType::Int16,
            "uint16" => PixelType::Uint16,
            "int32" => PixelType::Int32,
            "uint32" => PixelType::Uint32,
            "float" => PixelType::Float,
            "double" => PixelType::Double,
            s => return Err(crate::Error::general(format!("unsupported pixel type: {s}"))),
        };
        Ok(t)
    }
}

/// Identity, extent and encoding of one image's pixels.
///
/// Owned by the metadata service; buffers only ever hold a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    id: u64,
    size_x: u32,
    size_y: u32,
    size_z: u32,
    size_c: u32,
    size_t: u32,
    pixel_type: PixelType,
}

impl ImageDescriptor {
    /// `sizes` are given in X, Y, Z, C, T order; each must be at least 1.
    pub fn new(id: u64, sizes: [u32; 5], pixel_type: PixelType) -> crate::Result<Self> {
        if let Some(i) = sizes.iter().position(|&n| n == 0) {
            let axis = ["X", "Y", "Z", "C", "T"][i];
            return Err(crate::Error::general(format!(
                "size{axis} of pixels {id} must be at least 1"
            )));
        }
        // same arithmetic as Dimensions::total_size, which must not overflow
        let [x, y, z, c, t] = sizes.map(u64::from);
        let total = (x * y)
            .checked_mul(pixel_type.bits_per_pixel() as u64)
            .map(|bits| bits.div_ceil(8))
            .and_then(|plane| plane.checked_mul(z))
            .and_then(|stack| stack.checked_mul(c))
            .and_then(|timepoint| timepoint.checked_mul(t))
            .filter(|&n| usize::try_from(n).is_ok());
        if total.is_none() {
            return Err(crate::Error::general(format!(
                "pixels {id} of {sizes:?} {pixel_type} exceed the addressable size"
            )));
        }
        let [size_x, size_y, size_z, size_c, size_t] = sizes;
        Ok(Self {
            id,
            size_x,
            size_y,
            size_z,
            size_c,
            size_t,
            pixel_type,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size_x(&self) -> u32 {
        self.size_x
    }

    pub fn size_y(&self) -> u32 {
        self.size_y
    }

    pub fn size_z(&self) -> u32 {
        self.size_z
    }

    pub fn size_c(&self) -> u32 {
        self.size_c
    }

    pub fn size_t(&self) -> u32 {
        self.size_t
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn sizes(&self) -> [u32; 5] {
        [
            self.size_x,
            self.size_y,
            self.size_z,
            self.size_c,
            self.size_t,
        ]
    }

    /// Pixels per plane.
    pub fn plane_pixels(&self) -> u64 {
        self.size_x as u64 * self.size_y as u64
    }

    pub fn total_pixels(&self) -> u64 {
        self.sizes().iter().map(|&n| n as u64).product()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::from(self)
    }
}

/// Width and height of one resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelDimensions {
    pub size_x: u32,
    pub size_y: u32,
}

impl LevelDimensions {
    pub fn new(size_x: u32, size_y: u32) -> Self {
        Self { size_x, size_y }
    }

    /// Every level of a pyramid over a `size_x` by `size_y` plane.
    ///
    /// Level 0 is the full plane; each further level halves both sides, rounding up,
    /// until the level fits inside a single tile.
    pub fn pyramid(size_x: u32, size_y: u32, tile_width: u32, tile_height: u32) -> Vec<Self> {
        let mut levels = vec![Self::new(size_x, size_y)];
        let (mut x, mut y) = (size_x, size_y);
        while x > tile_width || y > tile_height {
            x = x.div_ceil(2);
            y = y.div_ceil(2);
            levels.push(Self::new(x, y));
        }
        levels
    }
}

/// Attributes of a pyramid container's root group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PyramidMetadata {
    /// Container format version.
    #[serde(rename = "pyramid")]
    pub format_version: String,
    pub image_id: u64,
    /// Base extent in X, Y, Z, C, T order.
    pub dimensions: [u32; 5],
    /// Tile width and height.
    pub block_size: [u32; 2],
    pub data_type: PixelType,
    /// Chunk compression.
    pub compression: Compression,
    /// Dimensions of every resolution level, level 0 first.
    pub resolution_levels: Vec<LevelDimensions>,
    /// Unstructured attributes.
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl PyramidMetadata {
    pub fn new(
        descriptor: &ImageDescriptor,
        tile_size: (u32, u32),
        compression: Compression,
    ) -> crate::Result<Self> {
        let (tile_width, tile_height) = tile_size;
        if tile_width == 0 || tile_height == 0 {
            return Err(crate::Error::general("zero tile size"));
        }
        if descriptor.pixel_type().is_bit() {
            return Err(crate::Error::unsupported(
                "pyramids of bit pixel data are not supported",
            ));
        }
        Ok(Self {
            format_version: PYRAMID_FORMAT_VERSION.to_string(),
            image_id: descriptor.id(),
            dimensions: descriptor.sizes(),
            block_size: [tile_width, tile_height],
            data_type: descriptor.pixel_type(),
            compression,
            resolution_levels: LevelDimensions::pyramid(
                descriptor.size_x(),
                descriptor.size_y(),
                tile_width,
                tile_height,
            ),
            attributes: Default::default(),
        })
    }

    pub fn tile_size(&self) -> (u32, u32) {
        (self.block_size[0], self.block_size[1])
    }

    /// Whether the container describes exactly these pixels.
    pub fn matches(&self, descriptor: &ImageDescriptor) -> bool {
        self.dimensions == descriptor.sizes()
            && self.data_type == descriptor.pixel_type()
            && self.resolution_levels.first()
                == Some(&LevelDimensions::new(
                    descriptor.size_x(),
                    descriptor.size_y(),
                ))
    }
}

/// Chunk compression configuration.
///
/// `zlib` is accepted as another name for `gzip`.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Copy)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Compression {
    /// Uncompressed.
    Raw,
    #[serde(alias = "zlib")]
    Gzip {
        /// Default 4. Must be in the range 0..=9.
        #[serde(default = "default_gzip_level")]
        level: u8,
    },
}

fn default_gzip_level() -> u8 {
    4
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip {
            level: default_gzip_level(),
        }
    }
}
