use std::{fs, sync::Arc, time::Duration};

use pixel_store::{
    Error, ImageDescriptor, PixelBufferTraits, PixelType, PyramidPixelBuffer, TileCoordinate,
    buffer::PyramidOptions,
    for_each_tile,
    lock::PyramidLocks,
    metadata::Compression,
    shard::PathLayout,
};
use zarrs::{filesystem::FilesystemStore, storage::ReadableListableStorage};

mod common;
use common::{SHORT, descriptor, scratch, uint16_value};

const ID: u64 = 21;
const SIZES: [u32; 5] = [100, 60, 2, 1, 1];

fn options(compression: Compression) -> PyramidOptions {
    PyramidOptions {
        tile_width: 16,
        tile_height: 16,
        compression,
    }
}

fn tile_bytes(tile: TileCoordinate) -> Vec<u8> {
    let mut out = Vec::with_capacity(tile.pixel_count() as usize * 2);
    for y in tile.y..tile.y + tile.height {
        for x in tile.x..tile.x + tile.width {
            out.extend_from_slice(&uint16_value(x, y, tile.z, tile.c, tile.t).to_be_bytes());
        }
    }
    out
}

fn start_build(
    layout: &PathLayout,
    locks: &PyramidLocks,
    desc: &ImageDescriptor,
    compression: Compression,
) -> pixel_store::Result<PyramidPixelBuffer> {
    let id = desc.id();
    let lock = locks.acquire(id, &layout.pyramid_lock_path(id), SHORT)?;
    PyramidPixelBuffer::create(layout.pyramid_path(id), desc.clone(), options(compression), lock)
}

fn fill(buffer: &mut PyramidPixelBuffer) -> u64 {
    for_each_tile(buffer, 16, 16, |buffer, tile, _| {
        buffer.set_tile(tile, &tile_bytes(tile))
    })
    .unwrap()
}

fn build(layout: &PathLayout, desc: &ImageDescriptor) -> PyramidPixelBuffer {
    let locks = PyramidLocks::default();
    let mut buffer = start_build(layout, &locks, desc, Compression::default()).unwrap();
    fill(&mut buffer);
    buffer.close().unwrap();
    PyramidPixelBuffer::open(layout.pyramid_path(desc.id()), desc.clone()).unwrap()
}

#[test]
fn levels_halve_until_one_tile() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let buffer = build(&layout, &desc);

    assert_eq!(buffer.resolution_levels(), 4);
    assert_eq!(
        buffer.resolution_descriptions(),
        vec![(100, 60), (50, 30), (25, 15), (13, 8)]
    );
    assert_eq!(buffer.resolution_level(), 0);
    assert_eq!((buffer.size_x(), buffer.size_y()), (100, 60));
    assert_eq!(buffer.tile_size(), (16, 16));
    assert!(!buffer.is_writable());
}

#[test]
fn level_zero_reads_back_what_was_written() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let mut buffer = build(&layout, &desc);

    // spans four tiles
    let region = TileCoordinate::new(1, 0, 0, 10, 12, 20, 9);
    assert_eq!(buffer.get_tile(region).unwrap().as_bytes(), tile_bytes(region).as_slice());

    let row = buffer.get_row(59, 0, 0, 0).unwrap();
    assert_eq!(row.len(), 100);
    assert_eq!(
        row.get_pixel_value(99).unwrap() as u16,
        uint16_value(99, 59, 0, 0, 0)
    );

    let plane = buffer.get_plane(1, 0, 0).unwrap();
    assert_eq!(
        plane.as_bytes(),
        tile_bytes(TileCoordinate::plane(1, 0, 0, 100, 60)).as_slice()
    );

    // clipped at the right edge
    let edge = buffer
        .get_tile(TileCoordinate::new(0, 0, 0, 96, 0, 16, 16))
        .unwrap();
    assert_eq!(edge.len(), 4 * 16);
}

#[test]
fn lower_levels_are_box_averages() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let mut buffer = build(&layout, &desc);

    buffer.set_resolution_level(1).unwrap();
    assert_eq!((buffer.size_x(), buffer.size_y()), (50, 30));
    let plane = buffer.get_plane(1, 0, 0).unwrap();
    assert_eq!(plane.len(), 1500);
    for (x, y) in [(0, 0), (17, 3), (49, 29)] {
        let v = plane.get_pixel_value((y * 50 + x) as usize).unwrap() as u16;
        // mean of +0, +7, +13 and +20 around the source pixel
        assert_eq!(v, uint16_value(2 * x, 2 * y, 1, 0, 0) + 10, "({x}, {y})");
    }

    buffer.set_resolution_level(2).unwrap();
    let tile = buffer
        .get_tile(TileCoordinate::new(0, 0, 0, 16, 0, 16, 16))
        .unwrap();
    // 25x15 level, clipped to 9x15
    assert_eq!(tile.len(), 9 * 15);
    assert_eq!(
        tile.get_pixel_value(0).unwrap() as u16,
        uint16_value(64, 0, 0, 0, 0) + 30
    );

    // the last pixel of level 3 only covers one source pixel of level 2
    buffer.set_resolution_level(3).unwrap();
    let plane = buffer.get_plane(0, 0, 0).unwrap();
    assert_eq!(plane.len(), 13 * 8);
    assert_eq!(
        plane.get_pixel_value(13 * 8 - 1).unwrap() as u16,
        uint16_value(96, 56, 0, 0, 0) + 30
    );

    buffer.set_resolution_level(0).unwrap();
    assert_eq!(buffer.size_x(), 100);
}

#[test]
fn constant_images_stay_constant() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(22, [70, 33, 1, 1, 1], PixelType::Float);
    let locks = PyramidLocks::default();
    let mut buffer = start_build(&layout, &locks, &desc, Compression::Raw).unwrap();
    for_each_tile(&mut buffer, 16, 16, |buffer, tile, _| {
        let pixels: Vec<u8> = (0..tile.pixel_count())
            .flat_map(|_| 2.5f32.to_be_bytes())
            .collect();
        buffer.set_tile(tile, &pixels)
    })
    .unwrap();
    buffer.close().unwrap();

    let mut buffer = PyramidPixelBuffer::open(layout.pyramid_path(22), desc).unwrap();
    for level in 0..buffer.resolution_levels() {
        buffer.set_resolution_level(level).unwrap();
        let plane = buffer.get_plane(0, 0, 0).unwrap();
        assert!(
            (0..plane.len()).all(|i| plane.get_pixel_value(i).unwrap() == 2.5),
            "level {level}"
        );
    }

    // uncompressed edge chunks hold exactly the clipped tile
    let chunk = layout.pyramid_path(22).join("0/c/0/0/0/2/4");
    assert_eq!(fs::read(chunk).unwrap().len(), 6 * 1 * 4);
}

#[test]
fn levels_are_plain_zarr_arrays() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    build(&layout, &desc);

    let store: ReadableListableStorage =
        Arc::new(FilesystemStore::new(layout.pyramid_path(ID)).expect("open store"));
    let array = zarrs::array::Array::open(store.clone(), "/0").expect("open level 0");
    assert_eq!(array.shape().to_vec(), vec![1, 1, 2, 60, 100]);
    let data: Vec<u16> = array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve level 0");
    assert_eq!(data.len(), 2 * 60 * 100);
    for (i, &v) in data.iter().enumerate() {
        let (z, y, x) = (i / 6000, i / 100 % 60, i % 100);
        assert_eq!(v, uint16_value(x as u32, y as u32, z as u32, 0, 0), "{x},{y},{z}");
    }

    let array = zarrs::array::Array::open(store, "/3").expect("open level 3");
    assert_eq!(array.shape().to_vec(), vec![1, 1, 2, 8, 13]);
}

#[test]
fn invalid_resolution_levels_are_rejected() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let mut buffer = build(&layout, &desc);

    assert!(matches!(
        buffer.set_resolution_level(4),
        Err(Error::InvalidResolutionLevel { level: 4, levels: 4 })
    ));
    assert_eq!(buffer.resolution_level(), 0);
}

#[test]
fn tile_counts_follow_the_resolution_level() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let mut buffer = build(&layout, &desc);

    let count = |buffer: &mut PyramidPixelBuffer| for_each_tile(buffer, 16, 16, |_, _, _| Ok(())).unwrap();
    assert_eq!(count(&mut buffer), 7 * 4 * 2);
    buffer.set_resolution_level(2).unwrap();
    assert_eq!(count(&mut buffer), 2 * 1 * 2);
}

#[test]
fn build_holds_the_lock_until_close() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let locks = PyramidLocks::new(Duration::from_millis(5), None);
    let mut buffer = start_build(&layout, &locks, &desc, Compression::default()).unwrap();

    assert!(buffer.is_building());
    assert!(buffer.is_writable());
    assert!(locks.is_held(ID));
    assert!(layout.pyramid_lock_path(ID).is_file());
    assert!(layout.pyramid_staging_path(ID).is_dir());
    assert!(!layout.pyramid_path(ID).exists());

    assert!(matches!(
        locks.acquire(ID, &layout.pyramid_lock_path(ID), SHORT),
        Err(Error::LockTimeout { image_id: ID, .. })
    ));
    // another process only sees the lock file
    let elsewhere = PyramidLocks::new(Duration::from_millis(5), None);
    assert!(matches!(
        elsewhere.acquire(ID, &layout.pyramid_lock_path(ID), SHORT),
        Err(Error::LockTimeout { .. })
    ));

    assert_eq!(fill(&mut buffer), 56);
    buffer.close().unwrap();

    assert!(!buffer.is_building());
    assert!(!locks.is_held(ID));
    assert!(!layout.pyramid_lock_path(ID).exists());
    assert!(!layout.pyramid_staging_path(ID).exists());
    assert!(layout.pyramid_path(ID).is_dir());

    // the closed builder keeps serving reads from the finished pyramid
    let plane = buffer.get_plane(0, 0, 0).unwrap();
    assert_eq!(
        plane.as_bytes(),
        tile_bytes(TileCoordinate::plane(0, 0, 0, 100, 60)).as_slice()
    );
    assert!(matches!(
        buffer.set_tile(TileCoordinate::new(0, 0, 0, 0, 0, 16, 16), &[0; 512]),
        Err(Error::ReadOnly { .. })
    ));
}

#[test]
fn abandoned_build_leaves_nothing_behind() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let locks = PyramidLocks::default();

    let mut buffer = start_build(&layout, &locks, &desc, Compression::default()).unwrap();
    buffer
        .set_tile(
            TileCoordinate::new(0, 0, 0, 0, 0, 16, 16),
            &tile_bytes(TileCoordinate::new(0, 0, 0, 0, 0, 16, 16)),
        )
        .unwrap();
    drop(buffer);

    assert!(!locks.is_held(ID));
    assert!(!layout.pyramid_lock_path(ID).exists());
    assert!(!layout.pyramid_staging_path(ID).exists());
    assert!(!layout.pyramid_path(ID).exists());

    // a new build starts from scratch
    let mut buffer = start_build(&layout, &locks, &desc, Compression::default()).unwrap();
    fill(&mut buffer);
    buffer.close().unwrap();
    assert!(layout.pyramid_path(ID).is_dir());
}

#[test]
fn tile_writes_must_match_the_grid() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let locks = PyramidLocks::default();
    let mut buffer = start_build(&layout, &locks, &desc, Compression::default()).unwrap();

    let unaligned = TileCoordinate::new(0, 0, 0, 8, 0, 16, 16);
    assert!(matches!(
        buffer.set_tile(unaligned, &tile_bytes(unaligned)),
        Err(Error::Unsupported(_))
    ));
    let partial = TileCoordinate::new(0, 0, 0, 0, 0, 8, 16);
    assert!(matches!(
        buffer.set_tile(partial, &tile_bytes(partial)),
        Err(Error::Unsupported(_))
    ));
    let tile = TileCoordinate::new(0, 0, 0, 0, 0, 16, 16);
    assert!(matches!(
        buffer.set_tile(tile, &[0; 10]),
        Err(Error::BufferSize { expected: 512, actual: 10 })
    ));
    assert!(matches!(
        buffer.set_tile(TileCoordinate::new(2, 0, 0, 0, 0, 16, 16), &[0; 512]),
        Err(Error::DimensionsOutOfBounds { .. })
    ));

    buffer.set_resolution_level(1).unwrap();
    assert!(matches!(
        buffer.set_tile(tile, &tile_bytes(tile)),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn bit_pixels_cannot_be_pyramids() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(23, [100, 100, 1, 1, 1], PixelType::Bit);
    let locks = PyramidLocks::default();

    assert!(matches!(
        start_build(&layout, &locks, &desc, Compression::default()),
        Err(Error::Unsupported(_))
    ));
    assert!(!locks.is_held(23));
    assert!(!layout.pyramid_lock_path(23).exists());
}

#[test]
fn gzip_levels_above_nine_are_rejected_before_writing() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(25, [40, 40, 1, 1, 1], PixelType::Uint8);
    let locks = PyramidLocks::default();

    assert!(matches!(
        start_build(&layout, &locks, &desc, Compression::Gzip { level: 12 }),
        Err(Error::General(_))
    ));
    assert!(!locks.is_held(25));
    assert!(!layout.pyramid_staging_path(25).exists());
    assert!(!layout.pyramid_path(25).exists());
}

#[test]
fn open_checks_the_container() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    build(&layout, &desc);
    let path = layout.pyramid_path(ID);

    let other = descriptor(ID, [100, 60, 3, 1, 1], PixelType::Uint16);
    assert!(matches!(
        PyramidPixelBuffer::open(&path, other),
        Err(Error::Resource { .. })
    ));
    let other = descriptor(ID, SIZES, PixelType::Int16);
    assert!(matches!(
        PyramidPixelBuffer::open(&path, other),
        Err(Error::Resource { .. })
    ));

    fs::write(path.join("zarr.json"), b"{ not json").unwrap();
    assert!(matches!(
        PyramidPixelBuffer::open(&path, desc.clone()),
        Err(Error::Resource { image_id: ID, .. })
    ));

    assert!(matches!(
        PyramidPixelBuffer::open(layout.pyramid_path(99), desc),
        Err(Error::Resource { .. })
    ));
}

#[test]
fn unwritten_tiles_read_as_zero() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(24, [40, 40, 1, 1, 1], PixelType::Int32);
    let locks = PyramidLocks::default();
    let mut buffer = start_build(&layout, &locks, &desc, Compression::default()).unwrap();
    buffer.close().unwrap();

    let mut buffer = PyramidPixelBuffer::open(layout.pyramid_path(24), desc).unwrap();
    assert_eq!(buffer.resolution_levels(), 3);
    buffer.set_resolution_level(2).unwrap();
    let plane = buffer.get_plane(0, 0, 0).unwrap();
    assert_eq!(plane.size(), 10 * 10 * 4);
    assert!(plane.as_bytes().iter().all(|&b| b == 0));
}

#[test]
fn lock_for_another_image_is_refused() {
    let dir = scratch();
    let layout = PathLayout::new(dir.path());
    let desc = descriptor(ID, SIZES, PixelType::Uint16);
    let locks = PyramidLocks::default();
    let lock = locks.acquire(7, &layout.pyramid_lock_path(7), SHORT).unwrap();

    assert!(PyramidPixelBuffer::create(
        layout.pyramid_path(ID),
        desc,
        options(Compression::default()),
        lock
    )
    .is_err());
    assert!(!locks.is_held(7));
}
