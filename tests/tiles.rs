use std::collections::HashSet;

use pixel_store::{
    FlatPixelBuffer, PixelBufferTraits, PixelType, TileCoordinate, TileGrid, for_each_tile,
    tiles::tile_digests,
};

mod common;
use common::{descriptor, scratch, uint16_plane};

#[test]
fn grid_covers_every_plane_exactly_once() {
    let grid = TileGrid::new([1000, 1010, 4, 2, 6], 256, 256).unwrap();
    assert_eq!(grid.tiles_x(), 4);
    assert_eq!(grid.tiles_y(), 4);
    assert_eq!(grid.tile_count(), 768);

    let tiles: Vec<TileCoordinate> = grid.iter().collect();
    assert_eq!(tiles.len(), 768);
    assert_eq!(grid.iter().len(), 768);

    let unique: HashSet<_> = tiles.iter().collect();
    assert_eq!(unique.len(), 768);

    let mut area = std::collections::HashMap::new();
    for tile in &tiles {
        assert!(tile.x + tile.width <= 1000);
        assert!(tile.y + tile.height <= 1010);
        *area.entry((tile.z, tile.c, tile.t)).or_insert(0u64) += tile.pixel_count();
    }
    assert_eq!(area.len(), 4 * 2 * 6);
    assert!(area.values().all(|&a| a == 1000 * 1010));
}

#[test]
fn grid_order_is_raster_within_plane_then_z_c_t() {
    let grid = TileGrid::new([1000, 1010, 4, 2, 6], 256, 256).unwrap();
    let tiles: Vec<_> = grid.iter().collect();

    assert_eq!(tiles[0], TileCoordinate::new(0, 0, 0, 0, 0, 256, 256));
    assert_eq!(tiles[1], TileCoordinate::new(0, 0, 0, 256, 0, 256, 256));
    // clipped right edge
    assert_eq!(tiles[3], TileCoordinate::new(0, 0, 0, 768, 0, 232, 256));
    // clipped bottom right corner
    assert_eq!(tiles[15], TileCoordinate::new(0, 0, 0, 768, 768, 232, 242));
    assert_eq!(tiles[16], TileCoordinate::new(1, 0, 0, 0, 0, 256, 256));
    assert_eq!(tiles[64], TileCoordinate::new(0, 1, 0, 0, 0, 256, 256));
    assert_eq!(tiles[128], TileCoordinate::new(0, 0, 1, 0, 0, 256, 256));
    assert_eq!(tiles[767], TileCoordinate::new(3, 1, 5, 768, 768, 232, 242));

    let again: Vec<_> = (&grid).into_iter().collect();
    assert_eq!(tiles, again);
}

#[test]
fn grid_smaller_than_one_tile() {
    let grid = TileGrid::new([10, 3, 1, 1, 1], 256, 256).unwrap();
    let tiles: Vec<_> = grid.iter().collect();
    assert_eq!(tiles, vec![TileCoordinate::new(0, 0, 0, 0, 0, 10, 3)]);
    assert!(TileGrid::new([10, 3, 1, 1, 1], 0, 256).is_err());
}

fn filled_buffer(dir: &tempfile::TempDir) -> FlatPixelBuffer {
    let desc = descriptor(3, [40, 30, 2, 1, 1], PixelType::Uint16);
    let mut buffer =
        FlatPixelBuffer::create(dir.path().join("Pixels/3"), desc).unwrap();
    for z in 0..2 {
        buffer.set_plane(z, 0, 0, &uint16_plane(40, 30, z, 0, 0)).unwrap();
    }
    buffer
}

#[test]
fn for_each_tile_visits_every_tile_in_order() {
    let dir = scratch();
    let mut buffer = filled_buffer(&dir);

    let mut seen = Vec::new();
    let visited = for_each_tile(&mut buffer, 16, 16, |buffer, tile, index| {
        let pixels = buffer.get_tile(tile)?;
        assert_eq!(pixels.len() as u64, tile.pixel_count());
        seen.push((index, tile));
        Ok(())
    })
    .unwrap();

    assert_eq!(visited, 12);
    assert_eq!(seen.len(), 12);
    assert!(seen.iter().enumerate().all(|(i, (index, _))| i as u64 == *index));
    assert_eq!(seen[2].1, TileCoordinate::new(0, 0, 0, 32, 0, 8, 16));
    assert_eq!(seen[5].1, TileCoordinate::new(0, 0, 0, 32, 16, 8, 14));
    assert_eq!(seen[6].1.z, 1);
}

#[test]
fn for_each_tile_stops_at_first_error() {
    let dir = scratch();
    let mut buffer = filled_buffer(&dir);

    let mut calls = 0;
    let result = for_each_tile(&mut buffer, 16, 16, |_, _, index| {
        calls += 1;
        if index == 4 {
            Err(pixel_store::Error::general("stop"))
        } else {
            Ok(())
        }
    });
    assert!(result.is_err());
    assert_eq!(calls, 5);
}

#[test]
fn tile_digests_match_for_identical_content() {
    let dir = scratch();
    let mut a = filled_buffer(&dir);

    let other = scratch();
    let mut b = filled_buffer(&other);

    let da = tile_digests(&mut a, 16, 16).unwrap();
    let db = tile_digests(&mut b, 16, 16).unwrap();
    assert_eq!(da.len(), 12);
    assert_eq!(da, db);

    b.set_row(29, 1, 0, 0, &[0xAB; 80]).unwrap();
    let db = tile_digests(&mut b, 16, 16).unwrap();
    let differing: Vec<_> = (0..12).filter(|&i| da[i] != db[i]).collect();
    // the last row of plane z=1 lies in its bottom row of tiles
    assert_eq!(differing, vec![9, 10, 11]);
}
