use pixel_store::{
    Error, PixelData, PixelType,
    pixel_data::{copy_pixels, get_pixel_value, set_pixel_value},
};

#[test]
fn bits_are_read_most_significant_first() {
    let buf = [0xFF, 0xC1];
    for i in 0..10 {
        assert_eq!(get_pixel_value(&buf, i, PixelType::Bit).unwrap(), 1.0, "bit {i}");
    }
    for i in 10..15 {
        assert_eq!(get_pixel_value(&buf, i, PixelType::Bit).unwrap(), 0.0, "bit {i}");
    }
    assert_eq!(get_pixel_value(&buf, 15, PixelType::Bit).unwrap(), 1.0);
}

#[test]
fn setting_a_bit_leaves_its_neighbours() {
    let mut data = PixelData::new(PixelType::Bit, vec![0xFF, 0xC1]);
    data.set_pixel_value(0, 0.0).unwrap();
    assert_eq!(data.get_pixel_value(0).unwrap(), 0.0);
    assert_eq!(data.get_pixel_value(7).unwrap(), 1.0);
    assert_eq!(data.as_bytes(), &[0x7F, 0xC1]);
    assert_eq!(data.size(), 2);
    assert_eq!(data.len(), 16);

    data.set_pixel_value(12, 3.0).unwrap();
    assert_eq!(data.as_bytes(), &[0x7F, 0xC9]);
}

#[test]
fn multi_byte_values_are_big_endian() {
    let buf = [0x01, 0x02, 0xFF, 0xFE];
    assert_eq!(get_pixel_value(&buf, 0, PixelType::Uint16).unwrap(), 258.0);
    assert_eq!(get_pixel_value(&buf, 1, PixelType::Uint16).unwrap(), 65534.0);
    assert_eq!(get_pixel_value(&buf, 1, PixelType::Int16).unwrap(), -2.0);
    assert_eq!(get_pixel_value(&buf, 2, PixelType::Int8).unwrap(), -1.0);
    assert_eq!(get_pixel_value(&buf, 0, PixelType::Uint32).unwrap(), 0x0102_FFFE as f64);

    let mut buf = [0u8; 8];
    set_pixel_value(&mut buf, 1, 1.5, PixelType::Float).unwrap();
    assert_eq!(&buf[4..], &1.5f32.to_be_bytes());
    set_pixel_value(&mut buf, 0, -0.25, PixelType::Double).unwrap();
    assert_eq!(buf, (-0.25f64).to_be_bytes());
    assert_eq!(get_pixel_value(&buf, 0, PixelType::Double).unwrap(), -0.25);
}

#[test]
fn integer_writes_saturate() {
    let mut data = PixelData::zeroed(PixelType::Uint8, 2);
    data.set_pixel_value(0, 300.0).unwrap();
    data.set_pixel_value(1, -5.0).unwrap();
    assert_eq!(data.as_bytes(), &[255, 0]);

    let mut data = PixelData::zeroed(PixelType::Int16, 1);
    data.set_pixel_value(0, -40_000.0).unwrap();
    assert_eq!(data.get_pixel_value(0).unwrap(), i16::MIN as f64);
}

#[test]
fn indices_past_the_end_are_rejected() {
    let data = PixelData::zeroed(PixelType::Uint16, 3);
    assert_eq!(data.size(), 6);
    assert!(matches!(
        data.get_pixel_value(3),
        Err(Error::IndexOutOfBounds { index: 3, count: 3 })
    ));

    let mut bits = PixelData::zeroed(PixelType::Bit, 10);
    assert_eq!(bits.size(), 2);
    // trailing pad bits of the last byte are addressable
    assert!(bits.set_pixel_value(15, 1.0).is_ok());
    assert!(matches!(
        bits.set_pixel_value(16, 1.0),
        Err(Error::IndexOutOfBounds { index: 16, count: 16 })
    ));
}

#[test]
fn copies_bits_between_unaligned_positions() {
    let src = [0b1011_0110, 0b1100_0000];
    let mut dst = [0u8; 2];
    copy_pixels(&src, 2, &mut dst, 5, 6, PixelType::Bit).unwrap();
    // source bits 2..8 are 1 1 0 1 1 0, landing at 5..11
    assert_eq!(dst, [0b0000_0110, 0b1100_0000]);

    let src = [1, 2, 3, 4, 5, 6];
    let mut dst = [0u8; 6];
    copy_pixels(&src, 1, &mut dst, 0, 2, PixelType::Uint16).unwrap();
    assert_eq!(dst, [3, 4, 5, 6, 0, 0]);

    assert!(copy_pixels(&src, 2, &mut dst, 0, 2, PixelType::Uint16).is_err());
    assert!(copy_pixels(&src, 0, &mut dst, 0, 0, PixelType::Uint16).is_ok());
}

#[test]
fn digests_depend_on_content() {
    let a = PixelData::zeroed(PixelType::Uint8, 16);
    let mut b = PixelData::zeroed(PixelType::Uint8, 16);
    assert_eq!(a.digest(), b.digest());
    b.set_pixel_value(15, 1.0).unwrap();
    assert_ne!(a.digest(), b.digest());
    assert_eq!(
        pixel_store::pixel_data::digest(b"abc")[..4],
        [0xba, 0x78, 0x16, 0xbf]
    );
}

#[test]
fn pixel_type_names() {
    for pixel_type in [
        PixelType::Bit,
        PixelType::Int8,
        PixelType::Uint8,
        PixelType::Int16,
        PixelType::Uint16,
        PixelType::Int32,
        PixelType::Uint32,
        PixelType::Float,
        PixelType::Double,
    ] {
        let parsed: PixelType = pixel_type.to_string().parse().unwrap();
        assert_eq!(parsed, pixel_type);
    }
    assert!("complex".parse::<PixelType>().is_err());
    assert_eq!(PixelType::Uint16.bytes_per_pixel(), 2.0);
    assert_eq!(PixelType::Bit.bytes_per_pixel(), 0.125);
    assert_eq!(PixelType::Bit.byte_len(10), 2);
    assert_eq!(PixelType::Double.byte_len(3), 24);
    assert!(PixelType::Int32.is_signed());
    assert!(!PixelType::Uint32.is_signed());
}
