use super::*;

#[test]
fn integers_round_trip() {
    let mut buf = Vec::new();
    0xAAu8.encode_to(&mut buf).unwrap();
    0xBBCCu16.encode_to(&mut buf).unwrap();
    0xDDEE_FF00u32.encode_to(&mut buf).unwrap();
    0x0102_0304_0506_0708u64.encode_to(&mut buf).unwrap();
    (-42i64).encode_to(&mut buf).unwrap();

    let mut off = 0;
    let (a, n) = u8::decode_from(&buf[off..]).unwrap();
    off += n;
    let (b, n) = u16::decode_from(&buf[off..]).unwrap();
    off += n;
    let (c, n) = u32::decode_from(&buf[off..]).unwrap();
    off += n;
    let (d, n) = u64::decode_from(&buf[off..]).unwrap();
    off += n;
    let (e, n) = i64::decode_from(&buf[off..]).unwrap();
    off += n;

    assert_eq!((a, b, c, d, e), (0xAA, 0xBBCC, 0xDDEE_FF00, 0x0102_0304_0506_0708, -42));
    assert_eq!(off, buf.len());
}

#[test]
fn integers_are_little_endian() {
    let bytes = encode_to_vec(&0x1122_3344u32).unwrap();
    assert_eq!(bytes, vec![0x44, 0x33, 0x22, 0x11]);
}

#[test]
fn byte_strings_round_trip() {
    let value = b"hello world".to_vec();
    let bytes = encode_to_vec(&value).unwrap();
    let (decoded, consumed) = Vec::<u8>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(consumed, bytes.len());

    let empty: Vec<u8> = Vec::new();
    let bytes = encode_to_vec(&empty).unwrap();
    assert_eq!(bytes, vec![0, 0, 0, 0]);
}

#[test]
fn strings_reject_bad_utf8() {
    let mut buf = Vec::new();
    vec![0xFFu8, 0xFE].encode_to(&mut buf).unwrap();
    assert!(matches!(
        String::decode_from(&buf),
        Err(EncodingError::InvalidUtf8(_))
    ));
}

#[test]
fn option_round_trip() {
    let some: Option<u64> = Some(7);
    let none: Option<u64> = None;

    let bytes = encode_to_vec(&some).unwrap();
    assert_eq!(Option::<u64>::decode_from(&bytes).unwrap().0, Some(7));

    let bytes = encode_to_vec(&none).unwrap();
    assert_eq!(Option::<u64>::decode_from(&bytes).unwrap().0, None);
    assert_eq!(bytes.len(), 1);
}

#[test]
fn option_rejects_bad_tag() {
    assert!(matches!(
        Option::<u64>::decode_from(&[7u8]),
        Err(EncodingError::InvalidTag { tag: 7, .. })
    ));
}

#[test]
fn bool_rejects_bad_byte() {
    assert!(matches!(
        bool::decode_from(&[2u8]),
        Err(EncodingError::InvalidBool(2))
    ));
}

#[test]
fn seq_round_trip() {
    let items: Vec<u64> = (0..100).collect();
    let mut buf = Vec::new();
    encode_seq(&items, &mut buf).unwrap();
    let (decoded, consumed) = decode_seq::<u64>(&buf).unwrap();
    assert_eq!(decoded, items);
    assert_eq!(consumed, buf.len());
}

#[test]
fn short_buffer_reports_need() {
    let err = u64::decode_from(&[1, 2, 3]).unwrap_err();
    match err {
        EncodingError::ShortBuffer { needed, available } => {
            assert_eq!(needed, 8);
            assert_eq!(available, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn byte_length_cap_is_enforced() {
    // Length prefix claims far more data than the cap allows.
    let mut buf = Vec::new();
    u32::MAX.encode_to(&mut buf).unwrap();
    assert!(matches!(
        Vec::<u8>::decode_from(&buf),
        Err(EncodingError::LengthLimit(_))
    ));
}

#[test]
fn seq_count_cap_is_enforced() {
    let mut buf = Vec::new();
    (MAX_SEQ_ELEMENTS + 1).encode_to(&mut buf).unwrap();
    assert!(matches!(
        decode_seq::<u64>(&buf),
        Err(EncodingError::LengthLimit(_))
    ));
}

#[test]
fn fixed_arrays_have_no_prefix() {
    let magic = *b"CKV0";
    let bytes = encode_to_vec(&magic).unwrap();
    assert_eq!(bytes, b"CKV0");
    let (decoded, n) = <[u8; 4]>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, magic);
    assert_eq!(n, 4);
}
