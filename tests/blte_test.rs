use casc_forge::blte::{self, BlteError, BlteReader, ChunkSpec};
use casc_forge::codec::EncodingType;
use casc_forge::HashKey;
use proptest::prelude::*;
use std::io::{Cursor, Read, Seek, SeekFrom};

#[test]
fn test_single_chunk_is_headerless() {
    let data = b"just one chunk of text";
    let framed = blte::encode(data, &[ChunkSpec::zlib(9)]).unwrap();

    assert_eq!(framed.header_size, 0);
    assert_eq!(&framed.bytes[..8], b"BLTE\0\0\0\0");
    assert_eq!(framed.encoded_key, HashKey::of(&framed.bytes));
    assert_eq!(framed.content_key, HashKey::of(data));
    assert_eq!(framed.decoded_size, data.len() as u64);
    assert_eq!(blte::decode(&framed.bytes).unwrap(), data);
}

#[test]
fn test_hello_as_one_deflate_chunk() {
    let framed = blte::encode(b"HELLOHELLO", &[ChunkSpec::zlib(9)]).unwrap();
    assert_eq!(framed.header_size, 0);
    assert_eq!(framed.bytes[8], b'Z');
    assert_eq!(framed.content_key, HashKey::of(b"HELLOHELLO"));

    let mut reader = BlteReader::new(Cursor::new(framed.bytes)).unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).unwrap();
    assert_eq!(data, b"HELLOHELLO");
    assert_eq!(HashKey::of(&data), framed.content_key);
    assert_eq!(reader.encoding_map().unwrap()[0].encoding, EncodingType::ZLib);
}

#[test]
fn test_two_stored_chunks() {
    let framed = blte::encode(b"HELLOHELLO", &[ChunkSpec::stored().with_size(5)]).unwrap();

    // 12-byte fixed part + 24 bytes per chunk
    assert_eq!(framed.header_size, 60);
    assert_eq!(&framed.bytes[4..8], &60u32.to_be_bytes());
    assert_eq!(framed.bytes[8], 0x0F);
    assert_eq!(&framed.bytes[9..12], &[0, 0, 2]);
    // compressed size includes the tag byte
    assert_eq!(&framed.bytes[12..16], &6u32.to_be_bytes());
    assert_eq!(&framed.bytes[16..20], &5u32.to_be_bytes());
    assert_eq!(&framed.bytes[20..36], HashKey::of(b"NHELLO").as_bytes());
    assert_eq!(&framed.bytes[60..], b"NHELLONHELLO");

    assert_eq!(framed.encoded_key, HashKey::of(&framed.bytes[..60]));
    assert_eq!(blte::decode(&framed.bytes).unwrap(), b"HELLOHELLO");
}

#[test]
fn test_seek_inflates_only_what_it_needs() {
    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let framed = blte::encode(&data, &[ChunkSpec::zlib(6).with_size(1000)]).unwrap();

    let mut reader = BlteReader::new(Cursor::new(framed.bytes.clone())).unwrap();
    assert_eq!(reader.chunk_count(), 3);
    assert_eq!(reader.chunks_decoded(), 0);
    assert_eq!(reader.decoded_len().unwrap(), 3000);
    assert_eq!(reader.chunks_decoded(), 0);

    let mut buf = [0u8; 10];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, &data[..10]);
    assert_eq!(reader.chunks_decoded(), 1);

    reader.seek(SeekFrom::Start(1500)).unwrap();
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, &data[1500..1510]);
    assert_eq!(reader.chunks_decoded(), 2);

    reader.seek(SeekFrom::End(-10)).unwrap();
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, &data[2990..]);
    assert_eq!(reader.chunks_decoded(), 3);
}

#[test]
fn test_encoding_map_follows_the_chunks() {
    let data = vec![b'x'; 250];
    let specs = [ChunkSpec::zlib(9).with_size(100), ChunkSpec::stored()];
    let framed = blte::encode(&data, &specs).unwrap();

    let mut reader = BlteReader::new(Cursor::new(framed.bytes)).unwrap();
    let map = reader.encoding_map().unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map[0].encoding, EncodingType::ZLib);
    assert_eq!(map[0].level, 9);
    assert_eq!(map[0].size, Some(100));
    assert_eq!(map[1].encoding, EncodingType::None);
    assert_eq!(map[1].size, Some(150));
}

#[test]
fn test_sections_become_chunks() {
    let sections = vec![b"head".to_vec(), vec![0u8; 300], b"tail".to_vec()];
    let specs = [ChunkSpec::stored(), ChunkSpec::zlib(9)];
    let framed = blte::encode_sections(&sections, &specs).unwrap();

    let mut reader = BlteReader::new(Cursor::new(framed.bytes.clone())).unwrap();
    assert_eq!(reader.chunk_count(), 3);
    let map = reader.encoding_map().unwrap();
    assert_eq!(map.iter().map(|s| s.encoding).collect::<Vec<_>>(),
               vec![EncodingType::None, EncodingType::ZLib, EncodingType::ZLib]);
    assert_eq!(framed.content_key, HashKey::of(&sections.concat()));
    assert_eq!(blte::decode(&framed.bytes).unwrap(), sections.concat());
}

#[test]
fn test_flipped_byte_is_corruption() {
    let data = vec![42u8; 4096];
    let mut bytes = blte::encode(&data, &[ChunkSpec::zlib(9).with_size(1024)]).unwrap().bytes;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    let err = blte::decode(&bytes).unwrap_err();
    assert!(matches!(err, BlteError::ChecksumMismatch { chunk: 3 }));
    assert!(err.is_corruption());
}

#[test]
fn test_rejects_foreign_input() {
    assert!(matches!(BlteReader::new(Cursor::new(b"BLT".to_vec())), Err(BlteError::TooShort(3))));
    assert!(matches!(BlteReader::new(Cursor::new(b"ZLTE\0\0\0\0Nx".to_vec())), Err(BlteError::BadMagic(_))));

    let mut bytes = blte::encode(b"abcdef", &[ChunkSpec::stored().with_size(3)]).unwrap().bytes;
    bytes[8] = 0x10;
    assert!(matches!(BlteReader::new(Cursor::new(bytes.clone())), Err(BlteError::BadFlags(0x10))));

    bytes[8] = 0x0F;
    bytes.truncate(40);
    assert!(matches!(BlteReader::new(Cursor::new(bytes)), Err(BlteError::Truncated)));

    let unknown = b"BLTE\0\0\0\0Qpayload".to_vec();
    assert!(matches!(blte::decode(&unknown), Err(BlteError::UnknownEncoding(b'Q'))));
}

proptest! {
    #[test]
    fn prop_decode_inverts_encode(
        data in proptest::collection::vec(any::<u8>(), 0..4096),
        chunk in 1usize..600,
        stored in any::<bool>(),
    ) {
        let spec = if stored { ChunkSpec::stored() } else { ChunkSpec::zlib(6) };
        let framed = blte::encode(&data, &[spec.with_size(chunk)]).unwrap();
        prop_assert_eq!(framed.content_key, HashKey::of(&data));
        prop_assert_eq!(blte::decode(&framed.bytes).unwrap(), data);
    }
}
