use casc_forge::blte::{self, BlteReader};
use casc_forge::encoding::{default_block_map, EncodingTable};
use casc_forge::writer::StoredBlob;
use casc_forge::HashKey;
use std::io::Cursor;

fn blob(seed: &str, size: u32) -> StoredBlob {
    StoredBlob {
        encoded_key:       HashKey::of(format!("e:{seed}").as_bytes()),
        content_key:       HashKey::of(seed.as_bytes()),
        compressed_size:   size,
        decompressed_size: size as u64 * 2,
        archive:           None,
        offset:            None,
        out_path:          None,
        path:              None,
        high_priority:     false,
    }
}

fn written(table: &EncodingTable) -> EncodingTable {
    let framed = blte::encode_sections(&table.sections().unwrap(), table.block_map()).unwrap();
    let mut reader = BlteReader::new(Cursor::new(framed.bytes)).unwrap();
    let map = reader.encoding_map().unwrap();
    EncodingTable::parse(&reader.into_decoded()).unwrap().with_block_map(map)
}

#[test]
fn test_translate_survives_a_write() {
    let mut table = EncodingTable::new();
    let a = blob("a", 500);
    let b = blob("b", 4000);
    table.record(&a);
    table.record(&b);

    let back = written(&table);
    assert_eq!(back.translate(&a.content_key), Some(a.encoded_key));
    assert_eq!(back.translate(&b.content_key), Some(b.encoded_key));
    assert!(back.contains_encoded(&b.encoded_key));
    assert_eq!(back.content(&b.content_key).unwrap().decompressed_size, 8000);
    assert_eq!(back.describe(&a.encoded_key), Some(("b:{500*=z}", 500)));
    assert_eq!(back.describe(&b.encoded_key), Some(("b:{3K*=z}", 4000)));
    assert_eq!(back.especs(), table.especs());
}

#[test]
fn test_file_is_seven_chunks_with_the_default_codecs() {
    let mut table = EncodingTable::new();
    table.record(&blob("only", 10));
    let sections = table.sections().unwrap();
    assert_eq!(sections.len(), 7);
    assert_eq!(sections[0].len(), 22);
    assert_eq!(&sections[0][..2], b"EN");

    let own = String::from_utf8(sections[6].clone()).unwrap();
    assert!(own.starts_with("b:{22=n,"), "{own}");
    assert!(own.ends_with(",*=z}"), "{own}");

    let framed = blte::encode_sections(&sections, table.block_map()).unwrap();
    let mut reader = BlteReader::new(Cursor::new(framed.bytes)).unwrap();
    assert_eq!(reader.chunk_count(), 7);
    let map = reader.encoding_map().unwrap();
    let codecs: Vec<_> = map.iter().map(|s| s.encoding).collect();
    let expected: Vec<_> = default_block_map().iter().map(|s| s.encoding).collect();
    assert_eq!(codecs, expected);
}

#[test]
fn test_root_key_gets_plain_zlib_espec() {
    let mut table = EncodingTable::new();
    let root = blob("root", 300_000);
    table.set_root_key(root.content_key);
    table.record(&root);
    table.record(&blob("big", 300_000));

    assert_eq!(table.describe(&root.encoded_key).map(|d| d.0), Some("z"));
    assert_eq!(table.describe(&blob("big", 0).encoded_key).map(|d| d.0), Some("b:{256K*=z}"));
    // new strings go at the end
    assert_eq!(table.especs(), ["z".to_string(), "b:{256K*=z}".to_string()]);
}

#[test]
fn test_new_encoded_key_replaces_the_old_row() {
    let mut table = EncodingTable::new();
    let first = blob("file", 100);
    table.record(&first);

    let mut second = first.clone();
    second.encoded_key = HashKey::of(b"re-encoded");
    table.record(&second);

    assert_eq!(table.translate(&first.content_key), Some(second.encoded_key));
    assert!(!table.contains_encoded(&first.encoded_key));
    assert_eq!(table.len(), 1);

    assert!(table.remove_content(&first.content_key).is_some());
    assert!(!table.contains_encoded(&second.encoded_key));
    assert!(table.is_empty());
}

#[test]
fn test_many_entries_span_pages() {
    let mut table = EncodingTable::new().with_page_size(1024);
    let blobs: Vec<StoredBlob> = (0..500).map(|i| blob(&format!("file{i}"), 100 + i)).collect();
    for b in &blobs {
        table.record(b);
    }
    let sections = table.sections().unwrap();
    // 38-byte ckey rows, 26 per page
    assert_eq!(sections[3].len(), 20 * 1024);

    let back = EncodingTable::parse(&sections.concat()).unwrap();
    assert_eq!(back.len(), 500);
    for b in &blobs {
        assert_eq!(back.translate(&b.content_key), Some(b.encoded_key));
    }
}

#[test]
fn test_damaged_page_is_corruption() {
    let mut table = EncodingTable::new();
    table.record(&blob("x", 10));
    let sections = table.sections().unwrap();
    let page_start: usize = sections[..3].iter().map(Vec::len).sum();

    let mut bytes = sections.concat();
    bytes[page_start + 3] ^= 0x40;
    assert!(EncodingTable::parse(&bytes).unwrap_err().is_corruption());

    let mut bad_magic = sections.concat();
    bad_magic[0] = b'X';
    assert!(EncodingTable::parse(&bad_magic).unwrap_err().is_corruption());
}
