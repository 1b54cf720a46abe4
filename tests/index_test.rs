use casc_forge::archive_index::{ArchiveIndex, ArchiveIndexEntry};
use casc_forge::blte::{self, ChunkSpec};
use casc_forge::local_index::{bucket_of, file_name, LocalIndex, LOCAL_INDEX_MIN_SIZE};
use casc_forge::writer::{ArchiveWriter, CdnLayout, WriteMode, ARCHIVE_HEADER_SIZE};
use casc_forge::HashKey;
use proptest::prelude::*;
use std::fs;

fn entry(seed: u32, size: u32) -> ArchiveIndexEntry {
    ArchiveIndexEntry { key: HashKey::of(&seed.to_le_bytes()), size, offset: 0 }
}

#[test]
fn test_archive_index_spans_pages() {
    // 1 KiB pages hold 42 rows
    let mut index = ArchiveIndex::with_page_size(1024);
    for i in 0..100 {
        index.insert(entry(i, 100 + i));
    }
    index.pack_offsets();
    let file = index.build().unwrap();

    assert_eq!(file.bytes.len(), 3 * 1024 + 3 * 16 + 2 * 8 + 36);
    let footer = &file.bytes[file.bytes.len() - 36..];
    assert_eq!(footer[16], 1);
    assert_eq!(footer[19], 1);
    assert_eq!(&footer[24..28], &100u32.to_le_bytes());
    assert_eq!(file.name, HashKey::of(&footer[8..]));

    let parsed = ArchiveIndex::parse(&file.bytes).unwrap();
    assert_eq!(parsed, index);

    let mut offset = 0;
    for e in parsed.entries() {
        assert_eq!(e.offset, offset);
        offset += e.size;
    }
}

#[test]
fn test_empty_archive_index_has_one_page() {
    let file = ArchiveIndex::new().build().unwrap();
    assert_eq!(file.bytes.len(), 4096 + 16 + 36);
    assert!(ArchiveIndex::parse(&file.bytes).unwrap().is_empty());
}

#[test]
fn test_archive_index_damage_is_detected() {
    let mut index = ArchiveIndex::with_page_size(1024);
    for i in 0..50 {
        index.insert(entry(i, 10));
    }
    let bytes = index.build().unwrap().bytes;

    let mut page = bytes.clone();
    page[5] ^= 1;
    assert!(ArchiveIndex::parse(&page).unwrap_err().is_corruption());

    let mut footer = bytes.clone();
    let n = footer.len();
    footer[n - 12] ^= 1;
    assert!(ArchiveIndex::parse(&footer).unwrap_err().is_corruption());

    assert!(ArchiveIndex::parse(&bytes[..20]).unwrap_err().is_corruption());
}

#[test]
fn test_local_index_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let writer = ArchiveWriter::new(&data_dir, dir.path().join("out"), CdnLayout::Flat);

    let mut index = LocalIndex::new(&data_dir);
    let mut stored = Vec::new();
    for i in 0..20u32 {
        let payload = format!("payload number {i}").repeat(i as usize + 1);
        let framed = blte::encode(payload.as_bytes(), &[ChunkSpec::zlib(9)]).unwrap();
        let blob = writer.store(WriteMode::Archive, &framed).unwrap();
        assert_eq!(blob.archived_size() as usize, framed.bytes.len() + ARCHIVE_HEADER_SIZE);
        index.record_new_blob(&blob);
        stored.push((blob, framed.bytes));
    }
    let written = index.flush().unwrap();
    assert!(!written.is_empty());
    for path in &written {
        assert!(fs::metadata(path).unwrap().len() >= LOCAL_INDEX_MIN_SIZE as u64);
    }

    let loaded = LocalIndex::load(&data_dir).unwrap();
    assert_eq!(loaded.len(), 20);
    for (blob, bytes) in &stored {
        let hit = loaded.lookup(&blob.encoded_key).unwrap();
        assert_eq!(Some(hit.archive), blob.archive);
        assert_eq!(Some(hit.offset), blob.offset);
        let back = writer.read_record(hit.archive, hit.offset, hit.size, blob.encoded_key.as_bytes()).unwrap();
        assert_eq!(&back, bytes);

        let bucket = bucket_of(&blob.encoded_key.truncated());
        assert!(data_dir.join(file_name(bucket, 1)).is_file());
    }
}

#[test]
fn test_local_index_remove_rewrites_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let writer = ArchiveWriter::new(dir.path(), dir.path().join("out"), CdnLayout::Flat);
    let framed = blte::encode(b"gone soon", &[ChunkSpec::stored()]).unwrap();
    let blob = writer.store(WriteMode::Archive, &framed).unwrap();

    let mut index = LocalIndex::new(dir.path());
    index.record_new_blob(&blob);
    index.flush().unwrap();
    assert!(index.remove(&blob.encoded_key).is_some());
    assert_eq!(index.flush().unwrap().len(), 1);

    assert!(LocalIndex::load(dir.path()).unwrap().lookup(&blob.encoded_key).is_none());
}

#[test]
fn test_loose_only_blobs_stay_out_of_the_local_index() {
    let dir = tempfile::tempdir().unwrap();
    let writer = ArchiveWriter::new(dir.path().join("data"), dir.path().join("out"), CdnLayout::Sharded);
    let framed = blte::encode(b"loose", &[ChunkSpec::stored()]).unwrap();
    let blob = writer.store(WriteMode::Loose, &framed).unwrap();

    let hex = blob.encoded_key.to_hex();
    let expected = dir.path().join("out").join(&hex[0..2]).join(&hex[2..4]).join(&hex);
    assert_eq!(blob.out_path.as_deref(), Some(expected.as_path()));

    let mut index = LocalIndex::new(dir.path().join("data"));
    index.record_new_blob(&blob);
    assert!(index.is_empty());
}

#[test]
fn test_archive_rotates_when_full() {
    let dir = tempfile::tempdir().unwrap();
    let writer = ArchiveWriter::new(dir.path(), dir.path().join("out"), CdnLayout::Flat).with_capacity(150);

    let framed = blte::encode(&[7u8; 60], &[ChunkSpec::stored()]).unwrap();
    // 30 + 8 + 61 = 99 bytes per record
    let first = writer.store(WriteMode::Archive, &framed).unwrap();
    let second = writer.store(WriteMode::Archive, &framed).unwrap();
    let third = writer.store(WriteMode::Archive, &framed).unwrap();

    assert_eq!((first.archive, first.offset), (Some(0), Some(0)));
    assert_eq!((second.archive, second.offset), (Some(1), Some(0)));
    assert_eq!((third.archive, third.offset), (Some(2), Some(0)));

    let record = fs::read(writer.data_file_path(0)).unwrap();
    let mut reversed = *first.encoded_key.as_bytes();
    reversed.reverse();
    assert_eq!(&record[..16], &reversed);
    assert_eq!(&record[16..20], &99u32.to_le_bytes());
    assert_eq!(&record[20..30], &[0u8; 10]);
}

#[test]
fn test_record_key_mismatch_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let writer = ArchiveWriter::new(dir.path(), dir.path().join("out"), CdnLayout::Flat);
    let framed = blte::encode(b"abc", &[ChunkSpec::stored()]).unwrap();
    let blob = writer.store(WriteMode::Archive, &framed).unwrap();

    let other = HashKey::of(b"something else");
    let err = writer.read_record(0, 0, blob.archived_size(), other.as_bytes()).unwrap_err();
    assert!(err.is_corruption());
}

proptest! {
    #[test]
    fn prop_archive_index_rebuild_is_stable(seeds in proptest::collection::btree_set(any::<u32>(), 0..300)) {
        let mut index = ArchiveIndex::with_page_size(2048);
        for seed in &seeds {
            index.insert(entry(*seed, seed % 5000 + 1));
        }
        index.pack_offsets();
        let first = index.build().unwrap();
        let parsed = ArchiveIndex::parse(&first.bytes).unwrap();
        prop_assert_eq!(parsed.len(), seeds.len());
        let second = parsed.build().unwrap();
        prop_assert_eq!(first.name, second.name);
        prop_assert_eq!(first.bytes, second.bytes);
    }
}
