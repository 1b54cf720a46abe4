use casc_forge::config::{ContainerSettings, KeyValueConfig, TableConfig};
use casc_forge::identity::{IdentityCache, JsonIdentityCache, MemoryIdentityCache};
use casc_forge::remote::OfflineFetcher;
use casc_forge::writer::{CdnLayout, WriteMode};
use casc_forge::{Container, HashKey};
use std::fs;
use std::io::Read;
use std::path::Path;

fn settings(dir: &Path) -> ContainerSettings {
    ContainerSettings::new(dir.join("base"), dir.join("out"))
        .with_max_in_flight(2)
}

fn create(settings: ContainerSettings) -> Container {
    Container::create(settings, Box::new(OfflineFetcher), Box::new(MemoryIdentityCache::new())).unwrap()
}

fn open(settings: ContainerSettings) -> Container {
    Container::open(settings, Box::new(OfflineFetcher), Box::new(MemoryIdentityCache::new())).unwrap()
}

/// Bytes zlib cannot shrink.
fn noise(seed: u32, len: usize) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}

fn read(container: &Container, path: &str) -> Vec<u8> {
    let mut data = Vec::new();
    container.open_file(path).unwrap().read_to_end(&mut data).unwrap();
    data
}

#[test]
fn test_create_save_open() {
    let dir = tempfile::tempdir().unwrap();
    let big = noise(1, 600_000);

    let mut c = create(settings(dir.path()));
    c.add_file("Interface/hello.txt", b"hello world".to_vec());
    c.add_file("World/big.bin", big.clone());
    let report = c.save().unwrap();
    assert_eq!(report.files, 2);
    assert!(report.archive.is_some());

    let out = dir.path().join("out");
    let info = TableConfig::load(&out.join(".build.info")).unwrap();
    assert_eq!(info.get("Build Key"), Some(report.build_config.to_hex().as_str()));
    assert_eq!(info.get("CDN Key"), Some(report.cdn_config.to_hex().as_str()));

    let build = KeyValueConfig::load(&out.join("config").join(report.build_config.to_hex())).unwrap();
    assert_eq!(build.key("root", 0), Some(report.root));
    assert_eq!(build.key("encoding", 1), Some(report.encoding));
    assert_eq!(build.value("patch-size", 0), Some("0"));
    assert!(build.contains("download"));
    assert!(build.contains("install-size"));

    let c = open(settings(dir.path()));
    assert_eq!(read(&c, "Interface/hello.txt"), b"hello world");
    assert_eq!(read(&c, "world\\BIG.bin"), big);
    assert_eq!(c.root().global().len(), 2);
    assert_eq!(c.cdn_index().len(), 2);

    let big_ekey = c.encoding().translate(&HashKey::of(&big)).unwrap();
    assert_eq!(c.encoding().describe(&big_ekey).map(|d| d.0), Some("b:{256K*=z}"));
    let root_ekey = c.encoding().translate(&report.root).unwrap();
    assert_eq!(c.encoding().describe(&root_ekey).map(|d| d.0), Some("z"));

    // root is the only high-priority download entry and comes first
    let dl = c.download().unwrap();
    assert_eq!(dl.entries()[0].encoded_key, root_ekey);
    assert_eq!(dl.entries()[0].priority, 0);
    assert!(dl.entries()[1..].iter().all(|e| e.priority == 1));
}

#[test]
fn test_remove_cascades_through_every_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = create(settings(dir.path()));
    c.add_file("keep.txt", b"keep me".to_vec());
    c.add_file("drop.txt", b"drop me".to_vec());
    c.save().unwrap();

    let mut c = open(settings(dir.path()));
    let ckey = HashKey::of(b"drop me");
    let ekey = c.encoding().translate(&ckey).unwrap();
    assert!(c.download().unwrap().position(&ekey).is_some());

    let removed = c.remove_file("drop.txt");
    assert_eq!(removed.len(), 1);
    assert!(c.root().resolve("drop.txt").is_none());
    assert!(c.encoding().translate(&ckey).is_none());
    assert!(!c.cdn_index().contains(&ekey));
    assert!(c.download().unwrap().position(&ekey).is_none());
    let report = c.save().unwrap();
    assert_eq!(report.files, 0);

    let c = open(settings(dir.path()));
    assert!(c.root().resolve("drop.txt").is_none());
    assert_eq!(read(&c, "keep.txt"), b"keep me");
    assert_eq!(c.cdn_index().len(), 1);
    let archives = c.cdn_config().get("archives").unwrap();
    assert_eq!(archives, [report.archive.unwrap().to_hex()]);
}

#[test]
fn test_shared_content_survives_removal_of_one_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = create(settings(dir.path()));
    c.add_file("one.txt", b"same bytes".to_vec());
    c.add_file("two.txt", b"same bytes".to_vec());
    c.save().unwrap();

    c.remove_file("one.txt");
    assert!(c.encoding().translate(&HashKey::of(b"same bytes")).is_some());
    c.save().unwrap();

    let c = open(settings(dir.path()));
    assert_eq!(read(&c, "two.txt"), b"same bytes");
}

#[test]
fn test_rename_keeps_the_id_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("ids.json");
    let s = settings(dir.path()).with_minimum_file_id(1000);

    let cache = Box::new(JsonIdentityCache::open(&cache_path).unwrap());
    let mut c = Container::create(s.clone(), Box::new(OfflineFetcher), cache).unwrap();
    c.add_file("Sound/old.ogg", b"ogg".to_vec());
    c.save().unwrap();
    let id = c.root().entry_named("Sound/old.ogg").unwrap().file_data_id;
    assert_eq!(id, 1000);
    c.close().unwrap();

    let cache = Box::new(JsonIdentityCache::open(&cache_path).unwrap());
    let mut c = Container::open(s.clone(), Box::new(OfflineFetcher), cache).unwrap();
    assert_eq!(c.rename_file("Sound/old.ogg", "Sound/new.ogg"), 1);
    c.save().unwrap();
    c.close().unwrap();

    let cache = JsonIdentityCache::open(&cache_path).unwrap();
    assert_eq!(cache.lookup("Sound/new.ogg"), Some(1000));
    assert_eq!(cache.lookup("Sound/old.ogg"), None);

    let c = Container::open(s, Box::new(OfflineFetcher), Box::new(cache)).unwrap();
    let entry = c.root().entry_named("Sound/new.ogg").unwrap();
    assert_eq!(entry.file_data_id, 1000);
    assert_eq!(entry.content_key, HashKey::of(b"ogg"));
    assert!(c.root().resolve("Sound/old.ogg").is_none());
}

#[test]
fn test_purge_list_removes_on_save() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = create(settings(dir.path()));
    c.add_file("gone.txt", b"short lived".to_vec());
    c.add_file("stays.txt", b"long lived".to_vec());
    c.save().unwrap();

    let mut cache = MemoryIdentityCache::new();
    cache.mark_for_purge("gone.txt");
    let mut c = Container::open(settings(dir.path()), Box::new(OfflineFetcher), Box::new(cache)).unwrap();
    assert!(c.root().resolve("gone.txt").is_some());
    let report = c.save().unwrap();
    assert_eq!(report.removed, 1);
    assert!(c.root().resolve("gone.txt").is_none());
    assert!(c.root().resolve("stays.txt").is_some());
    assert!(c.identity_cache().purge_list().is_empty());
}

#[test]
fn test_local_archives_and_sharded_layout() {
    let dir = tempfile::tempdir().unwrap();
    let s = settings(dir.path())
        .with_write_mode(WriteMode::Both)
        .with_cdn_layout(CdnLayout::Sharded)
        .with_archive_capacity(64 * 1024);

    let mut c = create(s.clone());
    for i in 0..6u32 {
        c.add_file(&format!("data/file{i}.bin"), noise(i + 10, 40_000));
    }
    let report = c.save().unwrap();

    let data_dir = s.data_dir();
    assert!(data_dir.join("data.000").is_file());
    assert!(data_dir.join("data.001").is_file());
    assert!(fs::read_dir(&data_dir).unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().ends_with(".idx")));

    let hex = report.build_config.to_hex();
    let config = dir.path().join("out").join("config").join(&hex[0..2]).join(&hex[2..4]).join(&hex);
    assert!(config.is_file());

    // drop the loose copies; reads must come from the local archives
    let c = open(s.clone());
    for entry in c.encoding().layout_entries() {
        let loose = c.loose_path(&entry.encoded_key);
        if loose.is_file() {
            fs::remove_file(loose).unwrap();
        }
    }
    let c = open(s);
    assert!(c.local_index().len() >= 6);
    assert_eq!(read(&c, "data/file3.bin"), noise(13, 40_000));
}

#[test]
fn test_failed_save_keeps_the_previous_archive() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = create(settings(dir.path()));
    c.add_file("a.txt", b"first build".to_vec());
    let first = c.save().unwrap();
    let archive = first.archive.unwrap();
    let data = c.loose_path(&archive);
    let mut index = data.clone().into_os_string();
    index.push(".index");
    assert!(data.is_file());
    assert!(Path::new(&index).is_file());

    // the last write of the next save lands on a directory
    let info = dir.path().join("out").join(".build.info");
    fs::remove_file(&info).unwrap();
    fs::create_dir(&info).unwrap();

    c.add_file("b.txt", b"second build".to_vec());
    assert!(c.save().is_err());
    assert!(data.is_file());
    assert!(Path::new(&index).is_file());
}

#[test]
fn test_open_without_build_info_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let err = Container::open(settings(dir.path()), Box::new(OfflineFetcher), Box::new(MemoryIdentityCache::new()))
        .err()
        .unwrap();
    assert!(err.is_missing());
}

#[test]
fn test_damaged_encoding_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = create(settings(dir.path()));
    c.add_file("a.txt", b"a".to_vec());
    let report = c.save().unwrap();

    let path = c.loose_path(&report.encoding);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let err = Container::open(settings(dir.path()), Box::new(OfflineFetcher), Box::new(MemoryIdentityCache::new()))
        .err()
        .unwrap();
    assert!(err.is_corruption());
}
