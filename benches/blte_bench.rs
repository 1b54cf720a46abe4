use casc_forge::blte::{self, BlteReader, ChunkSpec};
use casc_forge::encoding::EncodingTable;
use casc_forge::writer::StoredBlob;
use casc_forge::HashKey;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::{Cursor, Read, Seek, SeekFrom};

fn payload() -> Vec<u8> {
    (0..1024 * 1024u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 27) as u8).collect()
}

fn bench_encode(c: &mut Criterion) {
    let data = payload();
    let zlib = [ChunkSpec::zlib(9).with_size(256 * 1024)];
    let stored = [ChunkSpec::stored().with_size(256 * 1024)];

    c.bench_function("blte_encode_1mb_zlib", |b| b.iter(|| blte::encode(black_box(&data), &zlib).unwrap()));
    c.bench_function("blte_encode_1mb_stored", |b| b.iter(|| blte::encode(black_box(&data), &stored).unwrap()));
}

fn bench_decode(c: &mut Criterion) {
    let data = payload();
    let framed = blte::encode(&data, &[ChunkSpec::zlib(9).with_size(256 * 1024)]).unwrap();

    c.bench_function("blte_decode_1mb", |b| b.iter(|| blte::decode(black_box(&framed.bytes)).unwrap()));

    c.bench_function("blte_seek_last_4k", |b| {
        b.iter(|| {
            let mut reader = BlteReader::new(Cursor::new(black_box(framed.bytes.clone()))).unwrap();
            reader.seek(SeekFrom::End(-4096)).unwrap();
            let mut tail = Vec::new();
            reader.read_to_end(&mut tail).unwrap();
            tail
        })
    });
}

fn bench_encoding_table(c: &mut Criterion) {
    let mut table = EncodingTable::new();
    for i in 0..10_000u32 {
        table.record(&StoredBlob {
            encoded_key:       HashKey::of(&(i | 0x8000_0000).to_le_bytes()),
            content_key:       HashKey::of(&i.to_le_bytes()),
            compressed_size:   1000 + i,
            decompressed_size: 4000 + i as u64,
            archive:           None,
            offset:            None,
            out_path:          None,
            path:              None,
            high_priority:     false,
        });
    }

    c.bench_function("encoding_sections_10k", |b| b.iter(|| black_box(&table).sections().unwrap()));
}

criterion_group!(benches, bench_encode, bench_decode, bench_encoding_table);
criterion_main!(benches);
