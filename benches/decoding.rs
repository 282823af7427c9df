use criterion::{criterion_group, criterion_main, Criterion};
use std::path::Path;

fn fixture(name: &str) -> Vec<u8> {
    std::fs::read(
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name),
    )
    .unwrap()
}

fn bench_decode_plain(c: &mut Criterion) {
    let raw = fixture("plain.eml");
    c.bench_function("decode_plain", |b| {
        b.iter(|| incoming_registry::parser::decode(&raw).unwrap())
    });
}

fn bench_decode_multipart(c: &mut Criterion) {
    let raw = fixture("attachment.eml");
    c.bench_function("decode_multipart_attachment", |b| {
        b.iter(|| incoming_registry::parser::decode(&raw).unwrap())
    });
}

fn bench_encoded_words(c: &mut Criterion) {
    c.bench_function("decode_encoded_words", |b| {
        b.iter(|| {
            incoming_registry::parser::header::decode_encoded_words(
                "=?UTF-8?B?0JjQstCw0L0g0J/QtdGC0YDQvtCy?= =?KOI8-R?B?8NLJ18XU?=",
            )
        })
    });
}

criterion_group!(benches, bench_decode_plain, bench_decode_multipart, bench_encoded_words);
criterion_main!(benches);
