//! Manifest parsing benchmarks
//!
//! Run with: cargo bench -p cachekit-manifest

use cachekit_manifest::ManifestParser;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use url::Url;

fn manifest_url() -> Url {
    Url::parse("https://example.com/app.manifest").unwrap()
}

fn parse_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_parsing");

    // Small manifest
    let small = "CACHE MANIFEST\n/app.js\n/style.css\nNETWORK:\n*\n";
    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_with_input(BenchmarkId::new("parse", "small"), small, |b, text| {
        b.iter(|| ManifestParser::parse(manifest_url(), text.as_bytes()))
    });

    // Medium manifest (100 entries)
    let medium = generate_manifest(100, 10);
    group.throughput(Throughput::Bytes(medium.len() as u64));
    group.bench_with_input(BenchmarkId::new("parse", "medium"), &medium, |b, text| {
        b.iter(|| ManifestParser::parse(manifest_url(), text.as_bytes()))
    });

    // Large manifest (1000 entries)
    let large = generate_manifest(1000, 50);
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_with_input(BenchmarkId::new("parse", "large"), &large, |b, text| {
        b.iter(|| ManifestParser::parse(manifest_url(), text.as_bytes()))
    });

    group.finish();
}

fn chunked_feed_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_chunked");

    let text = generate_manifest(500, 25);
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("feed_1k_chunks", |b| {
        let bytes = text.as_bytes();
        b.iter(|| {
            let mut parser = ManifestParser::new(manifest_url());
            let mut offset = 0;
            while offset < bytes.len() {
                let end = (offset + 1024).min(bytes.len());
                let consumed = parser.feed(&bytes[offset..end], end == bytes.len()).unwrap();
                offset += consumed;
            }
            parser.finish().unwrap()
        })
    });

    group.finish();
}

fn fallback_match_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("fallback_match");

    let text = generate_manifest(100, 50);
    let manifest = ManifestParser::parse(manifest_url(), text.as_bytes()).unwrap();
    let request = Url::parse("https://example.com/section25/deep/page.html").unwrap();

    group.bench_function("longest_prefix_50_namespaces", |b| {
        b.iter(|| manifest.match_fallback(&request))
    });

    group.finish();
}

fn generate_manifest(cache_entries: usize, fallbacks: usize) -> String {
    let mut text = String::from("CACHE MANIFEST\nCACHE:\n");
    for i in 0..cache_entries {
        text.push_str(&format!("/assets/resource{}.js\n", i));
    }
    text.push_str("FALLBACK:\n");
    for i in 0..fallbacks {
        text.push_str(&format!("/section{}/ /offline{}.html\n", i, i));
    }
    text
}

criterion_group!(
    benches,
    parse_benchmarks,
    chunked_feed_benchmarks,
    fallback_match_benchmarks,
);

criterion_main!(benches);
