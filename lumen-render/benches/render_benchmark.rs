//! Benchmarks for lumen-render decode and pixel conversion.

use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{DynamicImage, ImageFormat, RgbaImage};
use lumen_render::decode::{decode, ChannelPolicy};
use lumen_render::texture::rgb_to_rgba;

fn encoded_png(size: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(size, size, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, ((x ^ y) % 256) as u8, 255])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_png");
    for &size in &[64u32, 256, 1024] {
        let bytes = encoded_png(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| {
                black_box(decode(black_box(bytes), Some("image/png"), ChannelPolicy::Native).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_rgb_expand(c: &mut Criterion) {
    let pixels = vec![127u8; 1024 * 1024 * 3];
    c.bench_function("rgb_to_rgba_1MP", |b| {
        b.iter(|| black_box(rgb_to_rgba(black_box(&pixels))));
    });
}

criterion_group!(benches, bench_decode, bench_rgb_expand);
criterion_main!(benches);
