//! Throughput of the SSD matcher inner loop.

use criterion::{criterion_group, criterion_main, Criterion};

use parallax_engine::params::{BackMatchingParameters, MatchingParameters};
use parallax_engine::process::bands::BandPool;
use parallax_engine::process::matching::BlockMatcher;
use parallax_engine::GrayImage;

fn shifted_pair(width: usize, height: usize, shift: usize) -> (GrayImage, GrayImage) {
    let mut reference = GrayImage::new(width, height);
    let mut compare = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            reference.data[y * width + x] = ((x * 3 + y * 5) % 251) as u8;
            let sx = x.saturating_sub(shift);
            compare.data[y * width + x] = ((sx * 3 + y * 5) % 251) as u8;
        }
    }
    (reference, compare)
}

fn bench_matching(c: &mut Criterion) {
    let params = MatchingParameters {
        img_h: 128,
        img_w: 256,
        depth: 64,
        blk_h: 4,
        blk_w: 4,
        mtc_h: 4,
        mtc_w: 4,
        blk_ofs_x: 0,
        blk_ofs_y: 0,
        crst_thr: 0,
    };
    let cells = (params.img_h / params.blk_h) * (params.img_w / params.blk_w);
    let (reference, compare) = shifted_pair(params.img_w, params.img_h, 9);

    let mut group = c.benchmark_group("matching");
    for bands in [1usize, 4] {
        let pool = BandPool::new(bands);
        let back = BackMatchingParameters {
            enabled: false,
            ..BackMatchingParameters::default()
        };
        let mut matcher = BlockMatcher::new(params, back, 1200, cells);
        group.bench_function(format!("ssd_256x128_bands{bands}"), |b| {
            b.iter(|| matcher.compute(&reference, &compare, &pool));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_matching);
criterion_main!(benches);
