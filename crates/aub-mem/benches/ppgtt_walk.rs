use std::time::Duration;

use aub_mem::{ppgtt_index, AddressSpace, PAGE_SIZE};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const ROOT: u64 = 0x100_0000;
const BASE: u64 = 0x0000_1000_0000_0000;
const PAGES: u64 = 512;

fn criterion_config() -> Criterion {
    match std::env::var("AUB_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30),
    }
}

fn write_pte(space: &mut AddressSpace, table: u64, index: usize, target: u64) {
    space
        .phys_write(table + index as u64 * 8, &(target | 3).to_le_bytes(), None)
        .unwrap();
}

/// One fully populated leaf table covering `PAGES` consecutive pages.
fn populated_space() -> AddressSpace {
    let mut space = AddressSpace::new();
    let (l3, l2, l1) = (ROOT + 0x1000, ROOT + 0x2000, ROOT + 0x3000);
    write_pte(&mut space, ROOT, ppgtt_index(BASE, 4), l3);
    write_pte(&mut space, l3, ppgtt_index(BASE, 3), l2);
    write_pte(&mut space, l2, ppgtt_index(BASE, 2), l1);
    for page in 0..PAGES {
        let virt = BASE + page * PAGE_SIZE;
        let phys = 0x4000_0000 + page * PAGE_SIZE;
        write_pte(&mut space, l1, ppgtt_index(virt, 1), phys);
        space.phys_write(phys, &[page as u8; 64], None).unwrap();
    }
    space.set_ppgtt_root(ROOT);
    space
}

fn bench_translate(c: &mut Criterion) {
    let space = populated_space();
    let mut group = c.benchmark_group("ppgtt");
    group.throughput(Throughput::Elements(PAGES));
    group.bench_function("translate_512_pages", |b| {
        b.iter(|| {
            for page in 0..PAGES {
                black_box(space.ppgtt_translate(ROOT, black_box(BASE + page * PAGE_SIZE)));
            }
        })
    });
    group.finish();
}

fn bench_region(c: &mut Criterion) {
    let mut space = populated_space();
    c.bench_function("ppgtt/region_512_pages", |b| {
        b.iter(|| {
            let size = space.ppgtt_region(black_box(BASE)).map(|r| r.size());
            space.clear_ephemeral_maps();
            black_box(size)
        })
    });
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_translate, bench_region
}
criterion_main!(benches);
