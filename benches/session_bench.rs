//! Benchmarks for enumeration and full sessions on the software platform

use clpipe::driver::DeviceType;
use clpipe::emulator::compiler;
use clpipe::emulator::{DeviceSpec, EmulatedPlatform};
use clpipe::kernel::PACKED_INDEX_SOURCE;
use clpipe::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn platform_with(devices: usize) -> EmulatedPlatform {
    let specs = (0..devices)
        .map(|i| DeviceSpec::new(format!("gpu {}", i), DeviceType::Gpu))
        .collect();
    EmulatedPlatform::builder().platform("bench", specs).build()
}

fn bench_enumerate(c: &mut Criterion) {
    let config = Config::default();
    let mut group = c.benchmark_group("enumerate");

    for devices in [1, 8, 64].iter() {
        let platform = platform_with(*devices);
        group.bench_with_input(BenchmarkId::new("devices", devices), devices, |b, _| {
            b.iter(|| enumerate(black_box(&platform), &config).expect("enumerate"))
        });
    }

    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("session");

    let platform = platform_with(1);
    for local in [1usize, 2, 4, 8].iter() {
        let config = Config::builder()
            .local([*local, *local])
            .build()
            .expect("config");
        let directory = enumerate(&platform, &config).expect("enumerate");
        let device = directory.select(&config).expect("device").id;

        group.bench_with_input(BenchmarkId::new("work_group", local), local, |b, _| {
            b.iter(|| run(&platform, device, black_box(&config)).expect("run"))
        });
    }

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_packed_index", |b| {
        b.iter(|| compiler::compile(black_box(PACKED_INDEX_SOURCE)).expect("compile"))
    });
}

criterion_group!(benches, bench_enumerate, bench_session, bench_compile);
criterion_main!(benches);
