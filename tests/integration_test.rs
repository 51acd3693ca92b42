use clpipe::driver::DeviceType;
use clpipe::emulator::reference::KernelMemory;
use clpipe::emulator::{DeviceSpec, EmulatedPlatform};
use clpipe::geometry::WorkItem;
use clpipe::prelude::*;
use clpipe::session::run_source;

fn first_gpu(platform: &EmulatedPlatform, config: &Config) -> clpipe::driver::DeviceId {
    let directory = enumerate(platform, config).unwrap();
    directory.select(config).unwrap().id
}

#[test]
fn test_end_to_end_grid() {
    let platform = EmulatedPlatform::standard();
    let config = Config::default();
    let grid = run(&platform, first_gpu(&platform, &config), &config).unwrap();

    assert_eq!(grid.cells().len(), 64);
    assert_eq!(grid.cells()[0], 0x0000);
    assert_eq!(grid.cells()[9], 0x0101);
    assert_eq!(grid.cells()[63], 0x0707);
    for j in 0..8 {
        for i in 0..8 {
            assert_eq!(grid.get(i, j), Some(((i as u32) << 8) | j as u32));
        }
    }
    assert_eq!(platform.live_resources(), 0);
    assert_eq!(platform.launches_executed(), 1);
}

#[test]
fn test_selection_prefers_available_gpu() {
    let platform = EmulatedPlatform::builder()
        .platform(
            "first",
            vec![
                DeviceSpec::new("cpu", DeviceType::Cpu),
                DeviceSpec::new("offline gpu", DeviceType::Gpu).unavailable(),
            ],
        )
        .platform("second", vec![DeviceSpec::new("online gpu", DeviceType::Gpu)])
        .build();
    let config = Config::default();
    let directory = enumerate(&platform, &config).unwrap();
    let device = directory.select(&config).unwrap();

    assert_eq!(device.name, "online gpu");
    assert_eq!((device.platform, device.index), (1, 0));
    assert!(run(&platform, device.id, &config).is_ok());
}

#[test]
fn test_indivisible_geometry_fails_dispatch() {
    let platform = EmulatedPlatform::standard();
    let config = Config::builder().local([3, 3]).build().unwrap();
    let err = run(&platform, first_gpu(&platform, &config), &config).unwrap_err();

    assert!(matches!(
        err,
        Error::Dispatch {
            status: Status::CL_INVALID_WORK_GROUP_SIZE
        }
    ));
    assert_eq!(platform.launches_executed(), 0);
    assert_eq!(platform.live_resources(), 0);
}

#[test]
fn test_oversized_work_group_fails_dispatch() {
    let platform = EmulatedPlatform::builder()
        .platform(
            "small",
            vec![DeviceSpec::new("tiny gpu", DeviceType::Gpu).max_work_group_size(2)],
        )
        .build();
    let config = Config::default();
    let err = run(&platform, first_gpu(&platform, &config), &config).unwrap_err();
    assert_eq!(err.status(), Some(Status::CL_INVALID_WORK_GROUP_SIZE));
}

#[test]
fn test_build_failure_carries_log() {
    let platform = EmulatedPlatform::standard();
    let config = Config::default();
    let source =
        KernelSource::new("__kernel void entry_point(__global int *C) {\n    C[0] = 1;\n").unwrap();
    let device = first_gpu(&platform, &config);
    let err = run_source(&platform, device, &config, &source).unwrap_err();

    match &err {
        Error::ProgramBuild {
            status,
            build_status,
            log,
            log_available,
        } => {
            assert_eq!(*status, Status::CL_BUILD_PROGRAM_FAILURE);
            assert_eq!(*build_status, clpipe::driver::BuildStatus::Error);
            assert!(!log.is_empty());
            assert!(log.len() <= config.build_log_capacity - 1);
            assert!(log.contains("error: expected '}'"));
            assert_eq!(log.len(), *log_available);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(platform.live_resources(), 0);
}

#[test]
fn test_build_log_is_bounded() {
    let platform = EmulatedPlatform::standard();
    let config = Config::builder().build_log_capacity(16).build().unwrap();
    let source =
        KernelSource::new("__kernel void entry_point(__global int *C) { ) ) ) ) }").unwrap();
    let device = first_gpu(&platform, &config);
    let err = run_source(&platform, device, &config, &source).unwrap_err();

    let log = err.build_log().unwrap();
    assert_eq!(log.len(), 15);
    assert!(log.starts_with("<source>:"));
    match err {
        Error::ProgramBuild { log_available, .. } => assert!(log_available > 15),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_entry_point() {
    let platform = EmulatedPlatform::standard();
    let config = Config::builder().entry_point("missing").build().unwrap();
    let err = run(&platform, first_gpu(&platform, &config), &config).unwrap_err();
    assert!(matches!(
        err,
        Error::KernelExtraction {
            status: Status::CL_INVALID_KERNEL_NAME
        }
    ));
}

fn fill_row_major(item: &WorkItem, mem: &mut KernelMemory<'_>) -> std::result::Result<(), Status> {
    let i = item.global_id(0);
    let j = item.global_id(1);
    mem.store_i32(0, i + 4 * j, (i * 10 + j) as i32)
}

#[test]
fn test_registered_kernel_runs() {
    let platform = EmulatedPlatform::builder()
        .platform("p", vec![DeviceSpec::new("gpu", DeviceType::Gpu)])
        .register_kernel("fill", 1, fill_row_major)
        .build();
    let config = Config::builder()
        .entry_point("fill")
        .global([4, 2])
        .local([2, 1])
        .build()
        .unwrap();
    let source = KernelSource::new(
        "__kernel void fill(__global int *out) {\n    \
         out[get_global_id(0) + 4 * get_global_id(1)] = 0;\n}\n",
    )
    .unwrap();
    let device = first_gpu(&platform, &config);
    let grid = run_source(&platform, device, &config, &source).unwrap();

    assert_eq!(grid.cells().to_vec(), vec![0u32, 10, 20, 30, 1, 11, 21, 31]);
}

#[test]
fn test_cpu_device_by_preference() {
    let platform = EmulatedPlatform::standard();
    let config = Config::builder().device_type(DeviceType::Cpu).build().unwrap();
    let directory = enumerate(&platform, &config).unwrap();
    let device = directory.select(&config).unwrap();

    assert_eq!(device.device_type, DeviceType::Cpu);
    let grid = run(&platform, device.id, &config).unwrap();
    assert!(grid.packed_index_mismatches().is_empty());
}

#[test]
fn test_color_sum_pipeline() {
    let platform = EmulatedPlatform::standard();
    let config = Config::default();
    let color = Color::new(0.25, 0.5, 1.0);
    let result = run_color_sum(&platform, first_gpu(&platform, &config), &config, color).unwrap();

    assert!((result.sum - 1.75).abs() < 1e-6);
    assert!(result.grid.packed_index_mismatches().is_empty());
    assert_eq!(platform.live_resources(), 0);
    assert_eq!(platform.launches_executed(), 1);
}

#[test]
fn test_packed_index_run_needs_square_grid() {
    let platform = EmulatedPlatform::standard();
    let config = Config::builder().global([16, 4]).build().unwrap();
    let err = run(&platform, first_gpu(&platform, &config), &config).unwrap_err();

    assert!(matches!(err, Error::Config(_)));
    assert_eq!(platform.launches_executed(), 0);
    assert!(platform.ledger().is_empty());
}
