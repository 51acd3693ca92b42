use clpipe::driver::{BuildStatus, DeviceId, DeviceType, Driver, ResourceKind};
use clpipe::emulator::{Call, EmulatedPlatform, LedgerAction};
use clpipe::prelude::*;
use clpipe::session::run_source;
use ResourceKind::{Buffer, Context, Kernel, Program, Queue};

fn gpu(platform: &EmulatedPlatform) -> DeviceId {
    let p = platform.platform_ids().unwrap()[0];
    platform.device_ids(p, DeviceType::Gpu).unwrap()[0]
}

fn assert_clean(platform: &EmulatedPlatform) {
    assert_eq!(platform.live_resources(), 0);
    assert!(platform
        .ledger()
        .iter()
        .all(|e| e.action != LedgerAction::InvalidRelease));
}

/// Fail `call` and check what was released, in order.
fn check_stage(call: Call, expected_stage: &str, released: &[ResourceKind]) {
    let platform = EmulatedPlatform::standard();
    let device = gpu(&platform);
    platform.inject(call, Status::CL_OUT_OF_RESOURCES);

    let err = run(&platform, device, &Config::default()).unwrap_err();
    assert_eq!(err.stage(), expected_stage, "failing {:?}", call);
    assert_eq!(platform.releases(), released, "failing {:?}", call);
    assert_clean(&platform);
}

#[test]
fn test_context_failure_releases_nothing() {
    check_stage(Call::CreateContext, "context creation", &[]);
}

#[test]
fn test_queue_failure() {
    check_stage(Call::CreateQueue, "queue creation", &[Context]);
}

#[test]
fn test_buffer_failure() {
    check_stage(Call::CreateBuffer, "buffer allocation", &[Queue, Context]);
}

#[test]
fn test_program_creation_failure() {
    check_stage(Call::CreateProgram, "program creation", &[Buffer, Queue, Context]);
}

#[test]
fn test_build_failure() {
    check_stage(
        Call::BuildProgram,
        "program build",
        &[Program, Buffer, Queue, Context],
    );
}

#[test]
fn test_kernel_failure() {
    check_stage(
        Call::CreateKernel,
        "kernel extraction",
        &[Program, Buffer, Queue, Context],
    );
}

#[test]
fn test_argument_failure() {
    check_stage(
        Call::SetKernelArg,
        "argument binding",
        &[Kernel, Program, Buffer, Queue, Context],
    );
}

#[test]
fn test_dispatch_failure() {
    check_stage(
        Call::EnqueueNdRange,
        "dispatch",
        &[Kernel, Program, Buffer, Queue, Context],
    );
}

#[test]
fn test_readback_failure() {
    check_stage(
        Call::EnqueueRead,
        "readback",
        &[Kernel, Program, Buffer, Queue, Context],
    );
}

#[test]
fn test_sync_failure_still_releases_everything() {
    let platform = EmulatedPlatform::standard();
    let device = gpu(&platform);
    platform.inject(Call::Flush, Status::CL_OUT_OF_RESOURCES);
    platform.inject(Call::Finish, Status::CL_OUT_OF_RESOURCES);

    let grid = run(&platform, device, &Config::default()).unwrap();
    assert_eq!(grid.cells()[63], 0x0707);
    assert_eq!(
        platform.releases(),
        vec![Kernel, Program, Buffer, Queue, Context]
    );
    assert_clean(&platform);
}

#[test]
fn test_abandoned_session_releases_on_drop() {
    let platform = EmulatedPlatform::standard();
    let device = gpu(&platform);
    {
        let mut session = Session::open(&platform, device).unwrap();
        session.create_queue().unwrap();
        session.allocate(64, 4).unwrap();
        session.build(&KernelSource::packed_index()).unwrap();
        session.extract_kernel("entry_point").unwrap();
        assert_eq!(session.state(), SessionState::KernelReady);
        assert_eq!(platform.live_resources(), 5);
    }
    assert_eq!(
        platform.releases(),
        vec![Kernel, Program, Buffer, Queue, Context]
    );
    assert_clean(&platform);
}

#[test]
fn test_each_resource_released_once() {
    let platform = EmulatedPlatform::standard();
    let device = gpu(&platform);
    run(&platform, device, &Config::default()).unwrap();

    let ledger = platform.ledger();
    let created = ledger
        .iter()
        .filter(|e| e.action == LedgerAction::Created)
        .count();
    let released = ledger
        .iter()
        .filter(|e| e.action == LedgerAction::Released)
        .count();
    assert_eq!(created, 5);
    assert_eq!(released, 5);
    for event in ledger.iter().filter(|e| e.action == LedgerAction::Created) {
        let releases = ledger
            .iter()
            .filter(|e| e.action == LedgerAction::Released && e.id == event.id)
            .count();
        assert_eq!(releases, 1, "{:?} released {} times", event.kind, releases);
    }
}

#[test]
fn test_failed_session_state_is_terminal() {
    let platform = EmulatedPlatform::standard();
    let device = gpu(&platform);
    platform.inject(Call::CreateKernel, Status::CL_OUT_OF_HOST_MEMORY);

    let mut session = Session::open(&platform, device).unwrap();
    session.create_queue().unwrap();
    session.allocate(64, 4).unwrap();
    session.build(&KernelSource::packed_index()).unwrap();
    assert!(session.extract_kernel("entry_point").is_err());
    assert_eq!(session.state(), SessionState::Failed);

    platform.clear_faults();
    assert!(matches!(
        session.extract_kernel("entry_point"),
        Err(Error::Stage { .. })
    ));
    session.release();
    assert_eq!(
        platform.releases(),
        vec![Program, Buffer, Queue, Context]
    );
    assert_clean(&platform);
}

#[test]
fn test_build_failure_without_log_still_releases() {
    let platform = EmulatedPlatform::standard();
    let device = gpu(&platform);
    platform.inject(Call::BuildLog, Status::CL_OUT_OF_HOST_MEMORY);
    let source = KernelSource::new("__kernel void entry_point(__global int *C) {").unwrap();

    let err = run_source(&platform, device, &Config::default(), &source).unwrap_err();
    match err {
        Error::ProgramBuild {
            status,
            build_status,
            log,
            log_available,
        } => {
            assert_eq!(status, Status::CL_BUILD_PROGRAM_FAILURE);
            assert_eq!(build_status, BuildStatus::Error);
            assert!(log.is_empty());
            assert_eq!(log_available, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(platform.releases(), vec![Program, Buffer, Queue, Context]);
    assert_clean(&platform);
}

#[test]
fn test_scratch_failure_releases_bound_kernel() {
    let platform = EmulatedPlatform::standard();
    let device = gpu(&platform);
    let mut session = Session::open(&platform, device).unwrap();
    session.create_queue().unwrap();
    session.allocate(64, 4).unwrap();
    session.build(&KernelSource::color_sum()).unwrap();
    session.extract_kernel("entry_point").unwrap();
    session.bind_output(0).unwrap();
    session.bind_value(1, &Color::new(1.0, 2.0, 3.0).to_ne_bytes()).unwrap();

    platform.inject(Call::CreateBuffer, Status::CL_OUT_OF_RESOURCES);
    let err = session.bind_scratch(2, 4).unwrap_err();
    assert_eq!(err.stage(), "buffer allocation");
    assert_eq!(session.state(), SessionState::Failed);
    session.release();

    assert_eq!(
        platform.releases(),
        vec![Kernel, Program, Buffer, Queue, Context]
    );
    assert_clean(&platform);
}
