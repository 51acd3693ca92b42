//! Compute session: the single-shot, single-device dispatch pipeline.
//!
//! A [`Session`] walks a fixed state machine:
//!
//! ```text
//! Uninitialized → ContextReady → QueueReady → BufferReady → ProgramBuilt
//!   → KernelReady → ArgsBound → Dispatched → ResultsRead → Released
//! ```
//!
//! Each step acquires at most one native resource. A failing step releases
//! everything acquired so far in reverse creation order and leaves the session
//! in `Failed`. Release is tied to ownership, so an early return or a dropped
//! session tears down the same way.
//!
//! Kernels with more than one argument are bound in `KernelReady` or
//! `ArgsBound`: the result buffer with [`Session::bind_output`], by-value
//! arguments with [`Session::bind_value`], and extra read-write buffers with
//! [`Session::bind_scratch`].

use crate::config::{Config, MIN_BUILD_LOG_CAPACITY};
use crate::driver::{
    BuildStatus, ContextId, DeviceId, Driver, KernelId, MemAccess, MemId, Owned, ProgramId,
    QueueId,
};
use crate::error::{Error, Result};
use crate::geometry::WorkSpace;
use crate::kernel::{Color, KernelSource, ResultGrid, GRID_DIM};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    ContextReady,
    QueueReady,
    BufferReady,
    ProgramBuilt,
    KernelReady,
    ArgsBound,
    Dispatched,
    ResultsRead,
    Released,
    Failed,
}

/// Shape of the device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub element_count: usize,
    pub element_size: usize,
}

impl BufferLayout {
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count.checked_mul(self.element_size)
    }
}

/// A read-write buffer bound as a kernel argument next to the result buffer.
struct Scratch<'d> {
    buffer: Owned<'d, MemId>,
    size: usize,
}

/// Exclusive owner of one device's context and everything created in it.
pub struct Session<'d> {
    driver: &'d dyn Driver,
    device: DeviceId,
    state: SessionState,
    log_capacity: usize,
    layout: Option<BufferLayout>,

    // Teardown order is scratch buffers (newest first), kernel, program,
    // buffer, queue, context.
    scratch: Vec<Scratch<'d>>,
    kernel: Option<Owned<'d, KernelId>>,
    program: Option<Owned<'d, ProgramId>>,
    buffer: Option<Owned<'d, MemId>>,
    queue: Option<Owned<'d, QueueId>>,
    context: Option<Owned<'d, ContextId>>,
}

impl<'d> Session<'d> {
    /// Bind a new context to `device`.
    pub fn open(driver: &'d dyn Driver, device: DeviceId) -> Result<Self> {
        let context = driver
            .create_context(device)
            .map_err(|status| Error::ContextCreation { status })?;
        info!(backend = driver.backend_name(), device = ?device, "context created");

        Ok(Self {
            driver,
            device,
            state: SessionState::ContextReady,
            log_capacity: Config::default().build_log_capacity,
            layout: None,
            scratch: Vec::new(),
            kernel: None,
            program: None,
            buffer: None,
            queue: None,
            context: Some(Owned::new(driver, context)),
        })
    }

    /// Cap on the build log attached to a build failure, terminator included.
    ///
    /// A capacity below [`MIN_BUILD_LOG_CAPACITY`] could only ever yield an
    /// empty log and is rejected.
    pub fn with_log_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity < MIN_BUILD_LOG_CAPACITY {
            return Err(Error::config(format!(
                "build log capacity must be >= {}, got {}",
                MIN_BUILD_LOG_CAPACITY, capacity
            )));
        }
        self.log_capacity = capacity;
        Ok(self)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn create_queue(&mut self) -> Result<()> {
        self.expect(SessionState::ContextReady)?;
        let context = self.context_handle()?;
        match self.driver.create_queue(context, self.device) {
            Ok(queue) => {
                self.queue = Some(Owned::new(self.driver, queue));
                self.advance(SessionState::QueueReady);
                Ok(())
            }
            Err(status) => Err(self.fail(Error::QueueCreation { status })),
        }
    }

    /// Allocate the write-only result buffer.
    pub fn allocate(&mut self, element_count: usize, element_size: usize) -> Result<()> {
        self.expect(SessionState::QueueReady)?;
        let context = self.context_handle()?;
        let layout = BufferLayout {
            element_count,
            element_size,
        };
        // An unrepresentable size goes to the platform as 0, which it rejects.
        let size = layout.byte_len().unwrap_or(0);

        match self.driver.create_buffer(context, MemAccess::WriteOnly, size) {
            Ok(buffer) => {
                self.buffer = Some(Owned::new(self.driver, buffer));
                self.layout = Some(layout);
                self.advance(SessionState::BufferReady);
                Ok(())
            }
            Err(status) => Err(self.fail(Error::BufferAllocation { status })),
        }
    }

    pub fn build(&mut self, source: &KernelSource) -> Result<()> {
        self.build_with_options(source, "")
    }

    /// Submit `source` and compile it for the bound device.
    pub fn build_with_options(&mut self, source: &KernelSource, options: &str) -> Result<()> {
        self.expect(SessionState::BufferReady)?;
        let context = self.context_handle()?;

        let program = match self.driver.create_program(
            context,
            source.as_bytes_with_nul(),
            source.submitted_len(),
        ) {
            Ok(program) => program,
            Err(status) => return Err(self.fail(Error::ProgramCreation { status })),
        };
        self.program = Some(Owned::new(self.driver, program));

        if let Err(status) = self.driver.build_program(program, self.device, options) {
            let build_status = self
                .driver
                .build_status(program, self.device)
                .unwrap_or(BuildStatus::Unknown);
            let log = self
                .driver
                .build_log(program, self.device, self.log_capacity);
            let (log, log_available) = match log {
                Ok(text) => {
                    let available = text.available();
                    (text.into_string(), available)
                }
                Err(log_status) => {
                    warn!(status = %log_status, "build log unavailable");
                    (String::new(), 0)
                }
            };
            return Err(self.fail(Error::ProgramBuild {
                status,
                build_status,
                log,
                log_available,
            }));
        }

        debug!(bytes = source.submitted_len(), "program built");
        self.advance(SessionState::ProgramBuilt);
        Ok(())
    }

    /// Extract entry point `name` from the built program.
    pub fn extract_kernel(&mut self, name: &str) -> Result<()> {
        self.expect(SessionState::ProgramBuilt)?;
        let program = match &self.program {
            Some(program) => program.handle(),
            None => return Err(self.stage_error(SessionState::ProgramBuilt)),
        };
        match self.driver.create_kernel(program, name) {
            Ok(kernel) => {
                self.kernel = Some(Owned::new(self.driver, kernel));
                self.advance(SessionState::KernelReady);
                Ok(())
            }
            Err(status) => Err(self.fail(Error::KernelExtraction { status })),
        }
    }

    /// Bind the result buffer as kernel argument `index`.
    pub fn bind_output(&mut self, index: u32) -> Result<()> {
        self.expect_binding()?;
        let (kernel, buffer) = match (&self.kernel, &self.buffer) {
            (Some(kernel), Some(buffer)) => (kernel.handle(), buffer.handle()),
            _ => return Err(self.stage_error(SessionState::KernelReady)),
        };
        match self.driver.set_kernel_arg_buffer(kernel, index, buffer) {
            Ok(()) => {
                self.advance(SessionState::ArgsBound);
                Ok(())
            }
            Err(status) => Err(self.fail(Error::ArgumentBinding { status })),
        }
    }

    /// Bind a copy of `value` as by-value argument `index`, e.g. the bytes of
    /// a `#[repr(C)]` struct.
    pub fn bind_value(&mut self, index: u32, value: &[u8]) -> Result<()> {
        self.expect_binding()?;
        let kernel = self.kernel_handle()?;
        match self.driver.set_kernel_arg_bytes(kernel, index, value) {
            Ok(()) => {
                self.advance(SessionState::ArgsBound);
                Ok(())
            }
            Err(status) => Err(self.fail(Error::ArgumentBinding { status })),
        }
    }

    /// Allocate a read-write buffer of `size` bytes and bind it as argument
    /// `index`. Returns the slot to pass to [`Session::read_scratch`].
    pub fn bind_scratch(&mut self, index: u32, size: usize) -> Result<usize> {
        self.expect_binding()?;
        let context = self.context_handle()?;
        let kernel = self.kernel_handle()?;

        let buffer = match self.driver.create_buffer(context, MemAccess::ReadWrite, size) {
            Ok(buffer) => buffer,
            Err(status) => return Err(self.fail(Error::BufferAllocation { status })),
        };
        self.scratch.push(Scratch {
            buffer: Owned::new(self.driver, buffer),
            size,
        });

        match self.driver.set_kernel_arg_buffer(kernel, index, buffer) {
            Ok(()) => {
                self.advance(SessionState::ArgsBound);
                Ok(self.scratch.len() - 1)
            }
            Err(status) => Err(self.fail(Error::ArgumentBinding { status })),
        }
    }

    /// Submit the kernel over `space`. Returns once the launch is queued.
    pub fn dispatch(&mut self, space: &WorkSpace) -> Result<()> {
        self.expect(SessionState::ArgsBound)?;
        let (queue, kernel) = match (&self.queue, &self.kernel) {
            (Some(queue), Some(kernel)) => (queue.handle(), kernel.handle()),
            _ => return Err(self.stage_error(SessionState::ArgsBound)),
        };
        if !space.divides_evenly() {
            debug!(
                global = ?space.global(),
                local = ?space.local(),
                "work groups do not tile the index space"
            );
        }
        match self
            .driver
            .enqueue_nd_range(queue, kernel, space.global(), Some(space.local()))
        {
            Ok(()) => {
                self.advance(SessionState::Dispatched);
                Ok(())
            }
            Err(status) => Err(self.fail(Error::Dispatch { status })),
        }
    }

    /// Blocking read of the whole buffer. Waits for the dispatch to finish.
    pub fn read_results(&mut self) -> Result<Vec<u8>> {
        self.expect(SessionState::Dispatched)?;
        let (queue, buffer) = match (&self.queue, &self.buffer) {
            (Some(queue), Some(buffer)) => (queue.handle(), buffer.handle()),
            _ => return Err(self.stage_error(SessionState::Dispatched)),
        };
        let len = self.layout.and_then(|l| l.byte_len()).unwrap_or(0);
        let mut host = vec![0u8; len];

        match self.driver.enqueue_read_buffer(queue, buffer, 0, &mut host) {
            Ok(()) => {
                self.advance(SessionState::ResultsRead);
                Ok(host)
            }
            Err(status) => Err(self.fail(Error::Readback { status })),
        }
    }

    /// Blocking read of the scratch buffer in `slot`, once results are read.
    pub fn read_scratch(&mut self, slot: usize) -> Result<Vec<u8>> {
        self.expect(SessionState::ResultsRead)?;
        let queue = match &self.queue {
            Some(queue) => queue.handle(),
            None => return Err(self.stage_error(SessionState::ResultsRead)),
        };
        let (buffer, size) = match self.scratch.get(slot) {
            Some(scratch) => (scratch.buffer.handle(), scratch.size),
            None => return Err(Error::config(format!("no scratch buffer in slot {}", slot))),
        };
        let mut host = vec![0u8; size];

        match self.driver.enqueue_read_buffer(queue, buffer, 0, &mut host) {
            Ok(()) => Ok(host),
            Err(status) => Err(self.fail(Error::Readback { status })),
        }
    }

    /// [`Session::read_results`], decoded as native-endian 32-bit cells.
    pub fn read_u32(&mut self) -> Result<Vec<u32>> {
        let bytes = self.read_results()?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Drain the queue, then release every resource in reverse order.
    pub fn release(mut self) {
        if let Some(queue) = &self.queue {
            let queue = queue.handle();
            if let Err(status) = self.driver.flush(queue) {
                warn!(%status, "flush before release failed");
            }
            if let Err(status) = self.driver.finish(queue) {
                warn!(%status, "finish before release failed");
            }
        }
        self.teardown();
        self.state = SessionState::Released;
        info!("session released");
    }

    fn expect(&self, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.stage_error(expected))
        }
    }

    fn expect_binding(&self) -> Result<()> {
        match self.state {
            SessionState::KernelReady | SessionState::ArgsBound => Ok(()),
            _ => Err(self.stage_error(SessionState::KernelReady)),
        }
    }

    fn stage_error(&self, expected: SessionState) -> Error {
        Error::Stage {
            expected,
            actual: self.state,
        }
    }

    fn context_handle(&self) -> Result<ContextId> {
        self.context
            .as_ref()
            .map(|c| c.handle())
            .ok_or_else(|| self.stage_error(self.state))
    }

    fn kernel_handle(&self) -> Result<KernelId> {
        self.kernel
            .as_ref()
            .map(|k| k.handle())
            .ok_or_else(|| self.stage_error(SessionState::KernelReady))
    }

    fn advance(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session advanced");
        self.state = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        warn!(stage = err.stage(), error = %err, "session stage failed");
        self.teardown();
        self.state = SessionState::Failed;
        err
    }

    /// Release whatever is still held. Taking each slot makes a second call
    /// a no-op.
    fn teardown(&mut self) {
        let mut releases: Vec<_> = self
            .scratch
            .drain(..)
            .rev()
            .map(|scratch| scratch.buffer.release())
            .collect();
        releases.extend(
            [
                self.kernel.take().map(Owned::release),
                self.program.take().map(Owned::release),
                self.buffer.take().map(Owned::release),
                self.queue.take().map(Owned::release),
                self.context.take().map(Owned::release),
            ]
            .into_iter()
            .flatten(),
        );
        for status in releases.into_iter().filter_map(|r| r.err()) {
            warn!(%status, "release failed");
        }
    }
}

impl<'d> Drop for Session<'d> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<'d> std::fmt::Debug for Session<'d> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.driver.backend_name())
            .field("device", &self.device)
            .field("state", &self.state)
            .finish()
    }
}

/// Run the packed-index pipeline on `device` and return the result grid.
///
/// The kernel's row stride is fixed, so the global extent must be the
/// `GRID_DIM` by `GRID_DIM` grid.
pub fn run(driver: &dyn Driver, device: DeviceId, config: &Config) -> Result<ResultGrid> {
    require_packed_grid(config)?;
    run_source(driver, device, config, &KernelSource::packed_index())
}

/// Run an arbitrary single-output kernel through every session stage.
///
/// The result buffer holds one 32-bit cell per work item and is read back as
/// a `global[0]` by `global[1]` grid.
pub fn run_source(
    driver: &dyn Driver,
    device: DeviceId,
    config: &Config,
    source: &KernelSource,
) -> Result<ResultGrid> {
    let (mut session, space) = prepare(driver, device, config, source)?;
    session.dispatch(&space)?;
    let cells = session.read_u32()?;
    session.release();

    ResultGrid::new(config.global[0], config.global[1], cells)
}

/// Result of the color-sum pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorRun {
    pub grid: ResultGrid,
    /// `c.r + c.g + c.b` as computed on the device.
    pub sum: f32,
}

/// Run the packed-index kernel that also takes `color` by value and writes
/// the sum of its channels to a second buffer.
pub fn run_color_sum(
    driver: &dyn Driver,
    device: DeviceId,
    config: &Config,
    color: Color,
) -> Result<ColorRun> {
    require_packed_grid(config)?;
    let (mut session, space) = prepare(driver, device, config, &KernelSource::color_sum())?;
    session.bind_value(1, &color.to_ne_bytes())?;
    let out = session.bind_scratch(2, std::mem::size_of::<f32>())?;
    session.dispatch(&space)?;
    let cells = session.read_u32()?;
    let out = session.read_scratch(out)?;
    session.release();

    let mut sum = [0u8; 4];
    sum.copy_from_slice(&out[..4]);
    Ok(ColorRun {
        grid: ResultGrid::new(GRID_DIM, GRID_DIM, cells)?,
        sum: f32::from_ne_bytes(sum),
    })
}

fn require_packed_grid(config: &Config) -> Result<()> {
    if config.global != [GRID_DIM, GRID_DIM] {
        return Err(Error::config(format!(
            "the packed-index kernel covers a {0}x{0} grid, got global {1:?}",
            GRID_DIM, config.global
        )));
    }
    Ok(())
}

/// Walk a session up to `ArgsBound` with the result buffer as argument 0.
fn prepare<'d>(
    driver: &'d dyn Driver,
    device: DeviceId,
    config: &Config,
    source: &KernelSource,
) -> Result<(Session<'d>, WorkSpace)> {
    config.validate()?;
    let space = config.work_space()?;

    let mut session = Session::open(driver, device)?.with_log_capacity(config.build_log_capacity)?;
    session.create_queue()?;
    session.allocate(space.work_items(), std::mem::size_of::<u32>())?;
    session.build_with_options(source, &config.build_options)?;
    session.extract_kernel(&config.entry_point)?;
    session.bind_output(0)?;
    Ok((session, space))
}
