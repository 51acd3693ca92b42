//! Deterministic in-process compute platform.
//!
//! [`EmulatedPlatform`] implements [`Driver`] without any hardware. Devices
//! are declared up front, programs go through a small front-end compiler
//! ([`compiler`]), and entry points run as host reference implementations
//! ([`reference`]). Every create and release is written to a ledger, and any
//! driver call can be made to fail with a chosen status, which is what the
//! teardown tests are built on.

pub mod compiler;
pub mod reference;

use crate::bounded::BoundedText;
use crate::driver::{
    BuildStatus, ContextId, DeviceId, DeviceType, Driver, KernelId, MemAccess, MemId, PlatformId,
    ProgramId, QueueId, ResourceKind,
};
use crate::geometry::{divides_evenly, extent_product, for_each_work_item, MAX_DIMS};
use crate::status::Status;
use compiler::{AddressSpace, CompiledProgram, Param};
use parking_lot::Mutex;
use reference::{KernelFn, KernelMemory, ReferenceKernel, Registry};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// Byte pattern of a freshly allocated buffer.
pub const FRESH_FILL: u8 = 0xCD;

/// Largest single allocation the platform accepts.
pub const MAX_ALLOC_SIZE: usize = 256 * 1024 * 1024;

/// Released buffers whose final contents stay inspectable.
const RETAINED_BUFFERS: usize = 8;

/// A device offered by the software platform.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub device_type: DeviceType,
    pub available: bool,
    pub max_work_group_size: usize,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            device_type,
            available: true,
            max_work_group_size: 256,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PlatformSpec {
    pub name: String,
    pub devices: Vec<DeviceSpec>,
}

/// A driver call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    PlatformIds,
    DeviceIds,
    DeviceType,
    DeviceAvailable,
    DeviceName,
    CreateContext,
    CreateQueue,
    CreateBuffer,
    CreateProgram,
    BuildProgram,
    BuildStatus,
    BuildLog,
    CreateKernel,
    /// Binding of either a buffer or a by-value argument.
    SetKernelArg,
    EnqueueNdRange,
    EnqueueRead,
    Flush,
    Finish,
}

/// What an injected fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    Any,
    /// Calls made on behalf of a platform, by enumeration index.
    Platform(usize),
    /// Calls about one device, by `(platform, device)` enumeration index.
    Device(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fault {
    call: Call,
    target: FaultTarget,
    status: Status,
}

/// Whether a ledger entry records an acquisition or a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    Created,
    Released,
    /// Release of a handle that was not live.
    InvalidRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEvent {
    pub action: LedgerAction,
    pub kind: ResourceKind,
    pub id: u64,
}

#[derive(Debug)]
struct DeviceEntry {
    platform: usize,
    index: usize,
    spec: DeviceSpec,
}

#[derive(Debug)]
struct ContextObj {
    device: u64,
}

#[derive(Debug)]
struct QueueObj {
    context: u64,
    pending: VecDeque<Launch>,
}

#[derive(Debug)]
struct BufferObj {
    context: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
struct BuildRecord {
    status: BuildStatus,
    log: String,
    program: Option<CompiledProgram>,
}

#[derive(Debug)]
struct ProgramObj {
    context: u64,
    source: String,
    builds: HashMap<u64, BuildRecord>,
}

/// What a kernel argument is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgValue {
    Buffer(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
struct KernelObj {
    program: u64,
    context: u64,
    name: String,
    params: Vec<Param>,
    reference: ReferenceKernel,
    args: Vec<Option<ArgValue>>,
}

#[derive(Debug)]
struct Launch {
    name: String,
    reference: ReferenceKernel,
    args: Vec<ArgValue>,
    global: Vec<usize>,
    local: Vec<usize>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    contexts: HashMap<u64, ContextObj>,
    queues: HashMap<u64, QueueObj>,
    buffers: HashMap<u64, BufferObj>,
    programs: HashMap<u64, ProgramObj>,
    kernels: HashMap<u64, KernelObj>,
    retained: VecDeque<(u64, Vec<u8>)>,
    ledger: Vec<LedgerEvent>,
    launches_executed: usize,
}

impl State {
    fn allocate_id(&mut self, kind: ResourceKind) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.ledger.push(LedgerEvent {
            action: LedgerAction::Created,
            kind,
            id,
        });
        id
    }

    fn record_release(&mut self, kind: ResourceKind, id: u64, found: bool) -> Result<(), Status> {
        let action = if found {
            LedgerAction::Released
        } else {
            LedgerAction::InvalidRelease
        };
        self.ledger.push(LedgerEvent { action, kind, id });
        if found {
            return Ok(());
        }
        Err(match kind {
            ResourceKind::Context => Status::CL_INVALID_CONTEXT,
            ResourceKind::Queue => Status::CL_INVALID_COMMAND_QUEUE,
            ResourceKind::Buffer => Status::CL_INVALID_MEM_OBJECT,
            ResourceKind::Program => Status::CL_INVALID_PROGRAM,
            ResourceKind::Kernel => Status::CL_INVALID_KERNEL,
        })
    }

    /// Run every launch queued on `queue`, oldest first.
    fn drain(&mut self, queue: u64) -> Result<(), Status> {
        loop {
            let launch = match self.queues.get_mut(&queue) {
                Some(q) => q.pending.pop_front(),
                None => return Err(Status::CL_INVALID_COMMAND_QUEUE),
            };
            let Some(launch) = launch else {
                return Ok(());
            };
            if let Err(status) = self.execute(&launch) {
                warn!(kernel = %launch.name, %status, "launch failed");
                if let Some(q) = self.queues.get_mut(&queue) {
                    q.pending.clear();
                }
                return Err(Status::CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
            }
        }
    }

    fn execute(&mut self, launch: &Launch) -> Result<(), Status> {
        let mut slots = Vec::with_capacity(launch.args.len());
        for arg in &launch.args {
            let slot = match arg {
                ArgValue::Bytes(bytes) => bytes.clone(),
                ArgValue::Buffer(id) => match self.buffers.get_mut(id) {
                    Some(buffer) => std::mem::take(&mut buffer.data),
                    None => {
                        self.restore(&launch.args, slots);
                        return Err(Status::CL_INVALID_MEM_OBJECT);
                    }
                },
            };
            slots.push(slot);
        }

        let body: KernelFn = launch.reference.body;
        let result = {
            let mut mem = KernelMemory::new(&mut slots);
            for_each_work_item(&launch.global, &launch.local, |item| body(item, &mut mem))
        };
        self.restore(&launch.args, slots);

        if result.is_ok() {
            self.launches_executed += 1;
            trace!(
                kernel = %launch.name,
                global = ?launch.global,
                local = ?launch.local,
                "launch complete"
            );
        }
        result
    }

    /// Hand buffer slots back to their buffers. By-value copies are dropped.
    fn restore(&mut self, args: &[ArgValue], slots: Vec<Vec<u8>>) {
        for (arg, data) in args.iter().zip(slots) {
            if let ArgValue::Buffer(id) = arg {
                if let Some(buffer) = self.buffers.get_mut(id) {
                    buffer.data = data;
                }
            }
        }
    }
}

/// The software platform.
#[derive(Debug)]
pub struct EmulatedPlatform {
    platforms: Vec<String>,
    devices: Vec<DeviceEntry>,
    registry: Registry,
    faults: Mutex<Vec<Fault>>,
    state: Mutex<State>,
}

impl EmulatedPlatform {
    pub fn builder() -> EmulatedPlatformBuilder {
        EmulatedPlatformBuilder::new()
    }

    /// One platform with a GPU and a CPU device.
    pub fn standard() -> Self {
        Self::builder()
            .platform(
                "clpipe software platform",
                vec![
                    DeviceSpec::new("clpipe emulated GPU", DeviceType::Gpu),
                    DeviceSpec::new("clpipe emulated CPU", DeviceType::Cpu),
                ],
            )
            .build()
    }

    /// Make every matching call fail with `status` until cleared.
    pub fn inject(&self, call: Call, status: Status) {
        self.inject_for(call, FaultTarget::Any, status);
    }

    pub fn inject_for(&self, call: Call, target: FaultTarget, status: Status) {
        self.faults.lock().push(Fault {
            call,
            target,
            status,
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Every create and release so far, in order.
    pub fn ledger(&self) -> Vec<LedgerEvent> {
        self.state.lock().ledger.clone()
    }

    /// Kinds released so far, in release order.
    pub fn releases(&self) -> Vec<ResourceKind> {
        self.state
            .lock()
            .ledger
            .iter()
            .filter(|e| e.action == LedgerAction::Released)
            .map(|e| e.kind)
            .collect()
    }

    /// Handles created and not yet released.
    pub fn live_resources(&self) -> usize {
        let state = self.state.lock();
        state.contexts.len()
            + state.queues.len()
            + state.buffers.len()
            + state.programs.len()
            + state.kernels.len()
    }

    pub fn launches_executed(&self) -> usize {
        self.state.lock().launches_executed
    }

    /// Current contents of a live buffer, or the final contents of one of
    /// the last few released buffers.
    pub fn buffer_contents(&self, buffer: MemId) -> Option<Vec<u8>> {
        let state = self.state.lock();
        match state.buffers.get(&buffer.raw()) {
            Some(live) => Some(live.data.clone()),
            None => state
                .retained
                .iter()
                .find(|(id, _)| *id == buffer.raw())
                .map(|(_, data)| data.clone()),
        }
    }

    fn fault(
        &self,
        call: Call,
        platform: Option<usize>,
        device: Option<u64>,
    ) -> Result<(), Status> {
        let device = device.and_then(|id| self.devices.get(id as usize));
        let faults = self.faults.lock();
        for fault in faults.iter().filter(|f| f.call == call) {
            let hit = match fault.target {
                FaultTarget::Any => true,
                FaultTarget::Platform(p) => {
                    platform == Some(p) || device.map_or(false, |d| d.platform == p)
                }
                FaultTarget::Device(p, i) => {
                    device.map_or(false, |d| d.platform == p && d.index == i)
                }
            };
            if hit {
                debug!(?call, status = %fault.status, "injected fault");
                return Err(fault.status);
            }
        }
        Ok(())
    }

    fn device(&self, device: DeviceId) -> Result<&DeviceEntry, Status> {
        self.devices
            .get(device.raw() as usize)
            .ok_or(Status::CL_INVALID_DEVICE)
    }

    fn context_device(&self, state: &State, context: u64) -> Option<u64> {
        state.contexts.get(&context).map(|c| c.device)
    }
}

impl Default for EmulatedPlatform {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug)]
pub struct EmulatedPlatformBuilder {
    platforms: Vec<PlatformSpec>,
    registry: Registry,
}

impl EmulatedPlatformBuilder {
    pub fn new() -> Self {
        Self {
            platforms: Vec::new(),
            registry: Registry::default(),
        }
    }

    pub fn platform(mut self, name: impl Into<String>, devices: Vec<DeviceSpec>) -> Self {
        self.platforms.push(PlatformSpec {
            name: name.into(),
            devices,
        });
        self
    }

    /// Back entry point `name` with a host implementation.
    pub fn register_kernel(
        mut self,
        name: impl Into<String>,
        arity: usize,
        body: KernelFn,
    ) -> Self {
        self.registry.register(name, arity, body);
        self
    }

    pub fn build(self) -> EmulatedPlatform {
        let mut devices = Vec::new();
        let mut platforms = Vec::new();
        for (p, platform) in self.platforms.into_iter().enumerate() {
            platforms.push(platform.name);
            for (index, spec) in platform.devices.into_iter().enumerate() {
                devices.push(DeviceEntry {
                    platform: p,
                    index,
                    spec,
                });
            }
        }

        EmulatedPlatform {
            platforms,
            devices,
            registry: self.registry,
            faults: Mutex::new(Vec::new()),
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for EmulatedPlatformBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_build_options(options: &str) -> Result<(), Status> {
    if options.split_whitespace().all(|opt| opt.starts_with('-')) {
        Ok(())
    } else {
        Err(Status::CL_INVALID_BUILD_OPTIONS)
    }
}

impl Driver for EmulatedPlatform {
    fn backend_name(&self) -> &str {
        "emulated"
    }

    fn platform_ids(&self) -> Result<Vec<PlatformId>, Status> {
        self.fault(Call::PlatformIds, None, None)?;
        if self.platforms.is_empty() {
            return Err(Status::CL_PLATFORM_NOT_FOUND_KHR);
        }
        Ok((0..self.platforms.len() as u64).map(PlatformId::from_raw).collect())
    }

    fn device_ids(
        &self,
        platform: PlatformId,
        filter: DeviceType,
    ) -> Result<Vec<DeviceId>, Status> {
        let p = platform.raw() as usize;
        let name = self.platforms.get(p).ok_or(Status::CL_INVALID_PLATFORM)?;
        self.fault(Call::DeviceIds, Some(p), None)?;

        let on_platform = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.platform == p);
        let ids: Vec<DeviceId> = match filter {
            // The platform's first device is its default.
            DeviceType::Default => on_platform
                .take(1)
                .map(|(i, _)| DeviceId::from_raw(i as u64))
                .collect(),
            DeviceType::Unknown => return Err(Status::CL_INVALID_DEVICE_TYPE),
            _ => on_platform
                .filter(|(_, d)| filter.admits(d.spec.device_type))
                .map(|(i, _)| DeviceId::from_raw(i as u64))
                .collect(),
        };

        debug!(platform = %name, ?filter, devices = ids.len(), "device query");
        if ids.is_empty() {
            return Err(Status::CL_DEVICE_NOT_FOUND);
        }
        Ok(ids)
    }

    fn device_type(&self, device: DeviceId) -> Result<DeviceType, Status> {
        let entry = self.device(device)?;
        self.fault(Call::DeviceType, None, Some(device.raw()))?;
        Ok(entry.spec.device_type)
    }

    fn device_available(&self, device: DeviceId) -> Result<bool, Status> {
        let entry = self.device(device)?;
        self.fault(Call::DeviceAvailable, None, Some(device.raw()))?;
        Ok(entry.spec.available)
    }

    fn device_name(&self, device: DeviceId, capacity: usize) -> Result<BoundedText, Status> {
        let entry = self.device(device)?;
        self.fault(Call::DeviceName, None, Some(device.raw()))?;
        Ok(BoundedText::copy_from(entry.spec.name.as_bytes(), capacity))
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextId, Status> {
        let entry = self.device(device)?;
        self.fault(Call::CreateContext, None, Some(device.raw()))?;
        if !entry.spec.available {
            return Err(Status::CL_DEVICE_NOT_AVAILABLE);
        }

        let mut state = self.state.lock();
        let id = state.allocate_id(ResourceKind::Context);
        state.contexts.insert(id, ContextObj { device: device.raw() });
        Ok(ContextId::from_raw(id))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId, Status> {
        self.fault(Call::CreateQueue, None, Some(device.raw()))?;
        let mut state = self.state.lock();
        let bound = self
            .context_device(&state, context.raw())
            .ok_or(Status::CL_INVALID_CONTEXT)?;
        if bound != device.raw() {
            return Err(Status::CL_INVALID_DEVICE);
        }

        let id = state.allocate_id(ResourceKind::Queue);
        state.queues.insert(
            id,
            QueueObj {
                context: context.raw(),
                pending: VecDeque::new(),
            },
        );
        Ok(QueueId::from_raw(id))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        access: MemAccess,
        size: usize,
    ) -> Result<MemId, Status> {
        self.fault(Call::CreateBuffer, None, None)?;
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context.raw()) {
            return Err(Status::CL_INVALID_CONTEXT);
        }
        if size == 0 || size > MAX_ALLOC_SIZE {
            return Err(Status::CL_INVALID_BUFFER_SIZE);
        }

        let id = state.allocate_id(ResourceKind::Buffer);
        debug!(id, size, ?access, "buffer allocated");
        state.buffers.insert(
            id,
            BufferObj {
                context: context.raw(),
                data: vec![FRESH_FILL; size],
            },
        );
        Ok(MemId::from_raw(id))
    }

    fn create_program(
        &self,
        context: ContextId,
        source: &[u8],
        length: usize,
    ) -> Result<ProgramId, Status> {
        self.fault(Call::CreateProgram, None, None)?;
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context.raw()) {
            return Err(Status::CL_INVALID_CONTEXT);
        }

        // The declared length must cover the text and exactly one terminator.
        let text = source.get(..length).ok_or(Status::CL_INVALID_VALUE)?;
        let (last, body) = text.split_last().ok_or(Status::CL_INVALID_VALUE)?;
        if *last != 0 || body.contains(&0) {
            return Err(Status::CL_INVALID_VALUE);
        }
        let body = std::str::from_utf8(body).map_err(|_| Status::CL_INVALID_VALUE)?;
        if body.trim().is_empty() {
            return Err(Status::CL_INVALID_VALUE);
        }

        let id = state.allocate_id(ResourceKind::Program);
        state.programs.insert(
            id,
            ProgramObj {
                context: context.raw(),
                source: body.to_string(),
                builds: HashMap::new(),
            },
        );
        Ok(ProgramId::from_raw(id))
    }

    fn build_program(
        &self,
        program: ProgramId,
        device: DeviceId,
        options: &str,
    ) -> Result<(), Status> {
        self.device(device)?;
        self.fault(Call::BuildProgram, None, Some(device.raw()))?;
        parse_build_options(options)?;

        let mut state = self.state.lock();
        let context = state
            .programs
            .get(&program.raw())
            .map(|p| p.context)
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        if self.context_device(&state, context) != Some(device.raw()) {
            return Err(Status::CL_INVALID_DEVICE);
        }

        let prog = state
            .programs
            .get_mut(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        let record = match compiler::compile(&prog.source) {
            Ok(compiled) => BuildRecord {
                status: BuildStatus::Success,
                log: String::new(),
                program: Some(compiled),
            },
            Err(diagnostics) => BuildRecord {
                status: BuildStatus::Error,
                log: compiler::render_log(&diagnostics),
                program: None,
            },
        };
        let ok = record.status == BuildStatus::Success;
        prog.builds.insert(device.raw(), record);

        if ok {
            Ok(())
        } else {
            Err(Status::CL_BUILD_PROGRAM_FAILURE)
        }
    }

    fn build_status(&self, program: ProgramId, device: DeviceId) -> Result<BuildStatus, Status> {
        self.fault(Call::BuildStatus, None, Some(device.raw()))?;
        let state = self.state.lock();
        let prog = state
            .programs
            .get(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        Ok(prog
            .builds
            .get(&device.raw())
            .map_or(BuildStatus::None, |b| b.status))
    }

    fn build_log(
        &self,
        program: ProgramId,
        device: DeviceId,
        capacity: usize,
    ) -> Result<BoundedText, Status> {
        self.fault(Call::BuildLog, None, Some(device.raw()))?;
        let state = self.state.lock();
        let prog = state
            .programs
            .get(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        let log = prog.builds.get(&device.raw()).map_or("", |b| b.log.as_str());
        Ok(BoundedText::copy_from(log.as_bytes(), capacity))
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status> {
        self.fault(Call::CreateKernel, None, None)?;
        let mut state = self.state.lock();
        let prog = state
            .programs
            .get(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        let compiled = prog
            .builds
            .values()
            .find_map(|b| b.program.as_ref())
            .ok_or(Status::CL_INVALID_PROGRAM_EXECUTABLE)?;
        let signature = compiled.kernel(name).ok_or(Status::CL_INVALID_KERNEL_NAME)?;
        let reference = self
            .registry
            .get(name, signature.params.len())
            .ok_or(Status::CL_INVALID_KERNEL_DEFINITION)?;

        let params = signature.params.clone();
        let context = prog.context;
        let id = state.allocate_id(ResourceKind::Kernel);
        state.kernels.insert(
            id,
            KernelObj {
                program: program.raw(),
                context,
                name: name.to_string(),
                args: vec![None; params.len()],
                params,
                reference,
            },
        );
        Ok(KernelId::from_raw(id))
    }

    fn set_kernel_arg_buffer(
        &self,
        kernel: KernelId,
        index: u32,
        buffer: MemId,
    ) -> Result<(), Status> {
        self.fault(Call::SetKernelArg, None, None)?;
        let mut state = self.state.lock();
        let buffer_context = state.buffers.get(&buffer.raw()).map(|b| b.context);
        let kern = state
            .kernels
            .get_mut(&kernel.raw())
            .ok_or(Status::CL_INVALID_KERNEL)?;
        let index = index as usize;
        let param = kern.params.get(index).ok_or(Status::CL_INVALID_ARG_INDEX)?;
        let buffer_context = buffer_context.ok_or(Status::CL_INVALID_MEM_OBJECT)?;
        if buffer_context != kern.context {
            return Err(Status::CL_INVALID_CONTEXT);
        }
        let takes_buffer = param.pointer
            && matches!(
                param.address_space,
                Some(AddressSpace::Global) | Some(AddressSpace::Constant)
            );
        if !takes_buffer {
            return Err(Status::CL_INVALID_ARG_VALUE);
        }

        kern.args[index] = Some(ArgValue::Buffer(buffer.raw()));
        Ok(())
    }

    fn set_kernel_arg_bytes(
        &self,
        kernel: KernelId,
        index: u32,
        value: &[u8],
    ) -> Result<(), Status> {
        self.fault(Call::SetKernelArg, None, None)?;
        let mut state = self.state.lock();
        let kern = state
            .kernels
            .get_mut(&kernel.raw())
            .ok_or(Status::CL_INVALID_KERNEL)?;
        let index = index as usize;
        let param = kern.params.get(index).ok_or(Status::CL_INVALID_ARG_INDEX)?;
        if param.pointer {
            return Err(Status::CL_INVALID_ARG_VALUE);
        }
        let size_ok = match param.value_size {
            Some(size) => value.len() == size,
            None => !value.is_empty(),
        };
        if !size_ok {
            return Err(Status::CL_INVALID_ARG_SIZE);
        }

        kern.args[index] = Some(ArgValue::Bytes(value.to_vec()));
        Ok(())
    }

    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<(), Status> {
        self.fault(Call::EnqueueNdRange, None, None)?;
        let mut state = self.state.lock();
        let queue_context = state
            .queues
            .get(&queue.raw())
            .map(|q| q.context)
            .ok_or(Status::CL_INVALID_COMMAND_QUEUE)?;
        let kern = state
            .kernels
            .get(&kernel.raw())
            .ok_or(Status::CL_INVALID_KERNEL)?;
        if kern.context != queue_context {
            return Err(Status::CL_INVALID_CONTEXT);
        }
        let device = self
            .context_device(&state, queue_context)
            .ok_or(Status::CL_INVALID_CONTEXT)?;
        let limit = self.device(DeviceId::from_raw(device))?.spec.max_work_group_size;

        if global.is_empty() || global.len() > MAX_DIMS {
            return Err(Status::CL_INVALID_WORK_DIMENSION);
        }
        if global.iter().any(|&g| g == 0) {
            return Err(Status::CL_INVALID_GLOBAL_WORK_SIZE);
        }
        let local = match local {
            Some(local) if local.len() != global.len() => {
                return Err(Status::CL_INVALID_WORK_DIMENSION)
            }
            Some(local) => local.to_vec(),
            None => vec![1; global.len()],
        };
        let group_size = extent_product(&local).unwrap_or(usize::MAX);
        if !divides_evenly(global, &local) || group_size > limit {
            return Err(Status::CL_INVALID_WORK_GROUP_SIZE);
        }

        let args: Option<Vec<ArgValue>> = kern.args.iter().cloned().collect();
        let args = args.ok_or(Status::CL_INVALID_KERNEL_ARGS)?;

        let launch = Launch {
            name: kern.name.clone(),
            reference: kern.reference,
            args,
            global: global.to_vec(),
            local,
        };
        debug!(
            kernel = %launch.name,
            global = ?launch.global,
            local = ?launch.local,
            "launch queued"
        );
        if let Some(q) = state.queues.get_mut(&queue.raw()) {
            q.pending.push_back(launch);
        }
        Ok(())
    }

    fn enqueue_read_buffer(
        &self,
        queue: QueueId,
        buffer: MemId,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), Status> {
        self.fault(Call::EnqueueRead, None, None)?;
        let mut state = self.state.lock();
        let queue_context = state
            .queues
            .get(&queue.raw())
            .map(|q| q.context)
            .ok_or(Status::CL_INVALID_COMMAND_QUEUE)?;
        match state.buffers.get(&buffer.raw()) {
            Some(b) if b.context != queue_context => return Err(Status::CL_INVALID_CONTEXT),
            Some(_) => {}
            None => return Err(Status::CL_INVALID_MEM_OBJECT),
        }

        // A blocking read waits for everything queued before it.
        state.drain(queue.raw())?;

        let data = state
            .buffers
            .get(&buffer.raw())
            .map(|b| b.data.as_slice())
            .ok_or(Status::CL_INVALID_MEM_OBJECT)?;
        let end = offset.checked_add(dst.len()).ok_or(Status::CL_INVALID_VALUE)?;
        let src = data.get(offset..end).ok_or(Status::CL_INVALID_VALUE)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn flush(&self, queue: QueueId) -> Result<(), Status> {
        self.fault(Call::Flush, None, None)?;
        self.state.lock().drain(queue.raw())
    }

    fn finish(&self, queue: QueueId) -> Result<(), Status> {
        self.fault(Call::Finish, None, None)?;
        self.state.lock().drain(queue.raw())
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), Status> {
        let mut state = self.state.lock();
        let found = state.kernels.remove(&kernel.raw()).is_some();
        state.record_release(ResourceKind::Kernel, kernel.raw(), found)
    }

    fn release_program(&self, program: ProgramId) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.kernels.values().any(|k| k.program == program.raw()) {
            warn!(program = program.raw(), "program released while kernels are live");
        }
        let found = state.programs.remove(&program.raw()).is_some();
        state.record_release(ResourceKind::Program, program.raw(), found)
    }

    fn release_buffer(&self, buffer: MemId) -> Result<(), Status> {
        let mut state = self.state.lock();
        let removed = state.buffers.remove(&buffer.raw());
        let found = removed.is_some();
        if let Some(obj) = removed {
            if state.retained.len() == RETAINED_BUFFERS {
                state.retained.pop_front();
            }
            state.retained.push_back((buffer.raw(), obj.data));
        }
        state.record_release(ResourceKind::Buffer, buffer.raw(), found)
    }

    fn release_queue(&self, queue: QueueId) -> Result<(), Status> {
        let mut state = self.state.lock();
        let found = state.queues.contains_key(&queue.raw());
        if found {
            // Releasing a queue flushes it first.
            if let Err(status) = state.drain(queue.raw()) {
                warn!(queue = queue.raw(), %status, "pending work failed on release");
            }
            state.queues.remove(&queue.raw());
        }
        state.record_release(ResourceKind::Queue, queue.raw(), found)
    }

    fn release_context(&self, context: ContextId) -> Result<(), Status> {
        let mut state = self.state.lock();
        let raw = context.raw();
        let children = state.queues.values().filter(|q| q.context == raw).count()
            + state.buffers.values().filter(|b| b.context == raw).count()
            + state.programs.values().filter(|p| p.context == raw).count();
        if children > 0 {
            warn!(context = raw, children, "context released before its resources");
        }
        let found = state.contexts.remove(&raw).is_some();
        state.record_release(ResourceKind::Context, raw, found)
    }
}
