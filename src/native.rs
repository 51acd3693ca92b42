//! Driver backed by the system's OpenCL ICD loader.
//!
//! Compiled only with the `opencl` feature. opencl3 objects release
//! themselves on drop, so each one lives in a handle table and the `release_*`
//! calls remove it from there.

use crate::bounded::BoundedText;
use crate::driver::{
    BuildStatus, ContextId, DeviceId, DeviceType, Driver, KernelId, MemAccess, MemId, PlatformId,
    ProgramId, QueueId,
};
use crate::status::Status;
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::Device;
use opencl3::error_codes::ClError;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{cl_device_id, CL_BLOCKING};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use tracing::{debug, info};

fn status(err: ClError) -> Status {
    Status::from_code(err.0)
}

fn device_handle(device: DeviceId) -> cl_device_id {
    device.raw() as usize as cl_device_id
}

#[derive(Default)]
struct Tables {
    next_id: u64,
    platforms: Vec<Platform>,
    contexts: HashMap<u64, Context>,
    queues: HashMap<u64, CommandQueue>,
    buffers: HashMap<u64, Buffer<u8>>,
    programs: HashMap<u64, Program>,
    kernels: HashMap<u64, Kernel>,
}

impl Tables {
    fn insert<T>(next_id: &mut u64, table: &mut HashMap<u64, T>, value: T) -> u64 {
        *next_id += 1;
        table.insert(*next_id, value);
        *next_id
    }
}

/// OpenCL platforms as reported by the installed ICDs.
pub struct NativeDriver {
    tables: Mutex<Tables>,
}

// SAFETY: opencl3 handles are raw pointers into the ICD. OpenCL objects are
// thread-safe for the calls made here, and every access goes through the
// table mutex.
unsafe impl Send for NativeDriver {}
unsafe impl Sync for NativeDriver {}

impl NativeDriver {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }
}

impl Default for NativeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NativeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("NativeDriver")
            .field("platforms", &tables.platforms.len())
            .field("contexts", &tables.contexts.len())
            .field("queues", &tables.queues.len())
            .field("buffers", &tables.buffers.len())
            .field("programs", &tables.programs.len())
            .field("kernels", &tables.kernels.len())
            .finish()
    }
}

impl Driver for NativeDriver {
    fn backend_name(&self) -> &str {
        "opencl"
    }

    fn platform_ids(&self) -> Result<Vec<PlatformId>, Status> {
        let platforms = get_platforms().map_err(status)?;
        info!(count = platforms.len(), "OpenCL platforms found");
        let ids = (0..platforms.len() as u64).map(PlatformId::from_raw).collect();
        self.tables.lock().platforms = platforms;
        Ok(ids)
    }

    fn device_ids(
        &self,
        platform: PlatformId,
        filter: DeviceType,
    ) -> Result<Vec<DeviceId>, Status> {
        let tables = self.tables.lock();
        let platform = tables
            .platforms
            .get(platform.raw() as usize)
            .ok_or(Status::CL_INVALID_PLATFORM)?;
        let ids = platform.get_devices(filter.bits()).map_err(status)?;
        Ok(ids
            .into_iter()
            .map(|id| DeviceId::from_raw(id as usize as u64))
            .collect())
    }

    fn device_type(&self, device: DeviceId) -> Result<DeviceType, Status> {
        let bits = Device::new(device_handle(device)).dev_type().map_err(status)?;
        Ok(DeviceType::from_bits(bits))
    }

    fn device_available(&self, device: DeviceId) -> Result<bool, Status> {
        Device::new(device_handle(device)).available().map_err(status)
    }

    fn device_name(&self, device: DeviceId, capacity: usize) -> Result<BoundedText, Status> {
        let name = Device::new(device_handle(device)).name().map_err(status)?;
        Ok(BoundedText::copy_from(name.as_bytes(), capacity))
    }

    fn create_context(&self, device: DeviceId) -> Result<ContextId, Status> {
        let context = Context::from_device(&Device::new(device_handle(device))).map_err(status)?;
        let mut tables = self.tables.lock();
        let Tables {
            next_id, contexts, ..
        } = &mut *tables;
        Ok(ContextId::from_raw(Tables::insert(next_id, contexts, context)))
    }

    fn create_queue(&self, context: ContextId, _device: DeviceId) -> Result<QueueId, Status> {
        let mut tables = self.tables.lock();
        let Tables {
            next_id,
            contexts,
            queues,
            ..
        } = &mut *tables;
        let context = contexts
            .get(&context.raw())
            .ok_or(Status::CL_INVALID_CONTEXT)?;
        let queue = CommandQueue::create_default_with_properties(context, 0, 0).map_err(status)?;
        Ok(QueueId::from_raw(Tables::insert(next_id, queues, queue)))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        access: MemAccess,
        size: usize,
    ) -> Result<MemId, Status> {
        let flags = match access {
            MemAccess::ReadWrite => CL_MEM_READ_WRITE,
            MemAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        };
        let mut tables = self.tables.lock();
        let Tables {
            next_id,
            contexts,
            buffers,
            ..
        } = &mut *tables;
        let context = contexts
            .get(&context.raw())
            .ok_or(Status::CL_INVALID_CONTEXT)?;
        // SAFETY: no host pointer is supplied, so the driver owns the storage.
        let buffer = unsafe {
            Buffer::<u8>::create(context, flags, size, std::ptr::null_mut()).map_err(status)?
        };
        debug!(size, ?access, "device buffer created");
        Ok(MemId::from_raw(Tables::insert(next_id, buffers, buffer)))
    }

    fn create_program(
        &self,
        context: ContextId,
        source: &[u8],
        length: usize,
    ) -> Result<ProgramId, Status> {
        let text = source.get(..length).ok_or(Status::CL_INVALID_VALUE)?;
        let text = text.strip_suffix(b"\0").unwrap_or(text);
        let text = std::str::from_utf8(text).map_err(|_| Status::CL_INVALID_VALUE)?;

        let mut tables = self.tables.lock();
        let Tables {
            next_id,
            contexts,
            programs,
            ..
        } = &mut *tables;
        let context = contexts
            .get(&context.raw())
            .ok_or(Status::CL_INVALID_CONTEXT)?;
        let program = Program::create_from_source(context, text).map_err(status)?;
        Ok(ProgramId::from_raw(Tables::insert(next_id, programs, program)))
    }

    fn build_program(
        &self,
        program: ProgramId,
        device: DeviceId,
        options: &str,
    ) -> Result<(), Status> {
        let mut tables = self.tables.lock();
        let program = tables
            .programs
            .get_mut(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        program
            .build(&[device_handle(device)], options)
            .map_err(status)
    }

    fn build_status(&self, program: ProgramId, device: DeviceId) -> Result<BuildStatus, Status> {
        let tables = self.tables.lock();
        let program = tables
            .programs
            .get(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        let code = program
            .get_build_status(device_handle(device))
            .map_err(status)?;
        Ok(BuildStatus::from_code(code))
    }

    fn build_log(
        &self,
        program: ProgramId,
        device: DeviceId,
        capacity: usize,
    ) -> Result<BoundedText, Status> {
        let tables = self.tables.lock();
        let program = tables
            .programs
            .get(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        let log = program.get_build_log(device_handle(device)).map_err(status)?;
        Ok(BoundedText::copy_from(log.as_bytes(), capacity))
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status> {
        let mut tables = self.tables.lock();
        let Tables {
            next_id,
            programs,
            kernels,
            ..
        } = &mut *tables;
        let program = programs
            .get(&program.raw())
            .ok_or(Status::CL_INVALID_PROGRAM)?;
        let kernel = Kernel::create(program, name).map_err(status)?;
        Ok(KernelId::from_raw(Tables::insert(next_id, kernels, kernel)))
    }

    fn set_kernel_arg_buffer(
        &self,
        kernel: KernelId,
        index: u32,
        buffer: MemId,
    ) -> Result<(), Status> {
        let tables = self.tables.lock();
        let kernel = tables
            .kernels
            .get(&kernel.raw())
            .ok_or(Status::CL_INVALID_KERNEL)?;
        let mem = tables
            .buffers
            .get(&buffer.raw())
            .ok_or(Status::CL_INVALID_MEM_OBJECT)?
            .get();
        // SAFETY: the argument is a live cl_mem owned by the buffer table.
        unsafe { kernel.set_arg(index, &mem).map_err(status) }
    }

    fn set_kernel_arg_bytes(
        &self,
        kernel: KernelId,
        index: u32,
        value: &[u8],
    ) -> Result<(), Status> {
        let tables = self.tables.lock();
        let kernel = tables
            .kernels
            .get(&kernel.raw())
            .ok_or(Status::CL_INVALID_KERNEL)?;
        // SAFETY: the runtime copies `value.len()` bytes before returning.
        unsafe {
            kernel
                .set_arg_raw(index, value.len(), value.as_ptr() as *const c_void)
                .map_err(status)
        }
    }

    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<(), Status> {
        let tables = self.tables.lock();
        let queue = tables
            .queues
            .get(&queue.raw())
            .ok_or(Status::CL_INVALID_COMMAND_QUEUE)?;
        let kernel = tables
            .kernels
            .get(&kernel.raw())
            .ok_or(Status::CL_INVALID_KERNEL)?;
        if let Some(local) = local {
            if local.len() != global.len() {
                return Err(Status::CL_INVALID_WORK_DIMENSION);
            }
        }
        let local_ptr = local.map_or(std::ptr::null(), |l| l.as_ptr());

        // SAFETY: the size arrays outlive the call and hold `global.len()`
        // entries each.
        unsafe {
            queue
                .enqueue_nd_range_kernel(
                    kernel.get(),
                    global.len() as u32,
                    std::ptr::null(),
                    global.as_ptr(),
                    local_ptr,
                    &[],
                )
                .map_err(status)?;
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
        let tables = self.tables.lock();
        let queue = tables
            .queues
            .get(&queue.raw())
            .ok_or(Status::CL_INVALID_COMMAND_QUEUE)?;
        let buffer = tables
            .buffers
            .get(&buffer.raw())
            .ok_or(Status::CL_INVALID_MEM_OBJECT)?;
        // SAFETY: the read is blocking, so `dst` is written before returning.
        unsafe {
            queue
                .enqueue_read_buffer(buffer, CL_BLOCKING, offset, dst, &[])
                .map_err(status)?;
        }
        Ok(())
    }

    fn flush(&self, queue: QueueId) -> Result<(), Status> {
        let tables = self.tables.lock();
        tables
            .queues
            .get(&queue.raw())
            .ok_or(Status::CL_INVALID_COMMAND_QUEUE)?
            .flush()
            .map_err(status)
    }

    fn finish(&self, queue: QueueId) -> Result<(), Status> {
        let tables = self.tables.lock();
        tables
            .queues
            .get(&queue.raw())
            .ok_or(Status::CL_INVALID_COMMAND_QUEUE)?
            .finish()
            .map_err(status)
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), Status> {
        self.tables
            .lock()
            .kernels
            .remove(&kernel.raw())
            .map(drop)
            .ok_or(Status::CL_INVALID_KERNEL)
    }

    fn release_program(&self, program: ProgramId) -> Result<(), Status> {
        self.tables
            .lock()
            .programs
            .remove(&program.raw())
            .map(drop)
            .ok_or(Status::CL_INVALID_PROGRAM)
    }

    fn release_buffer(&self, buffer: MemId) -> Result<(), Status> {
        self.tables
            .lock()
            .buffers
            .remove(&buffer.raw())
            .map(drop)
            .ok_or(Status::CL_INVALID_MEM_OBJECT)
    }

    fn release_queue(&self, queue: QueueId) -> Result<(), Status> {
        self.tables
            .lock()
            .queues
            .remove(&queue.raw())
            .map(drop)
            .ok_or(Status::CL_INVALID_COMMAND_QUEUE)
    }

    fn release_context(&self, context: ContextId) -> Result<(), Status> {
        self.tables
            .lock()
            .contexts
            .remove(&context.raw())
            .map(drop)
            .ok_or(Status::CL_INVALID_CONTEXT)
    }
}
