//! The platform boundary.
//!
//! [`Driver`] is the only place native calls happen. Every method answers with
//! a raw [`Status`] on failure; the directory and session layers map those
//! into [`crate::Error`] immediately, naming the stage that failed.

pub mod handle;

pub use handle::{
    ContextId, DeviceId, KernelId, MemId, Owned, PlatformId, ProgramId, QueueId, Resource,
    ResourceKind,
};

use crate::bounded::BoundedText;
use crate::status::Status;
use std::fmt;

/// Device category, decoded from the platform's type bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Default,
    Cpu,
    Gpu,
    Accelerator,
    All,
    Unknown,
}

impl DeviceType {
    pub const DEFAULT_BITS: u64 = 1 << 0;
    pub const CPU_BITS: u64 = 1 << 1;
    pub const GPU_BITS: u64 = 1 << 2;
    pub const ACCELERATOR_BITS: u64 = 1 << 3;
    pub const ALL_BITS: u64 = 0xFFFF_FFFF;

    /// Decode a raw type value. Anything but an exact match is `Unknown`.
    pub fn from_bits(bits: u64) -> Self {
        match bits {
            Self::DEFAULT_BITS => DeviceType::Default,
            Self::CPU_BITS => DeviceType::Cpu,
            Self::GPU_BITS => DeviceType::Gpu,
            Self::ACCELERATOR_BITS => DeviceType::Accelerator,
            Self::ALL_BITS => DeviceType::All,
            _ => DeviceType::Unknown,
        }
    }

    /// Raw filter value used when asking a platform for devices.
    pub fn bits(self) -> u64 {
        match self {
            DeviceType::Default => Self::DEFAULT_BITS,
            DeviceType::Cpu => Self::CPU_BITS,
            DeviceType::Gpu => Self::GPU_BITS,
            DeviceType::Accelerator => Self::ACCELERATOR_BITS,
            DeviceType::All | DeviceType::Unknown => Self::ALL_BITS,
        }
    }

    /// Whether a device of type `other` passes this filter.
    pub fn admits(self, other: DeviceType) -> bool {
        self == DeviceType::All || self == other
    }

    /// Upper-case label used in device listings.
    pub fn label(self) -> &'static str {
        match self {
            DeviceType::Default => "DEFAULT",
            DeviceType::Cpu => "CPU",
            DeviceType::Gpu => "GPU",
            DeviceType::Accelerator => "ACCELERATOR",
            DeviceType::All => "ALL",
            DeviceType::Unknown => "INVALID-DEFAULT",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(DeviceType::Default),
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            "accelerator" => Ok(DeviceType::Accelerator),
            "all" => Ok(DeviceType::All),
            other => Err(format!("unknown device type '{}'", other)),
        }
    }
}

/// A per-device attribute queried during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Type,
    Available,
    Name,
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Attribute::Type => "type",
            Attribute::Available => "availability",
            Attribute::Name => "name",
        };
        f.write_str(name)
    }
}

/// Outcome of the last build of a program for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    None,
    Error,
    Success,
    InProgress,
    /// The status query itself failed.
    Unknown,
}

impl BuildStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => BuildStatus::None,
            -2 => BuildStatus::Error,
            0 => BuildStatus::Success,
            -3 => BuildStatus::InProgress,
            _ => BuildStatus::Unknown,
        }
    }

    pub fn code(self) -> Option<i32> {
        match self {
            BuildStatus::None => Some(-1),
            BuildStatus::Error => Some(-2),
            BuildStatus::Success => Some(0),
            BuildStatus::InProgress => Some(-3),
            BuildStatus::Unknown => None,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{:?} ({})", self, code),
            None => f.write_str("Unknown"),
        }
    }
}

/// How kernels may access a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    /// Scratch buffers the host reads back after a kernel wrote them.
    ReadWrite,
    /// The result buffer.
    WriteOnly,
}

/// Primitive operations of a compute platform.
///
/// Handles returned by one driver are meaningless to another. Resources
/// created through a driver must be released through the same driver, children
/// before their context.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Human-readable backend name, for logs.
    fn backend_name(&self) -> &str;

    fn platform_ids(&self) -> Result<Vec<PlatformId>, Status>;

    /// Devices of `platform` admitted by `filter`.
    fn device_ids(&self, platform: PlatformId, filter: DeviceType)
        -> Result<Vec<DeviceId>, Status>;

    fn device_type(&self, device: DeviceId) -> Result<DeviceType, Status>;

    fn device_available(&self, device: DeviceId) -> Result<bool, Status>;

    /// Device name read through a buffer of `capacity` bytes.
    fn device_name(&self, device: DeviceId, capacity: usize) -> Result<BoundedText, Status>;

    fn create_context(&self, device: DeviceId) -> Result<ContextId, Status>;

    fn create_queue(&self, context: ContextId, device: DeviceId) -> Result<QueueId, Status>;

    fn create_buffer(
        &self,
        context: ContextId,
        access: MemAccess,
        size: usize,
    ) -> Result<MemId, Status>;

    /// Submit program text. `length` counts the bytes the platform should
    /// read from `source`, terminator included.
    fn create_program(
        &self,
        context: ContextId,
        source: &[u8],
        length: usize,
    ) -> Result<ProgramId, Status>;

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str)
        -> Result<(), Status>;

    fn build_status(&self, program: ProgramId, device: DeviceId) -> Result<BuildStatus, Status>;

    /// Build log read through a buffer of `capacity` bytes.
    fn build_log(
        &self,
        program: ProgramId,
        device: DeviceId,
        capacity: usize,
    ) -> Result<BoundedText, Status>;

    fn create_kernel(&self, program: ProgramId, name: &str) -> Result<KernelId, Status>;

    fn set_kernel_arg_buffer(&self, kernel: KernelId, index: u32, buffer: MemId)
        -> Result<(), Status>;

    /// Bind a copy of `value` as by-value argument `index`.
    fn set_kernel_arg_bytes(&self, kernel: KernelId, index: u32, value: &[u8])
        -> Result<(), Status>;

    /// Submit a kernel over an index space. Returns once queued.
    fn enqueue_nd_range(
        &self,
        queue: QueueId,
        kernel: KernelId,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<(), Status>;

    /// Blocking read of `dst.len()` bytes starting at `offset`.
    fn enqueue_read_buffer(
        &self,
        queue: QueueId,
        buffer: MemId,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), Status>;

    fn flush(&self, queue: QueueId) -> Result<(), Status>;

    /// Wait until everything queued has completed.
    fn finish(&self, queue: QueueId) -> Result<(), Status>;

    fn release_kernel(&self, kernel: KernelId) -> Result<(), Status>;

    fn release_program(&self, program: ProgramId) -> Result<(), Status>;

    fn release_buffer(&self, buffer: MemId) -> Result<(), Status>;

    fn release_queue(&self, queue: QueueId) -> Result<(), Status>;

    fn release_context(&self, context: ContextId) -> Result<(), Status>;
}
