pub use crate::config::{Backend, Config, ConfigBuilder};
pub use crate::directory::{enumerate, DeviceDescriptor, Directory};
pub use crate::driver::{DeviceType, Driver};
pub use crate::error::{Error, Result};
pub use crate::geometry::WorkSpace;
pub use crate::kernel::{Color, KernelSource, PackedIndex, ResultGrid};
pub use crate::session::{run, run_color_sum, ColorRun, Session, SessionState};
pub use crate::status::Status;

pub use crate::emulator::EmulatedPlatform;

#[cfg(feature = "opencl")]
pub use crate::native::NativeDriver;
