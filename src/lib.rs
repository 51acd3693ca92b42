//! clpipe - single-shot compute dispatch over an OpenCL-shaped driver
//!
//! Enumerates compute platforms and their devices, then runs one kernel on a
//! chosen device through a strictly ordered session whose resources are
//! released in reverse order on every path.
//!
//! # Quick Start
//!
//! ```no_run
//! use clpipe::prelude::*;
//!
//! let driver = clpipe::connect(Backend::Emulated).unwrap();
//! let config = Config::default();
//!
//! let directory = enumerate(driver.as_ref(), &config).unwrap();
//! let device = directory.select(&config).unwrap();
//! let grid = run(driver.as_ref(), device.id, &config).unwrap();
//!
//! print!("{}", grid);
//! ```
//!
//! # Features
//!
//! - **Device Directory**: every platform and device, with type, availability
//!   and bounded name
//! - **Compute Session**: context, queue, buffer, program, kernel, dispatch and
//!   readback as a state machine, with buffer and by-value kernel arguments
//! - **Software Platform**: deterministic emulated driver with fault injection
//!   and a resource ledger
//! - **OpenCL**: native driver through the system ICD loader (feature `opencl`)

// Lint configuration
#![warn(missing_debug_implementations)]

pub mod bounded;
pub mod config;
pub mod directory;
pub mod driver;
pub mod emulator;
pub mod error;
pub mod geometry;
pub mod kernel;
pub mod prelude;
pub mod report;
pub mod session;
pub mod status;

#[cfg(feature = "opencl")]
pub mod native;

// Re-export key types at crate root
pub use config::{Backend, Config, ConfigBuilder};
pub use directory::{enumerate, DeviceDescriptor, Directory};
pub use driver::Driver;
pub use error::{Error, Result};
pub use session::{run, run_color_sum, Session, SessionState};
pub use status::Status;

/// Open the driver for `backend`.
pub fn connect(backend: Backend) -> Result<Box<dyn Driver>> {
    match backend {
        Backend::Emulated => Ok(Box::new(emulator::EmulatedPlatform::standard())),
        #[cfg(feature = "opencl")]
        Backend::Native => Ok(Box::new(native::NativeDriver::new())),
        #[cfg(not(feature = "opencl"))]
        Backend::Native => Err(Error::backend(
            "native backend requires building with the `opencl` feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emulated_end_to_end() {
        let driver = connect(Backend::Emulated).unwrap();
        let config = Config::default();

        let directory = enumerate(driver.as_ref(), &config).unwrap();
        let device = directory.select(&config).unwrap();
        let grid = run(driver.as_ref(), device.id, &config).unwrap();

        assert_eq!(grid.get(7, 7), Some(0x0707));
        assert!(grid.packed_index_mismatches().is_empty());
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn test_native_requires_feature() {
        assert!(matches!(connect(Backend::Native), Err(Error::Backend(_))));
    }
}
