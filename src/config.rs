use crate::driver::DeviceType;
use crate::error::{Error, Result};
use crate::geometry::WorkSpace;
use crate::kernel::ENTRY_POINT;

/// Smallest build log buffer that leaves room for any text after the
/// terminator.
pub const MIN_BUILD_LOG_CAPACITY: usize = 2;

/// Which platform implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The in-process software platform.
    Emulated,
    /// OpenCL through the system ICD loader.
    Native,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Emulated
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "emulated" | "software" => Ok(Backend::Emulated),
            "native" | "opencl" => Ok(Backend::Native),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,

    /// Buffer size for device name queries, terminator included.
    pub name_capacity: usize,
    /// Buffer size for build log queries, terminator included.
    pub build_log_capacity: usize,

    pub device_type: DeviceType,
    pub require_available: bool,

    pub entry_point: String,
    pub build_options: String,
    pub global: Vec<usize>,
    pub local: Vec<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            name_capacity: 100,
            build_log_capacity: 1024,
            device_type: DeviceType::Gpu,
            require_available: true,
            entry_point: ENTRY_POINT.to_string(),
            build_options: String::new(),
            global: vec![8, 8],
            local: vec![2, 2],
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name_capacity == 0 {
            return Err(Error::config("name_capacity must be > 0"));
        }
        if self.build_log_capacity < MIN_BUILD_LOG_CAPACITY {
            return Err(Error::config(format!(
                "build_log_capacity must be >= {}",
                MIN_BUILD_LOG_CAPACITY
            )));
        }
        if self.entry_point.trim().is_empty() {
            return Err(Error::config("entry_point must not be empty"));
        }
        if self.device_type == DeviceType::Unknown {
            return Err(Error::config("device_type must name a concrete type"));
        }
        if self.global.len() != 2 {
            return Err(Error::config("result grid needs a 2-D global extent"));
        }

        // Divisibility is deliberately left to the platform.
        self.work_space().map(|_| ())
    }

    /// Dispatch geometry described by `global` and `local`.
    pub fn work_space(&self) -> Result<WorkSpace> {
        WorkSpace::new(&self.global, &self.local)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn name_capacity(mut self, capacity: usize) -> Self {
        self.config.name_capacity = capacity;
        self
    }

    pub fn build_log_capacity(mut self, capacity: usize) -> Self {
        self.config.build_log_capacity = capacity;
        self
    }

    pub fn device_type(mut self, device_type: DeviceType) -> Self {
        self.config.device_type = device_type;
        self
    }

    pub fn require_available(mut self, require: bool) -> Self {
        self.config.require_available = require;
        self
    }

    pub fn entry_point<S: Into<String>>(mut self, name: S) -> Self {
        self.config.entry_point = name.into();
        self
    }

    pub fn build_options<S: Into<String>>(mut self, options: S) -> Self {
        self.config.build_options = options.into();
        self
    }

    pub fn global(mut self, global: [usize; 2]) -> Self {
        self.config.global = global.to_vec();
        self
    }

    pub fn local(mut self, local: [usize; 2]) -> Self {
        self.config.local = local.to_vec();
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config.name_capacity, 100);
        assert_eq!(config.build_log_capacity, 1024);
        assert_eq!(config.device_type, DeviceType::Gpu);
        assert_eq!(config.work_space().unwrap().work_items(), 64);
        assert_eq!(config.entry_point, "entry_point");
    }

    #[test]
    fn test_validation() {
        assert!(Config::builder().name_capacity(0).build().is_err());
        assert!(Config::builder().build_log_capacity(0).build().is_err());
        assert!(Config::builder().build_log_capacity(1).build().is_err());
        assert!(Config::builder().build_log_capacity(2).build().is_ok());
        assert!(Config::builder().entry_point("  ").build().is_err());
        assert!(Config::builder().global([8, 0]).build().is_err());
        assert!(Config::builder()
            .device_type(DeviceType::Unknown)
            .build()
            .is_err());
    }

    #[test]
    fn test_overflowing_geometry_rejected() {
        let err = Config::builder()
            .global([usize::MAX, 2])
            .local([1, 1])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_indivisible_geometry_is_accepted() {
        let config = Config::builder().local([3, 3]).build().unwrap();
        assert!(!config.work_space().unwrap().divides_evenly());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("opencl".parse::<Backend>().unwrap(), Backend::Native);
        assert_eq!("Emulated".parse::<Backend>().unwrap(), Backend::Emulated);
        assert!("cuda".parse::<Backend>().is_err());
    }
}
