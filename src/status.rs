//! Native status codes returned by platform calls.

use std::fmt;

/// A raw status code as reported by the platform layer.
///
/// Only the driver boundary produces these; higher layers receive them wrapped
/// in a [`crate::Error`] variant that names the failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(i32);

macro_rules! status_codes {
    ($($name:ident = $code:literal),+ $(,)?) => {
        impl Status {
            $(
                #[allow(missing_docs)]
                pub const $name: Status = Status($code);
            )+

            /// Symbolic name of a known status code.
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some(stringify!($name)),)+
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    CL_SUCCESS = 0,
    CL_DEVICE_NOT_FOUND = -1,
    CL_DEVICE_NOT_AVAILABLE = -2,
    CL_OUT_OF_RESOURCES = -5,
    CL_OUT_OF_HOST_MEMORY = -6,
    CL_BUILD_PROGRAM_FAILURE = -11,
    CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST = -14,
    CL_INVALID_VALUE = -30,
    CL_INVALID_DEVICE_TYPE = -31,
    CL_INVALID_PLATFORM = -32,
    CL_INVALID_DEVICE = -33,
    CL_INVALID_CONTEXT = -34,
    CL_INVALID_COMMAND_QUEUE = -36,
    CL_INVALID_MEM_OBJECT = -38,
    CL_INVALID_BUILD_OPTIONS = -43,
    CL_INVALID_PROGRAM = -44,
    CL_INVALID_PROGRAM_EXECUTABLE = -45,
    CL_INVALID_KERNEL_NAME = -46,
    CL_INVALID_KERNEL_DEFINITION = -47,
    CL_INVALID_KERNEL = -48,
    CL_INVALID_ARG_INDEX = -49,
    CL_INVALID_ARG_VALUE = -50,
    CL_INVALID_ARG_SIZE = -51,
    CL_INVALID_KERNEL_ARGS = -52,
    CL_INVALID_WORK_DIMENSION = -53,
    CL_INVALID_WORK_GROUP_SIZE = -54,
    CL_INVALID_BUFFER_SIZE = -61,
    CL_INVALID_GLOBAL_WORK_SIZE = -63,
    CL_PLATFORM_NOT_FOUND_KHR = -1001,
}

impl Status {
    /// Wrap a raw code.
    pub const fn from_code(code: i32) -> Self {
        Status(code)
    }

    /// The raw numeric code.
    pub const fn code(self) -> i32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        Status(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_render_symbolically() {
        assert_eq!(
            Status::CL_INVALID_WORK_GROUP_SIZE.to_string(),
            "CL_INVALID_WORK_GROUP_SIZE (-54)"
        );
        assert_eq!(Status::from_code(-11), Status::CL_BUILD_PROGRAM_FAILURE);
    }

    #[test]
    fn test_unknown_code() {
        let status = Status::from_code(-9999);
        assert_eq!(status.name(), None);
        assert_eq!(status.to_string(), "status -9999");
        assert!(!status.is_success());
        assert!(Status::CL_SUCCESS.is_success());
    }
}
