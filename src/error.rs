use crate::driver::{Attribute, BuildStatus};
use crate::session::SessionState;
use crate::status::Status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to get platform ids: {status}")]
    Enumeration { status: Status },

    #[error("failed to get devices for platform {platform}: {status}")]
    DeviceQuery { platform: usize, status: Status },

    #[error("can't query device {device} {attribute} on platform {platform}: {status}")]
    AttributeQuery {
        device: usize,
        platform: usize,
        attribute: Attribute,
        status: Status,
    },

    #[error("failed to create context: {status}")]
    ContextCreation { status: Status },

    #[error("failed to create a command queue: {status}")]
    QueueCreation { status: Status },

    #[error("failed to create a buffer: {status}")]
    BufferAllocation { status: Status },

    #[error("failed to create program: {status}")]
    ProgramCreation { status: Status },

    #[error("failed to build program: {status} (build status: {build_status})")]
    ProgramBuild {
        status: Status,
        build_status: BuildStatus,
        log: String,
        log_available: usize,
    },

    #[error("failed to create kernel: {status}")]
    KernelExtraction { status: Status },

    #[error("failed to set kernel arguments: {status}")]
    ArgumentBinding { status: Status },

    #[error("failed to enqueue kernel: {status}")]
    Dispatch { status: Status },

    #[error("failed to read back result from device: {status}")]
    Readback { status: Status },

    #[error("session is {actual:?}, expected {expected:?}")]
    Stage {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("no {0} device found")]
    NoDevice(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Error::Backend(msg.into())
    }

    /// Native status code carried by the error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Enumeration { status }
            | Error::DeviceQuery { status, .. }
            | Error::AttributeQuery { status, .. }
            | Error::ContextCreation { status }
            | Error::QueueCreation { status }
            | Error::BufferAllocation { status }
            | Error::ProgramCreation { status }
            | Error::ProgramBuild { status, .. }
            | Error::KernelExtraction { status }
            | Error::ArgumentBinding { status }
            | Error::Dispatch { status }
            | Error::Readback { status } => Some(*status),
            _ => None,
        }
    }

    /// Short name of the pipeline stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Enumeration { .. } => "enumeration",
            Error::DeviceQuery { .. } => "device query",
            Error::AttributeQuery { .. } => "attribute query",
            Error::ContextCreation { .. } => "context creation",
            Error::QueueCreation { .. } => "queue creation",
            Error::BufferAllocation { .. } => "buffer allocation",
            Error::ProgramCreation { .. } => "program creation",
            Error::ProgramBuild { .. } => "program build",
            Error::KernelExtraction { .. } => "kernel extraction",
            Error::ArgumentBinding { .. } => "argument binding",
            Error::Dispatch { .. } => "dispatch",
            Error::Readback { .. } => "readback",
            Error::Stage { .. } => "session state",
            Error::NoDevice(_) => "device selection",
            Error::Config(_) => "config",
            Error::Backend(_) => "backend",
            Error::Io(_) => "io",
        }
    }

    /// Diagnostic log attached to a build failure.
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Error::ProgramBuild { log, .. } => Some(log),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_stage() {
        let err = Error::Dispatch {
            status: Status::CL_INVALID_WORK_GROUP_SIZE,
        };
        assert_eq!(err.status(), Some(Status::CL_INVALID_WORK_GROUP_SIZE));
        assert_eq!(err.stage(), "dispatch");
        assert_eq!(
            err.to_string(),
            "failed to enqueue kernel: CL_INVALID_WORK_GROUP_SIZE (-54)"
        );
    }

    #[test]
    fn test_only_build_errors_carry_a_log() {
        let build = Error::ProgramBuild {
            status: Status::CL_BUILD_PROGRAM_FAILURE,
            build_status: BuildStatus::Error,
            log: "<source>:1:1: error: oops".into(),
            log_available: 25,
        };
        assert!(build.build_log().is_some());
        assert!(Error::config("bad").build_log().is_none());
        assert_eq!(Error::config("bad").status(), None);
    }
}
