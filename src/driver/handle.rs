//! Opaque handles and the release discipline for native resources.

use super::Driver;
use crate::status::Status;
use std::fmt;
use std::mem::ManuallyDrop;
use tracing::{debug, warn};

/// Kind of a releasable native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    Queue,
    Buffer,
    Program,
    Kernel,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Context => "context",
            ResourceKind::Queue => "queue",
            ResourceKind::Buffer => "buffer",
            ResourceKind::Program => "program",
            ResourceKind::Kernel => "kernel",
        };
        f.write_str(name)
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw driver-side identifier.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw driver-side identifier.
            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

macro_rules! resource_type {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $release:ident) => {
        handle_type!($(#[$meta])* $name);

        impl Resource for $name {
            const KIND: ResourceKind = $kind;

            fn release(self, driver: &dyn Driver) -> Result<(), Status> {
                driver.$release(self)
            }
        }
    };
}

handle_type!(
    /// Identity of a platform. Never released.
    PlatformId
);
handle_type!(
    /// Identity of a device within a platform. Never released.
    DeviceId
);
resource_type!(
    /// A context bound to one device.
    ContextId,
    ResourceKind::Context,
    release_context
);
resource_type!(
    /// An in-order execution queue.
    QueueId,
    ResourceKind::Queue,
    release_queue
);
resource_type!(
    /// A device-resident buffer.
    MemId,
    ResourceKind::Buffer,
    release_buffer
);
resource_type!(
    /// A program object, built or not.
    ProgramId,
    ResourceKind::Program,
    release_program
);
resource_type!(
    /// A kernel entry point extracted from a built program.
    KernelId,
    ResourceKind::Kernel,
    release_kernel
);

/// A native handle that must be handed back to the driver exactly once.
pub trait Resource: Copy + fmt::Debug {
    const KIND: ResourceKind;

    fn release(self, driver: &dyn Driver) -> Result<(), Status>;
}

/// Exclusive ownership of one native resource.
///
/// The resource is released either explicitly through [`Owned::release`] or
/// when the guard is dropped, never both.
pub struct Owned<'d, R: Resource> {
    driver: &'d dyn Driver,
    handle: R,
}

impl<'d, R: Resource> Owned<'d, R> {
    /// Take ownership of a freshly created handle.
    pub fn new(driver: &'d dyn Driver, handle: R) -> Self {
        debug!(kind = %R::KIND, handle = ?handle, "acquired");
        Self { driver, handle }
    }

    pub fn handle(&self) -> R {
        self.handle
    }

    /// Release now and report the driver's answer.
    pub fn release(self) -> Result<(), Status> {
        let this = ManuallyDrop::new(self);
        debug!(kind = %R::KIND, handle = ?this.handle, "releasing");
        this.handle.release(this.driver)
    }
}

impl<'d, R: Resource> Drop for Owned<'d, R> {
    fn drop(&mut self) {
        debug!(kind = %R::KIND, handle = ?self.handle, "releasing on drop");
        if let Err(status) = self.handle.release(self.driver) {
            warn!(kind = %R::KIND, handle = ?self.handle, %status, "release failed");
        }
    }
}

impl<'d, R: Resource> fmt::Debug for Owned<'d, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned")
            .field("kind", &R::KIND)
            .field("handle", &self.handle)
            .finish()
    }
}
