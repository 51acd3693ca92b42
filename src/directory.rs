//! Device directory: every platform and every device it exposes.

use crate::config::Config;
use crate::driver::{Attribute, DeviceId, DeviceType, Driver, PlatformId};
use crate::error::{Error, Result};
use crate::status::Status;
use tracing::{debug, info};

/// A platform found during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDescriptor {
    pub index: usize,
    pub id: PlatformId,
}

/// A device found during enumeration, with its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub platform: usize,
    pub index: usize,
    pub id: DeviceId,
    pub device_type: DeviceType,
    pub available: bool,
    /// Name as read through the configured buffer; may be truncated.
    pub name: String,
    pub name_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEntry {
    pub platform: PlatformDescriptor,
    pub devices: Vec<DeviceDescriptor>,
}

/// Result of one enumeration, in platform then device order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    entries: Vec<PlatformEntry>,
}

impl Directory {
    pub fn platforms(&self) -> &[PlatformEntry] {
        &self.entries
    }

    /// All devices, platform by platform.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.entries.iter().flat_map(|e| e.devices.iter())
    }

    pub fn device_count(&self) -> usize {
        self.entries.iter().map(|e| e.devices.len()).sum()
    }

    /// First device of `device_type`, optionally skipping unavailable ones.
    pub fn first_matching(
        &self,
        device_type: DeviceType,
        require_available: bool,
    ) -> Option<&DeviceDescriptor> {
        self.devices()
            .find(|d| device_type.admits(d.device_type) && (d.available || !require_available))
    }

    /// Selection used by the compute pipeline.
    pub fn select(&self, config: &Config) -> Result<&DeviceDescriptor> {
        self.first_matching(config.device_type, config.require_available)
            .ok_or_else(|| {
                let qualifier = if config.require_available { "available " } else { "" };
                Error::NoDevice(format!("{}{}", qualifier, config.device_type))
            })
    }
}

/// Enumerate every device of every platform.
///
/// Fails fast: the first failing query aborts the whole enumeration and
/// nothing gathered so far is returned.
pub fn enumerate(driver: &dyn Driver, config: &Config) -> Result<Directory> {
    let platform_ids = driver
        .platform_ids()
        .map_err(|status| Error::Enumeration { status })?;
    if platform_ids.is_empty() {
        return Err(Error::Enumeration {
            status: Status::CL_PLATFORM_NOT_FOUND_KHR,
        });
    }
    debug!(
        backend = driver.backend_name(),
        platforms = platform_ids.len(),
        "enumerating"
    );

    let mut entries = Vec::with_capacity(platform_ids.len());
    for (p, id) in platform_ids.into_iter().enumerate() {
        // A platform with no devices answers CL_DEVICE_NOT_FOUND, which is
        // as fatal as any other failed query.
        let device_ids = driver
            .device_ids(id, DeviceType::All)
            .map_err(|status| Error::DeviceQuery {
                platform: p,
                status,
            })?;

        let mut devices = Vec::with_capacity(device_ids.len());
        for (d, device) in device_ids.into_iter().enumerate() {
            devices.push(describe(driver, config, p, d, device)?);
        }
        info!(platform = p, devices = devices.len(), "platform enumerated");

        entries.push(PlatformEntry {
            platform: PlatformDescriptor { index: p, id },
            devices,
        });
    }

    Ok(Directory { entries })
}

fn describe(
    driver: &dyn Driver,
    config: &Config,
    platform: usize,
    index: usize,
    id: DeviceId,
) -> Result<DeviceDescriptor> {
    let attribute_error = |attribute: Attribute| {
        move |status: Status| Error::AttributeQuery {
            device: index,
            platform,
            attribute,
            status,
        }
    };

    let device_type = driver
        .device_type(id)
        .map_err(attribute_error(Attribute::Type))?;
    let available = driver
        .device_available(id)
        .map_err(attribute_error(Attribute::Available))?;
    let name = driver
        .device_name(id, config.name_capacity)
        .map_err(attribute_error(Attribute::Name))?;

    let name_truncated = name.is_truncated();
    if name_truncated {
        debug!(
            platform,
            device = index,
            available = name.available(),
            "device name truncated"
        );
    }

    Ok(DeviceDescriptor {
        platform,
        index,
        id,
        device_type,
        available,
        name: name.into_string(),
        name_truncated,
    })
}
