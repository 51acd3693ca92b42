//! Console rendering of directory listings and session results.

use crate::directory::{DeviceDescriptor, Directory};
use crate::error::{Error, Result};
use crate::kernel::{PackedIndex, ResultGrid};
use std::io::Write;

/// Write the full directory listing, platform by platform.
pub fn write_directory<W: Write>(out: &mut W, directory: &Directory) -> Result<()> {
    writeln!(out, "Got {} platform ids:", directory.platforms().len())?;
    for entry in directory.platforms() {
        writeln!(
            out,
            "Platform {} has {} devices",
            entry.platform.index,
            entry.devices.len()
        )?;
        for device in &entry.devices {
            write_device(out, device)?;
        }
    }
    Ok(())
}

pub fn write_device<W: Write>(out: &mut W, device: &DeviceDescriptor) -> Result<()> {
    writeln!(out, "device name: {}", device.name)?;
    writeln!(out, "is available ? {}", if device.available { "yes" } else { "no" })?;
    writeln!(out, "type: {}", device.device_type.label())?;
    Ok(())
}

/// Dispatch geometry and the device it runs on.
pub fn write_setup<W: Write>(
    out: &mut W,
    global: &[usize],
    device: &DeviceDescriptor,
) -> Result<()> {
    writeln!(out, "dims: {:?}", global)?;
    writeln!(out, "device: {}", device.name)?;
    Ok(())
}

/// Row `i` holds positions `i + width * j`.
pub fn write_grid<W: Write>(out: &mut W, grid: &ResultGrid) -> Result<()> {
    write!(out, "{}", grid)?;
    Ok(())
}

/// Per-cell decode of a packed-index grid.
pub fn write_decoded<W: Write>(out: &mut W, grid: &ResultGrid) -> Result<()> {
    for i in 0..grid.width() {
        for (j, value) in grid.row(i).enumerate() {
            let PackedIndex { i: x, j: y } = PackedIndex::decode(value);
            writeln!(out, "i= {}, j= {}, x= {}, y= {}, c = 0x{:x}", i, j, x, y, value)?;
        }
    }
    Ok(())
}

/// The second output of the color-sum kernel.
pub fn write_color_sum<W: Write>(out: &mut W, sum: f32) -> Result<()> {
    writeln!(out, "out: {}", sum)?;
    Ok(())
}

/// Build status and bounded log of a failed build. Other errors write nothing.
pub fn write_build_failure<W: Write>(out: &mut W, err: &Error) -> Result<()> {
    if let Error::ProgramBuild {
        build_status,
        log,
        log_available,
        ..
    } = err
    {
        writeln!(out, "status: {}", build_status)?;
        if log.len() < *log_available {
            writeln!(out, "log ({} of {} bytes):", log.len(), log_available)?;
        } else {
            writeln!(out, "log:")?;
        }
        writeln!(out, "{}", log)?;
    }
    Ok(())
}
