/*
    FluxBlock
    https://github.com/dbalsom/fluxblock

    Copyright 2024-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/block_device.rs

    The block-device surface consumed by a generic FAT12/16 driver: plain
    functions over a process-wide binding to the active sector cache, so the
    driver's C-style callback table can point straight at them. The binding
    holds a weak reference and never keeps a backend alive on its own.
*/

use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use chrono::{Datelike, Local, Timelike};

use crate::{cache::SectorCache, DeviceError};

bitflags! {
    /// Drive status word (FatFs DSTATUS layout).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DiskStatus: u8 {
        const NOINIT  = 0x01;
        const NODISK  = 0x02;
        const PROTECT = 0x04;
    }
}

/// Operation results (FatFs DRESULT layout).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskResult {
    Ok,
    Error,
    WriteProtected,
    NotReady,
    InvalidParameter,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskIoctl {
    /// Flush the write-back cache.
    Sync,
    SectorCount,
    SectorSize,
    BlockSize,
}

static BINDING: Mutex<Option<Weak<SectorCache>>> = Mutex::new(None);

/// Bind the FAT driver surface to a sector cache. Only drive 0 exists; a
/// later bind replaces the previous one.
pub fn bind_block_device(cache: &Arc<SectorCache>) {
    *BINDING.lock().unwrap() = Some(Arc::downgrade(cache));
}

pub fn unbind_block_device() {
    *BINDING.lock().unwrap() = None;
}

fn bound_device(drive: u8) -> Option<Arc<SectorCache>> {
    if drive != 0 {
        return None;
    }
    BINDING.lock().unwrap().as_ref().and_then(Weak::upgrade)
}

pub fn disk_status(drive: u8) -> DiskStatus {
    match bound_device(drive) {
        Some(device) => {
            if !device.is_disk_present() {
                DiskStatus::NODISK
            }
            else if device.is_write_protected() {
                DiskStatus::PROTECT
            }
            else {
                DiskStatus::empty()
            }
        }
        None => DiskStatus::NOINIT,
    }
}

pub fn disk_initialize(drive: u8) -> DiskStatus {
    disk_status(drive)
}

/// Read `count` sectors starting at `lba` through the hybrid plane.
pub fn disk_read(drive: u8, buf: &mut [u8], lba: u32, count: u32) -> DiskResult {
    let Some(device) = bound_device(drive) else {
        return DiskResult::InvalidParameter;
    };
    if !device.is_disk_present() {
        return DiskResult::NotReady;
    }

    let sector_size = device.hybrid_sector_size() as usize;
    if buf.len() < count as usize * sector_size {
        return DiskResult::InvalidParameter;
    }

    for i in 0..count as usize {
        let slice = &mut buf[i * sector_size..(i + 1) * sector_size];
        if let Err(e) = device.hybrid_read_data(lba + i as u32, slice) {
            log::error!("disk_read(): Sector {} failed: {}", lba + i as u32, e);
            return match e {
                DeviceError::NoMedia => DiskResult::NotReady,
                _ => DiskResult::Error,
            };
        }
    }
    DiskResult::Ok
}

/// Write `count` sectors starting at `lba`.
pub fn disk_write(drive: u8, buf: &[u8], lba: u32, count: u32) -> DiskResult {
    let Some(device) = bound_device(drive) else {
        return DiskResult::InvalidParameter;
    };
    if !device.is_disk_present() {
        return DiskResult::NotReady;
    }
    if device.is_write_protected() {
        return DiskResult::WriteProtected;
    }

    let sector_size = device.sector_size() as usize;
    if buf.len() < count as usize * sector_size {
        return DiskResult::InvalidParameter;
    }

    for i in 0..count as usize {
        let slice = &buf[i * sector_size..(i + 1) * sector_size];
        if let Err(e) = device.write_data(lba + i as u32, slice) {
            log::error!("disk_write(): Sector {} failed: {}", lba + i as u32, e);
            return match e {
                DeviceError::NoMedia => DiskResult::NotReady,
                DeviceError::WriteProtected => DiskResult::WriteProtected,
                _ => DiskResult::Error,
            };
        }
    }
    DiskResult::Ok
}

/// Miscellaneous device queries. `Sync` returns 0 on success.
pub fn disk_ioctl(drive: u8, cmd: DiskIoctl) -> Result<u32, DiskResult> {
    let Some(device) = bound_device(drive) else {
        return Err(DiskResult::InvalidParameter);
    };
    if !device.is_disk_present() {
        return Err(DiskResult::NotReady);
    }

    match cmd {
        DiskIoctl::Sync => match device.flush_write_cache() {
            Ok(()) => Ok(0),
            Err(e) => {
                log::error!("disk_ioctl(): Sync failed: {}", e);
                Err(DiskResult::Error)
            }
        },
        DiskIoctl::SectorCount => Ok(device.hybrid_sectors_per_track() * device.hybrid_total_tracks()),
        DiskIoctl::SectorSize => Ok(device.hybrid_sector_size()),
        DiskIoctl::BlockSize => Ok(1),
    }
}

/// Current local time as a DOS packed timestamp.
pub fn get_fattime() -> u32 {
    let now = Local::now();
    ((now.year() as u32).saturating_sub(1980)) << 25
        | now.month() << 21
        | now.day() << 16
        | now.hour() << 11
        | now.minute() << 5
        | now.second() >> 1
}
