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
*/

//! FluxBlock reads, caches and writes logical disk sectors from heterogeneous
//! floppy sources - raw sector-image files, compressed MSA (Atari ST) images,
//! and physical drives delivering raw MFM flux through an external bridge -
//! and presents them through a uniform block-device surface that a generic
//! FAT12/16 driver can mount.
//!
//! The interesting part lives in [engine::MfmEngine]: raw MFM flux is decoded
//! into addressable sectors (AmigaDOS, IBM System/34, Atari ST, or hybrid
//! disks carrying both layouts on the same cylinders), cached per track in up
//! to two planes, and written back as whole re-encoded tracks with read-back
//! verification.

pub mod block_device;
pub mod boot_sector;
pub mod bridge;
pub mod cache;
pub mod chs;
pub mod codec;
pub mod engine;
pub mod image;
pub mod types;

mod util;

use thiserror::Error;

/// Default sector payload size for every supported format.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// Upper bound on the linear track index (84 cylinders, two heads).
pub const MAX_TRACKS: u32 = 168;

/// Size of the raw MFM scratch buffer. Must hold an encoded HD Amiga track
/// (22 sectors of 1088 raw bytes plus gap).
pub const MAX_TRACK_SIZE: usize = 0x7400;

/// Motor idle time (ms) before the monitor flushes pending writes and spins down.
pub const MOTOR_IDLE_TIMEOUT: u64 = 2000;
/// Maximum time (ms) to wait for the motor to report ready.
pub const MOTOR_TIMEOUT_TIME: u64 = 1000;
/// Maximum time (ms) to keep polling the bridge for track flux.
pub const TRACK_READ_TIMEOUT: u64 = 1000;
/// Maximum time (ms) to wait for the bridge to confirm a track write.
pub const DISK_WRITE_TIMEOUT: u64 = 2000;

/// Read/write retry budget before the retry policy is consulted.
pub const MAX_RETRIES: u32 = 10;
/// Number of dirty tracks that forces a flush on the next cache operation.
pub const FORCE_FLUSH_AT_TRACKS: usize = 4;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No media present in the drive")]
    NoMedia,
    #[error("The media is write protected")]
    WriteProtected,
    #[error("Sector address or geometry out of range")]
    BadGeometry,
    #[error("The MFM bitstream did not decode to the requested sector")]
    CodecMismatch,
    #[error("Read-back verification did not match the written data")]
    VerifyMismatch,
    #[error("A motor, seek or write operation timed out")]
    Timeout,
    #[error("The bridge driver reported a failure")]
    Bridge,
    #[error("The operation is not supported for this disk type")]
    UnsupportedType,
    #[error("The operation was aborted by the retry policy")]
    Aborted,
    #[error("An IO error occurred reading or writing the backing file")]
    Io,
}

pub use crate::{
    cache::{SectorCache, SectorIo},
    chs::DiskCh,
    types::{DecodedSector, DecodedTrack, DiskDensity, PlaneGeometry, SectorKind},
};

pub mod prelude {
    pub use crate::{
        block_device::{disk_ioctl, disk_read, disk_status, disk_write, DiskIoctl, DiskResult, DiskStatus},
        bridge::BridgeDriver,
        cache::{SectorCache, SectorIo},
        chs::DiskCh,
        engine::{MfmEngine, NoPrompt, RetryDecision, RetryPolicy},
        image::FileBackend,
        types::{DecodedSector, DecodedTrack, DiskDensity, PlaneGeometry, SectorKind},
        DeviceError,
        DEFAULT_SECTOR_SIZE,
        MAX_TRACKS,
    };
}
