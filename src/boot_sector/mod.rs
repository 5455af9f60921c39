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

pub mod bpb;

use binrw::BinRead;
use std::io::Cursor;

use crate::boot_sector::bpb::{BiosParameterBlock2, BiosParameterBlock3, ExtendedBootRecord, BPB_OFFSET};

/// Geometry and identity recovered from an IBM/Atari boot sector.
#[derive(Clone, Copy, Debug)]
pub struct BootSectorInfo {
    pub serial: u32,
    pub heads: u32,
    pub total_sectors: u32,
    pub sectors_per_track: u32,
    pub sector_size: u32,
}

/// Parse the BIOS Parameter Block out of a boot sector. Returns None if the
/// BPB fails validation, in which case the caller's defaults stand.
///
/// `default_serial` is returned unchanged when no extended boot record with
/// a volume serial is present (Atari ST boot sectors predate it).
pub fn parse_boot_sector(buf: &[u8], default_serial: u32) -> Option<BootSectorInfo> {
    if buf.len() < BPB_OFFSET as usize + 25 {
        log::debug!("parse_boot_sector(): Buffer too short for a BPB: {}", buf.len());
        return None;
    }

    let mut cursor = Cursor::new(&buf[BPB_OFFSET as usize..]);

    let bpb2 = BiosParameterBlock2::read(&mut cursor).ok()?;
    let bpb3 = BiosParameterBlock3::read(&mut cursor).ok()?;

    if !bpb2.is_valid() || !bpb3.is_valid() {
        log::debug!(
            "parse_boot_sector(): BPB failed validation: {:?} / {:?}",
            bpb2,
            bpb3
        );
        return None;
    }

    let mut serial = default_serial;
    if let Ok(ebr) = ExtendedBootRecord::read(&mut cursor) {
        if ebr.has_serial() {
            serial = ebr.volume_serial;
        }
    }

    log::trace!(
        "parse_boot_sector(): {} sectors of {} bytes, {} per track, {} heads",
        bpb2.total_sectors,
        bpb2.bytes_per_sector,
        bpb3.sectors_per_track,
        bpb3.number_of_heads
    );

    Some(BootSectorInfo {
        serial,
        heads: bpb3.number_of_heads as u32,
        total_sectors: bpb2.total_sectors as u32,
        sectors_per_track: bpb3.sectors_per_track as u32,
        sector_size: bpb2.bytes_per_sector as u32,
    })
}
