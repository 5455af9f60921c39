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

    src/boot_sector/bpb.rs

    The BIOS Parameter Block, present from DOS 2.0 onwards and shared (with
    quirks) by Atari ST boot sectors. Describes the media geometry and, from
    DOS 3.4 on, carries a volume serial number.
*/

use binrw::binrw;

/// Offset of the BIOS parameter block within the boot sector.
pub const BPB_OFFSET: u64 = 0x0B;

/// DOS 2.0 BPB section.
#[derive(Debug, Default)]
#[binrw]
#[brw(little)]
pub(crate) struct BiosParameterBlock2 {
    pub(crate) bytes_per_sector: u16,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) reserved_sectors: u16,
    pub(crate) number_of_fats: u8,
    pub(crate) root_entries: u16,
    pub(crate) total_sectors: u16,
    pub(crate) media_descriptor: u8,
    pub(crate) sectors_per_fat: u16,
}

impl BiosParameterBlock2 {
    /// Sanity check covering every standard floppy format from 160K to
    /// 2.88MB, plus the Atari ST variants (which use larger clusters and
    /// sometimes skip the media descriptor).
    pub fn is_valid(&self) -> bool {
        if self.bytes_per_sector < 128 || self.bytes_per_sector > 4096 {
            return false;
        }
        if !self.bytes_per_sector.is_power_of_two() {
            return false;
        }
        if self.sectors_per_cluster == 0 || self.sectors_per_cluster > 4 {
            return false;
        }
        if self.number_of_fats == 0 || self.number_of_fats > 2 {
            return false;
        }
        if self.root_entries < 0x40 || self.root_entries > 0xF0 {
            return false;
        }
        if self.total_sectors < 320 || self.total_sectors > 5760 {
            return false;
        }
        if self.sectors_per_fat < 1 || self.sectors_per_fat > 9 {
            return false;
        }
        true
    }
}

/// DOS 3.0 BPB extensions.
#[derive(Debug, Default)]
#[binrw]
#[brw(little)]
pub(crate) struct BiosParameterBlock3 {
    pub(crate) sectors_per_track: u16,
    pub(crate) number_of_heads:   u16,
    pub(crate) hidden_sectors:    u32,
}

impl BiosParameterBlock3 {
    pub fn is_valid(&self) -> bool {
        if self.sectors_per_track == 0 || self.sectors_per_track > 36 {
            return false;
        }
        if self.number_of_heads == 0 || self.number_of_heads > 2 {
            return false;
        }
        true
    }
}

/// Extended boot record (DOS 3.4/4.0). Only meaningful when `signature` is
/// 0x28 or 0x29.
#[derive(Debug, Default)]
#[binrw]
#[brw(little)]
pub(crate) struct ExtendedBootRecord {
    pub(crate) physical_drive: u8,
    pub(crate) reserved: u8,
    pub(crate) signature: u8,
    pub(crate) volume_serial: u32,
}

impl ExtendedBootRecord {
    pub fn has_serial(&self) -> bool {
        self.signature == 0x28 || self.signature == 0x29
    }
}
