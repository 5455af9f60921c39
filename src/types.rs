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

    src/types.rs

    Core data model: the sector format taxonomy, per-plane geometry, and the
    decoded sector/track containers shared by the codecs, the file backend
    and the track engine.
*/

use std::{
    collections::BTreeMap,
    fmt,
    fmt::{Display, Formatter},
};

/// The on-disk sector format of the current media.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SectorKind {
    #[default]
    Unknown,
    Amiga,
    Ibm,
    Atari,
    /// Amiga and IBM/Atari sector layouts on the same cylinders.
    Hybrid,
}

impl Display for SectorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            SectorKind::Unknown => write!(f, "Unknown"),
            SectorKind::Amiga => write!(f, "Amiga"),
            SectorKind::Ibm => write!(f, "IBM"),
            SectorKind::Atari => write!(f, "Atari"),
            SectorKind::Hybrid => write!(f, "Hybrid"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiskDensity {
    #[default]
    Double,
    High,
}

impl From<bool> for DiskDensity {
    fn from(hd: bool) -> Self {
        if hd {
            DiskDensity::High
        }
        else {
            DiskDensity::Double
        }
    }
}

impl Display for DiskDensity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DiskDensity::Double => write!(f, "DD"),
            DiskDensity::High => write!(f, "HD"),
        }
    }
}

/// Geometry of one logical plane of the media. Plane 1 is live only for
/// hybrid disks, where it carries the IBM side.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlaneGeometry {
    pub sector_size: u32,
    pub sectors_per_track: u32,
    pub heads: u32,
    pub cylinders: u32,
    pub serial: u32,
}

impl Default for PlaneGeometry {
    fn default() -> Self {
        Self {
            sector_size: crate::DEFAULT_SECTOR_SIZE as u32,
            sectors_per_track: 0,
            heads: 2,
            cylinders: 0,
            serial: u32::from_be_bytes(*b"UNKN"),
        }
    }
}

impl PlaneGeometry {
    pub fn total_tracks(&self) -> u32 {
        self.cylinders * self.heads
    }

    pub fn total_bytes(&self) -> u64 {
        self.sector_size as u64 * self.sectors_per_track as u64 * self.total_tracks() as u64
    }

    /// Linear track owning the given sector number.
    pub fn track_of(&self, sector: u32) -> u32 {
        sector / self.sectors_per_track.max(1)
    }

    /// Index of the sector within its track.
    pub fn index_in_track(&self, sector: u32) -> u32 {
        sector % self.sectors_per_track.max(1)
    }
}

/// One decoded sector payload. `errors == 0` means every checksum over the
/// sector verified and the data can be trusted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedSector {
    pub data: Vec<u8>,
    pub errors: u32,
}

impl DecodedSector {
    pub fn new(data: Vec<u8>, errors: u32) -> Self {
        Self { data, errors }
    }

    /// A trusted, zero-filled sector of the given size.
    pub fn blank(size: usize) -> Self {
        Self {
            data: vec![0; size],
            errors: 0,
        }
    }
}

/// All sectors decoded from one physical track, keyed by sector index
/// (0-based; IBM sector ids are shifted down by one on decode).
#[derive(Clone, Debug, Default)]
pub struct DecodedTrack {
    pub sectors: BTreeMap<u8, DecodedSector>,
}

impl DecodedTrack {
    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn clear(&mut self) {
        self.sectors.clear();
    }

    /// Number of sectors that decoded with checksum failures.
    pub fn error_count(&self) -> usize {
        self.sectors.values().filter(|s| s.errors > 0).count()
    }

    /// A track is flushable only when it holds a full complement of trusted
    /// sectors.
    pub fn is_complete(&self, sectors_per_track: u32) -> bool {
        self.len() == sectors_per_track as usize && self.error_count() == 0
    }

    /// Admit a freshly decoded sector, keeping whichever copy has fewer
    /// errors. Ties go to the new copy so that a verify re-read observes the
    /// data actually on the media.
    pub fn insert_better(&mut self, index: u8, sector: DecodedSector) {
        match self.sectors.get(&index) {
            Some(existing) if existing.errors < sector.errors => {}
            _ => {
                self.sectors.insert(index, sector);
            }
        }
    }

    /// Drop surplus sectors, highest index first, until at most
    /// `sectors_per_track` remain.
    pub fn truncate_to(&mut self, sectors_per_track: u32) {
        while self.sectors.len() > sectors_per_track as usize {
            if let Some((&last, _)) = self.sectors.iter().next_back() {
                self.sectors.remove(&last);
            }
        }
    }
}
