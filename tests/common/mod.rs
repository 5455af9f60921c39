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

    tests/common/mod.rs

    Common support routines for tests: deterministic sector payloads, a
    720K DOS boot sector, track builders over the public codecs, and an
    in-memory bridge that behaves like an image-backed drive.
*/
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use fluxblock::{
    bridge::BridgeDriver,
    codec::{amiga, ibm},
    types::{DecodedSector, DecodedTrack},
    MAX_TRACK_SIZE,
};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A deterministic, non-repeating sector payload.
pub fn sector_data(seed: u8, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 251) as u8))
        .collect()
}

/// A minimal, valid 720K DOS boot sector (512 bytes, 9 spt, 2 heads).
pub fn boot_sector_720k() -> Vec<u8> {
    let mut sector = vec![0u8; 512];
    sector[0] = 0xEB;
    sector[1] = 0x3C;
    sector[2] = 0x90;
    sector[3..11].copy_from_slice(b"MSDOS5.0");
    sector[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
    sector[0x0D] = 2;
    sector[0x0E..0x10].copy_from_slice(&1u16.to_le_bytes());
    sector[0x10] = 2;
    sector[0x11..0x13].copy_from_slice(&0x70u16.to_le_bytes());
    sector[0x13..0x15].copy_from_slice(&1440u16.to_le_bytes());
    sector[0x15] = 0xF9;
    sector[0x16..0x18].copy_from_slice(&3u16.to_le_bytes());
    sector[0x18..0x1A].copy_from_slice(&9u16.to_le_bytes());
    sector[0x1A..0x1C].copy_from_slice(&2u16.to_le_bytes());
    sector[0x26] = 0x29;
    sector[0x27..0x2B].copy_from_slice(&0x0070_2020u32.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// A single-sided 360K Atari-style boot sector (512 bytes, 9 spt, 1 head).
pub fn boot_sector_360k_single_sided() -> Vec<u8> {
    let mut sector = boot_sector_720k();
    sector[0x13..0x15].copy_from_slice(&720u16.to_le_bytes());
    sector[0x16..0x18].copy_from_slice(&2u16.to_le_bytes());
    sector[0x1A..0x1C].copy_from_slice(&1u16.to_le_bytes());
    sector
}

/// Build a decoded track of `spt` deterministic sectors.
pub fn filled_track(spt: u32, track_no: u32, seed: u8) -> DecodedTrack {
    let mut track = DecodedTrack::default();
    for s in 0..spt as u8 {
        track.insert_better(
            s,
            DecodedSector::new(sector_data(seed.wrapping_add(s).wrapping_add(track_no as u8), 512), 0),
        );
    }
    track
}

/// Encode an Amiga track for the mock media.
pub fn amiga_track_mfm(track_no: u32, hd: bool, seed: u8) -> Vec<u8> {
    let spt = if hd { 22 } else { 11 };
    let track = filled_track(spt, track_no, seed);
    amiga::encode_track(hd, &track, track_no, MAX_TRACK_SIZE).expect("amiga track encodes")
}

/// Encode an IBM track for the mock media, with sector 0 carrying the given
/// payload (used to plant a boot sector on track 0).
pub fn ibm_track_mfm(track_no: u32, spt: u32, seed: u8, sector0: Option<Vec<u8>>) -> Vec<u8> {
    let mut track = filled_track(spt, track_no, seed);
    if let Some(data) = sector0 {
        track.sectors.insert(0, DecodedSector::new(data, 0));
    }
    ibm::encode_track(false, false, &track, track_no, MAX_TRACK_SIZE).expect("ibm track encodes")
}

/// One physical track of a hybrid disk whose IBM side is single sided: the
/// Amiga layout owns the double-sided numbering, and the IBM identifiers
/// carry the cylinder in their track field, which the double-sided numbering
/// reaches at twice the index. `physical` must therefore be even.
pub fn hybrid_single_sided_track_mfm(
    physical: u32,
    amiga_seed: u8,
    ibm_seed: u8,
    boot: Option<Vec<u8>>,
) -> Vec<u8> {
    assert_eq!(physical % 2, 0, "the single-sided IBM plane only exists on even physical tracks");
    let mut capture = amiga_track_mfm(physical, false, amiga_seed);
    capture.extend_from_slice(&ibm_track_mfm(physical, 9, ibm_seed, boot));
    capture
}

/// Shared state of the in-memory bridge.
pub struct MockDisk {
    /// Raw MFM per linear track (double-sided numbering).
    pub tracks: HashMap<u32, Vec<u8>>,
    pub in_drive: bool,
    pub write_protected: bool,
    pub hd: bool,
    pub physical: bool,
    /// Every cylinder_seek call, in order.
    pub seeks: Vec<(u32, bool)>,
    /// Every linear track requested through mfm_read_track, in order.
    pub track_reads: Vec<u32>,
    /// Number of mfm_write calls.
    pub writes: u32,
    /// Corrupt the next written track (one byte of sector data flipped).
    pub corrupt_next_write: bool,
}

impl MockDisk {
    pub fn new(hd: bool) -> Arc<Mutex<MockDisk>> {
        Arc::new(Mutex::new(MockDisk {
            tracks: HashMap::new(),
            in_drive: true,
            write_protected: false,
            hd,
            physical: false,
            seeks: Vec::new(),
            track_reads: Vec::new(),
            writes: 0,
            corrupt_next_write: false,
        }))
    }
}

/// An image-backed bridge: instant motor, synchronous writes.
pub struct MockBridge {
    pub disk: Arc<Mutex<MockDisk>>,
}

impl BridgeDriver for MockBridge {
    fn mfm_read_track(&mut self, track: u32, _retry: bool, buf: &mut [u8]) -> u32 {
        let mut disk = self.disk.lock().unwrap();
        disk.track_reads.push(track);
        match disk.tracks.get(&track) {
            Some(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                (len * 8) as u32
            }
            None => 0,
        }
    }

    fn mfm_read(&mut self, cylinder: u32, upper_head: bool, retry: bool, buf: &mut [u8]) -> u32 {
        self.mfm_read_track(cylinder * 2 + upper_head as u32, retry, buf)
    }

    fn mfm_write(&mut self, cylinder: u32, upper_head: bool, _ibm_like: bool, buf: &[u8]) -> bool {
        let mut disk = self.disk.lock().unwrap();
        let mut data = buf.to_vec();
        if disk.corrupt_next_write {
            // Flip data bits well inside the first sector's payload.
            let offset = 500.min(data.len().saturating_sub(1));
            data[offset] ^= 0x55;
            disk.corrupt_next_write = false;
        }
        disk.tracks.insert(cylinder * 2 + upper_head as u32, data);
        disk.writes += 1;
        true
    }

    fn cylinder_seek(&mut self, cylinder: u32, upper_head: bool) {
        self.disk.lock().unwrap().seeks.push((cylinder, upper_head));
    }

    fn motor_enable(&mut self, _on: bool, _upper_head: bool) {}

    fn motor_ready(&mut self) -> bool {
        true
    }

    fn write_completed(&mut self) -> bool {
        true
    }

    fn reset_drive(&mut self, _cylinder: u32) -> bool {
        true
    }

    fn is_physical_disk(&self) -> bool {
        self.disk.lock().unwrap().physical
    }

    fn is_disk_in_drive(&mut self) -> bool {
        self.disk.lock().unwrap().in_drive
    }

    fn is_drive_write_protected(&mut self) -> bool {
        self.disk.lock().unwrap().write_protected
    }

    fn is_hd(&self) -> bool {
        self.disk.lock().unwrap().hd
    }

    fn restore_drive(&mut self) -> bool {
        true
    }
}
