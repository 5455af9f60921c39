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

    src/codec/amiga.rs

    The AmigaDOS trackdisk sector codec. Amiga sectors are packed back to
    back with no inter-sector gaps; each one carries a 4-byte info block
    {format, track, sector, sectors-to-gap}, a 16-byte label, a header
    checksum and a data checksum, with every field stored as separate odd and
    even bit planes that must be reinterleaved on read.

    Good documentation on the format can be found at:
    http://lclevy.free.fr/adflib/adf_info.html
*/

use crate::{
    codec::{
        amiga_checksum,
        amiga_join,
        amiga_split,
        apply_amiga_clocks,
        bits_from_mfm,
        find_pattern_u32,
        read_raw_bytes,
    },
    types::{DecodedSector, DecodedTrack},
    DEFAULT_SECTOR_SIZE,
};

/// Two A1 sync bytes open every Amiga sector.
pub const AMIGA_SYNC: u32 = 0x4489_4489;
/// The AmigaDOS v1 format byte.
pub const AMIGA_FORMAT_BYTE: u8 = 0xFF;

/// Raw bytes following the sync: info (8), label (32), header checksum (8),
/// data checksum (8), data (1024).
const SECTOR_RAW_BYTES: usize = 8 + 32 + 8 + 8 + DEFAULT_SECTOR_SIZE * 2;
const HEADER_RAW_BYTES: usize = 8 + 32 + 8 + 8;

/// Raw gap appended after the last sector; the bridge pads the remainder of
/// the revolution.
const TRACK_GAP_BYTES: usize = 120;

/// Default Amiga geometry for the given density: (sectors per track, sector
/// size).
pub fn default_geometry(hd: bool) -> (u32, u32) {
    (if hd { 22 } else { 11 }, DEFAULT_SECTOR_SIZE as u32)
}

/// Decode every Amiga sector found in a raw MFM capture into `out`,
/// keeping the lower-error copy of any sector already present.
///
/// Sectors whose header checksum fails or whose info block names a different
/// track are dropped; a data checksum failure is admitted with `errors > 0`
/// so the retry loop can improve on it.
pub fn find_sectors(mfm: &[u8], bit_count: usize, hd: bool, track: u32, expected: u32, out: &mut DecodedTrack) {
    let bits = bits_from_mfm(mfm, bit_count);
    let max_sectors = expected.max(default_geometry(hd).0);

    let mut pos = 0;
    while let Some(p) = find_pattern_u32(&bits, pos, AMIGA_SYNC) {
        // Resume from here when the sector is rejected.
        pos = p;

        let mut header = [0u8; HEADER_RAW_BYTES];
        if !read_raw_bytes(&bits, p, &mut header) {
            break;
        }

        let info = amiga_join(be32(&header[0..4]), be32(&header[4..8]));
        let [fmt, tt, ss, _to_gap] = info.to_be_bytes();

        let header_sum = amiga_join(be32(&header[40..44]), be32(&header[44..48]));
        let header_calc = amiga_checksum(&header[0..40]);

        if fmt != AMIGA_FORMAT_BYTE || header_sum != header_calc {
            log::trace!(
                "find_sectors(): Rejecting header at bit {}: fmt {:02X}, checksum {:08X}/{:08X}",
                p,
                fmt,
                header_sum,
                header_calc
            );
            continue;
        }

        if tt as u32 != track {
            log::debug!("find_sectors(): Sector for track {} found while reading track {}", tt, track);
            continue;
        }

        if ss as u32 >= max_sectors {
            log::debug!("find_sectors(): Sector id {} out of range ({} max)", ss, max_sectors);
            continue;
        }

        let mut data_raw = vec![0u8; DEFAULT_SECTOR_SIZE * 2];
        if !read_raw_bytes(&bits, p + HEADER_RAW_BYTES * 8, &mut data_raw) {
            break;
        }

        let data_sum = amiga_join(be32(&header[48..52]), be32(&header[52..56]));
        let data_calc = amiga_checksum(&data_raw);

        // Reinterleave the odd/even byte planes.
        let mut data = vec![0u8; DEFAULT_SECTOR_SIZE];
        for (i, byte) in data.iter_mut().enumerate() {
            let odd = data_raw[i] & 0x55;
            let even = data_raw[i + DEFAULT_SECTOR_SIZE] & 0x55;
            *byte = (odd << 1) | even;
        }

        let errors = (data_sum != data_calc) as u32;
        if errors > 0 {
            log::debug!(
                "find_sectors(): Sector {} data checksum mismatch: {:08X}/{:08X}",
                ss,
                data_sum,
                data_calc
            );
        }

        out.insert_better(ss, DecodedSector::new(data, errors));
        pos = p + SECTOR_RAW_BYTES * 8;
    }
}

/// Encode a full track of Amiga sectors back into raw MFM. Returns None when
/// the encoded track would exceed `max_bytes`, or when a sector has the
/// wrong payload size.
pub fn encode_track(_hd: bool, track_data: &DecodedTrack, track: u32, max_bytes: usize) -> Option<Vec<u8>> {
    let count = track_data.len();
    let mut out: Vec<u8> = Vec::with_capacity(count * (SECTOR_RAW_BYTES + 8) + TRACK_GAP_BYTES);
    let mut last_bit = false;

    for (i, (&index, sector)) in track_data.sectors.iter().enumerate() {
        if sector.data.len() != DEFAULT_SECTOR_SIZE {
            log::error!(
                "encode_track(): Sector {} has payload of {} bytes",
                index,
                sector.data.len()
            );
            return None;
        }

        // Pre-sync gap: two zero bytes so the sync marker has a run-in.
        let mut pre = [0u8; 2];
        last_bit = apply_amiga_clocks(&mut pre, last_bit);
        out.extend_from_slice(&pre);
        out.extend_from_slice(&AMIGA_SYNC.to_be_bytes());
        last_bit = true;

        let mut body = vec![0u8; HEADER_RAW_BYTES + DEFAULT_SECTOR_SIZE * 2];

        let info = u32::from_be_bytes([AMIGA_FORMAT_BYTE, track as u8, index, (count - i) as u8]);
        let (odd, even) = amiga_split(info);
        body[0..4].copy_from_slice(&odd.to_be_bytes());
        body[4..8].copy_from_slice(&even.to_be_bytes());
        // Label stays zeroed.

        let header_sum = amiga_checksum(&body[0..40]);
        let (odd, even) = amiga_split(header_sum);
        body[40..44].copy_from_slice(&odd.to_be_bytes());
        body[44..48].copy_from_slice(&even.to_be_bytes());

        for (di, &byte) in sector.data.iter().enumerate() {
            body[HEADER_RAW_BYTES + di] = (byte >> 1) & 0x55;
            body[HEADER_RAW_BYTES + DEFAULT_SECTOR_SIZE + di] = byte & 0x55;
        }

        let data_sum = amiga_checksum(&body[HEADER_RAW_BYTES..]);
        let (odd, even) = amiga_split(data_sum);
        body[48..52].copy_from_slice(&odd.to_be_bytes());
        body[52..56].copy_from_slice(&even.to_be_bytes());

        last_bit = apply_amiga_clocks(&mut body, last_bit);
        out.extend_from_slice(&body);
    }

    let mut gap = vec![0u8; TRACK_GAP_BYTES];
    apply_amiga_clocks(&mut gap, last_bit);
    out.extend_from_slice(&gap);

    if out.len() > max_bytes {
        log::warn!(
            "encode_track(): Encoded {} sectors to {} bytes, over the {} byte budget",
            count,
            out.len(),
            max_bytes
        );
        return None;
    }

    Some(out)
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
