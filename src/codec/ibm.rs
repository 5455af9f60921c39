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

    src/codec/ibm.rs

    The IBM System/34 MFM sector codec, shared by PC and Atari ST disks.
    Sectors are addressed by A1 A1 A1 FE identifier marks carrying C/H/R/N
    and a CRC, followed by an A1 A1 A1 FB (or F8 for deleted) data mark with
    the payload and a second CRC.

    Atari ST tracks use the same framing with tighter gaps and occasionally
    off-convention identifiers; deviations are reported through the
    `non_standard` flag so the engine can classify the media.
*/

use crate::{
    codec::{bits_from_mfm, find_ibm_marker, read_mfm_bytes, MfmWriter, MFM_IAM_WORD, MFM_SYNC_WORD},
    types::{DecodedSector, DecodedTrack},
    util::crc_ibm_3740,
};

pub const GAP_BYTE: u8 = 0x4E;
pub const SYNC_BYTE: u8 = 0x00;
pub const SYNC_LEN: usize = 12;

pub const IBM_GAP4A: usize = 80;
pub const IBM_GAP1: usize = 50;
pub const IBM_GAP2: usize = 22;
pub const ISO_GAP1: usize = 32;

/// Maximum distance (in data bytes) between an identifier and its data mark
/// before the pairing is considered broken.
const DAM_WINDOW_BYTES: usize = 64;

/// Decode every IBM/Atari sector found in a raw MFM capture into `out`.
///
/// `non_standard` is raised when identifiers deviate from IBM PC floppy
/// conventions (sector size code, numbering, or recorded track address) -
/// the heuristic that separates Atari ST media from PC media.
pub fn find_sectors(
    mfm: &[u8],
    bit_count: usize,
    hd: bool,
    track: u32,
    expected: u32,
    out: &mut DecodedTrack,
    non_standard: &mut bool,
) {
    let bits = bits_from_mfm(mfm, bit_count);

    // C/H expected when the track is addressed with two heads, which is how
    // every supported double-sided format numbers tracks.
    let expect_c = (track / 2) as u8;
    let expect_h = (track % 2) as u8;

    let mut pos = 0;
    let mut pending: Option<(u8, u8, usize)> = None; // (r, n, marker end)

    while let Some((p, mark)) = find_ibm_marker(&bits, pos) {
        pos = p;
        match mark {
            0xFE => {
                let mut id = [0u8; 6];
                if !read_mfm_bytes(&bits, p, &mut id) {
                    break;
                }
                let [c, h, r, n, crc_hi, crc_lo] = id;

                let crc_calc = crc_ibm_3740(&[0xA1, 0xA1, 0xA1, 0xFE, c, h, r, n], None);
                let crc_rec = u16::from_be_bytes([crc_hi, crc_lo]);
                if crc_calc != crc_rec {
                    log::trace!("find_sectors(): IDAM CRC mismatch at bit {}", p);
                    pending = None;
                    continue;
                }

                if n != 2 || r == 0 || (!hd && r > 9) {
                    *non_standard = true;
                }
                if c != expect_c || h != expect_h {
                    log::debug!(
                        "find_sectors(): Identifier c:{} h:{} while reading track {} (expected c:{} h:{})",
                        c,
                        h,
                        track,
                        expect_c,
                        expect_h
                    );
                    *non_standard = true;
                }

                pending = Some((r, n, p + 6 * 16));
                pos = p + 6 * 16;
            }
            0xFB | 0xF8 => {
                let Some((r, n, id_end)) = pending.take() else {
                    continue;
                };
                if p.saturating_sub(id_end) > DAM_WINDOW_BYTES * 16 {
                    log::trace!("find_sectors(): DAM at bit {} too far from identifier", p);
                    continue;
                }
                if r == 0 || n > 3 {
                    continue;
                }

                let size = 128usize << n;
                let mut data = vec![0u8; size + 2];
                if !read_mfm_bytes(&bits, p, &mut data) {
                    break;
                }

                let crc_rec = u16::from_be_bytes([data[size], data[size + 1]]);
                let crc_calc = crc_ibm_3740(
                    &data[..size],
                    Some(crc_ibm_3740(&[0xA1, 0xA1, 0xA1, mark], None)),
                );
                let errors = (crc_calc != crc_rec) as u32;
                if errors > 0 {
                    log::debug!("find_sectors(): Sector {} data CRC mismatch", r);
                }

                let index = r - 1;
                if expected > 0 && index as u32 >= expected {
                    log::debug!("find_sectors(): Sector id {} beyond expected {} per track", r, expected);
                }

                data.truncate(size);
                out.insert_better(index, DecodedSector::new(data, errors));
                pos = p + (size + 2) * 16;
            }
            _ => {
                // Index mark; nothing to decode.
            }
        }
    }
}

/// Encode a full track of IBM/Atari sectors into raw MFM. `as_atari`
/// selects the ISO-style layout without an index mark and with tighter
/// gaps. Returns None when the encoded track exceeds `max_bytes` or a
/// sector payload is not a valid System/34 size.
pub fn encode_track(
    hd: bool,
    as_atari: bool,
    track_data: &DecodedTrack,
    track: u32,
    max_bytes: usize,
) -> Option<Vec<u8>> {
    let spt = track_data.len();
    let mut w = MfmWriter::new(max_bytes);

    if as_atari {
        w.write_repeated(GAP_BYTE, ISO_GAP1);
    }
    else {
        w.write_repeated(GAP_BYTE, IBM_GAP4A);
        w.write_repeated(SYNC_BYTE, SYNC_LEN);
        for _ in 0..3 {
            w.write_raw_u16(MFM_IAM_WORD);
        }
        w.write_byte(0xFC);
        w.write_repeated(GAP_BYTE, IBM_GAP1);
    }

    let gap3 = if hd {
        108
    }
    else if as_atari || spt > 9 {
        40
    }
    else {
        80
    };

    let c = (track / 2) as u8;
    let h = (track % 2) as u8;

    for (&index, sector) in track_data.sectors.iter() {
        let n = size_code(sector.data.len())?;
        let r = index + 1;

        w.write_repeated(SYNC_BYTE, SYNC_LEN);
        for _ in 0..3 {
            w.write_raw_u16(MFM_SYNC_WORD);
        }
        w.write_byte(0xFE);
        w.write_bytes(&[c, h, r, n]);
        let crc = crc_ibm_3740(&[0xA1, 0xA1, 0xA1, 0xFE, c, h, r, n], None);
        w.write_bytes(&crc.to_be_bytes());

        w.write_repeated(GAP_BYTE, IBM_GAP2);
        w.write_repeated(SYNC_BYTE, SYNC_LEN);
        for _ in 0..3 {
            w.write_raw_u16(MFM_SYNC_WORD);
        }
        w.write_byte(0xFB);
        w.write_bytes(&sector.data);
        let crc = crc_ibm_3740(
            &sector.data,
            Some(crc_ibm_3740(&[0xA1, 0xA1, 0xA1, 0xFB], None)),
        );
        w.write_bytes(&crc.to_be_bytes());

        w.write_repeated(GAP_BYTE, gap3);
    }

    // Lead-out; the bridge pads the rest of the revolution.
    w.write_repeated(GAP_BYTE, 24);

    w.finish()
}

/// System/34 size code for a payload length, if one exists.
fn size_code(len: usize) -> Option<u8> {
    match len {
        128 => Some(0),
        256 => Some(1),
        512 => Some(2),
        1024 => Some(3),
        _ => {
            log::error!("size_code(): Unsupported sector payload of {} bytes", len);
            None
        }
    }
}
