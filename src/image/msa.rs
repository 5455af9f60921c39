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

    src/image/msa.rs

    The Magic Shadow Archiver container, a compressed Atari ST disk image.
    A 10-byte big-endian header is followed by one record per track:
    {BE_u16 dataSize, dataSize bytes}, stored raw when dataSize matches the
    uncompressed track size and RLE compressed otherwise.
*/

use binrw::binrw;

pub const MSA_MARKER: u16 = 0x0F0E;
pub const MSA_RLE_MARKER: u8 = 0xE5;
pub const MSA_HEADER_SIZE: u64 = 10;

#[derive(Debug)]
#[binrw]
#[brw(big)]
pub struct MsaHeader {
    pub marker: u16,
    pub sectors_per_track: u16,
    pub heads_minus_one: u16,
    pub first_track: u16,
    pub last_track: u16,
}

/// One decoded entry of the sparse track index.
#[derive(Debug)]
pub(crate) struct MsaTrack {
    /// File offset of the track data (past its size word), so a later scan
    /// can resume from here.
    pub seek_pos: u64,
    pub data_size: u32,
    pub data: Vec<u8>,
}

/// Expand one track record. Literal bytes copy through; the 0xE5 marker
/// introduces {fill, BE_u16 length}. Returns None on a truncated RLE
/// sequence.
pub(crate) fn decode_track_data(raw: &[u8], uncompressed_size: usize) -> Option<Vec<u8>> {
    if raw.len() == uncompressed_size {
        return Some(raw.to_vec());
    }

    let mut data = Vec::with_capacity(uncompressed_size);
    let mut pos = 0;
    while pos < raw.len() {
        if raw[pos] == MSA_RLE_MARKER {
            if pos + 3 >= raw.len() {
                log::warn!("decode_track_data(): Truncated RLE sequence at offset {}", pos);
                return None;
            }
            let fill = raw[pos + 1];
            let count = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;
            data.resize(data.len() + count, fill);
            pos += 4;
        }
        else {
            data.push(raw[pos]);
            pos += 1;
        }
    }

    Some(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_expansion() {
        // 0xE5 0x00 0x01 0x00 expands to 256 zero bytes.
        let decoded = decode_track_data(&[0xAB, 0xE5, 0x00, 0x01, 0x00, 0xCD], 259).unwrap();
        assert_eq!(decoded.len(), 258);
        assert_eq!(decoded[0], 0xAB);
        assert!(decoded[1..257].iter().all(|&b| b == 0));
        assert_eq!(decoded[257], 0xCD);
    }

    #[test]
    fn uncompressed_passthrough() {
        let raw = vec![0xE5; 16];
        // Size match means raw storage; the marker byte is data.
        assert_eq!(decode_track_data(&raw, 16).unwrap(), raw);
    }

    #[test]
    fn truncated_rle_fails() {
        assert!(decode_track_data(&[0x00, 0xE5, 0x41], 16).is_none());
    }
}
