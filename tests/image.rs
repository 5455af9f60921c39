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
mod common;

use common::*;
use fluxblock::{image::FileBackend, DeviceError, SectorIo, SectorKind};
use std::{fs, path::PathBuf};

fn temp_image(name: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("fluxblock_{}_{}", std::process::id(), name));
    fs::write(&path, contents).expect("temp image written");
    path
}

/// A 720K raw image with a valid boot sector and per-sector fill patterns.
fn image_720k() -> Vec<u8> {
    let mut image = Vec::with_capacity(1440 * 512);
    image.extend_from_slice(&boot_sector_720k());
    for sector in 1..1440u32 {
        image.extend_from_slice(&vec![(sector % 251) as u8; 512]);
    }
    image
}

#[test]
fn img_geometry_from_bpb() {
    init();
    let path = temp_image("boot.img", &image_720k());
    let backend = FileBackend::open(&path).expect("opens");

    assert_eq!(backend.kind(), SectorKind::Ibm);
    assert_eq!(backend.sector_size(), 512);
    assert_eq!(backend.sectors_per_track(), 9);
    assert_eq!(backend.total_tracks(), 160);
    assert_eq!(backend.serial_number(), 0x0070_2020);
    assert_eq!(backend.disk_data_size(), 1440 * 512);
    assert!(!backend.is_write_protected());

    let mut buf = vec![0u8; 512];
    backend.internal_read(0, &mut buf).expect("boot sector reads");
    assert_eq!(buf, boot_sector_720k());

    backend.internal_read(100, &mut buf).expect("sector 100 reads");
    assert_eq!(buf, vec![100u8; 512]);

    let _ = fs::remove_file(path);
}

#[test]
fn img_write_round_trip() {
    init();
    let path = temp_image("write.img", &image_720k());
    let backend = FileBackend::open(&path).expect("opens");

    let payload = sector_data(7, 512);
    backend.internal_write(5, &payload).expect("writes");

    let mut buf = vec![0u8; 512];
    backend.internal_read(5, &mut buf).expect("reads back");
    assert_eq!(buf, payload);

    // And the bytes landed at the right file offset.
    let on_disk = fs::read(&path).unwrap();
    assert_eq!(&on_disk[5 * 512..6 * 512], payload.as_slice());

    let _ = fs::remove_file(path);
}

#[test]
fn adf_defaults_to_amiga() {
    init();
    let path = temp_image("blank.adf", &vec![0u8; 80 * 2 * 11 * 512]);
    let backend = FileBackend::open(&path).expect("opens");

    assert_eq!(backend.kind(), SectorKind::Amiga);
    assert_eq!(backend.serial_number(), u32::from_be_bytes(*b"ADF0"));
    assert_eq!(backend.sectors_per_track(), 11);
    assert_eq!(backend.total_tracks(), 160);

    let _ = fs::remove_file(path);
}

#[test]
fn st_extension_without_bpb_guesses_geometry() {
    init();
    let path = temp_image("plain.st", &vec![0u8; 80 * 2 * 9 * 512]);
    let backend = FileBackend::open(&path).expect("opens");

    assert_eq!(backend.kind(), SectorKind::Atari);
    assert_eq!(backend.serial_number(), u32::from_be_bytes(*b"STF0"));
    assert_eq!(backend.sectors_per_track(), 9);
    assert_eq!(backend.total_tracks(), 160);

    let _ = fs::remove_file(path);
}

/// Build an MSA image: 9 sectors per track, 2 heads, tracks 0-79, with
/// track 1 starting with an RLE run of 256 zero bytes.
fn msa_image() -> Vec<u8> {
    let mut image = Vec::new();
    image.extend_from_slice(&0x0F0Eu16.to_be_bytes());
    image.extend_from_slice(&9u16.to_be_bytes());
    image.extend_from_slice(&1u16.to_be_bytes()); // heads - 1
    image.extend_from_slice(&0u16.to_be_bytes());
    image.extend_from_slice(&79u16.to_be_bytes());

    // Track 0: one RLE run filling the whole track with 0x30.
    image.extend_from_slice(&4u16.to_be_bytes());
    image.extend_from_slice(&[0xE5, 0x30, 0x12, 0x00]);

    // Track 1: 0xE5 0x00 0x01 0x00 expands to 256 zeros, then literals.
    let literals = 9 * 512 - 256;
    image.extend_from_slice(&(4 + literals as u16).to_be_bytes());
    image.extend_from_slice(&[0xE5, 0x00, 0x01, 0x00]);
    image.extend_from_slice(&vec![0x77u8; literals]);

    // Track 2: stored uncompressed.
    image.extend_from_slice(&(9u16 * 512).to_be_bytes());
    image.extend_from_slice(&vec![0x55u8; 9 * 512]);

    image
}

#[test]
fn msa_deferred_decompression() {
    init();
    // S4: reading sector 9 walks the sparse index through tracks 0 and 1.
    let path = temp_image("disk.msa", &msa_image());
    let backend = FileBackend::open(&path).expect("opens");

    assert_eq!(backend.kind(), SectorKind::Atari);
    assert_eq!(backend.serial_number(), u32::from_be_bytes(*b"MSA "));
    assert_eq!(backend.sectors_per_track(), 9);
    assert_eq!(backend.total_tracks(), 160);
    assert!(backend.is_write_protected());

    let mut buf = vec![0u8; 512];
    backend.internal_read(9, &mut buf).expect("track 1 decodes");
    // 256 zeros from the RLE run, then the literal fill.
    assert!(buf[..256].iter().all(|&b| b == 0));
    assert!(buf[256..].iter().all(|&b| b == 0x77));

    // Track 0 was decoded on the way.
    backend.internal_read(0, &mut buf).expect("track 0 decodes");
    assert_eq!(buf, vec![0x30u8; 512]);

    // The uncompressed record reads straight through.
    backend.internal_read(18, &mut buf).expect("track 2 decodes");
    assert_eq!(buf, vec![0x55u8; 512]);

    // MSA images are read-only.
    assert!(matches!(
        backend.internal_write(0, &vec![0u8; 512]),
        Err(DeviceError::WriteProtected)
    ));

    let _ = fs::remove_file(path);
}

#[test]
fn msa_bad_marker_is_rejected() {
    init();
    let mut image = msa_image();
    image[0] = 0xFF;
    let path = temp_image("bad.msa", &image);
    assert!(FileBackend::open(&path).is_err());
    let _ = fs::remove_file(path);
}
