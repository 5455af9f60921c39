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

    src/image/mod.rs

    The sector-image file backend. The filename extension selects the
    default interpretation (IMG/IMA/DSK: IBM, ST: Atari, MSA: compressed
    Atari, anything else: Amiga); IBM and Atari images are refined by
    parsing the boot sector BPB, and unrecognizable geometry is guessed from
    the file size.
*/

pub mod msa;

use binrw::BinRead;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

use crate::{
    boot_sector::parse_boot_sector,
    cache::{SectorCache, SectorIo},
    image::msa::{decode_track_data, MsaHeader, MsaTrack, MSA_HEADER_SIZE, MSA_MARKER},
    types::SectorKind,
    DeviceError,
    DEFAULT_SECTOR_SIZE,
};

/// LRU budget used when wrapping a file backend: a full HD Amiga disk.
pub const FILE_CACHE_MEM: usize = 512 * 84 * 2 * 2 * 11;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FileMode {
    Normal,
    Msa,
}

struct FileState {
    file: Option<File>,
    read_only: bool,
    mode: FileMode,
    kind: SectorKind,
    serial: u32,
    sector_size: u32,
    sectors_per_track: u32,
    heads: u32,
    total_tracks: u32,
    first_track: u32,
    msa_tracks: BTreeMap<u32, MsaTrack>,
}

/// Reads and writes logical sectors from a disk-image file.
pub struct FileBackend {
    state: Mutex<FileState>,
}

impl FileBackend {
    /// Open an image file, writable when the filesystem allows it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let (file, read_only) = match File::options().read(true).write(true).open(path) {
            Ok(f) => (f, false),
            Err(_) => (File::open(path).map_err(|_| DeviceError::Io)?, true),
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::new(file, &filename, read_only)
    }

    /// Interpret an already-open file. `filename` supplies the extension
    /// used for format selection.
    pub fn new(mut file: File, filename: &str, read_only: bool) -> Result<Self, DeviceError> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_uppercase())
            .unwrap_or_default();

        let mut state = FileState {
            file: None,
            read_only,
            mode: FileMode::Normal,
            kind: SectorKind::Amiga,
            serial: u32::from_be_bytes(*b"ADF0"),
            sector_size: DEFAULT_SECTOR_SIZE as u32,
            sectors_per_track: 0,
            heads: 2,
            total_tracks: 0,
            first_track: 0,
            msa_tracks: BTreeMap::new(),
        };

        match extension.as_str() {
            "IMG" | "IMA" | "DSK" => {
                state.kind = SectorKind::Ibm;
                state.serial = u32::from_be_bytes(*b"IMA0");
            }
            "ST" => {
                state.kind = SectorKind::Atari;
                state.serial = u32::from_be_bytes(*b"STF0");
            }
            "MSA" => {
                file.seek(SeekFrom::Start(0)).map_err(|_| DeviceError::Io)?;
                let header = MsaHeader::read(&mut file).map_err(|_| DeviceError::Io)?;
                if header.marker != MSA_MARKER {
                    log::error!("FileBackend::new(): Bad MSA marker {:04X}", header.marker);
                    return Err(DeviceError::BadGeometry);
                }
                state.kind = SectorKind::Atari;
                state.serial = u32::from_be_bytes(*b"MSA ");
                state.mode = FileMode::Msa;
                state.heads = header.heads_minus_one as u32 + 1;
                state.first_track = header.first_track as u32;
                state.total_tracks =
                    (header.last_track as u32 - header.first_track as u32 + 1) * state.heads;
                state.sectors_per_track = header.sectors_per_track as u32;
            }
            _ => {}
        }

        let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        state.file = Some(file);

        // IBM and Atari images carry their own geometry in the boot sector.
        if state.mode == FileMode::Normal && matches!(state.kind, SectorKind::Ibm | SectorKind::Atari) {
            let mut boot = [0u8; 128];
            if state.read_sector(0, &mut boot).is_ok() {
                match parse_boot_sector(&boot, state.serial) {
                    Some(info) => {
                        state.serial = info.serial;
                        state.heads = info.heads;
                        state.sector_size = info.sector_size;
                        state.sectors_per_track = info.sectors_per_track;
                        state.total_tracks = info.total_sectors / info.sectors_per_track.max(1);
                    }
                    None => {
                        log::debug!("FileBackend::new(): No valid BPB in {}; guessing geometry", filename);
                        state.sector_size = DEFAULT_SECTOR_SIZE as u32;
                        state.heads = 2;
                    }
                }
            }
        }

        if state.sectors_per_track == 0 {
            state.sectors_per_track = guess_sectors_per_track(file_size, state.sector_size);
        }
        if state.total_tracks == 0 {
            state.total_tracks = if state.sectors_per_track > 0 {
                (file_size as u32 / state.sectors_per_track) / state.sector_size
            }
            else {
                80
            };
        }

        log::debug!(
            "FileBackend::new(): {} opened as {} ({} x {} byte sectors per track, {} tracks)",
            filename,
            state.kind,
            state.sectors_per_track,
            state.sector_size,
            state.total_tracks
        );

        Ok(Self { state: Mutex::new(state) })
    }

    /// Wrap this backend in a sector cache with the standard file budget.
    pub fn into_cache(self) -> SectorCache {
        SectorCache::new(std::sync::Arc::new(self), FILE_CACHE_MEM)
    }

    pub fn kind(&self) -> SectorKind {
        self.state.lock().unwrap().kind
    }

    /// Close the backing file; subsequent operations fail.
    pub fn quick_close(&self) {
        self.state.lock().unwrap().file = None;
    }
}

impl FileState {
    fn read_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        match self.mode {
            FileMode::Normal => {
                let file = self.file.as_mut().ok_or(DeviceError::NoMedia)?;
                let pos = sector as u64 * self.sector_size as u64;
                file.seek(SeekFrom::Start(pos)).map_err(|_| DeviceError::Io)?;
                file.read_exact(buf).map_err(|_| DeviceError::Io)?;
                Ok(())
            }
            FileMode::Msa => self.read_msa_sector(sector, buf),
        }
    }

    fn read_msa_sector(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let spt = self.sectors_per_track.max(1);
        let wanted = sector / spt;
        let uncompressed = (self.sector_size * spt) as usize;

        if !self.msa_tracks.contains_key(&wanted) {
            // Resume the scan from the highest track already indexed
            // instead of rescanning the whole file.
            let (mut track, mut seek_pos) = match self.msa_tracks.iter().next_back() {
                Some((&last, entry)) => (last + 1, entry.seek_pos + entry.data_size as u64),
                None => (self.first_track, MSA_HEADER_SIZE),
            };

            let file = self.file.as_mut().ok_or(DeviceError::NoMedia)?;
            file.seek(SeekFrom::Start(seek_pos)).map_err(|_| DeviceError::Io)?;

            while track <= wanted {
                let mut size_word = [0u8; 2];
                file.read_exact(&mut size_word).map_err(|_| DeviceError::Io)?;
                let data_size = u16::from_be_bytes(size_word) as u32;
                seek_pos += 2;

                let mut raw = vec![0u8; data_size as usize];
                file.read_exact(&mut raw).map_err(|_| DeviceError::Io)?;

                let data = decode_track_data(&raw, uncompressed).ok_or(DeviceError::Io)?;
                if data.len() < uncompressed {
                    log::warn!(
                        "read_msa_sector(): Track {} decoded to {} bytes, expected {}",
                        track,
                        data.len(),
                        uncompressed
                    );
                    return Err(DeviceError::Io);
                }

                self.msa_tracks.insert(
                    track,
                    MsaTrack {
                        seek_pos,
                        data_size,
                        data,
                    },
                );
                seek_pos += data_size as u64;
                track += 1;
            }
        }

        let entry = self.msa_tracks.get(&wanted).ok_or(DeviceError::BadGeometry)?;
        let offset = ((sector % spt) * self.sector_size) as usize;
        if offset + buf.len() > entry.data.len() {
            return Err(DeviceError::BadGeometry);
        }
        buf.copy_from_slice(&entry.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_sector(&mut self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
        match self.mode {
            FileMode::Normal => {
                if self.read_only {
                    return Err(DeviceError::WriteProtected);
                }
                let file = self.file.as_mut().ok_or(DeviceError::NoMedia)?;
                let pos = sector as u64 * self.sector_size as u64;
                file.seek(SeekFrom::Start(pos)).map_err(|_| DeviceError::Io)?;
                file.write_all(buf).map_err(|_| DeviceError::Io)?;
                Ok(())
            }
            FileMode::Msa => Err(DeviceError::WriteProtected),
        }
    }
}

impl SectorIo for FileBackend {
    fn internal_read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.state.lock().unwrap().read_sector(sector, buf)
    }

    fn internal_write(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
        self.state.lock().unwrap().write_sector(sector, buf)
    }

    fn is_disk_present(&self) -> bool {
        self.available()
    }

    fn is_write_protected(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.mode == FileMode::Msa || state.read_only
    }

    fn available(&self) -> bool {
        self.state.lock().unwrap().file.is_some()
    }

    fn sector_size(&self) -> u32 {
        self.state.lock().unwrap().sector_size
    }

    fn sectors_per_track(&self) -> u32 {
        self.state.lock().unwrap().sectors_per_track
    }

    fn total_tracks(&self) -> u32 {
        self.state.lock().unwrap().total_tracks
    }

    fn serial_number(&self) -> u32 {
        self.state.lock().unwrap().serial
    }

    fn disk_data_size(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// Guess sectors per track from the image size when no BPB is available.
/// Standard images span 80-83 cylinders of two heads.
pub fn guess_sectors_per_track(image_size: u64, sector_size: u32) -> u32 {
    let total = (image_size / sector_size.max(1) as u64) as u32;

    for cylinders in 80..=83 {
        for spt in [9, 10, 11, 18] {
            if total == cylinders * 2 * spt {
                return spt;
            }
        }
        // Amiga HD.
        if total == 2 * cylinders * 2 * 11 {
            return 22;
        }
    }

    if total > 84 * 2 * 11 {
        22
    }
    else {
        11
    }
}
