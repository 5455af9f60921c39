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

    src/cache.rs

    The LRU sector cache that sits above every media backend, and the
    SectorIo trait that backends implement underneath it.
*/

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::DeviceError;

/// The backend contract underneath the LRU layer. `internal_*` calls are the
/// uncached operations; the remaining methods describe the media.
///
/// Backends are shared between the cache layer and (for the MFM engine) a
/// monitor thread, so implementations carry their own interior lock. The
/// nesting order is always cache lock first, backend lock second.
pub trait SectorIo: Send + Sync {
    fn internal_read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn internal_write(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError>;

    /// Read through the hybrid plane when one exists. Single-format backends
    /// serve this from the primary plane.
    fn internal_hybrid_read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.internal_read(sector, buf)
    }

    fn is_disk_present(&self) -> bool;
    fn is_write_protected(&self) -> bool;

    /// False once the backing source is gone (file closed, bridge lost).
    fn available(&self) -> bool {
        true
    }

    fn sector_size(&self) -> u32;
    fn sectors_per_track(&self) -> u32;
    fn total_tracks(&self) -> u32;

    fn hybrid_sector_size(&self) -> u32 {
        self.sector_size()
    }
    fn hybrid_sectors_per_track(&self) -> u32 {
        self.sectors_per_track()
    }
    fn hybrid_total_tracks(&self) -> u32 {
        self.total_tracks()
    }

    fn serial_number(&self) -> u32;
    fn disk_data_size(&self) -> u64;

    /// Push any pending writes to the media. A successful `internal_write`
    /// alone does not imply durability.
    fn flush_write_cache(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Drop any backend-side cached state (track planes, dirty map).
    fn reset_backend(&self) {}
}

struct CachedSector {
    data: Vec<u8>,
    last_use: u64,
}

#[derive(Default)]
struct LruState {
    max_mem: usize,
    max_entries: usize,
    tick: u64,
    entries: HashMap<u32, CachedSector>,
}

impl LruState {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn read(&mut self, sector: u32, buf: &mut [u8]) -> bool {
        if self.max_mem == 0 {
            return false;
        }
        if self.max_entries == 0 {
            self.max_entries = self.max_mem / buf.len().max(1);
        }
        let tick = self.touch();
        match self.entries.get_mut(&sector) {
            Some(entry) => {
                let len = entry.data.len().min(buf.len());
                buf[..len].copy_from_slice(&entry.data[..len]);
                entry.last_use = tick;
                true
            }
            None => false,
        }
    }

    fn write(&mut self, sector: u32, data: &[u8]) {
        if self.max_mem == 0 {
            return;
        }
        if self.max_entries == 0 {
            self.max_entries = self.max_mem / data.len().max(1);
        }
        let tick = self.touch();

        if let Some(entry) = self.entries.get_mut(&sector) {
            entry.data.clear();
            entry.data.extend_from_slice(data);
            entry.last_use = tick;
            return;
        }

        let mut buffer = if self.entries.len() >= self.max_entries {
            match self.release_oldest() {
                Some(mut old) => {
                    // Reuse the evicted allocation unless the sector size
                    // changed.
                    if old.len() != data.len() {
                        old = Vec::with_capacity(data.len());
                    }
                    old
                }
                None => return,
            }
        }
        else {
            Vec::with_capacity(data.len())
        };

        buffer.clear();
        buffer.extend_from_slice(data);
        self.entries.insert(
            sector,
            CachedSector {
                data: buffer,
                last_use: tick,
            },
        );
    }

    /// Remove and return the least recently used entry's buffer.
    fn release_oldest(&mut self) -> Option<Vec<u8>> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_use)
            .map(|(sector, _)| *sector)?;
        self.entries.remove(&oldest).map(|e| e.data)
    }

    fn reset(&mut self) {
        self.entries.clear();
    }
}

/// An LRU read accelerator over a media backend, bounded by a byte budget.
/// A budget of 0 disables caching entirely.
///
/// All operations hold the cache mutex for the duration of the call, so a
/// read and a write can never interleave on the same backend.
pub struct SectorCache {
    lru: Mutex<LruState>,
    backend: Arc<dyn SectorIo>,
}

impl SectorCache {
    pub fn new(backend: Arc<dyn SectorIo>, max_cache_mem: usize) -> Self {
        Self {
            lru: Mutex::new(LruState {
                max_mem: max_cache_mem,
                ..Default::default()
            }),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SectorIo> {
        &self.backend
    }

    /// Read one sector, serving from the cache when possible and admitting
    /// the result on a successful miss.
    pub fn read_data(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut lru = self.lru.lock().unwrap();

        if lru.read(sector, buf) {
            return Ok(());
        }

        self.backend.internal_read(sector, buf)?;
        lru.write(sector, buf);
        Ok(())
    }

    /// Write one sector through to the backend, updating the cached copy on
    /// success.
    pub fn write_data(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
        let mut lru = self.lru.lock().unwrap();

        self.backend.internal_write(sector, buf)?;
        lru.write(sector, buf);
        Ok(())
    }

    /// Read through the hybrid plane. Hybrid reads are already served from a
    /// structured track cache, so the LRU is bypassed.
    pub fn hybrid_read_data(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let _lru = self.lru.lock().unwrap();
        self.backend.internal_hybrid_read(sector, buf)
    }

    /// Empty the LRU and drop any backend-side cached state.
    pub fn reset_cache(&self) {
        let mut lru = self.lru.lock().unwrap();
        lru.reset();
        self.backend.reset_backend();
    }

    pub fn is_disk_present(&self) -> bool {
        self.backend.is_disk_present()
    }

    pub fn is_write_protected(&self) -> bool {
        self.backend.is_write_protected()
    }

    pub fn sector_size(&self) -> u32 {
        self.backend.sector_size()
    }

    pub fn hybrid_sector_size(&self) -> u32 {
        self.backend.hybrid_sector_size()
    }

    pub fn hybrid_sectors_per_track(&self) -> u32 {
        self.backend.hybrid_sectors_per_track()
    }

    pub fn hybrid_total_tracks(&self) -> u32 {
        self.backend.hybrid_total_tracks()
    }

    pub fn serial_number(&self) -> u32 {
        self.backend.serial_number()
    }

    pub fn disk_data_size(&self) -> u64 {
        self.backend.disk_data_size()
    }

    pub fn flush_write_cache(&self) -> Result<(), DeviceError> {
        let _lru = self.lru.lock().unwrap();
        self.backend.flush_write_cache()
    }
}
