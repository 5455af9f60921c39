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

use common::init;
use fluxblock::{DeviceError, SectorCache, SectorIo};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

const SECTOR_SIZE: usize = 512;

/// A trivial in-memory backend that counts how often the cache layer falls
/// through to it.
#[derive(Default)]
struct MemBackend {
    store: Mutex<HashMap<u32, Vec<u8>>>,
    reads: Mutex<u32>,
    hybrid_reads: Mutex<u32>,
    fail_writes: bool,
}

impl MemBackend {
    fn read_count(&self) -> u32 {
        *self.reads.lock().unwrap()
    }
}

impl SectorIo for MemBackend {
    fn internal_read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        *self.reads.lock().unwrap() += 1;
        let store = self.store.lock().unwrap();
        match store.get(&sector) {
            Some(data) => {
                buf.copy_from_slice(data);
                Ok(())
            }
            None => {
                buf.fill(sector as u8);
                Ok(())
            }
        }
    }

    fn internal_write(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
        if self.fail_writes {
            return Err(DeviceError::Io);
        }
        self.store.lock().unwrap().insert(sector, buf.to_vec());
        Ok(())
    }

    fn internal_hybrid_read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        *self.hybrid_reads.lock().unwrap() += 1;
        self.internal_read(sector, buf)
    }

    fn is_disk_present(&self) -> bool {
        true
    }
    fn is_write_protected(&self) -> bool {
        false
    }
    fn sector_size(&self) -> u32 {
        SECTOR_SIZE as u32
    }
    fn sectors_per_track(&self) -> u32 {
        9
    }
    fn total_tracks(&self) -> u32 {
        160
    }
    fn serial_number(&self) -> u32 {
        0
    }
    fn disk_data_size(&self) -> u64 {
        160 * 9 * SECTOR_SIZE as u64
    }
}

#[test]
fn read_idempotence_and_hit_path() {
    init();
    let backend = Arc::new(MemBackend::default());
    let cache = SectorCache::new(backend.clone(), 64 * SECTOR_SIZE);

    let mut first = vec![0u8; SECTOR_SIZE];
    let mut second = vec![0u8; SECTOR_SIZE];
    cache.read_data(12, &mut first).unwrap();
    cache.read_data(12, &mut second).unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.read_count(), 1, "second read must be a cache hit");
}

#[test]
fn lru_eviction_holds_budget() {
    init();
    let budget_entries = 4u32;
    let backend = Arc::new(MemBackend::default());
    let cache = SectorCache::new(backend.clone(), budget_entries as usize * SECTOR_SIZE);

    // Admit budget + 3 distinct sectors, in order.
    let extra = 3u32;
    for sector in 0..budget_entries + extra {
        let data = vec![sector as u8; SECTOR_SIZE];
        cache.write_data(sector, &data).unwrap();
    }

    // The cache holds exactly `budget_entries`; the first `extra` admitted
    // (oldest by last use) are gone and fall through to the backend.
    let mut buf = vec![0u8; SECTOR_SIZE];
    let before = backend.read_count();
    for sector in extra..budget_entries + extra {
        cache.read_data(sector, &mut buf).unwrap();
    }
    assert_eq!(backend.read_count(), before, "surviving entries must hit the cache");

    for sector in 0..extra {
        cache.read_data(sector, &mut buf).unwrap();
    }
    assert_eq!(
        backend.read_count(),
        before + extra,
        "evicted entries must miss the cache"
    );
}

#[test]
fn zero_budget_disables_caching() {
    init();
    let backend = Arc::new(MemBackend::default());
    let cache = SectorCache::new(backend.clone(), 0);

    let mut buf = vec![0u8; SECTOR_SIZE];
    cache.read_data(7, &mut buf).unwrap();
    cache.read_data(7, &mut buf).unwrap();
    assert_eq!(backend.read_count(), 2, "no budget, no hits");
}

#[test]
fn failed_write_is_not_cached() {
    init();
    let backend = Arc::new(MemBackend {
        fail_writes: true,
        ..Default::default()
    });
    let cache = SectorCache::new(backend.clone(), 64 * SECTOR_SIZE);

    let data = vec![0xAB; SECTOR_SIZE];
    assert!(cache.write_data(3, &data).is_err());

    // The read must come from the backend, not a stale cached copy of the
    // failed write.
    let mut buf = vec![0u8; SECTOR_SIZE];
    cache.read_data(3, &mut buf).unwrap();
    assert_eq!(buf, vec![3u8; SECTOR_SIZE]);
}

#[test]
fn hybrid_reads_bypass_the_lru() {
    init();
    let backend = Arc::new(MemBackend::default());
    let cache = SectorCache::new(backend.clone(), 64 * SECTOR_SIZE);

    let mut buf = vec![0u8; SECTOR_SIZE];
    cache.hybrid_read_data(9, &mut buf).unwrap();
    cache.hybrid_read_data(9, &mut buf).unwrap();
    assert_eq!(*backend.hybrid_reads.lock().unwrap(), 2);

    // And they do not admit entries either.
    cache.read_data(9, &mut buf).unwrap();
    assert_eq!(backend.read_count(), 3);
}

#[test]
fn reset_cache_drops_entries() {
    init();
    let backend = Arc::new(MemBackend::default());
    let cache = SectorCache::new(backend.clone(), 64 * SECTOR_SIZE);

    let mut buf = vec![0u8; SECTOR_SIZE];
    cache.read_data(1, &mut buf).unwrap();
    cache.reset_cache();
    cache.read_data(1, &mut buf).unwrap();
    assert_eq!(backend.read_count(), 2);
}
