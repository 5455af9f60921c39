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

    src/engine/mod.rs

    The MFM track engine: decodes raw flux from the bridge into addressable
    sectors, owns the per-plane track caches and the dirty map, runs the
    motor/seek lifecycle, identifies the sector format of freshly inserted
    media, and performs write-back flushes with full-track encode and
    read-back verification.

    One mutex serializes every engine state transition; the media change
    callback is the only thing invoked with the lock released.
*/

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        Weak,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    boot_sector::parse_boot_sector,
    bridge::BridgeDriver,
    cache::SectorIo,
    chs::DiskCh,
    codec::{amiga, ibm},
    types::{DecodedSector, DecodedTrack, DiskDensity, PlaneGeometry, SectorKind},
    util::tick_ms,
    DeviceError,
    DISK_WRITE_TIMEOUT,
    FORCE_FLUSH_AT_TRACKS,
    MAX_RETRIES,
    MAX_TRACKS,
    MAX_TRACK_SIZE,
    MOTOR_IDLE_TIMEOUT,
    MOTOR_TIMEOUT_TIME,
    TRACK_READ_TIMEOUT,
};

/// Cadence of the motor/media monitor tick.
pub const MOTOR_MONITOR_INTERVAL: u64 = 200;

/// Invoked (outside the engine lock) once per media change edge.
pub type DiskChangeCallback = Box<dyn Fn(bool, SectorKind) + Send>;

/// What to do when a sector still fails after the retry budget.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    Retry,
    Ignore,
    AlwaysIgnore,
    Abort,
}

/// Injected decision point for unrecoverable read errors, replacing any
/// interactive prompt so the engine stays headless and testable.
pub trait RetryPolicy: Send + Sync {
    fn on_read_errors(&self) -> RetryDecision;
}

/// The default policy: give up.
pub struct NoPrompt;

impl RetryPolicy for NoPrompt {
    fn on_read_errors(&self) -> RetryDecision {
        RetryDecision::Abort
    }
}

/// How the two sector layouts of a hybrid disk share the physical media.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum HybridLayout {
    /// Both layouts are double sided and share track numbering.
    DoubleSided,
    /// Single-sided IBM/Atari side over a double-sided Amiga disk: IBM
    /// track `t` lives on the physical track Amiga numbering calls `2t`.
    AmigaDoubleIbmSingle,
}

/// One logical view of the media: geometry plus a decoded-track cache slot
/// per linear track.
struct Plane {
    geometry: PlaneGeometry,
    tracks: Vec<DecodedTrack>,
}

impl Plane {
    fn new(geometry: PlaneGeometry) -> Self {
        Self {
            geometry,
            tracks: (0..MAX_TRACKS).map(|_| DecodedTrack::default()).collect(),
        }
    }

    fn clear(&mut self) {
        for track in self.tracks.iter_mut() {
            track.clear();
        }
    }
}

/// The track cache. Plane 1 exists only for hybrid disks, which keeps the
/// "plane 1 is meaningful only in hybrid mode" invariant in the type.
enum PlaneSet {
    Single(Plane),
    Hybrid {
        amiga: Plane,
        ibm: Plane,
        layout: HybridLayout,
    },
}

impl PlaneSet {
    fn select(&self, plane: usize) -> Option<&Plane> {
        match (self, plane) {
            (PlaneSet::Single(p), 0) => Some(p),
            (PlaneSet::Hybrid { amiga, .. }, 0) => Some(amiga),
            (PlaneSet::Hybrid { ibm, .. }, 1) => Some(ibm),
            _ => None,
        }
    }

    fn primary(&self) -> &Plane {
        match self {
            PlaneSet::Single(p) => p,
            PlaneSet::Hybrid { amiga, .. } => amiga,
        }
    }

    fn primary_mut(&mut self) -> &mut Plane {
        match self {
            PlaneSet::Single(p) => p,
            PlaneSet::Hybrid { amiga, .. } => amiga,
        }
    }

    fn clear_all(&mut self) {
        match self {
            PlaneSet::Single(p) => p.clear(),
            PlaneSet::Hybrid { amiga, ibm, .. } => {
                amiga.clear();
                ibm.clear();
            }
        }
    }
}

struct EngineState {
    bridge: Box<dyn BridgeDriver>,
    disk_type: SectorKind,
    planes: PlaneSet,
    /// track -> pending write counter. Nonzero means the in-memory track
    /// diverges from the media.
    dirty: BTreeMap<u32, u32>,
    /// 0 = motor off; otherwise the tick of last use.
    motor_on_at: u64,
    ignore_errors: bool,
    always_ignore: bool,
    block_writing: bool,
    write_only: bool,
    disk_in_drive: bool,
    mfm_buffer: Vec<u8>,
}

impl EngineState {
    fn new(bridge: Box<dyn BridgeDriver>) -> Self {
        Self {
            bridge,
            disk_type: SectorKind::Unknown,
            planes: PlaneSet::Single(Plane::new(PlaneGeometry::default())),
            dirty: BTreeMap::new(),
            motor_on_at: 0,
            ignore_errors: false,
            always_ignore: false,
            block_writing: false,
            write_only: false,
            disk_in_drive: false,
            mfm_buffer: vec![0; MAX_TRACK_SIZE],
        }
    }

    fn motor_in_use(&mut self, upper: bool) {
        if self.motor_on_at == 0 {
            self.bridge.motor_enable(true, upper);
        }
        self.motor_on_at = tick_ms();
    }

    /// Spin until the motor reports ready, re-asserting use each poll.
    fn wait_for_motor(&mut self, upper: bool) -> bool {
        let start = tick_ms();
        self.motor_in_use(upper);
        while !self.bridge.motor_ready() {
            thread::sleep(Duration::from_millis(100));
            if tick_ms() - start > MOTOR_TIMEOUT_TIME {
                log::warn!("wait_for_motor(): Motor did not come ready");
                return false;
            }
            self.motor_in_use(upper);
        }
        true
    }

    /// Seek to track 0 and read it until the sector format is recognized.
    fn identify(&mut self) {
        self.disk_type = SectorKind::Unknown;
        self.always_ignore = false;
        self.ignore_errors = false;

        self.bridge.cylinder_seek(0, false);
        self.motor_in_use(false);
        if self.wait_for_motor(false) {
            for _ in 0..5 {
                if self.do_track_reading(0, 0, false) && self.disk_type != SectorKind::Unknown {
                    break;
                }
            }
        }
        log::debug!("identify(): Disk classified as {}", self.disk_type);
    }

    /// Classify the raw capture in the scratch buffer and build the plane
    /// set. Deterministic for a given buffer: prior state is not consulted.
    fn classify(&mut self, track: u32, bit_count: usize, hd: bool) {
        let (amiga_spt, _) = amiga::default_geometry(hd);

        let mut tr_amiga = DecodedTrack::default();
        amiga::find_sectors(&self.mfm_buffer, bit_count, hd, track, 0, &mut tr_amiga);

        let mut tr_ibm = DecodedTrack::default();
        let mut non_standard = false;
        ibm::find_sectors(&self.mfm_buffer, bit_count, hd, track, 0, &mut tr_ibm, &mut non_standard);

        log::trace!(
            "classify(): {} Amiga and {} IBM sectors decoded on {} media, non_standard: {}",
            tr_amiga.len(),
            tr_ibm.len(),
            DiskDensity::from(hd),
            non_standard
        );

        let boot = tr_ibm
            .sectors
            .get(&0)
            .and_then(|s| parse_boot_sector(&s.data, 0xAAAA_AAAA));

        let ibm_geometry = || -> PlaneGeometry {
            match boot {
                Some(info) => PlaneGeometry {
                    sector_size: info.sector_size,
                    sectors_per_track: info.sectors_per_track,
                    heads: info.heads,
                    cylinders: (info.total_sectors / info.sectors_per_track.max(1) / info.heads.max(1))
                        .max(80)
                        .min(MAX_TRACKS / 2),
                    serial: info.serial,
                },
                None => PlaneGeometry {
                    sector_size: 512,
                    sectors_per_track: if hd { 18 } else { 9 },
                    heads: 2,
                    cylinders: 80,
                    serial: 0xAAAA_AAAA,
                },
            }
        };

        let amiga_geometry = PlaneGeometry {
            sector_size: 512,
            sectors_per_track: amiga_spt.max(tr_amiga.len() as u32),
            heads: 2,
            cylinders: 80,
            serial: u32::from_be_bytes(*b"AMFD"),
        };

        if !tr_amiga.is_empty() && tr_ibm.len() >= 5 {
            let ibm_geometry = ibm_geometry();
            let layout = if ibm_geometry.heads == 2 {
                HybridLayout::DoubleSided
            }
            else {
                HybridLayout::AmigaDoubleIbmSingle
            };
            self.disk_type = SectorKind::Hybrid;
            self.planes = PlaneSet::Hybrid {
                amiga: Plane::new(amiga_geometry),
                ibm: Plane::new(ibm_geometry),
                layout,
            };
        }
        else if tr_ibm.len() >= 5 {
            self.disk_type = if non_standard { SectorKind::Atari } else { SectorKind::Ibm };
            self.planes = PlaneSet::Single(Plane::new(ibm_geometry()));
        }
        else if !tr_amiga.is_empty() {
            self.disk_type = SectorKind::Amiga;
            self.planes = PlaneSet::Single(Plane::new(amiga_geometry));
        }
        else {
            self.disk_type = SectorKind::Unknown;
        }
    }

    /// One attempt to capture the flux of a physical track and decode every
    /// sector on it into the plane caches.
    fn do_track_reading(&mut self, plane: usize, track: u32, retry: bool) -> bool {
        let heads = self
            .planes
            .select(plane)
            .map(|p| p.geometry.heads)
            .unwrap_or(2)
            .max(1);
        let ch = DiskCh::from_track(track, heads);
        let upper = ch.upper();

        let start = tick_ms();
        let bit_count = loop {
            self.motor_in_use(upper);

            // A single-sided hybrid side addresses every other physical
            // track of the double-sided numbering.
            let read_track = if plane == 1 && heads == 1 { track * 2 } else { track };

            let mut bits = self.bridge.mfm_read_track(read_track, retry, &mut self.mfm_buffer);
            if bits == 0 {
                bits = self
                    .bridge
                    .mfm_read(ch.c() as u32, upper, retry, &mut self.mfm_buffer);
            }
            if bits != 0 {
                break bits as usize;
            }
            if tick_ms() - start > TRACK_READ_TIMEOUT {
                log::warn!("do_track_reading(): No flux received for track {}", track);
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        };

        let hd = self.bridge.is_hd();

        if self.disk_type == SectorKind::Unknown {
            self.classify(track, bit_count, hd);
        }

        let t = track as usize;
        match self.disk_type {
            SectorKind::Amiga => {
                if let PlaneSet::Single(p) = &mut self.planes {
                    let spt = p.geometry.sectors_per_track;
                    amiga::find_sectors(&self.mfm_buffer, bit_count, hd, track, spt, &mut p.tracks[t]);
                }
            }
            SectorKind::Ibm | SectorKind::Atari => {
                if let PlaneSet::Single(p) = &mut self.planes {
                    let spt = p.geometry.sectors_per_track;
                    let mut ns = false;
                    ibm::find_sectors(&self.mfm_buffer, bit_count, hd, track, spt, &mut p.tracks[t], &mut ns);
                }
            }
            SectorKind::Hybrid => {
                if let PlaneSet::Hybrid { amiga: ap, ibm: ip, layout } = &mut self.planes {
                    let a_spt = ap.geometry.sectors_per_track;
                    let i_spt = ip.geometry.sectors_per_track;
                    let mut ns = false;
                    match layout {
                        HybridLayout::DoubleSided => {
                            amiga::find_sectors(&self.mfm_buffer, bit_count, hd, track, a_spt, &mut ap.tracks[t]);
                            ibm::find_sectors(&self.mfm_buffer, bit_count, hd, track, i_spt, &mut ip.tracks[t], &mut ns);
                        }
                        HybridLayout::AmigaDoubleIbmSingle => {
                            if plane == 1 {
                                if track * 2 < MAX_TRACKS {
                                    amiga::find_sectors(
                                        &self.mfm_buffer,
                                        bit_count,
                                        hd,
                                        track * 2,
                                        a_spt,
                                        &mut ap.tracks[t * 2],
                                    );
                                }
                                ibm::find_sectors(&self.mfm_buffer, bit_count, hd, track, i_spt, &mut ip.tracks[t], &mut ns);
                            }
                            else {
                                amiga::find_sectors(&self.mfm_buffer, bit_count, hd, track, a_spt, &mut ap.tracks[t]);
                                if track % 2 == 0 {
                                    ibm::find_sectors(
                                        &self.mfm_buffer,
                                        bit_count,
                                        hd,
                                        track,
                                        i_spt,
                                        &mut ip.tracks[t / 2],
                                        &mut ns,
                                    );
                                }
                            }
                        }
                    }
                }
            }
            SectorKind::Unknown => {}
        }

        true
    }

    /// Serve a sector read from the selected plane, reading and retrying
    /// against the media as needed.
    fn read_data_all(
        &mut self,
        plane: usize,
        sector: u32,
        buf: &mut [u8],
        policy: &dyn RetryPolicy,
    ) -> Result<(), DeviceError> {
        let geometry = self
            .planes
            .select(plane)
            .map(|p| p.geometry)
            .ok_or(DeviceError::UnsupportedType)?;

        if geometry.sectors_per_track == 0 || buf.len() != geometry.sector_size as usize {
            return Err(DeviceError::BadGeometry);
        }

        let track = geometry.track_of(sector);
        let index = geometry.index_in_track(sector) as u8;
        if track >= MAX_TRACKS {
            return Err(DeviceError::BadGeometry);
        }
        let ch = DiskCh::from_track(track, geometry.heads);
        let upper = ch.upper();
        let cylinder = ch.c() as u32;

        self.check_flush_pending();

        if !self.bridge.is_disk_in_drive() {
            return Err(DeviceError::NoMedia);
        }

        let mut retries = 0u32;
        loop {
            if let Some(sec) = self
                .planes
                .select(plane)
                .and_then(|p| p.tracks[track as usize].sectors.get(&index))
            {
                if sec.errors == 0 || self.ignore_errors {
                    let len = sec.data.len().min(buf.len());
                    buf[..len].copy_from_slice(&sec.data[..len]);
                    return Ok(());
                }
            }

            if retries > MAX_RETRIES {
                if self.ignore_errors {
                    return Err(DeviceError::CodecMismatch);
                }
                retries = 0;

                match policy.on_read_errors() {
                    RetryDecision::Retry => {}
                    RetryDecision::Ignore => self.ignore_errors = true,
                    RetryDecision::AlwaysIgnore => {
                        self.always_ignore = true;
                        self.ignore_errors = true;
                    }
                    RetryDecision::Abort => return Err(DeviceError::Aborted),
                }

                if !self.bridge.is_disk_in_drive() {
                    return Err(DeviceError::NoMedia);
                }
            }

            // A calibration seek halfway through the budget sometimes
            // recovers a marginal head position.
            if retries == MAX_RETRIES / 2 {
                if !self.bridge.is_disk_in_drive() {
                    return Err(DeviceError::NoMedia);
                }
                self.motor_in_use(upper);
                if self.bridge.is_physical_disk() {
                    if cylinder < 40 {
                        self.bridge.cylinder_seek(79, upper);
                    }
                    else {
                        self.bridge.cylinder_seek(0, upper);
                    }
                    thread::sleep(Duration::from_millis(300));
                }
                if !self.bridge.is_disk_in_drive() {
                    return Err(DeviceError::NoMedia);
                }
            }

            self.motor_in_use(upper);
            self.bridge.cylinder_seek(cylinder, upper);
            if !self.wait_for_motor(upper) {
                return Err(DeviceError::Timeout);
            }

            self.do_track_reading(plane, track, retries > 1);
            retries += 1;
        }
    }

    /// Record a sector write in the plane-0 track cache and mark the track
    /// dirty. Durability comes from a later flush.
    fn internal_write(&mut self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
        if self.block_writing {
            return Err(DeviceError::WriteProtected);
        }
        if matches!(self.disk_type, SectorKind::Hybrid | SectorKind::Unknown) {
            return Err(DeviceError::UnsupportedType);
        }
        if self.bridge.is_drive_write_protected() {
            return Err(DeviceError::WriteProtected);
        }

        let geometry = self.planes.primary().geometry;
        if geometry.sectors_per_track == 0 || buf.len() != geometry.sector_size as usize {
            return Err(DeviceError::BadGeometry);
        }
        let track = geometry.track_of(sector);
        if track >= MAX_TRACKS {
            return Err(DeviceError::BadGeometry);
        }
        let index = geometry.index_in_track(sector) as u8;
        let upper = DiskCh::from_track(track, geometry.heads).upper();

        let track_cache = &mut self.planes.primary_mut().tracks[track as usize];
        match track_cache.sectors.get_mut(&index) {
            Some(sec) => {
                if sec.data == buf {
                    if sec.errors == 0 {
                        // Nothing changed; no write needed.
                        return Ok(());
                    }
                    sec.errors = 0;
                }
                else {
                    sec.data.clear();
                    sec.data.extend_from_slice(buf);
                    sec.errors = 0;
                }
            }
            None => {
                track_cache
                    .sectors
                    .insert(index, DecodedSector::new(buf.to_vec(), 0));
            }
        }

        *self.dirty.entry(track).or_insert(0) += 1;
        self.motor_in_use(upper);
        self.check_flush_pending();

        Ok(())
    }

    fn check_flush_pending(&mut self) {
        if self.dirty.len() < FORCE_FLUSH_AT_TRACKS {
            return;
        }
        if let Err(e) = self.flush_pending_writes() {
            log::warn!("check_flush_pending(): Flush failed: {}", e);
        }
    }

    /// Drop the cache for every track that still has a pending write so it
    /// is re-read from the media, and empty the dirty map.
    fn remove_failed_writes(&mut self) {
        let failed: Vec<u32> = self
            .dirty
            .iter()
            .filter_map(|(&track, &count)| (count > 0).then_some(track))
            .collect();
        for track in failed {
            self.planes.primary_mut().tracks[track as usize].clear();
        }
        self.dirty.clear();
    }

    /// Write every dirty track back to the media: assemble a full track,
    /// encode it, write it, and verify the read-back byte for byte.
    fn flush_pending_writes(&mut self) -> Result<(), DeviceError> {
        if self.block_writing {
            return Err(DeviceError::WriteProtected);
        }

        let geometry = self.planes.primary().geometry;
        let spt = geometry.sectors_per_track;
        let tracks: Vec<u32> = self.dirty.keys().copied().collect();

        for track in tracks {
            let ch = DiskCh::from_track(track, geometry.heads);
            let upper = ch.upper();
            let cylinder = ch.c() as u32;

            log::debug!("flush_pending_writes(): Flushing track {} {}", track, ch);

            self.motor_in_use(upper);
            self.bridge.cylinder_seek(cylinder, upper);
            if !self.wait_for_motor(upper) {
                self.dirty.clear();
                return Err(DeviceError::Timeout);
            }
            self.bridge.cylinder_seek(cylinder, upper);

            // The track must be complete and error free before it can be
            // encoded. Merge in what the media holds (or zero-fill in
            // write-only mode), then put the user's sectors back on top.
            let needs_fill = {
                let tr = &self.planes.primary().tracks[track as usize];
                tr.len() < spt as usize || tr.error_count() > 0
            };
            if needs_fill {
                let backup = self.planes.primary().tracks[track as usize].sectors.clone();
                if self.write_only {
                    let tr = &mut self.planes.primary_mut().tracks[track as usize];
                    for s in 0..spt as u8 {
                        tr.sectors
                            .entry(s)
                            .or_insert_with(|| DecodedSector::blank(geometry.sector_size as usize));
                    }
                }
                else {
                    self.do_track_reading(0, track, false);
                }
                let tr = &mut self.planes.primary_mut().tracks[track as usize];
                for (index, sec) in backup {
                    if sec.errors == 0 {
                        tr.sectors.insert(index, sec);
                    }
                }
            }
            self.planes.primary_mut().tracks[track as usize].truncate_to(spt);

            let hd = self.bridge.is_hd();
            let encoded = {
                let tr = &self.planes.primary().tracks[track as usize];
                match self.disk_type {
                    SectorKind::Amiga => amiga::encode_track(hd, tr, track, MAX_TRACK_SIZE),
                    SectorKind::Ibm => ibm::encode_track(hd, false, tr, track, MAX_TRACK_SIZE),
                    SectorKind::Atari => ibm::encode_track(hd, true, tr, track, MAX_TRACK_SIZE),
                    SectorKind::Hybrid => {
                        // Writing hybrids is rejected upstream, but a track
                        // assembled by other means is encoded by its shape.
                        if tr.len() == 11 || tr.len() == 22 {
                            amiga::encode_track(hd, tr, track, MAX_TRACK_SIZE)
                        }
                        else {
                            ibm::encode_track(hd, true, tr, track, MAX_TRACK_SIZE)
                        }
                    }
                    SectorKind::Unknown => None,
                }
            };
            let Some(encoded) = encoded else {
                self.remove_failed_writes();
                return Err(DeviceError::BadGeometry);
            };

            let ibm_like = matches!(self.disk_type, SectorKind::Ibm | SectorKind::Atari);

            // What the media must read back as.
            let reference = self.planes.primary().tracks[track as usize].sectors.clone();

            let mut retries = 0u32;
            loop {
                if retries > MAX_RETRIES {
                    log::error!(
                        "flush_pending_writes(): Track {} failed verification after {} retries",
                        track,
                        MAX_RETRIES
                    );
                    self.remove_failed_writes();
                    return Err(DeviceError::VerifyMismatch);
                }

                if retries == MAX_RETRIES / 2 && self.bridge.is_physical_disk() {
                    self.motor_in_use(upper);
                    if cylinder < 40 {
                        self.bridge.cylinder_seek(79, upper);
                    }
                    else {
                        self.bridge.cylinder_seek(0, upper);
                    }
                    thread::sleep(Duration::from_millis(300));
                }

                self.bridge.cylinder_seek(cylinder, upper);
                self.motor_in_use(upper);

                if !self.bridge.is_disk_in_drive() {
                    self.dirty.clear();
                    return Err(DeviceError::NoMedia);
                }

                if !self.bridge.mfm_write(cylinder, upper, ibm_like, &encoded) {
                    self.remove_failed_writes();
                    return Err(DeviceError::Bridge);
                }

                // The bridge confirms completion asynchronously.
                let start = tick_ms();
                while !self.bridge.write_completed() {
                    if tick_ms() - start > DISK_WRITE_TIMEOUT {
                        self.bridge.reset_drive(cylinder);
                        self.motor_on_at = 0;
                        self.block_writing = true;
                        if self.bridge.is_physical_disk() {
                            thread::sleep(Duration::from_millis(200));
                        }
                        if !self.bridge.is_disk_in_drive() {
                            self.dirty.clear();
                            return Err(DeviceError::NoMedia);
                        }
                        // Media still present; keep the dirty map for a
                        // later flush attempt.
                        return Err(DeviceError::Timeout);
                    }
                }

                // Verify by re-reading the track and comparing every sector
                // we intended to write. The slot is cleared first so the
                // comparison sees exactly what the media decodes to, not a
                // merge against the cached copy.
                self.planes.primary_mut().tracks[track as usize].clear();
                if !self.do_track_reading(0, track, retries > 1) {
                    self.motor_on_at = 0;
                    if !self.bridge.is_disk_in_drive() {
                        self.dirty.clear();
                        return Err(DeviceError::NoMedia);
                    }
                    if self.bridge.is_physical_disk() {
                        thread::sleep(Duration::from_millis(100));
                    }
                    retries += 1;
                    continue;
                }

                let verified = {
                    let tr = &self.planes.primary().tracks[track as usize];
                    reference.iter().all(|(index, sec)| match tr.sectors.get(index) {
                        Some(read_back) => {
                            read_back.errors == 0
                                && read_back.data.len() == sec.data.len()
                                && read_back.data == sec.data
                        }
                        None => false,
                    })
                };

                if verified {
                    break;
                }
                log::warn!("flush_pending_writes(): Track {} read back differently, retrying", track);
                retries += 1;
            }

            self.dirty.insert(track, 0);
        }

        self.remove_failed_writes();
        Ok(())
    }
}

/// The MFM track engine. Shared as an [Arc] between the cache layer and the
/// motor monitor; see the module docs for the locking model.
pub struct MfmEngine {
    state: Mutex<EngineState>,
    policy: Box<dyn RetryPolicy>,
    disk_change: Mutex<Option<DiskChangeCallback>>,
    monitor_stop: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl MfmEngine {
    pub fn new(bridge: Box<dyn BridgeDriver>, policy: Box<dyn RetryPolicy>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState::new(bridge)),
            policy,
            disk_change: Mutex::new(None),
            monitor_stop: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        })
    }

    /// Register the media change callback. It is invoked with the engine
    /// lock released and must be reentrancy-safe.
    pub fn set_disk_change_callback(&self, callback: DiskChangeCallback) {
        *self.disk_change.lock().unwrap() = Some(callback);
    }

    /// Reset the drive to a known state.
    pub fn init_drive(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.disk_type = SectorKind::Unknown;
        state.motor_on_at = 0;
        state.disk_in_drive = false;
        state.always_ignore = false;
        state.bridge.restore_drive()
    }

    /// Bring the engine up: restore the drive, identify any media already
    /// inserted, and start the monitor thread.
    pub fn set_ready(self: &Arc<Self>) {
        self.init_drive();
        {
            let mut state = self.state.lock().unwrap();
            if state.bridge.is_disk_in_drive() {
                state.disk_in_drive = true;
                state.identify();
            }
        }
        self.start_monitor();
    }

    /// Spawn the motor/media monitor thread. The thread holds only a weak
    /// reference, so it winds down with the last engine handle.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut guard = self.monitor.lock().unwrap();
        if guard.is_some() {
            return;
        }
        self.monitor_stop.store(false, Ordering::SeqCst);

        let weak: Weak<MfmEngine> = Arc::downgrade(self);
        let stop = Arc::clone(&self.monitor_stop);
        *guard = Some(thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match weak.upgrade() {
                    Some(engine) => engine.motor_monitor(),
                    None => break,
                }
                thread::sleep(Duration::from_millis(MOTOR_MONITOR_INTERVAL));
            }
        }));
    }

    pub fn stop_monitor(&self) {
        self.monitor_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// One monitor tick: spin the motor down after the idle timeout
    /// (flushing first), and watch for media change edges. Normally driven
    /// by the monitor thread at ~200 ms, but callable directly for
    /// cooperative scheduling.
    pub fn motor_monitor(&self) {
        let mut notify: Option<(bool, SectorKind)> = None;
        {
            let mut state = self.state.lock().unwrap();

            if state.motor_on_at != 0 && tick_ms() - state.motor_on_at > MOTOR_IDLE_TIMEOUT {
                if let Err(e) = state.flush_pending_writes() {
                    log::warn!("motor_monitor(): Idle flush failed: {}", e);
                }
                state.bridge.motor_enable(false, false);
                if !state.always_ignore {
                    state.ignore_errors = false;
                }
                state.block_writing = false;
                state.motor_on_at = 0;
            }

            let now_in_drive = state.bridge.is_disk_in_drive();
            if now_in_drive != state.disk_in_drive {
                if !now_in_drive {
                    state.bridge.cylinder_seek(0, false);
                    state.bridge.motor_enable(false, false);
                    if !state.dirty.is_empty() {
                        log::warn!(
                            "motor_monitor(): Media removed with {} dirty tracks; pending writes discarded",
                            state.dirty.len()
                        );
                        state.dirty.clear();
                    }
                }

                state.disk_in_drive = now_in_drive;
                state.planes.clear_all();

                if now_in_drive {
                    state.identify();
                    notify = Some((true, state.disk_type));
                }
                else {
                    state.disk_type = SectorKind::Unknown;
                    notify = Some((false, SectorKind::Unknown));
                }
            }
        }

        if let Some((inserted, kind)) = notify {
            if let Some(callback) = self.disk_change.lock().unwrap().as_ref() {
                callback(inserted, kind);
            }
        }
    }

    /// Re-run media identification.
    pub fn identify_file_system(&self) {
        self.state.lock().unwrap().identify();
    }

    pub fn disk_type(&self) -> SectorKind {
        self.state.lock().unwrap().disk_type
    }

    /// True when the media can be exported to a plain sector image.
    pub fn allow_copy_to_file(&self) -> bool {
        matches!(self.disk_type(), SectorKind::Amiga | SectorKind::Ibm)
    }

    /// In write-only mode a flush zero-fills missing sectors instead of
    /// merging from the media (used when formatting fresh disks).
    pub fn set_write_only(&self, write_only: bool) {
        self.state.lock().unwrap().write_only = write_only;
    }

    /// Force the primary plane to a caller-supplied geometry, dropping any
    /// cached or pending state.
    pub fn overwrite_sector_settings(
        &self,
        kind: SectorKind,
        cylinders: u32,
        heads: u32,
        sectors_per_track: u32,
        sector_size: u32,
    ) {
        let mut state = self.state.lock().unwrap();
        let serial = state.planes.primary().geometry.serial;
        state.disk_type = kind;
        state.dirty.clear();
        state.planes = PlaneSet::Single(Plane::new(PlaneGeometry {
            sector_size,
            sectors_per_track,
            heads,
            cylinders: cylinders.min(MAX_TRACKS / 2),
            serial,
        }));
    }

    /// Pre-populate the primary plane with trusted blank sectors.
    pub fn create_blank_sectors(&self) {
        let mut state = self.state.lock().unwrap();
        let geometry = state.planes.primary().geometry;
        let plane = state.planes.primary_mut();
        for track in 0..geometry.total_tracks().min(MAX_TRACKS) as usize {
            let tr = &mut plane.tracks[track];
            tr.clear();
            for s in 0..geometry.sectors_per_track as u8 {
                tr.sectors
                    .insert(s, DecodedSector::blank(geometry.sector_size as usize));
            }
        }
    }

    /// Forget everything about the current media so the next access runs
    /// detection again.
    pub fn trigger_new_disk_mount(&self) {
        let mut state = self.state.lock().unwrap();
        state.dirty.clear();
        state.planes.clear_all();
        state.disk_type = SectorKind::Unknown;
        state.disk_in_drive = false;
    }
}

impl Drop for MfmEngine {
    fn drop(&mut self) {
        self.monitor_stop.store(true, Ordering::SeqCst);
    }
}

impl SectorIo for MfmEngine {
    fn internal_read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.read_data_all(0, sector, buf, self.policy.as_ref())
    }

    fn internal_write(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.internal_write(sector, buf)
    }

    fn internal_hybrid_read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let plane = if state.disk_type == SectorKind::Hybrid { 1 } else { 0 };
        state.read_data_all(plane, sector, buf, self.policy.as_ref())
    }

    fn is_disk_present(&self) -> bool {
        self.state.lock().unwrap().disk_in_drive
    }

    fn is_write_protected(&self) -> bool {
        self.state.lock().unwrap().bridge.is_drive_write_protected()
    }

    fn sector_size(&self) -> u32 {
        self.state.lock().unwrap().planes.primary().geometry.sector_size
    }

    fn sectors_per_track(&self) -> u32 {
        self.state.lock().unwrap().planes.primary().geometry.sectors_per_track
    }

    fn total_tracks(&self) -> u32 {
        self.state.lock().unwrap().planes.primary().geometry.total_tracks()
    }

    fn hybrid_sector_size(&self) -> u32 {
        let state = self.state.lock().unwrap();
        let plane = if state.disk_type == SectorKind::Hybrid { 1 } else { 0 };
        state
            .planes
            .select(plane)
            .map(|p| p.geometry.sector_size)
            .unwrap_or(crate::DEFAULT_SECTOR_SIZE as u32)
    }

    fn hybrid_sectors_per_track(&self) -> u32 {
        let state = self.state.lock().unwrap();
        let plane = if state.disk_type == SectorKind::Hybrid { 1 } else { 0 };
        state
            .planes
            .select(plane)
            .map(|p| p.geometry.sectors_per_track)
            .unwrap_or(0)
    }

    fn hybrid_total_tracks(&self) -> u32 {
        let state = self.state.lock().unwrap();
        let plane = if state.disk_type == SectorKind::Hybrid { 1 } else { 0 };
        state
            .planes
            .select(plane)
            .map(|p| p.geometry.total_tracks())
            .unwrap_or(0)
    }

    fn serial_number(&self) -> u32 {
        self.state.lock().unwrap().planes.primary().geometry.serial
    }

    fn disk_data_size(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let g = state.planes.primary().geometry;
        if g.cylinders > 0 {
            g.total_bytes()
        }
        else {
            g.sector_size as u64 * g.sectors_per_track as u64 * g.heads as u64 * 82
        }
    }

    fn flush_write_cache(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.flush_pending_writes()
    }

    fn reset_backend(&self) {
        let mut state = self.state.lock().unwrap();
        state.dirty.clear();
        state.planes.clear_all();
    }
}
