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

//! The contract between the MFM track engine and the flux-level bridge
//! hardware driver (serial/USB reader boards, or an image-backed fake in
//! tests). The engine borrows the bridge exclusively; all calls are made
//! under the engine lock.

/// Low-level drive primitives supplied by the bridge.
///
/// `mfm_read_track`/`mfm_read` deliver raw MFM bits into the caller's
/// buffer and return the number of bits captured, 0 when nothing was read.
/// Writes are asynchronous: `mfm_write` queues the track and
/// `write_completed` reports when the hardware (including its own read-back
/// pass) has finished.
pub trait BridgeDriver: Send {
    /// Read raw flux for a linear track number.
    fn mfm_read_track(&mut self, track: u32, retry: bool, buf: &mut [u8]) -> u32;

    /// Read raw flux addressed by cylinder and surface.
    fn mfm_read(&mut self, cylinder: u32, upper_head: bool, retry: bool, buf: &mut [u8]) -> u32;

    /// Queue a raw MFM track for writing. `ibm_like` selects the write gate
    /// timing for IBM/Atari style tracks.
    fn mfm_write(&mut self, cylinder: u32, upper_head: bool, ibm_like: bool, buf: &[u8]) -> bool;

    fn cylinder_seek(&mut self, cylinder: u32, upper_head: bool);

    fn motor_enable(&mut self, on: bool, upper_head: bool);
    fn motor_ready(&mut self) -> bool;

    fn write_completed(&mut self) -> bool;

    /// Recalibrate after a fault, leaving the head at `cylinder`.
    fn reset_drive(&mut self, cylinder: u32) -> bool;

    /// True for real drive hardware; false for image-backed bridges.
    /// Physical drives get calibration seeks and settle delays.
    fn is_physical_disk(&self) -> bool;

    fn is_disk_in_drive(&mut self) -> bool;
    fn is_drive_write_protected(&mut self) -> bool;
    fn is_hd(&self) -> bool;

    /// Bring the drive back to a usable state after a mount.
    fn restore_drive(&mut self) -> bool;
}
