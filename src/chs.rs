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

use std::fmt::Display;

/// A cylinder/head pair. Linear track numbering is
/// `track = cylinder * heads + head`.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiskCh {
    c: u16,
    h: u8,
}

impl From<(u16, u8)> for DiskCh {
    fn from((c, h): (u16, u8)) -> Self {
        Self { c, h }
    }
}

impl Display for DiskCh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{} h:{}]", self.c, self.h)
    }
}

impl DiskCh {
    pub fn new(c: u16, h: u8) -> Self {
        Self { c, h }
    }

    pub fn c(&self) -> u16 {
        self.c
    }
    pub fn h(&self) -> u8 {
        self.h
    }

    /// Split a linear track index into cylinder and head for the given head
    /// count. A head count of 0 is treated as single-sided.
    pub fn from_track(track: u32, heads: u32) -> Self {
        let heads = heads.max(1);
        Self {
            c: (track / heads) as u16,
            h: (track % heads) as u8,
        }
    }

    pub fn to_track(&self, heads: u32) -> u32 {
        self.c as u32 * heads.max(1) + self.h as u32
    }

    /// True when this address lies on the upper surface.
    pub fn upper(&self) -> bool {
        self.h != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_round_trip() {
        for track in 0..168 {
            let ch = DiskCh::from_track(track, 2);
            assert_eq!(ch.to_track(2), track);
        }
        let ch = DiskCh::from_track(79, 1);
        assert_eq!((ch.c(), ch.h()), (79, 0));
    }
}
