/*
 * vmfs - a user-space driver for the VMFS cluster filesystem
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the
 * Free Software Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be useful, but
 * WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General
 * Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Logical Volume Manager: concatenates extents sharing one UUID into a
//! single addressable byte space.

use crate::error::{Error, Result};
use crate::volume::{PhysicalVolume, SEGMENT_SIZE};
use std::path::Path;

const MAX_EXTENTS: usize = 32;

pub struct LogicalVolume {
    extents: Vec<PhysicalVolume>,
    uuid: [u8; 16],
    size: u64,
    blocks: u64,
    num_extents: u32,
    allow_missing_extents: bool,
    writable: bool,
}

impl LogicalVolume {
    pub fn new(writable: bool, allow_missing_extents: bool) -> Self {
        LogicalVolume {
            extents: Vec::new(),
            uuid: [0; 16],
            size: 0,
            blocks: 0,
            num_extents: 0,
            allow_missing_extents,
            writable,
        }
    }

    /// §4.D: seed from the first extent, then require every later one to
    /// agree on UUID, size, blocks and the declared extent count; insert
    /// sorted by `first_segment`.
    pub fn add_extent(&mut self, vol: PhysicalVolume) -> Result<()> {
        if self.extents.len() >= MAX_EXTENTS {
            return Err(Error::InvalidArg("too many extents"));
        }

        if self.extents.is_empty() {
            self.uuid = vol.info.lvm_uuid;
            self.size = vol.info.lvm_size;
            self.blocks = vol.info.lvm_blocks;
            self.num_extents = vol.info.num_extents;
        } else if vol.info.lvm_uuid != self.uuid
            || vol.info.lvm_size != self.size
            || vol.info.lvm_blocks != self.blocks
            || vol.info.num_extents != self.num_extents
        {
            return Err(Error::InvalidArg("extent does not match LVM"));
        }

        let insert_at = self
            .extents
            .iter()
            .position(|e| e.info.first_segment > vol.info.first_segment)
            .unwrap_or(self.extents.len());
        self.extents.insert(insert_at, vol);
        Ok(())
    }

    pub fn open(paths: &[&Path], writable: bool, allow_missing_extents: bool, direct_io: bool) -> Result<Self> {
        let mut lvm = LogicalVolume::new(writable, allow_missing_extents);
        for path in paths {
            let vol = PhysicalVolume::open(path, writable, direct_io)?;
            lvm.add_extent(vol)?;
        }

        if !allow_missing_extents && lvm.extents.len() as u32 != lvm.num_extents {
            return Err(Error::Corrupted("missing LVM extents"));
        }

        Ok(lvm)
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Locates the extent owning LVM offset `p`, returning it with the
    /// offset translated into that extent's own address space.
    fn locate(&self, p: u64) -> Result<(&PhysicalVolume, u64)> {
        let segment = p / SEGMENT_SIZE;
        for ext in &self.extents {
            if segment >= ext.info.first_segment as u64 && segment <= ext.info.last_segment as u64 {
                let extent_offset = p - ext.info.first_segment as u64 * SEGMENT_SIZE;
                return Ok((ext, extent_offset));
            }
        }
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "LVM offset falls in a missing extent",
        )))
    }

    /// Rejects transfers that would straddle two extents rather than
    /// splitting them — callers (the bitmap/inode layers) never issue
    /// reads/writes larger than one block, so this never legitimately
    /// triggers (§4.D).
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let (ext, offset) = self.locate(pos)?;
        if offset + buf.len() as u64 > (ext.info.last_segment as u64 - ext.info.first_segment as u64 + 1) * SEGMENT_SIZE {
            return Err(Error::InvalidArg("I/O straddles two LVM extents"));
        }
        ext.read_at(offset, buf)
    }

    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let (ext, offset) = self.locate(pos)?;
        if offset + buf.len() as u64 > (ext.info.last_segment as u64 - ext.info.first_segment as u64 + 1) * SEGMENT_SIZE {
            return Err(Error::InvalidArg("I/O straddles two LVM extents"));
        }
        ext.write_at(offset, buf)
    }

    pub fn reserve(&self, pos: u64) -> Result<()> {
        let (ext, _) = self.locate(pos)?;
        ext.reserve()
    }

    pub fn release(&self, pos: u64) -> Result<()> {
        let (ext, _) = self.locate(pos)?;
        ext.release()
    }
}

#[cfg(test)]
mod tests {
    // Full extent routing needs real block-device-shaped files; exercised
    // in `tests/integration.rs` against a synthesized single-extent image.
}
