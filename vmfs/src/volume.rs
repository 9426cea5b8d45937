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

//! Physical volume: one extent's super-block, parsed at a fixed offset.

use crate::device::{BlockDevice, FileDevice};
use crate::encoding::{read_fixed_str, read_le32, read_le64, read_uuid};
use crate::error::{Error, Result};
use std::fmt;
use std::path::Path;

pub const VOLINFO_BASE: u64 = 0x100000;
pub const VOLINFO_MAGIC: u32 = 0xc001d00d;
const LVMINFO_OFFSET: usize = 0x200;

const OFS_MAGIC: usize = 0x00;
const OFS_VER: usize = 0x04;
const OFS_LUN: usize = 0x0e;
const OFS_NAME: usize = 0x12;
const NAME_LEN: usize = 28;
const OFS_UUID: usize = 0x82;

const OFS_LVM_SIZE: usize = LVMINFO_OFFSET + 0x00;
const OFS_LVM_BLOCKS: usize = LVMINFO_OFFSET + 0x08;
const OFS_LVM_UUID: usize = LVMINFO_OFFSET + 0x54;
const OFS_LVM_NUM_SEGMENTS: usize = LVMINFO_OFFSET + 0x74;
const OFS_LVM_FIRST_SEGMENT: usize = LVMINFO_OFFSET + 0x78;
const OFS_LVM_LAST_SEGMENT: usize = LVMINFO_OFFSET + 0x80;
const OFS_LVM_NUM_EXTENTS: usize = LVMINFO_OFFSET + 0x90;

/// 256 MiB: the LVM-to-extent mapping granularity.
pub const SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct VolInfo {
    pub magic: u32,
    pub version: u32,
    pub lun: u8,
    pub name: String,
    pub uuid: [u8; 16],
    pub lvm_size: u64,
    pub lvm_blocks: u64,
    pub lvm_uuid: [u8; 16],
    pub num_segments: u32,
    pub first_segment: u32,
    pub last_segment: u32,
    pub num_extents: u32,
}

impl fmt::Display for VolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Physical Volume Information:")?;
        writeln!(f, "  - Name    : {}", self.name)?;
        writeln!(f, "  - LUN     : {}", self.lun)?;
        writeln!(f, "  - Version : {}", self.version)?;
        writeln!(
            f,
            "  - Segments: [{}, {}] of {}",
            self.first_segment, self.last_segment, self.num_segments
        )
    }
}

/// One physical volume participating in an LVM. Created on mount,
/// immutable, destroyed on unmount (no interior mutability: nothing
/// about a volume's parsed super-block ever changes once opened).
pub struct PhysicalVolume {
    pub device: FileDevice,
    pub info: VolInfo,
    /// Byte offset of this extent's own start on the raw device: zero
    /// unless a DOS partition table shifted it. VMFS region constants
    /// (`VOLINFO_BASE`, `FSINFO_BASE`, ...) are relative to this point.
    pub base: u64,
}

fn parse_volinfo(buf: &[u8]) -> Result<VolInfo> {
    let magic = read_le32(buf, OFS_MAGIC);
    if magic != VOLINFO_MAGIC {
        return Err(Error::BadMagic);
    }
    let version = read_le32(buf, OFS_VER);
    if version != 3 && version != 5 {
        return Err(Error::UnsupportedVersion(version));
    }

    Ok(VolInfo {
        magic,
        version,
        lun: buf[OFS_LUN],
        name: read_fixed_str(buf, OFS_NAME, NAME_LEN),
        uuid: read_uuid(buf, OFS_UUID),
        lvm_size: read_le64(buf, OFS_LVM_SIZE),
        lvm_blocks: read_le64(buf, OFS_LVM_BLOCKS),
        lvm_uuid: read_uuid(buf, OFS_LVM_UUID),
        num_segments: read_le32(buf, OFS_LVM_NUM_SEGMENTS),
        first_segment: read_le32(buf, OFS_LVM_FIRST_SEGMENT),
        last_segment: read_le32(buf, OFS_LVM_LAST_SEGMENT),
        num_extents: read_le32(buf, OFS_LVM_NUM_EXTENTS),
    })
}

/// Looks for a DOS MBR partition table at the start of the device: a
/// `0xAA55` signature at byte 510 and a VMFS partition type (`0xFB`) at
/// byte 450. Returns the byte offset of that partition's first sector.
fn mbr_partition_offset(buf: &[u8]) -> Option<u64> {
    if buf.len() < 512 {
        return None;
    }
    if buf[510] != 0x55 || buf[511] != 0xaa {
        return None;
    }
    const PART_TYPE_OFS: usize = 450;
    const PART_START_OFS: usize = 454;
    if buf[PART_TYPE_OFS] != 0xfb {
        return None;
    }
    let start_sector = read_le32(buf, PART_START_OFS) as u64;
    Some(start_sector * 512)
}

impl PhysicalVolume {
    pub fn open(path: &Path, writable: bool, direct_io: bool) -> Result<Self> {
        let device = FileDevice::open(path, writable, direct_io)?;

        let mut buf = [0u8; 1024];
        device.read_at(VOLINFO_BASE, &mut buf)?;

        let vol = match parse_volinfo(&buf) {
            Ok(info) => PhysicalVolume {
                device,
                info,
                base: 0,
            },
            Err(Error::BadMagic) => {
                let mut mbr = [0u8; 512];
                device.read_at(0, &mut mbr)?;
                let base = mbr_partition_offset(&mbr).ok_or(Error::BadMagic)?;
                let mut buf = [0u8; 1024];
                device.read_at(base + VOLINFO_BASE, &mut buf)?;
                let info = parse_volinfo(&buf)?;
                PhysicalVolume { device, info, base }
            }
            Err(e) => return Err(e),
        };

        if let Some(queried) = vol.device.queried_lun() {
            if queried != vol.info.lun {
                eprintln!(
                    "warning: {} reports LUN {} but its super-block records LUN {}",
                    path.display(),
                    queried,
                    vol.info.lun
                );
            }
        }

        Ok(vol)
    }

    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.device.read_at(self.base + pos, buf)
    }

    pub fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        self.device.write_at(self.base + pos, buf)
    }

    pub fn reserve(&self) -> Result<()> {
        self.device.reserve()
    }

    pub fn release(&self) -> Result<()> {
        self.device.release()
    }
}
