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

//! The 512-byte metadata header prefixing every inode and bitmap entry,
//! and the acquire/release protocol built on top of it (§4.E).

use crate::encoding::{read_le32, read_le64, read_uuid, write_le32, write_le64, write_uuid};
use crate::error::{Error, Result};
use crate::fs::Filesystem;

pub const HDR_SIZE: usize = 512;

const OFS_MAGIC: usize = 0x00;
const OFS_POS: usize = 0x04;
const OFS_HB_POS: usize = 0x0c;
const OFS_HB_SEQ: usize = 0x14;
const OFS_OBJ_SEQ: usize = 0x1c;
const OFS_HB_LOCK: usize = 0x24;
const OFS_HB_UUID: usize = 0x28;
const OFS_MTIME: usize = 0x38;

#[derive(Debug, Clone, Default)]
pub struct MetadataHeader {
    pub magic: u32,
    pub pos: u64,
    pub hb_pos: u64,
    pub hb_seq: u64,
    pub obj_seq: u64,
    pub hb_lock: u32,
    pub hb_uuid: [u8; 16],
    pub mtime: u64,
}

impl MetadataHeader {
    pub fn read(buf: &[u8]) -> Self {
        MetadataHeader {
            magic: read_le32(buf, OFS_MAGIC),
            pos: read_le64(buf, OFS_POS),
            hb_pos: read_le64(buf, OFS_HB_POS),
            hb_seq: read_le64(buf, OFS_HB_SEQ),
            obj_seq: read_le64(buf, OFS_OBJ_SEQ),
            hb_lock: read_le32(buf, OFS_HB_LOCK),
            hb_uuid: read_uuid(buf, OFS_HB_UUID),
            mtime: read_le64(buf, OFS_MTIME),
        }
    }

    /// Writes the full 512-byte header, zeroing reserved bytes. Only
    /// called from contexts constructing a fresh header buffer; a
    /// read-modify-write that must preserve unrelated padding writes
    /// through the original buffer's in-place fields instead (see
    /// `vmfs_metadata_lock`'s update-in-place pattern in `metadata.c`).
    pub fn write(&self, buf: &mut [u8; HDR_SIZE]) {
        buf.fill(0);
        write_le32(buf, OFS_MAGIC, self.magic);
        write_le64(buf, OFS_POS, self.pos);
        write_le64(buf, OFS_HB_POS, self.hb_pos);
        write_le64(buf, OFS_HB_SEQ, self.hb_seq);
        write_le64(buf, OFS_OBJ_SEQ, self.obj_seq);
        write_le32(buf, OFS_HB_LOCK, self.hb_lock);
        write_uuid(buf, OFS_HB_UUID, &self.hb_uuid);
        write_le64(buf, OFS_MTIME, self.mtime);
    }

    pub fn is_locked(&self) -> bool {
        self.hb_lock != 0
    }
}

/// A held metadata lock. Dropping without calling [`unlock`] leaks the
/// on-disk lock until the owning heartbeat expires — callers must always
/// route through `unlock`, matching the source's `vmfs_metadata_unlock`.
pub struct MetadataLock {
    pub pos: u64,
    pub header: MetadataHeader,
}

/// Acquires `buf_len` bytes of metadata at `pos`: claims the filesystem's
/// heartbeat, brackets the read-modify-write of the header in a SCSI
/// reservation, and fails with [`Error::Locked`] if another holder's
/// `hb_lock` is already set.
pub fn lock(fs: &Filesystem, pos: u64, buf: &mut [u8]) -> Result<MetadataLock> {
    fs.heartbeat_acquire()?;

    let reserve_and_read = (|| -> Result<()> {
        fs.lvm.reserve(pos)?;
        fs.lvm.read_at(pos, buf)
    })();

    if let Err(e) = reserve_and_read {
        let _ = fs.lvm.release(pos);
        fs.heartbeat_release();
        return Err(e);
    }

    let mut header = MetadataHeader::read(buf);
    if header.is_locked() {
        let _ = fs.lvm.release(pos);
        fs.heartbeat_release();
        return Err(Error::Locked);
    }

    let hb = match fs.heartbeat_identity() {
        Some(hb) => hb,
        None => {
            let _ = fs.lvm.release(pos);
            fs.heartbeat_release();
            return Err(Error::Corrupted("heartbeat not held after acquire"));
        }
    };
    header.obj_seq += 1;
    header.hb_lock = 1;
    header.hb_pos = hb.pos;
    header.hb_seq = hb.seq;
    header.hb_uuid = hb.uuid;

    let mut hdr_buf = [0u8; HDR_SIZE];
    header.write(&mut hdr_buf);
    buf[..HDR_SIZE].copy_from_slice(&hdr_buf);

    let write_result = fs.lvm.write_at(pos, &hdr_buf);
    let _ = fs.lvm.release(pos);
    if let Err(e) = write_result {
        fs.heartbeat_release();
        return Err(e);
    }

    Ok(MetadataLock { pos, header })
}

/// Clears `hb_lock`, writes the header back, and drops the heartbeat
/// refcount taken by the matching [`lock`].
pub fn unlock(fs: &Filesystem, mut lock: MetadataLock) -> Result<()> {
    lock.header.hb_lock = 0;
    lock.header.hb_uuid = [0; 16];

    let mut buf = [0u8; HDR_SIZE];
    lock.header.write(&mut buf);

    fs.lvm.write_at(lock.pos, &buf)?;
    fs.heartbeat_release();
    Ok(())
}
