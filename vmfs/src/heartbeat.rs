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

//! The heartbeat slot array: 2048 per-host claim slots underpinning
//! cluster metadata locking (§4.F).

use crate::encoding::{read_le32, read_le64, read_uuid, write_le32, write_le64, write_uuid};
use crate::error::{Error, Result};
use crate::host::HostIdentity;
use crate::lvm::LogicalVolume;
use std::sync::Mutex;
use std::time::Duration;

pub const HB_BASE: u64 = 0x300000;
pub const HB_SLOT_SIZE: u64 = 0x200;
pub const HB_COUNT: u32 = 2048;

const MAGIC_INACTIVE: u32 = 0xabcdef01;
const MAGIC_ACTIVE: u32 = 0xabcdef02;

/// 3 seconds, matching `VMFS_HEARTBEAT_EXPIRE_DELAY` of the source.
pub const EXPIRE_DELAY: Duration = Duration::from_secs(3);

const OFS_MAGIC: usize = 0x00;
const OFS_POS: usize = 0x04;
const OFS_SEQ: usize = 0x0c;
const OFS_UPTIME: usize = 0x14;
const OFS_UUID: usize = 0x1c;
const OFS_JOURNAL_BLK: usize = 0x2c;

#[derive(Debug, Clone, Default)]
pub struct HeartbeatRecord {
    pub magic: u32,
    pub pos: u64,
    pub seq: u64,
    pub uptime: u64,
    pub uuid: [u8; 16],
    pub journal_blk: u32,
}

impl HeartbeatRecord {
    pub fn read(buf: &[u8]) -> Self {
        HeartbeatRecord {
            magic: read_le32(buf, OFS_MAGIC),
            pos: read_le64(buf, OFS_POS),
            seq: read_le64(buf, OFS_SEQ),
            uptime: read_le64(buf, OFS_UPTIME),
            uuid: read_uuid(buf, OFS_UUID),
            journal_blk: read_le32(buf, OFS_JOURNAL_BLK),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..HB_SLOT_SIZE as usize].fill(0);
        write_le32(buf, OFS_MAGIC, self.magic);
        write_le64(buf, OFS_POS, self.pos);
        write_le64(buf, OFS_SEQ, self.seq);
        write_le64(buf, OFS_UPTIME, self.uptime);
        write_uuid(buf, OFS_UUID, &self.uuid);
        write_le32(buf, OFS_JOURNAL_BLK, self.journal_blk);
    }

    pub fn is_active(&self) -> bool {
        self.magic == MAGIC_ACTIVE
    }
}

struct Claim {
    id: u32,
    pos: u64,
    seq: u64,
    refcount: u32,
}

/// The caller's claimed heartbeat slot, as embedded into a metadata
/// header's `hb_pos`/`hb_seq`/`hb_uuid` fields when locking (§4.E).
pub struct HeartbeatIdentity {
    pub pos: u64,
    pub seq: u64,
    pub uuid: [u8; 16],
}

/// Per-filesystem heartbeat state. A filesystem holds at most one claimed
/// slot at a time; acquire/release are refcounted so nested metadata
/// locks share the same slot.
pub struct HeartbeatManager {
    claim: Mutex<Option<Claim>>,
}

impl HeartbeatManager {
    pub fn new() -> Self {
        HeartbeatManager {
            claim: Mutex::new(None),
        }
    }

    /// §4.F acquire: bump the refcount if a slot is already held,
    /// otherwise scan for an inactive or expired slot and claim it under
    /// SCSI reservation.
    pub fn acquire(&self, lvm: &LogicalVolume, host: &HostIdentity) -> Result<()> {
        let mut guard = self.claim.lock().unwrap();
        if let Some(c) = guard.as_mut() {
            c.refcount += 1;
            return Ok(());
        }

        for id in 0..HB_COUNT {
            let pos = HB_BASE + id as u64 * HB_SLOT_SIZE;
            let mut buf = vec![0u8; HB_SLOT_SIZE as usize];
            if lvm.read_at(pos, &mut buf).is_err() {
                continue;
            }
            let rec = HeartbeatRecord::read(&buf);

            let available = if !rec.is_active() {
                true
            } else {
                is_expired(lvm, pos, &rec)
            };
            if !available {
                continue;
            }

            lvm.reserve(pos)?;
            let new_seq = rec.seq + 1;
            let claimed = HeartbeatRecord {
                magic: MAGIC_ACTIVE,
                pos,
                seq: new_seq,
                uptime: host.uptime_usec(),
                uuid: host.uuid,
                journal_blk: rec.journal_blk,
            };
            claimed.write(&mut buf);
            let write_result = lvm.write_at(pos, &buf[..HB_SLOT_SIZE as usize]);
            let _ = lvm.release(pos);
            write_result?;

            *guard = Some(Claim {
                id,
                pos,
                seq: new_seq,
                refcount: 1,
            });
            return Ok(());
        }

        Err(Error::Locked)
    }

    /// Decrements the refcount; at zero the slot is left active for its
    /// grace period rather than immediately invalidated, matching the
    /// source's documented behaviour (§4.F, §9 dirty-shutdown note).
    pub fn release(&self) {
        let mut guard = self.claim.lock().unwrap();
        if let Some(c) = guard.as_mut() {
            if c.refcount > 0 {
                c.refcount -= 1;
            }
        }
    }

    pub fn identity(&self, host: &HostIdentity) -> Option<HeartbeatIdentity> {
        self.claim.lock().unwrap().as_ref().map(|c| HeartbeatIdentity {
            pos: c.pos,
            seq: c.seq,
            uuid: host.uuid,
        })
    }

    /// Rewrites the held slot as inactive, for a clean unmount (§4.F:
    /// "or rewrite it inactive on clean shutdown").
    pub fn shutdown(&self, lvm: &LogicalVolume) {
        let mut guard = self.claim.lock().unwrap();
        if let Some(c) = guard.take() {
            let mut buf = vec![0u8; HB_SLOT_SIZE as usize];
            let rec = HeartbeatRecord {
                magic: MAGIC_INACTIVE,
                pos: c.pos,
                seq: c.seq,
                uptime: 0,
                uuid: [0; 16],
                journal_blk: 0,
            };
            rec.write(&mut buf);
            if lvm.reserve(c.pos).is_ok() {
                let _ = lvm.write_at(c.pos, &buf);
                let _ = lvm.release(c.pos);
            }
        }
    }
}

impl Default for HeartbeatManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A remote host's active slot is only reclaimable once its `uptime`
/// field has stopped advancing for longer than [`EXPIRE_DELAY`]; sample
/// it twice across that window.
fn is_expired(lvm: &LogicalVolume, pos: u64, first: &HeartbeatRecord) -> bool {
    std::thread::sleep(EXPIRE_DELAY);
    let mut buf = vec![0u8; HB_SLOT_SIZE as usize];
    if lvm.read_at(pos, &mut buf).is_err() {
        return false;
    }
    let second = HeartbeatRecord::read(&buf);
    second.is_active() && second.uptime == first.uptime && second.seq == first.seq
}
