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

//! The four on-disk bitmap allocators (FBB, SBC, PBC, FDC) and the
//! block-level alloc/free/status operations layered on top of them
//! (§4.G).
//!
//! On-disk convention, confirmed against the arithmetic of the
//! documented invariant rather than its prose: a *set* bit means the
//! item is free; allocation clears it. `total_items − Σfree` then equals
//! the popcount of cleared bits, which is exactly the stated invariant.

use crate::block::{self, BlockType};
use crate::encoding::{read_le32, write_le32};
use crate::fs::Filesystem;
use crate::metadata::{self, MetadataHeader};
use crate::error::{Error, Result};

pub const ENTRY_SIZE: usize = 1024;

const OFS_ITEMS_PER_ENTRY: usize = 0x00;
const OFS_ENTRIES_PER_AREA: usize = 0x04;
const OFS_HDR_SIZE: usize = 0x08;
const OFS_DATA_SIZE: usize = 0x0c;
const OFS_AREA_SIZE: usize = 0x10;
const OFS_TOTAL_ITEMS: usize = 0x14;
const OFS_AREA_COUNT: usize = 0x18;

const BME_OFS_ID: usize = 0x200;
const BME_OFS_TOTAL: usize = 0x204;
const BME_OFS_FREE: usize = 0x208;
const BME_OFS_FFREE: usize = 0x20c;
const BME_OFS_BITMAP: usize = 0x210;

#[derive(Debug, Clone, Default)]
pub struct BitmapHeader {
    pub items_per_bitmap_entry: u32,
    pub bmp_entries_per_area: u32,
    pub hdr_size: u32,
    pub data_size: u32,
    pub area_size: u32,
    pub total_items: u32,
    pub area_count: u32,
}

impl BitmapHeader {
    pub fn read(buf: &[u8]) -> Self {
        BitmapHeader {
            items_per_bitmap_entry: read_le32(buf, OFS_ITEMS_PER_ENTRY),
            bmp_entries_per_area: read_le32(buf, OFS_ENTRIES_PER_AREA),
            hdr_size: read_le32(buf, OFS_HDR_SIZE),
            data_size: read_le32(buf, OFS_DATA_SIZE),
            area_size: read_le32(buf, OFS_AREA_SIZE),
            total_items: read_le32(buf, OFS_TOTAL_ITEMS),
            area_count: read_le32(buf, OFS_AREA_COUNT),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        write_le32(buf, OFS_ITEMS_PER_ENTRY, self.items_per_bitmap_entry);
        write_le32(buf, OFS_ENTRIES_PER_AREA, self.bmp_entries_per_area);
        write_le32(buf, OFS_HDR_SIZE, self.hdr_size);
        write_le32(buf, OFS_DATA_SIZE, self.data_size);
        write_le32(buf, OFS_AREA_SIZE, self.area_size);
        write_le32(buf, OFS_TOTAL_ITEMS, self.total_items);
        write_le32(buf, OFS_AREA_COUNT, self.area_count);
    }

    fn items_per_area(&self) -> u32 {
        self.bmp_entries_per_area * self.items_per_bitmap_entry
    }

    fn area_addr(&self, area: u32) -> u64 {
        self.hdr_size as u64 + area as u64 * self.area_size as u64
    }
}

#[derive(Debug, Clone)]
pub struct BitmapEntry {
    pub mdh: MetadataHeader,
    pub id: u32,
    pub total: u32,
    pub free: u32,
    pub ffree: u32,
    pub bitmap: Vec<u8>,
}

impl BitmapEntry {
    fn read(buf: &[u8]) -> Self {
        let mdh = MetadataHeader::read(buf);
        let total = read_le32(buf, BME_OFS_TOTAL);
        let nbytes = ((total + 7) / 8) as usize;
        BitmapEntry {
            mdh,
            id: read_le32(buf, BME_OFS_ID),
            total,
            free: read_le32(buf, BME_OFS_FREE),
            ffree: read_le32(buf, BME_OFS_FFREE),
            bitmap: buf[BME_OFS_BITMAP..BME_OFS_BITMAP + nbytes].to_vec(),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        let mut hdr = [0u8; metadata::HDR_SIZE];
        self.mdh.write(&mut hdr);
        buf[..metadata::HDR_SIZE].copy_from_slice(&hdr);
        write_le32(buf, BME_OFS_ID, self.id);
        write_le32(buf, BME_OFS_TOTAL, self.total);
        write_le32(buf, BME_OFS_FREE, self.free);
        write_le32(buf, BME_OFS_FFREE, self.ffree);
        buf[BME_OFS_BITMAP..BME_OFS_BITMAP + self.bitmap.len()].copy_from_slice(&self.bitmap);
    }

    fn bit(&self, idx: u32) -> bool {
        self.bitmap[(idx >> 3) as usize] & (1 << (idx & 7)) != 0
    }

    fn set_bit(&mut self, idx: u32, val: bool) {
        let byte = &mut self.bitmap[(idx >> 3) as usize];
        let mask = 1 << (idx & 7);
        if val {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    fn update_ffree(&mut self) {
        self.ffree = (0..self.total).find(|&i| self.bit(i)).unwrap_or(0);
    }
}

/// One of the four on-disk allocators. Each lives at a fixed LVM offset —
/// the same "fixed meta-region" convention as the volume/FS/heartbeat
/// headers — rather than being addressed through the general inode/File
/// path, which sidesteps the FDC's bootstrap problem (the FDC's own
/// header must be readable before any inode, including its own, can be
/// resolved).
pub struct Bitmap {
    pub block_type: BlockType,
    pub base: u64,
    pub header: BitmapHeader,
}

impl Bitmap {
    pub fn open(fs_dev: &crate::lvm::LogicalVolume, block_type: BlockType, base: u64) -> Result<Self> {
        let mut buf = [0u8; ENTRY_SIZE];
        fs_dev.read_at(base, &mut buf[..512])?;
        let header = BitmapHeader::read(&buf);
        Ok(Bitmap {
            block_type,
            base,
            header,
        })
    }

    fn locate(&self, entry_idx: u32, item_idx: u32) -> (u32, u32) {
        let addr = entry_idx * self.header.items_per_bitmap_entry + item_idx;
        let items_per_area = self.header.items_per_area();
        let area = addr / items_per_area;
        let local_entry = (addr % items_per_area) / self.header.items_per_bitmap_entry;
        (area, local_entry)
    }

    pub fn get_entry(&self, fs: &Filesystem, entry_idx: u32, item_idx: u32) -> Result<BitmapEntry> {
        let (area, local) = self.locate(entry_idx, item_idx);
        let pos = self.base + self.header.area_addr(area) + local as u64 * ENTRY_SIZE as u64;
        let mut buf = [0u8; ENTRY_SIZE];
        fs.lvm.read_at(pos, &mut buf)?;
        Ok(BitmapEntry::read(&buf))
    }

    pub(crate) fn item_pos(&self, entry_idx: u32, item_idx: u32) -> u64 {
        let addr = entry_idx * self.header.items_per_bitmap_entry + item_idx;
        let items_per_area = self.header.items_per_area();
        let area = addr / items_per_area;
        self.base
            + self.header.area_addr(area)
            + self.header.bmp_entries_per_area as u64 * ENTRY_SIZE as u64
            + (addr % items_per_area) as u64 * self.header.data_size as u64
    }

    pub fn get_item(&self, fs: &Filesystem, entry_idx: u32, item_idx: u32, buf: &mut [u8]) -> Result<()> {
        fs.lvm.read_at(self.item_pos(entry_idx, item_idx), buf)
    }

    pub fn set_item(&self, fs: &Filesystem, entry_idx: u32, item_idx: u32, buf: &[u8]) -> Result<()> {
        fs.lvm.write_at(self.item_pos(entry_idx, item_idx), buf)
    }

    fn update_entry(&self, fs: &Filesystem, entry: &BitmapEntry) -> Result<()> {
        let mut buf = vec![0u8; ENTRY_SIZE];
        entry.write(&mut buf);
        fs.lvm.write_at(entry.mdh.pos, &buf)
    }

    /// Scans every area/entry for one with at least one free item, taking
    /// its metadata lock and re-validating `free` under the lock before
    /// returning.
    fn find_free_entry(&self, fs: &Filesystem) -> Result<(metadata::MetadataLock, BitmapEntry)> {
        for area in 0..self.header.area_count {
            let pos = self.base + self.header.area_addr(area);
            let buf_len = self.header.bmp_entries_per_area as usize * ENTRY_SIZE;
            let mut area_buf = vec![0u8; buf_len];
            if fs.lvm.read_at(pos, &mut area_buf).is_err() {
                continue;
            }

            for i in 0..self.header.bmp_entries_per_area {
                let off = i as usize * ENTRY_SIZE;
                let candidate = BitmapEntry::read(&area_buf[off..off + ENTRY_SIZE]);
                if candidate.mdh.is_locked() || candidate.free == 0 {
                    continue;
                }

                let mut lock_buf = area_buf[off..off + ENTRY_SIZE].to_vec();
                let lock = match metadata::lock(fs, candidate.mdh.pos, &mut lock_buf) {
                    Ok(l) => l,
                    Err(Error::Locked) => continue,
                    Err(e) => return Err(e),
                };

                let fresh = BitmapEntry::read(&lock_buf);
                if fresh.free == 0 {
                    metadata::unlock(fs, lock)?;
                    continue;
                }
                return Ok((lock, fresh));
            }
        }
        Err(Error::NoSpace)
    }

    /// §4.G check(): validates structural invariants without mutating
    /// anything, returning the number of violations found.
    pub fn check(&self, fs: &Filesystem) -> Result<u32> {
        let mut errors = 0;
        let mut seen_total = 0u32;

        for area in 0..self.header.area_count {
            let pos = self.base + self.header.area_addr(area);
            let buf_len = self.header.bmp_entries_per_area as usize * ENTRY_SIZE;
            let mut area_buf = vec![0u8; buf_len];
            fs.lvm.read_at(pos, &mut area_buf)?;

            for i in 0..self.header.bmp_entries_per_area {
                let off = i as usize * ENTRY_SIZE;
                let entry = BitmapEntry::read(&area_buf[off..off + ENTRY_SIZE]);
                if entry.mdh.magic == 0 {
                    continue;
                }

                let expected_id = area * self.header.bmp_entries_per_area + i;
                if entry.id != expected_id {
                    errors += 1;
                }
                if entry.total > self.header.items_per_bitmap_entry {
                    errors += 1;
                }
                let cleared = (0..entry.total).filter(|&b| !entry.bit(b)).count() as u32;
                let used = entry.total - entry.free;
                if cleared != used {
                    errors += 1;
                }
                seen_total += entry.total;
            }
        }

        if seen_total != self.header.total_items {
            errors += 1;
        }
        Ok(errors)
    }

    /// Total free items across every area/entry, the same sum `df`-style
    /// summaries and the fsck-style accounting walk both need.
    pub fn free_items(&self, fs: &Filesystem) -> Result<u32> {
        let mut free = 0u32;
        for n in 0..self.header.area_count * self.header.bmp_entries_per_area {
            free += self.get_entry(fs, n, 0)?.free;
        }
        Ok(free)
    }

    /// Invokes `cbk` with the block id of every allocated item.
    pub fn foreach_allocated(&self, fs: &Filesystem, mut cbk: impl FnMut(u32)) -> Result<()> {
        for area in 0..self.header.area_count {
            let pos = self.base + self.header.area_addr(area);
            let buf_len = self.header.bmp_entries_per_area as usize * ENTRY_SIZE;
            let mut area_buf = vec![0u8; buf_len];
            fs.lvm.read_at(pos, &mut area_buf)?;

            for i in 0..self.header.bmp_entries_per_area {
                let off = i as usize * ENTRY_SIZE;
                let entry = BitmapEntry::read(&area_buf[off..off + ENTRY_SIZE]);
                if entry.mdh.magic == 0 {
                    continue;
                }
                for item in 0..entry.total {
                    if !entry.bit(item) {
                        let folded = if self.block_type == BlockType::FileBlock {
                            entry.id * self.header.items_per_bitmap_entry + item
                        } else {
                            item
                        };
                        cbk(build_block_id(self.block_type, entry.id, folded));
                    }
                }
            }
        }
        Ok(())
    }
}

/// `entry` is the bitmap entry id; for FB the encoded block id packs a
/// single linear address (`entry * items_per_bitmap_entry + item`), which
/// the caller has already folded into `item` before calling this helper.
fn build_block_id(block_type: BlockType, entry: u32, item: u32) -> u32 {
    match block_type {
        BlockType::FileBlock => block::build_fb(item),
        BlockType::SubBlock => block::build_sb(entry, item),
        BlockType::PointerBlock => block::build_pb(entry, item),
        BlockType::FileDescriptor => block::build_fd(entry, item),
        BlockType::None => 0,
    }
}

struct BlockInfo {
    entry: u32,
    item: u32,
    block_type: BlockType,
}

fn decode_block(blk_id: u32) -> Result<BlockInfo> {
    let block_type = block::block_type(blk_id).ok_or(Error::InvalidArg("unknown block type"))?;
    let (entry, item) = match block_type {
        BlockType::FileBlock => (0, block::fb_item(blk_id)),
        BlockType::SubBlock => (block::sb_entry(blk_id), block::sb_item(blk_id)),
        BlockType::PointerBlock => (block::pb_entry(blk_id), block::pb_item(blk_id)),
        BlockType::FileDescriptor => (block::fd_entry(blk_id), block::fd_item(blk_id)),
        BlockType::None => return Err(Error::InvalidArg("block id has no type")),
    };
    Ok(BlockInfo {
        entry,
        item,
        block_type,
    })
}

/// Allocates one item of `block_type`, returning the encoded block id.
pub fn alloc_block(fs: &Filesystem, block_type: BlockType) -> Result<u32> {
    let bmp = fs.bitmap_for(block_type);
    let (lock, mut entry) = bmp.find_free_entry(fs)?;

    let item = (0..entry.total)
        .find(|&i| entry.bit(i))
        .ok_or(Error::NoSpace)?;
    entry.set_bit(item, false);
    entry.free -= 1;
    entry.update_ffree();

    bmp.update_entry(fs, &entry)?;
    metadata::unlock(fs, lock)?;

    let blk_id = match block_type {
        BlockType::FileBlock => {
            let addr = entry.id * bmp.header.items_per_bitmap_entry + item;
            block::build_fb(addr)
        }
        BlockType::SubBlock => block::build_sb(entry.id, item),
        BlockType::PointerBlock => block::build_pb(entry.id, item),
        BlockType::FileDescriptor => block::build_fd(entry.id, item),
        BlockType::None => return Err(Error::InvalidArg("cannot allocate type none")),
    };
    Ok(blk_id)
}

/// Marks a specific, already-encoded block id as allocated (bootstrap and
/// the supplemented fsck-style accounting walk use this).
pub fn alloc_specified(fs: &Filesystem, blk_id: u32) -> Result<()> {
    set_status(fs, blk_id, false)
}

pub fn free_block(fs: &Filesystem, blk_id: u32) -> Result<()> {
    set_status(fs, blk_id, true)
}

fn set_status(fs: &Filesystem, blk_id: u32, to_free: bool) -> Result<()> {
    let info = decode_block(blk_id)?;
    let bmp = fs.bitmap_for(info.block_type);
    let mut entry = bmp.get_entry(fs, info.entry, info.item)?;

    let mut lock_buf = vec![0u8; ENTRY_SIZE];
    entry.write(&mut lock_buf);
    let lock = metadata::lock(fs, entry.mdh.pos, &mut lock_buf)?;
    entry = BitmapEntry::read(&lock_buf);

    let bit_is_set = entry.bit(info.item % bmp.header.items_per_bitmap_entry);
    if to_free == bit_is_set {
        metadata::unlock(fs, lock)?;
        return Err(Error::InvalidArg("double free or double alloc"));
    }

    let bit_idx = info.item % bmp.header.items_per_bitmap_entry;
    entry.set_bit(bit_idx, to_free);
    if to_free {
        entry.free += 1;
    } else {
        entry.free -= 1;
    }
    entry.update_ffree();

    bmp.update_entry(fs, &entry)?;
    metadata::unlock(fs, lock)
}

/// 0 = free, 1 = allocated, matching the source's documented return
/// convention for `vmfs_block_get_status`.
pub fn block_status(fs: &Filesystem, blk_id: u32) -> Result<bool> {
    let info = decode_block(blk_id)?;
    let bmp = fs.bitmap_for(info.block_type);
    let entry = bmp.get_entry(fs, info.entry, info.item)?;
    let bit_idx = info.item % bmp.header.items_per_bitmap_entry;
    Ok(!entry.bit(bit_idx))
}

/// Byte position of `blk_id`'s item payload within its owning bitmap file —
/// an inode for FD ids, a sub-block for SB ids, a pointer-block payload for
/// PB ids. FB ids have no bitmap-relative position; they are plain file
/// blocks addressed directly through [`Filesystem::block_position`].
pub fn item_position(fs: &Filesystem, blk_id: u32) -> Result<u64> {
    let info = decode_block(blk_id)?;
    if info.block_type == BlockType::FileBlock {
        return Err(Error::InvalidArg("FB ids have no bitmap item position"));
    }
    let bmp = fs.bitmap_for(info.block_type);
    Ok(bmp.item_pos(info.entry, info.item))
}
