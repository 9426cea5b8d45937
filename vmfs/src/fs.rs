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

//! The filesystem façade: super-block, the four bitmaps, the inode cache,
//! and the two-phase FDC bootstrap that makes everything else openable
//! (§4.M).

use crate::addressing;
use crate::bitmap::Bitmap;
use crate::block::{self, BlockType};
use crate::dir::Directory;
use crate::encoding::{read_fixed_str, read_le32, read_uuid};
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatIdentity, HeartbeatManager, HB_BASE, HB_COUNT, HB_SLOT_SIZE};
use crate::host::HostIdentity;
use crate::inode::{self, FileType, Inode, InodeCache, InodeHandle, Zla};
use crate::lvm::LogicalVolume;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const FSINFO_BASE: u64 = 0x200000;
pub const FSINFO_MAGIC: u32 = 0x2fabf15e;

const OFS_MAGIC: usize = 0x00;
const OFS_VOLVER: usize = 0x04;
const OFS_VER: usize = 0x08;
const OFS_UUID: usize = 0x09;
const OFS_LABEL: usize = 0x1d;
const LABEL_LEN: usize = 128;
const OFS_BLOCKSIZE: usize = 0xa1;
const OFS_CTIME: usize = 0xa9;
const OFS_LVM_UUID: usize = 0xb1;

/// Mount-time configuration, built by a front-end from its own CLI flags
/// (the ambient counterpart of a `vmfs_flags_t`-style struct).
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read_write: bool,
    pub allow_missing_extents: bool,
    pub direct_io: bool,
}

#[derive(Debug, Clone)]
pub struct SuperBlock {
    pub magic: u32,
    pub vol_version: u32,
    pub version: u8,
    pub uuid: [u8; 16],
    pub label: String,
    pub block_size: u64,
    pub ctime: u32,
    pub lvm_uuid: [u8; 16],
}

impl SuperBlock {
    fn read(buf: &[u8]) -> Result<Self> {
        let magic = read_le32(buf, OFS_MAGIC);
        if magic != FSINFO_MAGIC {
            return Err(Error::BadMagic);
        }
        let version = buf[OFS_VER];
        if version != 3 && version != 5 {
            return Err(Error::UnsupportedVersion(version as u32));
        }
        Ok(SuperBlock {
            magic,
            vol_version: read_le32(buf, OFS_VOLVER),
            version,
            uuid: read_uuid(buf, OFS_UUID),
            label: read_fixed_str(buf, OFS_LABEL, LABEL_LEN),
            block_size: read_le32(buf, OFS_BLOCKSIZE) as u64,
            ctime: read_le32(buf, OFS_CTIME),
            lvm_uuid: read_uuid(buf, OFS_LVM_UUID),
        })
    }
}

impl fmt::Display for SuperBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "VMFS FS Information:")?;
        writeln!(f, "  - Vol. Version : {}", self.vol_version)?;
        writeln!(f, "  - Version      : {}", self.version)?;
        writeln!(f, "  - Label        : {}", self.label)?;
        writeln!(
            f,
            "  - Block size   : {} (0x{:x})",
            self.block_size, self.block_size
        )
    }
}

/// An open VMFS filesystem. Always held behind an `Arc`: inode handles
/// keep a weak back-reference so they can write themselves back on drop.
pub struct Filesystem {
    pub lvm: LogicalVolume,
    pub host: HostIdentity,
    heartbeat: HeartbeatManager,
    pub super_block: SuperBlock,
    pub fbb: Bitmap,
    pub sbc: Bitmap,
    pub pbc: Bitmap,
    pub fdc: Bitmap,
    root_pos: u64,
    pub(crate) inodes: Mutex<InodeCache>,
    inode_gen: AtomicU64,
}

/// Reads a bootstrap directory's raw content, assuming it is FB-addressed
/// (always true for the root directory and the four meta-files on a
/// formatted volume — they are allocated full blocks at mkfs time
/// specifically so this bootstrap never needs the SBC/PBC bitmaps it is
/// trying to locate).
fn read_bootstrap_dir(lvm: &LogicalVolume, inode: &Inode, block_size: u64) -> Result<Vec<u8>> {
    if inode.zla_mode()? != Zla::Fb {
        return Err(Error::Corrupted("bootstrap directory is not FB-addressed"));
    }
    let mut content = vec![0u8; inode.size as usize];
    let mut done = 0usize;
    while (done as u64) < inode.size {
        let logical = done as u64 / block_size;
        let leaf = inode.blocks[logical as usize];
        let blk_off = done as u64 % block_size;
        let clen = ((block_size - blk_off) as usize).min(content.len() - done);
        if leaf != 0 {
            let pos = block::fb_item(leaf) as u64 * block_size + blk_off;
            lvm.read_at(pos, &mut content[done..done + clen])?;
        }
        done += clen;
    }
    Ok(content)
}

fn find_dirent(content: &[u8], name: &str) -> Option<u32> {
    content
        .chunks_exact(crate::dir::DIRENT_SIZE)
        .map(crate::dir::DirEntry::read)
        .find(|rec| !rec.is_free() && rec.name == name)
        .map(|rec| rec.block_id)
}

fn read_meta_inode(lvm: &LogicalVolume, fdc_boot: &Bitmap, blk_id: u32) -> Result<Inode> {
    let pos = fdc_boot.item_pos(block::fd_entry(blk_id), block::fd_item(blk_id));
    let mut buf = [0u8; inode::INODE_SIZE];
    lvm.read_at(pos, &mut buf)?;
    Inode::read(&buf)
}

/// Resolves one of the four `.xxx.sf` meta-files to the absolute LVM base
/// of its (single, FB-addressed) content block.
fn resolve_meta_base(
    lvm: &LogicalVolume,
    fdc_boot: &Bitmap,
    root_content: &[u8],
    block_size: u64,
    name: &str,
) -> Result<u64> {
    let blk_id = find_dirent(root_content, name).ok_or(Error::NotFound)?;
    let meta_inode = read_meta_inode(lvm, fdc_boot, blk_id)?;
    if meta_inode.zla_mode()? != Zla::Fb || meta_inode.blocks[0] == 0 {
        return Err(Error::Corrupted("meta-file is not FB-addressed"));
    }
    Ok(block::fb_item(meta_inode.blocks[0]) as u64 * block_size)
}

impl Filesystem {
    /// §4.M open(): builds the LVM, reads the super-block, bootstraps the
    /// FDC through a throwaway placeholder, then opens the root directory
    /// and the three remaining bitmaps as ordinary meta-files before
    /// discarding the placeholder in favour of the real `.fdc.sf`.
    pub fn open(paths: &[&Path], flags: OpenFlags) -> Result<Arc<Filesystem>> {
        Self::open_inner(paths, flags).map_err(|e| {
            eprintln!("vmfs: failed to open filesystem: {}", e);
            e
        })
    }

    fn open_inner(paths: &[&Path], flags: OpenFlags) -> Result<Arc<Filesystem>> {
        let host = HostIdentity::new();
        let lvm = LogicalVolume::open(paths, flags.read_write, flags.allow_missing_extents, flags.direct_io)?;

        let mut buf = [0u8; 512];
        lvm.read_at(FSINFO_BASE, &mut buf)?;
        let super_block = SuperBlock::read(&buf)?;
        if super_block.lvm_uuid != lvm.uuid() {
            return Err(Error::Corrupted("FS does not belong to the underlying LVM"));
        }

        let block_size = super_block.block_size;

        // The FDC sits at the first block boundary after the heartbeat
        // array, or at block 1 if the heartbeat array is smaller than one
        // block (vmfs_fs_open's `m_max`).
        let fdc_base = (HB_BASE + HB_COUNT as u64 * HB_SLOT_SIZE).max(block_size);
        let fdc_boot = Bitmap::open(&lvm, BlockType::FileDescriptor, fdc_base)?;

        // Entry 0, item 0 of the FDC is the root directory's inode by
        // convention (`build_fd(0, 0)` is the canonical root block id).
        let root_pos = fdc_boot.item_pos(0, 0);
        let mut root_buf = [0u8; inode::INODE_SIZE];
        lvm.read_at(root_pos, &mut root_buf)?;
        let root_inode = Inode::read(&root_buf)?;
        let root_content = read_bootstrap_dir(&lvm, &root_inode, block_size)?;

        let fbb_base = resolve_meta_base(&lvm, &fdc_boot, &root_content, block_size, ".fbb.sf")?;
        let sbc_base = resolve_meta_base(&lvm, &fdc_boot, &root_content, block_size, ".sbc.sf")?;
        let pbc_base = resolve_meta_base(&lvm, &fdc_boot, &root_content, block_size, ".pbc.sf")?;
        let fdc_real_base = resolve_meta_base(&lvm, &fdc_boot, &root_content, block_size, ".fdc.sf")?;
        drop(fdc_boot);

        let fbb = Bitmap::open(&lvm, BlockType::FileBlock, fbb_base)?;
        let sbc = Bitmap::open(&lvm, BlockType::SubBlock, sbc_base)?;
        let pbc = Bitmap::open(&lvm, BlockType::PointerBlock, pbc_base)?;
        let fdc = Bitmap::open(&lvm, BlockType::FileDescriptor, fdc_real_base)?;

        Ok(Arc::new(Filesystem {
            lvm,
            host,
            heartbeat: HeartbeatManager::new(),
            super_block,
            fbb,
            sbc,
            pbc,
            fdc,
            root_pos,
            inodes: Mutex::new(InodeCache::new()),
            inode_gen: AtomicU64::new(0),
        }))
    }

    /// §4.M close(): every mutation already writes its inode back
    /// synchronously (see [`inode::update`]), so this is a safety-net
    /// flush rather than a deferred-dirty one, followed by releasing the
    /// filesystem's own heartbeat slot.
    pub fn close(&self) -> Result<()> {
        inode::flush_all(self)?;
        self.heartbeat.shutdown(&self.lvm);
        Ok(())
    }

    pub fn root(self: &Arc<Self>) -> Result<InodeHandle> {
        inode::acquire(self, block::build_fd(0, 0), self.root_pos)
    }

    pub fn block_size(&self) -> u64 {
        self.super_block.block_size
    }

    pub fn bitmap_for(&self, block_type: BlockType) -> &Bitmap {
        match block_type {
            BlockType::FileBlock => &self.fbb,
            BlockType::SubBlock => &self.sbc,
            BlockType::PointerBlock => &self.pbc,
            BlockType::FileDescriptor => &self.fdc,
            BlockType::None => unreachable!("BlockType::None has no bitmap"),
        }
    }

    /// Translates a raw FB item number into an LVM position and reads
    /// through it, matching the source's `vmfs_fs_read`.
    pub fn block_read(&self, item: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.lvm.read_at(item as u64 * self.block_size() + offset, buf)
    }

    pub fn block_write(&self, item: u32, offset: u64, buf: &[u8]) -> Result<()> {
        self.lvm.write_at(item as u64 * self.block_size() + offset, buf)
    }

    pub fn heartbeat_acquire(&self) -> Result<()> {
        self.heartbeat.acquire(&self.lvm, &self.host)
    }

    pub fn heartbeat_release(&self) {
        self.heartbeat.release()
    }

    pub fn heartbeat_identity(&self) -> Option<HeartbeatIdentity> {
        self.heartbeat.identity(&self.host)
    }

    /// Monotonic per-filesystem counter seeding a fresh inode's `id2`
    /// (§4.I alloc: `id2 = ++filesystem.inode_gen`).
    pub fn next_inode_gen(&self) -> u32 {
        self.inode_gen.fetch_add(1, Ordering::Relaxed) as u32 + 1
    }

    /// Supplemented fsck-style accounting pass: walks every inode reachable
    /// from the root, tallying the blocks each one references, for a
    /// read-only cross-check against what the bitmaps claim is allocated.
    /// No repair; see `BlockAccounting::diff_from_bitmaps`.
    pub fn walk_blocks(self: &Arc<Self>) -> Result<BlockAccounting> {
        let mut acc = BlockAccounting::default();
        let mut visited = HashSet::new();
        let root = self.root()?;
        acc.fd += 1;
        self.walk_dir(root, &mut acc, &mut visited)?;
        Ok(acc)
    }

    fn walk_dir(self: &Arc<Self>, dir_inode: InodeHandle, acc: &mut BlockAccounting, visited: &mut HashSet<u32>) -> Result<()> {
        self.tally_inode(&dir_inode, acc)?;
        let mut dir = Directory::open_from_handle(self.clone(), dir_inode)?;
        while let Some(entry) = dir.read()? {
            if entry.is_free() || entry.name == "." || entry.name == ".." {
                continue;
            }
            if !visited.insert(entry.block_id) {
                continue;
            }
            let pos = crate::bitmap::item_position(self, entry.block_id)?;
            let child = inode::acquire(self, entry.block_id, pos)?;
            acc.fd += 1;
            if FileType::from_raw(entry.file_type_raw)? == FileType::Directory {
                self.walk_dir(child, acc, visited)?;
            } else {
                self.tally_inode(&child, acc)?;
            }
        }
        Ok(())
    }

    fn tally_inode(&self, handle: &InodeHandle, acc: &mut BlockAccounting) -> Result<()> {
        let inode = handle.lock();
        if inode.is_inline() {
            return Ok(());
        }
        addressing::foreach_block(self, &inode, |pb_blk, leaf_blk| {
            if pb_blk != 0 {
                acc.pb += 1;
            }
            match block::block_type(leaf_blk) {
                Some(BlockType::FileBlock) => acc.fb += 1,
                Some(BlockType::SubBlock) => acc.sb += 1,
                _ => {}
            }
        })
    }
}

/// Per-type referenced-block tallies from [`Filesystem::walk_blocks`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockAccounting {
    pub fb: u32,
    pub sb: u32,
    pub pb: u32,
    pub fd: u32,
}

impl BlockAccounting {
    /// Diffs each tally against its bitmap's own `total_items - free`
    /// accounting, returning how many of the four categories disagree.
    pub fn diff_from_bitmaps(&self, fs: &Filesystem) -> Result<u32> {
        let mut mismatches = 0;
        for (referenced, bitmap) in [
            (self.fb, &fs.fbb),
            (self.sb, &fs.sbc),
            (self.pb, &fs.pbc),
            (self.fd, &fs.fdc),
        ] {
            let used = bitmap.header.total_items - bitmap.free_items(fs)?;
            if used != referenced {
                mismatches += 1;
            }
        }
        Ok(mismatches)
    }
}
