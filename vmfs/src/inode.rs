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

//! The 2048-byte on-disk inode and the in-core cache keyed by file-descriptor
//! block id (§4.I).

use crate::encoding::{read_le32, read_le64, write_le32, write_le64};
use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::metadata::{self, MetadataHeader};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

pub const INODE_SIZE: usize = 2048;
pub const BLOCK_COUNT: usize = 256;
const OFS_ID: usize = 0x200;
const OFS_ID2: usize = 0x204;
const OFS_NLINK: usize = 0x208;
const OFS_TYPE: usize = 0x20c;
const OFS_FLAGS: usize = 0x210;
const OFS_SIZE: usize = 0x214;
const OFS_BLK_SIZE: usize = 0x21c;
const OFS_BLK_COUNT: usize = 0x224;
const OFS_MTIME: usize = 0x22c;
const OFS_CTIME: usize = 0x230;
const OFS_ATIME: usize = 0x234;
const OFS_UID: usize = 0x238;
const OFS_GID: usize = 0x23c;
const OFS_MODE: usize = 0x240;
const OFS_ZLA: usize = 0x244;
const OFS_TBZ: usize = 0x248;
const OFS_COW: usize = 0x24c;
const OFS_CONTENT: usize = 0x400;

/// §9: V5 re-bases ZLA so that FB/SB/PB/FD start at 4301 instead of 1.
pub const V5_ZLA_BASE: u32 = 4301;

pub const SYNC_META: u32 = 0x01;
pub const SYNC_BLK: u32 = 0x02;
pub const SYNC_ALL: u32 = SYNC_META | SYNC_BLK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    RawDeviceMap,
}

impl FileType {
    pub fn from_raw(v: u32) -> Result<Self> {
        match v {
            1 => Ok(FileType::RegularFile),
            2 => Ok(FileType::Directory),
            3 => Ok(FileType::Symlink),
            4 => Ok(FileType::RawDeviceMap),
            _ => Err(Error::Corrupted("unknown inode type")),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            FileType::RegularFile => 1,
            FileType::Directory => 2,
            FileType::Symlink => 3,
            FileType::RawDeviceMap => 4,
        }
    }
}

/// Indirection mode normalized out of the raw ZLA field (§3, §4.I). VMFS has
/// only one level of pointer-block indirection: `FB`/`SB` address `blocks[]`
/// directly (as file-block or sub-block leaves respectively), `PB` holds one
/// pointer-block id per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zla {
    /// `blocks[]` holds file-block ids directly.
    Fb,
    /// `blocks[]` holds sub-block ids directly.
    Sb,
    /// `blocks[]` holds pointer-block ids, each pointing at FB leaves.
    Pb,
    /// Content lives inside the inode's own content area; the resolved
    /// "block" is the inode's own FD id.
    Fd,
}

impl Zla {
    pub fn from_raw(raw: u32) -> Result<Self> {
        let normalized = if raw >= V5_ZLA_BASE {
            raw - V5_ZLA_BASE
        } else {
            raw
        };
        match normalized {
            1 => Ok(Zla::Fb),
            2 => Ok(Zla::Sb),
            3 => Ok(Zla::Pb),
            4 => Ok(Zla::Fd),
            _ => Err(Error::Corrupted("unknown ZLA mode")),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Zla::Fb => 1,
            Zla::Sb => 2,
            Zla::Pb => 3,
            Zla::Fd => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inode {
    pub mdh: MetadataHeader,
    pub id: u32,
    pub id2: u32,
    pub nlink: u32,
    pub file_type: FileType,
    pub flags: u32,
    pub size: u64,
    pub blk_size: u64,
    pub blk_count: u64,
    pub mtime: u32,
    pub ctime: u32,
    pub atime: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub zla: u32,
    pub tbz: u32,
    pub cow: u32,
    /// Direct/indirect block pointers (ZLA-dependent), raw device id, or
    /// inline file content — dispatch on `file_type`/`zla_mode()`, see
    /// `is_inline`.
    pub blocks: [u32; BLOCK_COUNT],
    pub content: Vec<u8>,
}

impl Inode {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mdh = MetadataHeader::read(buf);
        let file_type = FileType::from_raw(read_le32(buf, OFS_TYPE))?;

        let mut blocks = [0u32; BLOCK_COUNT];
        for (i, slot) in blocks.iter_mut().enumerate() {
            *slot = read_le32(buf, OFS_CONTENT + i * 4);
        }
        let content = buf[OFS_CONTENT..OFS_CONTENT + 1024].to_vec();

        Ok(Inode {
            mdh,
            id: read_le32(buf, OFS_ID),
            id2: read_le32(buf, OFS_ID2),
            nlink: read_le32(buf, OFS_NLINK),
            file_type,
            flags: read_le32(buf, OFS_FLAGS),
            size: read_le64(buf, OFS_SIZE),
            blk_size: read_le64(buf, OFS_BLK_SIZE),
            blk_count: read_le64(buf, OFS_BLK_COUNT),
            mtime: read_le32(buf, OFS_MTIME),
            ctime: read_le32(buf, OFS_CTIME),
            atime: read_le32(buf, OFS_ATIME),
            uid: read_le32(buf, OFS_UID),
            gid: read_le32(buf, OFS_GID),
            mode: read_le32(buf, OFS_MODE),
            zla: read_le32(buf, OFS_ZLA),
            tbz: read_le32(buf, OFS_TBZ),
            cow: read_le32(buf, OFS_COW),
            blocks,
            content,
        })
    }

    pub fn write(&self, buf: &mut [u8; INODE_SIZE]) {
        let mut hdr = [0u8; metadata::HDR_SIZE];
        self.mdh.write(&mut hdr);
        buf[..metadata::HDR_SIZE].copy_from_slice(&hdr);

        write_le32(buf, OFS_ID, self.id);
        write_le32(buf, OFS_ID2, self.id2);
        write_le32(buf, OFS_NLINK, self.nlink);
        write_le32(buf, OFS_TYPE, self.file_type.to_raw());
        write_le32(buf, OFS_FLAGS, self.flags);
        write_le64(buf, OFS_SIZE, self.size);
        write_le64(buf, OFS_BLK_SIZE, self.blk_size);
        write_le64(buf, OFS_BLK_COUNT, self.blk_count);
        write_le32(buf, OFS_MTIME, self.mtime);
        write_le32(buf, OFS_CTIME, self.ctime);
        write_le32(buf, OFS_ATIME, self.atime);
        write_le32(buf, OFS_UID, self.uid);
        write_le32(buf, OFS_GID, self.gid);
        write_le32(buf, OFS_MODE, self.mode);
        write_le32(buf, OFS_ZLA, self.zla);
        write_le32(buf, OFS_TBZ, self.tbz);
        write_le32(buf, OFS_COW, self.cow);

        if self.is_inline() {
            buf[OFS_CONTENT..OFS_CONTENT + self.content.len().min(1024)]
                .copy_from_slice(&self.content[..self.content.len().min(1024)]);
        } else {
            for (i, &blk) in self.blocks.iter().enumerate() {
                write_le32(buf, OFS_CONTENT + i * 4, blk);
            }
        }
    }

    pub fn zla_mode(&self) -> Result<Zla> {
        Zla::from_raw(self.zla)
    }

    /// Inline content (symlink target text, or a V5 FD-addressed tiny file
    /// stored directly in the inode) rather than block-addressed data.
    pub fn is_inline(&self) -> bool {
        if self.file_type == FileType::RawDeviceMap {
            return false;
        }
        if self.file_type == FileType::Symlink && self.blk_size == 0 {
            return true;
        }
        matches!(self.zla_mode(), Ok(Zla::Fd))
    }
}

/// Shared, reference-counted handle to a cached in-core inode. Cloning is
/// cheap; the filesystem's cache holds one reference of its own alongside
/// every live handle.
#[derive(Clone)]
pub struct InodeHandle {
    pub blk_id: u32,
    inner: Arc<Mutex<Inode>>,
    fs: Weak<Filesystem>,
}

impl InodeHandle {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, Inode> {
        self.inner.lock().unwrap()
    }
}

impl Drop for InodeHandle {
    /// When only the cache's own [`Arc`] and this handle remain (strong
    /// count 2), write back a dirty inode and evict it — mirroring the
    /// manual refcounted hash table of the source, minus the manual
    /// bookkeeping.
    fn drop(&mut self) {
        let fs = match self.fs.upgrade() {
            Some(fs) => fs,
            None => return,
        };
        let mut cache = fs.inodes.lock().unwrap();
        if Arc::strong_count(&self.inner) != 2 {
            return;
        }
        let inode = self.inner.lock().unwrap();
        if inode.mdh.pos != 0 {
            let _ = writeback(&fs, &inode);
        }
        drop(inode);
        cache.remove(&self.blk_id);
    }
}

pub struct InodeCache {
    entries: HashMap<u32, Arc<Mutex<Inode>>>,
}

impl InodeCache {
    pub fn new() -> Self {
        InodeCache {
            entries: HashMap::new(),
        }
    }

    fn remove(&mut self, blk_id: &u32) {
        self.entries.remove(blk_id);
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// §4.I acquire: returns the cached handle if the inode is already resident,
/// otherwise reads it from disk at `pos` and inserts it.
pub fn acquire(fs: &Arc<Filesystem>, blk_id: u32, pos: u64) -> Result<InodeHandle> {
    let mut cache = fs.inodes.lock().unwrap();
    if let Some(inner) = cache.entries.get(&blk_id) {
        return Ok(InodeHandle {
            blk_id,
            inner: inner.clone(),
            fs: Arc::downgrade(fs),
        });
    }

    let mut buf = [0u8; INODE_SIZE];
    fs.lvm.read_at(pos, &mut buf)?;
    let inode = Inode::read(&buf)?;
    let inner = Arc::new(Mutex::new(inode));
    cache.entries.insert(blk_id, inner.clone());

    Ok(InodeHandle {
        blk_id,
        inner,
        fs: Arc::downgrade(fs),
    })
}

fn writeback(fs: &Filesystem, inode: &Inode) -> Result<()> {
    let mut buf = [0u8; INODE_SIZE];
    inode.write(&mut buf);
    fs.lvm.write_at(inode.mdh.pos, &buf)
}

/// §4.M close(): writes back every inode still resident in the cache.
pub fn flush_all(fs: &Filesystem) -> Result<()> {
    let cache = fs.inodes.lock().unwrap();
    for inner in cache.entries.values() {
        let inode = inner.lock().unwrap();
        if inode.mdh.pos != 0 {
            writeback(fs, &inode)?;
        }
    }
    Ok(())
}

/// §4.I update: writes the resident inode back immediately (used when a
/// caller needs synchronous durability rather than waiting for eviction),
/// honoring which parts changed via `flags`.
pub fn update(fs: &Filesystem, handle: &InodeHandle, flags: u32) -> Result<()> {
    if flags & SYNC_ALL == 0 {
        return Ok(());
    }
    let inode = handle.lock();
    writeback(fs, &inode)
}

/// Allocates a fresh FD block, zero-initializes an inode there under the
/// FDC's metadata lock, and returns its handle.
pub fn alloc(fs: &Arc<Filesystem>, file_type: FileType, mode: u32, uid: u32, gid: u32) -> Result<InodeHandle> {
    let blk_id = crate::bitmap::alloc_block(fs, crate::block::BlockType::FileDescriptor)?;
    let pos = crate::bitmap::item_position(fs, blk_id)?;

    let mut buf = vec![0u8; metadata::HDR_SIZE];
    let lock = metadata::lock(fs, pos, &mut buf)?;

    let now = fs.host.uptime_usec() as u32;
    let inode = Inode {
        mdh: lock.header.clone(),
        id: blk_id,
        id2: fs.next_inode_gen(),
        // Left at zero; the directory layer's link_inode establishes the
        // first link (and every one after it).
        nlink: 0,
        file_type,
        flags: 0,
        size: 0,
        // New files start out SB-addressed; a writer grows into FB leaves
        // only once the content outgrows a sub-block (see get_wrblock).
        blk_size: fs.sbc.header.data_size as u64,
        blk_count: 0,
        mtime: now,
        ctime: now,
        atime: now,
        uid,
        gid,
        mode,
        zla: Zla::Sb.to_raw(),
        tbz: 0,
        cow: 0,
        blocks: [0; BLOCK_COUNT],
        content: Vec::new(),
    };

    metadata::unlock(fs, lock)?;
    writeback(fs, &inode)?;

    let mut cache = fs.inodes.lock().unwrap();
    let inner = Arc::new(Mutex::new(inode));
    cache.entries.insert(blk_id, inner.clone());
    drop(cache);

    Ok(InodeHandle {
        blk_id,
        inner,
        fs: Arc::downgrade(fs),
    })
}
