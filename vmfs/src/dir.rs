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

//! A directory is a file whose content is a packed array of 140-byte
//! records: lookup, path resolution (with bounded symlink following),
//! and the link/unlink primitives mkdir and the file layer build on
//! (§4.K).

use crate::bitmap;
use crate::encoding::{read_fixed_str, read_le32, write_fixed_str, write_le32};
use crate::error::{Error, Result};
use crate::file::File;
use crate::fs::Filesystem;
use crate::inode::{self, FileType, InodeHandle, SYNC_META};
use std::sync::Arc;

pub const DIRENT_SIZE: usize = 140;
const OFS_TYPE: usize = 0x00;
const OFS_BLK_ID: usize = 0x04;
const OFS_REC_ID: usize = 0x08;
const OFS_NAME: usize = 0x0c;
const NAME_LEN: usize = 128;

/// The source does not bound symlink-chase recursion explicitly (an open
/// question in §4.K); this caps it the way most Unix resolvers do.
const MAX_SYMLINK_DEPTH: u32 = 40;

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub file_type_raw: u32,
    pub block_id: u32,
    pub record_id: u32,
    pub name: String,
}

impl DirEntry {
    pub(crate) fn read(buf: &[u8]) -> Self {
        DirEntry {
            file_type_raw: read_le32(buf, OFS_TYPE),
            block_id: read_le32(buf, OFS_BLK_ID),
            record_id: read_le32(buf, OFS_REC_ID),
            name: read_fixed_str(buf, OFS_NAME, NAME_LEN),
        }
    }

    fn write(&self, buf: &mut [u8; DIRENT_SIZE]) {
        write_le32(buf, OFS_TYPE, self.file_type_raw);
        write_le32(buf, OFS_BLK_ID, self.block_id);
        write_le32(buf, OFS_REC_ID, self.record_id);
        write_fixed_str(buf, OFS_NAME, NAME_LEN, &self.name);
    }

    /// A record whose type is zero is a free slot, left behind by unlink.
    pub fn is_free(&self) -> bool {
        self.file_type_raw == 0
    }
}

/// An open directory: the underlying file plus the position a subsequent
/// [`Directory::read`] resumes from.
pub struct Directory {
    file: File,
    pos: u32,
}

impl Directory {
    pub fn open_from_handle(fs: Arc<Filesystem>, inode: InodeHandle) -> Result<Self> {
        let file = File::open_from_handle(fs, inode);
        if file.stat().file_type != FileType::Directory {
            return Err(Error::NotADirectory);
        }
        Ok(Directory { file, pos: 0 })
    }

    pub fn open_from_blkid(fs: &Arc<Filesystem>, blk_id: u32) -> Result<Self> {
        let file = File::open_from_blkid(fs, blk_id)?;
        if file.stat().file_type != FileType::Directory {
            return Err(Error::NotADirectory);
        }
        Ok(Directory { file, pos: 0 })
    }

    pub fn open_at(fs: &Arc<Filesystem>, base: InodeHandle, path: &str) -> Result<Self> {
        let inode = resolve_path(fs, base, path, true)?;
        Directory::open_from_handle(fs.clone(), inode)
    }

    pub fn inode_handle(&self) -> InodeHandle {
        self.file.inode_handle()
    }

    fn record_count(&self) -> u32 {
        (self.file.stat().size / DIRENT_SIZE as u64) as u32
    }

    fn read_record_at(&self, idx: u32) -> Result<Option<DirEntry>> {
        let mut buf = [0u8; DIRENT_SIZE];
        let n = self.file.pread(&mut buf, idx as u64 * DIRENT_SIZE as u64)?;
        if n < DIRENT_SIZE {
            return Ok(None);
        }
        Ok(Some(DirEntry::read(&buf)))
    }

    /// §4.K lookup: linear scan, skipping free slots; on a hit, positions
    /// the iterator just past the found record.
    pub fn lookup(&mut self, name: &str) -> Result<Option<DirEntry>> {
        for idx in 0..self.record_count() {
            if let Some(rec) = self.read_record_at(idx)? {
                if !rec.is_free() && rec.name == name {
                    self.pos = idx + 1;
                    return Ok(Some(rec));
                }
            }
        }
        Ok(None)
    }

    /// §4.K read: the record at the current position (including free
    /// slots), or `None` at EOF.
    pub fn read(&mut self) -> Result<Option<DirEntry>> {
        if self.pos >= self.record_count() {
            return Ok(None);
        }
        let rec = self.read_record_at(self.pos)?;
        self.pos += 1;
        Ok(rec)
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }
}

/// §4.K resolve_path: splits on `/` (empty components skipped), following
/// symlinks that are either intermediate components or whose target
/// `follow_symlink` asks for, resolved relative to the directory containing
/// the link.
pub fn resolve_path(
    fs: &Arc<Filesystem>,
    base_dir: InodeHandle,
    path: &str,
    follow_symlink: bool,
) -> Result<InodeHandle> {
    resolve_path_depth(fs, base_dir, path, follow_symlink, 0)
}

fn resolve_path_depth(
    fs: &Arc<Filesystem>,
    base_dir: InodeHandle,
    path: &str,
    follow_symlink: bool,
    depth: u32,
) -> Result<InodeHandle> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(Error::InvalidArg("symlink recursion too deep"));
    }

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        return Ok(base_dir);
    }

    let mut cur_dir = base_dir;
    let mut resolved = cur_dir.clone();

    for (i, name) in parts.iter().enumerate() {
        let is_last = i + 1 == parts.len();
        let mut dir = Directory::open_from_handle(fs.clone(), cur_dir.clone())?;
        let entry = dir.lookup(name)?.ok_or(Error::NotFound)?;

        let entry_pos = bitmap::item_position(fs, entry.block_id)?;
        let mut entry_inode = inode::acquire(fs, entry.block_id, entry_pos)?;
        let entry_type = FileType::from_raw(entry.file_type_raw)?;

        if entry_type == FileType::Symlink && (!is_last || follow_symlink) {
            let link_file = File::open_from_handle(fs.clone(), entry_inode.clone());
            let size = link_file.stat().size as usize;
            let mut buf = vec![0u8; size];
            link_file.pread(&mut buf, 0)?;
            let target = String::from_utf8(buf)
                .map_err(|_| Error::Corrupted("symlink target is not valid UTF-8"))?;
            entry_inode = resolve_path_depth(fs, cur_dir.clone(), &target, true, depth + 1)?;
        }

        if !is_last && entry_inode.lock().file_type != FileType::Directory {
            return Err(Error::NotADirectory);
        }

        resolved = entry_inode.clone();
        cur_dir = entry_inode;
    }

    Ok(resolved)
}

/// §4.K link_inode: appends a record (reusing the first free slot), bumps
/// the target's `nlink` and writes it back.
pub fn link_inode(fs: &Arc<Filesystem>, dir: &mut Directory, name: &str, target: &InodeHandle) -> Result<()> {
    if !fs.lvm.is_writable() {
        return Err(Error::ReadOnly);
    }

    let mut reuse_idx = None;
    for idx in 0..dir.record_count() {
        if let Some(rec) = dir.read_record_at(idx)? {
            if rec.is_free() {
                reuse_idx = Some(idx);
                break;
            }
        }
    }
    let idx = reuse_idx.unwrap_or_else(|| dir.record_count());

    let file_type_raw = target.lock().file_type.to_raw();
    let entry = DirEntry {
        file_type_raw,
        block_id: target.blk_id,
        record_id: idx,
        name: name.to_string(),
    };
    let mut buf = [0u8; DIRENT_SIZE];
    entry.write(&mut buf);
    dir.file.pwrite(&buf, idx as u64 * DIRENT_SIZE as u64)?;

    target.lock().nlink += 1;
    inode::update(fs, target, SYNC_META)
}

/// §4.K unlink_inode: zeroes the record, drops the target's `nlink`, and
/// deletes the target entirely once its link count reaches zero.
pub fn unlink_inode(fs: &Arc<Filesystem>, dir: &mut Directory, record_pos: u64, entry: &DirEntry) -> Result<()> {
    if !fs.lvm.is_writable() {
        return Err(Error::ReadOnly);
    }

    let zero = [0u8; DIRENT_SIZE];
    dir.file.pwrite(&zero, record_pos)?;

    let target_pos = bitmap::item_position(fs, entry.block_id)?;
    let target = inode::acquire(fs, entry.block_id, target_pos)?;
    let nlink = {
        let mut inode = target.lock();
        inode.nlink = inode.nlink.saturating_sub(1);
        inode.nlink
    };
    inode::update(fs, &target, SYNC_META)?;

    if nlink == 0 {
        let file = File::open_from_handle(fs.clone(), target);
        file.delete()?;
    }
    Ok(())
}

/// §4.K mkdir: allocates a directory inode, links it into `base_dir`, and
/// pre-populates `.`/`..`.
pub fn mkdir(
    fs: &Arc<Filesystem>,
    base_dir: &mut Directory,
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<InodeHandle> {
    if !fs.lvm.is_writable() {
        return Err(Error::ReadOnly);
    }

    let new_dir = inode::alloc(fs, FileType::Directory, mode, uid, gid)?;
    link_inode(fs, base_dir, name, &new_dir)?;

    let parent = base_dir.inode_handle();
    let mut self_dir = Directory::open_from_handle(fs.clone(), new_dir.clone())?;
    link_inode(fs, &mut self_dir, ".", &new_dir)?;
    link_inode(fs, &mut self_dir, "..", &parent)?;

    Ok(new_dir)
}

/// Resolves `spec` from the filesystem root and opens it as a [`File`]
/// (the path leg of `File::open_from_filespec`, §4.L).
pub fn open_file_at(fs: &Arc<Filesystem>, spec: &str) -> Result<File> {
    let root = fs.root()?;
    let inode = resolve_path(fs, root, spec, true)?;
    Ok(File::open_from_handle(fs.clone(), inode))
}
