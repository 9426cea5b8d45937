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

//! The file-content façade: positional read/write, truncate, chmod and stat
//! dispatched on block type, plus the raw `<0xNNN>` block-id escape (§4.L).

use crate::addressing;
use crate::bitmap;
use crate::block::{self, BlockType};
use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::inode::{self, FileType, InodeHandle, SYNC_ALL, SYNC_META};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub atime: u32,
}

/// An open regular file, directory or symlink. Backed by the same
/// [`InodeHandle`] that the directory layer resolves names into.
pub struct File {
    fs: Arc<Filesystem>,
    inode: InodeHandle,
}

impl File {
    pub fn open_from_handle(fs: Arc<Filesystem>, inode: InodeHandle) -> Self {
        File { fs, inode }
    }

    pub fn open_from_blkid(fs: &Arc<Filesystem>, blk_id: u32) -> Result<Self> {
        let pos = bitmap::item_position(fs, blk_id)?;
        let inode = inode::acquire(fs, blk_id, pos)?;
        Ok(File {
            fs: fs.clone(),
            inode,
        })
    }

    /// Parses the supplemented `<0xNNN>` raw-block-id escape, or else
    /// resolves `spec` as a normal path through the directory layer.
    pub fn open_from_filespec(fs: &Arc<Filesystem>, spec: &str) -> Result<Self> {
        if let Some(hex) = spec.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            let hex = hex.strip_prefix("0x").unwrap_or(hex);
            let blk_id = u32::from_str_radix(hex, 16)
                .map_err(|_| Error::InvalidArg("malformed <0xNNN> block-id escape"))?;
            return File::open_from_blkid(fs, blk_id);
        }
        crate::dir::open_file_at(fs, spec)
    }

    pub fn stat(&self) -> Stat {
        let i = self.inode.lock();
        Stat {
            file_type: i.file_type,
            size: i.size,
            mode: i.mode,
            uid: i.uid,
            gid: i.gid,
            nlink: i.nlink,
            mtime: i.mtime,
            ctime: i.ctime,
            atime: i.atime,
        }
    }

    pub fn blk_id(&self) -> u32 {
        self.inode.blk_id
    }

    pub fn inode_handle(&self) -> InodeHandle {
        self.inode.clone()
    }

    /// §4.L pread: dispatches on the leaf's block type, returning `0`s for
    /// holes and stopping short of `inode.size`.
    pub fn pread(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let inode = self.inode.lock();
        if inode.is_inline() {
            let avail = inode.content.len().saturating_sub(pos as usize);
            let n = buf.len().min(avail);
            buf[..n].copy_from_slice(&inode.content[pos as usize..pos as usize + n]);
            return Ok(n);
        }

        let avail = inode.size.saturating_sub(pos);
        let want = (buf.len() as u64).min(avail) as usize;
        let mut done = 0;
        while done < want {
            let file_pos = pos + done as u64;
            let leaf = addressing::get_block(&self.fs, &inode, file_pos)?;
            let blk_off = file_pos % inode.blk_size;
            let clen = ((inode.blk_size - blk_off) as usize).min(want - done);

            if leaf == 0 {
                buf[done..done + clen].fill(0);
            } else {
                match block::block_type(leaf) {
                    Some(BlockType::FileBlock) => {
                        read_fb(&self.fs, leaf, blk_off, &mut buf[done..done + clen])?
                    }
                    Some(BlockType::SubBlock) => {
                        read_sb(&self.fs, leaf, blk_off, &mut buf[done..done + clen])?
                    }
                    _ => return Err(Error::Corrupted("unexpected leaf block type")),
                }
            }
            done += clen;
        }
        Ok(done)
    }

    /// §4.L pwrite: aggregates missing leaves via `get_wrblock`, clearing
    /// TBZ on first write, and extends `size`/marks `SYNC_META` if the
    /// write runs past the current end of file.
    pub fn pwrite(&self, buf: &[u8], pos: u64) -> Result<usize> {
        if !self.fs.lvm.is_writable() {
            return Err(Error::ReadOnly);
        }

        let mut inode = self.inode.lock();
        if inode.is_inline() {
            let end = pos as usize + buf.len();
            if end > inode.content.len() {
                inode.content.resize(end, 0);
            }
            inode.content[pos as usize..end].copy_from_slice(buf);
            if end as u64 > inode.size {
                inode.size = end as u64;
            }
            drop(inode);
            inode::update(&self.fs, &self.inode, SYNC_META)?;
            return Ok(buf.len());
        }

        let mut done = 0;
        while done < buf.len() {
            let file_pos = pos + done as u64;
            let leaf = addressing::get_wrblock(&self.fs, &mut inode, file_pos)?;
            // blk_size may have just changed (SB->FB or FB->PB aggregation
            // inside get_wrblock), so re-derive the in-block offset from it.
            let blk_off = file_pos % inode.blk_size;
            let clen = ((inode.blk_size - blk_off) as usize).min(buf.len() - done);

            match block::block_type(leaf) {
                Some(BlockType::FileBlock) => {
                    write_fb(&self.fs, leaf, blk_off, &buf[done..done + clen])?
                }
                Some(BlockType::SubBlock) => {
                    write_sb(&self.fs, leaf, blk_off, &buf[done..done + clen])?
                }
                _ => return Err(Error::Corrupted("unexpected leaf block type")),
            };
            done += clen;
        }

        let end = pos + buf.len() as u64;
        if end > inode.size {
            inode.size = end;
        }
        drop(inode);
        inode::update(&self.fs, &self.inode, SYNC_ALL)
            .map(|_| buf.len())
    }

    pub fn truncate(&self, new_size: u64) -> Result<()> {
        if !self.fs.lvm.is_writable() {
            return Err(Error::ReadOnly);
        }
        let mut inode = self.inode.lock();
        addressing::shrink_to(&self.fs, &mut inode, new_size)?;
        drop(inode);
        inode::update(&self.fs, &self.inode, SYNC_ALL)
    }

    pub fn chmod(&self, mode: u32) -> Result<()> {
        if !self.fs.lvm.is_writable() {
            return Err(Error::ReadOnly);
        }
        self.inode.lock().mode = mode;
        inode::update(&self.fs, &self.inode, SYNC_META)
    }

    /// Frees every data block then the FD itself. Callers (the directory
    /// layer) are responsible for unlinking the name first.
    pub fn delete(self) -> Result<()> {
        if !self.fs.lvm.is_writable() {
            return Err(Error::ReadOnly);
        }
        let mut inode = self.inode.lock();
        if !inode.is_inline() {
            addressing::truncate(&self.fs, &mut inode)?;
        }
        let blk_id = self.inode.blk_id;
        drop(inode);
        bitmap::free_block(&self.fs, blk_id)
    }
}

fn read_fb(fs: &Filesystem, leaf: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
    let item = block::fb_item(leaf);
    if block::fb_tbz(leaf) {
        buf.fill(0);
        return Ok(());
    }
    fs.block_read(item, offset, buf)
}

/// Writes into an FB leaf. `get_wrblock` has already cleared TBZ and
/// zeroized the block before handing the leaf to a writer, so this is a
/// direct pass-through.
fn write_fb(fs: &Filesystem, leaf: u32, offset: u64, buf: &[u8]) -> Result<()> {
    fs.block_write(block::fb_item(leaf), offset, buf)
}

fn read_sb(fs: &Filesystem, leaf: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
    let entry = block::sb_entry(leaf);
    let item = block::sb_item(leaf);
    let data_size = fs.sbc.header.data_size as u64;
    let mut tmp = vec![0u8; data_size as usize];
    fs.sbc.get_item(fs, entry, item, &mut tmp)?;
    buf.copy_from_slice(&tmp[offset as usize..offset as usize + buf.len()]);
    Ok(())
}

fn write_sb(fs: &Filesystem, leaf: u32, offset: u64, buf: &[u8]) -> Result<()> {
    let entry = block::sb_entry(leaf);
    let item = block::sb_item(leaf);
    let data_size = fs.sbc.header.data_size as u64;

    if buf.len() as u64 == data_size {
        return fs.sbc.set_item(fs, entry, item, buf);
    }

    let mut tmp = vec![0u8; data_size as usize];
    fs.sbc.get_item(fs, entry, item, &mut tmp)?;
    tmp[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
    fs.sbc.set_item(fs, entry, item, &tmp)
}
