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

//! Resolves a logical block index within a file to a physical block id,
//! walking through the ZLA's indirection levels and allocating/aggregating
//! on the write path (§4.J).

use crate::bitmap;
use crate::block::{self, BlockType};
use crate::encoding::{read_le32, write_le32};
use crate::error::{Error, Result};
use crate::fs::Filesystem;
use crate::inode::{FileType, Inode, Zla, BLOCK_COUNT};

fn pb_entries(fs: &Filesystem) -> usize {
    fs.pbc.header.data_size as usize / 4
}

fn read_pb(fs: &Filesystem, pb_id: u32) -> Result<Vec<u32>> {
    let pos = bitmap::item_position(fs, pb_id)?;
    let mut buf = vec![0u8; fs.pbc.header.data_size as usize];
    fs.lvm.read_at(pos, &mut buf)?;
    Ok((0..pb_entries(fs)).map(|i| read_le32(&buf, i * 4)).collect())
}

fn write_pb(fs: &Filesystem, pb_id: u32, entries: &[u32]) -> Result<()> {
    let pos = bitmap::item_position(fs, pb_id)?;
    let mut buf = vec![0u8; fs.pbc.header.data_size as usize];
    for (i, &e) in entries.iter().enumerate() {
        write_le32(&mut buf, i * 4, e);
    }
    fs.lvm.write_at(pos, &buf)
}

/// Walks `inode`'s indirection tree to find the physical block id
/// addressing byte offset `pos`, without allocating anything. Returns `0`
/// (a hole) for any level that is unpopulated.
pub fn get_block(fs: &Filesystem, inode: &Inode, pos: u64) -> Result<u32> {
    let zla = inode.zla_mode()?;
    if zla == Zla::Fd {
        return Ok(inode.id);
    }
    if inode.blk_size == 0 {
        return Err(Error::Corrupted("non-FD inode has no block-addressed content"));
    }
    let blk_index = pos / inode.blk_size;

    match zla {
        Zla::Fb | Zla::Sb => {
            if blk_index as usize >= BLOCK_COUNT {
                return Err(Error::TooBig);
            }
            Ok(inode.blocks[blk_index as usize])
        }
        Zla::Pb => {
            let entries_per_pb = pb_entries(fs) as u64;
            let pb_idx = blk_index / entries_per_pb;
            let item = (blk_index % entries_per_pb) as usize;
            if pb_idx as usize >= BLOCK_COUNT {
                return Err(Error::TooBig);
            }
            let pb_id = inode.blocks[pb_idx as usize];
            if pb_id == 0 {
                return Ok(0);
            }
            Ok(read_pb(fs, pb_id)?[item])
        }
        Zla::Fd => unreachable!("handled above"),
    }
}

/// Zero-fills a freshly-aggregated FB leaf in `M_DIO_BLK_SIZE`-sized
/// chunks, matching the source's `vmfs_block_zeroize_fb` (§4.J).
fn zeroize_fb(fs: &Filesystem, fb_item_addr: u32, blk_size: u64) -> Result<()> {
    let zero = vec![0u8; crate::encoding::DIO_BLOCK_SIZE];
    let mut off = 0u64;
    while off < blk_size {
        let clen = (blk_size - off).min(crate::encoding::DIO_BLOCK_SIZE as u64) as usize;
        fs.block_write(fb_item_addr, off, &zero[..clen])?;
        off += clen as u64;
    }
    Ok(())
}

fn alloc_zeroed_fb(fs: &Filesystem, blk_size: u64) -> Result<u32> {
    let leaf = bitmap::alloc_block(fs, BlockType::FileBlock)?;
    zeroize_fb(fs, block::fb_item(leaf), blk_size)?;
    Ok(leaf)
}

/// Promotes `zla = SB` to `zla = FB` once a write reaches past the single
/// sub-block's capacity: allocates a file-block, migrates the sub-block's
/// payload into its head and zero-fills the rest. The old sub-block is left
/// in place, unfreed — matching `vmfs_inode_aggregate_fb`.
fn aggregate_to_fb(fs: &Filesystem, inode: &mut Inode) -> Result<()> {
    let sb_blk = inode.blocks[0];
    let sb_data_size = fs.sbc.header.data_size as u64;
    let mut payload = vec![0u8; sb_data_size as usize];
    if sb_blk != 0 {
        fs.sbc
            .get_item(fs, block::sb_entry(sb_blk), block::sb_item(sb_blk), &mut payload)?;
    }

    let fb_blk = bitmap::alloc_block(fs, BlockType::FileBlock)?;
    let fb_item = block::fb_item(fb_blk);
    let block_size = fs.block_size();
    fs.block_write(fb_item, 0, &payload)?;

    let zero = vec![0u8; crate::encoding::DIO_BLOCK_SIZE];
    let mut off = sb_data_size;
    while off < block_size {
        let clen = (block_size - off).min(crate::encoding::DIO_BLOCK_SIZE as u64) as usize;
        fs.block_write(fb_item, off, &zero[..clen])?;
        off += clen as u64;
    }

    inode.blocks[0] = fb_blk;
    inode.zla = Zla::Fb.to_raw();
    inode.blk_size = block_size;
    Ok(())
}

/// Promotes `zla = FB` to `zla = PB` once a write reaches past all 256
/// direct slots: moves the current block list into a freshly allocated
/// pointer block and replaces `blocks[0]` with its id.
fn aggregate_to_pb(fs: &Filesystem, inode: &mut Inode) -> Result<()> {
    let entries_per_pb = pb_entries(fs);
    if entries_per_pb < BLOCK_COUNT {
        return Err(Error::Corrupted("pointer block too small to hold inode block list"));
    }

    let pb_id = bitmap::alloc_block(fs, BlockType::PointerBlock)?;
    let mut entries = vec![0u32; entries_per_pb];
    entries[..BLOCK_COUNT].copy_from_slice(&inode.blocks);
    write_pb(fs, pb_id, &entries)?;

    inode.blocks = [0; BLOCK_COUNT];
    inode.blocks[0] = pb_id;
    inode.zla = Zla::Pb.to_raw();
    Ok(())
}

/// Grows the inode's indirection mode, if needed, so that byte offset `pos`
/// is addressable (§4.J "Aggregate"). Directories are never promoted past
/// `SB` — growing one raises `TooBig` instead.
fn aggregate(fs: &Filesystem, inode: &mut Inode, pos: u64) -> Result<()> {
    if inode.zla_mode()? == Zla::Sb && pos >= inode.blk_size {
        if inode.file_type == FileType::Directory {
            return Err(Error::TooBig);
        }
        aggregate_to_fb(fs, inode)?;
    }

    if inode.zla_mode()? == Zla::Fb && pos >= inode.blk_size * BLOCK_COUNT as u64 {
        aggregate_to_pb(fs, inode)?;
    }

    Ok(())
}

/// Like [`get_block`] but aggregates the inode's indirection mode first,
/// allocates any missing intermediate PB level, and allocates a leaf of the
/// zla-appropriate type when the slot is a hole — mutates `inode` in place
/// and returns the now-populated leaf id.
pub fn get_wrblock(fs: &Filesystem, inode: &mut Inode, pos: u64) -> Result<u32> {
    if inode.zla_mode()? == Zla::Fd {
        return Ok(inode.id);
    }
    aggregate(fs, inode, pos)?;
    let zla = inode.zla_mode()?;
    let blk_size = inode.blk_size;
    if blk_size == 0 {
        return Err(Error::Corrupted("non-FD inode has no block-addressed content"));
    }
    let blk_index = pos / blk_size;

    match zla {
        Zla::Fb | Zla::Sb => {
            if blk_index as usize >= BLOCK_COUNT {
                return Err(Error::TooBig);
            }
            let existing = inode.blocks[blk_index as usize];
            if existing != 0 {
                let cleared = if zla == Zla::Fb {
                    clear_tbz_if_set(fs, existing, blk_size)?
                } else {
                    existing
                };
                inode.blocks[blk_index as usize] = cleared;
                return Ok(cleared);
            }

            let leaf = if zla == Zla::Fb {
                alloc_zeroed_fb(fs, blk_size)?
            } else {
                bitmap::alloc_block(fs, BlockType::SubBlock)?
            };
            inode.blocks[blk_index as usize] = leaf;
            inode.blk_count += 1;
            Ok(leaf)
        }
        Zla::Pb => {
            let entries_per_pb = pb_entries(fs) as u64;
            let pb_idx = (blk_index / entries_per_pb) as usize;
            let item = (blk_index % entries_per_pb) as usize;
            if pb_idx >= BLOCK_COUNT {
                return Err(Error::TooBig);
            }

            let mut pb_id = inode.blocks[pb_idx];
            if pb_id == 0 {
                pb_id = bitmap::alloc_block(fs, BlockType::PointerBlock)?;
                write_pb(fs, pb_id, &vec![0u32; entries_per_pb as usize])?;
                inode.blocks[pb_idx] = pb_id;
            }

            let mut entries = read_pb(fs, pb_id)?;
            let existing = entries[item];
            if existing != 0 {
                let cleared = clear_tbz_if_set(fs, existing, blk_size)?;
                if cleared != existing {
                    entries[item] = cleared;
                    write_pb(fs, pb_id, &entries)?;
                }
                return Ok(cleared);
            }

            let leaf = alloc_zeroed_fb(fs, blk_size)?;
            entries[item] = leaf;
            inode.blk_count += 1;
            write_pb(fs, pb_id, &entries)?;
            Ok(leaf)
        }
        Zla::Fd => unreachable!("handled above"),
    }
}

/// A leaf read from disk may already carry TBZ (set by another VMFS
/// implementation that defers zeroing to first write); zero it and clear
/// the flag before handing it back for writing.
fn clear_tbz_if_set(fs: &Filesystem, leaf: u32, blk_size: u64) -> Result<u32> {
    if !block::fb_tbz(leaf) {
        return Ok(leaf);
    }
    zeroize_fb(fs, block::fb_item(leaf), blk_size)?;
    Ok(block::fb_tbz_clear(leaf))
}

/// Frees every block reachable from `inode`'s indirection tree, including
/// intermediate PBs (§4.J truncate-to-zero path). The in-core zla is left
/// unchanged; only `alloc` resets it (shrink never demotes indirection).
pub fn truncate(fs: &Filesystem, inode: &mut Inode) -> Result<()> {
    let zla = inode.zla_mode()?;
    match zla {
        Zla::Fb | Zla::Sb => {
            for slot in inode.blocks.iter_mut() {
                if *slot != 0 {
                    bitmap::free_block(fs, block::fb_tbz_clear(*slot))?;
                    *slot = 0;
                }
            }
        }
        Zla::Pb => {
            for slot in inode.blocks.iter_mut() {
                if *slot == 0 {
                    continue;
                }
                let entries = read_pb(fs, *slot)?;
                for &leaf in &entries {
                    if leaf != 0 {
                        bitmap::free_block(fs, block::fb_tbz_clear(leaf))?;
                    }
                }
                bitmap::free_block(fs, *slot)?;
                *slot = 0;
            }
        }
        Zla::Fd => {}
    }
    inode.size = 0;
    inode.blk_count = 0;
    Ok(())
}

/// Shrinks `inode` to `new_size`, freeing every leaf block at or past the
/// new last logical block; growing aggregates first (§4.J Truncate).
pub fn shrink_to(fs: &Filesystem, inode: &mut Inode, new_size: u64) -> Result<()> {
    if inode.is_inline() {
        inode.content.truncate(new_size as usize);
        inode.content.resize(new_size as usize, 0);
        inode.size = new_size;
        return Ok(());
    }

    if new_size == inode.size {
        return Ok(());
    }

    if new_size > inode.size {
        aggregate(fs, inode, new_size)?;
        inode.size = new_size;
        return Ok(());
    }

    let new_last_blk = new_size.div_ceil(inode.blk_size);
    let old_last_blk = inode.size.div_ceil(inode.blk_size);

    for logical in new_last_blk..old_last_blk {
        free_leaf_at(fs, inode, logical)?;
    }

    inode.size = new_size;
    Ok(())
}

/// Frees the single leaf at logical block `logical_blk`, if populated, and
/// clears its slot in the owning array (direct array or PB payload) —
/// leaving empty intermediate PBs in place rather than replicating the
/// source's free-whole-PB-only-if-fully-covered shortcut.
fn free_leaf_at(fs: &Filesystem, inode: &mut Inode, logical_blk: u64) -> Result<()> {
    let zla = inode.zla_mode()?;

    match zla {
        Zla::Fb | Zla::Sb => {
            if logical_blk as usize >= BLOCK_COUNT {
                return Ok(());
            }
            let slot = &mut inode.blocks[logical_blk as usize];
            if *slot != 0 {
                bitmap::free_block(fs, block::fb_tbz_clear(*slot))?;
                inode.blk_count = inode.blk_count.saturating_sub(1);
                *slot = 0;
            }
        }
        Zla::Pb => {
            let entries_per_pb = pb_entries(fs) as u64;
            let pb_idx = (logical_blk / entries_per_pb) as usize;
            let item = (logical_blk % entries_per_pb) as usize;
            if pb_idx >= BLOCK_COUNT || inode.blocks[pb_idx] == 0 {
                return Ok(());
            }
            let pb_id = inode.blocks[pb_idx];
            let mut entries = read_pb(fs, pb_id)?;
            if entries[item] != 0 {
                bitmap::free_block(fs, block::fb_tbz_clear(entries[item]))?;
                inode.blk_count = inode.blk_count.saturating_sub(1);
                entries[item] = 0;
                write_pb(fs, pb_id, &entries)?;
            }
        }
        Zla::Fd => {}
    }
    Ok(())
}

/// Supplemented fsck-style accounting walk: invokes `cbk(pb_blk, leaf_blk)`
/// for every populated leaf, with `pb_blk` set to `0` for direct (FB/SB)
/// leaves that have no owning pointer block.
pub fn foreach_block(fs: &Filesystem, inode: &Inode, mut cbk: impl FnMut(u32, u32)) -> Result<()> {
    let zla = inode.zla_mode()?;
    match zla {
        Zla::Fb | Zla::Sb => {
            for &leaf in inode.blocks.iter() {
                if leaf != 0 {
                    cbk(0, leaf);
                }
            }
        }
        Zla::Pb => {
            for &pb_id in inode.blocks.iter() {
                if pb_id == 0 {
                    continue;
                }
                for leaf in read_pb(fs, pb_id)? {
                    if leaf != 0 {
                        cbk(pb_id, leaf);
                    }
                }
            }
        }
        Zla::Fd => {}
    }
    Ok(())
}
