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

//! End-to-end coverage against a hand-built single-extent image, since
//! there is no in-crate mkfs to produce a reference volume.

mod support;

use std::path::Path;
use std::sync::Arc;

use vmfs::block::BlockType;
use vmfs::inode::{self, FileType as InodeFileType, Zla};
use vmfs::{Directory, Error, File, FileType, Filesystem, OpenFlags};

fn open_rw(image: &support::TestImage) -> Arc<Filesystem> {
    let flags = OpenFlags {
        read_write: true,
        ..Default::default()
    };
    let path = image.path.as_path();
    Filesystem::open(&[path], flags).expect("open synthetic image")
}

fn create_file(fs: &Arc<Filesystem>, dir: &mut Directory, name: &str) -> vmfs::InodeHandle {
    let handle = inode::alloc(fs, InodeFileType::RegularFile, 0o644, 0, 0).expect("alloc inode");
    vmfs::dir::link_inode(fs, dir, name, &handle).expect("link new file");
    handle
}

#[test]
fn opens_and_reports_super_block() {
    let image = support::build();
    let fs = open_rw(&image);
    assert_eq!(fs.super_block.version, 5);
    assert_eq!(fs.block_size(), support::BLOCK_SIZE);
    fs.close().expect("close");
}

#[test]
fn root_lists_bootstrap_entries() {
    let image = support::build();
    let fs = open_rw(&image);
    let root = fs.root().expect("root inode");
    let mut dir = Directory::open_from_handle(fs.clone(), root).expect("open root");

    let mut names = Vec::new();
    while let Some(entry) = dir.read().expect("read dirent") {
        if !entry.is_free() {
            names.push(entry.name);
        }
    }
    for expected in [".", "..", ".fbb.sf", ".sbc.sf", ".pbc.sf", ".fdc.sf"] {
        assert!(names.contains(&expected.to_string()), "missing {expected}");
    }
}

#[test]
fn mkdir_creates_a_visible_subdirectory() {
    let image = support::build();
    let fs = open_rw(&image);
    let root = fs.root().expect("root inode");
    let mut root_dir = Directory::open_from_handle(fs.clone(), root).expect("open root");

    let created = vmfs::dir::mkdir(&fs, &mut root_dir, "subdir", 0o755, 1000, 1000).expect("mkdir");
    assert_eq!(created.lock().file_type, FileType::Directory);

    let resolved = File::open_from_filespec(&fs, "/subdir").expect("resolve new dir");
    let stat = resolved.stat();
    assert_eq!(stat.file_type, FileType::Directory);
    assert_eq!(stat.mode, 0o755);

    let mut sub = Directory::open_from_blkid(&fs, resolved.blk_id()).expect("open subdir");
    let dot = sub.lookup(".").expect("lookup .").expect(". entry");
    assert_eq!(dot.block_id, resolved.blk_id());
    let dotdot = sub.lookup("..").expect("lookup ..").expect(".. entry");
    assert_eq!(dotdot.block_id, root_dir.inode_handle().blk_id);
}

#[test]
fn file_write_read_and_sb_to_fb_promotion() {
    let image = support::build();
    let fs = open_rw(&image);
    let root = fs.root().expect("root inode");
    let mut root_dir = Directory::open_from_handle(fs.clone(), root).expect("open root");

    let inode = create_file(&fs, &mut root_dir, "greeting.txt");
    let file = File::open_from_handle(fs.clone(), inode.clone());

    file.pwrite(b"hello vmfs", 0).expect("pwrite");
    assert_eq!(inode.lock().zla_mode().unwrap(), Zla::Sb);

    let mut buf = [0u8; 10];
    file.pread(&mut buf, 0).expect("pread");
    assert_eq!(&buf, b"hello vmfs");

    // A sub-block holds 4096 bytes; writing past it forces SB -> FB
    // aggregation (see `addressing::aggregate_to_fb`).
    file.pwrite(b"tail", 5000).expect("pwrite past sub-block");
    assert_eq!(inode.lock().zla_mode().unwrap(), Zla::Fb);

    let mut tail = [0u8; 4];
    file.pread(&mut tail, 5000).expect("pread tail");
    assert_eq!(&tail, b"tail");

    // The promoted block still carries the original payload at its head.
    let mut head = [0u8; 10];
    file.pread(&mut head, 0).expect("pread head after promotion");
    assert_eq!(&head, b"hello vmfs");

    file.truncate(3).expect("truncate");
    assert_eq!(file.stat().size, 3);
    let mut shrunk = [0u8; 3];
    file.pread(&mut shrunk, 0).expect("pread after truncate");
    assert_eq!(&shrunk, b"hel");
}

#[test]
fn bitmap_alloc_and_free_round_trip() {
    let image = support::build();
    let fs = open_rw(&image);

    let blk = vmfs::bitmap::alloc_block(&fs, BlockType::FileBlock).expect("alloc fb");
    assert!(vmfs::bitmap::block_status(&fs, blk).expect("status after alloc"));

    vmfs::bitmap::free_block(&fs, blk).expect("free fb");
    assert!(!vmfs::bitmap::block_status(&fs, blk).expect("status after free"));

    let err = vmfs::bitmap::free_block(&fs, blk).unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
}

#[test]
fn bitmaps_stay_consistent_after_mutation() {
    let image = support::build();
    let fs = open_rw(&image);
    let root = fs.root().expect("root inode");
    let mut root_dir = Directory::open_from_handle(fs.clone(), root).expect("open root");

    let inode = create_file(&fs, &mut root_dir, "data.bin");
    let file = File::open_from_handle(fs.clone(), inode);
    file.pwrite(&[1u8; 200], 0).expect("pwrite");
    file.pwrite(b"x", 9000).expect("pwrite forcing fb promotion");

    for (name, bitmap) in [
        ("fbb", &fs.fbb),
        ("sbc", &fs.sbc),
        ("pbc", &fs.pbc),
        ("fdc", &fs.fdc),
    ] {
        let errors = bitmap.check(&fs).unwrap_or_else(|e| panic!("{name} check failed: {e}"));
        assert_eq!(errors, 0, "{name} reported {errors} inconsistencies");
    }
}

#[test]
fn unlink_frees_the_descriptor_once_nlink_hits_zero() {
    let image = support::build();
    let fs = open_rw(&image);
    let root = fs.root().expect("root inode");
    let mut root_dir = Directory::open_from_handle(fs.clone(), root).expect("open root");

    let inode = create_file(&fs, &mut root_dir, "throwaway");
    let blk_id = inode.blk_id;
    drop(inode);

    let entry = root_dir.lookup("throwaway").expect("lookup").expect("entry present");
    let record_pos = entry.record_id as u64 * vmfs::dir::DIRENT_SIZE as u64;
    vmfs::dir::unlink_inode(&fs, &mut root_dir, record_pos, &entry).expect("unlink");

    assert!(root_dir.lookup("throwaway").expect("lookup after unlink").is_none());
    assert!(!vmfs::bitmap::block_status(&fs, blk_id).expect("fd status after unlink"));
}

#[test]
fn fsck_walk_tallies_newly_allocated_blocks() {
    let image = support::build();
    let fs = open_rw(&image);
    let root = fs.root().expect("root inode");
    let mut root_dir = Directory::open_from_handle(fs.clone(), root).expect("open root");

    let inode = create_file(&fs, &mut root_dir, "tally.bin");
    let file = File::open_from_handle(fs.clone(), inode);
    file.pwrite(&[7u8; 200], 0).expect("pwrite within a single sub-block");

    let acc = fs.walk_blocks().expect("walk blocks");
    // root + the four bootstrap meta-files + the new file.
    assert_eq!(acc.fd, 6);
    // The new file stays sub-block addressed; nothing else in the tree
    // reaches into SBC or PBC.
    assert_eq!(acc.sb, 1);
    assert_eq!(acc.pb, 0);

    // SBC, PBC and FDC carry no items reserved outside of what an inode
    // tracks, so the walk matches their bitmaps exactly. FBB is excluded:
    // its low items are pre-claimed for the fixed-offset VolInfo/FSInfo/
    // heartbeat regions, which no inode ever points at.
    let sbc_used = fs.sbc.header.total_items - fs.sbc.free_items(&fs).unwrap();
    assert_eq!(sbc_used, acc.sb);
    let pbc_used = fs.pbc.header.total_items - fs.pbc.free_items(&fs).unwrap();
    assert_eq!(pbc_used, acc.pb);
    let fdc_used = fs.fdc.header.total_items - fs.fdc.free_items(&fs).unwrap();
    assert_eq!(fdc_used, acc.fd);

    // FBB's reserved low items mean the fb category always disagrees on this
    // image; sb/pb/fd must still agree, so the overall mismatch count is 1.
    let mismatches = acc.diff_from_bitmaps(&fs).expect("diff against bitmaps");
    assert_eq!(mismatches, 1);
}

#[test]
fn open_rejects_fewer_extents_than_declared() {
    let image = support::build_declaring_extents(2);
    let result = Filesystem::open(&[image.path.as_path()], OpenFlags::default());
    assert!(matches!(result, Err(Error::Corrupted(_))));
}

#[test]
fn read_only_mount_rejects_writes() {
    let image = support::build();
    let path: &Path = image.path.as_path();
    let fs = Filesystem::open(&[path], OpenFlags::default()).expect("open read-only");

    let file = File::open_from_filespec(&fs, "/.fbb.sf").expect("open meta-file");
    let err = file.pwrite(b"x", 0).unwrap_err();
    assert!(matches!(err, Error::ReadOnly));
}
