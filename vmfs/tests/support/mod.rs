// Hand-built single-extent VMFS-5 image for the integration suite.
//
// Non-goals rule out a from-scratch mkfs, so there is no in-crate builder to
// reuse here: every byte below is placed against the same offsets `vmfs`'s
// own readers expect, chosen so the whole image is a few megabytes instead
// of the gigabyte-scale volumes a real deployment uses.
//
// Block size is 64 KiB, which happens to make VOLINFO_BASE, FSINFO_BASE and
// HB_BASE land on exact file-block item numbers (16, 32, 48) — items 0..68
// are reserved to cover the fixed-offset regions and the four bitmaps plus
// the root directory's own content block; only items 69..191 are left free
// for allocation during a test.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

pub const BLOCK_SIZE: u64 = 0x10000;
pub const TOTAL_SIZE: usize = 0xC00000;

const VOLINFO_BASE: usize = 0x100000;
const FSINFO_BASE: usize = 0x200000;
const HB_BASE: usize = 0x300000;
const FDC_BASE: usize = 0x400000;
const FBB_BASE: usize = 0x410000;
const SBC_BASE: usize = 0x420000;
const PBC_BASE: usize = 0x430000;
const ROOT_CONTENT_BASE: usize = 0x440000;

pub const FDC_ITEMS_PER_ENTRY: u32 = 16;
pub const SBC_ITEMS_PER_ENTRY: u32 = 8;
pub const SBC_DATA_SIZE: u32 = 4096;
pub const PBC_ITEMS_PER_ENTRY: u32 = 4;
pub const PBC_DATA_SIZE: u32 = 1024;
pub const FBB_ITEMS_PER_ENTRY: u32 = 192;
/// Items `0..FBB_RESERVED` are pre-marked allocated (they physically
/// overlap the fixed-offset regions above); everything from here up is
/// free for the test to hand out.
pub const FBB_RESERVED: u32 = 69;

const LVM_UUID: [u8; 16] = *b"vmfs-test-lvm-01";
const VOL_UUID: [u8; 16] = *b"vmfs-test-vol-00";

const DIRENT_SIZE: usize = 140;
const INODE_SIZE: usize = 2048;
const MDH_SIZE: usize = 512;
const BITMAP_ENTRY_SIZE: usize = 1024;

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut [u8], off: usize, v: &[u8]) {
    buf[off..off + v.len()].copy_from_slice(v);
}

fn put_str(buf: &mut [u8], off: usize, len: usize, s: &str) {
    let field = &mut buf[off..off + len];
    field.fill(0);
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

/// A metadata header's non-zero fields are just `magic`/`pos`; every lock
/// field stays zero (unlocked) until a test actually takes it.
fn write_mdh(buf: &mut [u8], magic: u32, pos: u64) {
    put_u32(buf, 0x00, magic);
    put_u64(buf, 0x04, pos);
}

fn write_dirent(buf: &mut [u8], file_type: u32, blk_id: u32, rec_id: u32, name: &str) {
    put_u32(buf, 0x00, file_type);
    put_u32(buf, 0x04, blk_id);
    put_u32(buf, 0x08, rec_id);
    put_str(buf, 0x0c, 128, name);
}

fn fb(item: u32) -> u32 {
    (item << 6) | 1
}

fn fd(entry: u32, item: u32) -> u32 {
    (entry << 6) | (item << 22) | 4
}

#[allow(clippy::too_many_arguments)]
fn write_inode(
    buf: &mut [u8],
    mdh_pos: u64,
    id: u32,
    id2: u32,
    nlink: u32,
    file_type: u32,
    size: u64,
    blk_size: u64,
    blk_count: u64,
    uid: u32,
    gid: u32,
    mode: u32,
    zla: u32,
    blocks: &[u32],
) {
    write_mdh(&mut buf[..MDH_SIZE], 1, mdh_pos);
    put_u32(buf, 0x200, id);
    put_u32(buf, 0x204, id2);
    put_u32(buf, 0x208, nlink);
    put_u32(buf, 0x20c, file_type);
    put_u32(buf, 0x210, 0); // flags
    put_u64(buf, 0x214, size);
    put_u64(buf, 0x21c, blk_size);
    put_u64(buf, 0x224, blk_count);
    put_u32(buf, 0x22c, 0); // mtime
    put_u32(buf, 0x230, 0); // ctime
    put_u32(buf, 0x234, 0); // atime
    put_u32(buf, 0x238, uid);
    put_u32(buf, 0x23c, gid);
    put_u32(buf, 0x240, mode);
    put_u32(buf, 0x244, zla);
    put_u32(buf, 0x248, 0); // tbz
    put_u32(buf, 0x24c, 0); // cow
    for (i, &b) in blocks.iter().enumerate() {
        put_u32(buf, 0x400 + i * 4, b);
    }
}

/// Writes a one-entry, one-area bitmap (header + single `BitmapEntry`) whose
/// whole footprint fits inside the 64 KiB file-block item `base` sits at.
fn write_bitmap(
    whole: &mut [u8],
    base: usize,
    items_per_entry: u32,
    data_size: u32,
    total: u32,
    free: u32,
    ffree: u32,
    bits: &[u8],
) {
    let hdr_size = 512u32;
    let entries_area = BITMAP_ENTRY_SIZE as u32; // bmp_entries_per_area == 1
    let area_size = entries_area + items_per_entry * data_size;

    let h = &mut whole[base..base + hdr_size as usize];
    put_u32(h, 0x00, items_per_entry);
    put_u32(h, 0x04, 1); // bmp_entries_per_area
    put_u32(h, 0x08, hdr_size);
    put_u32(h, 0x0c, data_size);
    put_u32(h, 0x10, area_size);
    put_u32(h, 0x14, total);
    put_u32(h, 0x18, 1); // area_count

    let entry_pos = (base + hdr_size as usize) as u64;
    let e = &mut whole[entry_pos as usize..entry_pos as usize + BITMAP_ENTRY_SIZE];
    write_mdh(e, 1, entry_pos);
    put_u32(e, 0x200, 0); // id
    put_u32(e, 0x204, total);
    put_u32(e, 0x208, free);
    put_u32(e, 0x20c, ffree);
    put_bytes(e, 0x210, bits);
}

static COUNTER: AtomicU32 = AtomicU32::new(0);

pub struct TestImage {
    pub path: PathBuf,
    pub root_fbb_items_used: u32,
}

impl Drop for TestImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Assembles the whole image in memory, then writes it once.
pub fn build() -> TestImage {
    build_inner(1)
}

/// Same image, but `VolInfo.num_extents` claims more extents than the
/// single path the caller will actually open with — for exercising the
/// missing-extents rejection in `LogicalVolume::open`.
pub fn build_declaring_extents(declared: u32) -> TestImage {
    build_inner(declared)
}

fn build_inner(declared_extents: u32) -> TestImage {
    let mut whole = vec![0u8; TOTAL_SIZE];

    // --- VolInfo (§ physical volume super-block) ---
    {
        let v = &mut whole[VOLINFO_BASE..VOLINFO_BASE + 1024];
        put_u32(v, 0x00, 0xc001d00d); // VOLINFO_MAGIC
        put_u32(v, 0x04, 5); // version
        v[0x0e] = 0; // lun
        put_str(v, 0x12, 28, "test-extent");
        put_bytes(v, 0x82, &VOL_UUID);
        put_u64(v, 0x200, TOTAL_SIZE as u64); // lvm_size
        put_u64(v, 0x208, (TOTAL_SIZE as u64) / BLOCK_SIZE); // lvm_blocks
        put_bytes(v, 0x254, &LVM_UUID);
        put_u32(v, 0x274, 1); // num_segments
        put_u32(v, 0x278, 0); // first_segment
        put_u32(v, 0x280, 0); // last_segment
        put_u32(v, 0x290, declared_extents); // num_extents
    }

    // --- SuperBlock (§ FS info) ---
    {
        let s = &mut whole[FSINFO_BASE..FSINFO_BASE + 512];
        put_u32(s, 0x00, 0x2fabf15e); // FSINFO_MAGIC
        put_u32(s, 0x04, 5); // vol_version
        s[0x08] = 5; // version
        put_bytes(s, 0x09, &VOL_UUID);
        put_str(s, 0x1d, 128, "test volume");
        put_u32(s, 0xa1, BLOCK_SIZE as u32);
        put_u32(s, 0xa9, 0); // ctime
        put_bytes(s, 0xb1, &LVM_UUID);
    }

    // heartbeat array [HB_BASE, HB_BASE + 0x100000) is left all-zero: every
    // slot reads as magic 0, i.e. inactive, so the first acquire takes slot
    // 0 without the expiry sleep.

    // --- FDC (file descriptors): item 0 is the root dir, 1..4 the meta-files ---
    write_bitmap(
        &mut whole,
        FDC_BASE,
        FDC_ITEMS_PER_ENTRY,
        INODE_SIZE as u32,
        FDC_ITEMS_PER_ENTRY,
        FDC_ITEMS_PER_ENTRY - 5,
        5,
        &[0b1110_0000, 0xff],
    );
    let fdc_item_pos = |item: u32| -> usize {
        FDC_BASE + 512 + BITMAP_ENTRY_SIZE + item as usize * INODE_SIZE
    };

    // --- FBB (file blocks): items 0..FBB_RESERVED-1 pre-allocated ---
    {
        let mut bits = vec![0u8; ((FBB_ITEMS_PER_ENTRY + 7) / 8) as usize];
        for item in FBB_RESERVED..FBB_ITEMS_PER_ENTRY {
            bits[(item / 8) as usize] |= 1 << (item % 8);
        }
        write_bitmap(
            &mut whole,
            FBB_BASE,
            FBB_ITEMS_PER_ENTRY,
            BLOCK_SIZE as u32,
            FBB_ITEMS_PER_ENTRY,
            FBB_ITEMS_PER_ENTRY - FBB_RESERVED,
            FBB_RESERVED,
            &bits,
        );
        // FBB never stores item payloads through `item_pos` (file-block
        // content is addressed directly via item * block_size), so the
        // header's `area_size` only needs to cover the entries array.
        put_u32(&mut whole[FBB_BASE..], 0x10, BITMAP_ENTRY_SIZE as u32);
    }

    // --- SBC (sub-blocks) ---
    write_bitmap(
        &mut whole,
        SBC_BASE,
        SBC_ITEMS_PER_ENTRY,
        SBC_DATA_SIZE,
        SBC_ITEMS_PER_ENTRY,
        SBC_ITEMS_PER_ENTRY,
        0,
        &[0xff],
    );

    // --- PBC (pointer blocks): data_size/4 == 256 == BLOCK_COUNT ---
    write_bitmap(
        &mut whole,
        PBC_BASE,
        PBC_ITEMS_PER_ENTRY,
        PBC_DATA_SIZE,
        PBC_ITEMS_PER_ENTRY,
        PBC_ITEMS_PER_ENTRY,
        0,
        &[0x0f],
    );

    // --- root directory inode + content ---
    let root_blk = fd(0, 0);
    let fbb_meta = fd(0, 1);
    let sbc_meta = fd(0, 2);
    let pbc_meta = fd(0, 3);
    let fdc_meta = fd(0, 4);

    let entries: &[(u32, u32, &str)] = &[
        (2, root_blk, "."),
        (2, root_blk, ".."),
        (1, fbb_meta, ".fbb.sf"),
        (1, sbc_meta, ".sbc.sf"),
        (1, pbc_meta, ".pbc.sf"),
        (1, fdc_meta, ".fdc.sf"),
    ];
    let root_content_item = (ROOT_CONTENT_BASE / BLOCK_SIZE as usize) as u32;
    {
        let base = ROOT_CONTENT_BASE;
        for (i, (ft, blk, name)) in entries.iter().enumerate() {
            let off = base + i * DIRENT_SIZE;
            write_dirent(&mut whole[off..off + DIRENT_SIZE], *ft, *blk, i as u32, name);
        }
    }
    {
        let root_pos = fdc_item_pos(0);
        let buf = &mut whole[root_pos..root_pos + INODE_SIZE];
        write_inode(
            buf,
            root_pos as u64,
            root_blk,
            0,
            2,
            2, // FileType::Directory
            (entries.len() * DIRENT_SIZE) as u64,
            BLOCK_SIZE,
            1,
            0,
            0,
            0o755,
            1, // Zla::Fb
            &{
                let mut b = [0u32; 256];
                b[0] = fb(root_content_item);
                b
            },
        );
    }

    // --- the four meta-file inodes, each a single FB block overlaying the
    // real bitmap it describes ---
    for (slot, item, name_item) in [
        (1u32, FBB_BASE / BLOCK_SIZE as usize, fbb_meta),
        (2, SBC_BASE / BLOCK_SIZE as usize, sbc_meta),
        (3, PBC_BASE / BLOCK_SIZE as usize, pbc_meta),
        (4, FDC_BASE / BLOCK_SIZE as usize, fdc_meta),
    ] {
        let pos = fdc_item_pos(slot);
        let buf = &mut whole[pos..pos + INODE_SIZE];
        write_inode(
            buf,
            pos as u64,
            name_item,
            0,
            1,
            1, // FileType::RegularFile
            BLOCK_SIZE,
            BLOCK_SIZE,
            1,
            0,
            0,
            0o600,
            1, // Zla::Fb
            &{
                let mut b = [0u32; 256];
                b[0] = fb(item as u32);
                b
            },
        );
    }

    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("vmfs_test_{}_{}.img", std::process::id(), n));
    std::fs::write(&path, &whole).expect("write synthetic VMFS image");

    TestImage {
        path,
        root_fbb_items_used: FBB_RESERVED,
    }
}
