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

//! A thin front-end over the `vmfs` crate: one device/extent list followed
//! by a single subcommand, in the spirit of the source's `debugvmfs` shell.

use std::env;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use vmfs::{Directory, File, Filesystem, OpenFlags};

fn print_usage(bin: &str) {
    eprintln!("Usage: {bin} [-w] [--direct-io] <extent>... <command> [args...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -w            mount read/write (default: read-only)");
    eprintln!("  --direct-io   open extents with O_DIRECT");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  df                          show bitmap free space");
    eprintln!("  show_fs                     show super-block info");
    eprintln!("  dir <path>                  list a directory");
    eprintln!("  cat <path>                  print a file's content");
    eprintln!("  stat <path>                 show an inode's metadata");
    eprintln!("  mkdir <path> <mode>         create a directory");
    eprintln!("  write <path> <text>         write text at the start of a file");
    eprintln!("  truncate <path> <size>      truncate a file to <size> bytes");
    eprintln!("  chmod <path> <mode>         change a file's mode (octal)");
    eprintln!("  rm <path>                   unlink a name from its parent directory");
    eprintln!("  check                       validate the four bitmaps' invariants");
    eprintln!("  blockstat <blkid>           report free/allocated for a block id (hex)");
    eprintln!("  fsck                        walk every inode and cross-check block counts");
}

/// Parsed command line: the mount flags, one or more device paths, and the
/// subcommand with its own arguments.
struct Args {
    flags: OpenFlags,
    extents: Vec<PathBuf>,
    command: String,
    command_args: Vec<String>,
}

fn parse_args(bin: &str) -> Args {
    let mut flags = OpenFlags::default();
    let mut rest: Vec<String> = Vec::new();

    let mut iter = env::args().skip(1).peekable();
    while let Some(arg) = iter.peek() {
        match arg.as_str() {
            "-w" => {
                flags.read_write = true;
                iter.next();
            }
            "--direct-io" => {
                flags.direct_io = true;
                iter.next();
            }
            "-h" | "--help" => {
                print_usage(bin);
                exit(0);
            }
            _ => break,
        }
    }
    rest.extend(iter);

    if rest.len() < 2 {
        print_usage(bin);
        exit(1);
    }

    // Everything but the last entry is an extent path; the teacher's
    // `mkfs`/`mount` tools take the device last too, but vmfs volumes can
    // span several extents so the command has to come after all of them.
    // `debugvmfs` resolves this the same way: scan for the first token
    // that names a known command.
    let command_idx = rest
        .iter()
        .position(|s| is_known_command(s))
        .unwrap_or_else(|| {
            print_usage(bin);
            exit(1);
        });

    let extents: Vec<PathBuf> = rest[..command_idx].iter().map(PathBuf::from).collect();
    let command = rest[command_idx].clone();
    let command_args = rest[command_idx + 1..].to_vec();

    if extents.is_empty() {
        print_usage(bin);
        exit(1);
    }

    Args {
        flags,
        extents,
        command,
        command_args,
    }
}

fn is_known_command(s: &str) -> bool {
    matches!(
        s,
        "df" | "show_fs" | "dir" | "cat" | "stat" | "mkdir" | "write" | "truncate" | "chmod" | "rm" | "check"
            | "blockstat" | "fsck"
    )
}

fn die(bin: &str, msg: impl std::fmt::Display) -> ! {
    eprintln!("{bin}: {msg}");
    exit(1);
}

fn main() {
    let bin = env::args().next().unwrap_or_else(|| "vmfs-cli".to_string());
    let args = parse_args(&bin);

    let paths: Vec<&Path> = args.extents.iter().map(PathBuf::as_path).collect();
    let fs = Filesystem::open(&paths, args.flags).unwrap_or_else(|e| die(&bin, e));

    let ret = run_command(&bin, &fs, &args.command, &args.command_args);
    let close_err = fs.close().err();

    if let Err(e) = ret {
        die(&bin, e);
    }
    if let Some(e) = close_err {
        die(&bin, e);
    }
}

fn run_command(bin: &str, fs: &Arc<Filesystem>, cmd: &str, args: &[String]) -> vmfs::Result<()> {
    match cmd {
        "df" => cmd_df(fs),
        "show_fs" => cmd_show_fs(fs),
        "dir" => cmd_dir(fs, args.first().map(String::as_str).unwrap_or("/")),
        "cat" => cmd_cat(fs, arg_or_die(bin, args, 0, "path")),
        "stat" => cmd_stat(fs, arg_or_die(bin, args, 0, "path")),
        "mkdir" => cmd_mkdir(
            fs,
            arg_or_die(bin, args, 0, "path"),
            parse_mode(bin, arg_or_die(bin, args, 1, "mode")),
        ),
        "write" => cmd_write(fs, arg_or_die(bin, args, 0, "path"), arg_or_die(bin, args, 1, "text")),
        "truncate" => cmd_truncate(fs, arg_or_die(bin, args, 0, "path"), parse_u64(bin, arg_or_die(bin, args, 1, "size"))),
        "chmod" => cmd_chmod(fs, arg_or_die(bin, args, 0, "path"), parse_mode(bin, arg_or_die(bin, args, 1, "mode"))),
        "rm" => cmd_rm(fs, arg_or_die(bin, args, 0, "path")),
        "check" => cmd_check(fs),
        "blockstat" => cmd_blockstat(fs, arg_or_die(bin, args, 0, "blkid")),
        "fsck" => cmd_fsck(fs),
        _ => {
            print_usage(bin);
            exit(1);
        }
    }
}

fn arg_or_die<'a>(bin: &str, args: &'a [String], idx: usize, name: &str) -> &'a str {
    args.get(idx).map(String::as_str).unwrap_or_else(|| {
        eprintln!("{bin}: missing argument: {name}");
        exit(1);
    })
}

fn parse_mode(bin: &str, s: &str) -> u32 {
    u32::from_str_radix(s, 8).unwrap_or_else(|_| die(bin, format!("invalid mode `{s}`")))
}

fn parse_u64(bin: &str, s: &str) -> u64 {
    s.parse().unwrap_or_else(|_| die(bin, format!("invalid size `{s}`")))
}

fn cmd_df(fs: &Arc<Filesystem>) -> vmfs::Result<()> {
    for (name, bitmap) in [
        ("FBB (file blocks)", &fs.fbb),
        ("SBC (sub-blocks)", &fs.sbc),
        ("PBC (pointer blocks)", &fs.pbc),
        ("FDC (file descriptors)", &fs.fdc),
    ] {
        let h = &bitmap.header;
        let free_items = bitmap.free_items(fs)?;
        let free_bytes = free_items as u64 * h.data_size as u64;
        println!(
            "{name:<24} total {:>10}  free {:>10} ({} bytes)",
            h.total_items, free_items, free_bytes
        );
    }
    Ok(())
}

fn cmd_blockstat(fs: &Arc<Filesystem>, blkid: &str) -> vmfs::Result<()> {
    let blk_id = u32::from_str_radix(blkid.trim_start_matches("0x"), 16)
        .map_err(|_| vmfs::Error::InvalidArg("blkid must be a hex block id"))?;
    let allocated = vmfs::bitmap::block_status(fs, blk_id)?;
    println!("0x{blk_id:x}: {}", if allocated { "allocated" } else { "free" });
    Ok(())
}

fn cmd_fsck(fs: &Arc<Filesystem>) -> vmfs::Result<()> {
    let acc = fs.walk_blocks()?;
    println!("referenced: fb {} sb {} pb {} fd {}", acc.fb, acc.sb, acc.pb, acc.fd);
    let mismatches = acc.diff_from_bitmaps(fs)?;
    println!("mismatched categories: {mismatches}");
    if mismatches != 0 {
        exit(1);
    }
    Ok(())
}

fn cmd_show_fs(fs: &Arc<Filesystem>) -> vmfs::Result<()> {
    print!("{}", fs.super_block);
    Ok(())
}

fn cmd_dir(fs: &Arc<Filesystem>, path: &str) -> vmfs::Result<()> {
    let root = fs.root()?;
    let mut dir = Directory::open_at(fs, root, path)?;
    while let Some(entry) = dir.read()? {
        if entry.is_free() {
            continue;
        }
        println!("{:<8x} {}", entry.block_id, entry.name);
    }
    Ok(())
}

fn cmd_cat(fs: &Arc<Filesystem>, path: &str) -> vmfs::Result<()> {
    let file = File::open_from_filespec(fs, path)?;
    let size = file.stat().size;
    let mut buf = vec![0u8; size as usize];
    file.pread(&mut buf, 0)?;
    use std::io::Write;
    std::io::stdout().write_all(&buf).ok();
    Ok(())
}

fn cmd_stat(fs: &Arc<Filesystem>, path: &str) -> vmfs::Result<()> {
    let file = File::open_from_filespec(fs, path)?;
    let stat = file.stat();
    println!("block id  : 0x{:x}", file.blk_id());
    println!("type      : {:?}", stat.file_type);
    println!("size      : {}", stat.size);
    println!("mode      : {:o}", stat.mode);
    println!("uid/gid   : {}/{}", stat.uid, stat.gid);
    println!("nlink     : {}", stat.nlink);
    println!("mtime     : {}", stat.mtime);
    println!("ctime     : {}", stat.ctime);
    println!("atime     : {}", stat.atime);
    Ok(())
}

fn cmd_mkdir(fs: &Arc<Filesystem>, path: &str, mode: u32) -> vmfs::Result<()> {
    let (parent, name) = split_parent(path);
    let root = fs.root()?;
    let mut dir = Directory::open_at(fs, root, parent)?;
    let (uid, gid) = current_ids();
    vmfs::dir::mkdir(fs, &mut dir, name, mode, uid, gid)?;
    Ok(())
}

fn current_ids() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

fn cmd_write(fs: &Arc<Filesystem>, path: &str, text: &str) -> vmfs::Result<()> {
    let file = File::open_from_filespec(fs, path)?;
    file.pwrite(text.as_bytes(), 0)?;
    Ok(())
}

fn cmd_truncate(fs: &Arc<Filesystem>, path: &str, size: u64) -> vmfs::Result<()> {
    let file = File::open_from_filespec(fs, path)?;
    file.truncate(size)
}

fn cmd_chmod(fs: &Arc<Filesystem>, path: &str, mode: u32) -> vmfs::Result<()> {
    let file = File::open_from_filespec(fs, path)?;
    file.chmod(mode)
}

fn cmd_rm(fs: &Arc<Filesystem>, path: &str) -> vmfs::Result<()> {
    let (parent, name) = split_parent(path);
    let root = fs.root()?;
    let mut dir = Directory::open_at(fs, root, parent)?;

    let mut pos = 0u32;
    loop {
        dir.seek(pos);
        let entry = match dir.read()? {
            Some(e) => e,
            None => return Err(vmfs::Error::NotFound),
        };
        if !entry.is_free() && entry.name == name {
            let record_pos = pos as u64 * vmfs::dir::DIRENT_SIZE as u64;
            return vmfs::dir::unlink_inode(fs, &mut dir, record_pos, &entry);
        }
        pos += 1;
    }
}

fn cmd_check(fs: &Arc<Filesystem>) -> vmfs::Result<()> {
    let mut total = 0u32;
    for (name, bitmap) in [
        ("fbb", &fs.fbb),
        ("sbc", &fs.sbc),
        ("pbc", &fs.pbc),
        ("fdc", &fs.fdc),
    ] {
        let errors = bitmap.check(fs)?;
        println!("{name}: {errors} inconsistencies");
        total += errors;
    }
    if total != 0 {
        exit(1);
    }
    Ok(())
}

/// Splits `path` into its parent directory and final component, the way
/// `rm`/`mkdir` need to resolve the directory to mutate separately from
/// the name being added or removed.
fn split_parent(path: &str) -> (&str, &str) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => (if parent.is_empty() { "/" } else { parent }, name),
        _ => ("/", path.trim_start_matches('/')),
    }
}
