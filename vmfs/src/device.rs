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

//! The block device contract: positional read/write plus cluster
//! reserve/release, backed either by a plain file or a real SCSI block
//! device opened with direct I/O.

use crate::error::{Error, Result};
use crate::scsi;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

/// Any backing a physical volume can sit on. `reserve`/`release` must be
/// no-ops (never errors) on backings that don't support cluster locking —
/// callers branch on `Locked`/`IoError`, not on whether reservation is
/// meaningful for this device.
pub trait BlockDevice {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()>;
    fn reserve(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
    fn is_writable(&self) -> bool;
}

/// ioctl macro: Command, in the style of the `ior!` helper the rest of the
/// corpus uses for `BLKGETSIZE64`.
macro_rules! ioc {
    ($dir:expr, $ty:expr, $nr:expr, $size:expr) => {
        (($dir) << 30) | (($ty) << 8) | ($nr) | (($size) << 16)
    };
}
macro_rules! ior {
    ($ty:expr, $nr:expr, $arg:ty) => {
        ioc!(2, $ty, $nr, std::mem::size_of::<$arg>() as std::ffi::c_long)
    };
}
const BLKGETSIZE64: std::ffi::c_long = ior!(0x12, 114, u64);

/// A raw device or file, the only concrete [`BlockDevice`] this driver
/// needs (an LVM is a composition of these, not a variant of this trait).
pub struct FileDevice {
    file: File,
    writable: bool,
    scsi_capable: bool,
}

impl FileDevice {
    /// Opens `path`. `direct_io` requests `O_DIRECT` when the backing is a
    /// block device; it is silently ignored on plain files, matching the
    /// source's "on platforms supporting it" wording.
    pub fn open(path: &Path, writable: bool, direct_io: bool) -> Result<Self> {
        let is_blkdev = std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);

        let mut opts = OpenOptions::new();
        opts.read(true).write(writable);
        if direct_io && is_blkdev {
            opts.custom_flags(libc::O_DIRECT);
        }
        let file = opts.open(path)?;

        let scsi_capable = if is_blkdev {
            probe_reservation(&file)
        } else {
            false
        };

        Ok(FileDevice {
            file,
            writable,
            scsi_capable,
        })
    }

    /// Sector count as reported by `BLKGETSIZE64`, falling back to the
    /// file's length on plain files.
    /// The kernel's view of this device's SCSI LUN, or `None` on anything
    /// that isn't a SCSI-capable block device.
    pub fn queried_lun(&self) -> Option<u8> {
        if self.scsi_capable {
            scsi::get_lun(self.file.as_raw_fd()).ok()
        } else {
            None
        }
    }

    pub fn size_in_sectors(&self) -> Result<u64> {
        let meta = self.file.metadata()?;
        if meta.file_type().is_block_device() {
            let mut size: u64 = 0;
            let ret = unsafe {
                libc::ioctl(self.file.as_raw_fd(), BLKGETSIZE64 as _, &mut size)
            };
            if ret < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(size / 512)
        } else {
            Ok(meta.len() / 512)
        }
    }
}

/// Probed once at open by issuing both commands and checking they both
/// succeed; if either fails, reservation becomes a permanent no-op for
/// this device (§4.B).
fn probe_reservation(file: &File) -> bool {
    let fd = file.as_raw_fd();
    scsi::reserve(fd).is_ok() && scsi::release(fd).is_ok()
}

impl BlockDevice for FileDevice {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos))?;
        f.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos))?;
        f.write_all(buf)?;
        Ok(())
    }

    fn reserve(&self) -> Result<()> {
        if !self.scsi_capable {
            return Ok(());
        }
        scsi::reserve(self.file.as_raw_fd()).map_err(Error::Io)
    }

    fn release(&self) -> Result<()> {
        if !self.scsi_capable {
            return Ok(());
        }
        scsi::release(self.file.as_raw_fd()).map_err(Error::Io)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}
