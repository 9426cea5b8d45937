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

//! A user-space, read/write driver for VMFS-3 and VMFS-5 volumes: the
//! physical-volume/LVM layer, the FBB/SBC/PBC/FDC bitmaps, the inode and
//! block-addressing engine, the directory layer, and cluster heartbeat
//! coordination.

pub mod addressing;
pub mod bitmap;
pub mod block;
pub mod device;
pub mod dir;
pub mod encoding;
pub mod error;
pub mod file;
pub mod fs;
pub mod heartbeat;
pub mod host;
pub mod inode;
pub mod lvm;
pub mod metadata;
pub mod scsi;
pub mod volume;

pub use device::{BlockDevice, FileDevice};
pub use dir::{DirEntry, Directory};
pub use error::{Error, Result};
pub use file::{File, Stat};
pub use fs::{BlockAccounting, Filesystem, OpenFlags, SuperBlock};
pub use inode::{FileType, InodeHandle};
pub use lvm::LogicalVolume;
pub use volume::{PhysicalVolume, VolInfo};
