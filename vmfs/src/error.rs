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

//! Error kinds shared by every layer of the driver.

use std::fmt;
use std::io;

/// Every way a core operation can fail.
///
/// Kept as a flat enum rather than per-layer error types: callers up to the
/// CLI only ever need to branch on the kind, never on which module raised
/// it.
#[derive(Debug)]
pub enum Error {
    /// Device read/write failed or returned a short transfer.
    Io(io::Error),
    /// A fixed magic number did not match.
    BadMagic,
    /// On-disk version is not 3 or 5.
    UnsupportedVersion(u32),
    /// A structural invariant failed (bad counters, inconsistent header...).
    Corrupted(&'static str),
    /// Path resolution did not find the named entry.
    NotFound,
    /// Expected a directory, got something else.
    NotADirectory,
    /// Expected a non-directory, got a directory.
    IsADirectory,
    /// Inode type does not support the requested operation.
    BadFileType,
    /// A bitmap had no free item left.
    NoSpace,
    /// A metadata record is held by another host/transaction.
    Locked,
    /// Write attempted on a read-only mount.
    ReadOnly,
    /// Malformed argument: double free, bad block-id encoding, truncate on
    /// a raw-device-map inode, an LVM straddling two extents.
    InvalidArg(&'static str),
    /// Aggregation was required where it is forbidden (a directory
    /// growing past its sub-block).
    TooBig,
    /// Allocation failure in the host process, not the on-disk bitmaps.
    NoMem,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn as_str(&self) -> &'static str {
        match self {
            Error::Io(_) => "I/O error",
            Error::BadMagic => "bad magic number",
            Error::UnsupportedVersion(_) => "unsupported VMFS version",
            Error::Corrupted(_) => "corrupted on-disk structure",
            Error::NotFound => "no such file or directory",
            Error::NotADirectory => "not a directory",
            Error::IsADirectory => "is a directory",
            Error::BadFileType => "unsupported file type for operation",
            Error::NoSpace => "no space left on bitmap",
            Error::Locked => "metadata record is locked",
            Error::ReadOnly => "filesystem is read-only",
            Error::InvalidArg(_) => "invalid argument",
            Error::TooBig => "operation would grow past allowed size",
            Error::NoMem => "out of memory",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}: {}", self.as_str(), e),
            Error::UnsupportedVersion(v) => write!(f, "{}: version {}", self.as_str(), v),
            Error::Corrupted(detail) => write!(f, "{}: {}", self.as_str(), detail),
            Error::InvalidArg(detail) => write!(f, "{}: {}", self.as_str(), detail),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
