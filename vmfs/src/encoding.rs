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

//! Little-endian field access and aligned buffer allocation.
//!
//! Every on-disk integer is little-endian regardless of host; these
//! helpers are the only place that assumption is encoded. Buffers that
//! round-trip through `write_*` after a `read_*` must preserve any bytes
//! the helpers were not asked to touch — callers own that, not this
//! module.

/// Minimum aligned transfer granularity for direct I/O, matching the
/// on-disk sector size vmfs always assumes.
pub const DIO_BLOCK_SIZE: usize = 512;

pub fn read_le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

pub fn write_le16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
}

pub fn read_le32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub fn write_le32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

pub fn read_le64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub fn write_le64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

/// Raw 128-bit UUID copy; on-disk UUIDs are opaque byte strings, not
/// integers, so there is no endianness to apply.
pub fn read_uuid(buf: &[u8], offset: usize) -> [u8; 16] {
    buf[offset..offset + 16].try_into().unwrap()
}

pub fn write_uuid(buf: &mut [u8], offset: usize, uuid: &[u8; 16]) {
    buf[offset..offset + 16].copy_from_slice(uuid);
}

/// Reads a fixed-length, NUL-terminated string field, stopping at the
/// first NUL or the field's end, whichever comes first.
pub fn read_fixed_str(buf: &[u8], offset: usize, len: usize) -> String {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Writes `s` into a fixed-length field, NUL-padding the remainder.
/// Truncates silently if `s` does not fit — callers validate name
/// lengths before this point.
pub fn write_fixed_str(buf: &mut [u8], offset: usize, len: usize, s: &str) {
    let field = &mut buf[offset..offset + len];
    field.fill(0);
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Rounds `len` up to the next multiple of `align`.
pub fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) / align * align
}

/// Allocates a zeroed buffer whose length is rounded up to
/// [`DIO_BLOCK_SIZE`], suitable for direct I/O regardless of whether the
/// backing device actually requires it.
pub fn aligned_buffer(len: usize) -> Vec<u8> {
    vec![0u8; align_up(len, DIO_BLOCK_SIZE)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_round_trip() {
        let mut buf = [0u8; 16];
        write_le32(&mut buf, 0, 0xdead_beef);
        write_le64(&mut buf, 4, 0x0123_4567_89ab_cdef);
        assert_eq!(read_le32(&buf, 0), 0xdead_beef);
        assert_eq!(read_le64(&buf, 4), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn fixed_str_preserves_padding_length() {
        let mut buf = [0xffu8; 8];
        write_fixed_str(&mut buf, 0, 8, "ab");
        assert_eq!(read_fixed_str(&buf, 0, 8), "ab");
        assert_eq!(&buf[3..], [0u8; 5]);
    }

    #[test]
    fn align_up_rounds_to_block() {
        assert_eq!(align_up(1, DIO_BLOCK_SIZE), DIO_BLOCK_SIZE);
        assert_eq!(align_up(DIO_BLOCK_SIZE, DIO_BLOCK_SIZE), DIO_BLOCK_SIZE);
        assert_eq!(align_up(DIO_BLOCK_SIZE + 1, DIO_BLOCK_SIZE), DIO_BLOCK_SIZE * 2);
    }
}
