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

//! SCSI RESERVE(6)/RELEASE(6) over the Linux `SG_IO` generic-SCSI ioctl.
//!
//! These back the cross-host exclusion the metadata-lock protocol relies
//! on (§4.E/§4.F of the driver's on-disk contract); they are no-ops on
//! anything that isn't a real SCSI-capable block device.

use std::io;
use std::os::fd::RawFd;

const SCSI_CMD_RESERVE: u8 = 0x16;
const SCSI_CMD_RELEASE: u8 = 0x17;
const SG_IO: libc::c_ulong = 0x2285;
const SG_DXFER_NONE: libc::c_int = -1;

#[repr(C)]
struct SgIoHdr {
    interface_id: libc::c_int,
    dxfer_direction: libc::c_int,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: *mut libc::c_void,
    cmdp: *mut u8,
    sbp: *mut u8,
    timeout: u32,
    flags: u32,
    pack_id: i32,
    usr_ptr: *mut libc::c_void,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

fn send(fd: RawFd, opcode: u8) -> io::Result<()> {
    let mut cmd = [opcode, 0, 0, 0, 0, 0];
    let mut sense = [0u8; 32];
    let mut hdr = SgIoHdr {
        interface_id: b'S' as libc::c_int,
        dxfer_direction: SG_DXFER_NONE,
        cmd_len: cmd.len() as u8,
        mx_sb_len: sense.len() as u8,
        iovec_count: 0,
        dxfer_len: 0,
        dxferp: std::ptr::null_mut(),
        cmdp: cmd.as_mut_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: 5000,
        flags: 0,
        pack_id: 0,
        usr_ptr: std::ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };

    let ret = unsafe { libc::ioctl(fd, SG_IO, &mut hdr as *mut SgIoHdr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn reserve(fd: RawFd) -> io::Result<()> {
    send(fd, SCSI_CMD_RESERVE)
}

pub fn release(fd: RawFd) -> io::Result<()> {
    send(fd, SCSI_CMD_RELEASE)
}

const SCSI_IOCTL_GET_IDLUN: libc::c_ulong = 0x5382;

#[repr(C)]
struct ScsiIdLun {
    four_in_one: u32,
    host_unique_id: u32,
}

/// Queries the kernel's view of this device's SCSI LUN, used to cross-check
/// against the LUN recorded in a volume's super-block at mount time.
pub fn get_lun(fd: RawFd) -> io::Result<u8> {
    let mut idlun = ScsiIdLun {
        four_in_one: 0,
        host_unique_id: 0,
    };
    let ret = unsafe { libc::ioctl(fd, SCSI_IOCTL_GET_IDLUN, &mut idlun as *mut ScsiIdLun) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(((idlun.four_in_one >> 8) & 0xff) as u8)
}
