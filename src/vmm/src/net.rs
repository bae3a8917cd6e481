// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A thin TAP back-end: opens `/dev/net/tun`, attaches it to a named
//! host interface with `TUNSETIFF`, and exposes it to the hypercall
//! layer as a raw non-blocking byte stream plus a MAC address string.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::ioctl_iow_nr;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

ioctl_iow_nr!(TUNSETIFF, 'T' as u32, 202, libc::c_int);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open /dev/net/tun: {0}")]
    OpenTun(io::Error),
    #[error("interface name {0:?} does not fit in IFNAMSIZ ({IFNAMSIZ})")]
    NameTooLong(String),
    #[error("TUNSETIFF ioctl failed: {0}")]
    SetIff(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An open TAP device attached to a host interface.
pub struct TapDevice {
    file: File,
    mac: [u8; 6],
}

impl TapDevice {
    /// Opens and attaches to `ifname`, putting the fd in non-blocking
    /// mode so `NETREAD` can report "no data pending" instead of
    /// stalling the vCPU thread.
    pub fn open(ifname: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(Error::OpenTun)?;

        if ifname.len() >= IFNAMSIZ {
            return Err(Error::NameTooLong(ifname.to_string()));
        }

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.bytes()) {
            *dst = src as libc::c_char;
        }

        // SAFETY: `ifr` is a valid, fully initialized `ifreq`-shaped
        // buffer for the lifetime of the call.
        let ret = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut ifr) };
        if ret < 0 {
            return Err(Error::SetIff(io::Error::last_os_error()));
        }

        set_nonblocking(&file);

        Ok(TapDevice {
            file,
            mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
        })
    }

    /// The device's MAC address as the 18-byte ASCII string the
    /// `NETINFO` hypercall hands to the guest (`xx:xx:xx:xx:xx:xx\0`).
    pub fn mac_str(&self) -> [u8; 18] {
        let text = format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.mac[0], self.mac[1], self.mac[2], self.mac[3], self.mac[4], self.mac[5]
        );
        let mut out = [0u8; 18];
        out[..text.len()].copy_from_slice(text.as_bytes());
        out
    }

    /// Writes exactly `buf.len()` bytes to the TAP fd, returning the
    /// number actually written (the caller enforces the exact-length
    /// invariant; this never retries a partial write).
    pub fn write_bytes(&mut self, buf: &[u8]) -> i64 {
        match self.file.write(buf) {
            Ok(n) => n as i64,
            Err(_) => -1,
        }
    }

    /// Reads up to `buf.len()` bytes. Returns `None` on EOF or
    /// `EAGAIN` (no packet pending), `Some(n)` otherwise.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Option<i64> {
        match self.file.read(buf) {
            Ok(0) => None,
            Ok(n) => Some(n as i64),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(_) => None,
        }
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn set_nonblocking(file: &File) {
    let fd = file.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_str_is_nul_padded_ascii() {
        let tap = TapDevice {
            file: tempfile::tempfile().unwrap(),
            mac: [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01],
        };
        let s = tap.mac_str();
        assert_eq!(&s[..17], b"de:ad:be:ef:00:01".as_slice());
        assert_eq!(s[17], 0);
    }
}
