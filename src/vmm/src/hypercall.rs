// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Decodes and services the guest's hypercall ABI: a small set of
//! fixed C-layout records in guest memory, addressed by the 32-bit
//! `OUT` payload the vCPU loop hands us. Every record field is a
//! native 64-bit width so each record is naturally aligned -- there is
//! no implicit padding to reason about.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use crate::memory::GuestMemory;
use crate::net::TapDevice;

pub const PORT_WRITE: u16 = 0x499;
pub const PORT_OPEN: u16 = 0x500;
pub const PORT_CLOSE: u16 = 0x501;
pub const PORT_READ: u16 = 0x502;
pub const PORT_EXIT: u16 = 0x503;
pub const PORT_LSEEK: u16 = 0x504;
pub const PORT_NETINFO: u16 = 0x505;
pub const PORT_NETWRITE: u16 = 0x506;
pub const PORT_NETREAD: u16 = 0x507;

const MAX_PATH_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("guest memory error: {0}")]
    Memory(#[from] crate::memory::Error),
    #[error("hypercall path string exceeds {MAX_PATH_LEN} bytes or is not NUL-terminated")]
    PathTooLong,
    #[error("hypercall path contains an embedded NUL byte")]
    PathHasInteriorNul,
    #[error("NETWRITE transferred {got} of {want} requested bytes")]
    ShortNetWrite { want: i64, got: i64 },
    #[error("unknown hypercall port {0:#x}")]
    UnknownPort(u16),
    #[error("NETWRITE/NETREAD/NETINFO issued with no network back-end configured")]
    NoNetworkBackend,
}

pub type Result<T> = std::result::Result<T, Error>;

/// What the vCPU loop should do after a hypercall returns.
pub enum Outcome {
    Continue,
    Exit(i32),
}

#[repr(C)]
struct WriteRecord {
    fd: i64,
    buf: u64,
    len: i64,
}

#[repr(C)]
struct OpenRecord {
    name: u64,
    flags: i64,
    mode: i64,
    ret: i64,
}

#[repr(C)]
struct CloseRecord {
    fd: i64,
    ret: i64,
}

#[repr(C)]
struct ReadRecord {
    fd: i64,
    buf: u64,
    len: i64,
    ret: i64,
}

#[repr(C)]
struct LseekRecord {
    fd: i64,
    offset: i64,
    whence: i64,
}

#[repr(C)]
struct NetinfoRecord {
    mac_str: [u8; 18],
}

#[repr(C)]
struct NetIoRecord {
    data: u64,
    len: i64,
    ret: i64,
}

unsafe impl vm_memory::ByteValued for WriteRecord {}
unsafe impl vm_memory::ByteValued for OpenRecord {}
unsafe impl vm_memory::ByteValued for CloseRecord {}
unsafe impl vm_memory::ByteValued for ReadRecord {}
unsafe impl vm_memory::ByteValued for LseekRecord {}
unsafe impl vm_memory::ByteValued for NetinfoRecord {}
unsafe impl vm_memory::ByteValued for NetIoRecord {}

/// Dispatches one hypercall. `record_addr` is the guest physical
/// address carried as the `OUT` instruction's 32-bit payload.
pub fn dispatch(
    port: u16,
    record_addr: u64,
    mem: &GuestMemory,
    net: Option<&mut TapDevice>,
) -> Result<Outcome> {
    match port {
        PORT_WRITE => {
            let mut rec: WriteRecord = mem.read_obj(record_addr)?;
            let buf = mem.slice_mut(rec.buf, rec.len.max(0) as usize)?;
            let n = unsafe { libc::write(rec.fd as RawFd, buf.as_ptr() as *const _, buf.len()) };
            rec.len = n as i64;
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        PORT_OPEN => {
            let mut rec: OpenRecord = mem.read_obj(record_addr)?;
            let path = read_guest_cstring(mem, rec.name)?;
            let fd = unsafe { libc::open(path.as_ptr(), rec.flags as libc::c_int, rec.mode as libc::mode_t) };
            rec.ret = fd as i64;
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        PORT_CLOSE => {
            let mut rec: CloseRecord = mem.read_obj(record_addr)?;
            // `ret` doubles as the input gate: only close fds the guest
            // marks above stdio (> 2), matching the ABI this was
            // reconstructed from.
            if rec.ret > 2 {
                let result = unsafe { libc::close(rec.fd as RawFd) };
                rec.ret = result as i64;
            } else {
                rec.ret = -1;
            }
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        PORT_READ => {
            let mut rec: ReadRecord = mem.read_obj(record_addr)?;
            let buf = mem.slice_mut(rec.buf, rec.len.max(0) as usize)?;
            let n = unsafe { libc::read(rec.fd as RawFd, buf.as_mut_ptr() as *mut _, buf.len()) };
            rec.ret = n as i64;
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        PORT_EXIT => {
            let status: i32 = mem.read_obj(record_addr)?;
            Ok(Outcome::Exit(status))
        }
        PORT_LSEEK => {
            let mut rec: LseekRecord = mem.read_obj(record_addr)?;
            let result = unsafe { libc::lseek(rec.fd as RawFd, rec.offset, rec.whence as libc::c_int) };
            rec.offset = result;
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        PORT_NETINFO => {
            let net = net.ok_or(Error::NoNetworkBackend)?;
            let rec = NetinfoRecord {
                mac_str: net.mac_str(),
            };
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        PORT_NETWRITE => {
            let net = net.ok_or(Error::NoNetworkBackend)?;
            let mut rec: NetIoRecord = mem.read_obj(record_addr)?;
            let buf = mem.slice_mut(rec.data, rec.len.max(0) as usize)?;
            let n = net.write_bytes(buf);
            if n != rec.len {
                return Err(Error::ShortNetWrite { want: rec.len, got: n });
            }
            rec.ret = 0;
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        PORT_NETREAD => {
            let net = net.ok_or(Error::NoNetworkBackend)?;
            let mut rec: NetIoRecord = mem.read_obj(record_addr)?;
            let buf = mem.slice_mut(rec.data, rec.len.max(0) as usize)?;
            match net.read_bytes(buf) {
                Some(n) => {
                    rec.len = n;
                    rec.ret = 0;
                }
                None => {
                    rec.ret = -1;
                }
            }
            mem.write_obj(rec, record_addr)?;
            Ok(Outcome::Continue)
        }
        other => Err(Error::UnknownPort(other)),
    }
}

fn read_guest_cstring(mem: &GuestMemory, addr: u64) -> Result<CString> {
    let mut bytes = Vec::new();
    for i in 0..MAX_PATH_LEN as u64 {
        let byte: u8 = mem.read_obj(addr + i)?;
        if byte == 0 {
            return CString::new(bytes).map_err(|_| Error::PathHasInteriorNul);
        }
        bytes.push(byte);
    }
    Err(Error::PathTooLong)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestMemory;

    fn mem() -> GuestMemory {
        GuestMemory::new(2 * 1024 * 1024).unwrap()
    }

    #[test]
    fn write_hypercall_reports_bytes_written() {
        let mem = mem();
        mem.slice_mut(0x2000, 3).unwrap().copy_from_slice(b"hi\n");
        let rec = WriteRecord {
            fd: 1,
            buf: 0x2000,
            len: 3,
        };
        mem.write_obj(rec, 0x1000).unwrap();

        // fd 1 (stdout) -- exercised for the write path itself, not
        // for output capture.
        match dispatch(PORT_WRITE, 0x1000, &mem, None).unwrap() {
            Outcome::Continue => {}
            Outcome::Exit(_) => panic!("unexpected exit"),
        }
        let back: WriteRecord = mem.read_obj(0x1000).unwrap();
        assert_eq!(back.len, 3);
    }

    #[test]
    fn close_hypercall_refuses_stdio() {
        let mem = mem();
        let rec = CloseRecord { fd: 0, ret: 1 };
        mem.write_obj(rec, 0x1000).unwrap();
        dispatch(PORT_CLOSE, 0x1000, &mem, None).unwrap();
        let back: CloseRecord = mem.read_obj(0x1000).unwrap();
        assert_eq!(back.ret, -1);
    }

    #[test]
    fn exit_hypercall_returns_status() {
        let mem = mem();
        mem.write_obj(42i32, 0x1000).unwrap();
        match dispatch(PORT_EXIT, 0x1000, &mem, None).unwrap() {
            Outcome::Exit(status) => assert_eq!(status, 42),
            Outcome::Continue => panic!("expected exit"),
        }
    }

    #[test]
    fn unknown_port_is_an_error() {
        let mem = mem();
        assert!(matches!(
            dispatch(0x42, 0x1000, &mem, None),
            Err(Error::UnknownPort(0x42))
        ));
    }
}
