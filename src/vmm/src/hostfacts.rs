// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Small host-side helpers that don't belong to any one component:
//! CPU frequency probing, memory-size suffix parsing and a
//! retry-on-`EINTR` positional file read.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid memory size suffix in {0:?}")]
    BadSizeSuffix(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Parses a size with an optional trailing K/M/G/T/P/E suffix (base
/// 1024, case-insensitive). An absent suffix returns the bare integer.
pub fn parse_mem_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::BadSizeSuffix(value.to_string()));
    }

    let last = value.chars().last().unwrap();
    let shift = match last.to_ascii_uppercase() {
        'K' => Some(10),
        'M' => Some(20),
        'G' => Some(30),
        'T' => Some(40),
        'P' => Some(50),
        'E' => Some(60),
        _ => None,
    };

    let (digits, shift) = match shift {
        Some(shift) => (&value[..value.len() - 1], shift),
        None => (value, 0),
    };

    let base: u64 = digits
        .parse()
        .map_err(|_| Error::BadSizeSuffix(value.to_string()))?;

    base.checked_shl(shift)
        .ok_or_else(|| Error::BadSizeSuffix(value.to_string()))
}

/// Reads the clock speed of the first logical CPU, in MHz, from
/// `/proc/cpuinfo`. Returns 0 if it cannot be determined -- the guest
/// treats 0 as "unknown" and does not depend on an accurate value.
pub fn detect_cpu_freq_mhz() -> u32 {
    let cpuinfo = match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(content) => content,
        Err(_) => return 0,
    };

    cpuinfo
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() != "cpu MHz" {
                return None;
            }
            value.trim().parse::<f64>().ok()
        })
        .map(|mhz| mhz.round() as u32)
        .unwrap_or(0)
}

/// Reads exactly `buf.len()` bytes from `file` at `offset`, retrying on
/// `EINTR`. Short reads for any other reason are an error.
pub fn pread_exact_retry(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut done = 0usize;

    while done < buf.len() {
        let ret = unsafe {
            libc::pread(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        if ret == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read",
            )));
        }

        done += ret as usize;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_integer() {
        assert_eq!(parse_mem_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_each_suffix() {
        assert_eq!(parse_mem_size("2K").unwrap(), 2 * 1024);
        assert_eq!(parse_mem_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_mem_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_mem_size("2m").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_mem_size("").is_err());
        assert!(parse_mem_size("abc").is_err());
        assert!(parse_mem_size("12X").is_err());
    }

    #[test]
    fn pread_retry_reads_exact_bytes() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        let file = tmp.reopen().unwrap();

        let mut buf = [0u8; 4];
        pread_exact_retry(&file, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"3456");
    }
}
