use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{ConcentratorError, Result};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Mirrors the kernel's `struct ifreq` layout closely enough for
/// `TUNSETIFF`: the name followed by the flags field, padded out to the
/// full union size the kernel's `copy_from_user` expects.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// One `/dev/net/tun` file descriptor, opened in non-blocking `TUN | NO_PI`
/// mode and bound to a specific interface name. Closing it (via `Drop`)
/// does not by itself remove the kernel interface — that is `TunRegistry`'s
/// job — it only releases this process's handle.
pub struct TunDevice {
    fd: RawFd,
    name: String,
}

impl TunDevice {
    pub fn open(name: &str) -> Result<Self> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(ConcentratorError::OsProvisioning(format!(
                "interface name {name} too long"
            )));
        }

        let path = CString::new("/dev/net/tun").unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(ConcentratorError::Io(io::Error::last_os_error()));
        }

        let mut ifr_name = [0u8; libc::IFNAMSIZ];
        ifr_name[..name.len()].copy_from_slice(name.as_bytes());
        let mut req = IfReq {
            ifr_name,
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };

        let rc = unsafe { libc::ioctl(fd, TUNSETIFF, &mut req as *mut IfReq) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ConcentratorError::OsProvisioning(format!(
                "TUNSETIFF for {name} failed: {err}"
            )));
        }

        set_nonblocking(fd)?;

        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking read of one packet. Returns `Ok(None)` on `EWOULDBLOCK`,
    /// never blocking the calling thread.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            Ok(Some(n as usize))
        } else {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        }
    }

    /// Non-blocking write of one packet.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(ConcentratorError::Io(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(ConcentratorError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}
