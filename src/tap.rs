//! Linux TAP device.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::phys::Device;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IF_NAMESIZE],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A TAP interface opened through `/dev/net/tun`.
pub struct TapDevice {
    fd: RawFd,
    mtu: usize,
}

impl TapDevice {
    /// Open (or attach to) the named TAP interface.
    pub fn open(name: &str, mtu: usize) -> io::Result<Self> {
        if name.len() >= libc::IF_NAMESIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name too long"));
        }

        let path = CString::new("/dev/net/tun").unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut req = IfReq {
            ifr_name: [0; libc::IF_NAMESIZE],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        let rc = unsafe { libc::ioctl(fd, TUNSETIFF, &req) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self { fd, mtu })
    }
}

impl Device for TapDevice {
    fn recv(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            return Ok(0);
        }

        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let n = unsafe { libc::write(self.fd, frame.as_ptr().cast(), frame.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
