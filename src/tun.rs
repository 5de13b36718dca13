//! Packet I/O over a caller-supplied TUN file descriptor.
//!
//! The caller keeps ownership of the descriptor it hands in; the device works
//! on a `O_CLOEXEC` duplicate that is closed on drop. The duplicate is placed
//! in non-blocking mode and driven through [`AsyncFd`], so reads park on the
//! reactor instead of spinning on `EAGAIN`.
//!
//! Exactly one task reads and one task writes; the engine enforces that
//! discipline by construction.

use crate::error::{Error, Result};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::trace;

pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    mtu: usize,
}

impl TunDevice {
    /// Wrap a raw TUN descriptor. Fails if the descriptor is negative or
    /// cannot be duplicated.
    pub fn from_raw_fd(fd: RawFd, mtu: usize) -> Result<Self> {
        if fd < 0 {
            return Err(Error::InvalidDescriptor(fd));
        }

        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let owned = unsafe { OwnedFd::from_raw_fd(dup) };

        let flags = unsafe { libc::fcntl(owned.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if unsafe { libc::fcntl(owned.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let fd = AsyncFd::with_interest(owned, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { fd, mtu })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Read one frame. Returns [`Error::EndOfStream`] when the descriptor is
    /// closed; that is fatal for the tunnel.
    pub async fn read_frame(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => return Err(Error::EndOfStream),
                Ok(Ok(n)) => {
                    trace!(len = n, "frame in");
                    return Ok(n);
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one synthesized frame.
    pub async fn write_frame(&self, data: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    trace!(len = n, "frame out");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    fn socketpair(kind: libc::c_int) -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, kind, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn send(fd: &OwnedFd, data: &[u8]) {
        let n = unsafe {
            libc::write(fd.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len())
        };
        assert_eq!(n as usize, data.len());
    }

    fn recv(fd: &OwnedFd, buf: &mut [u8]) -> usize {
        let n = unsafe {
            libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        assert!(n >= 0);
        n as usize
    }

    #[test]
    fn negative_descriptor_rejected() {
        assert!(matches!(TunDevice::from_raw_fd(-1, 1500), Err(Error::InvalidDescriptor(-1))));
    }

    #[tokio::test]
    async fn frames_round_trip_through_descriptor() {
        let (near, far) = socketpair(libc::SOCK_DGRAM);
        let dev = TunDevice::from_raw_fd(near.as_raw_fd(), 1500).unwrap();

        send(&far, b"\x45inbound");
        let mut buf = [0u8; 1500];
        let n = dev.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x45inbound");

        dev.write_frame(b"\x45outbound").await.unwrap();
        let mut peer_buf = [0u8; 1500];
        let n = recv(&far, &mut peer_buf);
        assert_eq!(&peer_buf[..n], b"\x45outbound");
    }

    #[tokio::test]
    async fn caller_descriptor_survives_device_drop() {
        let (near, far) = socketpair(libc::SOCK_DGRAM);
        {
            let dev = TunDevice::from_raw_fd(near.as_raw_fd(), 1500).unwrap();
            drop(dev);
        }
        // The original fd still works after the duplicate is closed.
        send(&near, b"still alive");
        let mut buf = [0u8; 64];
        assert_eq!(recv(&far, &mut buf), 11);
    }

    #[tokio::test]
    async fn closed_peer_reports_end_of_stream() {
        let (near, far) = socketpair(libc::SOCK_STREAM);
        let dev = TunDevice::from_raw_fd(near.into_raw_fd(), 1500).unwrap();
        drop(far);

        let mut buf = [0u8; 64];
        assert!(matches!(dev.read_frame(&mut buf).await, Err(Error::EndOfStream)));
    }
}
