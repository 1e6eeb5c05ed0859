// Tunnel device over an already-open file descriptor.
//
// The host (VPN service, `ip tuntap` plus a helper, ...) creates the tun
// interface and hands over its fd. Packets are raw IP without a packet
// information header, one packet per read/write.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};

use super::{TunDevice, TunEvent, closed_error};

/// How long a read waits for a packet before reporting an empty batch.
const READ_POLL_MS: libc::c_int = 250;

pub struct FdTun {
    fd: OwnedFd,
    name: String,
    mtu: usize,
    closed: AtomicBool,
    events_tx: Sender<TunEvent>,
    events_rx: Receiver<TunEvent>,
}

impl FdTun {
    /// Take ownership of `fd`. The device reports `Up` immediately.
    pub fn new(fd: OwnedFd, name: impl Into<String>, mtu: usize) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let _ = events_tx.send(TunEvent::Up);
        let name = name.into();
        log::info!("tun {name}: attached fd {} (mtu {mtu})", fd.as_raw_fd());
        Self {
            fd,
            name,
            mtu,
            closed: AtomicBool::new(false),
            events_tx,
            events_rx,
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }

    /// Wait up to READ_POLL_MS for the fd to become readable.
    fn poll_readable(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, READ_POLL_MS) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }
}

/// A tun fd takes a packet whole or not at all; anything else means the
/// peer saw a truncated packet.
fn check_full_write(written: usize, len: usize) -> io::Result<()> {
    if written < len {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {written} of {len} bytes"),
        ));
    }
    Ok(())
}

impl TunDevice for FdTun {
    fn name(&self) -> io::Result<String> {
        self.ensure_open()?;
        Ok(self.name.clone())
    }

    fn mtu(&self) -> io::Result<usize> {
        self.ensure_open()?;
        Ok(self.mtu)
    }

    fn events(&self) -> Receiver<TunEvent> {
        self.events_rx.clone()
    }

    fn batch_size(&self) -> usize {
        1
    }

    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        self.ensure_open()?;
        let (Some(buf), Some(size)) = (bufs.first_mut(), sizes.first_mut()) else {
            return Ok(0);
        };
        if buf.len() <= offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer of {} bytes leaves no room after offset {offset}", buf.len()),
            ));
        }
        if !self.poll_readable()? {
            return Ok(0);
        }

        let room = &mut buf[offset..];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                room.as_mut_ptr() as *mut libc::c_void,
                room.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                return Ok(0);
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(0);
        }
        *size = n as usize;
        Ok(1)
    }

    fn write_batch(&self, bufs: &[Vec<u8>], offset: usize) -> io::Result<usize> {
        self.ensure_open()?;
        let mut written = 0;
        for buf in bufs {
            let Some(packet) = buf.get(offset..) else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("buffer of {} bytes is shorter than offset {offset}", buf.len()),
                ));
            };
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    packet.as_ptr() as *const libc::c_void,
                    packet.len(),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            check_full_write(n as usize, packet.len())?;
            written += 1;
        }
        Ok(written)
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.events_tx.send(TunEvent::Down);
        log::info!("tun {}: closed", self.name);
        // The fd itself is released when the device is dropped.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    /// A connected pair of datagram sockets stands in for a tun fd: one
    /// packet per read, boundaries preserved.
    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "socketpair: {}", io::Error::last_os_error());
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn up_on_create_down_on_close() {
        let (a, _b) = socket_pair();
        let tun = FdTun::new(a, "tun0", 1400);
        let events = tun.events();
        assert_eq!(events.try_recv().unwrap(), TunEvent::Up);
        tun.close().unwrap();
        assert_eq!(events.try_recv().unwrap(), TunEvent::Down);
        // Second close is a no-op.
        tun.close().unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn closed_device_rejects_io() {
        let (a, _b) = socket_pair();
        let tun = FdTun::new(a, "tun0", 1400);
        tun.close().unwrap();
        assert!(tun.mtu().is_err());
        assert!(tun.write_batch(&[vec![0u8; 4]], 0).is_err());
    }

    #[test]
    fn write_then_read_across_pair() {
        let (a, b) = socket_pair();
        let left = FdTun::new(a, "left", 1500);
        let right = FdTun::new(b, "right", 1500);

        let mut pkt = vec![0u8; 4];
        pkt.extend_from_slice(&[0x45, 1, 2, 3]);
        assert_eq!(left.write_batch(&[pkt], 4).unwrap(), 1);

        let mut bufs = vec![vec![0u8; 64]];
        let mut sizes = [0usize; 1];
        assert_eq!(right.read_batch(&mut bufs, &mut sizes, 16).unwrap(), 1);
        assert_eq!(sizes[0], 4);
        assert_eq!(&bufs[0][16..20], &[0x45, 1, 2, 3]);
    }

    #[test]
    fn idle_read_returns_empty_batch() {
        let (a, _b) = socket_pair();
        let tun = FdTun::new(a, "tun0", 1500);
        let mut bufs = vec![vec![0u8; 64]];
        let mut sizes = [0usize; 1];
        assert_eq!(tun.read_batch(&mut bufs, &mut sizes, 0).unwrap(), 0);
    }

    #[test]
    fn short_write_is_an_error() {
        assert!(check_full_write(60, 60).is_ok());
        let err = check_full_write(40, 60).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert!(err.to_string().contains("40 of 60"));
    }

    #[test]
    fn metadata() {
        let (a, _b) = socket_pair();
        let tun = FdTun::new(a, "tun7", 1280);
        assert_eq!(tun.name().unwrap(), "tun7");
        assert_eq!(tun.mtu().unwrap(), 1280);
        assert_eq!(tun.batch_size(), 1);
    }
}
