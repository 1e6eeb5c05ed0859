// Tunnel device interface.
//
// A device exchanges whole IP packets in batches. Every buffer in a batch
// carries its packet starting at a shared `offset`; the bytes before it are
// headroom owned by the caller.

#[cfg(unix)]
pub mod fd;
pub mod memory;

use std::io;

use crossbeam_channel::Receiver;

/// Lifecycle notifications from a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    Up,
    Down,
    MtuUpdate(usize),
}

pub trait TunDevice: Send + Sync {
    /// Name of the interface behind the device.
    fn name(&self) -> io::Result<String>;

    fn mtu(&self) -> io::Result<usize>;

    /// Lifecycle events. Every call returns a receiver on the same stream.
    fn events(&self) -> Receiver<TunEvent>;

    /// Largest number of packets a single batch call moves.
    fn batch_size(&self) -> usize;

    /// Fill up to `bufs.len()` slots. On return `sizes[i]` is the length of
    /// the packet at `bufs[i][offset..]` for every `i < n`.
    fn read_batch(&self, bufs: &mut [Vec<u8>], sizes: &mut [usize], offset: usize)
    -> io::Result<usize>;

    /// Write every packet `bufs[i][offset..]`. Returns how many were written.
    fn write_batch(&self, bufs: &[Vec<u8>], offset: usize) -> io::Result<usize>;

    fn close(&self) -> io::Result<()>;
}

impl<T: TunDevice + ?Sized> TunDevice for std::sync::Arc<T> {
    fn name(&self) -> io::Result<String> {
        (**self).name()
    }

    fn mtu(&self) -> io::Result<usize> {
        (**self).mtu()
    }

    fn events(&self) -> Receiver<TunEvent> {
        (**self).events()
    }

    fn batch_size(&self) -> usize {
        (**self).batch_size()
    }

    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        offset: usize,
    ) -> io::Result<usize> {
        (**self).read_batch(bufs, sizes, offset)
    }

    fn write_batch(&self, bufs: &[Vec<u8>], offset: usize) -> io::Result<usize> {
        (**self).write_batch(bufs, offset)
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

/// Error returned by every operation on a closed device.
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tunnel device closed")
}
