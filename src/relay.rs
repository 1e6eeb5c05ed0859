// Moves packets between the guarded tunnel and the host side.
//
// Inbound, the guard is the source: its read path zeroes the slots of denied
// packets and only the surviving ones reach the peer. Outbound, the guard is
// the sink: its write path inspects DNS before forwarding to the tunnel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::GuardError;
use crate::tun::TunDevice;

/// Reusable batch buffers for one direction.
pub struct Pump {
    bufs: Vec<Vec<u8>>,
    sizes: Vec<usize>,
}

impl Pump {
    pub fn new(slots: usize, mtu: usize) -> Self {
        let slots = slots.max(1);
        Self {
            bufs: vec![vec![0u8; mtu]; slots],
            sizes: vec![0; slots],
        }
    }

    /// Read one batch from `from` and write its non-empty slots to `to`.
    /// Returns the number of packets forwarded.
    pub fn pump<F, T>(&mut self, from: &F, to: &T) -> io::Result<usize>
    where
        F: TunDevice + ?Sized,
        T: TunDevice + ?Sized,
    {
        self.sizes.fill(0);
        let n = from.read_batch(&mut self.bufs, &mut self.sizes, 0)?;
        let n = n.min(self.bufs.len());

        let out: Vec<Vec<u8>> = self.bufs[..n]
            .iter()
            .zip(&self.sizes[..n])
            .filter(|&(_, &size)| size > 0)
            .map(|(buf, &size)| buf[..size.min(buf.len())].to_vec())
            .collect();
        if out.is_empty() {
            return Ok(0);
        }
        to.write_batch(&out, 0)
    }
}

/// Pump `from` into `to` until `stop` is set. A device error stops both
/// directions: it sets `stop` before returning.
pub fn run_until<F, T>(
    label: &str,
    from: &F,
    to: &T,
    mtu: usize,
    stop: &AtomicBool,
) -> Result<(), GuardError>
where
    F: TunDevice + ?Sized,
    T: TunDevice + ?Sized,
{
    let mut pump = Pump::new(from.batch_size(), mtu);
    let mut forwarded = 0u64;
    while !stop.load(Ordering::Relaxed) {
        match pump.pump(from, to) {
            Ok(n) => forwarded += n as u64,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("{label} relay stopped after {forwarded} packets: {e}");
                stop.store(true, Ordering::Relaxed);
                return Err(GuardError::DeviceIo(e));
            }
        }
    }
    log::debug!("{label} relay done, {forwarded} packets");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::*;
    use crate::guard::GuardedTun;
    use crate::packet::test_packets::PacketBuilder;
    use crate::tun::memory::MemoryTun;
    use std::sync::Arc;

    #[test]
    fn forwards_only_surviving_slots() {
        let tun = MemoryTun::new("tun0", 1500, 8);
        let udp = PacketBuilder::udp().ports(1000, 2000).build();
        tun.push_inbound(udp.clone());
        tun.push_inbound(PacketBuilder::tcp().build());
        let guard = GuardedTun::new(tun)
            .with_admission(Arc::new(FixedAdmission::new(false)))
            .with_diagnostics(Arc::new(CapturedDiag::default()));
        let peer = MemoryTun::new("peer", 1500, 8);

        let mut pump = Pump::new(guard.batch_size(), 1500);
        assert_eq!(pump.pump(&guard, &peer).unwrap(), 1);
        assert_eq!(peer.take_written(), vec![udp]);
        // Nothing left: no write at all.
        assert_eq!(pump.pump(&guard, &peer).unwrap(), 0);
        assert!(peer.take_written().is_empty());
    }

    #[test]
    fn stops_on_device_error() {
        let from = MemoryTun::new("a", 1500, 4);
        from.push_inbound(PacketBuilder::udp().build());
        let to = MemoryTun::new("b", 1500, 4);
        to.set_write_error(Some(io::ErrorKind::BrokenPipe));
        let stop = AtomicBool::new(false);

        let err = run_until("test", &from, &to, 1500, &stop).unwrap_err();
        assert!(matches!(err, GuardError::DeviceIo(_)));
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn returns_once_stopped() {
        let from = MemoryTun::new("a", 1500, 4);
        let to = MemoryTun::new("b", 1500, 4);
        let stop = AtomicBool::new(true);
        run_until("test", &from, &to, 1500, &stop).unwrap();
    }
}
