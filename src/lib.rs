//! Packet filtering shim for tunnel devices.
//!
//! [`guard::GuardedTun`] wraps a [`tun::TunDevice`]: packets read from the
//! device are admission-checked (TCP only) and dropped by zeroing their
//! batch size, packets written to it are inspected for DNS malware markers
//! and always forwarded.

pub mod classify;
pub mod cli;
pub mod config;
pub mod diag;
pub mod dns;
pub mod error;
pub mod filter;
pub mod guard;
pub mod oracle;
pub mod output;
pub mod packet;
pub mod pcap;
pub mod recorder;
pub mod relay;
pub mod replay;
pub mod tls;
pub mod tun;
