use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::GuardConfig;

#[derive(Parser, Debug)]
#[command(
    name = "tunguard",
    version,
    about = "TCP admission and DNS malware inspection for tunnel devices"
)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Push a pcap capture through the filters and report what they did
    Replay(ReplayArgs),
    /// Relay between an open tunnel descriptor and a host-side descriptor
    /// through the filters until interrupted
    Attach(AttachArgs),
}

/// Policy overrides shared by every mode. Each one replaces the matching
/// configuration file value when given.
#[derive(Args, Debug, Clone, Default)]
pub struct PolicyArgs {
    /// Deny TCP to this destination port (repeatable)
    #[arg(long = "block-port")]
    pub block_ports: Vec<u16>,

    /// Deny TCP to this destination IPv4 address (repeatable)
    #[arg(long = "block-addr")]
    pub block_addrs: Vec<Ipv4Addr>,

    /// Deny TLS connections whose ClientHello names this domain or a
    /// subdomain of it (repeatable)
    #[arg(long = "block-domain")]
    pub block_domains: Vec<String>,

    /// TXT text that marks a DNS malware block
    #[arg(long)]
    pub marker: Option<String>,

    /// Give up on an oracle after this many milliseconds and fail open
    #[arg(long, value_parser = validate_timeout)]
    pub oracle_timeout_ms: Option<u64>,

    /// Prefix of the diagnostic log targets
    #[arg(long)]
    pub log_tag: Option<String>,

    /// Write forwarded packets to this pcap file
    #[arg(long)]
    pub pcap_out: Option<PathBuf>,
}

impl PolicyArgs {
    /// Fold these overrides into `config`.
    pub fn apply(&self, config: &mut GuardConfig) {
        if !self.block_ports.is_empty() {
            config.admission.blocked_ports = self.block_ports.clone();
        }
        if !self.block_addrs.is_empty() {
            config.admission.blocked_addresses = self.block_addrs.clone();
        }
        if !self.block_domains.is_empty() {
            config.admission.blocked_domains = self.block_domains.clone();
        }
        if let Some(marker) = &self.marker {
            config.dns.marker = marker.clone();
        }
        if let Some(ms) = self.oracle_timeout_ms {
            config.oracle_timeout_ms = Some(ms);
        }
        if let Some(tag) = &self.log_tag {
            config.log_tag = tag.clone();
        }
        if let Some(path) = &self.pcap_out {
            config.pcap_path = Some(path.clone());
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    /// Capture to replay (legacy pcap; raw, IPv4 or Ethernet link type)
    pub pcap: PathBuf,

    /// Which path the captured packets take through the guard
    #[arg(long, default_value = "both")]
    pub direction: ReplayDirection,

    /// Output format [default: tsv]
    #[arg(long, default_value = "tsv")]
    pub format: OutputFormat,

    /// Packets per batch [default: 32]
    #[arg(long, default_value_t = 32, value_parser = validate_batch)]
    pub batch: usize,

    /// Headroom before each packet in the batch buffers [default: 0]
    #[arg(long, default_value_t = 0, value_parser = validate_offset)]
    pub offset: usize,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(Args, Debug, Clone)]
pub struct AttachArgs {
    /// Open tunnel file descriptor inherited from the parent process
    #[arg(long, value_parser = validate_fd)]
    pub fd: i32,

    /// Open packet descriptor towards the host stack (one packet per
    /// read/write, e.g. a datagram socket)
    #[arg(long, value_parser = validate_fd)]
    pub peer_fd: i32,

    /// Interface name to report for the descriptor
    #[arg(long, default_value = "tun0")]
    pub name: String,

    /// Interface MTU [default: 1500]
    #[arg(long, default_value_t = 1500, value_parser = validate_mtu)]
    pub mtu: usize,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Tsv,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    /// Device to stack: TCP admission
    Inbound,
    /// Stack to device: DNS inspection
    Outbound,
    /// Inbound pass, then outbound pass
    Both,
}

impl ReplayDirection {
    pub fn inbound(self) -> bool {
        matches!(self, Self::Inbound | Self::Both)
    }

    pub fn outbound(self) -> bool {
        matches!(self, Self::Outbound | Self::Both)
    }
}

fn validate_timeout(s: &str) -> Result<u64, String> {
    let val: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("oracle-timeout-ms must be at least 1".to_string())
    } else if val > 60_000 {
        Err("oracle-timeout-ms must be at most 60000".to_string())
    } else {
        Ok(val)
    }
}

fn validate_batch(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("batch must be at least 1".to_string())
    } else if val > 1024 {
        Err("batch must be at most 1024".to_string())
    } else {
        Ok(val)
    }
}

fn validate_offset(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val > 4096 {
        Err("offset must be at most 4096".to_string())
    } else {
        Ok(val)
    }
}

fn validate_fd(s: &str) -> Result<i32, String> {
    let val: i32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid file descriptor"))?;
    if val < 0 {
        Err("fd must not be negative".to_string())
    } else {
        Ok(val)
    }
}

fn validate_mtu(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val < 576 {
        Err("mtu must be at least 576".to_string())
    } else if val > 65535 {
        Err("mtu must be at most 65535".to_string())
    } else {
        Ok(val)
    }
}
