#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("malformed {layer}: need {needed} bytes, have {available}")]
    MalformedPacket {
        layer: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("tunnel device error: {0}")]
    DeviceIo(#[source] std::io::Error),
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),
    #[error("DNS parse error at offset {offset}: {detail}")]
    DnsParse { offset: usize, detail: String },
    #[error("TLS parse error at offset {offset}: {detail}")]
    TlsParse { offset: usize, detail: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("pcap error: {0}")]
    Pcap(String),
    #[error("serialization error: {0}")]
    Serialization(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GuardError {
    pub(crate) fn malformed(layer: &'static str, needed: usize, available: usize) -> Self {
        Self::MalformedPacket {
            layer,
            needed,
            available,
        }
    }

    /// True for parse failures that the pipeline resolves locally.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPacket { .. })
    }
}
