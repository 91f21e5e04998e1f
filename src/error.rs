use thiserror::Error;

#[derive(Debug, Error)]
pub enum CilscopeError {
    #[error("pcap read error: {0}")]
    PcapError(String),

    #[error("unsupported link type: {0}")]
    UnsupportedLinkType(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CilscopeError>;
