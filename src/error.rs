use std::net::Ipv4Addr;

use crate::mac::MacAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed DHCP header: {0}")]
    MalformedHeader(String),

    #[error("Missing DHCP magic cookie")]
    MissingCookie,

    #[error("Option {0} runs past the end of the buffer")]
    TruncatedOption(u8),

    #[error("Missing or invalid DHCP message type option")]
    MissingMessageType,

    #[error("Cannot encode packet: {0}")]
    Encode(String),

    #[error("No available IP addresses in subnet {0}")]
    PoolExhausted(String),

    #[error("MAC address {0} already holds an active lease")]
    ConflictMac(MacAddr),

    #[error("Address {0} is already leased")]
    ConflictIp(Ipv4Addr),

    #[error("Address {ip} conflicts with the active lease held by {holder}")]
    Conflict { ip: Ipv4Addr, holder: MacAddr },

    #[error("No active lease for {0}")]
    UnknownLease(MacAddr),

    #[error("Address {0} is outside every configured range")]
    AddressOutOfRange(Ipv4Addr),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket error: {0}")]
    Socket(String),
}

pub type Result<T> = std::result::Result<T, Error>;
