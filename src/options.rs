use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    HostName = 12,
    DomainName = 15,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    MaxMessageSize = 57,
    RenewalTime = 58,
    RebindingTime = 59,
    VendorClassIdentifier = 60,
    ClientIdentifier = 61,
    RelayAgentInfo = 82,
    Authentication = 90,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::HostName),
            15 => Ok(Self::DomainName),
            26 => Ok(Self::InterfaceMtu),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            57 => Ok(Self::MaxMessageSize),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            60 => Ok(Self::VendorClassIdentifier),
            61 => Ok(Self::ClientIdentifier),
            82 => Ok(Self::RelayAgentInfo),
            90 => Ok(Self::Authentication),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// Lease time wire value meaning "never expires" (static reservations).
pub const INFINITE_LEASE: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    HostName(String),
    DomainName(String),
    InterfaceMtu(u16),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    OptionOverload(u8),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    MaxMessageSize(u16),
    RenewalTime(u32),
    RebindingTime(u32),
    VendorClassIdentifier(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    RelayAgentInfo(Vec<u8>),
    Authentication(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

fn parse_ip(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::MalformedHeader(format!(
            "invalid {} option length {}",
            what,
            data.len()
        )));
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn parse_ip_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.len() % 4 != 0 || data.is_empty() {
        return Err(Error::MalformedHeader(format!(
            "invalid {} option length {}",
            what,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_u32(data: &[u8], what: &str) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::MalformedHeader(format!(
            "invalid {} option length {}",
            what,
            data.len()
        )));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

fn parse_u16(data: &[u8], what: &str) -> Result<u16> {
    if data.len() != 2 {
        return Err(Error::MalformedHeader(format!(
            "invalid {} option length {}",
            what,
            data.len()
        )));
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

impl DhcpOption {
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(parse_ip(data, "subnet mask")?)),
            Ok(OptionCode::Router) => Ok(Self::Router(parse_ip_list(data, "router")?)),
            Ok(OptionCode::DnsServer) => Ok(Self::DnsServer(parse_ip_list(data, "DNS server")?)),
            Ok(OptionCode::HostName) => {
                Ok(Self::HostName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::DomainName) => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::InterfaceMtu) => Ok(Self::InterfaceMtu(parse_u16(data, "MTU")?)),
            Ok(OptionCode::BroadcastAddress) => {
                Ok(Self::BroadcastAddress(parse_ip(data, "broadcast address")?))
            }
            Ok(OptionCode::RequestedIpAddress) => {
                Ok(Self::RequestedIpAddress(parse_ip(data, "requested IP")?))
            }
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(parse_u32(data, "lease time")?)),
            Ok(OptionCode::OptionOverload) => {
                if data.len() != 1 || data[0] == 0 || data[0] > 3 {
                    return Err(Error::MalformedHeader(
                        "invalid option overload value".to_string(),
                    ));
                }
                Ok(Self::OptionOverload(data[0]))
            }
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::MissingMessageType);
                }
                let msg_type = MessageType::try_from(data[0]).map_err(|_| Error::MissingMessageType)?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(parse_ip(data, "server identifier")?))
            }
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::MaxMessageSize) => {
                Ok(Self::MaxMessageSize(parse_u16(data, "max message size")?))
            }
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(parse_u32(data, "renewal time")?)),
            Ok(OptionCode::RebindingTime) => {
                Ok(Self::RebindingTime(parse_u32(data, "rebinding time")?))
            }
            Ok(OptionCode::VendorClassIdentifier) => {
                Ok(Self::VendorClassIdentifier(data.to_vec()))
            }
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::RelayAgentInfo) => Ok(Self::RelayAgentInfo(data.to_vec())),
            Ok(OptionCode::Authentication) => Ok(Self::Authentication(data.to_vec())),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::MalformedHeader(
                "PAD/END must not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    /// The wire code this option encodes as.
    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::HostName(_) => OptionCode::HostName as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::OptionOverload(_) => OptionCode::OptionOverload as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::MaxMessageSize(_) => OptionCode::MaxMessageSize as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::VendorClassIdentifier(_) => OptionCode::VendorClassIdentifier as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::RelayAgentInfo(_) => OptionCode::RelayAgentInfo as u8,
            Self::Authentication(_) => OptionCode::Authentication as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => addr.octets().to_vec(),
            Self::Router(addrs) | Self::DnsServer(addrs) => {
                addrs.iter().flat_map(|addr| addr.octets()).collect()
            }
            Self::HostName(text) | Self::DomainName(text) => text.as_bytes().to_vec(),
            Self::InterfaceMtu(value) | Self::MaxMessageSize(value) => value.to_be_bytes().to_vec(),
            Self::LeaseTime(value) | Self::RenewalTime(value) | Self::RebindingTime(value) => {
                value.to_be_bytes().to_vec()
            }
            Self::OptionOverload(flag) => vec![*flag],
            Self::MessageType(msg_type) => vec![*msg_type as u8],
            Self::ParameterRequestList(data)
            | Self::VendorClassIdentifier(data)
            | Self::ClientIdentifier(data)
            | Self::RelayAgentInfo(data)
            | Self::Authentication(data)
            | Self::Unknown(_, data) => data.clone(),
        }
    }

    /// Encodes as `code, len, data`.
    ///
    /// Fails when the payload exceeds the single-option bound of 255 bytes;
    /// RFC 3396 concatenation is deliberately never emitted.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload();
        if payload.len() > 255 {
            return Err(Error::Encode(format!(
                "option {} payload is {} bytes, limit is 255",
                self.code(),
                payload.len()
            )));
        }
        let mut encoded = Vec::with_capacity(payload.len() + 2);
        encoded.push(self.code());
        encoded.push(payload.len() as u8);
        encoded.extend_from_slice(&payload);
        Ok(encoded)
    }

    /// Encoded length including the code and length bytes.
    pub fn encoded_len(&self) -> usize {
        self.payload().len() + 2
    }
}

/// Splits an option-82 payload into its (sub-option code, data) pairs.
///
/// Returns None when the sub-option TLV stream is malformed.
pub fn relay_sub_options(data: &[u8]) -> Option<Vec<(u8, Vec<u8>)>> {
    let mut sub_options = Vec::new();
    let mut index = 0;
    while index < data.len() {
        let code = data[index];
        let length = *data.get(index + 1)? as usize;
        let value = data.get(index + 2..index + 2 + length)?;
        sub_options.push((code, value.to_vec()));
        index += 2 + length;
    }
    Some(sub_options)
}

pub const RELAY_SUB_CIRCUIT_ID: u8 = 1;
pub const RELAY_SUB_REMOTE_ID: u8 = 2;
