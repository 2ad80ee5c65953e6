use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::options::{DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Fixed BOOTP header plus magic cookie.
pub const FIXED_HEADER_LEN: usize = 240;
/// Minimum datagram a BOOTP client must accept.
pub const MIN_PACKET_LEN: usize = 300;
/// Default maximum DHCP message a client must accept (RFC 2131), minus the
/// 28 bytes of IP and UDP headers that option 57 counts.
const DEFAULT_MAX_PAYLOAD: usize = 576 - 28;
const IP_UDP_OVERHEAD: usize = 28;
/// Relay chains do not legitimately exceed the RFC 1542 hop bound.
const MAX_HOPS: u8 = 16;

/// Options the encoder must never drop when trimming an oversized reply.
const REQUIRED_OPTION_CODES: [u8; 3] = [
    OptionCode::MessageType as u8,
    OptionCode::ServerIdentifier as u8,
    OptionCode::LeaseTime as u8,
];

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// Options in wire order, overload regions appended after the main
    /// stream (file first, then sname).
    pub options: Vec<DhcpOption>,
}

fn ip_from_wire(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

impl DhcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(Error::MalformedHeader(format!(
                "packet too short: {} bytes (minimum {})",
                data.len(),
                FIXED_HEADER_LEN
            )));
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];

        if op != BOOTREQUEST && op != BOOTREPLY {
            return Err(Error::MalformedHeader(format!("invalid op {}", op)));
        }
        if htype != HTYPE_ETHERNET {
            return Err(Error::MalformedHeader(format!(
                "unsupported htype {}",
                htype
            )));
        }
        if hlen != HLEN_ETHERNET {
            return Err(Error::MalformedHeader(format!(
                "unsupported hlen {}",
                hlen
            )));
        }
        if hops > MAX_HOPS {
            return Err(Error::MalformedHeader(format!("excessive hops {}", hops)));
        }

        if data[236..240] != DHCP_MAGIC_COOKIE {
            return Err(Error::MissingCookie);
        }

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = ip_from_wire(&data[12..16]);
        let yiaddr = ip_from_wire(&data[16..20]);
        let siaddr = ip_from_wire(&data[20..24]);
        let giaddr = ip_from_wire(&data[24..28]);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);

        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let mut options = Self::parse_options(&data[240..])?;

        // Option 52 overload: the file and/or sname regions carry further
        // options. Parsed on input, never produced on output.
        let overload = options.iter().find_map(|option| match option {
            DhcpOption::OptionOverload(flag) => Some(*flag),
            _ => None,
        });
        if let Some(flag) = overload {
            if flag & 1 != 0 {
                options.extend(Self::parse_options(&file)?);
            }
            if flag & 2 != 0 {
                options.extend(Self::parse_options(&sname)?);
            }
            // The overload marker is consumed here and never re-emitted.
            options.retain(|option| !matches!(option, DhcpOption::OptionOverload(_)));
        }

        let type_count = options
            .iter()
            .filter(|option| matches!(option, DhcpOption::MessageType(_)))
            .count();
        if type_count != 1 {
            return Err(Error::MissingMessageType);
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(Error::TruncatedOption(code));
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                return Err(Error::TruncatedOption(code));
            }

            let option_data = &data[index + 2..index + 2 + length];
            options.push(DhcpOption::parse(code, option_data)?);

            index += 2 + length;
        }

        Ok(options)
    }

    /// Encodes the packet, honoring the client-advertised message size.
    ///
    /// Option 53 is emitted first and END last. When the options stream
    /// would overflow the size budget, echo-only options are dropped from
    /// the tail; options 53, 54 and 51 are never dropped. The result is
    /// padded to the 300-byte BOOTP minimum.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.op != BOOTREQUEST && self.op != BOOTREPLY {
            return Err(Error::Encode(format!("invalid op {}", self.op)));
        }

        let message_type: Vec<&DhcpOption> = self
            .options
            .iter()
            .filter(|option| matches!(option, DhcpOption::MessageType(_)))
            .collect();
        if message_type.len() != 1 {
            return Err(Error::Encode(format!(
                "expected exactly one message type option, found {}",
                message_type.len()
            )));
        }

        let budget = self.options_budget();
        let mut rest: Vec<&DhcpOption> = self
            .options
            .iter()
            .filter(|option| !matches!(option, DhcpOption::MessageType(_)))
            .collect();

        // END plus the leading message type option.
        let fixed_cost = 1 + message_type[0].encoded_len();
        let mut used: usize = fixed_cost + rest.iter().map(|o| o.encoded_len()).sum::<usize>();

        while used > budget {
            let victim = rest
                .iter()
                .rposition(|option| !REQUIRED_OPTION_CODES.contains(&option.code()));
            match victim {
                Some(position) => {
                    used -= rest[position].encoded_len();
                    rest.remove(position);
                }
                None => {
                    return Err(Error::Encode(format!(
                        "required options exceed the {}-byte options budget",
                        budget
                    )));
                }
            }
        }

        let mut packet = Vec::with_capacity(FIXED_HEADER_LEN + used);

        packet.push(self.op);
        packet.push(self.htype);
        packet.push(self.hlen);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        packet.extend_from_slice(&message_type[0].encode()?);
        for option in rest {
            packet.extend_from_slice(&option.encode()?);
        }
        packet.push(OptionCode::End as u8);

        while packet.len() < MIN_PACKET_LEN {
            packet.push(0);
        }

        Ok(packet)
    }

    /// Bytes available for the options stream, from the client's option 57
    /// hint (floored at the RFC default of 576) or the default budget.
    fn options_budget(&self) -> usize {
        let max_payload = match self.max_message_size() {
            Some(advertised) => (advertised as usize).max(576) - IP_UDP_OVERHEAD,
            None => DEFAULT_MAX_PAYLOAD,
        };
        max_payload - FIXED_HEADER_LEN
    }

    /// First option carrying the given wire code.
    pub fn find(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|option| option.code() == code)
    }

    /// All options carrying the given wire code, in wire order.
    pub fn find_all(&self, code: u8) -> Vec<&DhcpOption> {
        self.options
            .iter()
            .filter(|option| option.code() == code)
            .collect()
    }

    /// Replaces the first option with the same code, or appends.
    pub fn insert_or_replace(&mut self, option: DhcpOption) {
        match self
            .options
            .iter_mut()
            .find(|existing| existing.code() == option.code())
        {
            Some(slot) => *slot = option,
            None => self.options.push(option),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(msg_type) => Some(*msg_type),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn hostname(&self) -> Option<&str> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::HostName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn vendor_class(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::VendorClassIdentifier(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn relay_agent_info(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RelayAgentInfo(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn authentication(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::Authentication(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn max_message_size(&self) -> Option<u16> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MaxMessageSize(size) => Some(*size),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ParameterRequestList(params) => Some(params.as_slice()),
            _ => None,
        })
    }

    pub fn mac(&self) -> MacAddr {
        MacAddr::from_chaddr(&self.chaddr)
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    /// Builds a BOOTREPLY skeleton echoing the request's xid, flags,
    /// chaddr and giaddr, with the message type option placed first.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: all_options,
        }
    }
}
