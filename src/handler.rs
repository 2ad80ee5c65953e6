//! The RFC 2131 server-side state machine.
//!
//! One message in, at most one reply out. The handler is stateless between
//! messages; every error inside a message's lifecycle is caught here so no
//! datagram can affect the handling of another. The transport passes the
//! raw bytes plus the ingress identity and sends whatever comes back.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::config::{Config, SubnetConfig, sanitize_hostname};
use crate::engine::{AllocationRequest, LeaseEngine};
use crate::error::Error;
use crate::options::{DhcpOption, INFINITE_LEASE, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::security::SecurityValidator;
use crate::store::{Lease, LeaseFlavor};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// An encoded reply and where to send it.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub payload: Vec<u8>,
    pub destination: SocketAddr,
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub discover: AtomicU64,
    pub request: AtomicU64,
    pub decline: AtomicU64,
    pub release: AtomicU64,
    pub inform: AtomicU64,
    pub offers_sent: AtomicU64,
    pub acks_sent: AtomicU64,
    pub naks_sent: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub discover: u64,
    pub request: u64,
    pub decline: u64,
    pub release: u64,
    pub inform: u64,
    pub offers_sent: u64,
    pub acks_sent: u64,
    pub naks_sent: u64,
    pub dropped: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            discover: self.discover.load(Ordering::Relaxed),
            request: self.request.load(Ordering::Relaxed),
            decline: self.decline.load(Ordering::Relaxed),
            release: self.release.load(Ordering::Relaxed),
            inform: self.inform.load(Ordering::Relaxed),
            offers_sent: self.offers_sent.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            naks_sent: self.naks_sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct ProtocolHandler {
    config: Arc<Config>,
    engine: Arc<LeaseEngine>,
    security: Arc<SecurityValidator>,
    stats: ServerStats,
}

impl ProtocolHandler {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<LeaseEngine>,
        security: Arc<SecurityValidator>,
    ) -> Self {
        Self {
            config,
            engine,
            security,
            stats: ServerStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Handles one datagram received on the socket bound to `server_ip`
    /// over `iface`. Returns the reply to transmit, if any.
    pub async fn handle(
        &self,
        data: &[u8],
        src: SocketAddr,
        iface: &str,
        server_ip: Ipv4Addr,
    ) -> Option<Outbound> {
        let packet = match DhcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(error) => {
                info!("Dropping malformed datagram from {}: {}", src, error);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if packet.op != BOOTREQUEST {
            debug!("Dropping non-request op {} from {}", packet.op, src);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let message_type = packet.message_type()?;
        let mac = packet.mac();

        match message_type {
            MessageType::Discover => {
                self.stats.discover.fetch_add(1, Ordering::Relaxed);
            }
            MessageType::Request => {
                self.stats.request.fetch_add(1, Ordering::Relaxed);
            }
            MessageType::Decline => {
                self.stats.decline.fetch_add(1, Ordering::Relaxed);
            }
            MessageType::Release => {
                self.stats.release.fetch_add(1, Ordering::Relaxed);
            }
            MessageType::Inform => {
                self.stats.inform.fetch_add(1, Ordering::Relaxed);
            }
            MessageType::Offer | MessageType::Ack | MessageType::Nak => {
                // Server-class traffic is never consumed.
                warn!("Ignoring {} from {} on {}", message_type, src, iface);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        info!("{} from {} via {} ({})", message_type, mac, iface, src);

        if self.config.server.enable_security
            && let Err(denial) = self.security.validate(&packet, iface)
        {
            warn!("Dropping {} from {}: {}", message_type, mac, denial.reason);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match message_type {
            MessageType::Discover => self.handle_discover(&packet, server_ip).await,
            MessageType::Request => self.handle_request(&packet, server_ip).await,
            MessageType::Decline => {
                self.handle_decline(&packet).await;
                None
            }
            MessageType::Release => {
                self.handle_release(&packet).await;
                None
            }
            MessageType::Inform => self.handle_inform(&packet, server_ip).await,
            _ => unreachable!("server-class types returned above"),
        }
    }

    async fn handle_discover(&self, packet: &DhcpPacket, server_ip: Ipv4Addr) -> Option<Outbound> {
        let mac = packet.mac();
        let Some(subnet) = self.config.subnet_for(packet.giaddr, server_ip) else {
            warn!("No subnet serves DISCOVER from {} (giaddr {})", mac, packet.giaddr);
            return None;
        };

        let lease = match self.engine.allocate(self.allocation_for(packet, subnet)).await {
            Ok(lease) => lease,
            Err(Error::PoolExhausted(subnet_name)) => {
                warn!("No address to offer {} in {}", mac, subnet_name);
                return None;
            }
            Err(error) => {
                warn!("DISCOVER from {} failed: {}", mac, error);
                return None;
            }
        };

        let options = self.reply_options(subnet, &lease, packet, server_ip);
        let offer =
            DhcpPacket::create_reply(packet, MessageType::Offer, lease.ip, server_ip, options);

        info!("OFFER {} to {}", lease.ip, mac);
        self.stats.offers_sent.fetch_add(1, Ordering::Relaxed);
        self.transmit(&offer, packet)
    }

    async fn handle_request(&self, packet: &DhcpPacket, server_ip: Ipv4Addr) -> Option<Outbound> {
        let mac = packet.mac();

        // Selecting another server: stay silent and let it answer.
        if let Some(server_id) = packet.server_identifier()
            && server_id != server_ip
        {
            debug!("REQUEST from {} selects {}", mac, server_id);
            return None;
        }

        let requested_ip = packet.requested_ip().or_else(|| {
            (packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr)
        });
        let Some(requested_ip) = requested_ip else {
            warn!("REQUEST from {} names no address", mac);
            return self.send_nak(packet, server_ip, "no requested address");
        };

        // The requested address must fall in a scope this server owns.
        let subnet = self.config.subnet_containing(requested_ip).filter(|subnet| {
            subnet.in_range(requested_ip)
                || subnet
                    .reservation_for(mac)
                    .is_some_and(|reservation| reservation.ip == requested_ip)
        });
        let Some(subnet) = subnet else {
            return self.send_nak(packet, server_ip, "requested address out of scope");
        };

        let lease = match self.engine.renew(mac, requested_ip).await {
            Ok(lease) => lease,
            Err(Error::UnknownLease(_)) => {
                // REQUEST without a preceding OFFER from us; allocate fresh.
                match self.engine.allocate(self.allocation_for(packet, subnet)).await {
                    Ok(lease) if lease.ip == requested_ip => lease,
                    Ok(lease) => {
                        // A reservation redirected the client elsewhere.
                        debug!("{} must rebind from {} to {}", mac, requested_ip, lease.ip);
                        return self.send_nak(packet, server_ip, "address reassigned");
                    }
                    Err(error) => {
                        return self.send_nak(packet, server_ip, &error.to_string());
                    }
                }
            }
            Err(error) => {
                return self.send_nak(packet, server_ip, &error.to_string());
            }
        };

        let options = self.reply_options(subnet, &lease, packet, server_ip);
        let ack = DhcpPacket::create_reply(packet, MessageType::Ack, lease.ip, server_ip, options);

        info!(
            "ACK {} to {} ({}s remaining)",
            lease.ip,
            mac,
            lease.remaining_seconds()
        );
        self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
        self.transmit(&ack, packet)
    }

    async fn handle_decline(&self, packet: &DhcpPacket) {
        let mac = packet.mac();
        let Some(declined_ip) = packet.requested_ip() else {
            warn!("DECLINE from {} names no address", mac);
            return;
        };
        self.engine.decline(mac, declined_ip).await;
    }

    async fn handle_release(&self, packet: &DhcpPacket) {
        let mac = packet.mac();
        if packet.ciaddr == Ipv4Addr::UNSPECIFIED {
            warn!("RELEASE from {} with no ciaddr", mac);
            return;
        }

        // Only the address the client actually holds can be released.
        let held = self.engine.get_by_mac(mac).await;
        match held {
            Some(lease) if lease.ip == packet.ciaddr => {
                self.engine.release(mac).await;
            }
            Some(lease) => {
                warn!(
                    "RELEASE from {} for {} does not match its lease at {}",
                    mac, packet.ciaddr, lease.ip
                );
            }
            None => {
                debug!("RELEASE from {} with no lease", mac);
            }
        }
    }

    async fn handle_inform(&self, packet: &DhcpPacket, server_ip: Ipv4Addr) -> Option<Outbound> {
        let mac = packet.mac();
        let subnet = self.config.subnet_for(packet.giaddr, server_ip)?;

        // Configuration only: no yiaddr, no lease or timer options.
        let mut options = vec![
            DhcpOption::ServerIdentifier(server_ip),
            DhcpOption::SubnetMask(subnet.subnet_mask()),
        ];
        self.push_subnet_echo(&mut options, subnet);
        if let Some(relay_info) = packet.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        let ack = DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            server_ip,
            options,
        );

        info!("INFORM answered for {}", mac);
        self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
        self.transmit(&ack, packet)
    }

    fn send_nak(&self, packet: &DhcpPacket, server_ip: Ipv4Addr, reason: &str) -> Option<Outbound> {
        let mut options = vec![DhcpOption::ServerIdentifier(server_ip)];
        if let Some(relay_info) = packet.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        let nak = DhcpPacket::create_reply(
            packet,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            server_ip,
            options,
        );

        warn!("NAK to {}: {}", packet.mac(), reason);
        self.stats.naks_sent.fetch_add(1, Ordering::Relaxed);
        self.transmit(&nak, packet)
    }

    fn allocation_for(&self, packet: &DhcpPacket, subnet: &SubnetConfig) -> AllocationRequest {
        AllocationRequest {
            mac: packet.mac(),
            requested_ip: packet.requested_ip(),
            subnet_name: subnet.name.clone(),
            client_id: packet.client_identifier().map(hex::encode),
            hostname: packet.hostname().map(sanitize_hostname),
            vendor_class: packet
                .vendor_class()
                .map(|data| String::from_utf8_lossy(data).to_string()),
        }
    }

    /// The OFFER/ACK option set: identity, timers, subnet shape, then the
    /// config-pinned echo options and a verbatim option-82 echo.
    fn reply_options(
        &self,
        subnet: &SubnetConfig,
        lease: &Lease,
        packet: &DhcpPacket,
        server_ip: Ipv4Addr,
    ) -> Vec<DhcpOption> {
        let mut options = vec![DhcpOption::ServerIdentifier(server_ip)];

        if lease.flavor == LeaseFlavor::Static {
            options.push(DhcpOption::LeaseTime(INFINITE_LEASE));
        } else {
            let lease_time = lease.lease_time;
            options.push(DhcpOption::LeaseTime(lease_time));
            options.push(DhcpOption::RenewalTime(lease_time / 2));
            options.push(DhcpOption::RebindingTime(lease_time * 7 / 8));
        }

        options.push(DhcpOption::SubnetMask(subnet.subnet_mask()));
        self.push_subnet_echo(&mut options, subnet);

        for pinned in &lease.pinned_options {
            options.push(pinned.clone());
        }

        if let Some(relay_info) = packet.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInfo(relay_info.to_vec()));
        }

        options
    }

    fn push_subnet_echo(&self, options: &mut Vec<DhcpOption>, subnet: &SubnetConfig) {
        if let Some(gateway) = subnet.gateway {
            options.push(DhcpOption::Router(vec![gateway]));
        }
        if !subnet.dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(subnet.dns_servers.clone()));
        }
        if let Some(ref domain) = subnet.domain_name {
            options.push(DhcpOption::DomainName(domain.clone()));
        }
    }

    /// RFC 2131 §4.1 reply routing: relay first, then broadcast for
    /// clients without an address, then unicast.
    fn transmit(&self, reply: &DhcpPacket, request: &DhcpPacket) -> Option<Outbound> {
        let payload = match reply.encode() {
            Ok(payload) => payload,
            Err(error) => {
                // An unencodable reply is an internal bug, not a client one.
                tracing::error!("Failed to encode reply: {}", error);
                return None;
            }
        };

        let destination = if request.giaddr != Ipv4Addr::UNSPECIFIED {
            SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
        } else if request.is_broadcast() || request.ciaddr == Ipv4Addr::UNSPECIFIED {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
        } else {
            SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
        };

        Some(Outbound {
            payload,
            destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictStrategy, SecurityConfig, ServerConfig};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                listen_addresses: vec!["10.0.0.1".to_string()],
                max_leases: 10_000,
                enable_logging: true,
                enable_security: true,
                lease_file: std::path::PathBuf::from("test_handler.leases"),
                log_file: None,
                conflict_strategy: ConflictStrategy::Reject,
                decline_cooldown_secs: 300,
                reaper_interval_secs: 60,
                autosave_interval_secs: 60,
            },
            subnets: vec![SubnetConfig {
                name: "lan".to_string(),
                network: Ipv4Addr::new(10, 0, 0, 0),
                prefix_length: 24,
                range_start: Ipv4Addr::new(10, 0, 0, 100),
                range_end: Ipv4Addr::new(10, 0, 0, 200),
                gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
                domain_name: None,
                dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
                lease_time: 3600,
                max_lease_time: 7200,
                options: Vec::new(),
                reservations: Vec::new(),
                exclusions: Vec::new(),
            }],
            global_options: Vec::new(),
            security: SecurityConfig::default(),
        })
    }

    async fn test_handler() -> ProtocolHandler {
        let config = test_config();
        let engine = Arc::new(LeaseEngine::new(Arc::clone(&config)).await.unwrap());
        let security = Arc::new(SecurityValidator::new(&config.security));
        ProtocolHandler::new(config, engine, security)
    }

    fn request_packet(msg_type: MessageType) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        DhcpPacket {
            op: BOOTREQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0x12345678,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::MessageType(msg_type)],
        }
    }

    fn src() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 68)
    }

    #[tokio::test]
    async fn test_broadcast_routing_for_fresh_client() {
        let handler = test_handler().await;
        let discover = request_packet(MessageType::Discover).encode().unwrap();

        let outbound = handler
            .handle(&discover, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap();
        assert_eq!(
            outbound.destination,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
        );
    }

    #[tokio::test]
    async fn test_relay_routing() {
        let handler = test_handler().await;
        let mut packet = request_packet(MessageType::Discover);
        packet.giaddr = Ipv4Addr::new(10, 0, 0, 254);
        let data = packet.encode().unwrap();

        let outbound = handler
            .handle(&data, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap();
        assert_eq!(
            outbound.destination,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254)), DHCP_SERVER_PORT)
        );
    }

    #[tokio::test]
    async fn test_unicast_routing_for_renewal() {
        let handler = test_handler().await;

        // Acquire an address first.
        let discover = request_packet(MessageType::Discover).encode().unwrap();
        handler
            .handle(&discover, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap();

        let mut renew = request_packet(MessageType::Request);
        renew.flags = 0;
        renew.ciaddr = Ipv4Addr::new(10, 0, 0, 100);
        let data = renew.encode().unwrap();

        let outbound = handler
            .handle(&data, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap();
        assert_eq!(
            outbound.destination,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100)), DHCP_CLIENT_PORT)
        );
        let reply = DhcpPacket::parse(&outbound.payload).unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Ack));
    }

    #[tokio::test]
    async fn test_server_class_messages_are_dropped() {
        let handler = test_handler().await;
        let mut offer = request_packet(MessageType::Offer);
        offer.op = BOOTREQUEST;
        let data = offer.encode().unwrap();

        assert!(handler
            .handle(&data, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .is_none());
        assert_eq!(handler.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let handler = test_handler().await;
        assert!(handler
            .handle(&[0u8; 64], src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .is_none());
        assert_eq!(handler.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_request_selecting_other_server_is_silent() {
        let handler = test_handler().await;
        let mut packet = request_packet(MessageType::Request);
        packet
            .options
            .push(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 99)));
        packet
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100)));
        let data = packet.encode().unwrap();

        assert!(handler
            .handle(&data, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await
            .is_none());
        assert_eq!(handler.stats().naks_sent, 0);
    }

    #[tokio::test]
    async fn test_stats_count_by_type() {
        let handler = test_handler().await;
        let discover = request_packet(MessageType::Discover).encode().unwrap();

        handler
            .handle(&discover, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await;
        handler
            .handle(&discover, src(), "eth0", Ipv4Addr::new(10, 0, 0, 1))
            .await;

        let stats = handler.stats();
        assert_eq!(stats.discover, 2);
        assert_eq!(stats.offers_sent, 2);
    }
}
