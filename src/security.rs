//! The security gate in front of the lease engine.
//!
//! Checks run in a fixed short-circuit order: snooping, MAC filter, IP
//! filter, rate limit, Option 82, client authentication. Every denial
//! emits a [`SecurityEvent`] into a bounded ring; a consumer callback may
//! be registered for streaming. All tables sit behind plain mutexes with
//! no I/O or awaits under lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::{IdentifierType, SecurityConfig};
use crate::mac::MacAddr;
use crate::options::{MessageType, RELAY_SUB_CIRCUIT_ID, RELAY_SUB_REMOTE_ID, relay_sub_options};
use crate::packet::DhcpPacket;

type HmacSha256 = Hmac<Sha256>;

/// Event ring capacity.
const EVENT_CAP: usize = 1000;
/// Trackers with no activity for this long are dropped by cleanup.
const TRACKER_IDLE_SECS: i64 = 3600;
/// Accepted clock skew for authentication, in seconds either way.
const AUTH_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityEventType {
    TrustedInterfaceAllow,
    UnauthorizedServer,
    SnoopingViolation,
    InterfaceMismatch,
    FilterDeny,
    RateLimitExceeded,
    Option82Missing,
    Option82Invalid,
    AuthFailed,
}

impl std::fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TrustedInterfaceAllow => "trusted-interface-allow",
            Self::UnauthorizedServer => "unauthorized-server",
            Self::SnoopingViolation => "snooping-violation",
            Self::InterfaceMismatch => "interface-mismatch",
            Self::FilterDeny => "filter-deny",
            Self::RateLimitExceeded => "rate-limit-exceeded",
            Self::Option82Missing => "option82-missing",
            Self::Option82Invalid => "option82-invalid",
            Self::AuthFailed => "auth-failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub level: ThreatLevel,
    pub description: String,
    pub mac: Option<MacAddr>,
    pub ip: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: HashMap<String, String>,
}

/// Why a message was refused; the handler drops the packet on receipt.
#[derive(Debug, Clone)]
pub struct Denial {
    pub event_type: SecurityEventType,
    pub reason: String,
}

#[derive(Debug, Default, Clone)]
pub struct SecurityStats {
    pub allowed: u64,
    pub blocked: u64,
    pub by_type: HashMap<String, u64>,
}

#[derive(Debug)]
struct RateTracker {
    timestamps: Vec<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
}

pub type EventCallback = Box<dyn Fn(&SecurityEvent) + Send + Sync>;

pub struct SecurityValidator {
    config: SecurityConfig,
    trusted: HashSet<String>,
    trackers: Mutex<HashMap<String, RateTracker>>,
    events: Mutex<VecDeque<SecurityEvent>>,
    callback: Mutex<Option<EventCallback>>,
    allowed: AtomicU64,
    blocked: AtomicU64,
    by_type: Mutex<HashMap<String, u64>>,
}

impl SecurityValidator {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            trusted: config.trusted_interfaces.iter().cloned().collect(),
            config: config.clone(),
            trackers: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            callback: Mutex::new(None),
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            by_type: Mutex::new(HashMap::new()),
        }
    }

    /// Runs every check against an inbound message. `Err` means drop.
    pub fn validate(&self, packet: &DhcpPacket, iface: &str) -> Result<(), Denial> {
        let result = self.validate_inner(packet, iface);
        match &result {
            Ok(()) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Err(denial) => {
                self.blocked.fetch_add(1, Ordering::Relaxed);
                debug!("Security denial ({}): {}", denial.event_type, denial.reason);
            }
        }
        result
    }

    fn validate_inner(&self, packet: &DhcpPacket, iface: &str) -> Result<(), Denial> {
        self.check_snooping(packet, iface)?;
        self.check_mac_filter(packet.mac(), iface)?;
        if packet.ciaddr != Ipv4Addr::UNSPECIFIED {
            self.check_ip_filter(packet.ciaddr, packet.mac(), iface)?;
        }
        self.check_rate_limit(packet, iface)?;
        self.check_option_82(packet, iface)?;
        self.check_authentication(packet, iface)?;
        Ok(())
    }

    // ---- DHCP snooping -------------------------------------------------

    fn check_snooping(&self, packet: &DhcpPacket, iface: &str) -> Result<(), Denial> {
        if !self.config.dhcp_snooping {
            return Ok(());
        }

        let mac = packet.mac();
        if self.trusted.contains(iface) {
            self.emit(SecurityEvent {
                event_type: SecurityEventType::TrustedInterfaceAllow,
                level: ThreatLevel::Low,
                description: "message allowed from trusted interface".to_string(),
                mac: Some(mac),
                ip: Some(packet.ciaddr),
                interface: Some(iface.to_string()),
                timestamp: Utc::now(),
                details: HashMap::new(),
            });
            return Ok(());
        }

        // Server-class traffic has no business on an untrusted port.
        if matches!(
            packet.message_type(),
            Some(MessageType::Offer) | Some(MessageType::Ack)
        ) {
            return Err(self.deny(
                SecurityEventType::UnauthorizedServer,
                ThreatLevel::High,
                "server-class message on untrusted interface".to_string(),
                Some(mac),
                Some(packet.ciaddr),
                iface,
            ));
        }

        // An untrusted port requires a matching pre-installed binding.
        let binding = self.config.snooping_bindings.iter().find(|binding| {
            binding.mac == mac
                && (packet.ciaddr == Ipv4Addr::UNSPECIFIED || binding.ip == packet.ciaddr)
        });

        match binding {
            Some(binding) if binding.interface == iface => Ok(()),
            Some(_) => Err(self.deny(
                SecurityEventType::InterfaceMismatch,
                ThreatLevel::Medium,
                "snooping binding interface mismatch".to_string(),
                Some(mac),
                Some(packet.ciaddr),
                iface,
            )),
            None => Err(self.deny(
                SecurityEventType::SnoopingViolation,
                ThreatLevel::Medium,
                "no snooping binding for client".to_string(),
                Some(mac),
                Some(packet.ciaddr),
                iface,
            )),
        }
    }

    // ---- MAC / IP filters ----------------------------------------------

    fn check_mac_filter(&self, mac: MacAddr, iface: &str) -> Result<(), Denial> {
        let now = Utc::now();
        let target = mac.normalized();
        for rule in &self.config.mac_filters {
            if !rule.enabled {
                continue;
            }
            if rule.expires.is_some_and(|expires| expires < now) {
                continue;
            }
            if wildcard_match(&normalize_pattern(&rule.mac), &target) {
                if rule.allow {
                    return Ok(());
                }
                return Err(self.deny(
                    SecurityEventType::FilterDeny,
                    ThreatLevel::Medium,
                    format!("MAC {} denied by filter {}", mac, rule.mac),
                    Some(mac),
                    None,
                    iface,
                ));
            }
        }
        Ok(())
    }

    fn check_ip_filter(&self, ip: Ipv4Addr, mac: MacAddr, iface: &str) -> Result<(), Denial> {
        let now = Utc::now();
        for rule in &self.config.ip_filters {
            if !rule.enabled {
                continue;
            }
            if rule.expires.is_some_and(|expires| expires < now) {
                continue;
            }
            let mask = u32::from(rule.mask);
            if u32::from(ip) & mask == u32::from(rule.ip) & mask {
                if rule.allow {
                    return Ok(());
                }
                return Err(self.deny(
                    SecurityEventType::FilterDeny,
                    ThreatLevel::Medium,
                    format!("address {} denied by filter {}/{}", ip, rule.ip, rule.mask),
                    Some(mac),
                    Some(ip),
                    iface,
                ));
            }
        }
        Ok(())
    }

    // ---- Rate limiting -------------------------------------------------

    fn check_rate_limit(&self, packet: &DhcpPacket, iface: &str) -> Result<(), Denial> {
        let now = Utc::now();
        let mac = packet.mac();

        let mut identities = vec![(IdentifierType::Mac, mac.to_string())];
        if packet.ciaddr != Ipv4Addr::UNSPECIFIED {
            identities.push((IdentifierType::Ip, packet.ciaddr.to_string()));
        }
        identities.push((IdentifierType::Interface, iface.to_string()));

        for (id_type, identity) in identities {
            if !self.admit(id_type, &identity, now) {
                return Err(self.deny(
                    SecurityEventType::RateLimitExceeded,
                    ThreatLevel::Medium,
                    format!("rate limit exceeded for {}", identity),
                    Some(mac),
                    (packet.ciaddr != Ipv4Addr::UNSPECIFIED).then_some(packet.ciaddr),
                    iface,
                ));
            }
        }
        Ok(())
    }

    /// Sliding-window admission for one identity at `now`. Visible to
    /// tests so window expiry does not require wall-clock sleeps.
    pub(crate) fn admit(&self, id_type: IdentifierType, identity: &str, now: DateTime<Utc>) -> bool {
        let rule = self
            .config
            .rate_limits
            .iter()
            .find(|rule| rule.identifier_type == id_type && rule.identifier == identity)
            .or_else(|| {
                self.config
                    .rate_limits
                    .iter()
                    .find(|rule| rule.identifier_type == id_type && rule.identifier == "*")
            });
        let Some(rule) = rule else {
            return true;
        };

        let window = TimeDelta::seconds(rule.time_window_secs as i64);
        let mut trackers = self.trackers.lock().expect("tracker lock poisoned");
        let tracker = trackers
            .entry(format!("{:?}:{}", id_type, identity))
            .or_insert_with(|| RateTracker {
                timestamps: Vec::new(),
                blocked_until: None,
                last_activity: now,
            });
        tracker.last_activity = now;

        if let Some(blocked_until) = tracker.blocked_until {
            if now < blocked_until {
                return false;
            }
            tracker.blocked_until = None;
            tracker.timestamps.clear();
        }

        tracker.timestamps.retain(|stamp| now - *stamp < window);
        if tracker.timestamps.len() >= rule.max_requests {
            if rule.block_duration_secs > 0 {
                tracker.blocked_until =
                    Some(now + TimeDelta::seconds(rule.block_duration_secs as i64));
            }
            return false;
        }

        tracker.timestamps.push(now);
        true
    }

    /// Drops trackers with no activity in the last hour.
    pub fn cleanup_trackers(&self) {
        let cutoff = Utc::now() - TimeDelta::seconds(TRACKER_IDLE_SECS);
        let mut trackers = self.trackers.lock().expect("tracker lock poisoned");
        trackers.retain(|_, tracker| tracker.last_activity > cutoff);
    }

    // ---- Option 82 -----------------------------------------------------

    fn check_option_82(&self, packet: &DhcpPacket, iface: &str) -> Result<(), Denial> {
        let option_82 = &self.config.option_82;
        if !option_82.enabled || !option_82.required_interfaces.iter().any(|i| i == iface) {
            return Ok(());
        }

        let mac = packet.mac();
        let Some(data) = packet.relay_agent_info() else {
            return Err(self.deny(
                SecurityEventType::Option82Missing,
                ThreatLevel::High,
                "required relay agent information option absent".to_string(),
                Some(mac),
                None,
                iface,
            ));
        };

        let Some(sub_options) = relay_sub_options(data) else {
            return Err(self.deny(
                SecurityEventType::Option82Invalid,
                ThreatLevel::High,
                "relay agent information sub-options are malformed".to_string(),
                Some(mac),
                None,
                iface,
            ));
        };

        let circuit_id = sub_options
            .iter()
            .find(|(code, _)| *code == RELAY_SUB_CIRCUIT_ID)
            .map(|(_, value)| value.clone());
        let remote_id = sub_options
            .iter()
            .find(|(code, _)| *code == RELAY_SUB_REMOTE_ID)
            .map(|(_, value)| value.clone());

        let (Some(circuit_id), Some(remote_id)) = (circuit_id, remote_id) else {
            return Err(self.deny(
                SecurityEventType::Option82Missing,
                ThreatLevel::High,
                "circuit-id or remote-id sub-option absent".to_string(),
                Some(mac),
                None,
                iface,
            ));
        };

        if !option_82.trusted_relays.is_empty() {
            let known = option_82.trusted_relays.iter().any(|relay| {
                relay.circuit_id.as_bytes() == circuit_id.as_slice()
                    && relay.remote_id.as_bytes() == remote_id.as_slice()
            });
            if !known {
                return Err(self.deny(
                    SecurityEventType::Option82Invalid,
                    ThreatLevel::High,
                    "relay agent is not in the trusted registry".to_string(),
                    Some(mac),
                    None,
                    iface,
                ));
            }
        }

        Ok(())
    }

    // ---- Authentication ------------------------------------------------

    fn check_authentication(&self, packet: &DhcpPacket, iface: &str) -> Result<(), Denial> {
        let auth = &self.config.authentication;
        if !auth.enabled {
            return Ok(());
        }

        let mac = packet.mac();
        let now = Utc::now();
        let registered = auth.clients.iter().any(|client| {
            client.mac == mac
                && client.enabled
                && client.expires.is_none_or(|expires| expires > now)
        });
        if !registered {
            return Ok(());
        }

        let Some(provided) = packet.authentication() else {
            return Err(self.deny(
                SecurityEventType::AuthFailed,
                ThreatLevel::High,
                "registered client sent no authentication option".to_string(),
                Some(mac),
                None,
                iface,
            ));
        };

        for offset in [0i64, -AUTH_SKEW_SECS, AUTH_SKEW_SECS] {
            let stamp = now + TimeDelta::seconds(offset);
            let expected = auth_digest(&auth.key, mac, stamp.timestamp());
            if digest_matches(&expected, provided) {
                return Ok(());
            }
        }

        Err(self.deny(
            SecurityEventType::AuthFailed,
            ThreatLevel::High,
            "authentication digest mismatch".to_string(),
            Some(mac),
            None,
            iface,
        ))
    }

    // ---- Events --------------------------------------------------------

    fn deny(
        &self,
        event_type: SecurityEventType,
        level: ThreatLevel,
        description: String,
        mac: Option<MacAddr>,
        ip: Option<Ipv4Addr>,
        iface: &str,
    ) -> Denial {
        warn!("Security event [{}]: {}", event_type, description);
        self.emit(SecurityEvent {
            event_type,
            level,
            description: description.clone(),
            mac,
            ip,
            interface: Some(iface.to_string()),
            timestamp: Utc::now(),
            details: HashMap::new(),
        });
        Denial {
            event_type,
            reason: description,
        }
    }

    fn emit(&self, event: SecurityEvent) {
        {
            let mut by_type = self.by_type.lock().expect("stats lock poisoned");
            *by_type.entry(event.event_type.to_string()).or_insert(0) += 1;
        }
        let callback = self.callback.lock().expect("callback lock poisoned");
        if let Some(callback) = callback.as_ref() {
            callback(&event);
        }
        drop(callback);

        let mut events = self.events.lock().expect("event lock poisoned");
        events.push_back(event);
        while events.len() > EVENT_CAP {
            events.pop_front();
        }
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        *self.callback.lock().expect("callback lock poisoned") = Some(callback);
    }

    /// The retained event ring, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .expect("event lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> SecurityStats {
        SecurityStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            by_type: self.by_type.lock().expect("stats lock poisoned").clone(),
        }
    }
}

/// Lowercase, separators stripped; `*`/`?` survive as wildcards.
fn normalize_pattern(pattern: &str) -> String {
    pattern
        .to_lowercase()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect()
}

/// Glob match with `*` (any run) and `?` (any one), iterative backtracking.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// HMAC-SHA-256 over `"{mac}|{epoch_seconds}"` with the shared key.
pub fn auth_digest(key: &str, mac: MacAddr, epoch_seconds: i64) -> [u8; 32] {
    let mut digest = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    digest.update(format!("{}|{}", mac, epoch_seconds).as_bytes());
    digest.finalize().into_bytes().into()
}

/// The client may provide the digest as 32 raw bytes or 64 hex chars.
fn digest_matches(expected: &[u8; 32], provided: &[u8]) -> bool {
    match provided.len() {
        32 => provided == expected,
        64 => match std::str::from_utf8(provided) {
            Ok(text) => text.to_lowercase() == hex::encode(expected),
            Err(_) => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AuthClientConfig, AuthConfig, IpFilterConfig, MacFilterConfig, Option82Config,
        RateLimitConfig, SnoopingBindingConfig, TrustedRelay,
    };
    use crate::options::{DhcpOption, OptionCode};
    use crate::packet::{BOOTREQUEST, DhcpPacket, HLEN_ETHERNET, HTYPE_ETHERNET};

    fn mac(last: u8) -> MacAddr {
        MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn test_packet(last: u8, msg_type: MessageType) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac(last).octets());
        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0x1234,
            secs: 0,
            flags: 0,
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

    #[test]
    fn test_everything_passes_with_default_config() {
        let validator = SecurityValidator::new(&SecurityConfig::default());
        let packet = test_packet(1, MessageType::Discover);
        assert!(validator.validate(&packet, "eth0").is_ok());
        assert_eq!(validator.stats().allowed, 1);
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("aabbccddeeff", "aabbccddeeff"));
        assert!(wildcard_match("*", "aabbccddeeff"));
        assert!(wildcard_match("aabbcc*", "aabbccddeeff"));
        assert!(wildcard_match("aabbccddee??", "aabbccddeeff"));
        assert!(wildcard_match("*ff", "aabbccddeeff"));
        assert!(wildcard_match("aa*ee*", "aabbccddeeff"));
        assert!(!wildcard_match("aabbcc", "aabbccddeeff"));
        assert!(!wildcard_match("bb*", "aabbccddeeff"));
        assert!(!wildcard_match("aabbccddee?", "aabbccddeeff"));
    }

    #[test]
    fn test_mac_filter_first_match_wins() {
        let mut config = SecurityConfig::default();
        config.mac_filters.push(MacFilterConfig {
            mac: "aa:bb:cc:*".to_string(),
            allow: false,
            description: None,
            expires: None,
            enabled: true,
        });
        config.mac_filters.push(MacFilterConfig {
            mac: "*".to_string(),
            allow: true,
            description: None,
            expires: None,
            enabled: true,
        });
        let validator = SecurityValidator::new(&config);

        let denied = validator.validate(&test_packet(1, MessageType::Discover), "eth0");
        assert!(denied.is_err());
        assert_eq!(
            denied.unwrap_err().event_type,
            SecurityEventType::FilterDeny
        );

        let mut other = test_packet(1, MessageType::Discover);
        other.chaddr[..6].copy_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert!(validator.validate(&other, "eth0").is_ok());
    }

    #[test]
    fn test_mac_filter_default_is_allow() {
        let mut config = SecurityConfig::default();
        config.mac_filters.push(MacFilterConfig {
            mac: "11:22:33:44:55:66".to_string(),
            allow: false,
            description: None,
            expires: None,
            enabled: true,
        });
        let validator = SecurityValidator::new(&config);
        assert!(validator
            .validate(&test_packet(1, MessageType::Discover), "eth0")
            .is_ok());
    }

    #[test]
    fn test_expired_and_disabled_rules_are_skipped() {
        let mut config = SecurityConfig::default();
        config.mac_filters.push(MacFilterConfig {
            mac: "*".to_string(),
            allow: false,
            description: None,
            expires: Some(Utc::now() - TimeDelta::hours(1)),
            enabled: true,
        });
        config.mac_filters.push(MacFilterConfig {
            mac: "*".to_string(),
            allow: false,
            description: None,
            expires: None,
            enabled: false,
        });
        let validator = SecurityValidator::new(&config);
        assert!(validator
            .validate(&test_packet(1, MessageType::Discover), "eth0")
            .is_ok());
    }

    #[test]
    fn test_ip_filter_mask_match() {
        let mut config = SecurityConfig::default();
        config.ip_filters.push(IpFilterConfig {
            ip: Ipv4Addr::new(192, 168, 50, 0),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            allow: false,
            expires: None,
            enabled: true,
        });
        let validator = SecurityValidator::new(&config);

        let mut packet = test_packet(1, MessageType::Request);
        packet.ciaddr = Ipv4Addr::new(192, 168, 50, 77);
        assert!(validator.validate(&packet, "eth0").is_err());

        packet.ciaddr = Ipv4Addr::new(192, 168, 51, 77);
        assert!(validator.validate(&packet, "eth0").is_ok());
    }

    #[test]
    fn test_rate_limit_denies_after_threshold() {
        let mut config = SecurityConfig::default();
        config.rate_limits.push(RateLimitConfig {
            identifier: "*".to_string(),
            identifier_type: IdentifierType::Mac,
            max_requests: 3,
            time_window_secs: 60,
            block_duration_secs: 0,
        });
        let validator = SecurityValidator::new(&config);
        let packet = test_packet(1, MessageType::Discover);

        for _ in 0..3 {
            assert!(validator.validate(&packet, "eth0").is_ok());
        }
        let denied = validator.validate(&packet, "eth0");
        assert_eq!(
            denied.unwrap_err().event_type,
            SecurityEventType::RateLimitExceeded
        );
    }

    #[test]
    fn test_rate_limit_window_resets() {
        let mut config = SecurityConfig::default();
        config.rate_limits.push(RateLimitConfig {
            identifier: "*".to_string(),
            identifier_type: IdentifierType::Mac,
            max_requests: 2,
            time_window_secs: 10,
            block_duration_secs: 0,
        });
        let validator = SecurityValidator::new(&config);

        let start = Utc::now();
        let identity = mac(1).to_string();
        assert!(validator.admit(IdentifierType::Mac, &identity, start));
        assert!(validator.admit(IdentifierType::Mac, &identity, start));
        assert!(!validator.admit(IdentifierType::Mac, &identity, start));

        let later = start + TimeDelta::seconds(11);
        assert!(validator.admit(IdentifierType::Mac, &identity, later));
    }

    #[test]
    fn test_rate_limit_block_duration() {
        let mut config = SecurityConfig::default();
        config.rate_limits.push(RateLimitConfig {
            identifier: "*".to_string(),
            identifier_type: IdentifierType::Mac,
            max_requests: 1,
            time_window_secs: 5,
            block_duration_secs: 120,
        });
        let validator = SecurityValidator::new(&config);

        let start = Utc::now();
        let identity = mac(1).to_string();
        assert!(validator.admit(IdentifierType::Mac, &identity, start));
        assert!(!validator.admit(IdentifierType::Mac, &identity, start));

        // Past the window but still inside the block.
        let in_block = start + TimeDelta::seconds(30);
        assert!(!validator.admit(IdentifierType::Mac, &identity, in_block));

        let after_block = start + TimeDelta::seconds(121);
        assert!(validator.admit(IdentifierType::Mac, &identity, after_block));
    }

    #[test]
    fn test_specific_rule_beats_global() {
        let mut config = SecurityConfig::default();
        config.rate_limits.push(RateLimitConfig {
            identifier: "*".to_string(),
            identifier_type: IdentifierType::Mac,
            max_requests: 1,
            time_window_secs: 60,
            block_duration_secs: 0,
        });
        config.rate_limits.push(RateLimitConfig {
            identifier: mac(1).to_string(),
            identifier_type: IdentifierType::Mac,
            max_requests: 5,
            time_window_secs: 60,
            block_duration_secs: 0,
        });
        let validator = SecurityValidator::new(&config);

        let now = Utc::now();
        let identity = mac(1).to_string();
        for _ in 0..5 {
            assert!(validator.admit(IdentifierType::Mac, &identity, now));
        }
        assert!(!validator.admit(IdentifierType::Mac, &identity, now));
    }

    #[test]
    fn test_option82_required_and_missing() {
        let mut config = SecurityConfig::default();
        config.option_82 = Option82Config {
            enabled: true,
            required_interfaces: vec!["eth1".to_string()],
            trusted_relays: Vec::new(),
        };
        let validator = SecurityValidator::new(&config);

        let packet = test_packet(1, MessageType::Discover);
        let denied = validator.validate(&packet, "eth1").unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::Option82Missing);

        // Not required on other interfaces.
        assert!(validator.validate(&packet, "eth0").is_ok());
    }

    #[test]
    fn test_option82_with_sub_options_passes() {
        let mut config = SecurityConfig::default();
        config.option_82 = Option82Config {
            enabled: true,
            required_interfaces: vec!["eth1".to_string()],
            trusted_relays: Vec::new(),
        };
        let validator = SecurityValidator::new(&config);

        let mut packet = test_packet(1, MessageType::Discover);
        let mut payload = vec![RELAY_SUB_CIRCUIT_ID, 3];
        payload.extend_from_slice(b"ckt");
        payload.extend_from_slice(&[RELAY_SUB_REMOTE_ID, 2]);
        payload.extend_from_slice(b"rm");
        packet.options.push(DhcpOption::RelayAgentInfo(payload));

        assert!(validator.validate(&packet, "eth1").is_ok());
    }

    #[test]
    fn test_option82_missing_remote_id() {
        let mut config = SecurityConfig::default();
        config.option_82 = Option82Config {
            enabled: true,
            required_interfaces: vec!["eth1".to_string()],
            trusted_relays: Vec::new(),
        };
        let validator = SecurityValidator::new(&config);

        let mut packet = test_packet(1, MessageType::Discover);
        let mut payload = vec![RELAY_SUB_CIRCUIT_ID, 3];
        payload.extend_from_slice(b"ckt");
        packet.options.push(DhcpOption::RelayAgentInfo(payload));

        let denied = validator.validate(&packet, "eth1").unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::Option82Missing);
    }

    #[test]
    fn test_option82_trusted_relay_registry() {
        let mut config = SecurityConfig::default();
        config.option_82 = Option82Config {
            enabled: true,
            required_interfaces: vec!["eth1".to_string()],
            trusted_relays: vec![TrustedRelay {
                circuit_id: "ckt".to_string(),
                remote_id: "rm".to_string(),
            }],
        };
        let validator = SecurityValidator::new(&config);

        let mut payload = vec![RELAY_SUB_CIRCUIT_ID, 3];
        payload.extend_from_slice(b"ckt");
        payload.extend_from_slice(&[RELAY_SUB_REMOTE_ID, 2]);
        payload.extend_from_slice(b"rm");

        let mut packet = test_packet(1, MessageType::Discover);
        packet
            .options
            .push(DhcpOption::RelayAgentInfo(payload.clone()));
        assert!(validator.validate(&packet, "eth1").is_ok());

        let mut rogue_payload = vec![RELAY_SUB_CIRCUIT_ID, 3];
        rogue_payload.extend_from_slice(b"bad");
        rogue_payload.extend_from_slice(&[RELAY_SUB_REMOTE_ID, 2]);
        rogue_payload.extend_from_slice(b"rm");

        let mut rogue = test_packet(2, MessageType::Discover);
        rogue.options.push(DhcpOption::RelayAgentInfo(rogue_payload));
        let denied = validator.validate(&rogue, "eth1").unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::Option82Invalid);
    }

    fn auth_config(last: u8) -> SecurityConfig {
        let mut config = SecurityConfig::default();
        config.authentication = AuthConfig {
            enabled: true,
            key: "shared-secret".to_string(),
            clients: vec![AuthClientConfig {
                mac: mac(last),
                enabled: true,
                expires: None,
            }],
        };
        config
    }

    #[test]
    fn test_auth_raw_digest_accepted() {
        let validator = SecurityValidator::new(&auth_config(1));

        let digest = auth_digest("shared-secret", mac(1), Utc::now().timestamp());
        let mut packet = test_packet(1, MessageType::Discover);
        packet
            .options
            .push(DhcpOption::Authentication(digest.to_vec()));
        assert!(validator.validate(&packet, "eth0").is_ok());
    }

    #[test]
    fn test_auth_hex_digest_accepted() {
        let validator = SecurityValidator::new(&auth_config(1));

        let digest = auth_digest("shared-secret", mac(1), Utc::now().timestamp());
        let mut packet = test_packet(1, MessageType::Discover);
        packet.options.push(DhcpOption::Authentication(
            hex::encode(digest).into_bytes(),
        ));
        assert!(validator.validate(&packet, "eth0").is_ok());
    }

    #[test]
    fn test_auth_skew_tolerated() {
        let validator = SecurityValidator::new(&auth_config(1));

        let digest = auth_digest("shared-secret", mac(1), Utc::now().timestamp() - 60);
        let mut packet = test_packet(1, MessageType::Discover);
        packet
            .options
            .push(DhcpOption::Authentication(digest.to_vec()));
        assert!(validator.validate(&packet, "eth0").is_ok());
    }

    #[test]
    fn test_auth_rejects_bad_digest_and_missing_option() {
        let validator = SecurityValidator::new(&auth_config(1));

        let mut packet = test_packet(1, MessageType::Discover);
        packet
            .options
            .push(DhcpOption::Authentication(vec![0u8; 32]));
        let denied = validator.validate(&packet, "eth0").unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::AuthFailed);

        let bare = test_packet(1, MessageType::Discover);
        let denied = validator.validate(&bare, "eth0").unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::AuthFailed);
    }

    #[test]
    fn test_auth_skips_unregistered_clients() {
        let validator = SecurityValidator::new(&auth_config(1));
        let packet = test_packet(2, MessageType::Discover);
        assert!(validator.validate(&packet, "eth0").is_ok());
    }

    #[test]
    fn test_snooping_trusted_interface_passes_with_low_event() {
        let mut config = SecurityConfig::default();
        config.dhcp_snooping = true;
        config.trusted_interfaces.push("eth0".to_string());
        let validator = SecurityValidator::new(&config);

        assert!(validator
            .validate(&test_packet(1, MessageType::Discover), "eth0")
            .is_ok());

        let events = validator.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::TrustedInterfaceAllow);
        assert_eq!(events[0].level, ThreatLevel::Low);
    }

    #[test]
    fn test_snooping_untrusted_without_binding_denied() {
        let mut config = SecurityConfig::default();
        config.dhcp_snooping = true;
        let validator = SecurityValidator::new(&config);

        let denied = validator
            .validate(&test_packet(1, MessageType::Discover), "eth3")
            .unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::SnoopingViolation);
    }

    #[test]
    fn test_snooping_binding_interface_mismatch() {
        let mut config = SecurityConfig::default();
        config.dhcp_snooping = true;
        config.snooping_bindings.push(SnoopingBindingConfig {
            mac: mac(1),
            ip: Ipv4Addr::new(10, 0, 0, 100),
            interface: "eth2".to_string(),
        });
        let validator = SecurityValidator::new(&config);

        let mut packet = test_packet(1, MessageType::Request);
        packet.ciaddr = Ipv4Addr::new(10, 0, 0, 100);
        let denied = validator.validate(&packet, "eth3").unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::InterfaceMismatch);

        assert!(validator.validate(&packet, "eth2").is_ok());
    }

    #[test]
    fn test_snooping_flags_unauthorized_server() {
        let mut config = SecurityConfig::default();
        config.dhcp_snooping = true;
        let validator = SecurityValidator::new(&config);

        let denied = validator
            .validate(&test_packet(1, MessageType::Offer), "eth3")
            .unwrap_err();
        assert_eq!(denied.event_type, SecurityEventType::UnauthorizedServer);

        let events = validator.events();
        assert_eq!(events.last().unwrap().level, ThreatLevel::High);
    }

    #[test]
    fn test_event_ring_is_bounded() {
        let mut config = SecurityConfig::default();
        config.mac_filters.push(MacFilterConfig {
            mac: "*".to_string(),
            allow: false,
            description: None,
            expires: None,
            enabled: true,
        });
        let validator = SecurityValidator::new(&config);

        let packet = test_packet(1, MessageType::Discover);
        for _ in 0..(EVENT_CAP + 100) {
            let _ = validator.validate(&packet, "eth0");
        }
        assert_eq!(validator.events().len(), EVENT_CAP);
        assert_eq!(validator.stats().blocked as usize, EVENT_CAP + 100);
    }

    #[test]
    fn test_event_callback_streams() {
        let mut config = SecurityConfig::default();
        config.mac_filters.push(MacFilterConfig {
            mac: "*".to_string(),
            allow: false,
            description: None,
            expires: None,
            enabled: true,
        });
        let validator = SecurityValidator::new(&config);

        let seen = std::sync::Arc::new(AtomicU64::new(0));
        let counter = std::sync::Arc::clone(&seen);
        validator.set_event_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let _ = validator.validate(&test_packet(1, MessageType::Discover), "eth0");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tracker_cleanup_drops_idle_entries() {
        let mut config = SecurityConfig::default();
        config.rate_limits.push(RateLimitConfig {
            identifier: "*".to_string(),
            identifier_type: IdentifierType::Mac,
            max_requests: 10,
            time_window_secs: 60,
            block_duration_secs: 0,
        });
        let validator = SecurityValidator::new(&config);

        let stale = Utc::now() - TimeDelta::hours(2);
        validator.admit(IdentifierType::Mac, "aa:bb:cc:dd:ee:01", stale);
        assert_eq!(validator.trackers.lock().unwrap().len(), 1);

        validator.cleanup_trackers();
        assert!(validator.trackers.lock().unwrap().is_empty());
    }
}
