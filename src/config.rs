use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::options::DhcpOption;

/// Hex-string <-> byte-vector codec for option payloads in config files.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }
}

/// An option the operator supplies as raw `{code, data}` bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawOption {
    pub code: u8,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl RawOption {
    pub fn to_option(&self) -> DhcpOption {
        DhcpOption::Unknown(self.code, self.data.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    #[default]
    Reject,
    Replace,
    Extend,
    Negotiate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub lease_time: Option<u32>,
    #[serde(default)]
    pub vendor_class: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub options: Vec<RawOption>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExclusionRange {
    pub from: Ipv4Addr,
    pub to: Ipv4Addr,
}

impl ExclusionRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) >= u32::from(self.from) && u32::from(ip) <= u32::from(self.to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub name: String,
    pub network: Ipv4Addr,
    pub prefix_length: u8,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default = "default_lease_time")]
    pub lease_time: u32,
    #[serde(default = "default_max_lease_time")]
    pub max_lease_time: u32,
    #[serde(default)]
    pub options: Vec<RawOption>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub exclusions: Vec<ExclusionRange>,
}

impl SubnetConfig {
    pub fn mask_bits(&self) -> u32 {
        if self.prefix_length == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_length as u32)
        }
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// True when `ip` lies inside this subnet's network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask_bits()) == (u32::from(self.network) & self.mask_bits())
    }

    /// True when `ip` lies inside the dynamic allocation range.
    pub fn in_range(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) >= u32::from(self.range_start) && u32::from(ip) <= u32::from(self.range_end)
    }

    pub fn is_excluded(&self, ip: Ipv4Addr) -> bool {
        self.exclusions.iter().any(|range| range.contains(ip))
    }

    /// Dynamic pool capacity: the range size minus excluded addresses.
    pub fn pool_size(&self) -> u32 {
        let start = u32::from(self.range_start);
        let end = u32::from(self.range_end);
        let mut size = end - start + 1;
        for ip_num in start..=end {
            if self.is_excluded(Ipv4Addr::from(ip_num)) {
                size -= 1;
            }
        }
        size
    }

    pub fn reservation_for(&self, mac: MacAddr) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|reservation| reservation.enabled && reservation.mac == mac)
    }

    /// MAC holding a static reservation on `ip`, if any.
    pub fn reservation_owner(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.reservations
            .iter()
            .find(|reservation| reservation.enabled && reservation.ip == ip)
            .map(|reservation| reservation.mac)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addresses: Vec<String>,
    #[serde(default = "default_max_leases")]
    pub max_leases: u32,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
    #[serde(default = "default_true")]
    pub enable_security: bool,
    #[serde(default = "default_lease_file")]
    pub lease_file: PathBuf,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    #[serde(default = "default_decline_cooldown")]
    pub decline_cooldown_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacFilterConfig {
    /// Literal MAC or a pattern with `*`/`?` wildcards.
    pub mac: String,
    pub allow: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpFilterConfig {
    pub ip: Ipv4Addr,
    #[serde(default = "default_host_mask")]
    pub mask: Ipv4Addr,
    pub allow: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Mac,
    Ip,
    Interface,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// MAC, IP or interface name; `*` matches everything of the type.
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub max_requests: usize,
    pub time_window_secs: u64,
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedRelay {
    pub circuit_id: String,
    pub remote_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Option82Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required_interfaces: Vec<String>,
    #[serde(default)]
    pub trusted_relays: Vec<TrustedRelay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClientConfig {
    pub mac: MacAddr,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub clients: Vec<AuthClientConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoopingBindingConfig {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub dhcp_snooping: bool,
    #[serde(default)]
    pub trusted_interfaces: Vec<String>,
    #[serde(default)]
    pub snooping_bindings: Vec<SnoopingBindingConfig>,
    #[serde(default)]
    pub mac_filters: Vec<MacFilterConfig>,
    #[serde(default)]
    pub ip_filters: Vec<IpFilterConfig>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
    #[serde(default)]
    pub option_82: Option82Config,
    #[serde(default)]
    pub authentication: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub subnets: Vec<SubnetConfig>,
    #[serde(default)]
    pub global_options: Vec<RawOption>,
    #[serde(default)]
    pub security: SecurityConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_leases() -> u32 {
    10_000
}

fn default_lease_time() -> u32 {
    86_400
}

fn default_max_lease_time() -> u32 {
    172_800
}

fn default_lease_file() -> PathBuf {
    PathBuf::from("dhcpwarden.leases")
}

fn default_decline_cooldown() -> u64 {
    300
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_autosave_interval() -> u64 {
    60
}

fn default_block_duration() -> u64 {
    300
}

fn default_host_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 255)
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addresses.is_empty() {
            return Err(Error::InvalidConfig(
                "listen_addresses must not be empty".to_string(),
            ));
        }
        for address in &self.server.listen_addresses {
            parse_listen_address(address)?;
        }

        if self.subnets.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one subnet must be configured".to_string(),
            ));
        }

        let mut seen_names = HashSet::new();
        for subnet in &self.subnets {
            if !seen_names.insert(subnet.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate subnet name: {}",
                    subnet.name
                )));
            }

            if subnet.prefix_length > 32 {
                return Err(Error::InvalidConfig(format!(
                    "subnet {}: prefix_length {} exceeds 32",
                    subnet.name, subnet.prefix_length
                )));
            }

            if u32::from(subnet.range_start) > u32::from(subnet.range_end) {
                return Err(Error::InvalidConfig(format!(
                    "subnet {}: range_start {} is above range_end {}",
                    subnet.name, subnet.range_start, subnet.range_end
                )));
            }

            if !subnet.contains(subnet.range_start) || !subnet.contains(subnet.range_end) {
                return Err(Error::InvalidConfig(format!(
                    "subnet {}: allocation range is outside {}/{}",
                    subnet.name, subnet.network, subnet.prefix_length
                )));
            }

            if subnet.lease_time == 0 {
                return Err(Error::InvalidConfig(format!(
                    "subnet {}: lease_time must be greater than 0",
                    subnet.name
                )));
            }

            if subnet.max_lease_time < subnet.lease_time {
                return Err(Error::InvalidConfig(format!(
                    "subnet {}: max_lease_time is below lease_time",
                    subnet.name
                )));
            }

            for range in &subnet.exclusions {
                if u32::from(range.from) > u32::from(range.to) {
                    return Err(Error::InvalidConfig(format!(
                        "subnet {}: exclusion {}..{} is inverted",
                        subnet.name, range.from, range.to
                    )));
                }
            }

            let mut seen_macs = HashSet::new();
            let mut seen_ips = HashSet::new();
            for reservation in &subnet.reservations {
                if !subnet.contains(reservation.ip) {
                    return Err(Error::InvalidConfig(format!(
                        "subnet {}: reservation {} is outside the subnet",
                        subnet.name, reservation.ip
                    )));
                }
                if !seen_macs.insert(reservation.mac) {
                    return Err(Error::InvalidConfig(format!(
                        "subnet {}: duplicate reservation MAC {}",
                        subnet.name, reservation.mac
                    )));
                }
                if !seen_ips.insert(reservation.ip) {
                    return Err(Error::InvalidConfig(format!(
                        "subnet {}: duplicate reservation IP {}",
                        subnet.name, reservation.ip
                    )));
                }
            }
        }

        if self.security.authentication.enabled && self.security.authentication.key.is_empty() {
            return Err(Error::InvalidConfig(
                "authentication is enabled but no key is configured".to_string(),
            ));
        }

        Ok(())
    }

    pub fn subnet_by_name(&self, name: &str) -> Option<&SubnetConfig> {
        self.subnets.iter().find(|subnet| subnet.name == name)
    }

    /// Selects the subnet serving a message: relayed messages use the
    /// subnet containing giaddr; direct messages the subnet containing
    /// the ingress address; the first subnet as the final fallback.
    pub fn subnet_for(&self, giaddr: Ipv4Addr, server_ip: Ipv4Addr) -> Option<&SubnetConfig> {
        if giaddr != Ipv4Addr::UNSPECIFIED {
            return self.subnets.iter().find(|subnet| subnet.contains(giaddr));
        }
        self.subnets
            .iter()
            .find(|subnet| subnet.contains(server_ip))
            .or_else(|| self.subnets.first())
    }

    /// Subnet whose network contains `ip`.
    pub fn subnet_containing(&self, ip: Ipv4Addr) -> Option<&SubnetConfig> {
        self.subnets.iter().find(|subnet| subnet.contains(ip))
    }
}

/// Splits a `"ip"` or `"ip%iface"` listen entry into the bound address and
/// the interface label (the address text when no label is given).
pub fn parse_listen_address(entry: &str) -> Result<(Ipv4Addr, String)> {
    let (ip_text, iface) = match entry.split_once('%') {
        Some((ip_text, iface)) if !iface.is_empty() => (ip_text, iface.to_string()),
        Some(_) => {
            return Err(Error::InvalidConfig(format!(
                "listen address {} has an empty interface label",
                entry
            )));
        }
        None => (entry, entry.to_string()),
    };
    let ip = ip_text
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::InvalidConfig(format!("invalid listen address: {}", entry)))?;
    Ok((ip, iface))
}

pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(255)
        .collect()
}
