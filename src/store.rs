//! The authoritative MAC<->IP binding set.
//!
//! Two hash indices over one owning collection: `by_mac` owns the leases,
//! `by_ip` maps back to the owning MAC. The store performs no I/O itself;
//! persistence is a text image produced by [`LeaseStore::snapshot`] and
//! ingested by [`LeaseStore::load_image`], so callers never hold the store
//! lock across disk writes.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::options::DhcpOption;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseFlavor {
    Dynamic = 0,
    Static = 1,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub client_id: Option<String>,
    pub vendor_class: Option<String>,
    pub description: Option<String>,
    /// Operator enable flag carried on static records; informational.
    pub enabled: bool,
    /// Name of the subnet the address was drawn from.
    pub subnet: String,
    pub lease_time: u32,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewal_at: DateTime<Utc>,
    pub rebinding_at: DateTime<Utc>,
    pub flavor: LeaseFlavor,
    pub active: bool,
    /// The option set captured at allocation time and echoed on ACK.
    pub pinned_options: Vec<DhcpOption>,
}

impl Lease {
    pub fn new_dynamic(mac: MacAddr, ip: Ipv4Addr, subnet: String, lease_time: u32) -> Self {
        let now = Utc::now();
        let mut lease = Self {
            mac,
            ip,
            hostname: None,
            client_id: None,
            vendor_class: None,
            description: None,
            enabled: true,
            subnet,
            lease_time,
            allocated_at: now,
            expires_at: now,
            renewal_at: now,
            rebinding_at: now,
            flavor: LeaseFlavor::Dynamic,
            active: true,
            pinned_options: Vec::new(),
        };
        lease.restart_clock(lease_time);
        lease
    }

    pub fn new_static(mac: MacAddr, ip: Ipv4Addr, subnet: String, lease_time: u32) -> Self {
        let mut lease = Self::new_dynamic(mac, ip, subnet, lease_time);
        lease.flavor = LeaseFlavor::Static;
        lease
    }

    /// Resets the allocation clock: T1 at T/2, T2 at 7T/8.
    pub fn restart_clock(&mut self, lease_time: u32) {
        let now = Utc::now();
        self.lease_time = lease_time;
        self.allocated_at = now;
        self.expires_at = now + TimeDelta::seconds(lease_time as i64);
        self.renewal_at = now + TimeDelta::seconds(lease_time as i64 / 2);
        self.rebinding_at = now + TimeDelta::seconds(lease_time as i64 * 7 / 8);
    }

    /// Static leases never expire.
    pub fn is_expired(&self) -> bool {
        self.flavor == LeaseFlavor::Dynamic && Utc::now() > self.expires_at
    }

    pub fn remaining_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Strips the field separator so a free-text value cannot corrupt a record.
fn clean_field(value: &str) -> String {
    value.replace('|', "")
}

#[derive(Debug, Default)]
pub struct LeaseStore {
    by_mac: HashMap<MacAddr, Lease>,
    by_ip: HashMap<Ipv4Addr, MacAddr>,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_mac(&self, mac: MacAddr) -> Option<&Lease> {
        self.by_mac.get(&mac)
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<&Lease> {
        self.by_ip.get(&ip).and_then(|mac| self.by_mac.get(mac))
    }

    /// Inserts a lease, failing when either index is held by a different
    /// active lease. Re-inserting for the same MAC moves its binding.
    pub fn insert(&mut self, lease: Lease) -> Result<()> {
        if let Some(existing) = self.by_mac.get(&lease.mac)
            && existing.active
            && !existing.is_expired()
            && existing.ip != lease.ip
        {
            return Err(Error::ConflictMac(lease.mac));
        }

        if let Some(owner) = self.by_ip.get(&lease.ip)
            && *owner != lease.mac
            && let Some(holder) = self.by_mac.get(owner)
            && holder.active
            && !holder.is_expired()
        {
            return Err(Error::ConflictIp(lease.ip));
        }

        // Stale bindings on either index give way to the new lease.
        if let Some(old) = self.by_mac.remove(&lease.mac) {
            self.by_ip.remove(&old.ip);
        }
        if let Some(owner) = self.by_ip.remove(&lease.ip) {
            self.by_mac.remove(&owner);
        }

        self.by_ip.insert(lease.ip, lease.mac);
        self.by_mac.insert(lease.mac, lease);
        Ok(())
    }

    pub fn remove(&mut self, mac: MacAddr) -> Option<Lease> {
        let lease = self.by_mac.remove(&mac)?;
        self.by_ip.remove(&lease.ip);
        Some(lease)
    }

    /// Atomic swap keeping both indices consistent; used on renew.
    pub fn replace(&mut self, mac: MacAddr, lease: Lease) -> Result<()> {
        if !self.by_mac.contains_key(&mac) {
            return Err(Error::UnknownLease(mac));
        }
        if let Some(owner) = self.by_ip.get(&lease.ip)
            && *owner != mac
        {
            return Err(Error::ConflictIp(lease.ip));
        }
        if let Some(old) = self.by_mac.remove(&mac) {
            self.by_ip.remove(&old.ip);
        }
        self.by_ip.insert(lease.ip, lease.mac);
        self.by_mac.insert(lease.mac, lease);
        Ok(())
    }

    /// Every stored lease, expired ones included (the reaper's view).
    pub fn iter_all(&self) -> impl Iterator<Item = &Lease> {
        self.by_mac.values()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &Lease> {
        self.by_mac
            .values()
            .filter(|lease| lease.active && !lease.is_expired())
    }

    pub fn iter_subnet<'a>(&'a self, subnet_name: &'a str) -> impl Iterator<Item = &'a Lease> {
        self.iter_active()
            .filter(move |lease| lease.subnet == subnet_name)
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.iter_active().count()
    }

    /// Serializes the binding set into the lease-file text image.
    ///
    /// Dynamic leases become `LEASE|` records, static leases `STATIC|`
    /// records; both sections are sorted by IP so that repeated snapshots
    /// of the same state are byte-identical apart from the timestamp
    /// comment.
    pub fn snapshot(&self) -> String {
        let mut dynamic: Vec<&Lease> = Vec::new();
        let mut statics: Vec<&Lease> = Vec::new();
        for lease in self.by_mac.values().filter(|lease| lease.active) {
            match lease.flavor {
                LeaseFlavor::Dynamic => dynamic.push(lease),
                LeaseFlavor::Static => statics.push(lease),
            }
        }
        dynamic.sort_by_key(|lease| u32::from(lease.ip));
        statics.sort_by_key(|lease| u32::from(lease.ip));

        let mut image = String::new();
        image.push_str("# dhcpwarden lease database\n");
        image.push_str(&format!("# generated {}\n", Utc::now().to_rfc3339()));
        for lease in dynamic {
            image.push_str(&format!(
                "LEASE|{}|{}|{}|{}|{}|{}|{}|{}\n",
                lease.mac,
                lease.ip,
                clean_field(lease.hostname.as_deref().unwrap_or("")),
                lease.lease_time,
                lease.flavor as u8,
                lease.allocated_at.timestamp(),
                lease.expires_at.timestamp(),
                clean_field(lease.client_id.as_deref().unwrap_or("")),
            ));
        }
        for lease in statics {
            image.push_str(&format!(
                "STATIC|{}|{}|{}|{}|{}|{}|{}\n",
                lease.mac,
                lease.ip,
                clean_field(lease.hostname.as_deref().unwrap_or("")),
                clean_field(lease.description.as_deref().unwrap_or("")),
                lease.lease_time,
                if lease.enabled { "1" } else { "0" },
                clean_field(lease.vendor_class.as_deref().unwrap_or("")),
            ));
        }
        image
    }

    /// Ingests a lease-file image, replacing the current binding set.
    ///
    /// Records that fail to parse are skipped with one warning each;
    /// dynamic records whose expiry has passed are dropped; static records
    /// are accepted unconditionally. Returns the number of leases loaded.
    pub fn load_image(&mut self, image: &str) -> usize {
        self.by_mac.clear();
        self.by_ip.clear();

        let mut loaded = 0;
        for line in image.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match Self::parse_record(line) {
                Some(lease) => {
                    if lease.flavor == LeaseFlavor::Dynamic && lease.is_expired() {
                        debug!("Dropping expired lease record for {}", lease.mac);
                        continue;
                    }
                    // Later records win over earlier duplicates on either key.
                    if let Some(old) = self.by_mac.remove(&lease.mac) {
                        self.by_ip.remove(&old.ip);
                    }
                    if let Some(owner) = self.by_ip.remove(&lease.ip) {
                        self.by_mac.remove(&owner);
                    }
                    self.by_ip.insert(lease.ip, lease.mac);
                    self.by_mac.insert(lease.mac, lease);
                    loaded += 1;
                }
                None => {
                    warn!("Skipping unparsable lease record: {}", line);
                }
            }
        }
        loaded
    }

    fn parse_record(line: &str) -> Option<Lease> {
        let fields: Vec<&str> = line.split('|').collect();
        match fields.first()? {
            &"LEASE" => {
                if fields.len() != 9 {
                    return None;
                }
                let mac: MacAddr = fields[1].parse().ok()?;
                let ip: Ipv4Addr = fields[2].parse().ok()?;
                let hostname = (!fields[3].is_empty()).then(|| fields[3].to_string());
                let lease_time: u32 = fields[4].parse().ok()?;
                let flavor = match fields[5] {
                    "0" => LeaseFlavor::Dynamic,
                    "1" => LeaseFlavor::Static,
                    _ => return None,
                };
                let allocated_at = DateTime::from_timestamp(fields[6].parse().ok()?, 0)?;
                let expires_at = DateTime::from_timestamp(fields[7].parse().ok()?, 0)?;
                let client_id = (!fields[8].is_empty()).then(|| fields[8].to_string());

                Some(Lease {
                    mac,
                    ip,
                    hostname,
                    client_id,
                    vendor_class: None,
                    description: None,
                    enabled: true,
                    subnet: String::new(),
                    lease_time,
                    allocated_at,
                    expires_at,
                    renewal_at: allocated_at + TimeDelta::seconds(lease_time as i64 / 2),
                    rebinding_at: allocated_at + TimeDelta::seconds(lease_time as i64 * 7 / 8),
                    flavor,
                    active: true,
                    pinned_options: Vec::new(),
                })
            }
            &"STATIC" => {
                if fields.len() != 8 {
                    return None;
                }
                let mac: MacAddr = fields[1].parse().ok()?;
                let ip: Ipv4Addr = fields[2].parse().ok()?;
                let hostname = (!fields[3].is_empty()).then(|| fields[3].to_string());
                let description = (!fields[4].is_empty()).then(|| fields[4].to_string());
                let lease_time: u32 = fields[5].parse().ok()?;
                let enabled = match fields[6] {
                    "0" => false,
                    "1" => true,
                    _ => return None,
                };
                let vendor_class = (!fields[7].is_empty()).then(|| fields[7].to_string());

                let mut lease = Lease::new_static(mac, ip, String::new(), lease_time);
                lease.hostname = hostname;
                lease.description = description;
                lease.vendor_class = vendor_class;
                lease.enabled = enabled;
                Some(lease)
            }
            _ => None,
        }
    }
}
