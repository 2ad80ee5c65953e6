//! Lease allocation policy and lifecycle.
//!
//! The engine owns the [`LeaseStore`] behind a single writer lock and is
//! the only component that mutates it. Persistence runs outside the lock:
//! mutations set a dirty flag, and the auto-save task (or an explicit
//! [`LeaseEngine::save`]) clones the text image under a read lock and
//! writes it to a temp file followed by a rename.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConflictStrategy, SubnetConfig};
use crate::error::{Error, Result};
use crate::mac::MacAddr;
use crate::options::DhcpOption;
use crate::store::{Lease, LeaseFlavor, LeaseStore};

/// Conflict events older than this are pruned from the history.
const CONFLICT_RETENTION_SECS: i64 = 24 * 3600;
/// Hard cap on retained conflict events.
const CONFLICT_CAP: usize = 1024;
/// Lease history ring depth per IP.
const HISTORY_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct ConflictEvent {
    pub ip: Ipv4Addr,
    pub holder: MacAddr,
    pub claimant: MacAddr,
    pub strategy: ConflictStrategy,
    pub timestamp: DateTime<Utc>,
}

/// Inputs to one allocation decision.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub mac: MacAddr,
    /// Zero/None when the client expressed no preference.
    pub requested_ip: Option<Ipv4Addr>,
    pub subnet_name: String,
    pub client_id: Option<String>,
    pub hostname: Option<String>,
    pub vendor_class: Option<String>,
}

pub type ExpiryCallback = Box<dyn Fn(&Lease) + Send + Sync>;

pub struct LeaseEngine {
    config: Arc<Config>,
    store: RwLock<LeaseStore>,
    /// Addresses under DECLINE cooldown, keyed to the decline instant.
    declined: Mutex<HashMap<Ipv4Addr, DateTime<Utc>>>,
    conflicts: Mutex<VecDeque<ConflictEvent>>,
    history: Mutex<HashMap<Ipv4Addr, VecDeque<Lease>>>,
    expiry_callback: std::sync::Mutex<Option<ExpiryCallback>>,
    dirty: AtomicBool,
    save_lock: Mutex<()>,
}

impl LeaseEngine {
    /// Builds the engine, recovering the binding set from the configured
    /// lease file when one exists.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let mut store = LeaseStore::new();

        let lease_file = &config.server.lease_file;
        if lease_file.exists() {
            let image = tokio::fs::read_to_string(lease_file).await?;
            let loaded = store.load_image(&image);
            info!("Recovered {} leases from {}", loaded, lease_file.display());
            Self::rebind_subnets(&config, &mut store);
        }

        Ok(Self {
            config,
            store: RwLock::new(store),
            declined: Mutex::new(HashMap::new()),
            conflicts: Mutex::new(VecDeque::new()),
            history: Mutex::new(HashMap::new()),
            expiry_callback: std::sync::Mutex::new(None),
            dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        })
    }

    /// The lease file does not carry subnet names; re-derive them from the
    /// current configuration and drop dynamic leases that no configured
    /// range covers any more.
    fn rebind_subnets(config: &Config, store: &mut LeaseStore) {
        let rebound: Vec<(MacAddr, Option<String>)> = store
            .iter_active()
            .map(|lease| {
                let subnet = config
                    .subnet_containing(lease.ip)
                    .filter(|subnet| {
                        lease.flavor == LeaseFlavor::Static
                            || (subnet.in_range(lease.ip) && !subnet.is_excluded(lease.ip))
                    })
                    .map(|subnet| subnet.name.clone());
                (lease.mac, subnet)
            })
            .collect();

        for (mac, subnet) in rebound {
            match subnet {
                Some(name) => {
                    if let Some(lease) = store.get_by_mac(mac).cloned() {
                        let mut lease = lease;
                        lease.subnet = name;
                        let _ = store.replace(mac, lease);
                    }
                }
                None => {
                    warn!("Dropping recovered lease for {}: no covering subnet", mac);
                    store.remove(mac);
                }
            }
        }
    }

    pub fn set_expiry_callback(&self, callback: ExpiryCallback) {
        *self.expiry_callback.lock().expect("callback lock poisoned") = Some(callback);
    }

    fn subnet(&self, name: &str) -> Result<&SubnetConfig> {
        self.config
            .subnet_by_name(name)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown subnet: {}", name)))
    }

    /// The config-derived echo set pinned to a lease at allocation time.
    fn pinned_options(&self, subnet: &SubnetConfig, mac: MacAddr) -> Vec<DhcpOption> {
        let mut options: Vec<DhcpOption> = Vec::new();
        if let Some(reservation) = subnet.reservation_for(mac) {
            options.extend(reservation.options.iter().map(|raw| raw.to_option()));
        }
        options.extend(subnet.options.iter().map(|raw| raw.to_option()));
        options.extend(self.config.global_options.iter().map(|raw| raw.to_option()));
        options
    }

    /// Decides which IP the client gets: static reservation first, then
    /// the existing binding, then an honored request, then the ascending
    /// scan.
    pub async fn allocate(&self, request: AllocationRequest) -> Result<Lease> {
        let subnet = self.subnet(&request.subnet_name)?;
        let requested = request
            .requested_ip
            .filter(|ip| *ip != Ipv4Addr::UNSPECIFIED);

        let mut store = self.store.write().await;

        // Static reservations win over any request the client makes; the
        // client converges on re-request after the OFFER. The reserved
        // address is reclaimed unconditionally, whatever the conflict
        // strategy says about dynamic addresses.
        if let Some(reservation) = subnet.reservation_for(request.mac) {
            let lease_time = reservation.lease_time.unwrap_or(subnet.lease_time);
            let holder = store
                .get_by_ip(reservation.ip)
                .filter(|lease| lease.mac != request.mac && lease.active && !lease.is_expired())
                .map(|lease| lease.mac);
            if let Some(holder_mac) = holder {
                warn!(
                    "Evicting {} from {}: address is reserved for {}",
                    holder_mac, reservation.ip, request.mac
                );
                store.remove(holder_mac);
                self.dirty.store(true, Ordering::Release);
            }
            let mut lease = Lease::new_static(
                request.mac,
                reservation.ip,
                subnet.name.clone(),
                lease_time,
            );
            lease.hostname = request
                .hostname
                .clone()
                .or_else(|| reservation.hostname.clone());
            lease.description = reservation.description.clone();
            lease.vendor_class = request
                .vendor_class
                .clone()
                .or_else(|| reservation.vendor_class.clone());
            lease.client_id = request.client_id.clone();
            lease.pinned_options = self.pinned_options(subnet, request.mac);
            self.bind(&mut store, lease.clone()).await?;
            return Ok(lease);
        }

        // Idempotent DISCOVER: an existing binding is returned as long as
        // the client does not insist on a different address.
        if let Some(existing) = store.get_by_mac(request.mac)
            && existing.active
            && !existing.is_expired()
            && subnet.in_range(existing.ip)
            && requested.is_none_or(|ip| ip == existing.ip)
        {
            return Ok(existing.clone());
        }

        if let Some(ip) = requested
            && self.requestable(subnet, ip, request.mac).await
        {
            let holder = store
                .get_by_ip(ip)
                .filter(|lease| lease.mac != request.mac && lease.active && !lease.is_expired())
                .map(|lease| lease.mac);
            if let Some(holder_mac) = holder {
                self.resolve_conflict(&mut store, ip, holder_mac, request.mac, subnet.lease_time)
                    .await?;
            }
            let lease = self.make_dynamic(subnet, &request, ip);
            self.bind(&mut store, lease.clone()).await?;
            return Ok(lease);
        }

        // Ascending scan, deterministic tie-break.
        let start = u32::from(subnet.range_start);
        let end = u32::from(subnet.range_end);
        for ip_num in start..=end {
            let ip = Ipv4Addr::from(ip_num);
            if subnet.is_excluded(ip) {
                continue;
            }
            if subnet
                .reservation_owner(ip)
                .is_some_and(|owner| owner != request.mac)
            {
                continue;
            }
            if self.in_cooldown(ip).await {
                continue;
            }
            if store
                .get_by_ip(ip)
                .is_some_and(|lease| lease.mac != request.mac && lease.active && !lease.is_expired())
            {
                continue;
            }
            let lease = self.make_dynamic(subnet, &request, ip);
            self.bind(&mut store, lease.clone()).await?;
            return Ok(lease);
        }

        warn!("Pool exhausted in subnet {}", subnet.name);
        Err(Error::PoolExhausted(subnet.name.clone()))
    }

    /// Whether a client-requested address may be honored. An address held
    /// by another client stays requestable; the conflict strategy decides.
    async fn requestable(&self, subnet: &SubnetConfig, ip: Ipv4Addr, mac: MacAddr) -> bool {
        if !subnet.in_range(ip) || subnet.is_excluded(ip) {
            return false;
        }
        if subnet.reservation_owner(ip).is_some_and(|owner| owner != mac) {
            return false;
        }
        !self.in_cooldown(ip).await
    }

    fn make_dynamic(&self, subnet: &SubnetConfig, request: &AllocationRequest, ip: Ipv4Addr) -> Lease {
        let mut lease = Lease::new_dynamic(request.mac, ip, subnet.name.clone(), subnet.lease_time);
        lease.hostname = request.hostname.clone();
        lease.client_id = request.client_id.clone();
        lease.vendor_class = request.vendor_class.clone();
        lease.pinned_options = self.pinned_options(subnet, request.mac);
        lease
    }

    /// Inserts a lease, records it in the per-IP history ring and marks
    /// the store dirty.
    async fn bind(&self, store: &mut LeaseStore, lease: Lease) -> Result<()> {
        let previous_ip = store.get_by_mac(lease.mac).map(|existing| existing.ip);
        match previous_ip {
            None => {
                if store.len() >= self.config.server.max_leases as usize {
                    warn!("Lease cap {} reached", self.config.server.max_leases);
                    return Err(Error::PoolExhausted(lease.subnet.clone()));
                }
            }
            // A client moving to a new address gives up its old binding.
            Some(held) if held != lease.ip => {
                store.remove(lease.mac);
            }
            Some(_) => {}
        }

        store.insert(lease.clone())?;

        let mut history = self.history.lock().await;
        let ring = history.entry(lease.ip).or_default();
        ring.push_back(lease);
        while ring.len() > HISTORY_DEPTH {
            ring.pop_front();
        }
        drop(history);

        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Applies the configured conflict strategy when `claimant` wants an
    /// address actively held by `holder`. `Ok` means the caller may take
    /// the address over.
    async fn resolve_conflict(
        &self,
        store: &mut LeaseStore,
        ip: Ipv4Addr,
        holder: MacAddr,
        claimant: MacAddr,
        lease_time: u32,
    ) -> Result<()> {
        let strategy = self.config.server.conflict_strategy;
        self.record_conflict(ConflictEvent {
            ip,
            holder,
            claimant,
            strategy,
            timestamp: Utc::now(),
        })
        .await;

        match strategy {
            ConflictStrategy::Reject => {
                warn!("Conflict on {}: held by {}, rejecting {}", ip, holder, claimant);
                Err(Error::Conflict { ip, holder })
            }
            ConflictStrategy::Replace => {
                warn!("Conflict on {}: replacing {} with {}", ip, holder, claimant);
                store.remove(holder);
                self.dirty.store(true, Ordering::Release);
                Ok(())
            }
            ConflictStrategy::Extend => {
                warn!("Conflict on {}: extending the lease held by {}", ip, holder);
                if let Some(existing) = store.get_by_mac(holder).cloned() {
                    let mut extended = existing;
                    extended.expires_at += TimeDelta::seconds(lease_time as i64);
                    let _ = store.replace(holder, extended);
                    self.dirty.store(true, Ordering::Release);
                }
                Err(Error::Conflict { ip, holder })
            }
            ConflictStrategy::Negotiate => {
                warn!("Conflict on {}: queued for operator review", ip);
                Err(Error::Conflict { ip, holder })
            }
        }
    }

    async fn record_conflict(&self, event: ConflictEvent) {
        let mut conflicts = self.conflicts.lock().await;
        let cutoff = Utc::now() - TimeDelta::seconds(CONFLICT_RETENTION_SECS);
        while conflicts
            .front()
            .is_some_and(|event| event.timestamp < cutoff)
        {
            conflicts.pop_front();
        }
        conflicts.push_back(event);
        while conflicts.len() > CONFLICT_CAP {
            conflicts.pop_front();
        }
    }

    pub async fn conflict_events(&self) -> Vec<ConflictEvent> {
        self.conflicts.lock().await.iter().cloned().collect()
    }

    /// Renews an existing binding in place. The caller falls back to
    /// `allocate` on `UnknownLease`.
    pub async fn renew(&self, mac: MacAddr, ip: Ipv4Addr) -> Result<Lease> {
        let mut store = self.store.write().await;

        let existing = store
            .get_by_mac(mac)
            .filter(|lease| lease.active && lease.ip == ip)
            .cloned()
            .ok_or(Error::UnknownLease(mac))?;

        let subnet = self.subnet(&existing.subnet)?;
        let lease_time = match existing.flavor {
            LeaseFlavor::Static => subnet
                .reservation_for(mac)
                .and_then(|reservation| reservation.lease_time)
                .unwrap_or(subnet.lease_time),
            LeaseFlavor::Dynamic => subnet.lease_time,
        };

        let mut renewed = existing;
        renewed.restart_clock(lease_time);
        store.replace(mac, renewed.clone())?;
        self.dirty.store(true, Ordering::Release);
        debug!("Renewed {} for {}", ip, mac);
        Ok(renewed)
    }

    /// Releases a client's binding. Returns false (no error) when the MAC
    /// holds no lease.
    pub async fn release(&self, mac: MacAddr) -> bool {
        let mut store = self.store.write().await;
        match store.remove(mac) {
            Some(lease) => {
                info!("Released {} from {}", lease.ip, mac);
                self.dirty.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// DECLINE: cool the address down and drop the declining client's
    /// lease, whichever address it held.
    pub async fn decline(&self, mac: MacAddr, ip: Ipv4Addr) {
        self.declined.lock().await.insert(ip, Utc::now());
        let mut store = self.store.write().await;
        if store.get_by_mac(mac).is_some() {
            store.remove(mac);
        }
        self.dirty.store(true, Ordering::Release);
        warn!("{} declined {}; address cooling down", mac, ip);
    }

    async fn in_cooldown(&self, ip: Ipv4Addr) -> bool {
        let cooldown = self.config.server.decline_cooldown_secs as i64;
        let mut declined = self.declined.lock().await;
        match declined.get(&ip) {
            Some(declined_at) => {
                if (Utc::now() - *declined_at).num_seconds() < cooldown {
                    true
                } else {
                    declined.remove(&ip);
                    false
                }
            }
            None => false,
        }
    }

    /// One reaper pass: snapshot the expired set under the read lock, then
    /// remove each under the write lock, re-checking expiry.
    pub async fn reap_expired(&self) -> usize {
        let expired: Vec<MacAddr> = {
            let store = self.store.read().await;
            store
                .iter_all()
                .filter(|lease| lease.active && lease.is_expired())
                .map(|lease| lease.mac)
                .collect()
        };

        let mut reaped = 0;
        for mac in expired {
            let removed = {
                let mut store = self.store.write().await;
                match store.get_by_mac(mac) {
                    Some(lease) if lease.is_expired() => store.remove(mac),
                    _ => None,
                }
            };
            if let Some(lease) = removed {
                info!("Lease for {} at {} expired", lease.mac, lease.ip);
                reaped += 1;
                self.dirty.store(true, Ordering::Release);
                let callback = self.expiry_callback.lock().expect("callback lock poisoned");
                if let Some(callback) = callback.as_ref() {
                    callback(&lease);
                }
            }
        }
        reaped
    }

    /// Periodic reaper loop; exits at the next wake after shutdown.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.server.reaper_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let reaped = self.reap_expired().await;
                    if reaped > 0 {
                        debug!("Reaper removed {} expired leases", reaped);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Periodic auto-save loop; exits at the next wake after shutdown.
    pub async fn run_autosave(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.server.autosave_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if self.dirty.load(Ordering::Acquire)
                        && let Err(error) = self.save().await
                    {
                        // Keep serving from volatile state.
                        error!("Failed to persist leases: {}", error);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Writes the lease file: image cloned under the read lock, I/O done
    /// outside it, tempfile + rename against torn writes.
    pub async fn save(&self) -> Result<()> {
        let image = {
            let store = self.store.read().await;
            store.snapshot()
        };

        let _guard = self.save_lock.lock().await;
        let path = &self.config.server.lease_file;
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &image).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn get_by_mac(&self, mac: MacAddr) -> Option<Lease> {
        self.store.read().await.get_by_mac(mac).cloned()
    }

    pub async fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.store.read().await.get_by_ip(ip).cloned()
    }

    pub async fn active_lease_count(&self) -> usize {
        self.store.read().await.active_count()
    }

    pub async fn leases_in_subnet(&self, subnet_name: &str) -> Vec<Lease> {
        self.store
            .read()
            .await
            .iter_subnet(subnet_name)
            .cloned()
            .collect()
    }

    /// Active non-static leases over the usable pool, 0.0..=1.0.
    pub async fn utilization(&self, subnet_name: &str) -> Result<f64> {
        let subnet = self.subnet(subnet_name)?;
        let pool = subnet.pool_size();
        if pool == 0 {
            return Ok(0.0);
        }
        let store = self.store.read().await;
        let active = store
            .iter_subnet(subnet_name)
            .filter(|lease| lease.flavor == LeaseFlavor::Dynamic)
            .count();
        Ok(active as f64 / pool as f64)
    }

    /// Active leases whose expiry falls within the window from now.
    pub async fn expiring_within(&self, window: Duration) -> Vec<Lease> {
        let horizon = Utc::now() + TimeDelta::seconds(window.as_secs() as i64);
        let store = self.store.read().await;
        store
            .iter_active()
            .filter(|lease| lease.flavor == LeaseFlavor::Dynamic && lease.expires_at <= horizon)
            .cloned()
            .collect()
    }

    /// The bounded per-IP lease history, oldest first.
    pub async fn history_for(&self, ip: Ipv4Addr) -> Vec<Lease> {
        self.history
            .lock()
            .await
            .get(&ip)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}
