use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{EngineError, EngineResult};
use crate::config::PortsConfig;
use crate::db::AppStore;

/// Hands out host ports from the managed range.
///
/// A port is free when no persisted app records it and a TCP listener can
/// be bound on it right now. Every operation runs under one lock so the
/// record lookup and the bind probe cannot interleave with another caller.
///
/// Ports returned by [`allocate`](Self::allocate) and
/// [`find_next_available`](Self::find_next_available) stay tentatively
/// reserved until the caller persists them and calls
/// [`release`](Self::release), or until the reservation expires.
///
/// `owner` names an app whose own persisted port should not count as taken.
pub struct PortAllocator {
    store: AppStore,
    start: u16,
    end: u16,
    probe_host: String,
    reservation_ttl: Duration,
    reserved: Mutex<HashMap<u16, Instant>>,
}

impl PortAllocator {
    pub fn new(store: AppStore, config: &PortsConfig) -> Self {
        Self {
            store,
            start: config.range_start,
            end: config.range_end,
            probe_host: config.probe_host.clone(),
            reservation_ttl: config.reservation_ttl(),
            reserved: Mutex::new(HashMap::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn in_range(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub async fn allocate(&self, owner: Option<&str>) -> EngineResult<u16> {
        let mut reserved = self.reserved.lock().await;
        self.expire(&mut reserved);
        let used = self.recorded(owner).await?;

        let port = self.scan(&used, &reserved)?;
        reserved.insert(port, Instant::now());
        tracing::debug!(port, "Allocated port");
        Ok(port)
    }

    /// True when no persisted app records `port` and it is bindable.
    /// Tentative reservations are not consulted.
    pub async fn is_available(&self, port: u16, owner: Option<&str>) -> EngineResult<bool> {
        let _guard = self.reserved.lock().await;
        let used = self.recorded(owner).await?;
        Ok(!used.contains(&port) && self.probe(port))
    }

    /// Tries `preferred` first when it lies in the managed range, otherwise
    /// scans like [`allocate`](Self::allocate).
    pub async fn find_next_available(
        &self,
        preferred: u16,
        owner: Option<&str>,
    ) -> EngineResult<u16> {
        let mut reserved = self.reserved.lock().await;
        self.expire(&mut reserved);
        let used = self.recorded(owner).await?;

        let port = if self.in_range(preferred) && self.is_free(preferred, &used, &reserved) {
            preferred
        } else {
            self.scan(&used, &reserved)?
        };
        reserved.insert(port, Instant::now());
        Ok(port)
    }

    /// Reserve exactly `port` if it is in range and free.
    pub async fn try_reserve(&self, port: u16, owner: Option<&str>) -> EngineResult<bool> {
        if !self.in_range(port) {
            return Ok(false);
        }
        let mut reserved = self.reserved.lock().await;
        self.expire(&mut reserved);
        let used = self.recorded(owner).await?;
        if !self.is_free(port, &used, &reserved) {
            return Ok(false);
        }
        reserved.insert(port, Instant::now());
        Ok(true)
    }

    /// The port `allocate` would pick, without reserving it.
    pub async fn suggest(&self) -> EngineResult<u16> {
        let mut reserved = self.reserved.lock().await;
        self.expire(&mut reserved);
        let used = self.recorded(None).await?;
        self.scan(&used, &reserved)
    }

    /// Drop the tentative reservation once the port is persisted.
    pub async fn release(&self, port: u16) {
        self.reserved.lock().await.remove(&port);
    }

    pub async fn used_ports(&self) -> EngineResult<Vec<u16>> {
        Ok(self.store.used_ports(None).await?)
    }

    async fn recorded(&self, owner: Option<&str>) -> EngineResult<HashSet<u16>> {
        Ok(self.store.used_ports(owner).await?.into_iter().collect())
    }

    fn expire(&self, reserved: &mut HashMap<u16, Instant>) {
        let ttl = self.reservation_ttl;
        reserved.retain(|_, at| at.elapsed() < ttl);
    }

    fn scan(&self, used: &HashSet<u16>, reserved: &HashMap<u16, Instant>) -> EngineResult<u16> {
        (self.start..=self.end)
            .find(|port| self.is_free(*port, used, reserved))
            .ok_or(EngineError::NoPortsAvailable {
                start: self.start,
                end: self.end,
            })
    }

    fn is_free(&self, port: u16, used: &HashSet<u16>, reserved: &HashMap<u16, Instant>) -> bool {
        !used.contains(&port) && !reserved.contains_key(&port) && self.probe(port)
    }

    /// Bind and immediately drop a listener.
    fn probe(&self, port: u16) -> bool {
        TcpListener::bind((self.probe_host.as_str(), port)).is_ok()
    }
}
