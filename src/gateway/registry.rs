//! Gateway registry and duplicate-frame cache (spec §4.5/§C5).
//!
//! Grounded on `original_source/floranet/lora_gateway.py`'s
//! `LoraInterface._configuredGateway` (host-keyed lookup, dynamic PULL
//! port learned per PULL_DATA) and `floranet/netserver.py`'s
//! `_checkDuplicateMessage`/`_cleanMessageCache` (MIC+timestamp dedup,
//! periodically swept).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Per-host gateway entry: EUI plus the address/port most recently learned
/// from a PULL_DATA keepalive — replaces the teacher's single-gateway
/// `GatewayTracker`, which could only ever address one device.
#[derive(Debug, Clone)]
pub struct GatewayEntry {
    pub eui: [u8; 8],
    pub addr: SocketAddr,
}

#[derive(Debug, Default)]
pub struct GatewayRegistry {
    by_host: RwLock<HashMap<String, GatewayEntry>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record/refresh a gateway's address, keyed by its EUI-derived host
    /// identity (hex-encoded EUI, matching how the admin CRUD rows key
    /// gateways by `host`).
    pub async fn observe(&self, host: &str, eui: [u8; 8], addr: SocketAddr) {
        self.by_host.write().await.insert(host.to_string(), GatewayEntry { eui, addr });
    }

    pub async fn lookup(&self, host: &str) -> Option<GatewayEntry> {
        self.by_host.read().await.get(host).cloned()
    }

    pub async fn remove(&self, host: &str) {
        self.by_host.write().await.remove(host);
    }

    pub async fn all(&self) -> Vec<(String, GatewayEntry)> {
        self.by_host.read().await.iter().map(|(h, e)| (h.clone(), e.clone())).collect()
    }
}

/// MIC-keyed duplicate-uplink cache: a frame seen twice (by independent
/// gateways, or retransmitted) within `duplicateperiod` seconds is
/// suppressed past the first delivery, per spec §4.5/§5.
#[derive(Default)]
pub struct DuplicateCache {
    seen: RwLock<HashMap<u32, Instant>>,
}

impl DuplicateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this MIC was already seen within `period`
    /// (the caller should drop the frame); otherwise records it.
    pub async fn check_and_record(&self, mic: u32, period: Duration) -> bool {
        let now = Instant::now();
        let mut guard = self.seen.write().await;
        if let Some(seen_at) = guard.get(&mic) {
            if now.duration_since(*seen_at) < period {
                return true;
            }
        }
        guard.insert(mic, now);
        false
    }

    /// Periodic sweep removing entries older than `period` — call this
    /// from a background task, mirroring floranet's `_cleanMessageCache`
    /// `LoopingCall`.
    pub async fn sweep(&self, period: Duration) {
        let now = Instant::now();
        self.seen.write().await.retain(|_, seen_at| now.duration_since(*seen_at) < period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_learns_and_looks_up_by_host() {
        let registry = GatewayRegistry::new();
        let addr: SocketAddr = "127.0.0.1:1700".parse().unwrap();
        registry.observe("gw-1", [0xAA; 8], addr).await;
        let entry = registry.lookup("gw-1").await.unwrap();
        assert_eq!(entry.addr, addr);
    }

    #[tokio::test]
    async fn duplicate_cache_suppresses_within_period() {
        let cache = DuplicateCache::new();
        let period = Duration::from_secs(5);
        assert!(!cache.check_and_record(0xDEADBEEF, period).await);
        assert!(cache.check_and_record(0xDEADBEEF, period).await);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let cache = DuplicateCache::new();
        cache.check_and_record(0x01, Duration::from_secs(60)).await;
        cache.sweep(Duration::from_nanos(1)).await;
        assert!(!cache.check_and_record(0x01, Duration::from_secs(60)).await);
    }
}
