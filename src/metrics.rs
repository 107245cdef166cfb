//! Periodic connection and throughput report.
//!
//! Each cycle drains every address's byte window, folds it into a smoothed
//! rate, and logs a summary. Rates are informational only.

use crate::admission::AdmissionTable;
use crate::registry::ClientRegistry;
use crate::throughput::ThroughputTracker;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Per-address figures for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressReport {
    pub address: IpAddr,
    pub active: usize,
    pub window_bytes: u64,
    pub bytes_per_second: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub clients: usize,
    pub addresses: Vec<AddressReport>,
}

pub struct Reporter {
    admission: Arc<AdmissionTable>,
    registry: Arc<ClientRegistry>,
    throughput: Arc<ThroughputTracker>,
    interval: Duration,
    /// Smoothed bytes per second from previous cycles
    speed: HashMap<IpAddr, u64>,
}

impl Reporter {
    pub fn new(
        admission: Arc<AdmissionTable>,
        registry: Arc<ClientRegistry>,
        throughput: Arc<ThroughputTracker>,
        interval: Duration,
    ) -> Self {
        Self {
            admission,
            registry,
            throughput,
            interval,
            speed: HashMap::new(),
        }
    }

    /// Close the current window and compute this cycle's report.
    pub fn cycle(&mut self) -> Report {
        let active = self.admission.snapshot();
        let windows = self.throughput.drain();
        let interval_ms = self.interval.as_millis().max(1) as u64;

        let mut addresses = Vec::with_capacity(windows.len());
        for (address, window_bytes) in windows {
            let rate = window_bytes.saturating_mul(1000) / interval_ms;
            let smoothed = match self.speed.get(&address) {
                Some(previous) => rate.saturating_add(*previous) / 2,
                None => rate,
            };
            self.speed.insert(address, smoothed);

            addresses.push(AddressReport {
                address,
                active: active.get(&address).copied().unwrap_or(0),
                window_bytes,
                bytes_per_second: smoothed,
            });
        }

        // Forget addresses that have gone quiet and have no connections left
        let idle: Vec<IpAddr> = addresses
            .iter()
            .filter(|a| a.active == 0 && a.window_bytes == 0)
            .map(|a| a.address)
            .collect();
        if !idle.is_empty() {
            self.throughput.retain(|address| !idle.contains(address));
            self.speed.retain(|address, _| !idle.contains(address));
        }

        addresses.sort_by_key(|a| a.address);
        Report {
            clients: self.registry.len(),
            addresses,
        }
    }

    /// Report every interval, forever.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let report = self.cycle();

            let connections: usize = report.addresses.iter().map(|a| a.active).sum();
            info!(
                clients = report.clients,
                connections,
                addresses = report.addresses.len(),
                "Relay status"
            );
            for address in &report.addresses {
                debug!(
                    address = %address.address,
                    active = address.active,
                    bytes_per_second = address.bytes_per_second,
                    "Address throughput"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(interval: Duration) -> (Arc<AdmissionTable>, Arc<ThroughputTracker>, Reporter) {
        let admission = AdmissionTable::new(10);
        let throughput = Arc::new(ThroughputTracker::new());
        let reporter = Reporter::new(
            Arc::clone(&admission),
            Arc::new(ClientRegistry::new()),
            Arc::clone(&throughput),
            interval,
        );
        (admission, throughput, reporter)
    }

    #[test]
    fn test_cycle_resets_window_and_smooths() {
        let (admission, throughput, mut reporter) = setup(Duration::from_secs(1));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let _guard = admission.try_admit(a).unwrap();

        throughput.increment(a, 1000);
        let report = reporter.cycle();
        assert_eq!(report.clients, 0);
        assert_eq!(
            report.addresses,
            vec![AddressReport {
                address: a,
                active: 1,
                window_bytes: 1000,
                bytes_per_second: 1000,
            }]
        );
        assert_eq!(throughput.get(&a), 0);

        throughput.increment(a, 3000);
        let report = reporter.cycle();
        assert_eq!(report.addresses[0].bytes_per_second, 2000);

        // Quiet but still connected: kept, rate decays
        let report = reporter.cycle();
        assert_eq!(report.addresses[0].bytes_per_second, 1000);
    }

    #[test]
    fn test_rate_scales_with_interval() {
        let (_admission, throughput, mut reporter) = setup(Duration::from_secs(2));
        let a: IpAddr = "10.0.0.1".parse().unwrap();

        throughput.increment(a, 1000);
        let report = reporter.cycle();
        assert_eq!(report.addresses[0].bytes_per_second, 500);
    }

    #[test]
    fn test_idle_disconnected_address_forgotten() {
        let (admission, throughput, mut reporter) = setup(Duration::from_secs(1));
        let a: IpAddr = "10.0.0.1".parse().unwrap();

        let guard = admission.try_admit(a).unwrap();
        throughput.set(a, 0);
        drop(guard);

        let report = reporter.cycle();
        assert_eq!(report.addresses.len(), 1);
        assert!(throughput.snapshot().is_empty());

        let report = reporter.cycle();
        assert!(report.addresses.is_empty());
    }
}
