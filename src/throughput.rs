//! Per-address byte counters.
//!
//! Connections add the bytes they read; the reporting cycle reads and
//! resets each address's window. Nothing enforces a rate from these
//! values yet.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

/// Accumulated bytes per source address for the current window.
#[derive(Debug, Default)]
pub struct ThroughputTracker {
    windows: Mutex<HashMap<IpAddr, u64>>,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, address: IpAddr, amount: u64) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let total = windows.entry(address).or_insert(0);
        *total = total.saturating_add(amount);
    }

    pub fn set(&self, address: IpAddr, amount: u64) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.insert(address, amount);
    }

    #[allow(dead_code)]
    pub fn get(&self, address: &IpAddr) -> u64 {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.get(address).copied().unwrap_or(0)
    }

    #[allow(dead_code)]
    pub fn snapshot(&self) -> HashMap<IpAddr, u64> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read every window and reset it to zero under one lock, so no
    /// increment falls between the read and the reset.
    pub fn drain(&self) -> HashMap<IpAddr, u64> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .iter_mut()
            .map(|(address, total)| (*address, std::mem::take(total)))
            .collect()
    }

    /// Drop addresses for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&IpAddr) -> bool) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|address, _| keep(address));
    }
}
