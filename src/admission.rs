//! Per-address connection admission.
//!
//! Counts active connections per source host and refuses new sockets from
//! a host already at the ceiling. Each admitted connection holds an
//! `AdmissionGuard`; dropping it releases the slot, so teardown decrements
//! exactly once whatever path the connection took.

use crate::error::RelayError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

/// Active connection counts keyed by source host.
pub struct AdmissionTable {
    active: Mutex<HashMap<IpAddr, usize>>,
    max_per_address: usize,
}

impl AdmissionTable {
    pub fn new(max_per_address: usize) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(HashMap::new()),
            max_per_address,
        })
    }

    /// Reserve a connection slot for `address`.
    pub fn try_admit(self: &Arc<Self>, address: IpAddr) -> Result<AdmissionGuard, RelayError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let count = active.entry(address).or_insert(0);
        if *count >= self.max_per_address {
            return Err(RelayError::AdmissionRejected {
                address,
                active: *count,
            });
        }
        *count += 1;

        Ok(AdmissionGuard {
            table: Arc::clone(self),
            address,
            first_seen: *count == 1,
        })
    }

    /// Copy of all non-zero counts.
    pub fn snapshot(&self) -> HashMap<IpAddr, usize> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn release(&self, address: &IpAddr) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = active.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(address);
            }
        }
    }
}

/// A held connection slot; released on drop.
pub struct AdmissionGuard {
    table: Arc<AdmissionTable>,
    address: IpAddr,
    first_seen: bool,
}

impl AdmissionGuard {
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// True if no other connection from this address was active at admission.
    pub fn first_seen(&self) -> bool {
        self.first_seen
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.table.release(&self.address);
    }
}
