//! Per-interface mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::debug;

use crate::error::TunnelError;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Lock table keyed by interface name.
///
/// Entries exist only while someone holds or waits for them.
#[derive(Default)]
pub struct InterfaceLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InterfaceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots()
            .entry(name.to_string())
            .or_insert_with(Slot::default)
            .clone()
    }

    fn prune(&self, names: &[String]) {
        let mut slots = self.slots();
        for name in names {
            if slots.get(name).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                slots.remove(name);
            }
        }
    }

    /// Lock every name in `names`, waiting at most `timeout` in total.
    ///
    /// Names are locked in sorted order so two callers locking overlapping
    /// sets cannot deadlock.
    pub async fn acquire(
        self: &Arc<Self>,
        names: &[&str],
        timeout: Duration,
    ) -> Result<InterfaceGuard, TunnelError> {
        let mut names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        names.sort();
        names.dedup();

        let deadline = Instant::now() + timeout;
        let mut guard = InterfaceGuard {
            held: Vec::with_capacity(names.len()),
            names: names.clone(),
            locks: Arc::clone(self),
        };

        for name in names {
            let slot = self.slot(&name);
            match tokio::time::timeout_at(deadline, slot.lock_owned()).await {
                Ok(held) => guard.held.push(held),
                Err(_) => {
                    debug!(interface = %name, "Timed out waiting for interface lock");
                    return Err(TunnelError::Busy(name));
                }
            }
        }

        Ok(guard)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots().len()
    }
}

/// Held interface locks. Released on drop.
pub struct InterfaceGuard {
    held: Vec<OwnedMutexGuard<()>>,
    names: Vec<String>,
    locks: Arc<InterfaceLocks>,
}

impl Drop for InterfaceGuard {
    fn drop(&mut self) {
        self.held.clear();
        self.locks.prune(&self.names);
    }
}
