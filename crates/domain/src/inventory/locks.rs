use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Hands out one writer lease per machine, within this process.
///
/// Other processes sharing the store are kept out by the repository's conditional
/// writes, not by this map.
#[derive(Default)]
pub struct MachineLocks {
    locks: DashMap<i32, Arc<Mutex<()>>>,
}

/// Exclusive right to mutate one machine's slots. Released on drop.
pub struct MachineLease {
    machine_id: i32,
    _guard: OwnedMutexGuard<()>,
}

impl MachineLease {
    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }
}

impl std::fmt::Debug for MachineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineLease").field("machine_id", &self.machine_id).finish()
    }
}

impl MachineLocks {
    pub async fn acquire(&self, machine_id: i32) -> MachineLease {
        // the shard guard must be gone before awaiting the machine lock
        let lock = self.locks.entry(machine_id).or_default().clone();

        MachineLease {
            machine_id,
            _guard: lock.lock_owned().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn leases_serialize_per_machine() {
        let locks = MachineLocks::default();
        let held = locks.acquire(1).await;

        // another machine is unaffected
        let other = locks.acquire(2).await;
        assert_eq!(other.machine_id(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(1)).await;
        assert!(blocked.is_err());

        drop(held);
        let lease = locks.acquire(1).await;
        assert_eq!(lease.machine_id(), 1);
    }

    #[tokio::test]
    async fn one_lock_per_machine() {
        let locks = MachineLocks::default();
        drop(locks.acquire(1).await);
        drop(locks.acquire(1).await);
        drop(locks.acquire(3).await);

        assert_eq!(locks.locks.len(), 2);
    }
}
