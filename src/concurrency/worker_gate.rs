//! Worker-count cap shared by every task of one render.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// An N-permit gate; a task holds one permit for as long as it runs.
///
/// Cloning shares the permits.
#[derive(Clone)]
pub struct WorkerGate {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerGate {
    pub fn new(workers: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.get())),
            size: workers.get(),
        }
    }

    /// Wait for a free worker slot. `None` once the gate is closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Refuse all future acquisitions. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn gate(n: usize) -> WorkerGate {
        WorkerGate::new(NonZeroUsize::new(n).unwrap())
    }

    #[tokio::test]
    async fn caps_concurrent_holders() {
        let gate = gate(2);
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert!(timeout(Duration::from_millis(20), gate.acquire()).await.is_err());

        drop(a);
        assert!(timeout(Duration::from_millis(20), gate.acquire()).await.is_ok());
    }

    #[tokio::test]
    async fn clone_shares_permits() {
        let gate1 = gate(1);
        let gate2 = gate1.clone();

        let _permit = gate1.acquire().await.unwrap();
        assert!(timeout(Duration::from_millis(20), gate2.acquire()).await.is_err());
        assert_eq!(gate2.size(), 1);
    }

    #[tokio::test]
    async fn close_wakes_waiters_without_a_slot() {
        let gate = gate(1);
        let held = gate.acquire().await.unwrap();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acquire().await.is_none() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.close();

        assert!(waiter.await.unwrap());
        assert!(gate.acquire().await.is_none());
        drop(held);
    }
}
