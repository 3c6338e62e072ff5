//! Reference-counted pool of loaded synthesis backends.
//!
//! Backends are keyed by [`BackendKey`] (kind + config fingerprint). The pool
//! keeps at most `max_resident` of them loaded and evicts the least recently
//! used *unreferenced* entry when a new key needs room. If every resident
//! entry is in use, the new backend is loaded anyway: the cap is soft so that
//! workers never deadlock waiting on each other.
//!
//! All bookkeeping happens under one mutex; `load`/`unload` run outside it so
//! unrelated keys never wait on each other. Concurrent acquisitions of the
//! same key share one instance and one load.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::provider::SynthesisBackend;
use super::registry::{BackendConfig, BackendKey, BackendKind, BackendRegistry};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no backend registered for kind '{0}'")]
    Unregistered(BackendKind),

    #[error("failed to load backend {key}: {reason}")]
    Load { key: BackendKey, reason: String },

    #[error("backend '{requested}' failed to load and fallback '{fallback}' failed too: {reason}")]
    FallbackFailed {
        requested: BackendKind,
        fallback: BackendKind,
        reason: String,
    },

    #[error("backend pool is shut down")]
    ShutDown,
}

struct PoolEntry {
    kind: BackendKind,
    instance: Arc<dyn SynthesisBackend>,
    /// Initialized once `load` has succeeded.
    ready: Arc<OnceCell<()>>,
    ref_count: usize,
    /// Logical clock value of the last acquire/release.
    last_used: u64,
    acquisitions: u64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<BackendKey, PoolEntry>,
    clock: u64,
    closed: bool,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Remove idle entries, oldest first, until there is room for one more.
    ///
    /// Only entries with `ref_count == 0` are candidates; the check and the
    /// removal happen under the same lock, so a concurrent acquire can never
    /// observe a removed entry.
    fn evict_for_insert(&mut self, max_resident: usize) -> Vec<(BackendKey, PoolEntry)> {
        let mut victims = Vec::new();
        while self.entries.len() >= max_resident {
            let candidate = self
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());

            let Some(key) = candidate else {
                warn!(
                    resident = self.entries.len(),
                    max_resident, "all resident backends in use; exceeding pool size"
                );
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                victims.push((key, entry));
            }
        }
        victims
    }
}

struct PoolInner {
    registry: BackendRegistry,
    max_resident: usize,
    fallback: BackendKind,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        // Critical sections never await or panic mid-update, so a poisoned
        // lock still guards consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, key: &BackendKey, instance: &Arc<dyn SynthesisBackend>) {
        let orphan = {
            let mut state = self.state();
            let now = state.tick();
            let closed = state.closed;
            let Some(entry) = state
                .entries
                .get_mut(key)
                .filter(|e| Arc::ptr_eq(&e.instance, instance))
            else {
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_used = now;
            debug!(key = %key, refs = entry.ref_count, "backend released");

            if closed && entry.ref_count == 0 {
                state.entries.remove(key)
            } else {
                None
            }
        };

        if let Some(entry) = orphan {
            unload_detached(key.clone(), entry);
        }
    }

    /// Undo the reference taken by an acquisition that never produced a
    /// handle (load failed, or the acquiring future was dropped).
    fn abandon(&self, key: &BackendKey, instance: &Arc<dyn SynthesisBackend>) {
        let removed = {
            let mut state = self.state();
            let closed = state.closed;
            let remove = match state
                .entries
                .get_mut(key)
                .filter(|e| Arc::ptr_eq(&e.instance, instance))
            {
                Some(entry) => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    entry.ref_count == 0 && (closed || !entry.ready.initialized())
                }
                None => false,
            };
            if remove {
                state.entries.remove(key)
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            debug!(key = %key, "abandoned pool entry removed");
            unload_detached(key.clone(), entry);
        }
    }
}

/// A reference counted in the pool but not yet handed out as a
/// [`BackendHandle`]. Dropping it gives the reference back.
struct PendingRef {
    pool: Arc<PoolInner>,
    key: BackendKey,
    instance: Arc<dyn SynthesisBackend>,
    armed: bool,
}

impl PendingRef {
    fn into_handle(mut self, kind: BackendKind) -> BackendHandle {
        self.armed = false;
        BackendHandle {
            pool: Arc::clone(&self.pool),
            key: self.key.clone(),
            kind,
            backend: Arc::clone(&self.instance),
        }
    }
}

impl Drop for PendingRef {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon(&self.key, &self.instance);
        }
    }
}

async fn unload_entry(key: &BackendKey, entry: PoolEntry) {
    if !entry.ready.initialized() {
        return;
    }
    match entry.instance.unload().await {
        Ok(()) => info!(key = %key, "backend unloaded"),
        Err(e) => warn!(key = %key, error = %e, "backend unload failed"),
    }
}

/// Unload from a synchronous context (handle drop after shutdown).
fn unload_detached(key: BackendKey, entry: PoolEntry) {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move { unload_entry(&key, entry).await });
        }
        Err(_) => warn!(key = %key, "no runtime available; backend dropped without unload"),
    }
}

/// A live backend reference. Dropping it releases the reference.
pub struct BackendHandle {
    pool: Arc<PoolInner>,
    key: BackendKey,
    kind: BackendKind,
    backend: Arc<dyn SynthesisBackend>,
}

impl BackendHandle {
    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    /// The kind actually serving this handle (differs from the request after
    /// a fallback).
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn backend(&self) -> &Arc<dyn SynthesisBackend> {
        &self.backend
    }
}

impl Deref for BackendHandle {
    type Target = dyn SynthesisBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.pool.release(&self.key, &self.backend);
    }
}

/// Snapshot of one resident entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentBackend {
    pub key: String,
    pub kind: BackendKind,
    pub ref_count: usize,
    pub acquisitions: u64,
    pub loaded: bool,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub max_resident: usize,
    /// Sorted by key.
    pub resident: Vec<ResidentBackend>,
}

/// Bounded, reference-counted backend pool. Cloning shares the pool.
#[derive(Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

impl BackendPool {
    pub fn new(registry: BackendRegistry, max_resident: usize) -> Self {
        Self::with_fallback(registry, max_resident, BackendKind::DefaultFast)
    }

    pub fn with_fallback(
        registry: BackendRegistry,
        max_resident: usize,
        fallback: BackendKind,
    ) -> Self {
        info!(max_resident, %fallback, "backend pool initialized");
        Self {
            inner: Arc::new(PoolInner {
                registry,
                max_resident: max_resident.max(1),
                fallback,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn max_resident(&self) -> usize {
        self.inner.max_resident
    }

    /// Acquire a loaded backend, falling back once to the default kind if
    /// the requested one cannot be loaded.
    pub async fn acquire(
        &self,
        kind: BackendKind,
        config: &BackendConfig,
    ) -> Result<BackendHandle, PoolError> {
        match self.acquire_exact(kind, config).await {
            Ok(handle) => Ok(handle),
            Err(err @ (PoolError::Load { .. } | PoolError::Unregistered(_)))
                if kind != self.inner.fallback =>
            {
                let fallback = self.inner.fallback;
                warn!(requested = %kind, %fallback, error = %err, "falling back to default backend");
                self.acquire_exact(fallback, &BackendConfig::default())
                    .await
                    .map_err(|e| PoolError::FallbackFailed {
                        requested: kind,
                        fallback,
                        reason: e.to_string(),
                    })
            }
            Err(e) => Err(e),
        }
    }

    /// Acquire exactly `kind`/`config`, without fallback.
    pub async fn acquire_exact(
        &self,
        kind: BackendKind,
        config: &BackendConfig,
    ) -> Result<BackendHandle, PoolError> {
        let key = BackendKey::new(kind, config);

        let (instance, ready, victims) = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(PoolError::ShutDown);
            }
            let now = state.tick();

            if let Some(entry) = state.entries.get_mut(&key) {
                entry.ref_count += 1;
                entry.last_used = now;
                entry.acquisitions += 1;
                debug!(key = %key, refs = entry.ref_count, "backend pool hit");
                (Arc::clone(&entry.instance), Arc::clone(&entry.ready), Vec::new())
            } else {
                let instance = self
                    .inner
                    .registry
                    .create(kind, config)
                    .ok_or(PoolError::Unregistered(kind))?;
                let victims = state.evict_for_insert(self.inner.max_resident);
                let ready = Arc::new(OnceCell::new());
                state.entries.insert(
                    key.clone(),
                    PoolEntry {
                        kind,
                        instance: Arc::clone(&instance),
                        ready: Arc::clone(&ready),
                        ref_count: 1,
                        last_used: now,
                        acquisitions: 1,
                    },
                );
                debug!(key = %key, evicting = victims.len(), "backend pool miss");
                (instance, ready, victims)
            }
        };

        let pending = PendingRef {
            pool: Arc::clone(&self.inner),
            key: key.clone(),
            instance: Arc::clone(&instance),
            armed: true,
        };

        // unloads run on their own tasks so they complete even if this
        // acquisition is dropped while waiting
        let unloads: Vec<_> = victims
            .into_iter()
            .map(|(victim_key, victim)| {
                info!(key = %victim_key, "evicting least recently used backend");
                tokio::spawn(async move { unload_entry(&victim_key, victim).await })
            })
            .collect();
        for unload in unloads {
            if let Err(e) = unload.await {
                warn!(error = %e, "backend unload task failed");
            }
        }

        let loaded = ready
            .get_or_try_init(|| async {
                info!(key = %key, backend = instance.name(), "loading backend");
                instance.load().await
            })
            .await;

        match loaded {
            Ok(()) => Ok(pending.into_handle(kind)),
            Err(e) => {
                drop(pending);
                warn!(key = %key, error = %e, "backend load failed");
                Err(PoolError::Load {
                    key,
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Explicitly return a handle. Equivalent to dropping it.
    pub fn release(&self, handle: BackendHandle) {
        drop(handle);
    }

    /// Run `f` with a backend held for exactly its duration.
    ///
    /// The reference is released when `f` completes, fails or is dropped.
    pub async fn scoped<F, Fut, T, E>(
        &self,
        kind: BackendKind,
        config: &BackendConfig,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<dyn SynthesisBackend>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let handle = self.acquire(kind, config).await?;
        let result = f(Arc::clone(handle.backend())).await;
        drop(handle);
        result
    }

    /// Load the given backends ahead of time. Failures are logged and skipped.
    pub async fn preload(&self, backends: &[(BackendKind, BackendConfig)]) -> usize {
        let mut loaded = 0;
        for (kind, config) in backends {
            match self.acquire_exact(*kind, config).await {
                Ok(handle) => {
                    loaded += 1;
                    drop(handle);
                }
                Err(e) => warn!(%kind, error = %e, "preload failed"),
            }
        }
        loaded
    }

    /// Number of entries currently in the pool (loaded or loading).
    pub fn resident_count(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        let mut resident: Vec<ResidentBackend> = state
            .entries
            .iter()
            .map(|(key, e)| ResidentBackend {
                key: key.to_string(),
                kind: e.kind,
                ref_count: e.ref_count,
                acquisitions: e.acquisitions,
                loaded: e.ready.initialized(),
            })
            .collect();
        resident.sort_by(|a, b| a.key.cmp(&b.key));
        PoolStats {
            max_resident: self.inner.max_resident,
            resident,
        }
    }

    /// Unload every idle backend and refuse further acquisitions.
    ///
    /// Backends still referenced are unloaded when their last handle drops.
    pub async fn shutdown(&self) {
        let idle: Vec<(BackendKey, PoolEntry)> = {
            let mut state = self.inner.state();
            state.closed = true;
            let idle_keys: Vec<BackendKey> = state
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .map(|(k, _)| k.clone())
                .collect();
            let busy = state.entries.len() - idle_keys.len();
            if busy > 0 {
                warn!(busy, "shutting down with backends still in use");
            }
            idle_keys
                .into_iter()
                .filter_map(|k| state.entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        info!(count = idle.len(), "unloading all idle backends");
        for (key, entry) in idle {
            unload_entry(&key, entry).await;
        }
    }
}
