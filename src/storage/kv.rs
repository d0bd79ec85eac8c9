//! External key-value service backend.
//!
//! The service's wire protocol is hidden behind [`KvTransport`]. This module
//! adds what every such service needs on our side: a key namespace, bounded
//! retries for transient failures, and an HA lock built on the service's
//! session locks.
//!
//! [`LoopbackKv`] is an in-process service that speaks the same contract and
//! can inject faults.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{immediate_children, Backend, Capabilities, HaBackend, HaLock, RetryPolicy};
use crate::error::{BackendError, Result};

/// Client side of an external key-value service.
///
/// Implementations classify their failures: connection resets and timeouts
/// are transient, rejected requests are permanent.
pub trait KvTransport: Send + Sync {
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, BackendError>;

    fn put(&self, key: &str, value: &[u8]) -> std::result::Result<(), BackendError>;

    fn delete(&self, key: &str) -> std::result::Result<(), BackendError>;

    /// Every key under `prefix`, recursively, sorted.
    fn keys(&self, prefix: &str) -> std::result::Result<Vec<String>, BackendError>;

    /// Acquire `key` for `holder` if free. Re-acquiring one's own lock succeeds.
    fn try_lock(&self, key: &str, holder: &str) -> std::result::Result<bool, BackendError>;

    fn unlock(&self, key: &str, holder: &str) -> std::result::Result<(), BackendError>;

    fn lock_holder(&self, key: &str) -> std::result::Result<Option<String>, BackendError>;
}

/// Backend over a [`KvTransport`], confined to a key namespace.
pub struct KvBackend {
    transport: Arc<dyn KvTransport>,
    namespace: String,
    retry: RetryPolicy,
}

impl KvBackend {
    pub fn new(transport: Arc<dyn KvTransport>, namespace: impl Into<String>, retry: RetryPolicy) -> Self {
        let mut namespace = namespace.into();
        if !namespace.is_empty() && !namespace.ends_with('/') {
            namespace.push('/');
        }
        Self {
            transport,
            namespace,
            retry,
        }
    }

    fn full(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }
}

impl Backend for KvBackend {
    fn name(&self) -> &'static str {
        "kv"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ha_enabled: true,
            ..Capabilities::default()
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full = self.full(key);
        self.retry.run("kv.get", || self.transport.get(&full))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let full = self.full(key);
        self.retry.run("kv.put", || self.transport.put(&full, value))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full = self.full(key);
        self.retry.run("kv.delete", || self.transport.delete(&full))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full = self.full(prefix);
        let keys = self.retry.run("kv.list", || self.transport.keys(&full))?;
        Ok(immediate_children(keys.iter().map(String::as_str), &full))
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }
}

impl HaBackend for KvBackend {
    fn try_lock(&self, key: &str, holder: &str) -> Result<Option<Box<dyn HaLock>>> {
        let full = self.full(key);
        let acquired = self
            .retry
            .run("kv.lock", || self.transport.try_lock(&full, holder))?;
        if !acquired {
            debug!(key = %full, holder, "HA lock held elsewhere");
            return Ok(None);
        }
        info!(key = %full, holder, "acquired HA lock");
        Ok(Some(Box::new(KvLock {
            transport: Arc::clone(&self.transport),
            key: full,
            holder: holder.to_string(),
            released: AtomicBool::new(false),
        })))
    }
}

/// A session lock on the external service. Released on drop.
struct KvLock {
    transport: Arc<dyn KvTransport>,
    key: String,
    holder: String,
    released: AtomicBool,
}

impl HaLock for KvLock {
    fn holder(&self) -> &str {
        &self.holder
    }

    fn is_held(&self) -> Result<bool> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let current = self.transport.lock_holder(&self.key)?;
        Ok(current.as_deref() == Some(self.holder.as_str()))
    }

    fn release(&self) -> Result<()> {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.transport.unlock(&self.key, &self.holder)?;
            info!(key = %self.key, holder = %self.holder, "released HA lock");
        }
        Ok(())
    }
}

impl Drop for KvLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

// ---------------------------------------------------------------------------
// In-process service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LoopbackState {
    data: BTreeMap<String, Vec<u8>>,
    locks: HashMap<String, String>,
    faults: VecDeque<BackendError>,
    write_faults: HashMap<String, BackendError>,
}

/// An in-process key-value service.
///
/// Cloning shares the service, so several backends (or a restarted one) see
/// the same data and locks.
#[derive(Clone, Default)]
pub struct LoopbackKv {
    state: Arc<Mutex<LoopbackState>>,
    calls: Arc<AtomicUsize>,
}

impl LoopbackKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with `err`. Queued faults fire in order.
    pub fn inject_fault(&self, err: BackendError) {
        self.state.lock().faults.push_back(err);
    }

    /// Make every put or delete of `key` fail with `err` until [`Self::heal`].
    pub fn fail_writes_to(&self, key: impl Into<String>, err: BackendError) {
        self.state.lock().write_faults.insert(key.into(), err);
    }

    /// Drop every injected fault.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.write_faults.clear();
    }

    /// Calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Raw view of a stored value, bypassing any namespace.
    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().data.get(key).cloned()
    }

    /// Overwrite a stored value, bypassing any namespace.
    pub fn raw_put(&self, key: &str, value: Vec<u8>) {
        self.state.lock().data.insert(key.to_string(), value);
    }

    fn serve<T>(
        &self,
        op: impl FnOnce(&mut LoopbackState) -> T,
    ) -> std::result::Result<T, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault);
        }
        Ok(op(&mut state))
    }

    fn serve_write(
        &self,
        key: &str,
        op: impl FnOnce(&mut LoopbackState),
    ) -> std::result::Result<(), BackendError> {
        self.serve(|s| {
            if let Some(fault) = s.write_faults.get(key).cloned() {
                return Err(fault);
            }
            op(s);
            Ok(())
        })?
    }
}

impl KvTransport for LoopbackKv {
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, BackendError> {
        self.serve(|s| s.data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> std::result::Result<(), BackendError> {
        self.serve_write(key, |s| {
            s.data.insert(key.to_string(), value.to_vec());
        })
    }

    fn delete(&self, key: &str) -> std::result::Result<(), BackendError> {
        self.serve_write(key, |s| {
            s.data.remove(key);
        })
    }

    fn keys(&self, prefix: &str) -> std::result::Result<Vec<String>, BackendError> {
        self.serve(|s| {
            s.data
                .range(prefix.to_string()..)
                .map(|(k, _)| k)
                .take_while(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        })
    }

    fn try_lock(&self, key: &str, holder: &str) -> std::result::Result<bool, BackendError> {
        self.serve(|s| match s.locks.get(key) {
            Some(current) => current == holder,
            None => {
                s.locks.insert(key.to_string(), holder.to_string());
                true
            }
        })
    }

    fn unlock(&self, key: &str, holder: &str) -> std::result::Result<(), BackendError> {
        self.serve(|s| {
            if s.locks.get(key).map(String::as_str) == Some(holder) {
                s.locks.remove(key);
            }
        })
    }

    fn lock_holder(&self, key: &str) -> std::result::Result<Option<String>, BackendError> {
        self.serve(|s| s.locks.get(key).cloned())
    }
}
