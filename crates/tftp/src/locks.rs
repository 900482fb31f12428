//! Cross-session store locking
//!
//! Concurrent sessions share one byte store. Every block's store operation
//! (read and send of a DATA block, or write and send of its ACK) runs under a
//! [`StoreGuard`] taken from [`StoreLocks`]. The [`LockPolicy`] decides how
//! wide that guard is.
//!
//! Independently of the policy, [`StoreLocks::claim_writer`] allows a single
//! writing session per resource name, so writes into one resource are never
//! interleaved.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// How widely store operations are serialized across sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockPolicy {
    /// One process-wide lock: store operations of all sessions are serialized.
    Global,
    /// One lock per resource name: sessions on different files never contend.
    #[default]
    PerResource,
    /// No locking, for a dispatcher that only ever runs one session.
    None,
}

impl LockPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::PerResource => "per-resource",
            Self::None => "none",
        }
    }
}

impl FromStr for LockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "per-resource" | "resource" => Ok(Self::PerResource),
            "none" => Ok(Self::None),
            _ => Err(format!("Unknown lock policy: {}", s)),
        }
    }
}

impl fmt::Display for LockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Covers one block's store read or write and the send of the packet it
/// produces, but not the wait for the peer's reply.
#[derive(Debug)]
pub struct StoreGuard {
    _guard: Option<OwnedMutexGuard<()>>,
}

/// Lock registry shared by all sessions of a server
#[derive(Debug, Default)]
pub struct StoreLocks {
    policy: LockPolicy,
    global: Arc<AsyncMutex<()>>,
    named: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
    writers: Mutex<HashSet<String>>,
}

fn lock_map<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StoreLocks {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Locks that never block, for the client and the serial dispatcher
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self::new(LockPolicy::None))
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Wait for exclusive store access to `name` under the configured policy
    pub async fn acquire(&self, name: &str) -> StoreGuard {
        let mutex = match self.policy {
            LockPolicy::None => return StoreGuard { _guard: None },
            LockPolicy::Global => Arc::clone(&self.global),
            LockPolicy::PerResource => self.named_mutex(name),
        };

        StoreGuard {
            _guard: Some(mutex.lock_owned().await),
        }
    }

    fn named_mutex(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut named = lock_map(&self.named);
        if let Some(existing) = named.get(name).and_then(Weak::upgrade) {
            return existing;
        }

        named.retain(|_, weak| weak.strong_count() > 0);
        let mutex = Arc::new(AsyncMutex::new(()));
        named.insert(name.to_string(), Arc::downgrade(&mutex));
        mutex
    }

    #[cfg(test)]
    fn tracked_resources(&self) -> usize {
        lock_map(&self.named)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Claim the right to write `name`. Returns `None` while another session holds it.
    pub fn claim_writer(self: &Arc<Self>, name: &str) -> Option<WriterClaim> {
        if !lock_map(&self.writers).insert(name.to_string()) {
            return None;
        }

        Some(WriterClaim {
            name: name.to_string(),
            locks: Arc::clone(self),
        })
    }
}

/// Exclusive write access to one resource name, released on drop
#[derive(Debug)]
pub struct WriterClaim {
    name: String,
    locks: Arc<StoreLocks>,
}

impl Drop for WriterClaim {
    fn drop(&mut self) {
        lock_map(&self.locks.writers).remove(&self.name);
    }
}
