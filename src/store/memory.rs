use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{CronError, Result};
use crate::store::{
    CoordinationStore, KeyValue, LeaseId, LeaseKeepAlive, PrefixSnapshot, WatchBatch, WatchEvent,
    WatchStream,
};

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchBatch>>,
}

/// Store state. Every mutation bumps `revision` once and is appended to
/// `history`, which is never compacted, so a watch can resume from any
/// revision.
struct State {
    revision: i64,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease_id: LeaseId,
    history: Vec<(i64, WatchEvent)>,
    watchers: Vec<Watcher>,
}

impl State {
    fn new() -> Self {
        Self {
            // etcd reports revision 1 for an empty cluster
            revision: 1,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease_id: 1,
            history: Vec::new(),
            watchers: Vec::new(),
        }
    }

    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision += 1;
        let revision = self.revision;
        self.history
            .extend(events.iter().cloned().map(|event| (revision, event)));

        self.watchers.retain(|watcher| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|event| event.key().starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchBatch {
                    revision,
                    events: matching,
                }))
                .is_ok()
        });
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Option<Vec<u8>> {
        let previous = self.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(old_lease) = previous.as_ref().and_then(|e| e.lease) {
            if let Some(l) = self.leases.get_mut(&old_lease) {
                l.keys.remove(key);
            }
        }
        if let Some(lease) = lease {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.insert(key.to_string());
            }
        }
        self.commit(vec![WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value,
        })]);
        previous.map(|e| e.value)
    }

    fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        let previous = self.kvs.remove(key)?;
        if let Some(l) = previous.lease.and_then(|id| self.leases.get_mut(&id)) {
            l.keys.remove(key);
        }
        self.commit(vec![WatchEvent::Delete {
            key: key.to_string(),
        }]);
        Some(previous.value)
    }

    /// Drop a lease and every key attached to it, as one revision.
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        let events = keys
            .into_iter()
            .filter(|key| self.kvs.remove(key).is_some())
            .map(|key| WatchEvent::Delete { key })
            .collect();
        self.commit(events);
        true
    }

    fn live_lease(&self, id: LeaseId) -> Result<()> {
        if self.leases.contains_key(&id) {
            Ok(())
        } else {
            Err(CronError::LeaseExpired(id))
        }
    }
}

/// In-process [`CoordinationStore`].
///
/// Leases expire on a tokio timer, so a `MemoryStore` must be used from
/// within a tokio runtime.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Current store revision.
    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    /// Number of leases that have been granted and not yet expired or revoked.
    pub async fn lease_count(&self) -> usize {
        self.state.lock().await.leases.len()
    }

    /// Raw value of a single key.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().await.kvs.get(key).map(|e| e.value.clone())
    }

    /// Renew a lease once. Returns the TTL it was extended by, or 0 if the
    /// lease no longer exists.
    pub async fn keep_alive_once(&self, lease: LeaseId) -> i64 {
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + Duration::from_secs(l.ttl as u64);
                l.ttl
            }
            None => 0,
        }
    }

    /// End every open watch stream, as a lost connection to the store would.
    pub async fn disconnect_watchers(&self) {
        let dropped = std::mem::take(&mut self.state.lock().await.watchers);
        tracing::debug!(watchers = dropped.len(), "Disconnected memory store watchers");
    }

    fn spawn_reaper(state: Weak<Mutex<State>>, id: LeaseId) {
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(state) = state.upgrade() else { return };
                    let guard = state.lock().await;
                    match guard.leases.get(&id) {
                        Some(lease) => lease.deadline,
                        None => return,
                    }
                };

                tokio::time::sleep_until(deadline).await;

                let Some(state) = state.upgrade() else { return };
                let mut guard = state.lock().await;
                match guard.leases.get(&id) {
                    None => return,
                    Some(lease) if lease.deadline <= Instant::now() => {
                        guard.drop_lease(id);
                        tracing::debug!(lease_id = id, "Memory store lease expired");
                        return;
                    }
                    // renewed while we slept
                    Some(_) => continue,
                }
            }
        });
    }
}

struct MemoryLeaseKeepAlive {
    store: MemoryStore,
    lease: LeaseId,
}

#[async_trait]
impl LeaseKeepAlive for MemoryLeaseKeepAlive {
    async fn renew(&mut self) -> Result<i64> {
        Ok(self.store.keep_alive_once(self.lease).await)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
        let state = self.state.lock().await;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        Ok(PrefixSnapshot {
            revision: state.revision,
            kvs,
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<WatchStream> {
        let mut state = self.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        // Replay and registration happen under one lock, so no revision can
        // fall between the two.
        if let Some(start) = start_revision {
            let mut replay: Vec<WatchBatch> = Vec::new();
            for (revision, event) in state.history.iter() {
                if *revision < start || !event.key().starts_with(prefix) {
                    continue;
                }
                match replay.last_mut() {
                    Some(batch) if batch.revision == *revision => batch.events.push(event.clone()),
                    _ => replay.push(WatchBatch {
                        revision: *revision,
                        events: vec![event.clone()],
                    }),
                }
            }
            for batch in replay {
                // the receiver is still held by us
                let _ = tx.send(Ok(batch));
            }
        }

        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().await.write(key, value, None))
    }

    async fn delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().await.remove(key))
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(CronError::Config(format!(
                "lease TTL must be positive, got {ttl_secs}"
            )));
        }
        let id = {
            let mut state = self.state.lock().await;
            let id = state.next_lease_id;
            state.next_lease_id += 1;
            state.leases.insert(
                id,
                Lease {
                    ttl: ttl_secs,
                    deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                    keys: HashSet::new(),
                },
            );
            id
        };
        Self::spawn_reaper(Arc::downgrade(&self.state), id);
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>> {
        Ok(Box::new(MemoryLeaseKeepAlive {
            store: self.clone(),
            lease,
        }))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if self.state.lock().await.drop_lease(lease) {
            Ok(())
        } else {
            Err(CronError::LeaseExpired(lease))
        }
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.live_lease(lease)?;
        state.write(key, value, Some(lease));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.live_lease(lease)?;
        if state.kvs.contains_key(key) {
            return Ok(false);
        }
        state.write(key, value, Some(lease));
        Ok(true)
    }
}
