use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions,
    LeaseKeepAliveStream, LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::StoreConfig;
use crate::error::{CronError, Result};
use crate::store::{
    CoordinationStore, KeyValue, LeaseId, LeaseKeepAlive, PrefixSnapshot, WatchBatch, WatchEvent,
    WatchStream,
};

/// Buffered watch batches per subscription before the forwarder applies
/// backpressure to the etcd stream.
const WATCH_BUFFER: usize = 64;

/// HTTP/2 ping interval and ack deadline; a dead connection fails in-flight
/// calls instead of leaving them pending.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// [`CoordinationStore`] backed by an etcd v3 cluster.
///
/// `etcd_client::Client` multiplexes one gRPC channel and is cheap to clone,
/// so every call works on its own clone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout())
            .with_timeout(config.request_timeout())
            .with_keep_alive(KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT);
        let client = Client::connect(&config.etcd_endpoints, Some(options)).await?;
        tracing::info!(endpoints = ?config.etcd_endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// One bidirectional keep-alive stream per held lease.
struct EtcdLeaseKeepAlive {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

#[async_trait]
impl LeaseKeepAlive for EtcdLeaseKeepAlive {
    async fn renew(&mut self) -> Result<i64> {
        self.keeper.keep_alive().await?;
        match self.stream.message().await? {
            Some(resp) => Ok(resp.ttl()),
            None => Err(CronError::Watch(format!(
                "keep-alive stream for lease {} closed",
                self.keeper.id()
            ))),
        }
    }
}

fn to_key_value(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    Ok(KeyValue {
        key: kv.key_str()?.to_string(),
        value: kv.value().to_vec(),
    })
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let revision = resp
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| CronError::Internal("etcd response without header".to_string()))?;
        let kvs = resp
            .kvs()
            .iter()
            .map(to_key_value)
            .collect::<Result<Vec<_>>>()?;

        Ok(PrefixSnapshot { revision, kvs })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }
        let (mut watcher, mut stream) = client.watch(prefix, Some(options)).await?;

        // The watcher must outlive the stream, so both live in a forwarding
        // task that exits when the consumer drops its end.
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };

                let batch = match message {
                    Ok(Some(resp)) if resp.canceled() => Err(CronError::Watch(format!(
                        "watch on {} cancelled by server (compact revision {}): {}",
                        prefix,
                        resp.compact_revision(),
                        resp.cancel_reason()
                    ))),
                    Ok(Some(resp)) => {
                        let mut batch = WatchBatch {
                            revision: resp.header().map(|h| h.revision()).unwrap_or_default(),
                            events: Vec::with_capacity(resp.events().len()),
                        };
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            batch.revision = batch.revision.max(kv.mod_revision());
                            match event.event_type() {
                                EventType::Put => match to_key_value(kv) {
                                    Ok(kv) => batch.events.push(WatchEvent::Put(kv)),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Skipping non-UTF-8 key")
                                    }
                                },
                                EventType::Delete => match kv.key_str() {
                                    Ok(key) => batch.events.push(WatchEvent::Delete {
                                        key: key.to_string(),
                                    }),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Skipping non-UTF-8 key")
                                    }
                                },
                            }
                        }
                        if batch.events.is_empty() {
                            // Creation acknowledgements and progress notifications.
                            continue;
                        }
                        Ok(batch)
                    }
                    Ok(None) => break,
                    Err(e) => Err(CronError::from(e)),
                };

                let failed = batch.is_err();
                if tx.send(batch).await.is_err() || failed {
                    break;
                }
            }

            if let Err(e) = watcher.cancel().await {
                tracing::debug!(prefix = %prefix, error = %e, "Failed to cancel etcd watcher");
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client
            .put(key, value, Some(PutOptions::new().with_prev_key()))
            .await?;
        Ok(resp.prev_key().map(|kv| kv.value().to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = client
            .delete(key, Some(DeleteOptions::new().with_prev_key()))
            .await?;
        Ok(resp.prev_kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Box<dyn LeaseKeepAlive>> {
        let mut client = self.client.clone();
        let (keeper, stream) = client.lease_keep_alive(lease).await?;
        Ok(Box::new(EtcdLeaseKeepAlive { keeper, stream }))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }

    async fn put_with_lease(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<bool> {
        let mut client = self.client.clone();
        // create_revision == 0 only holds for keys that do not exist.
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease)),
            )]);
        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }
}
