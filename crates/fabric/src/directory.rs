use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, SortOrder, SortTarget, WatchOptions, WatchStream, Watcher,
};
use tracing::{debug, warn};

/// Point operations run under this timeout.
const OP_TIMEOUT: Duration = Duration::from_secs(5);
/// Lease TTL for kept (auto-renewed) keys.
const KEEP_LEASE_TTL: i64 = 5;
/// Backoff between re-establish attempts after a renewal failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// One change observed on a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Live watch over a key prefix.
pub struct DirWatch {
    _watcher: Watcher,
    stream: WatchStream,
}

impl DirWatch {
    /// Next batch of events. `None` when the watch is closed server-side.
    pub async fn next(&mut self) -> Result<Option<Vec<DirEvent>>> {
        let Some(resp) = self.stream.message().await? else {
            return Ok(None);
        };
        let mut events = Vec::with_capacity(resp.events().len());
        for ev in resp.events() {
            let Some(kv) = ev.kv() else { continue };
            let key = kv.key_str().unwrap_or_default().to_string();
            match ev.event_type() {
                EventType::Put => events.push(DirEvent::Put {
                    key,
                    value: kv.value_str().unwrap_or_default().to_string(),
                }),
                EventType::Delete => events.push(DirEvent::Delete { key }),
            }
        }
        Ok(Some(events))
    }
}

/// Lease-backed key-value directory shared by the whole cluster.
///
/// Two kinds of keys live here. Service registrations are `keep`-ed: the
/// lease is renewed in the background for as long as the process lives, and
/// re-established with a 5 s backoff if renewal ever fails, so a registration
/// never silently disappears. Session index records are written with
/// `put_with_ttl` and expire on their own unless refreshed.
#[derive(Clone)]
pub struct Directory {
    client: Client,
    /// key -> lease id for keys this process keeps alive
    leases: Arc<Mutex<HashMap<String, i64>>>,
    stopped: Arc<AtomicBool>,
}

impl Directory {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(OP_TIMEOUT)
            .with_timeout(OP_TIMEOUT);
        let client = Client::connect(endpoints, Some(options))
            .await
            .context("etcd connect failed")?;
        Ok(Self {
            client,
            leases: Arc::new(Mutex::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn lease_of(&self, key: &str) -> Option<i64> {
        self.leases.lock().unwrap().get(key).copied()
    }

    async fn establish(
        mut client: Client,
        key: &str,
        value: &str,
        ttl: i64,
    ) -> Result<(i64, LeaseKeeper, LeaseKeepAliveStream)> {
        let lease = client.lease_grant(ttl, None).await?;
        let lease_id = lease.id();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await?;
        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        Ok((lease_id, keeper, stream))
    }

    /// Put a key under a short lease and keep the lease alive until `close`.
    pub async fn keep(&self, key: &str, value: &str) -> Result<()> {
        let (lease_id, keeper, stream) =
            Self::establish(self.client.clone(), key, value, KEEP_LEASE_TTL).await?;
        self.leases.lock().unwrap().insert(key.to_string(), lease_id);
        debug!(%key, lease_id, "directory keep established");

        let client = self.client.clone();
        let leases = Arc::clone(&self.leases);
        let stopped = Arc::clone(&self.stopped);
        let key = key.to_string();
        let value = value.to_string();
        tokio::spawn(async move {
            renew_loop(client, leases, stopped, key, value, lease_id, keeper, stream).await;
        });
        Ok(())
    }

    /// Re-put a kept key under its existing lease. On failure the key is
    /// re-`keep`-ed (fresh lease + put) so it stays present.
    pub async fn update(&self, key: &str, value: &str) -> Result<()> {
        if let Some(lease_id) = self.lease_of(key) {
            let mut client = self.client.clone();
            match client
                .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => warn!(%key, "directory update failed, re-keeping: {e}"),
            }
        }
        self.keep(key, value).await
    }

    /// Put a key under a fresh lease that is never renewed by this process.
    pub async fn put_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.id())))
            .await?;
        Ok(())
    }

    /// Extend a ttl key by re-putting its current value under a fresh lease.
    /// Fails if the key is gone.
    pub async fn refresh(&self, key: &str, ttl: Duration) -> Result<()> {
        let value = self
            .get(key)
            .await?
            .ok_or_else(|| anyhow!("cannot refresh missing key {key}"))?;
        self.put_with_ttl(key, &value, ttl).await
    }

    pub async fn delete(&self, key: &str, prefix: bool) -> Result<()> {
        {
            let mut leases = self.leases.lock().unwrap();
            if prefix {
                leases.retain(|k, _| !k.starts_with(key));
            } else {
                leases.remove(key);
            }
        }
        let mut client = self.client.clone();
        let options = prefix.then(|| DeleteOptions::new().with_prefix());
        client.delete(key, options).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| kv.value_str().unwrap_or_default().to_string()))
    }

    pub async fn get_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.scan(prefix, SortOrder::Ascend).await
    }

    /// Descending scan, used to bootstrap watchers so the newest entries are
    /// applied first.
    pub async fn get_by_prefix_desc(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.scan(prefix, SortOrder::Descend).await
    }

    async fn scan(&self, prefix: &str, order: SortOrder) -> Result<Vec<(String, String)>> {
        let mut client = self.client.clone();
        let mut options = GetOptions::new().with_sort(SortTarget::Key, order);
        options = if prefix.is_empty() {
            options.with_all_keys()
        } else {
            options.with_prefix()
        };
        let resp = client.get(prefix, Some(options)).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    kv.key_str().unwrap_or_default().to_string(),
                    kv.value_str().unwrap_or_default().to_string(),
                )
            })
            .collect())
    }

    /// Watch a prefix (everything when empty) for puts and deletes.
    pub async fn watch(&self, prefix: &str) -> Result<DirWatch> {
        let mut client = self.client.clone();
        let options = if prefix.is_empty() {
            WatchOptions::new().with_all_keys()
        } else {
            WatchOptions::new().with_prefix()
        };
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;
        Ok(DirWatch {
            _watcher: watcher,
            stream,
        })
    }

    /// Delete every key this process keeps, then stop all renewal tasks.
    /// Idempotent.
    pub async fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<String> = self.leases.lock().unwrap().keys().cloned().collect();
        let mut client = self.client.clone();
        for key in keys {
            if let Err(e) = client.delete(key.as_str(), None).await {
                warn!(%key, "failed to delete owned key on close: {e}");
            }
        }
        self.leases.lock().unwrap().clear();
    }
}

#[allow(clippy::too_many_arguments)]
async fn renew_loop(
    client: Client,
    leases: Arc<Mutex<HashMap<String, i64>>>,
    stopped: Arc<AtomicBool>,
    key: String,
    value: String,
    mut lease_id: i64,
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
) {
    let mut tick = tokio::time::interval(Duration::from_secs((KEEP_LEASE_TTL as u64 / 2).max(1)));
    loop {
        tick.tick().await;
        if stopped.load(Ordering::Relaxed) {
            return;
        }
        // A newer keep() for the same key owns the renewal now.
        if leases.lock().unwrap().get(&key) != Some(&lease_id) {
            return;
        }
        let renewed = match keeper.keep_alive().await {
            Ok(()) => matches!(stream.message().await, Ok(Some(_))),
            Err(_) => false,
        };
        if renewed {
            continue;
        }
        warn!(%key, "lease renewal failed, re-establishing");
        loop {
            if stopped.load(Ordering::Relaxed) {
                return;
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
            match Directory::establish(client.clone(), &key, &value, KEEP_LEASE_TTL).await {
                Ok((id, k, s)) => {
                    lease_id = id;
                    keeper = k;
                    stream = s;
                    leases.lock().unwrap().insert(key.clone(), id);
                    debug!(%key, lease_id, "directory keep re-established");
                    break;
                }
                Err(e) => warn!(%key, "re-establish failed: {e}"),
            }
        }
    }
}
