// ============================================================================
// Topology persistence
// ============================================================================
//
// The discovered graph is stored as a bincode blob, preferably in etcd so that
// several instances can reuse one discovery pass, otherwise in the local cache
// directory next to a pretty-printed JSON mirror for inspection.

use crate::config::TransitConfig;
use crate::error::{Result, TransitError};
use crate::models::TopologySnapshot;
use etcd_client::{Client, ConnectOptions};
use log::{debug, info, warn};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::runtime::Runtime;

const SNAPSHOT_FILE: &str = "topology.bin";
const MIRROR_FILE: &str = "topology.json";

/// Minimal byte-oriented key-value backend.
pub trait SharedKvStore: Send + Sync {
    /// `Ok(None)` when the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

// ============================================================================
// etcd
// ============================================================================

/// Shared store backed by an etcd cluster.
///
/// The store owns a small runtime so the blocking discovery path can drive the
/// async client. The connection is made on first use and dropped after a
/// failed call so the next call reconnects.
pub struct EtcdStore {
    runtime: Option<Runtime>,
    endpoints: Vec<String>,
    options: ConnectOptions,
    client: Mutex<Option<Client>>,
}

impl EtcdStore {
    pub fn new(endpoints: &[String], credentials: Option<(String, String)>, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransitError::CacheUnavailable(format!("Failed to create etcd runtime: {}", e)))?;

        let mut options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        if let Some((username, password)) = credentials {
            options = options.with_user(username, password);
        }

        Ok(EtcdStore {
            runtime: Some(runtime),
            endpoints: endpoints.to_vec(),
            options,
            client: Mutex::new(None),
        })
    }

    fn with_client<T, F, Fut>(&self, op: &str, call: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| TransitError::CacheUnavailable("etcd runtime stopped".to_string()))?;
        let mut cached = self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let client = match cached.as_ref() {
            Some(client) => client.clone(),
            None => {
                let client = runtime
                    .block_on(Client::connect(self.endpoints.as_slice(), Some(self.options.clone())))
                    .map_err(|e| TransitError::CacheUnavailable(format!("etcd connect failed: {}", e)))?;
                *cached = Some(client.clone());
                client
            }
        };

        runtime.block_on(call(client)).map_err(|e| {
            *cached = None;
            TransitError::CacheUnavailable(format!("etcd {} failed: {}", op, e))
        })
    }
}

impl SharedKvStore for EtcdStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let response = self.with_client("get", |mut client| async move { client.get(key, None).await })?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_vec());
        self.with_client("put", |mut client| async move { client.put(key, value, None).await })?;
        Ok(())
    }
}

impl Drop for EtcdStore {
    fn drop(&mut self) {
        // the last owner may be dropped on an async worker, where a blocking
        // shutdown would panic
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct TopologyStore {
    cache_dir: PathBuf,
    shared: Option<Box<dyn SharedKvStore>>,
    shared_key: String,
}

impl TopologyStore {
    pub fn new(cache_dir: impl Into<PathBuf>, shared: Option<Box<dyn SharedKvStore>>, shared_key: &str) -> Self {
        TopologyStore {
            cache_dir: cache_dir.into(),
            shared,
            shared_key: shared_key.to_string(),
        }
    }

    pub fn from_config(config: &TransitConfig) -> Self {
        let shared = if config.etcd_endpoints.is_empty() {
            None
        } else {
            match EtcdStore::new(&config.etcd_endpoints, config.etcd_credentials(), config.request_timeout()) {
                Ok(store) => {
                    info!("✓ Shared topology store: etcd at {}", config.etcd_endpoints.join(","));
                    Some(Box::new(store) as Box<dyn SharedKvStore>)
                }
                Err(e) => {
                    warn!("⚠️  Shared topology store disabled: {}", e);
                    None
                }
            }
        };

        Self::new(&config.cache_dir, shared, &config.etcd_key)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_dir.join(SNAPSHOT_FILE)
    }

    pub fn mirror_path(&self) -> PathBuf {
        self.cache_dir.join(MIRROR_FILE)
    }

    /// Persists the snapshot. A failed shared write falls back to the local
    /// file; only a failed local write is reported to the caller.
    pub fn save(&self, snapshot: &TopologySnapshot) -> Result<()> {
        let bytes = encode(snapshot)?;

        if let Some(shared) = &self.shared {
            match shared.put(&self.shared_key, &bytes) {
                Ok(()) => {
                    info!(
                        "✓ Topology saved to shared store ({} routes, {} KB)",
                        snapshot.routes.len(),
                        bytes.len() / 1024
                    );
                    return Ok(());
                }
                Err(e) => warn!("⚠️  Shared store write failed ({}), writing local cache", e),
            }
        }

        self.save_local(snapshot, &bytes)
    }

    fn save_local(&self, snapshot: &TopologySnapshot, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        write_atomically(&self.snapshot_path(), bytes)?;

        // The mirror is for humans; losing it is not worth failing the save.
        match serde_json::to_string_pretty(snapshot) {
            Ok(json) => {
                if let Err(e) = write_atomically(&self.mirror_path(), json.as_bytes()) {
                    warn!("⚠️  Could not write topology mirror: {}", e);
                }
            }
            Err(e) => warn!("⚠️  Could not serialize topology mirror: {}", e),
        }

        info!("✓ Topology cache saved to: {:?}", self.snapshot_path());
        Ok(())
    }

    /// Loads the most preferred available snapshot. Any store problem is
    /// logged and treated as "nothing stored".
    pub fn load(&self) -> Option<TopologySnapshot> {
        if let Some(shared) = &self.shared {
            match shared.get(&self.shared_key) {
                Ok(Some(bytes)) => match decode(&bytes) {
                    Ok(snapshot) => {
                        info!("✓ Topology loaded from shared store ({} routes)", snapshot.routes.len());
                        return Some(snapshot);
                    }
                    Err(e) => warn!("⚠️  Shared topology unreadable ({}), trying local cache", e),
                },
                Ok(None) => debug!("Shared store has no topology under '{}'", self.shared_key),
                Err(e) => warn!("⚠️  Shared store unavailable ({}), trying local cache", e),
            }
        }

        self.load_local()
    }

    fn load_local(&self) -> Option<TopologySnapshot> {
        let path = self.snapshot_path();
        if !path.exists() {
            info!("ℹ️  No topology cache found, discovery will run");
            return None;
        }

        let loaded = fs::read(&path).map_err(TransitError::from).and_then(|bytes| decode(&bytes));
        match loaded {
            Ok(snapshot) => {
                info!(
                    "✓ Topology cache loaded ({} routes, {} stops)",
                    snapshot.routes.len(),
                    snapshot.stops.len()
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!("⚠️  Failed to read topology cache ({}), will rediscover", e);
                None
            }
        }
    }
}

fn encode(snapshot: &TopologySnapshot) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| TransitError::CacheUnavailable(format!("Failed to encode topology: {}", e)))
}

fn decode(bytes: &[u8]) -> Result<TopologySnapshot> {
    let (mut snapshot, _): (TopologySnapshot, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransitError::CacheUnavailable(format!("Failed to decode topology: {}", e)))?;
    snapshot.reindex();
    Ok(snapshot)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
