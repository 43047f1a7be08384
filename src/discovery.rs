// Route/stop graph discovery.
//
// One routeList call, then one routeConfig call per route on a bounded worker
// pool. The held snapshot is replaced whole once a pass completes; readers
// keep the previous Arc until then.

use crate::error::{Result, TransitError};
use crate::feed::{RouteConfig, RouteSummary, TransitFeed};
use crate::models::{TOPOLOGY_FORMAT_VERSION, TopologyBuilder, TopologySnapshot, current_timestamp};
use crate::store::TopologyStore;
use log::{error, info, warn};
use rayon::ThreadPool;
use rayon::prelude::*;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

pub struct RouteDiscoveryEngine {
    feed: Arc<dyn TransitFeed>,
    store: TopologyStore,
    pool: Arc<ThreadPool>,
    current: RwLock<Arc<TopologySnapshot>>,
    // Serializes discovery passes; readers never take it.
    rebuild: Mutex<()>,
    max_age_days: i64,
}

impl RouteDiscoveryEngine {
    pub fn new(
        feed: Arc<dyn TransitFeed>,
        store: TopologyStore,
        pool: Arc<ThreadPool>,
        max_age_days: i64,
    ) -> Self {
        RouteDiscoveryEngine {
            feed,
            store,
            pool,
            current: RwLock::new(Arc::new(TopologySnapshot::empty())),
            rebuild: Mutex::new(()),
            max_age_days,
        }
    }

    /// The snapshot currently held in memory (possibly empty).
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    fn replace(&self, snapshot: TopologySnapshot) -> Arc<TopologySnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::clone(&snapshot);
        snapshot
    }

    /// Returns the warm snapshot immediately, otherwise runs a full pass.
    ///
    /// Fails with `TransitDataUnavailable` only when no route could be fetched
    /// at all; the held snapshot is then left as it was.
    pub fn discover(&self) -> Result<Arc<TopologySnapshot>> {
        let warm = self.snapshot();
        if !warm.is_empty() {
            return Ok(warm);
        }

        let _pass = self.rebuild.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another caller may have finished a pass while we waited.
        let warm = self.snapshot();
        if !warm.is_empty() {
            return Ok(warm);
        }

        let snapshot = self.run_pass()?;
        Ok(self.replace(snapshot))
    }

    /// Deliberate cache invalidation: always runs a full pass.
    pub fn rediscover(&self) -> Result<Arc<TopologySnapshot>> {
        let _pass = self.rebuild.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = self.run_pass()?;
        Ok(self.replace(snapshot))
    }

    /// Startup path: stored snapshot if fresh, otherwise a new pass. A stale
    /// stored snapshot still beats nothing when the pass fails.
    pub fn load_or_discover(&self) -> Result<Arc<TopologySnapshot>> {
        let warm = self.snapshot();
        if !warm.is_empty() {
            return Ok(warm);
        }

        let _pass = self.rebuild.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let stored = self.store.load().filter(|s| !s.is_empty());
        let stale = match stored {
            Some(snapshot) if self.is_fresh(&snapshot) => return Ok(self.replace(snapshot)),
            Some(snapshot) => {
                info!(
                    "⚠️  Stored topology is stale ({} days old, format v{}), rediscovering...",
                    snapshot.age_days(current_timestamp()),
                    snapshot.format_version
                );
                Some(snapshot)
            }
            None => None,
        };

        match (self.run_pass(), stale) {
            (Ok(snapshot), _) => Ok(self.replace(snapshot)),
            (Err(e), Some(stale)) => {
                warn!("⚠️  Rediscovery failed ({}), using stale topology", e);
                Ok(self.replace(stale))
            }
            (Err(e), None) => Err(e),
        }
    }

    fn is_fresh(&self, snapshot: &TopologySnapshot) -> bool {
        snapshot.format_version == TOPOLOGY_FORMAT_VERSION
            && snapshot.age_days(current_timestamp()) < self.max_age_days
    }

    fn run_pass(&self) -> Result<TopologySnapshot> {
        let started = Instant::now();
        info!("🔄 Discovering routes from upstream feed...");

        let routes = match self.feed.route_list() {
            Ok(routes) if !routes.is_empty() => routes,
            Ok(_) => {
                error!("❌ Route discovery failed: feed returned no routes");
                return Err(TransitError::TransitDataUnavailable);
            }
            Err(e) => {
                error!("❌ Route discovery failed: {}", e);
                return Err(TransitError::TransitDataUnavailable);
            }
        };

        info!("   ✓ {} routes listed, fetching configurations...", routes.len());

        let feed = &self.feed;
        let configs: Vec<(&RouteSummary, Result<RouteConfig>)> = self.pool.install(|| {
            routes
                .par_iter()
                .map(|route| (route, feed.route_config(&route.tag)))
                .collect()
        });

        let snapshot = assemble(configs, current_timestamp())?;

        info!(
            "✓ Discovered {} routes and {} stops in {:.1}s",
            snapshot.routes.len(),
            snapshot.stops.len(),
            started.elapsed().as_secs_f64()
        );

        if let Err(e) = self.store.save(&snapshot) {
            warn!("⚠️  Could not persist topology: {}", e);
        }

        Ok(snapshot)
    }
}

/// Folds per-route results, in route-list order, into one snapshot.
fn assemble(configs: Vec<(&RouteSummary, Result<RouteConfig>)>, discovered_at: i64) -> Result<TopologySnapshot> {
    let mut builder = TopologyBuilder::new();
    let mut skipped = 0;

    for (summary, config) in configs {
        match config {
            Ok(config) => {
                let title = if config.title.is_empty() { &summary.title } else { &config.title };
                builder.add_route(&summary.tag, title, config.stops);
            }
            Err(e) => {
                skipped += 1;
                warn!("⚠️  Skipping route {}: {}", summary.tag, e);
            }
        }
    }

    if builder.route_count() == 0 {
        error!("❌ Route discovery failed: every route configuration failed");
        return Err(TransitError::TransitDataUnavailable);
    }

    if skipped > 0 {
        warn!("⚠️  {} routes skipped during discovery", skipped);
    }

    Ok(builder.build(discovered_at))
}
