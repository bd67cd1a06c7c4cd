//! Route reconciliation
//!
//! Maps the logical per-route table onto the shared routing resources.
//! Every mutation follows the same protocol:
//!
//! 1. optionally wait for the backend to warm up (add only)
//! 2. take the per-resource lock
//! 3. fetch the resource, merge or remove the rule, write it back
//!    conditioned on the fetched version; retry with capped exponential
//!    backoff on conflicts and transient store failures
//! 4. update the route table, still under the lock, once the write is
//!    confirmed
//!
//! Cancellation (caller gone, or shutdown grace expired) is observed only
//! between steps, never while a write is outstanding, so a committed write
//! always reaches the route table.

use crate::codec::{self, ResourceKey, RoutingResource};
use crate::config::{Config, MeshConfig, ReconcileConfig};
use crate::error::{Result, RouteError};
use crate::locks::LockTable;
use crate::route::Route;
use crate::store::{ResourceStore, StoreError, Version};
use crate::table::RouteTable;
use crate::warmup::{Readiness, WarmupGate};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Extra time given to aborted operations to unwind after the grace period
const ABORT_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cooperative cancellation signal for one operation
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

/// Owner side of a [`CancelToken`]; cancels when dropped
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    /// A linked handle/token pair
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            CancelToken {
                rx,
                _keepalive: None,
            },
        )
    }

    /// A token that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Completes once cancelled or once the handle is gone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Run an operation on its own task, cancelling it if the caller goes away
///
/// The spawned task keeps running past the caller's drop until it reaches
/// a cancellation point, so a write in flight is never abandoned halfway.
pub async fn detached<T, F, Fut>(op: F) -> Result<T>
where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (handle, token) = CancelToken::pair();
    let result = tokio::spawn(op(token)).await;
    drop(handle);
    result.map_err(|e| RouteError::Unavailable(format!("route operation task failed: {}", e)))?
}

/// Result of a successful apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The route was not in the table before
    Created,
    /// An existing route was replaced
    Updated,
}

enum WriteOutcome {
    Written(Version),
    Unchanged,
}

/// Decrements the in-flight counter when an operation ends
struct InFlight<'a> {
    counter: &'a watch::Sender<usize>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Owns the route table and keeps it in step with the routing store
///
/// Shared behind an `Arc` by the API server and the shutdown path.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    table: RouteTable,
    locks: LockTable,
    warmup: WarmupGate,
    mesh: MeshConfig,
    policy: ReconcileConfig,
    in_flight: watch::Sender<usize>,
    abort: watch::Sender<bool>,
}

impl Reconciler {
    pub fn new(config: &Config, store: Arc<dyn ResourceStore>) -> Arc<Self> {
        let warmup = WarmupGate::new(
            config.mesh.wait_for_warmup,
            config.reconcile.warmup_interval(),
            config.reconcile.warmup_max_interval(),
        )
        .with_timeout(config.reconcile.warmup_timeout());
        Self::with_warmup(config, store, warmup)
    }

    /// Construct with an explicit warm-up gate
    pub fn with_warmup(config: &Config, store: Arc<dyn ResourceStore>, warmup: WarmupGate) -> Arc<Self> {
        Arc::new(Self {
            store,
            table: RouteTable::new(),
            locks: LockTable::new(),
            warmup,
            mesh: config.mesh.clone(),
            policy: config.reconcile.clone(),
            in_flight: watch::channel(0).0,
            abort: watch::channel(false).0,
        })
    }

    /// All routes in insertion order
    pub fn list(&self) -> Vec<Route> {
        self.table.list()
    }

    pub fn get(&self, id: &str) -> Option<Route> {
        self.table.get(id)
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Number of apply/remove operations currently running
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    fn track(&self) -> InFlight<'_> {
        self.in_flight.send_modify(|n| *n += 1);
        InFlight {
            counter: &self.in_flight,
        }
    }

    fn is_interrupted(&self, cancel: &CancelToken) -> bool {
        cancel.is_cancelled() || *self.abort.borrow()
    }

    /// Completes when the caller cancels or shutdown aborts operations
    async fn interrupted(&self, cancel: &CancelToken) {
        let mut abort = self.abort.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = async { let _ = abort.wait_for(|aborted| *aborted).await; } => {}
        }
    }

    /// Publish a route, creating or replacing its rule
    pub async fn apply_route(&self, route: Route, cancel: &CancelToken) -> Result<ApplyOutcome> {
        let _in_flight = self.track();

        route.validate()?;
        let key = codec::resource_key(&route, &self.mesh)?;
        let entry = codec::project(&route, &self.mesh)?;

        if self.warmup.is_enabled() {
            let target = route.parsed_target()?;
            let timeout = self.warmup.timeout();
            debug!(route_id = %route.id, %target, "Waiting for backend warm-up");

            let readiness = tokio::select! {
                readiness = self.warmup.wait_ready(&target, &route.id, timeout) => readiness,
                _ = self.interrupted(cancel) => return Err(RouteError::Cancelled),
            };
            if readiness == Readiness::TimedOut {
                warn!(route_id = %route.id, %target, ?timeout, "Backend did not warm up, route not published");
                return Err(RouteError::WarmupTimeout {
                    target: route.target.clone(),
                    timeout,
                });
            }
        }

        let guard = tokio::select! {
            guard = self.locks.acquire(&key) => guard,
            _ = self.interrupted(cancel) => return Err(RouteError::Cancelled),
        };

        let outcome = self
            .write_loop(&key, &route.id, cancel, |resource| codec::merge(resource, entry.clone()))
            .await;

        let result = outcome.map(|written| {
            if let WriteOutcome::Written(version) = &written {
                info!(
                    route_id = %route.id,
                    target = %route.target,
                    resource = %key,
                    %version,
                    "Route applied"
                );
            } else {
                debug!(route_id = %route.id, resource = %key, "Route already present in resource");
            }
            self.table.upsert(route.clone())
        });

        drop(guard);
        self.locks.prune();

        let previous = result?;
        if let Some(previous) = &previous {
            self.cleanup_moved_route(previous, &key, cancel).await;
        }

        Ok(if previous.is_some() {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Created
        })
    }

    /// Unpublish a route known to this process
    pub async fn remove_route(&self, id: &str, cancel: &CancelToken) -> Result<()> {
        let _in_flight = self.track();

        loop {
            let route = self.table.get(id).ok_or_else(|| RouteError::not_found(id))?;
            let key = codec::resource_key(&route, &self.mesh)?;

            let guard = tokio::select! {
                guard = self.locks.acquire(&key) => guard,
                _ = self.interrupted(cancel) => return Err(RouteError::Cancelled),
            };

            // the route may have been removed or moved while we queued
            match self.table.get(id) {
                None => return Err(RouteError::not_found(id)),
                Some(current) if codec::resource_key(&current, &self.mesh)? != key => {
                    drop(guard);
                    continue;
                }
                Some(_) => {}
            }

            let outcome = self
                .write_loop(&key, id, cancel, |resource| codec::remove(resource, id))
                .await;

            let result = outcome.map(|_| {
                self.table.delete(id);
                info!(route_id = %id, resource = %key, "Route removed");
            });

            drop(guard);
            self.locks.prune();
            return result;
        }
    }

    /// Drop the rule a replaced route left behind in a different resource
    async fn cleanup_moved_route(&self, previous: &Route, new_key: &ResourceKey, cancel: &CancelToken) {
        let old_key = match codec::resource_key(previous, &self.mesh) {
            Ok(key) if &key != new_key => key,
            _ => return,
        };

        let guard = tokio::select! {
            guard = self.locks.acquire(&old_key) => guard,
            _ = self.interrupted(cancel) => return,
        };

        // a later apply may have moved the route back
        let moved_back = self
            .table
            .get(&previous.id)
            .and_then(|r| codec::resource_key(&r, &self.mesh).ok())
            .is_some_and(|k| k == old_key);

        if !moved_back {
            let id = previous.id.as_str();
            match self
                .write_loop(&old_key, id, cancel, |resource| codec::remove(resource, id))
                .await
            {
                Ok(_) => info!(route_id = %id, resource = %old_key, "Removed rule from previous resource"),
                Err(e) => warn!(route_id = %id, resource = %old_key, error = %e, "Failed to remove rule from previous resource"),
            }
        }

        drop(guard);
        self.locks.prune();
    }

    /// Fetch, mutate and conditionally write one resource until it sticks
    ///
    /// Must be called with the resource lock held.
    async fn write_loop<F>(
        &self,
        key: &ResourceKey,
        route_id: &str,
        cancel: &CancelToken,
        mutate: F,
    ) -> Result<WriteOutcome>
    where
        F: Fn(&RoutingResource) -> RoutingResource + Send + Sync,
    {
        let max_attempts = self.policy.max_retries;
        let mut last_error: Option<StoreError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.policy.backoff(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.interrupted(cancel) => return Err(RouteError::Cancelled),
                }
            } else if self.is_interrupted(cancel) {
                return Err(RouteError::Cancelled);
            }

            let fetched = tokio::select! {
                fetched = self.store.get(key) => fetched,
                _ = self.interrupted(cancel) => return Err(RouteError::Cancelled),
            };

            let (current, version) = match fetched {
                Ok(Some(versioned)) => (versioned.resource, Some(versioned.version)),
                Ok(None) => (RoutingResource::empty(key.clone()), None),
                Err(e) if e.is_retryable() => {
                    warn!(route_id, resource = %key, attempt, error = %e, "Failed to fetch routing resource");
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(RouteError::Unavailable(e.to_string())),
            };

            let updated = mutate(&current);
            if updated.rules == current.rules {
                return Ok(WriteOutcome::Unchanged);
            }

            debug!(
                route_id,
                resource = %key,
                attempt,
                version = ?version,
                rules = updated.rules.len(),
                "Writing routing resource"
            );

            // not interruptible: the outcome of a write must be observed
            match self.store.conditional_put(&updated, version.as_ref()).await {
                Ok(version) => return Ok(WriteOutcome::Written(version)),
                Err(StoreError::Conflict) => {
                    warn!(route_id, resource = %key, attempt, "Version conflict on routing resource, retrying");
                    last_error = Some(StoreError::Conflict);
                }
                Err(e) if e.is_retryable() => {
                    warn!(route_id, resource = %key, attempt, error = %e, "Failed to write routing resource");
                    last_error = Some(e);
                }
                Err(e) => return Err(RouteError::Unavailable(e.to_string())),
            }
        }

        warn!(route_id, resource = %key, attempts = max_attempts, "Retry budget exhausted");
        match last_error {
            Some(StoreError::Unavailable(msg)) | Some(StoreError::Rejected(msg)) => {
                Err(RouteError::Unavailable(msg))
            }
            Some(StoreError::Conflict) | None => Err(RouteError::Conflict {
                id: route_id.to_string(),
                attempts: max_attempts,
            }),
        }
    }

    /// Wait for in-flight operations, aborting them after `grace`
    ///
    /// Returns true if everything finished within the grace period.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut in_flight = self.in_flight.subscribe();
        let idle = async move {
            let _ = in_flight.wait_for(|n| *n == 0).await;
        };
        tokio::pin!(idle);

        if tokio::time::timeout(grace, &mut idle).await.is_ok() {
            return true;
        }

        warn!(
            in_flight = self.in_flight(),
            grace_secs = grace.as_secs(),
            "Grace period expired, aborting route operations"
        );
        self.abort.send_replace(true);
        let _ = tokio::time::timeout(ABORT_SETTLE_TIMEOUT, &mut idle).await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Metadata;
    use crate::store::{MemoryStore, Versioned};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> Config {
        let mut config = Config::default();
        config.mesh.gateway = "istio-system/jupyter-gateway".to_string();
        config.mesh.namespace = "jhub".to_string();
        config.mesh.sub_domain_host = "jupyter.example.com".to_string();
        config.mesh.wait_for_warmup = false;
        config.reconcile.backoff_base_ms = 1;
        config.reconcile.backoff_max_ms = 5;
        config
    }

    fn route(id: &str, target: &str) -> Route {
        Route::new(id, target, Metadata::new()).unwrap()
    }

    fn user_route(id: &str, user: &str) -> Route {
        let mut metadata = Metadata::new();
        metadata.insert("user".to_string(), user.to_string());
        Route::new(id, "http://10.0.0.5:8888", metadata).unwrap()
    }

    fn key_of(config: &Config, route: &Route) -> ResourceKey {
        codec::resource_key(route, &config.mesh).unwrap()
    }

    fn setup() -> (Config, Arc<MemoryStore>, Arc<Reconciler>) {
        let config = config();
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(&config, store.clone());
        (config, store, reconciler)
    }

    /// Wraps a memory store and fails a set number of writes
    struct FlakyStore {
        inner: MemoryStore,
        conflicts: AtomicU32,
        outages: AtomicU32,
        rejections: AtomicU32,
    }

    impl FlakyStore {
        fn new(conflicts: u32, outages: u32, rejections: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                conflicts: AtomicU32::new(conflicts),
                outages: AtomicU32::new(outages),
                rejections: AtomicU32::new(rejections),
            }
        }

        fn take(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl ResourceStore for FlakyStore {
        async fn get(&self, key: &ResourceKey) -> std::result::Result<Option<Versioned>, StoreError> {
            self.inner.get(key).await
        }

        async fn conditional_put(
            &self,
            resource: &RoutingResource,
            expected: Option<&Version>,
        ) -> std::result::Result<Version, StoreError> {
            if Self::take(&self.rejections) {
                return Err(StoreError::Rejected("admission webhook denied the request".to_string()));
            }
            if Self::take(&self.conflicts) {
                return Err(StoreError::Conflict);
            }
            if Self::take(&self.outages) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.conditional_put(resource, expected).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Commits to a memory store, then stalls before reporting back
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl ResourceStore for SlowStore {
        async fn get(&self, key: &ResourceKey) -> std::result::Result<Option<Versioned>, StoreError> {
            self.inner.get(key).await
        }

        async fn conditional_put(
            &self,
            resource: &RoutingResource,
            expected: Option<&Version>,
        ) -> std::result::Result<Version, StoreError> {
            let version = self.inner.conditional_put(resource, expected).await?;
            tokio::time::sleep(self.delay).await;
            Ok(version)
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_apply_list_remove() {
        let (config, store, reconciler) = setup();
        let alice = route("/user/alice", "http://10.0.0.5:8888");
        let key = key_of(&config, &alice);

        let outcome = reconciler.apply_route(alice.clone(), &CancelToken::never()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);

        let listed = reconciler.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "/user/alice");
        assert!(store.snapshot(&key).unwrap().rule("/user/alice").is_some());

        reconciler.remove_route("/user/alice", &CancelToken::never()).await.unwrap();
        assert!(reconciler.list().is_empty());

        // the resource stays, just without rules
        let resource = store.snapshot(&key).unwrap();
        assert!(resource.rules.is_empty());
    }

    #[tokio::test]
    async fn test_reapply_same_route_is_idempotent() {
        let (config, store, reconciler) = setup();
        let alice = route("/user/alice", "http://10.0.0.5:8888");
        let key = key_of(&config, &alice);

        reconciler.apply_route(alice.clone(), &CancelToken::never()).await.unwrap();
        let writes = store.write_count();

        let outcome = reconciler.apply_route(alice, &CancelToken::never()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.snapshot(&key).unwrap().rules.len(), 1);
        assert_eq!(reconciler.list().len(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_rule_in_place() {
        let (config, store, reconciler) = setup();
        let first = route("/user/alice", "http://10.0.0.5:8888");
        let key = key_of(&config, &first);

        reconciler.apply_route(first, &CancelToken::never()).await.unwrap();
        reconciler
            .apply_route(route("/user/alice", "http://10.0.0.9:9999"), &CancelToken::never())
            .await
            .unwrap();

        let resource = store.snapshot(&key).unwrap();
        assert_eq!(resource.rules.len(), 1);
        assert_eq!(resource.rules[0].destination.port, 9999);
        assert_eq!(reconciler.get("/user/alice").unwrap().target, "http://10.0.0.9:9999");
    }

    #[tokio::test]
    async fn test_longer_prefixes_sort_first() {
        let (config, store, reconciler) = setup();
        let short = route("/a", "http://10.0.0.1:80");
        let key = key_of(&config, &short);

        reconciler.apply_route(short, &CancelToken::never()).await.unwrap();
        reconciler
            .apply_route(route("/a/b", "http://10.0.0.2:80"), &CancelToken::never())
            .await
            .unwrap();

        let resource = store.snapshot(&key).unwrap();
        let prefixes: Vec<&str> = resource.rules.iter().map(|r| r.path_prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/a/b", "/a"]);
    }

    #[tokio::test]
    async fn test_remove_unknown_route_skips_store() {
        let (_, store, reconciler) = setup();

        let result = reconciler.remove_route("/user/nobody", &CancelToken::never()).await;
        assert!(matches!(result, Err(RouteError::NotFound(_))));
        assert_eq!(store.write_count(), 0);
        assert!(store.resources().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_route_rejected_before_store() {
        let (_, store, reconciler) = setup();
        let mut bad = route("/user/alice", "http://10.0.0.5:8888");
        bad.target = "ftp://10.0.0.5".to_string();

        let result = reconciler.apply_route(bad, &CancelToken::never()).await;
        assert!(matches!(result, Err(RouteError::Validation(_))));
        assert_eq!(store.write_count(), 0);
        assert!(reconciler.list().is_empty());
    }

    #[tokio::test]
    async fn test_warmup_timeout_leaves_state_unchanged() {
        let mut config = config();
        config.mesh.wait_for_warmup = true;
        let store = Arc::new(MemoryStore::new());
        let gate = WarmupGate::new(true, Duration::from_millis(20), Duration::from_millis(50))
            .with_timeout(Duration::from_millis(200));
        let reconciler = Reconciler::with_warmup(&config, store.clone(), gate);

        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let start = std::time::Instant::now();
        let result = reconciler
            .apply_route(route("/user/alice", &format!("http://127.0.0.1:{}", port)), &CancelToken::never())
            .await;

        assert!(matches!(result, Err(RouteError::WarmupTimeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(store.write_count(), 0);
        assert!(reconciler.list().is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_retry_budget() {
        let config = config();
        let store = Arc::new(FlakyStore::new(u32::MAX, 0, 0));
        let reconciler = Reconciler::new(&config, store.clone());

        let result = reconciler
            .apply_route(route("/user/alice", "http://10.0.0.5:8888"), &CancelToken::never())
            .await;

        match result {
            Err(RouteError::Conflict { id, attempts }) => {
                assert_eq!(id, "/user/alice");
                assert_eq!(attempts, config.reconcile.max_retries);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(reconciler.list().is_empty());
        assert!(store.inner.resources().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let config = config();
        let store = Arc::new(FlakyStore::new(1, 2, 0));
        let reconciler = Reconciler::new(&config, store.clone());

        let outcome = reconciler
            .apply_route(route("/user/alice", "http://10.0.0.5:8888"), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Created);
        assert_eq!(store.inner.write_count(), 1);
        assert!(reconciler.get("/user/alice").is_some());
    }

    #[tokio::test]
    async fn test_outage_reported_as_unavailable() {
        let config = config();
        let store = Arc::new(FlakyStore::new(0, u32::MAX, 0));
        let reconciler = Reconciler::new(&config, store);

        let result = reconciler
            .apply_route(route("/user/alice", "http://10.0.0.5:8888"), &CancelToken::never())
            .await;

        assert!(matches!(result, Err(RouteError::Unavailable(_))));
        assert!(reconciler.list().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_write_not_retried() {
        let config = config();
        let store = Arc::new(FlakyStore::new(0, 0, 1));
        let reconciler = Reconciler::new(&config, store.clone());

        let result = reconciler
            .apply_route(route("/user/alice", "http://10.0.0.5:8888"), &CancelToken::never())
            .await;

        assert!(matches!(result, Err(RouteError::Unavailable(_))));
        assert_eq!(store.inner.write_count(), 0);
        assert!(reconciler.list().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_lock() {
        let (config, store, reconciler) = setup();
        let alice = route("/user/alice", "http://10.0.0.5:8888");
        let held = reconciler.locks.acquire(&key_of(&config, &alice)).await;

        let (handle, token) = CancelToken::pair();
        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.apply_route(alice, &token).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RouteError::Cancelled)));
        drop(held);

        assert_eq!(store.write_count(), 0);
        assert!(reconciler.list().is_empty());
        assert_eq!(reconciler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_write_keeps_committed_route() {
        let config = config();
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(100),
        });
        let reconciler = Reconciler::new(&config, store.clone());

        let (handle, token) = CancelToken::pair();
        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                reconciler
                    .apply_route(route("/user/alice", "http://10.0.0.5:8888"), &token)
                    .await
            })
        };

        // the write has landed and the store is still sleeping
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.inner.write_count(), 1);
        handle.cancel();

        let result = task.await.unwrap();
        assert_eq!(result.unwrap(), ApplyOutcome::Created);
        assert_eq!(store.inner.write_count(), 1);
        assert!(reconciler.get("/user/alice").is_some());
        assert_eq!(reconciler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels() {
        let (handle, token) = CancelToken::pair();
        assert!(!token.is_cancelled());
        drop(handle);
        assert!(token.is_cancelled());
        token.cancelled().await;
        assert!(!CancelToken::never().is_cancelled());
    }

    #[tokio::test]
    async fn test_detached_runs_to_completion() {
        let (_, _, reconciler) = setup();
        let r = Arc::clone(&reconciler);

        let outcome = detached(move |cancel| async move {
            r.apply_route(route("/user/alice", "http://10.0.0.5:8888"), &cancel).await
        })
        .await
        .unwrap();

        assert_eq!(outcome, ApplyOutcome::Created);
        assert!(reconciler.get("/user/alice").is_some());
    }

    #[tokio::test]
    async fn test_route_moves_between_resources() {
        let mut config = config();
        config.mesh.sub_domain_host = "{user}.example.com".to_string();
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(&config, store.clone());

        let as_alice = user_route("/user/shared", "alice");
        let as_bob = user_route("/user/shared", "bob");
        let alice_key = key_of(&config, &as_alice);
        let bob_key = key_of(&config, &as_bob);
        assert_ne!(alice_key, bob_key);

        reconciler.apply_route(as_alice, &CancelToken::never()).await.unwrap();
        let outcome = reconciler.apply_route(as_bob, &CancelToken::never()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);

        assert!(store.snapshot(&alice_key).unwrap().rules.is_empty());
        assert!(store.snapshot(&bob_key).unwrap().rule("/user/shared").is_some());
        assert_eq!(reconciler.get("/user/shared").unwrap().metadata.get("user").unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_concurrent_applies_all_land() {
        let (config, store, reconciler) = setup();

        let mut handles = Vec::new();
        for i in 0..20 {
            let reconciler = Arc::clone(&reconciler);
            handles.push(tokio::spawn(async move {
                let r = route(&format!("/user/u{}", i), "http://10.0.0.5:8888");
                reconciler.apply_route(r, &CancelToken::never()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let key = key_of(&config, &route("/user/u0", "http://10.0.0.5:8888"));
        assert_eq!(store.snapshot(&key).unwrap().rules.len(), 20);
        assert_eq!(reconciler.list().len(), 20);
        assert_eq!(reconciler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_when_idle() {
        let (_, _, reconciler) = setup();
        assert!(reconciler.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_drain_aborts_stuck_operations() {
        let (config, store, reconciler) = setup();
        let alice = route("/user/alice", "http://10.0.0.5:8888");
        let held = reconciler.locks.acquire(&key_of(&config, &alice)).await;

        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.apply_route(alice, &CancelToken::never()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.in_flight(), 1);

        assert!(!reconciler.drain(Duration::from_millis(50)).await);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RouteError::Cancelled)));
        drop(held);
        assert_eq!(store.write_count(), 0);
        assert_eq!(reconciler.in_flight(), 0);
    }
}
