mod ack;
mod not_found;

#[cfg(test)]
mod test_support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use crate::cache::LookupCache;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::server::monitoring::OSEG_METRICS;
use crate::store::{object_key, DirectoryStore, StoreAck, StoreError, StoreResult};
use crate::transit::InTransitTable;
use crate::types::{
    Entry, LookupListener, MigrateAck, ObjectId, OwnershipUpdate, ServerId, ServerMessageRouter,
    WriteListener, WriteStatus,
};

use not_found::NotFoundQueue;

/// Tunables for one directory instance.
#[derive(Debug, Clone)]
pub struct OsegSettings {
    pub server_id: ServerId,
    pub key_prefix: u8,
    pub cache_capacity: usize,
    /// Minimum wait before an object the store reported missing is queried
    /// again. Default: 500ms
    pub not_found_sit_out: Duration,
    pub not_found_sweep_interval: Duration,
    /// Re-arm delay when the transport refuses an acknowledgment.
    pub ack_retry_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl OsegSettings {
    pub fn for_server(server_id: ServerId) -> Self {
        Self {
            server_id,
            key_prefix: b'G',
            cache_capacity: 10_000,
            not_found_sit_out: Duration::from_millis(500),
            not_found_sweep_interval: Duration::from_millis(100),
            ack_retry_interval: Duration::from_micros(100),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// The object-to-hosting-server directory for one space server.
///
/// All operations are non-blocking: anything that needs the backing store is
/// dispatched to a task and its terminal outcome arrives through the
/// listeners. The instance is owned by the space-server context and handed to
/// collaborators by cloning (cheap; shared state inside).
#[derive(Clone)]
pub struct ObjectSegmentation {
    inner: Arc<OsegInner>,
}

struct OsegInner {
    settings: OsegSettings,
    store: Arc<dyn DirectoryStore>,
    cache: LookupCache,
    transit: InTransitTable,
    residents: Mutex<HashMap<ObjectId, Entry>>,
    not_found: NotFoundQueue,
    ack_outbox: flume::Sender<MigrateAck>,
    lookup_listener: Arc<dyn LookupListener>,
    write_listener: Arc<dyn WriteListener>,
    /// Lookups queued for store dispatch but not yet issued.
    pushback: AtomicUsize,
    stopping: CancellationToken,
}

impl ObjectSegmentation {
    /// Builds the directory and spawns its background tasks (not-found
    /// sweeper, ack dispatcher). Must be called within a tokio runtime.
    ///
    /// Cancelling `stopping` turns every operation into a no-op and causes
    /// in-flight store completions to be discarded rather than delivered.
    pub fn new(
        settings: OsegSettings,
        store: Arc<dyn DirectoryStore>,
        lookup_listener: Arc<dyn LookupListener>,
        write_listener: Arc<dyn WriteListener>,
        router: Arc<dyn ServerMessageRouter>,
        stopping: CancellationToken,
    ) -> Self {
        let (ack_sender, ack_receiver) = flume::unbounded();

        let inner = Arc::new(OsegInner {
            cache: LookupCache::new(settings.cache_capacity),
            transit: InTransitTable::new(),
            residents: Mutex::new(HashMap::new()),
            not_found: NotFoundQueue::new(),
            ack_outbox: ack_sender,
            lookup_listener,
            write_listener,
            pushback: AtomicUsize::new(0),
            stopping,
            settings,
            store,
        });

        tokio::spawn(ack::run_dispatcher(Arc::clone(&inner), ack_receiver, router));
        tokio::spawn(not_found::run_sweeper(Arc::clone(&inner)));

        Self { inner }
    }

    /// Resolves which server hosts `id`, without blocking.
    ///
    /// Returns `Some` when the answer is available locally (resident here,
    /// mid-handoff here, or cached). Returns `None` when resolution went to
    /// the store; the outcome arrives via `oseg_lookup_completed`. Concurrent
    /// lookups for the same object coalesce into one store GET.
    pub fn lookup(&self, id: ObjectId) -> Option<Entry> {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return None;
        }
        if let Some(metrics) = OSEG_METRICS.get() {
            metrics.lookups.inc();
        }

        if let Some(entry) = inner.resident_entry(id) {
            if let Some(metrics) = OSEG_METRICS.get() {
                metrics.resident_hits.inc();
            }
            return Some(entry);
        }

        // Mid-handoff in either direction the object is still effectively
        // served here: outbound until the ack arrives, inbound while the
        // ownership write is becoming durable.
        if let Some(outbound) = inner.transit.migrating_out(id) {
            return Some(Entry::new(inner.settings.server_id, outbound.radius));
        }
        if let Some(entry) = inner.transit.receiving_entry(id) {
            return Some(entry);
        }

        if let Some(entry) = inner.cache.get(id) {
            // A cached pointer back at this server would re-route a message
            // to ourselves forever; residency was already checked above, so
            // such an entry is stale by construction.
            if entry.server != inner.settings.server_id {
                if let Some(metrics) = OSEG_METRICS.get() {
                    metrics.cache_hits.inc();
                }
                return Some(entry);
            }
        }

        inner.pushback.fetch_add(1, Ordering::SeqCst);
        let task_inner = Arc::clone(inner);
        tokio::spawn(async move {
            task_inner.dispatch_lookup(id).await;
        });
        None
    }

    /// Registers a brand-new object as resident on this server. The store
    /// write must not overwrite an existing registration; the terminal
    /// outcome arrives via `oseg_add_new_finished`.
    pub fn add_new_object(&self, id: ObjectId, radius: f64) {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return;
        }
        let entry = Entry::new(inner.settings.server_id, radius);
        let task_inner = Arc::clone(inner);
        tokio::spawn(async move {
            task_inner.run_add_new(id, entry).await;
        });
    }

    /// Inbound-migration entry point: this server is becoming the owner.
    ///
    /// With `generate_ack`, the object is held in the receiving set until the
    /// ownership write is durable *and* the acknowledgment to `ack_to` has
    /// been dispatched; only then is it clear to migrate again. Without it,
    /// the object is registered as resident immediately (initial placement
    /// path, no handshake).
    pub fn add_migrated_object(
        &self,
        id: ObjectId,
        radius: f64,
        ack_to: ServerId,
        generate_ack: bool,
    ) {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return;
        }
        let entry = Entry::new(inner.settings.server_id, radius);

        if generate_ack {
            inner.transit.begin_receiving(id, entry);
            let task_inner = Arc::clone(inner);
            tokio::spawn(async move {
                task_inner.run_migrated_write(id, entry, ack_to).await;
            });
        } else {
            inner.residents.lock().expect("residents mutex poisoned").insert(id, entry);
            let task_inner = Arc::clone(inner);
            tokio::spawn(async move {
                if let Err(err) = task_inner.store_set_with_retry(id, entry, false).await {
                    error!("registration write for {} failed: {}", id, err);
                }
            });
        }
    }

    /// Outbound-migration entry point: ownership of `id` is moving to
    /// `destination.server`. The object stops being resident here but its
    /// connection must be kept until `oseg_migration_acknowledged` fires.
    pub fn migrate_object(&self, id: ObjectId, destination: Entry) {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return;
        }
        if let Some(metrics) = OSEG_METRICS.get() {
            metrics.migrations_started.inc();
        }

        inner.transit.begin_migrate_out(id, destination);
        let removed = inner
            .residents
            .lock()
            .expect("residents mutex poisoned")
            .remove(&id);
        if removed.is_none() {
            warn!("migrating object {} that was not resident here", id);
        }
    }

    /// Idempotent deregistration; no-op if the object is not resident here.
    pub fn remove_object(&self, id: ObjectId) {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return;
        }
        if inner
            .residents
            .lock()
            .expect("residents mutex poisoned")
            .remove(&id)
            .is_some()
        {
            debug!("deregistered object {}", id);
        }
    }

    /// True iff no conflicting migration state exists: the object is neither
    /// migrating out of this server pending ack, nor being received here
    /// pending ack.
    pub fn clear_to_migrate(&self, id: ObjectId) -> bool {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return false;
        }
        let migrating_from_here = inner.transit.migrating_out(id).is_some();
        let migrating_to_here = inner.transit.is_receiving(id);
        !migrating_from_here && !migrating_to_here
    }

    /// Backpressure signal: lookups currently queued for store dispatch.
    pub fn get_pushback(&self) -> usize {
        self.inner.pushback.load(Ordering::SeqCst)
    }

    /// Consumes an acknowledgment from the new owner of a migrated object.
    /// Clears the transit record, refreshes the cache, and signals that the
    /// object's connection may now be torn down.
    pub fn handle_migrate_ack(&self, ack: MigrateAck) {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return;
        }

        let entry = Entry::new(ack.from_server, ack.radius);
        inner.cache.insert(ack.object_id, entry);

        if inner.transit.complete_migration(ack.object_id).is_some() {
            // Anyone who coalesced onto the migration finally has an answer.
            inner
                .lookup_listener
                .oseg_lookup_completed(ack.object_id, Some(entry));
        }

        inner.write_listener.oseg_migration_acknowledged(ack.object_id);
    }

    /// Applies a cache-invalidation push from elsewhere in the cluster.
    pub fn apply_ownership_update(&self, update: OwnershipUpdate) {
        let inner = &self.inner;
        if inner.stopping.is_cancelled() {
            return;
        }
        inner.cache.insert(
            update.object_id,
            Entry::new(update.hosting_server, update.radius),
        );
    }

    /// Sets the stop flag. Subsequent operations are no-ops and in-flight
    /// completions are discarded rather than delivered.
    pub fn stop(&self) {
        self.inner.stopping.cancel();
    }
}

impl OsegInner {
    fn resident_entry(&self, id: ObjectId) -> Option<Entry> {
        self.residents
            .lock()
            .expect("residents mutex poisoned")
            .get(&id)
            .copied()
    }

    async fn dispatch_lookup(self: Arc<Self>, id: ObjectId) {
        self.pushback.fetch_sub(1, Ordering::SeqCst);
        if self.stopping.is_cancelled() {
            return;
        }

        if !self.transit.begin_lookup_if_absent(id) {
            // Someone else's GET (or a migration) is already in flight for
            // this object; its completion will answer everyone.
            if let Some(metrics) = OSEG_METRICS.get() {
                metrics.coalesced_lookups.inc();
            }
            return;
        }

        if let Some(metrics) = OSEG_METRICS.get() {
            metrics.store_lookups.inc();
        }
        let result = self.store_get_with_retry(id).await;
        self.route_get_completion(id, result, false);
    }

    async fn store_get_with_retry(&self, id: ObjectId) -> Result<StoreResult, StoreError> {
        let key = object_key(self.settings.key_prefix, id);
        run_with_retry(
            &self.settings.retry_policy,
            id.fold64(),
            |_| self.store.get(key.clone()),
            StoreError::is_retryable,
        )
        .await
        .map(|(result, _)| result)
        .map_err(|terminal| terminal.error)
    }

    async fn store_set_with_retry(
        &self,
        id: ObjectId,
        entry: Entry,
        if_absent: bool,
    ) -> Result<StoreAck, StoreError> {
        let key = object_key(self.settings.key_prefix, id);
        run_with_retry(
            &self.settings.retry_policy,
            id.fold64(),
            |_| self.store.set(key.clone(), entry, if_absent),
            StoreError::is_retryable,
        )
        .await
        .map(|(ack, _)| ack)
        .map_err(|terminal| terminal.error)
    }

    /// Routes a GET completion through the anti-regression rule.
    ///
    /// `from_retry` marks completions of sit-out retries: those have no
    /// waiters (the original request was already answered "unresolved"), so
    /// a repeated NotFound re-enqueues silently and must not disturb any
    /// resolution that started in the meantime.
    fn route_get_completion(
        &self,
        id: ObjectId,
        result: Result<StoreResult, StoreError>,
        from_retry: bool,
    ) {
        if self.stopping.is_cancelled() {
            return;
        }

        match result {
            Ok(StoreResult::Found(entry)) => {
                let had_lookup = self.transit.complete_if_lookup(id);
                if !had_lookup && self.transit.migrating_out(id).is_some() {
                    // A migration supervened while this reply was in flight;
                    // its handshake owns the final answer and the cache must
                    // not regress to the pre-migration owner.
                    return;
                }
                self.cache.insert(id, entry);
                self.lookup_listener.oseg_lookup_completed(id, Some(entry));
            }
            Ok(StoreResult::NotFound) => {
                if from_retry {
                    self.not_found.enqueue(id);
                    return;
                }
                let had_lookup = self.transit.complete_if_lookup(id);
                self.not_found.enqueue(id);
                if had_lookup {
                    self.lookup_listener.oseg_lookup_completed(id, None);
                }
            }
            Err(err) => {
                error!("store lookup for {} failed: {}", id, err);
                if from_retry {
                    return;
                }
                let had_lookup = self.transit.complete_if_lookup(id);
                if had_lookup {
                    self.lookup_listener.oseg_lookup_completed(id, None);
                }
            }
        }
    }

    async fn run_add_new(self: Arc<Self>, id: ObjectId, entry: Entry) {
        let result = self.store_set_with_retry(id, entry, true).await;
        if self.stopping.is_cancelled() {
            return;
        }

        match result {
            Ok(StoreAck::Stored) => {
                self.residents
                    .lock()
                    .expect("residents mutex poisoned")
                    .insert(id, entry);
                self.write_listener
                    .oseg_add_new_finished(id, WriteStatus::Success);
            }
            Ok(StoreAck::AlreadyExists) => {
                self.write_listener
                    .oseg_add_new_finished(id, WriteStatus::AlreadyRegistered);
            }
            Err(err) => {
                error!("registration write for {} failed: {}", id, err);
                self.write_listener
                    .oseg_add_new_finished(id, WriteStatus::UnknownError);
            }
        }
    }

    async fn run_migrated_write(self: Arc<Self>, id: ObjectId, entry: Entry, ack_to: ServerId) {
        let result = self.store_set_with_retry(id, entry, false).await;
        if self.stopping.is_cancelled() {
            return;
        }

        match result {
            Ok(_) => {
                self.cache.insert(id, entry);
                self.residents
                    .lock()
                    .expect("residents mutex poisoned")
                    .insert(id, entry);
                // Now we know where the object is; any lookup or stale
                // migration record for it is settled.
                self.transit.complete_migration(id);

                let ack = MigrateAck {
                    from_server: self.settings.server_id,
                    to_server: ack_to,
                    object_id: id,
                    radius: entry.radius,
                };
                // The id leaves the receiving set only once the dispatcher
                // has actually routed this; see ack::run_dispatcher.
                if self.ack_outbox.send(ack).is_err() {
                    debug!("ack outbox closed while migrating {}", id);
                }
            }
            Err(err) => {
                // No silent ownership claim on ambiguous failure: the object
                // stays in the receiving set (so it cannot migrate onward)
                // until the inbound migration is retried or abandoned.
                error!("ownership write for migrated object {} failed: {}", id, err);
                self.write_listener
                    .oseg_add_new_finished(id, WriteStatus::UnknownError);
            }
        }
    }
}
