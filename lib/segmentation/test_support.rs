use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{ObjectSegmentation, OsegSettings};
use crate::retry::RetryPolicy;
use crate::store::{object_key, DirectoryStore, StoreAck, StoreError, StoreKey, StoreResult};
use crate::types::{
    Entry, LookupListener, MigrateAck, ObjectId, ServerId, ServerMessageRouter, WriteListener,
    WriteStatus,
};

pub(super) fn test_settings(server_id: ServerId) -> OsegSettings {
    OsegSettings {
        server_id,
        key_prefix: b'G',
        cache_capacity: 64,
        not_found_sit_out: Duration::from_millis(500),
        not_found_sweep_interval: Duration::from_millis(100),
        ack_retry_interval: Duration::from_millis(1),
        retry_policy: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        },
    }
}

pub(super) fn key_for(id: ObjectId) -> StoreKey {
    object_key(b'G', id)
}

/// Polls until `cond` holds; panics after ~1s so a hung resolution fails the
/// test instead of wedging the suite.
pub(super) async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Lets already-spawned tasks run without advancing the (possibly paused)
/// clock.
pub(super) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Scripted directory store. GETs must be planned per key (an unscripted GET
/// resolves to an I/O error); SETs default to `Stored` so tests that don't
/// care about the write path stay quiet. With a gate, every call first waits
/// for a permit, letting tests hold a resolution in flight.
pub(super) struct MockStore {
    get_plans: Mutex<HashMap<String, VecDeque<Result<StoreResult, StoreError>>>>,
    set_plans: Mutex<HashMap<String, VecDeque<Result<StoreAck, StoreError>>>>,
    get_calls: Mutex<HashMap<String, u32>>,
    set_calls: Mutex<HashMap<String, u32>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockStore {
    pub(super) fn new() -> Self {
        Self {
            get_plans: Mutex::new(HashMap::new()),
            set_plans: Mutex::new(HashMap::new()),
            get_calls: Mutex::new(HashMap::new()),
            set_calls: Mutex::new(HashMap::new()),
            gate: None,
        }
    }

    pub(super) fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut store = Self::new();
        store.gate = Some(Arc::clone(&gate));
        (store, gate)
    }

    pub(super) fn plan_get(&self, key: &StoreKey, replies: Vec<Result<StoreResult, StoreError>>) {
        self.get_plans
            .lock()
            .expect("get_plans mutex poisoned")
            .insert(key.as_str().to_string(), replies.into_iter().collect());
    }

    pub(super) fn plan_set(&self, key: &StoreKey, replies: Vec<Result<StoreAck, StoreError>>) {
        self.set_plans
            .lock()
            .expect("set_plans mutex poisoned")
            .insert(key.as_str().to_string(), replies.into_iter().collect());
    }

    pub(super) fn get_calls(&self, key: &StoreKey) -> u32 {
        *self
            .get_calls
            .lock()
            .expect("get_calls mutex poisoned")
            .get(key.as_str())
            .unwrap_or(&0)
    }

    pub(super) fn set_calls(&self, key: &StoreKey) -> u32 {
        *self
            .set_calls
            .lock()
            .expect("set_calls mutex poisoned")
            .get(key.as_str())
            .unwrap_or(&0)
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
    }
}

impl DirectoryStore for MockStore {
    fn get(&self, key: StoreKey) -> BoxFuture<'_, Result<StoreResult, StoreError>> {
        Box::pin(async move {
            {
                let mut counts = self.get_calls.lock().expect("get_calls mutex poisoned");
                *counts.entry(key.as_str().to_string()).or_insert(0) += 1;
            }
            self.pass_gate().await;

            let mut plans = self.get_plans.lock().expect("get_plans mutex poisoned");
            plans
                .get_mut(key.as_str())
                .and_then(|replies| replies.pop_front())
                .unwrap_or_else(|| {
                    Err(StoreError::Io(format!(
                        "no scripted get for {}",
                        key.as_str()
                    )))
                })
        })
    }

    fn set(
        &self,
        key: StoreKey,
        _entry: Entry,
        _if_absent: bool,
    ) -> BoxFuture<'_, Result<StoreAck, StoreError>> {
        Box::pin(async move {
            {
                let mut counts = self.set_calls.lock().expect("set_calls mutex poisoned");
                *counts.entry(key.as_str().to_string()).or_insert(0) += 1;
            }
            self.pass_gate().await;

            let mut plans = self.set_plans.lock().expect("set_plans mutex poisoned");
            plans
                .get_mut(key.as_str())
                .and_then(|replies| replies.pop_front())
                .unwrap_or(Ok(StoreAck::Stored))
        })
    }
}

#[derive(Default)]
pub(super) struct RecordingLookupListener {
    completed: Mutex<Vec<(ObjectId, Option<Entry>)>>,
}

impl RecordingLookupListener {
    pub(super) fn completed(&self) -> Vec<(ObjectId, Option<Entry>)> {
        self.completed
            .lock()
            .expect("completed mutex poisoned")
            .clone()
    }
}

impl LookupListener for RecordingLookupListener {
    fn oseg_lookup_completed(&self, id: ObjectId, entry: Option<Entry>) {
        self.completed
            .lock()
            .expect("completed mutex poisoned")
            .push((id, entry));
    }
}

#[derive(Default)]
pub(super) struct RecordingWriteListener {
    add_new: Mutex<Vec<(ObjectId, WriteStatus)>>,
    acknowledged: Mutex<Vec<ObjectId>>,
}

impl RecordingWriteListener {
    pub(super) fn add_new(&self) -> Vec<(ObjectId, WriteStatus)> {
        self.add_new.lock().expect("add_new mutex poisoned").clone()
    }

    pub(super) fn acknowledged(&self) -> Vec<ObjectId> {
        self.acknowledged
            .lock()
            .expect("acknowledged mutex poisoned")
            .clone()
    }
}

impl WriteListener for RecordingWriteListener {
    fn oseg_add_new_finished(&self, id: ObjectId, status: WriteStatus) {
        self.add_new
            .lock()
            .expect("add_new mutex poisoned")
            .push((id, status));
    }

    fn oseg_migration_acknowledged(&self, id: ObjectId) {
        self.acknowledged
            .lock()
            .expect("acknowledged mutex poisoned")
            .push(id);
    }
}

/// Transport stand-in; refuses the first `refuse_first` attempts so tests
/// can exercise the retry-until-routed behavior.
pub(super) struct RecordingRouter {
    refuse_first: u32,
    attempts: AtomicU32,
    routed: Mutex<Vec<MigrateAck>>,
}

impl RecordingRouter {
    pub(super) fn new() -> Self {
        Self::refusing(0)
    }

    pub(super) fn refusing(refuse_first: u32) -> Self {
        Self {
            refuse_first,
            attempts: AtomicU32::new(0),
            routed: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(super) fn routed(&self) -> Vec<MigrateAck> {
        self.routed.lock().expect("routed mutex poisoned").clone()
    }
}

impl ServerMessageRouter for RecordingRouter {
    fn try_route(&self, ack: &MigrateAck) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.refuse_first {
            return false;
        }
        self.routed
            .lock()
            .expect("routed mutex poisoned")
            .push(ack.clone());
        true
    }
}

pub(super) struct TestHarness {
    pub(super) oseg: ObjectSegmentation,
    pub(super) store: Arc<MockStore>,
    pub(super) lookups: Arc<RecordingLookupListener>,
    pub(super) writes: Arc<RecordingWriteListener>,
    pub(super) router: Arc<RecordingRouter>,
}

pub(super) fn harness(server_id: ServerId, store: Arc<MockStore>) -> TestHarness {
    harness_with_router(server_id, store, Arc::new(RecordingRouter::new()))
}

pub(super) fn harness_with_router(
    server_id: ServerId,
    store: Arc<MockStore>,
    router: Arc<RecordingRouter>,
) -> TestHarness {
    let lookups = Arc::new(RecordingLookupListener::default());
    let writes = Arc::new(RecordingWriteListener::default());
    let oseg = ObjectSegmentation::new(
        test_settings(server_id),
        Arc::clone(&store) as Arc<dyn DirectoryStore>,
        Arc::clone(&lookups) as Arc<dyn LookupListener>,
        Arc::clone(&writes) as Arc<dyn WriteListener>,
        Arc::clone(&router) as Arc<dyn ServerMessageRouter>,
        CancellationToken::new(),
    );
    TestHarness {
        oseg,
        store,
        lookups,
        writes,
        router,
    }
}
