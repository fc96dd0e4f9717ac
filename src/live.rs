//! Live queries and commit listeners.
//!
//! A live query keeps the membership of a predicate up to date and pushes a
//! [`DBEvent`] to its listener after each commit that changed it. All of the
//! work below runs on the writer thread, so a listener sees commits in ICN
//! order, each exactly once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::construct::{Icn, Item};
use crate::error::DBError;
use crate::event::{self, DBEvent};
use crate::lifespan::Lifespan;
use crate::predicate::{BoolExpr, ResolutionSubscription, DP};
use crate::query;
use crate::transaction::DBReader;

/// Receives the membership changes of one live query.
pub trait LiveQueryListener: Send + Sync {
    /// Called when the membership changed. The reader is only valid during
    /// the call.
    fn on_database_changed(&self, event: &DBEvent, reader: &dyn DBReader);
    /// Called after every commit once the query has processed it, also when
    /// nothing changed for this query.
    fn on_icn_passed(&self, _icn: Icn) {}
}

/// Receives every commit, unfiltered.
pub trait DBListener: Send + Sync {
    fn on_transaction(&self, icn: Icn, changed: &[Item], reader: &dyn DBReader);
}

fn call_back(what: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        warn!(listener = what, error = %DBError::from_panic(payload), "listener panicked");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ------------- LiveQueryState -------------
pub(crate) type Reschedule = Arc<dyn Fn(Arc<LiveQueryState>) + Send + Sync>;

struct Tracked {
    resolved: BoolExpr<DP>,
    current: Vec<Item>,
    icn: Icn,
    // ends the subscription of the current resolution
    resolution: Option<Lifespan>,
}

pub(crate) struct LiveQueryState {
    expr: BoolExpr<DP>,
    // a restricted query stops with the query it narrows
    parent: Option<Arc<LiveQueryState>>,
    listener: Arc<dyn LiveQueryListener>,
    lifespan: Lifespan,
    detached: AtomicBool,
    attached: AtomicBool,
    dirty: AtomicBool,
    tracked: Mutex<Tracked>,
    progress: Condvar,
    reschedule: Reschedule,
}

impl LiveQueryState {
    pub(crate) fn new(
        lifespan: Lifespan,
        expr: BoolExpr<DP>,
        parent: Option<Arc<LiveQueryState>>,
        listener: Arc<dyn LiveQueryListener>,
        reschedule: Reschedule,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracked: Mutex::new(Tracked {
                resolved: expr.clone(),
                current: Vec::new(),
                icn: 0,
                resolution: None,
            }),
            expr,
            parent,
            listener,
            lifespan,
            detached: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            progress: Condvar::new(),
            reschedule,
        })
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.detached.load(Ordering::SeqCst)
            && !self.lifespan.is_ended()
            && self.parent.as_ref().is_none_or(|parent| parent.is_active())
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        if let Some(resolution) = lock(&self.tracked).resolution.take() {
            resolution.end();
        }
        self.progress.notify_all();
    }

    // Resolves the expression again, replacing the previous subscription.
    fn resolve(self: &Arc<Self>, reader: &dyn DBReader, tracked: &mut Tracked) {
        if let Some(previous) = tracked.resolution.take() {
            previous.end();
        }
        if !self.expr.is_dynamic() {
            return;
        }
        let resolution = Lifespan::new();
        let weak: Weak<LiveQueryState> = Arc::downgrade(self);
        let subscription = ResolutionSubscription::new(resolution.clone(), move || {
            if let Some(state) = weak.upgrade() {
                state.invalidate();
            }
        });
        tracked.resolved = self.expr.resolve(reader, Some(&subscription));
        tracked.resolution = Some(resolution);
        trace!(expr = %tracked.resolved, "live query resolved");
    }

    fn invalidate(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        // one pending re-resolution is enough
        if !self.dirty.swap(true, Ordering::SeqCst) {
            (self.reschedule)(Arc::clone(self));
        }
    }

    // Full evaluation. Only items whose membership flipped count as affected,
    // together with whatever the commit itself affected.
    fn reevaluate(self: &Arc<Self>, reader: &dyn DBReader, affected: &[Item]) -> DBEvent {
        let mut tracked = lock(&self.tracked);
        self.resolve(reader, &mut tracked);
        let now = reader.query(tracked.resolved.clone()).copy_items_sorted();
        let flipped = event::union(
            &event::difference(&tracked.current, &now),
            &event::difference(&now, &tracked.current),
        );
        let affected = event::union(affected, &flipped);
        let accepted = event::intersection(&now, &affected);
        DBEvent::create_and_update_current(&mut tracked.current, &affected, &accepted)
    }

    fn deliver(&self, event: &DBEvent, reader: &dyn DBReader) {
        if !event.is_empty() && self.is_active() {
            call_back("live query", || self.listener.on_database_changed(event, reader));
        }
    }

    fn passed(&self, icn: Icn) {
        if self.is_active() {
            call_back("live query", || self.listener.on_icn_passed(icn));
        }
        lock(&self.tracked).icn = icn;
        self.progress.notify_all();
    }

    /// First full evaluation; reports the initial members as added.
    pub(crate) fn attach(self: &Arc<Self>, reader: &dyn DBReader) {
        if !self.is_active() {
            self.detach();
            return;
        }
        self.dirty.store(false, Ordering::SeqCst);
        let event = {
            let mut tracked = lock(&self.tracked);
            self.resolve(reader, &mut tracked);
            tracked.current = reader.query(tracked.resolved.clone()).copy_items_sorted();
            DBEvent::all_added(tracked.current.clone())
        };
        debug!(expr = %self.expr, items = event.added().len(), icn = reader.icn(), "live query attached");
        self.deliver(&event, reader);
        self.attached.store(true, Ordering::SeqCst);
        self.passed(reader.icn());
    }

    /// Brings the membership up to a commit.
    pub(crate) fn process_commit(
        self: &Arc<Self>,
        reader: &dyn DBReader,
        icn: Icn,
        affected: &[Item],
        identities: &[Arc<str>],
    ) {
        if !self.attached.load(Ordering::SeqCst) {
            return;
        }
        if !self.is_active() {
            self.detach();
            return;
        }
        let full = self.dirty.swap(false, Ordering::SeqCst) || {
            let tracked = lock(&self.tracked);
            tracked
                .resolved
                .identities()
                .iter()
                .any(|o| identities.iter().any(|key| key.as_ref() == o.id()))
        };
        let event = if full {
            self.reevaluate(reader, affected)
        } else {
            let mut tracked = lock(&self.tracked);
            let accepted = query::filter(reader.view(), &tracked.resolved, affected);
            DBEvent::create_and_update_current(&mut tracked.current, affected, &accepted)
        };
        self.deliver(&event, reader);
        self.passed(icn);
    }

    /// Re-resolves after an external invalidation, between commits.
    pub(crate) fn reresolve(self: &Arc<Self>, reader: &dyn DBReader) {
        if !self.dirty.swap(false, Ordering::SeqCst) || !self.attached.load(Ordering::SeqCst) {
            return;
        }
        if !self.is_active() {
            self.detach();
            return;
        }
        let event = self.reevaluate(reader, &[]);
        debug!(expr = %self.expr, event = ?event, "live query re-resolved");
        self.deliver(&event, reader);
    }
}

// ------------- DBLiveQuery -------------
/// Handle to a live query. Dropping the handle does not detach the query;
/// ending its lifespan or calling `detach` does.
#[derive(Clone)]
pub struct DBLiveQuery {
    state: Arc<LiveQueryState>,
}

impl DBLiveQuery {
    pub(crate) fn new(state: Arc<LiveQueryState>) -> Self {
        Self { state }
    }
    pub(crate) fn state(&self) -> &Arc<LiveQueryState> {
        &self.state
    }
    pub fn expr(&self) -> &BoolExpr<DP> {
        &self.state.expr
    }
    /// The tracked members, ascending.
    pub fn copy_items(&self) -> Vec<Item> {
        lock(&self.state.tracked).current.clone()
    }
    pub fn count(&self) -> usize {
        lock(&self.state.tracked).current.len()
    }
    /// The last ICN the query has processed.
    pub fn icn(&self) -> Icn {
        lock(&self.state.tracked).icn
    }
    pub fn is_attached(&self) -> bool {
        self.state.attached.load(Ordering::SeqCst) && self.state.is_active()
    }
    pub fn is_transaction_result_visible(&self, icn: Icn) -> bool {
        self.state.attached.load(Ordering::SeqCst) && self.icn() >= icn
    }
    /// Blocks until the query has processed `icn`. Returns false on timeout
    /// or when the query is detached first.
    pub fn wait_icn(&self, icn: Icn, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tracked = lock(&self.state.tracked);
        loop {
            if self.state.attached.load(Ordering::SeqCst) && tracked.icn >= icn {
                return true;
            }
            if self.state.detached.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .state
                .progress
                .wait_timeout(tracked, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            tracked = next;
        }
    }
    pub fn lifespan(&self) -> &Lifespan {
        &self.state.lifespan
    }
    /// Stops all further callbacks.
    pub fn detach(&self) {
        self.state.detach();
    }
}

impl std::fmt::Debug for DBLiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "DBLiveQuery({}, icn {})", self.state.expr, self.icn())
    }
}

// ------------- registries -------------
#[derive(Default)]
pub(crate) struct LiveQueries {
    queries: Mutex<Vec<Arc<LiveQueryState>>>,
}

impl LiveQueries {
    pub(crate) fn add(&self, state: Arc<LiveQueryState>) {
        lock(&self.queries).push(state);
    }
    /// The attached queries; detached ones are dropped on the way.
    pub(crate) fn active(&self) -> Vec<Arc<LiveQueryState>> {
        let mut queries = lock(&self.queries);
        queries.retain(|q| {
            if q.is_active() {
                return true;
            }
            q.detach();
            false
        });
        queries.clone()
    }
    pub(crate) fn notify_commit(
        &self,
        reader: &dyn DBReader,
        icn: Icn,
        changed: &[Item],
        identities: &[Arc<str>],
    ) {
        for query in self.active() {
            query.process_commit(reader, icn, changed, identities);
        }
    }
}

#[derive(Default)]
pub(crate) struct Listeners {
    listeners: Mutex<Vec<(Lifespan, Arc<dyn DBListener>)>>,
}

impl Listeners {
    pub(crate) fn add(&self, lifespan: Lifespan, listener: Arc<dyn DBListener>) {
        lock(&self.listeners).push((lifespan, listener));
    }
    pub(crate) fn notify(&self, icn: Icn, changed: &[Item], reader: &dyn DBReader) {
        let listeners: Vec<Arc<dyn DBListener>> = {
            let mut listeners = lock(&self.listeners);
            listeners.retain(|(lifespan, _)| !lifespan.is_ended());
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            call_back("transaction", || listener.on_transaction(icn, changed, reader));
        }
    }
}
