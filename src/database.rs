//! The engine: lifecycle, transaction scheduling and commits.
//!
//! One writer thread owns the SQLite connection and runs write transactions
//! one at a time. A pool of reader threads runs read transactions, each
//! against the committed snapshot under a shared lock. A write runs against
//! an overlay while readers keep going; the exclusive lock is only taken to
//! apply the overlay once it has been persisted.
//!
//! ```text
//!  submit ──► JobQueue<WriteJob> ──► writer thread ── persist ──► SQLite
//!                                        │ apply
//!                                        ▼
//!  submit ──► JobQueue<ReadJob> ───► reader pool ◄── RwLock<Store>
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::attribute::system_attributes;
use crate::config::DatabaseConfig;
use crate::construct::{Icn, Item, ATTRIBUTE_TYPE, ITEM_TYPE};
use crate::error::{DBError, Result};
use crate::lifespan::Lifespan;
use crate::live::{DBListener, DBLiveQuery, Listeners, LiveQueries, LiveQueryListener, LiveQueryState, Reschedule};
use crate::persist::{self, Persistor};
use crate::predicate::{BoolExpr, DP};
use crate::result::DBResult;
use crate::scheduler::{JobQueue, Priority};
use crate::store::{Store, StoreView};
use crate::transaction::{guarded, DBReader, DBWriter, SnapshotReader, TransactionWriter};
use crate::trigger::{self, DBTrigger, TriggerRegistry};

// the job takes the snapshot lock itself, so it can release it before completing
type ReadJob = Box<dyn FnOnce(&Inner) + Send>;

enum WriteJob {
    Write(Box<dyn FnOnce(&mut Engine<'_>) + Send>),
    Attach(Arc<LiveQueryState>),
    Reresolve(Arc<LiveQueryState>),
    Housekeep(Box<dyn FnOnce(Result<usize>) + Send>),
    // gives the idle check a chance to run
    Wake,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

struct Inner {
    config: DatabaseConfig,
    store: RwLock<Store>,
    writes: JobQueue<WriteJob>,
    reads: JobQueue<ReadJob>,
    triggers: TriggerRegistry,
    live: LiveQueries,
    listeners: Listeners,
    housekeeping: AtomicBool,
    phase: Mutex<Phase>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    engine_threads: Mutex<Vec<ThreadId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn read_store(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }
    fn write_store(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }
    fn is_engine_thread(&self) -> bool {
        lock(&self.engine_threads).contains(&thread::current().id())
    }
}

// ------------- Database -------------
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Self {
        let max_streak = config.max_foreground_streak;
        Self {
            inner: Arc::new(Inner {
                store: RwLock::new(Store::new()),
                writes: JobQueue::new(max_streak),
                reads: JobQueue::new(max_streak),
                triggers: TriggerRegistry::new(),
                live: LiveQueries::default(),
                listeners: Listeners::default(),
                housekeeping: AtomicBool::new(false),
                phase: Mutex::new(Phase::Created),
                threads: Mutex::new(Vec::new()),
                engine_threads: Mutex::new(Vec::new()),
                config,
            }),
        }
    }
    pub fn in_memory() -> Self {
        Self::new(DatabaseConfig::in_memory())
    }
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }
    pub fn is_running(&self) -> bool {
        *lock(&self.inner.phase) == Phase::Running
    }
    /// ICN of the last commit.
    pub fn icn(&self) -> Icn {
        self.inner.read_store().icn()
    }

    /// Opens and restores the persisted state, starts the engine threads and
    /// materializes the system attributes and item types.
    pub fn start(&self) -> Result<()> {
        {
            let mut phase = lock(&self.inner.phase);
            match *phase {
                Phase::Running => return Ok(()),
                Phase::Stopped => return Err(DBError::Lifecycle("a stopped database can not be restarted".to_string())),
                Phase::Created => (),
            }
            let started = Instant::now();
            let mode = self.inner.config.persistence_mode();
            let connection = persist::open(&mode, self.inner.config.busy_timeout())?;
            {
                let mut persistor = Persistor::new(&connection)?;
                let mut store = self.inner.write_store();
                persistor.restore(&mut store)?;
            }
            let mut threads = lock(&self.inner.threads);
            let inner = Arc::clone(&self.inner);
            threads.push(spawn("itemstore-writer", move || run_writer(inner, connection))?);
            for n in 0..self.inner.config.reader_threads.max(1) {
                let inner = Arc::clone(&self.inner);
                threads.push(spawn(&format!("itemstore-reader-{}", n), move || run_reader(inner))?);
            }
            *phase = Phase::Running;
            info!(
                mode = ?mode,
                readers = self.inner.config.reader_threads.max(1),
                ms = started.elapsed().as_secs_f64() * 1000.0,
                "database started"
            );
        }
        self.write_foreground(|w| {
            w.materialize(ITEM_TYPE.object());
            w.materialize(ATTRIBUTE_TYPE.object());
            for attribute in system_attributes() {
                w.materialize(&attribute.descriptor());
            }
            Ok(())
        })
        .wait()
    }

    /// Refuses new transactions, lets the accepted ones finish and joins the
    /// engine threads. Called from inside a transaction or listener it only
    /// refuses new work.
    pub fn stop(&self) {
        {
            let mut phase = lock(&self.inner.phase);
            if *phase == Phase::Stopped {
                return;
            }
            *phase = Phase::Stopped;
        }
        self.inner.writes.close();
        self.inner.reads.close();
        if self.inner.is_engine_thread() {
            debug!("stop requested from an engine thread, not joining");
            return;
        }
        let threads = std::mem::take(&mut *lock(&self.inner.threads));
        for handle in threads {
            if handle.join().is_err() {
                error!("engine thread panicked");
            }
        }
        info!(icn = self.icn(), "database stopped");
    }

    fn admit(&self) -> Option<DBError> {
        match *lock(&self.inner.phase) {
            Phase::Created => Some(DBError::Lifecycle("the database has not been started".to_string())),
            Phase::Stopped => Some(DBError::Cancelled),
            Phase::Running => None,
        }
    }

    // ------------- submission -------------
    pub fn read<T, F>(&self, priority: Priority, body: F) -> DBResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&dyn DBReader) -> Result<T> + Send + 'static,
    {
        if let Some(e) = self.admit() {
            return DBResult::failed(e);
        }
        let (result, promise) = DBResult::pending();
        let job: ReadJob = Box::new(move |inner: &Inner| {
            let outcome = {
                let store = inner.read_store();
                let reader = SnapshotReader::new(&store);
                guarded(|| body(&reader))
            };
            if let Err(e) = &outcome {
                if !e.is_cancelled() {
                    warn!(error = %e, "read transaction failed");
                }
            }
            // settled after the snapshot is released: callbacks may wait for writes
            promise.settle(outcome);
        });
        // a refused job drops its promise, which cancels the result
        let _ = self.inner.reads.push(priority, job);
        result
    }
    pub fn read_foreground<T, F>(&self, body: F) -> DBResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&dyn DBReader) -> Result<T> + Send + 'static,
    {
        self.read(Priority::Foreground, body)
    }
    pub fn read_background<T, F>(&self, body: F) -> DBResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&dyn DBReader) -> Result<T> + Send + 'static,
    {
        self.read(Priority::Background, body)
    }

    pub fn write<T, F>(&self, priority: Priority, body: F) -> DBResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut dyn DBWriter) -> Result<T> + Send + 'static,
    {
        if let Some(e) = self.admit() {
            return DBResult::failed(e);
        }
        self.enqueue_write(priority, move |w: &mut TransactionWriter<'_>| body(w))
    }
    pub fn write_foreground<T, F>(&self, body: F) -> DBResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut dyn DBWriter) -> Result<T> + Send + 'static,
    {
        self.write(Priority::Foreground, body)
    }
    pub fn write_background<T, F>(&self, body: F) -> DBResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut dyn DBWriter) -> Result<T> + Send + 'static,
    {
        self.write(Priority::Background, body)
    }

    fn enqueue_write<T, F>(&self, priority: Priority, body: F) -> DBResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut TransactionWriter<'_>) -> Result<T> + Send + 'static,
    {
        let (result, promise) = DBResult::pending();
        let job = WriteJob::Write(Box::new(move |engine: &mut Engine<'_>| {
            promise.settle(engine.commit(body));
        }));
        let _ = self.inner.writes.push(priority, job);
        result
    }

    // ------------- subscriptions -------------
    /// Starts tracking the items matching `expr`. The listener first gets
    /// the initial members as added, then the changes of every commit.
    pub fn live_query(
        &self,
        lifespan: Lifespan,
        expr: BoolExpr<DP>,
        listener: Arc<dyn LiveQueryListener>,
    ) -> DBLiveQuery {
        self.track(lifespan, expr, None, listener)
    }

    /// Tracks the members of `parent` that also match `filter`. The new
    /// query detaches together with its parent.
    pub fn filtered_live_query(
        &self,
        parent: &DBLiveQuery,
        lifespan: Lifespan,
        filter: BoolExpr<DP>,
        listener: Arc<dyn LiveQueryListener>,
    ) -> DBLiveQuery {
        let expr = parent.expr().clone().and(filter);
        self.track(lifespan, expr, Some(Arc::clone(parent.state())), listener)
    }

    fn track(
        &self,
        lifespan: Lifespan,
        expr: BoolExpr<DP>,
        parent: Option<Arc<LiveQueryState>>,
        listener: Arc<dyn LiveQueryListener>,
    ) -> DBLiveQuery {
        let weak = Arc::downgrade(&self.inner);
        let reschedule: Reschedule = Arc::new(move |state: Arc<LiveQueryState>| {
            if let Some(inner) = weak.upgrade() {
                let _ = inner.writes.push(Priority::Foreground, WriteJob::Reresolve(state));
            }
        });
        let state = LiveQueryState::new(lifespan, expr, parent, listener, reschedule);
        self.inner.live.add(Arc::clone(&state));
        if self
            .inner
            .writes
            .push(Priority::Foreground, WriteJob::Attach(Arc::clone(&state)))
            .is_err()
        {
            debug!("live query created on a stopped database");
        }
        DBLiveQuery::new(state)
    }

    /// Registers a listener for every commit.
    pub fn add_listener(&self, lifespan: Lifespan, listener: Arc<dyn DBListener>) {
        self.inner.listeners.add(lifespan, listener);
    }

    /// Adds a trigger. Transactions submitted afterwards run it; the
    /// returned result completes once it has been applied to the items that
    /// already match.
    pub fn register_trigger(&self, trigger: Arc<dyn DBTrigger>) -> DBResult<()> {
        if !self.inner.triggers.register(Arc::clone(&trigger)) {
            return DBResult::succeeded(());
        }
        self.enqueue_write(Priority::Foreground, move |w: &mut TransactionWriter<'_>| {
            trigger::initialise(trigger.as_ref(), w)
        })
    }

    // ------------- maintenance -------------
    /// Allows housekeeping whenever the writer is idle.
    pub fn set_long_housekeeping_allowed(&self, allowed: bool) {
        let before = self.inner.housekeeping.swap(allowed, Ordering::SeqCst);
        if allowed && !before {
            let _ = self.inner.writes.push(Priority::Background, WriteJob::Wake);
        }
    }
    /// Runs housekeeping now, as a background write. Yields the number of
    /// purged items.
    pub fn housekeep(&self) -> DBResult<usize> {
        if let Some(e) = self.admit() {
            return DBResult::failed(e);
        }
        let (result, promise) = DBResult::pending();
        let job = WriteJob::Housekeep(Box::new(move |outcome| promise.settle(outcome)));
        let _ = self.inner.writes.push(Priority::Background, job);
        result
    }

    /// Writes every alive item with its values.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        let store = self.inner.read_store();
        let io = |e: std::io::Error| DBError::Failed(e.to_string());
        writeln!(out, "icn {}, {} items", store.icn(), store.alive_count()).map_err(io)?;
        for item in store.alive_items() {
            match store.identity_of(item) {
                Some(identity) => writeln!(out, "#{} <{}>", item, identity).map_err(io)?,
                None => writeln!(out, "#{}", item).map_err(io)?,
            }
            for (attribute, value) in store.row(item) {
                writeln!(out, "    {} = {}", attribute.id(), value).map_err(io)?;
            }
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Database({:?}, icn {})", *lock(&self.inner.phase), self.icn())
    }
}

fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| DBError::Lifecycle(format!("could not start {}: {}", name, e)))
}

// ------------- threads -------------
fn run_reader(inner: Arc<Inner>) {
    lock(&inner.engine_threads).push(thread::current().id());
    while let Some(job) = inner.reads.pop() {
        job(&inner);
    }
}

fn run_writer(inner: Arc<Inner>, connection: Connection) {
    lock(&inner.engine_threads).push(thread::current().id());
    let persistor = match Persistor::new(&connection) {
        Ok(persistor) => persistor,
        Err(e) => {
            error!(error = %e, "writer could not prepare its statements");
            inner.writes.close();
            // queued jobs are dropped, which cancels their results
            while inner.writes.try_pop().is_some() {}
            return;
        }
    };
    let mut engine = Engine {
        inner: &inner,
        persistor,
        housekept_at: 0,
        optimize_pending: false,
    };
    loop {
        let job = match inner.writes.try_pop() {
            Some(job) => job,
            None => {
                engine.idle();
                match inner.writes.pop() {
                    Some(job) => job,
                    None => break,
                }
            }
        };
        engine.run(job);
    }
    debug!("writer finished");
}

/// State of the writer thread.
struct Engine<'db> {
    inner: &'db Inner,
    persistor: Persistor<'db>,
    housekept_at: Icn,
    optimize_pending: bool,
}

impl Engine<'_> {
    fn run(&mut self, job: WriteJob) {
        match job {
            WriteJob::Write(job) => job(self),
            WriteJob::Attach(state) => {
                let store = self.inner.read_store();
                state.attach(&SnapshotReader::new(&store));
            }
            WriteJob::Reresolve(state) => {
                let store = self.inner.read_store();
                state.reresolve(&SnapshotReader::new(&store));
            }
            WriteJob::Housekeep(done) => done(self.housekeep()),
            WriteJob::Wake => (),
        }
    }

    /// Runs a write transaction to completion: body, trigger passes,
    /// persistence, apply, notification.
    fn commit<T>(&mut self, body: impl FnOnce(&mut TransactionWriter<'_>) -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let outcome = self.stage_and_commit(body);
        match &outcome {
            Ok((icn, changed, _)) => debug!(
                icn,
                changed = *changed,
                ms = started.elapsed().as_secs_f64() * 1000.0,
                "write committed"
            ),
            Err(DBError::Cancelled) => debug!("write cancelled"),
            Err(e) => warn!(error = %e, "write failed"),
        }
        outcome.map(|(_, _, value)| value)
    }

    fn stage_and_commit<T>(
        &mut self,
        body: impl FnOnce(&mut TransactionWriter<'_>) -> Result<T>,
    ) -> Result<(Icn, usize, T)> {
        let store = self.inner.read_store();
        let mut writer = TransactionWriter::new(&store);
        let value = guarded(|| body(&mut writer))?;
        let passes = self.inner.config.trigger_passes;
        guarded(|| self.inner.triggers.run_passes(&mut writer, passes))?;
        let icn = writer.transaction_icn();
        let overlay = writer.into_overlay();
        if let Err(e) = self.persistor.persist(icn, &overlay, &store) {
            error!(icn, error = %e, "could not persist the transaction");
            return Err(e);
        }
        drop(store);
        let applied = self.inner.write_store().apply(overlay, icn);
        let changed = applied.changed.len();
        self.notify(icn, &applied.changed, &applied.identities);
        Ok((icn, changed, value))
    }

    fn notify(&self, icn: Icn, changed: &[Item], identities: &[Arc<str>]) {
        let store = self.inner.read_store();
        let reader = SnapshotReader::new(&store);
        self.inner.listeners.notify(icn, changed, &reader);
        self.inner.live.notify_commit(&reader, icn, changed, identities);
    }

    // Runs when the queue is empty. Purging happens once per new commit; the
    // optimize step is skipped while work is queued and retried on the next
    // idle turn.
    fn idle(&mut self) {
        if !self.inner.housekeeping.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.read_store().icn() > self.housekept_at {
            match self.purge_dead() {
                Ok(purged) => {
                    self.optimize_pending = true;
                    debug!(icn = self.housekept_at, purged, "purged cleared items");
                }
                Err(e) => {
                    error!(error = %e, "housekeeping failed");
                    return;
                }
            }
        }
        if !self.optimize_pending {
            return;
        }
        if !self.inner.writes.is_empty() {
            debug!("jobs queued, postponing optimize");
            return;
        }
        let started = Instant::now();
        match self.persistor.optimize() {
            Ok(()) => {
                self.optimize_pending = false;
                info!(
                    icn = self.housekept_at,
                    ms = started.elapsed().as_secs_f64() * 1000.0,
                    "housekeeping complete"
                );
            }
            Err(e) => error!(error = %e, "optimize failed"),
        }
    }

    fn housekeep(&mut self) -> Result<usize> {
        let started = Instant::now();
        let purged = self.purge_dead()?;
        self.persistor.optimize()?;
        self.optimize_pending = false;
        info!(
            icn = self.housekept_at,
            purged,
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "housekeeping complete"
        );
        Ok(purged)
    }

    /// Drops cleared items whose last change is older than the purge window.
    fn purge_dead(&mut self) -> Result<usize> {
        let (icn, dead) = {
            let store = self.inner.read_store();
            let cutoff = store.icn().saturating_sub(self.inner.config.purge_after_icns);
            (store.icn(), store.dead_items_before(cutoff))
        };
        let purged = self.persistor.purge(&dead)?;
        self.inner.write_store().forget(&dead);
        self.housekept_at = icn;
        Ok(purged)
    }
}
