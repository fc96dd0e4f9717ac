//! Completion handles for submitted transactions.
//!
//! A [`DBResult`] is returned immediately on submission and completed once by
//! the engine, with a value or with the errors that failed the transaction.
//! Callbacks registered on it run exactly once, on the [`Gate`] the caller
//! picked, whether they were registered before or after completion. The
//! handle is also a `Future`.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use tracing::{error, warn};

use crate::error::DBError;

type Job = Box<dyn FnOnce() + Send>;

// ------------- Gates -------------
/// Where completion callbacks run.
#[derive(Clone, Debug)]
pub enum Gate {
    /// On the thread that completes the result, or the registering thread
    /// when the result is already complete.
    Straight,
    /// On a shared callback thread, in completion order.
    Pooled,
    /// Queued until the owner of the queue drains it.
    Queue(GateQueue),
}

lazy_static! {
    static ref POOLED: Mutex<Sender<Job>> = {
        let (sender, receiver) = mpsc::channel::<Job>();
        let spawned = thread::Builder::new()
            .name("itemstore-callbacks".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    run_guarded(job);
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "could not start the callback thread");
        }
        Mutex::new(sender)
    };
}

fn run_guarded(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        warn!(error = %DBError::from_panic(payload), "completion callback panicked");
    }
}

impl Gate {
    pub(crate) fn execute(&self, job: Job) {
        match self {
            Gate::Straight => run_guarded(job),
            Gate::Pooled => {
                let sender = POOLED.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(mpsc::SendError(job)) = sender.send(job) {
                    drop(sender);
                    run_guarded(job);
                }
            }
            Gate::Queue(queue) => queue.push(job),
        }
    }
}

/// A callback queue drained by its owner, typically a UI or test thread.
#[derive(Clone, Default)]
pub struct GateQueue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl GateQueue {
    pub fn new() -> Self {
        Self::default()
    }
    fn push(&self, job: Job) {
        lock(&self.jobs).push_back(job);
    }
    /// Runs every queued callback on the calling thread. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = lock(&self.jobs).pop_front();
            match next {
                Some(job) => {
                    run_guarded(job);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for GateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "GateQueue({} pending)", self.len())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ------------- DBResult -------------
enum Outcome<T> {
    Success(Arc<T>),
    Failure(Arc<Vec<DBError>>),
}

impl<T> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Success(v) => Outcome::Success(Arc::clone(v)),
            Outcome::Failure(e) => Outcome::Failure(Arc::clone(e)),
        }
    }
}

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct State<T> {
    outcome: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

/// Handle to the eventual outcome of a transaction.
pub struct DBResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DBResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> DBResult<T> {
    pub(crate) fn pending() -> (DBResult<T>, Promise<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outcome: None,
                callbacks: Vec::new(),
                wakers: Vec::new(),
            }),
            done: Condvar::new(),
        });
        (
            DBResult {
                shared: Arc::clone(&shared),
            },
            Promise {
                shared,
                completed: false,
            },
        )
    }
    /// A result that has already failed.
    pub fn failed(error: DBError) -> DBResult<T> {
        let (result, promise) = Self::pending();
        promise.fail(vec![error]);
        result
    }
    pub fn succeeded(value: T) -> DBResult<T> {
        let (result, promise) = Self::pending();
        promise.succeed(value);
        result
    }

    /// Blocks until the transaction has completed one way or the other.
    pub fn wait_for_completion(&self) {
        let mut state = lock(&self.shared.state);
        while state.outcome.is_none() {
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
    /// Waits at most `timeout`. Returns false if still running; the
    /// transaction itself is not affected.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while state.outcome.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .shared
                .done
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        true
    }
    pub fn is_done(&self) -> bool {
        lock(&self.shared.state).outcome.is_some()
    }
    pub fn is_successful(&self) -> bool {
        matches!(lock(&self.shared.state).outcome, Some(Outcome::Success(_)))
    }
    /// The errors of a failed transaction; empty while running or on success.
    pub fn errors(&self) -> Vec<DBError> {
        match &lock(&self.shared.state).outcome {
            Some(Outcome::Failure(errors)) => errors.as_ref().clone(),
            _ => Vec::new(),
        }
    }
    fn outcome(&self) -> Option<Outcome<T>> {
        lock(&self.shared.state).outcome.clone()
    }

    fn subscribe(&self, callback: Callback<T>) {
        let mut state = lock(&self.shared.state);
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                callback(outcome);
            }
            None => state.callbacks.push(callback),
        }
    }
    pub fn on_success(&self, gate: Gate, f: impl FnOnce(&T) + Send + 'static) -> &Self {
        self.subscribe(Box::new(move |outcome| {
            if let Outcome::Success(value) = outcome {
                gate.execute(Box::new(move || f(&value)));
            }
        }));
        self
    }
    pub fn on_failure(&self, gate: Gate, f: impl FnOnce(&[DBError]) + Send + 'static) -> &Self {
        self.subscribe(Box::new(move |outcome| {
            if let Outcome::Failure(errors) = outcome {
                gate.execute(Box::new(move || f(&errors)));
            }
        }));
        self
    }
    /// Runs after completion either way, with whether it succeeded.
    pub fn finally_do(&self, gate: Gate, f: impl FnOnce(bool) + Send + 'static) -> &Self {
        self.subscribe(Box::new(move |outcome| {
            let success = matches!(outcome, Outcome::Success(_));
            gate.execute(Box::new(move || f(success)));
        }));
        self
    }
    /// Runs after completion either way, with the value (if any) and errors.
    pub fn finally_do_with_result(
        &self,
        gate: Gate,
        f: impl FnOnce(Option<&T>, &[DBError]) + Send + 'static,
    ) -> &Self {
        self.subscribe(Box::new(move |outcome| {
            gate.execute(Box::new(move || match outcome {
                Outcome::Success(value) => f(Some(&value), &[]),
                Outcome::Failure(errors) => f(None, &errors),
            }));
        }));
        self
    }
}

impl<T: Clone + Send + Sync + 'static> DBResult<T> {
    /// The value if the transaction succeeded within `timeout`. Timing out
    /// only ends the wait, never the transaction.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        if !self.wait_timeout(timeout) {
            return None;
        }
        match self.outcome() {
            Some(Outcome::Success(value)) => Some(value.as_ref().clone()),
            _ => None,
        }
    }
    /// Blocks until completion; a failure yields its first error.
    pub fn wait(&self) -> Result<T, DBError> {
        self.wait_for_completion();
        Self::into_result(self.outcome())
    }
    fn into_result(outcome: Option<Outcome<T>>) -> Result<T, DBError> {
        match outcome {
            Some(Outcome::Success(value)) => Ok(value.as_ref().clone()),
            Some(Outcome::Failure(errors)) => Err(errors
                .first()
                .cloned()
                .unwrap_or_else(|| DBError::Failed("no error recorded".to_string()))),
            None => Err(DBError::Cancelled),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Future for DBResult<T> {
    type Output = Result<T, DBError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = lock(&self.shared.state);
        match state.outcome.clone() {
            Some(outcome) => Poll::Ready(Self::into_result(Some(outcome))),
            None => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> std::fmt::Debug for DBResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        let status = match &state.outcome {
            None => "running",
            Some(Outcome::Success(_)) => "succeeded",
            Some(Outcome::Failure(_)) => "failed",
        };
        write!(f, "DBResult({})", status)
    }
}

// ------------- Promise -------------
/// The completing side of a [`DBResult`]. Dropping it without completing
/// cancels the result, so a job that never runs can not leave a caller
/// waiting forever.
pub(crate) struct Promise<T> {
    shared: Arc<Shared<T>>,
    completed: bool,
}

impl<T> Promise<T> {
    pub(crate) fn succeed(mut self, value: T) {
        self.complete(Outcome::Success(Arc::new(value)));
    }
    pub(crate) fn fail(mut self, errors: Vec<DBError>) {
        self.complete(Outcome::Failure(Arc::new(errors)));
    }
    pub(crate) fn settle(self, result: Result<T, DBError>) {
        match result {
            Ok(value) => self.succeed(value),
            Err(e) => self.fail(vec![e]),
        }
    }
    fn complete(&mut self, outcome: Outcome<T>) {
        if self.completed {
            return;
        }
        self.completed = true;
        let (callbacks, wakers) = {
            let mut state = lock(&self.shared.state);
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        self.shared.done.notify_all();
        for callback in callbacks {
            callback(outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.completed {
            self.complete(Outcome::Failure(Arc::new(vec![DBError::Cancelled])));
        }
    }
}
