//! Two-class job queues for the writer thread and the reader pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    Foreground,
    Background,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Priority::Foreground => write!(f, "foreground"),
            Priority::Background => write!(f, "background"),
        }
    }
}

struct Lanes<J> {
    foreground: VecDeque<J>,
    background: VecDeque<J>,
    // foreground jobs served in a row while background work was waiting
    streak: usize,
    closed: bool,
}

/// A blocking FIFO per priority. Foreground jobs go first, but after
/// `max_streak` of them in a row a waiting background job is served.
pub struct JobQueue<J> {
    lanes: Mutex<Lanes<J>>,
    available: Condvar,
    max_streak: usize,
}

impl<J> JobQueue<J> {
    pub fn new(max_streak: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                foreground: VecDeque::new(),
                background: VecDeque::new(),
                streak: 0,
                closed: false,
            }),
            available: Condvar::new(),
            max_streak: max_streak.max(1),
        }
    }
    fn lanes(&self) -> MutexGuard<'_, Lanes<J>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a job. A closed queue hands the job back.
    pub fn push(&self, priority: Priority, job: J) -> Result<(), J> {
        let mut lanes = self.lanes();
        if lanes.closed {
            return Err(job);
        }
        match priority {
            Priority::Foreground => lanes.foreground.push_back(job),
            Priority::Background => lanes.background.push_back(job),
        }
        drop(lanes);
        self.available.notify_one();
        Ok(())
    }

    fn next(&self, lanes: &mut Lanes<J>) -> Option<J> {
        let background_first = !lanes.background.is_empty()
            && (lanes.foreground.is_empty() || lanes.streak >= self.max_streak);
        if background_first {
            lanes.streak = 0;
            return lanes.background.pop_front();
        }
        let job = lanes.foreground.pop_front()?;
        if lanes.background.is_empty() {
            lanes.streak = 0;
        } else {
            lanes.streak += 1;
        }
        Some(job)
    }

    /// Blocks until a job is available. Returns `None` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Option<J> {
        let mut lanes = self.lanes();
        loop {
            if let Some(job) = self.next(&mut lanes) {
                return Some(job);
            }
            if lanes.closed {
                return None;
            }
            lanes = self
                .available
                .wait(lanes)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
    pub fn try_pop(&self) -> Option<J> {
        let mut lanes = self.lanes();
        self.next(&mut lanes)
    }
    /// Whether nothing is queued right now.
    pub fn is_empty(&self) -> bool {
        let lanes = self.lanes();
        lanes.foreground.is_empty() && lanes.background.is_empty()
    }
    /// Refuses further jobs. Already queued jobs are still handed out.
    pub fn close(&self) {
        self.lanes().closed = true;
        self.available.notify_all();
    }
}
