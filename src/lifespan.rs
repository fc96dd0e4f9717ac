//! Cooperative lifetime tokens.
//!
//! A [`Lifespan`] is handed to long-lived registrations (live queries, global
//! listeners, resolution subscriptions). Ending it detaches them: the engine
//! observes the flag and stops calling back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct Lifespan {
    ended: Arc<AtomicBool>,
    forever: bool,
}

impl Lifespan {
    pub fn new() -> Self {
        Self {
            ended: Arc::new(AtomicBool::new(false)),
            forever: false,
        }
    }
    /// A lifespan that never ends; `end` has no effect on it.
    pub fn forever() -> Self {
        Self {
            ended: Arc::new(AtomicBool::new(false)),
            forever: true,
        }
    }
    pub fn end(&self) {
        if !self.forever {
            self.ended.store(true, Ordering::SeqCst);
        }
    }
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Relaxed)
    }
}

impl Default for Lifespan {
    fn default() -> Self {
        Self::new()
    }
}
